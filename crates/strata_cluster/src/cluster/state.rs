//! Versioned cluster-state snapshot.

use serde::{Deserialize, Serialize};

use crate::cluster::block::ClusterBlocks;
use crate::cluster::metadata::Metadata;
use crate::cluster::node::DiscoveryNodes;
use crate::cluster::routing::RoutingTable;

/// One immutable observation of the cluster: membership, blocks, routing and
/// index metadata. Snapshots on a node may lag the cluster; consumers take a
/// snapshot at phase entry and never re-read mid-step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterState {
    pub version: u64,
    pub nodes: DiscoveryNodes,
    pub blocks: ClusterBlocks,
    pub routing_table: RoutingTable,
    pub metadata: Metadata,
}

impl ClusterState {
    pub fn new(version: u64) -> Self {
        Self {
            version,
            ..Self::default()
        }
    }

    /// Produce the successor snapshot with a bumped version.
    pub fn bumped(mut self) -> Self {
        self.version += 1;
        self
    }
}
