//! Cluster membership records.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Logical node identifier within the cluster.
pub type NodeId = u64;

/// Descriptor for one cluster node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNode {
    pub node_id: NodeId,
    pub name: String,
    pub address: String,
}

impl DiscoveryNode {
    pub fn new(node_id: NodeId, name: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            address: address.into(),
        }
    }
}

/// The set of nodes known to a cluster-state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryNodes {
    nodes: BTreeMap<NodeId, DiscoveryNode>,
}

impl DiscoveryNodes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, node: DiscoveryNode) {
        self.nodes.insert(node.node_id, node);
    }

    pub fn remove(&mut self, node_id: NodeId) -> Option<DiscoveryNode> {
        self.nodes.remove(&node_id)
    }

    pub fn get(&self, node_id: NodeId) -> Option<&DiscoveryNode> {
        self.nodes.get(&node_id)
    }

    pub fn node_exists(&self, node_id: NodeId) -> bool {
        self.nodes.contains_key(&node_id)
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DiscoveryNode> {
        self.nodes.values()
    }

    pub fn ids(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.nodes.keys().copied()
    }
}
