//! Cluster module wiring.
//!
//! `node` and `block` define membership and block records, `routing` holds the
//! shard routing tables, `metadata` the per-index settings and mappings,
//! `state` the versioned snapshot, and `observer` the watch-based
//! wait-for-next-change primitive.

mod block;
mod metadata;
mod node;
mod observer;
mod routing;
mod state;

pub use block::{ClusterBlock, ClusterBlockError, ClusterBlockLevel, ClusterBlocks};
pub use metadata::{
    FieldType, IndexMetadata, IndexSettings, Mapping, Metadata, TranslogDurability,
};
pub use node::{DiscoveryNode, DiscoveryNodes, NodeId};
pub use observer::{ClusterService, ClusterStateObserver, ObservedChange};
pub use routing::{
    IndexRoutingTable, IndexShardRoutingTable, RoutingTable, ShardId, ShardRouting,
    ShardRoutingState,
};
pub use state::ClusterState;
