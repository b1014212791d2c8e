//! Shard routing tables.
//!
//! A `RoutingTable` maps index names to per-shard routing tables; each
//! `IndexShardRoutingTable` holds one `ShardRouting` record per copy of the
//! shard (one primary plus replicas). Relocating copies are addressed on both
//! their source and destination nodes until the move completes.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::cluster::node::NodeId;

/// Identity of one shard of one index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ShardId {
    pub index: String,
    pub shard: u32,
}

impl ShardId {
    pub fn new(index: impl Into<String>, shard: u32) -> Self {
        Self {
            index: index.into(),
            shard,
        }
    }
}

impl fmt::Display for ShardId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}][{}]", self.index, self.shard)
    }
}

/// Lifecycle state of one shard copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ShardRoutingState {
    Unassigned,
    Initializing,
    Started,
    Relocating,
}

/// Routing record for one copy of a shard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardRouting {
    pub shard_id: ShardId,
    pub primary: bool,
    pub state: ShardRoutingState,
    pub current_node: Option<NodeId>,
    pub relocating_node: Option<NodeId>,
}

impl ShardRouting {
    pub fn new(shard_id: ShardId, primary: bool, state: ShardRoutingState, node: NodeId) -> Self {
        Self {
            shard_id,
            primary,
            state,
            current_node: Some(node),
            relocating_node: None,
        }
    }

    pub fn unassigned_copy(shard_id: ShardId, primary: bool) -> Self {
        Self {
            shard_id,
            primary,
            state: ShardRoutingState::Unassigned,
            current_node: None,
            relocating_node: None,
        }
    }

    /// Active copies accept operations; an initializing copy does not.
    pub fn active(&self) -> bool {
        matches!(
            self.state,
            ShardRoutingState::Started | ShardRoutingState::Relocating
        )
    }

    pub fn unassigned(&self) -> bool {
        self.state == ShardRoutingState::Unassigned
    }

    pub fn relocating(&self) -> bool {
        self.state == ShardRoutingState::Relocating
    }
}

/// All copies of one shard.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexShardRoutingTable {
    pub shard_id: ShardId,
    shards: Vec<ShardRouting>,
}

impl IndexShardRoutingTable {
    pub fn new(shard_id: ShardId, shards: Vec<ShardRouting>) -> Self {
        debug_assert!(shards.iter().all(|s| s.shard_id == shard_id));
        Self { shard_id, shards }
    }

    /// Total number of copies, assigned or not.
    pub fn size(&self) -> usize {
        self.shards.len()
    }

    /// Unordered view over all copies. Restart iteration by calling again.
    pub fn shards(&self) -> &[ShardRouting] {
        &self.shards
    }

    pub fn active_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| s.active())
    }

    pub fn active_shard_count(&self) -> usize {
        self.active_shards().count()
    }

    pub fn primary_shard(&self) -> Option<&ShardRouting> {
        self.shards.iter().find(|s| s.primary)
    }

    pub fn replica_shards(&self) -> impl Iterator<Item = &ShardRouting> {
        self.shards.iter().filter(|s| !s.primary)
    }

    pub fn shards_mut(&mut self) -> &mut [ShardRouting] {
        &mut self.shards
    }
}

/// Routing for all shards of one index.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexRoutingTable {
    pub index: String,
    shards: BTreeMap<u32, IndexShardRoutingTable>,
}

impl IndexRoutingTable {
    pub fn new(index: impl Into<String>) -> Self {
        Self {
            index: index.into(),
            shards: BTreeMap::new(),
        }
    }

    pub fn add_shard(&mut self, table: IndexShardRoutingTable) {
        self.shards.insert(table.shard_id.shard, table);
    }

    pub fn shard(&self, shard: u32) -> Option<&IndexShardRoutingTable> {
        self.shards.get(&shard)
    }

    pub fn shard_mut(&mut self, shard: u32) -> Option<&mut IndexShardRoutingTable> {
        self.shards.get_mut(&shard)
    }

    pub fn shards(&self) -> impl Iterator<Item = &IndexShardRoutingTable> {
        self.shards.values()
    }
}

/// Routing for every index in a cluster-state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTable {
    indices: BTreeMap<String, IndexRoutingTable>,
}

impl RoutingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_index(&mut self, table: IndexRoutingTable) {
        self.indices.insert(table.index.clone(), table);
    }

    pub fn remove_index(&mut self, index: &str) {
        self.indices.remove(index);
    }

    pub fn index(&self, index: &str) -> Option<&IndexRoutingTable> {
        self.indices.get(index)
    }

    pub fn index_mut(&mut self, index: &str) -> Option<&mut IndexRoutingTable> {
        self.indices.get_mut(index)
    }

    /// Convenience lookup of one shard's routing table.
    pub fn shard_routing_table(&self, shard_id: &ShardId) -> Option<&IndexShardRoutingTable> {
        self.index(&shard_id.index)
            .and_then(|table| table.shard(shard_id.shard))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_table() -> IndexShardRoutingTable {
        let shard_id = ShardId::new("events", 0);
        IndexShardRoutingTable::new(
            shard_id.clone(),
            vec![
                ShardRouting::new(shard_id.clone(), true, ShardRoutingState::Started, 1),
                ShardRouting::new(shard_id.clone(), false, ShardRoutingState::Relocating, 2),
                ShardRouting::new(shard_id.clone(), false, ShardRoutingState::Initializing, 3),
                ShardRouting::unassigned_copy(shard_id, false),
            ],
        )
    }

    #[test]
    fn active_selectors() {
        let table = sample_table();
        assert_eq!(table.size(), 4);
        assert_eq!(table.active_shard_count(), 2);
        assert!(table.primary_shard().unwrap().active());
    }

    #[test]
    fn relocating_and_unassigned_flags() {
        let table = sample_table();
        let shards = table.shards();
        assert!(shards[1].relocating());
        assert!(!shards[2].active());
        assert!(shards[3].unassigned());
    }

    #[test]
    fn routing_table_lookup() {
        let mut index_table = IndexRoutingTable::new("events");
        index_table.add_shard(sample_table());
        let mut routing = RoutingTable::new();
        routing.add_index(index_table);

        let shard_id = ShardId::new("events", 0);
        assert!(routing.shard_routing_table(&shard_id).is_some());
        assert!(routing
            .shard_routing_table(&ShardId::new("events", 9))
            .is_none());
        assert!(routing.index("other").is_none());
    }
}
