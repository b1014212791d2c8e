//! Cluster blocks: global and per-index restrictions on operations.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

/// Operation class a block applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ClusterBlockLevel {
    Read,
    Write,
    Metadata,
}

/// One active block. Retryable blocks describe transient conditions (e.g. a
/// recovering cluster) that callers may wait out; non-retryable blocks are
/// hard denials.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlock {
    pub id: u32,
    pub description: String,
    pub retryable: bool,
    pub levels: Vec<ClusterBlockLevel>,
}

impl ClusterBlock {
    pub fn new(
        id: u32,
        description: impl Into<String>,
        retryable: bool,
        levels: Vec<ClusterBlockLevel>,
    ) -> Self {
        Self {
            id,
            description: description.into(),
            retryable,
            levels,
        }
    }

    pub fn contains(&self, level: ClusterBlockLevel) -> bool {
        self.levels.contains(&level)
    }
}

/// Error surfaced when an operation hits an active block.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlockError {
    pub retryable: bool,
    pub description: String,
}

impl fmt::Display for ClusterBlockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "blocked by: {}", self.description)
    }
}

impl std::error::Error for ClusterBlockError {}

/// All blocks active in a cluster-state snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterBlocks {
    global: Vec<ClusterBlock>,
    indices: BTreeMap<String, Vec<ClusterBlock>>,
}

impl ClusterBlocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_global(&mut self, block: ClusterBlock) {
        self.global.push(block);
    }

    pub fn add_index(&mut self, index: impl Into<String>, block: ClusterBlock) {
        self.indices.entry(index.into()).or_default().push(block);
    }

    pub fn clear_global(&mut self, id: u32) {
        self.global.retain(|b| b.id != id);
    }

    /// First global block matching `level`, if any.
    pub fn global_blocked(&self, level: ClusterBlockLevel) -> Option<&ClusterBlock> {
        self.global.iter().find(|b| b.contains(level))
    }

    /// First block matching `level` for `index`, considering global blocks too.
    pub fn index_blocked(&self, level: ClusterBlockLevel, index: &str) -> Option<&ClusterBlock> {
        if let Some(block) = self.global_blocked(level) {
            return Some(block);
        }
        self.indices
            .get(index)
            .and_then(|blocks| blocks.iter().find(|b| b.contains(level)))
    }

    pub fn global_block_error(&self, level: ClusterBlockLevel) -> Option<ClusterBlockError> {
        self.global_blocked(level).map(|block| ClusterBlockError {
            retryable: block.retryable,
            description: block.description.clone(),
        })
    }

    pub fn index_block_error(
        &self,
        level: ClusterBlockLevel,
        index: &str,
    ) -> Option<ClusterBlockError> {
        self.index_blocked(level, index).map(|block| ClusterBlockError {
            retryable: block.retryable,
            description: block.description.clone(),
        })
    }
}
