//! Scoped shard operation reference.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::action::error::ActionError;
use crate::shard::IndexShard;

/// Holds the shard's operation counter for one in-flight write, preventing
/// the shard from closing underneath it. Released exactly once, on `release`
/// or on drop, whichever comes first.
#[derive(Debug)]
pub struct ShardRef {
    shard: Arc<IndexShard>,
    released: AtomicBool,
}

impl ShardRef {
    pub fn acquire(shard: Arc<IndexShard>) -> Result<Self, ActionError> {
        shard.increment_operation_counter()?;
        Ok(Self {
            shard,
            released: AtomicBool::new(false),
        })
    }

    pub fn shard(&self) -> &Arc<IndexShard> {
        &self.shard
    }

    pub fn release(&self) {
        if self
            .released
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.shard.decrement_operation_counter();
        }
    }
}

impl Drop for ShardRef {
    fn drop(&mut self) {
        self.release();
    }
}
