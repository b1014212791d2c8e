//! Request and response contracts shared by replicated actions.

use std::fmt;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use strata_cluster::cluster::{NodeId, ShardId};

use crate::action::consistency::WriteConsistencyLevel;
use crate::action::error::{ActionError, RestStatus};

/// A request that targets one shard and is executed on the primary copy
/// followed by the replica copies.
pub trait ReplicationRequest:
    Clone + fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    /// Index name or alias as given by the caller.
    fn index(&self) -> &str;
    /// Concrete shard id, present once the reroute phase resolved it.
    fn shard_id(&self) -> Option<&ShardId>;
    fn set_shard_id(&mut self, shard_id: ShardId);
    /// Bounds reroute-phase retries only.
    fn timeout(&self) -> Duration;
    fn consistency_level(&self) -> WriteConsistencyLevel {
        WriteConsistencyLevel::Default
    }
}

/// Holder for the concrete shard id on a request. The id is resolved exactly
/// once by the reroute phase; later phases treat it as immutable. Retried
/// resolutions must agree with the original.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardTarget(Option<ShardId>);

impl ShardTarget {
    pub fn unresolved() -> Self {
        Self(None)
    }

    pub fn get(&self) -> Option<&ShardId> {
        self.0.as_ref()
    }

    pub fn set(&mut self, shard_id: ShardId) {
        if let Some(existing) = &self.0 {
            debug_assert_eq!(
                existing, &shard_id,
                "shard id resolved twice with different results"
            );
            return;
        }
        self.0 = Some(shard_id);
    }
}

/// Per-copy failure entry in a write response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ShardOperationFailure {
    pub index: String,
    pub shard: u32,
    pub node: NodeId,
    pub cause: ActionError,
    pub status: RestStatus,
    pub primary: bool,
}

/// Summary of how many shard copies a write reached.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShardInfo {
    pub total: u32,
    pub successful: u32,
    pub failures: Vec<ShardOperationFailure>,
}

impl ShardInfo {
    pub fn new(total: u32, successful: u32, failures: Vec<ShardOperationFailure>) -> Self {
        Self {
            total,
            successful,
            failures,
        }
    }

    pub fn failed(&self) -> usize {
        self.failures.len()
    }
}

/// A response carrying a shard-info summary. The summary is written exactly
/// once, by the replication phase's terminal reply.
pub trait ActionResponse:
    fmt::Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
    fn shard_info(&self) -> &ShardInfo;
    fn set_shard_info(&mut self, info: ShardInfo);
}

/// Frozen (request, concrete index) pair passed between reroute steps once
/// alias resolution has happened.
pub struct InternalRequest<R> {
    pub request: R,
    pub concrete_index: String,
}

impl<R> InternalRequest<R> {
    pub fn new(request: R, concrete_index: impl Into<String>) -> Self {
        Self {
            request,
            concrete_index: concrete_index.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_target_resolves_once() {
        let mut target = ShardTarget::unresolved();
        assert!(target.get().is_none());
        target.set(ShardId::new("events", 2));
        assert_eq!(target.get(), Some(&ShardId::new("events", 2)));
        // Re-resolving to the same id on a retry is a no-op.
        target.set(ShardId::new("events", 2));
        assert_eq!(target.get(), Some(&ShardId::new("events", 2)));
    }

    #[test]
    fn shard_info_tallies() {
        let info = ShardInfo::new(3, 2, vec![ShardOperationFailure {
            index: "events".into(),
            shard: 0,
            node: 3,
            cause: ActionError::EngineFailure { message: "io".into() },
            status: RestStatus::InternalServerError,
            primary: false,
        }]);
        assert_eq!(info.total, 3);
        assert_eq!(info.successful, 2);
        assert_eq!(info.failed(), 1);
        assert!(!info.failures[0].primary);
    }
}
