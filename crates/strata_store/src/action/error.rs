//! Failure taxonomy for replicated actions.
//!
//! Errors cross the wire between coordinators, primaries and replicas, so the
//! whole taxonomy is one serializable enum. Retry/ignore policy lives in the
//! predicates here; the phases only consult them.

use std::fmt;

use serde::{Deserialize, Serialize};
use strata_cluster::cluster::{NodeId, ShardId};

/// REST-level status a failure maps to in responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RestStatus {
    Ok,
    Created,
    BadRequest,
    Forbidden,
    NotFound,
    Conflict,
    TooManyRequests,
    InternalServerError,
    ServiceUnavailable,
}

impl RestStatus {
    pub fn code(self) -> u16 {
        match self {
            RestStatus::Ok => 200,
            RestStatus::Created => 201,
            RestStatus::BadRequest => 400,
            RestStatus::Forbidden => 403,
            RestStatus::NotFound => 404,
            RestStatus::Conflict => 409,
            RestStatus::TooManyRequests => 429,
            RestStatus::InternalServerError => 500,
            RestStatus::ServiceUnavailable => 503,
        }
    }
}

/// One error type for every way a replicated action can fail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ActionError {
    /// Not enough (or no) usable copies for the target shard right now.
    UnavailableShards { shard_id: ShardId, message: String },
    /// A cluster or index block denied the operation.
    ClusterBlocked { retryable: bool, description: String },
    /// The local or remote node is shutting down.
    NodeClosed { node: NodeId },
    /// The target node could not be reached.
    ConnectFailed { node: NodeId, message: String },
    /// The primary op must be retried after the next cluster-state change.
    RetryOnPrimary { shard_id: ShardId, message: String },
    /// The replica op must be retried after the next cluster-state change.
    RetryOnReplica { shard_id: ShardId, message: String },
    IndexNotFound { index: String },
    ShardNotFound { shard_id: ShardId },
    /// The shard exists but is in no state to serve the operation.
    IllegalShardState { shard_id: ShardId, message: String },
    VersionConflict { shard_id: ShardId, id: String, message: String },
    DocumentMissing { shard_id: ShardId, id: String },
    DocumentAlreadyExists { shard_id: ShardId, id: String },
    /// The shard engine rejected or failed the operation.
    EngineFailure { message: String },
    /// The action executor was saturated and the handler was not
    /// force-executed.
    ExecutorRejected { action: String },
    Internal { message: String },
}

impl ActionError {
    pub fn internal(message: impl Into<String>) -> Self {
        ActionError::Internal {
            message: message.into(),
        }
    }

    pub fn rest_status(&self) -> RestStatus {
        match self {
            ActionError::UnavailableShards { .. }
            | ActionError::NodeClosed { .. }
            | ActionError::ConnectFailed { .. }
            | ActionError::RetryOnPrimary { .. }
            | ActionError::RetryOnReplica { .. } => RestStatus::ServiceUnavailable,
            ActionError::ClusterBlocked { retryable, .. } => {
                if *retryable {
                    RestStatus::ServiceUnavailable
                } else {
                    RestStatus::Forbidden
                }
            }
            ActionError::IndexNotFound { .. }
            | ActionError::ShardNotFound { .. }
            | ActionError::DocumentMissing { .. } => RestStatus::NotFound,
            ActionError::IllegalShardState { .. } => RestStatus::ServiceUnavailable,
            ActionError::VersionConflict { .. } | ActionError::DocumentAlreadyExists { .. } => {
                RestStatus::Conflict
            }
            ActionError::ExecutorRejected { .. } => RestStatus::TooManyRequests,
            ActionError::EngineFailure { .. } | ActionError::Internal { .. } => {
                RestStatus::InternalServerError
            }
        }
    }

    /// The "shard not available" family: the target shard cannot serve the
    /// operation where it was addressed, and routing may catch up.
    pub fn is_shard_not_available(&self) -> bool {
        matches!(
            self,
            ActionError::UnavailableShards { .. }
                | ActionError::IndexNotFound { .. }
                | ActionError::ShardNotFound { .. }
                | ActionError::IllegalShardState { .. }
        )
    }

    /// Version-conflict class: the copy already advanced past this write.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            ActionError::VersionConflict { .. }
                | ActionError::DocumentMissing { .. }
                | ActionError::DocumentAlreadyExists { .. }
        )
    }

    /// Whether a primary-op failure should be retried from the reroute phase.
    pub fn retry_primary(&self) -> bool {
        matches!(self, ActionError::RetryOnPrimary { .. }) || self.is_shard_not_available()
    }

    /// Whether a replica-op failure is ignorable: either the copy is not
    /// available (routing will catch up) or it already advanced past this
    /// write.
    pub fn ignore_replica(&self) -> bool {
        self.is_shard_not_available() || self.is_conflict()
    }
}

impl fmt::Display for ActionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ActionError::UnavailableShards { shard_id, message } => {
                write!(f, "{shard_id} unavailable shards: {message}")
            }
            ActionError::ClusterBlocked { description, .. } => {
                write!(f, "blocked by: {description}")
            }
            ActionError::NodeClosed { node } => write!(f, "node [{node}] closed"),
            ActionError::ConnectFailed { node, message } => {
                write!(f, "failed to connect to node [{node}]: {message}")
            }
            ActionError::RetryOnPrimary { shard_id, message } => {
                write!(f, "{shard_id} retry on primary: {message}")
            }
            ActionError::RetryOnReplica { shard_id, message } => {
                write!(f, "{shard_id} retry on replica: {message}")
            }
            ActionError::IndexNotFound { index } => write!(f, "index [{index}] not found"),
            ActionError::ShardNotFound { shard_id } => write!(f, "{shard_id} shard not found"),
            ActionError::IllegalShardState { shard_id, message } => {
                write!(f, "{shard_id} illegal shard state: {message}")
            }
            ActionError::VersionConflict { shard_id, id, message } => {
                write!(f, "{shard_id} version conflict for [{id}]: {message}")
            }
            ActionError::DocumentMissing { shard_id, id } => {
                write!(f, "{shard_id} document [{id}] missing")
            }
            ActionError::DocumentAlreadyExists { shard_id, id } => {
                write!(f, "{shard_id} document [{id}] already exists")
            }
            ActionError::EngineFailure { message } => write!(f, "engine failure: {message}"),
            ActionError::ExecutorRejected { action } => {
                write!(f, "executor rejected handler for [{action}]")
            }
            ActionError::Internal { message } => write!(f, "internal error: {message}"),
        }
    }
}

impl std::error::Error for ActionError {}

impl From<strata_cluster::cluster::ClusterBlockError> for ActionError {
    fn from(err: strata_cluster::cluster::ClusterBlockError) -> Self {
        ActionError::ClusterBlocked {
            retryable: err.retryable,
            description: err.description,
        }
    }
}
