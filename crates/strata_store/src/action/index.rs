//! Document index action.
//!
//! The concrete write action: route a document to its shard by id hash,
//! version it on the primary, fan the stamped write out to replicas. Dynamic
//! mapping updates detected while preparing the primary operation are pushed
//! to the master synchronously before the write proceeds.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::warn;

use strata_cluster::cluster::{ClusterService, ClusterState, ShardId, TranslogDurability};

use crate::action::consistency::WriteConsistencyLevel;
use crate::action::error::ActionError;
use crate::action::replication::ReplicationAction;
use crate::action::request::{
    ActionResponse, InternalRequest, ReplicationRequest, ShardInfo, ShardTarget,
};
use crate::engine::{Origin, VersionType, VERSION_MATCH_ANY};
use crate::indices::IndicesService;
use crate::master::MappingUpdater;
use crate::shard::IndexShard;
use crate::translog::Location;

pub const INDEX_ACTION_NAME: &str = "indices:data/write/index";

const DEFAULT_TIMEOUT: Duration = Duration::from_secs(60);

/// Create-only writes fail when the document already exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpType {
    Index,
    Create,
}

/// A document write. Doubles as the replica request once the primary stamped
/// the version and switched the version type to its replication flavor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexRequest {
    pub index: String,
    pub id: String,
    pub source: serde_json::Value,
    pub op_type: OpType,
    pub version: u64,
    pub version_type: VersionType,
    pub refresh: bool,
    pub timeout: Duration,
    pub consistency: WriteConsistencyLevel,
    target: ShardTarget,
}

impl IndexRequest {
    pub fn new(index: impl Into<String>, id: impl Into<String>, source: serde_json::Value) -> Self {
        Self {
            index: index.into(),
            id: id.into(),
            source,
            op_type: OpType::Index,
            version: VERSION_MATCH_ANY,
            version_type: VersionType::Internal,
            refresh: false,
            timeout: DEFAULT_TIMEOUT,
            consistency: WriteConsistencyLevel::Default,
            target: ShardTarget::unresolved(),
        }
    }

    pub fn create(mut self) -> Self {
        self.op_type = OpType::Create;
        self
    }

    pub fn with_version(mut self, version: u64, version_type: VersionType) -> Self {
        self.version = version;
        self.version_type = version_type;
        self
    }

    pub fn with_refresh(mut self, refresh: bool) -> Self {
        self.refresh = refresh;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_consistency(mut self, consistency: WriteConsistencyLevel) -> Self {
        self.consistency = consistency;
        self
    }
}

impl ReplicationRequest for IndexRequest {
    fn index(&self) -> &str {
        &self.index
    }

    fn shard_id(&self) -> Option<&ShardId> {
        self.target.get()
    }

    fn set_shard_id(&mut self, shard_id: ShardId) {
        self.target.set(shard_id);
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn consistency_level(&self) -> WriteConsistencyLevel {
        self.consistency
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexResponse {
    pub index: String,
    pub id: String,
    pub version: u64,
    pub created: bool,
    pub shard_info: ShardInfo,
}

impl ActionResponse for IndexResponse {
    fn shard_info(&self) -> &ShardInfo {
        &self.shard_info
    }

    fn set_shard_info(&mut self, info: ShardInfo) {
        self.shard_info = info;
    }
}

/// Result of a primary-side write: the action response plus the translog
/// location of the applied operation.
#[derive(Debug)]
pub struct WriteResult<T: ActionResponse> {
    response: T,
    location: Option<Location>,
}

impl<T: ActionResponse> WriteResult<T> {
    pub fn new(response: T, location: Option<Location>) -> Self {
        Self { response, location }
    }

    pub fn location(&self) -> Option<Location> {
        self.location
    }

    /// Hand out the response with a zeroed shard-info summary; only the
    /// replication phase composes the real one into the terminal reply.
    pub fn into_response(mut self) -> T {
        self.response.set_shard_info(ShardInfo::default());
        self.response
    }
}

pub struct IndexAction {
    indices: Arc<IndicesService>,
    cluster: Arc<ClusterService>,
    mapping_updater: Arc<dyn MappingUpdater>,
}

impl IndexAction {
    pub fn new(
        indices: Arc<IndicesService>,
        cluster: Arc<ClusterService>,
        mapping_updater: Arc<dyn MappingUpdater>,
    ) -> Self {
        Self {
            indices,
            cluster,
            mapping_updater,
        }
    }
}

#[async_trait]
impl ReplicationAction for IndexAction {
    type Request = IndexRequest;
    type ReplicaRequest = IndexRequest;
    type Response = IndexResponse;

    fn name(&self) -> &'static str {
        INDEX_ACTION_NAME
    }

    fn check_write_consistency(&self) -> bool {
        true
    }

    fn shard_id(
        &self,
        state: &ClusterState,
        internal: &InternalRequest<IndexRequest>,
    ) -> Result<ShardId, ActionError> {
        let metadata = state
            .metadata
            .index(&internal.concrete_index)
            .ok_or_else(|| ActionError::IndexNotFound {
                index: internal.concrete_index.clone(),
            })?;
        let shards = metadata.settings.number_of_shards.max(1);
        let shard = (hash_routing(&internal.request.id) % u64::from(shards)) as u32;
        Ok(ShardId::new(internal.concrete_index.clone(), shard))
    }

    async fn shard_operation_on_primary(
        &self,
        _state: &ClusterState,
        request: &mut IndexRequest,
    ) -> Result<(IndexResponse, IndexRequest), ActionError> {
        let shard_id = request
            .shard_id()
            .cloned()
            .ok_or_else(|| ActionError::internal("primary op without a resolved shard id"))?;
        let shard = self.indices.shard_safe(&shard_id)?;
        let result =
            execute_index_on_primary(request, &shard, self.mapping_updater.as_ref()).await?;
        process_after(request.refresh, &shard, result.location())?;
        let response = result.into_response();
        // The request now carries the stamped version; replicas re-apply it
        // verbatim.
        let replica_request = request.clone();
        Ok((response, replica_request))
    }

    async fn shard_operation_on_replica(
        &self,
        shard_id: &ShardId,
        request: IndexRequest,
    ) -> Result<(), ActionError> {
        let shard = self.indices.shard_safe(shard_id)?;
        let mut operation = shard.prepare_index(
            request.id.clone(),
            request.source.clone(),
            request.version,
            request.version_type,
            Origin::Replica,
            false,
        )?;
        if let Some(update) = operation.mapping_update.clone() {
            // Replicas only learn mappings from the published cluster state,
            // never from the document itself. The primary synced the mapping
            // with the master before fanning out, so the published state
            // normally covers it already.
            let state = self.cluster.state();
            let published = state
                .metadata
                .index(&shard_id.index)
                .map(|metadata| metadata.mapping.clone());
            let covered = published
                .as_ref()
                .is_some_and(|mapping| mapping.dynamic_update(&update).is_none());
            if covered {
                let service = self.indices.index_service_safe(&shard_id.index)?;
                service.apply_mapping(published.as_ref().expect("covered implies published"));
                operation = shard.prepare_index(
                    request.id.clone(),
                    request.source.clone(),
                    request.version,
                    request.version_type,
                    Origin::Replica,
                    false,
                )?;
            }
            if operation.mapping_update.is_some() {
                return Err(ActionError::RetryOnReplica {
                    shard_id: shard_id.clone(),
                    message: format!(
                        "mappings for [{}] are not available on the replica yet",
                        request.id
                    ),
                });
            }
        }
        shard.index(&mut operation)?;
        process_after(request.refresh, &shard, operation.translog_location())?;
        Ok(())
    }
}

/// Execute a document write on the primary shard, pushing any dynamic mapping
/// update to the master first. If the update is still not visible after the
/// master acked it, the operation is turned into a typed primary retry.
pub async fn execute_index_on_primary(
    request: &mut IndexRequest,
    shard: &Arc<IndexShard>,
    mapping_updater: &dyn MappingUpdater,
) -> Result<WriteResult<IndexResponse>, ActionError> {
    let shard_id = shard.shard_id().clone();
    let create = request.op_type == OpType::Create;
    let mut operation = shard.prepare_index(
        request.id.clone(),
        request.source.clone(),
        request.version,
        request.version_type,
        Origin::Primary,
        create,
    )?;
    if let Some(update) = operation.mapping_update.clone() {
        mapping_updater
            .update_mapping_on_master(&shard_id.index, &update)
            .await?;
        operation = shard.prepare_index(
            request.id.clone(),
            request.source.clone(),
            request.version,
            request.version_type,
            Origin::Primary,
            create,
        )?;
        if operation.mapping_update.is_some() {
            return Err(ActionError::RetryOnPrimary {
                shard_id: shard_id.clone(),
                message: "dynamic mappings are not available on the node that holds the primary yet"
                    .to_string(),
            });
        }
    }
    let created = shard.index(&mut operation)?;

    // Stamp the applied version on the request so replicas are deterministic.
    let version = operation.version();
    request.version = version;
    request.version_type = request.version_type.for_replication();
    debug_assert!(request.version_type.validate_version_for_writes(request.version));

    let response = IndexResponse {
        index: shard_id.index.clone(),
        id: request.id.clone(),
        version,
        created,
        shard_info: ShardInfo::default(),
    };
    Ok(WriteResult::new(response, operation.translog_location()))
}

/// Post-operation handling shared by the primary and replica paths: optional
/// refresh, per-request translog durability, and threshold-based flushing.
pub fn process_after(
    refresh: bool,
    shard: &Arc<IndexShard>,
    location: Option<Location>,
) -> Result<(), ActionError> {
    if refresh {
        shard.refresh("refresh_flag_index");
    }
    if shard.translog_durability() == TranslogDurability::Request {
        if let Some(location) = location {
            if let Err(err) = shard.sync(&location) {
                warn!(shard = %shard.shard_id(), error = %err, "translog sync failed");
                return Err(err);
            }
        }
    }
    shard.maybe_flush();
    Ok(())
}

fn hash_routing(id: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    id.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use strata_cluster::cluster::{IndexMetadata, IndexSettings};

    fn state_with_index(shards: u32) -> ClusterState {
        let mut state = ClusterState::new(1);
        let settings = IndexSettings {
            number_of_shards: shards,
            ..IndexSettings::default()
        };
        state
            .metadata
            .add_index(IndexMetadata::new("events", "uuid-1", settings));
        state
    }

    fn action() -> (tempfile::TempDir, IndexAction) {
        let dir = tempfile::tempdir().unwrap();
        let indices = IndicesService::open(dir.path()).unwrap();
        let cluster = ClusterService::new(1, ClusterState::new(1));
        struct NoopUpdater;
        #[async_trait]
        impl MappingUpdater for NoopUpdater {
            async fn update_mapping_on_master(
                &self,
                _index: &str,
                _update: &strata_cluster::cluster::Mapping,
            ) -> Result<(), ActionError> {
                Ok(())
            }
        }
        let action = IndexAction::new(indices, cluster, Arc::new(NoopUpdater));
        (dir, action)
    }

    #[test]
    fn shard_id_is_deterministic_and_in_range() {
        let (_dir, action) = action();
        let state = state_with_index(4);
        let request = IndexRequest::new("events", "doc-1", json!({}));
        let internal = InternalRequest::new(request.clone(), "events");

        let first = action.shard_id(&state, &internal).unwrap();
        let second = action.shard_id(&state, &internal).unwrap();
        assert_eq!(first, second);
        assert!(first.shard < 4);
        assert_eq!(first.index, "events");
    }

    #[test]
    fn shard_id_requires_index_metadata() {
        let (_dir, action) = action();
        let state = ClusterState::new(1);
        let request = IndexRequest::new("events", "doc-1", json!({}));
        let internal = InternalRequest::new(request, "events");
        assert!(matches!(
            action.shard_id(&state, &internal).unwrap_err(),
            ActionError::IndexNotFound { .. }
        ));
    }

    #[test]
    fn write_result_hands_out_zeroed_shard_info() {
        let response = IndexResponse {
            index: "events".into(),
            id: "doc-1".into(),
            version: 3,
            created: false,
            shard_info: ShardInfo::new(9, 9, Vec::new()),
        };
        let result = WriteResult::new(response, None);
        let response = result.into_response();
        assert_eq!(response.shard_info, ShardInfo::default());
        assert_eq!(response.version, 3);
    }

    #[test]
    fn request_builders() {
        let request = IndexRequest::new("events", "doc-1", json!({"a": 1}))
            .create()
            .with_refresh(true)
            .with_consistency(WriteConsistencyLevel::All)
            .with_timeout(Duration::from_millis(250));
        assert_eq!(request.op_type, OpType::Create);
        assert!(request.refresh);
        assert_eq!(request.consistency_level(), WriteConsistencyLevel::All);
        assert_eq!(request.timeout(), Duration::from_millis(250));
        assert!(request.shard_id().is_none());
    }
}
