//! Master-side cluster services.
//!
//! Two internal actions run on the designated master node: merging dynamic
//! mapping updates into index metadata, and marking shard copies failed in
//! the routing table. Both republish the mutated state to every node.
//! Master election is out of scope; the master node id is static
//! configuration.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, trace, warn};

use strata_cluster::cluster::{
    ClusterService, ClusterState, Mapping, NodeId, ShardRouting, ShardRoutingState,
};

use crate::action::error::ActionError;
use crate::indices::IndicesService;
use crate::transport::{
    decode_message, encode_message, Transport, TransportError, TransportRegistry,
};

pub const SHARD_FAILED_ACTION: &str = "internal:cluster/shard/failure";
pub const MAPPING_UPDATE_ACTION: &str = "internal:cluster/mapping/update";

/// How long a mapping-update round-trip to the master may take.
const MAPPING_UPDATE_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ShardFailedRequest {
    routing: ShardRouting,
    index_uuid: String,
    reason: String,
    cause: ActionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct MappingUpdateRequest {
    index: String,
    update: Mapping,
}

/// Pushes a mutated cluster state out to the nodes.
pub trait StatePublisher: Send + Sync + 'static {
    fn publish(&self, state: ClusterState);
}

/// Publisher reaching every node of an in-process cluster.
#[derive(Default)]
pub struct FanoutPublisher {
    services: std::sync::RwLock<Vec<Arc<ClusterService>>>,
}

impl FanoutPublisher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, service: Arc<ClusterService>) {
        self.services
            .write()
            .expect("publisher lock poisoned")
            .push(service);
    }
}

impl StatePublisher for FanoutPublisher {
    fn publish(&self, state: ClusterState) {
        let services = self.services.read().expect("publisher lock poisoned");
        for service in services.iter() {
            service.publish(state.clone());
        }
    }
}

/// Outcome of reporting a failed shard to the master. Every outcome resolves
/// the local accounting the same way; the distinction is for logging.
#[derive(Debug)]
pub enum ShardFailedOutcome {
    Acked,
    NoMaster,
    TransportFailure(TransportError),
}

/// Client side of the shard-failed report.
pub struct ShardStateAction {
    cluster: Arc<ClusterService>,
    transport: Arc<dyn Transport>,
    master: NodeId,
}

impl ShardStateAction {
    pub fn new(
        cluster: Arc<ClusterService>,
        transport: Arc<dyn Transport>,
        master: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            transport,
            master,
        })
    }

    /// Ask the master to mark `routing` failed. Never retries; the caller
    /// folds every outcome into "replica failed".
    pub async fn shard_failed(
        &self,
        routing: &ShardRouting,
        index_uuid: &str,
        reason: &str,
        cause: &ActionError,
        timeout: Option<Duration>,
    ) -> ShardFailedOutcome {
        let state = self.cluster.state();
        if !state.nodes.node_exists(self.master) {
            warn!(
                shard = %routing.shard_id,
                master = self.master,
                "cannot report failed shard, no known master"
            );
            return ShardFailedOutcome::NoMaster;
        }
        let request = ShardFailedRequest {
            routing: routing.clone(),
            index_uuid: index_uuid.to_string(),
            reason: reason.to_string(),
            cause: cause.clone(),
        };
        let body = match encode_message(&request) {
            Ok(body) => body,
            Err(err) => return ShardFailedOutcome::TransportFailure(err),
        };
        let send = self.transport.send_request(self.master, SHARD_FAILED_ACTION, body);
        let result = match timeout {
            Some(timeout) => match tokio::time::timeout(timeout, send).await {
                Ok(result) => result,
                Err(_) => {
                    return ShardFailedOutcome::TransportFailure(TransportError::ReceiveTimeout {
                        node: self.master,
                        action: SHARD_FAILED_ACTION.to_string(),
                    })
                }
            },
            None => send.await,
        };
        match result {
            Ok(_) => ShardFailedOutcome::Acked,
            Err(err) => ShardFailedOutcome::TransportFailure(err),
        }
    }
}

/// Synchronous-style mapping update against the master.
#[async_trait]
pub trait MappingUpdater: Send + Sync + 'static {
    async fn update_mapping_on_master(
        &self,
        index: &str,
        update: &Mapping,
    ) -> Result<(), ActionError>;
}

/// Default updater: round-trips to the master, then merges the update into
/// the node-local mapping so a re-prepared operation sees it immediately,
/// ahead of the republished state.
pub struct MappingUpdateAction {
    transport: Arc<dyn Transport>,
    indices: Arc<IndicesService>,
    master: NodeId,
}

impl MappingUpdateAction {
    pub fn new(
        transport: Arc<dyn Transport>,
        indices: Arc<IndicesService>,
        master: NodeId,
    ) -> Arc<Self> {
        Arc::new(Self {
            transport,
            indices,
            master,
        })
    }
}

#[async_trait]
impl MappingUpdater for MappingUpdateAction {
    async fn update_mapping_on_master(
        &self,
        index: &str,
        update: &Mapping,
    ) -> Result<(), ActionError> {
        let request = MappingUpdateRequest {
            index: index.to_string(),
            update: update.clone(),
        };
        let body = encode_message(&request).map_err(TransportError::into_action_error)?;
        let send = self.transport.send_request(self.master, MAPPING_UPDATE_ACTION, body);
        match tokio::time::timeout(MAPPING_UPDATE_TIMEOUT, send).await {
            Ok(Ok(_)) => {}
            Ok(Err(err)) => return Err(err.into_action_error()),
            Err(_) => {
                return Err(ActionError::internal(format!(
                    "timed out waiting for mapping update of [{index}] on master"
                )))
            }
        }
        if let Some(service) = self.indices.index_service(index) {
            service.apply_mapping(update);
        }
        Ok(())
    }
}

/// Master-side handlers. Mutations are serialized and republished with a
/// bumped version.
pub struct MasterService {
    cluster: Arc<ClusterService>,
    publisher: Arc<dyn StatePublisher>,
    mutation: Mutex<()>,
}

impl MasterService {
    pub fn new(cluster: Arc<ClusterService>, publisher: Arc<dyn StatePublisher>) -> Arc<Self> {
        Arc::new(Self {
            cluster,
            publisher,
            mutation: Mutex::new(()),
        })
    }

    pub fn register(self: Arc<Self>, registry: &TransportRegistry) {
        let service = self.clone();
        registry.register(
            SHARD_FAILED_ACTION,
            false,
            Arc::new(move |body| {
                let service = service.clone();
                Box::pin(async move {
                    let request: ShardFailedRequest =
                        decode_message(&body).map_err(TransportError::into_action_error)?;
                    service.apply_shard_failed(request).await;
                    Ok(bytes::Bytes::new())
                })
            }),
        );

        let service = self.clone();
        registry.register(
            MAPPING_UPDATE_ACTION,
            false,
            Arc::new(move |body| {
                let service = service.clone();
                Box::pin(async move {
                    let request: MappingUpdateRequest =
                        decode_message(&body).map_err(TransportError::into_action_error)?;
                    service.apply_mapping_update(request).await?;
                    Ok(bytes::Bytes::new())
                })
            }),
        );
    }

    async fn apply_shard_failed(&self, request: ShardFailedRequest) {
        let _guard = self.mutation.lock().await;
        let mut state = self.cluster.state().as_ref().clone();
        let shard_id = request.routing.shard_id.clone();
        let Some(table) = state
            .routing_table
            .index_mut(&shard_id.index)
            .and_then(|index| index.shard_mut(shard_id.shard))
        else {
            debug!(shard = %shard_id, "failed shard report for unknown routing, ignoring");
            return;
        };
        let failed_node = request.routing.current_node;
        let mut changed = false;
        for copy in table.shards_mut() {
            if copy.primary == request.routing.primary && copy.current_node == failed_node {
                warn!(
                    shard = %shard_id,
                    node = ?failed_node,
                    reason = %request.reason,
                    error = %request.cause,
                    "marking shard copy failed"
                );
                // A failure reported for a relocating copy fails the whole
                // move; both addresses stop serving it.
                copy.state = ShardRoutingState::Unassigned;
                copy.current_node = None;
                copy.relocating_node = None;
                changed = true;
            }
        }
        if changed {
            let state = state.bumped();
            trace!(version = state.version, "publishing state after shard failure");
            self.publisher.publish(state);
        }
    }

    async fn apply_mapping_update(&self, request: MappingUpdateRequest) -> Result<(), ActionError> {
        let _guard = self.mutation.lock().await;
        let mut state = self.cluster.state().as_ref().clone();
        let Some(metadata) = state.metadata.index_mut(&request.index) else {
            return Err(ActionError::IndexNotFound {
                index: request.index,
            });
        };
        metadata.mapping.merge(&request.update);
        let state = state.bumped();
        debug!(
            index = %request.index,
            fields = request.update.len(),
            version = state.version,
            "publishing state after mapping update"
        );
        self.publisher.publish(state);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cluster::cluster::{
        IndexMetadata, IndexRoutingTable, IndexSettings, IndexShardRoutingTable, ShardId,
    };
    use strata_cluster::cluster::{DiscoveryNode, FieldType};

    fn sample_state() -> ClusterState {
        let shard_id = ShardId::new("events", 0);
        let mut state = ClusterState::new(1);
        state
            .nodes
            .add(DiscoveryNode::new(1, "node-1", "local://1"));
        state
            .nodes
            .add(DiscoveryNode::new(2, "node-2", "local://2"));
        let mut index_table = IndexRoutingTable::new("events");
        index_table.add_shard(IndexShardRoutingTable::new(
            shard_id.clone(),
            vec![
                ShardRouting::new(shard_id.clone(), true, ShardRoutingState::Started, 1),
                ShardRouting::new(shard_id, false, ShardRoutingState::Started, 2),
            ],
        ));
        state.routing_table.add_index(index_table);
        state
            .metadata
            .add_index(IndexMetadata::new("events", "uuid-1", IndexSettings::default()));
        state
    }

    #[tokio::test]
    async fn shard_failed_marks_copy_unassigned() {
        let cluster = ClusterService::new(1, sample_state());
        let publisher = FanoutPublisher::new();
        publisher.add(cluster.clone());
        let master = MasterService::new(cluster.clone(), publisher);

        let shard_id = ShardId::new("events", 0);
        let replica = ShardRouting::new(shard_id.clone(), false, ShardRoutingState::Started, 2);
        master
            .apply_shard_failed(ShardFailedRequest {
                routing: replica,
                index_uuid: "uuid-1".to_string(),
                reason: "test".to_string(),
                cause: ActionError::EngineFailure { message: "io".into() },
            })
            .await;

        let state = cluster.state();
        assert_eq!(state.version, 2);
        let table = state.routing_table.shard_routing_table(&shard_id).unwrap();
        let replica = table.replica_shards().next().unwrap();
        assert!(replica.unassigned());
        assert!(table.primary_shard().unwrap().active());
    }

    #[tokio::test]
    async fn mapping_update_merges_and_republishes() {
        let cluster = ClusterService::new(1, sample_state());
        let publisher = FanoutPublisher::new();
        publisher.add(cluster.clone());
        let master = MasterService::new(cluster.clone(), publisher);

        let mut update = Mapping::new();
        update.insert("count", FieldType::Long);
        master
            .apply_mapping_update(MappingUpdateRequest {
                index: "events".to_string(),
                update,
            })
            .await
            .unwrap();

        let state = cluster.state();
        assert_eq!(state.version, 2);
        assert!(state.metadata.index("events").unwrap().mapping.contains("count"));

        let missing = master
            .apply_mapping_update(MappingUpdateRequest {
                index: "absent".to_string(),
                update: Mapping::new(),
            })
            .await;
        assert!(matches!(missing, Err(ActionError::IndexNotFound { .. })));
    }
}
