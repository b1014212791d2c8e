//! Shared helpers for integration tests: an in-process cluster plus a
//! scripted replicated action whose primary and replica behavior tests can
//! program per node.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use strata_cluster::cluster::{ClusterState, IndexSettings, NodeId, ShardId};
use strata_store::action::consistency::WriteConsistencyLevel;
use strata_store::action::error::ActionError;
use strata_store::action::replication::{ReplicatedAction, ReplicationAction};
use strata_store::action::request::{
    ActionResponse, InternalRequest, ReplicationRequest, ShardInfo, ShardTarget,
};
use strata_store::node::{LocalCluster, LocalClusterOptions};

pub const TEST_ACTION_NAME: &str = "internal:test/replicated-write";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TestRequest {
    pub index: String,
    pub payload: String,
    pub timeout: Duration,
    pub consistency: WriteConsistencyLevel,
    target: ShardTarget,
}

impl TestRequest {
    pub fn new(index: &str, payload: &str) -> Self {
        Self {
            index: index.to_string(),
            payload: payload.to_string(),
            timeout: Duration::from_secs(10),
            consistency: WriteConsistencyLevel::Default,
            target: ShardTarget::unresolved(),
        }
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

impl ReplicationRequest for TestRequest {
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
pub struct TestResponse {
    pub payload: String,
    pub shard_info: ShardInfo,
}

impl ActionResponse for TestResponse {
    fn shard_info(&self) -> &ShardInfo {
        &self.shard_info
    }

    fn set_shard_info(&mut self, info: ShardInfo) {
        self.shard_info = info;
    }
}

/// Behavior script shared by every node's test action.
#[derive(Default)]
pub struct TestBehavior {
    /// Errors the replica op returns, per node.
    replica_errors: Mutex<HashMap<NodeId, ActionError>>,
    /// Errors the primary op returns, consumed one per call.
    primary_errors: Mutex<VecDeque<ActionError>>,
    replica_calls: Mutex<HashMap<NodeId, usize>>,
    primary_calls: AtomicUsize,
}

impl TestBehavior {
    pub fn fail_replica_on(&self, node: NodeId, error: ActionError) {
        self.replica_errors
            .lock()
            .unwrap()
            .insert(node, error);
    }

    pub fn clear_replica_failure(&self, node: NodeId) {
        self.replica_errors.lock().unwrap().remove(&node);
    }

    pub fn fail_primary_once(&self, error: ActionError) {
        self.primary_errors.lock().unwrap().push_back(error);
    }

    pub fn replica_calls(&self, node: NodeId) -> usize {
        self.replica_calls
            .lock()
            .unwrap()
            .get(&node)
            .copied()
            .unwrap_or(0)
    }

    pub fn primary_calls(&self) -> usize {
        self.primary_calls.load(Ordering::Acquire)
    }
}

/// Scripted replicated action. One instance per node; behavior is shared.
pub struct TestAction {
    node_id: NodeId,
    behavior: Arc<TestBehavior>,
}

#[async_trait]
impl ReplicationAction for TestAction {
    type Request = TestRequest;
    type ReplicaRequest = TestRequest;
    type Response = TestResponse;

    fn name(&self) -> &'static str {
        TEST_ACTION_NAME
    }

    fn check_write_consistency(&self) -> bool {
        true
    }

    fn shard_id(
        &self,
        _state: &ClusterState,
        internal: &InternalRequest<TestRequest>,
    ) -> Result<ShardId, ActionError> {
        Ok(ShardId::new(internal.concrete_index.clone(), 0))
    }

    async fn shard_operation_on_primary(
        &self,
        _state: &ClusterState,
        request: &mut TestRequest,
    ) -> Result<(TestResponse, TestRequest), ActionError> {
        self.behavior.primary_calls.fetch_add(1, Ordering::AcqRel);
        if let Some(error) = self.behavior.primary_errors.lock().unwrap().pop_front() {
            return Err(error);
        }
        let response = TestResponse {
            payload: format!("{}-applied", request.payload),
            shard_info: ShardInfo::default(),
        };
        Ok((response, request.clone()))
    }

    async fn shard_operation_on_replica(
        &self,
        _shard_id: &ShardId,
        _request: TestRequest,
    ) -> Result<(), ActionError> {
        *self
            .behavior
            .replica_calls
            .lock()
            .unwrap()
            .entry(self.node_id)
            .or_insert(0) += 1;
        if let Some(error) = self.behavior.replica_errors.lock().unwrap().get(&self.node_id) {
            return Err(error.clone());
        }
        Ok(())
    }
}

/// An in-process cluster with the scripted action registered on every node.
pub struct TestFixture {
    pub cluster: LocalCluster,
    pub actions: BTreeMap<NodeId, Arc<ReplicatedAction<TestAction>>>,
    pub behavior: Arc<TestBehavior>,
}

impl TestFixture {
    pub fn start(nodes: u64) -> Self {
        Self::start_with_options(LocalClusterOptions {
            nodes,
            ..LocalClusterOptions::default()
        })
    }

    pub fn start_with_options(options: LocalClusterOptions) -> Self {
        let cluster = LocalCluster::start(options).expect("start cluster");
        let behavior = Arc::new(TestBehavior::default());
        let mut actions = BTreeMap::new();
        for node in cluster.nodes() {
            let action = TestAction {
                node_id: node.settings.node_id,
                behavior: behavior.clone(),
            };
            actions.insert(
                node.settings.node_id,
                ReplicatedAction::register(action, node.action_context(), &node.registry),
            );
        }
        TestFixture {
            cluster,
            actions,
            behavior,
        }
    }

    /// Create the test index: one shard, `replicas` replicas, all started.
    pub fn create_index(&self, replicas: u32) -> IndexSettings {
        let settings = IndexSettings {
            number_of_shards: 1,
            number_of_replicas: replicas,
            ..IndexSettings::default()
        };
        self.cluster
            .create_index("events", settings.clone())
            .expect("create index");
        settings
    }

    pub async fn execute(
        &self,
        coordinator: NodeId,
        request: TestRequest,
    ) -> Result<TestResponse, ActionError> {
        self.actions
            .get(&coordinator)
            .expect("unknown coordinator")
            .clone()
            .execute(request)
            .await
    }
}
