//! Three-phase primary-replica write coordination.
//!
//! A write flows through three phases, each terminating its caller exactly
//! once:
//!
//! 1. **Reroute** resolves the concrete index and shard against the observed
//!    cluster state and dispatches to the node holding the primary copy,
//!    waiting out transient routing problems bounded by the request timeout.
//! 2. **Primary** admits the write against the consistency level, acquires a
//!    shard reference, runs the subtype primary op, and hands the reply
//!    channel plus the shard reference to the replication phase by move.
//! 3. **Replication** fans the stamped replica request out to every active
//!    replica copy (including relocation targets), tallies successes and
//!    ignorable failures, reports the rest to the master, and emits the
//!    single terminal reply with the composed shard-info summary.
//!
//! Per-replica failures never fail the overall write; they are reported.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

use strata_cluster::cluster::{
    ClusterBlockError, ClusterBlockLevel, ClusterService, ClusterState, ClusterStateObserver,
    IndexMetadata, IndexSettings, IndexShardRoutingTable, NodeId, ObservedChange, ShardId,
    ShardRouting,
};

use crate::action::consistency::consistency_failure;
use crate::action::error::{ActionError, RestStatus};
use crate::action::request::{
    ActionResponse, InternalRequest, ReplicationRequest, ShardInfo, ShardOperationFailure,
};
use crate::action::shard_ref::ShardRef;
use crate::indices::IndicesService;
use crate::master::{ShardFailedOutcome, ShardStateAction};
use crate::node::NodeSettings;
use crate::transport::{
    decode_message, encode_message, Transport, TransportError, TransportRegistry,
};

/// Node-side collaborators every replicated action consumes.
#[derive(Clone)]
pub struct ActionContext {
    pub settings: NodeSettings,
    pub cluster: Arc<ClusterService>,
    pub indices: Arc<IndicesService>,
    pub transport: Arc<dyn Transport>,
    pub shard_state: Arc<ShardStateAction>,
}

/// Subtype hooks of a replicated action: how to resolve the target shard and
/// what to run on the primary and replica copies.
#[async_trait]
pub trait ReplicationAction: Send + Sync + Sized + 'static {
    type Request: ReplicationRequest;
    type ReplicaRequest: ReplicationRequest;
    type Response: ActionResponse;

    fn name(&self) -> &'static str;

    /// Whether the primary phase checks write consistency before executing.
    fn check_write_consistency(&self) -> bool;

    /// Whether the request index may be an alias needing resolution.
    fn resolve_index(&self) -> bool {
        true
    }

    /// Request-specific resolution; may stamp additional routing hints.
    fn resolve_request(
        &self,
        _state: &ClusterState,
        _internal: &mut InternalRequest<Self::Request>,
    ) -> Result<(), ActionError> {
        Ok(())
    }

    /// Compute the concrete shard id for the request.
    fn shard_id(
        &self,
        state: &ClusterState,
        internal: &InternalRequest<Self::Request>,
    ) -> Result<ShardId, ActionError>;

    /// Execute on the primary copy. Returns the client response and the
    /// stamped request to apply on replicas.
    async fn shard_operation_on_primary(
        &self,
        state: &ClusterState,
        request: &mut Self::Request,
    ) -> Result<(Self::Response, Self::ReplicaRequest), ActionError>;

    /// Execute on a replica copy. The shard id in the request is
    /// authoritative; replicas never re-resolve routing.
    async fn shard_operation_on_replica(
        &self,
        shard_id: &ShardId,
        request: Self::ReplicaRequest,
    ) -> Result<(), ActionError>;

    /// Whether replica copies of an index receive replica requests. Shadow
    /// replicas share storage with the primary and are skipped.
    fn should_execute_replication(&self, settings: &IndexSettings) -> bool {
        !settings.shadow_replicas
    }
}

/// One-shot reply channel handed between phases by move.
struct ReplyChannel<R> {
    action: String,
    tx: Mutex<Option<oneshot::Sender<Result<R, ActionError>>>>,
}

impl<R: Send + 'static> ReplyChannel<R> {
    fn new(action: String, tx: oneshot::Sender<Result<R, ActionError>>) -> Self {
        Self {
            action,
            tx: Mutex::new(Some(tx)),
        }
    }

    fn send(&self, result: Result<R, ActionError>) {
        let Some(tx) = self.tx.lock().expect("reply lock poisoned").take() else {
            debug_assert!(false, "terminal reply sent twice for [{}]", self.action);
            return;
        };
        if tx.send(result).is_err() {
            // The caller went away; the operation itself is complete.
            warn!(action = %self.action, "failed to send response to caller");
        }
    }
}

/// A registered replicated action: three transport endpoints plus the phase
/// machinery driving them.
pub struct ReplicatedAction<A: ReplicationAction> {
    action: A,
    ctx: ActionContext,
    action_name: String,
    primary_action: String,
    replica_action: String,
}

impl<A: ReplicationAction> ReplicatedAction<A> {
    /// Register the outer, primary, and replica endpoints on `registry`.
    /// The replica endpoint is force-executed: a replica op must not be
    /// rejected after the primary committed.
    pub fn register(action: A, ctx: ActionContext, registry: &TransportRegistry) -> Arc<Self> {
        let name = action.name();
        let this = Arc::new(Self {
            action_name: name.to_string(),
            primary_action: format!("{name}[p]"),
            replica_action: format!("{name}[r]"),
            action,
            ctx,
        });

        let outer = this.clone();
        registry.register(
            &this.action_name,
            false,
            Arc::new(move |body| {
                let action = outer.clone();
                Box::pin(async move {
                    let request: A::Request =
                        decode_message(&body).map_err(TransportError::into_action_error)?;
                    let response = action.execute(request).await?;
                    encode_message(&response).map_err(TransportError::into_action_error)
                })
            }),
        );

        let primary = this.clone();
        registry.register(
            &this.primary_action,
            false,
            Arc::new(move |body| {
                let action = primary.clone();
                Box::pin(async move {
                    let request: A::Request =
                        decode_message(&body).map_err(TransportError::into_action_error)?;
                    let response = action.handle_primary(request).await?;
                    encode_message(&response).map_err(TransportError::into_action_error)
                })
            }),
        );

        let replica = this.clone();
        registry.register(
            &this.replica_action,
            true,
            Arc::new(move |body| {
                let action = replica.clone();
                Box::pin(async move {
                    let request: A::ReplicaRequest =
                        decode_message(&body).map_err(TransportError::into_action_error)?;
                    action.handle_replica(request).await?;
                    // A replica reply is either empty success or an error.
                    Ok(bytes::Bytes::new())
                })
            }),
        );

        this
    }

    pub fn name(&self) -> &str {
        &self.action_name
    }

    pub fn context(&self) -> &ActionContext {
        &self.ctx
    }

    /// Entry point: run the reroute phase against this node's observed state.
    pub async fn execute(self: Arc<Self>, request: A::Request) -> Result<A::Response, ActionError> {
        ReroutePhase::new(self, request).run().await
    }

    /// Primary endpoint: run the primary phase and wait for the terminal
    /// reply, which the replication phase owns once the primary op succeeds.
    async fn handle_primary(self: Arc<Self>, request: A::Request) -> Result<A::Response, ActionError> {
        let (tx, rx) = oneshot::channel();
        let channel = ReplyChannel::new(self.primary_action.clone(), tx);
        PrimaryPhase {
            action: self.clone(),
            request,
            channel,
        }
        .run()
        .await;
        match rx.await {
            Ok(result) => result,
            Err(_) => Err(ActionError::internal(
                "reply channel dropped before a terminal response",
            )),
        }
    }

    /// Replica endpoint. Retries `RetryOnReplica` on the next cluster-state
    /// change without a timeout: a stuck retry is preferable to incorrectly
    /// failing the copy. Any other error best-effort fails the local shard
    /// and is replied to the coordinator for accounting.
    async fn handle_replica(&self, request: A::ReplicaRequest) -> Result<(), ActionError> {
        let Some(shard_id) = request.shard_id().cloned() else {
            return Err(ActionError::internal(
                "replica request arrived without a resolved shard id",
            ));
        };
        let mut observer = ClusterStateObserver::new(self.ctx.cluster.clone(), None);
        loop {
            match self.apply_on_replica(&shard_id, request.clone()).await {
                Ok(()) => return Ok(()),
                Err(err) if matches!(err, ActionError::RetryOnReplica { .. }) => {
                    trace!(shard = %shard_id, error = %err, "retrying operation on replica");
                    match observer.wait_for_next_change().await {
                        ObservedChange::NewState(_) => continue,
                        ObservedChange::ServiceClosed => {
                            return Err(ActionError::NodeClosed {
                                node: self.ctx.cluster.local_node_id(),
                            })
                        }
                        ObservedChange::TimedOut => {
                            unreachable!("replica retries have no timeout")
                        }
                    }
                }
                Err(err) => {
                    self.fail_replica_if_needed(&shard_id, &err);
                    return Err(err);
                }
            }
        }
    }

    async fn apply_on_replica(
        &self,
        shard_id: &ShardId,
        request: A::ReplicaRequest,
    ) -> Result<(), ActionError> {
        let shard = self.ctx.indices.shard_safe(shard_id)?;
        let _shard_ref = ShardRef::acquire(shard)?;
        self.action.shard_operation_on_replica(shard_id, request).await
    }

    fn fail_replica_if_needed(&self, shard_id: &ShardId, err: &ActionError) {
        trace!(shard = %shard_id, error = %err, "failure on replica");
        if err.ignore_replica() {
            return;
        }
        let Some(index_service) = self.ctx.indices.index_service(&shard_id.index) else {
            debug!(shard = %shard_id, "ignoring failed replica, index was already removed");
            return;
        };
        let Some(shard) = index_service.shard(shard_id.shard) else {
            debug!(shard = %shard_id, "ignoring failed replica, shard was already removed");
            return;
        };
        shard.fail_shard(&format!("{} failed on replica", self.action_name), err);
    }
}

enum Attempt<A: ReplicationAction> {
    Finished(Result<A::Response, ActionError>),
    Retry(ActionError),
}

/// Locates the primary and dispatches to it, retrying transient routing
/// problems on the next cluster-state change. After the observer deadline
/// expires one final attempt runs; the sticky timed-out flag makes the retry
/// after that terminal.
struct ReroutePhase<A: ReplicationAction> {
    action: Arc<ReplicatedAction<A>>,
    request: A::Request,
    observer: ClusterStateObserver,
}

impl<A: ReplicationAction> ReroutePhase<A> {
    fn new(action: Arc<ReplicatedAction<A>>, request: A::Request) -> Self {
        let observer =
            ClusterStateObserver::new(action.ctx.cluster.clone(), Some(request.timeout()));
        Self {
            action,
            request,
            observer,
        }
    }

    async fn run(mut self) -> Result<A::Response, ActionError> {
        loop {
            let state = self.observer.observed_state();
            match self.attempt(&state).await {
                Attempt::Finished(result) => {
                    match &result {
                        Ok(_) => trace!(action = %self.action.action_name, "operation succeeded"),
                        Err(err) => {
                            trace!(action = %self.action.action_name, error = %err, "operation failed")
                        }
                    }
                    return result;
                }
                Attempt::Retry(failure) => {
                    if self.observer.is_timed_out() {
                        // The final post-timeout attempt already ran.
                        return Err(failure);
                    }
                    match self.observer.wait_for_next_change().await {
                        ObservedChange::NewState(_) => {}
                        ObservedChange::ServiceClosed => {
                            return Err(ActionError::NodeClosed {
                                node: self.action.ctx.cluster.local_node_id(),
                            })
                        }
                        // Deadline hit while waiting: try one more time. The
                        // observer's sticky flag turns the next retry into a
                        // terminal failure.
                        ObservedChange::TimedOut => {}
                    }
                }
            }
        }
    }

    async fn attempt(&mut self, state: &ClusterState) -> Attempt<A> {
        if let Some(block) = state.blocks.global_block_error(ClusterBlockLevel::Write) {
            return self.on_block(block);
        }

        let index = self.request.index().to_string();
        let concrete_index = if self.action.action.resolve_index() {
            match state.metadata.resolve_concrete_index(&index) {
                Some(concrete) => concrete.to_string(),
                None => return Attempt::Finished(Err(ActionError::IndexNotFound { index })),
            }
        } else {
            index
        };

        let mut internal = InternalRequest::new(self.request.clone(), concrete_index);
        if let Err(err) = self.action.action.resolve_request(state, &mut internal) {
            return Attempt::Finished(Err(err));
        }

        if let Some(block) =
            state.blocks.index_block_error(ClusterBlockLevel::Write, &internal.concrete_index)
        {
            return self.on_block(block);
        }

        let shard_id = match self.action.action.shard_id(state, &internal) {
            Ok(shard_id) => shard_id,
            Err(err) => return Attempt::Finished(Err(err)),
        };
        self.request = internal.request;
        self.request.set_shard_id(shard_id.clone());

        let Some(index_routing) = state.routing_table.index(&shard_id.index) else {
            trace!(shard = %shard_id, "index routing not found, scheduling a retry");
            return self.retry_because_unavailable(&shard_id, "index is not active.");
        };
        let Some(shard_table) = index_routing.shard(shard_id.shard) else {
            trace!(shard = %shard_id, "shard routing not found, scheduling a retry");
            return self.retry_because_unavailable(&shard_id, "primary shard is not active.");
        };
        let primary = match shard_table.primary_shard() {
            Some(primary) if primary.active() => primary.clone(),
            _ => {
                trace!(shard = %shard_id, "primary shard is not yet active, scheduling a retry");
                return self.retry_because_unavailable(&shard_id, "primary shard is not active.");
            }
        };
        let primary_node = match primary.current_node {
            Some(node) if state.nodes.node_exists(node) => node,
            _ => {
                trace!(
                    shard = %shard_id,
                    node = ?primary.current_node,
                    "primary shard is assigned to an unknown node, scheduling a retry"
                );
                return self
                    .retry_because_unavailable(&shard_id, "primary shard isn't assigned to a known node.");
            }
        };

        let local = self.action.ctx.cluster.local_node_id();
        let (endpoint, is_primary_dispatch) = if primary_node == local {
            trace!(shard = %shard_id, node = primary_node, "perform primary action locally");
            (self.action.primary_action.as_str(), true)
        } else {
            trace!(shard = %shard_id, node = primary_node, "reroute primary action");
            (self.action.action_name.as_str(), false)
        };

        let body = match encode_message(&self.request) {
            Ok(body) => body,
            Err(err) => return Attempt::Finished(Err(err.into_action_error())),
        };
        match self
            .action
            .ctx
            .transport
            .send_request(primary_node, endpoint, body)
            .await
        {
            Ok(bytes) => match decode_message::<A::Response>(&bytes) {
                Ok(response) => Attempt::Finished(Ok(response)),
                Err(err) => Attempt::Finished(Err(err.into_action_error())),
            },
            Err(err) if err.is_connect_failure() || err.is_node_closed() => {
                trace!(
                    error = %err,
                    "error from the node the primary was assigned to, scheduling a retry"
                );
                Attempt::Retry(err.into_action_error())
            }
            Err(err) => {
                let cause = err.into_action_error();
                if is_primary_dispatch && cause.retry_primary() {
                    trace!(error = %cause, "retryable primary failure, scheduling a retry");
                    Attempt::Retry(cause)
                } else {
                    Attempt::Finished(Err(cause))
                }
            }
        }
    }

    fn on_block(&self, block: ClusterBlockError) -> Attempt<A> {
        if block.retryable {
            trace!(block = %block.description, "cluster is blocked, scheduling a retry");
            Attempt::Retry(block.into())
        } else {
            Attempt::Finished(Err(block.into()))
        }
    }

    fn retry_because_unavailable(&self, shard_id: &ShardId, message: &str) -> Attempt<A> {
        Attempt::Retry(ActionError::UnavailableShards {
            shard_id: shard_id.clone(),
            message: format!(
                "{message} timeout: [{:?}], request: {:?}",
                self.request.timeout(),
                self.request
            ),
        })
    }
}

/// Runs the primary op on the node holding the primary copy and hands off to
/// the replication phase. Once the hand-off happens this phase holds no
/// resources.
struct PrimaryPhase<A: ReplicationAction> {
    action: Arc<ReplicatedAction<A>>,
    request: A::Request,
    channel: ReplyChannel<A::Response>,
}

impl<A: ReplicationAction> PrimaryPhase<A> {
    async fn run(mut self) {
        let ctx = self.action.ctx.clone();
        // Stable snapshot for the whole phase.
        let state = ctx.cluster.state();
        let Some(shard_id) = self.request.shard_id().cloned() else {
            self.channel.send(Err(ActionError::internal(
                "request reached the primary without a resolved shard id",
            )));
            return;
        };

        if self.action.action.check_write_consistency() {
            let level = self
                .request
                .consistency_level()
                .or_default(ctx.settings.default_write_consistency);
            let table = state.routing_table.shard_routing_table(&shard_id);
            if let Some(failure) = consistency_failure(level, table) {
                trace!(shard = %shard_id, level = %level, "{failure} scheduling a retry");
                // The reroute phase treats this as retryable.
                self.channel.send(Err(ActionError::UnavailableShards {
                    shard_id,
                    message: format!(
                        "{failure} timeout: [{:?}], request: {:?}",
                        self.request.timeout(),
                        self.request
                    ),
                }));
                return;
            }
        }

        let shard = match ctx.indices.shard_safe(&shard_id) {
            Ok(shard) => shard,
            Err(err) => {
                self.channel.send(Err(err));
                return;
            }
        };
        let shard_ref = match ShardRef::acquire(shard) {
            Ok(shard_ref) => shard_ref,
            Err(err) => {
                self.channel.send(Err(err));
                return;
            }
        };

        match self
            .action
            .action
            .shard_operation_on_primary(&state, &mut self.request)
            .await
        {
            Err(err) => {
                if err.rest_status() == RestStatus::Conflict {
                    trace!(shard = %shard_id, error = %err, "failed to execute primary operation");
                } else {
                    debug!(shard = %shard_id, error = %err, "failed to execute primary operation");
                }
                shard_ref.release();
                self.channel.send(Err(err));
            }
            Ok((response, replica_request)) => {
                trace!(shard = %shard_id, "operation completed on primary");
                // Cache the metadata snapshot so settings resolve even if the
                // index is deleted after the primary operation.
                let Some(metadata) = state.metadata.index(&shard_id.index).cloned() else {
                    shard_ref.release();
                    self.channel.send(Err(ActionError::IndexNotFound {
                        index: shard_id.index,
                    }));
                    return;
                };
                ReplicationPhase::start(
                    self.action.clone(),
                    replica_request,
                    response,
                    shard_id,
                    metadata,
                    self.channel,
                    shard_ref,
                    ctx.settings.shard_failure_timeout,
                );
            }
        }
    }
}

/// Choose the replica targets for one shard: every non-local assigned copy,
/// plus the relocation target of every relocating copy. Returns the pending
/// target list and the ignored-copy count.
fn replication_targets(
    table: &IndexShardRoutingTable,
    local: NodeId,
    execute_on_replica: bool,
) -> (Vec<(ShardRouting, NodeId)>, u32) {
    let mut targets = Vec::new();
    let mut ignored = 0u32;
    for shard in table.shards() {
        if !shard.primary && !execute_on_replica {
            // Shadow replicas share storage with the primary; they pick up
            // mapping changes through the cluster state instead.
            ignored += 1;
            continue;
        }
        if shard.unassigned() {
            ignored += 1;
            continue;
        }
        // An initializing copy is still addressed; if it is not ready it
        // answers with an illegal-shard-state error, which is ignorable.
        if let Some(node) = shard.current_node {
            // The local primary already executed; never a replica target.
            if node != local {
                targets.push((shard.clone(), node));
            }
        }
        if shard.relocating() {
            if let Some(target) = shard.relocating_node {
                if target != local {
                    targets.push((shard.clone(), target));
                }
            }
        }
    }
    (targets, ignored)
}

struct TerminalState<A: ReplicationAction> {
    response: A::Response,
    channel: ReplyChannel<A::Response>,
    shard_ref: ShardRef,
}

/// Shared tally of one replication fan-out. Updated from racing transport
/// completions; the terminal reply is guarded by a compare-and-set so it is
/// emitted exactly once.
struct ReplicationProgress<A: ReplicationAction> {
    action_name: String,
    shard_id: ShardId,
    total: u32,
    success: AtomicU32,
    pending: AtomicI64,
    finished: AtomicBool,
    failures: Mutex<BTreeMap<NodeId, ActionError>>,
    terminal: Mutex<Option<TerminalState<A>>>,
}

impl<A: ReplicationAction> ReplicationProgress<A> {
    fn on_replica_success(&self) {
        self.success.fetch_add(1, Ordering::AcqRel);
        self.dec_pending_and_finish_if_needed();
    }

    /// Account one replica as failed. Ignorable causes (and node-left
    /// accounting with no cause) leave no failure entry.
    fn on_replica_failure(&self, node: NodeId, cause: Option<ActionError>) {
        if let Some(cause) = cause {
            if !cause.ignore_replica() {
                self.failures
                    .lock()
                    .expect("failures lock poisoned")
                    .insert(node, cause);
            }
        }
        self.dec_pending_and_finish_if_needed();
    }

    fn dec_pending_and_finish_if_needed(&self) {
        if self.pending.fetch_sub(1, Ordering::AcqRel) <= 1 {
            self.finish();
        }
    }

    fn finish(&self) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        let Some(TerminalState {
            mut response,
            channel,
            shard_ref,
        }) = self.terminal.lock().expect("terminal lock poisoned").take()
        else {
            debug_assert!(false, "terminal state consumed twice");
            return;
        };
        shard_ref.release();
        let failures: Vec<ShardOperationFailure> = self
            .failures
            .lock()
            .expect("failures lock poisoned")
            .iter()
            .map(|(node, cause)| ShardOperationFailure {
                index: self.shard_id.index.clone(),
                shard: self.shard_id.shard,
                node: *node,
                status: cause.rest_status(),
                cause: cause.clone(),
                primary: false,
            })
            .collect();
        response.set_shard_info(ShardInfo::new(
            self.total,
            self.success.load(Ordering::Acquire),
            failures,
        ));
        channel.send(Ok(response));
    }

    fn force_finish_failed(&self, err: ActionError) {
        if self
            .finished
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return;
        }
        warn!(
            action = %self.action_name,
            shard = %self.shard_id,
            error = %err,
            "unexpected error while replicating"
        );
        if let Some(TerminalState {
            channel, shard_ref, ..
        }) = self.terminal.lock().expect("terminal lock poisoned").take()
        {
            shard_ref.release();
            channel.send(Err(err));
        }
    }
}

/// Owns the terminal reply from primary hand-off onwards.
struct ReplicationPhase;

impl ReplicationPhase {
    #[allow(clippy::too_many_arguments)]
    fn start<A: ReplicationAction>(
        action: Arc<ReplicatedAction<A>>,
        replica_request: A::ReplicaRequest,
        response: A::Response,
        shard_id: ShardId,
        index_metadata: IndexMetadata,
        channel: ReplyChannel<A::Response>,
        shard_ref: ShardRef,
        shard_failed_timeout: Option<Duration>,
    ) {
        // Fresh snapshot: route replica requests over the latest routing,
        // which may have moved on since the primary op started.
        let state = action.ctx.cluster.state();
        let local = action.ctx.cluster.local_node_id();
        let execute_on_replica = action
            .action
            .should_execute_replication(&index_metadata.settings);
        let index_uuid = index_metadata.index_uuid;

        let Some(table) = state.routing_table.shard_routing_table(&shard_id).cloned() else {
            // The index disappeared between the primary op and here.
            shard_ref.release();
            channel.send(Err(ActionError::IndexNotFound {
                index: shard_id.index,
            }));
            return;
        };
        let (targets, ignored) = replication_targets(&table, local, execute_on_replica);
        let total = 1 + targets.len() as u32 + ignored;
        let progress = Arc::new(ReplicationProgress::<A> {
            action_name: action.action_name.clone(),
            shard_id: shard_id.clone(),
            total,
            success: AtomicU32::new(1),
            pending: AtomicI64::new(targets.len() as i64),
            finished: AtomicBool::new(false),
            failures: Mutex::new(BTreeMap::new()),
            terminal: Mutex::new(Some(TerminalState {
                response,
                channel,
                shard_ref,
            })),
        });

        if targets.is_empty() {
            progress.finish();
            return;
        }

        for (routing, node) in targets {
            if !state.nodes.node_exists(node) {
                // The node already left; routing will fail the copy over, so
                // account it without a failure entry.
                progress.on_replica_failure(node, None);
                continue;
            }
            let action = action.clone();
            let progress = progress.clone();
            let replica_request = replica_request.clone();
            let index_uuid = index_uuid.clone();
            tokio::spawn(async move {
                perform_on_replica(
                    action,
                    progress,
                    replica_request,
                    routing,
                    node,
                    index_uuid,
                    shard_failed_timeout,
                )
                .await;
            });
        }
    }
}

async fn perform_on_replica<A: ReplicationAction>(
    action: Arc<ReplicatedAction<A>>,
    progress: Arc<ReplicationProgress<A>>,
    replica_request: A::ReplicaRequest,
    routing: ShardRouting,
    node: NodeId,
    index_uuid: String,
    shard_failed_timeout: Option<Duration>,
) {
    let body = match encode_message(&replica_request) {
        Ok(body) => body,
        Err(err) => {
            progress.force_finish_failed(err.into_action_error());
            return;
        }
    };
    match action
        .ctx
        .transport
        .send_request(node, &action.replica_action, body)
        .await
    {
        Ok(_) => progress.on_replica_success(),
        Err(err) => {
            let cause = err.into_action_error();
            trace!(node, error = %cause, "transport failure during replica request");
            if cause.ignore_replica() {
                progress.on_replica_failure(node, Some(cause));
            } else {
                warn!(
                    shard = %progress.shard_id,
                    node,
                    error = %cause,
                    "failed to perform {} on replica",
                    progress.action_name
                );
                let reason = format!(
                    "failed to perform {} on replica on node {node}",
                    progress.action_name
                );
                let outcome = action
                    .ctx
                    .shard_state
                    .shard_failed(&routing, &index_uuid, &reason, &cause, shard_failed_timeout)
                    .await;
                if let ShardFailedOutcome::TransportFailure(TransportError::ReceiveTimeout {
                    ..
                }) = &outcome
                {
                    trace!(node, "timeout sending shard failure to master");
                }
                // Whatever the master said, the replica is accounted failed.
                progress.on_replica_failure(node, Some(cause));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strata_cluster::cluster::ShardRoutingState;

    fn copy(
        primary: bool,
        state: ShardRoutingState,
        node: Option<NodeId>,
        relocating: Option<NodeId>,
    ) -> ShardRouting {
        ShardRouting {
            shard_id: ShardId::new("events", 0),
            primary,
            state,
            current_node: node,
            relocating_node: relocating,
        }
    }

    fn table(copies: Vec<ShardRouting>) -> IndexShardRoutingTable {
        IndexShardRoutingTable::new(ShardId::new("events", 0), copies)
    }

    #[test]
    fn selects_remote_copies_and_skips_local_primary() {
        let table = table(vec![
            copy(true, ShardRoutingState::Started, Some(1), None),
            copy(false, ShardRoutingState::Started, Some(2), None),
            copy(false, ShardRoutingState::Started, Some(3), None),
        ]);
        let (targets, ignored) = replication_targets(&table, 1, true);
        let nodes: Vec<NodeId> = targets.iter().map(|(_, node)| *node).collect();
        assert_eq!(nodes, vec![2, 3]);
        assert_eq!(ignored, 0);
    }

    #[test]
    fn relocating_copy_gets_two_targets() {
        let table = table(vec![
            copy(true, ShardRoutingState::Started, Some(1), None),
            copy(false, ShardRoutingState::Relocating, Some(2), Some(4)),
        ]);
        let (targets, ignored) = replication_targets(&table, 1, true);
        let nodes: Vec<NodeId> = targets.iter().map(|(_, node)| *node).collect();
        assert_eq!(nodes, vec![2, 4]);
        assert_eq!(ignored, 0);
    }

    #[test]
    fn relocating_primary_targets_its_destination() {
        let table = table(vec![
            copy(true, ShardRoutingState::Relocating, Some(1), Some(5)),
            copy(false, ShardRoutingState::Started, Some(2), None),
        ]);
        let (targets, _) = replication_targets(&table, 1, true);
        let nodes: Vec<NodeId> = targets.iter().map(|(_, node)| *node).collect();
        // The local primary is skipped but its relocation target is not.
        assert_eq!(nodes, vec![5, 2]);
    }

    #[test]
    fn unassigned_copies_are_ignored() {
        let table = table(vec![
            copy(true, ShardRoutingState::Started, Some(1), None),
            copy(false, ShardRoutingState::Unassigned, None, None),
            copy(false, ShardRoutingState::Started, Some(2), None),
        ]);
        let (targets, ignored) = replication_targets(&table, 1, true);
        assert_eq!(targets.len(), 1);
        assert_eq!(ignored, 1);
    }

    #[test]
    fn shadow_replicas_ignore_every_non_primary_copy() {
        let table = table(vec![
            copy(true, ShardRoutingState::Started, Some(1), None),
            copy(false, ShardRoutingState::Started, Some(2), None),
            copy(false, ShardRoutingState::Unassigned, None, None),
        ]);
        let (targets, ignored) = replication_targets(&table, 1, false);
        assert!(targets.is_empty());
        assert_eq!(ignored, 2);
        // total = 1 (primary) + 0 pending + 2 ignored
        assert_eq!(1 + targets.len() as u32 + ignored, 3);
    }

    #[test]
    fn initializing_copy_is_still_addressed() {
        let table = table(vec![
            copy(true, ShardRoutingState::Started, Some(1), None),
            copy(false, ShardRoutingState::Initializing, Some(2), None),
        ]);
        let (targets, ignored) = replication_targets(&table, 1, true);
        assert_eq!(targets.len(), 1);
        assert_eq!(ignored, 0);
    }
}
