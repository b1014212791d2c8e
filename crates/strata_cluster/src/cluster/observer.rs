//! Cluster-state publication and observation.
//!
//! `ClusterService` is the per-node holder of the latest observed state,
//! published through a tokio watch channel. `ClusterStateObserver` is a
//! single-shot "wait for the next change" primitive with three outcomes:
//! a new state, service close, or deadline expiry. The timed-out flag is
//! sticky so a caller granting one final attempt can detect that the
//! deadline has already passed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tracing::trace;

use crate::cluster::node::NodeId;
use crate::cluster::state::ClusterState;

/// Per-node view of the cluster state.
pub struct ClusterService {
    local_node: NodeId,
    tx: watch::Sender<Arc<ClusterState>>,
    closed: AtomicBool,
}

impl ClusterService {
    pub fn new(local_node: NodeId, initial: ClusterState) -> Arc<Self> {
        let (tx, _rx) = watch::channel(Arc::new(initial));
        Arc::new(Self {
            local_node,
            tx,
            closed: AtomicBool::new(false),
        })
    }

    pub fn local_node_id(&self) -> NodeId {
        self.local_node
    }

    /// Latest state observed by this node.
    pub fn state(&self) -> Arc<ClusterState> {
        self.tx.borrow().clone()
    }

    /// Install a newer state and wake observers. Stale publications (version
    /// not beyond the current one) are dropped.
    pub fn publish(&self, state: ClusterState) {
        if self.closed.load(Ordering::Acquire) {
            return;
        }
        let version = state.version;
        self.tx.send_if_modified(|current| {
            if version <= current.version {
                trace!(
                    node = self.local_node,
                    current = current.version,
                    incoming = version,
                    "dropping stale cluster state"
                );
                return false;
            }
            *current = Arc::new(state);
            true
        });
    }

    pub fn subscribe(&self) -> watch::Receiver<Arc<ClusterState>> {
        self.tx.subscribe()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Mark the service closed and wake all observers.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Waking through the channel lets pending observers see the flag.
        self.tx.send_modify(|_| {});
    }
}

/// Outcome of one `wait_for_next_change` call.
#[derive(Debug, Clone)]
pub enum ObservedChange {
    NewState(Arc<ClusterState>),
    ServiceClosed,
    TimedOut,
}

/// Single-listener observer bound to an optional deadline derived from the
/// request timeout. Without a deadline the observer waits indefinitely.
pub struct ClusterStateObserver {
    service: Arc<ClusterService>,
    rx: watch::Receiver<Arc<ClusterState>>,
    deadline: Option<Instant>,
    timed_out: bool,
}

impl ClusterStateObserver {
    pub fn new(service: Arc<ClusterService>, timeout: Option<Duration>) -> Self {
        let rx = service.subscribe();
        Self {
            service,
            rx,
            deadline: timeout.map(|t| Instant::now() + t),
            timed_out: false,
        }
    }

    /// The state this observer currently considers seen. Subsequent waits
    /// trigger only for states published after this call.
    pub fn observed_state(&mut self) -> Arc<ClusterState> {
        self.rx.borrow_and_update().clone()
    }

    /// Whether the deadline has expired. Once true, it stays true.
    pub fn is_timed_out(&self) -> bool {
        self.timed_out
    }

    pub async fn wait_for_next_change(&mut self) -> ObservedChange {
        if self.service.is_closed() {
            return ObservedChange::ServiceClosed;
        }
        let changed = self.rx.changed();
        let result = match self.deadline {
            Some(deadline) => match tokio::time::timeout_at(deadline, changed).await {
                Ok(result) => result,
                Err(_) => {
                    self.timed_out = true;
                    return ObservedChange::TimedOut;
                }
            },
            None => changed.await,
        };
        if result.is_err() || self.service.is_closed() {
            return ObservedChange::ServiceClosed;
        }
        ObservedChange::NewState(self.rx.borrow_and_update().clone())
    }
}
