//! Transport abstraction and the in-process mesh implementation.
//!
//! The coordination engine is transport-agnostic: it sends framed requests to
//! a node + action name and receives framed responses or a typed error.
//! Node-side, handlers register per action name; replica handlers register
//! with force-execute because a replica op must not be dropped by a saturated
//! executor after the primary already committed.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::trace;

use strata_cluster::cluster::NodeId;

use crate::action::error::ActionError;

/// Failure of one transport round-trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum TransportError {
    /// The target node could not be reached.
    ConnectFailed { node: NodeId },
    /// The target node is shutting down.
    NodeClosed { node: NodeId },
    /// No response arrived within the caller's deadline.
    ReceiveTimeout { node: NodeId, action: String },
    /// The target node has no handler for the action.
    NoHandler { node: NodeId, action: String },
    /// The remote handler ran and failed.
    Remote(ActionError),
    /// Request or response framing failed.
    Codec { message: String },
}

impl TransportError {
    pub fn is_connect_failure(&self) -> bool {
        matches!(self, TransportError::ConnectFailed { .. })
    }

    pub fn is_node_closed(&self) -> bool {
        matches!(self, TransportError::NodeClosed { .. })
    }

    /// Collapse into the action-level taxonomy for classification and
    /// reporting.
    pub fn into_action_error(self) -> ActionError {
        match self {
            TransportError::ConnectFailed { node } => ActionError::ConnectFailed {
                node,
                message: "node unreachable".to_string(),
            },
            TransportError::NodeClosed { node } => ActionError::NodeClosed { node },
            TransportError::ReceiveTimeout { node, action } => ActionError::internal(format!(
                "timed out waiting for [{action}] response from node [{node}]"
            )),
            TransportError::NoHandler { node, action } => {
                ActionError::internal(format!("no handler for [{action}] on node [{node}]"))
            }
            TransportError::Remote(cause) => cause,
            TransportError::Codec { message } => ActionError::internal(message),
        }
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::ConnectFailed { node } => {
                write!(f, "failed to connect to node [{node}]")
            }
            TransportError::NodeClosed { node } => write!(f, "node [{node}] closed"),
            TransportError::ReceiveTimeout { node, action } => {
                write!(f, "receive timeout for [{action}] on node [{node}]")
            }
            TransportError::NoHandler { node, action } => {
                write!(f, "no handler for [{action}] on node [{node}]")
            }
            TransportError::Remote(cause) => write!(f, "remote failure: {cause}"),
            TransportError::Codec { message } => write!(f, "codec failure: {message}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Encode a message for the wire.
pub fn encode_message<T: Serialize>(value: &T) -> Result<Bytes, TransportError> {
    serde_json::to_vec(value)
        .map(Bytes::from)
        .map_err(|err| TransportError::Codec {
            message: format!("encode: {err}"),
        })
}

/// Decode a message from the wire.
pub fn decode_message<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, TransportError> {
    serde_json::from_slice(bytes).map_err(|err| TransportError::Codec {
        message: format!("decode: {err}"),
    })
}

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Bytes, ActionError>> + Send>>;
pub type RequestHandler = Arc<dyn Fn(Bytes) -> HandlerFuture + Send + Sync>;

#[derive(Clone)]
struct HandlerEntry {
    handler: RequestHandler,
    force_execute: bool,
}

/// Bounded admission gate for action handlers. Force-executed handlers bypass
/// the bound entirely.
pub struct ActionExecutor {
    permits: Arc<Semaphore>,
}

impl ActionExecutor {
    pub fn new(capacity: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(capacity.max(1))),
        }
    }

    fn try_acquire(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().try_acquire_owned().ok()
    }

    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

/// Per-node handler table.
pub struct TransportRegistry {
    node: NodeId,
    executor: ActionExecutor,
    handlers: RwLock<HashMap<String, HandlerEntry>>,
    closed: AtomicBool,
}

impl TransportRegistry {
    pub fn new(node: NodeId, executor_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            node,
            executor: ActionExecutor::new(executor_capacity),
            handlers: RwLock::new(HashMap::new()),
            closed: AtomicBool::new(false),
        })
    }

    pub fn node(&self) -> NodeId {
        self.node
    }

    pub fn register(&self, action: &str, force_execute: bool, handler: RequestHandler) {
        let previous = self
            .handlers
            .write()
            .expect("handlers lock poisoned")
            .insert(
                action.to_string(),
                HandlerEntry {
                    handler,
                    force_execute,
                },
            );
        debug_assert!(previous.is_none(), "handler for [{action}] registered twice");
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    /// Run the handler registered for `action` against `body`.
    pub async fn dispatch(&self, action: &str, body: Bytes) -> Result<Bytes, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::NodeClosed { node: self.node });
        }
        let entry = {
            let handlers = self.handlers.read().expect("handlers lock poisoned");
            handlers.get(action).cloned()
        };
        let Some(entry) = entry else {
            return Err(TransportError::NoHandler {
                node: self.node,
                action: action.to_string(),
            });
        };
        let _permit = if entry.force_execute {
            None
        } else {
            match self.executor.try_acquire() {
                Some(permit) => Some(permit),
                None => {
                    return Err(TransportError::Remote(ActionError::ExecutorRejected {
                        action: action.to_string(),
                    }))
                }
            }
        };
        (entry.handler)(body).await.map_err(TransportError::Remote)
    }
}

/// Node-to-node request transport.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn send_request(
        &self,
        node: NodeId,
        action: &str,
        body: Bytes,
    ) -> Result<Bytes, TransportError>;
}

/// In-process transport connecting the registries of a local node set.
/// Reachability can be toggled per node to exercise connect failures.
#[derive(Default)]
pub struct MeshTransport {
    nodes: RwLock<HashMap<NodeId, Arc<TransportRegistry>>>,
    unreachable: RwLock<HashSet<NodeId>>,
}

impl MeshTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn register_node(&self, registry: Arc<TransportRegistry>) {
        self.nodes
            .write()
            .expect("mesh lock poisoned")
            .insert(registry.node(), registry);
    }

    pub fn remove_node(&self, node: NodeId) {
        self.nodes.write().expect("mesh lock poisoned").remove(&node);
    }

    pub fn set_reachable(&self, node: NodeId, reachable: bool) {
        let mut unreachable = self.unreachable.write().expect("mesh lock poisoned");
        if reachable {
            unreachable.remove(&node);
        } else {
            unreachable.insert(node);
        }
    }
}

#[async_trait]
impl Transport for MeshTransport {
    async fn send_request(
        &self,
        node: NodeId,
        action: &str,
        body: Bytes,
    ) -> Result<Bytes, TransportError> {
        if self
            .unreachable
            .read()
            .expect("mesh lock poisoned")
            .contains(&node)
        {
            return Err(TransportError::ConnectFailed { node });
        }
        let registry = {
            let nodes = self.nodes.read().expect("mesh lock poisoned");
            nodes.get(&node).cloned()
        };
        let Some(registry) = registry else {
            return Err(TransportError::ConnectFailed { node });
        };
        trace!(target_node = node, action, len = body.len(), "send request");
        registry.dispatch(action, body).await
    }
}
