//! Seam to the external agent computation.
//!
//! The engine treats the computation as an opaque unit of work that yields a
//! sequence of typed progress notifications and eventually terminates. What
//! the computation actually does (graph execution, LLM calls, tools) lives
//! behind [`AgentExecutor`].

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde_json::{Value, json};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum AgentError {
    /// Raised by the computation as a client-facing error; status and
    /// message are passed through unchanged.
    #[error("{message}")]
    UserFacing { status: u16, message: String },
    #[error("{0}")]
    Internal(String),
}

/// Progress notification type tags, matching the stored `event` column for
/// agent-produced events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NotificationKind {
    Values,
    Updates,
    Messages,
    Events,
    Debug,
    Custom,
}

impl NotificationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationKind::Values => "values",
            NotificationKind::Updates => "updates",
            NotificationKind::Messages => "messages",
            NotificationKind::Events => "events",
            NotificationKind::Debug => "debug",
            NotificationKind::Custom => "custom",
        }
    }
}

/// One unit of progress emitted by the computation. `namespace` qualifies
/// notifications emitted from a nested subgraph.
#[derive(Debug, Clone)]
pub struct Notification {
    pub kind: NotificationKind,
    pub namespace: Option<Vec<String>>,
    pub data: Value,
}

impl Notification {
    pub fn new(kind: NotificationKind, data: Value) -> Self {
        Self {
            kind,
            namespace: None,
            data,
        }
    }

    pub fn with_namespace(mut self, namespace: Vec<String>) -> Self {
        self.namespace = Some(namespace);
        self
    }
}

pub type NotificationStream = Pin<Box<dyn Stream<Item = Result<Notification, AgentError>> + Send>>;

/// Everything the computation gets to see about the run.
#[derive(Debug, Clone)]
pub struct AgentRequest {
    pub run_id: Uuid,
    pub thread_id: Uuid,
    pub assistant_id: Option<String>,
    pub input: Value,
    pub config: Option<Value>,
    pub context: Option<Value>,
}

#[async_trait]
pub trait AgentExecutor: Send + Sync + 'static {
    /// Start the computation and return its notification sequence. The
    /// token signals cooperative cancellation; implementations should stop
    /// producing and release resources when it fires.
    async fn execute(
        &self,
        request: AgentRequest,
        cancel: CancellationToken,
    ) -> Result<NotificationStream, AgentError>;
}

/// Default executor: echoes the input back as a single `values` snapshot.
/// Keeps the server runnable without an external graph engine attached.
pub struct EchoAgent;

#[async_trait]
impl AgentExecutor for EchoAgent {
    async fn execute(
        &self,
        request: AgentRequest,
        _cancel: CancellationToken,
    ) -> Result<NotificationStream, AgentError> {
        let snapshot = Notification::new(NotificationKind::Values, json!(request.input));
        Ok(Box::pin(futures::stream::iter(vec![Ok(snapshot)])))
    }
}
