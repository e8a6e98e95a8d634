//! Provider adapters: the contract the engine programs against, plus the
//! CLI-subprocess, HTTP, and mock implementations.
//!
//! An adapter is an opaque per-node session. The engine calls
//! `start / send / interrupt / resolve_approval / reset_session / close`;
//! the adapter emits [`AdapterEvent`]s back through the [`AdapterSink`] it
//! was constructed with. The runner drains those events from a per-session
//! queue in scheduler context, so adapters may emit from any task.

mod cli;
mod http;
mod mock;
mod spec;

pub use cli::CliAdapter;
pub use http::HttpAdapter;
pub use mock::{MockAdapter, MockProviderFactory, MockTurn};
pub use spec::{ProviderSpec, Transport, WireProtocol};

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use run_event::{ApprovalResolution, TokenUsage, ToolCall};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum ProviderError {
    #[error("provider executable not found: {0}")]
    CommandNotFound(String),

    #[error("spawn provider: {0}")]
    Spawn(std::io::Error),

    #[error("provider not started")]
    NotStarted,

    #[error("provider stdin closed: {0}")]
    Stdin(std::io::Error),

    #[error("http provider: {0}")]
    Http(#[from] reqwest::Error),

    #[error("{0}")]
    Other(String),
}

/// Whether a prompt carries the full header blocks or only mode + task.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PromptKind {
    Full,
    Delta,
}

/// One prompt send.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TurnRequest {
    pub prompt: String,
    pub prompt_kind: PromptKind,
    pub turn_id: String,
}

/// An approval request originating inside the adapter (the provider's own
/// permission prompt). The runner attaches run and node identity.
#[derive(Clone, Debug, PartialEq)]
pub struct AdapterApprovalRequest {
    pub id: String,
    pub tool: ToolCall,
    pub context: Option<String>,
}

/// Everything an adapter can report back to its runner.
#[derive(Clone, Debug, PartialEq)]
pub enum AdapterEvent {
    AssistantDelta { delta: String },
    AssistantFinal { content: String, tool_calls: Vec<ToolCall> },
    ThinkingDelta { delta: String },
    ThinkingFinal { content: String },
    Reasoning { content: String },
    ApprovalRequested(AdapterApprovalRequest),
    Usage(TokenUsage),
    SessionId(String),
    Interrupted,
    Disconnected,
    Error(String),
}

/// Sender half of a session's signal queue. Clone-cheap; safe to hand to
/// reader tasks. Emitting into a dropped session is a no-op.
#[derive(Clone)]
pub struct AdapterSink {
    tx: mpsc::UnboundedSender<AdapterEvent>,
}

impl AdapterSink {
    pub fn new(tx: mpsc::UnboundedSender<AdapterEvent>) -> Self {
        Self { tx }
    }

    /// Creates a sink plus the receiver the runner will drain.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<AdapterEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn emit(&self, event: AdapterEvent) {
        if self.tx.send(event).is_err() {
            tracing::debug!("adapter event dropped: session closed");
        }
    }

    /// A second sender handle, for engine-injected signals.
    pub fn sender(&self) -> mpsc::UnboundedSender<AdapterEvent> {
        self.tx.clone()
    }
}

/// The per-node session contract.
#[async_trait]
pub trait ProviderAdapter: Send + Sync {
    async fn start(&self) -> Result<(), ProviderError>;

    async fn send(&self, turn: TurnRequest) -> Result<(), ProviderError>;

    /// Best-effort: signal the provider to stop the current turn. The
    /// engine pushes its own `Interrupted` signal; this only notifies the
    /// provider side.
    async fn interrupt(&self) -> Result<(), ProviderError>;

    /// Forwards an operator decision for an approval the provider raised.
    async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: &ApprovalResolution,
    ) -> Result<(), ProviderError>;

    /// Clears the provider-side session; the next prompt will be full.
    async fn reset_session(&self) -> Result<(), ProviderError>;

    async fn close(&self) -> Result<(), ProviderError>;

    fn session_id(&self) -> Option<String>;
}

/// Context handed to a [`ProviderFactory`] when a node session starts.
pub struct AdapterContext {
    pub run_id: String,
    pub node_id: String,
    pub cwd: PathBuf,
    pub close_grace: std::time::Duration,
}

/// Creates adapters for node sessions. The engine installs a default
/// factory; tests inject scripted mocks.
pub trait ProviderFactory: Send + Sync {
    fn create(
        &self,
        spec: &ProviderSpec,
        ctx: &AdapterContext,
        sink: AdapterSink,
    ) -> Result<Box<dyn ProviderAdapter>, ProviderError>;
}

impl<T: ProviderFactory + ?Sized> ProviderFactory for std::sync::Arc<T> {
    fn create(
        &self,
        spec: &ProviderSpec,
        ctx: &AdapterContext,
        sink: AdapterSink,
    ) -> Result<Box<dyn ProviderAdapter>, ProviderError> {
        (**self).create(spec, ctx, sink)
    }
}

/// Default factory: `mock` echoes, `api:<url>` speaks HTTP, everything
/// else is a CLI subprocess.
pub struct DefaultProviderFactory;

impl ProviderFactory for DefaultProviderFactory {
    fn create(
        &self,
        spec: &ProviderSpec,
        ctx: &AdapterContext,
        sink: AdapterSink,
    ) -> Result<Box<dyn ProviderAdapter>, ProviderError> {
        match spec.transport {
            Transport::Api => Ok(Box::new(HttpAdapter::new(spec.clone(), sink))),
            Transport::Cli if spec.command.is_none() => Ok(Box::new(MockAdapter::echo(sink))),
            Transport::Cli => Ok(Box::new(CliAdapter::new(
                spec.clone(),
                ctx.cwd.clone(),
                ctx.close_grace,
                sink,
            ))),
        }
    }
}

/// Resolves a command name to an executable path, accepting absolute and
/// relative paths as-is.
pub(crate) fn resolve_command(command: &str, cwd: &Path) -> Result<PathBuf, ProviderError> {
    let candidate = Path::new(command);
    if candidate.components().count() > 1 {
        let path = if candidate.is_absolute() {
            candidate.to_path_buf()
        } else {
            cwd.join(candidate)
        };
        if path.exists() {
            return Ok(path);
        }
        return Err(ProviderError::CommandNotFound(command.to_string()));
    }
    which::which(command).map_err(|_| ProviderError::CommandNotFound(command.to_string()))
}
