//! The engine facade: every control-plane operation, the provider/session
//! wiring, and the graph-tool handlers.
//!
//! One [`Engine`] owns one data directory. Tests instantiate several side
//! by side; there is no process-wide state.

mod templates;

pub use templates::TemplateCache;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use run_event::{
    Approval, ApprovalResolution, Artifact, ArtifactKind, ArtifactMetadata, ConnectionState,
    ConnectionStatus, Edge, EdgeManagement, EdgeType, Envelope, EnvelopePayload, Event,
    EventEnvelope, GlobalMode, MessageRole, NodeCapabilities, NodePatch, NodePermissions,
    NodeState, NodeStatus, OrchestrationMode, RunPatch, RunState, RunStatus, UserMessage,
};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;

use crate::approval::{ApprovalOrigin, ApprovalQueue};
use crate::error::EngineError;
use crate::model::NodeRuntime;
use crate::provider::{DefaultProviderFactory, ProviderFactory};
use crate::runner::SessionManager;
use crate::store::{ArtifactStore, RunHandle, RunProjection, RunStore};
use crate::tools::{CreateEdgeArgs, GraphTools, SendHandoffArgs, SpawnNodeArgs};

/// Engine tunables, read from the environment after `.env`/XDG loading.
#[derive(Clone, Debug)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub tick_interval: Duration,
    pub stall_threshold: u32,
    pub turn_timeout: Duration,
    pub command_timeout: Duration,
    pub close_grace: Duration,
    pub templates_dir: Option<PathBuf>,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".trellis"),
            tick_interval: Duration::from_millis(250),
            stall_threshold: crate::safety::DEFAULT_STALL_THRESHOLD,
            turn_timeout: Duration::from_secs(30 * 60),
            command_timeout: Duration::from_secs(30 * 60),
            close_grace: Duration::from_secs(2),
            templates_dir: None,
        }
    }
}

impl EngineSettings {
    /// Reads settings from `TRELLIS_*` environment variables, defaulting
    /// anything unset.
    pub fn from_env() -> Self {
        fn duration_var(key: &str, default: Duration, unit_ms: bool) -> Duration {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse::<u64>().ok())
                .map(|n| {
                    if unit_ms {
                        Duration::from_millis(n)
                    } else {
                        Duration::from_secs(n)
                    }
                })
                .unwrap_or(default)
        }
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("TRELLIS_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            tick_interval: duration_var("TRELLIS_TICK_MS", defaults.tick_interval, true),
            stall_threshold: std::env::var("TRELLIS_STALL_THRESHOLD")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.stall_threshold),
            turn_timeout: duration_var("TRELLIS_TURN_TIMEOUT_SECS", defaults.turn_timeout, false),
            command_timeout: duration_var(
                "TRELLIS_COMMAND_TIMEOUT_SECS",
                defaults.command_timeout,
                false,
            ),
            close_grace: defaults.close_grace,
            templates_dir: std::env::var("TRELLIS_TEMPLATES_DIR").ok().map(PathBuf::from),
        }
    }
}

// -----------------------------------------------------------------------------
// Requests
// -----------------------------------------------------------------------------

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRun {
    #[serde(default)]
    pub mode: Option<OrchestrationMode>,
    #[serde(default)]
    pub global_mode: Option<GlobalMode>,
    #[serde(default)]
    pub cwd: Option<String>,
}

#[derive(Clone, Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRun {
    #[serde(default)]
    pub status: Option<RunStatus>,
    #[serde(default)]
    pub mode: Option<OrchestrationMode>,
    #[serde(default)]
    pub global_mode: Option<GlobalMode>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateNode {
    pub label: String,
    #[serde(default)]
    pub role_template: Option<String>,
    #[serde(default)]
    pub provider: Option<String>,
    #[serde(default)]
    pub capabilities: Option<NodeCapabilities>,
    #[serde(default)]
    pub permissions: Option<NodePermissions>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateEdge {
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(rename = "type", default)]
    pub edge_type: Option<EdgeType>,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostMessage {
    #[serde(default)]
    pub node_id: Option<String>,
    pub content: String,
    #[serde(default)]
    pub interrupt: bool,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordArtifact {
    pub node_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub content: String,
    #[serde(default)]
    pub metadata: Option<ArtifactMetadata>,
}

#[derive(Clone, Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeliverEnvelope {
    pub from: String,
    pub to: String,
    pub payload: EnvelopePayload,
}

/// Role-template name whose nodes are treated as orchestrators
/// (unaddressed messages, AUTO-mode self-continuation).
pub const ORCHESTRATOR_ROLE: &str = "orchestrator";

const DEFAULT_ROLE_TEMPLATE: &str = "implementer";
const DEFAULT_PROVIDER: &str = "mock";

// -----------------------------------------------------------------------------
// Engine
// -----------------------------------------------------------------------------

pub(crate) struct EngineInner {
    pub settings: EngineSettings,
    pub store: RunStore,
    pub sessions: SessionManager,
    pub approvals: Arc<ApprovalQueue>,
    pub templates: TemplateCache,
    pub factory: Box<dyn ProviderFactory>,
    pub shutdown: CancellationToken,
}

/// The control plane. Clone-cheap handle over one engine instance.
#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
    scheduler: Arc<std::sync::Mutex<Option<tokio::task::JoinHandle<()>>>>,
}

impl Engine {
    pub fn new(settings: EngineSettings) -> Self {
        Self::with_factory(settings, Box::new(DefaultProviderFactory))
    }

    pub fn with_factory(settings: EngineSettings, factory: Box<dyn ProviderFactory>) -> Self {
        let templates = TemplateCache::new(settings.templates_dir.clone());
        let store = RunStore::new(settings.data_dir.clone());
        Self {
            inner: Arc::new(EngineInner {
                settings,
                store,
                sessions: SessionManager::new(),
                approvals: Arc::new(ApprovalQueue::new()),
                templates,
                factory,
                shutdown: CancellationToken::new(),
            }),
            scheduler: Arc::new(std::sync::Mutex::new(None)),
        }
    }

    pub fn settings(&self) -> &EngineSettings {
        &self.inner.settings
    }

    /// Restores persisted runs from the data directory (cold start).
    pub fn open_existing(&self) -> usize {
        self.inner.store.open_existing().len()
    }

    /// Starts the scheduler tick loop.
    pub fn start(&self) {
        let mut slot = self.scheduler.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(crate::scheduler::spawn(Arc::clone(&self.inner)));
        }
    }

    /// Stops the scheduler and closes every session.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handle = self
            .scheduler
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for run in self.inner.store.handles() {
            self.inner.sessions.close_for_run(run.run_id()).await;
        }
    }

    /// One manual scheduler tick, for tests driving the engine without the
    /// background loop.
    pub async fn tick(&self) {
        crate::scheduler::tick(&self.inner).await;
    }

    // -- runs ----------------------------------------------------------------

    pub async fn create_run(&self, req: CreateRun) -> Result<RunState, EngineError> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let handle = self.inner.store.create(&run_id)?;
        let mode = req.mode.unwrap_or(OrchestrationMode::Interactive);
        let global_mode = req.global_mode.unwrap_or(GlobalMode::Implementation);
        let cwd = req.cwd.unwrap_or_else(|| ".".to_string());
        handle
            .publish_all(vec![
                Event::RunPatch {
                    patch: RunPatch {
                        status: Some(RunStatus::Running),
                        mode: Some(mode),
                        global_mode: Some(global_mode),
                        cwd: Some(cwd),
                        usage: None,
                    },
                },
                Event::RunMode { mode, global_mode },
            ])
            .await?;
        Ok(handle.projection().await.run)
    }

    pub async fn get_run(&self, run_id: &str) -> Result<RunProjection, EngineError> {
        Ok(self.inner.handle(run_id)?.projection().await)
    }

    pub async fn list_runs(&self) -> Vec<RunProjection> {
        let handles = self.inner.store.handles();
        let mut projections =
            futures::future::join_all(handles.iter().map(|h| h.projection())).await;
        projections.sort_by(|a, b| a.run.created_at.cmp(&b.run.created_at));
        projections
    }

    pub async fn update_run(&self, run_id: &str, req: UpdateRun) -> Result<RunState, EngineError> {
        let handle = self.inner.handle(run_id)?;
        if let Some(status) = req.status {
            match status {
                RunStatus::Paused => self.inner.pause_run(&handle).await?,
                RunStatus::Running => self.inner.resume_run(&handle).await?,
                RunStatus::Stopped => self.inner.stop_run(&handle).await?,
                RunStatus::Failed => {
                    handle
                        .publish(Event::RunPatch {
                            patch: RunPatch {
                                status: Some(RunStatus::Failed),
                                ..Default::default()
                            },
                        })
                        .await?;
                }
            }
        }
        if req.mode.is_some() || req.global_mode.is_some() {
            let current = handle.projection().await.run;
            handle
                .publish(Event::RunMode {
                    mode: req.mode.unwrap_or(current.mode),
                    global_mode: req.global_mode.unwrap_or(current.global_mode),
                })
                .await?;
        }
        Ok(handle.projection().await.run)
    }

    pub async fn delete_run(&self, run_id: &str) -> Result<(), EngineError> {
        let handle = self.inner.handle(run_id)?;
        handle.cancel_token().cancel();
        self.inner.sessions.close_for_run(run_id).await;
        self.inner.approvals.drop_for_run(run_id);
        self.inner.store.remove(run_id)?;
        Ok(())
    }

    // -- nodes ---------------------------------------------------------------

    pub async fn create_node(&self, run_id: &str, req: CreateNode) -> Result<NodeState, EngineError> {
        self.inner.create_node(run_id, req).await
    }

    pub async fn update_node(
        &self,
        run_id: &str,
        node_id: &str,
        mut patch: NodePatch,
    ) -> Result<NodeState, EngineError> {
        let handle = self.inner.handle(run_id)?;
        let node = self.inner.node(&handle, node_id).await?;
        let provider_changed = patch
            .provider
            .as_ref()
            .map(|p| *p != node.provider)
            .unwrap_or(false);
        if provider_changed {
            self.inner.sessions.close(node_id).await;
            patch.connection = Some(ConnectionState {
                status: ConnectionStatus::Disconnected,
                streaming: false,
                heartbeat_at: None,
            });
        }
        handle
            .publish(Event::NodePatch {
                node_id: node_id.to_string(),
                patch,
            })
            .await?;
        self.inner.node(&handle, node_id).await
    }

    pub async fn delete_node(&self, run_id: &str, node_id: &str) -> Result<(), EngineError> {
        let handle = self.inner.handle(run_id)?;
        self.inner.node(&handle, node_id).await?;
        self.inner.sessions.close(node_id).await;
        self.inner.approvals.drop_for_node(node_id);
        handle.delete_node(node_id).await?;
        Ok(())
    }

    /// Clears inbox, summary, todos, and stall counters; resets the
    /// provider session.
    pub async fn reset_node(&self, run_id: &str, node_id: &str) -> Result<(), EngineError> {
        let handle = self.inner.handle(run_id)?;
        self.inner.node(&handle, node_id).await?;
        let _ = handle.drain_inbox(node_id).await?;
        handle
            .publish(Event::NodePatch {
                node_id: node_id.to_string(),
                patch: NodePatch {
                    summary: Some(String::new()),
                    todos: Some(Vec::new()),
                    status: Some(NodeStatus::Idle),
                    ..Default::default()
                },
            })
            .await?;
        handle.with_runtime(node_id, NodeRuntime::reset).await;
        self.inner.sessions.reset(node_id).await;
        Ok(())
    }

    // -- edges ---------------------------------------------------------------

    pub async fn create_edge(&self, run_id: &str, req: CreateEdge) -> Result<Edge, EngineError> {
        self.inner.create_edge_checked(run_id, req).await
    }

    pub async fn delete_edge(&self, run_id: &str, edge_id: &str) -> Result<(), EngineError> {
        let handle = self.inner.handle(run_id)?;
        let exists = handle
            .with_state(|p, _| p.edges.contains_key(edge_id))
            .await;
        if !exists {
            return Err(EngineError::EdgeNotFound(edge_id.to_string()));
        }
        handle
            .publish(Event::EdgeDeleted {
                edge_id: edge_id.to_string(),
            })
            .await?;
        Ok(())
    }

    // -- messages & envelopes ------------------------------------------------

    pub async fn post_message(
        &self,
        run_id: &str,
        req: PostMessage,
    ) -> Result<UserMessage, EngineError> {
        let handle = self.inner.handle(run_id)?;
        let projection = handle.projection().await;
        let node_id = match req.node_id {
            Some(node_id) => {
                if !projection.nodes.contains_key(&node_id) {
                    return Err(EngineError::NodeNotFound(node_id));
                }
                node_id
            }
            None => projection
                .nodes
                .values()
                .find(|n| n.role_template == ORCHESTRATOR_ROLE)
                .map(|n| n.id.clone())
                .ok_or_else(|| {
                    EngineError::Invalid("no orchestrator node to address".to_string())
                })?,
        };
        let message = UserMessage {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: Some(node_id.clone()),
            role: MessageRole::User,
            content: req.content,
            created_at: Utc::now(),
            interrupt: req.interrupt,
        };
        handle.post_user_message(message.clone()).await?;
        if req.interrupt {
            let running = projection
                .nodes
                .get(&node_id)
                .map(|n| n.status == NodeStatus::Running)
                .unwrap_or(false);
            if running {
                self.inner.sessions.interrupt(&node_id).await;
            }
        }
        Ok(message)
    }

    pub async fn deliver_envelope(
        &self,
        run_id: &str,
        req: DeliverEnvelope,
    ) -> Result<Envelope, EngineError> {
        let handle = self.inner.handle(run_id)?;
        let exists = handle
            .with_state(|p, _| p.nodes.contains_key(&req.to))
            .await;
        if !exists {
            return Err(EngineError::NodeNotFound(req.to));
        }
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            from: req.from,
            to: req.to,
            created_at: Utc::now(),
            payload: req.payload,
        };
        handle.deliver_envelope(envelope.clone()).await?;
        Ok(envelope)
    }

    // -- approvals -----------------------------------------------------------

    pub async fn list_approvals(&self, run_id: &str) -> Result<Vec<Approval>, EngineError> {
        let handle = self.inner.handle(run_id)?;
        Ok(handle
            .with_state(|p, _| p.approvals.values().cloned().collect())
            .await)
    }

    /// Resolves a pending approval. An unknown id is dropped with a
    /// warning; never an error, and never a duplicate approval.resolved.
    pub async fn resolve_approval(
        &self,
        approval_id: &str,
        resolution: ApprovalResolution,
    ) -> Result<(), EngineError> {
        let Some(entry) = self.inner.approvals.remove(approval_id) else {
            tracing::warn!(approval_id = %approval_id, "resolution for unknown approval, dropping");
            return Ok(());
        };
        let run_id = entry.approval.run_id.clone();
        let node_id = entry.approval.node_id.clone();
        let handle = self.inner.handle(&run_id)?;
        handle
            .publish(Event::ApprovalResolved {
                approval_id: approval_id.to_string(),
                node_id: node_id.clone(),
                resolution: resolution.clone(),
            })
            .await?;
        match entry.origin {
            ApprovalOrigin::Adapter => {
                if let Some(session) = self.inner.sessions.get(&node_id) {
                    if let Err(e) = session.adapter.resolve_approval(approval_id, &resolution).await
                    {
                        tracing::warn!(error = %e, "forwarding approval to adapter failed");
                    }
                }
            }
            ApprovalOrigin::ToolQueue => {
                if let Some(session) = self.inner.sessions.get(&node_id) {
                    session
                        .state
                        .lock()
                        .await
                        .resolutions
                        .insert(approval_id.to_string(), resolution);
                }
            }
        }
        // blocked → idle; the pending turn resumes next tick.
        handle
            .publish(Event::NodePatch {
                node_id: node_id.clone(),
                patch: NodePatch {
                    status: Some(NodeStatus::Idle),
                    ..Default::default()
                },
            })
            .await?;
        handle
            .with_runtime(&node_id, |rt| rt.pending_turn = true)
            .await;
        Ok(())
    }

    // -- artifacts -----------------------------------------------------------

    pub async fn record_artifact(
        &self,
        run_id: &str,
        req: RecordArtifact,
    ) -> Result<Artifact, EngineError> {
        let handle = self.inner.handle(run_id)?;
        self.inner.node(&handle, &req.node_id).await?;
        let artifact_id = uuid::Uuid::new_v4().to_string();
        let store = ArtifactStore::new(handle.artifacts_dir());
        let path = store.write(&artifact_id, &req.name, req.content.as_bytes())?;
        let artifact = Artifact {
            id: artifact_id,
            run_id: run_id.to_string(),
            node_id: req.node_id,
            kind: req.kind,
            name: req.name,
            path: path.to_string_lossy().into_owned(),
            created_at: Utc::now(),
            metadata: req.metadata,
        };
        handle
            .publish(Event::ArtifactCreated {
                artifact: artifact.clone(),
            })
            .await?;
        Ok(artifact)
    }

    // -- events --------------------------------------------------------------

    /// Tail-subscribes to one run's event stream.
    pub async fn subscribe(
        &self,
        run_id: &str,
    ) -> Result<broadcast::Receiver<EventEnvelope>, EngineError> {
        Ok(self.inner.handle(run_id)?.subscribe())
    }

    /// Full event log of one run, in append order.
    pub async fn read_events(&self, run_id: &str) -> Result<Vec<EventEnvelope>, EngineError> {
        Ok(self.inner.handle(run_id)?.read_all().await?)
    }

}

impl EngineInner {
    /// Graph-tool handlers bound to this engine, for the runner.
    pub(crate) fn graph_tools(self: &Arc<Self>) -> Arc<dyn GraphTools> {
        Arc::new(EngineGraph {
            inner: Arc::clone(self),
        })
    }

    pub(crate) fn handle(&self, run_id: &str) -> Result<Arc<RunHandle>, EngineError> {
        self.store
            .get(run_id)
            .ok_or_else(|| EngineError::RunNotFound(run_id.to_string()))
    }

    pub(crate) async fn node(
        &self,
        handle: &RunHandle,
        node_id: &str,
    ) -> Result<NodeState, EngineError> {
        handle
            .with_state(|p, _| p.nodes.get(node_id).cloned())
            .await
            .ok_or_else(|| EngineError::NodeNotFound(node_id.to_string()))
    }

    async fn create_node(&self, run_id: &str, req: CreateNode) -> Result<NodeState, EngineError> {
        let handle = self.handle(run_id)?;
        let node_id = uuid::Uuid::new_v4().to_string();
        handle
            .publish(Event::NodePatch {
                node_id: node_id.clone(),
                patch: NodePatch {
                    label: Some(req.label),
                    role_template: Some(
                        req.role_template
                            .unwrap_or_else(|| DEFAULT_ROLE_TEMPLATE.to_string()),
                    ),
                    provider: Some(req.provider.unwrap_or_else(|| DEFAULT_PROVIDER.to_string())),
                    status: Some(NodeStatus::Idle),
                    capabilities: req.capabilities,
                    permissions: req.permissions,
                    ..Default::default()
                },
            })
            .await?;
        self.node(&handle, &node_id).await
    }

    async fn create_edge_checked(
        &self,
        run_id: &str,
        req: CreateEdge,
    ) -> Result<Edge, EngineError> {
        let handle = self.handle(run_id)?;
        let endpoints_exist = handle
            .with_state(|p, _| {
                p.nodes.contains_key(&req.from) && p.nodes.contains_key(&req.to)
            })
            .await;
        if !endpoints_exist {
            return Err(EngineError::Invalid(format!(
                "edge endpoints must exist: {} -> {}",
                req.from, req.to
            )));
        }
        let edge = Edge {
            id: uuid::Uuid::new_v4().to_string(),
            from: req.from,
            to: req.to,
            bidirectional: req.bidirectional,
            edge_type: req.edge_type.unwrap_or_default(),
            label: req.label,
        };
        handle
            .publish(Event::EdgeCreated { edge: edge.clone() })
            .await?;
        Ok(edge)
    }

    async fn pause_run(&self, handle: &Arc<RunHandle>) -> Result<(), EngineError> {
        handle
            .publish(Event::RunPatch {
                patch: RunPatch {
                    status: Some(RunStatus::Paused),
                    ..Default::default()
                },
            })
            .await?;
        let running: Vec<String> = handle
            .with_state(|p, runtime| {
                let ids: Vec<String> = p
                    .nodes
                    .values()
                    .filter(|n| n.status == NodeStatus::Running)
                    .map(|n| n.id.clone())
                    .collect();
                for node_id in &ids {
                    runtime.entry(node_id.clone()).or_default().interrupted_by_pause = true;
                }
                ids
            })
            .await;
        for node_id in running {
            self.sessions.interrupt(&node_id).await;
        }
        Ok(())
    }

    async fn resume_run(&self, handle: &Arc<RunHandle>) -> Result<(), EngineError> {
        handle
            .publish(Event::RunPatch {
                patch: RunPatch {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            })
            .await?;
        // A resume is the explicit operator action that clears a stall:
        // stalled nodes return to idle with fresh repeat counters.
        let stalled: Vec<String> = handle
            .with_state(|p, runtime| {
                let ids: Vec<String> = p
                    .nodes
                    .values()
                    .filter(|n| n.status == NodeStatus::Blocked && n.summary == "stalled")
                    .map(|n| n.id.clone())
                    .collect();
                for node_id in &ids {
                    runtime.entry(node_id.clone()).or_default().stall.reset();
                }
                ids
            })
            .await;
        for node_id in stalled {
            handle
                .publish(Event::NodePatch {
                    node_id,
                    patch: NodePatch {
                        status: Some(NodeStatus::Idle),
                        ..Default::default()
                    },
                })
                .await?;
        }
        let interrupted: Vec<String> = handle
            .with_state(|_, runtime| {
                runtime
                    .iter_mut()
                    .filter(|(_, rt)| rt.interrupted_by_pause)
                    .map(|(node_id, rt)| {
                        rt.interrupted_by_pause = false;
                        node_id.clone()
                    })
                    .collect()
            })
            .await;
        for node_id in interrupted {
            let message = UserMessage {
                id: uuid::Uuid::new_v4().to_string(),
                run_id: handle.run_id().to_string(),
                node_id: Some(node_id),
                role: MessageRole::User,
                content: "Continue.".to_string(),
                created_at: Utc::now(),
                interrupt: false,
            };
            handle.post_user_message(message).await?;
        }
        Ok(())
    }

    async fn stop_run(&self, handle: &Arc<RunHandle>) -> Result<(), EngineError> {
        handle
            .publish(Event::RunPatch {
                patch: RunPatch {
                    status: Some(RunStatus::Stopped),
                    ..Default::default()
                },
            })
            .await?;
        handle.cancel_token().cancel();
        self.sessions.close_for_run(handle.run_id()).await;
        Ok(())
    }
}

// -----------------------------------------------------------------------------
// Graph tools
// -----------------------------------------------------------------------------

struct EngineGraph {
    inner: Arc<EngineInner>,
}

#[async_trait]
impl GraphTools for EngineGraph {
    async fn spawn_node(
        &self,
        run_id: &str,
        origin_node: &str,
        args: SpawnNodeArgs,
    ) -> Result<Value, String> {
        if args.label.trim().is_empty() {
            return Err("spawn_node requires a label".to_string());
        }
        let origin_provider = {
            let handle = self.inner.handle(run_id).map_err(|e| e.to_string())?;
            self.inner
                .node(&handle, origin_node)
                .await
                .map_err(|e| e.to_string())?
                .provider
        };
        let node = self
            .inner
            .create_node(
                run_id,
                CreateNode {
                    label: args.label,
                    role_template: args.role_template,
                    provider: args.provider.or(Some(origin_provider)),
                    capabilities: args.capabilities,
                    permissions: None,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        let edge = self
            .inner
            .create_edge_checked(
                run_id,
                CreateEdge {
                    from: origin_node.to_string(),
                    to: node.id.clone(),
                    bidirectional: false,
                    edge_type: Some(EdgeType::Handoff),
                    label: None,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        if let Some(task) = args.task {
            let handle = self.inner.handle(run_id).map_err(|e| e.to_string())?;
            let envelope = Envelope {
                id: uuid::Uuid::new_v4().to_string(),
                from: origin_node.to_string(),
                to: node.id.clone(),
                created_at: Utc::now(),
                payload: EnvelopePayload {
                    message: task,
                    ..Default::default()
                },
            };
            handle
                .deliver_envelope(envelope)
                .await
                .map_err(|e| e.to_string())?;
        }
        Ok(json!({ "nodeId": node.id, "edgeId": edge.id }))
    }

    async fn create_edge(
        &self,
        run_id: &str,
        origin_node: &str,
        args: CreateEdgeArgs,
    ) -> Result<Value, String> {
        let from = args.from.unwrap_or_else(|| origin_node.to_string());
        let handle = self.inner.handle(run_id).map_err(|e| e.to_string())?;
        let origin = self
            .inner
            .node(&handle, origin_node)
            .await
            .map_err(|e| e.to_string())?;
        if origin.capabilities.edge_management == EdgeManagement::SelfOnly
            && from != origin_node
            && args.to != origin_node
        {
            return Err("edge management 'self' only covers edges touching this node".to_string());
        }
        let edge = self
            .inner
            .create_edge_checked(
                run_id,
                CreateEdge {
                    from,
                    to: args.to,
                    bidirectional: args.bidirectional,
                    edge_type: args.edge_type,
                    label: args.label,
                },
            )
            .await
            .map_err(|e| e.to_string())?;
        Ok(json!({ "edgeId": edge.id }))
    }

    async fn send_handoff(
        &self,
        run_id: &str,
        origin_node: &str,
        args: SendHandoffArgs,
    ) -> Result<Value, String> {
        let handle = self.inner.handle(run_id).map_err(|e| e.to_string())?;
        let target = handle
            .with_state(|p, _| resolve_handoff_target(p, origin_node, args.to.as_deref()))
            .await
            .ok_or_else(|| match &args.to {
                Some(to) => format!("handoff target not found: {}", to),
                None => "no outgoing handoff edge to resolve a default target".to_string(),
            })?;
        let envelope = Envelope {
            id: uuid::Uuid::new_v4().to_string(),
            from: origin_node.to_string(),
            to: target.clone(),
            created_at: Utc::now(),
            payload: EnvelopePayload {
                message: args.message,
                structured: args.structured,
                artifacts: args.artifacts,
                status: args.status,
                response: args.response,
                context_ref: args.context_ref,
            },
        };
        let response_required = envelope
            .payload
            .response
            .as_ref()
            .map(|r| r.expectation == run_event::ResponseExpectation::Required)
            .unwrap_or(false);
        handle
            .deliver_envelope(envelope.clone())
            .await
            .map_err(|e| e.to_string())?;
        if response_required {
            handle
                .with_runtime(origin_node, |rt| {
                    if !rt.awaiting_response_from.contains(&target) {
                        rt.awaiting_response_from.push(target.clone());
                    }
                })
                .await;
        }
        Ok(json!({ "envelopeId": envelope.id, "to": target }))
    }
}

/// Resolves a handoff target by node id, then by unique label, then (when
/// unaddressed) by the sender's first outgoing handoff edge.
fn resolve_handoff_target(
    projection: &RunProjection,
    origin_node: &str,
    to: Option<&str>,
) -> Option<String> {
    match to {
        Some(to) => {
            if projection.nodes.contains_key(to) {
                return Some(to.to_string());
            }
            let mut by_label = projection.nodes.values().filter(|n| n.label == to);
            match (by_label.next(), by_label.next()) {
                (Some(node), None) => Some(node.id.clone()),
                _ => None,
            }
        }
        None => projection
            .edges
            .values()
            .filter(|e| e.from == origin_node && e.edge_type == EdgeType::Handoff)
            .map(|e| e.to.clone())
            .next(),
    }
}
