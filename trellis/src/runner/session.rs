//! Node sessions: the adapter, its signal queue, and per-session state
//! (prompt-kind machine, suspended turn, cached approval resolutions).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use run_event::{ApprovalResolution, NodeState, RunState, ToolCall};
use tokio::sync::{mpsc, Mutex};

use crate::provider::{
    AdapterContext, AdapterEvent, AdapterSink, PromptKind, ProviderAdapter, ProviderError,
    ProviderFactory, ProviderSpec,
};

/// Per-session prompt-kind state machine. Every mutation goes through a
/// method so the full/delta decision lives in exactly one place.
#[derive(Debug, Default)]
pub struct SessionStateManager {
    full_sent: bool,
    last_header_hash: Option<String>,
    force_full: bool,
}

impl SessionStateManager {
    /// Chooses the prompt kind for the next send: full if the session is
    /// new, was reset, the adapter disconnected since the last send, the
    /// header hash changed, or the protocol is stateless.
    pub fn decide(&self, header_hash: &str, stateful: bool) -> PromptKind {
        if !stateful
            || !self.full_sent
            || self.force_full
            || self.last_header_hash.as_deref() != Some(header_hash)
        {
            PromptKind::Full
        } else {
            PromptKind::Delta
        }
    }

    /// Records a successful send so later turns can elide the header.
    pub fn note_sent(&mut self, header_hash: &str) {
        self.full_sent = true;
        self.force_full = false;
        self.last_header_hash = Some(header_hash.to_string());
    }

    /// The adapter reported disconnected; the next prompt is full.
    pub fn mark_disconnected(&mut self) {
        self.force_full = true;
    }

    /// Session reset: back to the fresh-session state.
    pub fn reset(&mut self) {
        *self = SessionStateManager::default();
    }
}

/// A turn suspended mid-flight waiting on an approval: the remaining tool
/// queue, accumulated message, accumulated tool errors, and which calls
/// were already proposed (so resumes don't re-emit tool.proposed).
#[derive(Clone, Debug)]
pub struct PendingTurn {
    pub turn_id: String,
    pub message: String,
    pub queue: VecDeque<ToolCall>,
    pub errors: Vec<String>,
    pub proposed: HashSet<String>,
}

/// Mutable per-session state behind one lock.
#[derive(Default)]
pub struct SessionState {
    pub prompts: SessionStateManager,
    pub pending: Option<PendingTurn>,
    pub resolutions: HashMap<String, ApprovalResolution>,
}

/// One node's provider session: adapter plus the signal queue its events
/// drain into.
pub struct NodeSession {
    pub node_id: String,
    pub run_id: String,
    pub spec: ProviderSpec,
    pub adapter: Box<dyn ProviderAdapter>,
    pub state: Mutex<SessionState>,
    signal_tx: mpsc::UnboundedSender<AdapterEvent>,
    signals: Mutex<mpsc::UnboundedReceiver<AdapterEvent>>,
}

impl NodeSession {
    /// Injects a signal as if the adapter emitted it (engine-side
    /// interrupts).
    pub fn push_signal(&self, event: AdapterEvent) {
        let _ = self.signal_tx.send(event);
    }

    /// Next signal, or `None` when `timeout` elapses first.
    pub async fn recv_signal(&self, timeout: Duration) -> Option<AdapterEvent> {
        let mut signals = self.signals.lock().await;
        tokio::time::timeout(timeout, signals.recv())
            .await
            .ok()
            .flatten()
    }

    /// Discards everything queued (close / reset).
    pub async fn drain_signals(&self) {
        let mut signals = self.signals.lock().await;
        while signals.try_recv().is_ok() {}
    }
}

/// Session cache keyed by node id.
#[derive(Default)]
pub struct SessionManager {
    sessions: DashMap<String, Arc<NodeSession>>,
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, node_id: &str) -> Option<Arc<NodeSession>> {
        self.sessions.get(node_id).map(|s| Arc::clone(&s))
    }

    /// Returns the cached session or resolves the provider spec, creates
    /// the adapter, starts it, and caches the session.
    pub async fn get_or_create(
        &self,
        factory: &dyn ProviderFactory,
        run: &RunState,
        node: &NodeState,
        close_grace: Duration,
    ) -> Result<Arc<NodeSession>, ProviderError> {
        if let Some(session) = self.get(&node.id) {
            return Ok(session);
        }
        let spec = ProviderSpec::resolve(&node.provider);
        let (sink, rx) = AdapterSink::channel();
        let signal_tx = sink_sender(&sink);
        let ctx = AdapterContext {
            run_id: run.id.clone(),
            node_id: node.id.clone(),
            cwd: if run.cwd.is_empty() {
                std::env::temp_dir()
            } else {
                std::path::PathBuf::from(&run.cwd)
            },
            close_grace,
        };
        let adapter = factory.create(&spec, &ctx, sink)?;
        adapter.start().await?;
        let session = Arc::new(NodeSession {
            node_id: node.id.clone(),
            run_id: run.id.clone(),
            spec,
            adapter,
            state: Mutex::new(SessionState::default()),
            signal_tx,
            signals: Mutex::new(rx),
        });
        self.sessions
            .insert(node.id.clone(), Arc::clone(&session));
        Ok(session)
    }

    /// Closes and drops one node's session. Close failures are warnings;
    /// teardown continues.
    pub async fn close(&self, node_id: &str) {
        if let Some((_, session)) = self.sessions.remove(node_id) {
            // A turn mid-read holds the signal queue; the interrupted
            // signal unwinds it before the drain takes the lock.
            session.push_signal(AdapterEvent::Interrupted);
            session.drain_signals().await;
            if let Err(e) = session.adapter.close().await {
                tracing::warn!(node_id = %node_id, error = %e, "adapter close failed");
            }
        }
    }

    /// Closes every session belonging to a run.
    pub async fn close_for_run(&self, run_id: &str) {
        let node_ids: Vec<String> = self
            .sessions
            .iter()
            .filter(|s| s.run_id == run_id)
            .map(|s| s.node_id.clone())
            .collect();
        for node_id in node_ids {
            self.close(&node_id).await;
        }
    }

    /// Clears the provider session and the prompt state; the next turn
    /// sends a full prompt.
    pub async fn reset(&self, node_id: &str) {
        if let Some(session) = self.get(node_id) {
            if let Err(e) = session.adapter.reset_session().await {
                tracing::warn!(node_id = %node_id, error = %e, "adapter reset failed");
            }
            let mut state = session.state.lock().await;
            state.prompts.reset();
            state.pending = None;
            state.resolutions.clear();
        }
    }

    /// Fires an adapter interrupt and queues the interrupted signal the
    /// runner's turn loop consumes.
    pub async fn interrupt(&self, node_id: &str) {
        if let Some(session) = self.get(node_id) {
            if let Err(e) = session.adapter.interrupt().await {
                tracing::warn!(node_id = %node_id, error = %e, "adapter interrupt failed");
            }
            session.push_signal(AdapterEvent::Interrupted);
        }
    }
}

/// The sink owns the sender; sessions keep a second handle for
/// engine-injected signals.
fn sink_sender(sink: &AdapterSink) -> mpsc::UnboundedSender<AdapterEvent> {
    sink.sender()
}
