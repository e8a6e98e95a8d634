//! Mock provider adapter: scripted turns for tests and demos, satisfying
//! the same contract as the real adapters.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use run_event::{ApprovalResolution, TokenUsage, ToolCall};

use super::{
    AdapterContext, AdapterEvent, AdapterSink, ProviderAdapter, ProviderError, ProviderFactory,
    ProviderSpec, TurnRequest,
};

/// One scripted assistant turn.
#[derive(Clone, Debug, Default)]
pub struct MockTurn {
    pub deltas: Vec<String>,
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub thinking: Option<String>,
    pub usage: Option<TokenUsage>,
}

impl MockTurn {
    pub fn text(content: impl Into<String>) -> Self {
        let content = content.into();
        Self {
            deltas: vec![content.clone()],
            content,
            ..Default::default()
        }
    }

    pub fn with_tool_calls(mut self, tool_calls: Vec<ToolCall>) -> Self {
        self.tool_calls = tool_calls;
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }
}

/// Scripted adapter. Each `send` pops the next scripted turn; when the
/// script runs dry the fallback turn repeats, which is also how stall
/// scenarios are written.
pub struct MockAdapter {
    sink: AdapterSink,
    script: Arc<Mutex<VecDeque<MockTurn>>>,
    fallback: MockTurn,
    session_id: Mutex<Option<String>>,
}

impl MockAdapter {
    pub fn scripted(sink: AdapterSink, turns: Vec<MockTurn>, fallback: MockTurn) -> Self {
        Self {
            sink,
            script: Arc::new(Mutex::new(turns.into())),
            fallback,
            session_id: Mutex::new(None),
        }
    }

    /// Shares a script queue owned by a [`MockProviderFactory`].
    fn shared(sink: AdapterSink, script: Arc<Mutex<VecDeque<MockTurn>>>, fallback: MockTurn) -> Self {
        Self {
            sink,
            script,
            fallback,
            session_id: Mutex::new(None),
        }
    }

    /// Default mock: replies "ok" to every prompt.
    pub fn echo(sink: AdapterSink) -> Self {
        Self::scripted(sink, Vec::new(), MockTurn::text("ok"))
    }
}

#[async_trait]
impl ProviderAdapter for MockAdapter {
    async fn start(&self) -> Result<(), ProviderError> {
        let session = format!("mock-{}", uuid::Uuid::new_v4());
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = Some(session.clone());
        self.sink.emit(AdapterEvent::SessionId(session));
        Ok(())
    }

    async fn send(&self, _turn: TurnRequest) -> Result<(), ProviderError> {
        let turn = self
            .script
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        if let Some(thinking) = &turn.thinking {
            self.sink.emit(AdapterEvent::ThinkingDelta {
                delta: thinking.clone(),
            });
            self.sink.emit(AdapterEvent::ThinkingFinal {
                content: thinking.clone(),
            });
        }
        for delta in &turn.deltas {
            self.sink.emit(AdapterEvent::AssistantDelta {
                delta: delta.clone(),
            });
        }
        if let Some(usage) = turn.usage {
            self.sink.emit(AdapterEvent::Usage(usage));
        }
        self.sink.emit(AdapterEvent::AssistantFinal {
            content: turn.content,
            tool_calls: turn.tool_calls,
        });
        Ok(())
    }

    async fn interrupt(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn resolve_approval(
        &self,
        _approval_id: &str,
        _resolution: &ApprovalResolution,
    ) -> Result<(), ProviderError> {
        Ok(())
    }

    async fn reset_session(&self) -> Result<(), ProviderError> {
        *self.session_id.lock().unwrap_or_else(|e| e.into_inner()) = None;
        Ok(())
    }

    async fn close(&self) -> Result<(), ProviderError> {
        Ok(())
    }

    fn session_id(&self) -> Option<String> {
        self.session_id.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Factory for tests: per-node scripts keyed by node id, shared with the
/// adapters it creates so scripts can be appended after session start.
#[derive(Default)]
pub struct MockProviderFactory {
    scripts: dashmap::DashMap<String, Arc<Mutex<VecDeque<MockTurn>>>>,
    fallback: Mutex<MockTurn>,
}

impl MockProviderFactory {
    pub fn new() -> Self {
        Self {
            scripts: dashmap::DashMap::new(),
            fallback: Mutex::new(MockTurn::text("ok")),
        }
    }

    pub fn set_fallback(&self, turn: MockTurn) {
        *self.fallback.lock().unwrap_or_else(|e| e.into_inner()) = turn;
    }

    /// Appends one scripted turn for a node.
    pub fn push_turn(&self, node_id: &str, turn: MockTurn) {
        self.scripts
            .entry(node_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(turn);
    }
}

impl ProviderFactory for MockProviderFactory {
    fn create(
        &self,
        _spec: &ProviderSpec,
        ctx: &AdapterContext,
        sink: AdapterSink,
    ) -> Result<Box<dyn ProviderAdapter>, ProviderError> {
        let script = self
            .scripts
            .entry(ctx.node_id.clone())
            .or_insert_with(|| Arc::new(Mutex::new(VecDeque::new())))
            .clone();
        let fallback = self.fallback.lock().unwrap_or_else(|e| e.into_inner()).clone();
        Ok(Box::new(MockAdapter::shared(sink, script, fallback)))
    }
}
