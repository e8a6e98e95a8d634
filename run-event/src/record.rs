//! Entity records carried on the wire: runs, nodes, edges, envelopes,
//! messages, artifacts, approvals, tool calls, and the patch shapes the
//! fold applies to them.
//!
//! Field names serialize camelCase to match the event envelope format
//! (`runId`, `inboxCount`, `filesChanged`). Patch structs are all-`Option`;
//! entity creation is a patch carrying the initial fields.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// -----------------------------------------------------------------------------
// Run
// -----------------------------------------------------------------------------

/// Run lifecycle status.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Paused,
    Stopped,
    Failed,
}

/// Orchestration mode: AUTO lets orchestrator nodes self-continue after a
/// completed turn; INTERACTIVE requires an explicit user message first.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrchestrationMode {
    Auto,
    Interactive,
}

/// Global mode: PLANNING tightens tools to read-only workspace plus docs
/// writes; IMPLEMENTATION allows full capabilities subject to per-node flags.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GlobalMode {
    Planning,
    Implementation,
}

/// Additive token usage counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenUsage {
    #[serde(default)]
    pub input_tokens: u64,
    #[serde(default)]
    pub output_tokens: u64,
}

impl TokenUsage {
    pub fn add(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
    }

    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens
    }
}

/// Run entity as projected from the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunState {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub status: RunStatus,
    pub mode: OrchestrationMode,
    pub global_mode: GlobalMode,
    pub cwd: String,
    #[serde(default)]
    pub usage: TokenUsage,
}

impl RunState {
    /// Fresh run with defaults; patches fill in the rest.
    pub fn new(id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            created_at: at,
            updated_at: at,
            status: RunStatus::Running,
            mode: OrchestrationMode::Interactive,
            global_mode: GlobalMode::Implementation,
            cwd: String::new(),
            usage: TokenUsage::default(),
        }
    }
}

/// Partial update for a run. Creation is a patch against [`RunState::new`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunPatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<RunStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mode: Option<OrchestrationMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub global_mode: Option<GlobalMode>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cwd: Option<String>,
    /// Absolute totals after accumulation, not a delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
}

impl RunPatch {
    pub fn apply(&self, run: &mut RunState) {
        if let Some(status) = self.status {
            run.status = status;
        }
        if let Some(mode) = self.mode {
            run.mode = mode;
        }
        if let Some(global_mode) = self.global_mode {
            run.global_mode = global_mode;
        }
        if let Some(ref cwd) = self.cwd {
            run.cwd = cwd.clone();
        }
        if let Some(usage) = self.usage {
            run.usage = usage;
        }
    }
}

// -----------------------------------------------------------------------------
// Node
// -----------------------------------------------------------------------------

/// Node lifecycle status. `running` iff the scheduler holds a turn-in-flight.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeStatus {
    Idle,
    Running,
    Blocked,
    Failed,
}

/// Provider connection status for a node session.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Idle,
    Connected,
    Disconnected,
}

/// Which edges a node may create via agent-management tools.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeManagement {
    #[default]
    None,
    #[serde(rename = "self")]
    SelfOnly,
    All,
}

/// Whether the provider CLI's own permission prompts are skipped or routed
/// through the engine's approval queue.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionsMode {
    #[default]
    Skip,
    Gated,
}

/// Per-node capability flags, all off by default.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCapabilities {
    #[serde(default)]
    pub spawn_nodes: bool,
    #[serde(default)]
    pub write_code: bool,
    #[serde(default)]
    pub write_docs: bool,
    #[serde(default)]
    pub run_commands: bool,
    #[serde(default)]
    pub delegate_only: bool,
    #[serde(default)]
    pub edge_management: EdgeManagement,
}

/// Per-node permission settings.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePermissions {
    #[serde(default)]
    pub permissions_mode: PermissionsMode,
    #[serde(default)]
    pub agent_management_requires_approval: bool,
}

/// Opaque provider session descriptor.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionDescriptor {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub reset_commands: Vec<String>,
}

/// Connection state with streaming flag and heartbeat.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionState {
    #[serde(default)]
    pub status: ConnectionStatus,
    #[serde(default)]
    pub streaming: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<DateTime<Utc>>,
}

/// One todo entry extracted from a TodoWrite tool call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    pub content: String,
    #[serde(default)]
    pub status: TodoStatus,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TodoStatus {
    #[default]
    Pending,
    InProgress,
    Completed,
}

/// Node entity as projected from the event log.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeState {
    pub id: String,
    pub run_id: String,
    pub label: String,
    pub role_template: String,
    pub provider: String,
    pub status: NodeStatus,
    #[serde(default)]
    pub summary: String,
    pub last_activity_at: DateTime<Utc>,
    #[serde(default)]
    pub usage: TokenUsage,
    #[serde(default)]
    pub capabilities: NodeCapabilities,
    #[serde(default)]
    pub permissions: NodePermissions,
    #[serde(default)]
    pub session: SessionDescriptor,
    #[serde(default)]
    pub connection: ConnectionState,
    #[serde(default)]
    pub inbox_count: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub todos: Vec<TodoItem>,
}

impl NodeState {
    /// Fresh node with defaults; patches fill in the rest.
    pub fn new(id: impl Into<String>, run_id: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            run_id: run_id.into(),
            label: String::new(),
            role_template: String::new(),
            provider: String::new(),
            status: NodeStatus::Idle,
            summary: String::new(),
            last_activity_at: at,
            usage: TokenUsage::default(),
            capabilities: NodeCapabilities::default(),
            permissions: NodePermissions::default(),
            session: SessionDescriptor::default(),
            connection: ConnectionState::default(),
            inbox_count: 0,
            todos: Vec::new(),
        }
    }
}

/// Partial update for a node. Creation is a patch against [`NodeState::new`].
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodePatch {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role_template: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<NodeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_activity_at: Option<DateTime<Utc>>,
    /// Absolute totals after accumulation, not a delta.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub usage: Option<TokenUsage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub capabilities: Option<NodeCapabilities>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub permissions: Option<NodePermissions>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionDescriptor>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connection: Option<ConnectionState>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub inbox_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub todos: Option<Vec<TodoItem>>,
}

impl NodePatch {
    pub fn apply(&self, node: &mut NodeState) {
        if let Some(ref label) = self.label {
            node.label = label.clone();
        }
        if let Some(ref role_template) = self.role_template {
            node.role_template = role_template.clone();
        }
        if let Some(ref provider) = self.provider {
            node.provider = provider.clone();
        }
        if let Some(status) = self.status {
            node.status = status;
        }
        if let Some(ref summary) = self.summary {
            node.summary = summary.clone();
        }
        if let Some(at) = self.last_activity_at {
            node.last_activity_at = at;
        }
        if let Some(usage) = self.usage {
            node.usage = usage;
        }
        if let Some(capabilities) = self.capabilities {
            node.capabilities = capabilities;
        }
        if let Some(permissions) = self.permissions {
            node.permissions = permissions;
        }
        if let Some(ref session) = self.session {
            node.session = session.clone();
        }
        if let Some(ref connection) = self.connection {
            node.connection = connection.clone();
        }
        if let Some(inbox_count) = self.inbox_count {
            node.inbox_count = inbox_count;
        }
        if let Some(ref todos) = self.todos {
            node.todos = todos.clone();
        }
    }
}

// -----------------------------------------------------------------------------
// Edge
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EdgeType {
    #[default]
    Handoff,
    Report,
}

/// Routing hint between two nodes. Envelope delivery is not restricted to
/// declared edges.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Edge {
    pub id: String,
    pub from: String,
    pub to: String,
    #[serde(default)]
    pub bidirectional: bool,
    #[serde(rename = "type", default)]
    pub edge_type: EdgeType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
}

// -----------------------------------------------------------------------------
// Envelope (handoff)
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResponseExpectation {
    #[default]
    None,
    Optional,
    Required,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseSpec {
    #[serde(default)]
    pub expectation: ResponseExpectation,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopeStatus {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Reference to an artifact carried inside a handoff payload.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactRef {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(rename = "ref")]
    pub reference: String,
}

/// Structured handoff payload.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnvelopePayload {
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub structured: Option<Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<EnvelopeStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<ResponseSpec>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context_ref: Option<String>,
}

/// Handoff envelope routed from one node's outbox to another node's inbox.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Envelope {
    pub id: String,
    pub from: String,
    pub to: String,
    pub created_at: DateTime<Utc>,
    pub payload: EnvelopePayload,
}

// -----------------------------------------------------------------------------
// User message
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MessageRole {
    #[default]
    User,
}

/// A user message addressed to a node (or unaddressed = orchestrator).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserMessage {
    pub id: String,
    pub run_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub node_id: Option<String>,
    #[serde(default)]
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub interrupt: bool,
}

// -----------------------------------------------------------------------------
// Artifact
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ArtifactKind {
    Prompt,
    Diff,
    Log,
    Json,
    UserFeedback,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub files_changed: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
}

/// A persisted blob produced by a node during a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Artifact {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub kind: ArtifactKind,
    pub name: String,
    pub path: String,
    pub created_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<ArtifactMetadata>,
}

// -----------------------------------------------------------------------------
// Tool call & approval
// -----------------------------------------------------------------------------

/// One tool invocation proposed by the assistant.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
    /// The provider already executed this call; the engine does not
    /// re-execute but still emits events and may extract side-effects.
    #[serde(default)]
    pub provider_handled: bool,
}

/// A suspension token gating one tool execution on operator consent.
/// The approval id equals the tool-call id it gates.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Approval {
    pub id: String,
    pub run_id: String,
    pub node_id: String,
    pub tool: ToolCall,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub context: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
}

/// Operator decision for a requested approval.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "decision", rename_all = "lowercase")]
pub enum ApprovalResolution {
    Approved,
    Denied,
    Modified { args: Value },
}

// -----------------------------------------------------------------------------
// Stall evidence
// -----------------------------------------------------------------------------

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StallKind {
    OutputRepeat,
    DiffRepeat,
    VerificationRepeat,
}

/// Evidence surfaced to the operator when a repeat cycle pauses the run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StallEvidence {
    pub kind: StallKind,
    pub node_id: String,
    pub sample_hash: String,
    pub count: u32,
}
