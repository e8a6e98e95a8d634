//! Engine data model: the wire records from `run-event` plus the per-node
//! ephemeral runtime state that is never persisted or replayed.

pub use run_event::{
    Approval, ApprovalResolution, Artifact, ArtifactKind, ArtifactMetadata, ArtifactRef,
    ConnectionState, ConnectionStatus, Edge, EdgeManagement, EdgeType, Envelope, EnvelopePayload,
    EnvelopeStatus, Event, EventEnvelope, GlobalMode, MessageRole, NodeCapabilities, NodePatch,
    NodePermissions, NodeState, NodeStatus, OrchestrationMode, PermissionsMode,
    ResponseExpectation, ResponseSpec, RunPatch, RunState, RunStatus, SessionDescriptor,
    StallEvidence, StallKind, TodoItem, TodoStatus, TokenUsage, ToolCall, UserMessage,
};

use crate::safety::StallState;

/// Per-node ephemeral runtime. Lives beside the projection, not inside it:
/// it is reconstructed empty on restart and reset by `reset_node`.
#[derive(Debug, Default)]
pub struct NodeRuntime {
    /// Repeat counters for the loop-safety policy.
    pub stall: StallState,
    /// A turn is suspended mid-flight waiting on an approval; the next
    /// dispatch resumes it instead of consuming the inbox.
    pub pending_turn: bool,
    /// AUTO-mode orchestrator self-continuation requested for the next tick.
    pub auto_prompt_queued: bool,
    /// Node was interrupted by a run pause; resume enqueues a synthetic
    /// "Continue." user message.
    pub interrupted_by_pause: bool,
    /// Nodes this node sent a response-required handoff to and has not yet
    /// heard back from. Advisory: rendered into the task prompt only.
    pub awaiting_response_from: Vec<String>,
}

impl NodeRuntime {
    /// Clears everything; used by `reset_node`.
    pub fn reset(&mut self) {
        *self = NodeRuntime::default();
    }
}
