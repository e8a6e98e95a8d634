//! Run event protocol: event families, entity records, envelope wire format.
//!
//! The engine's sole source of truth is a per-run append-only log of
//! [`EventEnvelope`] records, one JSON object per line. This crate defines
//! the wire shapes only; no I/O, no state. The fold that turns events into
//! a projection lives in the engine crate.

mod envelope;
mod event;
mod record;

pub use envelope::EventEnvelope;
pub use event::Event;
pub use record::{
    Approval, ApprovalResolution, Artifact, ArtifactKind, ArtifactMetadata, ArtifactRef,
    ConnectionState, ConnectionStatus, Edge, EdgeManagement, EdgeType, Envelope, EnvelopePayload,
    EnvelopeStatus, GlobalMode, MessageRole, NodeCapabilities, NodePatch, NodePermissions,
    NodeState, NodeStatus, OrchestrationMode, PermissionsMode, ResponseExpectation, ResponseSpec,
    RunPatch, RunState, RunStatus, SessionDescriptor, StallEvidence, StallKind, TodoItem,
    TodoStatus, TokenUsage, ToolCall, UserMessage,
};
