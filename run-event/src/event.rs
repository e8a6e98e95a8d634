//! Event families: the tagged sum every log record and bus message carries.
//!
//! One variant per family; the fold in the engine crate is an exhaustive
//! match over this enum, so adding a family is a compile-time-checked
//! change everywhere it matters.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::record::{
    Approval, ApprovalResolution, Artifact, Edge, Envelope, GlobalMode, NodePatch, NodeStatus,
    OrchestrationMode, RunPatch, StallEvidence, TokenUsage, ToolCall, UserMessage,
};

/// One engine event. Serialized with a dotted `type` tag
/// (e.g. `"type":"node.patch"`), payload fields camelCase at top level.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Event {
    #[serde(rename = "run.patch", rename_all = "camelCase")]
    RunPatch { patch: RunPatch },

    #[serde(rename = "run.mode", rename_all = "camelCase")]
    RunMode {
        mode: OrchestrationMode,
        global_mode: GlobalMode,
    },

    #[serde(rename = "run.stalled", rename_all = "camelCase")]
    RunStalled { evidence: StallEvidence },

    /// Authoritative node state mutation. Creation is a patch carrying the
    /// initial fields for a node id the projection has not seen.
    #[serde(rename = "node.patch", rename_all = "camelCase")]
    NodePatch { node_id: String, patch: NodePatch },

    /// Advisory UI hint; same payload family as node.patch but ignored by
    /// the fold.
    #[serde(rename = "node.progress", rename_all = "camelCase")]
    NodeProgress {
        node_id: String,
        status: NodeStatus,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    #[serde(rename = "node.deleted", rename_all = "camelCase")]
    NodeDeleted { node_id: String },

    #[serde(rename = "edge.created", rename_all = "camelCase")]
    EdgeCreated { edge: Edge },

    #[serde(rename = "edge.deleted", rename_all = "camelCase")]
    EdgeDeleted { edge_id: String },

    #[serde(rename = "artifact.created", rename_all = "camelCase")]
    ArtifactCreated { artifact: Artifact },

    #[serde(rename = "message.user", rename_all = "camelCase")]
    MessageUser { message: UserMessage },

    #[serde(rename = "message.assistant.delta", rename_all = "camelCase")]
    AssistantDelta { node_id: String, delta: String },

    #[serde(rename = "message.assistant.final", rename_all = "camelCase")]
    AssistantFinal {
        node_id: String,
        content: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        tool_calls: Vec<ToolCall>,
    },

    #[serde(rename = "message.assistant.thinking.delta", rename_all = "camelCase")]
    ThinkingDelta { node_id: String, delta: String },

    #[serde(rename = "message.assistant.thinking.final", rename_all = "camelCase")]
    ThinkingFinal { node_id: String, content: String },

    #[serde(rename = "message.reasoning", rename_all = "camelCase")]
    Reasoning { node_id: String, content: String },

    #[serde(rename = "tool.proposed", rename_all = "camelCase")]
    ToolProposed { node_id: String, call: ToolCall },

    #[serde(rename = "tool.started", rename_all = "camelCase")]
    ToolStarted {
        node_id: String,
        call_id: String,
        name: String,
    },

    #[serde(rename = "tool.completed", rename_all = "camelCase")]
    ToolCompleted {
        node_id: String,
        call_id: String,
        name: String,
        ok: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        result: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        duration_ms: u64,
    },

    #[serde(rename = "approval.requested", rename_all = "camelCase")]
    ApprovalRequested { approval: Approval },

    #[serde(rename = "approval.resolved", rename_all = "camelCase")]
    ApprovalResolved {
        approval_id: String,
        node_id: String,
        resolution: ApprovalResolution,
    },

    #[serde(rename = "handoff.sent", rename_all = "camelCase")]
    HandoffSent { envelope: Envelope },

    /// A handoff whose payload carries a status block; a report back to the
    /// sender rather than a task assignment.
    #[serde(rename = "handoff.reported", rename_all = "camelCase")]
    HandoffReported { envelope: Envelope },

    /// Usage delta; the fold accumulates it into node and run totals.
    #[serde(rename = "telemetry.usage", rename_all = "camelCase")]
    TelemetryUsage {
        #[serde(skip_serializing_if = "Option::is_none")]
        node_id: Option<String>,
        usage: TokenUsage,
    },
}

impl Event {
    /// The dotted wire type of this event, for logging and filtering.
    pub fn kind(&self) -> &'static str {
        match self {
            Event::RunPatch { .. } => "run.patch",
            Event::RunMode { .. } => "run.mode",
            Event::RunStalled { .. } => "run.stalled",
            Event::NodePatch { .. } => "node.patch",
            Event::NodeProgress { .. } => "node.progress",
            Event::NodeDeleted { .. } => "node.deleted",
            Event::EdgeCreated { .. } => "edge.created",
            Event::EdgeDeleted { .. } => "edge.deleted",
            Event::ArtifactCreated { .. } => "artifact.created",
            Event::MessageUser { .. } => "message.user",
            Event::AssistantDelta { .. } => "message.assistant.delta",
            Event::AssistantFinal { .. } => "message.assistant.final",
            Event::ThinkingDelta { .. } => "message.assistant.thinking.delta",
            Event::ThinkingFinal { .. } => "message.assistant.thinking.final",
            Event::Reasoning { .. } => "message.reasoning",
            Event::ToolProposed { .. } => "tool.proposed",
            Event::ToolStarted { .. } => "tool.started",
            Event::ToolCompleted { .. } => "tool.completed",
            Event::ApprovalRequested { .. } => "approval.requested",
            Event::ApprovalResolved { .. } => "approval.resolved",
            Event::HandoffSent { .. } => "handoff.sent",
            Event::HandoffReported { .. } => "handoff.reported",
            Event::TelemetryUsage { .. } => "telemetry.usage",
        }
    }

    /// The node this event concerns, when it concerns exactly one.
    pub fn node_id(&self) -> Option<&str> {
        match self {
            Event::NodePatch { node_id, .. }
            | Event::NodeProgress { node_id, .. }
            | Event::NodeDeleted { node_id }
            | Event::AssistantDelta { node_id, .. }
            | Event::AssistantFinal { node_id, .. }
            | Event::ThinkingDelta { node_id, .. }
            | Event::ThinkingFinal { node_id, .. }
            | Event::Reasoning { node_id, .. }
            | Event::ToolProposed { node_id, .. }
            | Event::ToolStarted { node_id, .. }
            | Event::ToolCompleted { node_id, .. }
            | Event::ApprovalResolved { node_id, .. } => Some(node_id),
            Event::ApprovalRequested { approval } => Some(&approval.node_id),
            Event::TelemetryUsage { node_id, .. } => node_id.as_deref(),
            Event::MessageUser { message } => message.node_id.as_deref(),
            _ => None,
        }
    }
}
