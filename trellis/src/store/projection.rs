//! The projection and its fold: a pure, deterministic function of
//! (projection, event) → projection, used identically by the live publish
//! path and by cold-start replay.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use run_event::{
    Approval, Artifact, Edge, Envelope, Event, EventEnvelope, NodePatch, NodeState, RunPatch,
    RunState, TokenUsage, UserMessage,
};
use serde::{Deserialize, Serialize};

/// Pending inbox content for one node: handoff envelopes plus queued user
/// messages, drained atomically at the start of a non-resuming turn.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeQueues {
    #[serde(default)]
    pub envelopes: Vec<Envelope>,
    #[serde(default)]
    pub messages: Vec<UserMessage>,
}

impl NodeQueues {
    pub fn len(&self) -> usize {
        self.envelopes.len() + self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes.is_empty() && self.messages.is_empty()
    }
}

/// In-memory view of one run, derived by folding its event log.
///
/// All cross-entity references are by id in maps keyed by id; no entity
/// holds a pointer to another. `applied` counts folded events so a snapshot
/// knows where the log tail starts.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunProjection {
    pub run: RunState,
    #[serde(default)]
    pub nodes: BTreeMap<String, NodeState>,
    #[serde(default)]
    pub edges: BTreeMap<String, Edge>,
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    #[serde(default)]
    pub approvals: BTreeMap<String, Approval>,
    #[serde(default)]
    pub queues: BTreeMap<String, NodeQueues>,
    #[serde(default)]
    pub applied: u64,
}

impl RunProjection {
    /// Empty projection for a run id; the first folded event fills it in.
    pub fn new(run_id: impl Into<String>) -> Self {
        Self {
            run: RunState::new(run_id, DateTime::<Utc>::UNIX_EPOCH),
            nodes: BTreeMap::new(),
            edges: BTreeMap::new(),
            artifacts: BTreeMap::new(),
            approvals: BTreeMap::new(),
            queues: BTreeMap::new(),
            applied: 0,
        }
    }

    pub fn queue_len(&self, node_id: &str) -> usize {
        self.queues.get(node_id).map(NodeQueues::len).unwrap_or(0)
    }
}

/// Folds one event into the projection.
///
/// Deterministic: replaying a log through this function reconstructs the
/// exact state the live path built. Derived events (usage patches) are NOT
/// produced here; see [`derived_events`], which the live publish path
/// appends to the log so replay folds them like any other event.
pub fn apply_event(projection: &mut RunProjection, envelope: &EventEnvelope) {
    projection.applied += 1;
    projection.run.updated_at = envelope.ts;

    match &envelope.event {
        Event::RunPatch { patch } => patch.apply(&mut projection.run),
        Event::RunMode { mode, global_mode } => {
            projection.run.mode = *mode;
            projection.run.global_mode = *global_mode;
        }
        Event::RunStalled { .. } => {}
        Event::NodePatch { node_id, patch } => {
            let node = projection
                .nodes
                .entry(node_id.clone())
                .or_insert_with(|| NodeState::new(node_id.clone(), envelope.run_id.clone(), envelope.ts));
            patch.apply(node);
            node.last_activity_at = envelope.ts;
            // The only live emitters of inboxCount are enqueue and drain, so
            // a zero here is a drain and the queues empty with it.
            if patch.inbox_count == Some(0) {
                projection.queues.remove(node_id);
            }
        }
        Event::NodeProgress { .. } => {}
        Event::NodeDeleted { node_id } => {
            projection.nodes.remove(node_id);
            projection.queues.remove(node_id);
            projection
                .edges
                .retain(|_, e| e.from != *node_id && e.to != *node_id);
            projection.artifacts.retain(|_, a| a.node_id != *node_id);
            projection.approvals.retain(|_, a| a.node_id != *node_id);
        }
        Event::EdgeCreated { edge } => {
            projection.edges.insert(edge.id.clone(), edge.clone());
        }
        Event::EdgeDeleted { edge_id } => {
            projection.edges.remove(edge_id);
        }
        Event::ArtifactCreated { artifact } => {
            projection
                .artifacts
                .insert(artifact.id.clone(), artifact.clone());
        }
        Event::MessageUser { message } => {
            if let Some(node_id) = &message.node_id {
                let queues = projection.queues.entry(node_id.clone()).or_default();
                if message.interrupt {
                    queues.messages.insert(0, message.clone());
                } else {
                    queues.messages.push(message.clone());
                }
                touch_node(projection, node_id, envelope.ts);
            }
        }
        Event::HandoffSent { envelope: handoff } | Event::HandoffReported { envelope: handoff } => {
            projection
                .queues
                .entry(handoff.to.clone())
                .or_default()
                .envelopes
                .push(handoff.clone());
            touch_node(projection, &handoff.to, envelope.ts);
        }
        Event::ApprovalRequested { approval } => {
            projection
                .approvals
                .insert(approval.id.clone(), approval.clone());
            touch_node(projection, &approval.node_id, envelope.ts);
        }
        Event::ApprovalResolved { approval_id, .. } => {
            projection.approvals.remove(approval_id);
        }
        Event::TelemetryUsage { node_id, usage } => {
            projection.run.usage.add(usage);
            if let Some(node_id) = node_id {
                if let Some(node) = projection.nodes.get_mut(node_id) {
                    node.usage.add(usage);
                }
            }
        }
        // Message and tool events carry no projected structure beyond
        // node activity.
        Event::AssistantDelta { node_id, .. }
        | Event::AssistantFinal { node_id, .. }
        | Event::ThinkingDelta { node_id, .. }
        | Event::ThinkingFinal { node_id, .. }
        | Event::Reasoning { node_id, .. }
        | Event::ToolProposed { node_id, .. }
        | Event::ToolStarted { node_id, .. }
        | Event::ToolCompleted { node_id, .. } => {
            let node_id = node_id.clone();
            touch_node(projection, &node_id, envelope.ts);
        }
    }
}

fn touch_node(projection: &mut RunProjection, node_id: &str, ts: DateTime<Utc>) {
    if let Some(node) = projection.nodes.get_mut(node_id) {
        node.last_activity_at = ts;
    }
}

/// Derived events the live path publishes after folding `envelope`.
///
/// `telemetry.usage` accumulates into node and run totals and surfaces the
/// new absolute totals as node.patch + run.patch. Replay does not call
/// this: the derived events were themselves logged.
pub fn derived_events(projection: &RunProjection, envelope: &EventEnvelope) -> Vec<Event> {
    match &envelope.event {
        Event::TelemetryUsage { node_id, .. } => {
            let mut events = Vec::new();
            if let Some(node_id) = node_id {
                if let Some(node) = projection.nodes.get(node_id) {
                    events.push(Event::NodePatch {
                        node_id: node_id.clone(),
                        patch: NodePatch {
                            usage: Some(node.usage),
                            ..Default::default()
                        },
                    });
                }
            }
            events.push(Event::RunPatch {
                patch: RunPatch {
                    usage: Some(projection.run.usage),
                    ..Default::default()
                },
            });
            events
        }
        _ => Vec::new(),
    }
}

/// Replays a full log into a fresh projection.
pub fn replay(run_id: &str, events: &[EventEnvelope]) -> RunProjection {
    let mut projection = RunProjection::new(run_id);
    for envelope in events {
        apply_event(&mut projection, envelope);
    }
    projection
}
