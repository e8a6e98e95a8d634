//! # Trellis
//!
//! Local-first, graph-based orchestration engine for agentic coding
//! sessions. A run is a directed graph of nodes; each node is a long-lived
//! conversation with an external coding agent (a subprocess speaking
//! line-delimited JSON, or an HTTP chat API). The engine drives turns on
//! these nodes, routes handoff envelopes and user messages between them,
//! mediates tool calls, gates dangerous actions through an approval queue,
//! and broadcasts a totally-ordered event log that both persists run state
//! and feeds live observers.
//!
//! ## Architecture
//!
//! ```text
//! command → Engine op → RunStore publish (log append → fold → snapshot →
//! broadcast) → Scheduler tick → Runner turn → adapter events → tool
//! execution or approval block → outcome → publish → observers
//! ```
//!
//! - [`engine::Engine`]: the control-plane facade (create run/node/edge,
//!   post message, resolve approval, subscribe events).
//! - [`store`]: append-only event log, deterministic projection fold,
//!   snapshot, artifact blobs.
//! - [`scheduler`]: the cooperative tick loop.
//! - [`runner`]: the per-node turn state machine.
//! - [`provider`]: the adapter contract plus CLI, HTTP, and mock adapters.
//! - [`tools`]: workspace and graph-mutating tool execution.
//! - [`approval`]: the pending-approval queue.
//! - [`safety`]: repeated-output / repeated-diff stall detection.

pub mod approval;
pub mod engine;
pub mod error;
pub mod model;
pub mod provider;
pub mod runner;
pub mod safety;
pub mod scheduler;
pub mod store;
pub mod tools;

pub use engine::{
    CreateEdge, CreateNode, CreateRun, DeliverEnvelope, Engine, EngineSettings, PostMessage,
    RecordArtifact, UpdateRun, ORCHESTRATOR_ROLE,
};
pub use error::EngineError;
pub use model::*;
pub use store::RunProjection;
