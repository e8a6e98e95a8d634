//! Event log, projection, snapshot, run store, artifact store.
//!
//! The per-run `events.jsonl` file is the sole source of truth. Every
//! mutation flows through one publish path: append to the log (failure
//! aborts the publish), fold into the in-memory projection, persist the
//! snapshot (failure is a warning), notify subscribers.

mod artifacts;
mod event_log;
mod projection;
mod run_store;
mod snapshot;

pub use artifacts::ArtifactStore;
pub use event_log::{EventLog, LogError};
pub use projection::{apply_event, derived_events, NodeQueues, RunProjection};
pub use run_store::{RunHandle, RunStore};
pub use snapshot::{load_snapshot, write_snapshot};
