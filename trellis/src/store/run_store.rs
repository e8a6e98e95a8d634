//! Per-run handles and the publish path.
//!
//! A [`RunHandle`] owns one run's log, projection, ephemeral node runtime,
//! and broadcast bus. All mutation goes through the publish path under the
//! run's lock: append → fold → snapshot → broadcast. Compound operations
//! (post message, deliver envelope, drain inbox, delete node) hold the lock
//! across their whole read-compute-append sequence so counts and cascades
//! are consistent with what observers see.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use dashmap::DashMap;
use run_event::{Envelope, Event, EventEnvelope, NodePatch, UserMessage};
use tokio::sync::{broadcast, Mutex};
use tokio_util::sync::CancellationToken;

use crate::model::NodeRuntime;

use super::event_log::{EventLog, LogError};
use super::projection::{apply_event, derived_events, replay, RunProjection};
use super::snapshot::{load_snapshot, write_snapshot};

const BUS_CAPACITY: usize = 1024;

const EVENTS_FILE: &str = "events.jsonl";
const SNAPSHOT_FILE: &str = "run.json";
const ARTIFACTS_DIR: &str = "artifacts";

/// All runs under one data directory.
pub struct RunStore {
    data_dir: PathBuf,
    runs: DashMap<String, Arc<RunHandle>>,
}

impl RunStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            runs: DashMap::new(),
        }
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    pub fn run_dir(&self, run_id: &str) -> PathBuf {
        self.data_dir.join("runs").join(run_id)
    }

    /// Creates a fresh run handle with an empty projection.
    pub fn create(&self, run_id: &str) -> Result<Arc<RunHandle>, LogError> {
        let dir = self.run_dir(run_id);
        let log = EventLog::open(dir.join(EVENTS_FILE))?;
        let handle = Arc::new(RunHandle::new(
            run_id.to_string(),
            dir,
            log,
            RunProjection::new(run_id),
        ));
        self.runs.insert(run_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Opens a run from disk: snapshot plus log tail when the snapshot is
    /// usable, full log replay otherwise.
    pub fn open(&self, run_id: &str) -> Result<Arc<RunHandle>, LogError> {
        let dir = self.run_dir(run_id);
        let events = EventLog::read_all(&dir.join(EVENTS_FILE))?;
        let projection = match load_snapshot(&dir.join(SNAPSHOT_FILE)) {
            Some(mut snap) if (snap.applied as usize) <= events.len() => {
                for envelope in &events[snap.applied as usize..] {
                    apply_event(&mut snap, envelope);
                }
                snap
            }
            _ => replay(run_id, &events),
        };
        let log = EventLog::open(dir.join(EVENTS_FILE))?;
        let handle = Arc::new(RunHandle::new(run_id.to_string(), dir, log, projection));
        self.runs.insert(run_id.to_string(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Opens every run directory found under the data dir. Unreadable runs
    /// are skipped with a warning.
    pub fn open_existing(&self) -> Vec<Arc<RunHandle>> {
        let runs_dir = self.data_dir.join("runs");
        let entries = match std::fs::read_dir(&runs_dir) {
            Ok(entries) => entries,
            Err(_) => return Vec::new(),
        };
        let mut handles = Vec::new();
        for entry in entries.flatten() {
            if !entry.path().is_dir() {
                continue;
            }
            let run_id = entry.file_name().to_string_lossy().into_owned();
            match self.open(&run_id) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    tracing::warn!(run_id = %run_id, error = %e, "skipping unreadable run");
                }
            }
        }
        handles
    }

    pub fn get(&self, run_id: &str) -> Option<Arc<RunHandle>> {
        self.runs.get(run_id).map(|h| Arc::clone(&h))
    }

    pub fn handles(&self) -> Vec<Arc<RunHandle>> {
        self.runs.iter().map(|h| Arc::clone(&h)).collect()
    }

    /// Drops the run from the store, cancels its children, and removes its
    /// directory (log, snapshot, artifacts).
    pub fn remove(&self, run_id: &str) -> std::io::Result<()> {
        if let Some((_, handle)) = self.runs.remove(run_id) {
            handle.cancel.cancel();
        }
        let dir = self.run_dir(run_id);
        match std::fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// One run: log + projection + runtime + bus behind a single lock.
pub struct RunHandle {
    run_id: String,
    dir: PathBuf,
    cancel: CancellationToken,
    bus: broadcast::Sender<EventEnvelope>,
    inner: Mutex<RunInner>,
}

struct RunInner {
    log: EventLog,
    projection: RunProjection,
    runtime: HashMap<String, NodeRuntime>,
}

impl RunHandle {
    fn new(run_id: String, dir: PathBuf, log: EventLog, projection: RunProjection) -> Self {
        let (bus, _) = broadcast::channel(BUS_CAPACITY);
        Self {
            run_id,
            dir,
            cancel: CancellationToken::new(),
            bus,
            inner: Mutex::new(RunInner {
                log,
                projection,
                runtime: HashMap::new(),
            }),
        }
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn artifacts_dir(&self) -> PathBuf {
        self.dir.join(ARTIFACTS_DIR)
    }

    /// Cancel handle covering every child operation of this run.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Tail-subscribes to this run's bus.
    pub fn subscribe(&self) -> broadcast::Receiver<EventEnvelope> {
        self.bus.subscribe()
    }

    /// Publishes one event. See [`RunHandle::publish_all`].
    pub async fn publish(&self, event: Event) -> Result<EventEnvelope, LogError> {
        let mut envelopes = self.publish_all(vec![event]).await?;
        Ok(envelopes.remove(0))
    }

    /// Publishes a batch atomically with respect to other publishers:
    /// every event is appended to the log first (failure aborts the rest),
    /// folded, then the snapshot is written once and all envelopes are
    /// broadcast in order. Derived usage patches are appended inline.
    pub async fn publish_all(&self, events: Vec<Event>) -> Result<Vec<EventEnvelope>, LogError> {
        let mut inner = self.inner.lock().await;
        let mut envelopes = Vec::with_capacity(events.len());
        for event in events {
            append_and_fold(&mut inner, &self.run_id, event, &mut envelopes)?;
        }
        self.finish_publish(&mut inner, &envelopes);
        Ok(envelopes)
    }

    /// Snapshot + broadcast tail of every publish path. Must be called with
    /// the inner lock held and all events already appended and folded.
    fn finish_publish(&self, inner: &mut RunInner, envelopes: &[EventEnvelope]) {
        if envelopes.is_empty() {
            return;
        }
        if let Err(e) = write_snapshot(&self.dir.join(SNAPSHOT_FILE), &inner.projection) {
            tracing::warn!(run_id = %self.run_id, error = %e, "snapshot write failed");
        }
        for envelope in envelopes {
            let _ = self.bus.send(envelope.clone());
        }
    }

    /// Clone of the current projection.
    pub async fn projection(&self) -> RunProjection {
        self.inner.lock().await.projection.clone()
    }

    /// Read access to projection and runtime together, for the scheduler's
    /// runnable scan.
    pub async fn with_state<R>(
        &self,
        f: impl FnOnce(&RunProjection, &mut HashMap<String, NodeRuntime>) -> R,
    ) -> R {
        let mut inner = self.inner.lock().await;
        let RunInner {
            projection,
            runtime,
            ..
        } = &mut *inner;
        f(projection, runtime)
    }

    /// Mutable access to one node's ephemeral runtime.
    pub async fn with_runtime<R>(
        &self,
        node_id: &str,
        f: impl FnOnce(&mut NodeRuntime) -> R,
    ) -> R {
        let mut inner = self.inner.lock().await;
        f(inner.runtime.entry(node_id.to_string()).or_default())
    }

    /// Drops a node's runtime entry (node delete / reset).
    pub async fn clear_runtime(&self, node_id: &str) {
        self.inner.lock().await.runtime.remove(node_id);
    }

    /// Enqueues a user message and republishes the target's inbox count.
    /// The message must already be addressed to a node.
    pub async fn post_user_message(
        &self,
        message: UserMessage,
    ) -> Result<Vec<EventEnvelope>, LogError> {
        let node_id = message.node_id.clone();
        let mut inner = self.inner.lock().await;
        let mut envelopes = Vec::new();
        append_and_fold(
            &mut inner,
            &self.run_id,
            Event::MessageUser { message },
            &mut envelopes,
        )?;
        if let Some(node_id) = node_id {
            let count = inner.projection.queue_len(&node_id) as u32;
            append_and_fold(
                &mut inner,
                &self.run_id,
                inbox_patch(&node_id, count),
                &mut envelopes,
            )?;
        }
        self.finish_publish(&mut inner, &envelopes);
        Ok(envelopes)
    }

    /// Enqueues a handoff envelope into the target node's inbox. A payload
    /// carrying a status block is a report back to the sender and is
    /// published as handoff.reported.
    pub async fn deliver_envelope(
        &self,
        envelope: Envelope,
    ) -> Result<Vec<EventEnvelope>, LogError> {
        let to = envelope.to.clone();
        let event = if envelope.payload.status.is_some() {
            Event::HandoffReported { envelope }
        } else {
            Event::HandoffSent { envelope }
        };
        let mut inner = self.inner.lock().await;
        let mut envelopes = Vec::new();
        append_and_fold(&mut inner, &self.run_id, event, &mut envelopes)?;
        let count = inner.projection.queue_len(&to) as u32;
        append_and_fold(&mut inner, &self.run_id, inbox_patch(&to, count), &mut envelopes)?;
        self.finish_publish(&mut inner, &envelopes);
        Ok(envelopes)
    }

    /// Atomically takes everything pending for a node and resets its inbox
    /// count to zero. Returns `(envelopes, messages)` in consumption order
    /// (interrupt messages are already at the head of the message queue).
    pub async fn drain_inbox(
        &self,
        node_id: &str,
    ) -> Result<(Vec<Envelope>, Vec<UserMessage>), LogError> {
        let mut inner = self.inner.lock().await;
        let queues = match inner.projection.queues.get(node_id) {
            Some(q) if !q.is_empty() => q.clone(),
            _ => return Ok((Vec::new(), Vec::new())),
        };
        let mut envelopes = Vec::new();
        append_and_fold(&mut inner, &self.run_id, inbox_patch(node_id, 0), &mut envelopes)?;
        self.finish_publish(&mut inner, &envelopes);
        Ok((queues.envelopes, queues.messages))
    }

    /// Deletes a node, emitting explicit edge.deleted events for every
    /// incident edge before the projection cascade runs.
    pub async fn delete_node(&self, node_id: &str) -> Result<Vec<EventEnvelope>, LogError> {
        let mut inner = self.inner.lock().await;
        let incident: Vec<String> = inner
            .projection
            .edges
            .values()
            .filter(|e| e.from == node_id || e.to == node_id)
            .map(|e| e.id.clone())
            .collect();
        let mut envelopes = Vec::new();
        append_and_fold(
            &mut inner,
            &self.run_id,
            Event::NodeDeleted {
                node_id: node_id.to_string(),
            },
            &mut envelopes,
        )?;
        for edge_id in incident {
            append_and_fold(
                &mut inner,
                &self.run_id,
                Event::EdgeDeleted { edge_id },
                &mut envelopes,
            )?;
        }
        inner.runtime.remove(node_id);
        self.finish_publish(&mut inner, &envelopes);
        Ok(envelopes)
    }

    /// Reads the full log from disk, in append order.
    pub async fn read_all(&self) -> Result<Vec<EventEnvelope>, LogError> {
        let inner = self.inner.lock().await;
        EventLog::read_all(inner.log.path())
    }
}

/// Appends one event, folds it, and recurses into its derived events.
/// Log-append failure aborts; the event never happened.
fn append_and_fold(
    inner: &mut RunInner,
    run_id: &str,
    event: Event,
    out: &mut Vec<EventEnvelope>,
) -> Result<(), LogError> {
    let envelope = EventEnvelope::new(run_id, event);
    inner.log.append(&envelope)?;
    apply_event(&mut inner.projection, &envelope);
    let derived = derived_events(&inner.projection, &envelope);
    out.push(envelope);
    for event in derived {
        append_and_fold(inner, run_id, event, out)?;
    }
    Ok(())
}

fn inbox_patch(node_id: &str, count: u32) -> Event {
    Event::NodePatch {
        node_id: node_id.to_string(),
        patch: NodePatch {
            inbox_count: Some(count),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use run_event::{
        EnvelopePayload, MessageRole, NodeStatus, RunPatch, RunStatus, TokenUsage,
    };

    fn store() -> (tempfile::TempDir, RunStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path());
        (dir, store)
    }

    fn node_patch(node_id: &str) -> Event {
        Event::NodePatch {
            node_id: node_id.to_string(),
            patch: NodePatch {
                label: Some(node_id.to_string()),
                status: Some(NodeStatus::Idle),
                ..Default::default()
            },
        }
    }

    fn user_message(run_id: &str, node_id: &str, content: &str) -> UserMessage {
        UserMessage {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.to_string(),
            node_id: Some(node_id.to_string()),
            role: MessageRole::User,
            content: content.to_string(),
            created_at: Utc::now(),
            interrupt: false,
        }
    }

    #[tokio::test]
    async fn publish_appends_folds_and_broadcasts() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        let mut rx = handle.subscribe();
        let envelope = handle
            .publish(Event::RunPatch {
                patch: RunPatch {
                    status: Some(RunStatus::Running),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(handle.projection().await.run.status, RunStatus::Running);
        let received = rx.recv().await.unwrap();
        assert_eq!(received, envelope);
        let logged = handle.read_all().await.unwrap();
        assert_eq!(logged, vec![envelope]);
    }

    #[tokio::test]
    async fn post_message_updates_inbox_count() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        handle.publish(node_patch("n1")).await.unwrap();
        let envelopes = handle
            .post_user_message(user_message("r1", "n1", "say hi"))
            .await
            .unwrap();
        assert_eq!(envelopes.len(), 2);
        assert_eq!(envelopes[0].event.kind(), "message.user");
        assert_eq!(envelopes[1].event.kind(), "node.patch");
        let p = handle.projection().await;
        assert_eq!(p.nodes["n1"].inbox_count, 1);
        assert_eq!(p.queue_len("n1"), 1);
    }

    #[tokio::test]
    async fn drain_inbox_resets_count_and_returns_items() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        handle.publish(node_patch("n1")).await.unwrap();
        handle
            .post_user_message(user_message("r1", "n1", "one"))
            .await
            .unwrap();
        handle
            .post_user_message(user_message("r1", "n1", "two"))
            .await
            .unwrap();

        let (envelopes, messages) = handle.drain_inbox("n1").await.unwrap();
        assert!(envelopes.is_empty());
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].content, "one");
        let p = handle.projection().await;
        assert_eq!(p.nodes["n1"].inbox_count, 0);
        assert_eq!(p.queue_len("n1"), 0);

        // Idempotent when already empty.
        let (e, m) = handle.drain_inbox("n1").await.unwrap();
        assert!(e.is_empty() && m.is_empty());
    }

    #[tokio::test]
    async fn deliver_envelope_routes_to_target_inbox() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        handle.publish(node_patch("a")).await.unwrap();
        handle.publish(node_patch("b")).await.unwrap();
        let envelopes = handle
            .deliver_envelope(Envelope {
                id: "env1".to_string(),
                from: "a".to_string(),
                to: "b".to_string(),
                created_at: Utc::now(),
                payload: EnvelopePayload {
                    message: "do X".to_string(),
                    ..Default::default()
                },
            })
            .await
            .unwrap();
        assert_eq!(envelopes[0].event.kind(), "handoff.sent");
        let p = handle.projection().await;
        assert_eq!(p.nodes["b"].inbox_count, 1);
    }

    #[tokio::test]
    async fn delete_node_emits_edge_deleted_for_incident_edges() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        for n in ["a", "b", "c"] {
            handle.publish(node_patch(n)).await.unwrap();
        }
        for (id, from, to) in [("e1", "a", "b"), ("e2", "b", "c")] {
            handle
                .publish(Event::EdgeCreated {
                    edge: run_event::Edge {
                        id: id.to_string(),
                        from: from.to_string(),
                        to: to.to_string(),
                        bidirectional: false,
                        edge_type: run_event::EdgeType::Handoff,
                        label: None,
                    },
                })
                .await
                .unwrap();
        }
        let envelopes = handle.delete_node("b").await.unwrap();
        let kinds: Vec<&str> = envelopes.iter().map(|e| e.event.kind()).collect();
        assert_eq!(kinds, vec!["node.deleted", "edge.deleted", "edge.deleted"]);
        let p = handle.projection().await;
        assert!(p.edges.is_empty());
        assert!(!p.nodes.contains_key("b"));
    }

    #[tokio::test]
    async fn telemetry_usage_publishes_derived_patches() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        handle.publish(node_patch("n1")).await.unwrap();
        let envelope = handle
            .publish(Event::TelemetryUsage {
                node_id: Some("n1".to_string()),
                usage: TokenUsage {
                    input_tokens: 7,
                    output_tokens: 3,
                },
            })
            .await
            .unwrap();
        // telemetry itself plus derived node.patch + run.patch, all logged.
        let logged = handle.read_all().await.unwrap();
        let kinds: Vec<&str> = logged.iter().map(|e| e.event.kind()).collect();
        assert_eq!(
            kinds[1..].to_vec(),
            vec!["telemetry.usage", "node.patch", "run.patch"]
        );
        assert_eq!(envelope.event.kind(), "telemetry.usage");
        let p = handle.projection().await;
        assert_eq!(p.nodes["n1"].usage.input_tokens, 7);
        assert_eq!(p.run.usage.output_tokens, 3);
    }

    #[tokio::test]
    async fn open_restores_from_snapshot_and_tail() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = RunStore::new(tmp.path());
            let handle = store.create("r1").unwrap();
            handle.publish(node_patch("n1")).await.unwrap();
            handle
                .post_user_message(user_message("r1", "n1", "queued"))
                .await
                .unwrap();
        }
        let store = RunStore::new(tmp.path());
        let handle = store.open("r1").unwrap();
        let p = handle.projection().await;
        assert_eq!(p.nodes["n1"].inbox_count, 1);
        assert_eq!(p.queue_len("n1"), 1);
    }

    #[tokio::test]
    async fn open_falls_back_to_replay_without_snapshot() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = RunStore::new(tmp.path());
            let handle = store.create("r1").unwrap();
            handle.publish(node_patch("n1")).await.unwrap();
        }
        let snapshot = tmp.path().join("runs/r1/run.json");
        std::fs::write(&snapshot, b"garbage").unwrap();
        let store = RunStore::new(tmp.path());
        let handle = store.open("r1").unwrap();
        assert!(handle.projection().await.nodes.contains_key("n1"));
    }

    #[tokio::test]
    async fn snapshot_restore_matches_full_replay() {
        let tmp = tempfile::tempdir().unwrap();
        {
            let store = RunStore::new(tmp.path());
            let handle = store.create("r1").unwrap();
            handle.publish(node_patch("a")).await.unwrap();
            handle.publish(node_patch("b")).await.unwrap();
            handle
                .post_user_message(user_message("r1", "a", "x"))
                .await
                .unwrap();
        }
        let via_snapshot = {
            let store = RunStore::new(tmp.path());
            store.open("r1").unwrap().projection().await
        };
        std::fs::remove_file(tmp.path().join("runs/r1/run.json")).unwrap();
        let via_replay = {
            let store = RunStore::new(tmp.path());
            store.open("r1").unwrap().projection().await
        };
        assert_eq!(via_snapshot, via_replay);
    }

    #[tokio::test]
    async fn remove_deletes_run_directory() {
        let (_tmp, store) = store();
        let handle = store.create("r1").unwrap();
        handle.publish(node_patch("n1")).await.unwrap();
        let dir = handle.dir().to_path_buf();
        assert!(dir.exists());
        store.remove("r1").unwrap();
        assert!(!dir.exists());
        assert!(store.get("r1").is_none());
    }
}
