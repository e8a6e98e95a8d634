//! Event envelope: `{id, runId, ts, type, …payload}`; one JSON object per
//! log line and per bus message.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::event::Event;

/// One published event with its identity, owning run, and timestamp.
/// The payload is flattened so the wire object is a single level:
/// `{"id":"…","runId":"…","ts":"…","type":"node.patch","nodeId":"…","patch":{…}}`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventEnvelope {
    pub id: String,
    pub run_id: String,
    pub ts: DateTime<Utc>,
    #[serde(flatten)]
    pub event: Event,
}

impl EventEnvelope {
    /// Wraps an event with a fresh id and the current time.
    pub fn new(run_id: impl Into<String>, event: Event) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            run_id: run_id.into(),
            ts: Utc::now(),
            event,
        }
    }

    /// Serializes to one compact JSON line (no trailing newline).
    pub fn to_json_line(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }

    /// Parses one JSON log line.
    pub fn from_json_line(line: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(line)
    }
}
