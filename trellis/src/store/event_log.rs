//! Append-only per-run event log: one JSON envelope per line.

use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use run_event::EventEnvelope;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LogError {
    #[error("open log {path}: {source}")]
    Open {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("append event: {0}")]
    Append(std::io::Error),
    #[error("read log {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },
    #[error("encode event: {0}")]
    Encode(serde_json::Error),
}

/// Handle to one run's `events.jsonl`. The file is kept open in append
/// mode; every append writes a full line and flushes before returning, so
/// an event either made it to disk or the publish failed.
pub struct EventLog {
    path: PathBuf,
    file: File,
}

impl EventLog {
    /// Opens (or creates) the log at `path`, creating parent directories.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LogError> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| LogError::Open {
                path: path.clone(),
                source,
            })?;
        Ok(Self { path, file })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one envelope as a JSON line and flushes.
    pub fn append(&mut self, envelope: &EventEnvelope) -> Result<(), LogError> {
        let line = envelope.to_json_line().map_err(LogError::Encode)?;
        self.file
            .write_all(line.as_bytes())
            .and_then(|_| self.file.write_all(b"\n"))
            .and_then(|_| self.file.flush())
            .map_err(LogError::Append)
    }

    /// Reads every envelope from the log at `path`, in append order.
    ///
    /// A line that fails to parse ends the read: it can only be a torn
    /// tail from a crash mid-append, and everything before it is intact.
    pub fn read_all(path: &Path) -> Result<Vec<EventEnvelope>, LogError> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(LogError::Read {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        let reader = BufReader::new(file);
        let mut events = Vec::new();
        for line in reader.lines() {
            let line = line.map_err(|source| LogError::Read {
                path: path.to_path_buf(),
                source,
            })?;
            if line.trim().is_empty() {
                continue;
            }
            match EventEnvelope::from_json_line(&line) {
                Ok(env) => events.push(env),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "torn log tail, stopping replay");
                    break;
                }
            }
        }
        Ok(events)
    }
}
