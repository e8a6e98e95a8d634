//! Projection snapshot: `run.json`, written after each publish as a
//! recovery optimization. A corrupt or missing snapshot falls back to full
//! log replay, so every failure here is a warning, never an error.

use std::path::Path;

use super::projection::RunProjection;

/// Writes the snapshot via a temp file + rename so readers never observe a
/// half-written file.
pub fn write_snapshot(path: &Path, projection: &RunProjection) -> std::io::Result<()> {
    let bytes = serde_json::to_vec(projection)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    let tmp = path.with_extension("json.tmp");
    std::fs::write(&tmp, bytes)?;
    std::fs::rename(&tmp, path)
}

/// Loads the snapshot, or `None` when it is missing or unreadable.
pub fn load_snapshot(path: &Path) -> Option<RunProjection> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "snapshot unreadable, falling back to replay");
            return None;
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(p) => Some(p),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "snapshot corrupt, falling back to replay");
            None
        }
    }
}
