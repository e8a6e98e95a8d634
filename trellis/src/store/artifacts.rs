//! Artifact blob store: writes a named blob under a run's artifacts
//! directory and returns its path. Blobs are addressed
//! `<artifactId>-<safeName>` so names cannot escape the directory.

use std::path::{Path, PathBuf};

/// Blob store rooted at one run's `artifacts/` directory.
pub struct ArtifactStore {
    dir: PathBuf,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes `content` under `<artifactId>-<safeName>` and returns the
    /// absolute path.
    pub fn write(
        &self,
        artifact_id: &str,
        name: &str,
        content: &[u8],
    ) -> std::io::Result<PathBuf> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.dir.join(format!("{}-{}", artifact_id, safe_name(name)));
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

/// Reduces a display name to `[A-Za-z0-9._-]`; everything else becomes `_`.
pub fn safe_name(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "artifact".to_string()
    } else {
        cleaned
    }
}
