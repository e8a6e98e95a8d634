//! Role template loading: `docs/templates/<name>.md` under the run's
//! working folder, falling back to the configured system templates
//! directory. A missing template caches a placeholder; never an error.

use std::path::{Path, PathBuf};

use dashmap::DashMap;

pub struct TemplateCache {
    system_dir: Option<PathBuf>,
    cache: DashMap<String, String>,
}

impl TemplateCache {
    pub fn new(system_dir: Option<PathBuf>) -> Self {
        Self {
            system_dir,
            cache: DashMap::new(),
        }
    }

    /// Loads a role template by name, caching the first result (placeholder
    /// included).
    pub fn load(&self, cwd: &Path, name: &str) -> String {
        if let Some(text) = self.cache.get(name) {
            return text.clone();
        }
        let mut candidates = vec![cwd.join("docs/templates").join(format!("{}.md", name))];
        if let Some(system_dir) = &self.system_dir {
            candidates.push(system_dir.join(format!("{}.md", name)));
        }
        let text = candidates
            .iter()
            .find_map(|path| std::fs::read_to_string(path).ok())
            .unwrap_or_else(|| format!("Role template not found: {}", name));
        self.cache.insert(name.to_string(), text.clone());
        text
    }
}
