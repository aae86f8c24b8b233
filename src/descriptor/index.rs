//! Identifier to descriptor lookup through the local cache index.
//!
//! The cache directory holds installed descriptors and an `index.json`
//! mapping each sphere identifier to a file name inside the directory:
//!
//! ```json
//! { "hello-world": "hello-world-1.0.sphere" }
//! ```
//!
//! The index is read at most once per invocation, on the first identifier
//! lookup. It is never written by the engine.
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use tracing::debug;

use crate::error::SphereError;

const INDEX_FILE: &str = "index.json";

pub struct SphereIndex {
    cache_dir: PathBuf,
    entries: OnceLock<Result<HashMap<String, String>, String>>,
}

impl SphereIndex {
    pub fn new(cache_dir: impl Into<PathBuf>) -> Self {
        Self {
            cache_dir: cache_dir.into(),
            entries: OnceLock::new(),
        }
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    pub fn index_path(&self) -> PathBuf {
        self.cache_dir.join(INDEX_FILE)
    }

    fn entries(&self) -> &Result<HashMap<String, String>, String> {
        self.entries.get_or_init(|| {
            let path = self.index_path();
            let content = std::fs::read_to_string(&path)
                .map_err(|e| format!("failed to read cache index at '{}': {e}", path.display()))?;
            let entries: HashMap<String, String> = serde_json::from_str(&content)
                .map_err(|e| format!("failed to parse cache index at '{}': {e}", path.display()))?;
            debug!("Loaded cache index {} ({} entries)", path.display(), entries.len());
            Ok(entries)
        })
    }

    /// Resolves `id` (aliased as `alias` in the descriptor at `from`) to a
    /// canonical descriptor path.
    pub fn resolve(&self, id: &str, alias: &str, from: &Path) -> Result<PathBuf, SphereError> {
        let unresolved = |reason: String| SphereError::UnresolvedReference {
            reference: format!("id:{id}"),
            from: Some(from.to_path_buf()),
            reason,
        };

        let entries = self.entries().as_ref().map_err(|e| unresolved(e.clone()))?;
        let filename = entries.get(id).ok_or_else(|| {
            unresolved(format!(
                "dependency id '{id}' (aliased as '{alias}') not found in cache index '{}'",
                self.index_path().display()
            ))
        })?;

        let candidate = self.cache_dir.join(filename);
        std::fs::canonicalize(&candidate).map_err(|e| {
            unresolved(format!(
                "dependency file '{}' for id '{id}' (aliased as '{alias}') is not installed: {e}",
                candidate.display()
            ))
        })
    }
}
