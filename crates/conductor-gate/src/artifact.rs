use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Something a node produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Artifact {
    Json(Value),
    Text(String),
    /// A file on disk. Relative paths resolve against the evaluator's base directory.
    File(PathBuf),
}

impl Artifact {
    pub fn json(value: Value) -> Self {
        Self::Json(value)
    }

    pub fn text(text: impl Into<String>) -> Self {
        Self::Text(text.into())
    }

    pub fn file(path: impl Into<PathBuf>) -> Self {
        Self::File(path.into())
    }

    fn resolve(path: &Path, base: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            base.join(path)
        }
    }

    /// Inline artifacts always exist; files must be present on disk.
    pub fn exists(&self, base: &Path) -> bool {
        match self {
            Self::File(path) => Self::resolve(path, base).exists(),
            _ => true,
        }
    }

    /// Parse the artifact as structured JSON.
    pub fn structured(&self, base: &Path) -> Result<Value, String> {
        match self {
            Self::Json(value) => Ok(value.clone()),
            Self::Text(text) => serde_json::from_str(text).map_err(|e| e.to_string()),
            Self::File(path) => {
                let full = Self::resolve(path, base);
                let content = std::fs::read_to_string(&full)
                    .map_err(|e| format!("{}: {}", full.display(), e))?;
                serde_json::from_str(&content).map_err(|e| format!("{}: {}", full.display(), e))
            }
        }
    }

    /// Rough size for logs and result cards.
    pub fn preview(&self, max_len: usize) -> String {
        let s = match self {
            Self::Json(value) => value.to_string(),
            Self::Text(text) => text.clone(),
            Self::File(path) => path.display().to_string(),
        };
        if s.len() <= max_len {
            s
        } else {
            let mut end = max_len;
            while !s.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}...", &s[..end])
        }
    }
}

/// Artifacts keyed by id, plus the startup status of whatever produced them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ArtifactSet {
    #[serde(default)]
    pub artifacts: BTreeMap<String, Artifact>,
    /// Set when the system under test failed to start.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub startup_failure: Option<String>,
}

impl ArtifactSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, id: impl Into<String>, artifact: Artifact) -> Self {
        self.insert(id, artifact);
        self
    }

    pub fn insert(&mut self, id: impl Into<String>, artifact: Artifact) {
        self.artifacts.insert(id.into(), artifact);
    }

    pub fn get(&self, id: &str) -> Option<&Artifact> {
        self.artifacts.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.artifacts.contains_key(id)
    }

    pub fn mark_startup_failed(&mut self, reason: impl Into<String>) {
        self.startup_failure = Some(reason.into());
    }

    /// Fold `other` in. Later artifacts replace earlier ones with the same id.
    pub fn merge(&mut self, other: ArtifactSet) {
        self.artifacts.extend(other.artifacts);
        if other.startup_failure.is_some() {
            self.startup_failure = other.startup_failure;
        }
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.artifacts.keys().map(|k| k.as_str())
    }

    pub fn len(&self) -> usize {
        self.artifacts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.artifacts.is_empty()
    }
}
