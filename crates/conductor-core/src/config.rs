use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{ConductorError, Result};
use crate::types::ExecutionMode;

/// Top-level Conductor configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub runner: RunnerConfig,
    /// Default retry policy for nodes that do not declare their own.
    #[serde(default)]
    pub retry: RetryConfig,
    #[serde(default)]
    pub delegate: DelegateConfig,
    /// Runtime JSONL logging configuration.
    #[serde(default)]
    pub log: Option<LogConfig>,
    /// Path to the policy file (TOML or JSON).
    #[serde(default)]
    pub policy: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunnerConfig {
    /// Maximum number of nodes executing at once.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Agent identity nodes route as when they do not name one.
    #[serde(default = "default_agent")]
    pub agent: String,
    /// Root for the snapshot database and result cards.
    #[serde(default = "default_state_dir")]
    pub state_dir: String,
    /// Capabilities that run on the delegated engine in hybrid mode.
    #[serde(default)]
    pub hybrid_delegate: Vec<String>,
    /// Per-node deadline when the node does not declare one.
    #[serde(default = "default_node_timeout_ms")]
    pub node_timeout_ms: u64,
}

impl Default for RunnerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            mode: ExecutionMode::default(),
            agent: default_agent(),
            state_dir: default_state_dir(),
            hybrid_delegate: Vec::new(),
            node_timeout_ms: default_node_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
        }
    }
}

/// Caps for the delegated request/response loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DelegateConfig {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: u32,
    #[serde(default = "default_max_duration")]
    pub max_duration_secs: u64,
    #[serde(default = "default_max_cost_usd")]
    pub max_cost_usd: f64,
}

impl Default for DelegateConfig {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            max_duration_secs: default_max_duration(),
            max_cost_usd: default_max_cost_usd(),
        }
    }
}

/// JSONL runtime logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// Enable runtime logging (default: true when section is present).
    #[serde(default = "default_log_enabled")]
    pub enabled: bool,
    /// Directory for log files. Default: <state_dir>/logs
    #[serde(default)]
    pub log_dir: Option<String>,
    /// Verbosity: 1=run summary, 2=per-node, 3=per-routing decision.
    #[serde(default = "default_log_level")]
    pub level: u8,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: default_log_enabled(),
            log_dir: None,
            level: default_log_level(),
        }
    }
}

fn default_concurrency() -> usize { 4 }
fn default_agent() -> String { "default".to_string() }
fn default_state_dir() -> String { "~/.conductor".to_string() }
fn default_node_timeout_ms() -> u64 { 300_000 }

fn default_max_attempts() -> u32 { 3 }
fn default_initial_backoff() -> u64 { 500 }
fn default_max_backoff() -> u64 { 30_000 }

fn default_max_iterations() -> u32 { 8 }
fn default_max_duration() -> u64 { 600 }
fn default_max_cost_usd() -> f64 { 1.0 }

fn default_log_enabled() -> bool { true }
fn default_log_level() -> u8 { 2 }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;

        // Expand ${ENV_VAR} references
        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| ConductorError::Config(e.to_string()))
    }

    /// Resolve the state directory (expand ~).
    pub fn state_dir(&self) -> PathBuf {
        expand_home(&self.runner.state_dir)
    }

    /// SQLite database holding run snapshots.
    pub fn snapshot_db_path(&self) -> PathBuf {
        self.state_dir().join("runs.db")
    }

    /// Directory for JSONL run logs.
    pub fn log_dir(&self) -> PathBuf {
        match self.log.as_ref().and_then(|l| l.log_dir.as_deref()) {
            Some(dir) => expand_home(dir),
            None => self.state_dir().join("logs"),
        }
    }

    /// Directory that receives per-run result cards.
    pub fn runs_dir(&self) -> PathBuf {
        self.state_dir().join("runs")
    }
}

/// Load a structured document (TOML, or JSON when the extension is `.json`)
/// with `${ENV_VAR}` expansion.
pub fn load_document<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let content = std::fs::read_to_string(path)
        .map_err(|_| ConductorError::ConfigNotFound(path.display().to_string()))?;
    let expanded = expand_env_vars(&content);

    let is_json = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        serde_json::from_str(&expanded)
            .map_err(|e| ConductorError::Config(format!("{}: {}", path.display(), e)))
    } else {
        toml::from_str(&expanded)
            .map_err(|e| ConductorError::Config(format!("{}: {}", path.display(), e)))
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next(); // consume '{'
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                Err(_) => {
                    // Keep original if env var not set
                    result.push_str(&format!("${{{}}}", var_name));
                }
            }
        } else {
            result.push(c);
        }
    }
    result
}

fn expand_home(path: &str) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = std::env::var("HOME").ok().map(PathBuf::from) {
            return home.join(rest);
        }
    }
    PathBuf::from(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_CONDUCTOR_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_CONDUCTOR_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_CONDUCTOR_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_CONDUCTOR_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_CONDUCTOR_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.runner.concurrency, 4);
        assert_eq!(config.runner.mode, ExecutionMode::Deterministic);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.delegate.max_iterations, 8);
        assert!(config.log.is_none());
        assert!(config.policy.is_none());
    }

    #[test]
    fn test_log_section_defaults() {
        let config: AppConfig = toml::from_str("[log]\n").unwrap();
        let log = config.log.unwrap();
        assert!(log.enabled);
        assert_eq!(log.level, 2);
    }

    #[test]
    fn test_load_document_json_by_extension() {
        #[derive(Deserialize)]
        struct Doc {
            name: String,
        }

        let mut tmp = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
        tmp.write_all(br#"{"name": "graph"}"#).unwrap();
        let doc: Doc = load_document(tmp.path()).unwrap();
        assert_eq!(doc.name, "graph");
    }

    #[test]
    fn test_load_document_missing_file() {
        let err = load_document::<AppConfig>(Path::new("/nonexistent/conductor.toml"))
            .unwrap_err();
        assert!(matches!(err, ConductorError::ConfigNotFound(_)));
    }
}
