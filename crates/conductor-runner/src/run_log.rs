use std::path::PathBuf;

use chrono::Utc;
use regex::Regex;
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::event::EventBus;
use conductor_core::types::{RunEvent, RunId};

/// Default patterns for credentials that must never reach the log.
const SECRET_PATTERNS: &[&str] = &[
    r#"(?i)(api[_-]?key|token|password|secret)["']?\s*[:=]\s*["']?([A-Za-z0-9._-]{10,})"#,
    r"(?i)(authorization)\s*:\s*bearer\s+([A-Za-z0-9._~+/=-]{10,})",
];

/// Masks credential-looking values in free-form text.
pub struct Redactor {
    patterns: Vec<Regex>,
}

impl Redactor {
    pub fn new() -> Self {
        Self::with_patterns(SECRET_PATTERNS)
    }

    pub fn with_patterns(patterns: &[&str]) -> Self {
        let patterns = patterns
            .iter()
            .filter_map(|p| match Regex::new(p) {
                Ok(re) => Some(re),
                Err(e) => {
                    warn!(pattern = %p, error = %e, "Invalid redaction pattern, skipping");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Replace the value part of every match with `REDACTED`, keeping the key.
    pub fn redact(&self, text: &str) -> String {
        let mut out = text.to_string();
        for re in &self.patterns {
            out = re.replace_all(&out, "${1}:REDACTED").into_owned();
        }
        out
    }
}

impl Default for Redactor {
    fn default() -> Self {
        Self::new()
    }
}

/// JSONL run logger.
///
/// Subscribes to the EventBus and writes one JSON object per line for a
/// single run. Append-only, flushed per entry, so a crash loses at most the
/// line being written.
pub struct RunLogger {
    log_dir: PathBuf,
    level: u8,
    redactor: Redactor,
}

#[derive(Serialize)]
struct LogEntry {
    timestamp: String,
    run_id: String,
    event_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    node_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    detail: Option<serde_json::Value>,
}

impl RunLogger {
    /// `level`: 1=run summary, 2=per-node transitions, 3=per-routing decision.
    pub fn new(log_dir: PathBuf, level: u8) -> Self {
        Self {
            log_dir,
            level,
            redactor: Redactor::new(),
        }
    }

    /// Subscribe now and write the run's log on a background task.
    pub fn start(
        self,
        event_bus: &EventBus,
        run_id: RunId,
        cancel: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        let rx = event_bus.subscribe();
        tokio::spawn(self.write_loop(rx, run_id, cancel))
    }

    /// Writes `{log_dir}/{run_id}/{timestamp}.jsonl` until cancellation or the
    /// run's RunComplete/RunError.
    async fn write_loop(
        self,
        mut rx: broadcast::Receiver<RunEvent>,
        run_id: RunId,
        cancel: CancellationToken,
    ) {
        let run_dir = self.log_dir.join(&run_id.0);
        if let Err(e) = tokio::fs::create_dir_all(&run_dir).await {
            error!(error = %e, "Failed to create log directory");
            return;
        }

        let timestamp = Utc::now().format("%Y%m%d_%H%M%S").to_string();
        let log_path = run_dir.join(format!("{}.jsonl", timestamp));

        let file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .await
        {
            Ok(f) => f,
            Err(e) => {
                error!(error = %e, path = %log_path.display(), "Failed to open log file");
                return;
            }
        };

        info!(path = %log_path.display(), "RunLogger started");
        let mut writer = tokio::io::BufWriter::new(file);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("RunLogger cancelled");
                    break;
                }
                result = rx.recv() => {
                    match result {
                        Ok(event) => {
                            if event.run_id() != &run_id {
                                continue;
                            }
                            let Some(entry) = self.event_to_entry(&event) else {
                                continue;
                            };

                            if let Ok(json) = serde_json::to_string(&entry) {
                                let line = format!("{}\n", json);
                                if let Err(e) = writer.write_all(line.as_bytes()).await {
                                    error!(error = %e, "Failed to write log entry");
                                    break;
                                }
                                if let Err(e) = writer.flush().await {
                                    error!(error = %e, "Failed to flush log");
                                }
                            }

                            if matches!(event, RunEvent::RunComplete { .. } | RunEvent::RunError { .. }) {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            debug!(skipped = n, "RunLogger lagged, skipped events");
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            debug!("EventBus closed, RunLogger stopping");
                            break;
                        }
                    }
                }
            }
        }

        writer.flush().await.ok();
        debug!(path = %log_path.display(), "RunLogger finished");
    }

    /// None when the event is filtered out by level.
    fn event_to_entry(&self, event: &RunEvent) -> Option<LogEntry> {
        let entry = |event_type: &str, node_id: Option<&str>, detail: Option<serde_json::Value>| {
            LogEntry {
                timestamp: Utc::now().to_rfc3339(),
                run_id: event.run_id().0.clone(),
                event_type: event_type.to_string(),
                node_id: node_id.map(String::from),
                detail,
            }
        };

        match event {
            // L1: run summary
            RunEvent::RunStarted { nodes, resumed, .. } => Some(entry(
                "run_started",
                None,
                Some(serde_json::json!({ "nodes": nodes, "resumed": resumed })),
            )),
            RunEvent::RunComplete {
                status,
                code,
                elapsed_ms,
                ..
            } => Some(entry(
                "run_complete",
                None,
                Some(serde_json::json!({
                    "status": status,
                    "code": code,
                    "exit_code": code.exit_code(),
                    "elapsed_ms": elapsed_ms,
                })),
            )),
            RunEvent::RunError { error, .. } => Some(entry(
                "run_error",
                None,
                Some(serde_json::json!({ "error": self.redactor.redact(error) })),
            )),
            RunEvent::NodeFailed {
                node_id,
                attempt,
                code,
                error,
                ..
            } => Some(entry(
                "node_failed",
                Some(node_id.as_str()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "code": code,
                    "error": truncate_str(&self.redactor.redact(error), 500),
                })),
            )),
            RunEvent::RunPaused { .. } => Some(entry("run_paused", None, None)),
            RunEvent::RunResumed { .. } => Some(entry("run_resumed", None, None)),

            // L2: node transitions
            RunEvent::NodeStarted {
                node_id,
                attempt,
                engine,
                ..
            } if self.level >= 2 => Some(entry(
                "node_started",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "attempt": attempt, "engine": engine })),
            )),
            RunEvent::NodeRetrying {
                node_id,
                attempt,
                delay_ms,
                error,
                ..
            } if self.level >= 2 => Some(entry(
                "node_retrying",
                Some(node_id.as_str()),
                Some(serde_json::json!({
                    "attempt": attempt,
                    "delay_ms": delay_ms,
                    "error": truncate_str(&self.redactor.redact(error), 500),
                })),
            )),
            RunEvent::NodeSucceeded {
                node_id,
                attempt,
                elapsed_ms,
                ..
            } if self.level >= 2 => Some(entry(
                "node_succeeded",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "attempt": attempt, "elapsed_ms": elapsed_ms })),
            )),
            RunEvent::NodeSkipped {
                node_id, reason, ..
            } if self.level >= 2 => Some(entry(
                "node_skipped",
                Some(node_id.as_str()),
                Some(serde_json::json!({ "reason": reason })),
            )),
            RunEvent::GateEvaluated {
                node_id,
                passed,
                violations,
                ..
            } if self.level >= 2 => Some(entry(
                "gate_evaluated",
                node_id.as_deref(),
                Some(serde_json::json!({ "passed": passed, "violations": violations })),
            )),
            // Blocked calls are an audit trail, kept from level 2 up.
            RunEvent::ToolBlocked {
                node_id,
                capability,
                agent,
                reasons,
                ..
            } if self.level >= 2 => Some(entry(
                "tool_blocked",
                Some(node_id.as_str()),
                Some(serde_json::json!({
                    "capability": capability,
                    "agent": agent,
                    "reasons": reasons
                        .iter()
                        .map(|r| self.redactor.redact(r))
                        .collect::<Vec<_>>(),
                })),
            )),

            // L3: routing decisions
            RunEvent::NodeReady { node_id, .. } if self.level >= 3 => {
                Some(entry("node_ready", Some(node_id.as_str()), None))
            }
            RunEvent::RouteDecided {
                node_id,
                capability,
                tool,
                cost_usd,
                ..
            } if self.level >= 3 => Some(entry(
                "route_decided",
                Some(node_id.as_str()),
                Some(serde_json::json!({
                    "capability": capability,
                    "tool": tool,
                    "cost_usd": cost_usd,
                })),
            )),

            _ => None,
        }
    }
}

/// Truncate a string for logging, on a char boundary.
fn truncate_str(s: &str, max_len: usize) -> String {
    if s.len() <= max_len {
        return s.to_string();
    }
    let mut end = max_len;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    format!("{}...", &s[..end])
}
