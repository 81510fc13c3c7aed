use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::error::Result;
use conductor_core::types::{OutcomeCode, RunStatus};

use crate::state::{NodeStatus, RunSnapshot};

pub const RESULT_CARD_FILE: &str = "result-card.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolTally {
    pub ok: u32,
    pub fail: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CardFailure {
    pub node_id: String,
    pub status: NodeStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<OutcomeCode>,
    pub message: String,
}

/// End-of-run summary written next to the run's state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultCard {
    pub run_id: String,
    #[serde(default)]
    pub graph: Option<String>,
    pub status: RunStatus,
    pub code: OutcomeCode,
    pub exit_code: i32,
    pub nodes: usize,
    pub succeeded: usize,
    /// Routed calls per tool. A node's last routed call counts as a failure
    /// when the node did not succeed.
    pub tools: BTreeMap<String, ToolTally>,
    /// Unrouted requests per capability.
    pub blocked: BTreeMap<String, u32>,
    pub total_calls: u32,
    pub spend_usd: f64,
    pub failures: Vec<CardFailure>,
    pub generated_at: DateTime<Utc>,
}

impl ResultCard {
    pub fn from_snapshot(snapshot: &RunSnapshot) -> Self {
        let code = snapshot.outcome.unwrap_or(match snapshot.status {
            RunStatus::Succeeded => OutcomeCode::Success,
            _ => OutcomeCode::General,
        });

        let mut tools: BTreeMap<String, ToolTally> = BTreeMap::new();
        let mut blocked: BTreeMap<String, u32> = BTreeMap::new();
        let mut total_calls = 0;
        let mut failures = Vec::new();

        for node in snapshot.nodes.values() {
            let last_routed = node.decisions.iter().rposition(|d| d.is_routed());
            for (i, decision) in node.decisions.iter().enumerate() {
                let Some(tool) = decision.tool() else {
                    *blocked.entry(decision.capability.clone()).or_default() += 1;
                    continue;
                };
                total_calls += 1;
                let tally = tools.entry(tool.to_string()).or_default();
                if Some(i) == last_routed && node.status != NodeStatus::Succeeded {
                    tally.fail += 1;
                } else {
                    tally.ok += 1;
                }
            }

            match node.status {
                NodeStatus::FailedTerminal => failures.push(CardFailure {
                    node_id: node.id.clone(),
                    status: node.status,
                    code: node.failure_code(),
                    message: node
                        .last_error()
                        .map(|e| e.message.clone())
                        .unwrap_or_default(),
                }),
                NodeStatus::Skipped => failures.push(CardFailure {
                    node_id: node.id.clone(),
                    status: node.status,
                    code: None,
                    message: node.skip_reason.clone().unwrap_or_default(),
                }),
                _ => {}
            }
        }

        if let Some(gate) = snapshot.run_gate.as_ref().filter(|g| !g.passed()) {
            failures.push(CardFailure {
                node_id: "(run contract)".to_string(),
                status: NodeStatus::FailedTerminal,
                code: Some(gate.code),
                message: gate
                    .violations
                    .iter()
                    .map(|v| v.message.clone())
                    .collect::<Vec<_>>()
                    .join("; "),
            });
        }

        Self {
            run_id: snapshot.run_id.0.clone(),
            graph: snapshot.graph.name.clone(),
            status: snapshot.status,
            code,
            exit_code: code.exit_code(),
            nodes: snapshot.nodes.len(),
            succeeded: snapshot.count(NodeStatus::Succeeded),
            tools,
            blocked,
            total_calls,
            spend_usd: snapshot.ledger.total_usd(),
            failures,
            generated_at: Utc::now(),
        }
    }

    /// Write to `<runs_dir>/<run_id>/result-card.json`.
    pub fn write(&self, runs_dir: &Path) -> Result<PathBuf> {
        let dir = runs_dir.join(&self.run_id);
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(RESULT_CARD_FILE);
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(&path, json)?;
        Ok(path)
    }
}
