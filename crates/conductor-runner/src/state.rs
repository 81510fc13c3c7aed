//! Run and node state, serialized whole into the snapshot store.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use conductor_core::config::AppConfig;
use conductor_core::types::{Engine, ExecutionMode, OutcomeCode, RunId, RunStatus};
use conductor_gate::{ArtifactSet, GateResult};
use conductor_router::{LedgerSnapshot, RouterDecision};

use crate::error::{FailureClass, NodeError};
use crate::graph::GraphSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeStatus {
    Pending,
    Ready,
    Running,
    Succeeded,
    FailedRetryable,
    FailedTerminal,
    Skipped,
}

impl NodeStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::FailedTerminal | Self::Skipped)
    }
}

impl std::fmt::Display for NodeStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Ready => "ready",
            Self::Running => "running",
            Self::Succeeded => "succeeded",
            Self::FailedRetryable => "failed-retryable",
            Self::FailedTerminal => "failed-terminal",
            Self::Skipped => "skipped",
        };
        write!(f, "{}", s)
    }
}

/// One failed attempt.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub attempt: u32,
    pub class: FailureClass,
    pub code: OutcomeCode,
    pub message: String,
}

impl FailureRecord {
    pub fn from_error(attempt: u32, error: &NodeError) -> Self {
        Self {
            attempt,
            class: error.class(),
            code: error.code(),
            message: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeState {
    pub id: String,
    pub status: NodeStatus,
    /// Attempts started so far. Preserved across resume.
    pub attempts: u32,
    #[serde(default)]
    pub engine: Option<Engine>,
    #[serde(default)]
    pub ready_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub artifacts: ArtifactSet,
    /// Every routing decision made for this node, across attempts.
    #[serde(default)]
    pub decisions: Vec<RouterDecision>,
    #[serde(default)]
    pub gate: Option<GateResult>,
    #[serde(default)]
    pub errors: Vec<FailureRecord>,
    #[serde(default)]
    pub skip_reason: Option<String>,
}

impl NodeState {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            status: NodeStatus::Pending,
            attempts: 0,
            engine: None,
            ready_at: None,
            started_at: None,
            finished_at: None,
            artifacts: ArtifactSet::new(),
            decisions: Vec::new(),
            gate: None,
            errors: Vec::new(),
            skip_reason: None,
        }
    }

    /// Attempts beyond the first.
    pub fn retries(&self) -> u32 {
        self.attempts.saturating_sub(1)
    }

    pub fn last_error(&self) -> Option<&FailureRecord> {
        self.errors.last()
    }

    /// Code this node contributes to the run outcome, if it failed.
    pub fn failure_code(&self) -> Option<OutcomeCode> {
        match self.status {
            NodeStatus::FailedTerminal => {
                Some(self.last_error().map(|e| e.code).unwrap_or(OutcomeCode::General))
            }
            _ => None,
        }
    }
}

/// Options a run was submitted with. Persisted so resume behaves the same.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunOptions {
    pub concurrency: usize,
    pub mode: ExecutionMode,
    pub agent: String,
    #[serde(default)]
    pub tenant: Option<String>,
    /// Dry routing: decisions are computed but spend is never committed.
    #[serde(default)]
    pub test_mode: bool,
}

impl RunOptions {
    pub fn new(concurrency: usize, mode: ExecutionMode) -> Self {
        Self {
            concurrency: concurrency.max(1),
            mode,
            agent: "default".to_string(),
            tenant: None,
            test_mode: false,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.runner.concurrency, config.runner.mode)
            .with_agent(config.runner.agent.clone())
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = agent.into();
        self
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.test_mode = test_mode;
        self
    }
}

impl Default for RunOptions {
    fn default() -> Self {
        Self::new(4, ExecutionMode::Deterministic)
    }
}

/// Everything needed to inspect or resume a run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub run_id: RunId,
    pub graph: GraphSpec,
    pub options: RunOptions,
    pub status: RunStatus,
    pub nodes: BTreeMap<String, NodeState>,
    #[serde(default)]
    pub ledger: LedgerSnapshot,
    /// Result of the graph-level contract, once evaluated.
    #[serde(default)]
    pub run_gate: Option<GateResult>,
    #[serde(default)]
    pub outcome: Option<OutcomeCode>,
    #[serde(default)]
    pub started_by: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl RunSnapshot {
    pub fn new(run_id: RunId, graph: GraphSpec, options: RunOptions) -> Self {
        let nodes = graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), NodeState::new(n.id.clone())))
            .collect();
        let now = Utc::now();
        Self {
            run_id,
            graph,
            options,
            status: RunStatus::Running,
            nodes,
            ledger: LedgerSnapshot::default(),
            run_gate: None,
            outcome: None,
            started_by: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn node(&self, id: &str) -> Option<&NodeState> {
        self.nodes.get(id)
    }

    pub fn count(&self, status: NodeStatus) -> usize {
        self.nodes.values().filter(|n| n.status == status).count()
    }

    /// Put interrupted nodes back in line. Attempt counts are kept.
    pub fn requeue_interrupted(&mut self) -> usize {
        let mut requeued = 0;
        for node in self.nodes.values_mut() {
            if matches!(
                node.status,
                NodeStatus::Running | NodeStatus::Ready | NodeStatus::FailedRetryable
            ) {
                node.status = NodeStatus::Pending;
                node.ready_at = None;
                node.started_at = None;
                requeued += 1;
            }
        }
        requeued
    }

    /// Union of every succeeded node's artifacts, later nodes winning on id clashes.
    pub fn collected_artifacts(&self, order: &[String]) -> ArtifactSet {
        let mut all = ArtifactSet::new();
        for id in order {
            if let Some(node) = self.nodes.get(id) {
                if node.status == NodeStatus::Succeeded {
                    all.merge(node.artifacts.clone());
                }
            }
        }
        all
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
