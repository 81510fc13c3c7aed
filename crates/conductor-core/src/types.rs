use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Unique run identifier.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct RunId(pub String);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn from_string(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role carried by a verified identity claim. Ordered by privilege.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Inspect run status only
    Viewer,
    /// Start, pause, resume and cancel runs
    Operator,
    /// Full access
    Admin,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Viewer => write!(f, "viewer"),
            Self::Operator => write!(f, "operator"),
            Self::Admin => write!(f, "admin"),
        }
    }
}

impl std::str::FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "viewer" => Ok(Self::Viewer),
            "operator" => Ok(Self::Operator),
            "admin" => Ok(Self::Admin),
            other => Err(format!("unknown role: {}", other)),
        }
    }
}

/// A verified `{subject, roles, tenant}` claim. Token verification happens
/// upstream; the claim is trusted as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentityClaim {
    pub subject: String,
    #[serde(default)]
    pub roles: BTreeSet<Role>,
    #[serde(default)]
    pub tenant: Option<String>,
}

impl IdentityClaim {
    pub fn new(subject: impl Into<String>) -> Self {
        Self {
            subject: subject.into(),
            roles: BTreeSet::new(),
            tenant: None,
        }
    }

    pub fn with_role(mut self, role: Role) -> Self {
        self.roles.insert(role);
        self
    }

    pub fn with_tenant(mut self, tenant: impl Into<String>) -> Self {
        self.tenant = Some(tenant.into());
        self
    }

    /// True if any held role is at least as privileged as `required`.
    pub fn has_role(&self, required: Role) -> bool {
        self.roles.iter().any(|r| *r >= required)
    }
}

/// Tool tier. Secondary tools need explicit consent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    #[default]
    Primary,
    Secondary,
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Primary => write!(f, "primary"),
            Self::Secondary => write!(f, "secondary"),
        }
    }
}

impl std::str::FromStr for Tier {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "primary" => Ok(Self::Primary),
            "secondary" => Ok(Self::Secondary),
            other => Err(format!("unknown tier: {}", other)),
        }
    }
}

/// Typed outcome of a run or command, mapped one-to-one onto process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCode {
    Success,
    General,
    ContractGate,
    FunctionalVerification,
    PerformanceGate,
    Startup,
    Authorization,
}

impl OutcomeCode {
    pub fn exit_code(self) -> i32 {
        match self {
            Self::Success => 0,
            Self::General => 1,
            Self::ContractGate => 2,
            Self::FunctionalVerification => 3,
            Self::PerformanceGate => 4,
            Self::Startup => 5,
            Self::Authorization => 6,
        }
    }

    /// Rank used to pick the single code summarizing a run.
    /// Authorization > startup > contract gate > functional > performance > general.
    pub fn severity(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::General => 1,
            Self::PerformanceGate => 2,
            Self::FunctionalVerification => 3,
            Self::ContractGate => 4,
            Self::Startup => 5,
            Self::Authorization => 6,
        }
    }

    /// Highest-severity code in `codes`, or `General` when empty.
    pub fn most_severe(codes: impl IntoIterator<Item = OutcomeCode>) -> OutcomeCode {
        codes
            .into_iter()
            .max_by_key(|c| c.severity())
            .unwrap_or(OutcomeCode::General)
    }
}

impl fmt::Display for OutcomeCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Success => "success",
            Self::General => "general",
            Self::ContractGate => "contract_gate",
            Self::FunctionalVerification => "functional_verification",
            Self::PerformanceGate => "performance_gate",
            Self::Startup => "startup",
            Self::Authorization => "authorization",
        };
        write!(f, "{}", s)
    }
}

/// Lifecycle of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Paused,
    Succeeded,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{}", s)
    }
}

/// Run-wide execution mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ExecutionMode {
    #[default]
    Deterministic,
    Delegated,
    Hybrid,
}

impl std::str::FromStr for ExecutionMode {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "deterministic" => Ok(Self::Deterministic),
            "delegated" => Ok(Self::Delegated),
            "hybrid" => Ok(Self::Hybrid),
            other => Err(format!("unknown execution mode: {}", other)),
        }
    }
}

/// Engine a single node runs on. Resolved once at schedule time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Engine {
    Deterministic,
    Delegated,
}

impl ExecutionMode {
    /// Pick the engine for a node. An explicit node override always wins.
    pub fn engine_for(
        self,
        capability: &str,
        hybrid_delegate: &[String],
        node_override: Option<Engine>,
    ) -> Engine {
        if let Some(engine) = node_override {
            return engine;
        }
        match self {
            Self::Deterministic => Engine::Deterministic,
            Self::Delegated => Engine::Delegated,
            Self::Hybrid => {
                if hybrid_delegate.iter().any(|c| c == capability) {
                    Engine::Delegated
                } else {
                    Engine::Deterministic
                }
            }
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Deterministic => write!(f, "deterministic"),
            Self::Delegated => write!(f, "delegated"),
        }
    }
}

/// Events emitted while a run progresses.
#[derive(Debug, Clone)]
pub enum RunEvent {
    RunStarted {
        run_id: RunId,
        nodes: usize,
        resumed: bool,
    },
    NodeReady {
        run_id: RunId,
        node_id: String,
    },
    NodeStarted {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        engine: Engine,
    },
    NodeRetrying {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        delay_ms: u64,
        error: String,
    },
    NodeSucceeded {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        elapsed_ms: u64,
    },
    NodeFailed {
        run_id: RunId,
        node_id: String,
        attempt: u32,
        code: OutcomeCode,
        error: String,
    },
    NodeSkipped {
        run_id: RunId,
        node_id: String,
        reason: String,
    },
    RouteDecided {
        run_id: RunId,
        node_id: String,
        capability: String,
        tool: Option<String>,
        cost_usd: f64,
    },
    ToolBlocked {
        run_id: RunId,
        node_id: String,
        capability: String,
        agent: String,
        reasons: Vec<String>,
    },
    GateEvaluated {
        run_id: RunId,
        node_id: Option<String>,
        passed: bool,
        violations: usize,
    },
    RunPaused {
        run_id: RunId,
    },
    RunResumed {
        run_id: RunId,
    },
    RunComplete {
        run_id: RunId,
        status: RunStatus,
        code: OutcomeCode,
        elapsed_ms: u64,
    },
    RunError {
        run_id: RunId,
        error: String,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> &RunId {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::NodeReady { run_id, .. }
            | Self::NodeStarted { run_id, .. }
            | Self::NodeRetrying { run_id, .. }
            | Self::NodeSucceeded { run_id, .. }
            | Self::NodeFailed { run_id, .. }
            | Self::NodeSkipped { run_id, .. }
            | Self::RouteDecided { run_id, .. }
            | Self::ToolBlocked { run_id, .. }
            | Self::GateEvaluated { run_id, .. }
            | Self::RunPaused { run_id }
            | Self::RunResumed { run_id }
            | Self::RunComplete { run_id, .. }
            | Self::RunError { run_id, .. } => run_id,
        }
    }
}
