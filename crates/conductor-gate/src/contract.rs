use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use conductor_core::types::OutcomeCode;

/// What a contract verifies. Decides the outcome code of its violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ContractKind {
    #[default]
    Contract,
    Functional,
    Performance,
}

impl ContractKind {
    pub fn outcome_code(self) -> OutcomeCode {
        match self {
            Self::Contract => OutcomeCode::ContractGate,
            Self::Functional => OutcomeCode::FunctionalVerification,
            Self::Performance => OutcomeCode::PerformanceGate,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RequiredArtifact {
    pub id: String,
    /// JSON Schema subset the artifact must satisfy.
    #[serde(default)]
    pub schema: Option<Value>,
}

impl RequiredArtifact {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            schema: None,
        }
    }

    pub fn with_schema(mut self, schema: Value) -> Self {
        self.schema = Some(schema);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdOp {
    #[serde(alias = "<")]
    Lt,
    #[serde(alias = "<=")]
    Le,
    #[serde(alias = ">")]
    Gt,
    #[serde(alias = ">=")]
    Ge,
    #[serde(alias = "==")]
    Eq,
    #[serde(alias = "!=")]
    Ne,
}

impl ThresholdOp {
    pub fn holds(self, measured: f64, expected: f64) -> bool {
        const EPS: f64 = 1e-9;
        match self {
            Self::Lt => measured < expected,
            Self::Le => measured <= expected,
            Self::Gt => measured > expected,
            Self::Ge => measured >= expected,
            Self::Eq => (measured - expected).abs() < EPS,
            Self::Ne => (measured - expected).abs() >= EPS,
        }
    }
}

impl fmt::Display for ThresholdOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Lt => "<",
            Self::Le => "<=",
            Self::Gt => ">",
            Self::Ge => ">=",
            Self::Eq => "==",
            Self::Ne => "!=",
        };
        write!(f, "{}", s)
    }
}

/// A numeric measurement read from an artifact and compared to a bound.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Threshold {
    pub artifact: String,
    /// JSON pointer into the artifact. Empty means the artifact itself.
    #[serde(default)]
    pub pointer: String,
    pub op: ThresholdOp,
    pub value: f64,
}

impl Threshold {
    pub fn new(
        artifact: impl Into<String>,
        pointer: impl Into<String>,
        op: ThresholdOp,
        value: f64,
    ) -> Self {
        Self {
            artifact: artifact.into(),
            pointer: pointer.into(),
            op,
            value,
        }
    }
}

/// Required artifacts and threshold assertions for a node or a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ArtifactContract {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub kind: ContractKind,
    #[serde(default)]
    pub required: Vec<RequiredArtifact>,
    #[serde(default)]
    pub thresholds: Vec<Threshold>,
}

impl ArtifactContract {
    pub fn new(kind: ContractKind) -> Self {
        Self {
            kind,
            ..Default::default()
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }

    pub fn require(mut self, artifact: RequiredArtifact) -> Self {
        self.required.push(artifact);
        self
    }

    pub fn threshold(mut self, threshold: Threshold) -> Self {
        self.thresholds.push(threshold);
        self
    }
}
