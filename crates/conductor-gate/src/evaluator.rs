use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use conductor_core::types::OutcomeCode;

use crate::artifact::{Artifact, ArtifactSet};
use crate::contract::{ArtifactContract, Threshold};
use crate::schema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ViolationCategory {
    MissingArtifact,
    SchemaInvalid,
    ThresholdViolated,
    StartupFailed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Violation {
    pub category: ViolationCategory,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<String>,
    pub message: String,
    pub code: OutcomeCode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GateStatus {
    Pass,
    Fail,
}

/// Outcome of one gate evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GateResult {
    #[serde(default)]
    pub contract: Option<String>,
    pub status: GateStatus,
    /// Highest-severity code among the violations, or `Success`.
    pub code: OutcomeCode,
    pub violations: Vec<Violation>,
    pub evaluated_at: DateTime<Utc>,
}

impl GateResult {
    pub fn passed(&self) -> bool {
        self.status == GateStatus::Pass
    }

    pub fn count(&self, category: ViolationCategory) -> usize {
        self.violations
            .iter()
            .filter(|v| v.category == category)
            .count()
    }
}

/// Checks artifact sets against contracts, reporting every violation in one pass.
#[derive(Debug, Clone)]
pub struct GateEvaluator {
    base_dir: PathBuf,
}

impl GateEvaluator {
    pub fn new() -> Self {
        Self {
            base_dir: PathBuf::from("."),
        }
    }

    /// Directory relative file artifacts resolve against.
    pub fn with_base_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.base_dir = dir.into();
        self
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn evaluate(&self, contract: &ArtifactContract, artifacts: &ArtifactSet) -> GateResult {
        let code = contract.kind.outcome_code();
        let mut violations = Vec::new();
        let mut missing: BTreeSet<&str> = BTreeSet::new();

        if let Some(reason) = &artifacts.startup_failure {
            violations.push(Violation {
                category: ViolationCategory::StartupFailed,
                artifact: None,
                message: format!("startup failed: {}", reason),
                code: OutcomeCode::Startup,
            });
        }

        for required in &contract.required {
            let artifact = match self.present(artifacts, &required.id) {
                Ok(a) => a,
                Err(message) => {
                    missing.insert(required.id.as_str());
                    violations.push(Violation {
                        category: ViolationCategory::MissingArtifact,
                        artifact: Some(required.id.clone()),
                        message,
                        code,
                    });
                    continue;
                }
            };

            let Some(schema) = &required.schema else {
                continue;
            };
            match artifact.structured(&self.base_dir) {
                Ok(value) => {
                    for issue in schema::validate(schema, &value) {
                        violations.push(Violation {
                            category: ViolationCategory::SchemaInvalid,
                            artifact: Some(required.id.clone()),
                            message: issue,
                            code,
                        });
                    }
                }
                Err(e) => violations.push(Violation {
                    category: ViolationCategory::SchemaInvalid,
                    artifact: Some(required.id.clone()),
                    message: format!("not valid JSON: {}", e),
                    code,
                }),
            }
        }

        for threshold in &contract.thresholds {
            // Already reported missing; one violation per absent artifact.
            if missing.contains(threshold.artifact.as_str()) {
                continue;
            }
            let artifact = match self.present(artifacts, &threshold.artifact) {
                Ok(a) => a,
                Err(message) => {
                    missing.insert(threshold.artifact.as_str());
                    violations.push(Violation {
                        category: ViolationCategory::MissingArtifact,
                        artifact: Some(threshold.artifact.clone()),
                        message,
                        code,
                    });
                    continue;
                }
            };
            if let Some(message) = self.check_threshold(threshold, artifact) {
                violations.push(Violation {
                    category: ViolationCategory::ThresholdViolated,
                    artifact: Some(threshold.artifact.clone()),
                    message,
                    code,
                });
            }
        }

        let status = if violations.is_empty() {
            GateStatus::Pass
        } else {
            GateStatus::Fail
        };
        let result_code = match status {
            GateStatus::Pass => OutcomeCode::Success,
            GateStatus::Fail => OutcomeCode::most_severe(violations.iter().map(|v| v.code)),
        };

        debug!(
            contract = contract.id.as_deref().unwrap_or("-"),
            violations = violations.len(),
            "Gate evaluated"
        );

        GateResult {
            contract: contract.id.clone(),
            status,
            code: result_code,
            violations,
            evaluated_at: Utc::now(),
        }
    }

    fn present<'a>(&self, artifacts: &'a ArtifactSet, id: &str) -> Result<&'a Artifact, String> {
        match artifacts.get(id) {
            None => Err(format!("required artifact '{}' was not produced", id)),
            Some(artifact) if !artifact.exists(&self.base_dir) => Err(format!(
                "artifact '{}' points at a file that does not exist: {}",
                id,
                artifact.preview(200)
            )),
            Some(artifact) => Ok(artifact),
        }
    }

    /// Returns a message when the threshold does not hold.
    fn check_threshold(&self, threshold: &Threshold, artifact: &Artifact) -> Option<String> {
        let value = match artifact.structured(&self.base_dir) {
            Ok(v) => v,
            Err(e) => return Some(format!("cannot read measurement: {}", e)),
        };
        let measured = match value.pointer(&threshold.pointer).and_then(|v| v.as_f64()) {
            Some(m) => m,
            None => {
                return Some(format!(
                    "measurement at '{}' is missing or not numeric",
                    threshold.pointer
                ))
            }
        };
        if threshold.op.holds(measured, threshold.value) {
            None
        } else {
            Some(format!(
                "{}{} = {} violates {} {}",
                threshold.artifact, threshold.pointer, measured, threshold.op, threshold.value
            ))
        }
    }
}

impl Default for GateEvaluator {
    fn default() -> Self {
        Self::new()
    }
}
