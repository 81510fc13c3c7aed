use thiserror::Error;

use crate::types::OutcomeCode;

#[derive(Debug, Error)]
pub enum ConductorError {
    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    #[error("Invalid policy: {0}")]
    PolicyInvalid(String),

    // Graph errors
    #[error("Invalid graph: {0}")]
    GraphInvalid(String),

    #[error("Graph contains a cycle through: {0}")]
    CycleDetected(String),

    // Run errors
    #[error("Run not found: {0}")]
    RunNotFound(String),

    #[error("Run {run_id} is already {status}")]
    RunFinished { run_id: String, status: String },

    #[error("Run {0} is already active")]
    RunActive(String),

    #[error("Run cancelled")]
    Cancelled,

    #[error("Run task failed: {0}")]
    TaskFailed(String),

    // Control surface errors
    #[error("Not authorized: {subject} requires role {required}")]
    Unauthorized { subject: String, required: String },

    // Storage errors
    #[error("Database error: {0}")]
    Database(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ConductorError {
    /// Outcome code a caller should surface when this error ends a run or command.
    pub fn outcome_code(&self) -> OutcomeCode {
        match self {
            Self::Unauthorized { .. } => OutcomeCode::Authorization,
            Self::Config(_)
            | Self::ConfigNotFound(_)
            | Self::PolicyInvalid(_)
            | Self::GraphInvalid(_)
            | Self::CycleDetected(_) => OutcomeCode::Startup,
            _ => OutcomeCode::General,
        }
    }
}

pub type Result<T> = std::result::Result<T, ConductorError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fatal_graph_errors_map_to_startup() {
        assert_eq!(
            ConductorError::CycleDetected("a -> b".into()).outcome_code(),
            OutcomeCode::Startup
        );
        assert_eq!(
            ConductorError::PolicyInvalid("bad".into()).outcome_code(),
            OutcomeCode::Startup
        );
    }

    #[test]
    fn unauthorized_maps_to_authorization() {
        let err = ConductorError::Unauthorized {
            subject: "bob".into(),
            required: "operator".into(),
        };
        assert_eq!(err.outcome_code(), OutcomeCode::Authorization);
        assert_eq!(err.outcome_code().exit_code(), 6);
    }
}
