use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_core::types::OutcomeCode;
use conductor_router::RejectionReason;

/// Whether a failed attempt may be retried.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    Transient,
    Terminal,
}

/// Why a node attempt failed.
#[derive(Debug, Clone, Error)]
pub enum NodeError {
    #[error("node timed out after {0}ms")]
    Timeout(u64),

    #[error("executor crashed: {0}")]
    Crash(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("tool {tool} failed: {message}")]
    Tool {
        tool: String,
        message: String,
        transient: bool,
    },

    #[error("routing denied for capability {capability}: {reason} ({detail})")]
    PolicyDenied {
        capability: String,
        reason: RejectionReason,
        detail: String,
    },

    #[error("gate failed with {violations} violation(s)")]
    GateFailed { code: OutcomeCode, violations: usize },

    #[error("no handler registered for tool {0}")]
    HandlerMissing(String),

    #[error("no delegate client configured")]
    DelegateUnavailable,

    #[error("delegate exceeded {0} iterations")]
    DelegateIterations(u32),

    #[error("delegate spend {spent_usd:.6} exceeded cap {cap_usd:.6} USD")]
    DelegateCost { spent_usd: f64, cap_usd: f64 },

    #[error("cancelled")]
    Cancelled,
}

impl NodeError {
    pub fn class(&self) -> FailureClass {
        match self {
            Self::Timeout(_) | Self::Crash(_) | Self::Transport(_) => FailureClass::Transient,
            Self::Tool { transient, .. } => {
                if *transient {
                    FailureClass::Transient
                } else {
                    FailureClass::Terminal
                }
            }
            _ => FailureClass::Terminal,
        }
    }

    pub fn code(&self) -> OutcomeCode {
        match self {
            Self::PolicyDenied { reason, .. } => match reason {
                RejectionReason::NotAllowlisted | RejectionReason::ConsentRequired => {
                    OutcomeCode::Authorization
                }
                _ => OutcomeCode::General,
            },
            Self::GateFailed { code, .. } => *code,
            _ => OutcomeCode::General,
        }
    }

    /// Recover a panic payload as a crash.
    pub fn from_panic(payload: Box<dyn std::any::Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            s.to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic".to_string()
        };
        Self::Crash(message)
    }
}
