use std::fmt;

use serde::{Deserialize, Serialize};

use conductor_core::types::Tier;

use crate::cost::micros_to_usd;

/// Per-request routing context.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RouteContext {
    /// Dry routing: the decision is computed but no spend is committed.
    #[serde(default)]
    pub test_mode: bool,
    /// Caller consents to secondary-tier tools.
    #[serde(default)]
    pub consent: bool,
    /// Upper bound on the cost of any single selected tool.
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    /// Explicit tier request. Unset prefers primary.
    #[serde(default)]
    pub tier: Option<Tier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RouterRequest {
    pub capability: String,
    pub agent: String,
    #[serde(default)]
    pub tenant: Option<String>,
    #[serde(default)]
    pub context: RouteContext,
    /// Size of the invocation payload, used by size-based cost models.
    #[serde(default)]
    pub payload_bytes: u64,
}

impl RouterRequest {
    pub fn new(capability: impl Into<String>, agent: impl Into<String>) -> Self {
        Self {
            capability: capability.into(),
            agent: agent.into(),
            tenant: None,
            context: RouteContext::default(),
            payload_bytes: 0,
        }
    }

    pub fn with_tenant(mut self, tenant: Option<String>) -> Self {
        self.tenant = tenant;
        self
    }

    pub fn with_consent(mut self, consent: bool) -> Self {
        self.context.consent = consent;
        self
    }

    pub fn with_tier(mut self, tier: Option<Tier>) -> Self {
        self.context.tier = tier;
        self
    }

    pub fn with_max_cost(mut self, usd: Option<f64>) -> Self {
        self.context.max_cost_usd = usd;
        self
    }

    pub fn with_test_mode(mut self, test_mode: bool) -> Self {
        self.context.test_mode = test_mode;
        self
    }

    pub fn with_payload_bytes(mut self, bytes: u64) -> Self {
        self.payload_bytes = bytes;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectionReason {
    NoCandidates,
    NotAllowlisted,
    ConsentRequired,
    BudgetExceeded,
    MissingCredential,
}

impl fmt::Display for RejectionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::NoCandidates => "NoCandidates",
            Self::NotAllowlisted => "NotAllowlisted",
            Self::ConsentRequired => "ConsentRequired",
            Self::BudgetExceeded => "BudgetExceeded",
            Self::MissingCredential => "MissingCredential",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Rejection {
    /// None when the rejection applies to the capability as a whole.
    pub tool: Option<String>,
    pub reason: RejectionReason,
    pub detail: String,
}

impl Rejection {
    pub fn tool(tool: &str, reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            tool: Some(tool.to_string()),
            reason,
            detail: detail.into(),
        }
    }

    pub fn capability(reason: RejectionReason, detail: impl Into<String>) -> Self {
        Self {
            tool: None,
            reason,
            detail: detail.into(),
        }
    }
}

impl fmt::Display for Rejection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.tool {
            Some(tool) => write!(f, "{} [{}]: {}", tool, self.reason, self.detail),
            None => write!(f, "[{}]: {}", self.reason, self.detail),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Selection {
    pub tool: String,
    pub tier: Tier,
    pub approved_cost_micros: u64,
    pub side_effects: Vec<String>,
}

/// Outcome of one routing call. Immutable once returned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouterDecision {
    pub capability: String,
    pub agent: String,
    /// Tier the router settled on, if it got that far.
    pub tier: Option<Tier>,
    pub selected: Option<Selection>,
    /// Every candidate turned down, in evaluation order.
    pub rejected: Vec<Rejection>,
    pub test_mode: bool,
}

impl RouterDecision {
    pub fn is_routed(&self) -> bool {
        self.selected.is_some()
    }

    pub fn tool(&self) -> Option<&str> {
        self.selected.as_ref().map(|s| s.tool.as_str())
    }

    pub fn approved_cost_usd(&self) -> f64 {
        self.selected
            .as_ref()
            .map(|s| micros_to_usd(s.approved_cost_micros))
            .unwrap_or(0.0)
    }

    pub fn has_rejection(&self, reason: RejectionReason) -> bool {
        self.rejected.iter().any(|r| r.reason == reason)
    }

    /// Reason that best explains a decision with no selection: the last one recorded.
    pub fn denial_reason(&self) -> Option<RejectionReason> {
        if self.is_routed() {
            return None;
        }
        self.rejected.last().map(|r| r.reason)
    }

    pub fn rejection_summaries(&self) -> Vec<String> {
        self.rejected.iter().map(|r| r.to_string()).collect()
    }
}
