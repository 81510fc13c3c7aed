//! Strongly typed routing policy.
//!
//! The policy maps abstract capabilities to ordered lists of concrete tool
//! candidates, and carries allowlists, budget ceilings and consent rules.
//! It is loaded and validated once per process and never mutated afterwards.

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::config::load_document;
use crate::error::{ConductorError, Result};
use crate::types::Tier;

/// Wildcard allowlist entry granting every tool.
pub const ALLOW_ALL: &str = "*";

/// How a candidate's cost is estimated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(tag = "model", rename_all = "snake_case")]
pub enum CostModel {
    #[default]
    Free,
    Flat {
        usd: f64,
    },
    /// Scales with the request payload size, capped at `max_usd`.
    Payload {
        base_usd: f64,
        usd_per_kb: f64,
        max_usd: f64,
    },
}

impl CostModel {
    fn amounts(&self) -> Vec<(&'static str, f64)> {
        match self {
            Self::Free => vec![],
            Self::Flat { usd } => vec![("usd", *usd)],
            Self::Payload {
                base_usd,
                usd_per_kb,
                max_usd,
            } => vec![
                ("base_usd", *base_usd),
                ("usd_per_kb", *usd_per_kb),
                ("max_usd", *max_usd),
            ],
        }
    }
}

/// A concrete tool that can satisfy a capability.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ToolCandidate {
    pub tool: String,
    #[serde(default)]
    pub tier: Tier,
    #[serde(default)]
    pub cost: CostModel,
    /// Name of the credential (environment variable) the tool needs.
    #[serde(default)]
    pub credential: Option<String>,
    #[serde(default)]
    pub side_effects: Vec<String>,
    /// Lower runs first. Unset falls back to declaration order.
    #[serde(default)]
    pub priority: Option<u32>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AgentPolicy {
    /// Tools this agent may use. `"*"` allows every tool.
    #[serde(default)]
    pub allow: Vec<String>,
    /// Ceiling on the agent's total committed spend.
    #[serde(default)]
    pub budget_usd: Option<f64>,
}

impl AgentPolicy {
    pub fn allows(&self, tool: &str) -> bool {
        self.allow.iter().any(|t| t == ALLOW_ALL || t == tool)
    }
}

/// Spend ceilings applied to each (agent, capability) pair.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BudgetPolicy {
    /// Ceiling for capabilities without an explicit entry. Unset means unlimited.
    #[serde(default)]
    pub default_capability_usd: Option<f64>,
    #[serde(default)]
    pub capabilities: BTreeMap<String, f64>,
}

impl BudgetPolicy {
    pub fn capability_ceiling(&self, capability: &str) -> Option<f64> {
        self.capabilities
            .get(capability)
            .copied()
            .or(self.default_capability_usd)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ConsentPolicy {
    /// Secondary-tier tools require explicit consent on the request.
    #[serde(default = "default_secondary_consent")]
    pub secondary: bool,
}

impl Default for ConsentPolicy {
    fn default() -> Self {
        Self {
            secondary: default_secondary_consent(),
        }
    }
}

fn default_secondary_consent() -> bool {
    true
}

/// Immutable routing policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PolicyConfig {
    #[serde(default)]
    pub capabilities: BTreeMap<String, Vec<ToolCandidate>>,
    #[serde(default)]
    pub agents: BTreeMap<String, AgentPolicy>,
    #[serde(default)]
    pub budgets: BudgetPolicy,
    #[serde(default)]
    pub consent: ConsentPolicy,
}

impl PolicyConfig {
    /// Load and validate a policy file (TOML, or JSON by extension).
    pub fn load(path: &Path) -> Result<Self> {
        let policy: PolicyConfig = load_document(path).map_err(|e| match e {
            ConductorError::Config(msg) => ConductorError::PolicyInvalid(msg),
            other => other,
        })?;
        policy.validate()?;
        Ok(policy)
    }

    /// Parse and validate a policy from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        let policy: PolicyConfig =
            toml::from_str(content).map_err(|e| ConductorError::PolicyInvalid(e.to_string()))?;
        policy.validate()?;
        Ok(policy)
    }

    pub fn candidates(&self, capability: &str) -> &[ToolCandidate] {
        self.capabilities
            .get(capability)
            .map(|c| c.as_slice())
            .unwrap_or(&[])
    }

    pub fn agent(&self, name: &str) -> Option<&AgentPolicy> {
        self.agents.get(name)
    }

    /// Every credential name referenced by a candidate.
    pub fn credential_names(&self) -> BTreeSet<String> {
        self.capabilities
            .values()
            .flatten()
            .filter_map(|c| c.credential.clone())
            .collect()
    }

    /// Check the policy, reporting every problem found.
    pub fn validate(&self) -> Result<()> {
        let mut issues = Vec::new();
        let mut known_tools = BTreeSet::new();

        for (capability, candidates) in &self.capabilities {
            if capability.trim().is_empty() {
                issues.push("capability name must not be empty".to_string());
            }
            let mut seen = BTreeSet::new();
            for candidate in candidates {
                if candidate.tool.trim().is_empty() {
                    issues.push(format!("capability '{}' has a candidate with no tool", capability));
                    continue;
                }
                if !seen.insert(candidate.tool.as_str()) {
                    issues.push(format!(
                        "capability '{}' lists tool '{}' more than once",
                        capability, candidate.tool
                    ));
                }
                known_tools.insert(candidate.tool.as_str());
                for (field, value) in candidate.cost.amounts() {
                    if !value.is_finite() || value < 0.0 {
                        issues.push(format!(
                            "capability '{}' tool '{}': cost {} must be a finite, non-negative number",
                            capability, candidate.tool, field
                        ));
                    }
                }
                if let Some(cred) = &candidate.credential {
                    if cred.trim().is_empty() {
                        issues.push(format!(
                            "capability '{}' tool '{}': credential name must not be empty",
                            capability, candidate.tool
                        ));
                    }
                }
            }
        }

        for (name, agent) in &self.agents {
            if let Some(budget) = agent.budget_usd {
                if !budget.is_finite() || budget < 0.0 {
                    issues.push(format!(
                        "agent '{}': budget_usd must be a finite, non-negative number",
                        name
                    ));
                }
            }
            for tool in &agent.allow {
                if tool != ALLOW_ALL && !known_tools.contains(tool.as_str()) {
                    issues.push(format!(
                        "agent '{}' allows unknown tool '{}'",
                        name, tool
                    ));
                }
            }
        }

        if let Some(default) = self.budgets.default_capability_usd {
            if !default.is_finite() || default < 0.0 {
                issues.push(
                    "budgets.default_capability_usd must be a finite, non-negative number"
                        .to_string(),
                );
            }
        }
        for (capability, ceiling) in &self.budgets.capabilities {
            if !ceiling.is_finite() || *ceiling < 0.0 {
                issues.push(format!(
                    "budget for capability '{}' must be a finite, non-negative number",
                    capability
                ));
            }
        }

        if issues.is_empty() {
            Ok(())
        } else {
            Err(ConductorError::PolicyInvalid(issues.join("; ")))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLICY: &str = r#"
[[capabilities.fetch]]
tool = "http"
cost = { model = "payload", base_usd = 0.001, usd_per_kb = 0.001, max_usd = 0.01 }
side_effects = ["network"]

[[capabilities.fetch]]
tool = "browser"
tier = "secondary"
credential = "BROWSER_TOKEN"
cost = { model = "flat", usd = 0.05 }

[agents.builder]
allow = ["http", "browser"]
budget_usd = 1.0

[agents.root]
allow = ["*"]

[budgets]
default_capability_usd = 0.10

[budgets.capabilities]
fetch = 0.25
"#;

    #[test]
    fn parses_full_policy() {
        let policy = PolicyConfig::from_toml(POLICY).unwrap();
        let fetch = policy.candidates("fetch");
        assert_eq!(fetch.len(), 2);
        assert_eq!(fetch[0].tier, Tier::Primary);
        assert_eq!(fetch[1].tier, Tier::Secondary);
        assert_eq!(fetch[1].cost, CostModel::Flat { usd: 0.05 });
        assert!(policy.consent.secondary);
        assert_eq!(policy.budgets.capability_ceiling("fetch"), Some(0.25));
        assert_eq!(policy.budgets.capability_ceiling("other"), Some(0.10));
        assert!(policy.agent("root").unwrap().allows("anything"));
        assert!(!policy.agent("builder").unwrap().allows("shell"));
        assert_eq!(
            policy.credential_names().into_iter().collect::<Vec<_>>(),
            vec!["BROWSER_TOKEN".to_string()]
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = PolicyConfig::from_toml(
            r#"
[[capabilities.fetch]]
tool = "http"
colour = "blue"
"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConductorError::PolicyInvalid(_)));
    }

    #[test]
    fn rejects_negative_cost_and_budget() {
        let err = PolicyConfig::from_toml(
            r#"
[[capabilities.fetch]]
tool = "http"
cost = { model = "flat", usd = -1.0 }

[budgets.capabilities]
fetch = -0.5
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("cost usd"));
        assert!(msg.contains("budget for capability 'fetch'"));
    }

    #[test]
    fn rejects_duplicate_tools_and_unknown_allowlist_entries() {
        let err = PolicyConfig::from_toml(
            r#"
[[capabilities.fetch]]
tool = "http"

[[capabilities.fetch]]
tool = "http"

[agents.builder]
allow = ["ftp"]
"#,
        )
        .unwrap_err();
        let msg = err.to_string();
        assert!(msg.contains("more than once"));
        assert!(msg.contains("unknown tool 'ftp'"));
    }

    #[test]
    fn empty_policy_is_valid() {
        let policy = PolicyConfig::from_toml("").unwrap();
        assert!(policy.candidates("anything").is_empty());
    }
}
