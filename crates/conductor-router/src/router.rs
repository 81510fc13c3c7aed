use std::sync::Arc;

use tracing::{debug, warn};

use conductor_core::policy::{PolicyConfig, ToolCandidate};
use conductor_core::types::Tier;

use crate::cost::{estimate_micros, micros_to_usd, usd_to_micros};
use crate::credentials::CredentialSet;
use crate::decision::{Rejection, RejectionReason, RouterDecision, RouterRequest, Selection};
use crate::ledger::{BudgetCeilings, BudgetLedger, Spend};

/// Resolves abstract capability requests to concrete tools.
///
/// `resolve` is a pure function of the request, the spend passed in, and the
/// policy snapshot (policy + credentials captured at construction). It can run
/// from any number of tasks at once. Committing spend is a separate step,
/// done by `route` against a [`BudgetLedger`].
pub struct CapabilityRouter {
    policy: Arc<PolicyConfig>,
    credentials: CredentialSet,
    ceilings: BudgetCeilings,
}

impl CapabilityRouter {
    pub fn new(policy: Arc<PolicyConfig>, credentials: CredentialSet) -> Self {
        let ceilings = BudgetCeilings::from_policy(&policy);
        Self {
            policy,
            credentials,
            ceilings,
        }
    }

    /// Build a router whose credentials are whatever the environment holds right now.
    pub fn from_env(policy: Arc<PolicyConfig>) -> Self {
        let credentials = CredentialSet::from_env(&policy);
        Self::new(policy, credentials)
    }

    pub fn policy(&self) -> &PolicyConfig {
        &self.policy
    }

    /// Candidates for a capability in evaluation order: ascending explicit
    /// priority, with declaration order standing in for a missing priority
    /// and breaking ties.
    fn ordered_candidates(&self, capability: &str) -> Vec<&ToolCandidate> {
        let mut indexed: Vec<(u32, usize, &ToolCandidate)> = self
            .policy
            .candidates(capability)
            .iter()
            .enumerate()
            .map(|(i, c)| (c.priority.unwrap_or(i as u32), i, c))
            .collect();
        indexed.sort_by_key(|(priority, index, _)| (*priority, *index));
        indexed.into_iter().map(|(_, _, c)| c).collect()
    }

    /// Compute a decision without side effects.
    pub fn resolve(&self, request: &RouterRequest, spend: Spend) -> RouterDecision {
        let mut decision = RouterDecision {
            capability: request.capability.clone(),
            agent: request.agent.clone(),
            tier: None,
            selected: None,
            rejected: Vec::new(),
            test_mode: request.context.test_mode,
        };

        let candidates = self.ordered_candidates(&request.capability);
        if candidates.is_empty() {
            decision.rejected.push(Rejection::capability(
                RejectionReason::NoCandidates,
                format!("no tools configured for capability '{}'", request.capability),
            ));
            return decision;
        }

        let agent_policy = self.policy.agent(&request.agent);
        let mut allowed = Vec::with_capacity(candidates.len());
        for candidate in candidates {
            if agent_policy.map(|a| a.allows(&candidate.tool)).unwrap_or(false) {
                allowed.push(candidate);
            } else {
                decision.rejected.push(Rejection::tool(
                    &candidate.tool,
                    RejectionReason::NotAllowlisted,
                    format!("not in the allowlist of agent '{}'", request.agent),
                ));
            }
        }
        if allowed.is_empty() {
            return decision;
        }

        let tier = match request.context.tier {
            Some(tier) => tier,
            None if allowed.iter().any(|c| c.tier == Tier::Primary) => Tier::Primary,
            None => Tier::Secondary,
        };
        decision.tier = Some(tier);

        let in_tier: Vec<&ToolCandidate> =
            allowed.into_iter().filter(|c| c.tier == tier).collect();
        if in_tier.is_empty() {
            decision.rejected.push(Rejection::capability(
                RejectionReason::NoCandidates,
                format!("no allowed {} candidates", tier),
            ));
            return decision;
        }

        // Consent gates the whole tier. No fallback to another tier.
        if tier == Tier::Secondary && self.policy.consent.secondary && !request.context.consent {
            for candidate in in_tier {
                decision.rejected.push(Rejection::tool(
                    &candidate.tool,
                    RejectionReason::ConsentRequired,
                    "secondary tier requires consent",
                ));
            }
            return decision;
        }

        let max_cost = request.context.max_cost_usd.map(usd_to_micros);
        for candidate in in_tier {
            let cost = estimate_micros(&candidate.cost, request.payload_bytes);

            if let Some((scope, ceiling)) =
                self.ceilings
                    .breach(&request.agent, &request.capability, spend, cost)
            {
                decision.rejected.push(Rejection::tool(
                    &candidate.tool,
                    RejectionReason::BudgetExceeded,
                    format!(
                        "cost {:.6} would exceed the {} ceiling of {:.6} USD",
                        micros_to_usd(cost),
                        scope,
                        micros_to_usd(ceiling)
                    ),
                ));
                continue;
            }
            if let Some(limit) = max_cost {
                if cost > limit {
                    decision.rejected.push(Rejection::tool(
                        &candidate.tool,
                        RejectionReason::BudgetExceeded,
                        format!(
                            "cost {:.6} exceeds the request limit of {:.6} USD",
                            micros_to_usd(cost),
                            micros_to_usd(limit)
                        ),
                    ));
                    continue;
                }
            }

            // Missing credentials move on within the same tier only.
            if let Some(credential) = &candidate.credential {
                if !self.credentials.contains(credential) {
                    decision.rejected.push(Rejection::tool(
                        &candidate.tool,
                        RejectionReason::MissingCredential,
                        format!("credential '{}' is not configured", credential),
                    ));
                    continue;
                }
            }

            decision.selected = Some(Selection {
                tool: candidate.tool.clone(),
                tier,
                approved_cost_micros: cost,
                side_effects: candidate.side_effects.clone(),
            });
            break;
        }

        decision
    }

    /// Resolve against the ledger's current spend, then commit the approved cost.
    ///
    /// A commit that loses a race for the remaining headroom turns the
    /// decision into a `BudgetExceeded` denial. Test-mode decisions never commit.
    pub fn route(&self, request: &RouterRequest, ledger: &BudgetLedger) -> RouterDecision {
        let spend = ledger.spent(&request.agent, &request.capability);
        let mut decision = self.resolve(request, spend);

        if decision.test_mode {
            return decision;
        }
        let (tool, cost) = match &decision.selected {
            Some(sel) => (sel.tool.clone(), sel.approved_cost_micros),
            None => return decision,
        };
        if cost == 0 {
            return decision;
        }

        match ledger.commit(&request.agent, &request.capability, cost) {
            Ok(total) => {
                debug!(
                    capability = %request.capability,
                    agent = %request.agent,
                    tool = %tool,
                    committed_micros = total.pair_micros,
                    "Budget committed"
                );
            }
            Err(e) => {
                warn!(
                    capability = %request.capability,
                    agent = %request.agent,
                    tool = %tool,
                    error = %e,
                    "Budget commit lost to a concurrent request"
                );
                decision.selected = None;
                decision.rejected.push(Rejection::tool(
                    &tool,
                    RejectionReason::BudgetExceeded,
                    e.to_string(),
                ));
            }
        }

        decision
    }
}
