use std::collections::BTreeMap;
use std::fmt;
use std::sync::{Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use conductor_core::policy::PolicyConfig;

use crate::cost::{micros_to_usd, usd_to_micros};

/// Ceilings derived from the policy, in micro-USD.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BudgetCeilings {
    capabilities: BTreeMap<String, u64>,
    default_capability: Option<u64>,
    agents: BTreeMap<String, u64>,
}

impl BudgetCeilings {
    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self {
            capabilities: policy
                .budgets
                .capabilities
                .iter()
                .map(|(k, v)| (k.clone(), usd_to_micros(*v)))
                .collect(),
            default_capability: policy.budgets.default_capability_usd.map(usd_to_micros),
            agents: policy
                .agents
                .iter()
                .filter_map(|(k, a)| a.budget_usd.map(|b| (k.clone(), usd_to_micros(b))))
                .collect(),
        }
    }

    /// Ceiling for one (agent, capability) pair.
    pub fn pair(&self, capability: &str) -> Option<u64> {
        self.capabilities
            .get(capability)
            .copied()
            .or(self.default_capability)
    }

    pub fn agent(&self, agent: &str) -> Option<u64> {
        self.agents.get(agent).copied()
    }

    /// Which ceiling, if any, `amount` would breach on top of `spend`.
    pub fn breach(
        &self,
        agent: &str,
        capability: &str,
        spend: Spend,
        amount: u64,
    ) -> Option<(BudgetScope, u64)> {
        if let Some(ceiling) = self.pair(capability) {
            if spend.pair_micros.saturating_add(amount) > ceiling {
                return Some((BudgetScope::Capability, ceiling));
            }
        }
        if let Some(ceiling) = self.agent(agent) {
            if spend.agent_micros.saturating_add(amount) > ceiling {
                return Some((BudgetScope::Agent, ceiling));
            }
        }
        None
    }
}

/// Committed spend visible to one routing decision.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Spend {
    pub pair_micros: u64,
    pub agent_micros: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Capability,
    Agent,
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Capability => write!(f, "capability"),
            Self::Agent => write!(f, "agent"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{scope} budget exceeded: committed {committed} + requested {requested} > ceiling {ceiling} (micro-USD)")]
pub struct BudgetError {
    pub scope: BudgetScope,
    pub ceiling: u64,
    pub committed: u64,
    pub requested: u64,
}

/// One persisted ledger row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub agent: String,
    pub capability: String,
    pub spent_micros: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    pub entries: Vec<LedgerEntry>,
}

impl LedgerSnapshot {
    pub fn total_usd(&self) -> f64 {
        micros_to_usd(self.entries.iter().map(|e| e.spent_micros).sum())
    }
}

#[derive(Debug, Default)]
struct LedgerState {
    pairs: BTreeMap<(String, String), u64>,
    agents: BTreeMap<String, u64>,
}

impl LedgerState {
    fn spend(&self, agent: &str, capability: &str) -> Spend {
        Spend {
            pair_micros: self
                .pairs
                .get(&(agent.to_string(), capability.to_string()))
                .copied()
                .unwrap_or(0),
            agent_micros: self.agents.get(agent).copied().unwrap_or(0),
        }
    }
}

/// Cumulative committed spend keyed by (agent, capability) and by agent.
///
/// Reads and commits are serialized through one lock, and `commit` re-checks
/// the ceilings under that lock, so concurrent commits can never push a pair
/// or an agent past its ceiling.
pub struct BudgetLedger {
    ceilings: BudgetCeilings,
    state: Mutex<LedgerState>,
}

impl BudgetLedger {
    pub fn new(ceilings: BudgetCeilings) -> Self {
        Self {
            ceilings,
            state: Mutex::new(LedgerState::default()),
        }
    }

    pub fn from_policy(policy: &PolicyConfig) -> Self {
        Self::new(BudgetCeilings::from_policy(policy))
    }

    pub fn ceilings(&self) -> &BudgetCeilings {
        &self.ceilings
    }

    pub fn spent(&self, agent: &str, capability: &str) -> Spend {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.spend(agent, capability)
    }

    /// Atomically check the ceilings and record `amount`.
    pub fn commit(&self, agent: &str, capability: &str, amount: u64) -> Result<Spend, BudgetError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        let spend = state.spend(agent, capability);

        if let Some((scope, ceiling)) = self.ceilings.breach(agent, capability, spend, amount) {
            let committed = match scope {
                BudgetScope::Capability => spend.pair_micros,
                BudgetScope::Agent => spend.agent_micros,
            };
            return Err(BudgetError {
                scope,
                ceiling,
                committed,
                requested: amount,
            });
        }

        let pair = state
            .pairs
            .entry((agent.to_string(), capability.to_string()))
            .or_insert(0);
        *pair += amount;
        let pair_micros = *pair;
        let agent_total = state.agents.entry(agent.to_string()).or_insert(0);
        *agent_total += amount;

        Ok(Spend {
            pair_micros,
            agent_micros: *agent_total,
        })
    }

    pub fn snapshot(&self) -> LedgerSnapshot {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        LedgerSnapshot {
            entries: state
                .pairs
                .iter()
                .map(|((agent, capability), spent)| LedgerEntry {
                    agent: agent.clone(),
                    capability: capability.clone(),
                    spent_micros: *spent,
                })
                .collect(),
        }
    }

    /// Merge persisted spend back in. Keeps the larger figure per pair, so
    /// restoring the same snapshot twice is harmless.
    pub fn restore(&self, snapshot: &LedgerSnapshot) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        for entry in &snapshot.entries {
            let slot = state
                .pairs
                .entry((entry.agent.clone(), entry.capability.clone()))
                .or_insert(0);
            *slot = (*slot).max(entry.spent_micros);
        }
        let mut agents: BTreeMap<String, u64> = BTreeMap::new();
        for ((agent, _), spent) in &state.pairs {
            *agents.entry(agent.clone()).or_insert(0) += spent;
        }
        state.agents = agents;
    }
}
