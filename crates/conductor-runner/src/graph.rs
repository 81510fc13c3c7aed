//! Graph specification and validation.
//!
//! A graph is a declarative list of nodes. Each node names the capability it
//! needs and the nodes it depends on. Validation rejects duplicate ids,
//! unknown dependencies and cycles before anything is scheduled, and fixes a
//! deterministic topological order (Kahn's algorithm, ties broken by
//! ascending node id) that the runner uses to order ready nodes.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use conductor_core::config::load_document;
use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{Engine, Tier};
use conductor_gate::ArtifactContract;

/// Per-node retry overrides. Unset fields fall back to the runner defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RetrySpec {
    #[serde(default)]
    pub max_attempts: Option<u32>,
    #[serde(default)]
    pub initial_backoff_ms: Option<u64>,
    #[serde(default)]
    pub max_backoff_ms: Option<u64>,
}

/// A single unit of work in the graph. Immutable once a run starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NodeSpec {
    pub id: String,
    pub capability: String,
    #[serde(default)]
    pub params: serde_json::Value,
    #[serde(default, alias = "dependsOn")]
    pub depends_on: BTreeSet<String>,
    /// Per-attempt timeout in milliseconds. Graph files may call it `timeout`.
    #[serde(default, alias = "timeout")]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: Option<RetrySpec>,
    /// Engine override. Wins over the run mode.
    #[serde(default)]
    pub engine: Option<Engine>,
    /// Agent identity to route as. Defaults to the run's agent.
    #[serde(default)]
    pub agent: Option<String>,
    /// An optional node's failure does not fail the run.
    #[serde(default)]
    pub optional: bool,
    #[serde(default)]
    pub consent: bool,
    #[serde(default)]
    pub tier: Option<Tier>,
    #[serde(default)]
    pub max_cost_usd: Option<f64>,
    #[serde(default)]
    pub contract: Option<ArtifactContract>,
}

impl NodeSpec {
    pub fn new(id: impl Into<String>, capability: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capability: capability.into(),
            params: serde_json::Value::Null,
            depends_on: BTreeSet::new(),
            timeout_ms: None,
            retry: None,
            engine: None,
            agent: None,
            optional: false,
            consent: false,
            tier: None,
            max_cost_usd: None,
            contract: None,
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_params(mut self, params: serde_json::Value) -> Self {
        self.params = params;
        self
    }

    pub fn with_timeout_ms(mut self, ms: u64) -> Self {
        self.timeout_ms = Some(ms);
        self
    }

    pub fn with_retry(mut self, retry: RetrySpec) -> Self {
        self.retry = Some(retry);
        self
    }

    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.retry.get_or_insert_with(RetrySpec::default).max_attempts = Some(attempts);
        self
    }

    pub fn with_engine(mut self, engine: Engine) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    pub fn with_consent(mut self, consent: bool) -> Self {
        self.consent = consent;
        self
    }

    pub fn with_tier(mut self, tier: Tier) -> Self {
        self.tier = Some(tier);
        self
    }

    pub fn with_contract(mut self, contract: ArtifactContract) -> Self {
        self.contract = Some(contract);
        self
    }

    pub fn timeout(&self, default_ms: u64) -> Duration {
        Duration::from_millis(self.timeout_ms.unwrap_or(default_ms))
    }

    /// Serialized parameter size, fed to size-based cost models.
    pub fn payload_bytes(&self) -> u64 {
        if self.params.is_null() {
            return 0;
        }
        serde_json::to_vec(&self.params)
            .map(|v| v.len() as u64)
            .unwrap_or(0)
    }
}

/// Declarative graph input.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GraphSpec {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub nodes: Vec<NodeSpec>,
    /// Evaluated over every node's artifacts once all nodes succeed.
    #[serde(default)]
    pub contract: Option<ArtifactContract>,
}

impl GraphSpec {
    pub fn new(nodes: Vec<NodeSpec>) -> Self {
        Self {
            name: None,
            nodes,
            contract: None,
        }
    }

    pub fn with_contract(mut self, contract: ArtifactContract) -> Self {
        self.contract = Some(contract);
        self
    }

    /// Load a graph file (TOML, or JSON by extension).
    pub fn load(path: &Path) -> Result<Self> {
        load_document(path).map_err(|e| match e {
            ConductorError::Config(msg) => ConductorError::GraphInvalid(msg),
            other => other,
        })
    }

    pub fn node(&self, id: &str) -> Option<&NodeSpec> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// Check ids, dependencies and acyclicity, and compute the schedule order.
    pub fn plan(&self) -> Result<GraphPlan> {
        let mut ids = BTreeSet::new();
        for node in &self.nodes {
            if node.id.trim().is_empty() {
                return Err(ConductorError::GraphInvalid(
                    "node id must not be empty".to_string(),
                ));
            }
            if node.capability.trim().is_empty() {
                return Err(ConductorError::GraphInvalid(format!(
                    "node '{}' has no capability",
                    node.id
                )));
            }
            if !ids.insert(node.id.as_str()) {
                return Err(ConductorError::GraphInvalid(format!(
                    "duplicate node id '{}'",
                    node.id
                )));
            }
        }

        let mut indegree: BTreeMap<&str, usize> = BTreeMap::new();
        let mut dependents: HashMap<String, BTreeSet<String>> = HashMap::new();
        for node in &self.nodes {
            indegree.insert(node.id.as_str(), node.depends_on.len());
            for dep in &node.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ConductorError::GraphInvalid(format!(
                        "node '{}' depends on unknown node '{}'",
                        node.id, dep
                    )));
                }
                dependents
                    .entry(dep.clone())
                    .or_default()
                    .insert(node.id.clone());
            }
        }

        let mut frontier: BTreeSet<&str> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(id, _)| *id)
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());

        while let Some(id) = frontier.pop_first() {
            order.push(id.to_string());
            if let Some(children) = dependents.get(id) {
                for child in children {
                    if let Some(d) = indegree.get_mut(child.as_str()) {
                        *d -= 1;
                        if *d == 0 {
                            frontier.insert(child.as_str());
                        }
                    }
                }
            }
        }

        if order.len() < self.nodes.len() {
            let placed: BTreeSet<&str> = order.iter().map(|s| s.as_str()).collect();
            let stuck: Vec<&str> = ids.iter().copied().filter(|id| !placed.contains(id)).collect();
            return Err(ConductorError::CycleDetected(stuck.join(", ")));
        }

        let topo_index = order
            .iter()
            .enumerate()
            .map(|(i, id)| (id.clone(), i))
            .collect();

        Ok(GraphPlan {
            order,
            topo_index,
            dependents,
        })
    }
}

/// Schedule order and reverse edges of a validated graph.
#[derive(Debug, Clone)]
pub struct GraphPlan {
    order: Vec<String>,
    topo_index: HashMap<String, usize>,
    dependents: HashMap<String, BTreeSet<String>>,
}

impl GraphPlan {
    pub fn order(&self) -> &[String] {
        &self.order
    }

    pub fn topo_index(&self, id: &str) -> usize {
        self.topo_index.get(id).copied().unwrap_or(usize::MAX)
    }

    pub fn dependents(&self, id: &str) -> impl Iterator<Item = &String> {
        self.dependents.get(id).into_iter().flatten()
    }

    /// Every node reachable downstream of `id`, in topological order.
    pub fn transitive_dependents(&self, id: &str) -> Vec<String> {
        let mut seen = BTreeSet::new();
        let mut stack: Vec<&String> = self.dependents(id).collect();
        while let Some(next) = stack.pop() {
            if seen.insert(next.clone()) {
                stack.extend(self.dependents(next));
            }
        }
        let mut out: Vec<String> = seen.into_iter().collect();
        out.sort_by_key(|n| self.topo_index(n));
        out
    }
}
