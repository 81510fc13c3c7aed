use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use conductor_core::config::DelegateConfig;
use conductor_core::event::EventBus;
use conductor_core::types::{Engine, RunEvent, RunId};
use conductor_gate::{ArtifactSet, GateEvaluator, GateResult};
use conductor_router::cost::{micros_to_usd, usd_to_micros};
use conductor_router::{BudgetLedger, CapabilityRouter, RejectionReason, RouterDecision, RouterRequest};

use crate::delegate::{DelegateClient, DelegateReply, DelegateTurn, ToolResponse};
use crate::error::NodeError;
use crate::graph::NodeSpec;
use crate::handler::{HandlerRegistry, ToolCall, ToolOutput};

/// Caps on one node's delegated loop.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DelegateLimits {
    pub max_iterations: u32,
    pub max_duration: Duration,
    pub max_cost_usd: f64,
}

impl DelegateLimits {
    pub fn from_config(config: &DelegateConfig) -> Self {
        Self {
            max_iterations: config.max_iterations.max(1),
            max_duration: Duration::from_secs(config.max_duration_secs),
            max_cost_usd: config.max_cost_usd,
        }
    }
}

impl Default for DelegateLimits {
    fn default() -> Self {
        Self::from_config(&DelegateConfig::default())
    }
}

/// Routing decisions made during one attempt. Shared with the coordination
/// loop so decisions survive an attempt that times out or panics.
pub type DecisionLog = Arc<Mutex<Vec<RouterDecision>>>;

/// Everything an attempt needs, passed by value into the worker.
pub struct NodeTask {
    pub run_id: RunId,
    pub node: NodeSpec,
    pub engine: Engine,
    pub attempt: u32,
    pub agent: String,
    pub tenant: Option<String>,
    pub test_mode: bool,
    pub ledger: Arc<BudgetLedger>,
    pub decisions: DecisionLog,
    pub cancel: CancellationToken,
}

impl NodeTask {
    fn record(&self, decision: RouterDecision) {
        self.decisions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(decision);
    }
}

/// Result of one attempt.
#[derive(Debug)]
pub struct NodeOutcome {
    pub gate: Option<GateResult>,
    pub result: Result<ArtifactSet, NodeError>,
}

impl NodeOutcome {
    pub fn failed(error: NodeError) -> Self {
        Self {
            gate: None,
            result: Err(error),
        }
    }
}

/// Runs single node attempts on either engine.
///
/// Shared by every worker of a run; holds no per-run state apart from the
/// collaborators it routes, invokes and gates through.
pub struct NodeExecutor {
    router: Arc<CapabilityRouter>,
    handlers: HandlerRegistry,
    delegate: Option<Arc<dyn DelegateClient>>,
    gate: GateEvaluator,
    limits: DelegateLimits,
    event_bus: Arc<EventBus>,
}

impl NodeExecutor {
    pub fn new(
        router: Arc<CapabilityRouter>,
        handlers: HandlerRegistry,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self {
            router,
            handlers,
            delegate: None,
            gate: GateEvaluator::new(),
            limits: DelegateLimits::default(),
            event_bus,
        }
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn DelegateClient>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn with_gate(mut self, gate: GateEvaluator) -> Self {
        self.gate = gate;
        self
    }

    pub fn with_limits(mut self, limits: DelegateLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn router(&self) -> &CapabilityRouter {
        &self.router
    }

    pub fn gate(&self) -> &GateEvaluator {
        &self.gate
    }

    /// Run one attempt, then check the node's contract against what it produced.
    pub async fn execute(&self, task: NodeTask) -> NodeOutcome {
        debug!(
            node_id = %task.node.id,
            attempt = task.attempt,
            engine = %task.engine,
            "Executing node"
        );

        let produced = match task.engine {
            Engine::Deterministic => self.run_deterministic(&task).await,
            Engine::Delegated => self.run_delegated(&task).await,
        };
        let artifacts = match produced {
            Ok(a) => a,
            Err(e) => return NodeOutcome::failed(e),
        };

        let Some(contract) = &task.node.contract else {
            return NodeOutcome {
                gate: None,
                result: Ok(artifacts),
            };
        };

        let gate = self.gate.evaluate(contract, &artifacts);
        self.event_bus.publish(RunEvent::GateEvaluated {
            run_id: task.run_id.clone(),
            node_id: Some(task.node.id.clone()),
            passed: gate.passed(),
            violations: gate.violations.len(),
        });
        let result = if gate.passed() {
            Ok(artifacts)
        } else {
            warn!(
                node_id = %task.node.id,
                violations = gate.violations.len(),
                code = %gate.code,
                "Node contract failed"
            );
            Err(NodeError::GateFailed {
                code: gate.code,
                violations: gate.violations.len(),
            })
        };
        NodeOutcome {
            gate: Some(gate),
            result,
        }
    }

    async fn run_deterministic(&self, task: &NodeTask) -> Result<ArtifactSet, NodeError> {
        let node = &task.node;
        let request = self.request_for(task, &node.capability, node.payload_bytes());
        let decision = self.route(task, &request);

        let Some(selection) = decision.selected.clone() else {
            return Err(denied(&decision));
        };

        let output = self
            .invoke(task, &selection.tool, &node.capability, node.params.clone())
            .await?;
        Ok(output.artifacts)
    }

    async fn run_delegated(&self, task: &NodeTask) -> Result<ArtifactSet, NodeError> {
        let delegate = self
            .delegate
            .clone()
            .ok_or(NodeError::DelegateUnavailable)?;

        let max = self.limits.max_duration;
        match tokio::time::timeout(max, self.delegate_loop(delegate.as_ref(), task)).await {
            Ok(result) => result,
            Err(_) => {
                warn!(node_id = %task.node.id, "Delegated loop hit its wall-clock cap");
                Err(NodeError::Timeout(max.as_millis() as u64))
            }
        }
    }

    async fn delegate_loop(
        &self,
        delegate: &dyn DelegateClient,
        task: &NodeTask,
    ) -> Result<ArtifactSet, NodeError> {
        let cap_micros = usd_to_micros(self.limits.max_cost_usd);
        let mut spent_micros: u64 = 0;
        let mut results: Vec<ToolResponse> = Vec::new();

        for iteration in 0..self.limits.max_iterations {
            if task.cancel.is_cancelled() {
                return Err(NodeError::Cancelled);
            }

            let turn = DelegateTurn {
                run_id: task.run_id.clone(),
                node_id: task.node.id.clone(),
                capability: task.node.capability.clone(),
                params: task.node.params.clone(),
                iteration,
                results: std::mem::take(&mut results),
            };
            let reply = delegate.step(turn).await.map_err(|e| {
                if e.transient {
                    NodeError::Transport(e.message)
                } else {
                    NodeError::Tool {
                        tool: "delegate".to_string(),
                        message: e.message,
                        transient: false,
                    }
                }
            })?;

            let requests = match reply {
                DelegateReply::Done(artifacts) => {
                    info!(
                        node_id = %task.node.id,
                        iterations = iteration + 1,
                        spent_usd = micros_to_usd(spent_micros),
                        "Delegated node finished"
                    );
                    return Ok(artifacts);
                }
                DelegateReply::ToolRequests(requests) => requests,
            };

            for req in requests {
                let bytes = serde_json::to_vec(&req.params)
                    .map(|v| v.len() as u64)
                    .unwrap_or(0);
                let mut request = self.request_for(task, &req.capability, bytes);

                // The cap is checked before anything is committed to the ledger.
                if !task.test_mode {
                    let spend = task.ledger.spent(&request.agent, &request.capability);
                    let preview = self.router.resolve(&request, spend);
                    if let Some(sel) = &preview.selected {
                        let projected = spent_micros.saturating_add(sel.approved_cost_micros);
                        if projected > cap_micros {
                            return Err(NodeError::DelegateCost {
                                spent_usd: micros_to_usd(projected),
                                cap_usd: self.limits.max_cost_usd,
                            });
                        }
                    }
                    let headroom = micros_to_usd(cap_micros.saturating_sub(spent_micros));
                    let limit = request
                        .context
                        .max_cost_usd
                        .map_or(headroom, |hint| hint.min(headroom));
                    request = request.with_max_cost(Some(limit));
                }
                let decision = self.route(task, &request);

                let Some(selection) = decision.selected.clone() else {
                    let error = decision.rejection_summaries().join("; ");
                    results.push(ToolResponse {
                        request_id: req.id,
                        capability: req.capability,
                        ok: false,
                        decision,
                        artifacts: ArtifactSet::new(),
                        error: Some(error),
                    });
                    continue;
                };

                if !decision.test_mode {
                    spent_micros = spent_micros.saturating_add(selection.approved_cost_micros);
                }

                match self
                    .invoke(task, &selection.tool, &req.capability, req.params.clone())
                    .await
                {
                    Ok(output) => results.push(ToolResponse {
                        request_id: req.id,
                        capability: req.capability,
                        ok: true,
                        decision,
                        artifacts: output.artifacts,
                        error: None,
                    }),
                    Err(NodeError::Cancelled) => return Err(NodeError::Cancelled),
                    Err(e) => results.push(ToolResponse {
                        request_id: req.id,
                        capability: req.capability,
                        ok: false,
                        decision,
                        artifacts: ArtifactSet::new(),
                        error: Some(e.to_string()),
                    }),
                }
            }
        }

        Err(NodeError::DelegateIterations(self.limits.max_iterations))
    }

    fn request_for(&self, task: &NodeTask, capability: &str, payload_bytes: u64) -> RouterRequest {
        let node = &task.node;
        RouterRequest::new(capability, task.agent.clone())
            .with_tenant(task.tenant.clone())
            .with_consent(node.consent)
            .with_tier(node.tier)
            .with_max_cost(node.max_cost_usd)
            .with_test_mode(task.test_mode)
            .with_payload_bytes(payload_bytes)
    }

    /// Route, publish the outcome and record the decision on the task.
    fn route(&self, task: &NodeTask, request: &RouterRequest) -> RouterDecision {
        let decision = self.router.route(request, &task.ledger);

        self.event_bus.publish(RunEvent::RouteDecided {
            run_id: task.run_id.clone(),
            node_id: task.node.id.clone(),
            capability: request.capability.clone(),
            tool: decision.tool().map(String::from),
            cost_usd: decision.approved_cost_usd(),
        });

        if !decision.is_routed() {
            let reasons = decision.rejection_summaries();
            warn!(
                node_id = %task.node.id,
                capability = %request.capability,
                agent = %request.agent,
                reasons = ?reasons,
                "Tool call blocked"
            );
            self.event_bus.publish(RunEvent::ToolBlocked {
                run_id: task.run_id.clone(),
                node_id: task.node.id.clone(),
                capability: request.capability.clone(),
                agent: request.agent.clone(),
                reasons,
            });
        }

        task.record(decision.clone());
        decision
    }

    async fn invoke(
        &self,
        task: &NodeTask,
        tool: &str,
        capability: &str,
        params: serde_json::Value,
    ) -> Result<ToolOutput, NodeError> {
        let handler = self
            .handlers
            .get(tool)
            .ok_or_else(|| NodeError::HandlerMissing(tool.to_string()))?;

        let call = ToolCall {
            run_id: task.run_id.clone(),
            node_id: task.node.id.clone(),
            tool: tool.to_string(),
            capability: capability.to_string(),
            params,
            attempt: task.attempt,
            cancel: task.cancel.clone(),
        };

        tokio::select! {
            _ = task.cancel.cancelled() => Err(NodeError::Cancelled),
            result = handler.invoke(call) => result.map_err(|e| NodeError::Tool {
                tool: tool.to_string(),
                message: e.message,
                transient: e.transient,
            }),
        }
    }
}

fn denied(decision: &RouterDecision) -> NodeError {
    NodeError::PolicyDenied {
        capability: decision.capability.clone(),
        reason: decision
            .denial_reason()
            .unwrap_or(RejectionReason::NoCandidates),
        detail: decision.rejection_summaries().join("; "),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    use futures::future::BoxFuture;

    use conductor_core::PolicyConfig;
    use conductor_gate::{Artifact, ArtifactContract, ContractKind, RequiredArtifact};
    use conductor_router::CredentialSet;

    use crate::delegate::ToolRequest;
    use crate::handler::{NoopHandler, ToolError};

    const POLICY: &str = r#"
[[capabilities.fetch]]
tool = "http"
cost = { model = "flat", usd = 0.05 }

[[capabilities.pay]]
tool = "paypal"
tier = "secondary"

[agents.bot]
allow = ["http", "paypal"]
"#;

    fn executor(bus: Arc<EventBus>) -> NodeExecutor {
        let policy = Arc::new(PolicyConfig::from_toml(POLICY).unwrap());
        let router = Arc::new(CapabilityRouter::new(policy, CredentialSet::new()));
        let mut handlers = HandlerRegistry::new();
        handlers.register("http", NoopHandler);
        handlers.register("paypal", NoopHandler);
        NodeExecutor::new(router, handlers, bus)
    }

    fn task(node: NodeSpec, engine: Engine, ledger: Arc<BudgetLedger>) -> NodeTask {
        NodeTask {
            run_id: RunId::from_string("run"),
            node,
            engine,
            attempt: 1,
            agent: "bot".into(),
            tenant: None,
            test_mode: false,
            ledger,
            decisions: DecisionLog::default(),
            cancel: CancellationToken::new(),
        }
    }

    fn ledger(exec: &NodeExecutor) -> Arc<BudgetLedger> {
        Arc::new(BudgetLedger::from_policy(exec.router().policy()))
    }

    #[tokio::test]
    async fn deterministic_node_routes_and_invokes() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let exec = executor(bus);
        let ledger = ledger(&exec);
        let t = task(
            NodeSpec::new("get", "fetch").with_params(serde_json::json!({"u": 1})),
            Engine::Deterministic,
            ledger.clone(),
        );
        let log = t.decisions.clone();

        let outcome = exec.execute(t).await;
        let artifacts = outcome.result.unwrap();
        assert!(artifacts.contains("output"));
        assert_eq!(log.lock().unwrap().len(), 1);
        assert_eq!(ledger.spent("bot", "fetch").pair_micros, 50_000);
        assert!(matches!(rx.recv().await.unwrap(), RunEvent::RouteDecided { .. }));
    }

    #[tokio::test]
    async fn denial_is_terminal_and_audited() {
        let bus = Arc::new(EventBus::default());
        let mut rx = bus.subscribe();
        let exec = executor(bus);
        let t = task(NodeSpec::new("checkout", "pay"), Engine::Deterministic, ledger(&exec));

        let err = exec.execute(t).await.result.unwrap_err();
        match &err {
            NodeError::PolicyDenied { reason, .. } => {
                assert_eq!(*reason, RejectionReason::ConsentRequired)
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(err.code(), conductor_core::OutcomeCode::Authorization);

        let _decided = rx.recv().await.unwrap();
        match rx.recv().await.unwrap() {
            RunEvent::ToolBlocked { capability, reasons, .. } => {
                assert_eq!(capability, "pay");
                assert!(reasons[0].contains("ConsentRequired"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn contract_failure_becomes_gate_error() {
        let exec = executor(Arc::new(EventBus::default()));
        let contract = ArtifactContract::new(ContractKind::Functional)
            .require(RequiredArtifact::new("report.html"));
        let t = task(
            NodeSpec::new("get", "fetch").with_contract(contract),
            Engine::Deterministic,
            ledger(&exec),
        );
        let outcome = exec.execute(t).await;
        assert!(!outcome.gate.as_ref().unwrap().passed());
        match outcome.result.unwrap_err() {
            NodeError::GateFailed { code, violations } => {
                assert_eq!(code, conductor_core::OutcomeCode::FunctionalVerification);
                assert_eq!(violations, 1);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    /// Requests `fetch` then `pay`, then reports what came back.
    struct TwoStepDelegate {
        turns: AtomicU32,
    }

    impl DelegateClient for TwoStepDelegate {
        fn step(&self, turn: DelegateTurn) -> BoxFuture<'_, Result<DelegateReply, ToolError>> {
            Box::pin(async move {
                self.turns.fetch_add(1, Ordering::SeqCst);
                if turn.iteration == 0 {
                    return Ok(DelegateReply::ToolRequests(vec![
                        ToolRequest::new("r1", "fetch"),
                        ToolRequest::new("r2", "pay"),
                    ]));
                }
                let summary = serde_json::json!({
                    "ok": turn.results.iter().filter(|r| r.ok).count(),
                    "denied": turn.results.iter().filter(|r| !r.ok).count(),
                });
                Ok(DelegateReply::Done(
                    ArtifactSet::new().with("summary", Artifact::json(summary)),
                ))
            })
        }
    }

    #[tokio::test]
    async fn delegated_denials_flow_back_to_the_delegate() {
        let delegate = Arc::new(TwoStepDelegate {
            turns: AtomicU32::new(0),
        });
        let exec = executor(Arc::new(EventBus::default())).with_delegate(delegate.clone());
        let t = task(NodeSpec::new("agentic", "research"), Engine::Delegated, ledger(&exec));
        let log = t.decisions.clone();

        let artifacts = exec.execute(t).await.result.unwrap();
        let summary = artifacts.get("summary").unwrap();
        assert_eq!(
            summary,
            &Artifact::json(serde_json::json!({"ok": 1, "denied": 1}))
        );
        assert_eq!(delegate.turns.load(Ordering::SeqCst), 2);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    /// Never finishes; always asks for another fetch.
    struct EndlessDelegate;

    impl DelegateClient for EndlessDelegate {
        fn step(&self, _turn: DelegateTurn) -> BoxFuture<'_, Result<DelegateReply, ToolError>> {
            Box::pin(async {
                Ok(DelegateReply::ToolRequests(vec![ToolRequest::new("r", "fetch")]))
            })
        }
    }

    #[tokio::test]
    async fn delegate_caps_are_terminal() {
        let exec = executor(Arc::new(EventBus::default()))
            .with_delegate(Arc::new(EndlessDelegate))
            .with_limits(DelegateLimits {
                max_iterations: 3,
                max_duration: Duration::from_secs(5),
                max_cost_usd: 10.0,
            });
        let t = task(NodeSpec::new("loop", "research"), Engine::Delegated, ledger(&exec));
        let err = exec.execute(t).await.result.unwrap_err();
        assert!(matches!(err, NodeError::DelegateIterations(3)));

        let exec = executor(Arc::new(EventBus::default()))
            .with_delegate(Arc::new(EndlessDelegate))
            .with_limits(DelegateLimits {
                max_iterations: 10,
                max_duration: Duration::from_secs(5),
                max_cost_usd: 0.12,
            });
        let spend = ledger(&exec);
        let t = task(NodeSpec::new("loop", "research"), Engine::Delegated, spend.clone());
        let log = t.decisions.clone();
        match exec.execute(t).await.result.unwrap_err() {
            NodeError::DelegateCost { spent_usd, .. } => assert!((spent_usd - 0.15).abs() < 1e-9),
            other => panic!("unexpected {:?}", other),
        }
        // The call that would break the cap is neither committed nor logged.
        assert_eq!(spend.spent("bot", "fetch").pair_micros, 100_000);
        assert_eq!(log.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn delegated_without_client_is_terminal() {
        let exec = executor(Arc::new(EventBus::default()));
        let t = task(NodeSpec::new("x", "research"), Engine::Delegated, ledger(&exec));
        let err = exec.execute(t).await.result.unwrap_err();
        assert!(matches!(err, NodeError::DelegateUnavailable));
    }
}
