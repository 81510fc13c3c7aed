//! The coordination loop.
//!
//! Every node state transition happens here, on one task. Workers only run
//! attempts and hand back an [`AttemptDone`]; they never touch run state.
//! After each transition the whole run snapshot is persisted so a crashed
//! run can be resumed without re-running succeeded nodes.

use std::collections::{BTreeSet, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, PoisonError};
use std::time::Instant as StdInstant;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use conductor_core::config::AppConfig;
use conductor_core::error::{ConductorError, Result};
use conductor_core::event::EventBus;
use conductor_core::types::{OutcomeCode, RunEvent, RunId, RunStatus};
use conductor_router::BudgetLedger;

use crate::error::NodeError;
use crate::executor::{DecisionLog, NodeExecutor, NodeOutcome, NodeTask};
use crate::graph::{GraphPlan, GraphSpec, NodeSpec};
use crate::retry::RetryPolicy;
use crate::state::{FailureRecord, NodeStatus, RunOptions, RunSnapshot};
use crate::store::SnapshotStore;

/// Pause, resume and cancel handle for one run.
pub struct RunControl {
    cancel: CancellationToken,
    paused: watch::Sender<bool>,
}

impl RunControl {
    pub fn new() -> Self {
        let (paused, _) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused,
        }
    }

    /// Stop dispatching new nodes. In-flight nodes run to completion.
    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.paused.subscribe()
    }
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

/// Executes graphs and owns their persisted state.
pub struct GraphRunner {
    executor: Arc<NodeExecutor>,
    event_bus: Arc<EventBus>,
    store: Option<Arc<SnapshotStore>>,
    retry: RetryPolicy,
    node_timeout_ms: u64,
    hybrid_delegate: Vec<String>,
}

impl GraphRunner {
    pub fn new(executor: Arc<NodeExecutor>, event_bus: Arc<EventBus>) -> Self {
        Self {
            executor,
            event_bus,
            store: None,
            retry: RetryPolicy::default(),
            node_timeout_ms: 300_000,
            hybrid_delegate: Vec::new(),
        }
    }

    pub fn from_config(
        config: &AppConfig,
        executor: Arc<NodeExecutor>,
        event_bus: Arc<EventBus>,
    ) -> Self {
        Self::new(executor, event_bus)
            .with_retry(RetryPolicy::from_config(&config.retry))
            .with_node_timeout_ms(config.runner.node_timeout_ms)
            .with_hybrid_delegate(config.runner.hybrid_delegate.clone())
    }

    pub fn with_store(mut self, store: Arc<SnapshotStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_node_timeout_ms(mut self, ms: u64) -> Self {
        self.node_timeout_ms = ms;
        self
    }

    pub fn with_hybrid_delegate(mut self, capabilities: Vec<String>) -> Self {
        self.hybrid_delegate = capabilities;
        self
    }

    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn store(&self) -> Option<&Arc<SnapshotStore>> {
        self.store.as_ref()
    }

    /// Validate the graph and persist the initial snapshot. Nothing is scheduled.
    pub fn prepare(&self, graph: GraphSpec, options: RunOptions) -> Result<RunSnapshot> {
        graph.plan()?;
        let snapshot = RunSnapshot::new(RunId::new(), graph, options);
        if let Some(store) = &self.store {
            store.save(&snapshot)?;
        }
        info!(
            run_id = %snapshot.run_id,
            nodes = snapshot.nodes.len(),
            "Run prepared"
        );
        Ok(snapshot)
    }

    /// Validate, persist and run a graph to completion.
    pub async fn submit(&self, graph: GraphSpec, options: RunOptions) -> Result<RunSnapshot> {
        let snapshot = self.prepare(graph, options)?;
        self.execute(snapshot, Arc::new(RunControl::new())).await
    }

    pub fn load(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let store = self
            .store
            .as_ref()
            .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))?;
        store
            .load(run_id)?
            .ok_or_else(|| ConductorError::RunNotFound(run_id.to_string()))
    }

    /// Load a persisted run that has not finished yet.
    pub fn load_resumable(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let snapshot = self.load(run_id)?;
        if snapshot.status.is_finished() {
            return Err(ConductorError::RunFinished {
                run_id: run_id.to_string(),
                status: snapshot.status.to_string(),
            });
        }
        Ok(snapshot)
    }

    /// Pick up a persisted run where it stopped.
    pub async fn resume(&self, run_id: &RunId) -> Result<RunSnapshot> {
        let snapshot = self.load_resumable(run_id)?;
        self.execute(snapshot, Arc::new(RunControl::new())).await
    }

    /// Drive a prepared or reloaded snapshot until every node is terminal.
    pub async fn execute(
        &self,
        mut snapshot: RunSnapshot,
        control: Arc<RunControl>,
    ) -> Result<RunSnapshot> {
        let plan = match snapshot.graph.plan() {
            Ok(p) => p,
            Err(e) => {
                self.event_bus.publish(RunEvent::RunError {
                    run_id: snapshot.run_id.clone(),
                    error: e.to_string(),
                });
                return Err(e);
            }
        };

        let resumed = snapshot
            .nodes
            .values()
            .any(|n| n.attempts > 0 || n.status != NodeStatus::Pending);
        let requeued = snapshot.requeue_interrupted();
        snapshot.status = RunStatus::Running;

        let ledger = Arc::new(BudgetLedger::from_policy(self.executor.router().policy()));
        ledger.restore(&snapshot.ledger);

        info!(
            run_id = %snapshot.run_id,
            nodes = snapshot.nodes.len(),
            resumed,
            requeued,
            "Run started"
        );
        self.event_bus.publish(RunEvent::RunStarted {
            run_id: snapshot.run_id.clone(),
            nodes: snapshot.nodes.len(),
            resumed,
        });

        let specs = snapshot
            .graph
            .nodes
            .iter()
            .map(|n| (n.id.clone(), n.clone()))
            .collect();
        let coordinator = Coordinator {
            runner: self,
            snapshot,
            plan,
            specs,
            ledger,
            ready: BTreeSet::new(),
            retry_at: BTreeSet::new(),
            running: HashMap::new(),
            control,
            started: StdInstant::now(),
        };
        Ok(coordinator.run().await)
    }

    fn persist(&self, snapshot: &RunSnapshot) {
        if let Some(store) = &self.store {
            if let Err(e) = store.save(snapshot) {
                warn!(run_id = %snapshot.run_id, error = %e, "Failed to persist run snapshot");
            }
        }
    }
}

/// Handed back by a worker when an attempt ends.
struct AttemptDone {
    node_id: String,
    attempt: u32,
    elapsed_ms: u64,
    outcome: NodeOutcome,
}

struct Coordinator<'a> {
    runner: &'a GraphRunner,
    snapshot: RunSnapshot,
    plan: GraphPlan,
    specs: HashMap<String, NodeSpec>,
    ledger: Arc<BudgetLedger>,
    /// Dispatch queue: topological index, then id.
    ready: BTreeSet<(usize, String)>,
    retry_at: BTreeSet<(Instant, usize, String)>,
    running: HashMap<String, DecisionLog>,
    control: Arc<RunControl>,
    started: StdInstant,
}

impl Coordinator<'_> {
    async fn run(mut self) -> RunSnapshot {
        let mut workers: JoinSet<AttemptDone> = JoinSet::new();
        let mut pause_rx = self.control.subscribe();
        let mut pause_open = true;
        let mut paused = *pause_rx.borrow_and_update();
        let concurrency = self.snapshot.options.concurrency.max(1);

        self.skip_blocked_pending();
        if paused {
            self.set_paused(true);
        }
        self.persist();

        let mut cancelled = false;
        loop {
            self.promote_ready();

            if !paused {
                while workers.len() < concurrency {
                    let Some((_, id)) = self.ready.pop_first() else {
                        break;
                    };
                    self.start(&id, &mut workers);
                }
            }

            if workers.is_empty() && self.ready.is_empty() && self.retry_at.is_empty() {
                break;
            }

            let next_retry = self.retry_at.first().map(|(at, _, _)| *at);
            tokio::select! {
                biased;

                _ = self.control.cancel.cancelled() => {
                    cancelled = true;
                    break;
                }

                Some(joined) = workers.join_next(), if !workers.is_empty() => {
                    match joined {
                        Ok(done) => self.complete(done),
                        Err(e) => error!(error = %e, "Node worker aborted"),
                    }
                }

                _ = tokio::time::sleep_until(next_retry.unwrap_or_else(Instant::now)),
                    if next_retry.is_some() =>
                {
                    self.fire_retries();
                }

                changed = pause_rx.changed(), if pause_open => {
                    let now_paused = match changed {
                        Ok(()) => *pause_rx.borrow_and_update(),
                        // Control handle dropped: nothing can pause us any more.
                        Err(_) => {
                            pause_open = false;
                            false
                        }
                    };
                    if now_paused != paused {
                        paused = now_paused;
                        self.set_paused(paused);
                        self.persist();
                    }
                }
            }
        }

        if cancelled {
            workers.shutdown().await;
            self.cancel_remaining();
        }
        self.finish(cancelled)
    }

    fn spec(&self, id: &str) -> Option<&NodeSpec> {
        self.specs.get(id)
    }

    /// Move pending nodes whose dependencies all succeeded into the ready queue.
    fn promote_ready(&mut self) {
        let mut promoted = Vec::new();
        for id in self.plan.order() {
            let Some(node) = self.snapshot.nodes.get(id) else {
                continue;
            };
            if node.status != NodeStatus::Pending {
                continue;
            }
            let Some(spec) = self.specs.get(id) else {
                continue;
            };
            let deps_done = spec.depends_on.iter().all(|dep| {
                self.snapshot
                    .nodes
                    .get(dep)
                    .is_some_and(|d| d.status == NodeStatus::Succeeded)
            });
            if deps_done {
                promoted.push(id.clone());
            }
        }

        for id in promoted {
            if let Some(node) = self.snapshot.nodes.get_mut(&id) {
                node.status = NodeStatus::Ready;
                node.ready_at = Some(Utc::now());
            }
            self.ready.insert((self.plan.topo_index(&id), id.clone()));
            self.runner.event_bus.publish(RunEvent::NodeReady {
                run_id: self.snapshot.run_id.clone(),
                node_id: id,
            });
        }
    }

    fn start(&mut self, id: &str, workers: &mut JoinSet<AttemptDone>) {
        let Some(spec) = self.spec(id).cloned() else {
            return;
        };
        let options = &self.snapshot.options;
        let engine_choice =
            options
                .mode
                .engine_for(&spec.capability, &self.runner.hybrid_delegate, spec.engine);
        let agent = spec.agent.clone().unwrap_or_else(|| options.agent.clone());
        let tenant = options.tenant.clone();
        let test_mode = options.test_mode;

        let Some(node) = self.snapshot.nodes.get_mut(id) else {
            return;
        };
        // Resolved once; retries and resumes keep the first choice.
        let engine = *node.engine.get_or_insert(engine_choice);
        node.attempts += 1;
        node.status = NodeStatus::Running;
        node.started_at = Some(Utc::now());
        let attempt = node.attempts;

        info!(node_id = %id, attempt, engine = %engine, "Node started");
        self.runner.event_bus.publish(RunEvent::NodeStarted {
            run_id: self.snapshot.run_id.clone(),
            node_id: id.to_string(),
            attempt,
            engine,
        });

        let decisions = DecisionLog::default();
        self.running.insert(id.to_string(), decisions.clone());

        let timeout = spec.timeout(self.runner.node_timeout_ms);
        let task = NodeTask {
            run_id: self.snapshot.run_id.clone(),
            node: spec,
            engine,
            attempt,
            agent,
            tenant,
            test_mode,
            ledger: self.ledger.clone(),
            decisions,
            cancel: self.control.cancel.child_token(),
        };
        let executor = self.runner.executor.clone();
        let node_id = id.to_string();

        workers.spawn(async move {
            let began = StdInstant::now();
            let work = AssertUnwindSafe(executor.execute(task)).catch_unwind();
            let outcome = match tokio::time::timeout(timeout, work).await {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(panic)) => NodeOutcome::failed(NodeError::from_panic(panic)),
                Err(_) => NodeOutcome::failed(NodeError::Timeout(timeout.as_millis() as u64)),
            };
            AttemptDone {
                node_id,
                attempt,
                elapsed_ms: began.elapsed().as_millis() as u64,
                outcome,
            }
        });

        self.persist();
    }

    fn complete(&mut self, done: AttemptDone) {
        let AttemptDone {
            node_id,
            attempt,
            elapsed_ms,
            outcome,
        } = done;

        let decisions = self
            .running
            .remove(&node_id)
            .map(|log| {
                let mut guard = log.lock().unwrap_or_else(PoisonError::into_inner);
                std::mem::take(&mut *guard)
            })
            .unwrap_or_default();
        let retry = self
            .runner
            .retry
            .merged(self.spec(&node_id).and_then(|s| s.retry.as_ref()));
        let run_id = self.snapshot.run_id.clone();

        let Some(node) = self.snapshot.nodes.get_mut(&node_id) else {
            return;
        };
        node.decisions.extend(decisions);
        if outcome.gate.is_some() {
            node.gate = outcome.gate;
        }

        match outcome.result {
            Ok(artifacts) => {
                node.status = NodeStatus::Succeeded;
                node.finished_at = Some(Utc::now());
                node.artifacts = artifacts;
                info!(node_id = %node_id, attempt, elapsed_ms, "Node succeeded");
                self.runner.event_bus.publish(RunEvent::NodeSucceeded {
                    run_id,
                    node_id,
                    attempt,
                    elapsed_ms,
                });
            }
            Err(NodeError::Cancelled) => {
                node.status = NodeStatus::Skipped;
                node.finished_at = Some(Utc::now());
                node.skip_reason = Some("run cancelled".to_string());
            }
            Err(e) => {
                node.errors.push(FailureRecord::from_error(attempt, &e));
                if retry.should_retry(node.attempts, e.class()) {
                    node.status = NodeStatus::FailedRetryable;
                    let delay = retry.backoff(node.attempts);
                    warn!(
                        node_id = %node_id,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Node failed, will retry"
                    );
                    self.retry_at.insert((
                        Instant::now() + delay,
                        self.plan.topo_index(&node_id),
                        node_id.clone(),
                    ));
                    self.runner.event_bus.publish(RunEvent::NodeRetrying {
                        run_id,
                        node_id,
                        attempt,
                        delay_ms: delay.as_millis() as u64,
                        error: e.to_string(),
                    });
                } else {
                    node.status = NodeStatus::FailedTerminal;
                    node.finished_at = Some(Utc::now());
                    error!(
                        node_id = %node_id,
                        attempt,
                        class = ?e.class(),
                        error = %e,
                        "Node failed"
                    );
                    self.runner.event_bus.publish(RunEvent::NodeFailed {
                        run_id,
                        node_id: node_id.clone(),
                        attempt,
                        code: e.code(),
                        error: e.to_string(),
                    });
                    self.skip_dependents(&node_id);
                }
            }
        }

        self.persist();
    }

    /// Requeue retry-waiting nodes whose backoff has elapsed.
    fn fire_retries(&mut self) {
        let now = Instant::now();
        while let Some(first) = self.retry_at.first() {
            if first.0 > now {
                break;
            }
            let Some((_, idx, id)) = self.retry_at.pop_first() else {
                break;
            };
            if let Some(node) = self.snapshot.nodes.get_mut(&id) {
                if node.status == NodeStatus::FailedRetryable {
                    node.status = NodeStatus::Ready;
                    node.ready_at = Some(Utc::now());
                    self.ready.insert((idx, id));
                }
            }
        }
    }

    fn skip_dependents(&mut self, failed: &str) {
        for id in self.plan.transitive_dependents(failed) {
            let Some(node) = self.snapshot.nodes.get_mut(&id) else {
                continue;
            };
            if node.status.is_terminal() || node.status == NodeStatus::Running {
                continue;
            }
            let reason = format!("dependency '{}' did not succeed", failed);
            debug!(node_id = %id, reason = %reason, "Skipping node");
            node.status = NodeStatus::Skipped;
            node.finished_at = Some(Utc::now());
            node.skip_reason = Some(reason.clone());
            self.ready.retain(|(_, r)| r != &id);
            self.runner.event_bus.publish(RunEvent::NodeSkipped {
                run_id: self.snapshot.run_id.clone(),
                node_id: id,
                reason,
            });
        }
    }

    /// A reloaded run may hold pending nodes behind a dependency that already failed.
    fn skip_blocked_pending(&mut self) {
        let dead: Vec<String> = self
            .snapshot
            .nodes
            .values()
            .filter(|n| matches!(n.status, NodeStatus::FailedTerminal | NodeStatus::Skipped))
            .map(|n| n.id.clone())
            .collect();
        for id in dead {
            self.skip_dependents(&id);
        }
    }

    fn cancel_remaining(&mut self) {
        warn!(run_id = %self.snapshot.run_id, "Run cancelled");
        self.ready.clear();
        self.retry_at.clear();
        // In-flight attempts may already have committed spend.
        for (id, log) in self.running.drain() {
            let mut guard = log.lock().unwrap_or_else(PoisonError::into_inner);
            let decisions = std::mem::take(&mut *guard);
            drop(guard);
            if let Some(node) = self.snapshot.nodes.get_mut(&id) {
                node.decisions.extend(decisions);
            }
        }
        let run_id = self.snapshot.run_id.clone();
        for node in self.snapshot.nodes.values_mut() {
            if node.status.is_terminal() {
                continue;
            }
            node.status = NodeStatus::Skipped;
            node.finished_at = Some(Utc::now());
            node.skip_reason = Some("run cancelled".to_string());
            self.runner.event_bus.publish(RunEvent::NodeSkipped {
                run_id: run_id.clone(),
                node_id: node.id.clone(),
                reason: "run cancelled".to_string(),
            });
        }
    }

    fn set_paused(&mut self, paused: bool) {
        let run_id = self.snapshot.run_id.clone();
        if paused {
            info!(run_id = %run_id, "Run paused");
            self.snapshot.status = RunStatus::Paused;
            self.runner.event_bus.publish(RunEvent::RunPaused { run_id });
        } else {
            info!(run_id = %run_id, "Run resumed");
            self.snapshot.status = RunStatus::Running;
            self.runner.event_bus.publish(RunEvent::RunResumed { run_id });
        }
    }

    fn finish(mut self, cancelled: bool) -> RunSnapshot {
        // Anything still pending never had its dependencies met.
        for node in self.snapshot.nodes.values_mut() {
            if !node.status.is_terminal() {
                node.status = NodeStatus::Skipped;
                node.finished_at = Some(Utc::now());
                node.skip_reason
                    .get_or_insert_with(|| "dependencies never succeeded".to_string());
            }
        }

        let required_ok = self.snapshot.graph.nodes.iter().all(|spec| {
            spec.optional
                || self
                    .snapshot
                    .node(&spec.id)
                    .is_some_and(|n| n.status == NodeStatus::Succeeded)
        });

        if !cancelled && required_ok {
            if let Some(contract) = &self.snapshot.graph.contract {
                let artifacts = self.snapshot.collected_artifacts(self.plan.order());
                let gate = self.runner.executor.gate().evaluate(contract, &artifacts);
                self.runner.event_bus.publish(RunEvent::GateEvaluated {
                    run_id: self.snapshot.run_id.clone(),
                    node_id: None,
                    passed: gate.passed(),
                    violations: gate.violations.len(),
                });
                self.snapshot.run_gate = Some(gate);
            }
        }
        let gate_ok = self.snapshot.run_gate.as_ref().map_or(true, |g| g.passed());

        let (status, code) = if cancelled {
            (RunStatus::Cancelled, OutcomeCode::General)
        } else if required_ok && gate_ok {
            (RunStatus::Succeeded, OutcomeCode::Success)
        } else {
            let node_codes = self.snapshot.graph.nodes.iter().filter_map(|spec| {
                if spec.optional {
                    return None;
                }
                self.snapshot.node(&spec.id).and_then(|n| n.failure_code())
            });
            let gate_code = self
                .snapshot
                .run_gate
                .as_ref()
                .filter(|g| !g.passed())
                .map(|g| g.code);
            (
                RunStatus::Failed,
                OutcomeCode::most_severe(node_codes.chain(gate_code)),
            )
        };

        self.snapshot.status = status;
        self.snapshot.outcome = Some(code);
        self.persist();

        let elapsed_ms = self.started.elapsed().as_millis() as u64;
        info!(
            run_id = %self.snapshot.run_id,
            status = %status,
            code = %code,
            elapsed_ms,
            "Run complete"
        );
        self.runner.event_bus.publish(RunEvent::RunComplete {
            run_id: self.snapshot.run_id.clone(),
            status,
            code,
            elapsed_ms,
        });
        self.snapshot
    }

    fn persist(&mut self) {
        self.snapshot.ledger = self.ledger.snapshot();
        self.snapshot.touch();
        self.runner.persist(&self.snapshot);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    use futures::future::BoxFuture;

    use conductor_core::PolicyConfig;
    use conductor_router::{CapabilityRouter, CredentialSet};

    use crate::handler::{HandlerRegistry, NoopHandler, ToolCall, ToolError, ToolHandler, ToolOutput};

    const POLICY: &str = r#"
[[capabilities.work]]
tool = "worker"

[[capabilities.flaky]]
tool = "flaky"

[[capabilities.broken]]
tool = "broken"

[[capabilities.slow]]
tool = "sleeper"

[agents.default]
allow = ["*"]
"#;

    struct FailTimes {
        remaining: AtomicU32,
    }

    impl ToolHandler for FailTimes {
        fn invoke(&self, _call: ToolCall) -> BoxFuture<'_, std::result::Result<ToolOutput, ToolError>> {
            Box::pin(async move {
                let left = self.remaining.load(Ordering::SeqCst);
                if left > 0 {
                    self.remaining.fetch_sub(1, Ordering::SeqCst);
                    return Err(ToolError::transient("connection reset"));
                }
                Ok(ToolOutput::default())
            })
        }
    }

    struct Broken;

    impl ToolHandler for Broken {
        fn invoke(&self, _call: ToolCall) -> BoxFuture<'_, std::result::Result<ToolOutput, ToolError>> {
            Box::pin(async { Err(ToolError::terminal("bad input")) })
        }
    }

    struct Sleeper;

    impl ToolHandler for Sleeper {
        fn invoke(&self, _call: ToolCall) -> BoxFuture<'_, std::result::Result<ToolOutput, ToolError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::default())
            })
        }
    }

    fn runner(flaky_failures: u32) -> GraphRunner {
        let policy = Arc::new(PolicyConfig::from_toml(POLICY).unwrap());
        let router = Arc::new(CapabilityRouter::new(policy, CredentialSet::new()));
        let mut handlers = HandlerRegistry::new();
        handlers.register("worker", NoopHandler);
        handlers.register(
            "flaky",
            FailTimes {
                remaining: AtomicU32::new(flaky_failures),
            },
        );
        handlers.register("broken", Broken);
        handlers.register("sleeper", Sleeper);
        let bus = Arc::new(EventBus::default());
        let executor = Arc::new(NodeExecutor::new(router, handlers, bus.clone()));
        GraphRunner::new(executor, bus).with_retry(RetryPolicy {
            max_attempts: 3,
            initial_backoff_ms: 5,
            max_backoff_ms: 20,
        })
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let graph = GraphSpec::new(vec![
            NodeSpec::new("a", "flaky"),
            NodeSpec::new("b", "work").depends_on(["a"]),
        ]);
        let snap = runner(2).submit(graph, RunOptions::default()).await.unwrap();
        assert_eq!(snap.status, RunStatus::Succeeded);
        assert_eq!(snap.outcome, Some(OutcomeCode::Success));
        let a = snap.node("a").unwrap();
        assert_eq!(a.attempts, 3);
        assert_eq!(a.errors.len(), 2);
        assert_eq!(snap.node("b").unwrap().attempts, 1);
    }

    #[tokio::test]
    async fn terminal_failure_skips_dependents() {
        let graph = GraphSpec::new(vec![
            NodeSpec::new("a", "broken"),
            NodeSpec::new("b", "work").depends_on(["a"]),
            NodeSpec::new("c", "work").depends_on(["b"]),
            NodeSpec::new("d", "work"),
        ]);
        let snap = runner(0).submit(graph, RunOptions::default()).await.unwrap();
        assert_eq!(snap.status, RunStatus::Failed);
        assert_eq!(snap.node("a").unwrap().status, NodeStatus::FailedTerminal);
        assert_eq!(snap.node("a").unwrap().attempts, 1);
        assert_eq!(snap.node("b").unwrap().status, NodeStatus::Skipped);
        assert_eq!(snap.node("c").unwrap().status, NodeStatus::Skipped);
        assert_eq!(snap.node("d").unwrap().status, NodeStatus::Succeeded);
    }

    #[tokio::test]
    async fn optional_failure_does_not_fail_run() {
        let graph = GraphSpec::new(vec![
            NodeSpec::new("a", "broken").optional(),
            NodeSpec::new("b", "work"),
        ]);
        let snap = runner(0).submit(graph, RunOptions::default()).await.unwrap();
        assert_eq!(snap.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn timeouts_exhaust_retries() {
        let graph = GraphSpec::new(vec![NodeSpec::new("s", "slow")
            .with_timeout_ms(20)
            .with_max_attempts(2)]);
        let snap = runner(0).submit(graph, RunOptions::default()).await.unwrap();
        let s = snap.node("s").unwrap();
        assert_eq!(s.status, NodeStatus::FailedTerminal);
        assert_eq!(s.attempts, 2);
        assert!(s.errors.iter().all(|e| e.message.contains("timed out")));
    }

    #[tokio::test]
    async fn cancel_marks_everything_skipped() {
        let runner = runner(0);
        let graph = GraphSpec::new(vec![
            NodeSpec::new("s", "slow"),
            NodeSpec::new("after", "work").depends_on(["s"]),
        ]);
        let snapshot = runner.prepare(graph, RunOptions::default()).unwrap();
        let control = Arc::new(RunControl::new());
        let canceller = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            canceller.cancel();
        });

        let snap = tokio::time::timeout(Duration::from_secs(5), runner.execute(snapshot, control))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.status, RunStatus::Cancelled);
        assert_eq!(snap.count(NodeStatus::Skipped), 2);
        // The interrupted attempt's routing decision stays on record.
        let slow = snap.node("s").unwrap();
        assert_eq!(slow.decisions.len(), 1);
        assert_eq!(slow.decisions[0].tool(), Some("sleeper"));
    }

    #[tokio::test]
    async fn paused_run_dispatches_nothing_until_resumed() {
        let runner = runner(0);
        let mut rx = runner.event_bus().subscribe();
        let graph = GraphSpec::new(vec![NodeSpec::new("a", "work")]);
        let snapshot = runner.prepare(graph, RunOptions::default()).unwrap();
        let control = Arc::new(RunControl::new());
        control.pause();

        let resumer = control.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            resumer.resume();
        });
        let snap = runner.execute(snapshot, control).await.unwrap();
        assert_eq!(snap.status, RunStatus::Succeeded);

        let mut saw_pause_before_start = false;
        let mut paused = false;
        while let Ok(event) = rx.try_recv() {
            match event {
                RunEvent::RunPaused { .. } => paused = true,
                RunEvent::NodeStarted { .. } => {
                    saw_pause_before_start = paused;
                    break;
                }
                RunEvent::RunResumed { .. } => paused = false,
                _ => {}
            }
        }
        assert!(!saw_pause_before_start);
    }

    #[tokio::test]
    async fn invalid_graph_is_rejected_before_scheduling() {
        let graph = GraphSpec::new(vec![
            NodeSpec::new("a", "work").depends_on(["b"]),
            NodeSpec::new("b", "work").depends_on(["a"]),
        ]);
        let err = runner(0).submit(graph, RunOptions::default()).await.unwrap_err();
        assert!(matches!(err, ConductorError::CycleDetected(_)));
        assert_eq!(err.outcome_code(), OutcomeCode::Startup);
    }
}
