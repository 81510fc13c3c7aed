//! Shared test helpers: scripted tool handlers, a mock delegate and a
//! harness that wires a runner together from a policy string.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::future::BoxFuture;

use conductor_core::config::RetryConfig;
use conductor_core::{EventBus, PolicyConfig};
use conductor_gate::{Artifact, ArtifactSet};
use conductor_router::{CapabilityRouter, CredentialSet};
use conductor_runner::{
    DelegateClient, DelegateLimits, DelegateReply, DelegateTurn, GraphRunner, HandlerRegistry,
    NodeExecutor, RetryPolicy, SnapshotStore, ToolCall, ToolError, ToolHandler, ToolOutput,
};

/// Parse a policy or panic with the validation message.
pub fn policy(toml_str: &str) -> Arc<PolicyConfig> {
    Arc::new(PolicyConfig::from_toml(toml_str).expect("test policy must be valid"))
}

/// One tool per capability, named after it, open to every agent.
pub fn open_policy(capabilities: &[&str]) -> Arc<PolicyConfig> {
    let mut text = String::new();
    for cap in capabilities {
        text.push_str(&format!("[[capabilities.{cap}]]\ntool = \"{cap}\"\n\n"));
    }
    text.push_str("[agents.default]\nallow = [\"*\"]\n");
    policy(&text)
}

/// Retry policy with millisecond backoff so tests stay fast.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy::from_config(&RetryConfig {
        max_attempts,
        initial_backoff_ms: 5,
        max_backoff_ms: 20,
    })
}

/// Fails with a transient error for the first `failures` calls, then succeeds.
pub struct ScriptedHandler {
    failures: u32,
    calls: Arc<AtomicU32>,
}

impl ScriptedHandler {
    pub fn new(failures: u32) -> Self {
        Self {
            failures,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn succeeding() -> Self {
        Self::new(0)
    }

    /// Shared invocation counter.
    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl ToolHandler for ScriptedHandler {
    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.failures {
                return Err(ToolError::transient(format!(
                    "{} attempt {} failed",
                    call.tool, n
                )));
            }
            let artifacts = ArtifactSet::new().with(
                call.node_id.clone(),
                Artifact::json(serde_json::json!({ "tool": call.tool, "call": n })),
            );
            Ok(ToolOutput::new(artifacts))
        })
    }
}

/// Always fails with a terminal error.
pub struct FailingHandler;

impl ToolHandler for FailingHandler {
    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move { Err(ToolError::terminal(format!("{} rejected input", call.tool))) })
    }
}

/// Sleeps for `slow` on the first `slow_calls` invocations, then answers at once.
pub struct SlowHandler {
    slow: Duration,
    slow_calls: u32,
    calls: Arc<AtomicU32>,
}

impl SlowHandler {
    pub fn new(slow: Duration, slow_calls: u32) -> Self {
        Self {
            slow,
            slow_calls,
            calls: Arc::new(AtomicU32::new(0)),
        }
    }

    pub fn calls(&self) -> Arc<AtomicU32> {
        self.calls.clone()
    }
}

impl ToolHandler for SlowHandler {
    fn invoke(&self, _call: ToolCall) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.slow_calls {
                tokio::time::sleep(self.slow).await;
            }
            Ok(ToolOutput::default())
        })
    }
}

/// Start and end of one recorded invocation.
#[derive(Debug, Clone)]
pub struct Span {
    pub node_id: String,
    pub started: Instant,
    pub finished: Instant,
}

/// Sleeps for a per-call delay and records when each node ran.
pub struct RecordingHandler {
    delays: Mutex<VecDeque<Duration>>,
    spans: Arc<Mutex<Vec<Span>>>,
}

impl RecordingHandler {
    /// Delays are consumed in call order; calls beyond the list do not sleep.
    pub fn new(delays: Vec<Duration>) -> Self {
        Self {
            delays: Mutex::new(delays.into()),
            spans: Arc::new(Mutex::new(Vec::new())),
        }
    }

    pub fn spans(&self) -> Arc<Mutex<Vec<Span>>> {
        self.spans.clone()
    }
}

impl ToolHandler for RecordingHandler {
    fn invoke(&self, call: ToolCall) -> BoxFuture<'_, Result<ToolOutput, ToolError>> {
        Box::pin(async move {
            let started = Instant::now();
            let delay = self.delays.lock().unwrap().pop_front();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
            self.spans.lock().unwrap().push(Span {
                node_id: call.node_id,
                started,
                finished: Instant::now(),
            });
            Ok(ToolOutput::default())
        })
    }
}

/// Replays a fixed script of replies, then reports done with no artifacts.
pub struct MockDelegate {
    replies: Mutex<VecDeque<DelegateReply>>,
    turns: Arc<Mutex<Vec<DelegateTurn>>>,
}

impl MockDelegate {
    pub fn new(replies: Vec<DelegateReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            turns: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Every turn the delegate received.
    pub fn turns(&self) -> Arc<Mutex<Vec<DelegateTurn>>> {
        self.turns.clone()
    }
}

impl DelegateClient for MockDelegate {
    fn step(&self, turn: DelegateTurn) -> BoxFuture<'_, Result<DelegateReply, ToolError>> {
        Box::pin(async move {
            self.turns.lock().unwrap().push(turn);
            let next = self.replies.lock().unwrap().pop_front();
            Ok(next.unwrap_or_else(|| DelegateReply::Done(ArtifactSet::new())))
        })
    }
}

/// Builds a runner over a policy with registered handlers.
pub struct Harness {
    policy: Arc<PolicyConfig>,
    credentials: CredentialSet,
    handlers: HandlerRegistry,
    delegate: Option<Arc<dyn DelegateClient>>,
    limits: DelegateLimits,
    retry: RetryPolicy,
    node_timeout_ms: u64,
    hybrid_delegate: Vec<String>,
    event_bus: Arc<EventBus>,
}

impl Harness {
    pub fn new(policy: Arc<PolicyConfig>) -> Self {
        Self {
            policy,
            credentials: CredentialSet::new(),
            handlers: HandlerRegistry::new(),
            delegate: None,
            limits: DelegateLimits::default(),
            retry: fast_retry(3),
            node_timeout_ms: 5_000,
            hybrid_delegate: Vec::new(),
            event_bus: Arc::new(EventBus::default()),
        }
    }

    pub fn handler(mut self, tool: &str, handler: impl ToolHandler) -> Self {
        self.handlers.register(tool, handler);
        self
    }

    pub fn shared_handler(mut self, tool: &str, handler: Arc<dyn ToolHandler>) -> Self {
        self.handlers.register_arc(tool, handler);
        self
    }

    pub fn credential(mut self, name: &str) -> Self {
        self.credentials = self.credentials.with(name);
        self
    }

    pub fn delegate(mut self, delegate: Arc<dyn DelegateClient>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    pub fn limits(mut self, limits: DelegateLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn node_timeout_ms(mut self, ms: u64) -> Self {
        self.node_timeout_ms = ms;
        self
    }

    pub fn hybrid_delegate(mut self, capabilities: &[&str]) -> Self {
        self.hybrid_delegate = capabilities.iter().map(|c| c.to_string()).collect();
        self
    }

    pub fn event_bus(&self) -> Arc<EventBus> {
        self.event_bus.clone()
    }

    pub fn executor(&self) -> Arc<NodeExecutor> {
        let router = Arc::new(CapabilityRouter::new(
            self.policy.clone(),
            self.credentials.clone(),
        ));
        let mut executor = NodeExecutor::new(router, self.handlers.clone(), self.event_bus.clone())
            .with_limits(self.limits);
        if let Some(d) = &self.delegate {
            executor = executor.with_delegate(d.clone());
        }
        Arc::new(executor)
    }

    /// Runner with no snapshot store.
    pub fn build(&self) -> GraphRunner {
        GraphRunner::new(self.executor(), self.event_bus.clone())
            .with_retry(self.retry)
            .with_node_timeout_ms(self.node_timeout_ms)
            .with_hybrid_delegate(self.hybrid_delegate.clone())
    }

    /// Runner persisting to `runs.db` under `dir`.
    pub fn build_with_store(&self, dir: &Path) -> (GraphRunner, Arc<SnapshotStore>) {
        let store = Arc::new(
            SnapshotStore::open(&dir.join("runs.db")).expect("snapshot store must open"),
        );
        (self.build().with_store(store.clone()), store)
    }
}
