//! Randomized checks of scheduling order, router purity and budget safety.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use conductor_core::types::{ExecutionMode, RunStatus};
use conductor_router::{BudgetLedger, CapabilityRouter, CredentialSet, RouterRequest, Spend};
use conductor_runner::{GraphSpec, NodeSpec, NodeStatus, RunOptions};
use conductor_test_utils::{open_policy, policy, Harness, RecordingHandler, ScriptedHandler};

fn random_dag(rng: &mut StdRng, size: usize) -> GraphSpec {
    let mut nodes = Vec::with_capacity(size);
    for i in 0..size {
        let deps: Vec<String> = (0..i)
            .filter(|_| rng.gen_bool(0.3))
            .map(|j| format!("n{j}"))
            .collect();
        nodes.push(NodeSpec::new(format!("n{i}"), "work").depends_on(deps));
    }
    // Declaration order must not matter.
    nodes.shuffle(rng);
    GraphSpec::new(nodes)
}

#[tokio::test]
async fn test_nodes_never_start_before_dependencies() {
    for seed in 0..8u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let size = rng.gen_range(4..14);
        let graph = random_dag(&mut rng, size);
        let delays = (0..size)
            .map(|_| Duration::from_millis(rng.gen_range(0..15)))
            .collect();
        let handler = RecordingHandler::new(delays);
        let spans = handler.spans();

        let runner = Harness::new(open_policy(&["work"]))
            .handler("work", handler)
            .build();
        let options = RunOptions::new(rng.gen_range(1..5), ExecutionMode::Deterministic);
        let snap = runner.submit(graph.clone(), options).await.unwrap();

        assert_eq!(snap.status, RunStatus::Succeeded, "seed {seed}");
        assert!(snap.nodes.values().all(|n| n.status.is_terminal()));

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), size, "seed {seed}");
        let by_id: HashMap<&str, _> = spans.iter().map(|s| (s.node_id.as_str(), s)).collect();
        for node in &graph.nodes {
            let started = by_id[node.id.as_str()].started;
            for dep in &node.depends_on {
                assert!(
                    by_id[dep.as_str()].finished <= started,
                    "seed {seed}: {} started before {} finished",
                    node.id,
                    dep
                );
            }
        }
    }
}

async fn dispatch_order(graph: GraphSpec) -> Vec<String> {
    let handler = RecordingHandler::new(vec![Duration::from_millis(2); graph.nodes.len()]);
    let spans = handler.spans();
    let runner = Harness::new(open_policy(&["work"]))
        .handler("work", handler)
        .build();
    let snap = runner
        .submit(graph, RunOptions::new(1, ExecutionMode::Deterministic))
        .await
        .unwrap();
    assert_eq!(snap.status, RunStatus::Succeeded);

    let mut spans = spans.lock().unwrap().clone();
    spans.sort_by_key(|s| s.started);
    spans.into_iter().map(|s| s.node_id).collect()
}

#[tokio::test]
async fn test_ready_nodes_dispatch_in_topological_then_id_order() {
    let independent = GraphSpec::new(
        ["z", "c", "a", "d", "b"]
            .into_iter()
            .map(|id| NodeSpec::new(id, "work"))
            .collect(),
    );
    assert_eq!(dispatch_order(independent).await, ["a", "b", "c", "d", "z"]);

    let fan_out = GraphSpec::new(vec![
        NodeSpec::new("y", "work"),
        NodeSpec::new("b", "work").depends_on(["root"]),
        NodeSpec::new("a", "work").depends_on(["root"]),
        NodeSpec::new("root", "work"),
    ]);
    assert_eq!(dispatch_order(fan_out).await, ["root", "a", "b", "y"]);
}

#[tokio::test]
async fn test_in_flight_nodes_never_exceed_concurrency() {
    for concurrency in 1..=4usize {
        let size = 12;
        let handler = RecordingHandler::new(vec![Duration::from_millis(10); size]);
        let spans = handler.spans();
        let runner = Harness::new(open_policy(&["work"]))
            .handler("work", handler)
            .build();
        let graph = GraphSpec::new(
            (0..size)
                .map(|i| NodeSpec::new(format!("n{i:02}"), "work"))
                .collect(),
        );
        let snap = runner
            .submit(graph, RunOptions::new(concurrency, ExecutionMode::Deterministic))
            .await
            .unwrap();
        assert_eq!(snap.status, RunStatus::Succeeded);

        let spans = spans.lock().unwrap();
        assert_eq!(spans.len(), size);
        let peak = spans
            .iter()
            .map(|at| {
                spans
                    .iter()
                    .filter(|s| s.started <= at.started && at.started < s.finished)
                    .count()
            })
            .max()
            .unwrap_or(0);
        assert!(
            peak <= concurrency,
            "{peak} nodes in flight with concurrency {concurrency}"
        );
        if concurrency > 1 {
            assert!(peak > 1, "independent nodes never overlapped");
        }
    }
}

#[tokio::test]
async fn test_every_node_terminates_when_some_fail() {
    let mut rng = StdRng::seed_from_u64(42);
    let graph = random_dag(&mut rng, 12);
    let policy = policy(
        r#"
[[capabilities.work]]
tool = "work"

[[capabilities.flaky]]
tool = "flaky"

[agents.default]
allow = ["*"]
"#,
    );
    let mut nodes = graph.nodes.clone();
    for node in nodes.iter_mut().filter(|n| n.id == "n3" || n.id == "n7") {
        node.capability = "flaky".into();
    }

    let runner = Harness::new(policy)
        .handler("work", ScriptedHandler::succeeding())
        .handler("flaky", conductor_test_utils::FailingHandler)
        .build();
    let snap = runner
        .submit(GraphSpec::new(nodes), RunOptions::default())
        .await
        .unwrap();

    assert_eq!(snap.status, RunStatus::Failed);
    assert!(snap.nodes.values().all(|n| n.status.is_terminal()));
    assert_eq!(snap.node("n3").unwrap().status, NodeStatus::FailedTerminal);
}

const ROUTING_POLICY: &str = r#"
[consent]
secondary = true

[[capabilities.fetch]]
tool = "curl"
cost = { model = "flat", usd = 0.01 }

[[capabilities.fetch]]
tool = "browser"
tier = "secondary"
cost = { model = "payload", base_usd = 0.02, usd_per_kb = 0.001, max_usd = 0.5 }

[[capabilities.search]]
tool = "search-api"
credential = "CONDUCTOR_PROPS_MISSING_KEY"

[[capabilities.search]]
tool = "scrape"
priority = 5

[agents.default]
allow = ["*"]

[agents.restricted]
allow = ["scrape"]

[budgets]
default_capability_usd = 0.05
"#;

fn requests() -> Vec<RouterRequest> {
    let mut out = Vec::new();
    for agent in ["default", "restricted", "ghost"] {
        for cap in ["fetch", "search", "missing"] {
            out.push(RouterRequest::new(cap, agent));
            out.push(RouterRequest::new(cap, agent).with_consent(true).with_payload_bytes(4096));
            out.push(RouterRequest::new(cap, agent).with_max_cost(Some(0.005)));
        }
    }
    out
}

#[tokio::test]
async fn test_router_decisions_ignore_invocation_order() {
    let policy = policy(ROUTING_POLICY);
    let router = Arc::new(CapabilityRouter::new(policy, CredentialSet::new()));
    let requests = requests();
    let spend = Spend {
        pair_micros: 30_000,
        agent_micros: 30_000,
    };

    let expected: Vec<_> = requests.iter().map(|r| router.resolve(r, spend)).collect();

    let mut rng = StdRng::seed_from_u64(7);
    for _ in 0..5 {
        let mut order: Vec<usize> = (0..requests.len()).collect();
        order.shuffle(&mut rng);
        let tasks = order.iter().map(|&i| {
            let router = router.clone();
            let request = requests[i].clone();
            tokio::spawn(async move { (i, router.resolve(&request, spend)) })
        });
        for joined in join_all(tasks).await {
            let (i, decision) = joined.unwrap();
            assert_eq!(decision, expected[i], "request {i}");
        }
    }
}

#[test]
fn test_ledger_never_exceeds_ceiling_under_contention() {
    let policy = policy(ROUTING_POLICY);
    let router = Arc::new(CapabilityRouter::new(policy.clone(), CredentialSet::new()));
    let ledger = Arc::new(BudgetLedger::from_policy(&policy));

    let handles: Vec<_> = (0..16)
        .map(|_| {
            let router = router.clone();
            let ledger = ledger.clone();
            std::thread::spawn(move || {
                (0..10)
                    .filter(|_| {
                        router
                            .route(&RouterRequest::new("fetch", "default"), &ledger)
                            .is_routed()
                    })
                    .count()
            })
        })
        .collect();
    let routed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();

    // 0.05 ceiling at 0.01 a call.
    assert_eq!(routed, 5);
    let spent = ledger.spent("default", "fetch");
    assert_eq!(spent.pair_micros, 50_000);
}
