use std::sync::atomic::Ordering;

use conductor_core::types::RunStatus;
use conductor_gate::Artifact;
use conductor_runner::{GraphSpec, NodeSpec, NodeStatus, RunOptions};
use conductor_test_utils::{fast_retry, open_policy, Harness, ScriptedHandler};

fn pipeline() -> GraphSpec {
    GraphSpec::new(vec![
        NodeSpec::new("ingest", "ingest"),
        NodeSpec::new("transform", "transform").depends_on(["ingest"]),
        NodeSpec::new("report", "report").depends_on(["transform"]),
    ])
}

#[tokio::test]
async fn test_resume_after_crash_skips_succeeded_nodes() {
    let dir = tempfile::tempdir().unwrap();
    let ingest = ScriptedHandler::succeeding();
    let transform = ScriptedHandler::succeeding();
    let report = ScriptedHandler::succeeding();
    let ingest_calls = ingest.calls();
    let transform_calls = transform.calls();
    let report_calls = report.calls();

    let (runner, store) = Harness::new(open_policy(&["ingest", "transform", "report"]))
        .handler("ingest", ingest)
        .handler("transform", transform)
        .handler("report", report)
        .build_with_store(dir.path());

    // Persisted state as a crash would leave it: ingest done, transform mid-flight.
    let mut snap = runner.prepare(pipeline(), RunOptions::default()).unwrap();
    {
        let node = snap.nodes.get_mut("ingest").unwrap();
        node.status = NodeStatus::Succeeded;
        node.attempts = 1;
        node.artifacts.insert("ingest", Artifact::text("rows"));
    }
    {
        let node = snap.nodes.get_mut("transform").unwrap();
        node.status = NodeStatus::Running;
        node.attempts = 1;
    }
    store.save(&snap).unwrap();

    let resumed = runner.resume(&snap.run_id).await.unwrap();
    assert_eq!(resumed.status, RunStatus::Succeeded);
    assert_eq!(ingest_calls.load(Ordering::SeqCst), 0);
    assert_eq!(transform_calls.load(Ordering::SeqCst), 1);
    assert_eq!(report_calls.load(Ordering::SeqCst), 1);
    assert_eq!(resumed.node("ingest").unwrap().attempts, 1);
    assert_eq!(resumed.node("transform").unwrap().attempts, 2);

    let stored = store.load(&snap.run_id).unwrap().unwrap();
    assert_eq!(stored.status, RunStatus::Succeeded);

    // An uninterrupted run of the same graph ends the same way.
    let fresh = Harness::new(open_policy(&["ingest", "transform", "report"]))
        .handler("ingest", ScriptedHandler::succeeding())
        .handler("transform", ScriptedHandler::succeeding())
        .handler("report", ScriptedHandler::succeeding())
        .build()
        .submit(pipeline(), RunOptions::default())
        .await
        .unwrap();
    assert_eq!(fresh.status, resumed.status);
    assert_eq!(fresh.outcome, resumed.outcome);
}

#[tokio::test]
async fn test_finished_run_cannot_be_resumed() {
    let dir = tempfile::tempdir().unwrap();
    let (runner, _store) = Harness::new(open_policy(&["ingest", "transform", "report"]))
        .handler("ingest", ScriptedHandler::succeeding())
        .handler("transform", ScriptedHandler::succeeding())
        .handler("report", ScriptedHandler::succeeding())
        .build_with_store(dir.path());

    let snap = runner.submit(pipeline(), RunOptions::default()).await.unwrap();
    assert_eq!(snap.status, RunStatus::Succeeded);
    assert!(runner.resume(&snap.run_id).await.is_err());
}

#[tokio::test]
async fn test_interrupted_last_attempt_runs_once_more() {
    let dir = tempfile::tempdir().unwrap();
    let transform = ScriptedHandler::new(1);
    let transform_calls = transform.calls();
    let (runner, store) = Harness::new(open_policy(&["ingest", "transform", "report"]))
        .handler("ingest", ScriptedHandler::succeeding())
        .handler("transform", transform)
        .handler("report", ScriptedHandler::succeeding())
        .retry(fast_retry(2))
        .build_with_store(dir.path());

    // Crashed during its final allowed attempt.
    let mut snap = runner.prepare(pipeline(), RunOptions::default()).unwrap();
    snap.nodes.get_mut("ingest").unwrap().status = NodeStatus::Succeeded;
    {
        let node = snap.nodes.get_mut("transform").unwrap();
        node.status = NodeStatus::Running;
        node.attempts = 2;
    }
    store.save(&snap).unwrap();

    let resumed = runner.resume(&snap.run_id).await.unwrap();
    let transform = resumed.node("transform").unwrap();
    assert_eq!(transform_calls.load(Ordering::SeqCst), 1);
    assert_eq!(transform.attempts, 3);
    assert_eq!(transform.status, NodeStatus::FailedTerminal);
    assert_eq!(resumed.node("report").unwrap().status, NodeStatus::Skipped);
    assert_eq!(resumed.status, RunStatus::Failed);
}
