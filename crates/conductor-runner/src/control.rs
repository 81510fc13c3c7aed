//! Authorized run control: start, inspect, pause, resume and cancel.
//!
//! Callers present a verified [`IdentityClaim`]. Mutating operations need
//! the operator role or higher; status needs viewer or higher. A claim bound
//! to a tenant only sees runs of that tenant.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::task::JoinHandle;
use tracing::info;

use conductor_core::error::{ConductorError, Result};
use conductor_core::types::{IdentityClaim, Role, RunId};

use crate::graph::GraphSpec;
use crate::runner::{GraphRunner, RunControl};
use crate::state::{RunOptions, RunSnapshot};

struct RunHandle {
    control: Arc<RunControl>,
    tenant: Option<String>,
    task: JoinHandle<Result<RunSnapshot>>,
}

pub struct ControlSurface {
    runner: Arc<GraphRunner>,
    runs: Mutex<HashMap<RunId, RunHandle>>,
}

impl ControlSurface {
    pub fn new(runner: Arc<GraphRunner>) -> Self {
        Self {
            runner,
            runs: Mutex::new(HashMap::new()),
        }
    }

    pub fn runner(&self) -> &Arc<GraphRunner> {
        &self.runner
    }

    /// Validate and persist the run, then execute it in the background.
    /// Fatal graph errors are returned here, before anything is scheduled.
    pub fn start(
        &self,
        claim: &IdentityClaim,
        graph: GraphSpec,
        mut options: RunOptions,
    ) -> Result<RunId> {
        authorize(claim, Role::Operator)?;
        match (&claim.tenant, &options.tenant) {
            (Some(own), Some(requested)) if own != requested => {
                return Err(unauthorized(claim, "access to the requested tenant"));
            }
            (Some(own), None) => options.tenant = Some(own.clone()),
            _ => {}
        }

        let mut snapshot = self.runner.prepare(graph, options)?;
        snapshot.started_by = Some(claim.subject.clone());
        let run_id = snapshot.run_id.clone();
        info!(run_id = %run_id, subject = %claim.subject, "Run started via control surface");
        self.spawn(snapshot);
        Ok(run_id)
    }

    /// Continue a persisted, unfinished run that is not active in this process.
    pub fn resume_run(&self, claim: &IdentityClaim, run_id: &RunId) -> Result<()> {
        authorize(claim, Role::Operator)?;
        if self.lock().contains_key(run_id) {
            return Err(ConductorError::RunActive(run_id.to_string()));
        }
        let snapshot = self.runner.load_resumable(run_id)?;
        check_tenant(claim, snapshot.options.tenant.as_deref())?;
        info!(run_id = %run_id, subject = %claim.subject, "Run resumed via control surface");
        self.spawn(snapshot);
        Ok(())
    }

    /// Latest persisted state of a run.
    pub fn status(&self, claim: &IdentityClaim, run_id: &RunId) -> Result<RunSnapshot> {
        authorize(claim, Role::Viewer)?;
        let snapshot = self.runner.load(run_id)?;
        check_tenant(claim, snapshot.options.tenant.as_deref())?;
        Ok(snapshot)
    }

    pub fn pause(&self, claim: &IdentityClaim, run_id: &RunId) -> Result<()> {
        self.with_active(claim, run_id, |control| control.pause())
    }

    /// Resume dispatching on a paused run.
    pub fn resume(&self, claim: &IdentityClaim, run_id: &RunId) -> Result<()> {
        self.with_active(claim, run_id, |control| control.resume())
    }

    pub fn cancel(&self, claim: &IdentityClaim, run_id: &RunId) -> Result<()> {
        self.with_active(claim, run_id, |control| control.cancel())
    }

    /// Wait for an active run to finish. A run that is not active is read
    /// from the snapshot store.
    pub async fn wait(&self, claim: &IdentityClaim, run_id: &RunId) -> Result<RunSnapshot> {
        authorize(claim, Role::Viewer)?;
        let handle = {
            let mut runs = self.lock();
            match runs.get(run_id).map(|h| h.tenant.clone()) {
                Some(tenant) => {
                    check_tenant(claim, tenant.as_deref())?;
                    runs.remove(run_id)
                }
                None => None,
            }
        };
        match handle {
            Some(h) => h
                .task
                .await
                .map_err(|e| ConductorError::TaskFailed(e.to_string()))?,
            None => {
                let snapshot = self.runner.load(run_id)?;
                check_tenant(claim, snapshot.options.tenant.as_deref())?;
                Ok(snapshot)
            }
        }
    }

    pub fn active_runs(&self) -> Vec<RunId> {
        let mut runs = self.lock();
        prune_finished(&mut runs);
        let mut ids: Vec<RunId> = runs.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn spawn(&self, snapshot: RunSnapshot) {
        let control = Arc::new(RunControl::new());
        let run_id = snapshot.run_id.clone();
        let tenant = snapshot.options.tenant.clone();
        let runner = self.runner.clone();
        let run_control = control.clone();
        let task = tokio::spawn(async move { runner.execute(snapshot, run_control).await });
        let mut runs = self.lock();
        prune_finished(&mut runs);
        runs.insert(
            run_id,
            RunHandle {
                control,
                tenant,
                task,
            },
        );
    }

    fn with_active(
        &self,
        claim: &IdentityClaim,
        run_id: &RunId,
        f: impl FnOnce(&RunControl),
    ) -> Result<()> {
        authorize(claim, Role::Operator)?;
        {
            let runs = self.lock();
            if let Some(handle) = runs.get(run_id).filter(|h| !h.task.is_finished()) {
                check_tenant(claim, handle.tenant.as_deref())?;
                f(&handle.control);
                return Ok(());
            }
        }

        match self.runner.load(run_id) {
            Ok(snapshot) if snapshot.status.is_finished() => Err(ConductorError::RunFinished {
                run_id: run_id.to_string(),
                status: snapshot.status.to_string(),
            }),
            _ => Err(ConductorError::RunNotFound(run_id.to_string())),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<RunId, RunHandle>> {
        self.runs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Finished runs are already persisted; `wait` reads them from the store.
fn prune_finished(runs: &mut HashMap<RunId, RunHandle>) {
    runs.retain(|_, h| !h.task.is_finished());
}

fn authorize(claim: &IdentityClaim, required: Role) -> Result<()> {
    if claim.has_role(required) {
        Ok(())
    } else {
        Err(unauthorized(claim, &format!("role {}", required)))
    }
}

fn check_tenant(claim: &IdentityClaim, run_tenant: Option<&str>) -> Result<()> {
    match (claim.tenant.as_deref(), run_tenant) {
        (Some(own), Some(run)) if own != run => {
            Err(unauthorized(claim, "access to the run's tenant"))
        }
        (Some(_), None) => Err(unauthorized(claim, "access to untenanted runs")),
        _ => Ok(()),
    }
}

fn unauthorized(claim: &IdentityClaim, required: &str) -> ConductorError {
    ConductorError::Unauthorized {
        subject: claim.subject.clone(),
        required: required.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use futures::future::BoxFuture;

    use conductor_core::types::{OutcomeCode, RunStatus};
    use conductor_core::{EventBus, PolicyConfig};
    use conductor_router::{CapabilityRouter, CredentialSet};

    use crate::executor::NodeExecutor;
    use crate::graph::NodeSpec;
    use crate::handler::{HandlerRegistry, NoopHandler, ToolCall, ToolError, ToolHandler, ToolOutput};
    use crate::store::SnapshotStore;

    struct Slow;

    impl ToolHandler for Slow {
        fn invoke(&self, _call: ToolCall) -> BoxFuture<'_, std::result::Result<ToolOutput, ToolError>> {
            Box::pin(async {
                tokio::time::sleep(Duration::from_secs(30)).await;
                Ok(ToolOutput::default())
            })
        }
    }

    fn surface() -> ControlSurface {
        let policy = PolicyConfig::from_toml(
            r#"
[[capabilities.work]]
tool = "worker"

[[capabilities.slow]]
tool = "slow"

[agents.default]
allow = ["*"]
"#,
        )
        .unwrap();
        let router = Arc::new(CapabilityRouter::new(Arc::new(policy), CredentialSet::new()));
        let mut handlers = HandlerRegistry::new();
        handlers.register("worker", NoopHandler);
        handlers.register("slow", Slow);
        let bus = Arc::new(EventBus::default());
        let executor = Arc::new(NodeExecutor::new(router, handlers, bus.clone()));
        let store = Arc::new(SnapshotStore::in_memory().unwrap());
        ControlSurface::new(Arc::new(GraphRunner::new(executor, bus).with_store(store)))
    }

    fn operator() -> IdentityClaim {
        IdentityClaim::new("ops").with_role(Role::Operator)
    }

    #[tokio::test]
    async fn viewer_cannot_start_runs() {
        let surface = surface();
        let viewer = IdentityClaim::new("eve").with_role(Role::Viewer);
        let graph = GraphSpec::new(vec![NodeSpec::new("a", "work")]);
        let err = surface
            .start(&viewer, graph, RunOptions::default())
            .unwrap_err();
        assert!(matches!(err, ConductorError::Unauthorized { .. }));
        assert_eq!(err.outcome_code(), OutcomeCode::Authorization);
    }

    #[tokio::test]
    async fn start_wait_and_status() {
        let surface = surface();
        let graph = GraphSpec::new(vec![NodeSpec::new("a", "work")]);
        let run_id = surface.start(&operator(), graph, RunOptions::default()).unwrap();
        let snap = surface.wait(&operator(), &run_id).await.unwrap();
        assert_eq!(snap.status, RunStatus::Succeeded);
        assert_eq!(snap.started_by.as_deref(), Some("ops"));

        let viewer = IdentityClaim::new("v").with_role(Role::Viewer);
        let status = surface.status(&viewer, &run_id).unwrap();
        assert_eq!(status.status, RunStatus::Succeeded);

        let anonymous = IdentityClaim::new("nobody");
        assert!(surface.status(&anonymous, &run_id).is_err());

        let err = surface.cancel(&operator(), &run_id).unwrap_err();
        assert!(matches!(err, ConductorError::RunFinished { .. }));
    }

    #[tokio::test]
    async fn operator_can_cancel_active_run() {
        let surface = surface();
        let graph = GraphSpec::new(vec![NodeSpec::new("s", "slow")]);
        let run_id = surface.start(&operator(), graph, RunOptions::default()).unwrap();
        assert_eq!(surface.active_runs(), vec![run_id.clone()]);

        let viewer = IdentityClaim::new("v").with_role(Role::Viewer);
        assert!(surface.cancel(&viewer, &run_id).is_err());

        surface.cancel(&operator(), &run_id).unwrap();
        let snap = tokio::time::timeout(Duration::from_secs(5), surface.wait(&operator(), &run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn tenants_are_isolated() {
        let surface = surface();
        let acme = IdentityClaim::new("a")
            .with_role(Role::Admin)
            .with_tenant("acme");
        let graph = GraphSpec::new(vec![NodeSpec::new("a", "work")]);
        let run_id = surface.start(&acme, graph.clone(), RunOptions::default()).unwrap();
        surface.wait(&acme, &run_id).await.unwrap();

        let globex = IdentityClaim::new("g")
            .with_role(Role::Admin)
            .with_tenant("globex");
        assert!(surface.status(&globex, &run_id).is_err());
        assert!(surface.status(&acme, &run_id).is_ok());

        let wrong = RunOptions::default().with_tenant(Some("globex".into()));
        assert!(surface.start(&acme, graph, wrong).is_err());
    }

    #[tokio::test]
    async fn wait_checks_role_and_tenant() {
        let surface = surface();
        let acme = IdentityClaim::new("a")
            .with_role(Role::Operator)
            .with_tenant("acme");
        let globex = IdentityClaim::new("g")
            .with_role(Role::Admin)
            .with_tenant("globex");
        let graph = GraphSpec::new(vec![NodeSpec::new("s", "slow")]);
        let run_id = surface.start(&acme, graph, RunOptions::default()).unwrap();

        let anonymous = IdentityClaim::new("nobody");
        assert!(matches!(
            surface.wait(&anonymous, &run_id).await,
            Err(ConductorError::Unauthorized { .. })
        ));
        assert!(matches!(
            surface.wait(&globex, &run_id).await,
            Err(ConductorError::Unauthorized { .. })
        ));
        // A refused wait leaves the run controllable.
        assert_eq!(surface.active_runs(), vec![run_id.clone()]);

        surface.cancel(&acme, &run_id).unwrap();
        let snap = tokio::time::timeout(Duration::from_secs(5), surface.wait(&acme, &run_id))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(snap.status, RunStatus::Cancelled);
        assert!(surface.wait(&globex, &run_id).await.is_err());
    }

    #[tokio::test]
    async fn finished_runs_are_pruned() {
        let surface = surface();
        let graph = GraphSpec::new(vec![NodeSpec::new("a", "work")]);
        let run_id = surface.start(&operator(), graph, RunOptions::default()).unwrap();

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while !surface.active_runs().is_empty() {
            assert!(tokio::time::Instant::now() < deadline, "run never finished");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(surface.lock().is_empty());

        // The pruned run is still readable from the store.
        let snap = surface.wait(&operator(), &run_id).await.unwrap();
        assert_eq!(snap.status, RunStatus::Succeeded);
    }

    #[tokio::test]
    async fn unknown_run_is_not_found() {
        let surface = surface();
        let err = surface
            .pause(&operator(), &RunId::from_string("ghost"))
            .unwrap_err();
        assert!(matches!(err, ConductorError::RunNotFound(_)));
    }
}
