use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use conductor_core::types::{ExecutionMode, RunId};
use conductor_core::{AppConfig, ConductorError, EventBus, PolicyConfig};
use conductor_router::{CapabilityRouter, CredentialSet};
use conductor_runner::{
    DelegateLimits, GraphRunner, GraphSpec, HandlerRegistry, NodeExecutor, NoopHandler,
    ResultCard, RunControl, RunLogger, RunOptions, RunSnapshot, SnapshotStore,
};

#[derive(Parser)]
#[command(name = "conductor", version, about = "Policy-routed DAG runner")]
struct Cli {
    /// Path to config file
    #[arg(short, long, default_value = "conductor.toml", global = true)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a graph to completion
    Run {
        /// Graph file (TOML or JSON)
        #[arg(long)]
        graph: PathBuf,
        /// Policy file; overrides the config's `policy`
        #[arg(long)]
        policy: Option<PathBuf>,
        /// Maximum number of nodes executing at once
        #[arg(long)]
        concurrency: Option<usize>,
        /// deterministic, delegated or hybrid
        #[arg(long)]
        mode: Option<ExecutionMode>,
        /// Agent identity nodes route as
        #[arg(long)]
        agent: Option<String>,
        #[arg(long)]
        tenant: Option<String>,
        /// Route and record decisions without charging real money
        #[arg(long)]
        test_mode: bool,
    },
    /// Continue an interrupted run from its last snapshot
    Resume {
        run_id: String,
        #[arg(long)]
        policy: Option<PathBuf>,
    },
    /// Print the latest snapshot of a run
    Status { run_id: String },
    /// List recent runs
    Runs {
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Validate a policy file
    Check { policy: PathBuf },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("conductor=info,warn")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    let code = match dispatch(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            eprintln!("Error: {:#}", e);
            e.downcast_ref::<ConductorError>()
                .map(|c| c.outcome_code().exit_code())
                .unwrap_or(1)
        }
    };
    std::process::exit(code);
}

async fn dispatch(cli: Cli) -> anyhow::Result<i32> {
    if let Commands::Check { policy } = &cli.command {
        return check_policy(policy);
    }

    let config = if cli.config.exists() {
        AppConfig::load(&cli.config)?
    } else {
        info!(path = %cli.config.display(), "Config file not found, using defaults");
        AppConfig::default()
    };

    match cli.command {
        Commands::Run {
            graph,
            policy,
            concurrency,
            mode,
            agent,
            tenant,
            test_mode,
        } => {
            let graph = GraphSpec::load(&graph)?;
            let mut options = RunOptions::from_config(&config)
                .with_tenant(tenant)
                .with_test_mode(test_mode);
            if let Some(n) = concurrency {
                options.concurrency = n.max(1);
            }
            if let Some(m) = mode {
                options.mode = m;
            }
            if let Some(a) = agent {
                options = options.with_agent(a);
            }

            let runner = build_runner(&config, policy.as_deref())?;
            let snapshot = runner.prepare(graph, options)?;
            drive(&config, &runner, snapshot).await
        }
        Commands::Resume { run_id, policy } => {
            let runner = build_runner(&config, policy.as_deref())?;
            let snapshot = runner.load_resumable(&RunId::from_string(&run_id))?;
            drive(&config, &runner, snapshot).await
        }
        Commands::Status { run_id } => {
            let store = SnapshotStore::open(&config.snapshot_db_path())?;
            let snapshot = store
                .load(&RunId::from_string(&run_id))?
                .ok_or_else(|| ConductorError::RunNotFound(run_id.clone()))?;
            let card = ResultCard::from_snapshot(&snapshot);
            println!("{}", serde_json::to_string_pretty(&card)?);
            for node in snapshot.nodes.values() {
                println!(
                    "  {:<24} {:<16} attempts={}",
                    node.id, node.status, node.attempts
                );
            }
            Ok(0)
        }
        Commands::Runs { limit } => {
            let store = SnapshotStore::open(&config.snapshot_db_path())?;
            let records = store.list(limit)?;
            if records.is_empty() {
                println!("No runs recorded.");
            }
            for r in records {
                println!(
                    "{}  {:<10} {}",
                    r.run_id,
                    r.status,
                    r.updated_at.format("%Y-%m-%d %H:%M:%S")
                );
            }
            Ok(0)
        }
        Commands::Check { .. } => Ok(0),
    }
}

fn check_policy(path: &Path) -> anyhow::Result<i32> {
    let policy = PolicyConfig::load(path)?;
    let candidates: usize = policy.capabilities.values().map(|c| c.len()).sum();
    println!(
        "Policy OK: {} capabilities, {} candidates, {} agents",
        policy.capabilities.len(),
        candidates,
        policy.agents.len()
    );
    let credentials = CredentialSet::from_env(&policy);
    for name in policy.credential_names() {
        if !credentials.contains(&name) {
            println!("  credential {} is not set in the environment", name);
        }
    }
    Ok(0)
}

fn build_runner(config: &AppConfig, policy_override: Option<&Path>) -> anyhow::Result<GraphRunner> {
    let policy_path = match (policy_override, config.policy.as_deref()) {
        (Some(p), _) => p.to_path_buf(),
        (None, Some(p)) => PathBuf::from(p),
        (None, None) => {
            return Err(ConductorError::Config(
                "no policy file given (use --policy or set `policy` in the config)".into(),
            )
            .into())
        }
    };
    let policy = Arc::new(PolicyConfig::load(&policy_path)?);
    info!(
        path = %policy_path.display(),
        capabilities = policy.capabilities.len(),
        "Policy loaded"
    );

    let router = Arc::new(CapabilityRouter::from_env(policy));
    let mut handlers = HandlerRegistry::new();
    handlers.set_fallback(NoopHandler);

    let event_bus = Arc::new(EventBus::default());
    let executor = Arc::new(
        NodeExecutor::new(router, handlers, event_bus.clone())
            .with_limits(DelegateLimits::from_config(&config.delegate)),
    );

    std::fs::create_dir_all(config.state_dir())?;
    let store = Arc::new(SnapshotStore::open(&config.snapshot_db_path())?);
    Ok(GraphRunner::from_config(config, executor, event_bus).with_store(store))
}

/// Execute a snapshot with logging and Ctrl-C cancellation, then write the
/// result card. Returns the process exit code.
async fn drive(config: &AppConfig, runner: &GraphRunner, snapshot: RunSnapshot) -> anyhow::Result<i32> {
    let run_id = snapshot.run_id.clone();
    let shutdown = CancellationToken::new();

    let logger = config
        .log
        .as_ref()
        .filter(|l| l.enabled)
        .map(|l| {
            RunLogger::new(config.log_dir(), l.level).start(
                runner.event_bus(),
                run_id.clone(),
                shutdown.clone(),
            )
        });

    let control = Arc::new(RunControl::new());
    let ctrl_c = control.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, cancelling run");
            ctrl_c.cancel();
        }
    });

    println!("Run {}", run_id);
    let result = runner.execute(snapshot, control).await;

    // The logger stops on its own after the final event; cancel it if it lags.
    if let Some(handle) = logger {
        if tokio::time::timeout(Duration::from_secs(2), handle).await.is_err() {
            shutdown.cancel();
        }
    }

    let finished = result?;
    let card = ResultCard::from_snapshot(&finished);
    match card.write(&config.runs_dir()) {
        Ok(path) => info!(path = %path.display(), "Result card written"),
        Err(e) => warn!(error = %e, "Failed to write result card"),
    }

    println!(
        "{}: {} ({}/{} nodes succeeded, {} tool calls, ${:.4})",
        card.run_id, card.status, card.succeeded, card.nodes, card.total_calls, card.spend_usd
    );
    for failure in &card.failures {
        println!("  {} [{}] {}", failure.node_id, failure.status, failure.message);
    }
    Ok(card.exit_code)
}
