//! ngmd — the node group manager daemon.
//!
//! Runs both control loops against one state store:
//! - Strategy reconciler (elastic desired sizes vs. the reserved pool)
//! - Task scheduler (drain task selection, labeling and execution)
//!
//! # Usage
//!
//! ```text
//! ngmd run --config /etc/ngm/ngmd.toml --data-dir /var/lib/ngm
//! ```

mod config;
mod fixture;

use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ngm_cluster::{MemoryCluster, MemoryResourceManager};
use ngm_controller::{StrategyReconciler, TaskScheduler};
use ngm_state::StateStore;

use crate::config::DaemonConfig;
use crate::fixture::FixtureSnapshot;

const DEFAULT_LOG_FILTER: &str = "info,ngmd=debug,ngm_controller=debug,ngm_strategy=debug";

#[derive(Parser)]
#[command(name = "ngmd", about = "Node group manager daemon")]
struct Cli {
    /// Emit logs as JSON lines.
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the reconcile and task loops until interrupted.
    Run {
        /// Path to ngmd.toml. Defaults apply when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Data directory for the state store; overrides the config file.
        #[arg(long)]
        data_dir: Option<PathBuf>,
    },
}

fn init_tracing(json: bool) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_json);

    match cli.command {
        Command::Run { config, data_dir } => run(config, data_dir).await,
    }
}

async fn run(config_path: Option<PathBuf>, data_dir: Option<PathBuf>) -> anyhow::Result<()> {
    let mut config = match &config_path {
        Some(path) => {
            let mut config = DaemonConfig::from_file(path)?;
            config.resolve_paths(path);
            info!(path = ?path, "configuration loaded");
            config
        }
        None => DaemonConfig::default(),
    };
    if let Some(dir) = data_dir {
        config.data_dir = dir;
    }

    info!("node group manager starting");

    // ── State store ────────────────────────────────────────────

    std::fs::create_dir_all(&config.data_dir)?;
    let db_path = config.data_dir.join("ngm.redb");
    let store = Arc::new(StateStore::open(&db_path)?);
    info!(path = ?db_path, "state store opened");

    // ── Collaborators ──────────────────────────────────────────

    let cluster = Arc::new(MemoryCluster::new(config.labels.clone()));
    let broker = Arc::new(MemoryResourceManager::new());
    match &config.fixture {
        Some(path) => {
            FixtureSnapshot::from_file(path)?
                .load(store.as_ref(), &cluster, &broker)
                .await?;
        }
        None => warn!("no fixture configured, cluster and broker start empty"),
    }

    // ── Control loops ──────────────────────────────────────────

    let reconciler = Arc::new(
        StrategyReconciler::builder()
            .storage(store.clone())
            .resource_manager(broker.clone())
            .cluster(cluster.clone())
            .task_lookahead(config.strategy.task_lookahead())
            .config(config.controller.clone())
            .build()?,
    );
    info!(
        interval_secs = config.controller.interval_secs,
        "strategy reconciler initialized"
    );

    let scheduler = Arc::new(
        TaskScheduler::builder()
            .storage(store.clone())
            .resource_manager(broker.clone())
            .cluster(cluster.clone())
            .labels(config.labels.clone())
            .config(config.task.clone())
            .build()?,
    );
    info!(
        interval_secs = config.task.interval_secs,
        concurrency = config.task.concurrency,
        "task scheduler initialized"
    );

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let reconcile_handle = tokio::spawn(reconciler.run(shutdown_rx.clone()));
    let task_handle = tokio::spawn(scheduler.run(shutdown_rx));

    tokio::signal::ctrl_c().await?;
    info!("shutdown signal received");
    let _ = shutdown_tx.send(true);

    // Ticks in progress finish before the loops return.
    let _ = reconcile_handle.await;
    let _ = task_handle.await;

    info!("node group manager stopped");
    Ok(())
}
