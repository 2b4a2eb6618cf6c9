//! factoryd - the long-running factory gateway daemon.
//!
//! Owns the scheduler loop: every tick it reaps expired worker leases,
//! releases cooldowns, runs the next eligible internal job, and fires the
//! stability/learning hooks. Dispatch of `ready` tasks happens on the same
//! cadence.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, Level};

use factory_core::domain::{TaskKind, TaskStatus};
use factory_core::{Collaborators, FactoryService, RuntimeConfig};
use factory_gates::{
    GateConfig, LocalMapStore, LocalPackRenderer, ProcessExecutor, ProcessGateSuite,
    SchemaVersionValidator,
};

#[derive(Parser)]
#[command(name = "factoryd")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SCC factory gateway daemon", long_about = None)]
struct Cli {
    /// Repo root holding board/jobs/artifacts state
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Scheduler tick interval in milliseconds
    #[arg(long, default_value_t = 1_000)]
    tick_ms: u64,

    /// Auto-dispatch ready atomic tasks each tick
    #[arg(long, default_value_t = true)]
    auto_dispatch: bool,

    /// Emit JSON-formatted log lines
    #[arg(long)]
    json: bool,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn build_service(root: &PathBuf) -> Result<FactoryService> {
    let config = RuntimeConfig::from_env();
    let collab = Collaborators {
        map: Arc::new(LocalMapStore::new(root.clone())),
        renderer: Arc::new(LocalPackRenderer),
        validator: Arc::new(SchemaVersionValidator),
        executor: Arc::new(ProcessExecutor::new(root.clone())),
        gates: Arc::new(ProcessGateSuite::new(
            root.clone(),
            GateConfig::from(&config),
        )),
    };
    FactoryService::open(root.clone(), config, collab).context("open factory service")
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    factory_core::init_tracing(cli.json, level);

    let root = cli
        .root
        .canonicalize()
        .context("resolve repo root")?;
    let service = build_service(&root)?;
    info!(root = %root.display(), tick_ms = cli.tick_ms, "factoryd started");

    let mut interval = tokio::time::interval(std::time::Duration::from_millis(cli.tick_ms));
    loop {
        interval.tick().await;

        if let Err(e) = service.tick().await {
            error!(error = %e, "scheduler tick failed");
        }

        if cli.auto_dispatch {
            for task in service.list_tasks() {
                if task.kind == TaskKind::Atomic && task.status == TaskStatus::Ready {
                    if let Err(e) = service.dispatch_task(&task.id).await {
                        // Typed rejections are normal flow; they are already
                        // recorded as state events.
                        tracing::debug!(task_id = %task.id, error = %e, "dispatch rejected");
                    }
                }
            }
        }
    }
}
