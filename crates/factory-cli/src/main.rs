//! SCC Factory - local orchestration gateway CLI
//!
//! The `factory` command drives the gateway without the daemon:
//!
//! ## Commands
//!
//! - `init`: scaffold the state layout and a default policy
//! - `task`: board CRUD, status transitions, dispatch
//! - `job`: queue inspection, cancel/requeue
//! - `worker`: registry inspection and a one-shot local worker
//! - `chain`: verify the hash-chained logs
//! - `factory`: policy/WIP/degradation introspection
//! - `tick`: run scheduler ticks manually

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tracing::Level;

use factory_core::board::TaskPatch;
use factory_core::domain::{ExecutorKind, Lane, RunnerKind, Task, TaskStatus};
use factory_core::{Collaborators, FactoryService, RuntimeConfig};
use factory_gates::{
    GateConfig, LocalMapStore, LocalPackRenderer, ProcessExecutor, ProcessGateSuite,
    SchemaVersionValidator,
};

#[derive(Parser)]
#[command(name = "factory")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "SCC factory gateway CLI", long_about = None)]
struct Cli {
    /// Repo root holding board/jobs/artifacts state
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the state layout and a default factory policy
    Init,

    /// Board operations
    #[command(subcommand)]
    Task(TaskCommands),

    /// Job queue operations
    #[command(subcommand)]
    Job(JobCommands),

    /// Worker registry operations
    #[command(subcommand)]
    Worker(WorkerCommands),

    /// Hash-chain verification over the critical logs
    #[command(subcommand)]
    Chain(ChainCommands),

    /// Policy and scheduler introspection
    #[command(subcommand)]
    Factory(FactoryCommands),

    /// Run scheduler ticks
    Tick {
        /// Number of ticks to run
        #[arg(default_value_t = 1)]
        count: u32,
    },
}

#[derive(Subcommand)]
enum TaskCommands {
    /// Create an atomic task
    Create {
        #[arg(long)]
        title: String,
        #[arg(long, default_value = "engineer")]
        role: String,
        #[arg(long, default_value = "")]
        goal: String,
        /// Repo-relative files, repeatable
        #[arg(long)]
        file: Vec<String>,
        /// Allowed test commands, repeatable
        #[arg(long)]
        test: Vec<String>,
        #[arg(long, default_value = "mainlane")]
        lane: String,
        /// Dispatch through an external worker instead of the internal runner
        #[arg(long)]
        external: bool,
    },
    /// List tasks
    List,
    /// Show one task as JSON
    Show { id: String },
    /// Transition a task's status
    Status { id: String, status: String },
    /// Patch task fields from a JSON object
    Update { id: String, patch: String },
    /// Dispatch an atomic task
    Dispatch { id: String },
    /// Start a designer split run for a parent task
    Split { id: String },
    /// Apply a finished split result into child tasks
    SplitApply { id: String },
}

#[derive(Subcommand)]
enum JobCommands {
    /// List jobs
    List,
    /// Show one job as JSON
    Show { id: String },
    /// Cancel an open job
    Cancel { id: String },
    /// Requeue a job
    Requeue { id: String },
}

#[derive(Subcommand)]
enum WorkerCommands {
    /// List registered workers
    List,
    /// Claim one job, run it through the local executor CLI, and complete
    /// it with an honest attestation
    RunOnce {
        #[arg(long, default_value = "worker-local")]
        name: String,
        #[arg(long, default_value = "codex")]
        executor: String,
        /// Long-poll wait in milliseconds
        #[arg(long, default_value_t = 2_000)]
        wait_ms: u64,
    },
}

#[derive(Subcommand)]
enum ChainCommands {
    /// Verify state_events.jsonl, per-task event logs, and the DLQ chain
    Verify,
}

#[derive(Subcommand)]
enum FactoryCommands {
    /// Effective policy document
    Policy,
    /// Effective WIP limits (degradation applied)
    Wip,
    /// Current degradation signals and action
    Degradation,
    /// Breaker/quarantine/repo-health state
    Health,
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

fn parse_status(status: &str) -> Result<TaskStatus> {
    serde_json::from_value(serde_json::Value::String(status.to_string()))
        .with_context(|| format!("unknown status {status}"))
}

fn parse_lane(lane: &str) -> Result<Lane> {
    serde_json::from_value(serde_json::Value::String(lane.to_string()))
        .with_context(|| format!("unknown lane {lane}"))
}

fn parse_executor(executor: &str) -> Result<ExecutorKind> {
    serde_json::from_value(serde_json::Value::String(executor.to_string()))
        .with_context(|| format!("unknown executor {executor}"))
}

fn print_json<T: serde::Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

const DEFAULT_POLICY: &str = r#"{
  "schema_version": "scc.factory_policy.v1",
  "wip_limits": { "total": 12, "exec": 4, "batch": 1 },
  "event_routing": {
    "PINS_INSUFFICIENT": "fastlane",
    "CI_FAILED": "fastlane",
    "EXECUTOR_ERROR": "mainlane",
    "POLICY_VIOLATION": "quarantine",
    "PREFLIGHT_FAILED": "fastlane",
    "RETRY_EXHAUSTED": "dlq",
    "SUCCESS": "mainlane"
  },
  "degradation_matrix": [
    {
      "when": { "queue_overload": true, "repo_unhealthy": true },
      "do": {
        "mode": "stop_the_bleeding",
        "allow_task_classes": ["ci_fixup_v1", "pins_fixup_v1", "schema_fixup_v1"]
      }
    },
    {
      "when": { "queue_overload": true },
      "do": { "reduce_WIP_EXEC_MAX_to": 2, "prefer_lane": "fastlane" }
    },
    {
      "when": { "repo_unhealthy": true },
      "do": { "verification_tier": "regression" }
    }
  ],
  "circuit_breakers": [
    {
      "name": "ci_break",
      "match": { "event_type": "CI_FAILED" },
      "trip": { "consecutive_failures": 3 },
      "action": { "lane": "quarantine" }
    }
  ],
  "budgets": {
    "max_children": 12,
    "max_depth": 2,
    "max_total_tokens_budget": 200000,
    "max_total_verify_minutes": 60,
    "max_total_attempts": 3
  },
  "verification_tiers": {
    "smoke": ["pytest -q"],
    "regression": ["pytest -q", "python -m pytest -q"]
  }
}
"#;

const DEFAULT_ROLES: &str = r#"{
  "schema_version": "scc.roles.v1",
  "roles": {
    "engineer": {
      "read": { "allow": [], "deny": [] },
      "write": { "allow": ["src/**", "tests/**", "docs/**"], "deny": [] }
    },
    "integrator": {
      "read": {},
      "write": { "allow": ["src/**", "tests/**", "contracts/**"] }
    },
    "qa": { "read": {}, "write": { "allow": ["tests/**"] } },
    "doc": { "read": {}, "write": { "allow": ["docs/**"] } },
    "designer": { "read": {}, "write": { "allow": ["docs/**"] } },
    "architect": { "read": {}, "write": { "allow": ["docs/**"] } },
    "pinser": { "read": {}, "write": {} },
    "ssot_curator": { "read": {}, "write": {} },
    "doc_adr_scribe": { "read": {}, "write": { "allow": ["docs/**"] } },
    "status_review": { "read": {}, "write": {} },
    "auditor": { "read": {}, "write": {} }
  }
}
"#;

fn cmd_init(root: &PathBuf) -> Result<()> {
    for dir in [
        "artifacts",
        "artifacts/dlq",
        "artifacts/executor_logs",
        "artifacts/scc_runs",
        "roles",
        "skills",
        "map",
        "eval",
        "oc-scc-local/config",
        "oc-scc-local/prompts",
    ] {
        std::fs::create_dir_all(root.join(dir))?;
    }

    let policy = root.join("factory_policy.json");
    if !policy.exists() {
        std::fs::write(&policy, DEFAULT_POLICY)?;
    }
    let roles = root.join("roles/registry.json");
    if !roles.exists() {
        std::fs::write(&roles, DEFAULT_ROLES)?;
    }
    let skills = root.join("skills/registry.json");
    if !skills.exists() {
        std::fs::write(&skills, "{ \"schema_version\": \"scc.skills.v1\", \"skills\": [] }\n")?;
    }
    let runtime_env = root.join("oc-scc-local/config/runtime.env");
    if !runtime_env.exists() {
        std::fs::write(&runtime_env, "# factory runtime overrides\n")?;
    }

    println!("initialized factory state under {}", root.display());
    Ok(())
}

async fn cmd_worker_run_once(
    service: &FactoryService,
    name: &str,
    executor: ExecutorKind,
    wait_ms: u64,
) -> Result<()> {
    let worker = service.register_worker(name, vec![executor], vec![])?;
    let Some(claim) = service.worker_claim(&worker.id, executor, wait_ms).await? else {
        println!("no eligible job");
        return Ok(());
    };
    println!("claimed job {}", claim.id);

    // Run the prompt through the local executor CLI.
    let outcome = service
        .collab
        .executor
        .run(&factory_core::ExecRequest {
            executor,
            model: claim.model.clone(),
            prompt: claim.prompt.clone(),
            timeout_ms: claim.timeout_ms,
        })
        .await;

    let pack = claim
        .context_pack_v1
        .as_ref()
        .map(|p| p.pack_id.clone())
        .unwrap_or_default();
    let attestation = factory_core::attestation::compute_payload(
        &service.paths,
        &pack,
        &claim.attestation.nonce,
    )
    .context("compute attestation payload")?;

    let job = service
        .worker_complete(
            &claim.id,
            &factory_core::CompletePayload {
                worker_id: worker.id,
                stdout: outcome.stdout,
                stderr: outcome.stderr,
                exit_code: outcome.exit_code.unwrap_or(-1),
                attestation,
            },
        )
        .await?;
    println!("job {} settled as {:?}", job.id, job.status);
    Ok(())
}

fn cmd_chain_verify(service: &FactoryService) -> Result<()> {
    let mut checked = 0usize;
    for path in [
        service.paths.state_events_file(),
        service.paths.dlq_file(),
    ] {
        if !path.exists() {
            continue;
        }
        let report = factory_state::verify_chain(&path)
            .with_context(|| format!("chain broken in {}", path.display()))?;
        println!(
            "{}: {} records, {} restarts - OK",
            path.display(),
            report.records,
            report.restarts
        );
        checked += 1;
    }
    for task in service.list_tasks() {
        let path = service.paths.task_events_file(&task.id);
        if !path.exists() {
            continue;
        }
        let report = factory_state::verify_chain(&path)
            .with_context(|| format!("chain broken in {}", path.display()))?;
        println!(
            "{}: {} records, {} restarts - OK",
            path.display(),
            report.records,
            report.restarts
        );
        checked += 1;
    }
    if checked == 0 {
        println!("no chained logs yet");
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    factory_core::init_tracing(cli.json, level);

    if let Commands::Init = cli.command {
        std::fs::create_dir_all(&cli.root)?;
        let root = cli.root.canonicalize()?;
        return cmd_init(&root);
    }

    let root = cli.root.canonicalize().context("resolve repo root")?;
    let service = build_service(&root)?;

    match cli.command {
        Commands::Init => unreachable!("handled above"),

        Commands::Task(command) => match command {
            TaskCommands::Create {
                title,
                role,
                goal,
                file,
                test,
                lane,
                external,
            } => {
                let mut task = Task::new_atomic(title, role);
                task.goal = goal;
                task.files = file;
                task.allowed_tests = test;
                task.lane = parse_lane(&lane)?;
                task.runner = if external {
                    RunnerKind::External
                } else {
                    RunnerKind::Internal
                };
                task.status = TaskStatus::Ready;
                let created = service.create_task(task)?;
                print_json(&created)?;
            }
            TaskCommands::List => {
                for task in service.list_tasks() {
                    println!(
                        "{}  {:<12} {:<10} {:<9} {}",
                        task.id,
                        format!("{:?}", task.status).to_lowercase(),
                        task.role,
                        task.lane.as_str(),
                        task.title
                    );
                }
            }
            TaskCommands::Show { id } => print_json(&service.get_task(&id)?)?,
            TaskCommands::Status { id, status } => {
                let task = service.board.set_status(&id, parse_status(&status)?)?;
                print_json(&task)?;
            }
            TaskCommands::Update { id, patch } => {
                let patch: TaskPatch =
                    serde_json::from_str(&patch).context("parse task patch JSON")?;
                print_json(&service.board.update_task(&id, patch)?)?;
            }
            TaskCommands::Dispatch { id } => {
                let job = service.dispatch_task(&id).await?;
                print_json(&job)?;
            }
            TaskCommands::Split { id } => {
                let job = service.start_split(&id).await?;
                print_json(&job)?;
            }
            TaskCommands::SplitApply { id } => {
                let children = service.apply_split(&id).await?;
                print_json(&children)?;
            }
        },

        Commands::Job(command) => match command {
            JobCommands::List => {
                for job in service.list_jobs() {
                    println!(
                        "{}  {:<8} {:<12} {:<9} task={}",
                        job.id,
                        format!("{:?}", job.status).to_lowercase(),
                        job.executor.as_str(),
                        format!("{:?}", job.runner).to_lowercase(),
                        job.task_id.as_deref().unwrap_or("-")
                    );
                }
            }
            JobCommands::Show { id } => print_json(&service.queue.get(&id)?)?,
            JobCommands::Cancel { id } => print_json(&service.cancel_job(&id)?)?,
            JobCommands::Requeue { id } => print_json(&service.requeue_job(&id)?)?,
        },

        Commands::Worker(command) => match command {
            WorkerCommands::List => {
                for worker in service.workers.list() {
                    println!(
                        "{}  {:<16} executors={:?} running={}",
                        worker.id,
                        worker.name,
                        worker
                            .executors
                            .iter()
                            .map(|e| e.as_str())
                            .collect::<Vec<_>>(),
                        worker.running_job_id.as_deref().unwrap_or("-")
                    );
                }
            }
            WorkerCommands::RunOnce {
                name,
                executor,
                wait_ms,
            } => {
                cmd_worker_run_once(&service, &name, parse_executor(&executor)?, wait_ms).await?;
            }
        },

        Commands::Chain(ChainCommands::Verify) => cmd_chain_verify(&service)?,

        Commands::Factory(command) => match command {
            FactoryCommands::Policy => print_json(&service.policy.current())?,
            FactoryCommands::Wip => {
                let policy = service.policy.current();
                let action = policy.compute_degradation_action(&service.degradation_signals());
                let limits =
                    policy.apply_degradation_to_wip_limits(policy.wip_limits(), action.as_ref());
                print_json(&limits)?;
            }
            FactoryCommands::Degradation => {
                let signals = service.degradation_signals();
                let action = service.policy.current().compute_degradation_action(&signals);
                print_json(&serde_json::json!({ "signals": signals, "action": action }))?;
            }
            FactoryCommands::Health => {
                let now = chrono::Utc::now();
                print_json(&serde_json::json!({
                    "breakers": service.breakers.snapshot(),
                    "quarantine": service.breakers.quarantine_active(now),
                    "repo_unhealthy": service.repo_health.is_unhealthy(now),
                }))?;
            }
        },

        Commands::Tick { count } => {
            if count == 0 {
                bail!("tick count must be positive");
            }
            for _ in 0..count {
                service.tick().await?;
            }
            println!("ran {count} tick(s)");
        }
    }

    Ok(())
}
