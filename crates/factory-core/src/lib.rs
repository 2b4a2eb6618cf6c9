//! factory-core: the orchestration kernel of the SCC factory gateway.
//!
//! A declarative task board is turned into executed work: the scheduler
//! dispatches atomic tasks as jobs to executor CLIs (internal runner or
//! external workers), deterministic gates verify the output, and bounded
//! recovery machinery synthesizes typed fixup tasks when something fails.
//!
//! The kernel consumes its environment through the traits in [`collab`]
//! (Map index, Context Pack renderer, schema validator, executor
//! subprocesses, gate suite); `factory-gates` ships the production gate and
//! executor implementations.

pub mod artifacts;
pub mod attestation;
pub mod board;
pub mod breakers;
pub mod collab;
pub mod config;
pub mod domain;
pub mod events;
pub mod fuses;
pub mod hooks;
pub mod pins;
pub mod pipeline;
pub mod policy;
pub mod preflight;
pub mod queue;
pub mod recovery;
pub mod roles;
pub mod router;
pub mod scheduler;
pub mod scope;
pub mod service;
pub mod snapshot;
pub mod split;
pub mod workers;

pub use artifacts::{compute_verdict, parse_unified_diff, ArtifactStore, VerdictInputs};
pub use board::{Board, TaskPatch};
pub use breakers::{BreakerEngine, RepoHealth, QUARANTINE_FOLLOWUP_MIN_AGE_MINUTES};
pub use collab::{
    AutoPinsRequest, ContextPackRenderer, ExecOutcome, ExecRequest, Executor, GateSuite, MapStore,
    MapVersion, RenderedPack, SchemaValidator,
};
pub use config::RuntimeConfig;
pub use domain::{
    DispatchError, EventType, ExecutorKind, FactoryError, Job, JobStatus, Lane, Pins, Result,
    RunnerKind, StateEvent, Submit, SubmitStatus, Task, TaskKind, TaskStatus, Verdict, Worker,
};
pub use events::EventLog;
pub use fuses::FuseBox;
pub use hooks::HookEngine;
pub use pins::PinsResolver;
pub use pipeline::parse_stdout_artifacts;
pub use policy::{FactoryPolicy, PolicyStore, WipLimits};
pub use preflight::{preflight, PreflightResult, TestAutoFixer};
pub use queue::JobQueue;
pub use recovery::Recovery;
pub use roles::RoleSystem;
pub use router::Router;
pub use service::{Collaborators, FactoryService};
pub use split::{parse_split_output, SplitChildSpec};
pub use workers::{ClaimResponse, CompletePayload, WorkerService};

use tracing::Level;
use tracing_subscriber::EnvFilter;

/// Initialize tracing for the binaries. JSON line output when requested.
pub fn init_tracing(json: bool, level: Level) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(level.to_string()));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        let _ = builder.json().try_init();
    } else {
        let _ = builder.try_init();
    }
}
