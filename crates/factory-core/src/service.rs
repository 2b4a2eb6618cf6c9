//! The orchestration facade: one struct owning every component pointer.
//!
//! `FactoryService` is what a wire layer (HTTP, CLI) calls into. The
//! dispatch contract lives in `scheduler`, the per-job execution flow in
//! `pipeline`; both are `impl FactoryService` blocks.

use std::sync::Arc;

use crate::artifacts::ArtifactStore;
use crate::board::Board;
use crate::breakers::{BreakerEngine, RepoHealth};
use crate::collab::{ContextPackRenderer, Executor, GateSuite, MapStore, SchemaValidator};
use crate::config::RuntimeConfig;
use crate::domain::{ExecutorKind, Job, Result, Task, Worker};
use crate::events::EventLog;
use crate::fuses::FuseBox;
use crate::hooks::HookEngine;
use crate::pins::PinsResolver;
use crate::policy::PolicyStore;
use crate::preflight::TestAutoFixer;
use crate::queue::JobQueue;
use crate::recovery::Recovery;
use crate::roles::RoleSystem;
use crate::router::Router;
use crate::workers::{ClaimResponse, CompletePayload, WorkerService};

use factory_state::FactoryPaths;

/// External collaborator handles, injected at construction.
pub struct Collaborators {
    pub map: Arc<dyn MapStore>,
    pub renderer: Arc<dyn ContextPackRenderer>,
    pub validator: Arc<dyn SchemaValidator>,
    pub executor: Arc<dyn Executor>,
    pub gates: Arc<dyn GateSuite>,
}

pub struct FactoryService {
    pub config: RuntimeConfig,
    pub paths: FactoryPaths,
    pub policy: Arc<PolicyStore>,
    pub roles: Arc<RoleSystem>,
    pub board: Arc<Board>,
    pub queue: Arc<JobQueue>,
    pub workers: Arc<WorkerService>,
    pub pins: Arc<PinsResolver>,
    pub fixer: Arc<TestAutoFixer>,
    pub artifacts: Arc<ArtifactStore>,
    pub recovery: Arc<Recovery>,
    pub breakers: Arc<BreakerEngine>,
    pub repo_health: Arc<RepoHealth>,
    pub fuses: Arc<FuseBox>,
    pub router: Arc<Router>,
    pub hooks: Arc<HookEngine>,
    pub events: Arc<EventLog>,
    pub collab: Collaborators,
}

impl FactoryService {
    /// Wire the full service over a repo root. Role registries, policy, and
    /// prior state are loaded from disk; missing files yield safe defaults.
    pub fn open(
        repo_root: impl Into<std::path::PathBuf>,
        config: RuntimeConfig,
        collab: Collaborators,
    ) -> Result<Self> {
        let paths = FactoryPaths::new(repo_root);

        let policy = Arc::new(PolicyStore::new(paths.factory_policy_file()));
        let roles = Arc::new(
            RoleSystem::load(
                &paths.roles_registry_file(),
                &paths.role_skill_matrix_file(),
                &paths.skills_registry_file(),
            )
            .map_err(crate::domain::FactoryError::InvalidTask)?,
        );

        let board = Arc::new(
            Board::load(paths.clone(), roles.clone(), policy.clone())?
                .with_stall_minutes(config.ledger_stall_minutes),
        );
        let queue = Arc::new(JobQueue::load(paths.clone())?);
        let workers = Arc::new(WorkerService::load(paths.clone())?);
        let pins = Arc::new(PinsResolver::new(
            paths.root().join("pins_templates.json"),
            paths.map_version_file(),
        ));
        let fixer = Arc::new(TestAutoFixer::new(paths.eval_manifest_file()));
        let artifacts = Arc::new(ArtifactStore::new(paths.clone()));
        let recovery = Arc::new(Recovery::new(paths.clone()));
        let breakers = Arc::new(BreakerEngine::load(
            paths.clone(),
            config.circuit_breakers_enabled,
        ));
        let repo_health = Arc::new(RepoHealth::load(paths.clone()));
        let fuses = Arc::new(FuseBox::load(paths.clone()));
        let router = Arc::new(Router::load(paths.clone()));
        let hooks = Arc::new(HookEngine::load(
            paths.clone(),
            policy.current().hooks(),
        ));
        let events = Arc::new(EventLog::new(paths.clone()));

        Ok(Self {
            config,
            paths,
            policy,
            roles,
            board,
            queue,
            workers,
            pins,
            fixer,
            artifacts,
            recovery,
            breakers,
            repo_health,
            fuses,
            router,
            hooks,
            events,
            collab,
        })
    }

    // ---- board passthroughs -------------------------------------------

    pub fn create_task(&self, task: Task) -> Result<Task> {
        self.board.create_task(task)
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.board.get_task(id)
    }

    pub fn list_tasks(&self) -> Vec<Task> {
        self.board.list()
    }

    pub fn list_jobs(&self) -> Vec<Job> {
        self.queue.list()
    }

    // ---- worker API ----------------------------------------------------

    pub fn register_worker(
        &self,
        name: &str,
        executors: Vec<ExecutorKind>,
        models: Vec<String>,
    ) -> Result<Worker> {
        self.workers.register(name, executors, models)
    }

    pub fn worker_heartbeat(
        &self,
        worker_id: &str,
        running_job_id: Option<&str>,
    ) -> Result<Worker> {
        self.workers
            .heartbeat(worker_id, running_job_id, &self.queue, &self.config)
    }

    pub async fn worker_claim(
        &self,
        worker_id: &str,
        executor: ExecutorKind,
        wait_ms: u64,
    ) -> Result<Option<ClaimResponse>> {
        self.workers
            .claim(worker_id, executor, wait_ms, &self.queue, &self.config)
            .await
    }

    /// Worker Complete: verify identity + attestation, then run the full
    /// execution pipeline synchronously.
    pub async fn worker_complete(&self, job_id: &str, payload: &CompletePayload) -> Result<Job> {
        let job = self.workers.accept_completion(
            job_id,
            payload,
            &self.queue,
            &self.config,
            chrono::Utc::now(),
        )?;
        self.finish_job(job).await
    }

    // ---- manual job controls ------------------------------------------

    pub fn cancel_job(&self, job_id: &str) -> Result<Job> {
        let job = self.queue.cancel(job_id, crate::domain::reason::TIMEOUT)?;
        let mut event =
            crate::domain::StateEvent::new(crate::domain::EventType::JobCancelled)
                .with_job(job_id.to_string());
        event.task_id = job.task_id.clone();
        self.events.emit(&event)?;
        Ok(job)
    }

    pub fn requeue_job(&self, job_id: &str) -> Result<Job> {
        let job = self.queue.requeue(job_id)?;
        let mut event =
            crate::domain::StateEvent::new(crate::domain::EventType::JobRequeued)
                .with_job(job_id.to_string());
        event.task_id = job.task_id.clone();
        self.events.emit(&event)?;
        Ok(job)
    }
}

#[cfg(test)]
pub(crate) mod testkit {
    //! Shared service construction over fakes for the crate's tests.

    use super::*;
    use crate::collab::fakes::{
        FakeExecutor, FakeGateSuite, FakeMapStore, FakeRenderer, FakeValidator,
    };

    pub struct TestHarness {
        pub service: FactoryService,
        pub dir: tempfile::TempDir,
    }

    pub fn default_roles_json() -> serde_json::Value {
        serde_json::json!({
            "schema_version": "scc.roles.v1",
            "roles": {
                "engineer": {
                    "read": { "allow": [], "deny": [] },
                    "write": { "allow": ["src/**", "tests/**", "docs/**"], "deny": [] }
                },
                "designer": { "read": {}, "write": { "allow": ["docs/**"] } },
                "pinser": { "read": {}, "write": {} },
                "doc": { "read": {}, "write": { "allow": ["docs/**"] } },
                "architect": { "read": {}, "write": { "allow": ["docs/**"] } },
                "ssot_curator": { "read": {}, "write": {} },
                "doc_adr_scribe": { "read": {}, "write": { "allow": ["docs/**"] } },
                "status_review": { "read": {}, "write": {} }
            }
        })
    }

    pub fn harness_with(
        executor: FakeExecutor,
        gates: FakeGateSuite,
        map_pins: Option<crate::domain::Pins>,
    ) -> TestHarness {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path();

        std::fs::create_dir_all(root.join("roles")).expect("mkdir");
        std::fs::write(
            root.join("roles/registry.json"),
            serde_json::to_vec_pretty(&default_roles_json()).expect("json"),
        )
        .expect("write roles");

        let collab = Collaborators {
            map: Arc::new(FakeMapStore {
                pins: map_pins,
                entry_points: vec![],
            }),
            renderer: Arc::new(FakeRenderer::default()),
            validator: Arc::new(FakeValidator::default()),
            executor: Arc::new(executor),
            gates: Arc::new(gates),
        };

        let mut config = RuntimeConfig::default();
        config.prefer_free_models = false;
        let service = FactoryService::open(root, config, collab).expect("service");
        TestHarness { service, dir }
    }

    /// A ready atomic engineer task whose files exist on disk.
    pub fn seeded_engineer_task(harness: &TestHarness) -> crate::domain::Task {
        let root = harness.dir.path();
        std::fs::create_dir_all(root.join("src")).expect("mkdir");
        std::fs::create_dir_all(root.join("tests")).expect("mkdir");
        std::fs::write(root.join("src/a.ts"), "export const a = 1;\n").expect("write");
        std::fs::write(root.join("tests/a.test.ts"), "test\n").expect("write");

        let mut task = crate::domain::Task::new_atomic("happy path", "engineer");
        task.files = vec!["src/a.ts".to_string(), "tests/a.test.ts".to_string()];
        task.allowed_tests = vec!["npm test tests/a.test.ts".to_string()];
        task.pins = Some(crate::domain::Pins {
            allowed_paths: vec!["src/a.ts".to_string(), "tests/a.test.ts".to_string()],
            ..crate::domain::Pins::default()
        });
        task.status = crate::domain::TaskStatus::Ready;
        let created = harness.service.create_task(task).expect("create");
        harness
            .service
            .board
            .set_status(&created.id, crate::domain::TaskStatus::Ready)
            .expect("ready");
        harness.service.get_task(&created.id).expect("get")
    }
}
