//! Named boundaries to the external collaborators the kernel consumes.
//!
//! These traits define what the gateway needs, not how the collaborator
//! works: the Map index and Context Pack rendering live in another service,
//! schema validation is table-driven elsewhere, and subprocess invocation
//! belongs to `factory-gates`. In-memory fakes are provided for tests via
//! the `fakes` module.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::domain::{Pins, Task};

// ---------------------------------------------------------------------------
// MapStore
// ---------------------------------------------------------------------------

/// `map/version.json` (`scc.map_version.v1`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapVersion {
    pub schema_version: String,
    pub hash: String,
    pub map_path: String,
    pub generated_at: String,
    #[serde(default)]
    pub stats: serde_json::Value,
    #[serde(default)]
    pub coverage: MapCoverage,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct MapCoverage {
    #[serde(default)]
    pub roots: Vec<String>,
}

/// Request for Map-driven pins generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoPinsRequest {
    pub child_task: Task,
    #[serde(default)]
    pub signals: Vec<String>,
    pub map_ref: MapRef,
    #[serde(default)]
    pub budgets: BTreeMap<String, u64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MapRef {
    pub path: String,
    pub hash: String,
}

/// The source-Map index service.
#[async_trait]
pub trait MapStore: Send + Sync {
    /// Propose pins for a task from the Map. `None` when the Map cannot
    /// produce a useful spec.
    async fn auto_pins(&self, request: &AutoPinsRequest) -> Option<Pins>;

    /// Test entry points the Map knows about for the task's files.
    async fn test_entry_points(&self, task: &Task) -> Vec<String>;
}

// ---------------------------------------------------------------------------
// ContextPackRenderer
// ---------------------------------------------------------------------------

/// A rendered, byte-fixed Context Pack v1.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RenderedPack {
    pub pack_id: String,
    /// The textual pack injected ahead of the task prompt.
    pub text: String,
    /// The canonical JSON document persisted as
    /// `artifacts/scc_runs/<pack_id>/rendered_context_pack.json`.
    pub json: serde_json::Value,
    /// included/unused section accounting for the token-waste hook.
    #[serde(default)]
    pub included_sections: u32,
    #[serde(default)]
    pub unused_ratio: f64,
}

#[async_trait]
pub trait ContextPackRenderer: Send + Sync {
    async fn render(&self, task: &Task, pins: &Pins) -> Result<RenderedPack, String>;
}

// ---------------------------------------------------------------------------
// SchemaValidator
// ---------------------------------------------------------------------------

/// Validates a document against a named `scc.*` schema. Failures are
/// surfaced as human-readable strings; callers record them but decide
/// independently whether they block.
pub trait SchemaValidator: Send + Sync {
    fn validate(&self, schema_id: &str, document: &serde_json::Value) -> Result<(), String>;
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

/// One executor CLI invocation request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecRequest {
    pub executor: crate::domain::ExecutorKind,
    pub model: String,
    pub prompt: String,
    pub timeout_ms: u64,
}

/// Raw outcome of an executor run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct ExecOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub timed_out: bool,
    /// Spawn/transport error (missing binary, kill failure), not a non-zero
    /// exit.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.error.is_none() && self.exit_code == Some(0)
    }
}

/// The subprocess boundary for executor CLIs.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, request: &ExecRequest) -> ExecOutcome;
}

// ---------------------------------------------------------------------------
// GateSuite
// ---------------------------------------------------------------------------

/// The deterministic verifier suite (CI gate, policy gate, allowed tests).
/// `factory-gates` ships the production implementation over subprocesses;
/// the kernel only sees this trait.
#[async_trait]
pub trait GateSuite: Send + Sync {
    /// CI gate over the task's submit artifact.
    async fn run_ci_gate(
        &self,
        task: &Task,
        job: &crate::domain::Job,
    ) -> crate::domain::GateResult;

    /// Policy gate; implementations decide from `touched_files` whether the
    /// gate is triggered at all.
    async fn run_policy_gate(
        &self,
        task: &Task,
        job: &crate::domain::Job,
        touched_files: &[String],
    ) -> crate::domain::GateResult;

    /// Allowed-tests runner (external runs only).
    async fn run_allowed_tests(
        &self,
        task: &Task,
        job: &crate::domain::Job,
    ) -> crate::domain::AllowedTestsResult;
}

// ---------------------------------------------------------------------------
// Fakes (testing)
// ---------------------------------------------------------------------------

pub mod fakes {
    //! In-memory fakes satisfying the collaborator traits without any
    //! external service.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;
    use crate::domain::ExecutorKind;

    /// MapStore fake returning a fixed pins proposal.
    #[derive(Debug, Default)]
    pub struct FakeMapStore {
        pub pins: Option<Pins>,
        pub entry_points: Vec<String>,
    }

    #[async_trait]
    impl MapStore for FakeMapStore {
        async fn auto_pins(&self, _request: &AutoPinsRequest) -> Option<Pins> {
            self.pins.clone()
        }

        async fn test_entry_points(&self, _task: &Task) -> Vec<String> {
            self.entry_points.clone()
        }
    }

    /// Renderer fake producing a deterministic pack from the task id.
    #[derive(Debug, Default)]
    pub struct FakeRenderer {
        pub fail_with: Option<String>,
        pub unused_ratio: f64,
        pub included_sections: u32,
    }

    #[async_trait]
    impl ContextPackRenderer for FakeRenderer {
        async fn render(&self, task: &Task, pins: &Pins) -> Result<RenderedPack, String> {
            if let Some(err) = &self.fail_with {
                return Err(err.clone());
            }
            let pack_id = format!("pack-{}", task.id);
            let json = serde_json::json!({
                "schema_version": "scc.context_pack.v1",
                "pack_id": pack_id,
                "task_id": task.id,
                "allowed_paths": pins.allowed_paths,
            });
            Ok(RenderedPack {
                text: format!("# Context pack for {}\n", task.title),
                pack_id,
                json,
                included_sections: self.included_sections,
                unused_ratio: self.unused_ratio,
            })
        }
    }

    /// Validator fake: accepts everything unless a schema id is listed.
    #[derive(Debug, Default)]
    pub struct FakeValidator {
        pub reject_schemas: Vec<String>,
    }

    impl SchemaValidator for FakeValidator {
        fn validate(&self, schema_id: &str, _document: &serde_json::Value) -> Result<(), String> {
            if self.reject_schemas.iter().any(|s| s == schema_id) {
                Err(format!("schema {schema_id} rejected by fake"))
            } else {
                Ok(())
            }
        }
    }

    /// Executor fake replaying scripted outcomes in order; repeats the last
    /// one when the script runs dry.
    #[derive(Debug, Default)]
    pub struct FakeExecutor {
        script: Mutex<VecDeque<ExecOutcome>>,
        pub calls: Mutex<Vec<ExecRequest>>,
    }

    impl FakeExecutor {
        pub fn with_outcomes(outcomes: impl IntoIterator<Item = ExecOutcome>) -> Self {
            Self {
                script: Mutex::new(outcomes.into_iter().collect()),
                calls: Mutex::new(Vec::new()),
            }
        }

        pub fn succeeding_with(stdout: impl Into<String>) -> Self {
            Self::with_outcomes([ExecOutcome {
                exit_code: Some(0),
                stdout: stdout.into(),
                ..ExecOutcome::default()
            }])
        }
    }

    #[async_trait]
    impl Executor for FakeExecutor {
        async fn run(&self, request: &ExecRequest) -> ExecOutcome {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .push(request.clone());
            let mut script = self.script.lock().unwrap_or_else(|p| p.into_inner());
            if script.len() > 1 {
                script.pop_front().unwrap_or_default()
            } else {
                script.front().cloned().unwrap_or(ExecOutcome {
                    exit_code: Some(0),
                    ..ExecOutcome::default()
                })
            }
        }
    }

    /// GateSuite fake with scripted results.
    pub struct FakeGateSuite {
        pub ci: Mutex<VecDeque<crate::domain::GateResult>>,
        pub policy: Mutex<VecDeque<crate::domain::GateResult>>,
        pub tests: crate::domain::AllowedTestsResult,
    }

    impl Default for FakeGateSuite {
        fn default() -> Self {
            Self {
                ci: Mutex::new(VecDeque::new()),
                policy: Mutex::new(VecDeque::new()),
                tests: crate::domain::AllowedTestsResult {
                    ran: false,
                    ok: true,
                    runs: Vec::new(),
                },
            }
        }
    }

    impl FakeGateSuite {
        pub fn passing() -> Self {
            let pass = crate::domain::GateResult {
                ran: true,
                required: true,
                ok: true,
                exit_code: Some(0),
                ..crate::domain::GateResult::default()
            };
            let suite = Self::default();
            suite.ci.lock().unwrap().push_back(pass);
            suite
        }

        pub fn ci_failing() -> Self {
            let fail = crate::domain::GateResult {
                ran: true,
                required: true,
                ok: false,
                exit_code: Some(1),
                ..crate::domain::GateResult::default()
            };
            let suite = Self::default();
            suite.ci.lock().unwrap().push_back(fail);
            suite
        }
    }

    #[async_trait]
    impl GateSuite for FakeGateSuite {
        async fn run_ci_gate(
            &self,
            _task: &Task,
            _job: &crate::domain::Job,
        ) -> crate::domain::GateResult {
            let mut script = self.ci.lock().unwrap_or_else(|p| p.into_inner());
            if script.len() > 1 {
                script.pop_front().unwrap_or_default()
            } else {
                script.front().cloned().unwrap_or(crate::domain::GateResult {
                    ran: true,
                    required: true,
                    ok: true,
                    exit_code: Some(0),
                    ..crate::domain::GateResult::default()
                })
            }
        }

        async fn run_policy_gate(
            &self,
            _task: &Task,
            _job: &crate::domain::Job,
            touched_files: &[String],
        ) -> crate::domain::GateResult {
            let triggered = touched_files.iter().any(|p| {
                p == "factory_policy.json"
                    || p.starts_with("docs/")
                    || p.starts_with("contracts/")
            });
            if !triggered {
                return crate::domain::GateResult::skipped("no policy-surface files touched");
            }
            let mut script = self.policy.lock().unwrap_or_else(|p| p.into_inner());
            script.pop_front().unwrap_or(crate::domain::GateResult {
                ran: true,
                required: true,
                ok: true,
                exit_code: Some(0),
                ..crate::domain::GateResult::default()
            })
        }

        async fn run_allowed_tests(
            &self,
            _task: &Task,
            _job: &crate::domain::Job,
        ) -> crate::domain::AllowedTestsResult {
            self.tests.clone()
        }
    }

    impl FakeExecutor {
        pub fn last_request(&self) -> Option<ExecRequest> {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .last()
                .cloned()
        }

        pub fn request_for(&self, executor: ExecutorKind) -> Option<ExecRequest> {
            self.calls
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .iter()
                .find(|r| r.executor == executor)
                .cloned()
        }
    }
}
