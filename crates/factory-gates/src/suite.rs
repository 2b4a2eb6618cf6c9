//! The production gate suite: CI gate, policy gate, allowed-tests runner.

use std::path::PathBuf;

use async_trait::async_trait;
use chrono::Utc;
use rand::Rng;
use tracing::info;

use factory_core::collab::GateSuite;
use factory_core::domain::{
    AllowedTestRun, AllowedTestsResult, GateResult, Job, RunnerKind, Task,
};
use factory_state::ContentDigest;

use crate::command::{run_command, split_command_line};

/// Touched-file prefixes that trigger the policy gate.
pub const POLICY_GATE_TRIGGER_PREFIXES: &[&str] = &[
    "docs/",
    "contracts/",
    "roles/",
    "skills/",
    "eval/",
    "patterns/",
    "playbooks/",
    "map/",
];

/// The gate script. Project tests are the allowed-tests gate; this script
/// is the only thing the CI and policy gates ever run.
const GATE_SCRIPT: &str = "tools/scc/gates/run_ci_gates.py";

const GATE_TIMEOUT_MS: u64 = 600_000;
const TEST_TIMEOUT_MS: u64 = 600_000;

#[derive(Debug, Clone)]
pub struct GateConfig {
    pub ci_gate_enabled: bool,
    pub ci_enforce_since_ms: i64,
    pub ci_strict: bool,
    pub policy_strict: bool,
    pub allowed_tests_max_commands: usize,
}

impl From<&factory_core::RuntimeConfig> for GateConfig {
    fn from(config: &factory_core::RuntimeConfig) -> Self {
        Self {
            ci_gate_enabled: config.ci_gate_enabled,
            ci_enforce_since_ms: config.ci_enforce_since_ms,
            ci_strict: config.ci_gates_strict,
            policy_strict: config.policy_gate_strict,
            allowed_tests_max_commands: config.allowed_tests_max_commands,
        }
    }
}

pub struct ProcessGateSuite {
    repo_root: PathBuf,
    config: GateConfig,
}

impl ProcessGateSuite {
    pub fn new(repo_root: impl Into<PathBuf>, config: GateConfig) -> Self {
        Self {
            repo_root: repo_root.into(),
            config,
        }
    }

    fn gate_argv(&self, task_id: &str, strict: bool) -> Vec<String> {
        let mut argv = vec!["python".to_string(), GATE_SCRIPT.to_string()];
        if strict {
            argv.push("--strict".to_string());
        }
        argv.push("--submit".to_string());
        argv.push(format!("artifacts/{task_id}/submit.json"));
        argv
    }

    /// Run the gate script and persist full logs with content hashes.
    async fn run_gate(&self, task_id: &str, strict: bool, required: bool) -> GateResult {
        let argv = self.gate_argv(task_id, strict);
        let outcome = run_command(&argv, &self.repo_root, GATE_TIMEOUT_MS, None).await;

        // Full logs under artifacts/<task_id>/ci_gate/
        let log_dir = self.repo_root.join("artifacts").join(task_id).join("ci_gate");
        let _ = std::fs::create_dir_all(&log_dir);
        let stamp = format!(
            "ci_{}_{:04x}",
            Utc::now().timestamp_millis(),
            rand::thread_rng().gen::<u16>()
        );
        let stdout_rel = format!("artifacts/{task_id}/ci_gate/{stamp}.stdout.log");
        let stderr_rel = format!("artifacts/{task_id}/ci_gate/{stamp}.stderr.log");
        let _ = std::fs::write(self.repo_root.join(&stdout_rel), &outcome.stdout);
        let _ = std::fs::write(self.repo_root.join(&stderr_rel), &outcome.stderr);

        GateResult {
            ran: outcome.spawn_error.is_none(),
            required,
            skipped: outcome.spawn_error.clone(),
            ok: outcome.ok(),
            exit_code: Some(outcome.exit_code),
            duration_ms: outcome.duration_ms,
            command: argv,
            timed_out: outcome.timed_out,
            stdout_path: Some(stdout_rel),
            stderr_path: Some(stderr_rel),
            stdout_sha256: Some(
                ContentDigest::from_bytes(outcome.stdout.as_bytes())
                    .as_str()
                    .to_string(),
            ),
            stderr_sha256: Some(
                ContentDigest::from_bytes(outcome.stderr.as_bytes())
                    .as_str()
                    .to_string(),
            ),
        }
    }
}

#[async_trait]
impl GateSuite for ProcessGateSuite {
    /// CI gate: required iff enabled and the task postdates the enforcement
    /// epoch. Never runs `task.allowed_tests`.
    async fn run_ci_gate(&self, task: &Task, _job: &Job) -> GateResult {
        let required = self.config.ci_gate_enabled
            && task.created_at.timestamp_millis() > self.config.ci_enforce_since_ms;
        if !required {
            return GateResult {
                required: false,
                ..GateResult::skipped("ci gate not required for this task")
            };
        }
        info!(task_id = %task.id, "running CI gate");
        self.run_gate(&task.id, self.config.ci_strict, true).await
    }

    /// Policy gate: triggered only when policy-surface files were touched.
    async fn run_policy_gate(
        &self,
        task: &Task,
        _job: &Job,
        touched_files: &[String],
    ) -> GateResult {
        let triggered = touched_files.iter().any(|path| {
            path == "factory_policy.json"
                || POLICY_GATE_TRIGGER_PREFIXES
                    .iter()
                    .any(|prefix| path.starts_with(prefix))
        });
        if !triggered {
            return GateResult::skipped("no policy-surface files touched");
        }
        info!(task_id = %task.id, "running policy gate");
        self.run_gate(&task.id, self.config.policy_strict, true).await
    }

    /// Allowed tests: external runs only, up to the configured command
    /// count, skipping gate re-entry, stopping at the first failure.
    async fn run_allowed_tests(&self, task: &Task, job: &Job) -> AllowedTestsResult {
        if job.runner != RunnerKind::External {
            return AllowedTestsResult {
                ran: false,
                ok: true,
                runs: Vec::new(),
            };
        }

        let commands: Vec<&String> = task
            .allowed_tests
            .iter()
            .filter(|c| !c.contains(GATE_SCRIPT))
            .take(self.config.allowed_tests_max_commands)
            .collect();

        let mut runs = Vec::new();
        let mut all_ok = true;
        for command in commands {
            let outcome = run_command(
                &split_command_line(command),
                &self.repo_root,
                TEST_TIMEOUT_MS,
                None,
            )
            .await;
            let ok = outcome.ok();
            runs.push(AllowedTestRun {
                command: command.clone(),
                ok,
                exit_code: outcome.exit_code,
                duration_ms: outcome.duration_ms,
                timed_out: outcome.timed_out,
            });
            if !ok {
                all_ok = false;
                break;
            }
        }

        AllowedTestsResult {
            ran: !runs.is_empty(),
            ok: all_ok,
            runs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_core::domain::{ExecutorKind, JobTaskType, Task};
    use tempfile::tempdir;

    fn config() -> GateConfig {
        GateConfig {
            ci_gate_enabled: true,
            ci_enforce_since_ms: 0,
            ci_strict: true,
            policy_strict: true,
            allowed_tests_max_commands: 2,
        }
    }

    fn job(runner: RunnerKind) -> Job {
        Job::new(
            Some("t1".to_string()),
            "p".to_string(),
            "m".to_string(),
            ExecutorKind::Codex,
            JobTaskType::Atomic,
            runner,
            0,
        )
    }

    fn gate_script_exists(root: &std::path::Path, body: &str) {
        let dir = root.join("tools/scc/gates");
        std::fs::create_dir_all(&dir).expect("mkdir");
        std::fs::write(dir.join("run_ci_gates.py"), body).expect("write");
    }

    #[tokio::test]
    async fn test_ci_gate_skipped_for_old_tasks() {
        let dir = tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.ci_enforce_since_ms = Utc::now().timestamp_millis() + 60_000;
        let suite = ProcessGateSuite::new(dir.path(), cfg);

        let task = Task::new_atomic("t", "engineer");
        let result = suite.run_ci_gate(&task, &job(RunnerKind::Internal)).await;
        assert!(!result.required);
        assert!(!result.ran);
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_ci_gate_runs_script_with_submit_path() {
        let dir = tempdir().expect("tempdir");
        gate_script_exists(dir.path(), "import sys; print('gate ok'); sys.exit(0)\n");
        let suite = ProcessGateSuite::new(dir.path(), config());

        let task = Task::new_atomic("t", "engineer");
        let result = suite.run_ci_gate(&task, &job(RunnerKind::Internal)).await;

        assert!(result.required);
        assert_eq!(
            result.command,
            vec![
                "python".to_string(),
                "tools/scc/gates/run_ci_gates.py".to_string(),
                "--strict".to_string(),
                "--submit".to_string(),
                format!("artifacts/{}/submit.json", task.id),
            ]
        );
        // Evidence persisted with hashes regardless of outcome
        assert!(result.stdout_sha256.is_some());
        assert!(result.stdout_path.is_some());
        let log = dir
            .path()
            .join(result.stdout_path.as_deref().expect("path"));
        assert!(log.exists());
    }

    #[tokio::test]
    async fn test_policy_gate_trigger_paths() {
        let dir = tempdir().expect("tempdir");
        let suite = ProcessGateSuite::new(dir.path(), config());
        let task = Task::new_atomic("t", "engineer");
        let job = job(RunnerKind::Internal);

        let untriggered = suite
            .run_policy_gate(&task, &job, &["src/a.ts".to_string()])
            .await;
        assert!(!untriggered.ran);
        assert!(untriggered.ok);

        gate_script_exists(dir.path(), "import sys; sys.exit(0)\n");
        for path in ["docs/README.md", "factory_policy.json", "map/version.json"] {
            let result = suite
                .run_policy_gate(&task, &job, &[path.to_string()])
                .await;
            assert!(result.required, "{path} should trigger the policy gate");
        }
    }

    #[tokio::test]
    async fn test_allowed_tests_internal_noop() {
        let dir = tempdir().expect("tempdir");
        let suite = ProcessGateSuite::new(dir.path(), config());
        let mut task = Task::new_atomic("t", "engineer");
        task.allowed_tests = vec!["pytest -q".to_string()];

        let result = suite
            .run_allowed_tests(&task, &job(RunnerKind::Internal))
            .await;
        assert!(!result.ran);
        assert!(result.ok);
    }

    #[tokio::test]
    async fn test_allowed_tests_skips_gate_reentry_and_caps() {
        let dir = tempdir().expect("tempdir");
        let suite = ProcessGateSuite::new(dir.path(), config());
        let mut task = Task::new_atomic("t", "engineer");
        // The gate re-entry command must be skipped; the rest capped at 2.
        task.allowed_tests = vec![
            "python tools/scc/gates/run_ci_gates.py --submit artifacts/t/submit.json".to_string(),
            "echo a".to_string(),
            "echo b".to_string(),
            "echo c".to_string(),
        ];

        let result = suite
            .run_allowed_tests(&task, &job(RunnerKind::External))
            .await;
        assert!(result.ran);
        assert_eq!(result.runs.len(), 2);
        assert!(result
            .runs
            .iter()
            .all(|r| !r.command.contains("run_ci_gates")));
    }

    #[tokio::test]
    async fn test_allowed_tests_stop_at_first_failure() {
        let dir = tempdir().expect("tempdir");
        let mut cfg = config();
        cfg.allowed_tests_max_commands = 3;
        let suite = ProcessGateSuite::new(dir.path(), cfg);
        let mut task = Task::new_atomic("t", "engineer");
        // The first command fails, so the second never runs.
        task.allowed_tests = vec!["false".to_string(), "echo never".to_string()];

        let result = suite
            .run_allowed_tests(&task, &job(RunnerKind::External))
            .await;
        assert!(!result.ok);
        assert_eq!(result.runs.len(), 1);
    }
}
