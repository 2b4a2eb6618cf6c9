//! Deterministic artifact synthesis for one task attempt.
//!
//! Every run leaves the same artifact set under `artifacts/<task_id>/`
//! regardless of how the executor behaved. Synthesis is idempotent and, for
//! external (untrusted) jobs, overwrites whatever the worker claims to have
//! written.

use std::collections::BTreeMap;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use factory_state::{load_json, save_json_atomic, ContentDigest, FactoryPaths, WriteMode};

use crate::collab::SchemaValidator;
use crate::domain::{
    GateResult, Job, PatchStats, Pins, PreSnapshotFull, SnapshotDiff, Submit, SubmitAllowPaths,
    SubmitStatus, SubmitTests, Task, Verdict, VerdictRecord, SUBMIT_SCHEMA, VERDICT_SCHEMA,
};
use crate::preflight::PreflightResult;
use crate::pins::PINS_RESULT_SCHEMA;
use crate::scope::ScopeViolation;

pub const REPLAY_BUNDLE_SCHEMA: &str = "scc.replay_bundle.v1";
pub const TRACE_SCHEMA: &str = "scc.trace.v1";

/// `pins/pins.json` item (`scc.pins_result.v2`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinsItem {
    pub path: String,
    pub reason: String,
    pub read_only: bool,
    pub write_intent: bool,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub line_windows: Vec<crate::domain::LineWindow>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PinsResult {
    pub schema_version: String,
    pub task_id: String,
    pub items: Vec<PinsItem>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
}

/// Inputs for verdict synthesis.
pub struct VerdictInputs<'a> {
    pub submit: Option<&'a Submit>,
    pub ci_gate: Option<&'a GateResult>,
    pub policy_gate: Option<&'a GateResult>,
    pub scope_violations: &'a [ScopeViolation],
    pub hygiene_problems: &'a [String],
    pub submit_mismatch: Option<&'a str>,
}

/// Writes and reads the per-task artifact tree.
pub struct ArtifactStore {
    paths: FactoryPaths,
}

impl ArtifactStore {
    pub fn new(paths: FactoryPaths) -> Self {
        Self { paths }
    }

    pub fn paths(&self) -> &FactoryPaths {
        &self.paths
    }

    // ---- pins ---------------------------------------------------------

    pub fn write_pins(&self, task_id: &str, pins: &Pins) -> crate::domain::Result<()> {
        let dir = self.paths.task_pins_dir(task_id);
        let items: Vec<PinsItem> = pins
            .allowed_paths
            .iter()
            .map(|path| PinsItem {
                path: path.clone(),
                reason: "task allow path".to_string(),
                read_only: false,
                write_intent: true,
                symbols: pins.symbols.clone(),
                line_windows: pins.line_windows.get(path).cloned().unwrap_or_default(),
            })
            .collect();
        let result = PinsResult {
            schema_version: PINS_RESULT_SCHEMA.to_string(),
            task_id: task_id.to_string(),
            items,
            forbidden_paths: pins.forbidden_paths.clone(),
        };
        save_json_atomic(&dir.join("pins.json"), &result, WriteMode::Strict)?;

        let mut table = String::from("| path | write | symbols |\n|---|---|---|\n");
        for item in &result.items {
            table.push_str(&format!(
                "| {} | {} | {} |\n",
                item.path,
                item.write_intent,
                item.symbols.join(", ")
            ));
        }
        std::fs::create_dir_all(&dir)?;
        std::fs::write(dir.join("pins.md"), table)?;
        Ok(())
    }

    pub fn write_preflight(
        &self,
        task_id: &str,
        result: &PreflightResult,
    ) -> crate::domain::Result<()> {
        let path = self.paths.task_artifacts(task_id).join("preflight.json");
        save_json_atomic(&path, result, WriteMode::Strict)?;
        Ok(())
    }

    pub fn write_pre_snapshot_full(
        &self,
        task_id: &str,
        full: &PreSnapshotFull,
    ) -> crate::domain::Result<()> {
        let path = self
            .paths
            .task_artifacts(task_id)
            .join("pre_snapshot_full.json");
        save_json_atomic(&path, full, WriteMode::Strict)?;
        Ok(())
    }

    pub fn read_pre_snapshot_full(&self, task_id: &str) -> Option<PreSnapshotFull> {
        load_json(
            &self
                .paths
                .task_artifacts(task_id)
                .join("pre_snapshot_full.json"),
        )
        .ok()
        .flatten()
    }

    // ---- run artifacts ------------------------------------------------

    /// Synthesize the run artifact set. `overwrite` is true for external
    /// jobs; internal runs keep an executor-written `submit.json` when one
    /// parses.
    pub fn ensure_artifacts(
        &self,
        job: &Job,
        task: &Task,
        snapshot_diff: Option<&SnapshotDiff>,
        ci_gate: Option<&GateResult>,
        overwrite: bool,
    ) -> crate::domain::Result<Submit> {
        let task_id = task.id.as_str();
        let dir = self.paths.task_artifacts(task_id);
        std::fs::create_dir_all(self.paths.task_evidence_dir(task_id))?;

        // patch.diff: model diff when present, touched-path listing otherwise
        let patch_path = dir.join("patch.diff");
        if overwrite || !patch_path.exists() {
            let patch_text = job
                .patch_stats
                .as_ref()
                .and_then(|s| s.patch_text.clone())
                .unwrap_or_else(|| {
                    let touched = touched_files(job, snapshot_diff);
                    let mut text = String::from("# no unified diff provided\n");
                    for file in touched {
                        text.push_str(&format!("# touched: {file}\n"));
                    }
                    text
                });
            std::fs::write(&patch_path, patch_text)?;
        }

        // submit.json: trusted sources first (executor-written file, parsed
        // stdout contract), synthesized otherwise. External output is never
        // trusted.
        let submit_path = dir.join("submit.json");
        let existing: Option<Submit> = if overwrite {
            None
        } else {
            load_json(&submit_path)
                .ok()
                .flatten()
                .or_else(|| job.submit.clone())
        };
        let submit = match existing {
            Some(mut submit) if submit.schema_version == SUBMIT_SCHEMA => {
                if submit.touched_files.is_empty() {
                    submit.touched_files = touched_files(job, snapshot_diff);
                }
                submit
            }
            _ => self.synthesize_submit(job, task, snapshot_diff, ci_gate),
        };
        save_json_atomic(&submit_path, &submit, WriteMode::Strict)?;

        // selftest.log: gateway-owned structural artifact
        let selftest_path = dir.join("selftest.log");
        if overwrite || !selftest_path.exists() {
            let log = format!(
                "task={task_id}\njob={}\nexecutor={}\nSELFTEST structural check\nEXIT_CODE=0\n",
                job.id,
                job.executor.as_str()
            );
            std::fs::write(&selftest_path, log)?;
        }

        // report.md
        let report = format!(
            "# Run report\n\n- task: {task_id}\n- job: {}\n- executor: {}\n- model: {}\n- status: {:?}\n- exit_code: {}\n- ci_gate_ok: {}\n- touched_files: {}\n\nEvidence: artifacts/{task_id}/evidence/\n",
            job.id,
            job.executor.as_str(),
            job.model_effective.as_deref().unwrap_or(&job.model),
            job.status,
            job.exit_code.map(|c| c.to_string()).unwrap_or_else(|| "-".to_string()),
            ci_gate.map(|g| g.ok).unwrap_or(true),
            submit.touched_files.join(", "),
        );
        std::fs::write(dir.join("report.md"), report)?;

        // evidence: executor streams + snapshot diff
        let evidence = self.paths.task_evidence_dir(task_id);
        std::fs::write(evidence.join("stdout.txt"), &job.stdout)?;
        std::fs::write(evidence.join("stderr.txt"), &job.stderr)?;
        if let Some(diff) = snapshot_diff {
            save_json_atomic(
                &evidence.join("snapshot_diff.json"),
                diff,
                WriteMode::BestEffort,
            )?;
        }
        if let Some(gate) = ci_gate {
            save_json_atomic(&evidence.join("ci_gate.json"), gate, WriteMode::BestEffort)?;
        }
        if !job.policy_violations.is_empty() {
            save_json_atomic(
                &evidence.join("policy_violations.json"),
                &job.policy_violations,
                WriteMode::BestEffort,
            )?;
        }
        if let Some(proof) = &job.context_pack_v1_proof {
            save_json_atomic(
                &evidence.join("context_pack_v1_proof.json"),
                proof,
                WriteMode::BestEffort,
            )?;
        }
        if let Some(tests) = &job.allowed_tests {
            save_json_atomic(
                &evidence.join("allowed_tests.json"),
                tests,
                WriteMode::BestEffort,
            )?;
        }

        // replay_bundle.json
        let bundle = serde_json::json!({
            "schema_version": REPLAY_BUNDLE_SCHEMA,
            "task": task,
            "artifacts": {
                "submit": rel(task_id, "submit.json"),
                "report": rel(task_id, "report.md"),
                "selftest": rel(task_id, "selftest.log"),
                "patch": rel(task_id, "patch.diff"),
                "verdict": rel(task_id, "verdict.json"),
                "trace": rel(task_id, "trace.json"),
            },
            "context_pack_v1": job.context_pack_v1_id.as_ref().map(|id| serde_json::json!({
                "pack_id": id,
                "pack_json": format!("artifacts/scc_runs/{id}/rendered_context_pack.json"),
                "task_bundle_dir": format!("artifacts/scc_runs/{id}/task_bundle"),
            })),
        });
        save_json_atomic(&dir.join("replay_bundle.json"), &bundle, WriteMode::Strict)?;

        Ok(submit)
    }

    fn synthesize_submit(
        &self,
        job: &Job,
        task: &Task,
        snapshot_diff: Option<&SnapshotDiff>,
        ci_gate: Option<&GateResult>,
    ) -> Submit {
        let touched = touched_files(job, snapshot_diff);
        let needs_input = job.reason.as_deref() == Some(crate::domain::reason::NEEDS_INPUT);
        let failed = job.status == crate::domain::JobStatus::Failed
            || job.exit_code.unwrap_or(0) != 0
            || ci_gate.map(|g| g.required && !g.ok).unwrap_or(false);

        let status = if needs_input {
            SubmitStatus::NeedInput
        } else if failed {
            SubmitStatus::Failed
        } else {
            SubmitStatus::Done
        };

        let mut artifacts = BTreeMap::new();
        for name in ["report.md", "selftest.log", "patch.diff"] {
            artifacts.insert(name.to_string(), rel(&task.id, name));
        }

        Submit {
            schema_version: SUBMIT_SCHEMA.to_string(),
            status,
            reason_code: job.reason.clone().unwrap_or_default(),
            changed_files: touched.clone(),
            new_files: Vec::new(),
            touched_files: touched,
            allow_paths: SubmitAllowPaths {
                read: task
                    .pins
                    .as_ref()
                    .map(|p| p.allowed_paths.clone())
                    .unwrap_or_default(),
                write: task
                    .pins
                    .as_ref()
                    .map(|p| p.allowed_paths.clone())
                    .unwrap_or_default(),
            },
            tests: SubmitTests {
                commands: task.allowed_tests.clone(),
                passed: !failed,
                summary: String::new(),
            },
            artifacts,
            exit_code: job.exit_code.unwrap_or(0),
            needs_input,
        }
    }

    // ---- verdict & trace ----------------------------------------------

    /// Write the verdict after schema validation. Validation failures are
    /// recorded but never block the write.
    pub fn write_verdict(
        &self,
        record: &VerdictRecord,
        validator: &dyn SchemaValidator,
    ) -> crate::domain::Result<()> {
        let value = serde_json::to_value(record)?;
        if let Err(problem) = validator.validate(VERDICT_SCHEMA, &value) {
            warn!(task_id = %record.task_id, %problem, "verdict failed schema validation");
        }
        let path = self
            .paths
            .task_artifacts(&record.task_id)
            .join("verdict.json");
        save_json_atomic(&path, record, WriteMode::Strict)?;
        Ok(())
    }

    pub fn read_verdict(&self, task_id: &str) -> Option<VerdictRecord> {
        load_json(&self.paths.task_artifacts(task_id).join("verdict.json"))
            .ok()
            .flatten()
    }

    pub fn read_submit(&self, task_id: &str) -> Option<Submit> {
        load_json(&self.paths.task_artifacts(task_id).join("submit.json"))
            .ok()
            .flatten()
    }

    /// `trace.json`: configuration hashes + routing + artifact index.
    pub fn write_trace(&self, job: &Job, task: &Task) -> crate::domain::Result<()> {
        let mut config_hashes = BTreeMap::new();
        for (key, path) in [
            ("factory_policy.json", self.paths.factory_policy_file()),
            ("roles/registry.json", self.paths.roles_registry_file()),
            ("skills/registry.json", self.paths.skills_registry_file()),
        ] {
            if let Ok(bytes) = std::fs::read(&path) {
                config_hashes.insert(
                    key.to_string(),
                    ContentDigest::from_bytes(&bytes).as_str().to_string(),
                );
            }
        }

        let trace = serde_json::json!({
            "schema_version": TRACE_SCHEMA,
            "task_id": task.id,
            "job_id": job.id,
            "config_hashes": config_hashes,
            "routing": {
                "executor": job.executor.as_str(),
                "model": job.model,
                "model_effective": job.model_effective,
                "runner": job.runner,
                "lane": task.lane.as_str(),
            },
            "artifacts": {
                "submit": rel(&task.id, "submit.json"),
                "verdict": rel(&task.id, "verdict.json"),
                "report": rel(&task.id, "report.md"),
                "patch": rel(&task.id, "patch.diff"),
                "replay_bundle": rel(&task.id, "replay_bundle.json"),
            },
        });
        save_json_atomic(
            &self.paths.task_artifacts(&task.id).join("trace.json"),
            &trace,
            WriteMode::Strict,
        )?;
        Ok(())
    }

    /// Rewrite the submit as FAILED with the terminal reason code. Every
    /// terminal failure leaves a FAILED submit behind.
    pub fn mark_submit_failed(&self, task_id: &str, reason_code: &str) -> crate::domain::Result<()> {
        let path = self.paths.task_artifacts(task_id).join("submit.json");
        let Some(mut submit) = load_json::<Submit>(&path).ok().flatten() else {
            return Ok(());
        };
        if submit.status == SubmitStatus::Done {
            submit.status = SubmitStatus::Failed;
        }
        if submit.reason_code.is_empty() {
            submit.reason_code = reason_code.to_string();
        }
        submit.tests.passed = false;
        save_json_atomic(&path, &submit, WriteMode::Strict)?;
        Ok(())
    }

    /// Structural hygiene over the artifact set.
    pub fn hygiene_check(&self, task_id: &str) -> Vec<String> {
        let dir = self.paths.task_artifacts(task_id);
        let mut problems = Vec::new();

        match std::fs::read_to_string(dir.join("selftest.log")) {
            Ok(log) if log.trim_end().ends_with("EXIT_CODE=0") => {}
            Ok(_) => problems.push("selftest.log does not end with EXIT_CODE=0".to_string()),
            Err(_) => problems.push("selftest.log missing".to_string()),
        }
        if !dir.join("report.md").exists() {
            problems.push("report.md missing".to_string());
        }
        match self.read_submit(task_id) {
            Some(submit) if submit.schema_version == SUBMIT_SCHEMA => {}
            Some(_) => problems.push("submit.json has wrong schema_version".to_string()),
            None => problems.push("submit.json missing or unparseable".to_string()),
        }
        problems
    }
}

/// Verdict synthesis from submit + gates + scope + hygiene.
pub fn compute_verdict(task: &Task, inputs: &VerdictInputs<'_>) -> VerdictRecord {
    let mut reasons = Vec::new();
    let mut verdict = Verdict::Pass;

    let mut fail = |reasons: &mut Vec<String>, verdict: &mut Verdict, reason: String| {
        *verdict = Verdict::Fail;
        reasons.push(reason);
    };

    match inputs.submit {
        None => fail(
            &mut reasons,
            &mut verdict,
            crate::domain::reason::MISSING_SUBMIT_CONTRACT.to_string(),
        ),
        Some(submit) => match submit.status {
            SubmitStatus::NeedInput => {
                verdict = Verdict::Escalate;
                reasons.push(crate::domain::reason::NEEDS_INPUT.to_string());
            }
            SubmitStatus::Failed => {
                let code = if submit.reason_code.is_empty() {
                    "executor_error".to_string()
                } else {
                    submit.reason_code.clone()
                };
                fail(&mut reasons, &mut verdict, code);
            }
            SubmitStatus::Done => {}
        },
    }

    if let Some(mismatch) = inputs.submit_mismatch {
        fail(
            &mut reasons,
            &mut verdict,
            format!("{}: {mismatch}", crate::domain::reason::SUBMIT_MISMATCH),
        );
    }

    for violation in inputs.scope_violations {
        fail(
            &mut reasons,
            &mut verdict,
            format!("{}: {}", violation.code.as_str(), violation.detail),
        );
    }

    if let Some(gate) = inputs.ci_gate {
        if gate.required && gate.timed_out {
            fail(
                &mut reasons,
                &mut verdict,
                crate::domain::reason::CI_TIMED_OUT.to_string(),
            );
        } else if gate.required && gate.ran && !gate.ok {
            fail(
                &mut reasons,
                &mut verdict,
                crate::domain::reason::CI_FAILED.to_string(),
            );
        } else if gate.required && !gate.ran {
            // A required gate that never ran cannot pass silently.
            if verdict == Verdict::Pass {
                verdict = Verdict::Escalate;
            }
            reasons.push(crate::domain::reason::CI_SKIPPED.to_string());
        }
    }

    if let Some(gate) = inputs.policy_gate {
        if gate.ran && gate.timed_out {
            fail(
                &mut reasons,
                &mut verdict,
                crate::domain::reason::POLICY_GATE_TIMED_OUT.to_string(),
            );
        } else if gate.ran && !gate.ok {
            fail(
                &mut reasons,
                &mut verdict,
                crate::domain::reason::POLICY_GATE_FAILED.to_string(),
            );
        }
    }

    if !inputs.hygiene_problems.is_empty() {
        fail(
            &mut reasons,
            &mut verdict,
            crate::domain::reason::HYGIENE_FAILED.to_string(),
        );
    }

    VerdictRecord {
        schema_version: VERDICT_SCHEMA.to_string(),
        task_id: task.id.clone(),
        verdict,
        reasons,
        created_at: Utc::now(),
    }
}

/// Touched files, by trust order: submit (trusted) -> snapshot diff ->
/// patch stats.
pub fn touched_files(job: &Job, snapshot_diff: Option<&SnapshotDiff>) -> Vec<String> {
    if let Some(diff) = snapshot_diff.or(job.snapshot_diff.as_ref()) {
        if !diff.touched_files.is_empty() {
            return diff.touched_files.clone();
        }
    }
    if let Some(submit) = &job.submit {
        if !submit.touched_files.is_empty() {
            return submit.touched_files.clone();
        }
    }
    job.patch_stats
        .as_ref()
        .map(|s| s.files.clone())
        .unwrap_or_default()
}

/// Parse a unified diff into patch statistics.
pub fn parse_unified_diff(patch: &str) -> PatchStats {
    let mut files = Vec::new();
    let mut added = 0u32;
    let mut removed = 0u32;

    for line in patch.lines() {
        if let Some(rest) = line.strip_prefix("+++ ") {
            let path = rest.trim().trim_start_matches("b/");
            if path != "/dev/null" && !files.iter().any(|f| f == path) {
                files.push(path.to_string());
            }
        } else if line.starts_with('+') && !line.starts_with("+++") {
            added += 1;
        } else if line.starts_with('-') && !line.starts_with("---") {
            removed += 1;
        }
    }

    PatchStats {
        files,
        added,
        removed,
        patch_text: Some(patch.to_string()),
    }
}

fn rel(task_id: &str, name: &str) -> String {
    format!("artifacts/{task_id}/{name}")
}

/// Relative artifact paths for DLQ/evidence pointers.
pub fn artifact_pointers(task_id: &str) -> (String, String, String) {
    (
        format!("artifacts/{task_id}"),
        rel(task_id, "report.md"),
        rel(task_id, "selftest.log"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::fakes::FakeValidator;
    use crate::domain::{ExecutorKind, JobStatus, JobTaskType, RunnerKind};
    use tempfile::tempdir;

    fn store() -> (ArtifactStore, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let store = ArtifactStore::new(FactoryPaths::new(dir.path()));
        (store, dir)
    }

    fn job_for(task: &Task) -> Job {
        let mut job = Job::new(
            Some(task.id.clone()),
            "prompt".to_string(),
            "gpt-5".to_string(),
            ExecutorKind::Codex,
            JobTaskType::Atomic,
            RunnerKind::External,
            10,
        );
        job.status = JobStatus::Done;
        job.exit_code = Some(0);
        job
    }

    #[test]
    fn test_ensure_artifacts_is_idempotent_for_external() {
        let (store, _dir) = store();
        let task = Task::new_atomic("t", "engineer");
        let job = job_for(&task);
        let diff = SnapshotDiff {
            touched_files: vec!["src/a.ts".to_string()],
        };

        store
            .ensure_artifacts(&job, &task, Some(&diff), None, true)
            .expect("first");
        let first = std::fs::read(
            store
                .paths()
                .task_artifacts(&task.id)
                .join("submit.json"),
        )
        .expect("read");

        store
            .ensure_artifacts(&job, &task, Some(&diff), None, true)
            .expect("second");
        let second = std::fs::read(
            store
                .paths()
                .task_artifacts(&task.id)
                .join("submit.json"),
        )
        .expect("read");
        assert_eq!(first, second);
    }

    #[test]
    fn test_submit_derives_touched_from_diff() {
        let (store, _dir) = store();
        let task = Task::new_atomic("t", "engineer");
        let job = job_for(&task);
        let diff = SnapshotDiff {
            touched_files: vec!["src/a.ts".to_string(), "tests/a.test.ts".to_string()],
        };

        let submit = store
            .ensure_artifacts(&job, &task, Some(&diff), None, true)
            .expect("ensure");
        assert_eq!(submit.status, SubmitStatus::Done);
        assert_eq!(submit.touched_files, diff.touched_files);
    }

    #[test]
    fn test_failed_job_yields_failed_submit() {
        let (store, _dir) = store();
        let task = Task::new_atomic("t", "engineer");
        let mut job = job_for(&task);
        job.status = JobStatus::Failed;
        job.exit_code = Some(1);
        job.reason = Some("executor_error".to_string());

        let submit = store
            .ensure_artifacts(&job, &task, None, None, true)
            .expect("ensure");
        assert_eq!(submit.status, SubmitStatus::Failed);
        assert_eq!(submit.reason_code, "executor_error");
    }

    #[test]
    fn test_hygiene_passes_after_ensure() {
        let (store, _dir) = store();
        let task = Task::new_atomic("t", "engineer");
        let job = job_for(&task);

        store
            .ensure_artifacts(&job, &task, None, None, true)
            .expect("ensure");
        assert!(store.hygiene_check(&task.id).is_empty());
    }

    #[test]
    fn test_hygiene_reports_missing_artifacts() {
        let (store, _dir) = store();
        let problems = store.hygiene_check("ghost-task");
        assert!(problems.iter().any(|p| p.contains("selftest.log")));
        assert!(problems.iter().any(|p| p.contains("submit.json")));
    }

    #[test]
    fn test_verdict_pass_and_failure_paths() {
        let task = Task::new_atomic("t", "engineer");

        let submit = Submit {
            schema_version: SUBMIT_SCHEMA.to_string(),
            status: SubmitStatus::Done,
            reason_code: String::new(),
            changed_files: vec![],
            new_files: vec![],
            touched_files: vec![],
            allow_paths: Default::default(),
            tests: Default::default(),
            artifacts: Default::default(),
            exit_code: 0,
            needs_input: false,
        };
        let passing = compute_verdict(
            &task,
            &VerdictInputs {
                submit: Some(&submit),
                ci_gate: None,
                policy_gate: None,
                scope_violations: &[],
                hygiene_problems: &[],
                submit_mismatch: None,
            },
        );
        assert_eq!(passing.verdict, Verdict::Pass);
        assert!(passing.reasons.is_empty());

        let gate = GateResult {
            ran: true,
            required: true,
            ok: false,
            exit_code: Some(1),
            ..GateResult::default()
        };
        let failing = compute_verdict(
            &task,
            &VerdictInputs {
                submit: Some(&submit),
                ci_gate: Some(&gate),
                policy_gate: None,
                scope_violations: &[],
                hygiene_problems: &[],
                submit_mismatch: None,
            },
        );
        assert_eq!(failing.verdict, Verdict::Fail);
        assert!(failing.reasons.contains(&"ci_failed".to_string()));

        let missing = compute_verdict(
            &task,
            &VerdictInputs {
                submit: None,
                ci_gate: None,
                policy_gate: None,
                scope_violations: &[],
                hygiene_problems: &[],
                submit_mismatch: None,
            },
        );
        assert_eq!(missing.verdict, Verdict::Fail);
        assert!(missing
            .reasons
            .contains(&"missing_submit_contract".to_string()));
    }

    #[test]
    fn test_verdict_escalates_on_need_input_and_ci_skip() {
        let task = Task::new_atomic("t", "engineer");
        let mut submit = Submit {
            schema_version: SUBMIT_SCHEMA.to_string(),
            status: SubmitStatus::NeedInput,
            reason_code: String::new(),
            changed_files: vec![],
            new_files: vec![],
            touched_files: vec![],
            allow_paths: Default::default(),
            tests: Default::default(),
            artifacts: Default::default(),
            exit_code: 0,
            needs_input: true,
        };
        let escalated = compute_verdict(
            &task,
            &VerdictInputs {
                submit: Some(&submit),
                ci_gate: None,
                policy_gate: None,
                scope_violations: &[],
                hygiene_problems: &[],
                submit_mismatch: None,
            },
        );
        assert_eq!(escalated.verdict, Verdict::Escalate);

        submit.status = SubmitStatus::Done;
        submit.needs_input = false;
        let gate = GateResult {
            ran: false,
            required: true,
            ok: true,
            ..GateResult::default()
        };
        let skipped = compute_verdict(
            &task,
            &VerdictInputs {
                submit: Some(&submit),
                ci_gate: Some(&gate),
                policy_gate: None,
                scope_violations: &[],
                hygiene_problems: &[],
                submit_mismatch: None,
            },
        );
        assert_eq!(skipped.verdict, Verdict::Escalate);
        assert!(skipped.reasons.contains(&"ci_skipped".to_string()));
    }

    #[test]
    fn test_verdict_write_survives_schema_rejection() {
        let (store, _dir) = store();
        let record = VerdictRecord {
            schema_version: VERDICT_SCHEMA.to_string(),
            task_id: "t1".to_string(),
            verdict: Verdict::Pass,
            reasons: vec![],
            created_at: Utc::now(),
        };
        let validator = FakeValidator {
            reject_schemas: vec![VERDICT_SCHEMA.to_string()],
        };
        store.write_verdict(&record, &validator).expect("write");
        assert_eq!(store.read_verdict("t1").expect("read").verdict, Verdict::Pass);
    }

    #[test]
    fn test_parse_unified_diff() {
        let patch = "\
--- a/src/a.ts
+++ b/src/a.ts
@@ -1,2 +1,3 @@
-old line
+new line
+another line
--- a/src/b.ts
+++ b/src/b.ts
@@ -1 +1 @@
-x
+y
";
        let stats = parse_unified_diff(patch);
        assert_eq!(stats.files, vec!["src/a.ts", "src/b.ts"]);
        assert_eq!(stats.added, 3);
        assert_eq!(stats.removed, 2);
    }

    #[test]
    fn test_write_trace_includes_config_hashes() {
        let (store, dir) = store();
        std::fs::write(dir.path().join("factory_policy.json"), b"{}").expect("write");

        let task = Task::new_atomic("t", "engineer");
        let job = job_for(&task);
        store.write_trace(&job, &task).expect("trace");

        let trace: serde_json::Value = load_json(
            &store.paths().task_artifacts(&task.id).join("trace.json"),
        )
        .expect("load")
        .expect("present");
        assert_eq!(trace["schema_version"], TRACE_SCHEMA);
        assert!(trace["config_hashes"]["factory_policy.json"].is_string());
        assert_eq!(trace["routing"]["executor"], "codex");
    }
}
