//! Recovery machinery: typed fixup tasks, docs-only auto-rollback, DLQ,
//! retry plans.
//!
//! Recovery never mutates the board directly; it synthesizes task payloads
//! and artifacts, and the service decides what to insert. Every fixup path
//! is bounded by a per-task counter and the global fixup fuse.

use base64::Engine;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use factory_state::{append_jsonl_chained, save_json_atomic, FactoryPaths, WriteMode};

use crate::collab::MapStore;
use crate::config::RuntimeConfig;
use crate::domain::{
    DlqEntry, DlqEvidence, EventType, ExecutorKind, Job, Lane, Pins, PreSnapshotFull, Result,
    RetryPlan, RetryRoute, RetryStrategy, RollbackAction, RollbackReport, RunnerKind, Task,
    TaskStatus, DLQ_SCHEMA, RETRY_PLAN_SCHEMA, ROLLBACK_REPORT_SCHEMA,
};
use crate::pins::{pins_hash, PinsResolver};
use crate::policy::FactoryPolicy;

/// Reasons that route into the pins fixup path.
pub const PINS_FIXUP_REASONS: &[&str] =
    &["pins_insufficient", "missing_pins", "missing_pins_template"];

/// Outcome of the pins recovery attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum PinsFixOutcome {
    /// The Map produced different pins; apply them and re-dispatch.
    AppliedMapFix { pins: Pins, map_hash: String },
    /// Deterministic fix failed; insert this fixup task.
    CreateFixupTask(Task),
    /// Bounded out or not applicable.
    Skipped(&'static str),
}

pub struct Recovery {
    paths: FactoryPaths,
}

impl Recovery {
    pub fn new(paths: FactoryPaths) -> Self {
        Self { paths }
    }

    /// Fixup storm guard: no new fixups while the queue is saturated.
    pub fn fixup_fuse_blown(&self, queued_jobs: usize, config: &RuntimeConfig) -> bool {
        queued_jobs >= config.fixup_fuse_queue_threshold
    }

    // ---- pins ---------------------------------------------------------

    /// Pins recovery: deterministic Map fix first, synthesized
    /// `pins_fixup_v1` only when the Map cannot move the pins hash.
    pub async fn maybe_create_pins_fixup_task(
        &self,
        task: &Task,
        failure_reason: &str,
        resolver: &PinsResolver,
        map: &dyn MapStore,
        config: &RuntimeConfig,
    ) -> PinsFixOutcome {
        if !PINS_FIXUP_REASONS.contains(&failure_reason) {
            return PinsFixOutcome::Skipped("reason not pins-related");
        }

        if let Some((pins, map_hash)) = resolver
            .auto_pins_from_map(map, task, vec![failure_reason.to_string()])
            .await
        {
            let new_hash = pins_hash(&pins);
            if task.pins_map_hash.as_deref() != Some(new_hash.as_str()) {
                info!(task_id = %task.id, "map produced fresh pins; applying");
                return PinsFixOutcome::AppliedMapFix { pins, map_hash };
            }
        }

        if task.pins_fixup_count >= config.pins_fixup_max_per_task {
            return PinsFixOutcome::Skipped("pins fixup budget exhausted");
        }

        let mut fixup = fixup_task(
            "pins_fixup_v1",
            "pinser",
            Lane::Fastlane,
            format!("Repair pins for task {}", task.id),
            task,
        );
        fixup.allowed_executors = vec![ExecutorKind::Opencodecli];
        fixup.runner = RunnerKind::External;
        PinsFixOutcome::CreateFixupTask(fixup)
    }

    // ---- CI -----------------------------------------------------------

    /// `ci_fixup_v1` over the failing task's submit, bounded per task.
    pub fn maybe_create_ci_fixup_task(
        &self,
        task: &Task,
        config: &RuntimeConfig,
    ) -> Option<Task> {
        if task.ci_fixup_count >= config.ci_fixup_max_per_task {
            return None;
        }
        let mut fixup = fixup_task(
            "ci_fixup_v1",
            "engineer",
            Lane::Fastlane,
            format!("Repair CI failure for task {}", task.id),
            task,
        );
        fixup.allowed_tests = vec![format!(
            "python tools/scc/gates/run_ci_gates.py --submit artifacts/{}/submit.json",
            task.id
        )];
        Some(fixup)
    }

    /// Route specific CI gate stderr signatures to typed fixups.
    pub fn maybe_create_ci_gate_fixup_tasks(&self, task: &Task, gate_stderr: &str) -> Vec<Task> {
        let stderr = gate_stderr.to_lowercase();
        let mut tasks = Vec::new();

        if stderr.contains("events") && stderr.contains("backfill") {
            tasks.push(fixup_task(
                "events_backfill_v1",
                "engineer",
                Lane::Fastlane,
                format!("Backfill events ledger for task {}", task.id),
                task,
            ));
        }
        if stderr.contains("map") && (stderr.contains("stale") || stderr.contains("refresh")) {
            tasks.push(fixup_task(
                "map_refresh_v1",
                "engineer",
                Lane::Fastlane,
                "Refresh the source map index".to_string(),
                task,
            ));
        }
        if stderr.contains("ssot") {
            tasks.push(fixup_task(
                "ssot_sync_v1",
                "ssot_curator",
                Lane::Fastlane,
                "Synchronize SSOT index".to_string(),
                task,
            ));
        }
        tasks
    }

    // ---- policy -------------------------------------------------------

    /// Route policy gate errors to typed fixups.
    pub fn maybe_create_policy_fixup_tasks(
        &self,
        task: &Task,
        gate_errors: &[String],
        config: &RuntimeConfig,
    ) -> Vec<Task> {
        if task.policy_fixup_count >= config.policy_fixup_max_per_task {
            return Vec::new();
        }
        let joined = gate_errors.join("\n").to_lowercase();
        let mut tasks = Vec::new();

        if joined.contains("adr") || joined.contains("docs/") {
            tasks.push(fixup_task(
                "doc_adr_fixup_v1",
                "doc_adr_scribe",
                Lane::Fastlane,
                format!("Repair ADR/doc policy breaks from task {}", task.id),
                task,
            ));
        }
        if joined.contains("ssot") {
            tasks.push(fixup_task(
                "ssot_index_fixup_v1",
                "ssot_curator",
                Lane::Fastlane,
                "Repair SSOT index policy breaks".to_string(),
                task,
            ));
        }
        if joined.contains("schema") {
            tasks.push(fixup_task(
                "schema_fixup_v1",
                "engineer",
                Lane::Fastlane,
                "Repair schema policy breaks".to_string(),
                task,
            ));
        }
        tasks
    }

    // ---- rollback -----------------------------------------------------

    /// Docs-only auto-rollback on CI failure. Restores every touched file
    /// from the full pre-snapshot, or deletes files the run created.
    pub fn apply_auto_rollback_on_ci_failed(
        &self,
        repo_root: &std::path::Path,
        task: &Task,
        job: &Job,
        touched_files: &[String],
        full_snapshot: Option<&PreSnapshotFull>,
        config: &RuntimeConfig,
    ) -> Result<Option<RollbackReport>> {
        if !config.auto_rollback_on_ci_failed || touched_files.is_empty() {
            return Ok(None);
        }
        if config.auto_rollback_docs_only
            && !touched_files
                .iter()
                .all(|p| p == "docs" || p.starts_with("docs/"))
        {
            return Ok(None);
        }
        if touched_files.len() > config.auto_rollback_max_files {
            return Ok(None);
        }
        let Some(snapshot) = full_snapshot else {
            return Ok(None);
        };
        // Every touched file must have been captured.
        if !touched_files
            .iter()
            .all(|path| snapshot.contents.contains_key(path))
        {
            return Ok(None);
        }

        let mut applied = Vec::new();
        for path in touched_files {
            let abs = repo_root.join(path);
            match &snapshot.contents[path] {
                Some(encoded) => {
                    let bytes = base64::engine::general_purpose::STANDARD
                        .decode(encoded)
                        .map_err(|e| {
                            crate::domain::FactoryError::InvalidTask(format!(
                                "corrupt snapshot for {path}: {e}"
                            ))
                        })?;
                    if let Some(parent) = abs.parent() {
                        std::fs::create_dir_all(parent)?;
                    }
                    std::fs::write(&abs, bytes)?;
                    applied.push(RollbackAction {
                        path: path.clone(),
                        action: "restore".to_string(),
                    });
                }
                None => {
                    // The run created this file; remove it.
                    if abs.exists() {
                        std::fs::remove_file(&abs)?;
                    }
                    applied.push(RollbackAction {
                        path: path.clone(),
                        action: "delete".to_string(),
                    });
                }
            }
        }

        let report = RollbackReport {
            schema_version: ROLLBACK_REPORT_SCHEMA.to_string(),
            task_id: task.id.clone(),
            job_id: job.id.clone(),
            applied,
            created_at: Utc::now(),
        };
        save_json_atomic(
            &self.paths.task_artifacts(&task.id).join("rollback_report.json"),
            &report,
            WriteMode::Strict,
        )?;
        info!(task_id = %task.id, files = report.applied.len(), "auto-rollback applied");
        Ok(Some(report))
    }

    // ---- DLQ ----------------------------------------------------------

    /// Open a DLQ entry for the task (chained `artifacts/dlq/dlq.jsonl`).
    pub fn open_dlq_for_task(
        &self,
        task: &Task,
        reason_code: &str,
        summary: String,
        missing_inputs: Vec<String>,
        last_event: Option<String>,
    ) -> Result<DlqEntry> {
        let (artifacts_root, report_md, selftest_log) =
            crate::artifacts::artifact_pointers(&task.id);
        let entry = DlqEntry {
            schema_version: DLQ_SCHEMA.to_string(),
            dlq_id: Uuid::new_v4().to_string(),
            task_id: task.id.clone(),
            created_at: Utc::now(),
            status: "OPEN".to_string(),
            reason_code: reason_code.to_string(),
            summary,
            missing_inputs,
            last_event,
            retry_history: vec![format!("dispatch_attempts={}", task.dispatch_attempts)],
            evidence: DlqEvidence {
                artifacts_root,
                report_md,
                selftest_log,
            },
        };
        let value = serde_json::to_value(&entry)?;
        append_jsonl_chained(&self.paths.dlq_file(), &value)?;
        warn!(task_id = %task.id, reason_code, "DLQ entry opened");
        Ok(entry)
    }

    // ---- retry plans --------------------------------------------------

    /// Derive and persist the retry plan for a failed attempt.
    pub fn write_retry_plan(
        &self,
        policy: &FactoryPolicy,
        task: &Task,
        event_type: EventType,
        reason: &str,
        notes: String,
    ) -> Result<RetryPlan> {
        let strategy = match event_type {
            EventType::PinsInsufficient | EventType::PreflightFailed => RetryStrategy::PinsFix,
            EventType::CiFailed | EventType::PolicyViolation => RetryStrategy::ShrinkRadius,
            EventType::ExecutorError | EventType::Timeout => RetryStrategy::SwitchExecutor,
            EventType::RetryExhausted => RetryStrategy::Dlq,
            _ => RetryStrategy::ShrinkRadius,
        };

        let max_attempts = policy.max_total_attempts();
        let budgets = policy.budgets();
        let plan = RetryPlan {
            schema_version: RETRY_PLAN_SCHEMA.to_string(),
            task_id: task.id.clone(),
            attempt: task.dispatch_attempts,
            max_attempts,
            route: RetryRoute {
                lane: policy.route_lane_for_event_type(event_type),
                next_role: match strategy {
                    RetryStrategy::PinsFix => Some("pinser".to_string()),
                    _ => None,
                },
                notes: format!("{reason}: {notes}"),
            },
            strategy,
            budgets: [
                (
                    "max_total_tokens_budget".to_string(),
                    budgets.max_total_tokens_budget,
                ),
                (
                    "max_total_verify_minutes".to_string(),
                    budgets.max_total_verify_minutes,
                ),
            ]
            .into_iter()
            .collect(),
            stop_conditions: vec![
                format!("dispatch_attempts >= {max_attempts}"),
                "budget_exhausted".to_string(),
            ],
            dlq_on_fail: true,
            created_at: Utc::now(),
        };
        save_json_atomic(
            &self.paths.task_artifacts(&task.id).join("retry_plan.json"),
            &plan,
            WriteMode::Strict,
        )?;
        Ok(plan)
    }
}

/// Common shape of a synthesized fixup task.
fn fixup_task(class_id: &str, role: &str, lane: Lane, title: String, source: &Task) -> Task {
    let mut task = Task::new_atomic(title, role);
    task.task_class_id = Some(class_id.to_string());
    task.lane = lane;
    task.status = TaskStatus::Ready;
    task.runner = RunnerKind::Internal;
    task.files = if source.files.is_empty() {
        vec!["docs/recovery_notes.md".to_string()]
    } else {
        source.files.clone()
    };
    task.allowed_tests = vec!["python -m pytest -q".to_string()];
    task.pins = source.pins.clone();
    task.pointers = Some(serde_json::json!({
        "source_task_id": source.id,
        "source_lane": source.lane.as_str(),
    }));
    task
}
