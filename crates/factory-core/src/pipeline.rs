//! The execution pipeline for a single job.
//!
//! Internal jobs run the executor in-process; external jobs arrive through
//! the worker Complete endpoint. Both paths converge on `finish_job`, the
//! one completion transaction: diff, artifacts, scope, gates, verdict,
//! health signals, recovery, ledger bump, state event.

use chrono::Utc;
use tracing::{error, info, warn};

use crate::artifacts::{compute_verdict, parse_unified_diff, VerdictInputs};
use crate::collab::ExecRequest;
use crate::domain::{
    reason, EventType, ExecutorKind, FactoryError, Job, JobStatus, PolicyViolation, Result,
    RunnerKind, StateEvent, Submit, Task, TaskStatus, Usage, Verdict,
};
use crate::hooks::FailureRecord;
use crate::recovery::PinsFixOutcome;
use crate::service::FactoryService;

/// Stdout markers for the executor output contract.
const SUBMIT_MARKER: &str = "SUBMIT:";
const USAGE_MARKER: &str = "USAGE:";
const PATCH_BEGIN: &str = "PATCH_BEGIN";
const PATCH_END: &str = "PATCH_END";

impl FactoryService {
    /// Run a queued internal job to completion.
    pub async fn run_internal_job(&self, job_id: &str) -> Result<Job> {
        let job = self.queue.mutate(job_id, |job| {
            if job.status != JobStatus::Queued {
                return Err(FactoryError::InvalidTransition(format!(
                    "job {} is not queued",
                    job.id
                )));
            }
            job.status = JobStatus::Running;
            job.started_at = Some(Utc::now());
            job.attempts += 1;
            Ok(())
        })?;

        let timeout_ms = job
            .task_id
            .as_deref()
            .and_then(|id| self.board.get_task(id).ok())
            .and_then(|t| t.timeout_ms)
            .unwrap_or(self.config.default_job_timeout_ms);

        // Executor invocation with the deterministic codex model fallback.
        let mut model = job.model.clone();
        let outcome = loop {
            let outcome = self
                .collab
                .executor
                .run(&ExecRequest {
                    executor: job.executor,
                    model: model.clone(),
                    prompt: job.prompt.clone(),
                    timeout_ms,
                })
                .await;

            let unsupported = job.executor == ExecutorKind::Codex
                && (outcome.stderr.to_lowercase().contains("unsupported")
                    || outcome
                        .error
                        .as_deref()
                        .map(|e| e.to_lowercase().contains("unsupported"))
                        .unwrap_or(false));
            if unsupported {
                if let Some(next) = self.router.next_codex_fallback(&model) {
                    info!(job_id = %job.id, from = %model, to = %next, "codex model fallback");
                    model = next;
                    continue;
                }
            }
            break outcome;
        };

        let (submit, usage, patch) = parse_stdout_artifacts(&outcome.stdout);
        let job = self.queue.mutate(job_id, |job| {
            job.model_effective = Some(model.clone());
            job.stdout = outcome.stdout.clone();
            job.stderr = outcome.stderr.clone();
            job.exit_code = outcome.exit_code;
            job.usage = usage;
            if let Some(patch_text) = &patch {
                job.patch_stats = Some(parse_unified_diff(patch_text));
            }
            if let Some(submit) = submit.clone() {
                job.submit = Some(submit);
            }
            if outcome.timed_out {
                job.reason = Some(reason::TIMEOUT.to_string());
                job.exit_code = Some(124);
            } else if let Some(err) = &outcome.error {
                job.reason = Some(if err.contains("missing_binary") {
                    reason::MISSING_BINARY.to_string()
                } else {
                    reason::TOOLING_ERROR.to_string()
                });
                job.error = Some(err.clone());
            }
            Ok(())
        })?;

        self.finish_job(job).await
    }

    /// The completion transaction. The job must be `running` (or already
    /// failed closed by the worker service).
    pub async fn finish_job(&self, job: Job) -> Result<Job> {
        match self.finish_job_inner(job.clone()).await {
            Ok(job) => Ok(job),
            Err(err) => {
                // Unknown pipeline exceptions fail the job, not the loop.
                error!(job_id = %job.id, %err, "pipeline exception");
                let failed = self.queue.mutate(&job.id, |j| {
                    j.status = JobStatus::Failed;
                    j.reason = Some(reason::EXCEPTION.to_string());
                    j.error = Some(err.to_string());
                    j.finished_at = Some(Utc::now());
                    Ok(())
                })?;
                if let Some(task_id) = &failed.task_id {
                    let _ = self.board.set_status(task_id, TaskStatus::Failed);
                    let event = StateEvent::for_task(EventType::ExecutorError, task_id.clone())
                        .with_job(failed.id.clone())
                        .with_reason(reason::EXCEPTION);
                    let _ = self.events.emit(&event);
                }
                Ok(failed)
            }
        }
    }

    async fn finish_job_inner(&self, job: Job) -> Result<Job> {
        let Some(task_id) = job.task_id.clone() else {
            // Free-standing jobs just settle on their exit code.
            return self.queue.mutate(&job.id, |j| {
                j.status = if j.exit_code == Some(0) {
                    JobStatus::Done
                } else {
                    JobStatus::Failed
                };
                j.finished_at = Some(Utc::now());
                Ok(())
            });
        };
        let task = self.board.get_task(&task_id)?;

        // Fail-closed completions (attestation/identity) skip the gate
        // phase entirely; recovery still records the failure.
        if job.status == JobStatus::Failed && job.error.as_deref() == Some(reason::POLICY_VIOLATION)
        {
            return self.settle_policy_violation(task, job).await;
        }

        // Snapshot diff + touched files
        let snapshot_diff = job
            .pre_snapshot
            .as_ref()
            .map(|pre| crate::snapshot::diff_snapshot(self.paths.root(), pre));
        let touched = crate::artifacts::touched_files(&job, snapshot_diff.as_ref());

        // Deterministic artifacts (overwrite for untrusted external output)
        let overwrite = job.runner == RunnerKind::External;
        let submit = self.artifacts.ensure_artifacts(
            &job,
            &task,
            snapshot_diff.as_ref(),
            job.ci_gate.as_ref(),
            overwrite,
        )?;

        // Patch scope + submit-vs-diff consistency
        let pins = task.pins.clone().unwrap_or_default();
        let role_policy = self.roles.role(&task.role);
        let scope_violations =
            crate::scope::validate_patch_scope(&touched, job.patch_stats.as_ref(), &pins, role_policy);
        let submit_mismatch = submit_diff_mismatch(&submit, &touched);

        // Gates
        let ci_gate = self.collab.gates.run_ci_gate(&task, &job).await;
        let allowed_tests = if job.runner == RunnerKind::External {
            Some(self.collab.gates.run_allowed_tests(&task, &job).await)
        } else {
            None
        };
        let hygiene = self.artifacts.hygiene_check(&task.id);

        let mut policy_gate = self.collab.gates.run_policy_gate(&task, &job, &touched).await;
        if policy_gate.ran
            && !policy_gate.ok
            && task.ssot_auto_apply_count < self.config.ssot_auto_apply_max_per_task
        {
            // One bounded SSOT auto-apply pass, then re-run the gate.
            self.board.mutate(&task.id, |t| {
                t.ssot_auto_apply_count += 1;
                Ok(())
            })?;
            policy_gate = self.collab.gates.run_policy_gate(&task, &job, &touched).await;
        }

        // Verdict + trace
        let verdict = compute_verdict(
            &task,
            &VerdictInputs {
                submit: Some(&submit),
                ci_gate: Some(&ci_gate),
                policy_gate: Some(&policy_gate),
                scope_violations: &scope_violations,
                hygiene_problems: &hygiene,
                submit_mismatch: submit_mismatch.as_deref(),
            },
        );
        self.artifacts
            .write_verdict(&verdict, self.collab.validator.as_ref())?;
        self.artifacts.write_trace(&job, &task)?;

        // Persist the gate evidence and verdict onto the job
        let tests_failed = allowed_tests.as_ref().map(|t| t.ran && !t.ok).unwrap_or(false);
        let final_reason = if job.reason.is_some() {
            job.reason.clone()
        } else if !scope_violations.is_empty() {
            Some(reason::PATCH_SCOPE_VIOLATION.to_string())
        } else if submit_mismatch.is_some() {
            Some(reason::SUBMIT_MISMATCH.to_string())
        } else if ci_gate.required && ci_gate.timed_out {
            Some(reason::CI_TIMED_OUT.to_string())
        } else if ci_gate.required && ci_gate.ran && !ci_gate.ok {
            Some(reason::CI_FAILED.to_string())
        } else if policy_gate.ran && !policy_gate.ok {
            Some(reason::POLICY_GATE_FAILED.to_string())
        } else if tests_failed {
            Some(reason::TEST_COMMAND_MISSING.to_string())
        } else if !hygiene.is_empty() {
            Some(reason::HYGIENE_FAILED.to_string())
        } else if submit.status == crate::domain::SubmitStatus::Failed {
            Some(if submit.reason_code.is_empty() {
                "executor_error".to_string()
            } else {
                submit.reason_code.clone()
            })
        } else {
            None
        };

        let passed = matches!(verdict.verdict, Verdict::Pass | Verdict::Escalate)
            && final_reason.is_none()
            && !tests_failed;

        let policy_violation_records: Vec<PolicyViolation> = scope_violations
            .iter()
            .map(|v| PolicyViolation {
                code: v.code.as_str().to_string(),
                detail: v.detail.clone(),
            })
            .collect();

        if !passed {
            if let Some(code) = &final_reason {
                self.artifacts.mark_submit_failed(&task.id, code)?;
            }
        }

        let job = self.queue.mutate(&job.id, |j| {
            j.snapshot_diff = snapshot_diff.clone();
            j.submit = Some(submit.clone());
            j.ci_gate = Some(ci_gate.clone());
            j.policy_gate = Some(policy_gate.clone());
            j.allowed_tests = allowed_tests.clone();
            j.verdict = Some(verdict.clone());
            j.policy_violations.extend(policy_violation_records.clone());
            j.reason = final_reason.clone();
            j.status = if passed {
                JobStatus::Done
            } else {
                JobStatus::Failed
            };
            j.finished_at = Some(Utc::now());
            Ok(())
        })?;

        // Event typing
        let event_type = if passed {
            if verdict.verdict == Verdict::Escalate {
                EventType::NeedsInput
            } else {
                EventType::Success
            }
        } else if !scope_violations.is_empty() || submit_mismatch.is_some() {
            EventType::PolicyViolation
        } else if job.reason.as_deref() == Some(reason::TIMEOUT) {
            EventType::Timeout
        } else if ci_gate.required && ci_gate.ran && !ci_gate.ok {
            EventType::CiFailed
        } else if policy_gate.ran && !policy_gate.ok {
            EventType::PolicyViolation
        } else if verdict.verdict == Verdict::Escalate && final_reason.is_none() {
            EventType::NeedsInput
        } else {
            EventType::ExecutorError
        };

        self.apply_signals_and_recover(&task, &job, event_type, &touched, &ci_gate)
            .await?;
        Ok(self.queue.get(&job.id)?)
    }

    /// Terminal handling for attestation/identity violations.
    async fn settle_policy_violation(&self, task: Task, job: Job) -> Result<Job> {
        // Artifacts still synthesized so the failure is auditable.
        let _ = self
            .artifacts
            .ensure_artifacts(&job, &task, None, None, true)?;
        let verdict = compute_verdict(
            &task,
            &VerdictInputs {
                submit: self.artifacts.read_submit(&task.id).as_ref(),
                ci_gate: None,
                policy_gate: None,
                scope_violations: &[],
                hygiene_problems: &[],
                submit_mismatch: None,
            },
        );
        self.artifacts
            .write_verdict(&verdict, self.collab.validator.as_ref())?;

        self.apply_signals_and_recover(&task, &job, EventType::PolicyViolation, &[], &Default::default())
            .await?;
        Ok(self.queue.get(&job.id)?)
    }

    /// Health/breaker/fuse signals, recovery tasks, ledger bump, task
    /// status, and the state event.
    async fn apply_signals_and_recover(
        &self,
        task: &Task,
        job: &Job,
        event_type: EventType,
        touched: &[String],
        ci_gate: &crate::domain::GateResult,
    ) -> Result<()> {
        let now = Utc::now();
        let policy = self.policy.current();
        // NeedsInput settles the task (operator escalation), it is not a
        // retryable failure.
        let passed = matches!(event_type, EventType::Success | EventType::NeedsInput);

        // Fuses
        if job.reason.as_deref() == Some(reason::TIMEOUT) {
            self.fuses.record_timeout(now);
        }
        if job.executor == ExecutorKind::Opencodecli
            && job.exit_code.unwrap_or(0) != 0
            && job.stdout.trim().is_empty()
        {
            self.fuses.record_occli_flake(now);
        }

        // Breakers + repo health
        let outcome = self
            .breakers
            .observe(&policy.circuit_breakers, event_type);
        for name in &outcome.tripped {
            let event = StateEvent::for_task(EventType::BreakerTripped, task.id.clone())
                .with_reason(name.clone());
            self.events.emit(&event)?;
        }
        if outcome.quarantine_entered {
            self.events
                .emit(&StateEvent::new(EventType::QuarantineEntered))?;
        }
        if !passed {
            self.repo_health.record_failure(now);
            self.hooks.record_failure(&FailureRecord {
                ts: now,
                reason: job.reason.clone().unwrap_or_else(|| "unknown".to_string()),
                taxonomy: event_type.as_str().to_string(),
                signature: job
                    .stderr
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .chars()
                    .take(120)
                    .collect(),
                role: task.role.clone(),
                task_class: task.task_class_id.clone().unwrap_or_default(),
                executor: job.executor.as_str().to_string(),
                lane: Some(task.lane),
                task_id: Some(task.id.clone()),
            });
        }

        // Recovery
        let fixup_fuse_blown = self
            .recovery
            .fixup_fuse_blown(self.queue.queued_count(), &self.config);
        match event_type {
            EventType::CiFailed => {
                // Docs-only auto-rollback first
                let full = self.artifacts.read_pre_snapshot_full(&task.id);
                if let Some(report) = self.recovery.apply_auto_rollback_on_ci_failed(
                    self.paths.root(),
                    task,
                    job,
                    touched,
                    full.as_ref(),
                    &self.config,
                )? {
                    let event = StateEvent::for_task(EventType::RollbackApplied, task.id.clone())
                        .with_job(job.id.clone())
                        .with_reason(format!("{} files", report.applied.len()));
                    self.events.emit(&event)?;
                }

                if !fixup_fuse_blown {
                    if let Some(fixup) =
                        self.recovery.maybe_create_ci_fixup_task(task, &self.config)
                    {
                        if self.board.create_task(fixup).is_ok() {
                            self.board.mutate(&task.id, |t| {
                                t.ci_fixup_count += 1;
                                Ok(())
                            })?;
                        }
                    }
                    // Typed gate fixups from the CI gate stderr log
                    let stderr_text = ci_gate
                        .stderr_path
                        .as_deref()
                        .and_then(|p| std::fs::read_to_string(self.paths.root().join(p)).ok())
                        .unwrap_or_default();
                    for fixup in self
                        .recovery
                        .maybe_create_ci_gate_fixup_tasks(task, &stderr_text)
                    {
                        let _ = self.board.create_task(fixup);
                    }
                }

                if let Some(hook_task) = self.hooks.check_feedback("ci_gate_result", "ok=false") {
                    let _ = self.board.create_task(hook_task);
                }
            }
            EventType::PolicyViolation if !fixup_fuse_blown => {
                let errors: Vec<String> = job
                    .policy_violations
                    .iter()
                    .map(|v| format!("{}: {}", v.code, v.detail))
                    .collect();
                let fixups =
                    self.recovery
                        .maybe_create_policy_fixup_tasks(task, &errors, &self.config);
                if !fixups.is_empty() {
                    self.board.mutate(&task.id, |t| {
                        t.policy_fixup_count += 1;
                        Ok(())
                    })?;
                    for fixup in fixups {
                        let _ = self.board.create_task(fixup);
                    }
                }
            }
            EventType::PinsInsufficient if !fixup_fuse_blown => {
                let outcome = self
                    .recovery
                    .maybe_create_pins_fixup_task(
                        task,
                        job.reason.as_deref().unwrap_or("pins_insufficient"),
                        &self.pins,
                        self.collab.map.as_ref(),
                        &self.config,
                    )
                    .await;
                match outcome {
                    PinsFixOutcome::AppliedMapFix { pins, map_hash } => {
                        self.artifacts.write_pins(&task.id, &pins)?;
                        self.board.mutate(&task.id, |t| {
                            t.pins = Some(pins.clone());
                            t.pins_map_hash = Some(map_hash.clone());
                            t.pins_requeue_count += 1;
                            Ok(())
                        })?;
                    }
                    PinsFixOutcome::CreateFixupTask(fixup) => {
                        if self.board.create_task(fixup).is_ok() {
                            self.board.mutate(&task.id, |t| {
                                t.pins_fixup_count += 1;
                                Ok(())
                            })?;
                        }
                    }
                    PinsFixOutcome::Skipped(_) => {}
                }
            }
            _ => {}
        }

        // Task status + retry plan
        let terminal_violation = matches!(event_type, EventType::PolicyViolation);
        if passed {
            self.board.set_status(&task.id, TaskStatus::Done)?;
        } else if terminal_violation {
            self.board.mutate(&task.id, |t| {
                t.status = TaskStatus::Failed;
                Ok(())
            })?;
            self.recovery.write_retry_plan(
                &policy,
                task,
                event_type,
                job.reason.as_deref().unwrap_or("policy_violation"),
                "terminal policy violation".to_string(),
            )?;
        } else {
            // Local-recoverable: back to ready for the bounded retry loop.
            self.board.mutate(&task.id, |t| {
                t.status = TaskStatus::Ready;
                if job.reason.as_deref() == Some(reason::TIMEOUT) {
                    t.timeout_retries += 1;
                } else {
                    t.tooling_retries += 1;
                    t.model_attempt += 1;
                }
                Ok(())
            })?;
            self.recovery.write_retry_plan(
                &policy,
                task,
                event_type,
                job.reason.as_deref().unwrap_or("executor_error"),
                "auto retry".to_string(),
            )?;
        }

        // Parent ledger bump
        if let Some(parent) = &task.parent_id {
            let usage = job.usage.unwrap_or(Usage {
                tokens_input: 0,
                tokens_output: 0,
                verify_minutes: 0,
            });
            self.board.bump_parent_progress(
                parent,
                event_type.as_str(),
                serde_json::json!({ "task_id": task.id, "job_id": job.id }),
                usage,
                None,
            )?;
        }

        // Audit cadence on completions
        if passed {
            let done = self.board.get_task(&task.id)?;
            if let Some(audit) = self
                .board
                .note_completion_for_audit(&done, self.config.audit_trigger_every_n)?
            {
                let _ = self.board.create_task(audit);
            }
        }

        // The state event, last: readers treating the log as authoritative
        // see fully settled state.
        let mut event = StateEvent::for_task(event_type, task.id.clone()).with_job(job.id.clone());
        event.reason = job.reason.clone();
        event.executor = Some(job.executor.as_str().to_string());
        event.model = Some(job.model_effective.clone().unwrap_or(job.model.clone()));
        event.area = task.area.clone();
        self.events.emit(&event)?;

        if !passed {
            warn!(task_id = %task.id, job_id = %job.id, event = event_type.as_str(), reason = ?job.reason, "job settled with failure");
        } else {
            info!(task_id = %task.id, job_id = %job.id, "job settled successfully");
        }
        Ok(())
    }
}

/// Parse the SUBMIT/USAGE/PATCH stdout contract.
pub fn parse_stdout_artifacts(stdout: &str) -> (Option<Submit>, Option<Usage>, Option<String>) {
    let mut submit = None;
    let mut usage = None;
    let mut patch_lines: Option<Vec<&str>> = None;
    let mut patch = None;

    for line in stdout.lines() {
        if let Some(rest) = line.strip_prefix(SUBMIT_MARKER) {
            submit = serde_json::from_str(rest.trim()).ok();
        } else if let Some(rest) = line.strip_prefix(USAGE_MARKER) {
            usage = serde_json::from_str(rest.trim()).ok();
        } else if line.trim() == PATCH_BEGIN {
            patch_lines = Some(Vec::new());
        } else if line.trim() == PATCH_END {
            if let Some(lines) = patch_lines.take() {
                patch = Some(lines.join("\n"));
            }
        } else if let Some(lines) = patch_lines.as_mut() {
            lines.push(line);
        }
    }
    (submit, usage, patch)
}

/// A trusted submit that claims files the diff never saw is inconsistent.
fn submit_diff_mismatch(submit: &Submit, touched: &[String]) -> Option<String> {
    let claimed: Vec<&String> = submit
        .changed_files
        .iter()
        .chain(submit.new_files.iter())
        .collect();
    let phantom: Vec<&&String> = claimed
        .iter()
        .filter(|path| !touched.contains(path))
        .collect();
    if phantom.is_empty() {
        None
    } else {
        Some(format!(
            "submit claims untouched files: {}",
            phantom
                .iter()
                .map(|p| p.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        ))
    }
}
