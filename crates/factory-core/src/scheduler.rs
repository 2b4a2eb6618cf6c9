//! The dispatch contract and the internal scheduler loop.
//!
//! `dispatch_task` walks the ordered rejection gauntlet; every typed
//! rejection emits a state event and a retry plan so nothing fails
//! silently. `tick` drives the internal runner, lease reaping, cooldown
//! release, and the stability hooks.

use std::collections::BTreeMap;

use chrono::{Duration, Utc};
use tracing::{info, warn};

use factory_state::save_json_atomic;

use crate::board::TaskPatch;
use crate::domain::{
    DispatchError, EventType, FactoryError, Job, JobStatus, JobTaskType, Lane, Result, RunnerKind,
    StateEvent, Task, TaskKind, TaskStatus, WipLimitKind,
};
use crate::policy::DegradationAction;
use crate::roles::is_patch_producing_role;
use crate::router::area_fail_rate;
use crate::service::FactoryService;

/// Task classes that may dispatch while quarantine is active.
const QUARANTINE_ALLOWED_CLASSES: &[&str] = &[
    "ci_fixup_v1",
    "pins_fixup_v1",
    "schema_fixup_v1",
    "retry_exhausted_v1",
];

/// Lanes that may dispatch while quarantine is active.
const QUARANTINE_ALLOWED_LANES: &[Lane] = &[Lane::Fastlane, Lane::Quarantine, Lane::Dlq];

/// Cooldown applied when stop-the-bleeding blocks a task, minutes.
const STOP_THE_BLEEDING_COOLDOWN_MINUTES: i64 = 10;

impl FactoryService {
    /// Current degradation signals for the policy matrix.
    pub fn degradation_signals(&self) -> BTreeMap<String, bool> {
        let policy = self.policy.current();
        let limits = policy.wip_limits();
        let queued = self.queue.queued_count();
        let now = Utc::now();

        let mut signals = BTreeMap::new();
        signals.insert("queue_overload".to_string(), queued > limits.total);
        signals.insert(
            "repo_unhealthy".to_string(),
            self.repo_health.is_unhealthy(now),
        );
        signals.insert(
            "quarantine_active".to_string(),
            self.breakers.quarantine_active(now).is_some(),
        );
        signals
    }

    fn degradation_action(&self) -> Option<DegradationAction> {
        self.policy
            .current()
            .compute_degradation_action(&self.degradation_signals())
    }

    /// The dispatch contract. Typed rejections emit a state event and a
    /// retry plan before surfacing.
    pub async fn dispatch_task(&self, task_id: &str) -> Result<Job> {
        match self.try_dispatch(task_id).await {
            Ok(job) => Ok(job),
            Err(FactoryError::Dispatch(err)) => {
                self.record_dispatch_rejection(task_id, &err);
                Err(FactoryError::Dispatch(err))
            }
            Err(other) => Err(other),
        }
    }

    async fn try_dispatch(&self, task_id: &str) -> Result<Job> {
        let task = self.board.get_task(task_id)?;
        let policy = self.policy.current();
        let now = Utc::now();

        // 1. Atomic and dispatchable
        if task.kind != TaskKind::Atomic
            || !matches!(task.status, TaskStatus::Ready | TaskStatus::Backlog)
        {
            return Err(DispatchError::NotDispatchable.into());
        }

        // 2. Pins generation not pending
        if task.pins_pending {
            return Err(DispatchError::PinsPending.into());
        }

        // 3. Budget governor over the root parent ledger
        if let Some(root) = self.board.root_parent_of(&task) {
            let (ledger, progress) = self.board.ensure_parent_ledgers(&root)?;
            let tokens = progress.usage.tokens_input + progress.usage.tokens_output;
            if tokens >= ledger.max_total_tokens_budget {
                return Err(
                    DispatchError::BudgetExhausted(format!("tokens {tokens} at cap")).into(),
                );
            }
            if progress.usage.verify_minutes >= ledger.max_total_verify_minutes {
                return Err(DispatchError::BudgetExhausted(format!(
                    "verify minutes {} at cap",
                    progress.usage.verify_minutes
                ))
                .into());
            }
        }

        // 4. Quarantine
        if let Some(reason) = self.breakers.quarantine_active(now) {
            let allowed = QUARANTINE_ALLOWED_LANES.contains(&task.lane)
                || task
                    .task_class_id
                    .as_deref()
                    .map(|c| QUARANTINE_ALLOWED_CLASSES.contains(&c))
                    .unwrap_or(false);
            if !allowed {
                return Err(DispatchError::Quarantined(reason).into());
            }
        }

        // 5. Stop-the-bleeding
        let action = self.degradation_action();
        if !policy.should_allow_under_stop_the_bleeding(action.as_ref(), &task) {
            self.board.mutate(&task.id, |t| {
                t.status = TaskStatus::Blocked;
                t.cooldown_until =
                    Some(now + Duration::minutes(STOP_THE_BLEEDING_COOLDOWN_MINUTES));
                Ok(())
            })?;
            return Err(DispatchError::StopTheBleeding.into());
        }

        // 6. Timeout fuse blocks external dispatch
        if task.runner == RunnerKind::External && self.fuses.timeout_fused(now) {
            return Err(DispatchError::TimeoutFused.into());
        }

        // 7. Role and skills
        self.roles.validate_task(&task)?;

        // 8. Real-test requirement for patch-producing roles
        if is_patch_producing_role(&task.role) {
            let has_real_test = task
                .allowed_tests
                .iter()
                .any(|t| !crate::preflight::is_selftest_command(t));
            if task.allowed_tests.is_empty() {
                return Err(DispatchError::MissingAllowedTests.into());
            }
            if !has_real_test {
                return Err(DispatchError::MissingRealTest.into());
            }
        }

        // 9. Idempotency
        if self.queue.open_job_for_task(&task.id).is_some() {
            return Err(DispatchError::AlreadyDispatched.into());
        }

        // 10. Retry budget
        let max_attempts = policy.max_total_attempts();
        if task.dispatch_attempts >= max_attempts {
            self.exhaust_retries(&task, max_attempts)?;
            return Err(DispatchError::RetryExhausted {
                attempts: task.dispatch_attempts,
                max: max_attempts,
            }
            .into());
        }

        // 11. Routing
        let running = self.queue.running();
        let executor = self
            .router
            .pick_executor(&task, &self.config, &self.fuses, &running)?;
        let recent = self.events.tail(500);
        let model = self
            .router
            .pick_model(&task, executor, &self.config, &recent)?;

        // 12. Quality gate by area fail rate
        if self.config.quality_gate_fail_rate > 0.0 {
            if let Some(area) = &task.area {
                let (rate, samples) = area_fail_rate(&recent, area);
                if samples >= self.config.quality_gate_min_samples
                    && rate >= self.config.quality_gate_fail_rate
                {
                    return Err(DispatchError::QualityGateBlocked { rate }.into());
                }
            }
        }

        // 13. Effective pins (Map-driven when absent)
        let pins = match self.pins.resolve(&task) {
            Ok(pins) => pins,
            Err(DispatchError::MissingPins) => {
                let Some((pins, map_hash)) = self
                    .pins
                    .auto_pins_from_map(self.collab.map.as_ref(), &task, vec![])
                    .await
                else {
                    return Err(DispatchError::MissingPins.into());
                };
                self.artifacts.write_pins(&task.id, &pins)?;
                self.board.mutate(&task.id, |t| {
                    t.pins = Some(pins.clone());
                    t.pins_map_hash = Some(map_hash.clone());
                    Ok(())
                })?;
                pins
            }
            Err(err) => return Err(err.into()),
        };

        // 14. Role policy must exist for scope validation
        let role_policy = self
            .roles
            .role(&task.role)
            .ok_or_else(|| DispatchError::MissingRolePolicy(task.role.clone()))?;

        // 15. Preflight (one auto-fix pass for test-only gaps)
        let mut task = self.board.get_task(&task.id)?;
        if self.config.preflight_gate_enabled {
            let repo_root = self.paths.root().to_path_buf();
            let mut result = crate::preflight::preflight(&repo_root, &task, &pins, Some(role_policy));
            if !result.pass && result.missing.only_tests() {
                let tier = self
                    .degradation_action()
                    .and_then(|a| a.verification_tier)
                    .unwrap_or_else(|| "smoke".to_string());
                if let Some(fixed) = self
                    .fixer
                    .auto_fix(
                        &repo_root,
                        &task,
                        &pins,
                        Some(role_policy),
                        self.collab.map.as_ref(),
                        &tier,
                    )
                    .await
                {
                    task = self.board.update_task(
                        &task.id,
                        TaskPatch {
                            allowed_tests: Some(fixed),
                            ..TaskPatch::default()
                        },
                    )?;
                    result =
                        crate::preflight::preflight(&repo_root, &task, &pins, Some(role_policy));
                }
            }
            self.artifacts.write_preflight(&task.id, &result)?;
            if !result.pass {
                return Err(DispatchError::PreflightFailed(format!(
                    "missing files={:?} tests={:?} write_scope={:?}",
                    result.missing.files, result.missing.tests, result.missing.write_scope
                ))
                .into());
            }
        }

        // 16. Pre-snapshot + Context Pack v1 binding
        let (snapshot, full) =
            crate::snapshot::capture_pre_snapshot(self.paths.root(), &task, &pins);
        if let Some(full) = &full {
            self.artifacts.write_pre_snapshot_full(&task.id, full)?;
        }

        let pack = match self.collab.renderer.render(&task, &pins).await {
            Ok(pack) => Some(pack),
            Err(err) if self.config.context_pack_v1_required => {
                return Err(DispatchError::ContextPackRender(err).into());
            }
            Err(err) => {
                warn!(task_id = %task.id, %err, "context pack render failed (not required)");
                None
            }
        };

        // 17. WIP backpressure for the picked lane + runner
        self.wip_check(task.lane, task.runner)?;

        // 18. Create and queue the job
        let priority = task
            .priority
            .unwrap_or_else(|| policy.lane_priority_score(task.lane));
        let mut job = Job::new(
            Some(task.id.clone()),
            build_prompt(pack.as_ref().map(|p| p.text.as_str()), &task),
            model,
            executor,
            JobTaskType::Atomic,
            task.runner,
            priority,
        );
        job.attestation_nonce = Some(crate::attestation::mint_nonce());
        job.pre_snapshot = Some(snapshot);

        if let Some(pack) = &pack {
            job.context_pack_v1_id = Some(pack.pack_id.clone());
            let preflight = self
                .artifacts
                .paths()
                .task_artifacts(&task.id)
                .join("preflight.json");
            let preflight_json: serde_json::Value = factory_state::load_json(&preflight)
                .ok()
                .flatten()
                .unwrap_or(serde_json::json!({ "pass": true }));

            save_json_atomic(
                &self.paths.rendered_pack_file(&pack.pack_id),
                &pack.json,
                factory_state::WriteMode::Strict,
            )
            .map_err(FactoryError::Store)?;
            crate::attestation::write_task_bundle(
                &self.paths,
                &pack.pack_id,
                &serde_json::json!({
                    "schema_version": "scc.task_bundle_manifest.v1",
                    "pack_id": pack.pack_id,
                    "task_id": task.id,
                    "files": ["pins.json", "preflight.json", "task.json"],
                }),
                &serde_json::to_value(&pins)?,
                &preflight_json,
                &serde_json::to_value(&task)?,
                None,
            )?;

            // Token-waste hook inspects every rendered pack.
            if let Some(hook_task) = self.hooks.check_token_cfo(pack) {
                let _ = self.board.create_task(hook_task);
            }
        }

        let job = self.queue.push(job)?;
        self.board.mutate(&task.id, |t| {
            t.status = TaskStatus::InProgress;
            t.dispatch_attempts += 1;
            t.last_job_id = Some(job.id.clone());
            Ok(())
        })?;

        info!(task_id = %task.id, job_id = %job.id, executor = executor.as_str(), model = %job.model, "task dispatched");
        Ok(job)
    }

    /// WIP backpressure: active jobs per runner + lane class against the
    /// degradation-adjusted limits.
    pub fn wip_check(&self, lane: Lane, runner: RunnerKind) -> std::result::Result<(), DispatchError> {
        let policy = self.policy.current();
        let limits =
            policy.apply_degradation_to_wip_limits(policy.wip_limits(), self.degradation_action().as_ref());

        let lane_of = |job: &Job| -> Lane {
            job.task_id
                .as_deref()
                .and_then(|id| self.board.get_task(id).ok())
                .map(|t| t.lane)
                .unwrap_or(Lane::Mainlane)
        };

        let open: Vec<Job> = self
            .queue
            .list()
            .into_iter()
            .filter(|j| j.is_open() && j.runner == runner)
            .collect();

        let total_cap = match runner {
            RunnerKind::External => limits.total_external,
            RunnerKind::Internal => limits.total_internal,
        };
        if open.len() >= total_cap {
            return Err(DispatchError::WipLimit(WipLimitKind::Total));
        }

        let batch = open.iter().filter(|j| lane_of(j) == Lane::Batchlane).count();
        let exec = open.len() - batch;
        if lane == Lane::Batchlane {
            let batch_cap = match runner {
                RunnerKind::External => limits.batch_external,
                RunnerKind::Internal => limits.batch_internal,
            };
            if batch >= batch_cap {
                return Err(DispatchError::WipLimit(WipLimitKind::Batch));
            }
        } else {
            let exec_cap = match runner {
                RunnerKind::External => limits.exec_external,
                RunnerKind::Internal => limits.exec_internal,
            };
            if exec >= exec_cap {
                return Err(DispatchError::WipLimit(WipLimitKind::Exec));
            }
        }
        Ok(())
    }

    /// Retry budget exhausted: terminal failure, DLQ (once), follow-up task.
    fn exhaust_retries(&self, task: &Task, max: u32) -> Result<()> {
        warn!(task_id = %task.id, attempts = task.dispatch_attempts, "retry budget exhausted");
        let policy = self.policy.current();

        self.board.mutate(&task.id, |t| {
            t.status = TaskStatus::Failed;
            t.lane = Lane::Dlq;
            Ok(())
        })?;

        if !task.dlq_opened {
            self.recovery.open_dlq_for_task(
                task,
                "RETRY_EXHAUSTED",
                format!("{} dispatch attempts used (max {max})", task.dispatch_attempts),
                vec![],
                Some(EventType::RetryExhausted.as_str().to_string()),
            )?;
            self.board.mutate(&task.id, |t| {
                t.dlq_opened = true;
                Ok(())
            })?;

            let mut followup = Task::new_atomic(
                format!("Investigate exhausted retries for {}", task.id),
                "architect",
            );
            followup.task_class_id = Some("retry_exhausted_v1".to_string());
            followup.status = TaskStatus::Ready;
            followup.lane = Lane::Dlq;
            followup.runner = RunnerKind::Internal;
            followup.files = vec!["docs/factory_notes.md".to_string()];
            followup.allowed_tests = vec!["python -m pytest -q".to_string()];
            followup.pointers = Some(serde_json::json!({ "source_task_id": task.id }));
            let _ = self.board.create_task(followup);
        }

        self.recovery.write_retry_plan(
            &policy,
            task,
            EventType::RetryExhausted,
            "retry_exhausted",
            "routing to DLQ".to_string(),
        )?;

        let mut event = StateEvent::for_task(EventType::RetryExhausted, task.id.clone())
            .with_reason("retry_exhausted");
        event.area = task.area.clone();
        self.events.emit(&event)?;
        Ok(())
    }

    fn record_dispatch_rejection(&self, task_id: &str, err: &DispatchError) {
        // Retry exhaustion already emitted its own richer event.
        if matches!(err, DispatchError::RetryExhausted { .. }) {
            return;
        }
        let event = StateEvent::for_task(EventType::DispatchRejected, task_id.to_string())
            .with_reason(err.code());
        let _ = self.events.emit(&event);

        if let Ok(task) = self.board.get_task(task_id) {
            let _ = self.recovery.write_retry_plan(
                &self.policy.current(),
                &task,
                EventType::DispatchRejected,
                err.code(),
                err.to_string(),
            );
            // Feedback hook for pins-class rejections
            if matches!(
                err.code(),
                "missing_pins" | "missing_pins_template" | "missing_contract"
            ) {
                if let Some(hook_task) = self.hooks.check_feedback("dispatch_rejected", err.code())
                {
                    let _ = self.board.create_task(hook_task);
                }
            }
        }
    }

    // ---- runloop ------------------------------------------------------

    /// One scheduler tick: reap leases, release cooldowns, run the next
    /// eligible internal job, fire stability hooks, prune workers.
    pub async fn tick(&self) -> Result<()> {
        let now = Utc::now();

        // Lease reaping
        let actions = self
            .queue
            .reap_expired_leases(now, self.config.auto_requeue_timeout_max)?;
        for (_action, event) in actions {
            self.fuses.record_timeout(now);
            self.events.emit(&event)?;
        }

        // Cooldown release: blocked -> ready when permitted
        let policy = self.policy.current();
        let action = self.degradation_action();
        for task in self.board.list() {
            if task.status == TaskStatus::Blocked
                && task.cooldown_until.map(|c| now >= c).unwrap_or(true)
                && policy.should_allow_under_stop_the_bleeding(action.as_ref(), &task)
            {
                let _ = self.board.set_status(&task.id, TaskStatus::Ready);
            }
        }

        // Internal runner: take the best queued internal job within WIP
        if let Some(job) = self.queue.next_internal() {
            let lane = job
                .task_id
                .as_deref()
                .and_then(|id| self.board.get_task(id).ok())
                .map(|t| t.lane)
                .unwrap_or(Lane::Mainlane);
            // The job is already counted in the open set; check against the
            // running share only.
            let running = self
                .queue
                .running()
                .into_iter()
                .filter(|j| j.runner == RunnerKind::Internal)
                .count();
            let limits = policy
                .apply_degradation_to_wip_limits(policy.wip_limits(), action.as_ref());
            let cap = if lane == Lane::Batchlane {
                limits.batch_internal
            } else {
                limits.exec_internal
            };
            if running < cap {
                self.run_internal_job(&job.id).await?;
            }
        }

        // Stability hook
        let queued_internal = self
            .queue
            .list()
            .iter()
            .filter(|j| j.status == JobStatus::Queued && j.runner == RunnerKind::Internal)
            .count();
        let limits = policy.wip_limits();
        let saturated = self.queue.running().len() >= limits.total;
        if let Some(hook_task) =
            self.hooks
                .check_stability(queued_internal, saturated, self.queue.queued_count())
        {
            let _ = self.board.create_task(hook_task);
        }

        // Periodic hygiene
        self.workers.prune_stale(now, &self.config)?;
        if let Some(hook_task) = self.hooks.check_learned_patterns() {
            let _ = self.board.create_task(hook_task);
        }
        if let Some(hook_task) = self.hooks.check_five_whys() {
            let _ = self.board.create_task(hook_task);
        }
        if let Some(hook_task) = self.hooks.run_instinct() {
            let _ = self.board.create_task(hook_task);
        }

        // Quarantine follow-up, age-gated
        if self.breakers.should_create_quarantine_task(now) {
            let mut followup = Task::new_atomic("Investigate quarantine trigger", "architect");
            followup.task_class_id = Some("schema_fixup_v1".to_string());
            followup.status = TaskStatus::Ready;
            followup.lane = Lane::Quarantine;
            followup.runner = RunnerKind::Internal;
            followup.files = vec!["docs/factory_notes.md".to_string()];
            followup.allowed_tests = vec!["python -m pytest -q".to_string()];
            let _ = self.board.create_task(followup);
        }

        Ok(())
    }
}

/// Injected prompt assembly: pack text ahead of the task prompt.
fn build_prompt(pack_text: Option<&str>, task: &Task) -> String {
    let task_prompt = if task.goal.is_empty() {
        task.title.clone()
    } else {
        format!("{}\n\n{}", task.title, task.goal)
    };
    match pack_text {
        Some(text) => format!("{text}\n\n{task_prompt}"),
        None => task_prompt,
    }
}
