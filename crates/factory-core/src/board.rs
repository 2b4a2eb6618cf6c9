//! The task board: CRUD, lifecycle transitions, parent ledgers, audit
//! cadence.
//!
//! The board is the single writer for tasks. All mutations go through it,
//! persist atomically to `board.json`, and readers get cloned snapshots.

use std::sync::{Arc, RwLock};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use factory_state::{
    append_jsonl, load_json, save_json_atomic, FactoryPaths, WriteMode,
};

use crate::domain::{
    ExecutorKind, FactoryError, Lane, Pins, PinsInstance, ProgressLedger, Result, RunnerKind,
    Task, TaskKind, TaskLedger, TaskStatus, Usage,
};
use crate::policy::PolicyStore;
use crate::preflight::is_selftest_command;
use crate::roles::RoleSystem;

/// Roles whose completions do not count toward the audit cadence.
const AUDIT_EXEMPT_ROLES: &[&str] = &["auditor", "status_review"];

/// Typed patch for `update_task`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskPatch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub goal: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files: Option<Vec<String>>,
    #[serde(rename = "allowedTests", default, skip_serializing_if = "Option::is_none")]
    pub allowed_tests: Option<Vec<String>>,
    #[serde(
        rename = "allowedExecutors",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub allowed_executors: Option<Vec<ExecutorKind>>,
    #[serde(rename = "allowedModels", default, skip_serializing_if = "Option::is_none")]
    pub allowed_models: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins: Option<Pins>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins_instance: Option<PinsInstance>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runner: Option<RunnerKind>,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins_pending: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct BoardMeta {
    #[serde(default)]
    audit_counter: u32,
    #[serde(default)]
    audited_done_ids: Vec<String>,
}

/// The task board.
pub struct Board {
    paths: FactoryPaths,
    roles: Arc<RoleSystem>,
    policy: Arc<PolicyStore>,
    tasks: RwLock<Vec<Task>>,
    meta: RwLock<BoardMeta>,
    stall_minutes: i64,
}

impl Board {
    /// Load the board from disk (empty when absent).
    pub fn load(
        paths: FactoryPaths,
        roles: Arc<RoleSystem>,
        policy: Arc<PolicyStore>,
    ) -> Result<Self> {
        let tasks: Vec<Task> = load_json(&paths.board_file())?.unwrap_or_default();
        let meta: BoardMeta = load_json(&paths.board_meta_file())?.unwrap_or_default();
        Ok(Self {
            paths,
            roles,
            policy,
            tasks: RwLock::new(tasks),
            meta: RwLock::new(meta),
            stall_minutes: 60,
        })
    }

    /// Override the ledger stall threshold (minutes).
    pub fn with_stall_minutes(mut self, minutes: i64) -> Self {
        self.stall_minutes = minutes.max(1);
        self
    }

    fn persist(&self, tasks: &[Task]) -> Result<()> {
        save_json_atomic(&self.paths.board_file(), &tasks, WriteMode::Strict)?;
        Ok(())
    }

    fn persist_meta(&self, meta: &BoardMeta) -> Result<()> {
        save_json_atomic(&self.paths.board_meta_file(), meta, WriteMode::BestEffort)?;
        Ok(())
    }

    // ---- queries ------------------------------------------------------

    pub fn list(&self) -> Vec<Task> {
        self.tasks.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get_task(&self, id: &str) -> Result<Task> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|t| t.id == id)
            .cloned()
            .ok_or_else(|| FactoryError::TaskNotFound(id.to_string()))
    }

    pub fn children_of(&self, parent_id: &str) -> Vec<Task> {
        self.tasks
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|t| t.parent_id.as_deref() == Some(parent_id))
            .cloned()
            .collect()
    }

    /// Walk up the parent chain to the root task id.
    pub fn root_parent_of(&self, task: &Task) -> Option<String> {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let mut current = task.parent_id.clone()?;
        loop {
            match tasks
                .iter()
                .find(|t| t.id == current)
                .and_then(|t| t.parent_id.clone())
            {
                Some(next) => current = next,
                None => return Some(current),
            }
        }
    }

    // ---- creation -----------------------------------------------------

    /// Validate and insert a new task. Populates the lane default when the
    /// payload carries none.
    pub fn create_task(&self, mut task: Task) -> Result<Task> {
        self.roles
            .validate_task(&task)
            .map_err(FactoryError::Dispatch)?;

        if task.kind == TaskKind::Atomic {
            if task.files.is_empty() {
                return Err(FactoryError::InvalidTask(
                    "atomic task requires non-empty files".to_string(),
                ));
            }
            let has_real_test = task
                .allowed_tests
                .iter()
                .any(|t| !is_selftest_command(t) && !t.trim().is_empty());
            if !has_real_test {
                return Err(FactoryError::InvalidTask(
                    "atomic task requires a non-selftest allowed test".to_string(),
                ));
            }
        }

        if let Some(pins) = &task.pins {
            if pins.allowed_paths.is_empty() {
                return Err(FactoryError::InvalidTask(
                    "pins require non-empty allowed_paths".to_string(),
                ));
            }
        }

        let policy = self.policy.current();
        if let Some(parent_id) = &task.parent_id {
            let budgets = policy.budgets();
            let parent = self.get_task(parent_id)?;

            let siblings = self.children_of(parent_id).len() as u32;
            if siblings >= budgets.max_children {
                return Err(FactoryError::InvalidTask(format!(
                    "parent {parent_id} at max_children={}",
                    budgets.max_children
                )));
            }

            let depth = self.depth_of(&parent) + 1;
            if depth > budgets.max_depth {
                return Err(FactoryError::InvalidTask(format!(
                    "depth {depth} exceeds max_depth={}",
                    budgets.max_depth
                )));
            }
        }

        // Lane default: explicit area mapping, else degradation preference.
        if task.lane == Lane::Mainlane {
            if let Some(area) = &task.area {
                if let Some(lane) = policy.area_lanes.get(area) {
                    task.lane = *lane;
                }
            }
        }

        task.created_at = Utc::now();
        task.updated_at = task.created_at;

        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        tasks.push(task.clone());
        self.persist(&tasks)?;
        info!(task_id = %task.id, role = %task.role, lane = task.lane.as_str(), "task created");
        Ok(task)
    }

    fn depth_of(&self, task: &Task) -> u32 {
        let tasks = self.tasks.read().unwrap_or_else(|p| p.into_inner());
        let mut depth = 0;
        let mut current = task.parent_id.clone();
        while let Some(id) = current {
            depth += 1;
            current = tasks
                .iter()
                .find(|t| t.id == id)
                .and_then(|t| t.parent_id.clone());
        }
        depth
    }

    // ---- mutation -----------------------------------------------------

    pub fn update_task(&self, id: &str, patch: TaskPatch) -> Result<Task> {
        self.mutate(id, |task| {
            if let Some(title) = patch.title.clone() {
                task.title = title;
            }
            if let Some(goal) = patch.goal.clone() {
                task.goal = goal;
            }
            if let Some(files) = patch.files.clone() {
                task.files = files;
            }
            if let Some(tests) = patch.allowed_tests.clone() {
                task.allowed_tests = tests;
            }
            if let Some(executors) = patch.allowed_executors.clone() {
                task.allowed_executors = executors;
            }
            if let Some(models) = patch.allowed_models.clone() {
                task.allowed_models = models;
            }
            if let Some(pins) = patch.pins.clone() {
                task.pins = Some(pins);
            }
            if let Some(instance) = patch.pins_instance.clone() {
                task.pins_instance = Some(instance);
            }
            if let Some(lane) = patch.lane {
                task.lane = lane;
            }
            if let Some(priority) = patch.priority {
                task.priority = Some(priority);
            }
            if let Some(area) = patch.area.clone() {
                task.area = Some(area);
            }
            if let Some(runner) = patch.runner {
                task.runner = runner;
            }
            if let Some(timeout) = patch.timeout_ms {
                task.timeout_ms = Some(timeout);
            }
            if let Some(pending) = patch.pins_pending {
                task.pins_pending = pending;
            }
            Ok(())
        })
    }

    /// Apply an arbitrary mutation under the board lock and persist.
    pub fn mutate<F>(&self, id: &str, mutate: F) -> Result<Task>
    where
        F: FnOnce(&mut Task) -> Result<()>,
    {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        let task = tasks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| FactoryError::TaskNotFound(id.to_string()))?;
        mutate(task)?;
        task.updated_at = Utc::now();
        let snapshot = task.clone();
        self.persist(&tasks)?;
        Ok(snapshot)
    }

    /// Transition with state-machine validation. `blocked -> ready` also
    /// requires the cooldown to have elapsed.
    pub fn set_status(&self, id: &str, status: TaskStatus) -> Result<Task> {
        self.mutate(id, |task| {
            if task.status == status {
                return Ok(());
            }
            if !task.status.can_transition_to(status) {
                return Err(FactoryError::InvalidTransition(format!(
                    "{:?} -> {:?} for task {id}",
                    task.status, status
                )));
            }
            if task.status == TaskStatus::Blocked && status == TaskStatus::Ready {
                if let Some(cooldown) = task.cooldown_until {
                    if Utc::now() < cooldown {
                        return Err(FactoryError::InvalidTransition(format!(
                            "task {id} cooling down until {cooldown}"
                        )));
                    }
                }
                task.cooldown_until = None;
            }
            task.status = status;
            Ok(())
        })
    }

    pub fn delete_task(&self, id: &str) -> Result<()> {
        let mut tasks = self.tasks.write().unwrap_or_else(|p| p.into_inner());
        let before = tasks.len();
        tasks.retain(|t| t.id != id);
        if tasks.len() == before {
            return Err(FactoryError::TaskNotFound(id.to_string()));
        }
        self.persist(&tasks)
    }

    // ---- parent ledgers -----------------------------------------------

    /// Create the parent's ledgers when missing.
    pub fn ensure_parent_ledgers(&self, parent_id: &str) -> Result<(TaskLedger, ProgressLedger)> {
        let dir = self.paths.task_artifacts(parent_id);
        let task_ledger_path = dir.join("task_ledger.json");
        let progress_ledger_path = dir.join("progress_ledger.json");

        let budgets = self.policy.current().budgets();
        let task_ledger: TaskLedger = match load_json(&task_ledger_path)? {
            Some(ledger) => ledger,
            None => {
                let ledger = TaskLedger {
                    parent_id: parent_id.to_string(),
                    max_total_attempts: budgets.max_total_attempts,
                    max_total_tokens_budget: budgets.max_total_tokens_budget,
                    max_total_verify_minutes: budgets.max_total_verify_minutes,
                    created_at: Utc::now(),
                };
                save_json_atomic(&task_ledger_path, &ledger, WriteMode::Strict)?;
                ledger
            }
        };

        let progress: ProgressLedger = match load_json(&progress_ledger_path)? {
            Some(ledger) => ledger,
            None => {
                let ledger = ProgressLedger::new(parent_id);
                save_json_atomic(&progress_ledger_path, &ledger, WriteMode::Strict)?;
                ledger
            }
        };

        Ok((task_ledger, progress))
    }

    pub fn read_progress_ledger(&self, parent_id: &str) -> Option<ProgressLedger> {
        load_json(
            &self
                .paths
                .task_artifacts(parent_id)
                .join("progress_ledger.json"),
        )
        .ok()
        .flatten()
    }

    /// Update the parent ledgers after a child state event.
    pub fn bump_parent_progress(
        &self,
        parent_id: &str,
        event_type: &str,
        details: serde_json::Value,
        usage_delta: Usage,
        stall_reason: Option<String>,
    ) -> Result<ProgressLedger> {
        let (_, mut progress) = self.ensure_parent_ledgers(parent_id)?;
        let now = Utc::now();

        progress.set_counts(self.children_of(parent_id).iter().map(|t| t.status));
        progress.record_progress(usage_delta, now);

        progress.check_stall(now, self.stall_minutes, stall_reason);

        let dir = self.paths.task_artifacts(parent_id);
        save_json_atomic(
            &dir.join("progress_ledger.json"),
            &progress,
            WriteMode::Strict,
        )?;
        append_jsonl(
            &dir.join("progress_events.jsonl"),
            &serde_json::json!({
                "ts": now,
                "type": event_type,
                "details": details,
            }),
        )?;
        Ok(progress)
    }

    // ---- audit cadence ------------------------------------------------

    /// Count a completion toward the audit cadence. Returns the audit task
    /// to create when the trigger fires.
    pub fn note_completion_for_audit(
        &self,
        task: &Task,
        trigger_every_n: u32,
    ) -> Result<Option<Task>> {
        if task.kind != TaskKind::Atomic
            || task.status != TaskStatus::Done
            || AUDIT_EXEMPT_ROLES.contains(&task.role.as_str())
        {
            return Ok(None);
        }

        let mut meta = self.meta.write().unwrap_or_else(|p| p.into_inner());
        meta.audit_counter += 1;
        meta.audited_done_ids.push(task.id.clone());

        if meta.audit_counter < trigger_every_n.max(1) {
            self.persist_meta(&meta)?;
            return Ok(None);
        }

        let window: Vec<String> = std::mem::take(&mut meta.audited_done_ids);
        meta.audit_counter = 0;
        self.persist_meta(&meta)?;
        drop(meta);

        let mut audit = Task::new_atomic(
            format!("Status review over {} completed tasks", window.len()),
            "status_review",
        );
        audit.task_class_id = Some("status_review_audit_v1".to_string());
        audit.status = TaskStatus::Ready;
        audit.lane = Lane::Batchlane;
        audit.runner = RunnerKind::Internal;
        audit.files = vec!["docs/status_review.md".to_string()];
        audit.allowed_tests = vec!["python -m pytest -q".to_string()];
        audit.pointers = Some(serde_json::json!({ "audited_tasks": window }));
        Ok(Some(audit))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::roles::{RolePolicySpec, ScopeRules};
    use std::collections::BTreeMap;
    use tempfile::tempdir;

    fn board() -> (Board, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let mut roles = BTreeMap::new();
        for role in ["engineer", "designer", "status_review", "auditor"] {
            roles.insert(
                role.to_string(),
                RolePolicySpec {
                    read: ScopeRules::default(),
                    write: ScopeRules::default(),
                },
            );
        }
        let system = RoleSystem::from_specs(roles, BTreeMap::new(), vec![]).expect("roles");
        let board = Board::load(
            FactoryPaths::new(dir.path()),
            Arc::new(system),
            Arc::new(PolicyStore::new(dir.path().join("factory_policy.json"))),
        )
        .expect("load");
        (board, dir)
    }

    fn atomic_task() -> Task {
        let mut task = Task::new_atomic("fix", "engineer");
        task.files = vec!["src/a.ts".to_string()];
        task.allowed_tests = vec!["npm test tests/a.test.ts".to_string()];
        task
    }

    #[test]
    fn test_create_and_reload_roundtrip() {
        let (board, dir) = board();
        let created = board.create_task(atomic_task()).expect("create");

        // A fresh board instance sees the persisted task
        let reloaded = Board::load(
            FactoryPaths::new(dir.path()),
            Arc::new(
                RoleSystem::from_specs(
                    {
                        let mut m = BTreeMap::new();
                        m.insert("engineer".to_string(), RolePolicySpec::default());
                        m
                    },
                    BTreeMap::new(),
                    vec![],
                )
                .expect("roles"),
            ),
            Arc::new(PolicyStore::new(dir.path().join("factory_policy.json"))),
        )
        .expect("reload");
        assert_eq!(reloaded.get_task(&created.id).expect("get").id, created.id);
    }

    #[test]
    fn test_atomic_invariants_enforced() {
        let (board, _dir) = board();

        let mut no_files = atomic_task();
        no_files.files.clear();
        assert!(board.create_task(no_files).is_err());

        let mut selftest_only = atomic_task();
        selftest_only.allowed_tests =
            vec!["python scc-top/tools/scc/ops/task_selftest.py".to_string()];
        assert!(board.create_task(selftest_only).is_err());

        let mut empty_pins = atomic_task();
        empty_pins.pins = Some(Pins::default());
        assert!(board.create_task(empty_pins).is_err());
    }

    #[test]
    fn test_unknown_role_rejected() {
        let (board, _dir) = board();
        let mut task = atomic_task();
        task.role = "ghost".to_string();
        assert!(board.create_task(task).is_err());
    }

    #[test]
    fn test_status_transitions_validated() {
        let (board, _dir) = board();
        let task = board.create_task(atomic_task()).expect("create");

        board.set_status(&task.id, TaskStatus::Ready).expect("ready");
        board
            .set_status(&task.id, TaskStatus::InProgress)
            .expect("in_progress");
        board.set_status(&task.id, TaskStatus::Done).expect("done");

        assert!(board.set_status(&task.id, TaskStatus::Ready).is_err());
    }

    #[test]
    fn test_blocked_respects_cooldown() {
        let (board, _dir) = board();
        let task = board.create_task(atomic_task()).expect("create");
        board.set_status(&task.id, TaskStatus::Ready).expect("ready");
        board
            .set_status(&task.id, TaskStatus::Blocked)
            .expect("blocked");

        board
            .mutate(&task.id, |t| {
                t.cooldown_until = Some(Utc::now() + chrono::Duration::minutes(10));
                Ok(())
            })
            .expect("cooldown");
        assert!(board.set_status(&task.id, TaskStatus::Ready).is_err());

        board
            .mutate(&task.id, |t| {
                t.cooldown_until = Some(Utc::now() - chrono::Duration::minutes(1));
                Ok(())
            })
            .expect("cooldown");
        let ready = board.set_status(&task.id, TaskStatus::Ready).expect("ready");
        assert!(ready.cooldown_until.is_none());
    }

    #[test]
    fn test_max_children_budget() {
        let (board, _dir) = board();
        let mut parent = Task::new_atomic("parent", "designer");
        parent.kind = TaskKind::Parent;
        let parent = board.create_task(parent).expect("parent");

        for i in 0..12 {
            let mut child = atomic_task();
            child.title = format!("child {i}");
            child.parent_id = Some(parent.id.clone());
            board.create_task(child).expect("child");
        }

        let mut overflow = atomic_task();
        overflow.parent_id = Some(parent.id.clone());
        assert!(board.create_task(overflow).is_err());
    }

    #[test]
    fn test_parent_ledger_counts_children() {
        let (board, _dir) = board();
        let mut parent = Task::new_atomic("parent", "designer");
        parent.kind = TaskKind::Parent;
        let parent = board.create_task(parent).expect("parent");

        let mut child = atomic_task();
        child.parent_id = Some(parent.id.clone());
        let child = board.create_task(child).expect("child");
        board.set_status(&child.id, TaskStatus::Ready).expect("ready");

        let progress = board
            .bump_parent_progress(
                &parent.id,
                "SUCCESS",
                serde_json::json!({}),
                Usage {
                    tokens_input: 10,
                    tokens_output: 5,
                    verify_minutes: 1,
                },
                None,
            )
            .expect("bump");

        assert_eq!(progress.count_of(TaskStatus::Ready), 1);
        assert_eq!(progress.usage.tokens_input, 10);
        assert!(!progress.stalled);
    }

    #[test]
    fn test_audit_trigger_every_n() {
        let (board, _dir) = board();
        let mut audit_task = None;
        for i in 0..10 {
            let mut done = atomic_task();
            done.title = format!("done {i}");
            done.status = TaskStatus::Done;
            audit_task = board
                .note_completion_for_audit(&done, 10)
                .expect("note");
            if i < 9 {
                assert!(audit_task.is_none());
            }
        }
        let audit = audit_task.expect("audit task after 10 completions");
        assert_eq!(audit.task_class_id.as_deref(), Some("status_review_audit_v1"));
        assert_eq!(audit.role, "status_review");
    }

    #[test]
    fn test_audit_skips_exempt_roles() {
        let (board, _dir) = board();
        let mut done = atomic_task();
        done.role = "auditor".to_string();
        done.status = TaskStatus::Done;
        for _ in 0..20 {
            assert!(board
                .note_completion_for_audit(&done, 10)
                .expect("note")
                .is_none());
        }
    }
}
