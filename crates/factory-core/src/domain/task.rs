//! Board task model: parent/atomic tasks, lanes, lifecycle.
//!
//! Field names follow the on-disk board format of the original gateway,
//! which mixes camelCase and snake_case; serde renames preserve wire
//! compatibility while the Rust side stays snake_case.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Task kind: composite parents are split into atomic leaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    Parent,
    Atomic,
}

/// Task lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Backlog,
    Ready,
    InProgress,
    Done,
    Failed,
    NeedsSplit,
    Blocked,
}

impl TaskStatus {
    /// Legal forward transitions of the task state machine.
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Backlog, Ready)
                | (Ready, InProgress)
                | (Ready, Blocked)
                | (InProgress, Done)
                | (InProgress, Failed)
                | (InProgress, NeedsSplit)
                | (InProgress, Blocked)
                | (InProgress, Ready)
                | (Failed, Ready)
                | (Blocked, Ready)
                | (NeedsSplit, Ready)
        )
    }
}

/// Scheduling lane with distinct priority and WIP share.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    Fastlane,
    Mainlane,
    Batchlane,
    Dlq,
    Quarantine,
}

impl Lane {
    pub fn as_str(self) -> &'static str {
        match self {
            Lane::Fastlane => "fastlane",
            Lane::Mainlane => "mainlane",
            Lane::Batchlane => "batchlane",
            Lane::Dlq => "dlq",
            Lane::Quarantine => "quarantine",
        }
    }
}

/// External executor CLI family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorKind {
    /// Strong/paid model CLI.
    Codex,
    /// Free/open-model CLI.
    Opencodecli,
}

impl ExecutorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutorKind::Codex => "codex",
            ExecutorKind::Opencodecli => "opencodecli",
        }
    }
}

/// Where a job for this task executes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunnerKind {
    Internal,
    External,
}

/// Inclusive line window inside a pinned file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LineWindow {
    pub start: u32,
    pub end: u32,
}

/// Effective pins: the allow/deny footprint bounding an atomic task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Pins {
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub forbidden_paths: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub line_windows: BTreeMap<String, Vec<LineWindow>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loc: Option<u32>,
    #[serde(default)]
    pub ssot_assumptions: Vec<String>,
}

/// Per-instance pins deltas merged over a task-class template.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PinsInstance {
    #[serde(default)]
    pub allowed_paths_add: Vec<String>,
    #[serde(default)]
    pub forbidden_paths_add: Vec<String>,
    #[serde(default)]
    pub symbols_add: Vec<String>,
    /// Full override when present (not additive).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub line_windows: Option<BTreeMap<String, Vec<LineWindow>>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_files: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_loc: Option<u32>,
    #[serde(default)]
    pub ssot_assumptions: Vec<String>,
}

/// A board task. Atomic tasks are the unit of dispatch; parents are split
/// by a designer run into atomic children.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub kind: TaskKind,
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(rename = "parentId", default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    pub status: TaskStatus,
    pub role: String,
    pub lane: Lane,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<i64>,
    #[serde(rename = "allowedExecutors", default)]
    pub allowed_executors: Vec<ExecutorKind>,
    #[serde(rename = "allowedModels", default)]
    pub allowed_models: Vec<String>,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub skills: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins: Option<Pins>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins_instance: Option<PinsInstance>,
    #[serde(default)]
    pub pins_pending: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins_target_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub contract: Option<String>,
    #[serde(default)]
    pub assumptions: Vec<String>,
    #[serde(rename = "allowedTests", default)]
    pub allowed_tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_class_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_class_candidate: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_class_params: Option<serde_json::Value>,
    pub runner: RunnerKind,
    #[serde(rename = "timeoutMs", default, skip_serializing_if = "Option::is_none")]
    pub timeout_ms: Option<u64>,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "updatedAt")]
    pub updated_at: DateTime<Utc>,
    #[serde(rename = "lastJobId", default, skip_serializing_if = "Option::is_none")]
    pub last_job_id: Option<String>,
    #[serde(rename = "splitJobId", default, skip_serializing_if = "Option::is_none")]
    pub split_job_id: Option<String>,
    #[serde(default)]
    pub dispatch_attempts: u32,
    #[serde(rename = "timeoutRetries", default)]
    pub timeout_retries: u32,
    #[serde(rename = "toolingRetries", default)]
    pub tooling_retries: u32,
    #[serde(rename = "modelAttempt", default)]
    pub model_attempt: u32,
    #[serde(default)]
    pub ci_fixup_count: u32,
    #[serde(default)]
    pub pins_fixup_count: u32,
    #[serde(default)]
    pub policy_fixup_count: u32,
    #[serde(default)]
    pub pins_requeue_count: u32,
    #[serde(default)]
    pub ci_requeue_count: u32,
    #[serde(default)]
    pub policy_requeue_count: u32,
    #[serde(default)]
    pub ssot_auto_apply_count: u32,
    #[serde(default)]
    pub dlq_opened: bool,
    #[serde(
        rename = "cooldownUntil",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub cooldown_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pointers: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins_map_hash: Option<String>,
}

impl Task {
    /// A blank atomic task in `backlog` with fresh timestamps.
    pub fn new_atomic(title: impl Into<String>, role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            kind: TaskKind::Atomic,
            title: title.into(),
            goal: String::new(),
            parent_id: None,
            status: TaskStatus::Backlog,
            role: role.into(),
            lane: Lane::Mainlane,
            priority: None,
            allowed_executors: vec![ExecutorKind::Codex, ExecutorKind::Opencodecli],
            allowed_models: Vec::new(),
            files: Vec::new(),
            skills: Vec::new(),
            pins: None,
            pins_instance: None,
            pins_pending: false,
            pins_target_id: None,
            contract: None,
            assumptions: Vec::new(),
            allowed_tests: Vec::new(),
            area: None,
            task_class_id: None,
            task_class_candidate: None,
            task_class_params: None,
            runner: RunnerKind::Internal,
            timeout_ms: None,
            created_at: now,
            updated_at: now,
            last_job_id: None,
            split_job_id: None,
            dispatch_attempts: 0,
            timeout_retries: 0,
            tooling_retries: 0,
            model_attempt: 0,
            ci_fixup_count: 0,
            pins_fixup_count: 0,
            policy_fixup_count: 0,
            pins_requeue_count: 0,
            ci_requeue_count: 0,
            policy_requeue_count: 0,
            ssot_auto_apply_count: 0,
            dlq_opened: false,
            cooldown_until: None,
            pointers: None,
            prompt_ref: None,
            pins_map_hash: None,
        }
    }

    /// True when every file and pin allow-path lives under `docs/`.
    pub fn is_docs_only(&self) -> bool {
        let under_docs = |p: &String| p == "docs" || p.starts_with("docs/");
        let files_ok = !self.files.is_empty() && self.files.iter().all(under_docs);
        match &self.pins {
            Some(pins) => {
                files_ok
                    && !pins.allowed_paths.is_empty()
                    && pins.allowed_paths.iter().all(under_docs)
            }
            None => files_ok,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_transitions() {
        assert!(TaskStatus::Backlog.can_transition_to(TaskStatus::Ready));
        assert!(TaskStatus::Ready.can_transition_to(TaskStatus::InProgress));
        assert!(TaskStatus::InProgress.can_transition_to(TaskStatus::Done));
        assert!(TaskStatus::Blocked.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Done.can_transition_to(TaskStatus::Ready));
        assert!(!TaskStatus::Backlog.can_transition_to(TaskStatus::Done));
    }

    #[test]
    fn test_task_serde_wire_names() {
        let task = Task::new_atomic("fix parser", "engineer");
        let json = serde_json::to_value(&task).expect("serialize");
        assert!(json.get("allowedExecutors").is_some());
        assert!(json.get("allowedTests").is_some());
        assert!(json.get("createdAt").is_some());
        assert!(json.get("allowed_executors").is_none());

        let back: Task = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, task);
    }

    #[test]
    fn test_docs_only_detection() {
        let mut task = Task::new_atomic("docs touch", "doc");
        task.files = vec!["docs/README.md".to_string()];
        assert!(task.is_docs_only());

        task.pins = Some(Pins {
            allowed_paths: vec!["docs/adr/0001.md".to_string()],
            ..Pins::default()
        });
        assert!(task.is_docs_only());

        task.files.push("src/main.rs".to_string());
        assert!(!task.is_docs_only());
    }

    #[test]
    fn test_docs_only_requires_nonempty_files() {
        let task = Task::new_atomic("empty", "doc");
        assert!(!task.is_docs_only());
    }
}
