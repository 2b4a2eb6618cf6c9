//! Parent task ledgers: budgets, child counts, usage, stall tracking.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::records::Usage;
use super::task::TaskStatus;

/// Budget caps for a parent task tree (`task_ledger.json`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskLedger {
    pub parent_id: String,
    pub max_total_attempts: u32,
    pub max_total_tokens_budget: u64,
    pub max_total_verify_minutes: u64,
    pub created_at: DateTime<Utc>,
}

/// Rolling progress over a parent's children (`progress_ledger.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressLedger {
    pub parent_id: String,
    /// status name -> count of children currently in that status.
    #[serde(default)]
    pub counts: BTreeMap<String, u32>,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub usage: Usage,
    pub last_progress_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stall_reason: Option<String>,
    #[serde(default)]
    pub stalled: bool,
    pub updated_at: DateTime<Utc>,
}

impl ProgressLedger {
    pub fn new(parent_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            parent_id: parent_id.into(),
            counts: BTreeMap::new(),
            attempts: 0,
            usage: Usage::default(),
            last_progress_at: now,
            stall_reason: None,
            stalled: false,
            updated_at: now,
        }
    }

    /// Recompute child status counts from the board.
    pub fn set_counts(&mut self, statuses: impl IntoIterator<Item = TaskStatus>) {
        self.counts.clear();
        for status in statuses {
            let key = serde_json::to_value(status)
                .ok()
                .and_then(|v| v.as_str().map(str::to_string))
                .unwrap_or_default();
            *self.counts.entry(key).or_insert(0) += 1;
        }
    }

    pub fn count_of(&self, status: TaskStatus) -> u32 {
        serde_json::to_value(status)
            .ok()
            .and_then(|v| v.as_str().map(str::to_string))
            .and_then(|key| self.counts.get(&key).copied())
            .unwrap_or(0)
    }

    /// Record progress: bump usage and reset the stall clock.
    pub fn record_progress(&mut self, usage_delta: Usage, now: DateTime<Utc>) {
        self.attempts = self.attempts.saturating_add(1);
        self.usage = self.usage.saturating_add(usage_delta);
        self.last_progress_at = now;
        self.stalled = false;
        self.stall_reason = None;
        self.updated_at = now;
    }

    /// Flag a stall when nothing moved for `stall_minutes`.
    pub fn check_stall(&mut self, now: DateTime<Utc>, stall_minutes: i64, reason: Option<String>) {
        let idle = now - self.last_progress_at;
        if idle.num_minutes() >= stall_minutes {
            self.stalled = true;
            self.stall_reason = reason.or_else(|| Some("no_progress".to_string()));
        }
        self.updated_at = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_counts_by_status() {
        let mut ledger = ProgressLedger::new("p1");
        ledger.set_counts([
            TaskStatus::Done,
            TaskStatus::Done,
            TaskStatus::Failed,
            TaskStatus::Ready,
        ]);
        assert_eq!(ledger.count_of(TaskStatus::Done), 2);
        assert_eq!(ledger.count_of(TaskStatus::Failed), 1);
        assert_eq!(ledger.count_of(TaskStatus::Blocked), 0);
    }

    #[test]
    fn test_progress_resets_stall() {
        let mut ledger = ProgressLedger::new("p1");
        let now = Utc::now();
        ledger.last_progress_at = now - Duration::minutes(90);
        ledger.check_stall(now, 60, None);
        assert!(ledger.stalled);
        assert_eq!(ledger.stall_reason.as_deref(), Some("no_progress"));

        ledger.record_progress(
            Usage {
                tokens_input: 100,
                tokens_output: 50,
                verify_minutes: 1,
            },
            now,
        );
        assert!(!ledger.stalled);
        assert_eq!(ledger.attempts, 1);
        assert_eq!(ledger.usage.tokens_input, 100);
    }

    #[test]
    fn test_stall_under_threshold_not_flagged() {
        let mut ledger = ProgressLedger::new("p1");
        let now = Utc::now();
        ledger.last_progress_at = now - Duration::minutes(10);
        ledger.check_stall(now, 60, None);
        assert!(!ledger.stalled);
    }
}
