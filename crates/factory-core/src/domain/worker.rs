//! External worker registry model.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::task::ExecutorKind;

/// A registered external worker process.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Worker {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub executors: Vec<ExecutorKind>,
    #[serde(default)]
    pub models: Vec<String>,
    #[serde(rename = "startedAt")]
    pub started_at: DateTime<Utc>,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
    #[serde(
        rename = "runningJobId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub running_job_id: Option<String>,
}

impl Worker {
    pub fn new(name: impl Into<String>, executors: Vec<ExecutorKind>, models: Vec<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.into(),
            executors,
            models,
            started_at: now,
            last_seen: now,
            running_job_id: None,
        }
    }

    /// Registration identity: same name + executor set means the same worker.
    pub fn identity_key(name: &str, executors: &[ExecutorKind]) -> String {
        let mut names: Vec<&str> = executors.iter().map(|e| e.as_str()).collect();
        names.sort_unstable();
        format!("{name}|{}", names.join(","))
    }

    pub fn is_active(&self, now: DateTime<Utc>, active_window: Duration) -> bool {
        now - self.last_seen <= active_window
    }

    /// True when the worker can run the given model. An empty model set
    /// advertises support for anything.
    pub fn supports_model(&self, model: &str) -> bool {
        self.models.is_empty() || self.models.iter().any(|m| m == model)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identity_key_is_order_insensitive() {
        let a = Worker::identity_key("w1", &[ExecutorKind::Codex, ExecutorKind::Opencodecli]);
        let b = Worker::identity_key("w1", &[ExecutorKind::Opencodecli, ExecutorKind::Codex]);
        assert_eq!(a, b);

        let c = Worker::identity_key("w2", &[ExecutorKind::Codex]);
        assert_ne!(a, c);
    }

    #[test]
    fn test_activity_window() {
        let mut worker = Worker::new("w1", vec![ExecutorKind::Codex], vec![]);
        let now = Utc::now();
        assert!(worker.is_active(now, Duration::minutes(2)));

        worker.last_seen = now - Duration::minutes(5);
        assert!(!worker.is_active(now, Duration::minutes(2)));
    }

    #[test]
    fn test_empty_model_set_supports_any() {
        let worker = Worker::new("w1", vec![ExecutorKind::Opencodecli], vec![]);
        assert!(worker.supports_model("opencode/qwen3"));

        let picky = Worker::new(
            "w2",
            vec![ExecutorKind::Opencodecli],
            vec!["opencode/qwen3".to_string()],
        );
        assert!(picky.supports_model("opencode/qwen3"));
        assert!(!picky.supports_model("opencode/other"));
    }
}
