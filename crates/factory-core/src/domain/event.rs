//! State events: the append-only record of everything the gateway decides.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Event types consumed by routing tables, breakers, and hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventType {
    Success,
    CiFailed,
    PinsInsufficient,
    ExecutorError,
    PolicyViolation,
    PreflightFailed,
    RetryExhausted,
    RollbackApplied,
    DispatchRejected,
    JobLeaseExpired,
    JobRequeued,
    JobCancelled,
    QuarantineEntered,
    BreakerTripped,
    NeedsInput,
    Timeout,
}

impl EventType {
    pub fn as_str(self) -> &'static str {
        match self {
            EventType::Success => "SUCCESS",
            EventType::CiFailed => "CI_FAILED",
            EventType::PinsInsufficient => "PINS_INSUFFICIENT",
            EventType::ExecutorError => "EXECUTOR_ERROR",
            EventType::PolicyViolation => "POLICY_VIOLATION",
            EventType::PreflightFailed => "PREFLIGHT_FAILED",
            EventType::RetryExhausted => "RETRY_EXHAUSTED",
            EventType::RollbackApplied => "ROLLBACK_APPLIED",
            EventType::DispatchRejected => "DISPATCH_REJECTED",
            EventType::JobLeaseExpired => "JOB_LEASE_EXPIRED",
            EventType::JobRequeued => "JOB_REQUEUED",
            EventType::JobCancelled => "JOB_CANCELLED",
            EventType::QuarantineEntered => "QUARANTINE_ENTERED",
            EventType::BreakerTripped => "BREAKER_TRIPPED",
            EventType::NeedsInput => "NEEDS_INPUT",
            EventType::Timeout => "TIMEOUT",
        }
    }
}

/// One state event line. Written to the global `state_events.jsonl` and
/// mirrored into the task's `events.jsonl`, both hash-chained.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateEvent {
    pub ts: DateTime<Utc>,
    #[serde(rename = "type")]
    pub event_type: EventType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub executor: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    #[serde(default, skip_serializing_if = "serde_json::Value::is_null")]
    pub details: serde_json::Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
}

impl StateEvent {
    pub fn new(event_type: EventType) -> Self {
        Self {
            ts: Utc::now(),
            event_type,
            task_id: None,
            job_id: None,
            reason: None,
            executor: None,
            model: None,
            area: None,
            details: serde_json::Value::Null,
        }
    }

    pub fn for_task(event_type: EventType, task_id: impl Into<String>) -> Self {
        let mut event = Self::new(event_type);
        event.task_id = Some(task_id.into());
        event
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    pub fn with_job(mut self, job_id: impl Into<String>) -> Self {
        self.job_id = Some(job_id.into());
        self
    }
}
