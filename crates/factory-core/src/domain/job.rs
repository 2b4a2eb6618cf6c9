//! Job model: one queued/running executor invocation bound to a task.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::records::{
    AllowedTestsResult, ContextPackProof, GateResult, PatchStats, PolicyViolation, PreSnapshot,
    SnapshotDiff, Submit, Usage, VerdictRecord,
};
use super::task::{ExecutorKind, RunnerKind};

/// Job lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Running,
    Done,
    Failed,
}

/// What kind of work the job carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobTaskType {
    Atomic,
    Board,
    BoardSplit,
    PinsGenerate,
}

/// One executor invocation. Mutated only by the scheduler, the worker
/// service, and the execution pipeline inside a single completion
/// transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    #[serde(rename = "taskId", default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default)]
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prompt_ref: Option<String>,
    pub model: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model_effective: Option<String>,
    pub executor: ExecutorKind,
    #[serde(rename = "taskType")]
    pub task_type: JobTaskType,
    pub runner: RunnerKind,
    #[serde(rename = "workerId", default, skip_serializing_if = "Option::is_none")]
    pub worker_id: Option<String>,
    #[serde(rename = "leaseUntil", default, skip_serializing_if = "Option::is_none")]
    pub lease_until: Option<DateTime<Utc>>,
    pub status: JobStatus,
    #[serde(default)]
    pub attempts: u32,
    #[serde(default)]
    pub priority: i64,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "startedAt", default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(rename = "finishedAt", default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(rename = "lastUpdate", default, skip_serializing_if = "Option::is_none")]
    pub last_update: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default)]
    pub warned_long: bool,
    #[serde(
        rename = "contextPackId",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub context_pack_id: Option<String>,
    #[serde(
        rename = "contextPackV1Id",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub context_pack_v1_id: Option<String>,
    #[serde(
        rename = "attestationNonce",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub attestation_nonce: Option<String>,
    #[serde(
        rename = "contextPackV1Proof",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub context_pack_v1_proof: Option<ContextPackProof>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pre_snapshot: Option<PreSnapshot>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_diff: Option<SnapshotDiff>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_stats: Option<PatchStats>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub submit: Option<Submit>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ci_gate: Option<GateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_gate: Option<GateResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_tests: Option<AllowedTestsResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verdict: Option<VerdictRecord>,
    #[serde(default)]
    pub policy_violations: Vec<PolicyViolation>,
    /// Completions accepted from a different worker after lease expiry.
    #[serde(default)]
    pub rescue_count: u32,
    /// Times this job went back to `queued` after a lease expiry.
    #[serde(default)]
    pub requeue_count: u32,
}

impl Job {
    pub fn new(
        task_id: Option<String>,
        prompt: String,
        model: String,
        executor: ExecutorKind,
        task_type: JobTaskType,
        runner: RunnerKind,
        priority: i64,
    ) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            task_id,
            prompt,
            prompt_ref: None,
            model,
            model_effective: None,
            executor,
            task_type,
            runner,
            worker_id: None,
            lease_until: None,
            status: JobStatus::Queued,
            attempts: 0,
            priority,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            last_update: None,
            exit_code: None,
            stdout: String::new(),
            stderr: String::new(),
            error: None,
            reason: None,
            warned_long: false,
            context_pack_id: None,
            context_pack_v1_id: None,
            attestation_nonce: None,
            context_pack_v1_proof: None,
            pre_snapshot: None,
            snapshot_diff: None,
            patch_stats: None,
            submit: None,
            usage: None,
            ci_gate: None,
            policy_gate: None,
            allowed_tests: None,
            verdict: None,
            policy_violations: Vec::new(),
            rescue_count: 0,
            requeue_count: 0,
        }
    }

    pub fn is_open(&self) -> bool {
        matches!(self.status, JobStatus::Queued | JobStatus::Running)
    }

    /// Lease expired by more than `grace` (external running jobs only).
    pub fn lease_expired(&self, now: DateTime<Utc>, grace: chrono::Duration) -> bool {
        self.status == JobStatus::Running
            && self.runner == RunnerKind::External
            && self
                .lease_until
                .map(|lease| now > lease + grace)
                .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    fn queued_job() -> Job {
        Job::new(
            Some("t1".to_string()),
            "do the thing".to_string(),
            "gpt-5".to_string(),
            ExecutorKind::Codex,
            JobTaskType::Atomic,
            RunnerKind::External,
            10,
        )
    }

    #[test]
    fn test_new_job_is_queued() {
        let job = queued_job();
        assert_eq!(job.status, JobStatus::Queued);
        assert!(job.is_open());
        assert!(job.worker_id.is_none());
    }

    #[test]
    fn test_lease_expiry_needs_grace() {
        let mut job = queued_job();
        job.status = JobStatus::Running;
        let now = Utc::now();
        job.lease_until = Some(now - Duration::seconds(10));

        assert!(!job.lease_expired(now, Duration::seconds(30)));
        assert!(job.lease_expired(now, Duration::seconds(5)));
    }

    #[test]
    fn test_internal_jobs_never_lease_expire() {
        let mut job = queued_job();
        job.runner = RunnerKind::Internal;
        job.status = JobStatus::Running;
        job.lease_until = Some(Utc::now() - Duration::hours(1));
        assert!(!job.lease_expired(Utc::now(), Duration::seconds(0)));
    }

    #[test]
    fn test_job_serde_wire_names() {
        let job = queued_job();
        let json = serde_json::to_value(&job).expect("serialize");
        assert!(json.get("taskId").is_some());
        assert!(json.get("taskType").is_some());
        assert!(json.get("createdAt").is_some());
        let back: Job = serde_json::from_value(json).expect("deserialize");
        assert_eq!(back, job);
    }
}
