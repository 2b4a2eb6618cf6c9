//! Serializable evidence and artifact records shared across the pipeline.
//!
//! Each persisted schema carries a `schema_version` tag (`scc.*.v1` /
//! `scc.*.v2`) so consumers can evolve independently of the gateway.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// Snapshots
// ---------------------------------------------------------------------------

/// One file observation inside a pre-run snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotEntry {
    pub path: String,
    pub exists: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
}

/// Pre-run file hash snapshot over the task's candidate footprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PreSnapshot {
    pub captured_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub entries: Vec<SnapshotEntry>,
}

/// Base64 file contents for the small-footprint subset, enabling rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PreSnapshotFull {
    pub schema_version: String,
    /// path -> base64(content). Absent files are recorded as `None` so a
    /// rollback can delete what the run created.
    #[serde(default)]
    pub contents: BTreeMap<String, Option<String>>,
}

/// Post-run diff against the pre-snapshot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SnapshotDiff {
    #[serde(default)]
    pub touched_files: Vec<String>,
}

/// Patch statistics parsed from a model-provided unified diff.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PatchStats {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub added: u32,
    #[serde(default)]
    pub removed: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_text: Option<String>,
}

// ---------------------------------------------------------------------------
// Gates
// ---------------------------------------------------------------------------

/// Outcome of one gate invocation (CI gate or policy gate).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct GateResult {
    pub ran: bool,
    pub required: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skipped: Option<String>,
    pub ok: bool,
    #[serde(rename = "exitCode", default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(rename = "durationMs", default)]
    pub duration_ms: u64,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(rename = "timedOut", default)]
    pub timed_out: bool,
    #[serde(rename = "stdoutPath", default, skip_serializing_if = "Option::is_none")]
    pub stdout_path: Option<String>,
    #[serde(rename = "stderrPath", default, skip_serializing_if = "Option::is_none")]
    pub stderr_path: Option<String>,
    #[serde(
        rename = "stdoutSha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stdout_sha256: Option<String>,
    #[serde(
        rename = "stderrSha256",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub stderr_sha256: Option<String>,
}

impl GateResult {
    /// A gate that was not required and never ran.
    pub fn skipped(reason: impl Into<String>) -> Self {
        Self {
            ran: false,
            required: false,
            skipped: Some(reason.into()),
            ok: true,
            ..Self::default()
        }
    }
}

/// One allowed-test command execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllowedTestRun {
    pub command: String,
    pub ok: bool,
    pub exit_code: i32,
    pub duration_ms: u64,
    #[serde(default)]
    pub timed_out: bool,
}

/// Evidence for the allowed-tests gate (external runs).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct AllowedTestsResult {
    pub ran: bool,
    pub ok: bool,
    #[serde(default)]
    pub runs: Vec<AllowedTestRun>,
}

// ---------------------------------------------------------------------------
// Submit (scc.submit.v1)
// ---------------------------------------------------------------------------

pub const SUBMIT_SCHEMA: &str = "scc.submit.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SubmitStatus {
    Done,
    Failed,
    NeedInput,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubmitAllowPaths {
    #[serde(default)]
    pub read: Vec<String>,
    #[serde(default)]
    pub write: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct SubmitTests {
    #[serde(default)]
    pub commands: Vec<String>,
    #[serde(default)]
    pub passed: bool,
    #[serde(default)]
    pub summary: String,
}

/// The executor's completion contract for one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Submit {
    pub schema_version: String,
    pub status: SubmitStatus,
    #[serde(default)]
    pub reason_code: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub new_files: Vec<String>,
    #[serde(default)]
    pub touched_files: Vec<String>,
    #[serde(default)]
    pub allow_paths: SubmitAllowPaths,
    #[serde(default)]
    pub tests: SubmitTests,
    #[serde(default)]
    pub artifacts: BTreeMap<String, String>,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(default)]
    pub needs_input: bool,
}

// ---------------------------------------------------------------------------
// Verdict (scc.verdict.v1)
// ---------------------------------------------------------------------------

pub const VERDICT_SCHEMA: &str = "scc.verdict.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Pass,
    Fail,
    Escalate,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerdictRecord {
    pub schema_version: String,
    pub task_id: String,
    pub verdict: Verdict,
    #[serde(default)]
    pub reasons: Vec<String>,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Attestation
// ---------------------------------------------------------------------------

/// Local vs payload hash pair for one attested file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct HashPair {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<String>,
}

impl HashPair {
    pub fn matches(&self) -> bool {
        match (&self.payload, &self.local) {
            (Some(p), Some(l)) => p == l,
            _ => false,
        }
    }
}

/// Nonce-bound proof binding a worker completion to rendered pack bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContextPackProof {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pack_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub nonce: Option<String>,
    #[serde(default)]
    pub pack_json: HashPair,
    #[serde(default)]
    pub pack_json_attest: HashPair,
    /// bundle file name -> plain hash pair
    #[serde(default)]
    pub bundle_files: BTreeMap<String, HashPair>,
    /// bundle file name -> nonce-salted hash pair
    #[serde(default)]
    pub bundle_files_attest: BTreeMap<String, HashPair>,
    #[serde(default)]
    pub violations: Vec<String>,
    pub verified: bool,
}

/// One recorded policy violation on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolicyViolation {
    pub code: String,
    #[serde(default)]
    pub detail: String,
}

// ---------------------------------------------------------------------------
// Usage
// ---------------------------------------------------------------------------

/// Token/time usage reported by an executor run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Usage {
    #[serde(default)]
    pub tokens_input: u64,
    #[serde(default)]
    pub tokens_output: u64,
    #[serde(default)]
    pub verify_minutes: u64,
}

impl Usage {
    pub fn saturating_add(self, other: Usage) -> Usage {
        Usage {
            tokens_input: self.tokens_input.saturating_add(other.tokens_input),
            tokens_output: self.tokens_output.saturating_add(other.tokens_output),
            verify_minutes: self.verify_minutes.saturating_add(other.verify_minutes),
        }
    }
}

// ---------------------------------------------------------------------------
// Retry plan (scc.retry_plan.v1)
// ---------------------------------------------------------------------------

pub const RETRY_PLAN_SCHEMA: &str = "scc.retry_plan.v1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RetryStrategy {
    PinsFix,
    ShrinkRadius,
    SwitchExecutor,
    Dlq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryRoute {
    pub lane: super::task::Lane,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_role: Option<String>,
    #[serde(default)]
    pub notes: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetryPlan {
    pub schema_version: String,
    pub task_id: String,
    pub attempt: u32,
    pub max_attempts: u32,
    pub route: RetryRoute,
    pub strategy: RetryStrategy,
    #[serde(default)]
    pub budgets: BTreeMap<String, u64>,
    #[serde(default)]
    pub stop_conditions: Vec<String>,
    pub dlq_on_fail: bool,
    pub created_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// DLQ (scc.dlq.v1)
// ---------------------------------------------------------------------------

pub const DLQ_SCHEMA: &str = "scc.dlq.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct DlqEvidence {
    #[serde(default)]
    pub artifacts_root: String,
    #[serde(default)]
    pub report_md: String,
    #[serde(default)]
    pub selftest_log: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DlqEntry {
    pub schema_version: String,
    pub dlq_id: String,
    pub task_id: String,
    pub created_at: DateTime<Utc>,
    pub status: String,
    pub reason_code: String,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub missing_inputs: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event: Option<String>,
    #[serde(default)]
    pub retry_history: Vec<String>,
    #[serde(default)]
    pub evidence: DlqEvidence,
}

// ---------------------------------------------------------------------------
// Rollback report (scc.rollback_report.v1)
// ---------------------------------------------------------------------------

pub const ROLLBACK_REPORT_SCHEMA: &str = "scc.rollback_report.v1";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackAction {
    pub path: String,
    /// `restore` (content written back) or `delete` (file the run created).
    pub action: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub schema_version: String,
    pub task_id: String,
    pub job_id: String,
    pub applied: Vec<RollbackAction>,
    pub created_at: DateTime<Utc>,
}
