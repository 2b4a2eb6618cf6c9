//! Domain-level error taxonomy for the factory gateway.
//!
//! Two layers:
//! - [`FactoryError`]: infrastructure/domain failures (I/O, serialization,
//!   missing entities) that propagate with `?`.
//! - [`DispatchError`]: typed dispatch rejections. Each variant maps to a
//!   stable coded string surfaced as `job.reason` / the dispatch error and
//!   consumed by event routing and retry plans.

use thiserror::Error;

/// Factory domain errors.
#[derive(Debug, Error)]
pub enum FactoryError {
    #[error("task not found: {0}")]
    TaskNotFound(String),

    #[error("job not found: {0}")]
    JobNotFound(String),

    #[error("worker not found: {0}")]
    WorkerNotFound(String),

    #[error("invalid task: {0}")]
    InvalidTask(String),

    #[error("invalid transition: {0}")]
    InvalidTransition(String),

    #[error("dispatch rejected: {0}")]
    Dispatch(#[from] DispatchError),

    #[error("executor failure: {0}")]
    Executor(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: String, actual: String },

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Store(#[from] factory_state::StoreError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for factory domain operations.
pub type Result<T> = std::result::Result<T, FactoryError>;

/// Typed dispatch rejection. `code()` is the stable wire string.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum DispatchError {
    #[error("task is not atomic or not dispatchable")]
    NotDispatchable,

    #[error("pins generation still pending")]
    PinsPending,

    #[error("parent budget exhausted: {0}")]
    BudgetExhausted(String),

    #[error("quarantine active: {0}")]
    Quarantined(String),

    #[error("stop-the-bleeding mode rejects this task")]
    StopTheBleeding,

    #[error("timeout fuse tripped for external dispatch")]
    TimeoutFused,

    #[error("role not registered: {0}")]
    InvalidRole(String),

    #[error("skill {skill} not allowed for role {role}")]
    SkillNotAllowed { role: String, skill: String },

    #[error("patch-producing role requires a real test command")]
    MissingRealTest,

    #[error("task has no allowed tests")]
    MissingAllowedTests,

    #[error("task already has a queued or running job")]
    AlreadyDispatched,

    #[error("dispatch attempts exhausted ({attempts}/{max})")]
    RetryExhausted { attempts: u32, max: u32 },

    #[error("area fail-rate {rate:.2} breaches quality gate")]
    QualityGateBlocked { rate: f64 },

    #[error("task has no pins and none could be resolved")]
    MissingPins,

    #[error("pins allow-list is empty")]
    MissingPinsAllowlist,

    #[error("no pins template for task class {0}")]
    MissingPinsTemplate(String),

    #[error("pins do not cover the task: {0}")]
    PinsInsufficient(String),

    #[error("role policy missing for role {0}")]
    MissingRolePolicy(String),

    #[error("role policy violation: {0}")]
    RolePolicyViolation(String),

    #[error("preflight failed: {0}")]
    PreflightFailed(String),

    #[error("preflight raised: {0}")]
    PreflightException(String),

    #[error("context pack v1 render failed: {0}")]
    ContextPackRender(String),

    #[error("WIP limit reached: {0}")]
    WipLimit(WipLimitKind),

    #[error("no executor available for task")]
    NoExecutor,

    #[error("no model available for executor")]
    NoModel,
}

/// Which WIP cap rejected the dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WipLimitKind {
    Total,
    Exec,
    Batch,
}

impl std::fmt::Display for WipLimitKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            WipLimitKind::Total => "wip_total_max",
            WipLimitKind::Exec => "wip_exec_max",
            WipLimitKind::Batch => "wip_batch_max",
        };
        write!(f, "{s}")
    }
}

impl DispatchError {
    /// Stable coded string for events, retry plans, and `job.reason`.
    pub fn code(&self) -> &'static str {
        match self {
            DispatchError::NotDispatchable => "already_dispatched",
            DispatchError::PinsPending => "pins_pending",
            DispatchError::BudgetExhausted(_) => "budget_exhausted",
            DispatchError::Quarantined(_) => "quarantined",
            DispatchError::StopTheBleeding => "stop_the_bleeding",
            DispatchError::TimeoutFused => "timeout_fused",
            DispatchError::InvalidRole(_) => "invalid_role",
            DispatchError::SkillNotAllowed { .. } => "role_policy_violation",
            DispatchError::MissingRealTest => "missing_real_test",
            DispatchError::MissingAllowedTests => "missing_allowedTests",
            DispatchError::AlreadyDispatched => "already_dispatched",
            DispatchError::RetryExhausted { .. } => "retry_exhausted",
            DispatchError::QualityGateBlocked { .. } => "quality_gate_blocked",
            DispatchError::MissingPins => "missing_pins",
            DispatchError::MissingPinsAllowlist => "missing_pins_allowlist",
            DispatchError::MissingPinsTemplate(_) => "missing_pins_template",
            DispatchError::PinsInsufficient(_) => "pins_insufficient",
            DispatchError::MissingRolePolicy(_) => "missing_role_policy",
            DispatchError::RolePolicyViolation(_) => "role_policy_violation",
            DispatchError::PreflightFailed(_) => "preflight_failed",
            DispatchError::PreflightException(_) => "preflight_exception",
            DispatchError::ContextPackRender(_) => "context_pack_v1_render_failed",
            DispatchError::WipLimit(kind) => match kind {
                WipLimitKind::Total => "wip_total_max",
                WipLimitKind::Exec => "wip_exec_max",
                WipLimitKind::Batch => "wip_batch_max",
            },
            DispatchError::NoExecutor => "tooling_error",
            DispatchError::NoModel => "model_failure_ladder",
        }
    }
}

/// Job/pipeline reason codes that are not dispatch rejections.
pub mod reason {
    pub const TIMEOUT: &str = "timeout";
    pub const EXCEPTION: &str = "exception";
    pub const NEEDS_INPUT: &str = "needs_input";
    pub const TOOLING_ERROR: &str = "tooling_error";
    pub const MODEL_FAILURE_LADDER: &str = "model_failure_ladder";
    pub const CI_FAILED: &str = "ci_failed";
    pub const CI_SKIPPED: &str = "ci_skipped";
    pub const CI_TIMED_OUT: &str = "ci_timed_out";
    pub const POLICY_GATE_FAILED: &str = "policy_gate_failed";
    pub const POLICY_GATE_TIMED_OUT: &str = "policy_gate_timed_out";
    pub const HYGIENE_FAILED: &str = "hygiene_failed";
    pub const PATCH_SCOPE_VIOLATION: &str = "patch_scope_violation";
    pub const SUBMIT_MISMATCH: &str = "submit_mismatch";
    pub const MISSING_SUBMIT_CONTRACT: &str = "missing_submit_contract";
    pub const TEST_COMMAND_MISSING: &str = "test_command_missing";
    pub const SCOPE_CONFLICT: &str = "scope_conflict";
    pub const SPLIT_TOUCHED_REPO: &str = "split_touched_repo";
    pub const SPLIT_OUTPUT_INVALID: &str = "split_output_invalid";
    pub const POLICY_VIOLATION: &str = "policy_violation";
    pub const MISSING_BINARY: &str = "missing_binary";
}
