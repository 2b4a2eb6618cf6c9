//! Core domain model for the factory gateway.

pub mod error;
pub mod event;
pub mod job;
pub mod ledger;
pub mod records;
pub mod task;
pub mod worker;

pub use error::{reason, DispatchError, FactoryError, Result, WipLimitKind};
pub use event::{EventType, StateEvent};
pub use job::{Job, JobStatus, JobTaskType};
pub use ledger::{ProgressLedger, TaskLedger};
pub use records::{
    AllowedTestRun, AllowedTestsResult, ContextPackProof, DlqEntry, DlqEvidence, GateResult,
    HashPair, PatchStats, PolicyViolation, PreSnapshot, PreSnapshotFull, RetryPlan, RetryRoute,
    RetryStrategy, RollbackAction, RollbackReport, SnapshotDiff, SnapshotEntry, Submit,
    SubmitAllowPaths, SubmitStatus, SubmitTests, Usage, Verdict, VerdictRecord, DLQ_SCHEMA,
    RETRY_PLAN_SCHEMA, ROLLBACK_REPORT_SCHEMA, SUBMIT_SCHEMA, VERDICT_SCHEMA,
};
pub use task::{
    ExecutorKind, Lane, LineWindow, Pins, PinsInstance, RunnerKind, Task, TaskKind, TaskStatus,
};
pub use worker::Worker;
