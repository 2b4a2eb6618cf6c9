//! The job queue: single writer for job records, CAS-like claim
//! transitions, crash-safe reload.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use tracing::{info, warn};

use factory_state::{load_json, save_json_atomic, FactoryPaths, WriteMode};

use crate::domain::{
    EventType, ExecutorKind, FactoryError, Job, JobStatus, Result, RunnerKind, StateEvent,
};

/// Grace beyond the lease before expiry handling kicks in.
pub const LEASE_GRACE_SECONDS: i64 = 30;

/// Grace beyond the lease before expiry handling kicks in.
pub fn lease_grace() -> Duration {
    Duration::seconds(LEASE_GRACE_SECONDS)
}

/// What lease-expiry handling decided for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseAction {
    Requeued(String),
    Cancelled(String),
}

pub struct JobQueue {
    paths: FactoryPaths,
    jobs: RwLock<Vec<Job>>,
}

impl JobQueue {
    /// Load jobs from disk. Running internal jobs are flipped back to
    /// `queued`: the process that ran them is gone.
    pub fn load(paths: FactoryPaths) -> Result<Self> {
        let mut jobs: Vec<Job> = load_json(&paths.jobs_file())?.unwrap_or_default();
        let mut flipped = 0;
        for job in &mut jobs {
            if job.status == JobStatus::Running && job.runner == RunnerKind::Internal {
                job.status = JobStatus::Queued;
                job.worker_id = None;
                job.started_at = None;
                flipped += 1;
            }
        }
        if flipped > 0 {
            info!(count = flipped, "recovered running internal jobs to queued");
            save_json_atomic(&paths.jobs_file(), &jobs, WriteMode::Strict)?;
        }
        Ok(Self {
            paths,
            jobs: RwLock::new(jobs),
        })
    }

    fn persist(&self, jobs: &[Job]) -> Result<()> {
        save_json_atomic(&self.paths.jobs_file(), &jobs, WriteMode::Strict)?;
        Ok(())
    }

    // ---- queries ------------------------------------------------------

    pub fn list(&self) -> Vec<Job> {
        self.jobs.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn get(&self, id: &str) -> Result<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|j| j.id == id)
            .cloned()
            .ok_or_else(|| FactoryError::JobNotFound(id.to_string()))
    }

    /// Open (queued or running) job for a task, if any.
    pub fn open_job_for_task(&self, task_id: &str) -> Option<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|j| j.task_id.as_deref() == Some(task_id) && j.is_open())
            .cloned()
    }

    pub fn queued_count(&self) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|j| j.status == JobStatus::Queued)
            .count()
    }

    pub fn running(&self) -> Vec<Job> {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|j| j.status == JobStatus::Running)
            .cloned()
            .collect()
    }

    pub fn running_external_count(&self, executor: ExecutorKind) -> usize {
        self.jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|j| {
                j.status == JobStatus::Running
                    && j.runner == RunnerKind::External
                    && j.executor == executor
            })
            .count()
    }

    // ---- mutation -----------------------------------------------------

    pub fn push(&self, job: Job) -> Result<Job> {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        jobs.push(job.clone());
        self.persist(&jobs)?;
        Ok(job)
    }

    pub fn mutate<F>(&self, id: &str, mutate: F) -> Result<Job>
    where
        F: FnOnce(&mut Job) -> Result<()>,
    {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        let job = jobs
            .iter_mut()
            .find(|j| j.id == id)
            .ok_or_else(|| FactoryError::JobNotFound(id.to_string()))?;
        mutate(job)?;
        job.last_update = Some(Utc::now());
        let snapshot = job.clone();
        self.persist(&jobs)?;
        Ok(snapshot)
    }

    /// Highest-priority queued internal job (FIFO within a priority).
    pub fn next_internal(&self) -> Option<Job> {
        let jobs = self.jobs.read().unwrap_or_else(|p| p.into_inner());
        jobs.iter()
            .filter(|j| j.status == JobStatus::Queued && j.runner == RunnerKind::Internal)
            .max_by(|a, b| {
                a.priority
                    .cmp(&b.priority)
                    .then(b.created_at.cmp(&a.created_at))
            })
            .cloned()
    }

    /// CAS-like claim: find the oldest eligible queued external job and
    /// transition it to running under the queue lock.
    pub fn claim(
        &self,
        worker_id: &str,
        executor: ExecutorKind,
        worker_models: &[String],
        require_pack: bool,
        lease: Duration,
    ) -> Result<Option<Job>> {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        let now = Utc::now();

        let candidate = jobs
            .iter_mut()
            .filter(|j| {
                j.status == JobStatus::Queued
                    && j.runner == RunnerKind::External
                    && j.executor == executor
                    && (!require_pack || j.context_pack_v1_id.is_some())
                    && (worker_models.is_empty() || worker_models.iter().any(|m| *m == j.model))
            })
            .min_by_key(|j| j.created_at);

        let Some(job) = candidate else {
            return Ok(None);
        };

        job.status = JobStatus::Running;
        job.worker_id = Some(worker_id.to_string());
        job.lease_until = Some(now + lease);
        job.started_at = Some(now);
        job.attempts += 1;
        if job.attestation_nonce.is_none() {
            job.attestation_nonce = Some(crate::attestation::mint_nonce());
        }
        let snapshot = job.clone();
        self.persist(&jobs)?;
        Ok(Some(snapshot))
    }

    /// Extend the lease when the heartbeating worker still owns the job.
    pub fn extend_lease(&self, job_id: &str, worker_id: &str, lease: Duration) -> Result<bool> {
        let mut jobs = self.jobs.write().unwrap_or_else(|p| p.into_inner());
        let Some(job) = jobs.iter_mut().find(|j| j.id == job_id) else {
            return Ok(false);
        };
        if job.status != JobStatus::Running || job.worker_id.as_deref() != Some(worker_id) {
            return Ok(false);
        }
        job.lease_until = Some(Utc::now() + lease);
        self.persist(&jobs)?;
        Ok(true)
    }

    /// Return a job to the queue. Idempotent: requeueing a queued job is a
    /// no-op.
    pub fn requeue(&self, id: &str) -> Result<Job> {
        self.mutate(id, |job| {
            if job.status == JobStatus::Queued {
                return Ok(());
            }
            job.status = JobStatus::Queued;
            job.worker_id = None;
            job.lease_until = None;
            job.started_at = None;
            job.requeue_count += 1;
            Ok(())
        })
    }

    /// Cancel an open job. Idempotent on terminal jobs.
    pub fn cancel(&self, id: &str, reason: &str) -> Result<Job> {
        self.mutate(id, |job| {
            if !job.is_open() {
                return Ok(());
            }
            job.status = JobStatus::Failed;
            job.exit_code = Some(124);
            job.reason = Some(reason.to_string());
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }

    /// Scan running external jobs for expired leases. Each expiry either
    /// requeues (within the bound) or cancels.
    pub fn reap_expired_leases(
        &self,
        now: DateTime<Utc>,
        max_requeues: u32,
    ) -> Result<Vec<(LeaseAction, StateEvent)>> {
        let expired: Vec<Job> = self
            .jobs
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .filter(|j| j.lease_expired(now, lease_grace()))
            .cloned()
            .collect();

        let mut actions = Vec::new();
        for job in expired {
            warn!(job_id = %job.id, "worker lease expired");
            let mut event = StateEvent::new(EventType::JobLeaseExpired).with_job(job.id.clone());
            event.task_id = job.task_id.clone();

            if job.requeue_count < max_requeues {
                self.requeue(&job.id)?;
                actions.push((LeaseAction::Requeued(job.id), event));
            } else {
                self.cancel(&job.id, "timeout")?;
                event.reason = Some("timeout".to_string());
                actions.push((LeaseAction::Cancelled(job.id), event));
            }
        }
        Ok(actions)
    }
}
