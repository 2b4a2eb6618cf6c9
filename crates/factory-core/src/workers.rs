//! External worker API: register, heartbeat, long-poll claim, and the
//! fail-closed completion contract.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use factory_state::{load_json, save_json_atomic, FactoryPaths, WriteMode};

use crate::attestation::{verify_completion, AttestationPayload};
use crate::config::RuntimeConfig;
use crate::domain::{
    reason, ExecutorKind, FactoryError, Job, JobStatus, PolicyViolation, Result, Worker,
};
use crate::queue::{lease_grace, JobQueue};

/// Poll interval for the long-poll claim loop.
pub const CLAIM_POLL_INTERVAL_MS: u64 = 500;
/// Upper bound on a single claim long-poll.
pub const CLAIM_MAX_WAIT_MS: u64 = 60_000;
/// At most one rescue completion is accepted per job.
pub const MAX_RESCUES_PER_JOB: u32 = 1;

/// The claim response handed to a worker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimResponse {
    pub id: String,
    pub executor: ExecutorKind,
    pub model: String,
    #[serde(rename = "taskType")]
    pub task_type: crate::domain::JobTaskType,
    #[serde(rename = "timeoutMs")]
    pub timeout_ms: u64,
    pub attestation: ClaimAttestation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub context_pack_v1: Option<ClaimPackPaths>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_bundle: Option<ClaimBundlePaths>,
    pub prompt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimAttestation {
    pub nonce: String,
    pub algo: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimPackPaths {
    pub pack_id: String,
    pub pack_json: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClaimBundlePaths {
    pub dir: String,
    pub files: Vec<String>,
}

/// A worker's Complete payload.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct CompletePayload {
    #[serde(rename = "workerId", default)]
    pub worker_id: String,
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub exit_code: i32,
    #[serde(flatten)]
    pub attestation: AttestationPayload,
}

/// Worker registry plus the claim/complete contract over the job queue.
pub struct WorkerService {
    paths: FactoryPaths,
    workers: RwLock<Vec<Worker>>,
}

impl WorkerService {
    pub fn load(paths: FactoryPaths) -> Result<Self> {
        let workers: Vec<Worker> = load_json(&paths.workers_file())?.unwrap_or_default();
        Ok(Self {
            paths,
            workers: RwLock::new(workers),
        })
    }

    fn persist(&self, workers: &[Worker]) -> Result<()> {
        save_json_atomic(&self.paths.workers_file(), &workers, WriteMode::Strict)?;
        Ok(())
    }

    pub fn list(&self) -> Vec<Worker> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn get(&self, id: &str) -> Result<Worker> {
        self.workers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .iter()
            .find(|w| w.id == id)
            .cloned()
            .ok_or_else(|| FactoryError::WorkerNotFound(id.to_string()))
    }

    /// Idempotent registration by `name|sorted(executors)`. Re-registration
    /// refreshes `last_seen` and the advertised model set.
    pub fn register(
        &self,
        name: &str,
        executors: Vec<ExecutorKind>,
        models: Vec<String>,
    ) -> Result<Worker> {
        let key = Worker::identity_key(name, &executors);
        let mut workers = self.workers.write().unwrap_or_else(|p| p.into_inner());

        if let Some(existing) = workers
            .iter_mut()
            .find(|w| Worker::identity_key(&w.name, &w.executors) == key)
        {
            existing.last_seen = Utc::now();
            existing.models = models;
            let snapshot = existing.clone();
            self.persist(&workers)?;
            return Ok(snapshot);
        }

        let worker = Worker::new(name, executors, models);
        info!(worker_id = %worker.id, name = %worker.name, "worker registered");
        workers.push(worker.clone());
        self.persist(&workers)?;
        Ok(worker)
    }

    /// Heartbeat: bump `last_seen`; when the worker still owns a running
    /// job, extend its lease.
    pub fn heartbeat(
        &self,
        worker_id: &str,
        running_job_id: Option<&str>,
        queue: &JobQueue,
        config: &RuntimeConfig,
    ) -> Result<Worker> {
        let snapshot = {
            let mut workers = self.workers.write().unwrap_or_else(|p| p.into_inner());
            let worker = workers
                .iter_mut()
                .find(|w| w.id == worker_id)
                .ok_or_else(|| FactoryError::WorkerNotFound(worker_id.to_string()))?;
            worker.last_seen = Utc::now();
            worker.running_job_id = running_job_id.map(str::to_string);
            let snapshot = worker.clone();
            self.persist(&workers)?;
            snapshot
        };

        if let Some(job_id) = running_job_id {
            let lease = Duration::milliseconds(config.exec_worker_lease_ms as i64);
            queue.extend_lease(job_id, worker_id, lease)?;
        }
        Ok(snapshot)
    }

    /// Drop stale workers with no running job.
    pub fn prune_stale(&self, now: DateTime<Utc>, config: &RuntimeConfig) -> Result<usize> {
        let prune_after = Duration::milliseconds(config.worker_stale_prune_ms as i64);
        let mut workers = self.workers.write().unwrap_or_else(|p| p.into_inner());
        let before = workers.len();
        workers.retain(|w| w.running_job_id.is_some() || now - w.last_seen <= prune_after);
        let pruned = before - workers.len();
        if pruned > 0 {
            info!(count = pruned, "pruned stale workers");
            self.persist(&workers)?;
        }
        Ok(pruned)
    }

    /// Long-poll claim. Returns `None` on timeout (the wire layer's 204).
    pub async fn claim(
        &self,
        worker_id: &str,
        executor: ExecutorKind,
        wait_ms: u64,
        queue: &JobQueue,
        config: &RuntimeConfig,
    ) -> Result<Option<ClaimResponse>> {
        let worker = self.get(worker_id)?;
        let wait_ms = wait_ms.min(CLAIM_MAX_WAIT_MS);
        let deadline = std::time::Instant::now() + std::time::Duration::from_millis(wait_ms);
        let lease = Duration::milliseconds(config.exec_worker_lease_ms as i64);

        loop {
            // Per-executor running cap on the external side.
            let cap = match executor {
                ExecutorKind::Codex => config.external_max_codex,
                ExecutorKind::Opencodecli => config.external_max_opencodecli,
            };
            if queue.running_external_count(executor) < cap {
                if let Some(job) = queue.claim(
                    worker_id,
                    executor,
                    &worker.models,
                    config.context_pack_v1_required,
                    lease,
                )? {
                    return Ok(Some(self.claim_response(job, config)));
                }
            }

            if std::time::Instant::now() >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(std::time::Duration::from_millis(CLAIM_POLL_INTERVAL_MS)).await;
        }
    }

    fn claim_response(&self, job: Job, config: &RuntimeConfig) -> ClaimResponse {
        let context_pack_v1 = job.context_pack_v1_id.as_ref().map(|id| ClaimPackPaths {
            pack_id: id.clone(),
            pack_json: format!("artifacts/scc_runs/{id}/rendered_context_pack.json"),
        });
        let task_bundle = job.context_pack_v1_id.as_ref().map(|id| ClaimBundlePaths {
            dir: format!("artifacts/scc_runs/{id}/task_bundle"),
            files: crate::attestation::REQUIRED_BUNDLE_FILES
                .iter()
                .map(|f| f.to_string())
                .collect(),
        });

        ClaimResponse {
            id: job.id.clone(),
            executor: job.executor,
            model: job.model_effective.clone().unwrap_or(job.model.clone()),
            task_type: job.task_type,
            timeout_ms: config.default_job_timeout_ms,
            attestation: ClaimAttestation {
                nonce: job.attestation_nonce.clone().unwrap_or_default(),
                algo: "sha256".to_string(),
            },
            context_pack_v1,
            task_bundle,
            prompt: job.prompt,
        }
    }

    /// Accept a worker's completion: identity/rescue check, then the
    /// attestation contract. On success the job carries the worker outputs
    /// and stays `running` for the pipeline to finish; on violation it is
    /// failed closed.
    pub fn accept_completion(
        &self,
        job_id: &str,
        payload: &CompletePayload,
        queue: &JobQueue,
        config: &RuntimeConfig,
        now: DateTime<Utc>,
    ) -> Result<Job> {
        let job = queue.get(job_id)?;
        if job.status != JobStatus::Running {
            return Err(FactoryError::InvalidTransition(format!(
                "job {job_id} is not running"
            )));
        }

        let mut rescue = false;
        if job.worker_id.as_deref() != Some(payload.worker_id.as_str()) {
            rescue = self.rescue_allowed(&job, now, config);
            if !rescue || job.rescue_count >= MAX_RESCUES_PER_JOB {
                return self.fail_closed(
                    queue,
                    job_id,
                    vec![PolicyViolation {
                        code: "worker_id_mismatch".to_string(),
                        detail: format!(
                            "job held by {:?}, completed by {}",
                            job.worker_id, payload.worker_id
                        ),
                    }],
                    None,
                );
            }
        }

        // Attestation proof (fail-closed when required).
        let mut proof = None;
        if config.context_pack_v1_required || job.context_pack_v1_id.is_some() {
            let verdict = verify_completion(&self.paths, &job, &payload.attestation);
            let violations: Vec<PolicyViolation> = verdict
                .violations
                .iter()
                .map(|code| PolicyViolation {
                    code: code.clone(),
                    detail: String::new(),
                })
                .collect();
            if !verdict.verified {
                return self.fail_closed(queue, job_id, violations, Some(verdict));
            }
            proof = Some(verdict);
        }

        queue.mutate(job_id, |job| {
            job.stdout = payload.stdout.clone();
            job.stderr = payload.stderr.clone();
            job.exit_code = Some(payload.exit_code);
            job.context_pack_v1_proof = proof.clone();
            if rescue {
                job.rescue_count += 1;
                job.worker_id = Some(payload.worker_id.clone());
            }
            Ok(())
        })
    }

    /// Rescue: the lease expired past grace, or the holding worker is gone.
    fn rescue_allowed(&self, job: &Job, now: DateTime<Utc>, config: &RuntimeConfig) -> bool {
        if job.lease_expired(now, lease_grace()) {
            return true;
        }
        let Some(holder) = &job.worker_id else {
            return true;
        };
        match self.get(holder) {
            Ok(worker) => {
                let window = Duration::milliseconds(config.worker_active_window_ms as i64);
                !worker.is_active(now, window)
            }
            Err(_) => true,
        }
    }

    fn fail_closed(
        &self,
        queue: &JobQueue,
        job_id: &str,
        violations: Vec<PolicyViolation>,
        proof: Option<crate::domain::ContextPackProof>,
    ) -> Result<Job> {
        let first_code = violations
            .first()
            .map(|v| v.code.clone())
            .unwrap_or_else(|| reason::POLICY_VIOLATION.to_string());
        warn!(job_id, code = %first_code, "completion rejected");
        queue.mutate(job_id, |job| {
            job.status = JobStatus::Failed;
            job.error = Some(reason::POLICY_VIOLATION.to_string());
            job.reason = Some(first_code.clone());
            job.policy_violations = violations.clone();
            job.context_pack_v1_proof = proof.clone();
            job.finished_at = Some(Utc::now());
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attestation::{compute_payload, write_task_bundle};
    use crate::domain::{JobTaskType, RunnerKind};
    use tempfile::tempdir;

    fn setup() -> (WorkerService, JobQueue, FactoryPaths, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let paths = FactoryPaths::new(dir.path());
        let service = WorkerService::load(paths.clone()).expect("workers");
        let queue = JobQueue::load(paths.clone()).expect("queue");
        (service, queue, paths, dir)
    }

    fn bound_external_job(paths: &FactoryPaths, pack_id: &str) -> Job {
        std::fs::create_dir_all(paths.scc_run_dir(pack_id)).expect("mkdir");
        std::fs::write(paths.rendered_pack_file(pack_id), b"{\"pack\":1}").expect("write");
        write_task_bundle(
            paths,
            pack_id,
            &serde_json::json!({"files": []}),
            &serde_json::json!({}),
            &serde_json::json!({"pass": true}),
            &serde_json::json!({"id": "t1"}),
            None,
        )
        .expect("bundle");

        let mut job = Job::new(
            Some("t1".to_string()),
            "do it".to_string(),
            "gpt-5".to_string(),
            ExecutorKind::Codex,
            JobTaskType::Atomic,
            RunnerKind::External,
            0,
        );
        job.context_pack_v1_id = Some(pack_id.to_string());
        job
    }

    #[test]
    fn test_register_is_idempotent() {
        let (service, _queue, _paths, _dir) = setup();
        let first = service
            .register("w1", vec![ExecutorKind::Codex], vec![])
            .expect("register");
        let second = service
            .register("w1", vec![ExecutorKind::Codex], vec!["gpt-5".to_string()])
            .expect("register");
        assert_eq!(first.id, second.id);
        assert_eq!(second.models, vec!["gpt-5"]);
        assert_eq!(service.list().len(), 1);
    }

    #[test]
    fn test_prune_keeps_busy_workers() {
        let (service, _queue, _paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let idle = service
            .register("idle", vec![ExecutorKind::Codex], vec![])
            .expect("register");
        let busy = service
            .register("busy", vec![ExecutorKind::Opencodecli], vec![])
            .expect("register");

        // Age both workers past the prune window; give one a running job
        {
            let mut workers = service.workers.write().expect("lock");
            for worker in workers.iter_mut() {
                worker.last_seen = Utc::now() - Duration::minutes(30);
                if worker.id == busy.id {
                    worker.running_job_id = Some("j1".to_string());
                }
            }
        }

        let pruned = service.prune_stale(Utc::now(), &config).expect("prune");
        assert_eq!(pruned, 1);
        assert!(service.get(&idle.id).is_err());
        assert!(service.get(&busy.id).is_ok());
    }

    #[tokio::test]
    async fn test_claim_long_poll_times_out_empty() {
        let (service, queue, _paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let worker = service
            .register("w1", vec![ExecutorKind::Codex], vec![])
            .expect("register");

        let claimed = service
            .claim(&worker.id, ExecutorKind::Codex, 10, &queue, &config)
            .await
            .expect("claim");
        assert!(claimed.is_none());
    }

    #[tokio::test]
    async fn test_claim_returns_bound_pack_and_nonce() {
        let (service, queue, paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let worker = service
            .register("w1", vec![ExecutorKind::Codex], vec![])
            .expect("register");

        let mut job = bound_external_job(&paths, "pack-1");
        job.attestation_nonce = Some("aabb".to_string());
        queue.push(job).expect("push");

        let claim = service
            .claim(&worker.id, ExecutorKind::Codex, 10, &queue, &config)
            .await
            .expect("claim")
            .expect("response");
        assert_eq!(claim.attestation.nonce, "aabb");
        assert_eq!(claim.attestation.algo, "sha256");
        assert_eq!(
            claim.context_pack_v1.expect("pack").pack_json,
            "artifacts/scc_runs/pack-1/rendered_context_pack.json"
        );
    }

    #[tokio::test]
    async fn test_complete_honest_worker_accepted() {
        let (service, queue, paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let worker = service
            .register("w1", vec![ExecutorKind::Codex], vec![])
            .expect("register");

        queue.push(bound_external_job(&paths, "pack-1")).expect("push");
        let claim = service
            .claim(&worker.id, ExecutorKind::Codex, 10, &queue, &config)
            .await
            .expect("claim")
            .expect("response");

        let attestation =
            compute_payload(&paths, "pack-1", &claim.attestation.nonce).expect("payload");
        let payload = CompletePayload {
            worker_id: worker.id.clone(),
            stdout: "done".to_string(),
            stderr: String::new(),
            exit_code: 0,
            attestation,
        };

        let job = service
            .accept_completion(&claim.id, &payload, &queue, &config, Utc::now())
            .expect("complete");
        assert_eq!(job.status, JobStatus::Running, "pipeline finishes the job");
        assert_eq!(job.stdout, "done");
        assert!(job.context_pack_v1_proof.expect("proof").verified);
    }

    #[tokio::test]
    async fn test_complete_wrong_nonce_fails_closed() {
        let (service, queue, paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let worker = service
            .register("w1", vec![ExecutorKind::Codex], vec![])
            .expect("register");

        queue.push(bound_external_job(&paths, "pack-1")).expect("push");
        let claim = service
            .claim(&worker.id, ExecutorKind::Codex, 10, &queue, &config)
            .await
            .expect("claim")
            .expect("response");

        let mut attestation = compute_payload(&paths, "pack-1", "deadbeef").expect("payload");
        attestation.attestation_nonce = "deadbeef".to_string();
        let payload = CompletePayload {
            worker_id: worker.id.clone(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            attestation,
        };

        let job = service
            .accept_completion(&claim.id, &payload, &queue, &config, Utc::now())
            .expect("complete");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("policy_violation"));
        assert_eq!(job.reason.as_deref(), Some("attestation_nonce_mismatch"));
        assert_eq!(job.policy_violations[0].code, "attestation_nonce_mismatch");
        // Proof recorded even on failure
        assert!(job.context_pack_v1_proof.is_some());
    }

    #[tokio::test]
    async fn test_foreign_worker_rejected_without_rescue() {
        let (service, queue, paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let holder = service
            .register("holder", vec![ExecutorKind::Codex], vec![])
            .expect("register");
        let intruder = service
            .register("intruder", vec![ExecutorKind::Codex], vec![])
            .expect("register");

        queue.push(bound_external_job(&paths, "pack-1")).expect("push");
        let claim = service
            .claim(&holder.id, ExecutorKind::Codex, 10, &queue, &config)
            .await
            .expect("claim")
            .expect("response");

        let attestation =
            compute_payload(&paths, "pack-1", &claim.attestation.nonce).expect("payload");
        let payload = CompletePayload {
            worker_id: intruder.id.clone(),
            stdout: String::new(),
            stderr: String::new(),
            exit_code: 0,
            attestation,
        };

        let job = service
            .accept_completion(&claim.id, &payload, &queue, &config, Utc::now())
            .expect("complete");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.policy_violations[0].code, "worker_id_mismatch");
    }

    #[tokio::test]
    async fn test_rescue_after_lease_expiry() {
        let (service, queue, paths, _dir) = setup();
        let config = RuntimeConfig::default();
        let holder = service
            .register("holder", vec![ExecutorKind::Codex], vec![])
            .expect("register");
        let rescuer = service
            .register("rescuer", vec![ExecutorKind::Codex], vec![])
            .expect("register");

        queue.push(bound_external_job(&paths, "pack-1")).expect("push");
        let claim = service
            .claim(&holder.id, ExecutorKind::Codex, 10, &queue, &config)
            .await
            .expect("claim")
            .expect("response");

        let attestation =
            compute_payload(&paths, "pack-1", &claim.attestation.nonce).expect("payload");
        let payload = CompletePayload {
            worker_id: rescuer.id.clone(),
            stdout: "rescued".to_string(),
            stderr: String::new(),
            exit_code: 0,
            attestation,
        };

        // Well past lease + grace
        let later = Utc::now() + Duration::minutes(13);
        let job = service
            .accept_completion(&claim.id, &payload, &queue, &config, later)
            .expect("complete");
        assert_eq!(job.status, JobStatus::Running);
        assert_eq!(job.rescue_count, 1);
        assert_eq!(job.worker_id.as_deref(), Some(rescuer.id.as_str()));
    }
}
