//! End-to-end gateway flows over fake collaborators: dispatch through
//! verdicts, recovery routing, attestation failures, and breaker trips.

use std::sync::Arc;

use factory_core::attestation::compute_payload;
use factory_core::collab::fakes::{
    FakeExecutor, FakeGateSuite, FakeMapStore, FakeRenderer, FakeValidator,
};
use factory_core::collab::ExecOutcome;
use factory_core::domain::{
    EventType, ExecutorKind, JobStatus, Lane, Pins, RunnerKind, SubmitStatus, Task, TaskStatus,
    Verdict,
};
use factory_core::{Collaborators, CompletePayload, FactoryService, RuntimeConfig};
use factory_state::{read_jsonl_all, verify_chain};

struct Harness {
    service: FactoryService,
    _dir: tempfile::TempDir,
}

fn roles_registry() -> serde_json::Value {
    serde_json::json!({
        "schema_version": "scc.roles.v1",
        "roles": {
            "engineer": {
                "read": { "allow": [], "deny": [] },
                "write": { "allow": ["src/**", "tests/**", "docs/**"], "deny": [] }
            },
            "doc": { "read": {}, "write": { "allow": ["docs/**"] } },
            "architect": { "read": {}, "write": { "allow": ["docs/**"] } },
            "pinser": { "read": {}, "write": {} },
            "status_review": { "read": {}, "write": {} }
        }
    })
}

fn harness(
    executor: FakeExecutor,
    gates: FakeGateSuite,
    map_pins: Option<Pins>,
    policy: Option<serde_json::Value>,
) -> Harness {
    let dir = tempfile::tempdir().expect("tempdir");
    let root = dir.path();

    std::fs::create_dir_all(root.join("roles")).expect("mkdir roles");
    std::fs::write(
        root.join("roles/registry.json"),
        serde_json::to_vec_pretty(&roles_registry()).expect("json"),
    )
    .expect("write roles");
    if let Some(policy) = policy {
        std::fs::write(
            root.join("factory_policy.json"),
            serde_json::to_vec_pretty(&policy).expect("json"),
        )
        .expect("write policy");
    }

    let collab = Collaborators {
        map: Arc::new(FakeMapStore {
            pins: map_pins,
            entry_points: vec![],
        }),
        renderer: Arc::new(FakeRenderer::default()),
        validator: Arc::new(FakeValidator::default()),
        executor: Arc::new(executor),
        gates: Arc::new(gates),
    };

    let mut config = RuntimeConfig::default();
    config.prefer_free_models = false;
    let service = FactoryService::open(root, config, collab).expect("service");
    Harness { service, _dir: dir }
}

fn seeded_task(harness: &Harness, runner: RunnerKind) -> Task {
    let root = harness.service.paths.root().to_path_buf();
    std::fs::create_dir_all(root.join("src")).expect("mkdir");
    std::fs::create_dir_all(root.join("tests")).expect("mkdir");
    std::fs::write(root.join("src/a.ts"), "export const a = 1;\n").expect("write");
    std::fs::write(root.join("tests/a.test.ts"), "test body\n").expect("write");

    let mut task = Task::new_atomic("implement feature", "engineer");
    task.files = vec!["src/a.ts".to_string(), "tests/a.test.ts".to_string()];
    task.allowed_tests = vec!["npm test tests/a.test.ts".to_string()];
    task.pins = Some(Pins {
        allowed_paths: vec!["src/a.ts".to_string(), "tests/a.test.ts".to_string()],
        ..Pins::default()
    });
    task.runner = runner;
    task.status = TaskStatus::Ready;
    harness.service.create_task(task).expect("create")
}

#[tokio::test]
async fn happy_engineer_task_reaches_pass_verdict() {
    let h = harness(
        FakeExecutor::succeeding_with(
            "SUBMIT: {\"schema_version\":\"scc.submit.v1\",\"status\":\"DONE\",\"reason_code\":\"\",\"exit_code\":0}\n",
        ),
        FakeGateSuite::passing(),
        None,
        None,
    );
    let task = seeded_task(&h, RunnerKind::Internal);

    let job = h.service.dispatch_task(&task.id).await.expect("dispatch");
    let job = h.service.run_internal_job(&job.id).await.expect("run");

    assert_eq!(job.status, JobStatus::Done);
    assert_eq!(job.verdict.expect("verdict").verdict, Verdict::Pass);

    // Invariant: done atomic task has submit DONE + verdict PASS/ESCALATE
    let task = h.service.get_task(&task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Done);
    let submit = h.service.artifacts.read_submit(&task.id).expect("submit");
    assert_eq!(submit.status, SubmitStatus::Done);
    let verdict = h.service.artifacts.read_verdict(&task.id).expect("verdict");
    assert!(matches!(verdict.verdict, Verdict::Pass | Verdict::Escalate));

    // Chained event logs verify, and the task log is a subset of the
    // global log
    let global = verify_chain(&h.service.paths.state_events_file()).expect("global chain");
    let task_log = verify_chain(&h.service.paths.task_events_file(&task.id)).expect("task chain");
    assert!(global.records >= task_log.records);
    assert!(task_log.records >= 1);
}

#[tokio::test]
async fn map_pins_generation_enables_dispatch() {
    let h = harness(
        FakeExecutor::succeeding_with("ok"),
        FakeGateSuite::passing(),
        Some(Pins {
            allowed_paths: vec!["src/a.ts".to_string(), "tests/a.test.ts".to_string()],
            ..Pins::default()
        }),
        None,
    );
    // Valid map/version.json present
    std::fs::create_dir_all(h.service.paths.root().join("map")).expect("mkdir");
    std::fs::write(
        h.service.paths.map_version_file(),
        serde_json::to_vec_pretty(&serde_json::json!({
            "schema_version": "scc.map_version.v1",
            "hash": "map-hash-1",
            "map_path": "map/source_map.json",
            "generated_at": "2026-01-01T00:00:00Z"
        }))
        .expect("json"),
    )
    .expect("write");

    let task = seeded_task(&h, RunnerKind::Internal);
    h.service
        .board
        .mutate(&task.id, |t| {
            t.pins = None;
            Ok(())
        })
        .expect("clear pins");

    h.service.dispatch_task(&task.id).await.expect("dispatch");

    let task = h.service.get_task(&task.id).expect("task");
    assert_eq!(task.status, TaskStatus::InProgress);
    assert_eq!(task.pins_map_hash.as_deref(), Some("map-hash-1"));
    assert!(h
        .service
        .paths
        .task_pins_dir(&task.id)
        .join("pins.json")
        .exists());
    assert!(h
        .service
        .paths
        .task_pins_dir(&task.id)
        .join("pins.md")
        .exists());
}

#[tokio::test]
async fn retry_exhaustion_opens_dlq_and_routes_lane() {
    // max_total_attempts = 2
    let h = harness(
        FakeExecutor::with_outcomes([ExecOutcome {
            exit_code: Some(1),
            stderr: "executor blew up".to_string(),
            ..ExecOutcome::default()
        }]),
        FakeGateSuite::passing(),
        None,
        Some(serde_json::json!({
            "schema_version": "scc.factory_policy.v1",
            "budgets": {
                "max_children": 12,
                "max_depth": 2,
                "max_total_tokens_budget": 200000,
                "max_total_verify_minutes": 60,
                "max_total_attempts": 2
            }
        })),
    );
    let task = seeded_task(&h, RunnerKind::Internal);

    // Two failing attempts
    for _ in 0..2 {
        let job = h.service.dispatch_task(&task.id).await.expect("dispatch");
        let job = h.service.run_internal_job(&job.id).await.expect("run");
        assert_eq!(job.status, JobStatus::Failed);
        let state = h.service.get_task(&task.id).expect("task");
        assert_eq!(state.status, TaskStatus::Ready);
    }

    // Third dispatch: retry_exhausted, DLQ opened exactly once, lane=dlq
    let err = h.service.dispatch_task(&task.id).await.expect_err("rejected");
    assert!(err.to_string().contains("exhausted"));

    let task = h.service.get_task(&task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);
    assert_eq!(task.lane, Lane::Dlq);
    assert!(task.dlq_opened);

    let entries: Vec<serde_json::Value> =
        read_jsonl_all(&h.service.paths.dlq_file()).expect("dlq");
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0]["reason_code"], "RETRY_EXHAUSTED");
    assert_eq!(entries[0]["status"], "OPEN");
    verify_chain(&h.service.paths.dlq_file()).expect("dlq chain");

    // Bounded-retry invariant held throughout
    assert!(task.dispatch_attempts <= 2);
}

#[tokio::test]
async fn external_completion_with_wrong_nonce_is_policy_violation() {
    let h = harness(
        FakeExecutor::succeeding_with("ok"),
        FakeGateSuite::passing(),
        None,
        None,
    );
    let task = seeded_task(&h, RunnerKind::External);

    h.service.dispatch_task(&task.id).await.expect("dispatch");
    let worker = h
        .service
        .register_worker("w1", vec![ExecutorKind::Codex], vec![])
        .expect("register");
    let claim = h
        .service
        .worker_claim(&worker.id, ExecutorKind::Codex, 10)
        .await
        .expect("claim")
        .expect("job");

    // Running external job invariant
    let running = h.service.queue.get(&claim.id).expect("job");
    assert!(running.worker_id.is_some());
    assert!(running.lease_until.expect("lease") > running.started_at.expect("started"));

    // Complete with a forged nonce
    let pack_id = claim.context_pack_v1.expect("pack").pack_id;
    let mut attestation =
        compute_payload(&h.service.paths, &pack_id, "deadbeef").expect("payload");
    attestation.attestation_nonce = "deadbeef".to_string();

    let job = h
        .service
        .worker_complete(
            &claim.id,
            &CompletePayload {
                worker_id: worker.id.clone(),
                stdout: String::new(),
                stderr: String::new(),
                exit_code: 0,
                attestation,
            },
        )
        .await
        .expect("complete");

    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.reason.as_deref(), Some("attestation_nonce_mismatch"));
    assert_eq!(job.policy_violations[0].code, "attestation_nonce_mismatch");

    let task = h.service.get_task(&task.id).expect("task");
    assert_eq!(task.status, TaskStatus::Failed);

    let events = h.service.events.tail(20);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::PolicyViolation
            && e.task_id.as_deref() == Some(task.id.as_str())));

    // Proof artifact recorded regardless of outcome
    assert!(h
        .service
        .paths
        .task_evidence_dir(&task.id)
        .join("context_pack_v1_proof.json")
        .exists());
}

#[tokio::test]
async fn honest_external_worker_completes_to_pass() {
    let h = harness(
        FakeExecutor::succeeding_with("ok"),
        FakeGateSuite::passing(),
        None,
        None,
    );
    let task = seeded_task(&h, RunnerKind::External);

    h.service.dispatch_task(&task.id).await.expect("dispatch");
    let worker = h
        .service
        .register_worker("w1", vec![ExecutorKind::Codex], vec![])
        .expect("register");
    let claim = h
        .service
        .worker_claim(&worker.id, ExecutorKind::Codex, 10)
        .await
        .expect("claim")
        .expect("job");

    let pack_id = claim.context_pack_v1.expect("pack").pack_id;
    let attestation = compute_payload(&h.service.paths, &pack_id, &claim.attestation.nonce)
        .expect("payload");

    let job = h
        .service
        .worker_complete(
            &claim.id,
            &CompletePayload {
                worker_id: worker.id,
                stdout: "work done".to_string(),
                stderr: String::new(),
                exit_code: 0,
                attestation,
            },
        )
        .await
        .expect("complete");

    assert_eq!(job.status, JobStatus::Done);
    assert!(job.context_pack_v1_proof.expect("proof").verified);
    assert_eq!(
        h.service.get_task(&task.id).expect("task").status,
        TaskStatus::Done
    );
}

#[tokio::test]
async fn three_consecutive_ci_failures_trip_quarantine() {
    let policy = serde_json::json!({
        "schema_version": "scc.factory_policy.v1",
        "circuit_breakers": [{
            "name": "ci_break",
            "match": { "event_type": "CI_FAILED" },
            "trip": { "consecutive_failures": 3 },
            "action": { "lane": "quarantine" }
        }]
    });
    let h = harness(
        FakeExecutor::succeeding_with("ok"),
        FakeGateSuite::ci_failing(),
        None,
        Some(policy),
    );

    for i in 0..3 {
        let mut task = seeded_task(&h, RunnerKind::Internal);
        task = h
            .service
            .board
            .update_task(
                &task.id,
                factory_core::TaskPatch {
                    title: Some(format!("ci victim {i}")),
                    ..factory_core::TaskPatch::default()
                },
            )
            .expect("patch");
        let job = h.service.dispatch_task(&task.id).await.expect("dispatch");
        h.service.run_internal_job(&job.id).await.expect("run");
    }

    assert!(h
        .service
        .breakers
        .quarantine_active(chrono::Utc::now())
        .is_some());

    // Non-allowlisted mainlane dispatch is rejected with `quarantined`
    let task = seeded_task(&h, RunnerKind::Internal);
    let err = h.service.dispatch_task(&task.id).await.expect_err("rejected");
    assert!(err.to_string().contains("quarantine"));

    let events = h.service.events.tail(50);
    assert!(events
        .iter()
        .any(|e| e.event_type == EventType::QuarantineEntered));
}

#[tokio::test]
async fn wip_cap_leaves_task_ready_and_is_recoverable() {
    let policy = serde_json::json!({
        "schema_version": "scc.factory_policy.v1",
        "wip_limits": { "exec_internal": 1 }
    });
    let h = harness(
        FakeExecutor::succeeding_with("ok"),
        FakeGateSuite::passing(),
        None,
        Some(policy),
    );

    let first = seeded_task(&h, RunnerKind::Internal);
    let second = seeded_task(&h, RunnerKind::Internal);

    h.service.dispatch_task(&first.id).await.expect("first dispatch");
    let err = h
        .service
        .dispatch_task(&second.id)
        .await
        .expect_err("capped");
    assert!(err.to_string().contains("WIP"));
    assert_eq!(
        h.service.get_task(&second.id).expect("task").status,
        TaskStatus::Ready
    );

    // Finish the first job; the second dispatch now fits
    let job = h.service.queue.open_job_for_task(&first.id).expect("job");
    h.service.run_internal_job(&job.id).await.expect("run");
    h.service
        .dispatch_task(&second.id)
        .await
        .expect("second dispatch fits");
}
