//! Designer splits: turning a parent task into atomic children.
//!
//! A split run is pinned to the codex executor with the strict designer
//! model, must not touch the repo, and must emit a `SPLIT:` line with the
//! child payloads. Applying the result inserts the children under the
//! parent's budget caps.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::collab::ExecRequest;
use crate::domain::{
    reason, EventType, ExecutorKind, FactoryError, Job, JobStatus, JobTaskType, Lane, Result,
    RunnerKind, StateEvent, Task, TaskKind, TaskStatus,
};
use crate::service::FactoryService;

/// Stdout marker carrying the split result.
pub const SPLIT_MARKER: &str = "SPLIT:";

/// One child in a designer split result.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SplitChildSpec {
    pub title: String,
    #[serde(default)]
    pub goal: String,
    #[serde(default = "default_child_role")]
    pub role: String,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(rename = "allowedTests", default)]
    pub allowed_tests: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pins: Option<crate::domain::Pins>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub area: Option<String>,
}

fn default_child_role() -> String {
    "engineer".to_string()
}

impl FactoryService {
    /// Start a designer split run for a parent task. The run executes
    /// inline on the internal runner and leaves its output on the job.
    pub async fn start_split(&self, parent_id: &str) -> Result<Job> {
        let parent = self.board.get_task(parent_id)?;
        if parent.kind != TaskKind::Parent {
            return Err(FactoryError::InvalidTask(format!(
                "task {parent_id} is not a parent"
            )));
        }
        if !matches!(
            parent.status,
            TaskStatus::Backlog | TaskStatus::Ready | TaskStatus::NeedsSplit
        ) {
            return Err(FactoryError::InvalidTransition(format!(
                "parent {parent_id} is {:?}, cannot split",
                parent.status
            )));
        }

        // Designer runs are pinned: codex + the strict designer model.
        let pins = parent.pins.clone().unwrap_or_default();
        let (snapshot, _) = crate::snapshot::capture_pre_snapshot(self.paths.root(), &parent, &pins);

        let prompt = format!(
            "Split the following task into at most {} atomic children.\n\
             Respond with one line starting with `{SPLIT_MARKER}` followed by a JSON array \
             of child specs. Do not modify any repository file.\n\n\
             title: {}\ngoal: {}",
            self.policy.current().budgets().max_children,
            parent.title,
            parent.goal,
        );

        let mut job = Job::new(
            Some(parent.id.clone()),
            prompt,
            self.config.strict_designer_model.clone(),
            ExecutorKind::Codex,
            JobTaskType::BoardSplit,
            RunnerKind::Internal,
            self.policy.current().lane_priority_score(parent.lane),
        );
        job.pre_snapshot = Some(snapshot);
        job.status = JobStatus::Running;
        job.started_at = Some(Utc::now());
        job.attempts = 1;
        let job = self.queue.push(job)?;

        self.board.mutate(&parent.id, |t| {
            t.split_job_id = Some(job.id.clone());
            Ok(())
        })?;

        let outcome = self
            .collab
            .executor
            .run(&ExecRequest {
                executor: ExecutorKind::Codex,
                model: job.model.clone(),
                prompt: job.prompt.clone(),
                timeout_ms: parent
                    .timeout_ms
                    .unwrap_or(self.config.default_job_timeout_ms),
            })
            .await;

        let job = self.queue.mutate(&job.id, |j| {
            j.stdout = outcome.stdout.clone();
            j.stderr = outcome.stderr.clone();
            j.exit_code = outcome.exit_code;
            j.finished_at = Some(Utc::now());
            if outcome.succeeded() {
                j.status = JobStatus::Done;
            } else {
                j.status = JobStatus::Failed;
                j.reason = Some(if outcome.timed_out {
                    reason::TIMEOUT.to_string()
                } else {
                    reason::TOOLING_ERROR.to_string()
                });
            }
            Ok(())
        })?;

        info!(parent_id, job_id = %job.id, status = ?job.status, "split run finished");
        Ok(job)
    }

    /// Apply the split result: validate the output and the no-touch rule,
    /// then create the children.
    pub async fn apply_split(&self, parent_id: &str) -> Result<Vec<Task>> {
        let parent = self.board.get_task(parent_id)?;
        let job_id = parent
            .split_job_id
            .clone()
            .ok_or_else(|| FactoryError::InvalidTask(format!("parent {parent_id} has no split job")))?;
        let job = self.queue.get(&job_id)?;
        if job.status != JobStatus::Done {
            return Err(FactoryError::InvalidTransition(format!(
                "split job {job_id} is {:?}",
                job.status
            )));
        }

        // The split run must not have touched the repo.
        if let Some(pre) = &job.pre_snapshot {
            let diff = crate::snapshot::diff_snapshot(self.paths.root(), pre);
            if !diff.touched_files.is_empty() {
                self.queue.mutate(&job_id, |j| {
                    j.status = JobStatus::Failed;
                    j.reason = Some(reason::SPLIT_TOUCHED_REPO.to_string());
                    Ok(())
                })?;
                return Err(FactoryError::InvalidTask(format!(
                    "split run touched {:?}",
                    diff.touched_files
                )));
            }
        }

        let specs = match parse_split_output(&job.stdout) {
            Some(specs) if !specs.is_empty() => specs,
            _ => {
                self.queue.mutate(&job_id, |j| {
                    j.status = JobStatus::Failed;
                    j.reason = Some(reason::SPLIT_OUTPUT_INVALID.to_string());
                    Ok(())
                })?;
                return Err(FactoryError::InvalidTask(
                    "split output missing or invalid".to_string(),
                ));
            }
        };

        let mut children = Vec::with_capacity(specs.len());
        for spec in specs {
            let mut child = Task::new_atomic(spec.title, spec.role);
            child.goal = spec.goal;
            child.parent_id = Some(parent.id.clone());
            child.files = spec.files;
            child.allowed_tests = spec.allowed_tests;
            child.pins = spec.pins;
            child.lane = spec.lane.unwrap_or(parent.lane);
            child.area = spec.area.or_else(|| parent.area.clone());
            child.runner = parent.runner;
            child.status = TaskStatus::Ready;
            children.push(self.board.create_task(child)?);
        }

        self.board.ensure_parent_ledgers(&parent.id)?;
        self.board.mutate(&parent.id, |t| {
            t.status = TaskStatus::InProgress;
            Ok(())
        })?;

        let event = StateEvent::for_task(EventType::Success, parent.id.clone())
            .with_job(job_id)
            .with_reason("split_applied");
        self.events.emit(&event)?;

        info!(parent_id, children = children.len(), "split applied");
        Ok(children)
    }
}

/// Extract the `SPLIT:` payload from designer stdout.
pub fn parse_split_output(stdout: &str) -> Option<Vec<SplitChildSpec>> {
    stdout
        .lines()
        .rev()
        .find_map(|line| line.strip_prefix(SPLIT_MARKER))
        .and_then(|rest| serde_json::from_str(rest.trim()).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collab::fakes::{FakeExecutor, FakeGateSuite};
    use crate::service::testkit::harness_with;

    fn split_stdout(children: serde_json::Value) -> String {
        format!("analysis...\n{SPLIT_MARKER} {children}\n")
    }

    fn parent_task(harness: &crate::service::testkit::TestHarness) -> Task {
        let mut parent = Task::new_atomic("build the feature", "designer");
        parent.kind = TaskKind::Parent;
        parent.goal = "large goal".to_string();
        parent.status = TaskStatus::Ready;
        harness.service.create_task(parent).expect("parent")
    }

    #[test]
    fn test_parse_split_output() {
        let stdout = split_stdout(serde_json::json!([
            { "title": "part one", "files": ["src/a.ts"], "allowedTests": ["pytest -q"] }
        ]));
        let specs = parse_split_output(&stdout).expect("specs");
        assert_eq!(specs.len(), 1);
        assert_eq!(specs[0].title, "part one");
        assert_eq!(specs[0].role, "engineer");

        assert!(parse_split_output("no marker here").is_none());
        assert!(parse_split_output("SPLIT: not json").is_none());
    }

    #[tokio::test]
    async fn test_split_and_apply_creates_children() {
        let stdout = split_stdout(serde_json::json!([
            { "title": "part one", "files": ["src/a.ts"], "allowedTests": ["npm test tests/a.test.ts"] },
            { "title": "part two", "role": "doc", "files": ["docs/guide.md"], "allowedTests": ["pytest -q"] }
        ]));
        let harness = harness_with(
            FakeExecutor::succeeding_with(stdout),
            FakeGateSuite::passing(),
            None,
        );
        let parent = parent_task(&harness);

        let job = harness.service.start_split(&parent.id).await.expect("split");
        assert_eq!(job.status, JobStatus::Done);
        assert_eq!(job.task_type, JobTaskType::BoardSplit);
        assert_eq!(job.model, harness.service.config.strict_designer_model);

        let children = harness.service.apply_split(&parent.id).await.expect("apply");
        assert_eq!(children.len(), 2);
        assert!(children
            .iter()
            .all(|c| c.parent_id.as_deref() == Some(parent.id.as_str())));
        assert_eq!(children[1].role, "doc");

        let parent = harness.service.get_task(&parent.id).expect("parent");
        assert_eq!(parent.status, TaskStatus::InProgress);

        // Parent ledgers materialized
        assert!(harness
            .service
            .paths
            .task_artifacts(&parent.id)
            .join("progress_ledger.json")
            .exists());
    }

    #[tokio::test]
    async fn test_invalid_split_output_fails_typed() {
        let harness = harness_with(
            FakeExecutor::succeeding_with("I refuse to answer in the format"),
            FakeGateSuite::passing(),
            None,
        );
        let parent = parent_task(&harness);

        harness.service.start_split(&parent.id).await.expect("split");
        let err = harness
            .service
            .apply_split(&parent.id)
            .await
            .expect_err("invalid");
        assert!(err.to_string().contains("split output"));

        let job_id = harness
            .service
            .get_task(&parent.id)
            .expect("parent")
            .split_job_id
            .expect("job");
        let job = harness.service.queue.get(&job_id).expect("job");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.reason.as_deref(), Some("split_output_invalid"));
    }

    #[tokio::test]
    async fn test_split_touching_repo_is_rejected() {
        let stdout = split_stdout(serde_json::json!([
            { "title": "part one", "files": ["src/a.ts"], "allowedTests": ["pytest -q"] }
        ]));
        let harness = harness_with(
            FakeExecutor::succeeding_with(stdout),
            FakeGateSuite::passing(),
            None,
        );

        // Parent with a pinned file the split run will "modify"
        std::fs::create_dir_all(harness.dir.path().join("src")).expect("mkdir");
        std::fs::write(harness.dir.path().join("src/a.ts"), "before").expect("write");
        let mut parent = Task::new_atomic("build it", "designer");
        parent.kind = TaskKind::Parent;
        parent.files = vec!["src/a.ts".to_string()];
        parent.status = TaskStatus::Ready;
        let parent = harness.service.create_task(parent).expect("parent");

        harness.service.start_split(&parent.id).await.expect("split");
        std::fs::write(harness.dir.path().join("src/a.ts"), "tampered").expect("write");

        let err = harness
            .service
            .apply_split(&parent.id)
            .await
            .expect_err("touched");
        assert!(err.to_string().contains("touched"));

        let job_id = harness
            .service
            .get_task(&parent.id)
            .expect("parent")
            .split_job_id
            .expect("job");
        assert_eq!(
            harness
                .service
                .queue
                .get(&job_id)
                .expect("job")
                .reason
                .as_deref(),
            Some("split_touched_repo")
        );
    }

    #[tokio::test]
    async fn test_split_rejects_non_parent() {
        let harness = harness_with(
            FakeExecutor::succeeding_with("x"),
            FakeGateSuite::passing(),
            None,
        );
        let atomic = crate::service::testkit::seeded_engineer_task(&harness);
        assert!(harness.service.start_split(&atomic.id).await.is_err());
    }
}
