//! Repo-root-anchored path layout for all persisted gateway state.

use std::path::{Component, Path, PathBuf};

use crate::error::{StoreError, StoreResult};

/// Canonical on-disk layout under a single repo root.
///
/// Every accessor returns an absolute path inside the root. Repo-relative
/// inputs (task files, pins paths) go through [`FactoryPaths::resolve`],
/// which rejects absolute paths and `..` traversal.
#[derive(Debug, Clone)]
pub struct FactoryPaths {
    root: PathBuf,
}

impl FactoryPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolve a repo-relative path, refusing escapes.
    pub fn resolve(&self, rel: &str) -> StoreResult<PathBuf> {
        let candidate = Path::new(rel);
        if candidate.is_absolute() {
            return Err(StoreError::PathEscape(rel.to_string()));
        }
        for component in candidate.components() {
            if matches!(component, Component::ParentDir) {
                return Err(StoreError::PathEscape(rel.to_string()));
            }
        }
        Ok(self.root.join(candidate))
    }

    // ---- state collections --------------------------------------------

    pub fn board_file(&self) -> PathBuf {
        self.root.join("board.json")
    }

    pub fn board_meta_file(&self) -> PathBuf {
        self.root.join("board_meta.json")
    }

    pub fn jobs_file(&self) -> PathBuf {
        self.root.join("jobs.json")
    }

    pub fn workers_file(&self) -> PathBuf {
        self.root.join("workers.json")
    }

    pub fn breakers_file(&self) -> PathBuf {
        self.root.join("breakers.json")
    }

    pub fn repo_health_file(&self) -> PathBuf {
        self.root.join("repo_health.json")
    }

    pub fn fuses_file(&self) -> PathBuf {
        self.root.join("fuses.json")
    }

    pub fn hooks_state_file(&self) -> PathBuf {
        self.root.join("hooks_state.json")
    }

    pub fn router_state_file(&self) -> PathBuf {
        self.root.join("router_state.json")
    }

    pub fn state_events_file(&self) -> PathBuf {
        self.root.join("state_events.jsonl")
    }

    pub fn failures_file(&self) -> PathBuf {
        self.root.join("failures.jsonl")
    }

    // ---- config inputs ------------------------------------------------

    pub fn factory_policy_file(&self) -> PathBuf {
        self.root.join("factory_policy.json")
    }

    pub fn roles_registry_file(&self) -> PathBuf {
        self.root.join("roles").join("registry.json")
    }

    pub fn role_skill_matrix_file(&self) -> PathBuf {
        self.root.join("roles").join("role_skill_matrix.json")
    }

    pub fn skills_registry_file(&self) -> PathBuf {
        self.root.join("skills").join("registry.json")
    }

    pub fn map_version_file(&self) -> PathBuf {
        self.root.join("map").join("version.json")
    }

    pub fn eval_manifest_file(&self) -> PathBuf {
        self.root.join("eval").join("eval_manifest.json")
    }

    pub fn runtime_env_file(&self) -> PathBuf {
        self.root
            .join("oc-scc-local")
            .join("config")
            .join("runtime.env")
    }

    pub fn prompts_registry_file(&self) -> PathBuf {
        self.root
            .join("oc-scc-local")
            .join("prompts")
            .join("registry.json")
    }

    // ---- artifacts ----------------------------------------------------

    pub fn artifacts_root(&self) -> PathBuf {
        self.root.join("artifacts")
    }

    pub fn task_artifacts(&self, task_id: &str) -> PathBuf {
        self.artifacts_root().join(task_id)
    }

    pub fn task_events_file(&self, task_id: &str) -> PathBuf {
        self.task_artifacts(task_id).join("events.jsonl")
    }

    pub fn task_evidence_dir(&self, task_id: &str) -> PathBuf {
        self.task_artifacts(task_id).join("evidence")
    }

    pub fn task_pins_dir(&self, task_id: &str) -> PathBuf {
        self.task_artifacts(task_id).join("pins")
    }

    pub fn executor_logs_dir(&self) -> PathBuf {
        self.artifacts_root().join("executor_logs")
    }

    pub fn dlq_file(&self) -> PathBuf {
        self.artifacts_root().join("dlq").join("dlq.jsonl")
    }

    pub fn scc_run_dir(&self, pack_id: &str) -> PathBuf {
        self.artifacts_root().join("scc_runs").join(pack_id)
    }

    pub fn rendered_pack_file(&self, pack_id: &str) -> PathBuf {
        self.scc_run_dir(pack_id).join("rendered_context_pack.json")
    }

    pub fn task_bundle_dir(&self, pack_id: &str) -> PathBuf {
        self.scc_run_dir(pack_id).join("task_bundle")
    }

    pub fn instinct_dir(&self) -> PathBuf {
        self.root.join("instinct")
    }
}
