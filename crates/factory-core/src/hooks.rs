//! Reactive hooks: rate-limited observers over the event/failure stream
//! that spawn typed response tasks.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use factory_state::{
    append_jsonl, load_json, read_jsonl_tail, save_json_atomic, FactoryPaths, WriteMode,
};

use crate::collab::RenderedPack;
use crate::domain::{ExecutorKind, Lane, RunnerKind, Task, TaskStatus};
use crate::policy::HookThresholds;

/// One failure observation (`failures.jsonl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureRecord {
    pub ts: DateTime<Utc>,
    pub reason: String,
    #[serde(default)]
    pub taxonomy: String,
    #[serde(default)]
    pub signature: String,
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub task_class: String,
    #[serde(default)]
    pub executor: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct HooksState {
    #[serde(default)]
    last_fired: BTreeMap<String, DateTime<Utc>>,
    #[serde(default)]
    last_top_reason: Option<String>,
    #[serde(default)]
    last_top_reason_count: usize,
    #[serde(default)]
    five_whys_baseline: usize,
    #[serde(default)]
    last_top_cluster: Option<String>,
}

/// A failure cluster produced by the instinct hook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailureCluster {
    pub key: String,
    pub count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    #[serde(default)]
    pub sample_task_ids: Vec<String>,
}

pub struct HookEngine {
    paths: FactoryPaths,
    thresholds: HookThresholds,
    state: RwLock<HooksState>,
}

impl HookEngine {
    pub fn load(paths: FactoryPaths, thresholds: HookThresholds) -> Self {
        let state = load_json(&paths.hooks_state_file())
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            paths,
            thresholds,
            state: RwLock::new(state),
        }
    }

    fn persist(&self, state: &HooksState) {
        let _ = save_json_atomic(&self.paths.hooks_state_file(), state, WriteMode::BestEffort);
    }

    /// Rate limiter shared by every hook. Stamps and allows when the key
    /// has not fired within the window.
    fn rate_limit_ok(&self, key: &str, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let window = chrono::Duration::milliseconds(self.thresholds.hook_rate_limit_ms as i64);
        let allowed = state
            .last_fired
            .get(key)
            .map(|last| now - *last >= window)
            .unwrap_or(true);
        if allowed {
            state.last_fired.insert(key.to_string(), now);
            self.persist(&state);
        }
        allowed
    }

    /// Record a failure for the learned-patterns / five-whys / instinct
    /// hooks.
    pub fn record_failure(&self, record: &FailureRecord) {
        let _ = append_jsonl(&self.paths.failures_file(), record);
    }

    fn recent_failures(&self, n: usize) -> Vec<FailureRecord> {
        read_jsonl_tail(&self.paths.failures_file(), n).unwrap_or_default()
    }

    // ---- stability ----------------------------------------------------

    /// Queue overload or saturated WIP with a backlog spawns a stability
    /// response.
    pub fn check_stability(
        &self,
        queued_internal: usize,
        wip_total_saturated: bool,
        queued_total: usize,
    ) -> Option<Task> {
        let overloaded = queued_internal >= self.thresholds.stability_queued_threshold
            || (wip_total_saturated && queued_total > 0);
        if !overloaded || !self.rate_limit_ok("stability", Utc::now()) {
            return None;
        }
        info!(queued_internal, "stability hook fired");
        let mut task = response_task(
            "stability_overload_v1",
            "architect",
            format!("Stabilize scheduler overload ({queued_internal} queued internal)"),
        );
        task.allowed_executors = vec![ExecutorKind::Codex];
        task.lane = Lane::Fastlane;
        Some(task)
    }

    // ---- learned patterns ---------------------------------------------

    /// Fires when the dominant failure reason shifts, or its count grew by
    /// the configured delta.
    pub fn check_learned_patterns(&self) -> Option<Task> {
        let failures = self.recent_failures(200);
        let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
        for failure in &failures {
            *counts.entry(failure.reason.as_str()).or_insert(0) += 1;
        }
        let (top_reason, top_count) = counts
            .into_iter()
            .max_by_key(|(_, count)| *count)
            .map(|(reason, count)| (reason.to_string(), count))?;

        let fire = {
            let state = self.state.read().unwrap_or_else(|p| p.into_inner());
            match &state.last_top_reason {
                Some(last) if *last == top_reason => {
                    top_count.saturating_sub(state.last_top_reason_count)
                        >= self.thresholds.learned_patterns_delta_threshold
                }
                Some(_) => true,
                None => top_count >= self.thresholds.learned_patterns_delta_threshold,
            }
        };
        if !fire || !self.rate_limit_ok("learned_patterns", Utc::now()) {
            return None;
        }

        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            state.last_top_reason = Some(top_reason.clone());
            state.last_top_reason_count = top_count;
            self.persist(&state);
        }

        let mut task = response_task(
            "learned_patterns_response_v1",
            "architect",
            format!("Respond to failure pattern shift: {top_reason} x{top_count}"),
        );
        task.pointers = Some(serde_json::json!({ "top_reason": top_reason, "count": top_count }));
        Some(task)
    }

    // ---- token CFO -----------------------------------------------------

    /// Detects context packs that carried mostly unused content.
    pub fn check_token_cfo(&self, pack: &RenderedPack) -> Option<Task> {
        if pack.unused_ratio < self.thresholds.token_cfo_unused_ratio
            || pack.included_sections < self.thresholds.token_cfo_min_included
        {
            return None;
        }
        if !self.rate_limit_ok("token_cfo", Utc::now()) {
            return None;
        }
        let mut task = response_task(
            "token_cfo_response_v1",
            "architect",
            format!(
                "Trim context pack waste (unused_ratio={:.2})",
                pack.unused_ratio
            ),
        );
        task.pointers = Some(serde_json::json!({ "pack_id": pack.pack_id }));
        Some(task)
    }

    // ---- five whys -----------------------------------------------------

    /// Fires when `failures.jsonl` has grown enough since the last trigger.
    pub fn check_five_whys(&self) -> Option<Task> {
        let total = self.recent_failures(usize::MAX).len();
        let fire = {
            let state = self.state.read().unwrap_or_else(|p| p.into_inner());
            total.saturating_sub(state.five_whys_baseline)
                >= self.thresholds.five_whys_min_new_failures
        };
        if !fire || !self.rate_limit_ok("five_whys", Utc::now()) {
            return None;
        }
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            state.five_whys_baseline = total;
            self.persist(&state);
        }
        Some(response_task(
            "five_whys_response_v1",
            "architect",
            format!("Run five-whys analysis over {total} recorded failures"),
        ))
    }

    // ---- instinct ------------------------------------------------------

    /// Cluster failures and, when the dominant cluster changes and is big
    /// enough, spawn an instinct-builder response. Always refreshes the
    /// instinct artifacts.
    pub fn run_instinct(&self) -> Option<Task> {
        let failures = self.recent_failures(500);
        if failures.is_empty() {
            return None;
        }
        let clusters = cluster_failures(&failures);
        self.write_instinct_artifacts(&clusters);

        let top = clusters.first()?;
        if top.count < self.thresholds.instinct_min_cluster {
            return None;
        }
        let changed = {
            let state = self.state.read().unwrap_or_else(|p| p.into_inner());
            state.last_top_cluster.as_deref() != Some(top.key.as_str())
        };
        if !changed || !self.rate_limit_ok("instinct", Utc::now()) {
            return None;
        }
        {
            let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
            state.last_top_cluster = Some(top.key.clone());
            self.persist(&state);
        }

        let mut task = response_task(
            "instinct_builder_response_v1",
            "architect",
            format!("Build instinct playbook for cluster {} (x{})", top.key, top.count),
        );
        task.pointers = Some(serde_json::json!({ "cluster": top.key, "count": top.count }));
        Some(task)
    }

    fn write_instinct_artifacts(&self, clusters: &[FailureCluster]) {
        let dir = self.paths.instinct_dir();
        let _ = std::fs::create_dir_all(&dir);
        let _ = save_json_atomic(&dir.join("patterns.json"), &clusters, WriteMode::BestEffort);

        let mut playbooks = String::from("playbooks:\n");
        let mut skills = String::from("skills:\n");
        for cluster in clusters.iter().take(10) {
            playbooks.push_str(&format!(
                "  - cluster: \"{}\"\n    occurrences: {}\n    action: investigate\n",
                cluster.key, cluster.count
            ));
            skills.push_str(&format!(
                "  - name: \"handle_{}\"\n    draft: true\n",
                cluster.key.replace(['|', '/', ' '], "_")
            ));
        }
        let _ = std::fs::write(dir.join("playbooks.yaml"), playbooks);
        let _ = std::fs::write(dir.join("skills_draft.yaml"), skills);
    }

    // ---- feedback ------------------------------------------------------

    /// Generic feedback hook, rate-limited per `type:reason` key.
    pub fn check_feedback(&self, event_type: &str, reason: &str) -> Option<Task> {
        let key = format!("feedback:{event_type}:{reason}");
        if !self.rate_limit_ok(&key, Utc::now()) {
            return None;
        }
        let mut task = response_task(
            "feedback_response_v1",
            "architect",
            format!("Investigate recurring signal {event_type}:{reason}"),
        );
        task.pointers = Some(serde_json::json!({ "type": event_type, "reason": reason }));
        Some(task)
    }
}

/// Cluster failures by their identity key, then secondary-merge near-identical
/// keys (simhash hamming distance <= 6) within the same lane.
pub fn cluster_failures(failures: &[FailureRecord]) -> Vec<FailureCluster> {
    let mut primary: BTreeMap<String, FailureCluster> = BTreeMap::new();
    for failure in failures {
        let key = format!(
            "{}|{}|{}|{}|{}|{}",
            failure.taxonomy,
            failure.reason,
            failure.signature,
            failure.role,
            failure.task_class,
            failure.executor
        );
        let cluster = primary.entry(key.clone()).or_insert_with(|| FailureCluster {
            key,
            count: 0,
            lane: failure.lane,
            sample_task_ids: Vec::new(),
        });
        cluster.count += 1;
        if let Some(task_id) = &failure.task_id {
            if cluster.sample_task_ids.len() < 3 && !cluster.sample_task_ids.contains(task_id) {
                cluster.sample_task_ids.push(task_id.clone());
            }
        }
    }

    // Secondary merge
    let mut merged: Vec<FailureCluster> = Vec::new();
    for cluster in primary.into_values() {
        let near = merged.iter_mut().find(|existing| {
            existing.lane == cluster.lane
                && hamming(simhash(&existing.key), simhash(&cluster.key)) <= 6
        });
        match near {
            Some(existing) => {
                existing.count += cluster.count;
                for id in cluster.sample_task_ids {
                    if existing.sample_task_ids.len() < 3 && !existing.sample_task_ids.contains(&id)
                    {
                        existing.sample_task_ids.push(id);
                    }
                }
            }
            None => merged.push(cluster),
        }
    }

    merged.sort_by(|a, b| b.count.cmp(&a.count).then(a.key.cmp(&b.key)));
    merged
}

/// 64-bit simhash over whitespace/pipe-separated tokens.
pub fn simhash(text: &str) -> u64 {
    let mut weights = [0i32; 64];
    for token in text.split(['|', ' ', '/', ':']).filter(|t| !t.is_empty()) {
        let hash = fxhash(token);
        for (bit, weight) in weights.iter_mut().enumerate() {
            if hash & (1u64 << bit) != 0 {
                *weight += 1;
            } else {
                *weight -= 1;
            }
        }
    }
    let mut result = 0u64;
    for (bit, weight) in weights.iter().enumerate() {
        if *weight > 0 {
            result |= 1u64 << bit;
        }
    }
    result
}

fn hamming(a: u64, b: u64) -> u32 {
    (a ^ b).count_ones()
}

/// FNV-1a, enough for token hashing.
fn fxhash(token: &str) -> u64 {
    let mut hash = 0xcbf2_9ce4_8422_2325u64;
    for byte in token.as_bytes() {
        hash ^= *byte as u64;
        hash = hash.wrapping_mul(0x0000_0100_0000_01b3);
    }
    hash
}

fn response_task(class_id: &str, role: &str, title: String) -> Task {
    let mut task = Task::new_atomic(title, role);
    task.task_class_id = Some(class_id.to_string());
    task.status = TaskStatus::Ready;
    task.lane = Lane::Mainlane;
    task.runner = RunnerKind::Internal;
    task.files = vec!["docs/factory_notes.md".to_string()];
    task.allowed_tests = vec!["python -m pytest -q".to_string()];
    task
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn engine() -> (HookEngine, tempfile::TempDir) {
        let dir = tempdir().expect("tempdir");
        let engine = HookEngine::load(
            FactoryPaths::new(dir.path()),
            HookThresholds {
                hook_rate_limit_ms: 0,
                ..HookThresholds::default()
            },
        );
        (engine, dir)
    }

    fn failure(reason: &str, signature: &str, lane: Lane) -> FailureRecord {
        FailureRecord {
            ts: Utc::now(),
            reason: reason.to_string(),
            taxonomy: "ci".to_string(),
            signature: signature.to_string(),
            role: "engineer".to_string(),
            task_class: "refactor_v1".to_string(),
            executor: "codex".to_string(),
            lane: Some(lane),
            task_id: Some("t1".to_string()),
        }
    }

    #[test]
    fn test_stability_hook_thresholds() {
        let (engine, _dir) = engine();
        assert!(engine.check_stability(2, false, 2).is_none());

        let task = engine.check_stability(8, false, 8).expect("fires");
        assert_eq!(
            task.task_class_id.as_deref(),
            Some("stability_overload_v1")
        );
        assert_eq!(task.allowed_executors, vec![ExecutorKind::Codex]);
        assert_eq!(task.lane, Lane::Fastlane);

        // Saturated WIP with backlog also fires
        assert!(engine.check_stability(0, true, 1).is_some());
        assert!(engine.check_stability(0, true, 0).is_none());
    }

    #[test]
    fn test_rate_limit_suppresses_repeat_fires() {
        let dir = tempdir().expect("tempdir");
        let engine = HookEngine::load(
            FactoryPaths::new(dir.path()),
            HookThresholds {
                hook_rate_limit_ms: 60_000,
                ..HookThresholds::default()
            },
        );
        assert!(engine.check_stability(10, false, 10).is_some());
        assert!(engine.check_stability(10, false, 10).is_none());
    }

    #[test]
    fn test_learned_patterns_fires_on_shift() {
        let (engine, _dir) = engine();
        for _ in 0..5 {
            engine.record_failure(&failure("ci_failed", "sig-a", Lane::Mainlane));
        }
        let task = engine.check_learned_patterns().expect("first fire");
        assert!(task.title.contains("ci_failed"));

        // Same top reason, no growth: silent
        assert!(engine.check_learned_patterns().is_none());

        // New dominant reason: fires again
        for _ in 0..8 {
            engine.record_failure(&failure("timeout", "sig-b", Lane::Mainlane));
        }
        let task = engine.check_learned_patterns().expect("shift fire");
        assert!(task.title.contains("timeout"));
    }

    #[test]
    fn test_token_cfo_threshold() {
        let (engine, _dir) = engine();
        let lean = RenderedPack {
            pack_id: "p1".to_string(),
            text: String::new(),
            json: serde_json::Value::Null,
            included_sections: 5,
            unused_ratio: 0.2,
        };
        assert!(engine.check_token_cfo(&lean).is_none());

        let wasteful = RenderedPack {
            unused_ratio: 0.75,
            included_sections: 4,
            ..lean
        };
        let task = engine.check_token_cfo(&wasteful).expect("fires");
        assert_eq!(task.task_class_id.as_deref(), Some("token_cfo_response_v1"));
    }

    #[test]
    fn test_five_whys_growth_trigger() {
        let (engine, _dir) = engine();
        for _ in 0..9 {
            engine.record_failure(&failure("x", "s", Lane::Mainlane));
        }
        assert!(engine.check_five_whys().is_none());

        engine.record_failure(&failure("x", "s", Lane::Mainlane));
        assert!(engine.check_five_whys().is_some());
        // Baseline advanced: quiet until another K failures
        assert!(engine.check_five_whys().is_none());
    }

    #[test]
    fn test_cluster_counts_and_lane_isolation() {
        let mut failures = Vec::new();
        for _ in 0..4 {
            failures.push(failure("ci_failed", "assertion in parser", Lane::Mainlane));
        }
        // Same key in a different lane is never merged into the mainlane
        // cluster.
        failures.push(failure("ci_failed", "assertion in parser", Lane::Fastlane));

        let clusters = cluster_failures(&failures);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].count, 4);
        assert_eq!(clusters[0].lane, Some(Lane::Mainlane));
        assert_eq!(clusters[1].count, 1);
    }

    #[test]
    fn test_secondary_merge_follows_simhash_distance() {
        let sig_a = "assertion in parser module deep stack trace overflow handling";
        let sig_b = "assertion in parser module deep stack trace overflow handlinh";
        let key = |sig: &str| format!("ci|ci_failed|{sig}|engineer|refactor_v1|codex");
        let distance = hamming(simhash(&key(sig_a)), simhash(&key(sig_b)));

        let failures = vec![
            failure("ci_failed", sig_a, Lane::Mainlane),
            failure("ci_failed", sig_a, Lane::Mainlane),
            failure("ci_failed", sig_b, Lane::Mainlane),
        ];
        let clusters = cluster_failures(&failures);

        // The merge rule is exactly the simhash distance rule; assert the
        // clustering agrees with whichever side of the threshold these
        // signatures land on.
        if distance <= 6 {
            assert_eq!(clusters.len(), 1);
            assert_eq!(clusters[0].count, 3);
        } else {
            assert_eq!(clusters.len(), 2);
            assert_eq!(clusters[0].count, 2);
        }
    }

    #[test]
    fn test_instinct_writes_artifacts_and_fires_once() {
        let (engine, dir) = engine();
        for _ in 0..5 {
            engine.record_failure(&failure("ci_failed", "sig", Lane::Mainlane));
        }

        let task = engine.run_instinct().expect("fires");
        assert_eq!(
            task.task_class_id.as_deref(),
            Some("instinct_builder_response_v1")
        );
        assert!(dir.path().join("instinct/patterns.json").exists());
        assert!(dir.path().join("instinct/playbooks.yaml").exists());
        assert!(dir.path().join("instinct/skills_draft.yaml").exists());

        // Same top cluster: no refire
        assert!(engine.run_instinct().is_none());
    }

    #[test]
    fn test_feedback_rate_limited_per_key() {
        let dir = tempdir().expect("tempdir");
        let engine = HookEngine::load(
            FactoryPaths::new(dir.path()),
            HookThresholds {
                hook_rate_limit_ms: 60_000,
                ..HookThresholds::default()
            },
        );
        assert!(engine.check_feedback("ci_gate_result", "ok=false").is_some());
        assert!(engine.check_feedback("ci_gate_result", "ok=false").is_none());
        // Different key: allowed
        assert!(engine.check_feedback("job_lease_expired", "-").is_some());
    }

    #[test]
    fn test_simhash_distance_properties() {
        let a = simhash("ci|timeout|parser assertion|engineer|refactor|codex");
        let b = simhash("ci|timeout|parser assertion|engineer|refactor|codex");
        assert_eq!(a, b);

        let c = simhash("totally different words entirely|other|thing");
        assert!(hamming(a, c) > 6);
    }
}
