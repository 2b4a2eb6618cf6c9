//! Factory policy: WIP tables, lane priorities, budgets, event routing,
//! degradation matrix, circuit-breaker specs, hook thresholds.
//!
//! The policy document (`factory_policy.json`, `scc.factory_policy.v1`) is
//! operator-owned data. This module parses it, caches it by mtime, and
//! answers the scheduler's questions. Every accessor has a sane default so
//! a missing or partial policy never blocks the gateway.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use factory_state::CachedFile;

use crate::domain::{EventType, Lane, Task};

pub const FACTORY_POLICY_SCHEMA: &str = "scc.factory_policy.v1";

/// Effective WIP caps for one lane class, split by runner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WipLimits {
    pub total: usize,
    pub exec: usize,
    pub batch: usize,
    pub total_external: usize,
    pub total_internal: usize,
    pub exec_external: usize,
    pub exec_internal: usize,
    pub batch_external: usize,
    pub batch_internal: usize,
}

impl Default for WipLimits {
    fn default() -> Self {
        // Defaults (12, 4, 1); runner-specific caps fall back to the shared
        // value when the policy does not split them.
        Self {
            total: 12,
            exec: 4,
            batch: 1,
            total_external: 12,
            total_internal: 12,
            exec_external: 4,
            exec_internal: 4,
            batch_external: 1,
            batch_internal: 1,
        }
    }
}

/// Raw WIP table as written in the policy file. Runner-specific keys are
/// optional and fall back to the shared value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct WipLimitsSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_external: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_internal: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_external: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_internal: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_external: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub batch_internal: Option<usize>,
}

impl WipLimitsSpec {
    pub fn resolve(&self) -> WipLimits {
        let d = WipLimits::default();
        let total = self.total.unwrap_or(d.total);
        let exec = self.exec.unwrap_or(d.exec);
        let batch = self.batch.unwrap_or(d.batch);
        WipLimits {
            total,
            exec,
            batch,
            total_external: self.total_external.unwrap_or(total),
            total_internal: self.total_internal.unwrap_or(total),
            exec_external: self.exec_external.unwrap_or(exec),
            exec_internal: self.exec_internal.unwrap_or(exec),
            batch_external: self.batch_external.unwrap_or(batch),
            batch_internal: self.batch_internal.unwrap_or(batch),
        }
    }
}

/// Parent-tree budget caps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryBudgets {
    pub max_children: u32,
    pub max_depth: u32,
    pub max_total_tokens_budget: u64,
    pub max_total_verify_minutes: u64,
    pub max_total_attempts: u32,
}

impl Default for FactoryBudgets {
    fn default() -> Self {
        Self {
            max_children: 12,
            max_depth: 2,
            max_total_tokens_budget: 200_000,
            max_total_verify_minutes: 60,
            max_total_attempts: 3,
        }
    }
}

/// One degradation matrix entry: first entry whose `when` signals all match
/// wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DegradationRule {
    #[serde(default)]
    pub when: BTreeMap<String, bool>,
    #[serde(rename = "do")]
    pub action: DegradationAction,
}

/// The selected degradation action.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct DegradationAction {
    #[serde(
        rename = "reduce_WIP_EXEC_MAX_to",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub reduce_wip_exec_max_to: Option<usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefer_lane: Option<Lane>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub verification_tier: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mode: Option<String>,
    #[serde(default)]
    pub allow_task_classes: Vec<String>,
}

impl DegradationAction {
    pub fn is_stop_the_bleeding(&self) -> bool {
        self.mode.as_deref() == Some("stop_the_bleeding")
    }
}

/// Circuit breaker spec from the policy file.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSpec {
    pub name: String,
    #[serde(rename = "match")]
    pub matcher: BreakerMatch,
    pub trip: BreakerTrip,
    #[serde(default)]
    pub action: BreakerAction,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerMatch {
    pub event_type: EventType,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerTrip {
    pub consecutive_failures: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BreakerAction {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lane: Option<Lane>,
    /// How long the trip lasts, minutes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trip_minutes: Option<i64>,
}

/// Hook trigger thresholds. Environment-driven in the source; surfaced in
/// the policy structure here with env fallbacks applied by the caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HookThresholds {
    pub stability_queued_threshold: usize,
    pub learned_patterns_delta_threshold: usize,
    pub token_cfo_unused_ratio: f64,
    pub token_cfo_min_included: u32,
    pub five_whys_min_new_failures: usize,
    pub instinct_min_cluster: usize,
    pub hook_rate_limit_ms: u64,
}

impl Default for HookThresholds {
    fn default() -> Self {
        Self {
            stability_queued_threshold: 8,
            learned_patterns_delta_threshold: 5,
            token_cfo_unused_ratio: 0.6,
            token_cfo_min_included: 3,
            five_whys_min_new_failures: 10,
            instinct_min_cluster: 3,
            hook_rate_limit_ms: 300_000,
        }
    }
}

/// The parsed policy document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FactoryPolicy {
    #[serde(default)]
    pub schema_version: String,
    #[serde(default)]
    pub wip_limits: WipLimitsSpec,
    #[serde(default)]
    pub lane_priorities: BTreeMap<String, i64>,
    #[serde(default)]
    pub event_routing: BTreeMap<String, Lane>,
    #[serde(default)]
    pub degradation_matrix: Vec<DegradationRule>,
    #[serde(default)]
    pub circuit_breakers: Vec<BreakerSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budgets: Option<FactoryBudgets>,
    #[serde(default)]
    pub verification_tiers: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hooks: Option<HookThresholds>,
    /// area -> lane defaulting at task creation.
    #[serde(default)]
    pub area_lanes: BTreeMap<String, Lane>,
}

impl FactoryPolicy {
    pub fn wip_limits(&self) -> WipLimits {
        self.wip_limits.resolve()
    }

    pub fn budgets(&self) -> FactoryBudgets {
        self.budgets.unwrap_or_default()
    }

    pub fn max_total_attempts(&self) -> u32 {
        self.budgets().max_total_attempts
    }

    pub fn hooks(&self) -> HookThresholds {
        self.hooks.clone().unwrap_or_default()
    }

    /// Lane ordering for the queue: fastlane > mainlane > batchlane >
    /// dlq = quarantine.
    pub fn lane_priority_score(&self, lane: Lane) -> i64 {
        if let Some(score) = self.lane_priorities.get(lane.as_str()) {
            return *score;
        }
        match lane {
            Lane::Fastlane => 300,
            Lane::Mainlane => 200,
            Lane::Batchlane => 100,
            Lane::Dlq | Lane::Quarantine => 0,
        }
    }

    /// Lane a recovery/fixup task for this event type should land in.
    pub fn route_lane_for_event_type(&self, event_type: EventType) -> Lane {
        if let Some(lane) = self.event_routing.get(event_type.as_str()) {
            return *lane;
        }
        match event_type {
            EventType::PinsInsufficient
            | EventType::CiFailed
            | EventType::PreflightFailed => Lane::Fastlane,
            EventType::PolicyViolation => Lane::Quarantine,
            EventType::RetryExhausted => Lane::Dlq,
            _ => Lane::Mainlane,
        }
    }

    /// First matching degradation entry wins; `None` when nothing matches.
    pub fn compute_degradation_action(
        &self,
        signals: &BTreeMap<String, bool>,
    ) -> Option<DegradationAction> {
        self.degradation_matrix
            .iter()
            .find(|rule| {
                rule.when
                    .iter()
                    .all(|(signal, expected)| signals.get(signal).copied().unwrap_or(false) == *expected)
            })
            .map(|rule| rule.action.clone())
    }

    /// Cap exec limits per the degradation action.
    pub fn apply_degradation_to_wip_limits(
        &self,
        mut limits: WipLimits,
        action: Option<&DegradationAction>,
    ) -> WipLimits {
        if let Some(cap) = action.and_then(|a| a.reduce_wip_exec_max_to) {
            limits.exec = limits.exec.min(cap);
            limits.exec_external = limits.exec_external.min(cap);
            limits.exec_internal = limits.exec_internal.min(cap);
        }
        limits
    }

    /// Under `stop_the_bleeding`, only repair-class and docs-scoped work may
    /// dispatch.
    pub fn should_allow_under_stop_the_bleeding(
        &self,
        action: Option<&DegradationAction>,
        task: &Task,
    ) -> bool {
        let Some(action) = action else { return true };
        if !action.is_stop_the_bleeding() {
            return true;
        }

        if let Some(class) = &task.task_class_id {
            if action.allow_task_classes.iter().any(|c| c == class) {
                return true;
            }
        }
        if task.area.as_deref() == Some("control_plane") {
            return true;
        }
        if matches!(task.role.as_str(), "doc" | "doc_adr_scribe" | "ssot_curator") {
            return true;
        }
        task.is_docs_only()
    }

    /// Verification tier command set (`smoke` / `regression`).
    pub fn verification_tier(&self, tier: &str) -> Vec<String> {
        self.verification_tiers.get(tier).cloned().unwrap_or_default()
    }
}

fn parse_policy(bytes: &[u8]) -> Option<FactoryPolicy> {
    serde_json::from_slice(bytes).ok()
}

/// Mtime-cached view of `factory_policy.json`. Returns defaults when the
/// file is absent or unparseable.
pub struct PolicyStore {
    cache: CachedFile<FactoryPolicy>,
}

impl PolicyStore {
    pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
        Self {
            cache: CachedFile::new(path, parse_policy),
        }
    }

    pub fn current(&self) -> FactoryPolicy {
        self.cache.get().unwrap_or_default()
    }

    pub fn invalidate(&self) {
        self.cache.invalidate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wip_defaults_and_runner_fallbacks() {
        let limits = WipLimitsSpec::default().resolve();
        assert_eq!(limits.total, 12);
        assert_eq!(limits.exec, 4);
        assert_eq!(limits.batch, 1);
        assert_eq!(limits.exec_external, 4);
        assert_eq!(limits.exec_internal, 4);

        let split = WipLimitsSpec {
            exec: Some(6),
            exec_external: Some(2),
            ..WipLimitsSpec::default()
        }
        .resolve();
        assert_eq!(split.exec, 6);
        assert_eq!(split.exec_external, 2);
        assert_eq!(split.exec_internal, 6);
    }

    #[test]
    fn test_lane_priority_ordering() {
        let policy = FactoryPolicy::default();
        let fast = policy.lane_priority_score(Lane::Fastlane);
        let main = policy.lane_priority_score(Lane::Mainlane);
        let batch = policy.lane_priority_score(Lane::Batchlane);
        let dlq = policy.lane_priority_score(Lane::Dlq);
        let quarantine = policy.lane_priority_score(Lane::Quarantine);
        assert!(fast > main && main > batch && batch > dlq);
        assert_eq!(dlq, quarantine);
    }

    #[test]
    fn test_degradation_first_match_wins() {
        let policy: FactoryPolicy = serde_json::from_value(serde_json::json!({
            "schema_version": FACTORY_POLICY_SCHEMA,
            "degradation_matrix": [
                {
                    "when": { "queue_overload": true, "repo_unhealthy": true },
                    "do": { "mode": "stop_the_bleeding", "allow_task_classes": ["ci_fixup_v1"] }
                },
                {
                    "when": { "queue_overload": true },
                    "do": { "reduce_WIP_EXEC_MAX_to": 2, "prefer_lane": "fastlane" }
                }
            ]
        }))
        .expect("parse");

        let mut signals = BTreeMap::new();
        signals.insert("queue_overload".to_string(), true);
        let action = policy.compute_degradation_action(&signals).expect("match");
        assert_eq!(action.reduce_wip_exec_max_to, Some(2));
        assert_eq!(action.prefer_lane, Some(Lane::Fastlane));

        signals.insert("repo_unhealthy".to_string(), true);
        let action = policy.compute_degradation_action(&signals).expect("match");
        assert!(action.is_stop_the_bleeding());

        signals.insert("queue_overload".to_string(), false);
        assert!(policy.compute_degradation_action(&signals).is_none());
    }

    #[test]
    fn test_degradation_caps_exec_limits() {
        let policy = FactoryPolicy::default();
        let action = DegradationAction {
            reduce_wip_exec_max_to: Some(2),
            ..DegradationAction::default()
        };
        let limits = policy.apply_degradation_to_wip_limits(WipLimits::default(), Some(&action));
        assert_eq!(limits.exec, 2);
        assert_eq!(limits.exec_external, 2);
        assert_eq!(limits.exec_internal, 2);
        // Other caps untouched
        assert_eq!(limits.total, 12);
    }

    #[test]
    fn test_stop_the_bleeding_allowances() {
        let policy = FactoryPolicy::default();
        let action = DegradationAction {
            mode: Some("stop_the_bleeding".to_string()),
            allow_task_classes: vec!["ci_fixup_v1".to_string()],
            ..DegradationAction::default()
        };

        let mut task = Task::new_atomic("t", "engineer");
        assert!(!policy.should_allow_under_stop_the_bleeding(Some(&action), &task));

        task.task_class_id = Some("ci_fixup_v1".to_string());
        assert!(policy.should_allow_under_stop_the_bleeding(Some(&action), &task));

        task.task_class_id = None;
        task.area = Some("control_plane".to_string());
        assert!(policy.should_allow_under_stop_the_bleeding(Some(&action), &task));

        task.area = None;
        task.role = "ssot_curator".to_string();
        assert!(policy.should_allow_under_stop_the_bleeding(Some(&action), &task));

        task.role = "engineer".to_string();
        task.files = vec!["docs/guide.md".to_string()];
        assert!(policy.should_allow_under_stop_the_bleeding(Some(&action), &task));

        // No action at all: everything allowed
        assert!(policy.should_allow_under_stop_the_bleeding(None, &task));
    }

    #[test]
    fn test_event_routing_defaults_and_overrides() {
        let policy = FactoryPolicy::default();
        assert_eq!(
            policy.route_lane_for_event_type(EventType::CiFailed),
            Lane::Fastlane
        );
        assert_eq!(
            policy.route_lane_for_event_type(EventType::RetryExhausted),
            Lane::Dlq
        );
        assert_eq!(
            policy.route_lane_for_event_type(EventType::PolicyViolation),
            Lane::Quarantine
        );

        let policy: FactoryPolicy = serde_json::from_value(serde_json::json!({
            "event_routing": { "CI_FAILED": "batchlane" }
        }))
        .expect("parse");
        assert_eq!(
            policy.route_lane_for_event_type(EventType::CiFailed),
            Lane::Batchlane
        );
    }

    #[test]
    fn test_policy_store_defaults_when_missing() {
        let store = PolicyStore::new("/nonexistent/factory_policy.json");
        let policy = store.current();
        assert_eq!(policy.max_total_attempts(), 3);
        assert_eq!(policy.budgets().max_children, 12);
        assert_eq!(policy.budgets().max_total_tokens_budget, 200_000);
    }
}
