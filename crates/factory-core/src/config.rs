//! Runtime configuration: normative env flags parsed once into a typed
//! struct. Policy-owned tunables (WIP tables, degradation matrix, hook
//! thresholds) live in `factory_policy.json`; this covers the switches the
//! operator flips per deployment.

use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    // Attestation / preflight
    pub context_pack_v1_required: bool,
    pub preflight_gate_enabled: bool,

    // Gates
    pub ci_gates_strict: bool,
    pub policy_gate_strict: bool,
    pub ci_gate_enabled: bool,
    /// Tasks created before this epoch-ms are exempt from the CI gate.
    pub ci_enforce_since_ms: i64,
    pub allowed_tests_max_commands: usize,

    // Breakers / fuses
    pub circuit_breakers_enabled: bool,
    pub fixup_fuse_queue_threshold: usize,

    // Requeue / rescue budgets
    pub auto_requeue_timeout_max: u32,
    pub auto_requeue_model_fail_max: u32,

    // Leases / workers
    pub exec_worker_lease_ms: u64,
    pub worker_stale_prune_ms: u64,
    pub worker_active_window_ms: u64,
    pub external_max_codex: usize,
    pub external_max_opencodecli: usize,

    // Rollback
    pub auto_rollback_on_ci_failed: bool,
    pub auto_rollback_docs_only: bool,
    pub auto_rollback_max_files: usize,

    // Router
    pub prefer_free_models: bool,
    pub desired_ratio_codex: u32,
    pub desired_ratio_occli: u32,
    pub router_stats_min_samples: usize,
    pub strict_designer_model: String,
    pub occli_mode: String,

    // Board / ledgers
    pub audit_trigger_every_n: u32,
    pub ledger_stall_minutes: i64,
    pub ssot_auto_apply_max_per_task: u32,
    pub pins_fixup_max_per_task: u32,
    pub ci_fixup_max_per_task: u32,
    pub policy_fixup_max_per_task: u32,

    // Quality gate
    pub quality_gate_fail_rate: f64,
    pub quality_gate_min_samples: usize,

    // Default job timeout
    pub default_job_timeout_ms: u64,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            context_pack_v1_required: true,
            preflight_gate_enabled: true,
            ci_gates_strict: true,
            policy_gate_strict: true,
            ci_gate_enabled: true,
            ci_enforce_since_ms: 0,
            allowed_tests_max_commands: 2,
            circuit_breakers_enabled: true,
            fixup_fuse_queue_threshold: 24,
            auto_requeue_timeout_max: 3,
            auto_requeue_model_fail_max: 2,
            exec_worker_lease_ms: 720_000,
            worker_stale_prune_ms: 600_000,
            worker_active_window_ms: 120_000,
            external_max_codex: 4,
            external_max_opencodecli: 4,
            auto_rollback_on_ci_failed: true,
            auto_rollback_docs_only: true,
            auto_rollback_max_files: 3,
            prefer_free_models: true,
            desired_ratio_codex: 1,
            desired_ratio_occli: 1,
            router_stats_min_samples: 5,
            strict_designer_model: "gpt-5".to_string(),
            occli_mode: "strong_first".to_string(),
            audit_trigger_every_n: 10,
            ledger_stall_minutes: 60,
            ssot_auto_apply_max_per_task: 1,
            pins_fixup_max_per_task: 2,
            ci_fixup_max_per_task: 2,
            policy_fixup_max_per_task: 2,
            quality_gate_fail_rate: 0.0,
            quality_gate_min_samples: 5,
            default_job_timeout_ms: 1_800_000,
        }
    }
}

impl RuntimeConfig {
    /// Build from the process environment, falling back to defaults.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            context_pack_v1_required: env_bool("CONTEXT_PACK_V1_REQUIRED", d.context_pack_v1_required),
            preflight_gate_enabled: env_bool("PREFLIGHT_GATE_ENABLED", d.preflight_gate_enabled),
            ci_gates_strict: env_bool("CI_GATES_STRICT", d.ci_gates_strict),
            policy_gate_strict: env_bool("POLICY_GATE_STRICT", d.policy_gate_strict),
            ci_gate_enabled: env_bool("CI_GATE_ENABLED", d.ci_gate_enabled),
            ci_enforce_since_ms: env_parse("CI_ENFORCE_SINCE_MS", d.ci_enforce_since_ms),
            allowed_tests_max_commands: env_parse("ALLOWED_TESTS_MAX_COMMANDS", d.allowed_tests_max_commands),
            circuit_breakers_enabled: env_bool("CIRCUIT_BREAKERS_ENABLED", d.circuit_breakers_enabled),
            fixup_fuse_queue_threshold: env_parse("FIXUP_FUSE_QUEUE_THRESHOLD", d.fixup_fuse_queue_threshold),
            auto_requeue_timeout_max: env_parse("AUTO_REQUEUE_TIMEOUT_MAX", d.auto_requeue_timeout_max),
            auto_requeue_model_fail_max: env_parse("AUTO_REQUEUE_MODEL_FAIL_MAX", d.auto_requeue_model_fail_max),
            exec_worker_lease_ms: env_parse("EXEC_WORKER_LEASE_MS", d.exec_worker_lease_ms),
            worker_stale_prune_ms: env_parse("WORKER_STALE_PRUNE_MS", d.worker_stale_prune_ms),
            worker_active_window_ms: env_parse("WORKER_ACTIVE_WINDOW_MS", d.worker_active_window_ms),
            external_max_codex: env_parse("EXTERNAL_MAX_CODEX", d.external_max_codex),
            external_max_opencodecli: env_parse("EXTERNAL_MAX_OPENCODECLI", d.external_max_opencodecli),
            auto_rollback_on_ci_failed: env_bool("AUTO_ROLLBACK_ON_CI_FAILED", d.auto_rollback_on_ci_failed),
            auto_rollback_docs_only: env_bool("AUTO_ROLLBACK_DOCS_ONLY", d.auto_rollback_docs_only),
            auto_rollback_max_files: env_parse("AUTO_ROLLBACK_MAX_FILES", d.auto_rollback_max_files),
            prefer_free_models: env_bool("PREFER_FREE_MODELS", d.prefer_free_models),
            desired_ratio_codex: env_parse("DESIRED_RATIO_CODEX", d.desired_ratio_codex),
            desired_ratio_occli: env_parse("DESIRED_RATIO_OCCLI", d.desired_ratio_occli),
            router_stats_min_samples: env_parse("ROUTER_STATS_MIN_SAMPLES", d.router_stats_min_samples),
            strict_designer_model: env_string("STRICT_DESIGNER_MODEL", &d.strict_designer_model),
            occli_mode: env_string("OCCLI_MODE", &d.occli_mode),
            audit_trigger_every_n: env_parse("AUDIT_TRIGGER_EVERY_N", d.audit_trigger_every_n),
            ledger_stall_minutes: env_parse("LEDGER_STALL_MINUTES", d.ledger_stall_minutes),
            ssot_auto_apply_max_per_task: env_parse("SSOT_AUTO_APPLY_MAX_PER_TASK", d.ssot_auto_apply_max_per_task),
            pins_fixup_max_per_task: env_parse("PINS_FIXUP_MAX_PER_TASK", d.pins_fixup_max_per_task),
            ci_fixup_max_per_task: env_parse("CI_FIXUP_MAX_PER_TASK", d.ci_fixup_max_per_task),
            policy_fixup_max_per_task: env_parse(
                "POLICY_FIXUP_MAX_PER_TASK",
                d.policy_fixup_max_per_task,
            ),
            quality_gate_fail_rate: env_parse("QUALITY_GATE_FAIL_RATE", d.quality_gate_fail_rate),
            quality_gate_min_samples: env_parse("QUALITY_GATE_MIN_SAMPLES", d.quality_gate_min_samples),
            default_job_timeout_ms: env_parse("DEFAULT_JOB_TIMEOUT_MS", d.default_job_timeout_ms),
        }
    }

    pub fn worker_lease(&self) -> Duration {
        Duration::from_millis(self.exec_worker_lease_ms)
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    match std::env::var(key) {
        Ok(v) => matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        Err(_) => default,
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_contract() {
        let config = RuntimeConfig::default();
        assert!(config.context_pack_v1_required);
        assert!(config.preflight_gate_enabled);
        assert!(config.ci_gates_strict);
        assert!(config.policy_gate_strict);
        assert!(config.circuit_breakers_enabled);
        assert_eq!(config.auto_requeue_timeout_max, 3);
        assert_eq!(config.auto_requeue_model_fail_max, 2);
        assert_eq!(config.exec_worker_lease_ms, 720_000);
        assert!(config.auto_rollback_docs_only);
        assert_eq!(config.auto_rollback_max_files, 3);
        assert_eq!(config.ssot_auto_apply_max_per_task, 1);
        assert_eq!(config.audit_trigger_every_n, 10);
    }

    #[test]
    fn test_env_bool_parsing() {
        assert!(env_bool("FACTORY_TEST_UNSET_FLAG", true));
        std::env::set_var("FACTORY_TEST_BOOL_FLAG", "false");
        assert!(!env_bool("FACTORY_TEST_BOOL_FLAG", true));
        std::env::set_var("FACTORY_TEST_BOOL_FLAG", "1");
        assert!(env_bool("FACTORY_TEST_BOOL_FLAG", false));
        std::env::remove_var("FACTORY_TEST_BOOL_FLAG");
    }
}
