//! Executor and model routing.
//!
//! Routing prefers the free executor when the task allows it, converges on
//! the configured codex:occli running share otherwise, and picks models
//! either statistically (success rate over the recent event stream), by a
//! strength ladder, or round-robin.

use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use factory_state::{load_json, save_json_atomic, FactoryPaths, WriteMode};

use crate::config::RuntimeConfig;
use crate::domain::{DispatchError, EventType, ExecutorKind, Job, JobStatus, StateEvent, Task};
use crate::fuses::FuseBox;

/// Free model pool offered through opencode-cli, strongest first.
pub const DEFAULT_FREE_MODELS: &[&str] = &[
    "opencode/qwen3-coder",
    "opencode/glm-4-6",
    "opencode/kimi-k2",
];

/// Preferred codex models, strongest first. The head doubles as the
/// fallback default.
pub const DEFAULT_CODEX_MODELS: &[&str] = &["gpt-5-codex", "gpt-5", "gpt-5-mini"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
struct RouterState {
    #[serde(default)]
    rr_index: usize,
}

pub struct Router {
    paths: FactoryPaths,
    free_models: Vec<String>,
    codex_models: Vec<String>,
    blacklist: Vec<String>,
    state: RwLock<RouterState>,
}

impl Router {
    pub fn load(paths: FactoryPaths) -> Self {
        let state = load_json(&paths.router_state_file())
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            paths,
            free_models: DEFAULT_FREE_MODELS.iter().map(|s| s.to_string()).collect(),
            codex_models: DEFAULT_CODEX_MODELS.iter().map(|s| s.to_string()).collect(),
            blacklist: Vec::new(),
            state: RwLock::new(state),
        }
    }

    pub fn with_blacklist(mut self, blacklist: Vec<String>) -> Self {
        self.blacklist = blacklist;
        self
    }

    /// Pick the executor for a task.
    pub fn pick_executor(
        &self,
        task: &Task,
        config: &RuntimeConfig,
        fuses: &FuseBox,
        running: &[Job],
    ) -> Result<ExecutorKind, DispatchError> {
        let now = chrono::Utc::now();

        // Designer work is pinned to codex.
        if task.role == "designer" {
            return Ok(ExecutorKind::Codex);
        }

        let mut allowed: Vec<ExecutorKind> = if task.allowed_executors.is_empty() {
            vec![ExecutorKind::Codex, ExecutorKind::Opencodecli]
        } else {
            task.allowed_executors.clone()
        };
        allowed.retain(|e| !fuses.executor_fused(*e, now));

        match allowed.len() {
            0 => Err(DispatchError::NoExecutor),
            1 => Ok(allowed[0]),
            _ => {
                if config.prefer_free_models && !self.requires_paid_models(task) {
                    return Ok(ExecutorKind::Opencodecli);
                }
                Ok(self.share_balance(config, running))
            }
        }
    }

    /// True when the task's model list rules out the free pool.
    fn requires_paid_models(&self, task: &Task) -> bool {
        !task.allowed_models.is_empty()
            && task
                .allowed_models
                .iter()
                .all(|m| !m.starts_with("opencode/"))
    }

    /// Converge running shares toward the configured codex:occli ratio.
    fn share_balance(&self, config: &RuntimeConfig, running: &[Job]) -> ExecutorKind {
        let running_codex = running
            .iter()
            .filter(|j| j.status == JobStatus::Running && j.executor == ExecutorKind::Codex)
            .count() as u64;
        let running_occli = running
            .iter()
            .filter(|j| j.status == JobStatus::Running && j.executor == ExecutorKind::Opencodecli)
            .count() as u64;

        let ratio_codex = config.desired_ratio_codex.max(1) as u64;
        let ratio_occli = config.desired_ratio_occli.max(1) as u64;

        // Cross-multiplied comparison avoids division: pick the side that is
        // furthest below its desired share.
        if running_codex * ratio_occli <= running_occli * ratio_codex {
            ExecutorKind::Codex
        } else {
            ExecutorKind::Opencodecli
        }
    }

    /// Pick the model for the chosen executor.
    pub fn pick_model(
        &self,
        task: &Task,
        executor: ExecutorKind,
        config: &RuntimeConfig,
        recent_events: &[StateEvent],
    ) -> Result<String, DispatchError> {
        match executor {
            ExecutorKind::Codex => self.pick_codex_model(task, config, recent_events),
            ExecutorKind::Opencodecli => self.pick_occli_model(task, config),
        }
    }

    fn pick_codex_model(
        &self,
        task: &Task,
        config: &RuntimeConfig,
        recent_events: &[StateEvent],
    ) -> Result<String, DispatchError> {
        if task.role == "designer" {
            return Ok(config.strict_designer_model.clone());
        }

        let candidates: Vec<String> = task
            .allowed_models
            .iter()
            .filter(|m| !m.starts_with("opencode/"))
            .cloned()
            .collect();

        match candidates.len() {
            0 => Ok(self
                .codex_models
                .first()
                .cloned()
                .ok_or(DispatchError::NoModel)?),
            1 => Ok(candidates[0].clone()),
            _ => {
                if let Some(best) = best_by_success_rate(
                    &candidates,
                    recent_events,
                    config.router_stats_min_samples,
                ) {
                    return Ok(best);
                }
                // Preferred order, else first candidate
                for preferred in &self.codex_models {
                    if candidates.contains(preferred) {
                        return Ok(preferred.clone());
                    }
                }
                Ok(candidates[0].clone())
            }
        }
    }

    fn pick_occli_model(
        &self,
        task: &Task,
        config: &RuntimeConfig,
    ) -> Result<String, DispatchError> {
        let mut pool: Vec<String> = task
            .allowed_models
            .iter()
            .filter(|m| m.starts_with("opencode/"))
            .cloned()
            .collect();
        if pool.is_empty() {
            pool = self.free_models.clone();
        }
        pool.retain(|m| !self.blacklist.contains(m));
        if pool.is_empty() {
            return Err(DispatchError::NoModel);
        }

        match config.occli_mode.as_str() {
            // Pool order is strength order.
            "strong_first" => Ok(pool[0].clone()),
            "ladder" => {
                let index = (task.model_attempt as usize).min(pool.len() - 1);
                Ok(pool[index].clone())
            }
            "rr" => {
                let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
                let index = state.rr_index % pool.len();
                state.rr_index = state.rr_index.wrapping_add(1);
                let _ = save_json_atomic(
                    &self.paths.router_state_file(),
                    &*state,
                    WriteMode::BestEffort,
                );
                Ok(pool[index].clone())
            }
            _ => Ok(pool[0].clone()),
        }
    }

    /// Next preferred codex model after a failed one, for the deterministic
    /// unsupported-model fallback.
    pub fn next_codex_fallback(&self, failed_model: &str) -> Option<String> {
        let position = self.codex_models.iter().position(|m| m == failed_model)?;
        self.codex_models.get(position + 1).cloned()
    }
}

/// Best candidate by success rate over the event tail. `None` unless at
/// least two candidates carry `min_samples` observations each.
fn best_by_success_rate(
    candidates: &[String],
    events: &[StateEvent],
    min_samples: usize,
) -> Option<String> {
    let mut scored: Vec<(String, f64, usize)> = Vec::new();
    for model in candidates {
        let observations: Vec<&StateEvent> = events
            .iter()
            .filter(|e| e.model.as_deref() == Some(model))
            .collect();
        let total = observations.len();
        if total < min_samples {
            continue;
        }
        let successes = observations
            .iter()
            .filter(|e| e.event_type == EventType::Success)
            .count();
        scored.push((model.clone(), successes as f64 / total as f64, total));
    }

    if scored.len() < 2 {
        return None;
    }
    scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
    scored.first().map(|(model, _, _)| model.clone())
}

/// Fail rate over recent events for one area. Returns `(rate, samples)`.
pub fn area_fail_rate(events: &[StateEvent], area: &str) -> (f64, usize) {
    let observations: Vec<&StateEvent> = events
        .iter()
        .filter(|e| e.area.as_deref() == Some(area))
        .filter(|e| {
            matches!(
                e.event_type,
                EventType::Success
                    | EventType::CiFailed
                    | EventType::ExecutorError
                    | EventType::Timeout
                    | EventType::PolicyViolation
            )
        })
        .collect();
    let total = observations.len();
    if total == 0 {
        return (0.0, 0);
    }
    let failures = observations
        .iter()
        .filter(|e| e.event_type != EventType::Success)
        .count();
    (failures as f64 / total as f64, total)
}
