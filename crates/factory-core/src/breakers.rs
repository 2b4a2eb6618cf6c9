//! Circuit breakers, quarantine, and repo health tracking.

use std::collections::BTreeMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use factory_state::{load_json, save_json_atomic, FactoryPaths, WriteMode};

use crate::domain::{EventType, Result};
use crate::policy::BreakerSpec;

/// Quarantine follow-up tasks are only auto-created once the previous one
/// is at least this old. Magic constant inherited from the source gateway,
/// not policy-driven.
pub const QUARANTINE_FOLLOWUP_MIN_AGE_MINUTES: i64 = 5;

const DEFAULT_TRIP_MINUTES: i64 = 10;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BreakerEntry {
    #[serde(default)]
    pub consecutive: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tripped_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct BreakerState {
    #[serde(default)]
    pub breakers: BTreeMap<String, BreakerEntry>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_until: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_breaker: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quarantine_task_created_at: Option<DateTime<Utc>>,
}

/// What a single observation did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerOutcome {
    pub tripped: Vec<String>,
    pub quarantine_entered: bool,
}

/// Evaluates breaker specs against the event stream and owns the
/// quarantine window.
pub struct BreakerEngine {
    paths: FactoryPaths,
    enabled: bool,
    state: RwLock<BreakerState>,
}

impl BreakerEngine {
    pub fn load(paths: FactoryPaths, enabled: bool) -> Self {
        let state = load_json(&paths.breakers_file())
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            paths,
            enabled,
            state: RwLock::new(state),
        }
    }

    pub fn snapshot(&self) -> BreakerState {
        self.state.read().unwrap_or_else(|p| p.into_inner()).clone()
    }

    fn persist(&self, state: &BreakerState) {
        if let Err(e) = save_json_atomic(&self.paths.breakers_file(), state, WriteMode::Strict) {
            warn!(error = %e, "breaker state persist failed");
        }
    }

    /// Feed one event through every breaker spec. Success resets counts;
    /// a matching event increments and may trip.
    pub fn observe(&self, specs: &[BreakerSpec], event_type: EventType) -> BreakerOutcome {
        let mut outcome = BreakerOutcome {
            tripped: Vec::new(),
            quarantine_entered: false,
        };
        if !self.enabled {
            return outcome;
        }

        let now = Utc::now();
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());

        for spec in specs {
            let entry = state.breakers.entry(spec.name.clone()).or_default();
            if event_type == EventType::Success {
                entry.consecutive = 0;
                entry.last_event_type = Some(event_type.as_str().to_string());
                continue;
            }
            if spec.matcher.event_type != event_type {
                continue;
            }

            entry.consecutive += 1;
            entry.last_event_type = Some(event_type.as_str().to_string());

            let already_tripped = entry
                .tripped_until
                .map(|until| now < until)
                .unwrap_or(false);
            if entry.consecutive >= spec.trip.consecutive_failures && !already_tripped {
                let minutes = spec.action.trip_minutes.unwrap_or(DEFAULT_TRIP_MINUTES);
                entry.tripped_at = Some(now);
                entry.tripped_until = Some(now + Duration::minutes(minutes));
                entry.consecutive = 0;
                outcome.tripped.push(spec.name.clone());

                if spec.action.lane == Some(crate::domain::Lane::Quarantine) {
                    state.quarantine_until = Some(now + Duration::minutes(minutes));
                    state.quarantine_reason =
                        Some(format!("breaker {} tripped", spec.name));
                    state.quarantine_breaker = Some(spec.name.clone());
                    outcome.quarantine_entered = true;
                }
            }
        }

        self.persist(&state);
        outcome
    }

    pub fn quarantine_active(&self, now: DateTime<Utc>) -> Option<String> {
        let state = self.state.read().unwrap_or_else(|p| p.into_inner());
        match state.quarantine_until {
            Some(until) if now < until => Some(
                state
                    .quarantine_reason
                    .clone()
                    .unwrap_or_else(|| "quarantine active".to_string()),
            ),
            _ => None,
        }
    }

    /// Whether a quarantine follow-up task should be created now. Applies
    /// the follow-up age gate and stamps the creation time.
    pub fn should_create_quarantine_task(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        if state.quarantine_until.map(|u| now >= u).unwrap_or(true) {
            return false;
        }
        let old_enough = state
            .quarantine_task_created_at
            .map(|at| now - at >= Duration::minutes(QUARANTINE_FOLLOWUP_MIN_AGE_MINUTES))
            .unwrap_or(true);
        if old_enough {
            state.quarantine_task_created_at = Some(now);
            self.persist(&state);
        }
        old_enough
    }
}

// ---------------------------------------------------------------------------
// Repo health
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct RepoHealthState {
    #[serde(default)]
    pub failure_times: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unhealthy_until: Option<DateTime<Utc>>,
}

/// Sliding-window failure counter marking the repo unhealthy for a cooldown
/// once the window fills.
pub struct RepoHealth {
    paths: FactoryPaths,
    window: Duration,
    threshold: usize,
    cooldown: Duration,
    state: RwLock<RepoHealthState>,
}

impl RepoHealth {
    pub fn load(paths: FactoryPaths) -> Self {
        let state = load_json(&paths.repo_health_file())
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            paths,
            window: Duration::minutes(10),
            threshold: 5,
            cooldown: Duration::minutes(15),
            state: RwLock::new(state),
        }
    }

    pub fn with_limits(mut self, window: Duration, threshold: usize, cooldown: Duration) -> Self {
        self.window = window;
        self.threshold = threshold.max(1);
        self.cooldown = cooldown;
        self
    }

    pub fn record_failure(&self, now: DateTime<Utc>) {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        state.failure_times.push(now);
        let cutoff = now - self.window;
        state.failure_times.retain(|t| *t >= cutoff);

        if state.failure_times.len() >= self.threshold {
            state.unhealthy_until = Some(now + self.cooldown);
        }
        if let Err(e) =
            save_json_atomic(&self.paths.repo_health_file(), &*state, WriteMode::BestEffort)
        {
            warn!(error = %e, "repo health persist failed");
        }
    }

    pub fn is_unhealthy(&self, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .unhealthy_until
            .map(|until| now < until)
            .unwrap_or(false)
    }
}
