//! Fuses: time-bounded circuits forbidding certain dispatches after
//! repeated failures. Persisted so a restart does not forget a hot fuse.

use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use factory_state::{load_json, save_json_atomic, FactoryPaths, WriteMode};

use crate::domain::ExecutorKind;

const WINDOW_MINUTES: i64 = 5;
const BLOCK_MINUTES: i64 = 10;
const TRIP_COUNT: usize = 3;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct FuseState {
    #[serde(default)]
    pub timeout_events: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_blocked_until: Option<DateTime<Utc>>,
    #[serde(default)]
    pub occli_flake_events: Vec<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub occli_blocked_until: Option<DateTime<Utc>>,
}

/// Timeout fuse (blocks external dispatch) and opencode-cli flake fuse
/// (blocks routing to the free executor). Both trip on 3 events in 5
/// minutes and hold for 10 minutes.
pub struct FuseBox {
    paths: FactoryPaths,
    state: RwLock<FuseState>,
}

impl FuseBox {
    pub fn load(paths: FactoryPaths) -> Self {
        let state = load_json(&paths.fuses_file())
            .ok()
            .flatten()
            .unwrap_or_default();
        Self {
            paths,
            state: RwLock::new(state),
        }
    }

    fn persist(&self, state: &FuseState) {
        if let Err(e) = save_json_atomic(&self.paths.fuses_file(), state, WriteMode::BestEffort) {
            warn!(error = %e, "fuse state persist failed");
        }
    }

    /// Record a job timeout. Returns true when the fuse just tripped.
    pub fn record_timeout(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let state_ref = &mut *state;
        let tripped = record(
            &mut state_ref.timeout_events,
            &mut state_ref.timeout_blocked_until,
            now,
        );
        if tripped {
            info!("timeout fuse tripped; external dispatch blocked");
        }
        self.persist(&state);
        tripped
    }

    /// Record an opencode-cli flake (non-zero exit with empty output).
    pub fn record_occli_flake(&self, now: DateTime<Utc>) -> bool {
        let mut state = self.state.write().unwrap_or_else(|p| p.into_inner());
        let state_ref = &mut *state;
        let tripped = record(
            &mut state_ref.occli_flake_events,
            &mut state_ref.occli_blocked_until,
            now,
        );
        if tripped {
            info!("opencode-cli flake fuse tripped; routing blocked");
        }
        self.persist(&state);
        tripped
    }

    pub fn timeout_fused(&self, now: DateTime<Utc>) -> bool {
        self.state
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .timeout_blocked_until
            .map(|until| now < until)
            .unwrap_or(false)
    }

    pub fn executor_fused(&self, executor: ExecutorKind, now: DateTime<Utc>) -> bool {
        match executor {
            ExecutorKind::Opencodecli => self
                .state
                .read()
                .unwrap_or_else(|p| p.into_inner())
                .occli_blocked_until
                .map(|until| now < until)
                .unwrap_or(false),
            ExecutorKind::Codex => false,
        }
    }
}

fn record(
    events: &mut Vec<DateTime<Utc>>,
    blocked_until: &mut Option<DateTime<Utc>>,
    now: DateTime<Utc>,
) -> bool {
    events.push(now);
    let cutoff = now - Duration::minutes(WINDOW_MINUTES);
    events.retain(|t| *t >= cutoff);

    let already_blocked = blocked_until.map(|u| now < u).unwrap_or(false);
    if events.len() >= TRIP_COUNT && !already_blocked {
        *blocked_until = Some(now + Duration::minutes(BLOCK_MINUTES));
        events.clear();
        true
    } else {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_timeout_fuse_trips_at_three_in_window() {
        let dir = tempdir().expect("tempdir");
        let fuses = FuseBox::load(FactoryPaths::new(dir.path()));
        let now = Utc::now();

        assert!(!fuses.record_timeout(now));
        assert!(!fuses.record_timeout(now));
        assert!(fuses.record_timeout(now));
        assert!(fuses.timeout_fused(now));
        assert!(!fuses.timeout_fused(now + Duration::minutes(11)));
    }

    #[test]
    fn test_spread_out_timeouts_do_not_trip() {
        let dir = tempdir().expect("tempdir");
        let fuses = FuseBox::load(FactoryPaths::new(dir.path()));
        let now = Utc::now();

        fuses.record_timeout(now - Duration::minutes(20));
        fuses.record_timeout(now - Duration::minutes(10));
        assert!(!fuses.record_timeout(now));
        assert!(!fuses.timeout_fused(now));
    }

    #[test]
    fn test_occli_fuse_only_blocks_occli() {
        let dir = tempdir().expect("tempdir");
        let fuses = FuseBox::load(FactoryPaths::new(dir.path()));
        let now = Utc::now();

        for _ in 0..3 {
            fuses.record_occli_flake(now);
        }
        assert!(fuses.executor_fused(ExecutorKind::Opencodecli, now));
        assert!(!fuses.executor_fused(ExecutorKind::Codex, now));
    }

    #[test]
    fn test_fuse_state_survives_restart() {
        let dir = tempdir().expect("tempdir");
        let paths = FactoryPaths::new(dir.path());
        let now = Utc::now();
        {
            let fuses = FuseBox::load(paths.clone());
            for _ in 0..3 {
                fuses.record_occli_flake(now);
            }
        }
        let fuses = FuseBox::load(paths);
        assert!(fuses.executor_fused(ExecutorKind::Opencodecli, now));
    }
}
