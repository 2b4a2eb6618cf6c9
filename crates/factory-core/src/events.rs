//! State event emission: global chained log + per-task mirror.

use std::sync::Mutex;

use tracing::debug;

use factory_state::{append_jsonl_chained, read_jsonl_tail, FactoryPaths};

use crate::domain::{Result, StateEvent};

/// Appends state events to `state_events.jsonl` and mirrors task-scoped
/// events into `artifacts/<task_id>/events.jsonl`. Both files are
/// hash-chained; appends are serialized per process so chains never race.
pub struct EventLog {
    paths: FactoryPaths,
    write_lock: Mutex<()>,
}

impl EventLog {
    pub fn new(paths: FactoryPaths) -> Self {
        Self {
            paths,
            write_lock: Mutex::new(()),
        }
    }

    pub fn emit(&self, event: &StateEvent) -> Result<()> {
        let _guard = self.write_lock.lock().unwrap_or_else(|p| p.into_inner());
        let value = serde_json::to_value(event)?;

        append_jsonl_chained(&self.paths.state_events_file(), &value)?;
        if let Some(task_id) = &event.task_id {
            append_jsonl_chained(&self.paths.task_events_file(task_id), &value)?;
        }
        debug!(event_type = event.event_type.as_str(), task_id = ?event.task_id, "state event");
        Ok(())
    }

    /// Most recent events from the global log, oldest first.
    pub fn tail(&self, n: usize) -> Vec<StateEvent> {
        read_jsonl_tail(&self.paths.state_events_file(), n).unwrap_or_default()
    }

    /// Most recent events for one task.
    pub fn task_tail(&self, task_id: &str, n: usize) -> Vec<StateEvent> {
        read_jsonl_tail(&self.paths.task_events_file(task_id), n).unwrap_or_default()
    }
}
