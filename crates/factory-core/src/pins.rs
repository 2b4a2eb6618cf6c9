//! Pins resolution: explicit pins, template+instance merge, Map-driven
//! generation, and file inference fallback.

use std::collections::BTreeMap;
use std::path::PathBuf;

use regex::Regex;
use serde::{Deserialize, Serialize};

use factory_state::{jsonl::canonical_json, CachedFile, ContentDigest};

use crate::collab::{AutoPinsRequest, MapRef, MapStore, MapVersion};
use crate::domain::{DispatchError, Pins, Task};

pub const PINS_RESULT_SCHEMA: &str = "scc.pins_result.v2";

/// Paths the gateway itself owns; no task may ever write here.
pub const ALWAYS_FORBIDDEN: &str = "artifacts/**";

/// Pins templates by task class (`pins_templates.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PinsTemplates {
    #[serde(default)]
    pub templates: BTreeMap<String, Pins>,
}

fn parse_templates(bytes: &[u8]) -> Option<PinsTemplates> {
    serde_json::from_slice(bytes).ok()
}

fn parse_map_version(bytes: &[u8]) -> Option<MapVersion> {
    serde_json::from_slice(bytes).ok()
}

/// Resolves effective pins for tasks.
pub struct PinsResolver {
    templates: CachedFile<PinsTemplates>,
    map_version: CachedFile<MapVersion>,
}

impl PinsResolver {
    pub fn new(templates_path: PathBuf, map_version_path: PathBuf) -> Self {
        Self {
            templates: CachedFile::new(templates_path, parse_templates),
            map_version: CachedFile::new(map_version_path, parse_map_version),
        }
    }

    /// Current Map version, mtime-cached.
    pub fn map_version(&self) -> Option<MapVersion> {
        self.map_version.get()
    }

    /// The effective pins for a task.
    ///
    /// Explicit `task.pins` wins; otherwise the task-class template merged
    /// with `task.pins_instance`. The result always forbids `artifacts/**`
    /// and must carry a non-empty allow list.
    pub fn resolve(&self, task: &Task) -> Result<Pins, DispatchError> {
        if let Some(pins) = &task.pins {
            return finalize(pins.clone());
        }

        let template = match &task.task_class_id {
            Some(class) => {
                let templates = self.templates.get().unwrap_or_default();
                match templates.templates.get(class) {
                    Some(t) => Some(t.clone()),
                    None if task.pins_instance.is_none() => {
                        return Err(DispatchError::MissingPinsTemplate(class.clone()))
                    }
                    None => None,
                }
            }
            None => None,
        };

        let Some(instance) = &task.pins_instance else {
            return match template {
                Some(t) => finalize(t),
                None => Err(DispatchError::MissingPins),
            };
        };

        let mut pins = template.unwrap_or_default();
        pins.allowed_paths
            .extend(instance.allowed_paths_add.iter().cloned());
        pins.forbidden_paths
            .extend(instance.forbidden_paths_add.iter().cloned());
        pins.symbols.extend(instance.symbols_add.iter().cloned());
        if let Some(windows) = &instance.line_windows {
            pins.line_windows = windows.clone();
        }
        if instance.max_files.is_some() {
            pins.max_files = instance.max_files;
        }
        if instance.max_loc.is_some() {
            pins.max_loc = instance.max_loc;
        }
        pins.ssot_assumptions
            .extend(instance.ssot_assumptions.iter().cloned());

        finalize(pins)
    }

    /// Ask the Map for pins when the task carries none. Returns the pins
    /// plus the Map hash they were derived from.
    pub async fn auto_pins_from_map(
        &self,
        map: &dyn MapStore,
        task: &Task,
        signals: Vec<String>,
    ) -> Option<(Pins, String)> {
        let version = self.map_version()?;
        let request = AutoPinsRequest {
            child_task: task.clone(),
            signals,
            map_ref: MapRef {
                path: version.map_path.clone(),
                hash: version.hash.clone(),
            },
            budgets: BTreeMap::new(),
        };

        let pins = map.auto_pins(&request).await?;
        match finalize(pins) {
            Ok(pins) => Some((pins, version.hash)),
            Err(_) => None,
        }
    }
}

fn finalize(mut pins: Pins) -> Result<Pins, DispatchError> {
    dedupe(&mut pins.allowed_paths);
    dedupe(&mut pins.forbidden_paths);
    dedupe(&mut pins.symbols);
    dedupe(&mut pins.ssot_assumptions);

    if !pins.forbidden_paths.iter().any(|p| p == ALWAYS_FORBIDDEN) {
        pins.forbidden_paths.push(ALWAYS_FORBIDDEN.to_string());
    }
    if pins.allowed_paths.is_empty() {
        return Err(DispatchError::MissingPinsAllowlist);
    }
    Ok(pins)
}

fn dedupe(values: &mut Vec<String>) {
    let mut seen = std::collections::BTreeSet::new();
    values.retain(|v| seen.insert(v.clone()));
}

/// Stable content hash of a pins spec, used to detect whether a Map-driven
/// fix actually changed anything.
pub fn pins_hash(pins: &Pins) -> String {
    let value = serde_json::to_value(pins).unwrap_or_default();
    ContentDigest::from_bytes(canonical_json(&value).as_bytes())
        .as_str()
        .to_string()
}

/// Extract repo-relative file paths from free text as a last-resort
/// fallback when a task lacks `files`.
pub fn infer_files_from_text(title: &str, goal: &str) -> Vec<String> {
    // Repo-relative path with a recognized extension.
    let pattern = Regex::new(
        r#"(?x)
        (?:^|[\s`'\"(\[])
        ([A-Za-z0-9_][A-Za-z0-9_.\-/]*
         \.(?:md|mjs|js|ts|tsx|py|json|yaml|yml|toml|ps1|sh))
        (?:$|[\s`'\"):\],])"#,
    )
    .expect("static regex");

    let mut found = Vec::new();
    for text in [title, goal] {
        for capture in pattern.captures_iter(text) {
            let path = capture[1].to_string();
            if path.contains("://") || path.starts_with('/') || path.contains("..") {
                continue;
            }
            if !found.contains(&path) {
                found.push(path);
            }
        }
    }
    found
}
