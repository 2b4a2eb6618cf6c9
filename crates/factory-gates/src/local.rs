//! Minimal local collaborator adapters for standalone deployments.
//!
//! The Map index, pack rendering, and schema validation are separate
//! services in a full installation; these adapters give the binaries a
//! working default when those services are not wired in.

use std::path::PathBuf;

use async_trait::async_trait;

use factory_core::collab::{
    AutoPinsRequest, ContextPackRenderer, MapStore, RenderedPack, SchemaValidator,
};
use factory_core::domain::{Pins, Task};

/// MapStore over local map files. Pins inference falls back to the task's
/// own file list; the real Map service does symbol-level selection.
pub struct LocalMapStore {
    #[allow(dead_code)]
    repo_root: PathBuf,
}

impl LocalMapStore {
    pub fn new(repo_root: impl Into<PathBuf>) -> Self {
        Self {
            repo_root: repo_root.into(),
        }
    }
}

#[async_trait]
impl MapStore for LocalMapStore {
    async fn auto_pins(&self, request: &AutoPinsRequest) -> Option<Pins> {
        let task = &request.child_task;
        let mut files = task.files.clone();
        if files.is_empty() {
            files = factory_core::pins::infer_files_from_text(&task.title, &task.goal);
        }
        if files.is_empty() {
            return None;
        }
        Some(Pins {
            allowed_paths: files,
            ..Pins::default()
        })
    }

    async fn test_entry_points(&self, task: &Task) -> Vec<String> {
        task.files
            .iter()
            .filter(|f| f.contains("test"))
            .map(|f| format!("pytest -q {f}"))
            .collect()
    }
}

/// Deterministic local pack renderer: stable id and bytes for the same
/// task + pins.
#[derive(Debug, Default)]
pub struct LocalPackRenderer;

#[async_trait]
impl ContextPackRenderer for LocalPackRenderer {
    async fn render(&self, task: &Task, pins: &Pins) -> Result<RenderedPack, String> {
        let json = serde_json::json!({
            "schema_version": "scc.context_pack.v1",
            "task_id": task.id,
            "title": task.title,
            "goal": task.goal,
            "allowed_paths": pins.allowed_paths,
            "forbidden_paths": pins.forbidden_paths,
            "symbols": pins.symbols,
        });
        let digest = factory_state::ContentDigest::from_bytes(
            serde_json::to_string(&json).map_err(|e| e.to_string())?.as_bytes(),
        );
        let mut text = format!(
            "# Context Pack v1\n\ntask: {}\ntitle: {}\n\n## Allowed paths\n",
            task.id, task.title
        );
        for path in &pins.allowed_paths {
            text.push_str(&format!("- {path}\n"));
        }
        Ok(RenderedPack {
            pack_id: format!("cp1-{}", digest.short()),
            text,
            json,
            included_sections: 1 + pins.allowed_paths.len() as u32,
            unused_ratio: 0.0,
        })
    }
}

/// Schema validator that checks the `schema_version` tag only. The real
/// validator runs full JSON-schema tables.
#[derive(Debug, Default)]
pub struct SchemaVersionValidator;

impl SchemaValidator for SchemaVersionValidator {
    fn validate(&self, schema_id: &str, document: &serde_json::Value) -> Result<(), String> {
        match document.get("schema_version").and_then(|v| v.as_str()) {
            Some(version) if version == schema_id => Ok(()),
            Some(version) => Err(format!("schema_version {version}, expected {schema_id}")),
            None => Err("document has no schema_version".to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use factory_core::collab::MapRef;
    use std::collections::BTreeMap;

    #[tokio::test]
    async fn test_local_map_pins_from_task_files() {
        let store = LocalMapStore::new("/repo");
        let mut task = Task::new_atomic("t", "engineer");
        task.files = vec!["src/a.ts".to_string()];
        let request = AutoPinsRequest {
            child_task: task,
            signals: vec![],
            map_ref: MapRef {
                path: "map/source_map.json".to_string(),
                hash: "h".to_string(),
            },
            budgets: BTreeMap::new(),
        };

        let pins = store.auto_pins(&request).await.expect("pins");
        assert_eq!(pins.allowed_paths, vec!["src/a.ts"]);
    }

    #[tokio::test]
    async fn test_renderer_is_deterministic() {
        let renderer = LocalPackRenderer;
        let mut task = Task::new_atomic("t", "engineer");
        task.files = vec!["src/a.ts".to_string()];
        let pins = Pins {
            allowed_paths: vec!["src/a.ts".to_string()],
            ..Pins::default()
        };

        let a = renderer.render(&task, &pins).await.expect("render");
        let b = renderer.render(&task, &pins).await.expect("render");
        assert_eq!(a.pack_id, b.pack_id);
        assert_eq!(a.json, b.json);
    }

    #[test]
    fn test_schema_version_validator() {
        let validator = SchemaVersionValidator;
        let doc = serde_json::json!({ "schema_version": "scc.verdict.v1" });
        assert!(validator.validate("scc.verdict.v1", &doc).is_ok());
        assert!(validator.validate("scc.submit.v1", &doc).is_err());
        assert!(validator
            .validate("scc.submit.v1", &serde_json::json!({}))
            .is_err());
    }
}
