//! Deterministic preflight: pins coverage + allowed tests + write scope.
//!
//! Preflight is pure over its inputs (task, pins, role policy, filesystem
//! view); the same inputs always produce the same `{pass, missing}` result.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use factory_state::CachedFile;

use crate::collab::MapStore;
use crate::domain::{Pins, Task};
use crate::roles::{RolePolicy, ScopeCheck};

/// Commands allowed as declared tests. Anything else is rejected as unsafe
/// or unknown tooling.
pub const ALLOWED_TEST_PREFIXES: &[&str] = &[
    "bun test",
    "npm test",
    "pnpm test",
    "yarn test",
    "pytest",
    "python -m pytest",
    "python scc-top/tools/scc/ops/task_selftest.py",
    "python tools/scc/gates/run_ci_gates.py",
    "go test",
    "cargo test",
    "dotnet test",
];

/// Safe fallback commands tried by the auto-fixer after manifest and Map
/// candidates.
pub const FALLBACK_TEST_COMMANDS: &[&str] =
    &["python -m compileall .", "pytest -q", "python -m pytest -q"];

const UNSAFE_METACHARS: &[char] = &[';', '|', '&', '`', '$', '>', '<', '\n'];

/// Marker recorded in `missing.tests` when no real (non-selftest) command
/// is declared at all.
pub const NO_REAL_TEST_MARKER: &str = "no_real_test_command";

/// What preflight found missing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct MissingInputs {
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub symbols: Vec<String>,
    #[serde(default)]
    pub tests: Vec<String>,
    #[serde(default)]
    pub write_scope: Vec<String>,
}

impl MissingInputs {
    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
            && self.symbols.is_empty()
            && self.tests.is_empty()
            && self.write_scope.is_empty()
    }

    /// True when tests are the only gap (the auto-fixable case).
    pub fn only_tests(&self) -> bool {
        !self.tests.is_empty()
            && self.files.is_empty()
            && self.symbols.is_empty()
            && self.write_scope.is_empty()
    }
}

/// Preflight outcome, persisted as `artifacts/<task_id>/preflight.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PreflightResult {
    pub pass: bool,
    #[serde(default)]
    pub missing: MissingInputs,
}

/// True for the gateway-owned structural selftest command.
pub fn is_selftest_command(command: &str) -> bool {
    command.trim().contains("task_selftest.py")
}

/// Validate one declared test command. `None` means acceptable.
pub fn validate_test_command(command: &str) -> Option<String> {
    let trimmed = command.trim();
    if trimmed.is_empty() {
        return Some("empty command".to_string());
    }
    if trimmed.chars().any(|c| UNSAFE_METACHARS.contains(&c)) {
        return Some("unsafe shell metacharacters".to_string());
    }
    if !ALLOWED_TEST_PREFIXES
        .iter()
        .any(|prefix| trimmed == *prefix || trimmed.starts_with(&format!("{prefix} ")))
    {
        return Some("not on the allowed command list".to_string());
    }
    None
}

/// Run preflight for a task against its resolved pins and role policy.
pub fn preflight(
    repo_root: &Path,
    task: &Task,
    pins: &Pins,
    role_policy: Option<&RolePolicy>,
) -> PreflightResult {
    let mut missing = MissingInputs::default();

    // Declared files must exist on disk under the repo root.
    for file in &task.files {
        if !repo_root.join(file).exists() {
            missing.files.push(file.clone());
        }
    }

    // Declared tests must be valid, and at least one must be a real test.
    let mut has_real_test = false;
    for command in &task.allowed_tests {
        if let Some(reason) = validate_test_command(command) {
            missing.tests.push(format!("{command}: {reason}"));
        } else if !is_selftest_command(command) {
            has_real_test = true;
        }
    }
    if !has_real_test {
        missing.tests.push(NO_REAL_TEST_MARKER.to_string());
    }

    // Pins allow-paths must sit inside the role's write scope.
    if let Some(policy) = role_policy {
        for path in &pins.allowed_paths {
            let probe = scope_probe(path);
            if policy.check_write(&probe) != ScopeCheck::Ok {
                missing.write_scope.push(path.clone());
            }
        }
    }

    PreflightResult {
        pass: missing.is_empty(),
        missing,
    }
}

/// Glob-style allow paths (`src/**`) are probed by their directory root so a
/// directory grant matches the role's directory globs.
fn scope_probe(path: &str) -> String {
    match path.find("/*") {
        Some(idx) => format!("{}/__probe__", &path[..idx]),
        None => path.to_string(),
    }
}

/// Tiered test-command manifest (`eval/eval_manifest.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EvalManifest {
    #[serde(default)]
    pub tiers: std::collections::BTreeMap<String, Vec<String>>,
}

fn parse_manifest(bytes: &[u8]) -> Option<EvalManifest> {
    serde_json::from_slice(bytes).ok()
}

/// Candidate generator for `auto_fix_allowed_tests`.
pub struct TestAutoFixer {
    manifest: CachedFile<EvalManifest>,
}

impl TestAutoFixer {
    pub fn new(manifest_path: PathBuf) -> Self {
        Self {
            manifest: CachedFile::new(manifest_path, parse_manifest),
        }
    }

    /// When only `missing.tests` is non-empty, propose a replacement command
    /// list: manifest tier first, then Map entry points, then safe
    /// fallbacks. Returns the first candidate that survives validation.
    pub async fn auto_fix(
        &self,
        repo_root: &Path,
        task: &Task,
        pins: &Pins,
        role_policy: Option<&RolePolicy>,
        map: &dyn MapStore,
        tier: &str,
    ) -> Option<Vec<String>> {
        let manifest = self.manifest.get().unwrap_or_default();
        let mut candidates: Vec<String> = manifest.tiers.get(tier).cloned().unwrap_or_default();
        candidates.extend(map.test_entry_points(task).await);
        candidates.extend(FALLBACK_TEST_COMMANDS.iter().map(|c| c.to_string()));

        for candidate in candidates {
            let mut patched = task.clone();
            patched.allowed_tests = vec![candidate.clone()];
            let result = preflight(repo_root, &patched, pins, role_policy);
            if result.missing.tests.is_empty() {
                return Some(vec![candidate]);
            }
        }
        None
    }
}
