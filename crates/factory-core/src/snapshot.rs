//! Pre-run file snapshots and post-run diffs.

use std::path::Path;

use base64::Engine;
use chrono::Utc;
use regex::Regex;

use factory_state::ContentDigest;

use crate::domain::{Pins, PreSnapshot, PreSnapshotFull, SnapshotDiff, SnapshotEntry, Task};

/// Snapshot caps.
pub const MAX_SNAPSHOT_FILES: usize = 64;
pub const MAX_HASH_BYTES: u64 = 1024 * 1024;

/// Full-content capture caps (rollback support).
pub const FULL_MAX_FILES: usize = 3;
pub const FULL_MAX_FILE_BYTES: u64 = 120 * 1024;
pub const FULL_MAX_TOTAL_BYTES: u64 = 200 * 1024;

pub const PRE_SNAPSHOT_FULL_SCHEMA: &str = "scc.pre_snapshot_full.v1";

/// Paths that are not real repo files: numeric virtual prefixes, URLs, and
/// the gateway-owned artifacts tree.
pub fn is_virtual_path(path: &str) -> bool {
    static VIRTUAL_PREFIX: std::sync::OnceLock<Regex> = std::sync::OnceLock::new();
    let re = VIRTUAL_PREFIX.get_or_init(|| Regex::new(r"^\d{2,6}/").expect("static regex"));
    re.is_match(path)
        || path.contains("://")
        || path.starts_with("artifacts/")
        || path.starts_with('/')
}

/// Normalize a candidate path: strip `./` prefixes and glob suffixes so
/// `src/**` snapshots the directory root marker rather than a literal glob.
fn normalize(path: &str) -> Option<String> {
    let trimmed = path.trim().trim_start_matches("./");
    if trimmed.is_empty() || trimmed.contains("..") {
        return None;
    }
    let without_glob = match trimmed.find("/*") {
        Some(idx) => &trimmed[..idx],
        None => trimmed,
    };
    if without_glob.is_empty() || without_glob.contains('*') || without_glob.contains('?') {
        return None;
    }
    Some(without_glob.to_string())
}

/// Capture the pre-run snapshot over `pins.allowed_paths ∪ task.files`.
///
/// Returns the hash snapshot and, when the footprint is small enough, a
/// full base64 content capture enabling docs-only auto-rollback.
pub fn capture_pre_snapshot(
    repo_root: &Path,
    task: &Task,
    pins: &Pins,
) -> (PreSnapshot, Option<PreSnapshotFull>) {
    let mut candidates: Vec<String> = Vec::new();
    for path in pins.allowed_paths.iter().chain(task.files.iter()) {
        if is_virtual_path(path) {
            continue;
        }
        if let Some(normalized) = normalize(path) {
            if !candidates.contains(&normalized) {
                candidates.push(normalized);
            }
        }
    }
    candidates.truncate(MAX_SNAPSHOT_FILES);

    let mut entries = Vec::with_capacity(candidates.len());
    for path in &candidates {
        entries.push(observe(repo_root, path));
    }

    let snapshot = PreSnapshot {
        captured_at: Some(Utc::now()),
        entries,
    };

    let full = capture_full(repo_root, &snapshot);
    (snapshot, full)
}

fn observe(repo_root: &Path, path: &str) -> SnapshotEntry {
    let abs = repo_root.join(path);
    let metadata = match std::fs::metadata(&abs) {
        Ok(m) if m.is_file() => m,
        _ => {
            return SnapshotEntry {
                path: path.to_string(),
                exists: abs.exists(),
                size: None,
                sha256: None,
            }
        }
    };

    let size = metadata.len();
    let sha256 = if size <= MAX_HASH_BYTES {
        std::fs::read(&abs)
            .ok()
            .map(|bytes| ContentDigest::from_bytes(&bytes).as_str().to_string())
    } else {
        None
    };

    SnapshotEntry {
        path: path.to_string(),
        exists: true,
        size: Some(size),
        sha256,
    }
}

/// Capture full file contents when the existing-file subset fits the caps.
fn capture_full(repo_root: &Path, snapshot: &PreSnapshot) -> Option<PreSnapshotFull> {
    let files: Vec<&SnapshotEntry> = snapshot
        .entries
        .iter()
        .filter(|e| e.size.is_some() || !e.exists)
        .collect();
    let existing: Vec<&&SnapshotEntry> = files.iter().filter(|e| e.exists).collect();

    if existing.len() > FULL_MAX_FILES {
        return None;
    }
    let mut total = 0u64;
    for entry in &existing {
        let size = entry.size.unwrap_or(0);
        if size > FULL_MAX_FILE_BYTES {
            return None;
        }
        total += size;
    }
    if total > FULL_MAX_TOTAL_BYTES {
        return None;
    }

    let mut full = PreSnapshotFull {
        schema_version: PRE_SNAPSHOT_FULL_SCHEMA.to_string(),
        contents: Default::default(),
    };
    for entry in files {
        let content = if entry.exists {
            std::fs::read(repo_root.join(&entry.path))
                .ok()
                .map(|bytes| base64::engine::general_purpose::STANDARD.encode(bytes))
        } else {
            None
        };
        full.contents.insert(entry.path.clone(), content);
    }
    Some(full)
}

/// Re-scan the snapshot paths and report what changed.
///
/// A file is touched when its existence flipped or its sha256 changed; for
/// files over the hash cap a size change counts.
pub fn diff_snapshot(repo_root: &Path, pre: &PreSnapshot) -> SnapshotDiff {
    let mut touched = Vec::new();
    for entry in &pre.entries {
        let current = observe(repo_root, &entry.path);
        let changed = if current.exists != entry.exists {
            true
        } else if !current.exists {
            false
        } else {
            match (&entry.sha256, &current.sha256) {
                (Some(a), Some(b)) => a != b,
                // Content over cap on either side: fall back to size
                _ => entry.size != current.size,
            }
        };
        if changed {
            touched.push(entry.path.clone());
        }
    }
    SnapshotDiff {
        touched_files: touched,
    }
}
