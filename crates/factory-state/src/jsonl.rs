//! Append-only JSONL streams with optional hash chaining.
//!
//! Chained records carry two extra fields:
//! - `chain_prev_hash`: the `chain_hash` of the previous record (or `null`
//!   at chain start)
//! - `chain_hash`: SHA-256 of the canonical JSON of the record *without*
//!   `chain_hash` itself
//!
//! Appends serialize per file through the filesystem append mode; readers
//! ignore a trailing partial line so a crash mid-append never poisons a log.
//! When the tail cannot be parsed at all, the next append starts a new chain
//! rather than failing.

use std::io::Write;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::digest::ContentDigest;
use crate::error::{StoreError, StoreResult};

pub const CHAIN_HASH_FIELD: &str = "chain_hash";
pub const CHAIN_PREV_FIELD: &str = "chain_prev_hash";

/// Append one record as a single compact JSON line.
pub fn append_jsonl<T: Serialize>(path: &Path, record: &T) -> StoreResult<()> {
    let line = serde_json::to_string(record)?;
    append_line(path, &line)
}

/// Append a record with hash chaining.
///
/// Reads the current tail to locate the previous `chain_hash`, stamps
/// `chain_prev_hash`, computes this record's `chain_hash`, and appends.
/// Returns the stamped record.
pub fn append_jsonl_chained(path: &Path, record: &Value) -> StoreResult<Value> {
    let prev_hash = last_chain_hash(path);

    let mut obj = match record {
        Value::Object(map) => map.clone(),
        other => {
            let mut map = serde_json::Map::new();
            map.insert("value".to_string(), other.clone());
            map
        }
    };
    obj.remove(CHAIN_HASH_FIELD);
    obj.insert(
        CHAIN_PREV_FIELD.to_string(),
        prev_hash.map(Value::String).unwrap_or(Value::Null),
    );

    let hash = chain_hash_of(&Value::Object(obj.clone()));
    obj.insert(CHAIN_HASH_FIELD.to_string(), Value::String(hash));

    let stamped = Value::Object(obj);
    let line = serde_json::to_string(&stamped)?;
    append_line(path, &line)?;
    Ok(stamped)
}

/// Read every valid record, skipping unparseable lines (truncated tails).
pub fn read_jsonl_all<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<T>> {
    let text = match std::fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::io(path, e)),
    };

    Ok(text
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect())
}

/// Return up to `n` most-recent valid records, oldest first.
pub fn read_jsonl_tail<T: DeserializeOwned>(path: &Path, n: usize) -> StoreResult<Vec<T>> {
    let mut all: Vec<T> = read_jsonl_all(path)?;
    if all.len() > n {
        all.drain(..all.len() - n);
    }
    Ok(all)
}

/// Outcome of a full-chain verification pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainReport {
    pub records: usize,
    /// Number of chain restarts observed after the first record (a restart
    /// is a record whose `chain_prev_hash` is null mid-file).
    pub restarts: usize,
}

/// Verify every record's `chain_hash` and linkage. Restarted chains are
/// tolerated and counted; a wrong hash or broken link is an error.
pub fn verify_chain(path: &Path) -> StoreResult<ChainReport> {
    let records: Vec<Value> = read_jsonl_all(path)?;
    let mut prev: Option<String> = None;
    let mut restarts = 0usize;

    for (idx, record) in records.iter().enumerate() {
        let obj = record.as_object().ok_or_else(|| StoreError::ChainBroken {
            line: idx + 1,
            reason: "record is not an object".to_string(),
        })?;

        let stored_hash = obj
            .get(CHAIN_HASH_FIELD)
            .and_then(|v| v.as_str())
            .ok_or_else(|| StoreError::ChainBroken {
                line: idx + 1,
                reason: "missing chain_hash".to_string(),
            })?
            .to_string();

        let mut unhashed = obj.clone();
        unhashed.remove(CHAIN_HASH_FIELD);
        let expected = chain_hash_of(&Value::Object(unhashed));
        if expected != stored_hash {
            return Err(StoreError::ChainBroken {
                line: idx + 1,
                reason: format!("hash mismatch: expected {expected}, got {stored_hash}"),
            });
        }

        let stored_prev = obj.get(CHAIN_PREV_FIELD).and_then(|v| v.as_str());
        match (idx, stored_prev, prev.as_deref()) {
            (0, _, _) => {}
            (_, None, _) => restarts += 1,
            (_, Some(p), Some(expected_prev)) if p == expected_prev => {}
            (_, Some(p), expected_prev) => {
                return Err(StoreError::ChainBroken {
                    line: idx + 1,
                    reason: format!(
                        "prev hash mismatch: expected {:?}, got {p}",
                        expected_prev
                    ),
                });
            }
        }

        prev = Some(stored_hash);
    }

    Ok(ChainReport {
        records: records.len(),
        restarts,
    })
}

fn append_line(path: &Path, line: &str) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| StoreError::io(path, e))?;
    writeln!(file, "{line}").map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Last valid record's `chain_hash`, or `None` when the file is absent,
/// empty, or its tail is unreadable (new chain start).
fn last_chain_hash(path: &Path) -> Option<String> {
    let records: Vec<Value> = read_jsonl_all(path).ok()?;
    records
        .last()?
        .get(CHAIN_HASH_FIELD)?
        .as_str()
        .map(str::to_string)
}

/// Canonical JSON (recursively key-sorted, compact) digest of a value.
fn chain_hash_of(value: &Value) -> String {
    let canonical = canonical_json(value);
    ContentDigest::from_bytes(canonical.as_bytes())
        .as_str()
        .to_string()
}

/// Recursively sort object keys and serialize compactly so hashing is
/// independent of field insertion order.
pub fn canonical_json(value: &Value) -> String {
    fn sort_keys(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut keys: Vec<_> = map.keys().collect();
                keys.sort();
                let mut sorted = serde_json::Map::new();
                for key in keys {
                    if let Some(v) = map.get(key) {
                        sorted.insert(key.clone(), sort_keys(v));
                    }
                }
                Value::Object(sorted)
            }
            Value::Array(arr) => Value::Array(arr.iter().map(sort_keys).collect()),
            other => other.clone(),
        }
    }
    serde_json::to_string(&sort_keys(value)).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn test_append_and_read_tail() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");

        for i in 0..5 {
            append_jsonl(&path, &json!({ "seq": i })).expect("append");
        }

        let tail: Vec<Value> = read_jsonl_tail(&path, 2).expect("tail");
        assert_eq!(tail.len(), 2);
        assert_eq!(tail[0]["seq"], 3);
        assert_eq!(tail[1]["seq"], 4);
    }

    #[test]
    fn test_truncated_tail_line_ignored() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("events.jsonl");

        append_jsonl(&path, &json!({ "seq": 0 })).expect("append");
        // Simulate a crash mid-append
        let mut file = std::fs::OpenOptions::new()
            .append(true)
            .open(&path)
            .expect("open");
        write!(file, "{{\"seq\": 1, \"tru").expect("write");

        let all: Vec<Value> = read_jsonl_all(&path).expect("read");
        assert_eq!(all.len(), 1);
        assert_eq!(all[0]["seq"], 0);
    }

    #[test]
    fn test_chained_append_links_records() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state_events.jsonl");

        let first = append_jsonl_chained(&path, &json!({ "type": "SUCCESS" })).expect("append");
        let second = append_jsonl_chained(&path, &json!({ "type": "CI_FAILED" })).expect("append");

        assert!(first[CHAIN_PREV_FIELD].is_null());
        assert_eq!(second[CHAIN_PREV_FIELD], first[CHAIN_HASH_FIELD]);

        let report = verify_chain(&path).expect("verify");
        assert_eq!(report.records, 2);
        assert_eq!(report.restarts, 0);
    }

    #[test]
    fn test_verify_chain_detects_tamper() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("state_events.jsonl");

        append_jsonl_chained(&path, &json!({ "type": "SUCCESS", "n": 1 })).expect("append");
        append_jsonl_chained(&path, &json!({ "type": "SUCCESS", "n": 2 })).expect("append");

        // Flip a payload byte without recomputing hashes
        let text = std::fs::read_to_string(&path).expect("read");
        let tampered = text.replace("\"n\":1", "\"n\":9");
        std::fs::write(&path, tampered).expect("write");

        let result = verify_chain(&path);
        assert!(matches!(result, Err(StoreError::ChainBroken { .. })));
    }

    #[test]
    fn test_unreadable_tail_starts_new_chain() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("log.jsonl");

        // Garbage-only file: next append should start a fresh chain
        std::fs::write(&path, "not json at all\n").expect("write");
        let record = append_jsonl_chained(&path, &json!({ "type": "X" })).expect("append");
        assert!(record[CHAIN_PREV_FIELD].is_null());
    }

    #[test]
    fn test_canonical_json_key_order_invariant() {
        let a = canonical_json(&json!({ "b": 1, "a": { "d": 2, "c": 3 } }));
        let b = canonical_json(&json!({ "a": { "c": 3, "d": 2 }, "b": 1 }));
        assert_eq!(a, b);
    }
}
