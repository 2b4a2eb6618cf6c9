//! factory-state: persistence layer for the SCC factory gateway.
//!
//! Every durable collection (board, jobs, workers, breaker/health/fuse
//! states) is a single JSON document written atomically (tmp + rename).
//! Event streams are append-only JSONL, optionally hash-chained for the
//! critical logs. Readers tolerate truncation at file end so a crash during
//! an append never poisons a log.
//!
//! All paths are anchored under a configured repo root; the store never
//! escapes it.

pub mod atomic;
pub mod cache;
pub mod digest;
pub mod error;
pub mod jsonl;
pub mod paths;

pub use atomic::{load_json, load_json_or_default, save_json_atomic, WriteMode};
pub use cache::CachedFile;
pub use digest::ContentDigest;
pub use error::{StoreError, StoreResult};
pub use jsonl::{
    append_jsonl, append_jsonl_chained, read_jsonl_all, read_jsonl_tail, verify_chain,
    ChainReport,
};
pub use paths::FactoryPaths;
