//! Atomic JSON document persistence (tmp + rename).

use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::warn;

use crate::error::{StoreError, StoreResult};

/// How write failures propagate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    /// Errors bubble up to the caller.
    Strict,
    /// Errors are logged and swallowed. Used for non-critical side artifacts
    /// where losing one write must not fail the pipeline.
    BestEffort,
}

/// Serialize `value` and write it to `path` atomically.
///
/// The bytes land in `<path>.tmp` first and are renamed into place, so a
/// reader never observes a half-written document. Parent directories are
/// created as needed.
pub fn save_json_atomic<T: Serialize>(
    path: &Path,
    value: &T,
    mode: WriteMode,
) -> StoreResult<()> {
    match save_inner(path, value) {
        Ok(()) => Ok(()),
        Err(e) => match mode {
            WriteMode::Strict => Err(e),
            WriteMode::BestEffort => {
                warn!(path = %path.display(), error = %e, "best-effort save failed");
                Ok(())
            }
        },
    }
}

fn save_inner<T: Serialize>(path: &Path, value: &T) -> StoreResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
    }

    let bytes = serde_json::to_vec_pretty(value)?;
    let tmp = path.with_extension(match path.extension() {
        Some(ext) => format!("{}.tmp", ext.to_string_lossy()),
        None => "tmp".to_string(),
    });

    std::fs::write(&tmp, &bytes).map_err(|e| StoreError::io(&tmp, e))?;
    std::fs::rename(&tmp, path).map_err(|e| StoreError::io(path, e))?;
    Ok(())
}

/// Load a JSON document. Returns `None` if the file does not exist.
pub fn load_json<T: DeserializeOwned>(path: &Path) -> StoreResult<Option<T>> {
    let bytes = match std::fs::read(path) {
        Ok(b) => b,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    Ok(Some(serde_json::from_slice(&bytes)?))
}

/// Load a JSON document, falling back to `T::default()` when absent.
pub fn load_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> StoreResult<T> {
    Ok(load_json(path)?.unwrap_or_default())
}
