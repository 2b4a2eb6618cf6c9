//! Mtime-invalidated file caches for lock-free hot-path reads.

use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::SystemTime;

/// A lazily loaded, mtime-invalidated view of a file.
///
/// `get` re-parses only when the file's modification time changes, so the
/// scheduler can consult the policy on every dispatch without re-reading it.
/// A missing or unparseable file yields `None` until it becomes readable.
pub struct CachedFile<T> {
    path: PathBuf,
    parse: fn(&[u8]) -> Option<T>,
    state: Mutex<CacheState<T>>,
}

struct CacheState<T> {
    mtime: Option<SystemTime>,
    value: Option<T>,
}

impl<T: Clone> CachedFile<T> {
    pub fn new(path: impl Into<PathBuf>, parse: fn(&[u8]) -> Option<T>) -> Self {
        Self {
            path: path.into(),
            parse,
            state: Mutex::new(CacheState {
                mtime: None,
                value: None,
            }),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Current parsed value, reloading if the file changed on disk.
    pub fn get(&self) -> Option<T> {
        let mtime = std::fs::metadata(&self.path)
            .and_then(|m| m.modified())
            .ok();

        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        if state.mtime != mtime || (state.value.is_none() && mtime.is_some()) {
            state.value = std::fs::read(&self.path)
                .ok()
                .and_then(|bytes| (self.parse)(&bytes));
            state.mtime = mtime;
        }
        state.value.clone()
    }

    /// Drop the cached value so the next `get` re-reads unconditionally.
    pub fn invalidate(&self) {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.mtime = None;
        state.value = None;
    }
}
