//! Error types for factory-state

use std::path::PathBuf;

use thiserror::Error;

/// Errors that can occur in the persistence layer
#[derive(Error, Debug)]
pub enum StoreError {
    /// Filesystem I/O error with the path that failed
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Serialization error
    #[error("serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A path tried to escape the configured repo root
    #[error("path escapes repo root: {0}")]
    PathEscape(String),

    /// Invalid digest string (not valid 64-char hex)
    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    /// Hash chain verification failure
    #[error("chain broken at line {line}: {reason}")]
    ChainBroken { line: usize, reason: String },
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_store_error_display() {
        let err = StoreError::PathEscape("../outside".to_string());
        assert!(err.to_string().contains("escapes repo root"));

        let err = StoreError::InvalidDigest("zz".to_string());
        assert!(err.to_string().contains("invalid digest"));

        let err = StoreError::ChainBroken {
            line: 7,
            reason: "prev hash mismatch".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("line 7"));
        assert!(msg.contains("prev hash mismatch"));
    }
}
