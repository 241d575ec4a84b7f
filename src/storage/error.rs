//! Error types for storage operations

use std::path::PathBuf;

use thiserror::Error;

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during storage operations
///
/// Every file-level variant carries the path, so the caller can log the
/// failure and carry on with the next file or target.
#[derive(Debug, Error)]
pub enum StorageError {
    /// I/O error (disk full, permission denied, ...)
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A day log could not be encoded or decoded
    #[error("malformed day log {path}: {source}")]
    Serialization {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    /// The target name canonicalizes to an empty namespace
    #[error("target name '{0}' has no usable storage namespace")]
    InvalidTarget(String),
}

impl StorageError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StorageError::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn serialization(path: impl Into<PathBuf>, source: serde_json::Error) -> Self {
        StorageError::Serialization {
            path: path.into(),
            source,
        }
    }
}
