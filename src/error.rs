//! Error types shared across the collector

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::storage::StorageError;

/// Errors detected while loading or validating the configuration
///
/// All of these are fatal before any probing begins.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("site #{index} is missing required field `{field}`")]
    MissingField { index: usize, field: &'static str },

    #[error("site '{site}' has an invalid url '{url}': {reason}")]
    InvalidUrl {
        site: String,
        url: String,
        reason: String,
    },

    #[error("site name '{0}' is configured more than once")]
    DuplicateName(String),

    #[error("no sites configured")]
    NoTargets,
}

/// Errors of the run-scoped exclusivity lock
#[derive(Debug, Error)]
pub enum LockError {
    #[error("lock is held by pid {pid} (age {age:?})")]
    Held { pid: u32, age: Duration },

    #[error("lock file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Errors that end a run early
#[derive(Debug, Error)]
pub enum RunError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Lock(#[from] LockError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl RunError {
    /// Process exit code the CLI reports for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            RunError::Lock(LockError::Held { .. }) => 2,
            _ => 1,
        }
    }
}
