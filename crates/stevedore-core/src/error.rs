//! Error taxonomy shared by every stevedore component.
//!
//! Failures are binary at the run level: anything that is not explicitly
//! recovered (an "already exists" resource, a skipped coordination attempt)
//! propagates up to the orchestrator and the process exits non-zero.

use std::path::PathBuf;
use thiserror::Error;

/// Convenience alias used across the workspace.
pub type StevedoreResult<T> = Result<T, StevedoreError>;

#[derive(Debug, Error)]
pub enum StevedoreError {
    /// A required configuration key is absent and no default is registered.
    #[error("required configuration key '{0}' is absent and has no registered default")]
    MissingKey(String),

    /// A target config file that must pre-exist does not.
    #[error("config file {} is not present", .0.display())]
    ConfigFileMissing(PathBuf),

    /// A transform's own domain validation rejected the resolved value.
    #[error("transform failed: {0}")]
    Transform(String),

    /// A driven external process returned a non-zero exit code.
    #[error("external process failed: {0}")]
    ExternalProcess(String),

    /// Communication with the shared coordination store failed. The caller
    /// aborts the coordination attempt rather than retrying forever.
    #[error("coordination store unavailable: {0}")]
    CoordinationIo(String),

    /// Backend parse or write failure in a configuration store.
    #[error("config store error: {0}")]
    Store(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl From<serde_yaml::Error> for StevedoreError {
    fn from(err: serde_yaml::Error) -> Self {
        StevedoreError::Store(err.to_string())
    }
}
