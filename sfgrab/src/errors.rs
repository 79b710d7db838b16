//! Error types for the sfgrab pipeline.
//!
//! Errors fall into four groups:
//!
//! - environment errors abort the whole run (misconfigured network, a tool
//!   built without compression support);
//! - item errors abort only the current item (bad identifier, filesystem);
//! - process errors are retried inside the external process stage and become
//!   item errors once attempts are exhausted;
//! - coordinator errors are retried with backoff and become item errors once
//!   attempts are exhausted.

use std::path::PathBuf;
use thiserror::Error;

/// The main error type for pipeline operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The worker's environment is unusable; no further items should run.
    #[error("Environment error: {0}")]
    Environment(String),

    /// The item identifier is malformed.
    #[error("Invalid item '{item}': {reason}")]
    InvalidItem {
        /// The raw identifier.
        item: String,
        /// Why it was rejected.
        reason: String,
    },

    /// The item type tag is not one this pipeline can process.
    #[error("Unsupported item type '{item_type}' for item '{item}'")]
    UnsupportedItemType {
        /// The raw identifier.
        item: String,
        /// The offending type tag.
        item_type: String,
    },

    /// A required key is absent from the item context.
    #[error(transparent)]
    MissingKey(#[from] MissingKeyError),

    /// A write-once key was written twice.
    #[error(transparent)]
    Conflict(#[from] DataConflictError),

    /// An expected artifact was not produced.
    #[error("Missing artifact: {}", path.display())]
    MissingArtifact {
        /// The path that was expected to exist.
        path: PathBuf,
    },

    /// An external process exited with a code outside its accepted set.
    #[error("Process '{name}' failed after {attempts} attempt(s): {reason}")]
    Process {
        /// The stage name.
        name: String,
        /// The last observed exit code, if the process ran.
        exit_code: Option<i32>,
        /// Attempts performed.
        attempts: usize,
        /// Human-readable reason.
        reason: String,
    },

    /// The coordinator could not be reached or rejected a request.
    #[error("Coordinator error: {0}")]
    Coordinator(String),

    /// A configuration value is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Creates an invalid item error.
    #[must_use]
    pub fn invalid_item(item: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidItem {
            item: item.into(),
            reason: reason.into(),
        }
    }

    /// Returns true if the error means the whole run must stop.
    #[must_use]
    pub const fn is_fatal_for_run(&self) -> bool {
        matches!(self, Self::Environment(_))
    }

    /// Returns true if retrying the failed operation could help.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Process { .. } | Self::Coordinator(_))
    }

    /// Returns a short machine-friendly kind used in events and failure reports.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Environment(_) => "environment",
            Self::InvalidItem { .. } => "invalid_item",
            Self::UnsupportedItemType { .. } => "unsupported_item_type",
            Self::MissingKey(_) => "missing_key",
            Self::Conflict(_) => "conflict",
            Self::MissingArtifact { .. } => "missing_artifact",
            Self::Process { .. } => "process",
            Self::Coordinator(_) => "coordinator",
            Self::Config(_) => "config",
            Self::Serialization(_) => "serialization",
            Self::Io(_) => "io",
        }
    }
}

impl From<reqwest::Error> for PipelineError {
    fn from(err: reqwest::Error) -> Self {
        Self::Coordinator(err.to_string())
    }
}

/// Error raised when a template or stage reads a key the item does not have.
#[derive(Debug, Clone, Error)]
#[error("Item '{item}' has no value for key '{key}'")]
pub struct MissingKeyError {
    /// The item name.
    pub item: String,
    /// The missing key.
    pub key: String,
}

impl MissingKeyError {
    /// Creates a new missing key error.
    #[must_use]
    pub fn new(item: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            item: item.into(),
            key: key.into(),
        }
    }
}

/// Error raised when writing to an existing write-once key.
#[derive(Debug, Clone, Error)]
#[error("Data conflict: key '{key}' already exists")]
pub struct DataConflictError {
    /// The conflicting key.
    pub key: String,
}

impl DataConflictError {
    /// Creates a new data conflict error.
    #[must_use]
    pub fn new(key: impl Into<String>) -> Self {
        Self { key: key.into() }
    }
}

/// Errors raised while validating configuration.
#[derive(Debug, Clone, Error)]
pub enum ConfigError {
    /// A bounded number was set outside its range.
    #[error("{name} must be between {min} and {max}, got {value}")]
    OutOfRange {
        /// The setting name.
        name: String,
        /// The rejected value.
        value: i64,
        /// Lower bound (inclusive).
        min: i64,
        /// Upper bound (inclusive).
        max: i64,
    },

    /// A required setting is empty.
    #[error("{0} must not be empty")]
    Empty(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_is_fatal_for_run() {
        let err = PipelineError::Environment("proxy".into());
        assert!(err.is_fatal_for_run());
        assert!(!err.is_retryable());
        assert_eq!(err.kind(), "environment");
    }

    #[test]
    fn test_process_is_retryable() {
        let err = PipelineError::Process {
            name: "wget".into(),
            exit_code: Some(3),
            attempts: 2,
            reason: "exit code 3".into(),
        };
        assert!(err.is_retryable());
        assert!(!err.is_fatal_for_run());
        assert!(err.to_string().contains("2 attempt(s)"));
    }

    #[test]
    fn test_item_errors_are_local() {
        let err = PipelineError::invalid_item("foo", "no type tag");
        assert!(!err.is_fatal_for_run());
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "Invalid item 'foo': no type tag");
    }

    #[test]
    fn test_config_error_message() {
        let err = ConfigError::OutOfRange {
            name: "rsync_threads".into(),
            value: 9,
            min: 1,
            max: 4,
        };
        assert_eq!(err.to_string(), "rsync_threads must be between 1 and 4, got 9");
    }
}
