//! Error types for the dynamic analysis core
//!
//! Each layer has its own error enum so callers can tell infrastructure
//! failures (sandbox setup, storage) from outcomes that are recorded in the
//! analysis result instead of being raised.

use std::time::Duration;
use thiserror::Error;

/// Errors raised by sandbox backends
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("Sandbox setup failed: {0}")]
    Setup(String),

    #[error("Command timed out after {after:?}")]
    CommandTimeout { after: Duration },

    #[error("Command execution failed: {0}")]
    CommandExecution(String),

    #[error("Command cancelled")]
    Cancelled,

    #[error("Sandbox teardown failed: {0}")]
    Teardown(String),
}

impl SandboxError {
    /// Setup errors abort the whole run; everything else only fails a phase
    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::Setup(_))
    }
}

/// Errors that abort an analysis run before any result exists
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("Sandbox setup failed: {0}")]
    SandboxSetup(#[source] SandboxError),

    #[error("Analysis cancelled before the sandbox was ready")]
    Cancelled,
}

/// Errors raised by result stores
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Unsupported storage scheme '{0}'")]
    UnsupportedScheme(String),

    #[error("Invalid storage location '{0}'")]
    InvalidLocation(String),

    #[error("I/O error writing {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Upload error: {0}")]
    UploadError(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors raised while notifying the control plane
#[derive(Debug, Error)]
pub enum ReportError {
    #[error("Failed to marshal completion payload: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Control plane rejected request with status {status}")]
    Rejected { status: u16 },

    #[error("Control plane returned retryable status {status}")]
    Retryable { status: u16 },

    #[error("Request to control plane failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Failed to notify control plane after {attempts} attempts")]
    Exhausted { attempts: u32 },

    #[error("Completion reporting cancelled")]
    Cancelled,
}

impl ReportError {
    /// Whether another attempt may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, ReportError::Retryable { .. } | ReportError::Transport(_))
    }
}

/// Invalid or missing configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Missing required setting {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_setup_errors_are_fatal() {
        assert!(SandboxError::Setup("no image".into()).is_fatal());
        assert!(!SandboxError::CommandTimeout { after: Duration::from_secs(1) }.is_fatal());
        assert!(!SandboxError::CommandExecution("killed".into()).is_fatal());
        assert!(!SandboxError::Cancelled.is_fatal());
    }

    #[test]
    fn test_report_error_classification() {
        assert!(ReportError::Retryable { status: 503 }.is_retryable());
        assert!(!ReportError::Rejected { status: 400 }.is_retryable());
        assert!(!ReportError::Cancelled.is_retryable());
        assert_eq!(
            ReportError::Exhausted { attempts: 10 }.to_string(),
            "Failed to notify control plane after 10 attempts"
        );
    }
}
