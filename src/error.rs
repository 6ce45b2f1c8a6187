//! Error types for attach, restore and retention workflows
//!
//! Variants map onto the failure categories the workflows act on: a missing
//! identity can often be recovered through a fallback lookup, a timeout means
//! the remote operation may still finish, and a partial failure carries
//! per-item outcomes instead of aborting the batch.

use thiserror::Error;

/// Main error type for efs-attach operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// No matching identity, claim, volume, vault or recovery point
    #[error("not found: {what}")]
    NotFound {
        /// Description of what was looked up
        what: String,
    },

    /// An external management command exited non-zero
    #[error("command `{command}` failed (exit {}): {output}", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "signal".to_string()))]
    ExternalCommand {
        /// The command line that was run
        command: String,
        /// Exit code, if the process exited normally
        exit_code: Option<i32>,
        /// Combined stdout and stderr, verbatim
        output: String,
    },

    /// A poll budget was exhausted before the remote operation settled
    #[error("timed out waiting for {operation} after {attempts} attempts")]
    Timeout {
        /// What was being waited on
        operation: String,
        /// Number of polls performed
        attempts: u32,
    },

    /// The caller cancelled the workflow while a wait was in progress
    #[error("cancelled while waiting for {operation}")]
    Cancelled {
        /// What was being waited on
        operation: String,
    },

    /// Malformed input (id, ARN, flags, request)
    #[error("validation error: {0}")]
    Validation(String),

    /// A batch operation finished with mixed per-item outcomes
    #[error("{succeeded}/{total} succeeded: {}", failures.join("; "))]
    PartialFailure {
        /// Items that completed
        succeeded: usize,
        /// Items attempted
        total: usize,
        /// One message per failed item
        failures: Vec<String>,
    },

    /// A backup or restore job could not be submitted
    #[error("job start error: {0}")]
    JobStart(String),

    /// A job reached FAILED or ABORTED
    #[error("job {job_id} ended in {state}: {message}")]
    JobFailed {
        /// Provider job id
        job_id: String,
        /// Terminal state reported by the provider
        state: String,
        /// The job's own status message
        message: String,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// I/O error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Create a not-found error
    pub fn not_found(what: impl Into<String>) -> Self {
        Self::NotFound { what: what.into() }
    }

    /// Create a validation error with the given message
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create a job start error with the given message
    pub fn job_start(msg: impl Into<String>) -> Self {
        Self::JobStart(msg.into())
    }

    /// Create a timeout error
    pub fn timeout(operation: impl Into<String>, attempts: u32) -> Self {
        Self::Timeout {
            operation: operation.into(),
            attempts,
        }
    }

    /// Create a cancellation error
    pub fn cancelled(operation: impl Into<String>) -> Self {
        Self::Cancelled {
            operation: operation.into(),
        }
    }

    /// True when a poll budget ran out (the remote side may still finish)
    pub fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout { .. })
    }

    /// True when the lookup found nothing
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// True when the caller cancelled the wait
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled { .. })
    }

    /// True for outcomes a caller may retry or route around: a lookup that
    /// found nothing (fallbacks exist) or a wait that ran out before the
    /// remote side settled
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::Timeout { .. })
    }

    /// Text a provider or control plane returned with the failure, if any
    pub fn provider_output(&self) -> Option<&str> {
        match self {
            Self::ExternalCommand { output, .. } => Some(output),
            Self::JobFailed { message, .. } => Some(message),
            _ => None,
        }
    }
}
