use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

use crate::run::{JobId, RunId};
use crate::state::RunStatus;

/// Failure of a single raw backend call.
///
/// The split matters: only [`CallError::Connection`] is retried by the
/// transport. Everything the backend actually answered is a
/// [`CallError::Remote`] and belongs to the mitigation layer.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CallError {
    /// The backend could not be reached (refused, DNS, reset before a reply).
    #[error("backend unreachable: {0}")]
    Connection(String),
    /// The backend replied with a non-success status or a provider error.
    #[error("backend returned {status}: {body}")]
    Remote {
        status: u16,
        body: String,
        /// Provider supplied `Retry-After`, if any.
        retry_after: Option<Duration>,
    },
}

impl CallError {
    pub fn remote(status: u16, body: impl Into<String>) -> Self {
        Self::Remote {
            status,
            body: body.into(),
            retry_after: None,
        }
    }
}

/// Error surfaced by the resilient transport after its own retries.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransportError {
    /// Every attempt failed at the connection level.
    #[error("backend unreachable after {attempts} attempts: {last_error}")]
    TransientNetwork { attempts: u32, last_error: String },
    /// Application-level rejection, returned without retrying.
    #[error("remote error {status}: {body}")]
    Remote {
        status: u16,
        body: String,
        retry_after: Option<Duration>,
    },
}

impl TransportError {
    /// Text the mitigation classifier inspects.
    pub fn message(&self) -> &str {
        match self {
            Self::TransientNetwork { last_error, .. } => last_error,
            Self::Remote { body, .. } => body,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::TransientNetwork { .. } => None,
            Self::Remote { status, .. } => Some(*status),
        }
    }
}

/// Caller-facing orchestrator errors. These are never retried.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("job {0} not found")]
    JobNotFound(JobId),
    #[error("job has no runs configured")]
    NoRunsConfigured,
    #[error("run id {0} appears more than once in the job")]
    DuplicateRunId(RunId),
    #[error("invalid job configuration: {0}")]
    InvalidConfig(#[from] ConfigError),
}

/// Rejected run state transition.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TransitionError {
    #[error("illegal run transition {from} -> {to}")]
    Illegal { from: RunStatus, to: RunStatus },
    #[error("mitigation budget of {budget} exhausted")]
    BudgetExhausted { budget: u32 },
}

/// Configuration loading and validation errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid parameter `{field}`: {reason}")]
    InvalidParameter { field: &'static str, reason: String },
    #[error("invalid configuration: {0}")]
    Invalid(String),
    #[error("failed to read config file {path}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config")]
    Parse(#[from] serde_json::Error),
}
