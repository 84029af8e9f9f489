//! Error types for shelf-dl
//!
//! This module provides the error taxonomy shared by every layer:
//! - [`Error`] for everything surfaced through the public API
//! - [`FetchError`] with a normalized [`FailureKind`] classification, produced by the
//!   network layer and branched on by the resolver and the orchestrator
//! - [`BypassError`] for challenge-solving failures (cloneable, so a coalesced
//!   acquisition can hand the same outcome to every waiter)
//! - [`ResolutionFailure`] summarizing every adapter a job tried

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

use crate::types::JobId;

/// Result type alias for shelf-dl operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for shelf-dl
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "ingest_dir")
        key: Option<String>,
    },

    /// Request rejected at submission; it never entered the queue
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Job lookup or lifecycle error
    #[error("job error: {0}")]
    Job(#[from] JobError),

    /// Classified fetch failure
    #[error("fetch error: {0}")]
    Fetch(#[from] FetchError),

    /// Bot-protection bypass failed
    #[error("bypass error: {0}")]
    Bypass(#[from] BypassError),

    /// Every adapter in the chain was exhausted
    #[error("{0}")]
    Resolution(#[from] ResolutionFailure),

    /// Downloaded file failed size or checksum verification
    #[error("verification failed for {path}: {reason}")]
    Verification {
        /// The temporary file that failed verification
        path: PathBuf,
        /// Why the file was rejected
        reason: String,
    },

    /// Final file could not be placed in the ingest directory
    #[error("file collision at {path}: {reason}")]
    FileCollision {
        /// The destination that collided
        path: PathBuf,
        /// Why the collision could not be resolved
        reason: String,
    },

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// URL parse error
    #[error("invalid URL: {0}")]
    Url(#[from] url::ParseError),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Other error
    #[error("{0}")]
    Other(String),
}

/// Job lookup and lifecycle errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found (never submitted, or evicted after its retention window)
    #[error("job {id} not found")]
    NotFound {
        /// The job ID that was not found
        id: JobId,
    },

    /// Cannot perform operation in current state
    #[error("cannot {operation} job {id} in state {current_state}")]
    InvalidState {
        /// The job ID
        id: JobId,
        /// The operation that was attempted (e.g., "cancel")
        operation: String,
        /// The current state that prevents the operation
        current_state: String,
    },
}

/// Normalized failure classification reported by the network layer
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Timeout, connection reset, 5xx, rate limiting: back off and retry the same adapter
    Transient,
    /// Not found or explicit denial: no retry on this adapter, fall through the chain
    Permanent,
    /// A bot-protection challenge was served: obtain a session before retrying
    BypassRequired,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::Transient => write!(f, "transient"),
            FailureKind::Permanent => write!(f, "permanent"),
            FailureKind::BypassRequired => write!(f, "bypass required"),
        }
    }
}

/// A classified failure from a single fetch or resolution step
#[derive(Clone, Debug, Error)]
pub enum FetchError {
    /// Failure with a classification the layers above branch on
    #[error("{kind}: {message}")]
    Classified {
        /// Normalized classification
        kind: FailureKind,
        /// Human-readable reason
        message: String,
    },

    /// The job's cancellation flag was observed at a checkpoint
    #[error("cancelled")]
    Cancelled,

    /// Local filesystem failure while writing the temporary file
    #[error("local I/O error: {0}")]
    Local(String),
}

impl FetchError {
    /// Build a transient failure
    pub fn transient(message: impl Into<String>) -> Self {
        FetchError::Classified {
            kind: FailureKind::Transient,
            message: message.into(),
        }
    }

    /// Build a permanent failure
    pub fn permanent(message: impl Into<String>) -> Self {
        FetchError::Classified {
            kind: FailureKind::Permanent,
            message: message.into(),
        }
    }

    /// Build a bypass-required failure
    pub fn bypass_required(message: impl Into<String>) -> Self {
        FetchError::Classified {
            kind: FailureKind::BypassRequired,
            message: message.into(),
        }
    }

    /// Classification of this failure, `None` for cancellation and local errors
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            FetchError::Classified { kind, .. } => Some(*kind),
            FetchError::Cancelled | FetchError::Local(_) => None,
        }
    }
}

impl From<std::io::Error> for FetchError {
    fn from(e: std::io::Error) -> Self {
        FetchError::Local(e.to_string())
    }
}

/// Bot-protection bypass failures
#[derive(Clone, Debug, Error)]
pub enum BypassError {
    /// Bypass is disabled in the settings snapshot
    #[error("bypass is disabled")]
    Disabled,

    /// The solver service or browser could not be reached
    #[error("bypass backend unreachable: {0}")]
    Unreachable(String),

    /// The challenge was not solved
    #[error("challenge not solved: {0}")]
    Failed(String),

    /// The acquisition exceeded the configured bypass timeout
    #[error("bypass timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// Repeated failures for this host; reported as permanent for the adapter
    #[error("bypass exhausted for {host} after {attempts} attempts: {last}")]
    Exhausted {
        /// Host the challenge belongs to
        host: String,
        /// Number of acquisition attempts made
        attempts: u32,
        /// Last failure reason
        last: String,
    },
}

impl From<BypassError> for FetchError {
    fn from(e: BypassError) -> Self {
        FetchError::permanent(e.to_string())
    }
}

/// Outcome of a single adapter within a job's chain
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AdapterAttempt {
    /// Adapter name
    pub adapter: String,
    /// Why the chain moved past this adapter
    pub reason: String,
}

/// Every adapter in the chain was tried and none delivered the release
#[derive(Clone, Debug, Error, PartialEq, Eq)]
#[error("all sources exhausted ({}): {last_reason}", summarize(.tried))]
pub struct ResolutionFailure {
    /// Adapters tried, in chain order
    pub tried: Vec<AdapterAttempt>,
    /// Reason reported by the last adapter
    pub last_reason: String,
}

fn summarize(tried: &[AdapterAttempt]) -> String {
    if tried.is_empty() {
        return "no sources tried".to_string();
    }
    tried
        .iter()
        .map(|a| a.adapter.as_str())
        .collect::<Vec<_>>()
        .join(", ")
}
