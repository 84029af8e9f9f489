//! Core types for shelf-dl

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use url::Url;

/// Unique identifier for a job
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub u64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    /// Get the inner u64 value
    pub fn get(&self) -> u64 {
        self.0
    }
}

impl From<u64> for JobId {
    fn from(id: u64) -> Self {
        Self(id)
    }
}

impl From<JobId> for u64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

/// Job lifecycle state
///
/// ```text
/// Queued -> Resolving -> Downloading -> Verifying -> Completed
///              ^   |          |
///              |   v          v
///              Retrying <-----+            (any non-terminal) -> Failed | Cancelled
/// ```
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobState {
    /// Admitted and waiting for a worker slot
    Queued,
    /// Asking adapters for a fetchable candidate
    Resolving,
    /// Transferring bytes into the temporary file
    Downloading,
    /// Checking size and checksum before promotion
    Verifying,
    /// Backing off before another resolution attempt
    Retrying,
    /// Promoted into the ingest directory
    Completed,
    /// Retry budget exhausted on every adapter, or verification failed
    Failed,
    /// Cancelled by the user
    Cancelled,
}

impl JobState {
    /// Whether this state is final
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobState::Completed | JobState::Failed | JobState::Cancelled
        )
    }

    /// Whether a worker is actively busy with the job in this state
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            JobState::Resolving | JobState::Downloading | JobState::Verifying
        )
    }

    /// Whether the state machine permits moving from `self` to `next`
    pub fn can_transition_to(&self, next: JobState) -> bool {
        use JobState::*;
        if self.is_terminal() {
            return false;
        }
        match (self, next) {
            (_, Cancelled) => true,
            (Queued, Resolving) => true,
            (Resolving, Downloading | Retrying | Failed) => true,
            // Switching source after a permanent failure goes straight back to resolving
            (Downloading, Verifying | Retrying | Resolving | Failed) => true,
            (Verifying, Completed | Failed) => true,
            (Retrying, Resolving | Failed) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            JobState::Queued => "queued",
            JobState::Resolving => "resolving",
            JobState::Downloading => "downloading",
            JobState::Verifying => "verifying",
            JobState::Retrying => "retrying",
            JobState::Completed => "completed",
            JobState::Failed => "failed",
            JobState::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

/// Job priority
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Low priority
    Low = -1,
    /// Normal priority (FIFO among equals)
    #[default]
    Normal = 0,
    /// High priority
    High = 1,
    /// Jump ahead of everything else
    Force = 2,
}

/// A request to obtain one release. Immutable once submitted.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReleaseRequest {
    /// Book title
    #[serde(default)]
    pub title: String,

    /// Author, if known
    #[serde(default)]
    pub author: Option<String>,

    /// External identifier (e.g. an MD5 or catalogue ID)
    #[serde(default)]
    pub external_id: Option<String>,

    /// Publication year, if known
    #[serde(default)]
    pub year: Option<String>,

    /// Accepted formats (lowercase extensions such as "epub"); empty means use the settings default
    #[serde(default)]
    pub formats: Vec<String>,

    /// Preferred languages; empty means use the settings default
    #[serde(default)]
    pub languages: Vec<String>,

    /// Source ordering override (adapter names); empty means use the settings order
    #[serde(default)]
    pub source_priority: Vec<String>,

    /// Per-adapter hints, e.g. direct download URLs for the `direct` adapter
    #[serde(default)]
    pub source_hints: HashMap<String, Vec<String>>,

    /// Queue priority override
    #[serde(default)]
    pub priority: Priority,

    /// Subpath under the ingest directory, chosen by the caller's routing policy
    #[serde(default)]
    pub destination_subpath: Option<PathBuf>,
}

impl ReleaseRequest {
    /// Convenience constructor for a title-only request
    pub fn new(title: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            ..Default::default()
        }
    }

    /// Whether the request names anything at all
    pub fn has_identity(&self) -> bool {
        !self.title.trim().is_empty()
            || self
                .external_id
                .as_deref()
                .is_some_and(|id| !id.trim().is_empty())
    }

    /// Short human-readable label for logs and events
    pub fn label(&self) -> String {
        match (&self.author, self.title.trim().is_empty()) {
            (Some(author), false) => format!("{} - {}", author, self.title),
            (None, false) => self.title.clone(),
            _ => self.external_id.clone().unwrap_or_default(),
        }
    }

    /// Search query built from title and author
    pub fn query(&self) -> String {
        match &self.author {
            Some(author) if !author.trim().is_empty() => {
                format!("{} {}", self.title.trim(), author.trim())
            }
            _ => self.title.trim().to_string(),
        }
    }
}

/// Checksum advertised by a source
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "algorithm", content = "hex", rename_all = "lowercase")]
pub enum Checksum {
    /// MD5 digest (hex)
    Md5(String),
    /// SHA-256 digest (hex)
    Sha256(String),
}

/// A resolved, fetchable target. Produced per resolution attempt and never persisted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CandidateDownload {
    /// Primary download URL
    pub url: Url,
    /// Equivalent mirror URLs tried in order on connection-level failure
    pub mirrors: Vec<Url>,
    /// Expected size in bytes, if the source advertises it
    pub expected_size: Option<u64>,
    /// Extra request headers the host requires
    pub headers: Vec<(String, String)>,
    /// Advertised checksum
    pub checksum: Option<Checksum>,
    /// Suggested filename
    pub filename: Option<String>,
    /// Format (lowercase extension), if known
    pub format: Option<String>,
    /// Language code, if the source reports one
    pub language: Option<String>,
}

impl CandidateDownload {
    /// Candidate for a single URL with nothing else known
    pub fn new(url: Url) -> Self {
        Self {
            url,
            mirrors: Vec::new(),
            expected_size: None,
            headers: Vec::new(),
            checksum: None,
            filename: None,
            format: None,
            language: None,
        }
    }

    /// Primary URL followed by mirrors
    pub fn urls(&self) -> impl Iterator<Item = &Url> {
        std::iter::once(&self.url).chain(self.mirrors.iter())
    }

    /// Identity used to decide whether a partial temp file belongs to this candidate
    pub fn resume_key(&self) -> String {
        self.url.as_str().to_string()
    }
}

/// Snapshot of a job as observed through [`status`](crate::BookDownloader::status)
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JobSnapshot {
    /// Job ID
    pub id: JobId,
    /// The request this job owns
    pub request: ReleaseRequest,
    /// Current state
    pub state: JobState,
    /// Resolution attempts made so far, across all adapters
    pub attempt: u32,
    /// Adapter chain chosen at admission, in order
    pub chain: Vec<String>,
    /// Adapter currently (or last) in use
    pub current_adapter: Option<String>,
    /// Bytes present in the temporary file
    pub bytes_transferred: u64,
    /// Total bytes, if known
    pub bytes_total: Option<u64>,
    /// Last recorded failure reason
    pub last_error: Option<String>,
    /// Admission time
    pub created_at: DateTime<Utc>,
    /// Last state or progress change
    pub updated_at: DateTime<Utc>,
    /// Final path once promoted
    pub destination: Option<PathBuf>,
}

/// Immutable, timestamped progress record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// Job the event belongs to
    pub job_id: JobId,
    /// When the event was generated
    pub at: DateTime<Utc>,
    /// What happened
    #[serde(flatten)]
    pub kind: JobEventKind,
}

/// Event payloads
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    /// Job admitted
    Queued,
    /// Resolution started against an adapter
    Resolving {
        /// Adapter name
        adapter: String,
    },
    /// Bytes are flowing
    Downloading {
        /// Bytes in the temporary file so far
        bytes_so_far: u64,
        /// Total bytes, if known
        #[serde(skip_serializing_if = "Option::is_none")]
        total: Option<u64>,
    },
    /// Backing off before another attempt
    Retrying {
        /// Why the previous attempt failed
        reason: String,
        /// Attempt number that just failed
        attempt: u32,
        /// Backoff before the next attempt, in milliseconds
        delay_ms: u64,
    },
    /// Checking size and checksum
    Verifying,
    /// Promoted into the ingest directory
    Completed {
        /// Final path
        path: PathBuf,
    },
    /// Terminal failure; `cancelled` distinguishes user cancellation
    Failed {
        /// Human-readable reason
        reason: String,
        /// True when the job ended because of a cancel request
        cancelled: bool,
    },
}

impl JobEventKind {
    /// Whether this event ends the job's event stream
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobEventKind::Completed { .. } | JobEventKind::Failed { .. }
        )
    }
}
