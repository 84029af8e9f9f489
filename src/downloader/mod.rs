//! Core downloader implementation split into focused submodules.
//!
//! The `BookDownloader` struct and its methods are organized by domain:
//! - [`store`] - Job table, state machine enforcement and event history
//! - [`queue`] - Admission and the priority queue
//! - [`control`] - Cancel, status, subscriptions and runtime settings
//! - [`lifecycle`] - Startup, retention sweeping and shutdown coordination
//! - [`queue_processor`] - Worker pool feeding jobs to the job task
//! - [`job_task`] - Chain walking, retry decisions, verification and promotion

mod control;
mod job_task;
mod lifecycle;
mod queue;
mod queue_processor;
mod store;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

pub use control::JobEventStream;

use crate::bypass::SessionCache;
use crate::config::{Config, Settings};
use crate::error::{Error, Result};
use crate::sources::{AdapterRegistry, SnapshotContext, SourceChainResolver};
use crate::types::{JobEvent, JobId, Priority};
use std::path::PathBuf;
use std::sync::Arc;
use store::JobStore;

/// Queue and worker pool state
#[derive(Clone)]
pub(crate) struct QueueState {
    /// Priority queue of jobs waiting for a worker slot
    pub(crate) queue: Arc<tokio::sync::Mutex<std::collections::BinaryHeap<QueuedJob>>>,
    /// Wakes the queue processor when something is queued
    pub(crate) wakeup: Arc<tokio::sync::Notify>,
    /// Worker pool (one permit per running job)
    pub(crate) concurrent_limit: Arc<tokio::sync::Semaphore>,
    /// Current pool size, tracked separately from available permits
    pub(crate) pool_size: Arc<std::sync::atomic::AtomicUsize>,
    /// Running jobs and their cancellation tokens
    pub(crate) active_jobs: Arc<
        tokio::sync::Mutex<
            std::collections::HashMap<JobId, tokio_util::sync::CancellationToken>,
        >,
    >,
    /// Cleared during shutdown
    pub(crate) accepting_new: Arc<std::sync::atomic::AtomicBool>,
    /// Set once the background tasks are running
    pub(crate) started: Arc<std::sync::atomic::AtomicBool>,
    /// Stops the queue processor, retry timers and the retention sweeper
    pub(crate) shutdown: tokio_util::sync::CancellationToken,
}

/// Main downloader instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct BookDownloader {
    /// Process-level configuration
    pub(crate) config: Arc<Config>,
    /// Snapshot handed to newly admitted jobs
    pub(crate) current: Arc<std::sync::RwLock<SnapshotContext>>,
    /// Adapter chain resolver (registry + bypass session cache)
    pub(crate) resolver: Arc<SourceChainResolver>,
    /// Job table and event history
    pub(crate) store: Arc<JobStore>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<JobEvent>,
    /// Queue and worker pool state
    pub(crate) queue_state: QueueState,
    /// Serializes collision checks and renames into the ingest directory
    pub(crate) promotion_lock: Arc<tokio::sync::Mutex<()>>,
    /// Next job ID, doubling as the FIFO sequence number
    pub(crate) next_id: Arc<std::sync::atomic::AtomicU64>,
}

impl std::fmt::Debug for BookDownloader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BookDownloader")
            .field("ingest_dir", &self.config.download.ingest_dir)
            .field("adapters", self.resolver.registry())
            .field("jobs", &self.store.len())
            .finish()
    }
}

/// Internal struct representing a job in the priority queue
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct QueuedJob {
    pub(crate) id: JobId,
    pub(crate) priority: Priority,
    /// Admission order for FIFO tie-breaking
    pub(crate) seq: u64,
}

// Implement Ord for BinaryHeap (max-heap by default)
impl Ord for QueuedJob {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        match self.priority.cmp(&other.priority) {
            // Reversed: earlier admissions win among equals
            std::cmp::Ordering::Equal => other.seq.cmp(&self.seq),
            ordering => ordering,
        }
    }
}

impl PartialOrd for QueuedJob {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl BookDownloader {
    /// Create a downloader with the adapters described by `config.settings.sources`
    ///
    /// Validates the configuration and creates the ingest and temporary
    /// directories. Call [`start`](Self::start) to begin processing.
    pub async fn new(config: Config) -> Result<Self> {
        let registry = AdapterRegistry::from_config(&config.settings.sources)?;
        Self::with_registry(config, registry).await
    }

    /// Create a downloader over a caller-built adapter registry
    pub async fn with_registry(config: Config, registry: AdapterRegistry) -> Result<Self> {
        config.validate()?;

        for dir in [config.ingest_dir().clone(), config.temp_dir()] {
            tokio::fs::create_dir_all(&dir).await.map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!("Failed to create directory '{}': {}", dir.display(), e),
                ))
            })?;
        }

        let snapshot = SnapshotContext::new(Arc::new(config.settings.clone()))?;
        let (event_tx, _rx) = tokio::sync::broadcast::channel(config.download.event_buffer.max(1));
        let store = Arc::new(JobStore::new(event_tx.clone(), config.download.event_history));
        let resolver = Arc::new(SourceChainResolver::new(
            Arc::new(registry),
            Arc::new(SessionCache::new()),
        ));

        let pool_size = config.download.max_concurrent_jobs;
        let queue_state = QueueState {
            queue: Arc::new(tokio::sync::Mutex::new(std::collections::BinaryHeap::new())),
            wakeup: Arc::new(tokio::sync::Notify::new()),
            concurrent_limit: Arc::new(tokio::sync::Semaphore::new(pool_size)),
            pool_size: Arc::new(std::sync::atomic::AtomicUsize::new(pool_size)),
            active_jobs: Arc::new(tokio::sync::Mutex::new(std::collections::HashMap::new())),
            accepting_new: Arc::new(std::sync::atomic::AtomicBool::new(true)),
            started: Arc::new(std::sync::atomic::AtomicBool::new(false)),
            shutdown: tokio_util::sync::CancellationToken::new(),
        };

        tracing::info!(
            ingest_dir = %config.ingest_dir().display(),
            adapters = ?resolver.registry().names().collect::<Vec<_>>(),
            bypass = snapshot.bypasser.name(),
            max_concurrent = pool_size,
            "book downloader initialized"
        );

        Ok(Self {
            config: Arc::new(config),
            current: Arc::new(std::sync::RwLock::new(snapshot)),
            resolver,
            store,
            event_tx,
            queue_state,
            promotion_lock: Arc::new(tokio::sync::Mutex::new(())),
            next_id: Arc::new(std::sync::atomic::AtomicU64::new(1)),
        })
    }

    /// Subscribe to events for all jobs
    ///
    /// Each subscriber receives every event independently. A subscriber that
    /// falls more than `event_buffer` events behind gets `RecvError::Lagged`.
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<JobEvent> {
        self.event_tx.subscribe()
    }

    /// The process-level configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The settings snapshot newly admitted jobs receive
    pub fn current_settings(&self) -> Arc<Settings> {
        self.current_snapshot().settings
    }

    pub(crate) fn current_snapshot(&self) -> SnapshotContext {
        self.current
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    /// Temporary file holding a job's in-progress bytes
    pub(crate) fn temp_path(&self, id: JobId) -> PathBuf {
        self.config.temp_dir().join(format!("{}.part", id.0))
    }
}
