//! Job task context: per-job state and the ways a run can end.

use crate::config::Settings;
use crate::sources::SnapshotContext;
use crate::types::{JobEventKind, JobId, JobState, Priority, ReleaseRequest};
use std::path::PathBuf;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::super::store::{ChainCursor, JobParts};
use super::super::{BookDownloader, QueuedJob};

/// Shared context for a single job run, reducing parameter passing between helpers.
pub(crate) struct JobContext {
    pub(crate) id: JobId,
    pub(crate) priority: Priority,
    pub(crate) request: ReleaseRequest,
    pub(crate) chain: Vec<String>,
    pub(crate) snapshot: SnapshotContext,
    pub(crate) cursor: ChainCursor,
    pub(crate) cancel: CancellationToken,
    pub(crate) temp_path: PathBuf,
    pub(crate) downloader: BookDownloader,
}

impl JobContext {
    pub(crate) fn new(id: JobId, priority: Priority, parts: JobParts, downloader: BookDownloader) -> Self {
        Self {
            id,
            priority,
            request: parts.request,
            chain: parts.chain,
            snapshot: parts.context,
            cursor: parts.cursor,
            cancel: parts.cancel,
            temp_path: downloader.temp_path(id),
            downloader,
        }
    }

    pub(super) fn settings(&self) -> &Settings {
        &self.snapshot.settings
    }

    pub(super) fn transition(&self, next: JobState, event: Option<JobEventKind>) -> bool {
        self.downloader.store.transition(self.id, next, event)
    }

    /// Remove this job from the active jobs map.
    pub(super) async fn remove_from_active(&self) {
        self.downloader
            .queue_state
            .active_jobs
            .lock()
            .await
            .remove(&self.id);
    }

    pub(super) async fn remove_temp_file(&self) {
        match tokio::fs::remove_file(&self.temp_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!(job_id = self.id.0, path = %self.temp_path.display(), error = %e, "failed to remove temporary file")
            }
        }
    }

    /// Remove partial bytes, then mark the job failed and emit the failure event.
    pub(super) async fn mark_failed(&self, reason: &str) {
        self.remove_temp_file().await;
        self.downloader.store.update(self.id, |s| {
            s.last_error = Some(reason.to_string());
        });
        let moved = self.transition(
            JobState::Failed,
            Some(JobEventKind::Failed {
                reason: reason.to_string(),
                cancelled: false,
            }),
        );
        if moved {
            tracing::error!(job_id = self.id.0, reason, "job failed");
        }
        self.remove_from_active().await;
    }

    /// Remove partial bytes, then acknowledge cancellation.
    pub(super) async fn mark_cancelled(&self) {
        self.remove_temp_file().await;
        let moved = self.transition(
            JobState::Cancelled,
            Some(JobEventKind::Failed {
                reason: "cancelled".to_string(),
                cancelled: true,
            }),
        );
        if moved {
            tracing::info!(job_id = self.id.0, "job cancelled");
        }
        self.remove_from_active().await;
    }

    /// Release the worker slot and requeue the job after `delay`.
    ///
    /// The temporary file is kept so the next attempt can resume it.
    pub(super) async fn schedule_retry(self, reason: String, failures: u32, delay: Duration) {
        self.downloader.store.save_cursor(self.id, self.cursor.clone());
        self.downloader.store.update(self.id, |s| {
            s.last_error = Some(reason.clone());
        });

        let moved = self.transition(
            JobState::Retrying,
            Some(JobEventKind::Retrying {
                reason: reason.clone(),
                attempt: failures,
                delay_ms: u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
            }),
        );
        self.remove_from_active().await;
        if !moved {
            return;
        }

        tracing::warn!(
            job_id = self.id.0,
            adapter = self.chain.get(self.cursor.index).map(String::as_str).unwrap_or_default(),
            attempt = failures,
            delay_ms = delay.as_millis() as u64,
            reason = %reason,
            "transient failure, backing off"
        );

        self.downloader.schedule_requeue(
            QueuedJob {
                id: self.id,
                priority: self.priority,
                seq: self.id.0,
            },
            delay,
            self.cancel.clone(),
        );
    }
}
