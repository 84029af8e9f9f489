//! Job control: cancel, status, subscriptions and runtime settings.

use crate::config::Settings;
use crate::error::{Error, JobError, Result};
use crate::sources::SnapshotContext;
use crate::types::{JobEvent, JobEventKind, JobId, JobSnapshot, JobState};
use futures::StreamExt;
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use tokio_stream::wrappers::BroadcastStream;

use super::BookDownloader;

/// Live events for one job, ending after its terminal event
pub type JobEventStream = Pin<Box<dyn futures::Stream<Item = JobEvent> + Send>>;

impl BookDownloader {
    /// Cancel a job
    ///
    /// A queued or backing-off job is cancelled on the spot. A running job is
    /// signalled and this call waits (bounded by `shutdown_timeout`) until the
    /// worker has stopped at its next chunk boundary and removed the partial
    /// file. No progress event is emitted for the job after this returns.
    ///
    /// Cancelling an already cancelled job is a no-op.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] if the job does not exist
    /// - [`JobError::InvalidState`] if the job already completed or failed
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use shelf_dl::*;
    /// # async fn example(downloader: BookDownloader, id: JobId) -> Result<()> {
    /// downloader.cancel(id).await?;
    /// assert_eq!(downloader.status(id)?.state, JobState::Cancelled);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn cancel(&self, id: JobId) -> Result<()> {
        let state = self
            .store
            .state(id)
            .ok_or(Error::Job(JobError::NotFound { id }))?;

        match state {
            JobState::Cancelled => return Ok(()),
            JobState::Completed | JobState::Failed => {
                return Err(Error::Job(JobError::InvalidState {
                    id,
                    operation: "cancel".to_string(),
                    current_state: state.to_string(),
                }));
            }
            _ => {}
        }

        let (Some(token), Some(mut watch)) = (self.store.cancel_token(id), self.store.watch_state(id)) else {
            return Err(Error::Job(JobError::NotFound { id }));
        };
        token.cancel();

        if matches!(state, JobState::Queued | JobState::Retrying) && self.cancel_idle(id).await {
            return Ok(());
        }
        // Running, or a worker picked it up in the meantime: it observes the token

        let timeout = self.config.download.shutdown_timeout;
        match tokio::time::timeout(timeout, watch.wait_for(|s| s.is_terminal())).await {
            Ok(_) => Ok(()),
            Err(_) => {
                tracing::warn!(job_id = id.0, "timed out waiting for job to stop");
                Err(Error::Other(format!(
                    "job {} did not stop within {:?}",
                    id, timeout
                )))
            }
        }
    }

    /// Move a queued or backing-off job straight to `Cancelled`
    ///
    /// The caller cancels the job's token first. A worker that picked the job
    /// up in the meantime does not block this; it stops at its next
    /// checkpoint and its own transitions are refused. Returns false if the
    /// job was already terminal.
    pub(crate) async fn cancel_idle(&self, id: JobId) -> bool {
        self.remove_from_queue(id).await;
        let moved = self.store.transition(
            id,
            JobState::Cancelled,
            Some(JobEventKind::Failed {
                reason: "cancelled".to_string(),
                cancelled: true,
            }),
        );
        if moved {
            // A backing-off job keeps its partial file between attempts
            remove_if_exists(&self.temp_path(id)).await;
            tracing::info!(job_id = id.0, "job cancelled while waiting");
        }
        moved
    }

    /// Current snapshot of a job
    ///
    /// # Errors
    ///
    /// [`JobError::NotFound`] if the job was never submitted or has been evicted.
    pub fn status(&self, id: JobId) -> Result<JobSnapshot> {
        self.store
            .snapshot(id)
            .ok_or(Error::Job(JobError::NotFound { id }))
    }

    /// Snapshots of every job still held, ordered by ID
    pub fn list_jobs(&self) -> Vec<JobSnapshot> {
        self.store.list()
    }

    /// The last `event_history` events of a job, oldest first
    pub fn recent_events(&self, id: JobId) -> Result<Vec<JobEvent>> {
        self.store
            .events(id)
            .ok_or(Error::Job(JobError::NotFound { id }))
    }

    /// Live events for one job
    ///
    /// The stream ends after the job's terminal event. For a job that is
    /// already terminal it yields that terminal event and ends.
    pub fn subscribe_job(&self, id: JobId) -> Result<JobEventStream> {
        // Subscribe before checking state so no event falls in between
        let rx = self.event_tx.subscribe();
        let history = self.recent_events(id)?;

        if let Some(last) = history.last().filter(|e| e.kind.is_terminal()) {
            return Ok(Box::pin(futures::stream::iter([last.clone()])));
        }

        let stream = BroadcastStream::new(rx)
            .filter_map(move |item| {
                futures::future::ready(match item {
                    Ok(event) if event.job_id == id => Some(event),
                    Ok(_) => None,
                    Err(e) => {
                        tracing::warn!(job_id = id.0, error = %e, "job subscriber lagged");
                        None
                    }
                })
            })
            .scan(false, |done, event| {
                if *done {
                    return futures::future::ready(None);
                }
                *done = event.kind.is_terminal();
                futures::future::ready(Some(event))
            });
        Ok(Box::pin(stream))
    }

    /// Replace the settings snapshot used for later admissions
    ///
    /// Jobs already admitted keep the snapshot they were admitted with.
    pub fn update_settings(&self, settings: Settings) -> Result<()> {
        settings.validate()?;
        let snapshot = SnapshotContext::new(Arc::new(settings))?;
        tracing::info!(
            bypass = snapshot.bypasser.name(),
            order = ?snapshot.settings.sources.order,
            "settings updated for new jobs"
        );
        *self
            .current
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner()) = snapshot;
        Ok(())
    }

    /// Grow or shrink the worker pool
    ///
    /// Running jobs are never interrupted; shrinking takes effect as they finish.
    pub fn set_max_concurrent(&self, max: usize) -> Result<()> {
        if max == 0 {
            return Err(Error::Config {
                message: "max_concurrent_jobs must be at least 1".to_string(),
                key: Some("max_concurrent_jobs".to_string()),
            });
        }

        let previous = self.queue_state.pool_size.swap(max, Ordering::SeqCst);
        let semaphore = self.queue_state.concurrent_limit.clone();
        if max > previous {
            semaphore.add_permits(max - previous);
        } else if max < previous {
            let surplus = u32::try_from(previous - max).unwrap_or(u32::MAX);
            // Retire permits as running jobs hand them back
            tokio::spawn(async move {
                if let Ok(permits) = semaphore.acquire_many_owned(surplus).await {
                    permits.forget();
                }
            });
        }
        tracing::info!(previous, max, "worker pool resized");
        Ok(())
    }

    /// Current worker pool size
    pub fn max_concurrent(&self) -> usize {
        self.queue_state.pool_size.load(Ordering::SeqCst)
    }
}

async fn remove_if_exists(path: &std::path::Path) {
    if let Err(e) = tokio::fs::remove_file(path).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), error = %e, "failed to remove temporary file");
    }
}
