//! Queue processor: feeds queued jobs to the worker pool.

use std::time::Duration;

use super::job_task::{JobContext, run_job_task};
use super::{BookDownloader, QueuedJob};

impl BookDownloader {
    /// Start the queue processor task
    ///
    /// The processor loops until shutdown:
    /// 1. Waits for a free worker slot (one semaphore permit per running job)
    /// 2. Pops the highest-priority job, sleeping on the wakeup signal while the
    ///    queue is empty
    /// 3. Spawns the job task, which holds the permit until it finishes or
    ///    hands the job back to the queue for a retry
    ///
    /// Taking the permit before popping means priority is decided at the moment
    /// a slot frees, not when the previous job was popped.
    pub(crate) fn start_queue_processor(&self) -> tokio::task::JoinHandle<()> {
        let downloader = self.clone();
        let shutdown = self.queue_state.shutdown.clone();

        tokio::spawn(async move {
            loop {
                let permit = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    permit = downloader.queue_state.concurrent_limit.clone().acquire_owned() => {
                        match permit {
                            Ok(p) => p,
                            // Semaphore closed during shutdown
                            Err(_) => break,
                        }
                    }
                };

                let Some(item) = downloader.next_queued(&shutdown).await else {
                    break;
                };

                downloader.spawn_job(item, permit).await;
            }
            tracing::debug!("queue processor stopped");
        })
    }

    /// Pop the next job, waiting for one to be queued
    async fn next_queued(&self, shutdown: &tokio_util::sync::CancellationToken) -> Option<QueuedJob> {
        loop {
            let notified = self.queue_state.wakeup.notified();
            if let Some(item) = self.queue_state.queue.lock().await.pop() {
                return Some(item);
            }
            tokio::select! {
                _ = shutdown.cancelled() => return None,
                _ = notified => {}
            }
        }
    }

    async fn spawn_job(&self, item: QueuedJob, permit: tokio::sync::OwnedSemaphorePermit) {
        let id = item.id;
        // Cancelled while queued: nothing to run
        let Some(parts) = self.store.parts(id) else {
            tracing::debug!(job_id = id.0, "skipping job that is no longer runnable");
            return;
        };

        self.queue_state
            .active_jobs
            .lock()
            .await
            .insert(id, parts.cancel.clone());

        let ctx = JobContext::new(id, item.priority, parts, self.clone());
        tokio::spawn(async move {
            let _permit = permit;
            run_job_task(ctx).await;
        });
    }

    /// Put a job back in the queue after its backoff, unless it is cancelled first
    pub(crate) fn schedule_requeue(&self, item: QueuedJob, delay: Duration, cancel: tokio_util::sync::CancellationToken) {
        let downloader = self.clone();
        let shutdown = self.queue_state.shutdown.clone();
        tokio::spawn(async move {
            tokio::select! {
                _ = cancel.cancelled() => {
                    downloader.cancel_idle(item.id).await;
                }
                _ = shutdown.cancelled() => {}
                _ = tokio::time::sleep(delay) => {
                    tracing::debug!(job_id = item.id.0, "backoff elapsed, requeueing");
                    downloader.add_to_queue(item).await;
                }
            }
        });
    }
}
