//! Startup, retention sweeping and shutdown coordination.

use crate::error::Result;
use crate::types::JobState;
use std::sync::atomic::Ordering;
use std::time::Duration;

use super::BookDownloader;

/// Longest pause between two retention sweeps
const MAX_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

impl BookDownloader {
    /// Start the queue processor and the retention sweeper
    ///
    /// Jobs can be submitted before this is called; they wait in the queue.
    /// Calling it more than once has no further effect.
    pub fn start(&self) {
        if self.queue_state.started.swap(true, Ordering::SeqCst) {
            return;
        }
        self.start_queue_processor();
        self.start_retention_sweeper();
        tracing::info!("book downloader started");
    }

    /// Periodically evict terminal jobs older than the retention window
    pub(crate) fn start_retention_sweeper(&self) -> tokio::task::JoinHandle<()> {
        let store = self.store.clone();
        let retention = self.config.download.retention;
        let shutdown = self.queue_state.shutdown.clone();
        let period = (retention / 4).clamp(Duration::from_secs(1), MAX_SWEEP_INTERVAL);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {
                        let evicted = store.evict_finished(retention);
                        if evicted > 0 {
                            tracing::debug!(evicted, "evicted finished jobs past retention");
                        }
                    }
                }
            }
        })
    }

    /// Gracefully shut down the downloader
    ///
    /// Shutdown sequence:
    /// 1. Stop accepting new jobs
    /// 2. Cancel every unfinished job; waiting ones are cancelled on the spot,
    ///    running ones stop at their next chunk boundary and remove partial files
    /// 3. Wait for running jobs to finish cleanup, bounded by `shutdown_timeout`
    /// 4. Stop the queue processor, retry timers and the sweeper, and close the pool
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("initiating graceful shutdown");

        self.queue_state.accepting_new.store(false, Ordering::SeqCst);

        for id in self.store.unfinished() {
            if let Some(token) = self.store.cancel_token(id) {
                token.cancel();
            }
            if self
                .store
                .state(id)
                .is_some_and(|s| matches!(s, JobState::Queued | JobState::Retrying))
            {
                self.cancel_idle(id).await;
            }
        }

        let timeout = self.config.download.shutdown_timeout;
        match tokio::time::timeout(timeout, self.wait_for_active_jobs()).await {
            Ok(()) => tracing::info!("all running jobs stopped"),
            Err(_) => tracing::warn!(
                ?timeout,
                "timeout waiting for running jobs to stop, proceeding with shutdown"
            ),
        }

        self.queue_state.shutdown.cancel();
        self.queue_state.concurrent_limit.close();

        tracing::info!("graceful shutdown complete");
        Ok(())
    }

    /// Wait until no job holds a worker slot
    async fn wait_for_active_jobs(&self) {
        loop {
            let active_count = self.queue_state.active_jobs.lock().await.len();
            if active_count == 0 {
                return;
            }
            tracing::debug!(active_count, "waiting for running jobs to stop");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
    }
}
