//! Job task orchestration: walk the adapter chain until bytes land or it runs out.

use std::time::{Duration, Instant};

use crate::error::{FailureKind, FetchError, ResolutionFailure};
use crate::retry::backoff_delay;
use crate::sources::{AttemptEvent, AttemptOutcome, AttemptTarget};
use crate::types::{JobEventKind, JobState};

use super::context::JobContext;
use super::finalization::finalize_job;

/// Minimum spacing between two `downloading` progress events for one job
const PROGRESS_INTERVAL: Duration = Duration::from_millis(250);

/// Core job task -- drives one run of a job.
///
/// Each iteration asks the current adapter for the release:
/// - delivered bytes go to verification and promotion
/// - `Unavailable`, permanent failures and exhausted bypasses move to the next
///   adapter immediately, without backoff
/// - transient failures back off on the same adapter (releasing the worker
///   slot) until its retry budget is spent, then move on
///
/// The run ends in `Completed`, `Failed`, `Cancelled`, or `Retrying` (handed
/// back to the queue).
pub(crate) async fn run_job_task(mut ctx: JobContext) {
    let id = ctx.id;

    loop {
        if ctx.cancel.is_cancelled() {
            ctx.mark_cancelled().await;
            return;
        }

        let Some(adapter) = ctx.chain.get(ctx.cursor.index).cloned() else {
            let failure = ResolutionFailure {
                last_reason: ctx
                    .cursor
                    .tried
                    .last()
                    .map(|a| a.reason.clone())
                    .unwrap_or_else(|| "no sources available".to_string()),
                tried: ctx.cursor.tried.clone(),
            };
            ctx.mark_failed(&failure.to_string()).await;
            return;
        };

        if !ctx.transition(
            JobState::Resolving,
            Some(JobEventKind::Resolving {
                adapter: adapter.clone(),
            }),
        ) {
            // Cancelled between dequeue and start; the cancel path cleaned up
            ctx.remove_from_active().await;
            return;
        }
        ctx.downloader.store.update(id, |s| {
            s.current_adapter = Some(adapter.clone());
            s.attempt += 1;
        });
        tracing::info!(job_id = id.0, adapter = %adapter, "resolving");

        if let Some(dir) = ctx.temp_path.parent()
            && let Err(e) = tokio::fs::create_dir_all(dir).await
        {
            ctx.mark_failed(&format!("failed to create temporary directory: {}", e))
                .await;
            return;
        }

        let failure = match attempt(&mut ctx, &adapter).await {
            AttemptOutcome::Delivered(delivery) => {
                finalize_job(ctx, *delivery).await;
                return;
            }
            AttemptOutcome::Unavailable(reason) => {
                tracing::info!(job_id = id.0, adapter = %adapter, %reason, "source unavailable, trying next");
                ctx.cursor.advance(&adapter, reason);
                continue;
            }
            AttemptOutcome::Failed(e) => e,
        };

        match failure {
            FetchError::Cancelled => {
                ctx.mark_cancelled().await;
                return;
            }
            FetchError::Local(message) => {
                ctx.mark_failed(&format!("local I/O error: {}", message)).await;
                return;
            }
            FetchError::Classified {
                kind: FailureKind::Transient,
                message,
            } => {
                ctx.cursor.failures_on_adapter += 1;
                let failures = ctx.cursor.failures_on_adapter;
                let retry = ctx.settings().retry.clone();

                if failures <= retry.max_attempts {
                    let delay = backoff_delay(&retry, failures - 1);
                    ctx.schedule_retry(message, failures, delay).await;
                    return;
                }

                tracing::warn!(
                    job_id = id.0,
                    adapter = %adapter,
                    failures,
                    "retry budget exhausted, switching source"
                );
                ctx.cursor
                    .advance(&adapter, format!("retry budget exhausted: {}", message));

                if !retry.switch_source_delay.is_zero() && ctx.cursor.index < ctx.chain.len() {
                    tokio::select! {
                        _ = ctx.cancel.cancelled() => {
                            ctx.mark_cancelled().await;
                            return;
                        }
                        _ = tokio::time::sleep(retry.switch_source_delay) => {}
                    }
                }
            }
            FetchError::Classified { kind, message } => {
                tracing::warn!(job_id = id.0, adapter = %adapter, %kind, %message, "source failed, trying next");
                ctx.downloader.store.update(id, |s| {
                    s.last_error = Some(message.clone());
                });
                ctx.cursor.advance(&adapter, message);
            }
        }
    }
}

/// Run one adapter, translating its progress into job state and events
async fn attempt(ctx: &mut JobContext, adapter: &str) -> AttemptOutcome {
    let id = ctx.id;
    let store = ctx.downloader.store.clone();
    let resolver = ctx.downloader.resolver.clone();
    let mut last_progress: Option<Instant> = None;

    let target = AttemptTarget {
        temp_path: &ctx.temp_path,
        cancel: &ctx.cancel,
        resume_key: &mut ctx.cursor.resume_key,
    };

    resolver
        .attempt(adapter, &ctx.request, &ctx.snapshot, target, |event| match event {
            AttemptEvent::Fetching { url, resume_from } => {
                tracing::info!(job_id = id.0, url = %url, resume_from, "downloading");
                store.update(id, |s| {
                    s.bytes_transferred = resume_from;
                    s.bytes_total = None;
                });
                store.transition(
                    id,
                    JobState::Downloading,
                    Some(JobEventKind::Downloading {
                        bytes_so_far: resume_from,
                        total: None,
                    }),
                );
                last_progress = Some(Instant::now());
            }
            AttemptEvent::Progress { bytes, total } => {
                store.update(id, |s| {
                    s.bytes_transferred = bytes;
                    s.bytes_total = total;
                });
                if last_progress.is_none_or(|t| t.elapsed() >= PROGRESS_INTERVAL) {
                    store.emit(
                        id,
                        JobEventKind::Downloading {
                            bytes_so_far: bytes,
                            total,
                        },
                    );
                    last_progress = Some(Instant::now());
                }
            }
            AttemptEvent::Bypassing { reason } => {
                tracing::info!(job_id = id.0, adapter, %reason, "bypass required, obtaining session");
            }
        })
        .await
}
