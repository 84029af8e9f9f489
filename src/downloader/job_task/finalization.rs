//! Job finalization: verify the temporary file and promote it atomically.

use std::path::PathBuf;

use crate::error::{Error, Result};
use crate::network::FetchOutcome;
use crate::sources::Delivery;
use crate::types::{CandidateDownload, JobEventKind, JobState};
use crate::utils::{final_filename, get_unique_path, verify_checksum};

use super::context::JobContext;

/// Verify the delivered bytes and move them into the ingest directory.
///
/// A file that fails its size or checksum check is deleted and the job fails;
/// nothing partial or unverified ever appears under its final name.
pub(super) async fn finalize_job(ctx: JobContext, delivery: Delivery) {
    let id = ctx.id;
    let Delivery { candidate, outcome } = delivery;

    ctx.downloader.store.update(id, |s| {
        s.bytes_transferred = outcome.bytes;
        s.bytes_total = outcome.total.or(Some(outcome.bytes));
    });
    ctx.downloader.store.emit(
        id,
        JobEventKind::Downloading {
            bytes_so_far: outcome.bytes,
            total: outcome.total,
        },
    );

    if !ctx.transition(JobState::Verifying, Some(JobEventKind::Verifying)) {
        ctx.remove_temp_file().await;
        ctx.remove_from_active().await;
        return;
    }

    if let Err(e) = verify(&ctx, &candidate, &outcome).await {
        ctx.mark_failed(&e.to_string()).await;
        return;
    }

    match promote(&ctx, &candidate, &outcome).await {
        Ok(Some(path)) => {
            ctx.downloader.store.update(id, |s| {
                s.destination = Some(path.clone());
                s.last_error = None;
            });
            ctx.transition(
                JobState::Completed,
                Some(JobEventKind::Completed { path: path.clone() }),
            );
            tracing::info!(
                job_id = id.0,
                path = %path.display(),
                bytes = outcome.bytes,
                served_by = %outcome.served_by,
                "job completed"
            );
            ctx.remove_from_active().await;
        }
        Ok(None) => ctx.mark_cancelled().await,
        Err(e) => ctx.mark_failed(&e.to_string()).await,
    }
}

async fn verify(ctx: &JobContext, candidate: &CandidateDownload, outcome: &FetchOutcome) -> Result<()> {
    let path = &ctx.temp_path;
    let len = tokio::fs::metadata(path).await?.len();

    let expected = outcome.total.or(candidate.expected_size);
    if let Some(expected) = expected
        && len != expected
    {
        return Err(Error::Verification {
            path: path.clone(),
            reason: format!("expected {} bytes, found {}", expected, len),
        });
    }
    if let (Some(advertised), Some(served)) = (candidate.expected_size, outcome.total)
        && advertised != served
    {
        return Err(Error::Verification {
            path: path.clone(),
            reason: format!("source advertised {} bytes but served {}", advertised, served),
        });
    }
    if len == 0 {
        return Err(Error::Verification {
            path: path.clone(),
            reason: "file is empty".to_string(),
        });
    }

    if let Some(checksum) = &candidate.checksum {
        if !verify_checksum(path, checksum).await? {
            return Err(Error::Verification {
                path: path.clone(),
                reason: format!("checksum mismatch ({:?})", checksum),
            });
        }
        tracing::debug!(job_id = ctx.id.0, "checksum verified");
    }
    Ok(())
}

/// Rename the temporary file to its final name
///
/// Returns `Ok(None)` when the job was cancelled before the rename.
async fn promote(
    ctx: &JobContext,
    candidate: &CandidateDownload,
    outcome: &FetchOutcome,
) -> Result<Option<PathBuf>> {
    let config = &ctx.downloader.config;
    let mut dir = config.ingest_dir().clone();
    if let Some(subpath) = &ctx.request.destination_subpath {
        dir = dir.join(subpath);
    }
    tokio::fs::create_dir_all(&dir).await?;

    let suggested = candidate.filename.as_deref().or(outcome.filename.as_deref());
    let name = final_filename(
        &config.download.naming_template,
        &ctx.request,
        suggested,
        candidate.format.as_deref(),
    );

    let _guard = ctx.downloader.promotion_lock.lock().await;
    if ctx.cancel.is_cancelled() {
        return Ok(None);
    }
    let destination = get_unique_path(&dir.join(&name), config.download.file_collision)?;
    tokio::fs::rename(&ctx.temp_path, &destination)
        .await
        .map_err(|e| {
            Error::Io(std::io::Error::new(
                e.kind(),
                format!(
                    "failed to move '{}' to '{}': {}",
                    ctx.temp_path.display(),
                    destination.display(),
                    e
                ),
            ))
        })?;
    Ok(Some(destination))
}
