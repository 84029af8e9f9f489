//! Resumable transfers with mirror failover
//!
//! A transfer writes into a temporary file. If the file already holds bytes from
//! an earlier attempt, a `Range` request continues from its length: a `206`
//! appends only when its `Content-Range` starts at that length. A `200`, or a
//! `206` starting at zero, means the host ignored the range and the file is
//! truncated; a `206` starting anywhere else restarts the request. A `416`
//! either confirms the file is complete or triggers a restart. Waiting for
//! headers is bounded by the request timeout, and cancellation is observed at
//! every chunk boundary.

use super::{HttpTransport, StatusPolicy, classify, with_session};
use crate::bypass::BypassSession;
use crate::error::FetchError;
use crate::types::CandidateDownload;
use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{CONTENT_RANGE, RANGE};
use std::path::Path;
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Everything a single transfer needs
pub struct FetchTarget<'a> {
    /// Candidate to fetch (primary URL and mirrors)
    pub candidate: &'a CandidateDownload,
    /// Temporary file receiving the bytes
    pub temp_path: &'a Path,
    /// Session for the candidate's host, if it is bot-protected
    pub session: Option<&'a BypassSession>,
    /// Status classification for the adapter that produced the candidate
    pub policy: &'a StatusPolicy,
    /// Cancellation flag checked between chunks
    pub cancel: &'a CancellationToken,
}

/// Result of a finished transfer
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FetchOutcome {
    /// Bytes in the temporary file
    pub bytes: u64,
    /// Total size reported by the host, if any
    pub total: Option<u64>,
    /// Offset the transfer resumed from (0 for a fresh transfer)
    pub resumed_from: u64,
    /// Filename suggested by the host (Content-Disposition or URL)
    pub filename: Option<String>,
    /// URL that served the bytes
    pub served_by: Url,
}

enum Attempt {
    Done(FetchOutcome),
    /// Failed before any bytes were received; another mirror may help
    Unreachable(FetchError),
    Failed(FetchError),
}

impl HttpTransport {
    /// Fetch a candidate into its temporary file, trying mirrors in order on
    /// connection-level failure
    pub async fn fetch_to_file<F>(
        &self,
        target: FetchTarget<'_>,
        mut progress: F,
    ) -> Result<FetchOutcome, FetchError>
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        let mut last_error = None;

        for (index, url) in target.candidate.urls().enumerate() {
            if target.cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            if index > 0 {
                tracing::info!(mirror = %url, "failing over to mirror");
            }

            match self.fetch_from(url, &target, &mut progress).await {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Unreachable(e) => {
                    tracing::warn!(url = %url, error = %e, "mirror unreachable");
                    last_error = Some(e);
                }
                Attempt::Failed(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::permanent("candidate has no URLs")))
    }

    async fn fetch_from<F>(&self, url: &Url, target: &FetchTarget<'_>, progress: &mut F) -> Attempt
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        // An unsatisfiable or mismatched range restarts from zero, at most once
        for _ in 0..2 {
            let offset = match tokio::fs::metadata(target.temp_path).await {
                Ok(meta) => meta.len(),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => 0,
                Err(e) => return Attempt::Failed(e.into()),
            };

            let send = self.send(url, |client| {
                let mut request = client.get(url.clone());
                for (name, value) in &target.candidate.headers {
                    request = request.header(name.as_str(), value.as_str());
                }
                if offset > 0 {
                    request = request.header(RANGE, format!("bytes={}-", offset));
                }
                with_session(request, url, target.session)
            });

            // Bounds the wait for headers only; the body has its own deadlines
            let request_timeout = self.config.request_timeout;
            let response = tokio::select! {
                biased;
                _ = target.cancel.cancelled() => return Attempt::Failed(FetchError::Cancelled),
                result = tokio::time::timeout(request_timeout, send) => match result {
                    Err(_) => {
                        return Attempt::Unreachable(FetchError::transient(format!(
                            "no response from {} within {:?}",
                            url, request_timeout
                        )));
                    }
                    Ok(Ok(response)) => response,
                    Ok(Err(e)) if classify::is_connection_level(&e) => {
                        return Attempt::Unreachable(classify::classify_reqwest_error(&e));
                    }
                    Ok(Err(e)) => return Attempt::Failed(classify::classify_reqwest_error(&e)),
                },
            };

            let status = response.status();
            if status == StatusCode::RANGE_NOT_SATISFIABLE && offset > 0 {
                let total = content_range_total(response.headers());
                if total == Some(offset) {
                    tracing::debug!(url = %url, bytes = offset, "partial file already complete");
                    return Attempt::Done(FetchOutcome {
                        bytes: offset,
                        total,
                        resumed_from: offset,
                        filename: crate::utils::filename_from_response(&response),
                        served_by: url.clone(),
                    });
                }
                tracing::info!(url = %url, offset, "range not satisfiable, restarting");
                if let Err(e) = truncate(target.temp_path).await {
                    return Attempt::Failed(e);
                }
                continue;
            }

            if !status.is_success() {
                return Attempt::Failed(classify::failure_from_response(response, target.policy).await);
            }
            if classify::challenge_in_headers(status, response.headers()) {
                return Attempt::Failed(FetchError::bypass_required(format!(
                    "challenge served for {}",
                    url
                )));
            }
            if classify::is_html(response.headers()) && !expects_html(target.candidate) {
                let body = response.text().await.unwrap_or_default();
                return Attempt::Failed(if classify::challenge_in_body(&body, true) {
                    FetchError::bypass_required(format!("challenge page instead of file at {}", url))
                } else {
                    FetchError::permanent(format!("HTML page instead of file at {}", url))
                });
            }

            let partial = status == StatusCode::PARTIAL_CONTENT && offset > 0;
            let range_start = content_range_start(response.headers());
            let (resume_from, total) = if partial && range_start == Some(offset) {
                let total = content_range_total(response.headers())
                    .or_else(|| response.content_length().map(|len| offset + len));
                (offset, total)
            } else if partial && range_start == Some(0) {
                tracing::info!(url = %url, offset, "host sent the whole file, restarting");
                (0, content_range_total(response.headers()))
            } else if partial {
                // Bytes from some other offset cannot be appended
                tracing::info!(url = %url, offset, ?range_start, "range mismatch, restarting");
                if let Err(e) = truncate(target.temp_path).await {
                    return Attempt::Failed(e);
                }
                continue;
            } else {
                if offset > 0 {
                    tracing::info!(url = %url, offset, "host ignored range request, restarting");
                }
                (0, response.content_length())
            };

            return self
                .stream_body(response, url, target, resume_from, total, progress)
                .await;
        }

        Attempt::Failed(FetchError::transient(format!(
            "could not establish a consistent range with {}",
            url
        )))
    }

    async fn stream_body<F>(
        &self,
        response: reqwest::Response,
        url: &Url,
        target: &FetchTarget<'_>,
        resume_from: u64,
        total: Option<u64>,
        progress: &mut F,
    ) -> Attempt
    where
        F: FnMut(u64, Option<u64>) + Send,
    {
        let filename = crate::utils::filename_from_response(&response);

        let mut options = OpenOptions::new();
        options.create(true).write(true);
        if resume_from > 0 {
            options.append(true);
        } else {
            options.truncate(true);
        }
        let mut file = match options.open(target.temp_path).await {
            Ok(file) => file,
            Err(e) => return Attempt::Failed(e.into()),
        };

        let read_timeout = self.config.read_timeout;
        let deadline = tokio::time::Instant::now() + self.config.transfer_timeout;
        let mut written = resume_from;
        let mut stream = response.bytes_stream();
        progress(written, total);

        loop {
            let next = tokio::select! {
                biased;
                _ = target.cancel.cancelled() => {
                    flush_quietly(&mut file, target.temp_path).await;
                    return Attempt::Failed(FetchError::Cancelled);
                }
                _ = tokio::time::sleep_until(deadline) => {
                    flush_quietly(&mut file, target.temp_path).await;
                    return Attempt::Failed(FetchError::transient(format!(
                        "transfer from {} exceeded {:?}",
                        url, self.config.transfer_timeout
                    )));
                }
                next = tokio::time::timeout(read_timeout, stream.next()) => next,
            };

            let chunk = match next {
                Err(_) => {
                    flush_quietly(&mut file, target.temp_path).await;
                    return Attempt::Failed(FetchError::transient(format!(
                        "no data from {} for {:?}",
                        url, read_timeout
                    )));
                }
                Ok(None) => break,
                Ok(Some(Err(e))) => {
                    flush_quietly(&mut file, target.temp_path).await;
                    return Attempt::Failed(classify::classify_reqwest_error(&e));
                }
                Ok(Some(Ok(chunk))) => chunk,
            };

            if let Err(e) = file.write_all(&chunk).await {
                return Attempt::Failed(e.into());
            }
            written += chunk.len() as u64;
            if let Some(total) = total
                && written > total
            {
                drop(file);
                if let Err(e) = truncate(target.temp_path).await {
                    return Attempt::Failed(e);
                }
                return Attempt::Failed(FetchError::transient(format!(
                    "{} sent {} bytes for a {} byte file",
                    url, written, total
                )));
            }
            progress(written, total);
        }

        if let Err(e) = file.flush().await {
            return Attempt::Failed(e.into());
        }

        if let Some(total) = total
            && written < total
        {
            return Attempt::Failed(FetchError::transient(format!(
                "connection to {} closed after {} of {} bytes",
                url, written, total
            )));
        }

        tracing::debug!(url = %url, bytes = written, resumed_from = resume_from, "transfer finished");
        Attempt::Done(FetchOutcome {
            bytes: written,
            total,
            resumed_from: resume_from,
            filename,
            served_by: url.clone(),
        })
    }
}

fn expects_html(candidate: &CandidateDownload) -> bool {
    candidate
        .format
        .as_deref()
        .is_some_and(|f| f.eq_ignore_ascii_case("html") || f.eq_ignore_ascii_case("htm"))
}

/// Total length from `Content-Range: bytes a-b/total` or `bytes */total`
fn content_range_total(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(CONTENT_RANGE)?
        .to_str()
        .ok()?
        .rsplit('/')
        .next()?
        .trim()
        .parse()
        .ok()
}

/// Start offset from `Content-Range: bytes a-b/total`
fn content_range_start(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    let value = headers.get(CONTENT_RANGE)?.to_str().ok()?;
    let range = value.trim().strip_prefix("bytes")?.trim_start();
    range.split('-').next()?.trim().parse().ok()
}

async fn flush_quietly(file: &mut tokio::fs::File, path: &Path) {
    if let Err(e) = file.flush().await {
        tracing::debug!(path = %path.display(), error = %e, "flush of partial file failed");
    }
}

async fn truncate(path: &Path) -> Result<(), FetchError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
