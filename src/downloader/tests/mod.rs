//! Tests for the BookDownloader orchestrator.

use super::test_helpers::{
    MockAdapter, create_downloader_with, create_test_downloader, direct_request, test_config,
    wait_for_terminal,
};
use super::*;
use crate::error::{FetchError, JobError};
use crate::types::{CandidateDownload, Checksum, JobEventKind, JobSnapshot, JobState, ReleaseRequest};
use std::path::Path;
use std::time::Duration;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};


/// Short labels for a job's event history, consecutive progress events collapsed
fn event_labels(downloader: &BookDownloader, id: JobId) -> Vec<&'static str> {
    let mut labels: Vec<&'static str> = Vec::new();
    for event in downloader.recent_events(id).unwrap() {
        let label = match event.kind {
            JobEventKind::Queued => "queued",
            JobEventKind::Resolving { .. } => "resolving",
            JobEventKind::Downloading { .. } => "downloading",
            JobEventKind::Retrying { .. } => "retrying",
            JobEventKind::Verifying => "verifying",
            JobEventKind::Completed { .. } => "completed",
            JobEventKind::Failed { .. } => "failed",
        };
        if label == "downloading" && labels.last() == Some(&"downloading") {
            continue;
        }
        labels.push(label);
    }
    labels
}

/// File names directly inside `dir`, sorted
fn files_in(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .filter(|e| e.path().is_file())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .collect()
        })
        .unwrap_or_default();
    names.sort();
    names
}

/// Mock server answering `GET /<name>` with `body`
async fn serve_book(name: &str, body: &[u8]) -> MockServer {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/{}", name)))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body.to_vec()))
        .mount(&server)
        .await;
    server
}

/// Poll until the job reaches `state`
async fn wait_for_state(downloader: &BookDownloader, id: JobId, state: JobState) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = downloader.status(id).unwrap();
            if snapshot.state == state {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("job {} never reached {}", id, state))
}
