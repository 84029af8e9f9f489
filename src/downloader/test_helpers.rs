//! Shared test helpers for creating BookDownloader instances in tests.

use crate::config::{BypassMode, Config};
use crate::downloader::BookDownloader;
use crate::error::FetchError;
use crate::sources::{AdapterRegistry, Resolution, ResolveContext, SourceAdapter};
use crate::types::{CandidateDownload, JobId, JobSnapshot, ReleaseRequest};
use async_trait::async_trait;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use url::Url;

/// Configuration rooted in `dir`: no DNS rotation, no bypass, millisecond backoff.
pub(crate) fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.ingest_dir = dir.path().join("ingest");
    config.download.temp_dir = Some(dir.path().join("incomplete"));
    config.download.max_concurrent_jobs = 2;
    config.download.shutdown_timeout = Duration::from_secs(5);

    let settings = &mut config.settings;
    settings.network.dns_rotation = false;
    settings.network.connect_timeout = Duration::from_secs(2);
    settings.network.read_timeout = Duration::from_secs(5);
    settings.bypass.mode = BypassMode::Disabled;
    settings.retry.initial_delay = Duration::from_millis(10);
    settings.retry.max_delay = Duration::from_millis(50);
    settings.retry.jitter = false;
    config
}

/// Helper to create a test BookDownloader with the built-in `direct` adapter.
/// Returns the downloader and the tempdir (which must be kept alive).
pub(crate) async fn create_test_downloader() -> (BookDownloader, TempDir) {
    let temp_dir = tempdir().unwrap();
    let config = test_config(&temp_dir);
    let downloader = BookDownloader::new(config).await.unwrap();
    (downloader, temp_dir)
}

/// Helper to create a test BookDownloader over the given adapters, registered in order.
pub(crate) async fn create_downloader_with(
    adapters: Vec<Arc<dyn SourceAdapter>>,
    configure: impl FnOnce(&mut Config),
) -> (BookDownloader, TempDir) {
    let temp_dir = tempdir().unwrap();
    let mut config = test_config(&temp_dir);
    config.settings.sources.order = adapters.iter().map(|a| a.name().to_string()).collect();
    config.settings.sources.adapters.clear();
    configure(&mut config);

    let mut registry = AdapterRegistry::new();
    for adapter in adapters {
        registry.register(adapter).unwrap();
    }
    let downloader = BookDownloader::with_registry(config, registry).await.unwrap();
    (downloader, temp_dir)
}

/// Poll until the job reaches a terminal state.
pub(crate) async fn wait_for_terminal(downloader: &BookDownloader, id: JobId) -> JobSnapshot {
    tokio::time::timeout(Duration::from_secs(10), async {
        loop {
            let snapshot = downloader.status(id).unwrap();
            if snapshot.state.is_terminal() {
                return snapshot;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("job did not reach a terminal state in time")
}

/// Request for a title with `urls` as hints for the `direct` adapter.
pub(crate) fn direct_request(title: &str, urls: &[String]) -> ReleaseRequest {
    let mut request = ReleaseRequest::new(title);
    request
        .source_hints
        .insert("direct".to_string(), urls.to_vec());
    request
}

enum Reply {
    Serve(Box<CandidateDownload>),
    Unavailable(String),
    Fail(FetchError),
}

/// Adapter with a fixed answer that records how often and how concurrently it is asked.
pub(crate) struct MockAdapter {
    name: String,
    reply: Reply,
    delay: Duration,
    calls: AtomicUsize,
    in_flight: AtomicUsize,
    peak: AtomicUsize,
}

impl MockAdapter {
    fn with_reply(name: &str, reply: Reply) -> Self {
        Self {
            name: name.to_string(),
            reply,
            delay: Duration::ZERO,
            calls: AtomicUsize::new(0),
            in_flight: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Always resolves to `url`
    pub(crate) fn serving(name: &str, url: &str) -> Self {
        Self::serving_candidate(name, CandidateDownload::new(Url::parse(url).unwrap()))
    }

    /// Always resolves to `candidate`
    pub(crate) fn serving_candidate(name: &str, candidate: CandidateDownload) -> Self {
        Self::with_reply(name, Reply::Serve(Box::new(candidate)))
    }

    /// Never has the release
    pub(crate) fn unavailable(name: &str) -> Self {
        Self::with_reply(name, Reply::Unavailable(format!("{} has nothing", name)))
    }

    /// Always fails resolution with `error`
    pub(crate) fn failing(name: &str, error: FetchError) -> Self {
        Self::with_reply(name, Reply::Fail(error))
    }

    /// Hold each resolution for `delay`
    pub(crate) fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub(crate) fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Highest number of overlapping resolutions observed
    pub(crate) fn peak_concurrency(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SourceAdapter for MockAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn resolve(
        &self,
        _request: &ReleaseRequest,
        _ctx: &ResolveContext<'_>,
    ) -> Result<Resolution, FetchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match &self.reply {
            Reply::Serve(candidate) => Ok(Resolution::Candidate((**candidate).clone())),
            Reply::Unavailable(reason) => Ok(Resolution::Unavailable(reason.clone())),
            Reply::Fail(error) => Err(error.clone()),
        }
    }
}
