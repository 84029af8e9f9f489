//! Common test utilities for shelf-dl integration tests

use std::path::{Path, PathBuf};
use std::time::Duration;

use shelf_dl::config::{AdapterConfig, AdapterKind, PageAdapterConfig};
use shelf_dl::{BookDownloader, BypassMode, Config, JobEvent, JobEventKind, JobId, ReleaseRequest};
use tempfile::TempDir;

/// Configuration rooted in a temp dir: no DNS rotation, no bypass, millisecond backoff
pub fn test_config(dir: &TempDir) -> Config {
    let mut config = Config::default();
    config.download.ingest_dir = dir.path().join("ingest");
    config.download.temp_dir = Some(dir.path().join("incomplete"));
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

/// A landing page adapter definition
#[allow(dead_code)]
pub fn page_adapter(name: &str, url_template: String, mirrors: Vec<String>) -> AdapterConfig {
    AdapterConfig {
        name: name.to_string(),
        enabled: true,
        kind: AdapterKind::Page(PageAdapterConfig {
            url_template,
            mirrors,
            link_pattern: r#"<a class="get" href="(?P<url>[^"]+)">(?:[^<]*\((?P<size>[^)]+)\))?"#
                .to_string(),
            checksum_from_id: true,
        }),
        requires_bypass: false,
        requires_donor_key: false,
        rate_limit: None,
        status_overrides: Default::default(),
    }
}

/// Landing page HTML linking to `href`
#[allow(dead_code)]
pub fn landing_page(href: &str, size: &str) -> String {
    format!(
        r#"<html><body><h1>Dune</h1><a class="get" href="{}">GET ({})</a></body></html>"#,
        href, size
    )
}

/// URL on a port nothing listens on
#[allow(dead_code)]
pub fn closed_port_url(file: &str) -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);
    format!("http://127.0.0.1:{}/{}", port, file)
}

/// Submit a request, start the downloader and collect the job's events until
/// its terminal event
pub async fn run_job(downloader: &BookDownloader, request: ReleaseRequest) -> (JobId, Vec<JobEvent>) {
    use futures::StreamExt;

    let id = downloader.submit(request).await.unwrap();
    // Subscribed before anything runs, so no event is missed
    let stream = downloader.subscribe_job(id).unwrap();
    downloader.start();
    let events = tokio::time::timeout(Duration::from_secs(15), stream.collect::<Vec<_>>())
        .await
        .expect("job did not finish in time");
    (id, events)
}

/// Final path reported by a completed job's events
#[allow(dead_code)]
pub fn completed_path(events: &[JobEvent]) -> Option<PathBuf> {
    events.iter().find_map(|e| match &e.kind {
        JobEventKind::Completed { path } => Some(path.clone()),
        _ => None,
    })
}

/// File names directly inside `dir`, sorted
#[allow(dead_code)]
pub fn files_in(dir: &Path) -> Vec<String> {
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
