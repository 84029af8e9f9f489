//! Source chain behavior through the public API
//!
//! Each test stands up mock hosts with wiremock and drives a real
//! `BookDownloader` from submission to its terminal event.

mod common;

use common::{completed_path, files_in, landing_page, page_adapter, run_job, test_config};
use shelf_dl::{BookDownloader, JobEventKind, JobState, ReleaseRequest};
use tempfile::TempDir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const BOOK: &[u8] = b"A beginning is the time for taking the most delicate care";
/// MD5 of `BOOK`, doubling as the request's external ID
fn book_md5() -> String {
    format!("{:x}", md5::compute(BOOK))
}

fn request() -> ReleaseRequest {
    let mut request = ReleaseRequest::new("Dune");
    request.author = Some("Frank Herbert".to_string());
    request.external_id = Some(book_md5());
    request
}

#[tokio::test]
async fn landing_page_resolves_and_verifies_checksum() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/md5/{}", book_md5())))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(landing_page("/files/dune.epub", &BOOK.len().to_string()), "text/html"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/dune.epub"))
        .and(header("referer", format!("{}/md5/{}", server.uri(), book_md5()).as_str()))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BOOK.to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.settings.sources.adapters = vec![page_adapter(
        "library",
        format!("{}/md5/{{md5}}", server.uri()),
        vec![],
    )];
    config.settings.sources.order = vec!["library".to_string()];
    let downloader = BookDownloader::new(config).await.unwrap();

    let (id, events) = run_job(&downloader, request()).await;

    let path = completed_path(&events).expect("job should complete");
    assert_eq!(path.file_name().unwrap(), "Frank Herbert - Dune.epub");
    assert_eq!(std::fs::read(&path).unwrap(), BOOK);
    assert_eq!(downloader.status(id).unwrap().state, JobState::Completed);
    server.verify().await;
}

#[tokio::test]
async fn page_without_link_falls_back_to_direct_hint() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/md5/{}", book_md5())))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw("<html><body>No files for this release</body></html>", "text/html"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/direct/dune.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BOOK.to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.settings.sources.adapters.push(page_adapter(
        "library",
        format!("{}/md5/{{md5}}", server.uri()),
        vec![],
    ));
    config.settings.sources.order = vec!["library".to_string(), "direct".to_string()];
    let downloader = BookDownloader::new(config).await.unwrap();

    let mut request = request();
    request.source_hints.insert(
        "direct".to_string(),
        vec![format!("{}/direct/dune.epub", server.uri())],
    );
    let (id, events) = run_job(&downloader, request).await;

    let adapters: Vec<&str> = events
        .iter()
        .filter_map(|e| match &e.kind {
            JobEventKind::Resolving { adapter } => Some(adapter.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(adapters, vec!["library", "direct"]);
    assert!(completed_path(&events).is_some());
    assert_eq!(downloader.status(id).unwrap().attempt, 2);
}

#[tokio::test]
async fn landing_page_mirror_used_when_primary_is_down() {
    let mirror = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/md5/{}", book_md5())))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(landing_page("/files/dune.epub", &BOOK.len().to_string()), "text/html"),
        )
        .mount(&mirror)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/dune.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BOOK.to_vec()))
        .mount(&mirror)
        .await;

    let primary = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(502))
        .mount(&primary)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.settings.sources.adapters = vec![page_adapter(
        "library",
        format!("{}/md5/{{md5}}", primary.uri()),
        vec![mirror.uri()],
    )];
    config.settings.sources.order = vec!["library".to_string()];
    let downloader = BookDownloader::new(config).await.unwrap();

    let (_, events) = run_job(&downloader, request()).await;

    let path = completed_path(&events).expect("job should complete through the mirror");
    assert_eq!(std::fs::read(path).unwrap(), BOOK);
}

#[tokio::test]
async fn checksum_mismatch_rejects_file() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path(format!("/md5/{}", book_md5())))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_raw(landing_page("/files/dune.epub", "1 MB"), "text/html"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/files/dune.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"tampered".to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.settings.sources.adapters = vec![page_adapter(
        "library",
        format!("{}/md5/{{md5}}", server.uri()),
        vec![],
    )];
    config.settings.sources.order = vec!["library".to_string()];
    let downloader = BookDownloader::new(config.clone()).await.unwrap();

    let (id, events) = run_job(&downloader, request()).await;

    assert!(matches!(
        events.last().map(|e| &e.kind),
        Some(JobEventKind::Failed { cancelled: false, reason }) if reason.contains("checksum")
    ));
    assert_eq!(downloader.status(id).unwrap().state, JobState::Failed);
    assert!(files_in(config.ingest_dir()).is_empty());
    assert!(files_in(&config.temp_dir()).is_empty());
}

#[tokio::test]
async fn donor_only_adapter_skipped_without_key() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/direct/dune.epub"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(BOOK.to_vec()))
        .mount(&server)
        .await;

    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    let mut fast = page_adapter(
        "fast",
        format!("{}/fast/{{md5}}?key={{donor_key}}", server.uri()),
        vec![],
    );
    fast.requires_donor_key = true;
    config.settings.sources.adapters.push(fast);
    config.settings.sources.order = vec!["fast".to_string(), "direct".to_string()];
    let downloader = BookDownloader::new(config).await.unwrap();

    let mut request = request();
    request.source_hints.insert(
        "direct".to_string(),
        vec![format!("{}/direct/dune.epub", server.uri())],
    );
    let (id, events) = run_job(&downloader, request).await;

    assert_eq!(downloader.status(id).unwrap().chain, vec!["direct".to_string()]);
    assert!(completed_path(&events).is_some());
}
