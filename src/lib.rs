//! # shelf-dl
//!
//! Download orchestration core for book acquisition: takes a requested release,
//! resolves it through a chain of unreliable, rate-limited, bot-protected hosts,
//! fetches the bytes under adverse network conditions and lands one complete,
//! verified file in an ingest directory, reporting progress as events.
//!
//! ## Design Philosophy
//!
//! shelf-dl is designed to be:
//! - **Library-first** - No CLI or UI; the embedding process owns presentation,
//!   persistence and logging setup
//! - **Event-driven** - Consumers subscribe to [`JobEvent`]s instead of polling
//! - **Snapshot-configured** - Each job runs under the [`Settings`] it was
//!   admitted with; later changes only affect later jobs
//! - **Pluggable at the edges** - Hosts are [`SourceAdapter`]s, challenge
//!   solving is a [`Bypasser`]
//!
//! ## Layers
//!
//! - [`network`] - HTTP transport with DNS rotation, mirror failover, proxy/Tor
//!   routing, resumable transfers and failure classification
//! - [`bypass`] - Bot-protection sessions (headless browser over WebDriver, or
//!   an external solver service), cached and coalesced per host
//! - [`sources`] - Source adapters and the chain resolver
//! - [`downloader`] - Job queue, worker pool, retries and atomic promotion
//!
//! ## Quick Start
//!
//! ```no_run
//! use shelf_dl::{BookDownloader, Config, ReleaseRequest};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::default();
//!     let downloader = BookDownloader::new(config).await?;
//!     downloader.start();
//!
//!     let mut request = ReleaseRequest::new("Dune");
//!     request.author = Some("Frank Herbert".into());
//!     request
//!         .source_hints
//!         .insert("direct".into(), vec!["https://books.example/dune.epub".into()]);
//!
//!     let id = downloader.submit(request).await?;
//!
//!     let mut events = downloader.subscribe_job(id)?;
//!     use futures::StreamExt;
//!     while let Some(event) = events.next().await {
//!         println!("{:?}", event.kind);
//!     }
//!
//!     downloader.shutdown().await?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// Bot-protection bypass strategies and the per-host session cache
pub mod bypass;
/// Configuration types
pub mod config;
/// Job queue and orchestrator (decomposed into focused submodules)
pub mod downloader;
/// Error types
pub mod error;
/// Network resilience layer
pub mod network;
/// Retry logic with exponential backoff
pub mod retry;
/// Source adapters and the chain resolver
pub mod sources;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;

// Re-export commonly used types
pub use bypass::{BypassSession, Bypasser, SessionCache};
pub use config::{BypassMode, Config, FileCollisionAction, ProxyMode, Settings};
pub use downloader::{BookDownloader, JobEventStream};
pub use error::{
    BypassError, Error, FailureKind, FetchError, JobError, ResolutionFailure, Result,
};
pub use sources::{AdapterRegistry, Resolution, ResolveContext, SourceAdapter};
pub use types::{
    CandidateDownload, Checksum, JobEvent, JobEventKind, JobId, JobSnapshot, JobState, Priority,
    ReleaseRequest,
};

/// Run the downloader until a termination signal arrives, then shut it down.
///
/// - **Unix:** SIGTERM or SIGINT, falling back to whichever can be registered.
/// - **Other platforms:** Ctrl+C.
///
/// # Example
///
/// ```no_run
/// use shelf_dl::{BookDownloader, Config, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let downloader = BookDownloader::new(Config::default()).await?;
///     downloader.start();
///     run_with_shutdown(downloader).await?;
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(downloader: BookDownloader) -> Result<()> {
    wait_for_signal().await;
    downloader.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    match (signal(SignalKind::terminate()), signal(SignalKind::interrupt())) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => tracing::info!("received SIGTERM"),
                _ = sigint.recv() => tracing::info!("received SIGINT"),
            }
        }
        (Ok(mut sigterm), Err(e)) => {
            tracing::warn!(error = %e, "could not register SIGINT handler, waiting for SIGTERM only");
            sigterm.recv().await;
            tracing::info!("received SIGTERM");
        }
        (Err(e), Ok(mut sigint)) => {
            tracing::warn!(error = %e, "could not register SIGTERM handler, waiting for SIGINT only");
            sigint.recv().await;
            tracing::info!("received SIGINT");
        }
        (Err(e), Err(_)) => {
            tracing::error!(error = %e, "could not register signal handlers, using ctrl_c fallback");
            tokio::signal::ctrl_c().await.ok();
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => tracing::info!("received Ctrl+C"),
        Err(e) => tracing::error!(error = %e, "failed to listen for Ctrl+C"),
    }
}
