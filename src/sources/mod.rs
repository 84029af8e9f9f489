//! Source adapters and the chain resolver
//!
//! Each external host is reached through a [`SourceAdapter`]: a common
//! `resolve(request) -> Candidate | Unavailable` contract plus the capabilities
//! the resolver needs (bypass, rate-limit hint, donor-key gating, status table).
//! Adapters are registered once in an [`AdapterRegistry`] before the
//! downloader starts and are read-only afterwards.

pub mod direct;
pub mod page;
pub mod resolver;

pub use direct::DirectAdapter;
pub use page::PageAdapter;
pub use resolver::{AttemptEvent, AttemptOutcome, AttemptTarget, Delivery, SnapshotContext, SourceChainResolver};

use crate::bypass::BypassSession;
use crate::config::{AdapterKind, Settings, SourcesConfig};
use crate::error::{Error, FetchError, Result};
use crate::network::{HttpTransport, StatusPolicy};
use crate::types::{CandidateDownload, ReleaseRequest};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use url::Url;

/// File extensions recognized as book formats when inferring from a URL
pub(crate) const BOOK_EXTENSIONS: &[&str] = &[
    "epub", "mobi", "azw", "azw3", "fb2", "djvu", "cbz", "cbr", "pdf", "txt", "rtf", "doc",
    "docx", "lit",
];

/// What an adapter found for a request
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Resolution {
    /// A fetchable target
    Candidate(CandidateDownload),
    /// The host does not have the release; the chain moves on without backoff
    Unavailable(String),
}

/// What an adapter gets to work with during resolution
pub struct ResolveContext<'a> {
    /// Transport of the job's settings snapshot
    pub transport: &'a HttpTransport,
    /// The job's settings snapshot
    pub settings: &'a Settings,
    /// Bypass session for the adapter's landing host, if one was obtained
    pub session: Option<&'a BypassSession>,
}

/// One external host capable of serving releases
#[async_trait]
pub trait SourceAdapter: Send + Sync {
    /// Unique adapter name, used in ordering lists and events
    fn name(&self) -> &str;

    /// Whether the host sits behind a bot-protection challenge
    fn requires_bypass(&self) -> bool {
        false
    }

    /// Minimum interval between two resolution calls
    fn rate_limit_hint(&self) -> Option<Duration> {
        None
    }

    /// Whether the adapter only works with a donor key
    fn requires_donor_key(&self) -> bool {
        false
    }

    /// HTTP status classification for this host
    fn status_policy(&self) -> StatusPolicy {
        StatusPolicy::default()
    }

    /// URL whose host needs a bypass session before `resolve` talks to it
    fn bypass_target(&self, _request: &ReleaseRequest, _settings: &Settings) -> Option<Url> {
        None
    }

    /// Turn a request into a fetchable candidate
    ///
    /// Network failures are returned classified; "the host does not have it"
    /// is `Ok(Resolution::Unavailable)`.
    async fn resolve(
        &self,
        request: &ReleaseRequest,
        ctx: &ResolveContext<'_>,
    ) -> std::result::Result<Resolution, FetchError>;
}

/// Name-to-adapter registry, iterated in registration order
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: Vec<Arc<dyn SourceAdapter>>,
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}

impl AdapterRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in adapters described by the configuration
    pub fn from_config(sources: &SourcesConfig) -> Result<Self> {
        let mut registry = Self::new();
        for definition in &sources.adapters {
            let adapter: Arc<dyn SourceAdapter> = match &definition.kind {
                AdapterKind::Direct => Arc::new(DirectAdapter::from_config(definition)),
                AdapterKind::Page(_) => Arc::new(PageAdapter::from_config(definition)?),
            };
            registry.register(adapter)?;
        }
        Ok(registry)
    }

    /// Add an adapter; names must be unique
    pub fn register(&mut self, adapter: Arc<dyn SourceAdapter>) -> Result<()> {
        if self.get(adapter.name()).is_some() {
            return Err(Error::Config {
                message: format!("adapter '{}' registered twice", adapter.name()),
                key: Some("sources.adapters".to_string()),
            });
        }
        tracing::debug!(adapter = adapter.name(), "source adapter registered");
        self.adapters.push(adapter);
        Ok(())
    }

    /// Look up an adapter by name
    pub fn get(&self, name: &str) -> Option<&Arc<dyn SourceAdapter>> {
        self.adapters.iter().find(|a| a.name() == name)
    }

    /// Adapter names in registration order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.adapters.iter().map(|a| a.name())
    }

    /// Number of registered adapters
    pub fn len(&self) -> usize {
        self.adapters.len()
    }

    /// Whether no adapter is registered
    pub fn is_empty(&self) -> bool {
        self.adapters.is_empty()
    }
}

/// Format implied by a URL's file extension, if it is a book format
pub(crate) fn format_from_url(url: &Url) -> Option<String> {
    let segment = url.path_segments()?.next_back()?;
    let (_, ext) = segment.rsplit_once('.')?;
    let ext = ext.to_ascii_lowercase();
    BOOK_EXTENSIONS.contains(&ext.as_str()).then_some(ext)
}
