//! Source chain resolver
//!
//! Orders a job's adapters once at admission ([`SourceChainResolver::chain_for`])
//! and runs one adapter at a time ([`SourceChainResolver::attempt`]): pace,
//! obtain a bypass session when needed, resolve a candidate, filter it, and fetch
//! it into the job's temporary file. The orchestrator owns the position in the
//! chain and the retry policy; an attempt only reports what happened.

use super::{AdapterRegistry, Resolution, ResolveContext, SourceAdapter};
use crate::bypass::{BypassSession, Bypasser, SessionCache, bypasser_for};
use crate::config::Settings;
use crate::error::{FailureKind, FetchError, Result};
use crate::network::{FetchOutcome, FetchTarget, HttpTransport};
use crate::types::{CandidateDownload, ReleaseRequest};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use url::Url;

/// Everything derived from one settings snapshot
///
/// Built once per snapshot and shared by every job admitted under it.
#[derive(Clone)]
pub struct SnapshotContext {
    /// The immutable settings
    pub settings: Arc<Settings>,
    /// Transport honoring the snapshot's proxy and DNS settings
    pub transport: Arc<HttpTransport>,
    /// Bypass strategy selected by the snapshot
    pub bypasser: Arc<dyn Bypasser>,
}

impl std::fmt::Debug for SnapshotContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotContext")
            .field("proxy", &self.settings.network.proxy)
            .field("bypass", &self.bypasser.name())
            .finish()
    }
}

impl SnapshotContext {
    /// Build transport and bypass strategy for a settings snapshot
    pub fn new(settings: Arc<Settings>) -> Result<Self> {
        let transport = Arc::new(HttpTransport::new(&settings.network)?);
        let bypasser = bypasser_for(&settings)?;
        Ok(Self {
            settings,
            transport,
            bypasser,
        })
    }
}

/// The job-owned pieces an attempt works on
pub struct AttemptTarget<'a> {
    /// The job's temporary file
    pub temp_path: &'a Path,
    /// The job's cancellation flag
    pub cancel: &'a CancellationToken,
    /// Identity of the candidate the temporary file's bytes belong to
    pub resume_key: &'a mut Option<String>,
}

/// Progress reported while an attempt runs
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum AttemptEvent {
    /// A candidate was resolved and its transfer is starting
    Fetching {
        /// Primary candidate URL
        url: Url,
        /// Bytes already present from an earlier attempt
        resume_from: u64,
    },
    /// Bytes written so far
    Progress {
        /// Bytes in the temporary file
        bytes: u64,
        /// Total size, if known
        total: Option<u64>,
    },
    /// A challenge was hit; a new session is being obtained before retrying
    Bypassing {
        /// What triggered the bypass
        reason: String,
    },
}

/// A finished transfer
#[derive(Clone, Debug)]
pub struct Delivery {
    /// The candidate that was fetched
    pub candidate: CandidateDownload,
    /// Transfer result
    pub outcome: FetchOutcome,
}

/// Result of running one adapter
#[derive(Debug)]
pub enum AttemptOutcome {
    /// Bytes are in the temporary file
    Delivered(Box<Delivery>),
    /// The adapter has nothing for this request
    Unavailable(String),
    /// Classified failure, cancellation or local error
    Failed(FetchError),
}

/// Orders adapters and runs them
pub struct SourceChainResolver {
    registry: Arc<AdapterRegistry>,
    sessions: Arc<SessionCache>,
    /// Next permitted resolution time per adapter
    pacing: Mutex<HashMap<String, Instant>>,
}

impl std::fmt::Debug for SourceChainResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SourceChainResolver")
            .field("registry", &self.registry)
            .field("sessions", &self.sessions)
            .finish()
    }
}

impl SourceChainResolver {
    /// Resolver over a registry, sharing bypass sessions through `sessions`
    pub fn new(registry: Arc<AdapterRegistry>, sessions: Arc<SessionCache>) -> Self {
        Self {
            registry,
            sessions,
            pacing: Mutex::new(HashMap::new()),
        }
    }

    /// The adapter registry
    pub fn registry(&self) -> &AdapterRegistry {
        &self.registry
    }

    /// The shared bypass session cache
    pub fn sessions(&self) -> &Arc<SessionCache> {
        &self.sessions
    }

    /// Adapter chain for a request under a settings snapshot
    ///
    /// Order: the request's `source_priority`, then the settings order, then
    /// registration order for everything else. Disabled adapters and adapters
    /// needing a donor key the snapshot lacks are left out.
    pub fn chain_for(&self, request: &ReleaseRequest, settings: &Settings) -> Vec<String> {
        let mut chain: Vec<String> = Vec::new();
        let preferred = request
            .source_priority
            .iter()
            .chain(settings.sources.order.iter())
            .map(String::as_str);

        for name in preferred.chain(self.registry.names()) {
            if chain.iter().any(|n| n == name) {
                continue;
            }
            let Some(adapter) = self.registry.get(name) else {
                tracing::debug!(adapter = name, "ordered adapter is not registered");
                continue;
            };
            if !settings.sources.is_enabled(name) {
                continue;
            }
            if adapter.requires_donor_key() && settings.donor_key.is_none() {
                tracing::debug!(adapter = name, "skipping adapter without donor key");
                continue;
            }
            chain.push(name.to_string());
        }
        chain
    }

    /// Run one adapter: resolve, bypass as needed, and fetch into the temp file
    pub async fn attempt<F>(
        &self,
        adapter_name: &str,
        request: &ReleaseRequest,
        snapshot: &SnapshotContext,
        target: AttemptTarget<'_>,
        mut on_event: F,
    ) -> AttemptOutcome
    where
        F: FnMut(AttemptEvent) + Send,
    {
        let Some(adapter) = self.registry.get(adapter_name).cloned() else {
            return AttemptOutcome::Unavailable(format!("adapter {} is not registered", adapter_name));
        };

        if let Err(e) = self.pace(adapter.as_ref(), target.cancel).await {
            return AttemptOutcome::Failed(e);
        }

        let candidate = match self
            .resolve_candidate(adapter.as_ref(), request, snapshot, target.cancel, &mut on_event)
            .await
        {
            Ok(Resolution::Candidate(candidate)) => candidate,
            Ok(Resolution::Unavailable(reason)) => return AttemptOutcome::Unavailable(reason),
            Err(e) => return AttemptOutcome::Failed(e),
        };

        if let Some(reason) = rejected_by_filters(&candidate, request, &snapshot.settings) {
            tracing::info!(adapter = adapter_name, url = %candidate.url, %reason, "candidate filtered out");
            return AttemptOutcome::Unavailable(reason);
        }

        match self
            .fetch_candidate(adapter.as_ref(), candidate, snapshot, target, &mut on_event)
            .await
        {
            Ok(delivery) => AttemptOutcome::Delivered(Box::new(delivery)),
            Err(e) => AttemptOutcome::Failed(e),
        }
    }

    /// Wait until the adapter's rate limit allows another resolution
    async fn pace(&self, adapter: &dyn SourceAdapter, cancel: &CancellationToken) -> std::result::Result<(), FetchError> {
        let Some(interval) = adapter.rate_limit_hint() else {
            return Ok(());
        };

        let start_at = {
            let mut pacing = self.pacing.lock().unwrap_or_else(|p| p.into_inner());
            let now = Instant::now();
            let next = pacing
                .get(adapter.name())
                .copied()
                .filter(|t| *t > now)
                .unwrap_or(now);
            pacing.insert(adapter.name().to_string(), next + interval);
            next
        };

        if start_at > Instant::now() {
            tracing::debug!(adapter = adapter.name(), "waiting for rate limit");
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep_until(start_at) => {}
            }
        }
        Ok(())
    }

    async fn session_for(
        &self,
        url: &Url,
        snapshot: &SnapshotContext,
        cancel: &CancellationToken,
    ) -> std::result::Result<Arc<BypassSession>, FetchError> {
        tokio::select! {
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.sessions.acquire(url, snapshot.bypasser.as_ref(), &snapshot.settings.bypass) => {
                result.map_err(FetchError::from)
            }
        }
    }

    async fn resolve_candidate<F>(
        &self,
        adapter: &dyn SourceAdapter,
        request: &ReleaseRequest,
        snapshot: &SnapshotContext,
        cancel: &CancellationToken,
        on_event: &mut F,
    ) -> std::result::Result<Resolution, FetchError>
    where
        F: FnMut(AttemptEvent) + Send,
    {
        let landing = adapter.bypass_target(request, &snapshot.settings);
        let mut session = match (&landing, adapter.requires_bypass()) {
            (Some(url), true) => Some(self.session_for(url, snapshot, cancel).await?),
            _ => None,
        };

        let mut bypassed = false;
        loop {
            let ctx = ResolveContext {
                transport: &snapshot.transport,
                settings: &snapshot.settings,
                session: session.as_deref(),
            };
            let result = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = adapter.resolve(request, &ctx) => result,
            };

            match result {
                Err(e) if e.kind() == Some(FailureKind::BypassRequired) => {
                    let Some(url) = &landing else {
                        return Err(FetchError::permanent(format!("{} (no bypass target)", e)));
                    };
                    if bypassed {
                        return Err(FetchError::permanent(format!("challenge persists after bypass: {}", e)));
                    }
                    bypassed = true;
                    if let Some(stale) = &session {
                        self.sessions.invalidate(stale);
                    }
                    on_event(AttemptEvent::Bypassing {
                        reason: e.to_string(),
                    });
                    session = Some(self.session_for(url, snapshot, cancel).await?);
                }
                other => return other,
            }
        }
    }

    async fn fetch_candidate<F>(
        &self,
        adapter: &dyn SourceAdapter,
        candidate: CandidateDownload,
        snapshot: &SnapshotContext,
        target: AttemptTarget<'_>,
        on_event: &mut F,
    ) -> std::result::Result<Delivery, FetchError>
    where
        F: FnMut(AttemptEvent) + Send,
    {
        // Bytes from a different candidate cannot be resumed
        let key = candidate.resume_key();
        if target.resume_key.as_deref() != Some(key.as_str()) {
            remove_if_exists(target.temp_path).await?;
            *target.resume_key = Some(key);
        }

        let policy = adapter.status_policy();
        let mut session = match candidate.url.host_str() {
            Some(host) if adapter.requires_bypass() => self.sessions.get(host),
            _ => None,
        };
        let mut bypassed = false;

        loop {
            let resume_from = match tokio::fs::metadata(target.temp_path).await {
                Ok(meta) => meta.len(),
                Err(_) => 0,
            };
            on_event(AttemptEvent::Fetching {
                url: candidate.url.clone(),
                resume_from,
            });

            let result = snapshot
                .transport
                .fetch_to_file(
                    FetchTarget {
                        candidate: &candidate,
                        temp_path: target.temp_path,
                        session: session.as_deref(),
                        policy: &policy,
                        cancel: target.cancel,
                    },
                    |bytes, total| on_event(AttemptEvent::Progress { bytes, total }),
                )
                .await;

            match result {
                Ok(outcome) => return Ok(Delivery { candidate, outcome }),
                Err(e) if e.kind() == Some(FailureKind::BypassRequired) => {
                    if bypassed {
                        return Err(FetchError::permanent(format!("challenge persists after bypass: {}", e)));
                    }
                    bypassed = true;
                    if let Some(stale) = &session {
                        self.sessions.invalidate(stale);
                    }
                    tracing::info!(
                        adapter = adapter.name(),
                        host = candidate.url.host_str().unwrap_or_default(),
                        resume_from,
                        "challenge during transfer, obtaining new session"
                    );
                    on_event(AttemptEvent::Bypassing {
                        reason: e.to_string(),
                    });
                    session = Some(self.session_for(&candidate.url, snapshot, target.cancel).await?);
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// Why a candidate is unacceptable under the request's or settings' filters
fn rejected_by_filters(candidate: &CandidateDownload, request: &ReleaseRequest, settings: &Settings) -> Option<String> {
    let formats = if request.formats.is_empty() {
        &settings.filters.formats
    } else {
        &request.formats
    };
    if let Some(format) = &candidate.format
        && !formats.is_empty()
        && !formats.iter().any(|f| f.eq_ignore_ascii_case(format))
    {
        return Some(format!("format {} not accepted", format));
    }

    let languages = if request.languages.is_empty() {
        &settings.filters.languages
    } else {
        &request.languages
    };
    if let Some(language) = &candidate.language
        && !languages.is_empty()
        && !languages.iter().any(|l| l.eq_ignore_ascii_case(language))
    {
        return Some(format!("language {} not accepted", language));
    }
    None
}

async fn remove_if_exists(path: &Path) -> std::result::Result<(), FetchError> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
