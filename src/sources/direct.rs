//! Adapter for releases that arrive with explicit download links
//!
//! The request's `source_hints[<adapter name>]` lists URLs for the same file;
//! the first is the primary and the rest are mirrors.

use super::{Resolution, ResolveContext, SourceAdapter, format_from_url};
use crate::config::AdapterConfig;
use crate::error::FetchError;
use crate::network::StatusPolicy;
use crate::types::{CandidateDownload, ReleaseRequest};
use async_trait::async_trait;
use std::time::Duration;
use url::Url;

/// Serves URLs passed in the request's source hints
#[derive(Clone, Debug)]
pub struct DirectAdapter {
    name: String,
    requires_bypass: bool,
    rate_limit: Option<Duration>,
    policy: StatusPolicy,
}

impl DirectAdapter {
    /// Adapter reading hints under `name`
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            requires_bypass: false,
            rate_limit: None,
            policy: StatusPolicy::default(),
        }
    }

    /// Adapter from its configuration entry
    pub fn from_config(config: &AdapterConfig) -> Self {
        Self {
            name: config.name.clone(),
            requires_bypass: config.requires_bypass,
            rate_limit: config.rate_limit,
            policy: StatusPolicy::new(&config.status_overrides),
        }
    }

    fn hinted_urls(&self, request: &ReleaseRequest) -> Vec<Url> {
        request
            .source_hints
            .get(&self.name)
            .map(|hints| {
                hints
                    .iter()
                    .filter_map(|raw| match Url::parse(raw.trim()) {
                        Ok(url) if matches!(url.scheme(), "http" | "https") => Some(url),
                        Ok(url) => {
                            tracing::warn!(adapter = %self.name, url = %url, "ignoring non-HTTP hint");
                            None
                        }
                        Err(e) => {
                            tracing::warn!(adapter = %self.name, hint = %raw, error = %e, "ignoring malformed hint");
                            None
                        }
                    })
                    .collect()
            })
            .unwrap_or_default()
    }
}

#[async_trait]
impl SourceAdapter for DirectAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_bypass(&self) -> bool {
        self.requires_bypass
    }

    fn rate_limit_hint(&self) -> Option<Duration> {
        self.rate_limit
    }

    fn status_policy(&self) -> StatusPolicy {
        self.policy.clone()
    }

    async fn resolve(
        &self,
        request: &ReleaseRequest,
        _ctx: &ResolveContext<'_>,
    ) -> Result<Resolution, FetchError> {
        let mut urls = self.hinted_urls(request).into_iter();
        let Some(primary) = urls.next() else {
            return Ok(Resolution::Unavailable(format!(
                "no download links for {}",
                self.name
            )));
        };

        let mut candidate = CandidateDownload::new(primary);
        candidate.mirrors = urls.collect();
        candidate.format = format_from_url(&candidate.url);
        Ok(Resolution::Candidate(candidate))
    }
}
