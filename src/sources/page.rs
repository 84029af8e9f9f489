//! Landing page adapter
//!
//! Fills a URL template from the request, fetches the landing page (trying the
//! configured mirror bases in order) and extracts the download link with a
//! regex. The pattern's named groups are `url` (required), `size`, `format`
//! and `language` (optional).

use super::{Resolution, ResolveContext, SourceAdapter, format_from_url};
use crate::config::{AdapterConfig, AdapterKind, PageAdapterConfig, Settings};
use crate::error::{Error, FailureKind, FetchError, Result};
use crate::network::StatusPolicy;
use crate::types::{CandidateDownload, Checksum, ReleaseRequest};
use async_trait::async_trait;
use regex::Regex;
use std::time::Duration;
use url::Url;

/// Scrapes a landing page for the download link
#[derive(Clone, Debug)]
pub struct PageAdapter {
    name: String,
    config: PageAdapterConfig,
    link: Regex,
    requires_bypass: bool,
    requires_donor_key: bool,
    rate_limit: Option<Duration>,
    policy: StatusPolicy,
}

impl PageAdapter {
    /// Adapter from its configuration entry
    pub fn from_config(definition: &AdapterConfig) -> Result<Self> {
        let AdapterKind::Page(config) = &definition.kind else {
            return Err(Error::Config {
                message: format!("adapter '{}' is not a page adapter", definition.name),
                key: Some(format!("sources.adapters.{}.kind", definition.name)),
            });
        };
        let link = Regex::new(&config.link_pattern).map_err(|e| Error::Config {
            message: format!("invalid link_pattern for '{}': {}", definition.name, e),
            key: Some(format!("sources.adapters.{}.link_pattern", definition.name)),
        })?;
        if !link.capture_names().any(|n| n == Some("url")) {
            return Err(Error::Config {
                message: format!("link_pattern for '{}' has no (?P<url>...) group", definition.name),
                key: Some(format!("sources.adapters.{}.link_pattern", definition.name)),
            });
        }

        Ok(Self {
            name: definition.name.clone(),
            config: config.clone(),
            link,
            requires_bypass: definition.requires_bypass,
            requires_donor_key: definition.requires_donor_key,
            rate_limit: definition.rate_limit,
            policy: StatusPolicy::new(&definition.status_overrides),
        })
    }

    /// Landing page URLs: the filled template, then the same path on each mirror base
    fn landing_urls(&self, request: &ReleaseRequest, donor_key: Option<&str>) -> std::result::Result<Vec<Url>, String> {
        let filled = fill_template(&self.config.url_template, request, donor_key)?;
        let primary = Url::parse(&filled).map_err(|e| format!("bad landing URL {}: {}", filled, e))?;

        let mut urls = vec![primary.clone()];
        for base in &self.config.mirrors {
            match rebase(&primary, base) {
                Some(url) if !urls.contains(&url) => urls.push(url),
                Some(_) => {}
                None => tracing::warn!(adapter = %self.name, mirror = %base, "ignoring invalid mirror base"),
            }
        }
        Ok(urls)
    }

    fn candidate_from(&self, page_url: &Url, body: &str, request: &ReleaseRequest) -> Option<CandidateDownload> {
        let caps = self.link.captures(body)?;
        let raw = html_unescape(caps.name("url")?.as_str().trim());
        let url = page_url.join(&raw).ok()?;

        let mut candidate = CandidateDownload::new(url);
        // Listings round their sizes; only an exact byte count is safe to verify against
        match caps.name("size").and_then(|m| parse_size(m.as_str())) {
            Some((bytes, true)) => candidate.expected_size = Some(bytes),
            Some((bytes, false)) => {
                tracing::debug!(adapter = %self.name, approx_bytes = bytes, "listed size is approximate")
            }
            None => {}
        }
        candidate.format = caps
            .name("format")
            .map(|m| m.as_str().trim().trim_start_matches('.').to_ascii_lowercase())
            .filter(|f| !f.is_empty())
            .or_else(|| format_from_url(&candidate.url));
        candidate.language = caps
            .name("language")
            .map(|m| m.as_str().trim().to_ascii_lowercase())
            .filter(|l| !l.is_empty());
        candidate.headers = vec![("Referer".to_string(), page_url.to_string())];

        if self.config.checksum_from_id
            && let Some(id) = request.external_id.as_deref()
            && is_md5(id)
        {
            candidate.checksum = Some(Checksum::Md5(id.to_ascii_lowercase()));
        }

        // A relative link is served by every mirror of the landing page
        if !raw.contains("://") {
            candidate.mirrors = self
                .config
                .mirrors
                .iter()
                .filter_map(|base| rebase(&candidate.url, base))
                .filter(|u| *u != candidate.url)
                .collect();
        }
        Some(candidate)
    }
}

#[async_trait]
impl SourceAdapter for PageAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    fn requires_bypass(&self) -> bool {
        self.requires_bypass
    }

    fn rate_limit_hint(&self) -> Option<Duration> {
        self.rate_limit
    }

    fn requires_donor_key(&self) -> bool {
        self.requires_donor_key
    }

    fn status_policy(&self) -> StatusPolicy {
        self.policy.clone()
    }

    fn bypass_target(&self, request: &ReleaseRequest, settings: &Settings) -> Option<Url> {
        self.landing_urls(request, settings.donor_key.as_deref())
            .ok()?
            .into_iter()
            .next()
    }

    async fn resolve(
        &self,
        request: &ReleaseRequest,
        ctx: &ResolveContext<'_>,
    ) -> std::result::Result<Resolution, FetchError> {
        let urls = match self.landing_urls(request, ctx.settings.donor_key.as_deref()) {
            Ok(urls) => urls,
            Err(reason) => return Ok(Resolution::Unavailable(reason)),
        };

        let mut last_error = None;
        for url in &urls {
            match ctx.transport.get_page(url, ctx.session, &self.policy).await {
                Ok(page) => {
                    return Ok(match self.candidate_from(&page.url, &page.body, request) {
                        Some(candidate) => {
                            tracing::debug!(adapter = %self.name, url = %candidate.url, "download link found");
                            Resolution::Candidate(candidate)
                        }
                        None => Resolution::Unavailable(format!("no download link on {}", page.url)),
                    });
                }
                // Only transient failures justify asking the next mirror
                Err(e) if e.kind() == Some(FailureKind::Transient) => {
                    tracing::warn!(adapter = %self.name, url = %url, error = %e, "landing page failed");
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_error.unwrap_or_else(|| FetchError::permanent("no landing page URLs")))
    }
}

/// Substitute request fields into a URL template
///
/// Fails when the template needs a field the request lacks.
fn fill_template(template: &str, request: &ReleaseRequest, donor_key: Option<&str>) -> std::result::Result<String, String> {
    let id = request.external_id.as_deref().map(str::trim).filter(|s| !s.is_empty());
    let mut out = template.to_string();

    let fields: [(&str, Option<String>); 6] = [
        ("{id}", id.map(|s| urlencoding::encode(s).into_owned())),
        ("{md5}", id.filter(|s| is_md5(s)).map(str::to_ascii_lowercase)),
        ("{title}", Some(urlencoding::encode(request.title.trim()).into_owned())),
        (
            "{author}",
            Some(urlencoding::encode(request.author.as_deref().unwrap_or("").trim()).into_owned()),
        ),
        ("{query}", Some(urlencoding::encode(&request.query()).into_owned())),
        ("{donor_key}", donor_key.map(|k| urlencoding::encode(k).into_owned())),
    ];

    for (placeholder, value) in fields {
        if !out.contains(placeholder) {
            continue;
        }
        match value {
            Some(value) => out = out.replace(placeholder, &value),
            None => {
                return Err(format!(
                    "request has no value for {}",
                    placeholder.trim_matches(|c| c == '{' || c == '}')
                ));
            }
        }
    }
    Ok(out)
}

/// Same path and query on another base URL (scheme, host, port)
fn rebase(url: &Url, base: &str) -> Option<Url> {
    let base = Url::parse(base).ok()?;
    let mut rebased = url.clone();
    rebased.set_scheme(base.scheme()).ok()?;
    rebased.set_host(base.host_str()).ok()?;
    rebased.set_port(base.port()).ok()?;
    Some(rebased)
}

fn is_md5(s: &str) -> bool {
    s.len() == 32 && s.chars().all(|c| c.is_ascii_hexdigit())
}

fn html_unescape(s: &str) -> String {
    s.replace("&amp;", "&")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
}

/// Parse "1048576", "1.5 MB", "820kB", "2 GiB" into bytes, flagging exact byte counts
fn parse_size(raw: &str) -> Option<(u64, bool)> {
    let raw = raw.trim().replace(',', "");
    let split = raw
        .find(|c: char| !(c.is_ascii_digit() || c == '.'))
        .unwrap_or(raw.len());
    let (number, unit) = raw.split_at(split);
    let multiplier: f64 = match unit.trim().to_ascii_lowercase().as_str() {
        "" | "b" | "bytes" => 1.0,
        "k" | "kb" | "kib" => 1024.0,
        "m" | "mb" | "mib" => 1024.0 * 1024.0,
        "g" | "gb" | "gib" => 1024.0 * 1024.0 * 1024.0,
        _ => return None,
    };
    let exact = multiplier == 1.0 && !number.contains('.');
    let number: f64 = number.parse().ok()?;
    let bytes = number * multiplier;
    (bytes.is_finite() && bytes >= 0.0).then(|| (bytes.round() as u64, exact))
}
