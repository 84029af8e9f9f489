//! Bot-protection bypass
//!
//! A [`Bypasser`] turns a challenged URL into a [`BypassSession`]: the cookies,
//! user agent and headers a host accepts afterwards. Two strategies exist:
//! - [`internal::WebDriverBypasser`] drives a headless browser over WebDriver
//! - [`external::SolverBypasser`] delegates to a challenge-solver service
//!
//! Sessions are shared across jobs through the per-host [`SessionCache`].

pub mod cache;
pub mod external;
pub mod internal;

pub use cache::SessionCache;

use crate::config::{BypassMode, Settings};
use crate::error::{BypassError, Result};
use crate::network::HttpTransport;
use async_trait::async_trait;
use reqwest::RequestBuilder;
use reqwest::header::{COOKIE, USER_AGENT};
use std::sync::Arc;
use std::time::Instant;
use url::Url;

/// Cookies and headers that satisfy one host's challenge
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BypassSession {
    /// Host the session is valid for; never used for any other host
    pub host: String,
    /// Cookies as name/value pairs
    pub cookies: Vec<(String, String)>,
    /// User agent the challenge was solved with; cookies are usually bound to it
    pub user_agent: Option<String>,
    /// Extra headers to send
    pub headers: Vec<(String, String)>,
    /// URL the browser ended up on, if it differs from the target
    pub final_url: Option<Url>,
    /// Estimated expiry
    pub expires_at: Instant,
}

impl BypassSession {
    /// Whether the estimated lifetime has elapsed
    pub fn is_expired(&self) -> bool {
        Instant::now() >= self.expires_at
    }

    /// `Cookie` header value, `None` when there are no cookies
    pub fn cookie_header(&self) -> Option<String> {
        if self.cookies.is_empty() {
            return None;
        }
        Some(
            self.cookies
                .iter()
                .map(|(name, value)| format!("{}={}", name, value))
                .collect::<Vec<_>>()
                .join("; "),
        )
    }

    /// Attach cookies, user agent and headers to a request
    pub fn apply(&self, mut request: RequestBuilder) -> RequestBuilder {
        if let Some(cookies) = self.cookie_header() {
            request = request.header(COOKIE, cookies);
        }
        if let Some(ua) = &self.user_agent {
            request = request.header(USER_AGENT, ua.as_str());
        }
        for (name, value) in &self.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        request
    }
}

/// A challenge-solving strategy
#[async_trait]
pub trait Bypasser: Send + Sync {
    /// Strategy name for logs
    fn name(&self) -> &'static str;

    /// Solve the challenge in front of `target` and return a session for its host
    async fn obtain(&self, target: &Url) -> std::result::Result<BypassSession, BypassError>;
}

/// Strategy used when bypass is turned off
#[derive(Clone, Copy, Debug, Default)]
pub struct DisabledBypasser;

#[async_trait]
impl Bypasser for DisabledBypasser {
    fn name(&self) -> &'static str {
        "disabled"
    }

    async fn obtain(&self, _target: &Url) -> std::result::Result<BypassSession, BypassError> {
        Err(BypassError::Disabled)
    }
}

/// Build the strategy selected by a settings snapshot
pub fn bypasser_for(settings: &Settings) -> Result<Arc<dyn Bypasser>> {
    let proxy = HttpTransport::proxy_url(&settings.network);
    let bypasser: Arc<dyn Bypasser> = match settings.bypass.mode {
        BypassMode::Disabled => Arc::new(DisabledBypasser),
        BypassMode::Internal => Arc::new(internal::WebDriverBypasser::new(
            &settings.bypass,
            proxy,
            &settings.network.user_agent,
        )?),
        BypassMode::External => Arc::new(external::SolverBypasser::new(&settings.bypass, proxy)?),
    };
    Ok(bypasser)
}

/// Host of a URL, as used for session scoping
pub(crate) fn host_of(url: &Url) -> std::result::Result<String, BypassError> {
    url.host_str()
        .map(str::to_string)
        .ok_or_else(|| BypassError::Failed(format!("{} has no host", url)))
}
