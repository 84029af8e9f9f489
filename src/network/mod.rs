//! Network resilience layer
//!
//! [`HttpTransport`] owns the outbound HTTP client for one settings snapshot:
//! every request goes through the configured proxy mode (direct, HTTP, SOCKS5 or
//! Tor), connection failures are retried against alternate addresses (DNS
//! rotation), and failures are reported upward as classified [`FetchError`]s.
//! Transfers with resume and mirror failover live in [`fetch`].

pub mod classify;
pub mod dns;
pub mod fetch;

pub use classify::StatusPolicy;
pub use fetch::{FetchOutcome, FetchTarget};

use crate::bypass::BypassSession;
use crate::config::{NetworkConfig, ProxyMode};
use crate::error::{FetchError, Result};
use dns::AlternateResolver;
use reqwest::{Client, ClientBuilder, RequestBuilder, Response};
use url::Url;

/// A fetched HTML page
#[derive(Clone, Debug)]
pub struct Page {
    /// URL after redirects
    pub url: Url,
    /// Page body
    pub body: String,
}

/// HTTP transport bound to one network configuration
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: Client,
    config: NetworkConfig,
    /// None when traffic is proxied or rotation is disabled
    resolver: Option<AlternateResolver>,
}

impl HttpTransport {
    /// Build the transport for a network configuration
    pub fn new(config: &NetworkConfig) -> Result<Self> {
        let client = Self::client_builder(config)?.build()?;

        let proxied = !matches!(config.proxy, ProxyMode::Direct);
        let resolver = if config.dns_rotation && !proxied {
            Some(AlternateResolver::new(
                config.doh_resolvers.clone(),
                config.connect_timeout,
            )?)
        } else {
            None
        };

        tracing::debug!(
            proxy = ?config.proxy,
            dns_rotation = resolver.is_some(),
            "HTTP transport ready"
        );

        Ok(Self {
            client,
            config: config.clone(),
            resolver,
        })
    }

    /// Proxy URL all traffic is routed through, if any
    ///
    /// Tor uses `socks5h` so host names are resolved inside the circuit.
    pub fn proxy_url(config: &NetworkConfig) -> Option<String> {
        match &config.proxy {
            ProxyMode::Direct => None,
            ProxyMode::Http { url } | ProxyMode::Socks5 { url } => Some(url.clone()),
            ProxyMode::Tor { socks_addr } => Some(format!("socks5h://{}", socks_addr)),
        }
    }

    fn client_builder(config: &NetworkConfig) -> Result<ClientBuilder> {
        let mut builder = Client::builder()
            .connect_timeout(config.connect_timeout)
            .user_agent(config.user_agent.clone());

        builder = match Self::proxy_url(config) {
            Some(proxy) => builder.proxy(reqwest::Proxy::all(proxy)?),
            None => builder.no_proxy(),
        };
        Ok(builder)
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Network configuration this transport was built from
    pub fn config(&self) -> &NetworkConfig {
        &self.config
    }

    /// Send a request, rotating through alternate addresses on connection failure
    ///
    /// `build` is called once per attempt with the client to use.
    pub async fn send<F>(&self, url: &Url, build: F) -> std::result::Result<Response, reqwest::Error>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let first = match build(&self.client).send().await {
            Ok(response) => return Ok(response),
            Err(e) => e,
        };

        let (Some(resolver), Some(host)) = (&self.resolver, url.host_str()) else {
            return Err(first);
        };
        if !classify::is_connection_level(&first) {
            return Err(first);
        }
        let Some(port) = url.port_or_known_default() else {
            return Err(first);
        };

        let alternates = resolver.alternates(host, port).await;
        tracing::debug!(
            host,
            alternates = alternates.len(),
            error = %first,
            "connection failed, rotating addresses"
        );

        for addr in alternates {
            let pinned = match Self::client_builder(&self.config)
                .and_then(|b| b.resolve(host, addr).build().map_err(Into::into))
            {
                Ok(client) => client,
                Err(e) => {
                    tracing::warn!(host, %addr, error = %e, "could not build pinned client");
                    continue;
                }
            };

            match build(&pinned).send().await {
                Ok(response) => {
                    tracing::info!(host, %addr, "reached host through alternate address");
                    return Ok(response);
                }
                Err(e) if classify::is_connection_level(&e) => {
                    tracing::debug!(host, %addr, error = %e, "alternate address failed");
                }
                Err(e) => return Err(e),
            }
        }

        Err(first)
    }

    /// Fetch a landing page, classifying errors and challenge interstitials
    pub async fn get_page(
        &self,
        url: &Url,
        session: Option<&BypassSession>,
        policy: &StatusPolicy,
    ) -> std::result::Result<Page, FetchError> {
        let timeout = self.config.request_timeout;
        let response = self
            .send(url, |client| {
                with_session(client.get(url.clone()).timeout(timeout), url, session)
            })
            .await
            .map_err(|e| classify::classify_reqwest_error(&e))?;

        if !response.status().is_success() {
            return Err(classify::failure_from_response(response, policy).await);
        }
        let status = response.status();
        if classify::challenge_in_headers(status, response.headers()) {
            return Err(FetchError::bypass_required(format!(
                "challenge served for {}",
                url
            )));
        }

        let final_url = response.url().clone();
        let body = response
            .text()
            .await
            .map_err(|e| classify::classify_reqwest_error(&e))?;

        if classify::challenge_in_body(&body, false) {
            return Err(FetchError::bypass_required(format!(
                "challenge page served for {}",
                url
            )));
        }

        Ok(Page {
            url: final_url,
            body,
        })
    }
}

/// Attach a bypass session when it belongs to the request's host
pub(crate) fn with_session(
    request: RequestBuilder,
    url: &Url,
    session: Option<&BypassSession>,
) -> RequestBuilder {
    match session {
        Some(session) if url.host_str() == Some(session.host.as_str()) => session.apply(request),
        _ => request,
    }
}
