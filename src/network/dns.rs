//! Alternate address discovery for DNS rotation
//!
//! When the first connection attempt fails at DNS or connect time, the transport
//! asks for alternates: the system resolver's full answer first, then each
//! configured DNS-over-HTTPS endpoint in order (JSON API, `application/dns-json`).

use serde::Deserialize;
use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

/// DNS record types we ask DoH endpoints for
const RECORD_TYPES: [(&str, u16); 2] = [("A", 1), ("AAAA", 28)];

#[derive(Debug, Deserialize)]
struct DohResponse {
    #[serde(rename = "Status", default)]
    status: u32,
    #[serde(rename = "Answer", default)]
    answer: Vec<DohAnswer>,
}

#[derive(Debug, Deserialize)]
struct DohAnswer {
    #[serde(rename = "type")]
    record_type: u16,
    data: String,
}

/// Resolves alternate addresses for a host
#[derive(Clone, Debug)]
pub struct AlternateResolver {
    client: reqwest::Client,
    doh_resolvers: Vec<String>,
}

impl AlternateResolver {
    /// Resolver over the given DoH endpoints; `timeout` bounds each DoH query
    pub fn new(doh_resolvers: Vec<String>, timeout: Duration) -> crate::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .no_proxy()
            .build()?;
        Ok(Self {
            client,
            doh_resolvers,
        })
    }

    /// Candidate addresses for `host`, system answers first, deduplicated
    ///
    /// Returns an empty list for IP literals: there is nothing to rotate.
    pub async fn alternates(&self, host: &str, port: u16) -> Vec<SocketAddr> {
        if host.parse::<IpAddr>().is_ok() {
            return Vec::new();
        }

        let mut found: Vec<SocketAddr> = Vec::new();
        match tokio::net::lookup_host((host, port)).await {
            Ok(addrs) => {
                for addr in addrs {
                    if !found.contains(&addr) {
                        found.push(addr);
                    }
                }
            }
            Err(e) => {
                tracing::debug!(host = %host, error = %e, "system resolver failed");
            }
        }

        for resolver in &self.doh_resolvers {
            let ips = self.query_doh(resolver, host).await;
            if ips.is_empty() {
                continue;
            }
            for ip in ips {
                let addr = SocketAddr::new(ip, port);
                if !found.contains(&addr) {
                    found.push(addr);
                }
            }
            // One answering DoH endpoint is enough
            break;
        }

        found
    }

    async fn query_doh(&self, resolver: &str, host: &str) -> Vec<IpAddr> {
        let mut ips = Vec::new();
        for (name, code) in RECORD_TYPES {
            let response = self
                .client
                .get(resolver)
                .query(&[("name", host), ("type", name)])
                .header(reqwest::header::ACCEPT, "application/dns-json")
                .send()
                .await;

            let parsed = match response {
                Ok(resp) if resp.status().is_success() => resp.json::<DohResponse>().await,
                Ok(resp) => {
                    tracing::debug!(resolver, status = %resp.status(), "DoH query rejected");
                    continue;
                }
                Err(e) => {
                    tracing::debug!(resolver, error = %e, "DoH query failed");
                    continue;
                }
            };

            match parsed {
                Ok(body) if body.status == 0 => {
                    ips.extend(
                        body.answer
                            .iter()
                            .filter(|a| a.record_type == code)
                            .filter_map(|a| a.data.parse::<IpAddr>().ok()),
                    );
                }
                Ok(body) => {
                    tracing::debug!(resolver, rcode = body.status, host, "DoH lookup unsuccessful");
                }
                Err(e) => {
                    tracing::debug!(resolver, error = %e, "malformed DoH answer");
                }
            }
        }
        ips
    }
}
