//! Delegation to an external challenge-solver service
//!
//! Speaks the FlareSolverr-style JSON protocol: `POST {endpoint}/v1` with
//! `{"cmd": "request.get", "url": ..., "maxTimeout": ms}` and a response carrying
//! `status` plus a `solution` with cookies and the user agent used.

use super::{BypassSession, Bypasser, host_of};
use crate::config::BypassConfig;
use crate::error::{BypassError, Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use url::Url;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct SolveRequest<'a> {
    cmd: &'static str,
    url: &'a str,
    max_timeout: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxy: Option<SolverProxy<'a>>,
}

#[derive(Debug, Serialize)]
struct SolverProxy<'a> {
    url: &'a str,
}

#[derive(Debug, Deserialize)]
struct SolveResponse {
    status: String,
    #[serde(default)]
    message: String,
    solution: Option<Solution>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Solution {
    url: Option<String>,
    #[serde(default)]
    status: Option<u16>,
    #[serde(default)]
    cookies: Vec<SolverCookie>,
    user_agent: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SolverCookie {
    name: String,
    value: String,
}

/// Challenge solving through an external service
#[derive(Debug)]
pub struct SolverBypasser {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    session_ttl: Duration,
    proxy: Option<String>,
}

impl SolverBypasser {
    /// Build from bypass settings; `proxy` is forwarded so the solver exits
    /// through the same route as downloads
    pub fn new(config: &BypassConfig, proxy: Option<String>) -> Result<Self> {
        let raw = config.external_url.as_deref().ok_or_else(|| Error::Config {
            message: "external bypass mode requires external_url".to_string(),
            key: Some("bypass.external_url".to_string()),
        })?;
        let base = Url::parse(raw)?;
        let endpoint = base.join("v1")?;

        // The solver is a local service; allow it a little longer than its own budget
        let client = reqwest::Client::builder()
            .timeout(config.timeout + Duration::from_secs(5))
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            endpoint,
            timeout: config.timeout,
            session_ttl: config.session_ttl,
            proxy,
        })
    }
}

#[async_trait]
impl Bypasser for SolverBypasser {
    fn name(&self) -> &'static str {
        "solver"
    }

    async fn obtain(&self, target: &Url) -> std::result::Result<BypassSession, BypassError> {
        let host = host_of(target)?;
        let request = SolveRequest {
            cmd: "request.get",
            url: target.as_str(),
            max_timeout: u64::try_from(self.timeout.as_millis()).unwrap_or(u64::MAX),
            proxy: self.proxy.as_deref().map(|url| SolverProxy { url }),
        };

        tracing::debug!(endpoint = %self.endpoint, host = %host, "requesting challenge solution");

        let response = self
            .client
            .post(self.endpoint.clone())
            .json(&request)
            .send()
            .await
            .map_err(|e| BypassError::Unreachable(e.to_string()))?;

        let http_status = response.status();
        let body: SolveResponse = response.json().await.map_err(|e| {
            BypassError::Failed(format!("unreadable solver response (HTTP {}): {}", http_status, e))
        })?;

        if body.status != "ok" {
            return Err(BypassError::Failed(if body.message.is_empty() {
                format!("solver returned status '{}'", body.status)
            } else {
                body.message
            }));
        }

        let solution = body
            .solution
            .ok_or_else(|| BypassError::Failed("solver response has no solution".to_string()))?;

        if let Some(status) = solution.status
            && status >= 400
        {
            return Err(BypassError::Failed(format!(
                "solver reached {} but it answered HTTP {}",
                host, status
            )));
        }

        Ok(BypassSession {
            host,
            cookies: solution
                .cookies
                .into_iter()
                .map(|c| (c.name, c.value))
                .collect(),
            user_agent: solution.user_agent,
            headers: Vec::new(),
            final_url: solution.url.and_then(|u| Url::parse(&u).ok()),
            expires_at: Instant::now() + self.session_ttl,
        })
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn config(endpoint: &str) -> BypassConfig {
        BypassConfig {
            external_url: Some(endpoint.to_string()),
            timeout: Duration::from_secs(10),
            ..BypassConfig::default()
        }
    }

    #[tokio::test]
    async fn solved_challenge_becomes_session() {
        let solver = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .and(body_partial_json(serde_json::json!({
                "cmd": "request.get",
                "url": "https://books.example/md5/abc",
                "maxTimeout": 10000,
                "proxy": {"url": "socks5h://127.0.0.1:9050"}
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "status": "ok",
                "message": "Challenge solved!",
                "solution": {
                    "url": "https://books.example/md5/abc",
                    "status": 200,
                    "cookies": [
                        {"name": "cf_clearance", "value": "token", "domain": ".books.example"}
                    ],
                    "userAgent": "Mozilla/5.0 Solver"
                }
            })))
            .expect(1)
            .mount(&solver)
            .await;

        let bypasser = SolverBypasser::new(
            &config(&solver.uri()),
            Some("socks5h://127.0.0.1:9050".into()),
        )
        .unwrap();
        let session = bypasser
            .obtain(&Url::parse("https://books.example/md5/abc").unwrap())
            .await
            .unwrap();

        assert_eq!(session.host, "books.example");
        assert_eq!(session.cookie_header().as_deref(), Some("cf_clearance=token"));
        assert_eq!(session.user_agent.as_deref(), Some("Mozilla/5.0 Solver"));
        assert!(!session.is_expired());
    }

    #[tokio::test]
    async fn solver_error_is_reported() {
        let solver = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/v1"))
            .respond_with(ResponseTemplate::new(500).set_body_json(serde_json::json!({
                "status": "error",
                "message": "Error solving the challenge. Timeout after 10.0 seconds."
            })))
            .mount(&solver)
            .await;

        let bypasser = SolverBypasser::new(&config(&solver.uri()), None).unwrap();
        match bypasser
            .obtain(&Url::parse("https://books.example/").unwrap())
            .await
        {
            Err(BypassError::Failed(msg)) => assert!(msg.contains("Timeout after")),
            other => panic!("expected failure, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn unreachable_solver() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let bypasser =
            SolverBypasser::new(&config(&format!("http://127.0.0.1:{port}")), None).unwrap();
        assert!(matches!(
            bypasser
                .obtain(&Url::parse("https://books.example/").unwrap())
                .await,
            Err(BypassError::Unreachable(_))
        ));
    }

    #[test]
    fn missing_endpoint_is_a_config_error() {
        let err = SolverBypasser::new(&BypassConfig::default(), None).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
    }
}
