//! Failure classification for HTTP responses and transport errors
//!
//! Everything the network layer reports upward is reduced to a [`FailureKind`].
//! Status codes go through a per-adapter [`StatusPolicy`]; bot-protection
//! challenges are recognized from headers and page markers.

use crate::error::{FailureKind, FetchError};
use reqwest::StatusCode;
use reqwest::header::{CONTENT_TYPE, HeaderMap, SERVER};
use std::collections::HashMap;

/// Markers only a challenge interstitial carries; safe to test on 2xx pages
const CHALLENGE_MARKERS: &[&str] = &[
    "<title>just a moment",
    "cf_chl_opt",
    "checking your browser before accessing",
    "ddos-guard/js-challenge",
];

/// Markers that also appear in normal pages; only trusted on 403/429/503
const ERROR_PAGE_MARKERS: &[&str] = &[
    "just a moment",
    "cf-browser-verification",
    "challenge-platform",
    "ddos-guard",
];

/// HTTP status classification for one adapter
///
/// Defaults: 404/410/451 and other 4xx are permanent, 401/403 permanent unless a
/// challenge is detected, 408/425/429 and 5xx transient. Overrides win over
/// everything, including challenge detection.
#[derive(Clone, Debug, Default)]
pub struct StatusPolicy {
    overrides: HashMap<u16, FailureKind>,
}

impl StatusPolicy {
    /// Policy with per-status overrides keyed by status code strings
    ///
    /// Keys that are not status codes are ignored here; settings validation
    /// rejects them up front.
    pub fn new(overrides: &HashMap<String, FailureKind>) -> Self {
        Self {
            overrides: overrides
                .iter()
                .filter_map(|(code, kind)| code.trim().parse::<u16>().ok().map(|c| (c, *kind)))
                .collect(),
        }
    }

    /// Classify an unsuccessful status. `challenge` reports whether challenge
    /// markers were found on the response.
    pub fn classify(&self, status: StatusCode, challenge: bool) -> FailureKind {
        if let Some(kind) = self.overrides.get(&status.as_u16()) {
            return *kind;
        }
        if challenge {
            return FailureKind::BypassRequired;
        }
        match status.as_u16() {
            408 | 425 | 429 => FailureKind::Transient,
            500..=599 => FailureKind::Transient,
            _ => FailureKind::Permanent,
        }
    }
}

/// Whether the headers alone identify a challenge response
pub fn challenge_in_headers(status: StatusCode, headers: &HeaderMap) -> bool {
    if headers
        .get("cf-mitigated")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("challenge"))
    {
        return true;
    }
    let ddos_guard = headers
        .get(SERVER)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().contains("ddos-guard"));
    ddos_guard && matches!(status.as_u16(), 403 | 429 | 503)
}

/// Whether a page body looks like a challenge interstitial
///
/// `error_status` enables the weaker markers that are only meaningful on
/// 403/429/503 responses.
pub fn challenge_in_body(body: &str, error_status: bool) -> bool {
    let lower = body.to_lowercase();
    CHALLENGE_MARKERS.iter().any(|m| lower.contains(m))
        || (error_status && ERROR_PAGE_MARKERS.iter().any(|m| lower.contains(m)))
}

/// Whether a status can carry a challenge page
pub fn may_carry_challenge(status: StatusCode) -> bool {
    matches!(status.as_u16(), 403 | 429 | 503)
}

/// Whether the response declares an HTML body
pub fn is_html(headers: &HeaderMap) -> bool {
    headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.to_ascii_lowercase().starts_with("text/html"))
}

/// Turn a non-success response into a classified failure, reading the body when
/// it may hold challenge markers
pub async fn failure_from_response(response: reqwest::Response, policy: &StatusPolicy) -> FetchError {
    let status = response.status();
    let url = response.url().clone();
    let mut challenge = challenge_in_headers(status, response.headers());
    if !challenge && may_carry_challenge(status) {
        let body = response.text().await.unwrap_or_default();
        challenge = challenge_in_body(&body, true);
    }

    let kind = policy.classify(status, challenge);
    let message = if challenge {
        format!("HTTP {} challenge from {}", status.as_u16(), host_of(&url))
    } else {
        format!("HTTP {} from {}", status.as_u16(), host_of(&url))
    };
    FetchError::Classified { kind, message }
}

/// Classify a transport error from reqwest
pub fn classify_reqwest_error(e: &reqwest::Error) -> FetchError {
    if e.is_builder() || e.is_redirect() {
        return FetchError::permanent(e.to_string());
    }
    if e.is_timeout() {
        return FetchError::transient(format!("timed out: {}", e));
    }
    if e.is_connect() {
        return FetchError::transient(format!("connection failed: {}", e));
    }
    // Resets mid-body, decode failures and everything else are worth another try
    FetchError::transient(e.to_string())
}

/// Whether a failure happened before any response and another address or mirror may help
pub fn is_connection_level(e: &reqwest::Error) -> bool {
    e.is_connect() || (e.is_timeout() && e.status().is_none())
}

fn host_of(url: &url::Url) -> String {
    url.host_str().unwrap_or("unknown host").to_string()
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn default_status_table() {
        let policy = StatusPolicy::default();
        assert_eq!(policy.classify(StatusCode::NOT_FOUND, false), FailureKind::Permanent);
        assert_eq!(policy.classify(StatusCode::GONE, false), FailureKind::Permanent);
        assert_eq!(policy.classify(StatusCode::FORBIDDEN, false), FailureKind::Permanent);
        assert_eq!(
            policy.classify(StatusCode::TOO_MANY_REQUESTS, false),
            FailureKind::Transient
        );
        assert_eq!(
            policy.classify(StatusCode::BAD_GATEWAY, false),
            FailureKind::Transient
        );
        assert_eq!(
            policy.classify(StatusCode::FORBIDDEN, true),
            FailureKind::BypassRequired
        );
    }

    #[test]
    fn overrides_take_precedence() {
        let mut overrides = HashMap::new();
        overrides.insert("403".to_string(), FailureKind::Transient);
        overrides.insert("503".to_string(), FailureKind::Permanent);
        overrides.insert("nope".to_string(), FailureKind::Transient);
        let policy = StatusPolicy::new(&overrides);

        assert_eq!(policy.classify(StatusCode::FORBIDDEN, true), FailureKind::Transient);
        assert_eq!(
            policy.classify(StatusCode::SERVICE_UNAVAILABLE, false),
            FailureKind::Permanent
        );
        assert_eq!(policy.classify(StatusCode::NOT_FOUND, false), FailureKind::Permanent);
    }

    #[test]
    fn header_challenge_detection() {
        let mut headers = HeaderMap::new();
        headers.insert("cf-mitigated", HeaderValue::from_static("challenge"));
        assert!(challenge_in_headers(StatusCode::OK, &headers));

        let mut headers = HeaderMap::new();
        headers.insert(SERVER, HeaderValue::from_static("ddos-guard"));
        assert!(challenge_in_headers(StatusCode::FORBIDDEN, &headers));
        assert!(!challenge_in_headers(StatusCode::OK, &headers));
    }

    #[test]
    fn body_markers_respect_status() {
        let interstitial = "<html><head><title>Just a moment...</title></head></html>";
        assert!(challenge_in_body(interstitial, false));

        // Normal pages load challenge-platform scripts too
        let normal = "<script src=\"/cdn-cgi/challenge-platform/scripts/main.js\"></script>";
        assert!(!challenge_in_body(normal, false));
        assert!(challenge_in_body(normal, true));
    }

    #[tokio::test]
    async fn challenge_page_classified_as_bypass_required() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/file"))
            .respond_with(
                ResponseTemplate::new(503)
                    .set_body_string("<div id=\"cf-browser-verification\">checking</div>"),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/gone"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let policy = StatusPolicy::default();
        let resp = reqwest::get(format!("{}/file", server.uri())).await.unwrap();
        let err = failure_from_response(resp, &policy).await;
        assert_eq!(err.kind(), Some(FailureKind::BypassRequired));

        let resp = reqwest::get(format!("{}/gone", server.uri())).await.unwrap();
        let err = failure_from_response(resp, &policy).await;
        assert_eq!(err.kind(), Some(FailureKind::Permanent));
        assert!(err.to_string().contains("404"));
    }

    #[tokio::test]
    async fn refused_connection_is_transient_and_connection_level() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = reqwest::get(format!("http://127.0.0.1:{port}/"))
            .await
            .unwrap_err();
        assert!(is_connection_level(&err));
        assert_eq!(
            classify_reqwest_error(&err).kind(),
            Some(FailureKind::Transient)
        );
    }
}
