//! Headless browser bypass over the W3C WebDriver protocol
//!
//! Starts a browser session on a WebDriver endpoint (chromedriver or a
//! Selenium grid), loads the challenged page and waits until the challenge
//! markers disappear. Then it collects the cookies, user agent and final URL.
//! The browser session is always deleted, including when the caller gives up
//! and drops the future.

use super::{BypassSession, Bypasser, host_of};
use crate::config::BypassConfig;
use crate::error::{BypassError, Result};
use crate::network::classify;
use async_trait::async_trait;
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use std::time::{Duration, Instant};
use url::Url;

/// Interval between challenge checks
const POLL_INTERVAL: Duration = Duration::from_millis(750);

#[derive(Debug, Deserialize)]
struct Envelope<T> {
    value: T,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct NewSession {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct WebDriverFailure {
    error: String,
    #[serde(default)]
    message: String,
}

#[derive(Debug, Deserialize)]
struct BrowserCookie {
    name: String,
    value: String,
}

/// Challenge solving with a WebDriver-controlled headless browser
#[derive(Debug)]
pub struct WebDriverBypasser {
    client: reqwest::Client,
    endpoint: Url,
    timeout: Duration,
    session_ttl: Duration,
    proxy: Option<String>,
    user_agent: String,
}

impl WebDriverBypasser {
    /// Build from bypass settings; the browser is routed through `proxy`
    pub fn new(config: &BypassConfig, proxy: Option<String>, user_agent: &str) -> Result<Self> {
        let mut endpoint = Url::parse(&config.webdriver_url)?;
        if !endpoint.path().ends_with('/') {
            let path = format!("{}/", endpoint.path());
            endpoint.set_path(&path);
        }
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .no_proxy()
            .build()?;

        Ok(Self {
            client,
            endpoint,
            timeout: config.timeout,
            session_ttl: config.session_ttl,
            proxy,
            user_agent: user_agent.to_string(),
        })
    }

    fn capabilities(&self) -> Value {
        let mut args = vec![
            "--headless=new".to_string(),
            "--no-sandbox".to_string(),
            "--disable-gpu".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--window-size=1920,1080".to_string(),
            format!("--user-agent={}", self.user_agent),
        ];
        if let Some(proxy) = &self.proxy {
            // Chrome resolves names through SOCKS5 proxies already and rejects socks5h
            args.push(format!("--proxy-server={}", proxy.replacen("socks5h://", "socks5://", 1)));
        }
        json!({
            "capabilities": {
                "alwaysMatch": {
                    "browserName": "chrome",
                    "pageLoadStrategy": "eager",
                    "goog:chromeOptions": { "args": args }
                }
            }
        })
    }

    fn url(&self, path: &str) -> std::result::Result<Url, BypassError> {
        self.endpoint
            .join(path)
            .map_err(|e| BypassError::Failed(format!("invalid WebDriver path {}: {}", path, e)))
    }

    async fn call<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<Value>,
    ) -> std::result::Result<T, BypassError> {
        let mut request = self.client.request(method, self.url(path)?);
        if let Some(body) = body {
            request = request.json(&body);
        }
        let response = request
            .send()
            .await
            .map_err(|e| BypassError::Unreachable(e.to_string()))?;

        let status = response.status();
        let bytes = response
            .bytes()
            .await
            .map_err(|e| BypassError::Unreachable(e.to_string()))?;

        if !status.is_success() {
            let reason = serde_json::from_slice::<Envelope<WebDriverFailure>>(&bytes)
                .map(|f| format!("{}: {}", f.value.error, f.value.message))
                .unwrap_or_else(|_| format!("HTTP {}", status));
            return Err(BypassError::Failed(format!("WebDriver {} failed: {}", path, reason)));
        }

        serde_json::from_slice::<Envelope<T>>(&bytes)
            .map(|e| e.value)
            .map_err(|e| BypassError::Failed(format!("unexpected WebDriver reply to {}: {}", path, e)))
    }

    async fn solve(&self, session_id: &str, target: &Url) -> std::result::Result<BypassSession, BypassError> {
        let host = host_of(target)?;
        let base = format!("session/{}", session_id);

        self.call::<Value>(
            reqwest::Method::POST,
            &format!("{}/url", base),
            Some(json!({ "url": target.as_str() })),
        )
        .await?;

        // Leave headroom inside the cache's own timeout for cleanup
        let deadline = Instant::now() + self.timeout.mul_f32(0.9);
        loop {
            let title: String = self
                .call(reqwest::Method::GET, &format!("{}/title", base), None)
                .await?;
            let source: String = self
                .call(reqwest::Method::GET, &format!("{}/source", base), None)
                .await?;

            let page = format!("<title>{}</title>{}", title, source);
            if !classify::challenge_in_body(&page, false) {
                break;
            }
            if Instant::now() >= deadline {
                return Err(BypassError::Failed(format!(
                    "challenge on {} still present after {:?}",
                    host, self.timeout
                )));
            }
            tracing::trace!(host = %host, title = %title, "challenge still present");
            tokio::time::sleep(POLL_INTERVAL).await;
        }

        let cookies: Vec<BrowserCookie> = self
            .call(reqwest::Method::GET, &format!("{}/cookie", base), None)
            .await?;
        let user_agent: String = self
            .call(
                reqwest::Method::POST,
                &format!("{}/execute/sync", base),
                Some(json!({ "script": "return navigator.userAgent", "args": [] })),
            )
            .await?;
        let final_url: String = self
            .call(reqwest::Method::GET, &format!("{}/url", base), None)
            .await?;

        Ok(BypassSession {
            host,
            cookies: cookies.into_iter().map(|c| (c.name, c.value)).collect(),
            user_agent: Some(user_agent),
            headers: Vec::new(),
            final_url: Url::parse(&final_url).ok(),
            expires_at: Instant::now() + self.session_ttl,
        })
    }
}

/// Deletes the browser session when dropped unless already deleted
struct BrowserSession {
    client: reqwest::Client,
    url: Option<Url>,
}

impl BrowserSession {
    async fn close(mut self) {
        if let Some(url) = self.url.take()
            && let Err(e) = self.client.delete(url).send().await
        {
            tracing::warn!(error = %e, "failed to delete WebDriver session");
        }
    }
}

impl Drop for BrowserSession {
    fn drop(&mut self) {
        let Some(url) = self.url.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            let client = self.client.clone();
            handle.spawn(async move {
                let _ = client.delete(url).send().await;
            });
        }
    }
}

#[async_trait]
impl Bypasser for WebDriverBypasser {
    fn name(&self) -> &'static str {
        "webdriver"
    }

    async fn obtain(&self, target: &Url) -> std::result::Result<BypassSession, BypassError> {
        let created: NewSession = self
            .call(reqwest::Method::POST, "session", Some(self.capabilities()))
            .await?;
        tracing::debug!(session = %created.session_id, target = %target, "browser session started");

        let guard = BrowserSession {
            client: self.client.clone(),
            url: Some(self.url(&format!("session/{}", created.session_id))?),
        };

        let result = self.solve(&created.session_id, target).await;
        guard.close().await;
        result
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, Request, Respond, ResponseTemplate};

    /// Serves a challenge for the first `challenged` source reads, then the real page
    struct SourceSequence {
        reads: Arc<AtomicU32>,
        challenged: u32,
    }

    impl Respond for SourceSequence {
        fn respond(&self, _request: &Request) -> ResponseTemplate {
            let n = self.reads.fetch_add(1, Ordering::SeqCst);
            let html = if n < self.challenged {
                "<html><script>window._cf_chl_opt={}</script></html>"
            } else {
                "<html><body>library</body></html>"
            };
            ResponseTemplate::new(200).set_body_json(json!({ "value": html }))
        }
    }

    async fn mount_driver(server: &MockServer, challenged: u32) -> Arc<AtomicU32> {
        let reads = Arc::new(AtomicU32::new(0));
        Mock::given(method("POST"))
            .and(path("/session"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": {"sessionId": "s1", "capabilities": {}}
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": null})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/title"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": "Library"})))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/source"))
            .respond_with(SourceSequence {
                reads: reads.clone(),
                challenged,
            })
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/cookie"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [{"name": "cf_clearance", "value": "browser-token", "path": "/"}]
            })))
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/session/s1/execute/sync"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(json!({"value": "Mozilla/5.0 Headless"})),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path("/session/s1/url"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": "https://books.example/md5/abc"
            })))
            .mount(server)
            .await;
        Mock::given(method("DELETE"))
            .and(path("/session/s1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"value": null})))
            .expect(1)
            .mount(server)
            .await;
        reads
    }

    fn bypasser(endpoint: &str, timeout: Duration) -> WebDriverBypasser {
        WebDriverBypasser::new(
            &BypassConfig {
                webdriver_url: endpoint.to_string(),
                timeout,
                ..BypassConfig::default()
            },
            Some("socks5h://127.0.0.1:9050".into()),
            "Mozilla/5.0 Test",
        )
        .unwrap()
    }

    #[tokio::test]
    async fn waits_for_challenge_to_clear_then_collects_cookies() {
        let driver = MockServer::start().await;
        let reads = mount_driver(&driver, 2).await;

        let session = bypasser(&driver.uri(), Duration::from_secs(20))
            .obtain(&Url::parse("https://books.example/md5/abc").unwrap())
            .await
            .unwrap();

        assert_eq!(reads.load(Ordering::SeqCst), 3);
        assert_eq!(session.host, "books.example");
        assert_eq!(session.cookie_header().as_deref(), Some("cf_clearance=browser-token"));
        assert_eq!(session.user_agent.as_deref(), Some("Mozilla/5.0 Headless"));
        assert_eq!(
            session.final_url.unwrap().as_str(),
            "https://books.example/md5/abc"
        );
    }

    #[tokio::test]
    async fn persistent_challenge_fails_and_still_deletes_session() {
        let driver = MockServer::start().await;
        mount_driver(&driver, u32::MAX).await;

        let result = bypasser(&driver.uri(), Duration::from_millis(500))
            .obtain(&Url::parse("https://books.example/").unwrap())
            .await;
        assert!(matches!(result, Err(BypassError::Failed(_))));
        // DELETE expectation (exactly once) is verified when the server drops
    }

    #[test]
    fn socks5h_is_rewritten_for_the_browser() {
        let b = bypasser("http://127.0.0.1:9515", Duration::from_secs(1));
        let caps = b.capabilities();
        let args = caps["capabilities"]["alwaysMatch"]["goog:chromeOptions"]["args"]
            .as_array()
            .unwrap();
        assert!(
            args.iter()
                .any(|a| a == "--proxy-server=socks5://127.0.0.1:9050")
        );
    }
}
