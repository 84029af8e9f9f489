//! Per-host session cache with coalesced acquisition
//!
//! One table keyed by host. Lookups and updates hold a short synchronous lock;
//! acquisitions run outside it. Concurrent callers for the same host share one
//! pending [`OnceCell`], so only one bypass attempt runs per host and every
//! waiter receives the same result.

use super::{BypassSession, Bypasser, host_of};
use crate::config::{BypassConfig, RetryConfig};
use crate::error::BypassError;
use crate::retry::{IsRetryable, with_retry};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::OnceCell;
use url::Url;

type Acquisition = Arc<OnceCell<Result<Arc<BypassSession>, BypassError>>>;

#[derive(Default)]
struct CacheState {
    sessions: HashMap<String, Arc<BypassSession>>,
    pending: HashMap<String, Acquisition>,
}

/// Shared bypass sessions, one per host
#[derive(Default)]
pub struct SessionCache {
    state: Mutex<CacheState>,
}

impl std::fmt::Debug for SessionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.lock();
        f.debug_struct("SessionCache")
            .field("hosts", &state.sessions.keys().collect::<Vec<_>>())
            .field("pending", &state.pending.len())
            .finish()
    }
}

impl SessionCache {
    /// Create an empty cache
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// A live session for `host`, if one is cached
    pub fn get(&self, host: &str) -> Option<Arc<BypassSession>> {
        let mut state = self.lock();
        match state.sessions.get(host) {
            Some(session) if !session.is_expired() => Some(session.clone()),
            Some(_) => {
                state.sessions.remove(host);
                None
            }
            None => None,
        }
    }

    /// Return the cached session for the target's host or obtain a new one
    ///
    /// Concurrent calls for the same host wait on a single acquisition.
    /// Acquisition is retried up to `config.max_attempts` times, each attempt
    /// bounded by `config.timeout`; a final failure is reported as
    /// [`BypassError::Exhausted`].
    pub async fn acquire(
        &self,
        target: &Url,
        bypasser: &dyn Bypasser,
        config: &BypassConfig,
    ) -> Result<Arc<BypassSession>, BypassError> {
        let host = host_of(target)?;

        let cell = {
            let mut state = self.lock();
            if let Some(session) = state.sessions.get(&host) {
                if !session.is_expired() {
                    return Ok(session.clone());
                }
                tracing::debug!(host = %host, "bypass session expired");
                state.sessions.remove(&host);
            }
            state
                .pending
                .entry(host.clone())
                .or_insert_with(|| Arc::new(OnceCell::new()))
                .clone()
        };

        let result = cell
            .get_or_init(|| obtain_with_retry(&host, target, bypasser, config))
            .await
            .clone();

        let mut state = self.lock();
        if state
            .pending
            .get(&host)
            .is_some_and(|pending| Arc::ptr_eq(pending, &cell))
        {
            state.pending.remove(&host);
            if let Ok(session) = &result {
                state.sessions.insert(host.clone(), session.clone());
            }
        }
        result
    }

    /// Drop `session` if it is still the cached one for its host
    ///
    /// A session replaced by a newer acquisition is left alone, so a stale
    /// failure report cannot evict a fresh session. Returns whether anything
    /// was removed.
    pub fn invalidate(&self, session: &Arc<BypassSession>) -> bool {
        let mut state = self.lock();
        let current = state
            .sessions
            .get(&session.host)
            .is_some_and(|cached| Arc::ptr_eq(cached, session));
        if current {
            state.sessions.remove(&session.host);
            tracing::info!(host = %session.host, "bypass session invalidated");
        }
        current
    }

    /// Number of cached sessions
    pub fn len(&self) -> usize {
        self.lock().sessions.len()
    }

    /// Whether no sessions are cached
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

async fn obtain_with_retry(
    host: &str,
    target: &Url,
    bypasser: &dyn Bypasser,
    config: &BypassConfig,
) -> Result<Arc<BypassSession>, BypassError> {
    let attempts = config.max_attempts.max(1);
    let policy = RetryConfig {
        max_attempts: attempts - 1,
        initial_delay: Duration::from_secs(1),
        max_delay: Duration::from_secs(10),
        backoff_multiplier: 2.0,
        jitter: true,
        switch_source_delay: Duration::ZERO,
    };

    tracing::info!(host, strategy = bypasser.name(), "obtaining bypass session");

    let result = with_retry(&policy, || async {
        match tokio::time::timeout(config.timeout, bypasser.obtain(target)).await {
            Ok(result) => result,
            Err(_) => Err(BypassError::Timeout(config.timeout)),
        }
    })
    .await;

    match result {
        Ok(mut session) => {
            // Sessions are scoped to the host that was challenged
            session.host = host.to_string();
            tracing::info!(host, cookies = session.cookies.len(), "bypass session obtained");
            Ok(Arc::new(session))
        }
        Err(BypassError::Disabled) => Err(BypassError::Disabled),
        Err(e) => {
            let attempts = if e.is_retryable() { attempts } else { 1 };
            Err(BypassError::Exhausted {
                host: host.to_string(),
                attempts,
                last: e.to_string(),
            })
        }
    }
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Instant;

    struct CountingBypasser {
        calls: AtomicU32,
        delay: Duration,
        fail_first: u32,
    }

    impl CountingBypasser {
        fn new(delay: Duration, fail_first: u32) -> Self {
            Self {
                calls: AtomicU32::new(0),
                delay,
                fail_first,
            }
        }
    }

    #[async_trait]
    impl Bypasser for CountingBypasser {
        fn name(&self) -> &'static str {
            "counting"
        }

        async fn obtain(&self, target: &Url) -> Result<BypassSession, BypassError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            if n < self.fail_first {
                return Err(BypassError::Failed("still challenged".into()));
            }
            Ok(BypassSession {
                host: target.host_str().unwrap().to_string(),
                cookies: vec![("cf_clearance".into(), format!("token-{n}"))],
                user_agent: Some("UA".into()),
                headers: vec![],
                final_url: None,
                expires_at: Instant::now() + Duration::from_secs(600),
            })
        }
    }

    fn config(max_attempts: u32) -> BypassConfig {
        BypassConfig {
            timeout: Duration::from_secs(5),
            max_attempts,
            ..BypassConfig::default()
        }
    }

    #[tokio::test]
    async fn concurrent_requests_for_one_host_are_coalesced() {
        let cache = Arc::new(SessionCache::new());
        let bypasser = Arc::new(CountingBypasser::new(Duration::from_millis(100), 0));
        let url = Url::parse("https://books.example/file").unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let cache = cache.clone();
            let bypasser = bypasser.clone();
            let url = url.clone();
            handles.push(tokio::spawn(async move {
                cache
                    .acquire(&url, bypasser.as_ref(), &config(2))
                    .await
                    .unwrap()
            }));
        }

        let mut sessions = Vec::new();
        for handle in handles {
            sessions.push(handle.await.unwrap());
        }

        assert_eq!(bypasser.calls.load(Ordering::SeqCst), 1);
        assert!(sessions.windows(2).all(|w| Arc::ptr_eq(&w[0], &w[1])));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn sessions_are_scoped_per_host() {
        let cache = SessionCache::new();
        let bypasser = CountingBypasser::new(Duration::ZERO, 0);

        let a = cache
            .acquire(
                &Url::parse("https://a.example/").unwrap(),
                &bypasser,
                &config(1),
            )
            .await
            .unwrap();
        let b = cache
            .acquire(
                &Url::parse("https://b.example/").unwrap(),
                &bypasser,
                &config(1),
            )
            .await
            .unwrap();

        assert_eq!(a.host, "a.example");
        assert_eq!(b.host, "b.example");
        assert_eq!(bypasser.calls.load(Ordering::SeqCst), 2);
        assert!(cache.get("c.example").is_none());
    }

    #[tokio::test]
    async fn invalidation_forces_reacquisition() {
        let cache = SessionCache::new();
        let bypasser = CountingBypasser::new(Duration::ZERO, 0);
        let url = Url::parse("https://books.example/").unwrap();

        let first = cache.acquire(&url, &bypasser, &config(1)).await.unwrap();
        let again = cache.acquire(&url, &bypasser, &config(1)).await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        assert!(cache.invalidate(&first));
        assert!(!cache.invalidate(&first), "second invalidation is a no-op");

        let fresh = cache.acquire(&url, &bypasser, &config(1)).await.unwrap();
        assert!(!Arc::ptr_eq(&first, &fresh));
        assert_eq!(bypasser.calls.load(Ordering::SeqCst), 2);

        // A stale report about the old session leaves the new one in place
        assert!(!cache.invalidate(&first));
        assert!(cache.get("books.example").is_some());
    }

    #[tokio::test]
    async fn failures_are_retried_then_reported_as_exhausted() {
        let cache = SessionCache::new();
        let url = Url::parse("https://books.example/").unwrap();

        let flaky = CountingBypasser::new(Duration::ZERO, 1);
        cache.acquire(&url, &flaky, &config(2)).await.unwrap();
        assert_eq!(flaky.calls.load(Ordering::SeqCst), 2);

        let cache = SessionCache::new();
        let broken = CountingBypasser::new(Duration::ZERO, u32::MAX);
        match cache.acquire(&url, &broken, &config(2)).await {
            Err(BypassError::Exhausted { host, attempts, .. }) => {
                assert_eq!(host, "books.example");
                assert_eq!(attempts, 2);
            }
            other => panic!("expected exhausted, got {other:?}"),
        }
        assert!(cache.is_empty());

        // The failed acquisition does not linger as pending
        let healthy = CountingBypasser::new(Duration::ZERO, 0);
        cache.acquire(&url, &healthy, &config(1)).await.unwrap();
    }

    #[tokio::test]
    async fn slow_strategy_times_out() {
        let cache = SessionCache::new();
        let slow = CountingBypasser::new(Duration::from_secs(10), 0);
        let url = Url::parse("https://books.example/").unwrap();
        let cfg = BypassConfig {
            timeout: Duration::from_millis(50),
            max_attempts: 1,
            ..BypassConfig::default()
        };

        match cache.acquire(&url, &slow, &cfg).await {
            Err(BypassError::Exhausted { last, .. }) => assert!(last.contains("timed out")),
            other => panic!("expected exhausted, got {other:?}"),
        }
    }
}
