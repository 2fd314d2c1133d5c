//! The limiter engine: evaluates a limit config against a request.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, error, trace, warn};

use super::request::RequestView;
use super::rules::{Limit, LimitConfig};
use crate::backend::{Backend, LimitMeta, LimitStatus};
use crate::error::{LimiterError, Result};

/// Outcome of one admission check.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LimiterResult {
    /// True when at least one limit was exceeded
    pub limit_applied: bool,
    /// Message of the first exceeded limit, in declaration order
    pub description: String,
    /// Usage of every limit that was checked, in declaration order
    pub per_limit_meta: Vec<LimitMeta>,
}

impl LimiterResult {
    /// A result that admits the request and carries no usage data.
    pub fn admitted() -> Self {
        Self::default()
    }

    /// The limit with the fewest requests left.
    pub fn most_restrictive(&self) -> Option<&LimitMeta> {
        // min_by_key keeps the first of equal elements
        self.per_limit_meta.iter().min_by_key(|m| m.requests_left)
    }

    /// How long a rejected caller should wait: the longest reset among the
    /// exceeded limits.
    pub fn retry_after(&self) -> Option<Duration> {
        self.per_limit_meta
            .iter()
            .filter(|m| m.requests_made > m.max_requests)
            .map(LimitMeta::reset_after)
            .max()
    }
}

/// Checks requests against limit configs using a shared backend.
///
/// The engine holds no mutable state; share it behind an `Arc`. All
/// counters live in the backend.
pub struct LimiterEngine {
    backend: Arc<dyn Backend>,
    fail_open: bool,
    timeout: Option<Duration>,
}

impl LimiterEngine {
    /// Create an engine that fails open and waits on the backend
    /// indefinitely.
    pub fn new(backend: Arc<dyn Backend>) -> Self {
        Self {
            backend,
            fail_open: true,
            timeout: None,
        }
    }

    /// Admit (`true`) or reject (`false`) requests when the backend fails.
    pub fn with_fail_open(mut self, fail_open: bool) -> Self {
        self.fail_open = fail_open;
        self
    }

    /// Bound every backend call.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn backend(&self) -> &Arc<dyn Backend> {
        &self.backend
    }

    pub fn fail_open(&self) -> bool {
        self.fail_open
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Count the request against every limit in `config`.
    ///
    /// Backend failures never surface here: they are logged and resolved by
    /// the fail-open policy.
    pub fn limit<'a>(
        &'a self,
        config: &'a LimitConfig,
        request: &dyn RequestView,
    ) -> impl Future<Output = LimiterResult> + Send + 'a {
        let key = config.final_key(request);
        self.limit_key(config, key)
    }

    /// Like [`limit`](Self::limit) but returns backend failures to the caller.
    pub fn try_limit<'a>(
        &'a self,
        config: &'a LimitConfig,
        request: &dyn RequestView,
    ) -> impl Future<Output = Result<LimiterResult>> + Send + 'a {
        let key = config.final_key(request);
        async move { self.try_limit_key(config, &key).await }
    }

    /// Check a precomputed backend key.
    pub async fn limit_key(&self, config: &LimitConfig, key: String) -> LimiterResult {
        let (result, failure) = self.evaluate(config, &key).await;
        match self.settle(&key, result, failure) {
            Ok(result) => result,
            Err(e) => self.on_backend_failure(&key, e),
        }
    }

    /// Check a precomputed backend key, returning backend failures.
    ///
    /// A backend failure is only returned when no limit reported a
    /// violation; an observed violation always wins.
    pub async fn try_limit_key(&self, config: &LimitConfig, key: &str) -> Result<LimiterResult> {
        let (result, failure) = self.evaluate(config, key).await;
        self.settle(key, result, failure)
    }

    /// Count the request against every limit, even after one is exceeded or
    /// the backend fails on one, so a rejected request still spends quota on
    /// all of them. Returns the first backend failure alongside the result.
    async fn evaluate(
        &self,
        config: &LimitConfig,
        key: &str,
    ) -> (LimiterResult, Option<LimiterError>) {
        trace!(
            config = %config.key(),
            key = %key,
            limits = config.limits().len(),
            "Checking limits"
        );

        let mut result = LimiterResult {
            per_limit_meta: Vec::with_capacity(config.limits().len()),
            ..LimiterResult::default()
        };
        let mut failure = None;

        for limit in config.limits() {
            let status = match self.process(key, limit).await {
                Ok(status) => status,
                Err(e) => {
                    failure.get_or_insert(e);
                    continue;
                }
            };
            if let Some(violation) = status.violation {
                if !result.limit_applied {
                    result.limit_applied = true;
                    result.description = violation;
                }
            }
            result.per_limit_meta.push(status.meta);
        }

        if result.limit_applied {
            debug!(
                key = %key,
                description = %result.description,
                "Request over limit"
            );
        }

        (result, failure)
    }

    fn settle(
        &self,
        key: &str,
        result: LimiterResult,
        failure: Option<LimiterError>,
    ) -> Result<LimiterResult> {
        match failure {
            Some(e) if !result.limit_applied => Err(e),
            Some(e) => {
                warn!(
                    backend = self.backend.name(),
                    key = %key,
                    error = %e,
                    "Backend failed on some limits, keeping observed violation"
                );
                Ok(result)
            }
            None => Ok(result),
        }
    }

    async fn process(&self, key: &str, limit: &Limit) -> Result<LimitStatus> {
        let call = self
            .backend
            .process(key, limit.interval(), limit.max_requests());
        match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, call)
                .await
                .map_err(|_| LimiterError::Timeout(timeout))?,
            None => call.await,
        }
    }

    fn on_backend_failure(&self, key: &str, e: LimiterError) -> LimiterResult {
        error!(
            backend = self.backend.name(),
            key = %key,
            error = %e,
            fail_open = self.fail_open,
            "Rate limiter backend failed"
        );

        if self.fail_open {
            LimiterResult::admitted()
        } else {
            LimiterResult {
                limit_applied: true,
                description: format!("Rate limiter unavailable: {}", e),
                per_limit_meta: Vec::new(),
            }
        }
    }
}

impl std::fmt::Debug for LimiterEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LimiterEngine")
            .field("backend", &self.backend.name())
            .field("fail_open", &self.fail_open)
            .field("timeout", &self.timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::clock::ManualClock;
    use crate::ratelimit::{Interval, RequestInfo, TimeUnit};
    use async_trait::async_trait;
    use std::net::IpAddr;

    const START_MS: u64 = 1_728_000_000_000;

    fn engine() -> (Arc<ManualClock>, Arc<MemoryBackend>, LimiterEngine) {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = Arc::new(MemoryBackend::with_clock(clock.clone()));
        let engine = LimiterEngine::new(backend.clone());
        (clock, backend, engine)
    }

    fn request(host: [u8; 4]) -> RequestInfo {
        RequestInfo::new("POST", "/login").with_remote_addr(IpAddr::from(host))
    }

    struct SlowBackend;

    #[async_trait]
    impl Backend for SlowBackend {
        async fn get_and_increment(&self, _storage_key: &str, _ttl: Duration) -> Result<u64> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(1)
        }

        fn name(&self) -> &'static str {
            "slow"
        }
    }

    struct DownBackend;

    #[async_trait]
    impl Backend for DownBackend {
        async fn get_and_increment(&self, _storage_key: &str, _ttl: Duration) -> Result<u64> {
            Err(LimiterError::BackendUnavailable("connection refused".to_string()))
        }

        fn name(&self) -> &'static str {
            "down"
        }
    }

    /// Memory store that fails for counters of one window width.
    struct FlakyWindowBackend {
        inner: MemoryBackend,
        failing_window: String,
    }

    impl FlakyWindowBackend {
        fn new(clock: Arc<ManualClock>, failing: Interval) -> Self {
            Self {
                inner: MemoryBackend::with_clock(clock),
                failing_window: format!("#{}:", failing.milliseconds()),
            }
        }
    }

    #[async_trait]
    impl Backend for FlakyWindowBackend {
        async fn get_and_increment(&self, storage_key: &str, ttl: Duration) -> Result<u64> {
            if storage_key.contains(&self.failing_window) {
                return Err(LimiterError::BackendUnavailable("shard down".to_string()));
            }
            self.inner.get_and_increment(storage_key, ttl).await
        }

        fn now_ms(&self) -> u64 {
            self.inner.now_ms()
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_login_scenario() {
        let (_, _, engine) = engine();
        let config = LimitConfig::parse("login", &["3 per 5 minute"]).unwrap();
        let req = request([1, 2, 3, 4]);

        for expected_left in [2, 1, 0] {
            let result = engine.limit(&config, &req).await;
            assert!(!result.limit_applied);
            assert_eq!(result.per_limit_meta[0].requests_left, expected_left);
        }

        let result = engine.limit(&config, &req).await;
        assert!(result.limit_applied);
        assert_eq!(result.per_limit_meta[0].requests_left, 0);
        assert!(result.description.contains("3 allowed per 5 minute"));
        assert_eq!(
            result.description,
            "Hit limiter login@host=1.2.3.4: 3 allowed per 5 minute"
        );
    }

    #[tokio::test]
    async fn test_second_limit_violation_reported_with_all_meta() {
        let (_, _, engine) = engine();
        let config = LimitConfig::parse("api", &["10 per minute", "2 per second"]).unwrap();
        let req = request([1, 2, 3, 4]);

        engine.limit(&config, &req).await;
        engine.limit(&config, &req).await;
        let result = engine.limit(&config, &req).await;

        assert!(result.limit_applied);
        assert_eq!(result.description, "Hit limiter api@host=1.2.3.4: 2 allowed per 1 second");
        assert_eq!(result.per_limit_meta.len(), 2);
        assert_eq!(result.per_limit_meta[0].requests_left, 7);
        assert_eq!(result.per_limit_meta[1].requests_made, 3);
    }

    #[tokio::test]
    async fn test_first_violation_wins_tie_break() {
        let (_, _, engine) = engine();
        let config = LimitConfig::parse("api", &["1 per minute", "1 per hour"]).unwrap();
        let req = request([1, 2, 3, 4]);

        engine.limit(&config, &req).await;
        let result = engine.limit(&config, &req).await;

        assert!(result.limit_applied);
        assert!(result.description.ends_with("1 allowed per 1 minute"));
    }

    #[tokio::test]
    async fn test_rejected_requests_still_spend_quota() {
        let (_, backend, engine) = engine();
        let config = LimitConfig::parse("api", &["1 per minute", "100 per day"]).unwrap();
        let req = request([1, 2, 3, 4]);

        for _ in 0..5 {
            engine.limit(&config, &req).await;
        }

        let day = config.limits()[1].interval();
        assert_eq!(backend.current_count("api@host=1.2.3.4", day), 5);
    }

    #[tokio::test]
    async fn test_hosts_are_counted_separately() {
        let (_, _, engine) = engine();
        let config = LimitConfig::parse("login", &["1 per minute"]).unwrap();

        assert!(!engine.limit(&config, &request([1, 2, 3, 4])).await.limit_applied);
        assert!(!engine.limit(&config, &request([5, 6, 7, 8])).await.limit_applied);
        assert!(engine.limit(&config, &request([1, 2, 3, 4])).await.limit_applied);
    }

    #[tokio::test]
    async fn test_window_rollover() {
        let (clock, _, engine) = engine();
        let config = LimitConfig::parse("login", &["2 per minute"]).unwrap();
        let req = request([1, 2, 3, 4]);

        engine.limit(&config, &req).await;
        engine.limit(&config, &req).await;
        assert!(engine.limit(&config, &req).await.limit_applied);

        clock.advance(Duration::from_secs(60));

        let result = engine.limit(&config, &req).await;
        assert!(!result.limit_applied);
        assert_eq!(result.per_limit_meta[0].requests_made, 1);
    }

    #[tokio::test]
    async fn test_fail_open_admits_with_empty_meta() {
        let engine = LimiterEngine::new(Arc::new(DownBackend));
        let config = LimitConfig::parse("login", &["1 per minute"]).unwrap();

        let result = engine.limit(&config, &request([1, 2, 3, 4])).await;
        assert_eq!(result, LimiterResult::admitted());
    }

    #[tokio::test]
    async fn test_fail_closed_rejects() {
        let engine = LimiterEngine::new(Arc::new(DownBackend)).with_fail_open(false);
        let config = LimitConfig::parse("login", &["1 per minute"]).unwrap();

        let result = engine.limit(&config, &request([1, 2, 3, 4])).await;
        assert!(result.limit_applied);
        assert!(result.description.starts_with("Rate limiter unavailable"));
        assert!(result.per_limit_meta.is_empty());
    }

    #[tokio::test]
    async fn test_violation_survives_failure_on_later_limit() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = FlakyWindowBackend::new(clock, Interval::per(TimeUnit::Day));
        let engine = LimiterEngine::new(Arc::new(backend));
        let config = LimitConfig::parse("api", &["1 per minute", "5 per day"]).unwrap();
        let req = request([1, 2, 3, 4]);

        assert_eq!(engine.limit(&config, &req).await, LimiterResult::admitted());

        let result = engine.limit(&config, &req).await;
        assert!(result.limit_applied);
        assert_eq!(result.description, "Hit limiter api@host=1.2.3.4: 1 allowed per 1 minute");
        assert_eq!(result.per_limit_meta.len(), 1);
        assert_eq!(result.per_limit_meta[0].requests_made, 2);

        assert!(engine.try_limit(&config, &req).await.unwrap().limit_applied);
    }

    #[tokio::test]
    async fn test_failed_limit_does_not_skip_later_limits() {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = Arc::new(FlakyWindowBackend::new(
            clock,
            Interval::per(TimeUnit::Minute),
        ));
        let engine = LimiterEngine::new(backend.clone());
        let config = LimitConfig::parse("api", &["1 per minute", "5 per day"]).unwrap();
        let req = request([1, 2, 3, 4]);

        for _ in 0..3 {
            assert!(!engine.limit(&config, &req).await.limit_applied);
        }
        let day = config.limits()[1].interval();
        assert_eq!(backend.inner.current_count("api@host=1.2.3.4", day), 3);

        let err = engine.try_limit(&config, &req).await.unwrap_err();
        assert!(err.is_backend_failure());
    }

    #[tokio::test]
    async fn test_timeout_is_backend_failure() {
        let engine = LimiterEngine::new(Arc::new(SlowBackend))
            .with_timeout(Duration::from_millis(20))
            .with_fail_open(false);
        let config = LimitConfig::parse("login", &["1 per minute"]).unwrap();
        let req = request([1, 2, 3, 4]);

        let err = engine.try_limit(&config, &req).await.unwrap_err();
        assert!(matches!(err, LimiterError::Timeout(_)));

        let result = engine.limit(&config, &req).await;
        assert!(result.limit_applied);
    }

    #[test]
    fn test_result_helpers() {
        let meta = |requests_made, max_requests, reset_after_ms| LimitMeta {
            key: "k".to_string(),
            requests_made,
            max_requests,
            requests_left: u64::saturating_sub(max_requests, requests_made),
            reset_after_ms,
        };
        let result = LimiterResult {
            limit_applied: true,
            description: String::new(),
            per_limit_meta: vec![meta(11, 10, 30_000), meta(11, 1000, 3_600_000)],
        };

        assert_eq!(result.most_restrictive().unwrap().max_requests, 10);
        assert_eq!(result.retry_after(), Some(Duration::from_secs(30)));
        assert_eq!(LimiterResult::admitted().retry_after(), None);
    }
}
