//! Decorator adapter: wraps an async handler function.

use std::future::Future;
use std::sync::Arc;

use tracing::debug;

use crate::handler::{ErrorHandler, TooManyRequests};
use crate::ratelimit::{LimitConfig, LimiterEngine, RequestView};

/// An async handler guarded by a limit config.
///
/// The check runs before the handler; when the request is over limit and the
/// error handler raises, the handler is never called.
pub struct RateLimited<F, E = TooManyRequests> {
    engine: Arc<LimiterEngine>,
    config: Arc<LimitConfig>,
    handler: ErrorHandler<E>,
    inner: F,
}

impl<F, E> RateLimited<F, E> {
    pub fn new(
        engine: Arc<LimiterEngine>,
        config: Arc<LimitConfig>,
        handler: ErrorHandler<E>,
        inner: F,
    ) -> Self {
        Self {
            engine,
            config,
            handler,
            inner,
        }
    }

    pub fn config(&self) -> &LimitConfig {
        &self.config
    }

    /// Check the request, then run the wrapped handler.
    pub async fn call<R, Fut, T>(&self, request: R) -> Result<T, E>
    where
        R: RequestView,
        F: Fn(R) -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let result = self.engine.limit(&self.config, &request).await;
        if result.limit_applied {
            if let Some(err) = self.handler.on_violation(&result) {
                debug!(config = %self.config.key(), "Handler call rejected");
                return Err(err);
            }
        }
        (self.inner)(request).await
    }
}

impl<F: Clone, E> Clone for RateLimited<F, E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
            inner: self.inner.clone(),
        }
    }
}

/// Wrap `inner` with the default 429 error handler.
pub fn rate_limited<F>(
    engine: Arc<LimiterEngine>,
    config: Arc<LimitConfig>,
    inner: F,
) -> RateLimited<F, TooManyRequests> {
    RateLimited::new(engine, config, ErrorHandler::default(), inner)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::MemoryBackend;
    use crate::ratelimit::RequestInfo;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn setup(limits: &[&str]) -> (Arc<LimiterEngine>, Arc<LimitConfig>) {
        let engine = Arc::new(LimiterEngine::new(Arc::new(MemoryBackend::new())));
        let config = Arc::new(LimitConfig::parse("login", limits).unwrap());
        (engine, config)
    }

    fn request() -> RequestInfo {
        RequestInfo::new("POST", "/login").with_remote_addr(IpAddr::from([1, 2, 3, 4]))
    }

    #[tokio::test]
    async fn test_decorator_blocks_handler_over_limit() {
        let (engine, config) = setup(&["2 per hour"]);
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = calls.clone();

        let login = rate_limited(engine, config, move |req: RequestInfo| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok::<_, TooManyRequests>(req.path)
            }
        });

        assert_eq!(login.call(request()).await.unwrap(), "/login");
        assert_eq!(login.call(request()).await.unwrap(), "/login");

        let err = login.call(request()).await.unwrap_err();
        assert_eq!(err.status, http::StatusCode::TOO_MANY_REQUESTS);
        assert!(err.description.contains("2 allowed per 1 hour"));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_decorator_with_consume_handler_still_calls_through() {
        let (engine, config) = setup(&["1 per hour"]);
        let violations = Arc::new(AtomicUsize::new(0));
        let seen = violations.clone();

        let handler = ErrorHandler::<String>::consume(move |_| {
            seen.fetch_add(1, Ordering::SeqCst);
        });
        let echo = RateLimited::new(engine, config, handler, |req: RequestInfo| async move {
            Ok::<_, String>(req.method)
        });

        assert_eq!(echo.call(request()).await.unwrap(), "POST");
        assert_eq!(echo.call(request()).await.unwrap(), "POST");
        assert_eq!(violations.load(Ordering::SeqCst), 1);
    }
}
