//! Dependency adapter: a check resolved before the handler runs.

use std::sync::Arc;

use futures::future::BoxFuture;

use crate::handler::{ErrorHandler, TooManyRequests};
use crate::ratelimit::{LimitConfig, LimiterEngine, LimiterResult, RequestView};

/// Injectable rate limit check.
///
/// Resolving it yields the [`LimiterResult`] (so handlers can surface the
/// remaining quota) or the error produced by the error handler.
pub struct RateLimitDependency<E = TooManyRequests> {
    engine: Arc<LimiterEngine>,
    config: Arc<LimitConfig>,
    handler: ErrorHandler<E>,
}

impl RateLimitDependency<TooManyRequests> {
    /// Dependency using the default 429 error handler.
    pub fn new(engine: Arc<LimiterEngine>, config: Arc<LimitConfig>) -> Self {
        Self::with_handler(engine, config, ErrorHandler::default())
    }
}

impl<E> RateLimitDependency<E> {
    pub fn with_handler(
        engine: Arc<LimiterEngine>,
        config: Arc<LimitConfig>,
        handler: ErrorHandler<E>,
    ) -> Self {
        Self {
            engine,
            config,
            handler,
        }
    }

    /// Run the check for `request`.
    pub async fn check<R: RequestView>(&self, request: &R) -> Result<LimiterResult, E> {
        let result = self.engine.limit(&self.config, request).await;
        self.admit(result)
    }

    /// Boxed form of [`check`](Self::check) for containers that store
    /// providers as trait objects.
    pub fn resolve<'a>(
        &'a self,
        request: &dyn RequestView,
    ) -> BoxFuture<'a, Result<LimiterResult, E>>
    where
        E: Send + 'a,
    {
        let check = self.engine.limit(&self.config, request);
        Box::pin(async move {
            let result = check.await;
            self.admit(result)
        })
    }

    fn admit(&self, result: LimiterResult) -> Result<LimiterResult, E> {
        if result.limit_applied {
            if let Some(err) = self.handler.on_violation(&result) {
                return Err(err);
            }
        }
        Ok(result)
    }
}

impl<E> Clone for RateLimitDependency<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
        }
    }
}
