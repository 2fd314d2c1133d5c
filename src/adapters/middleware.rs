//! Tower middleware adapter for `http` services.

use std::sync::Arc;
use std::task::{Context, Poll};

use futures::future::BoxFuture;
use tower::{Layer, Service};
use tracing::{debug, debug_span, Instrument};

use super::apply_rate_limit_headers;
use crate::handler::{ErrorHandler, IntoResponse, TooManyRequests};
use crate::ratelimit::{LimitConfig, LimiterEngine};

/// Layer applying one limit config to every request of the wrapped service.
///
/// Admitted requests carry their [`LimiterResult`](crate::ratelimit::LimiterResult)
/// in the request extensions, and every response gets `X-RateLimit-*`
/// headers.
pub struct RateLimitLayer<E = TooManyRequests> {
    engine: Arc<LimiterEngine>,
    config: Arc<LimitConfig>,
    handler: ErrorHandler<E>,
}

impl RateLimitLayer<TooManyRequests> {
    pub fn new(engine: Arc<LimiterEngine>, config: Arc<LimitConfig>) -> Self {
        Self::with_handler(engine, config, ErrorHandler::default())
    }
}

impl<E> RateLimitLayer<E> {
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
}

impl<E> Clone for RateLimitLayer<E> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<S, E> Layer<S> for RateLimitLayer<E> {
    type Service = RateLimitService<S, E>;

    fn layer(&self, inner: S) -> Self::Service {
        RateLimitService {
            inner,
            engine: self.engine.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
        }
    }
}

/// Service produced by [`RateLimitLayer`].
pub struct RateLimitService<S, E = TooManyRequests> {
    inner: S,
    engine: Arc<LimiterEngine>,
    config: Arc<LimitConfig>,
    handler: ErrorHandler<E>,
}

impl<S: Clone, E> Clone for RateLimitService<S, E> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            engine: self.engine.clone(),
            config: self.config.clone(),
            handler: self.handler.clone(),
        }
    }
}

impl<S, E, ReqBody, ResBody> Service<http::Request<ReqBody>> for RateLimitService<S, E>
where
    S: Service<http::Request<ReqBody>, Response = http::Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send + 'static,
    ReqBody: Send + 'static,
    ResBody: Send + 'static,
    E: IntoResponse<ResBody> + 'static,
{
    type Response = http::Response<ResBody>;
    type Error = S::Error;
    type Future = BoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, mut request: http::Request<ReqBody>) -> Self::Future {
        // The clone may not be ready; keep the instance poll_ready was called on.
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);

        let engine = self.engine.clone();
        let config = self.config.clone();
        let handler = self.handler.clone();
        let key = config.final_key(&request);
        let span = debug_span!(
            "rate_limit",
            config = %config.key(),
            method = %request.method(),
            path = %request.uri().path()
        );

        let check = async move {
            let result = engine.limit_key(&config, key).await;

            if result.limit_applied {
                if let Some(err) = handler.on_violation(&result) {
                    debug!(description = %result.description, "Rejecting request");
                    let mut response = err.into_response();
                    apply_rate_limit_headers(response.headers_mut(), &result);
                    return Ok(response);
                }
            }

            request.extensions_mut().insert(result.clone());
            let mut response = inner.call(request).await?;
            apply_rate_limit_headers(response.headers_mut(), &result);
            Ok(response)
        };
        Box::pin(check.instrument(span))
    }
}
