//! Framework adapters around [`LimiterEngine`](crate::ratelimit::LimiterEngine).
//!
//! All three run the same check and apply the same
//! [`ErrorHandler`](crate::handler::ErrorHandler); they only differ in where
//! the check hooks into request handling:
//!
//! - [`RateLimited`] wraps an async handler function,
//! - [`RateLimitDependency`] is resolved before a handler runs,
//! - [`RateLimitLayer`] is tower middleware for `http` services.

mod decorator;
mod dependency;
mod middleware;

pub use decorator::{rate_limited, RateLimited};
pub use dependency::RateLimitDependency;
pub use middleware::{RateLimitLayer, RateLimitService};

use http::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use std::time::Duration;

use crate::ratelimit::LimiterResult;

pub const X_RATELIMIT_LIMIT: &str = "x-ratelimit-limit";
pub const X_RATELIMIT_REMAINING: &str = "x-ratelimit-remaining";
pub const X_RATELIMIT_RESET: &str = "x-ratelimit-reset";

fn ceil_secs(duration: Duration) -> u64 {
    duration.as_millis().div_ceil(1000) as u64
}

/// Describe the most restrictive limit in `X-RateLimit-*` headers, plus
/// `Retry-After` when the request was rejected.
pub fn apply_rate_limit_headers(headers: &mut HeaderMap, result: &LimiterResult) {
    if let Some(meta) = result.most_restrictive() {
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_LIMIT),
            HeaderValue::from(meta.max_requests),
        );
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_REMAINING),
            HeaderValue::from(meta.requests_left),
        );
        headers.insert(
            HeaderName::from_static(X_RATELIMIT_RESET),
            HeaderValue::from(ceil_secs(meta.reset_after())),
        );
    }

    if result.limit_applied {
        if let Some(retry_after) = result.retry_after() {
            headers.insert(RETRY_AFTER, HeaderValue::from(ceil_secs(retry_after)));
        }
    }
}
