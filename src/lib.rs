//! Sweelimiter - Fixed-Window Rate Limiting for Web Services
//!
//! A request is checked against a [`LimitConfig`]: a key plus one or more
//! quotas such as `10 per minute` and `1000 per day`. The [`LimiterEngine`]
//! derives a counter key from the request, increments one counter per quota
//! in a shared [`Backend`](backend::Backend) and reports a [`LimiterResult`].
//! Framework adapters in [`adapters`] turn violations into rejections via an
//! [`ErrorHandler`].
//!
//! ```no_run
//! use std::sync::Arc;
//! use sweelimiter::backend::MemoryBackend;
//! use sweelimiter::{LimitConfig, LimiterEngine, RequestInfo};
//!
//! # async fn run() -> sweelimiter::error::Result<()> {
//! let engine = LimiterEngine::new(Arc::new(MemoryBackend::new()));
//! let login = LimitConfig::parse("login", &["3 per 5 minutes", "20 per day"])?;
//!
//! let request = RequestInfo::new("POST", "/login").with_remote_addr([10, 0, 0, 1].into());
//! let result = engine.limit(&login, &request).await;
//! assert!(!result.limit_applied);
//! # Ok(())
//! # }
//! ```

pub mod adapters;
pub mod backend;
pub mod clock;
pub mod config;
pub mod error;
pub mod handler;
pub mod ratelimit;

pub use handler::{ErrorHandler, IntoResponse, TooManyRequests};
pub use ratelimit::{
    Interval, KeyExtractor, Limit, LimitConfig, LimiterEngine, LimiterResult, RequestInfo,
    RequestView, TimeUnit,
};
