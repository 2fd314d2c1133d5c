//! Counter storage backends.
//!
//! A backend supplies one atomic primitive, [`Backend::get_and_increment`].
//! The comparison against the quota, the bucket keying and the metadata are
//! shared by every backend through the provided [`Backend::process`] method.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace};

use crate::clock::{Clock, SystemClock};
use crate::error::Result;
use crate::ratelimit::Interval;

mod memory;
#[cfg(feature = "redis")]
mod redis;

pub use memory::MemoryBackend;
#[cfg(feature = "redis")]
pub use self::redis::{RedisBackend, RedisBackendConfig};

/// Quota usage reported for one limit, on success and on violation alike.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LimitMeta {
    /// Backend key the counter was tracked under
    pub key: String,
    pub requests_made: u64,
    pub max_requests: u64,
    pub requests_left: u64,
    /// Milliseconds until the current window ends
    pub reset_after_ms: u64,
}

impl LimitMeta {
    pub fn reset_after(&self) -> Duration {
        Duration::from_millis(self.reset_after_ms)
    }
}

/// Outcome of checking one limit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimitStatus {
    /// Set when the limit was exceeded
    pub violation: Option<String>,
    pub meta: LimitMeta,
}

impl LimitStatus {
    pub fn is_violation(&self) -> bool {
        self.violation.is_some()
    }
}

/// Physical key of the counter for `key` in the given bucket.
///
/// The window width is part of the bucket id so two limits with different
/// intervals never share a counter.
pub fn storage_key(key: &str, interval: Interval, bucket: u64) -> String {
    format!("{}#{}:{}", key, interval.milliseconds(), bucket)
}

/// Shared counter store.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Increment the counter stored under `storage_key` and return the new
    /// value.
    ///
    /// Must be atomic with respect to concurrent callers on the same key, and
    /// the key must expire no later than `ttl` after its first write.
    async fn get_and_increment(&self, storage_key: &str, ttl: Duration) -> Result<u64>;

    /// Current time used to select buckets.
    fn now_ms(&self) -> u64 {
        SystemClock.now_ms()
    }

    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Count one request against `key` and compare it to `limit`.
    async fn process(&self, key: &str, interval: Interval, limit: u64) -> Result<LimitStatus> {
        let now = self.now_ms();
        let storage_key = storage_key(key, interval, interval.bucket_of(now));

        let requests_made = self
            .get_and_increment(&storage_key, interval.duration())
            .await?;

        trace!(
            backend = self.name(),
            key = %storage_key,
            requests_made,
            limit,
            "Counted request"
        );

        let violation = if requests_made > limit {
            debug!(key = %key, requests_made, limit, interval = %interval, "Limit exceeded");
            Some(format!(
                "Hit limiter {}: {} allowed per {}",
                key, limit, interval
            ))
        } else {
            None
        };

        Ok(LimitStatus {
            violation,
            meta: LimitMeta {
                key: key.to_string(),
                requests_made,
                max_requests: limit,
                requests_left: limit.saturating_sub(requests_made),
                reset_after_ms: interval.reset_after(now).as_millis() as u64,
            },
        })
    }
}
