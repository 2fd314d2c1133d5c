//! Quota rules: single limits and the named bundles they are applied in.

use std::collections::HashSet;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use super::extract::{HostExtractor, KeyExtractor};
use super::interval::Interval;
use super::request::RequestView;
use crate::error::{LimiterError, Result};

/// Separator between the config key and the extracted components.
pub const KEY_SEPARATOR: char = '@';
/// Separator between extracted components.
pub const COMPONENT_SEPARATOR: &str = ":";

/// A single quota: at most `max_requests` per `interval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Limit {
    interval: Interval,
    max_requests: u64,
}

impl Limit {
    pub fn new(interval: Interval, max_requests: u64) -> Result<Self> {
        if max_requests == 0 {
            return Err(LimiterError::config("max_requests must be positive"));
        }
        Ok(Self {
            interval,
            max_requests,
        })
    }

    pub fn interval(&self) -> Interval {
        self.interval
    }

    pub fn max_requests(&self) -> u64 {
        self.max_requests
    }
}

impl FromStr for Limit {
    type Err = LimiterError;

    /// Parse `"10 per minute"`, `"100 per 5 minutes"` or `"10/minute"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let (max, interval) = s
            .split_once('/')
            .or_else(|| split_per(s))
            .ok_or_else(|| {
                LimiterError::config(format!(
                    "invalid limit '{}': expected '<max> per <amount> <unit>'",
                    s
                ))
            })?;

        let max_requests = max
            .trim()
            .parse::<u64>()
            .map_err(|e| LimiterError::config(format!("invalid limit '{}': {}", s, e)))?;
        let interval = interval.parse::<Interval>()?;

        Limit::new(interval, max_requests)
    }
}

fn split_per(s: &str) -> Option<(&str, &str)> {
    let lower = s.to_ascii_lowercase();
    let idx = lower.find(" per ")?;
    Some((&s[..idx], &s[idx + " per ".len()..]))
}

impl fmt::Display for Limit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} per {}", self.max_requests, self.interval)
    }
}

/// Named, ordered bundle of limits applied together to one operation.
///
/// Limits are evaluated in declaration order. The extractor decides which
/// request dimensions share a counter.
#[derive(Clone)]
pub struct LimitConfig {
    key: String,
    limits: Vec<Limit>,
    extractor: Arc<dyn KeyExtractor>,
}

impl LimitConfig {
    /// Create a config keyed by client host.
    pub fn new(key: impl Into<String>, limits: Vec<Limit>) -> Result<Self> {
        let key = key.into();
        if key.trim().is_empty() {
            return Err(LimiterError::config("limit config key must not be empty"));
        }
        if limits.is_empty() {
            return Err(LimiterError::config(format!(
                "limit config '{}' has no limits",
                key
            )));
        }

        let mut seen = HashSet::new();
        for limit in &limits {
            if !seen.insert(limit.interval().milliseconds()) {
                return Err(LimiterError::config(format!(
                    "limit config '{}' declares the window '{}' twice",
                    key,
                    limit.interval()
                )));
            }
        }

        Ok(Self {
            key,
            limits,
            extractor: Arc::new(HostExtractor),
        })
    }

    /// Build a config from compact limit strings such as `"10 per minute"`.
    pub fn parse<S: AsRef<str>>(key: impl Into<String>, limits: &[S]) -> Result<Self> {
        let limits = limits
            .iter()
            .map(|l| l.as_ref().parse::<Limit>())
            .collect::<Result<Vec<_>>>()?;
        Self::new(key, limits)
    }

    /// Replace the key extractor.
    pub fn with_extractor(mut self, extractor: impl KeyExtractor + 'static) -> Self {
        self.extractor = Arc::new(extractor);
        self
    }

    pub fn with_shared_extractor(mut self, extractor: Arc<dyn KeyExtractor>) -> Self {
        self.extractor = extractor;
        self
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn limits(&self) -> &[Limit] {
        &self.limits
    }

    pub fn extractor(&self) -> &dyn KeyExtractor {
        self.extractor.as_ref()
    }

    /// Backend key for a request: `key@component:component...`.
    pub fn final_key(&self, request: &dyn RequestView) -> String {
        let components = self.extractor.extract(request);
        format!(
            "{}{}{}",
            self.key,
            KEY_SEPARATOR,
            components.join(COMPONENT_SEPARATOR)
        )
    }
}

impl fmt::Debug for LimitConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LimitConfig")
            .field("key", &self.key)
            .field("limits", &self.limits)
            .field("extractor", &self.extractor.prefix())
            .finish()
    }
}
