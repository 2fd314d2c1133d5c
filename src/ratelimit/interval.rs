//! Rate limit windows and bucket arithmetic.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Unit of a rate limit window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    Second,
    Minute,
    Hour,
    Day,
}

impl TimeUnit {
    /// Get the length of one unit in milliseconds.
    pub fn milliseconds(&self) -> u64 {
        match self {
            TimeUnit::Second => 1_000,
            TimeUnit::Minute => 60_000,
            TimeUnit::Hour => 3_600_000,
            TimeUnit::Day => 86_400_000,
        }
    }

    /// Singular lowercase name, as used in violation messages.
    pub fn as_str(&self) -> &'static str {
        match self {
            TimeUnit::Second => "second",
            TimeUnit::Minute => "minute",
            TimeUnit::Hour => "hour",
            TimeUnit::Day => "day",
        }
    }
}

impl FromStr for TimeUnit {
    type Err = LimiterError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "s" | "sec" | "secs" | "second" | "seconds" => Ok(TimeUnit::Second),
            "m" | "min" | "mins" | "minute" | "minutes" => Ok(TimeUnit::Minute),
            "h" | "hr" | "hrs" | "hour" | "hours" => Ok(TimeUnit::Hour),
            "d" | "day" | "days" => Ok(TimeUnit::Day),
            other => Err(LimiterError::config(format!(
                "unknown time unit '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A fixed time window such as "1 minute" or "10 seconds".
///
/// Counters are keyed by the bucket a timestamp falls into, so advancing to
/// the next bucket starts a fresh count without any reset logic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Interval {
    amount: u64,
    unit: TimeUnit,
}

impl Interval {
    /// Create an interval of `amount` units. A zero amount is rejected.
    pub fn new(amount: u64, unit: TimeUnit) -> Result<Self> {
        if amount == 0 {
            return Err(LimiterError::config("interval amount must be positive"));
        }
        amount
            .checked_mul(unit.milliseconds())
            .ok_or_else(|| LimiterError::config(format!("interval of {} {} overflows", amount, unit)))?;
        Ok(Self { amount, unit })
    }

    /// Shorthand for a single-unit interval, which is always valid.
    pub fn per(unit: TimeUnit) -> Self {
        Self { amount: 1, unit }
    }

    pub fn amount(&self) -> u64 {
        self.amount
    }

    pub fn unit(&self) -> TimeUnit {
        self.unit
    }

    /// Width of the window in milliseconds.
    pub fn milliseconds(&self) -> u64 {
        self.amount * self.unit.milliseconds()
    }

    pub fn duration(&self) -> Duration {
        Duration::from_millis(self.milliseconds())
    }

    /// Index of the bucket containing `timestamp_ms`.
    pub fn bucket_of(&self, timestamp_ms: u64) -> u64 {
        timestamp_ms / self.milliseconds()
    }

    /// Time left until the bucket containing `timestamp_ms` ends.
    pub fn reset_after(&self, timestamp_ms: u64) -> Duration {
        let window = self.milliseconds();
        Duration::from_millis(window - timestamp_ms % window)
    }
}

impl FromStr for Interval {
    type Err = LimiterError;

    /// Parse `"minute"`, `"5 minutes"` or `"10s"`.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(LimiterError::config("empty interval"));
        }

        let split = s.find(|c: char| !c.is_ascii_digit()).unwrap_or(s.len());
        let (digits, unit) = s.split_at(split);

        let amount = if digits.is_empty() {
            1
        } else {
            digits
                .parse::<u64>()
                .map_err(|e| LimiterError::config(format!("invalid interval '{}': {}", s, e)))?
        };

        let unit = unit
            .parse::<TimeUnit>()
            .map_err(|e| LimiterError::config(format!("invalid interval '{}': {}", s, e)))?;

        Interval::new(amount, unit)
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.amount, self.unit)
    }
}
