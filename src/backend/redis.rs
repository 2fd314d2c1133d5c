//! Redis counter store, shared by every process pointed at the same server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{Client, Script};
use tracing::{info, warn};

use super::Backend;
use crate::error::{LimiterError, Result};

/// `INCR` and the first `PEXPIRE` run in one script so a key can never be
/// left without a TTL.
const INCREMENT_SCRIPT: &str = r#"
local count = redis.call('INCR', KEYS[1])
if count == 1 then
    redis.call('PEXPIRE', KEYS[1], ARGV[1])
end
return count
"#;

/// Redis backend configuration.
#[derive(Debug, Clone)]
pub struct RedisBackendConfig {
    /// Connection URL, e.g. `redis://127.0.0.1:6379`
    pub url: String,
    /// How long to wait for the initial connection
    pub connect_timeout: Duration,
    /// Prefix prepended to every counter key
    pub key_prefix: String,
}

impl Default for RedisBackendConfig {
    fn default() -> Self {
        Self {
            url: "redis://127.0.0.1:6379".to_string(),
            connect_timeout: Duration::from_secs(2),
            key_prefix: "sweelimiter".to_string(),
        }
    }
}

/// Counter store backed by Redis `INCR` with millisecond expiry.
pub struct RedisBackend {
    conn: ConnectionManager,
    script: Script,
    key_prefix: String,
}

impl RedisBackend {
    /// Connect to Redis. Fails with `BackendUnavailable` when the server
    /// cannot be reached within the connect timeout.
    pub async fn connect(config: RedisBackendConfig) -> Result<Self> {
        let client = Client::open(config.url.as_str())
            .map_err(|e| LimiterError::config(format!("invalid redis url '{}': {}", config.url, e)))?;

        let conn = tokio::time::timeout(config.connect_timeout, ConnectionManager::new(client))
            .await
            .map_err(|_| LimiterError::Timeout(config.connect_timeout))?
            .map_err(|e| {
                warn!(url = %config.url, error = %e, "Failed to connect to redis");
                LimiterError::BackendUnavailable(e.to_string())
            })?;

        info!(url = %config.url, prefix = %config.key_prefix, "Connected to redis counter store");

        Ok(Self {
            conn,
            script: Script::new(INCREMENT_SCRIPT),
            key_prefix: config.key_prefix,
        })
    }

    fn make_key(&self, storage_key: &str) -> String {
        if self.key_prefix.is_empty() {
            storage_key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, storage_key)
        }
    }
}

#[async_trait]
impl Backend for RedisBackend {
    async fn get_and_increment(&self, storage_key: &str, ttl: Duration) -> Result<u64> {
        let mut conn = self.conn.clone();
        let ttl_ms = ttl.as_millis().max(1) as u64;

        self.script
            .key(self.make_key(storage_key))
            .arg(ttl_ms)
            .invoke_async(&mut conn)
            .await
            .map_err(|e| LimiterError::BackendUnavailable(e.to_string()))
    }

    fn name(&self) -> &'static str {
        "redis"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::{Interval, TimeUnit};

    async fn test_backend(prefix: &str) -> Option<RedisBackend> {
        let config = RedisBackendConfig {
            url: std::env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379".to_string()),
            connect_timeout: Duration::from_millis(500),
            key_prefix: format!("sweelimiter-test-{}-{}", prefix, std::process::id()),
        };
        RedisBackend::connect(config).await.ok()
    }

    #[test]
    fn test_default_config() {
        let config = RedisBackendConfig::default();
        assert_eq!(config.key_prefix, "sweelimiter");
        assert_eq!(config.connect_timeout, Duration::from_secs(2));
    }

    #[tokio::test]
    async fn test_invalid_url_is_configuration_error() {
        let config = RedisBackendConfig {
            url: "not a url".to_string(),
            ..Default::default()
        };
        let result = RedisBackend::connect(config).await;
        assert!(matches!(result, Err(LimiterError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_redis_counts_and_violates() {
        let backend = match test_backend("counts").await {
            Some(b) => b,
            None => return,
        };
        let interval = Interval::per(TimeUnit::Hour);

        let first = backend.process("login@host=1.2.3.4", interval, 2).await.unwrap();
        assert_eq!(first.meta.requests_made, 1);
        assert_eq!(first.meta.requests_left, 1);

        backend.process("login@host=1.2.3.4", interval, 2).await.unwrap();
        let third = backend.process("login@host=1.2.3.4", interval, 2).await.unwrap();
        assert!(third.is_violation());
    }

    #[tokio::test]
    async fn test_redis_keys_expire() {
        let backend = match test_backend("expiry").await {
            Some(b) => b,
            None => return,
        };

        let ttl = Duration::from_millis(200);
        assert_eq!(backend.get_and_increment("k", ttl).await.unwrap(), 1);
        assert_eq!(backend.get_and_increment("k", ttl).await.unwrap(), 2);

        tokio::time::sleep(Duration::from_millis(400)).await;

        assert_eq!(backend.get_and_increment("k", ttl).await.unwrap(), 1);
    }
}
