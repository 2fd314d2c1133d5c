//! Configuration management for Sweelimiter.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::backend::{Backend, MemoryBackend};
use crate::error::{LimiterError, Result};
use crate::ratelimit::{
    HeaderExtractor, HostExtractor, KeyExtractor, LimitConfig, LimiterEngine, MethodExtractor,
    MultiExtractor, PrincipalExtractor, RouteExtractor,
};

/// Prefix of environment variables overriding file settings,
/// e.g. `SWEELIMITER__ENGINE__FAIL_OPEN=false`.
pub const ENV_PREFIX: &str = "SWEELIMITER";

/// Main configuration: backend, engine policy and named rules.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    /// Counter store configuration
    #[serde(default)]
    pub backend: BackendSettings,

    /// Engine failure policy
    #[serde(default)]
    pub engine: EngineSettings,

    /// Named limit configs
    #[serde(default)]
    pub rules: Vec<RuleSettings>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Memory,
    Redis,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSettings {
    #[serde(default)]
    pub kind: BackendKind,

    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_ms: u64,

    /// Prefix for every Redis key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// How often the memory backend drops expired counters. 0 disables the
    /// background sweep.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

impl Default for BackendSettings {
    fn default() -> Self {
        Self {
            kind: BackendKind::default(),
            redis_url: default_redis_url(),
            connect_timeout_ms: default_connect_timeout(),
            key_prefix: default_key_prefix(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_connect_timeout() -> u64 {
    2000
}

fn default_key_prefix() -> String {
    "sweelimiter".to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

/// Engine failure policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineSettings {
    /// Admit requests when the backend fails
    #[serde(default = "default_fail_open")]
    pub fail_open: bool,

    /// Per-call backend timeout. 0 waits indefinitely.
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            fail_open: default_fail_open(),
            timeout_ms: default_timeout(),
        }
    }
}

fn default_fail_open() -> bool {
    true
}

fn default_timeout() -> u64 {
    50
}

/// One named limit config as written in the settings file.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuleSettings {
    pub key: String,

    /// Quotas such as `"10 per minute"`
    pub limits: Vec<String>,

    /// Key dimensions, combined in order. Defaults to the client host.
    #[serde(default)]
    pub extractors: Vec<ExtractorSettings>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExtractorSettings {
    Host,
    Header { name: String },
    Route,
    Method,
    Principal,
}

impl ExtractorSettings {
    fn build(&self) -> Arc<dyn KeyExtractor> {
        match self {
            ExtractorSettings::Host => Arc::new(HostExtractor),
            ExtractorSettings::Header { name } => Arc::new(HeaderExtractor::new(name.as_str())),
            ExtractorSettings::Route => Arc::new(RouteExtractor),
            ExtractorSettings::Method => Arc::new(MethodExtractor),
            ExtractorSettings::Principal => Arc::new(PrincipalExtractor),
        }
    }
}

impl RuleSettings {
    /// Validate the rule into a [`LimitConfig`].
    pub fn to_limit_config(&self) -> Result<LimitConfig> {
        let config = LimitConfig::parse(self.key.as_str(), self.limits.as_slice())?;

        let extractor: Arc<dyn KeyExtractor> = match self.extractors.as_slice() {
            [] => return Ok(config),
            [single] => single.build(),
            many => {
                let mut multi = MultiExtractor::new();
                for extractor in many {
                    multi.push(extractor.build());
                }
                Arc::new(multi)
            }
        };
        Ok(config.with_shared_extractor(extractor))
    }
}

impl Settings {
    /// Parse settings from a YAML document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml).map_err(|e| LimiterError::config(e.to_string()))
    }

    /// Load settings from a YAML file path.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load a YAML file layered with `SWEELIMITER__*` environment variables.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let settings = ::config::Config::builder()
            .add_source(::config::File::from(path).format(::config::FileFormat::Yaml))
            .add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|c| c.try_deserialize::<Settings>())
            .map_err(|e| LimiterError::config(format!("{}: {}", path.display(), e)))?;

        info!(
            path = %path.display(),
            backend = ?settings.backend.kind,
            rules = settings.rules.len(),
            "Settings loaded"
        );
        Ok(settings)
    }

    /// Validate every rule. Fails on the first malformed rule or on a
    /// duplicate rule key.
    pub fn limit_configs(&self) -> Result<Vec<LimitConfig>> {
        let mut seen = HashMap::new();
        let mut configs = Vec::with_capacity(self.rules.len());

        for (idx, rule) in self.rules.iter().enumerate() {
            if let Some(first) = seen.insert(rule.key.as_str(), idx) {
                return Err(LimiterError::config(format!(
                    "rule '{}' is defined twice (rules {} and {})",
                    rule.key, first, idx
                )));
            }
            configs.push(rule.to_limit_config()?);
        }
        Ok(configs)
    }

    /// Construct the configured counter store.
    ///
    /// The memory backend gets a background sweeper, so this must run inside
    /// a tokio runtime. The sweeper stops once the backend is dropped.
    pub async fn build_backend(&self) -> Result<Arc<dyn Backend>> {
        match self.backend.kind {
            BackendKind::Memory => {
                let backend = Arc::new(MemoryBackend::new());
                if self.backend.sweep_interval_secs > 0 {
                    let every = Duration::from_secs(self.backend.sweep_interval_secs);
                    debug!(?every, "Starting memory sweeper");
                    backend.clone().spawn_sweeper(every);
                }
                Ok(backend)
            }
            #[cfg(feature = "redis")]
            BackendKind::Redis => {
                let backend = crate::backend::RedisBackend::connect(
                    crate::backend::RedisBackendConfig {
                        url: self.backend.redis_url.clone(),
                        connect_timeout: Duration::from_millis(self.backend.connect_timeout_ms),
                        key_prefix: self.backend.key_prefix.clone(),
                    },
                )
                .await?;
                Ok(Arc::new(backend))
            }
            #[cfg(not(feature = "redis"))]
            BackendKind::Redis => Err(LimiterError::config(
                "redis backend requested but the `redis` feature is disabled",
            )),
        }
    }

    /// Engine over `backend` with the configured failure policy.
    pub fn build_engine(&self, backend: Arc<dyn Backend>) -> LimiterEngine {
        let engine = LimiterEngine::new(backend).with_fail_open(self.engine.fail_open);
        match self.engine.timeout_ms {
            0 => engine,
            ms => engine.with_timeout(Duration::from_millis(ms)),
        }
    }
}

/// Named limit configs, replaceable at runtime.
#[derive(Debug, Default)]
pub struct RuleSet {
    rules: RwLock<HashMap<String, Arc<LimitConfig>>>,
}

impl RuleSet {
    pub fn from_settings(settings: &Settings) -> Result<Self> {
        let set = Self::default();
        set.reload(settings)?;
        Ok(set)
    }

    /// Swap in the rules of `settings`. On error the current rules stay in
    /// place.
    pub fn reload(&self, settings: &Settings) -> Result<usize> {
        let rules: HashMap<_, _> = settings
            .limit_configs()?
            .into_iter()
            .map(|config| (config.key().to_string(), Arc::new(config)))
            .collect();
        let count = rules.len();

        *self.rules.write() = rules;
        info!(rules = count, "Rules loaded");
        Ok(count)
    }

    pub fn get(&self, key: &str) -> Option<Arc<LimitConfig>> {
        self.rules.read().get(key).cloned()
    }

    /// Rule keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<_> = self.rules.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub fn len(&self) -> usize {
        self.rules.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.read().is_empty()
    }
}
