//! Configuration management for Ratelab.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{RatelabError, Result};
use crate::ratelimit::{SharedOptions, MAX_WINDOW_MS};

/// Environment variable prefix, e.g. `RATELAB__STORE__ENABLED=true`.
const ENV_PREFIX: &str = "RATELAB";

/// Main configuration for the Ratelab service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RatelabConfig {
    /// Initial settings per algorithm
    #[serde(default)]
    pub limiters: LimitersConfig,

    /// Shared store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Decision log configuration
    #[serde(default)]
    pub log: LogConfig,
}

/// Initial settings for the four limiters.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LimitersConfig {
    #[serde(default)]
    pub fixed_window: WindowSettings,

    #[serde(default)]
    pub sliding_window: WindowSettings,

    #[serde(default)]
    pub token_bucket: TokenBucketSettings,

    #[serde(default)]
    pub leaky_bucket: LeakyBucketSettings,
}

/// Fixed and sliding window settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WindowSettings {
    /// Requests admitted per window
    #[serde(default = "default_window_limit")]
    pub limit: u64,

    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,
}

impl Default for WindowSettings {
    fn default() -> Self {
        Self {
            limit: default_window_limit(),
            window_ms: default_window_ms(),
        }
    }
}

fn default_window_limit() -> u64 {
    10
}

fn default_window_ms() -> u64 {
    1000
}

/// Token bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucketSettings {
    #[serde(default = "default_token_capacity")]
    pub capacity: u64,

    #[serde(default = "default_refill_per_second")]
    pub refill_per_second: f64,
}

impl Default for TokenBucketSettings {
    fn default() -> Self {
        Self {
            capacity: default_token_capacity(),
            refill_per_second: default_refill_per_second(),
        }
    }
}

fn default_token_capacity() -> u64 {
    10
}

fn default_refill_per_second() -> f64 {
    5.0
}

/// Leaky bucket settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LeakyBucketSettings {
    /// Advisory capacity, reported in state snapshots
    #[serde(default = "default_leaky_capacity")]
    pub capacity: u64,

    #[serde(default = "default_leak_per_second")]
    pub leak_per_second: f64,

    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
}

impl Default for LeakyBucketSettings {
    fn default() -> Self {
        Self {
            capacity: default_leaky_capacity(),
            leak_per_second: default_leak_per_second(),
            max_queue_size: default_max_queue_size(),
        }
    }
}

fn default_leaky_capacity() -> u64 {
    50
}

fn default_leak_per_second() -> f64 {
    5.0
}

fn default_max_queue_size() -> usize {
    100
}

/// Shared store configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Route decisions through the shared store
    #[serde(default)]
    pub enabled: bool,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Leading segment of every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Bound on a single store call, in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            redis_url: default_redis_url(),
            key_prefix: default_key_prefix(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_key_prefix() -> String {
    "ratelimit".to_string()
}

fn default_store_timeout_ms() -> u64 {
    250
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Options for the shared limiter variants.
    pub fn shared_options(&self) -> SharedOptions {
        SharedOptions {
            key_prefix: self.key_prefix.clone(),
            timeout: self.timeout(),
        }
    }
}

/// Decision log configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogConfig {
    /// Number of most recent decisions retained
    #[serde(default = "default_log_capacity")]
    pub capacity: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            capacity: default_log_capacity(),
        }
    }
}

fn default_log_capacity() -> usize {
    crate::sink::DEFAULT_LOG_CAPACITY
}

impl RatelabConfig {
    /// Load configuration from an optional file, then apply `RATELAB__*`
    /// environment overrides.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::with_name(path));
        }

        let config: RatelabConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file path.
    pub fn from_file(path: &str) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: RatelabConfig =
            serde_yaml::from_str(yaml).map_err(|e| RatelabError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings no limiter can run with.
    pub fn validate(&self) -> Result<()> {
        let limiters = &self.limiters;
        for (name, window) in [
            ("fixed_window", &limiters.fixed_window),
            ("sliding_window", &limiters.sliding_window),
        ] {
            if window.window_ms == 0 || window.window_ms > MAX_WINDOW_MS {
                return Err(RatelabError::Config(format!(
                    "{}.window_ms must be between 1 and {}, got {}",
                    name, MAX_WINDOW_MS, window.window_ms
                )));
            }
        }

        for (name, rate) in [
            ("token_bucket.refill_per_second", limiters.token_bucket.refill_per_second),
            ("leaky_bucket.leak_per_second", limiters.leaky_bucket.leak_per_second),
        ] {
            if !rate.is_finite() || rate < 0.0 {
                return Err(RatelabError::Config(format!(
                    "{} must be a non-negative number, got {}",
                    name, rate
                )));
            }
        }

        if self.log.capacity == 0 {
            return Err(RatelabError::Config("log.capacity must be positive".to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RatelabConfig::default();
        assert_eq!(config.limiters.fixed_window.limit, 10);
        assert_eq!(config.limiters.sliding_window.window_ms, 1000);
        assert_eq!(config.limiters.token_bucket.refill_per_second, 5.0);
        assert_eq!(config.limiters.leaky_bucket.max_queue_size, 100);
        assert!(!config.store.enabled);
        assert_eq!(config.store.key_prefix, "ratelimit");
        assert_eq!(config.log.capacity, 2000);
    }

    #[test]
    fn test_from_yaml_fills_missing_fields() {
        let yaml = r#"
limiters:
  token_bucket:
    capacity: 5
  leaky_bucket:
    leak_per_second: 2.5
store:
  enabled: true
  timeout_ms: 100
"#;
        let config = RatelabConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.limiters.token_bucket.capacity, 5);
        assert_eq!(config.limiters.token_bucket.refill_per_second, 5.0);
        assert_eq!(config.limiters.leaky_bucket.leak_per_second, 2.5);
        assert_eq!(config.limiters.leaky_bucket.max_queue_size, 100);
        assert!(config.store.enabled);
        assert_eq!(config.store.shared_options().timeout, Duration::from_millis(100));
        assert_eq!(config.store.redis_url, "redis://localhost:6379");
    }

    #[test]
    fn test_from_yaml_rejects_bad_values() {
        let err = RatelabConfig::from_yaml("limiters:\n  fixed_window:\n    window_ms: 0\n").unwrap_err();
        assert!(matches!(err, RatelabError::Config(_)));

        let err =
            RatelabConfig::from_yaml("limiters:\n  sliding_window:\n    window_ms: 100000000000\n").unwrap_err();
        assert!(matches!(err, RatelabError::Config(_)));

        let err = RatelabConfig::from_yaml("log:\n  capacity: nope\n").unwrap_err();
        assert!(matches!(err, RatelabError::Config(_)));
    }

    #[test]
    fn test_from_file_missing_is_io_error() {
        let err = RatelabConfig::from_file("/nonexistent/ratelab.yaml").unwrap_err();
        assert!(matches!(err, RatelabError::Io(_)));
    }

    #[test]
    fn test_load_reads_file() {
        let path = std::env::temp_dir().join(format!("ratelab-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(&path, "limiters:\n  fixed_window:\n    limit: 3\nlog:\n  capacity: 50\n").unwrap();

        let config = RatelabConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.limiters.fixed_window.limit, 3);
        assert_eq!(config.limiters.fixed_window.window_ms, 1000);
        assert_eq!(config.log.capacity, 50);
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = RatelabConfig::load(Some("/nonexistent/ratelab")).unwrap_err();
        assert!(matches!(err, RatelabError::Config(_)));
    }
}
