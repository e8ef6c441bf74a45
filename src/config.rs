//! Configuration management for Floodgate.
//!
//! Layers, lowest priority first: built-in defaults, an optional YAML file,
//! then `FLOODGATE__SECTION__FIELD` environment variables.

use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::error::{FloodgateError, Result};
use crate::ratelimit::{PoliciesConfig, PolicyRegistry, DEFAULT_KEY_PREFIX};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "FLOODGATE";

/// Longest duration any setting may name, in seconds (30 days).
const MAX_SETTING_SECS: u64 = 30 * 24 * 3600;

/// Main configuration for Floodgate.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FloodgateConfig {
    /// Distributed counter store
    #[serde(default)]
    pub redis: RedisConfig,

    /// Circuit breaker guarding the distributed store
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Background eviction of local state
    #[serde(default)]
    pub eviction: EvictionConfig,

    /// Progressive penalties for repeat offenders
    #[serde(default)]
    pub penalty: PenaltyConfig,

    /// Pacing of evenly spread policies
    #[serde(default)]
    pub pacing: PacingConfig,

    /// Security alert delivery
    #[serde(default)]
    pub alerts: AlertsConfig,

    /// Log output
    #[serde(default)]
    pub logging: LoggingConfig,

    /// Per-category policy overrides
    #[serde(default)]
    pub policies: PoliciesConfig,
}

/// Redis connection settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Connection URL; counters stay process-local when unset
    #[serde(default)]
    pub url: Option<String>,

    /// Prefix applied to every counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound on a single store call in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: None,
            key_prefix: default_key_prefix(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_timeout_ms() -> u64 {
    2000
}

/// Circuit breaker settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BreakerConfig {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    #[serde(default = "default_cooldown_secs")]
    pub cooldown_secs: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            cooldown_secs: default_cooldown_secs(),
        }
    }
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_cooldown_secs() -> u64 {
    30
}

/// Eviction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionConfig {
    #[serde(default = "default_eviction_interval")]
    pub interval_secs: u64,
}

impl Default for EvictionConfig {
    fn default() -> Self {
        Self {
            interval_secs: default_eviction_interval(),
        }
    }
}

fn default_eviction_interval() -> u64 {
    300
}

/// Penalty settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PenaltyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Trailing window in which violations count
    #[serde(default = "default_penalty_window")]
    pub window_secs: u64,

    /// Bound on remembered violations per identity
    #[serde(default = "default_max_tracked")]
    pub max_tracked_violations: usize,
}

impl Default for PenaltyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_secs: default_penalty_window(),
            max_tracked_violations: default_max_tracked(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_penalty_window() -> u64 {
    3600
}

fn default_max_tracked() -> usize {
    64
}

/// Pacing settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PacingConfig {
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            max_delay_ms: default_max_delay_ms(),
        }
    }
}

fn default_max_delay_ms() -> u64 {
    1000
}

/// Alert delivery settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertsConfig {
    /// Capacity of the alert channel handed to consumers
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
}

impl Default for AlertsConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_channel_capacity(),
        }
    }
}

fn default_channel_capacity() -> usize {
    256
}

/// Log output settings. `RUST_LOG` takes precedence over `level`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl FloodgateConfig {
    /// Load configuration from an optional YAML file and the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let env = config::Environment::with_prefix(ENV_PREFIX)
            .separator("__")
            .try_parsing(true);
        Self::layered(path, env)
    }

    fn layered(path: Option<&Path>, env: config::Environment) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Yaml)
                    .required(true),
            );
        }

        let config: FloodgateConfig = builder.add_source(env).build()?.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML file only.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Parse configuration from a YAML document.
    pub fn from_yaml(contents: &str) -> Result<Self> {
        let config: FloodgateConfig = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the limiter cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.breaker.failure_threshold == 0 {
            return Err(FloodgateError::Config(
                "breaker.failure_threshold must be at least 1".to_string(),
            ));
        }
        if self.redis.timeout_ms == 0 {
            return Err(FloodgateError::Config(
                "redis.timeout_ms must be greater than zero".to_string(),
            ));
        }
        if self.eviction.interval_secs == 0 {
            return Err(FloodgateError::Config(
                "eviction.interval_secs must be greater than zero".to_string(),
            ));
        }

        let bounded = [
            ("breaker.cooldown_secs", self.breaker.cooldown_secs),
            ("eviction.interval_secs", self.eviction.interval_secs),
            ("penalty.window_secs", self.penalty.window_secs),
            ("redis.timeout_ms", self.redis.timeout_ms / 1000),
            ("pacing.max_delay_ms", self.pacing.max_delay_ms / 1000),
        ];
        for (name, secs) in bounded {
            if secs > MAX_SETTING_SECS {
                return Err(FloodgateError::Config(format!(
                    "{} must not exceed 30 days",
                    name
                )));
            }
        }

        PolicyRegistry::from_config(&self.policies)?;
        Ok(())
    }
}
