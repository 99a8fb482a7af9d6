//! Configuration file parsing for Brig
//!
//! Parses `brig.toml` using serde:
//!
//! ```toml
//! [config]
//! pool = "zroot"
//! dataset = "brig"
//! workers = 4
//!
//! [config.rate_limit]
//! boot_capacity = 3.0
//!
//! [defaults]
//! securelevel = 2
//! boot = "off"
//! ```

use crate::error::{Error, Result};
use crate::properties::validate_property;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

/// Default location of the configuration file
pub const DEFAULT_PATH: &str = "/usr/local/etc/brig.toml";

/// Load configuration from a file
pub fn load(path: &Path) -> Result<BrigConfig> {
    let content = fs::read_to_string(path).map_err(|e| Error::ConfigRead {
        path: path.to_path_buf(),
        source: e,
    })?;
    let config = parse(&content)?;
    Ok(config)
}

/// Parse and validate configuration text
pub fn parse(content: &str) -> Result<BrigConfig> {
    let config: BrigConfig = toml::from_str(content)?;
    config.validate()?;
    Ok(config)
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct BrigConfig {
    /// Global configuration settings
    pub config: GlobalConfig,

    /// Global property defaults, below template and explicit values
    #[serde(default)]
    pub defaults: BTreeMap<String, DefaultValue>,
}

impl BrigConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let cfg = &self.config;
        if cfg.pool.trim().is_empty() {
            return Err(Error::ConfigValidation("pool must not be empty".into()));
        }
        if cfg.dataset.is_empty() || cfg.dataset.starts_with('/') || cfg.dataset.contains('@') {
            return Err(Error::ConfigValidation(format!(
                "invalid dataset '{}'",
                cfg.dataset
            )));
        }
        if cfg.workers == 0 {
            return Err(Error::ConfigValidation("workers must be at least 1".into()));
        }
        if cfg.mac_prefix.len() != 6 || !cfg.mac_prefix.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::ConfigValidation(format!(
                "mac_prefix must be 6 hex digits, got '{}'",
                cfg.mac_prefix
            )));
        }
        if cfg.rate_limit.boot_capacity < 1.0 || cfg.rate_limit.boot_refill_rate <= 0.0 {
            return Err(Error::ConfigValidation(
                "rate_limit needs capacity >= 1 and a positive refill rate".into(),
            ));
        }
        if !(0.0..=1.0).contains(&cfg.retry.jitter_factor) {
            return Err(Error::ConfigValidation("retry.jitter_factor must be within 0..=1".into()));
        }

        for (key, value) in self.property_defaults() {
            validate_property(&key, &value)
                .map_err(|e| Error::ConfigValidation(format!("[defaults] {}", e)))?;
        }
        Ok(())
    }

    /// Root dataset of the jail tree, `<pool>/<dataset>`
    pub fn root_dataset(&self) -> String {
        format!("{}/{}", self.config.pool, self.config.dataset)
    }

    /// `[defaults]` as property strings, with `stop_timeout` from `[config]`
    /// unless overridden there
    pub fn property_defaults(&self) -> BTreeMap<String, String> {
        let mut defaults: BTreeMap<String, String> = self
            .defaults
            .iter()
            .map(|(k, v)| (k.clone(), v.to_string()))
            .collect();
        defaults
            .entry("stop_timeout".into())
            .or_insert_with(|| self.config.stop_timeout.to_string());
        defaults
    }
}

/// A `[defaults]` value; TOML integers and booleans are accepted as well as strings
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(untagged)]
pub enum DefaultValue {
    Text(String),
    Int(i64),
    Bool(bool),
}

impl std::fmt::Display for DefaultValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DefaultValue::Text(s) => f.write_str(s),
            DefaultValue::Int(n) => write!(f, "{}", n),
            DefaultValue::Bool(true) => f.write_str("on"),
            DefaultValue::Bool(false) => f.write_str("off"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct GlobalConfig {
    /// ZFS pool holding the jail tree
    pub pool: String,

    /// Dataset below the pool
    #[serde(default = "default_dataset")]
    pub dataset: String,

    /// Directory for runtime records of running jails
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,

    /// Worker threads for batched transitions
    #[serde(default = "default_workers")]
    pub workers: usize,

    /// Default grace period between SIGTERM and SIGKILL, in seconds
    #[serde(default = "default_stop_timeout")]
    pub stop_timeout: u64,

    /// First three bytes of generated MAC addresses, as hex
    #[serde(default = "default_mac_prefix")]
    pub mac_prefix: String,

    /// Create missing bridges on attach instead of failing
    #[serde(default = "default_true")]
    pub auto_create_bridges: bool,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,

    /// Retry/backoff configuration for boot starts
    #[serde(default)]
    pub retry: RetryConfig,
}

fn default_dataset() -> String {
    "brig".into()
}

fn default_state_dir() -> PathBuf {
    PathBuf::from("/var/run/brig")
}

fn default_workers() -> usize {
    4
}

fn default_stop_timeout() -> u64 {
    30
}

fn default_mac_prefix() -> String {
    "02ff60".into()
}

fn default_true() -> bool {
    true
}

fn default_boot_capacity() -> f64 {
    3.0
}

fn default_boot_refill_rate() -> f64 {
    1.0
}

/// Rate limiting configuration
#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Jail starts allowed in a burst
    #[serde(default = "default_boot_capacity")]
    pub boot_capacity: f64,

    /// Tokens regained per second
    #[serde(default = "default_boot_refill_rate")]
    pub boot_refill_rate: f64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            boot_capacity: default_boot_capacity(),
            boot_refill_rate: default_boot_refill_rate(),
        }
    }
}

// Retry configuration defaults
fn default_base_delay_ms() -> u64 {
    1000
}

fn default_max_delay_ms() -> u64 {
    60000
}

fn default_multiplier() -> f64 {
    2.0
}

fn default_max_attempts() -> u8 {
    5
}

fn default_jitter_factor() -> f64 {
    0.5
}

/// Retry/backoff configuration for transient start failures
#[derive(Debug, Clone, Deserialize)]
pub struct RetryConfig {
    /// Base delay in milliseconds before first retry
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds between retries
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Multiplier for exponential backoff
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Maximum number of retry attempts
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u8,

    /// Jitter factor (0.0-1.0) to randomize delays
    #[serde(default = "default_jitter_factor")]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            multiplier: default_multiplier(),
            max_attempts: default_max_attempts(),
            jitter_factor: default_jitter_factor(),
        }
    }
}

/// Starter configuration written by `brig init`
pub fn template(pool: &str) -> String {
    format!(
        r#"[config]
pool = "{pool}"
dataset = "brig"
state_dir = "/var/run/brig"
workers = 4
stop_timeout = 30
mac_prefix = "02ff60"
auto_create_bridges = true

[config.rate_limit]
boot_capacity = 3.0
boot_refill_rate = 1.0

[config.retry]
base_delay_ms = 1000
max_delay_ms = 60000
max_attempts = 5

[defaults]
securelevel = 2
boot = "off"
"#
    )
}
