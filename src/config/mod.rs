//! Configuration Module
//!
//! Provides TOML-based configuration for the agent with support for:
//! - Agent identity (device serial number)
//! - Local broker URL
//! - Status and metrics cadences
//! - Bridge tuning (timeouts, reconnect backoff, TLS, batching)
//! - Environment variable overrides (MESHBRIDGE__* prefix)
//!
//! The cloud broker URL and token deliberately do not appear here: they
//! arrive at runtime over the control bus.

use std::path::Path;

use config::{Environment, File, FileFormat};
use regex::Regex;
use serde::Deserialize;

use crate::topic::{CLOUD_TOPICS, LOCAL_TOPICS};


/// Substitute environment variables in a string.
/// Supports `${VAR}` and `${VAR:-default}` syntax.
fn substitute_env_vars(content: &str) -> String {
    let re = Regex::new(r"\$\{([^}:]+)(?::-([^}]*))?\}").unwrap();
    re.replace_all(content, |caps: &regex::Captures| {
        let var_name = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(var_name).unwrap_or_else(|_| default.to_string())
    })
    .to_string()
}

/// Configuration error types
#[derive(Debug)]
pub enum ConfigError {
    /// IO error reading config file
    Io(std::io::Error),
    /// Config crate error
    Config(config::ConfigError),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(e) => write!(f, "IO error: {}", e),
            ConfigError::Config(e) => write!(f, "Config error: {}", e),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

impl From<std::io::Error> for ConfigError {
    fn from(e: std::io::Error) -> Self {
        ConfigError::Io(e)
    }
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self {
        ConfigError::Config(e)
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Logging configuration
    pub log: LogConfig,
    /// URL for the local broker (unauthenticated)
    pub local_url: String,
    /// Serial number of the device, used as the provenance tag for
    /// locally-originated messages
    pub serial_no: String,
    /// Seconds between status events
    pub status_interval: u64,
    /// Seconds between metrics events
    pub metrics_interval: u64,
    /// Bridge tuning
    pub bridge: BridgeTuning,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: LogConfig::default(),
            local_url: default_local_url(),
            serial_no: default_serial_no(),
            status_interval: default_status_interval(),
            metrics_interval: default_metrics_interval(),
            bridge: BridgeTuning::default(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level: error, warn, info, debug, trace
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

/// Bridge connection tuning
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BridgeTuning {
    /// Keep-alive interval in seconds for both broker clients
    pub keep_alive: u64,
    /// Seconds to wait for a broker CONNACK
    pub connect_timeout: u64,
    /// Seconds before retrying after a connection failure
    pub reconnect_delay: u64,
    /// Seconds before retrying after a credential rejection
    pub auth_reconnect_delay: u64,
    /// Skip TLS certificate verification on the cloud connection
    pub tls_insecure: bool,
    /// Seconds between batch flushes
    pub batch_interval: u64,
    /// Subscription filters (from the rewrite tables) that should coalesce
    /// into batched envelopes instead of forwarding immediately
    pub batched_topics: Vec<String>,
}

impl Default for BridgeTuning {
    fn default() -> Self {
        Self {
            keep_alive: default_keep_alive(),
            connect_timeout: default_connect_timeout(),
            reconnect_delay: default_reconnect_delay(),
            auth_reconnect_delay: default_auth_reconnect_delay(),
            tls_insecure: false,
            batch_interval: default_batch_interval(),
            batched_topics: Vec::new(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_local_url() -> String {
    "tcp://localhost:1883".to_string()
}

fn default_serial_no() -> String {
    "unknown".to_string()
}

fn default_status_interval() -> u64 {
    10
}

fn default_metrics_interval() -> u64 {
    5
}

fn default_keep_alive() -> u64 {
    15
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_reconnect_delay() -> u64 {
    5
}

fn default_auth_reconnect_delay() -> u64 {
    30
}

fn default_batch_interval() -> u64 {
    1
}

impl Config {
    /// Load configuration from a TOML file with environment overrides.
    ///
    /// A missing file is not an error; defaults apply. Environment
    /// variables use the `MESHBRIDGE` prefix with `__` separating nested
    /// keys (e.g. `MESHBRIDGE__BRIDGE__TLS_INSECURE`).
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = match std::fs::read_to_string(path) {
            Ok(content) => Some(content),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Self::from_sources(content.as_deref())
    }

    /// Build a configuration from an optional TOML document plus the
    /// environment.
    fn from_sources(content: Option<&str>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();

        if let Some(content) = content {
            let substituted = substitute_env_vars(content);
            builder = builder.add_source(File::from_str(&substituted, FileFormat::Toml));
        }

        // Override with environment variables (MESHBRIDGE__BRIDGE__KEEP_ALIVE,
        // etc.). Double underscore separates nested keys, single underscore
        // is preserved in field names.
        let cfg = builder
            .add_source(
                Environment::with_prefix("MESHBRIDGE")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: Config = cfg.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.status_interval == 0 {
            return Err(ConfigError::Validation(
                "status_interval must be at least 1 second".to_string(),
            ));
        }
        if self.metrics_interval == 0 {
            return Err(ConfigError::Validation(
                "metrics_interval must be at least 1 second".to_string(),
            ));
        }
        if self.bridge.batch_interval == 0 {
            return Err(ConfigError::Validation(
                "bridge.batch_interval must be at least 1 second".to_string(),
            ));
        }

        for filter in &self.bridge.batched_topics {
            let known = LOCAL_TOPICS
                .iter()
                .chain(CLOUD_TOPICS.iter())
                .any(|rule| rule.filter == filter);
            if !known {
                return Err(ConfigError::Validation(format!(
                    "bridge.batched_topics entry {:?} is not a bridged topic filter",
                    filter
                )));
            }
        }

        Ok(())
    }
}
