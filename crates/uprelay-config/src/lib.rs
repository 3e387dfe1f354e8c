#![deny(unsafe_code)]

//! Configuration loading and validation for uprelay.
//!
//! Loads TOML configuration files and validates them against expected schemas.
//! Provides the [`AppConfig`] type as the central configuration structure,
//! shared by the push server, the distributor and the delivery listener.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Hard upper bound on push payloads imposed by the UnifiedPush protocol.
pub const UNIFIEDPUSH_MAX_PAYLOAD: usize = 4096;

/// Shortest server id the push server may hand out.
pub const MIN_ID_LENGTH: usize = 9;

/// Errors that can occur during configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse TOML: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("validation error: {0}")]
    Validation(String),
}

/// Top-level application configuration.
#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Push server (long-poll delivery) configuration.
    #[serde(default)]
    pub server: ServerConfig,

    /// Distributor configuration (registration side).
    #[serde(default)]
    pub distributor: DistributorConfig,

    /// Delivery listener configuration.
    #[serde(default)]
    pub listener: ListenerConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Configuration for the push server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address the server binds to.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Port the server binds to.
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Length of generated server ids.
    #[serde(default = "default_id_length")]
    pub id_length: usize,

    /// Largest accepted push payload in bytes.
    #[serde(default = "default_max_payload_bytes")]
    pub max_payload_bytes: usize,

    /// Fallback wake-up interval of long-poll handlers, in milliseconds.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,

    /// Drop records that have not been polled for this many seconds (0 = never).
    #[serde(default)]
    pub record_ttl_secs: u64,

    /// Blank line written on an idle multi-id stream after this many
    /// milliseconds without output (0 = never).
    #[serde(default = "default_keepalive_interval_ms")]
    pub keepalive_interval_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            listen_port: default_listen_port(),
            id_length: default_id_length(),
            max_payload_bytes: default_max_payload_bytes(),
            poll_interval_ms: default_poll_interval_ms(),
            record_ttl_secs: 0,
            keepalive_interval_ms: default_keepalive_interval_ms(),
        }
    }
}

impl ServerConfig {
    /// Poll interval as a [`Duration`].
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Record time-to-live, or `None` when expiry is disabled.
    pub fn record_ttl(&self) -> Option<Duration> {
        (self.record_ttl_secs > 0).then(|| Duration::from_secs(self.record_ttl_secs))
    }

    /// Keepalive interval, or `None` when keepalives are disabled.
    pub fn keepalive_interval(&self) -> Option<Duration> {
        (self.keepalive_interval_ms > 0).then(|| Duration::from_millis(self.keepalive_interval_ms))
    }
}

fn default_listen_addr() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    8976
}

fn default_id_length() -> usize {
    12
}

fn default_max_payload_bytes() -> usize {
    UNIFIEDPUSH_MAX_PAYLOAD
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_keepalive_interval_ms() -> u64 {
    30_000
}

/// Configuration for the distributor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributorConfig {
    /// Base URL of the push server the distributor registers against.
    #[serde(default = "default_server_url")]
    pub server_url: String,

    /// Externally reachable base URL put into endpoint URLs handed to
    /// applications. Empty means `server_url`.
    #[serde(default)]
    pub public_url: String,

    /// Timeout for register/discovery/unregister requests, in milliseconds.
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

impl Default for DistributorConfig {
    fn default() -> Self {
        Self {
            server_url: default_server_url(),
            public_url: String::new(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl DistributorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Base of the endpoint URLs handed to applications.
    pub fn endpoint_base(&self) -> &str {
        if self.public_url.is_empty() {
            &self.server_url
        } else {
            &self.public_url
        }
    }
}

fn default_server_url() -> String {
    "http://127.0.0.1:8976".to_string()
}

fn default_request_timeout_ms() -> u64 {
    5000
}

/// Configuration for the delivery listener.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListenerConfig {
    /// How long to idle when there is nothing to subscribe to, in milliseconds.
    #[serde(default = "default_idle_poll_ms")]
    pub idle_poll_ms: u64,

    /// First reconnect delay after a failed connection, in milliseconds.
    #[serde(default = "default_backoff_initial_ms")]
    pub backoff_initial_ms: u64,

    /// Upper bound for the reconnect delay, in milliseconds.
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// Drop the delivery connection after this many milliseconds without
    /// receiving anything, keepalives included.
    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,
}

impl Default for ListenerConfig {
    fn default() -> Self {
        Self {
            idle_poll_ms: default_idle_poll_ms(),
            backoff_initial_ms: default_backoff_initial_ms(),
            backoff_max_ms: default_backoff_max_ms(),
            read_timeout_ms: default_read_timeout_ms(),
        }
    }
}

impl ListenerConfig {
    pub fn idle_poll(&self) -> Duration {
        Duration::from_millis(self.idle_poll_ms)
    }

    pub fn backoff_initial(&self) -> Duration {
        Duration::from_millis(self.backoff_initial_ms)
    }

    pub fn backoff_max(&self) -> Duration {
        Duration::from_millis(self.backoff_max_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }
}

fn default_idle_poll_ms() -> u64 {
    1000
}

fn default_backoff_initial_ms() -> u64 {
    500
}

fn default_backoff_max_ms() -> u64 {
    30_000
}

fn default_read_timeout_ms() -> u64 {
    90_000
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level filter (e.g. "info", "debug", "trace").
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AppConfig {
    /// Load configuration from a TOML file at the given path using async I/O.
    pub async fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::parse(&content)
    }

    /// Parse configuration from a TOML string.
    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.listen_port == 0 {
            return Err(ConfigError::Validation(
                "server.listen_port must be non-zero".to_string(),
            ));
        }
        if self.server.listen_addr.is_empty() {
            return Err(ConfigError::Validation(
                "server.listen_addr must not be empty".to_string(),
            ));
        }
        if self.server.id_length < MIN_ID_LENGTH {
            return Err(ConfigError::Validation(format!(
                "server.id_length must be at least {MIN_ID_LENGTH}, got {}",
                self.server.id_length
            )));
        }
        if self.server.max_payload_bytes == 0
            || self.server.max_payload_bytes > UNIFIEDPUSH_MAX_PAYLOAD
        {
            return Err(ConfigError::Validation(format!(
                "server.max_payload_bytes must be in 1..={UNIFIEDPUSH_MAX_PAYLOAD}, got {}",
                self.server.max_payload_bytes
            )));
        }
        if self.server.poll_interval_ms == 0 {
            return Err(ConfigError::Validation(
                "server.poll_interval_ms must be non-zero".to_string(),
            ));
        }
        if !is_http_url(&self.distributor.server_url) {
            return Err(ConfigError::Validation(format!(
                "distributor.server_url must start with http:// or https://, got {:?}",
                self.distributor.server_url
            )));
        }
        if !self.distributor.public_url.is_empty() && !is_http_url(&self.distributor.public_url) {
            return Err(ConfigError::Validation(format!(
                "distributor.public_url must start with http:// or https://, got {:?}",
                self.distributor.public_url
            )));
        }
        if self.distributor.request_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "distributor.request_timeout_ms must be non-zero".to_string(),
            ));
        }

        if self.listener.idle_poll_ms == 0 {
            return Err(ConfigError::Validation(
                "listener.idle_poll_ms must be non-zero".to_string(),
            ));
        }
        if self.listener.backoff_initial_ms == 0 {
            return Err(ConfigError::Validation(
                "listener.backoff_initial_ms must be non-zero".to_string(),
            ));
        }
        if self.listener.read_timeout_ms == 0 {
            return Err(ConfigError::Validation(
                "listener.read_timeout_ms must be non-zero".to_string(),
            ));
        }
        if self.listener.backoff_max_ms < self.listener.backoff_initial_ms {
            return Err(ConfigError::Validation(format!(
                "listener.backoff_max_ms ({}) must be >= listener.backoff_initial_ms ({})",
                self.listener.backoff_max_ms, self.listener.backoff_initial_ms
            )));
        }

        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.logging.level.as_str()) {
            return Err(ConfigError::Validation(format!(
                "logging.level must be one of {:?}, got {:?}",
                valid_levels, self.logging.level
            )));
        }

        Ok(())
    }
}

fn is_http_url(url: &str) -> bool {
    url.starts_with("http://") || url.starts_with("https://")
}
