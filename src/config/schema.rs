//! Framework-level configuration blocks: `core`, `http`, `observability`.
//!
//! Tool-specific blocks live next to their agents; authentication blocks in
//! [`super::auth`].

use std::path::PathBuf;

use secrecy::SecretString;
use serde::Deserialize;
use url::Url;

use super::registry::ConfigBlock;
use super::types::{self, ConfigError};

// ── core ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warning,
    Error,
}

impl LogLevel {
    /// The `tracing` filter directive equivalent.
    pub fn as_filter(self) -> &'static str {
        match self {
            Self::Debug => "debug",
            Self::Info => "info",
            Self::Warning => "warn",
            Self::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CoreConfig {
    /// Selects the tool-specific agent main.
    pub agent_type: String,
    pub agent_key: String,
    pub observability_service_account_key: SecretString,
    pub observability_base_url: Url,
    #[serde(default = "defaults::log_level")]
    pub log_level: LogLevel,
    /// Capacity of the in-process event channels; zero means unbounded.
    #[serde(default)]
    pub max_channel_capacity: u64,
    /// Seconds between heartbeats.
    #[serde(default = "defaults::heartbeat_period")]
    pub heartbeat_period: f64,
}

impl ConfigBlock for CoreConfig {
    const NAME: &'static str = "core";
    const ENV_PREFIX: &'static str = "DK_";
    const FIELDS: &'static [&'static str] = &[
        "agent_type",
        "agent_key",
        "observability_service_account_key",
        "observability_base_url",
        "log_level",
        "max_channel_capacity",
        "heartbeat_period",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "agent_type", &self.agent_type)?;
        types::require_nonempty(Self::NAME, "agent_key", &self.agent_key)?;
        types::require_http_url(Self::NAME, "observability_base_url", &self.observability_base_url)?;
        types::require_non_negative(Self::NAME, "heartbeat_period", self.heartbeat_period)?;
        types::ensure_trailing_slash(&mut self.observability_base_url);
        Ok(())
    }
}

// ── http ──────────────────────────────────────────────────────────

/// Settings for the shared asynchronous HTTP client. All durations are
/// seconds.
#[derive(Debug, Clone, Deserialize)]
pub struct HttpClientConfig {
    /// Maximum time to wait for a response to arrive.
    #[serde(default = "defaults::read_timeout")]
    pub read_timeout: f64,
    /// Maximum time to wait for data to be sent.
    #[serde(default = "defaults::write_timeout")]
    pub write_timeout: f64,
    /// Maximum time to wait for a socket connection to a host.
    #[serde(default = "defaults::connection_timeout")]
    pub connection_timeout: f64,
    /// Maximum time to wait for a connection from the pool.
    #[serde(default = "defaults::pool_timeout")]
    pub pool_timeout: f64,
    /// Number of times to retry a failed connection.
    #[serde(default = "defaults::retries")]
    pub retries: u32,
    #[serde(default = "defaults::max_total_connections")]
    pub max_total_connections: usize,
    #[serde(default = "defaults::max_keepalive_connections")]
    pub max_keepalive_connections: usize,
    /// Time limit on idle keep-alive connections, in seconds.
    #[serde(default = "defaults::keepalive_expiration")]
    pub keepalive_expiration: u64,
    #[serde(default = "defaults::yes")]
    pub follow_redirects: bool,
    #[serde(default)]
    pub http2: bool,
    /// Query parameters to include with every request.
    #[serde(default)]
    pub params: Vec<(String, String)>,
    #[serde(default = "defaults::yes")]
    pub ssl_verify: bool,
    /// When verification is enabled, use the certificate bundle at this path
    /// instead of the system default.
    #[serde(default)]
    pub ssl_cert_file: Option<PathBuf>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({}))
            .unwrap_or_else(|_| unreachable!("all fields have defaults"))
    }
}

impl HttpClientConfig {
    fn check(&self, block: &'static str) -> Result<(), ConfigError> {
        for (field, value) in [
            ("read_timeout", self.read_timeout),
            ("write_timeout", self.write_timeout),
            ("connection_timeout", self.connection_timeout),
            ("pool_timeout", self.pool_timeout),
        ] {
            types::require_non_negative(block, field, value)?;
        }
        Ok(())
    }
}

impl ConfigBlock for HttpClientConfig {
    const NAME: &'static str = "http";
    const ENV_PREFIX: &'static str = "DK_HTTP_";
    const FIELDS: &'static [&'static str] = &[
        "read_timeout",
        "write_timeout",
        "connection_timeout",
        "pool_timeout",
        "retries",
        "max_total_connections",
        "max_keepalive_connections",
        "keepalive_expiration",
        "follow_redirects",
        "http2",
        "params",
        "ssl_verify",
        "ssl_cert_file",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.check(Self::NAME)
    }
}

/// Same field set as [`HttpClientConfig`], configured independently for
/// traffic to the Observability ingestion service.
#[derive(Debug, Clone, Deserialize)]
#[serde(transparent)]
pub struct ObservabilityClientConfig(pub HttpClientConfig);

impl ConfigBlock for ObservabilityClientConfig {
    const NAME: &'static str = "observability";
    const ENV_PREFIX: &'static str = "DK_OBSERVABILITY_";
    const FIELDS: &'static [&'static str] = HttpClientConfig::FIELDS;

    fn validate(&mut self) -> Result<(), ConfigError> {
        self.0.check(Self::NAME)
    }
}

mod defaults {
    use super::LogLevel;

    pub fn log_level() -> LogLevel {
        LogLevel::Info
    }
    pub fn heartbeat_period() -> f64 {
        60.0
    }
    pub fn read_timeout() -> f64 {
        60.0
    }
    pub fn write_timeout() -> f64 {
        30.0
    }
    pub fn connection_timeout() -> f64 {
        10.0
    }
    pub fn pool_timeout() -> f64 {
        10.0
    }
    pub fn retries() -> u32 {
        3
    }
    pub fn max_total_connections() -> usize {
        10
    }
    pub fn max_keepalive_connections() -> usize {
        5
    }
    pub fn keepalive_expiration() -> u64 {
        10
    }
    pub fn yes() -> bool {
        true
    }
}
