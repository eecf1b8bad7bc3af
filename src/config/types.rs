//! Semantic value types and validation errors shared by all config blocks.

use serde::{Deserialize, Deserializer, Serialize};
use url::Url;

/// Failure modes of the configuration registry.
///
/// Every variant is fatal at process start: `main` logs the message on a
/// single line and exits with status 1.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration block '{0}' is already registered")]
    AlreadyRegistered(&'static str),
    #[error("configuration block '{0}' is not registered")]
    NotRegistered(&'static str),
    #[error("[{block}] {detail}")]
    Invalid { block: &'static str, detail: String },
    #[error("could not parse configuration file {path}: {detail}")]
    FileParse { path: String, detail: String },
}

impl ConfigError {
    pub fn invalid(block: &'static str, detail: impl Into<String>) -> Self {
        Self::Invalid {
            block,
            detail: detail.into(),
        }
    }
}

/// TCP port, restricted to the valid range for network port numbers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct NetworkPort(u16);

impl NetworkPort {
    pub fn get(self) -> u16 {
        self.0
    }
}

impl<'de> Deserialize<'de> for NetworkPort {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u32::deserialize(deserializer)?;
        if (1..=u32::from(u16::MAX)).contains(&raw) {
            Ok(Self(raw as u16))
        } else {
            Err(serde::de::Error::custom(format!(
                "port {raw} outside 1..65535"
            )))
        }
    }
}

impl Default for NetworkPort {
    fn default() -> Self {
        Self(1433)
    }
}

/// Reject non-finite or negative durations expressed in seconds.
pub fn require_non_negative(
    block: &'static str,
    field: &str,
    value: f64,
) -> Result<(), ConfigError> {
    if value.is_finite() && value >= 0.0 {
        Ok(())
    } else {
        Err(ConfigError::invalid(
            block,
            format!("{field} - must be a non-negative number of seconds"),
        ))
    }
}

pub fn require_nonempty(block: &'static str, field: &str, value: &str) -> Result<(), ConfigError> {
    if value.trim().is_empty() {
        Err(ConfigError::invalid(
            block,
            format!("{field} - must not be empty"),
        ))
    } else {
        Ok(())
    }
}

pub fn require_http_url(block: &'static str, field: &str, value: &Url) -> Result<(), ConfigError> {
    match value.scheme() {
        "http" | "https" => Ok(()),
        other => Err(ConfigError::invalid(
            block,
            format!("{field} - expected an http(s) URL, got scheme '{other}'"),
        )),
    }
}

pub fn require_ws_url(block: &'static str, field: &str, value: &Url) -> Result<(), ConfigError> {
    match value.scheme() {
        "ws" | "wss" => Ok(()),
        other => Err(ConfigError::invalid(
            block,
            format!("{field} - expected a ws(s) URL, got scheme '{other}'"),
        )),
    }
}

/// Base URLs are joined with relative paths, which silently drops the last
/// path segment unless the URL ends with a slash.
pub fn ensure_trailing_slash(url: &mut Url) {
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
}
