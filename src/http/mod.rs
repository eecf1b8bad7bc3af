//! HTTP request layer: client construction, pluggable authentication, and
//! request handles with retry and rate-limit handling.

pub mod auth;
pub mod client;
pub mod handle;

pub use auth::{load_agent_authenticator, Authenticator, TokenAuth};
pub use client::{get_client, HttpClient};
pub use handle::{ApiResponse, Call, RequestHandle, RetryRule};

use reqwest::StatusCode;

#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("path template left placeholders unfilled: '{0}'")]
    UnfilledPlaceholder(String),
    #[error("invalid request URL: {0}")]
    BadUrl(String),
    #[error("{context} failed with status {status}")]
    Status { status: StatusCode, context: String },
    #[error("could not decode response body: {0}")]
    Decode(String),
    #[error("token refresh failed: {0}")]
    TokenRefresh(String),
    #[error("TLS configuration error: {0}")]
    Tls(String),
}
