//! Request handles: one handle per logical API call.
//!
//! A handle owns a base URL, a relative path template with named
//! placeholders, an HTTP method and optional per-status retry rules. Each
//! `send` runs the full retry ladder, strictly in this order: rate-limit
//! headers, the 401 soft-failure heuristic, configured status retries.

use std::time::Duration;

use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use url::Url;

use super::client::HttpClient;
use super::HttpError;

/// Header names commonly used to indicate how long a rate-limited endpoint
/// wants callers to wait.
pub const RATE_LIMIT_HEADERS: [&str; 3] =
    ["X-RateLimit-Reset", "RateLimit-Reset", "X-Rate-Limit-Reset"];

/// Rate-limit values above this are treated as absolute Unix timestamps
/// rather than wait durations.
const RATE_LIMIT_TIMESTAMP_CUTOFF: f64 = 86_400.0;

const AUTH_RETRY_TEXT: &str = "please try again in a bit";
const AUTH_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, Clone, Copy)]
pub struct RetryRule {
    pub status: StatusCode,
    pub retry_count: u32,
    pub backoff_multiplier: f64,
}

impl RetryRule {
    pub fn new(status: StatusCode, retry_count: u32) -> Self {
        Self {
            status,
            retry_count,
            backoff_multiplier: 1.0,
        }
    }

    pub fn with_backoff(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }
}

/// Per-call arguments: query parameters, JSON body, path substitutions and
/// extra headers.
#[derive(Debug, Default, Clone)]
pub struct Call {
    query: Vec<(String, String)>,
    body: Option<Value>,
    path_args: Vec<(&'static str, String)>,
    headers: Vec<(String, String)>,
}

impl Call {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn query(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.query.push((key.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Value) -> Self {
        self.body = Some(body);
        self
    }

    pub fn path_arg(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.path_args.push((name, value.into()));
        self
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// A buffered response: status, headers and body bytes. Buffering lets the
/// retry ladder inspect the body and still hand it to the caller.
#[derive(Debug)]
pub struct ApiResponse {
    status: StatusCode,
    headers: HeaderMap,
    body: Vec<u8>,
}

impl ApiResponse {
    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn headers(&self) -> &HeaderMap {
        &self.headers
    }

    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }

    pub fn json<T: DeserializeOwned>(&self) -> Result<T, HttpError> {
        serde_json::from_slice(&self.body).map_err(|e| HttpError::Decode(e.to_string()))
    }

    pub fn error_for_status(&self, context: &str) -> Result<(), HttpError> {
        if self.status.is_client_error() || self.status.is_server_error() {
            Err(HttpError::Status {
                status: self.status,
                context: context.to_string(),
            })
        } else {
            Ok(())
        }
    }
}

pub struct RequestHandle {
    client: HttpClient,
    base_url: Url,
    method: Method,
    path: String,
    retry_rules: Vec<RetryRule>,
}

impl RequestHandle {
    pub fn new(client: HttpClient, base_url: Url, method: Method, path: impl Into<String>) -> Self {
        Self {
            client,
            base_url,
            method,
            path: path.into(),
            retry_rules: Vec::new(),
        }
    }

    pub fn with_retry(mut self, rule: RetryRule) -> Self {
        self.retry_rules.push(rule);
        self
    }

    fn render_url(&self, call: &Call) -> Result<Url, HttpError> {
        let mut path = self.path.clone();
        for (name, value) in &call.path_args {
            path = path.replace(&format!("{{{name}}}"), value);
        }
        if path.contains('{') {
            return Err(HttpError::UnfilledPlaceholder(path));
        }
        self.base_url
            .join(&path)
            .map_err(|e| HttpError::BadUrl(format!("{path}: {e}")))
    }

    async fn dispatch_once(&self, url: &Url, call: &Call) -> Result<ApiResponse, HttpError> {
        let mut request = self.client.inner.request(self.method.clone(), url.clone());
        if !self.client.default_params.is_empty() {
            request = request.query(&self.client.default_params);
        }
        if !call.query.is_empty() {
            request = request.query(&call.query);
        }
        for (name, value) in &call.headers {
            request = request.header(name, value);
        }
        if let Some(body) = &call.body {
            request = request.json(body);
        }
        if let Some(auth) = &self.client.auth {
            request = auth.apply(request).await?;
        }
        let response = request.send().await?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?.to_vec();
        Ok(ApiResponse {
            status,
            headers,
            body,
        })
    }

    /// One dispatch, with connection-level failures retried up to the
    /// client's configured budget.
    async fn dispatch(&self, url: &Url, call: &Call) -> Result<ApiResponse, HttpError> {
        let mut attempt = 0u32;
        loop {
            match self.dispatch_once(url, call).await {
                Ok(response) => return Ok(response),
                Err(HttpError::Transport(err))
                    if err.is_connect() && attempt < self.client.connect_retries =>
                {
                    attempt += 1;
                    tracing::info!(url = %url, %err, attempt, "connection failed, retrying");
                }
                Err(err) => return Err(err),
            }
        }
    }

    pub async fn send(&self, call: Call) -> Result<ApiResponse, HttpError> {
        let url = self.render_url(&call)?;
        let mut response = self.dispatch(&url, &call).await?;

        // Honor rate-limit headers, replaying the same request after each
        // wait; a replay that is itself rate-limited waits again.
        while let Some(wait) = rate_limit_wait(&response.headers, self.client.read_timeout) {
            tracing::debug!(seconds = wait.as_secs_f64(), "sleeping to honor rate-limit headers");
            tokio::time::sleep(wait).await;
            response = self.dispatch(&url, &call).await?;
        }

        // A 401 whose body carries the known retry text is a soft failure
        // seen from Auth0 and GitHub Enterprise; it gets its own bounded
        // retry budget independent of the configured rules.
        if response.status == StatusCode::UNAUTHORIZED && has_retry_text(&response.text()) {
            for attempt in 1..=AUTH_RETRY_ATTEMPTS {
                let wait = 0.5 * 2f64.powi(attempt as i32 - 1);
                tracing::debug!(seconds = wait, "sleeping before authentication retry");
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                response = self.dispatch(&url, &call).await?;
                if !(response.status == StatusCode::UNAUTHORIZED && has_retry_text(&response.text()))
                {
                    return Ok(response);
                }
            }
            return Ok(response);
        }

        if let Some(rule) = self
            .retry_rules
            .iter()
            .find(|rule| rule.status == response.status)
            .copied()
        {
            for attempt in 1..=rule.retry_count {
                let wait = rule.backoff_multiplier * 2f64.powi(attempt as i32 - 1);
                tokio::time::sleep(Duration::from_secs_f64(wait)).await;
                response = self.dispatch(&url, &call).await?;
                if response.status != rule.status {
                    break;
                }
            }
        }
        Ok(response)
    }
}

/// Check for response text that correlates with a rate-limited
/// authentication attempt; such responses carry no rate-limit headers.
fn has_retry_text(body: &str) -> bool {
    body.contains(AUTH_RETRY_TEXT)
}

/// How long the rate-limit headers ask us to wait, clamped to the read
/// timeout and never negative. `None` when no usable header is present.
fn rate_limit_wait(headers: &HeaderMap, read_timeout: Duration) -> Option<Duration> {
    let raw = RATE_LIMIT_HEADERS.iter().find_map(|name| {
        headers
            .get(*name)
            .and_then(|v| v.to_str().ok())
            .filter(|value| !value.is_empty())
    })?;

    let value: f64 = match raw.parse() {
        Ok(parsed) => parsed,
        Err(_) => {
            tracing::warn!(value = raw, "ignored invalid rate limit value");
            return None;
        }
    };
    if value == 0.0 {
        return None;
    }

    let wait = if value > RATE_LIMIT_TIMESTAMP_CUTOFF {
        value - Utc::now().timestamp() as f64
    } else {
        value
    };
    let timeout = read_timeout.as_secs_f64();
    let clamped = if wait > timeout {
        tracing::warn!(
            wait,
            timeout,
            "rate limit value is longer than the request timeout setting; using the timeout"
        );
        timeout
    } else {
        wait.max(0.0)
    };
    Some(Duration::from_secs_f64(clamped))
}
