//! Reusable asynchronous HTTP client configured from an [`HttpClientConfig`]
//! block.

use std::time::Duration;

use reqwest::redirect;

use crate::config::HttpClientConfig;

use super::auth::Authenticator;
use super::HttpError;

/// A configured client plus the request-level settings the handle layer
/// needs: authentication, the read timeout used to clamp rate-limit waits,
/// the connect retry budget and default query parameters.
#[derive(Clone)]
pub struct HttpClient {
    pub(crate) inner: reqwest::Client,
    pub(crate) auth: Option<Authenticator>,
    pub(crate) read_timeout: Duration,
    pub(crate) connect_retries: u32,
    pub(crate) default_params: Vec<(String, String)>,
}

impl HttpClient {
    pub fn read_timeout(&self) -> Duration {
        self.read_timeout
    }
}

/// Build a client from the block. The pool caps idle connections per host;
/// redirects, TLS verification and HTTP/2 follow the block's settings.
pub fn get_client(
    config: &HttpClientConfig,
    auth: Option<Authenticator>,
) -> Result<HttpClient, HttpError> {
    let mut builder = reqwest::Client::builder()
        .connect_timeout(Duration::from_secs_f64(config.connection_timeout))
        .timeout(Duration::from_secs_f64(config.read_timeout))
        .pool_idle_timeout(Duration::from_secs(config.keepalive_expiration))
        .pool_max_idle_per_host(config.max_keepalive_connections)
        .redirect(if config.follow_redirects {
            redirect::Policy::limited(10)
        } else {
            redirect::Policy::none()
        });

    if config.http2 {
        builder = builder.http2_prior_knowledge();
    }

    if config.ssl_verify {
        if let Some(path) = &config.ssl_cert_file {
            let pem = std::fs::read(path)
                .map_err(|e| HttpError::Tls(format!("{}: {e}", path.display())))?;
            let cert = reqwest::Certificate::from_pem(&pem)
                .map_err(|e| HttpError::Tls(e.to_string()))?;
            builder = builder.add_root_certificate(cert);
        }
    } else {
        builder = builder.danger_accept_invalid_certs(true);
    }

    let inner = builder.build()?;
    Ok(HttpClient {
        inner,
        auth,
        read_timeout: Duration::from_secs_f64(config.read_timeout),
        connect_retries: config.retries,
        default_params: config.params.clone(),
    })
}
