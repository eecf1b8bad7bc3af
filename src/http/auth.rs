//! Authentication capabilities attached to HTTP clients.
//!
//! Static token and basic auth inject headers directly; the Azure OAuth
//! variants cache a bearer token and serialize refreshes through an async
//! mutex, so at most one token request is in flight at a time. A caller that
//! was waiting on the mutex re-reads the cache before refreshing itself.

use std::sync::Arc;
use std::time::{Duration, Instant};

use secrecy::{ExposeSecret, SecretString};
use tokio::sync::Mutex;
use url::Url;

use crate::config::{
    ApiTokenConfig, AzureBasicOauthConfig, AzureServicePrincipalConfig, ConfigRegistry,
    HttpClientConfig, UsernamePasswordConfig,
};

use super::client::get_client;
use super::HttpError;

/// Buffer time in seconds subtracted from token expirations.
pub const SECONDS_BEFORE_EXP: u64 = 300;

#[derive(Clone)]
pub enum Authenticator {
    Token(TokenAuth),
    Basic {
        username: String,
        password: SecretString,
    },
    AzureServicePrincipal(Arc<AzureSpnAuth>),
    AzureResourceOwnerPassword(Arc<AzureRopAuth>),
}

impl Authenticator {
    pub fn bearer(token: &str) -> Self {
        Self::Token(TokenAuth::new(token, "Bearer", "Authorization"))
    }

    pub fn basic(username: String, password: SecretString) -> Self {
        Self::Basic { username, password }
    }

    pub async fn apply(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<reqwest::RequestBuilder, HttpError> {
        match self {
            Self::Token(token) => Ok(request.header(token.header_name.as_str(), token.header_value())),
            Self::Basic { username, password } => {
                Ok(request.basic_auth(username, Some(password.expose_secret())))
            }
            Self::AzureServicePrincipal(auth) => Ok(request.bearer_auth(auth.bearer().await?)),
            Self::AzureResourceOwnerPassword(auth) => Ok(request.bearer_auth(auth.bearer().await?)),
        }
    }
}

/// Injects a configurable header; defaults to `Authorization: Bearer <token>`.
/// The prefix may be empty, in which case the bare token is sent.
#[derive(Clone)]
pub struct TokenAuth {
    header_name: String,
    value: SecretString,
}

impl TokenAuth {
    pub fn new(token: &str, token_prefix: &str, header_name: &str) -> Self {
        let value = format!("{token_prefix} {token}").trim().to_string();
        Self {
            header_name: header_name.to_string(),
            value: value.into(),
        }
    }

    fn header_value(&self) -> &str {
        self.value.expose_secret()
    }
}

#[derive(serde::Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Default)]
struct TokenCache {
    token: Option<String>,
    expires_at: Option<Instant>,
}

impl TokenCache {
    fn valid_token(&self) -> Option<String> {
        match (&self.token, self.expires_at) {
            (Some(token), Some(expires_at)) if Instant::now() < expires_at => Some(token.clone()),
            _ => None,
        }
    }

    fn store(&mut self, token: String, ttl: Duration) {
        self.token = Some(token);
        self.expires_at = Some(Instant::now() + ttl);
    }
}

/// OAuth 2.0 client-credentials against the Microsoft identity platform.
pub struct AzureSpnAuth {
    token_url: Url,
    client_id: String,
    client_secret: SecretString,
    scope: String,
    http: reqwest::Client,
    cache: Mutex<TokenCache>,
}

impl AzureSpnAuth {
    pub fn new(
        tenant_id: &str,
        client_id: String,
        client_secret: SecretString,
        scope: String,
        http: reqwest::Client,
    ) -> Self {
        let token_url = Url::parse(&format!(
            "https://login.microsoftonline.com/{tenant_id}/oauth2/v2.0/authorize"
        ))
        .unwrap_or_else(|_| unreachable!("tenant id forms a valid URL path segment"));
        Self {
            token_url,
            client_id,
            client_secret,
            scope,
            http,
            cache: Mutex::new(TokenCache::default()),
        }
    }

    /// Point token refreshes somewhere else (sovereign clouds, tests).
    pub fn with_token_url(mut self, token_url: Url) -> Self {
        self.token_url = token_url;
        self
    }

    async fn bearer(&self) -> Result<String, HttpError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.valid_token() {
            return Ok(token);
        }
        tracing::info!("refreshing Azure service principal token");
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "client_credentials"),
                ("scope", self.scope.as_str()),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.expose_secret()),
            ])
            .send()
            .await
            .map_err(|e| HttpError::TokenRefresh(e.to_string()))?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| HttpError::TokenRefresh(e.to_string()))?;
        // Service principal tokens are valid for an hour; the response is not
        // consulted for the expiration.
        cache.store(body.access_token.clone(), Duration::from_secs(3600 - SECONDS_BEFORE_EXP));
        tracing::info!("Azure service principal token refreshed");
        Ok(body.access_token)
    }
}

/// OAuth 2.0 resource-owner password grant against a configurable authority.
pub struct AzureRopAuth {
    token_url: Url,
    client_id: String,
    username: String,
    password: SecretString,
    scope: String,
    http: reqwest::Client,
    cache: Mutex<TokenCache>,
}

impl AzureRopAuth {
    pub fn new(config: &AzureBasicOauthConfig, scope: String, http: reqwest::Client) -> Self {
        let token_url = Url::parse(&format!(
            "{}/{}/oauth2/v2.0/token",
            config.authority.as_str().trim_end_matches('/'),
            config.tenant_id
        ))
        .unwrap_or_else(|_| unreachable!("validated authority joins cleanly"));
        Self {
            token_url,
            client_id: config.client_id.clone(),
            username: config.username.clone(),
            password: config.password.clone(),
            scope,
            http,
            cache: Mutex::new(TokenCache::default()),
        }
    }

    pub fn with_token_url(mut self, token_url: Url) -> Self {
        self.token_url = token_url;
        self
    }

    async fn bearer(&self) -> Result<String, HttpError> {
        let mut cache = self.cache.lock().await;
        if let Some(token) = cache.valid_token() {
            return Ok(token);
        }
        tracing::info!("refreshing Azure OAuth basic token");
        let response = self
            .http
            .post(self.token_url.clone())
            .form(&[
                ("grant_type", "password"),
                ("client_id", self.client_id.as_str()),
                ("username", self.username.as_str()),
                ("password", self.password.expose_secret()),
                ("scope", self.scope.as_str()),
            ])
            .send()
            .await
            .map_err(|e| HttpError::TokenRefresh(e.to_string()))?;
        let body: TokenResponse = response
            .json()
            .await
            .map_err(|e| HttpError::TokenRefresh(e.to_string()))?;
        let ttl = body.expires_in.unwrap_or(3600).saturating_sub(SECONDS_BEFORE_EXP);
        cache.store(body.access_token.clone(), Duration::from_secs(ttl));
        tracing::info!("Azure OAuth basic token refreshed");
        Ok(body.access_token)
    }
}

/// Build the authenticator for whichever credential block is configured.
///
/// Probe order: username/password, API token, Azure service principal, Azure
/// basic OAuth. The Azure variants need a scope from either their block or
/// the agent's `default_scope`.
pub fn load_agent_authenticator(
    registry: &ConfigRegistry,
    default_scope: &str,
) -> anyhow::Result<Authenticator> {
    if registry.available::<UsernamePasswordConfig>() {
        let cfg = registry.lookup::<UsernamePasswordConfig>()?;
        return Ok(Authenticator::basic(
            cfg.agent_username.clone(),
            cfg.agent_password.clone(),
        ));
    }
    if registry.available::<ApiTokenConfig>() {
        let cfg = registry.lookup::<ApiTokenConfig>()?;
        return Ok(Authenticator::bearer(cfg.agent_token.expose_secret()));
    }
    if registry.available::<AzureServicePrincipalConfig>() {
        let cfg = registry.lookup::<AzureServicePrincipalConfig>()?;
        let scope = resolve_scope(&cfg.scope, default_scope, "Azure service principal")?;
        let http = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), None)?;
        return Ok(Authenticator::AzureServicePrincipal(Arc::new(
            AzureSpnAuth::new(
                &cfg.tenant_id,
                cfg.client_id.clone(),
                cfg.client_secret.clone(),
                scope,
                http.inner,
            ),
        )));
    }
    if registry.available::<AzureBasicOauthConfig>() {
        let cfg = registry.lookup::<AzureBasicOauthConfig>()?;
        let scope = resolve_scope(&cfg.scope, default_scope, "Azure basic OAuth")?;
        let http = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), None)?;
        return Ok(Authenticator::AzureResourceOwnerPassword(Arc::new(
            AzureRopAuth::new(&cfg, scope, http.inner),
        )));
    }
    anyhow::bail!("no suitable set of credentials found in configuration or environment")
}

fn resolve_scope(configured: &str, default_scope: &str, kind: &str) -> anyhow::Result<String> {
    let scope = if configured.is_empty() {
        default_scope
    } else {
        configured
    };
    anyhow::ensure!(
        !scope.is_empty(),
        "this agent does not have a scope configured for {kind} authentication"
    );
    Ok(scope.to_string())
}
