//! Credential configuration blocks. One of these, when present, decides how
//! an agent authenticates against its target tool.

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use url::Url;

use super::registry::ConfigBlock;
use super::types::{self, ConfigError};

#[derive(Debug, Clone, Deserialize)]
pub struct UsernamePasswordConfig {
    pub agent_username: String,
    pub agent_password: SecretString,
}

impl ConfigBlock for UsernamePasswordConfig {
    const NAME: &'static str = "auth_username_password";
    const ENV_PREFIX: &'static str = "DK_";
    const FIELDS: &'static [&'static str] = &["agent_username", "agent_password"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "agent_username", &self.agent_username)?;
        types::require_nonempty(Self::NAME, "agent_password", self.agent_password.expose_secret())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiTokenConfig {
    pub agent_token: SecretString,
}

impl ConfigBlock for ApiTokenConfig {
    const NAME: &'static str = "auth_api_token";
    const ENV_PREFIX: &'static str = "DK_";
    const FIELDS: &'static [&'static str] = &["agent_token"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "agent_token", self.agent_token.expose_secret())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureServicePrincipalConfig {
    pub client_id: String,
    pub client_secret: SecretString,
    pub tenant_id: String,
    /// OAuth scope; agents may supply a tool default when this is empty.
    #[serde(default)]
    pub scope: String,
}

impl ConfigBlock for AzureServicePrincipalConfig {
    const NAME: &'static str = "auth_azure_spn";
    const ENV_PREFIX: &'static str = "DK_AZURE_";
    const FIELDS: &'static [&'static str] = &["client_id", "client_secret", "tenant_id", "scope"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "client_id", &self.client_id)?;
        types::require_nonempty(Self::NAME, "client_secret", self.client_secret.expose_secret())?;
        types::require_nonempty(Self::NAME, "tenant_id", &self.tenant_id)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AzureBasicOauthConfig {
    pub client_id: String,
    pub username: String,
    pub password: SecretString,
    pub tenant_id: String,
    #[serde(default)]
    pub scope: String,
    #[serde(default = "default_authority")]
    pub authority: Url,
}

fn default_authority() -> Url {
    Url::parse("https://login.microsoftonline.com")
        .unwrap_or_else(|_| unreachable!("static URL parses"))
}

impl ConfigBlock for AzureBasicOauthConfig {
    const NAME: &'static str = "auth_azure_basic_oauth";
    const ENV_PREFIX: &'static str = "DK_AZURE_";
    const FIELDS: &'static [&'static str] = &[
        "client_id",
        "username",
        "password",
        "tenant_id",
        "scope",
        "authority",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "client_id", &self.client_id)?;
        types::require_nonempty(Self::NAME, "username", &self.username)?;
        types::require_nonempty(Self::NAME, "password", self.password.expose_secret())?;
        types::require_nonempty(Self::NAME, "tenant_id", &self.tenant_id)?;
        types::require_http_url(Self::NAME, "authority", &self.authority)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigRegistry;
    use std::path::PathBuf;

    #[test]
    fn empty_token_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(&path, "[auth_api_token]\nagent_token = \"\"\n").unwrap();
        let registry = ConfigRegistry::with_paths(vec![path]);
        assert!(!registry.available::<ApiTokenConfig>());
    }

    #[test]
    fn spn_scope_defaults_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[auth_azure_spn]\nclient_id = \"c\"\nclient_secret = \"s\"\ntenant_id = \"t\"\n",
        )
        .unwrap();
        let registry = ConfigRegistry::with_paths(vec![path]);
        let spn = registry.register::<AzureServicePrincipalConfig>().unwrap();
        assert!(spn.scope.is_empty());
    }

    #[test]
    fn basic_oauth_authority_has_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("agent.toml");
        std::fs::write(
            &path,
            "[auth_azure_basic_oauth]\nclient_id = \"c\"\nusername = \"u\"\n\
             password = \"p\"\ntenant_id = \"t\"\n",
        )
        .unwrap();
        let registry = ConfigRegistry::with_paths(vec![path]);
        let cfg = registry.register::<AzureBasicOauthConfig>().unwrap();
        assert_eq!(cfg.authority.host_str(), Some("login.microsoftonline.com"));
    }

    #[test]
    fn missing_block_is_not_available() {
        let registry = ConfigRegistry::with_paths(vec![PathBuf::from("/nope.toml")]);
        assert!(!registry.available::<UsernamePasswordConfig>());
    }
}
