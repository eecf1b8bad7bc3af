//! Typed configuration blocks and the process-wide registry.
//!
//! Configuration is a set of named blocks, each a validated struct. Blocks are
//! filled from (highest precedence first) explicit overrides, `DK_*`
//! environment variables, a TOML file, and schema defaults. Secret values are
//! wrapped in [`secrecy::SecretString`] and never appear in log output.

pub mod auth;
pub mod registry;
pub mod schema;
pub mod sources;
pub mod types;

pub use auth::{
    ApiTokenConfig, AzureBasicOauthConfig, AzureServicePrincipalConfig, UsernamePasswordConfig,
};
pub use registry::{ConfigBlock, ConfigRegistry};
pub use schema::{CoreConfig, HttpClientConfig, ObservabilityClientConfig};
pub use types::{ConfigError, NetworkPort};
