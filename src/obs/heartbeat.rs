//! Liveness signal, orthogonal to the event pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Serialize;

use crate::config::{ConfigRegistry, CoreConfig, ObservabilityClientConfig};
use crate::events::StateStore;
use crate::http::{get_client, Authenticator, Call, RequestHandle, TokenAuth};
use crate::runtime::{PeriodicTask, TaskError};

use super::{SERVICE_ACCOUNT_KEY_HEADER, UNAUTHORIZED_MESSAGE};

use secrecy::ExposeSecret;

const VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Serialize)]
struct HeartbeatBody<'a> {
    key: &'a str,
    tool: &'a str,
    /// Explicit `null` until the first event goes out.
    latest_event_timestamp: Option<DateTime<Utc>>,
    version: &'a str,
}

pub struct HeartbeatTask {
    handle: RequestHandle,
    agent_key: String,
    tool: &'static str,
    state: Arc<StateStore>,
}

impl HeartbeatTask {
    pub fn new(
        registry: &ConfigRegistry,
        state: Arc<StateStore>,
        tool: &'static str,
    ) -> anyhow::Result<Self> {
        let core = registry.lookup::<CoreConfig>()?;
        let obs_config = registry.lookup::<ObservabilityClientConfig>()?;
        let auth = Authenticator::Token(TokenAuth::new(
            core.observability_service_account_key.expose_secret(),
            "",
            SERVICE_ACCOUNT_KEY_HEADER,
        ));
        let client = get_client(&obs_config.0, Some(auth))?;
        let handle = RequestHandle::new(
            client,
            core.observability_base_url.clone(),
            Method::POST,
            "agent/v1/heartbeat",
        );
        Ok(Self {
            handle,
            agent_key: core.agent_key.clone(),
            tool,
            state,
        })
    }
}

#[async_trait]
impl PeriodicTask for HeartbeatTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let body = HeartbeatBody {
            key: &self.agent_key,
            tool: self.tool,
            latest_event_timestamp: self.state.latest_event_timestamp(),
            version: VERSION,
        };
        let response = self
            .handle
            .send(Call::new().body(serde_json::to_value(&body)?))
            .await?;

        match response.status() {
            StatusCode::UNAUTHORIZED => Err(TaskError::Unrecoverable(UNAUTHORIZED_MESSAGE.into())),
            status if status.is_success() => {
                tracing::debug!("heartbeat sent");
                Ok(())
            }
            status => Err(TaskError::failed(format!(
                "heartbeat returned status {status}"
            ))),
        }
    }
}
