//! The single consumer of the outbound event channel: posts each event to
//! the ingestion API.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Method, StatusCode};

use crate::config::{ConfigRegistry, CoreConfig, ObservabilityClientConfig};
use crate::events::{Event, StateStore};
use crate::http::{get_client, Authenticator, Call, RequestHandle, TokenAuth};
use crate::runtime::{ChannelTask, TaskError};

use super::{SERVICE_ACCOUNT_KEY_HEADER, UNAUTHORIZED_MESSAGE};

use secrecy::ExposeSecret;

pub struct EventSenderTask {
    handle: RequestHandle,
    state: Arc<StateStore>,
}

impl EventSenderTask {
    pub fn new(registry: &ConfigRegistry, state: Arc<StateStore>) -> anyhow::Result<Self> {
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
            "events/v1/{event_type}",
        );
        Ok(Self { handle, state })
    }
}

#[async_trait]
impl ChannelTask for EventSenderTask {
    type Item = Event;

    async fn execute(&mut self, event: Event) -> Result<(), TaskError> {
        let event_type = event.event_type.path();
        let body = serde_json::to_value(&event)?;
        let response = self
            .handle
            .send(Call::new().path_arg("event_type", event_type).body(body))
            .await?;

        match response.status() {
            StatusCode::BAD_REQUEST => {
                tracing::error!(body = %response.text(), "error posting event to Observability");
                Ok(())
            }
            StatusCode::UNAUTHORIZED => Err(TaskError::Unrecoverable(UNAUTHORIZED_MESSAGE.into())),
            status if status.is_success() => {
                tracing::info!(event_type, status = status.as_u16(), "event sent");
                self.state.record_event_sent(Utc::now());
                Ok(())
            }
            status => Err(TaskError::failed(format!(
                "event post returned status {status}"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::Status;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn sender_against(server: &MockServer) -> (EventSenderTask, Arc<StateStore>) {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("agent.toml");
        std::fs::write(
            &config_path,
            format!(
                "[core]\nagent_type = \"airflow\"\nagent_key = \"agent-1\"\n\
                 observability_service_account_key = \"sa-key\"\n\
                 observability_base_url = \"{}\"\n",
                server.uri()
            ),
        )
        .unwrap();
        let registry = ConfigRegistry::with_paths(vec![config_path]);
        registry.register::<CoreConfig>().unwrap();
        registry.register::<ObservabilityClientConfig>().unwrap();
        let state = Arc::new(StateStore::new());
        let task = EventSenderTask::new(&registry, state.clone()).unwrap();
        (task, state)
    }

    fn sample_event() -> Event {
        let mut event = Event::run_status(Status::Running);
        event.run_key = Some("r1".into());
        event.pipeline_key = Some("p1".into());
        event
    }

    #[tokio::test]
    async fn events_route_by_type_with_the_service_account_header() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/events/v1/run-status"))
            .and(header(SERVICE_ACCOUNT_KEY_HEADER, "sa-key"))
            .respond_with(ResponseTemplate::new(202))
            .expect(1)
            .mount(&server)
            .await;

        let (mut task, state) = sender_against(&server).await;
        task.execute(sample_event()).await.unwrap();
        assert!(state.latest_event_timestamp().is_some());
    }

    #[tokio::test]
    async fn bad_request_is_logged_and_swallowed() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(400).set_body_json(serde_json::json!({
                "error": "unknown field"
            })))
            .mount(&server)
            .await;

        let (mut task, state) = sender_against(&server).await;
        assert!(task.execute(sample_event()).await.is_ok());
        assert_eq!(state.latest_event_timestamp(), None);
    }

    #[tokio::test]
    async fn unauthorized_is_unrecoverable() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(401))
            .mount(&server)
            .await;

        let (mut task, _state) = sender_against(&server).await;
        let err = task.execute(sample_event()).await.unwrap_err();
        assert!(err.is_unrecoverable());
    }

    #[tokio::test]
    async fn other_failures_are_ordinary_task_errors() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&server)
            .await;

        let (mut task, state) = sender_against(&server).await;
        let err = task.execute(sample_event()).await.unwrap_err();
        assert!(!err.is_unrecoverable());
        assert_eq!(state.latest_event_timestamp(), None);
    }

    #[tokio::test]
    async fn body_excludes_the_discriminator() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200))
            .mount(&server)
            .await;

        let (mut task, _state) = sender_against(&server).await;
        task.execute(sample_event()).await.unwrap();

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        assert!(body.get("event_type").is_none());
        assert_eq!(body["run_key"], "r1");
    }
}
