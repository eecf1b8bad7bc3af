//! Reference agent: forwards run-status records from a WebSocket feed.
//!
//! Intentionally small; it demonstrates the non-HTTP loop shape (a
//! connection-driven loop instead of a periodic poller) with the same
//! outbound pipeline as every other agent.

use std::sync::Arc;

use futures_util::StreamExt;
use serde::{Deserialize, Deserializer};
use serde_json::Value;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use url::Url;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig};
use crate::events::{Event, EventType, Status};
use crate::runtime::{period, Nursery, Sender, TaskError};

use super::{event_channel, parse_timestamp, run_until_shutdown, spawn_outbound, AgentContext};

pub const COMPONENT_TOOL: &str = "example_tool";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentType {
    BatchPipeline,
    Dataset,
}

impl<'de> Deserialize<'de> for ComponentType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match raw.to_ascii_uppercase().as_str() {
            "BATCH_PIPELINE" => Ok(Self::BatchPipeline),
            "DATASET" => Ok(Self::Dataset),
            other => Err(serde::de::Error::custom(format!(
                "expected BATCH_PIPELINE or DATASET, got '{other}'"
            ))),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExampleConfig {
    pub target_url: Url,
    pub component_type: ComponentType,
    #[serde(default = "defaults::timeout")]
    pub timeout: f64,
    #[serde(default = "defaults::period")]
    pub period: f64,
}

mod defaults {
    pub fn timeout() -> f64 {
        120.0
    }
    pub fn period() -> f64 {
        5.0
    }
}

impl ConfigBlock for ExampleConfig {
    const NAME: &'static str = "example";
    const ENV_PREFIX: &'static str = "DK_EXAMPLE_";
    const FIELDS: &'static [&'static str] =
        &["target_url", "component_type", "timeout", "period"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_ws_url(Self::NAME, "target_url", &self.target_url)?;
        types::require_non_negative(Self::NAME, "timeout", self.timeout)?;
        types::require_non_negative(Self::NAME, "period", self.period)
    }
}

/// The fields the feed is expected to carry; everything recognized maps
/// straight onto a run-status event.
#[derive(Debug, Deserialize)]
struct FeedRecord {
    #[serde(default)]
    status: Option<String>,
    #[serde(default)]
    pipeline_key: Option<String>,
    #[serde(default)]
    pipeline_name: Option<String>,
    #[serde(default)]
    run_key: Option<String>,
    #[serde(default)]
    task_key: Option<String>,
    #[serde(default)]
    task_name: Option<String>,
    #[serde(default)]
    event_timestamp: Option<String>,
    #[serde(default)]
    metadata: Option<Value>,
    #[serde(default)]
    external_url: Option<String>,
}

fn parse_status(raw: Option<&str>) -> Status {
    match raw.unwrap_or("").to_ascii_uppercase().as_str() {
        "RUNNING" => Status::Running,
        "COMPLETED" => Status::Completed,
        "COMPLETED_WITH_WARNINGS" => Status::CompletedWithWarnings,
        "FAILED" => Status::Failed,
        _ => Status::Unknown,
    }
}

struct WebsocketTask {
    outbound: Sender<Event>,
}

impl WebsocketTask {
    async fn execute(&mut self, text: &str) -> Result<(), TaskError> {
        let record: FeedRecord = serde_json::from_str(text)
            .map_err(|e| TaskError::failed(format!("unparsable feed message: {e}")))?;

        let mut event = Event::new(EventType::RunStatus);
        event.status = Some(parse_status(record.status.as_deref()));
        event.event_timestamp = record.event_timestamp.as_deref().and_then(parse_timestamp);
        event.pipeline_key = record.pipeline_key;
        event.pipeline_name = record.pipeline_name;
        event.run_key = record.run_key;
        event.task_key = record.task_key;
        event.task_name = record.task_name;
        event.metadata = record.metadata;
        event.external_url = record.external_url;
        event.component_tool = Some(COMPONENT_TOOL.into());
        self.outbound.send(event).await?;
        Ok(())
    }
}

struct WebsocketLoop {
    config: Arc<ExampleConfig>,
    task: WebsocketTask,
}

impl WebsocketLoop {
    async fn run(mut self, nursery: Nursery) {
        let reconnect_delay = period(self.config.period);
        let connect_timeout = period(self.config.timeout);

        while !nursery.is_cancelled() {
            let connected = tokio::time::timeout(
                connect_timeout,
                connect_async(self.config.target_url.as_str()),
            )
            .await;
            let mut stream = match connected {
                Ok(Ok((stream, _response))) => stream,
                Ok(Err(err)) => {
                    tracing::warn!(%err, "websocket connection failed, retrying");
                    tokio::select! {
                        () = nursery.cancelled() => break,
                        () = tokio::time::sleep(reconnect_delay) => continue,
                    }
                }
                Err(_) => {
                    tracing::warn!("websocket connection timed out, retrying");
                    continue;
                }
            };

            loop {
                tokio::select! {
                    () = nursery.cancelled() => return,
                    received = stream.next() => match received {
                        Some(Ok(Message::Text(text))) => {
                            if let Err(err) = self.task.execute(&text).await {
                                tracing::warn!(%err, "uncaught error during task execution");
                            }
                        }
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::warn!(%err, "websocket error, reconnecting");
                            break;
                        }
                        None => {
                            tracing::warn!("connection closed, attempting to reconnect");
                            break;
                        }
                    },
                }
            }
        }
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<ExampleConfig>()?;
    let agent_config = context.registry.lookup::<ExampleConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let socket_loop = WebsocketLoop {
        config: agent_config,
        task: WebsocketTask { outbound },
    };
    nursery.spawn(socket_loop.run(nursery.clone()));
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}
