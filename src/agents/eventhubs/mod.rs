//! Azure Event Hubs agent, consuming the namespace's Kafka-compatible
//! endpoint.
//!
//! The librdkafka consumer runs its own threaded scheduler, so this agent is
//! the one place a second OS thread exists: the consumer thread pushes
//! message payloads into a bounded synchronous queue, and the cooperative
//! side drains that queue into the parser task. Offset commits happen on the
//! consumer thread on every delivery attempt, even while the queue is full.

mod parsers;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver as SyncReceiver, SyncSender, TryRecvError, TrySendError};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, CommitMode, Consumer};
use rdkafka::Message;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig};
use crate::events::Event;
use crate::runtime::{ChannelTask, Nursery, Sender, TaskError};

use parsers::{AdfParser, EventHubParser, UnknownStatusParser};

use super::{event_channel, run_until_shutdown, spawn_outbound, AgentContext};

pub const COMPONENT_TOOL: &str = "eventhubs";

/// Longest the consumer blocks waiting for a message before it re-checks for
/// shutdown.
const CONSUMER_POLL_WAIT: Duration = Duration::from_secs(5);

const BRIDGE_QUEUE_SIZE: usize = 10;
const QUEUE_POP_SLEEP: Duration = Duration::from_secs(2);
const QUEUE_PUT_SLEEP: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EventHubsConfig {
    /// Event hub (topic) name.
    pub name: String,
    pub connection_string: SecretString,
    /// The record families the agent will attempt to handle.
    pub message_types: Vec<String>,
    #[serde(default = "defaults::consumer_group")]
    pub consumer_group: String,
    /// "-1" reads the hub from the beginning; "@latest" from now on.
    #[serde(default = "defaults::starting_position")]
    pub starting_position: String,
}

mod defaults {
    pub fn consumer_group() -> String {
        "$Default".to_string()
    }
    pub fn starting_position() -> String {
        "-1".to_string()
    }
}

impl ConfigBlock for EventHubsConfig {
    const NAME: &'static str = "eventhubs";
    const ENV_PREFIX: &'static str = "DK_AZURE_EVENTHUB_";
    const FIELDS: &'static [&'static str] = &[
        "name",
        "connection_string",
        "message_types",
        "consumer_group",
        "starting_position",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "name", &self.name)?;
        types::require_nonempty(
            Self::NAME,
            "connection_string",
            self.connection_string.expose_secret(),
        )?;
        if self.message_types.is_empty() {
            return Err(ConfigError::invalid(
                Self::NAME,
                "message_types - at least one message type is required",
            ));
        }
        match self.starting_position.as_str() {
            "-1" | "@latest" => Ok(()),
            other => Err(ConfigError::invalid(
                Self::NAME,
                format!("starting_position - unsupported value '{other}'"),
            )),
        }
    }
}

/// Marker block: when present, consumed offsets are committed so a restart
/// resumes where the previous process stopped. Without it no checkpointing
/// is done.
#[derive(Debug, Clone, Deserialize)]
pub struct BlobStorageConfig {
    pub name: String,
}

impl ConfigBlock for BlobStorageConfig {
    const NAME: &'static str = "blob_storage";
    const ENV_PREFIX: &'static str = "DK_AZURE_BLOB_";
    const FIELDS: &'static [&'static str] = &["name"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "name", &self.name)
    }
}

/// The namespace host embedded in an Event Hubs connection string
/// (`Endpoint=sb://<host>/;...`).
fn namespace_host(connection_string: &str) -> Option<String> {
    connection_string
        .split(';')
        .find_map(|part| part.strip_prefix("Endpoint=sb://"))
        .map(|endpoint| endpoint.trim_end_matches('/').to_string())
        .filter(|host| !host.is_empty())
}

fn build_consumer(config: &EventHubsConfig) -> Result<BaseConsumer, String> {
    let host = namespace_host(config.connection_string.expose_secret())
        .ok_or_else(|| "connection string has no Endpoint".to_string())?;
    let offset_reset = if config.starting_position == "@latest" {
        "latest"
    } else {
        "earliest"
    };
    ClientConfig::new()
        .set("bootstrap.servers", format!("{host}:9093"))
        .set("security.protocol", "SASL_SSL")
        .set("sasl.mechanism", "PLAIN")
        .set("sasl.username", "$ConnectionString")
        .set("sasl.password", config.connection_string.expose_secret())
        .set("group.id", &config.consumer_group)
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", offset_reset)
        .create()
        .map_err(|e| e.to_string())
}

/// Runs on the dedicated consumer thread: polls the broker and pushes
/// payloads into the bridge queue. The offset commit runs on every delivery
/// attempt, including the ones that found the queue full.
fn consumer_thread(
    config: Arc<EventHubsConfig>,
    bridge: SyncSender<Vec<u8>>,
    commit_checkpoints: bool,
    shutdown: Arc<AtomicBool>,
) {
    let consumer = match build_consumer(&config) {
        Ok(consumer) => consumer,
        Err(err) => {
            tracing::error!(%err, "could not create the Event Hubs consumer");
            return;
        }
    };
    if let Err(err) = consumer.subscribe(&[&config.name]) {
        tracing::error!(%err, hub = config.name, "could not subscribe to the event hub");
        return;
    }
    tracing::debug!(hub = config.name, "consumer thread started");

    while !shutdown.load(Ordering::Acquire) {
        let message = match consumer.poll(CONSUMER_POLL_WAIT) {
            None => continue,
            Some(Err(err)) => {
                tracing::warn!(%err, "consumer poll failed");
                continue;
            }
            Some(Ok(message)) => message,
        };
        let mut pending = message.payload().map(<[u8]>::to_vec).unwrap_or_default();
        loop {
            let result = bridge.try_send(pending);
            if commit_checkpoints {
                if let Err(err) = consumer.commit_message(&message, CommitMode::Async) {
                    tracing::warn!(%err, "offset commit failed");
                }
            }
            match result {
                Ok(()) => break,
                Err(TrySendError::Full(returned)) => {
                    if shutdown.load(Ordering::Acquire) {
                        return;
                    }
                    pending = returned;
                    std::thread::sleep(QUEUE_PUT_SLEEP);
                }
                Err(TrySendError::Disconnected(_)) => return,
            }
        }
    }
    tracing::debug!("consumer thread stopping");
}

/// Parses raw event payloads and publishes the resulting events.
struct EventHubReceiveTask {
    parsers: Vec<Box<dyn EventHubParser>>,
    outbound: Sender<Event>,
}

impl EventHubReceiveTask {
    fn new(config: &EventHubsConfig, outbound: Sender<Event>) -> anyhow::Result<Self> {
        let mut parsers: Vec<Box<dyn EventHubParser>> = vec![Box::new(UnknownStatusParser)];
        for message_type in &config.message_types {
            match message_type.as_str() {
                "ADF" => parsers.push(Box::new(AdfParser::new())),
                other => anyhow::bail!("unknown message type {other}"),
            }
        }
        Ok(Self { parsers, outbound })
    }
}

#[async_trait]
impl ChannelTask for EventHubReceiveTask {
    type Item = Vec<u8>;

    async fn execute(&mut self, payload: Vec<u8>) -> Result<(), TaskError> {
        if payload.is_empty() {
            return Ok(());
        }
        let body: Value = match serde_json::from_slice(&payload) {
            Ok(body) => body,
            Err(err) => {
                tracing::warn!(%err, "could not retrieve event as JSON");
                return Ok(());
            }
        };
        let Some(records) = body.get("records").and_then(Value::as_array) else {
            tracing::warn!("event carries no records array");
            return Ok(());
        };

        for record in records {
            let Some(record) = record.as_object() else {
                continue;
            };
            tracing::info!(
                category = record.get("category").and_then(serde_json::Value::as_str).unwrap_or("#"),
                pipeline = record.get("pipelineName").and_then(serde_json::Value::as_str).unwrap_or("#"),
                status = record.get("status").and_then(serde_json::Value::as_str).unwrap_or("#"),
                "processing event"
            );
            for parser in &self.parsers {
                if !parser.applies(record) {
                    continue;
                }
                match parser.publish(record) {
                    Ok(events) => {
                        for event in events {
                            self.outbound.send(event).await?;
                        }
                    }
                    Err(err) => tracing::error!(%err, "error processing record"),
                }
                break;
            }
        }
        Ok(())
    }
}

/// Bridges the consumer thread's queue into the cooperative scheduler.
struct EventHubLoop {
    config: Arc<EventHubsConfig>,
    commit_checkpoints: bool,
    task: EventHubReceiveTask,
}

impl EventHubLoop {
    async fn run(mut self, nursery: Nursery) {
        let (bridge_tx, bridge_rx): (SyncSender<Vec<u8>>, SyncReceiver<Vec<u8>>) =
            std::sync::mpsc::sync_channel(BRIDGE_QUEUE_SIZE);
        let shutdown = Arc::new(AtomicBool::new(false));

        let thread = {
            let config = self.config.clone();
            let shutdown = shutdown.clone();
            let commit = self.commit_checkpoints;
            std::thread::Builder::new()
                .name("eventhub-consumer".into())
                .spawn(move || consumer_thread(config, bridge_tx, commit, shutdown))
        };
        let thread = match thread {
            Ok(handle) => handle,
            Err(err) => {
                nursery.fail(format!("could not start the consumer thread: {err}"));
                return;
            }
        };

        loop {
            if nursery.is_cancelled() {
                break;
            }
            match bridge_rx.try_recv() {
                Ok(payload) => {
                    if let Err(err) = self.task.execute(payload).await {
                        if err.is_unrecoverable() {
                            nursery.fail(err.to_string());
                            break;
                        }
                        tracing::warn!(%err, "uncaught error during task execution");
                    }
                }
                Err(TryRecvError::Empty) => {
                    tokio::select! {
                        () = nursery.cancelled() => break,
                        () = tokio::time::sleep(QUEUE_POP_SLEEP) => {}
                    }
                }
                Err(TryRecvError::Disconnected) => {
                    tracing::warn!("consumer thread is gone, stopping the bridge loop");
                    break;
                }
            }
        }

        shutdown.store(true, Ordering::Release);
        drop(bridge_rx);
        // Bounded by the consumer poll wait.
        if thread.join().is_err() {
            tracing::error!("consumer thread panicked");
        }
        self.task.close().await;
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<EventHubsConfig>()?;
    let agent_config = context.registry.lookup::<EventHubsConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;
    let commit_checkpoints = context.registry.available::<BlobStorageConfig>();
    if !commit_checkpoints {
        tracing::warn!("no blob_storage block configured; offsets will not be checkpointed");
    }

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let bridge = EventHubLoop {
        config: agent_config.clone(),
        commit_checkpoints,
        task: EventHubReceiveTask::new(&agent_config, outbound)?,
    };
    nursery.spawn(bridge.run(nursery.clone()));
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}
