//! Tool-specific agents plus the scaffolding they share: the agent context,
//! the watcher bookkeeping, and the outbound sender/heartbeat wiring.

pub mod airflow;
pub mod databricks;
pub mod eventhubs;
pub mod example;
pub mod powerbi;
pub mod qlik;
pub mod ssis;
pub mod synapse;
pub mod watch;

use std::sync::Arc;

use crate::config::{ConfigRegistry, CoreConfig};
use crate::events::{Event, StateStore};
use crate::obs::{EventSenderTask, HeartbeatTask};
use crate::runtime::{channel, period, ChannelReceiveLoop, Nursery, PeriodicLoop, Receiver, Sender};

/// Root object threaded through the startup sequence; owns the process-wide
/// singletons.
#[derive(Clone)]
pub struct AgentContext {
    pub registry: Arc<ConfigRegistry>,
    pub state: Arc<StateStore>,
}

/// Dispatch to the agent selected by `core.agent_type`.
pub async fn run_configured_agent(context: AgentContext) -> anyhow::Result<()> {
    let core = context.registry.lookup::<CoreConfig>()?;
    match core.agent_type.as_str() {
        "airflow" => airflow::run(context).await,
        "databricks" => databricks::run(context).await,
        "qlik" => qlik::run(context).await,
        "power_bi" => powerbi::run(context).await,
        "synapse_analytics" => synapse::run(context).await,
        "ssis" => ssis::run(context).await,
        "eventhubs" => eventhubs::run(context).await,
        "example_agent" => example::run(context).await,
        other => anyhow::bail!("nonexistent agent: {other}"),
    }
}

/// The agent's outbound event channel, sized by `core.max_channel_capacity`.
pub fn event_channel(core: &CoreConfig) -> (Sender<Event>, Receiver<Event>) {
    channel(core.max_channel_capacity)
}

/// Wire up the shared tail of every agent: the event sender draining the
/// outbound channel and the heartbeat loop.
pub fn spawn_outbound(
    nursery: &Nursery,
    context: &AgentContext,
    outbound: Receiver<Event>,
    tool: &'static str,
) -> anyhow::Result<()> {
    let core = context.registry.lookup::<CoreConfig>()?;
    let sender = EventSenderTask::new(&context.registry, context.state.clone())?;
    nursery.spawn(ChannelReceiveLoop::new(outbound, sender).run(nursery.clone()));

    let heartbeat = HeartbeatTask::new(&context.registry, context.state.clone(), tool)?;
    nursery.spawn(PeriodicLoop::new(period(core.heartbeat_period), heartbeat).run(nursery.clone()));
    Ok(())
}

/// Parse a tool-supplied RFC 3339 timestamp into UTC.
pub(crate) fn parse_timestamp(raw: &str) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .ok()
        .map(|ts| ts.with_timezone(&chrono::Utc))
}

/// Millisecond epoch timestamps, as used by the Databricks API.
pub(crate) fn timestamp_from_millis(millis: i64) -> Option<chrono::DateTime<chrono::Utc>> {
    chrono::DateTime::from_timestamp_millis(millis)
}

/// Block until the nursery drains, shutting down gracefully on SIGINT.
pub async fn run_until_shutdown(nursery: Nursery) -> anyhow::Result<()> {
    let signal_scope = nursery.clone();
    nursery.spawn(async move {
        tokio::select! {
            () = signal_scope.cancelled() => {}
            result = tokio::signal::ctrl_c() => {
                if result.is_ok() {
                    tracing::info!("interrupt received, shutting down");
                }
                signal_scope.cancel();
            }
        }
    });
    nursery.wait().await?;
    Ok(())
}
