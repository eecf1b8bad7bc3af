//! SSIS agent: the monitored tool is the SSIS catalog database rather than
//! an API, and logical tasks are reconstructed from row streams.

pub mod catalog;
pub mod core;
pub mod state;
pub mod tasks;

pub use self::core::COMPONENT_TOOL;

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig, NetworkPort};
use crate::runtime::{channel, period, ChannelReceiveLoop, Nursery, PeriodicLoop};

use catalog::SqlServerCatalog;
use tasks::{
    FetchNewExecutionsTask, FindAddedStatisticsTask, FindUpdatedExecutionsTask,
    HandleNewStatisticsTask, HandleUpdatedExecutionTask,
};

use super::{event_channel, run_until_shutdown, spawn_outbound, AgentContext};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SsisConfig {
    pub db_host: String,
    #[serde(default)]
    pub db_port: NetworkPort,
    #[serde(default = "defaults::db_name")]
    pub db_name: String,
    pub db_user: String,
    pub db_password: SecretString,
    /// Seconds between catalog polls.
    #[serde(default = "defaults::polling_interval")]
    pub polling_interval: f64,
}

mod defaults {
    pub fn db_name() -> String {
        "SSISDB".to_string()
    }
    pub fn polling_interval() -> f64 {
        30.0
    }
}

impl ConfigBlock for SsisConfig {
    const NAME: &'static str = "ssis";
    const ENV_PREFIX: &'static str = "DK_SSIS_";
    const FIELDS: &'static [&'static str] = &[
        "db_host",
        "db_port",
        "db_name",
        "db_user",
        "db_password",
        "polling_interval",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "db_host", &self.db_host)?;
        types::require_nonempty(Self::NAME, "db_user", &self.db_user)?;
        types::require_nonempty(Self::NAME, "db_password", self.db_password.expose_secret())?;
        types::require_non_negative(Self::NAME, "polling_interval", self.polling_interval)
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<SsisConfig>()?;
    let agent_config = context.registry.lookup::<SsisConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;

    let catalog: Arc<dyn catalog::SsisCatalog> = Arc::new(SqlServerCatalog::new(agent_config.clone()));
    let agent_state = state::shared_state();
    let poll = period(agent_config.polling_interval);

    let (event_tx, event_rx) = event_channel(&core);
    let (execution_tx, execution_rx) = channel(core.max_channel_capacity);
    let (statistic_tx, statistic_rx) = channel(core.max_channel_capacity);

    let nursery = Nursery::new();
    nursery.spawn(
        PeriodicLoop::new(poll, FetchNewExecutionsTask::new(catalog.clone(), agent_state.clone()))
            .run(nursery.clone()),
    );
    nursery.spawn(
        PeriodicLoop::new(
            poll,
            FindUpdatedExecutionsTask::new(catalog.clone(), agent_state.clone(), execution_tx),
        )
        .run(nursery.clone()),
    );
    nursery.spawn(
        ChannelReceiveLoop::new(
            execution_rx,
            HandleUpdatedExecutionTask::new(agent_state.clone(), event_tx.clone()),
        )
        .run(nursery.clone()),
    );
    nursery.spawn(
        PeriodicLoop::new(
            poll,
            FindAddedStatisticsTask::new(catalog.clone(), agent_state.clone(), statistic_tx),
        )
        .run(nursery.clone()),
    );
    nursery.spawn(
        ChannelReceiveLoop::new(
            statistic_rx,
            HandleNewStatisticsTask::new(agent_state.clone(), event_tx),
        )
        .run(nursery.clone()),
    );
    spawn_outbound(&nursery, &context, event_rx, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}
