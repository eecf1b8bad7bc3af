use std::process::ExitCode;
use std::sync::Arc;

use tracing_subscriber::{fmt, EnvFilter};

use pipewatch::agents::{self, AgentContext};
use pipewatch::config::{ConfigRegistry, CoreConfig, HttpClientConfig, ObservabilityClientConfig};
use pipewatch::events::StateStore;

fn init_logging(default_level: &str) {
    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .finish();
    // Ignored when a subscriber is already installed (tests).
    let _ = tracing::subscriber::set_global_default(subscriber);
}

async fn run() -> anyhow::Result<()> {
    let registry = Arc::new(ConfigRegistry::new());

    let core = match registry.register::<CoreConfig>() {
        Ok(core) => core,
        Err(err) => {
            init_logging("info");
            tracing::error!(%err, "configuration validation error");
            return Err(err.into());
        }
    };
    init_logging(core.log_level.as_filter());

    registry.register::<HttpClientConfig>()?;
    registry.register::<ObservabilityClientConfig>()?;

    let context = AgentContext {
        registry,
        state: Arc::new(StateStore::new()),
    };
    agents::run_configured_agent(context).await
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            tracing::error!("error starting up agent: {err:#}");
            ExitCode::from(1)
        }
    }
}
