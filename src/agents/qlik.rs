//! Qlik Cloud agent: enumerates apps, finds reloads started inside the
//! listing window and watches each reload to completion.
//!
//! A reload maps onto a run with a single task; both carry the app id as key
//! and the app name as display name.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig, HttpClientConfig};
use crate::events::{Event, LogLevel, Status};
use crate::http::{get_client, Authenticator, Call, HttpClient, RequestHandle};
use crate::runtime::{period, Nursery, PeriodicLoop, PeriodicTask, Sender, TaskError};

use super::watch::{spawn_watcher, WatchMap};
use super::{
    event_channel, parse_timestamp, run_until_shutdown, spawn_outbound, AgentContext,
};

pub const COMPONENT_TOOL: &str = "qlik";

const API_VERSION: &str = "api/v1";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct QlikConfig {
    #[serde(default)]
    pub tenant: String,
    pub api_key: SecretString,
    #[serde(default = "defaults::base_api_url")]
    pub base_api_url: Url,
    /// App names to observe; empty observes everything.
    #[serde(default)]
    pub apps: Vec<String>,
    #[serde(default = "defaults::timeout")]
    pub timeout: f64,
    #[serde(default = "defaults::period")]
    pub period: f64,
}

mod defaults {
    use url::Url;

    pub fn base_api_url() -> Url {
        Url::parse("https://tenant.us.qlikcloud.com")
            .unwrap_or_else(|_| unreachable!("static URL parses"))
    }
    pub fn timeout() -> f64 {
        120.0
    }
    pub fn period() -> f64 {
        30.0
    }
}

impl ConfigBlock for QlikConfig {
    const NAME: &'static str = "qlik";
    const ENV_PREFIX: &'static str = "DK_QLIK_";
    const FIELDS: &'static [&'static str] =
        &["tenant", "api_key", "base_api_url", "apps", "timeout", "period"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_nonempty(Self::NAME, "api_key", self.api_key.expose_secret())?;
        types::require_http_url(Self::NAME, "base_api_url", &self.base_api_url)?;
        types::require_non_negative(Self::NAME, "timeout", self.timeout)?;
        types::require_non_negative(Self::NAME, "period", self.period)?;
        // The default URL carries a literal "tenant" placeholder host.
        if !self.tenant.is_empty() {
            let substituted = self.base_api_url.as_str().replace("tenant", &self.tenant);
            self.base_api_url = Url::parse(&substituted).map_err(|e| {
                ConfigError::invalid(Self::NAME, format!("base_api_url - {e}"))
            })?;
        }
        types::ensure_trailing_slash(&mut self.base_api_url);
        Ok(())
    }
}

fn get_status(status: &str) -> Status {
    match status.to_ascii_uppercase().as_str() {
        "RELOADING" => Status::Running,
        "SUCCEEDED" => Status::Completed,
        "FAILED" | "CANCELED" | "EXCEEDED_LIMIT" => Status::Failed,
        other => {
            tracing::error!(status = other, "unrecognized status, defaulting to UNKNOWN");
            Status::Unknown
        }
    }
}

/// The app identity a watcher is seeded with, plus listing-time app details
/// kept as metadata.
#[derive(Debug, Clone)]
struct DiscoveredReload {
    app_id: String,
    app_name: String,
    reload_id: String,
    app_details: Value,
}

fn reloads_endpoint(config: &QlikConfig, client: HttpClient) -> RequestHandle {
    RequestHandle::new(
        client,
        config.base_api_url.clone(),
        Method::GET,
        format!("{API_VERSION}/reloads"),
    )
}

async fn latest_reload(endpoint: &RequestHandle, app_id: &str) -> Result<Option<Value>, TaskError> {
    let response = endpoint
        .send(Call::new().query("appId", app_id).query("limit", "1"))
        .await?;
    if !response.status().is_success() {
        tracing::error!(
            app_id,
            status = response.status().as_u16(),
            body = %response.text(),
            "error getting reloads"
        );
        return Ok(None);
    }
    let body: Value = response.json()?;
    Ok(body
        .get("data")
        .and_then(Value::as_array)
        .and_then(|data| data.first())
        .cloned())
}

struct QlikWatchReloadTask {
    endpoint: RequestHandle,
    run: DiscoveredReload,
    status: Status,
    new_run: bool,
    outbound: Sender<Event>,
    done: bool,
}

impl QlikWatchReloadTask {
    fn new(config: &QlikConfig, client: HttpClient, run: DiscoveredReload, outbound: Sender<Event>) -> Self {
        Self {
            endpoint: reloads_endpoint(config, client),
            run,
            status: Status::Unknown,
            new_run: true,
            outbound,
            done: false,
        }
    }

    fn base_event(&self, mut event: Event, reload: &Value) -> Event {
        event.pipeline_key = Some(self.run.app_id.clone());
        event.pipeline_name = Some(self.run.app_name.clone());
        event.run_key = Some(self.run.reload_id.clone());
        event.metadata = Some(json!({
            "reload_id": reload.get("id"),
            "app_id": reload.get("appId"),
            "tenant_id": reload.get("tenantId"),
            "user_id": reload.get("userId"),
            "reload_type": reload.get("type"),
            "partial": reload.get("partial"),
            "creationTime": reload.get("creationTime"),
            "engineTime": reload.get("engineTime"),
            "app_details": self.run.app_details,
        }));
        event.external_url = reload
            .pointer("/links/self/href")
            .and_then(Value::as_str)
            .map(str::to_string);
        event.component_tool = Some(COMPONENT_TOOL.into());
        event
    }

    fn task_scoped(&self, mut event: Event) -> Event {
        event.task_key = Some(self.run.app_id.clone());
        event.task_name = Some(self.run.app_name.clone());
        event
    }
}

#[async_trait]
impl PeriodicTask for QlikWatchReloadTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let Some(reload) = latest_reload(&self.endpoint, &self.run.app_id).await? else {
            return Ok(());
        };

        let previous_status = self.status;
        self.status = get_status(reload.get("status").and_then(Value::as_str).unwrap_or(""));

        if self.new_run {
            let start = reload
                .get("startTime")
                .and_then(Value::as_str)
                .and_then(parse_timestamp);
            let mut task_event =
                self.task_scoped(self.base_event(Event::run_status(Status::Running), &reload));
            task_event.event_timestamp = start;
            self.outbound.send(task_event).await?;

            let mut run_event = self.base_event(Event::run_status(Status::Running), &reload);
            run_event.event_timestamp = start;
            self.outbound.send(run_event).await?;
            self.new_run = false;
        }

        if previous_status != self.status && self.status.finished() {
            let end = reload
                .get("endTime")
                .and_then(Value::as_str)
                .and_then(parse_timestamp);

            if matches!(self.status, Status::CompletedWithWarnings | Status::Failed) {
                let log_text = reload
                    .get("log")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let mut log = self.task_scoped(
                    self.base_event(Event::message_log(LogLevel::Error, log_text), &reload),
                );
                log.event_timestamp = end;
                self.outbound.send(log).await?;
            }

            let mut task_event =
                self.task_scoped(self.base_event(Event::run_status(self.status), &reload));
            task_event.event_timestamp = end;
            self.outbound.send(task_event).await?;

            let mut run_event = self.base_event(Event::run_status(self.status), &reload);
            run_event.event_timestamp = end;
            self.outbound.send(run_event).await?;

            tracing::info!(run_key = self.run.reload_id, status = ?self.status, "reload finished");
            self.done = true;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct QlikListReloadsTask {
    config: Arc<QlikConfig>,
    client: HttpClient,
    apps_endpoint: RequestHandle,
    reloads_endpoint: RequestHandle,
    nursery: Nursery,
    outbound: Sender<Event>,
    watched: WatchMap,
}

impl QlikListReloadsTask {
    fn new(
        context: &AgentContext,
        nursery: Nursery,
        outbound: Sender<Event>,
    ) -> anyhow::Result<Self> {
        let registry = &context.registry;
        let config = registry.lookup::<QlikConfig>()?;
        let auth = Authenticator::bearer(config.api_key.expose_secret());
        let client = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), Some(auth))?;
        let apps_endpoint = RequestHandle::new(
            client.clone(),
            config.base_api_url.clone(),
            Method::GET,
            format!("{API_VERSION}/apps"),
        );
        let reloads_endpoint = reloads_endpoint(&config, client.clone());
        Ok(Self {
            config,
            client,
            apps_endpoint,
            reloads_endpoint,
            nursery,
            outbound,
            watched: WatchMap::new(),
        })
    }

    async fn get_apps(&self) -> Result<Vec<Value>, TaskError> {
        let response = self.apps_endpoint.send(Call::new()).await?;
        if !response.status().is_success() {
            tracing::error!(
                status = response.status().as_u16(),
                body = %response.text(),
                "error getting apps"
            );
            return Ok(Vec::new());
        }
        let body: Value = response.json()?;
        Ok(body
            .get("data")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }
}

#[async_trait]
impl PeriodicTask for QlikListReloadsTask {
    async fn execute(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        for app in self.get_apps().await? {
            let Some(attributes) = app.get("attributes") else {
                continue;
            };
            let (Some(app_id), Some(app_name)) = (
                attributes.get("id").and_then(Value::as_str),
                attributes.get("name").and_then(Value::as_str),
            ) else {
                continue;
            };
            if !self.config.apps.is_empty() && !self.config.apps.iter().any(|name| name == app_name)
            {
                continue;
            }

            let Some(reload) = latest_reload(&self.reloads_endpoint, app_id).await? else {
                continue;
            };
            let Some(start) = reload
                .get("startTime")
                .and_then(Value::as_str)
                .and_then(parse_timestamp)
            else {
                continue;
            };
            if start < previous || start > current {
                continue;
            }
            let Some(reload_id) = reload.get("id").and_then(Value::as_str) else {
                continue;
            };
            if self.watched.contains(reload_id) {
                continue;
            }

            let discovered = DiscoveredReload {
                app_id: app_id.to_string(),
                app_name: app_name.to_string(),
                reload_id: reload_id.to_string(),
                app_details: json!({
                    "app_description": attributes.get("description"),
                    "app_created_date": attributes.get("createdDate"),
                    "app_modified_date": attributes.get("modifiedDate"),
                    "app_owner": attributes.get("owner"),
                    "app_owner_id": attributes.get("ownerId"),
                    "app_published": attributes.get("published"),
                    "app_published_time": attributes.get("publishTime"),
                }),
            };
            tracing::debug!(reload_id, app_name, "reload to be observed");
            let watcher = QlikWatchReloadTask::new(
                &self.config,
                self.client.clone(),
                discovered,
                self.outbound.clone(),
            );
            let finished = spawn_watcher(&self.nursery, period(self.config.period), watcher);
            self.watched.track(reload_id, finished);
        }

        self.watched.reap();
        Ok(())
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<QlikConfig>()?;
    let agent_config = context.registry.lookup::<QlikConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let lister = QlikListReloadsTask::new(&context, nursery.clone(), outbound)?;
    nursery.spawn(PeriodicLoop::new(period(agent_config.period), lister).run(nursery.clone()));
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}
