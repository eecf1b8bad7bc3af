//! Synapse Analytics agent: queries pipeline runs updated in the listing
//! window, watches each run, and tracks its activities.
//!
//! The run's terminal status must be seen on two consecutive ticks before the
//! run is finalized: the run status is always current while the activity
//! query is time-ranged, so activities reported after the run ended would
//! otherwise be lost.

mod activities;

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::{
    registry::ConfigBlock, types, AzureServicePrincipalConfig, ConfigError, CoreConfig,
    HttpClientConfig,
};
use crate::events::{Event, Status};
use crate::http::auth::AzureSpnAuth;
use crate::http::{get_client, Authenticator, Call, HttpClient, RequestHandle};
use crate::runtime::{period, Nursery, PeriodicLoop, PeriodicTask, Sender, TaskError};

use activities::{ActivityRecord, ActivityState};

use super::watch::{spawn_watcher, WatchMap};
use super::{event_channel, run_until_shutdown, spawn_outbound, AgentContext};

pub const COMPONENT_TOOL: &str = "synapse_analytics";

/// Scope for tokens presented to the Synapse data plane.
pub const SYNAPSE_SCOPE: &str = "https://dev.azuresynapse.net/.default";

const API_VERSION: &str = "2020-12-01";
const BASE_CLICK_BACK_URL: &str = "https://web.azuresynapse.net/en/monitoring/pipelineruns";
const WORKSPACE_ID_TEMPLATE: &str =
    "/subscriptions/{subscription}/resourceGroups/{resource_group}/providers/Microsoft.Synapse/workspaces/{workspace}";

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct SynapseConfig {
    #[serde(default = "default_period")]
    pub period: f64,
    pub workspace_name: String,
    /// Only required to generate links back to Synapse.
    #[serde(default)]
    pub subscription_id: Option<String>,
    /// Only required to generate links back to Synapse.
    #[serde(default)]
    pub resource_group_name: Option<String>,
    /// Exact pipeline names to monitor; empty monitors everything.
    #[serde(default)]
    pub pipelines_filter: Vec<String>,
}

fn default_period() -> f64 {
    5.0
}

impl SynapseConfig {
    pub fn client_endpoint(&self) -> Url {
        Url::parse(&format!("https://{}.dev.azuresynapse.net", self.workspace_name))
            .unwrap_or_else(|_| unreachable!("validated workspace name forms a valid host"))
    }

    pub fn workspace_id(&self) -> Option<String> {
        match (&self.subscription_id, &self.resource_group_name) {
            (Some(subscription), Some(resource_group)) => Some(
                WORKSPACE_ID_TEMPLATE
                    .replace("{subscription}", subscription)
                    .replace("{resource_group}", resource_group)
                    .replace("{workspace}", &self.workspace_name),
            ),
            _ => None,
        }
    }
}

impl ConfigBlock for SynapseConfig {
    const NAME: &'static str = "synapse_analytics";
    const ENV_PREFIX: &'static str = "DK_SYNAPSE_ANALYTICS_";
    const FIELDS: &'static [&'static str] = &[
        "period",
        "workspace_name",
        "subscription_id",
        "resource_group_name",
        "pipelines_filter",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_non_negative(Self::NAME, "period", self.period)?;
        types::require_nonempty(Self::NAME, "workspace_name", &self.workspace_name)?;
        if self.subscription_id.is_some() != self.resource_group_name.is_some() {
            return Err(ConfigError::invalid(
                Self::NAME,
                "set both subscription_id and resource_group_name to generate links back to Synapse",
            ));
        }
        Ok(())
    }
}

pub(super) fn get_status(status: Option<&str>) -> Status {
    match status {
        Some("InProgress") => Status::Running,
        Some("Succeeded") => Status::Completed,
        Some("Uncertain") => Status::CompletedWithWarnings,
        // Canceled shows up in the docs but Cancelled shows up in the UI.
        Some("Failed" | "Cancelled" | "Canceled") => Status::Failed,
        Some("Queued" | "Cancelling" | "Canceling") => Status::Unknown,
        Some(other) => {
            tracing::warn!(status = other, "unrecognized status");
            Status::Unknown
        }
        None => {
            tracing::warn!("status is not set");
            Status::Unknown
        }
    }
}

fn pipeline_click_back_url(config: &SynapseConfig, run_id: &str) -> Option<String> {
    let workspace_id = config.workspace_id()?;
    let query = url::form_urlencoded::Serializer::new(String::new())
        .append_pair("workspace", &workspace_id)
        .finish();
    Some(format!("{BASE_CLICK_BACK_URL}/{run_id}?{query}"))
}

#[derive(Debug, Clone)]
struct RunIdentity {
    pipeline_name: String,
    run_id: String,
}

/// Windowed activity polling for one watched run, with per-activity state.
struct MonitorActivities {
    config: std::sync::Arc<SynapseConfig>,
    endpoint: RequestHandle,
    run: RunIdentity,
    /// The first poll reaches back to the lister tick that discovered the
    /// run, so activities started before the watcher are not missed.
    initial_start_time: Option<DateTime<Utc>>,
    watched: HashMap<String, ActivityState>,
    outbound: Sender<Event>,
}

impl MonitorActivities {
    fn new(
        config: std::sync::Arc<SynapseConfig>,
        client: HttpClient,
        run: RunIdentity,
        initial_start_time: DateTime<Utc>,
        outbound: Sender<Event>,
    ) -> Self {
        let endpoint = RequestHandle::new(
            client,
            config.client_endpoint(),
            Method::POST,
            "pipelines/{pipeline_name}/pipelineruns/{run_id}/queryActivityruns",
        );
        Self {
            config,
            endpoint,
            run,
            initial_start_time: Some(initial_start_time),
            watched: HashMap::new(),
            outbound,
        }
    }

    async fn update(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let window_start = self.initial_start_time.take().unwrap_or(previous);
        let mut continuation: Option<String> = None;
        loop {
            let mut body = json!({
                "lastUpdatedAfter": window_start.to_rfc3339(),
                "lastUpdatedBefore": current.to_rfc3339(),
            });
            if let Some(token) = &continuation {
                body["continuationToken"] = json!(token);
            }
            let response = self
                .endpoint
                .send(
                    Call::new()
                        .query("api-version", API_VERSION)
                        .path_arg("pipeline_name", self.run.pipeline_name.as_str())
                        .path_arg("run_id", self.run.run_id.as_str())
                        .body(body),
                )
                .await?;
            if !response.status().is_success() {
                return Err(TaskError::failed(format!(
                    "activity query for run {} returned status {}",
                    self.run.run_id,
                    response.status()
                )));
            }
            let page: Value = response.json()?;

            for raw in page.get("value").and_then(Value::as_array).into_iter().flatten() {
                let record: ActivityRecord = match serde_json::from_value(raw.clone()) {
                    Ok(record) => record,
                    Err(err) => {
                        tracing::error!(%err, "activity run not valid, skipping");
                        continue;
                    }
                };
                if !self.watched.contains_key(&record.activity_name) {
                    tracing::info!(
                        run_key = self.run.run_id,
                        activity = record.activity_name,
                        activity_type = record.activity_type,
                        "new activity"
                    );
                    self.watched.insert(
                        record.activity_name.clone(),
                        ActivityState::new(&self.config, record.clone(), self.outbound.clone()),
                    );
                }
                if let Some(state) = self.watched.get_mut(&record.activity_name) {
                    state.update(&record).await?;
                }
            }

            continuation = page
                .get("continuationToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }

        let finished: Vec<String> = self
            .watched
            .values()
            .filter(|state| state.finished())
            .map(|state| state.name().to_string())
            .collect();
        for name in finished {
            tracing::info!(activity = name, "activity finished");
            self.watched.remove(&name);
        }
        Ok(())
    }
}

struct SynapseMonitorRunTask {
    config: std::sync::Arc<SynapseConfig>,
    run_endpoint: RequestHandle,
    run: RunIdentity,
    activities: MonitorActivities,
    status: Status,
    finish_counter: u32,
    click_back_url: Option<String>,
    outbound: Sender<Event>,
    done: bool,
}

impl SynapseMonitorRunTask {
    fn new(
        config: std::sync::Arc<SynapseConfig>,
        client: HttpClient,
        run: RunIdentity,
        initial_start_time: DateTime<Utc>,
        outbound: Sender<Event>,
    ) -> Self {
        let run_endpoint = RequestHandle::new(
            client.clone(),
            config.client_endpoint(),
            Method::GET,
            "pipelineruns/{run_id}",
        );
        let click_back_url = pipeline_click_back_url(&config, &run.run_id);
        let activities = MonitorActivities::new(
            config.clone(),
            client,
            run.clone(),
            initial_start_time,
            outbound.clone(),
        );
        Self {
            config,
            run_endpoint,
            run,
            activities,
            status: Status::Unknown,
            finish_counter: 0,
            click_back_url,
            outbound,
            done: false,
        }
    }

    async fn send_run_status(
        &self,
        status: Status,
        timestamp: Option<&str>,
        metadata: Value,
    ) -> Result<(), TaskError> {
        let mut event = Event::run_status(status);
        event.event_timestamp = timestamp.and_then(super::parse_timestamp);
        event.metadata = Some(metadata);
        event.pipeline_key = Some(self.run.pipeline_name.clone());
        event.run_key = Some(self.run.run_id.clone());
        event.external_url = self.click_back_url.clone();
        event.component_tool = Some(COMPONENT_TOOL.into());
        if status == Status::Running {
            event.pipeline_name = Some(self.run.pipeline_name.clone());
        }
        self.outbound.send(event).await?;
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for SynapseMonitorRunTask {
    async fn execute(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let response = self
            .run_endpoint
            .send(
                Call::new()
                    .query("api-version", API_VERSION)
                    .path_arg("run_id", self.run.run_id.as_str()),
            )
            .await?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            tracing::error!(run_key = self.run.run_id, "run not found");
            self.done = true;
            return Ok(());
        }
        if !response.status().is_success() {
            return Err(TaskError::failed(format!(
                "get pipeline run {} returned status {}",
                self.run.run_id,
                response.status()
            )));
        }
        let record: Value = response.json()?;

        let previous_status = self.status;
        let observed = get_status(record.get("status").and_then(Value::as_str));
        if observed != Status::Unknown {
            self.status = observed;
        }

        if previous_status == Status::Unknown && self.status != Status::Unknown {
            tracing::debug!(run_key = self.run.run_id, "run started");
            let metadata = json!({
                "parameters": record.get("parameters"),
                "invoked_by": record.get("invokedBy"),
            });
            self.send_run_status(
                Status::Running,
                record.get("runStart").and_then(Value::as_str),
                metadata,
            )
            .await?;
        }

        self.activities.update(current, previous).await?;

        // The run status is current while activities are time-ranged; demand
        // the terminal status twice in a row before closing the run.
        if observed.finished() {
            self.finish_counter += 1;
        } else {
            self.finish_counter = 0;
        }
        if self.finish_counter >= 2 {
            tracing::info!(run_key = self.run.run_id, status = ?observed, "run finished");
            let metadata = json!({"run_duration_ms": record.get("durationInMs")});
            self.send_run_status(
                observed,
                record.get("runEnd").and_then(Value::as_str),
                metadata,
            )
            .await?;
            self.done = true;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct SynapseListRunsTask {
    config: std::sync::Arc<SynapseConfig>,
    client: HttpClient,
    endpoint: RequestHandle,
    nursery: Nursery,
    outbound: Sender<Event>,
    watched: WatchMap,
}

impl SynapseListRunsTask {
    fn new(
        context: &AgentContext,
        nursery: Nursery,
        outbound: Sender<Event>,
    ) -> anyhow::Result<Self> {
        let registry = &context.registry;
        let config = registry.lookup::<SynapseConfig>()?;
        let spn = registry.lookup::<AzureServicePrincipalConfig>()?;
        let scope = if spn.scope.is_empty() {
            SYNAPSE_SCOPE.to_string()
        } else {
            spn.scope.clone()
        };
        let token_client = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), None)?;
        let auth = Authenticator::AzureServicePrincipal(std::sync::Arc::new(AzureSpnAuth::new(
            &spn.tenant_id,
            spn.client_id.clone(),
            spn.client_secret.clone(),
            scope,
            token_client.inner.clone(),
        )));
        let client = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), Some(auth))?;
        let endpoint = RequestHandle::new(
            client.clone(),
            config.client_endpoint(),
            Method::POST,
            "queryPipelineRuns",
        );
        tracing::debug!(filter = ?config.pipelines_filter, "observing Synapse pipelines");
        Ok(Self {
            config,
            client,
            endpoint,
            nursery,
            outbound,
            watched: WatchMap::new(),
        })
    }
}

#[async_trait]
impl PeriodicTask for SynapseListRunsTask {
    async fn execute(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        tracing::debug!("requesting Synapse run list");
        let mut continuation: Option<String> = None;
        loop {
            let mut body = json!({
                "lastUpdatedAfter": previous.to_rfc3339(),
                "lastUpdatedBefore": current.to_rfc3339(),
            });
            if !self.config.pipelines_filter.is_empty() {
                body["filters"] = json!([{
                    "operand": "PipelineName",
                    "operator": "In",
                    "values": self.config.pipelines_filter,
                }]);
            }
            if let Some(token) = &continuation {
                body["continuationToken"] = json!(token);
            }

            let response = self
                .endpoint
                .send(Call::new().query("api-version", API_VERSION).body(body))
                .await?;
            if !response.status().is_success() {
                return Err(TaskError::failed(format!(
                    "pipeline run query returned status {}",
                    response.status()
                )));
            }
            let page: Value = response.json()?;

            for run in page.get("value").and_then(Value::as_array).into_iter().flatten() {
                let (Some(pipeline_name), Some(run_id)) = (
                    run.get("pipelineName").and_then(Value::as_str),
                    run.get("runId").and_then(Value::as_str),
                ) else {
                    tracing::error!("pipeline run does not have all required fields set, skipping");
                    continue;
                };
                if self.watched.contains(run_id) {
                    continue;
                }
                tracing::debug!(pipeline_name, run_id, "found new run");
                let monitor = SynapseMonitorRunTask::new(
                    self.config.clone(),
                    self.client.clone(),
                    RunIdentity {
                        pipeline_name: pipeline_name.to_string(),
                        run_id: run_id.to_string(),
                    },
                    previous,
                    self.outbound.clone(),
                );
                let finished = spawn_watcher(&self.nursery, period(self.config.period), monitor);
                self.watched.track(run_id, finished);
            }

            continuation = page
                .get("continuationToken")
                .and_then(Value::as_str)
                .map(str::to_string);
            if continuation.is_none() {
                break;
            }
        }

        self.watched.reap();
        Ok(())
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<SynapseConfig>()?;
    context.registry.register::<AzureServicePrincipalConfig>()?;
    let agent_config = context.registry.lookup::<SynapseConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;
    if agent_config.workspace_id().is_none() {
        tracing::warn!(
            "subscription id and resource group name are not configured; no Synapse URLs will be generated"
        );
    }

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let lister = SynapseListRunsTask::new(&context, nursery.clone(), outbound)?;
    nursery.spawn(PeriodicLoop::new(period(agent_config.period), lister).run(nursery.clone()));
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn bare_config() -> SynapseConfig {
        let mut config = SynapseConfig {
            period: 5.0,
            workspace_name: "ws".into(),
            subscription_id: None,
            resource_group_name: None,
            pipelines_filter: Vec::new(),
        };
        config.validate().unwrap();
        config
    }

    fn test_client() -> HttpClient {
        get_client(&HttpClientConfig::default(), None).unwrap()
    }

    /// Watcher whose endpoints point at the mock server instead of the real
    /// workspace host.
    fn monitor_against(
        server: &MockServer,
        outbound: Sender<Event>,
    ) -> SynapseMonitorRunTask {
        let config = std::sync::Arc::new(bare_config());
        let base = Url::parse(&server.uri()).unwrap();
        let run = RunIdentity {
            pipeline_name: "nightly".into(),
            run_id: "run-1".into(),
        };
        let mut task = SynapseMonitorRunTask::new(
            config.clone(),
            test_client(),
            run.clone(),
            Utc::now(),
            outbound.clone(),
        );
        task.run_endpoint =
            RequestHandle::new(test_client(), base.clone(), Method::GET, "pipelineruns/{run_id}");
        task.activities.endpoint = RequestHandle::new(
            test_client(),
            base,
            Method::POST,
            "pipelines/{pipeline_name}/pipelineruns/{run_id}/queryActivityruns",
        );
        task
    }

    #[test]
    fn status_mapping_handles_both_cancelled_spellings() {
        assert_eq!(get_status(Some("InProgress")), Status::Running);
        assert_eq!(get_status(Some("Succeeded")), Status::Completed);
        assert_eq!(get_status(Some("Uncertain")), Status::CompletedWithWarnings);
        assert_eq!(get_status(Some("Cancelled")), Status::Failed);
        assert_eq!(get_status(Some("Canceled")), Status::Failed);
        assert_eq!(get_status(Some("Queued")), Status::Unknown);
        assert_eq!(get_status(None), Status::Unknown);
    }

    #[test]
    fn workspace_id_requires_both_halves() {
        assert_eq!(bare_config().workspace_id(), None);

        let mut partial = bare_config();
        partial.subscription_id = Some("sub".into());
        assert!(partial.validate().is_err());

        let mut full = bare_config();
        full.subscription_id = Some("sub".into());
        full.resource_group_name = Some("rg".into());
        full.validate().unwrap();
        assert_eq!(
            full.workspace_id().unwrap(),
            "/subscriptions/sub/resourceGroups/rg/providers/Microsoft.Synapse/workspaces/ws"
        );
    }

    #[tokio::test]
    async fn run_is_finalized_only_after_two_consecutive_terminal_ticks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/pipelineruns/run-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "runId": "run-1",
                "status": "InProgress",
                "runStart": "2024-05-01T00:00:00Z",
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/pipelineruns/run-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "runId": "run-1",
                "status": "Succeeded",
                "runEnd": "2024-05-01T00:30:00Z",
                "durationInMs": 1_800_000,
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"value": []})))
            .mount(&server)
            .await;

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut task = monitor_against(&server, tx);

        let now = Utc::now();
        task.execute(now, now).await.unwrap(); // InProgress
        assert!(!task.is_done());
        task.execute(now, now).await.unwrap(); // Succeeded, first sighting
        assert!(!task.is_done());
        task.execute(now, now).await.unwrap(); // Succeeded, second sighting
        assert!(task.is_done());
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, Some(Status::Running));
        assert_eq!(events[0].pipeline_name.as_deref(), Some("nightly"));
        assert_eq!(events[1].status, Some(Status::Completed));
        assert_eq!(
            events[1].metadata.as_ref().unwrap()["run_duration_ms"],
            1_800_000
        );
        assert_eq!(
            events[1].event_timestamp.unwrap().to_rfc3339(),
            "2024-05-01T00:30:00+00:00"
        );
    }

    #[tokio::test]
    async fn missing_run_finishes_the_watcher_quietly() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut task = monitor_against(&server, tx);
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        assert!(task.is_done());
        drop(task);
        assert!(rx.recv().await.is_none());
    }
}
