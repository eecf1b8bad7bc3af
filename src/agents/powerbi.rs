//! Power BI agent: watches dataset refreshes.
//!
//! A dataset is the pipeline, a refresh is the run. The fetcher keeps the
//! group/dataset inventory current and runs one refresh monitor per
//! refreshable dataset; monitors are ended when their group or dataset
//! disappears from the user's access.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig, HttpClientConfig};
use crate::events::{Event, LogLevel, Operation, Status};
use crate::http::{get_client, load_agent_authenticator, Call, HttpClient, RequestHandle};
use crate::runtime::{period, Nursery, PeriodicLoop, PeriodicTask, Sender, TaskError};

use super::watch::spawn_watcher;
use super::{
    event_channel, parse_timestamp, run_until_shutdown, spawn_outbound, AgentContext,
};

pub const COMPONENT_TOOL: &str = "power_bi";

/// The default scope for the Power BI resource services.
pub const POWERBI_DEFAULT_SCOPE: &str = "https://analysis.windows.net/powerbi/api/.default";

/// Short explanations for the refresh error codes we know about; anything
/// else is reported verbatim.
const ERROR_MESSAGES: &[(&str, &str)] = &[
    ("DMTS_MonikerWithUnboundDataSources", "Data source is not bound to any connection."),
    ("DMTS_UserNotFoundinADGraphError", "Azure Active Directory (Entra ID) user cannot be found."),
    ("Gateway_Offline", "Gateway is offline."),
    ("ModelRefresh_ShortMessage_CancelledByUser", "Dataset refresh was cancelled by the user."),
    ("ModelRefresh_ShortMessage_ServiceError", "Power BI Service error."),
    ("ModelRefresh_ShortMessage_CredentialsNotSpecified", "No credentials specified for the data source."),
    ("ModelRefreshDisabled_CredentialNotSpecified", "No credentials specified for the data source."),
    ("ProcessingTimeOut", "Processing of the data source timed out."),
];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PowerBiConfig {
    #[serde(default = "defaults::base_api_url")]
    pub base_api_url: Url,
    /// Group (workspace) names to monitor; empty monitors all groups.
    #[serde(default)]
    pub groups: Vec<String>,
    /// Datasets change rarely; the inventory poll runs at a longer interval.
    #[serde(default = "defaults::datasets_fetching_period")]
    pub datasets_fetching_period: f64,
    #[serde(default = "defaults::period")]
    pub period: f64,
}

mod defaults {
    use url::Url;

    pub fn base_api_url() -> Url {
        Url::parse("https://api.powerbi.com/v1.0/myorg/")
            .unwrap_or_else(|_| unreachable!("static URL parses"))
    }
    pub fn datasets_fetching_period() -> f64 {
        15.0
    }
    pub fn period() -> f64 {
        5.0
    }
}

impl ConfigBlock for PowerBiConfig {
    const NAME: &'static str = "powerbi";
    const ENV_PREFIX: &'static str = "DK_POWERBI_";
    const FIELDS: &'static [&'static str] =
        &["base_api_url", "groups", "datasets_fetching_period", "period"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_http_url(Self::NAME, "base_api_url", &self.base_api_url)?;
        types::require_non_negative(
            Self::NAME,
            "datasets_fetching_period",
            self.datasets_fetching_period,
        )?;
        types::require_non_negative(Self::NAME, "period", self.period)?;
        types::ensure_trailing_slash(&mut self.base_api_url);
        Ok(())
    }
}

/// Power BI's "Unknown" means a refresh is still in progress.
fn get_status(status: &str) -> Status {
    match status {
        "Unknown" => Status::Running,
        "Completed" => Status::Completed,
        "Cancelled" => Status::CompletedWithWarnings,
        "Failed" => Status::Failed,
        "Disabled" => Status::Unknown,
        other => {
            tracing::error!(status = other, "unrecognized status, defaulting to UNKNOWN");
            Status::Unknown
        }
    }
}

fn log_level_for(status: Status) -> LogLevel {
    if status == Status::CompletedWithWarnings {
        LogLevel::Warning
    } else {
        LogLevel::Error
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GroupRecord {
    id: String,
    name: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DatasetRecord {
    id: String,
    name: String,
    #[serde(default)]
    is_refreshable: bool,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RefreshRecord {
    request_id: String,
    refresh_type: String,
    status: String,
    start_time: String,
    #[serde(default)]
    end_time: Option<String>,
    #[serde(default)]
    service_exception_json: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ReportRecord {
    id: String,
    name: String,
    report_type: String,
    dataset_id: Option<String>,
    #[serde(default)]
    web_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Listing<T> {
    value: Vec<T>,
}

/// Decode the refresh's exception payload and translate the error code.
fn refresh_error_message(exception_json: Option<&str>) -> String {
    let error_code = exception_json
        .and_then(|raw| serde_json::from_str::<Value>(raw).ok())
        .and_then(|decoded| {
            decoded
                .get("errorCode")
                .and_then(Value::as_str)
                .map(str::to_string)
        })
        .unwrap_or_default();
    ERROR_MESSAGES
        .iter()
        .find(|(code, _)| *code == error_code)
        .map_or(error_code.clone(), |(_, message)| (*message).to_string())
}

struct PowerBiMonitorRunTask {
    refreshes_endpoint: RequestHandle,
    reports_endpoint: RequestHandle,
    group_id: String,
    dataset: DatasetRecord,
    status: Status,
    started_at: DateTime<Utc>,
    finished_refreshes: Vec<String>,
    outbound: Sender<Event>,
    stop: Arc<AtomicBool>,
    done: bool,
}

impl PowerBiMonitorRunTask {
    fn new(
        config: &PowerBiConfig,
        client: HttpClient,
        group_id: String,
        dataset: DatasetRecord,
        outbound: Sender<Event>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let refreshes_endpoint = RequestHandle::new(
            client.clone(),
            config.base_api_url.clone(),
            Method::GET,
            "groups/{groupId}/datasets/{datasetId}/refreshes",
        );
        let reports_endpoint = RequestHandle::new(
            client,
            config.base_api_url.clone(),
            Method::GET,
            "groups/{groupId}/reports",
        );
        Self {
            refreshes_endpoint,
            reports_endpoint,
            group_id,
            dataset,
            status: Status::Unknown,
            started_at: Utc::now(),
            finished_refreshes: Vec::new(),
            outbound,
            stop,
            done: false,
        }
    }

    fn base_event(&self, mut event: Event, refresh: &RefreshRecord) -> Event {
        event.event_timestamp = parse_timestamp(&refresh.start_time);
        event.pipeline_key = Some(self.dataset.id.clone());
        event.pipeline_name = Some(self.dataset.name.clone());
        event.run_key = Some(refresh.request_id.clone());
        event.metadata = Some(json!({
            "dataset_refresh_id": refresh.request_id,
            "dataset_refresh_type": refresh.refresh_type,
            "dataset": {
                "dataset_id": self.dataset.id,
                "dataset_name": self.dataset.name,
                "web_url": self.dataset.web_url,
                "group_id": self.group_id,
            },
        }));
        event.external_url = self.dataset.web_url.clone();
        event.component_tool = Some(COMPONENT_TOOL.into());
        event
    }

    fn task_scoped(&self, mut event: Event, refresh: &RefreshRecord) -> Event {
        event.task_key = Some(refresh.request_id.clone());
        event.task_name = Some(self.dataset.name.clone());
        event
    }

    async fn get_refresh_history(&self) -> Result<Option<RefreshRecord>, TaskError> {
        let response = self
            .refreshes_endpoint
            .send(
                Call::new()
                    .query("$top", "1")
                    .path_arg("groupId", self.group_id.as_str())
                    .path_arg("datasetId", self.dataset.id.as_str()),
            )
            .await?;
        if !response.status().is_success() {
            return Err(TaskError::failed(format!(
                "failed to fetch refresh history for dataset {}: status {}",
                self.dataset.name,
                response.status()
            )));
        }
        let listing: Listing<RefreshRecord> = response.json()?;
        Ok(listing.value.into_iter().next())
    }

    async fn get_reports(&self) -> Result<Vec<ReportRecord>, TaskError> {
        let response = self
            .reports_endpoint
            .send(Call::new().path_arg("groupId", self.group_id.as_str()))
            .await?;
        if !response.status().is_success() {
            return Err(TaskError::failed(format!(
                "failed to fetch reports for dataset {}: status {}",
                self.dataset.name,
                response.status()
            )));
        }
        let listing: Listing<ReportRecord> = response.json()?;
        Ok(listing
            .value
            .into_iter()
            .filter(|report| report.dataset_id.as_deref() == Some(self.dataset.id.as_str()))
            .collect())
    }

    async fn report_status(&mut self, refresh: &RefreshRecord) -> Result<(), TaskError> {
        if self.status.finished() {
            tracing::debug!(request_id = refresh.request_id, "refresh finished");
            let end = refresh.end_time.as_deref().and_then(parse_timestamp);

            if matches!(self.status, Status::CompletedWithWarnings | Status::Failed) {
                let message = refresh_error_message(refresh.service_exception_json.as_deref());
                let mut log = self.task_scoped(
                    self.base_event(
                        Event::message_log(log_level_for(self.status), message),
                        refresh,
                    ),
                    refresh,
                );
                log.event_timestamp = end;
                self.outbound.send(log).await?;
            }

            // Close the run's task first.
            let mut task_event =
                self.task_scoped(self.base_event(Event::run_status(self.status), refresh), refresh);
            task_event.event_timestamp = end;
            self.outbound.send(task_event).await?;

            // Reports fed by the dataset were rewritten by a successful
            // refresh.
            if self.status == Status::Completed {
                for report in self.get_reports().await? {
                    let mut operation = Event::dataset_operation(Operation::Write);
                    operation.event_timestamp = end;
                    operation.dataset_key = Some(report.id.clone());
                    operation.dataset_name = Some(report.name.clone());
                    operation.metadata = Some(json!({
                        "reportType": report.report_type,
                        "dataset": {
                            "dataset_id": self.dataset.id,
                            "dataset_name": self.dataset.name,
                        },
                    }));
                    operation.external_url = report.web_url.clone();
                    operation.component_tool = Some(COMPONENT_TOOL.into());
                    self.outbound.send(operation).await?;
                }
            }

            let mut run_event = self.base_event(Event::run_status(self.status), refresh);
            run_event.event_timestamp = end;
            self.outbound.send(run_event).await?;

            self.finished_refreshes.push(refresh.request_id.clone());
            self.status = Status::Unknown;
        } else {
            tracing::debug!(request_id = refresh.request_id, "refresh started");
            let task_event =
                self.task_scoped(self.base_event(Event::run_status(self.status), refresh), refresh);
            self.outbound.send(task_event).await?;
            let run_event = self.base_event(Event::run_status(self.status), refresh);
            self.outbound.send(run_event).await?;
        }
        Ok(())
    }

    /// Refreshes that finished before this monitor existed are history, not
    /// activity; without this check a restart would re-announce the last
    /// refresh of every dataset.
    fn is_current(&self, refresh: &RefreshRecord) -> bool {
        let Some(end_raw) = refresh.end_time.as_deref() else {
            return true;
        };
        match (parse_timestamp(&refresh.start_time), parse_timestamp(end_raw)) {
            (Some(start), Some(end)) => start >= self.started_at && end >= self.started_at,
            _ => false,
        }
    }
}

#[async_trait]
impl PeriodicTask for PowerBiMonitorRunTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        if self.stop.load(Ordering::Acquire) {
            self.done = true;
            return Ok(());
        }

        let Some(refresh) = self.get_refresh_history().await? else {
            tracing::debug!(dataset = self.dataset.name, "no refresh data found for dataset");
            return Ok(());
        };
        if self.finished_refreshes.contains(&refresh.request_id) {
            return Ok(());
        }
        if !self.is_current(&refresh) {
            tracing::debug!(
                dataset = self.dataset.name,
                "no active refresh; last refresh predates this monitor"
            );
            return Ok(());
        }

        let previous_status = self.status;
        self.status = get_status(&refresh.status);
        if previous_status != self.status {
            self.report_status(&refresh).await?;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

/// Handle the fetcher keeps per spawned monitor.
struct MonitorHandle {
    group_id: String,
    dataset_id: String,
    dataset_name: String,
    stop: Arc<AtomicBool>,
    finished: Arc<AtomicBool>,
}

struct PowerBiFetchDatasetsTask {
    config: Arc<PowerBiConfig>,
    client: HttpClient,
    groups_endpoint: RequestHandle,
    datasets_endpoint: RequestHandle,
    nursery: Nursery,
    outbound: Sender<Event>,
    groups_watched: HashMap<String, GroupRecord>,
    datasets_watched: HashMap<String, HashSet<String>>,
    monitors: Vec<MonitorHandle>,
}

impl PowerBiFetchDatasetsTask {
    fn new(
        context: &AgentContext,
        nursery: Nursery,
        outbound: Sender<Event>,
    ) -> anyhow::Result<Self> {
        let registry = &context.registry;
        let config = registry.lookup::<PowerBiConfig>()?;
        let auth = load_agent_authenticator(registry, POWERBI_DEFAULT_SCOPE)?;
        let client = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), Some(auth))?;
        let groups_endpoint =
            RequestHandle::new(client.clone(), config.base_api_url.clone(), Method::GET, "groups");
        let datasets_endpoint = RequestHandle::new(
            client.clone(),
            config.base_api_url.clone(),
            Method::GET,
            "groups/{groupId}/datasets",
        );
        Ok(Self {
            config,
            client,
            groups_endpoint,
            datasets_endpoint,
            nursery,
            outbound,
            groups_watched: HashMap::new(),
            datasets_watched: HashMap::new(),
            monitors: Vec::new(),
        })
    }

    async fn get_groups(&self) -> Result<Vec<GroupRecord>, TaskError> {
        let response = self.groups_endpoint.send(Call::new()).await?;
        if !response.status().is_success() {
            return Err(TaskError::failed(format!(
                "failed to fetch groups: status {}",
                response.status()
            )));
        }
        let listing: Listing<GroupRecord> = response.json()?;
        let groups = listing
            .value
            .into_iter()
            .filter(|group| {
                self.config.groups.is_empty()
                    || self.config.groups.iter().any(|name| *name == group.name)
            })
            .collect();
        Ok(groups)
    }

    async fn get_datasets(&self, group_id: &str) -> Result<Vec<DatasetRecord>, TaskError> {
        let response = self
            .datasets_endpoint
            .send(Call::new().path_arg("groupId", group_id))
            .await?;
        if !response.status().is_success() {
            return Err(TaskError::failed(format!(
                "failed to fetch datasets for group {group_id}: status {}",
                response.status()
            )));
        }
        let listing: Listing<DatasetRecord> = response.json()?;
        Ok(listing
            .value
            .into_iter()
            .filter(|dataset| dataset.is_refreshable)
            .collect())
    }

    fn sync_groups(&mut self, groups: Vec<GroupRecord>) {
        let current_ids: HashSet<&str> = groups.iter().map(|g| g.id.as_str()).collect();
        self.groups_watched.retain(|id, _| current_ids.contains(id.as_str()));
        for group in groups {
            if !self.groups_watched.contains_key(&group.id) {
                tracing::debug!(group = group.name, "new group found");
                self.groups_watched.insert(group.id.clone(), group);
            }
        }
    }

    fn sync_datasets(&mut self, group_id: &str, datasets: &[DatasetRecord]) -> Vec<DatasetRecord> {
        let current_ids: HashSet<&str> = datasets.iter().map(|d| d.id.as_str()).collect();
        let watched = self.datasets_watched.entry(group_id.to_string()).or_default();
        watched.retain(|id| current_ids.contains(id.as_str()));

        let mut new_datasets = Vec::new();
        for dataset in datasets {
            if watched.insert(dataset.id.clone()) {
                tracing::debug!(dataset = dataset.name, "new dataset found");
                new_datasets.push(dataset.clone());
            }
        }
        new_datasets
    }

    /// Stop monitors whose group or dataset no longer exists, and forget the
    /// ones that have fully wound down.
    fn end_stale_monitors(&mut self) {
        let watched_datasets: HashSet<&str> = self
            .datasets_watched
            .values()
            .flat_map(|ids| ids.iter().map(String::as_str))
            .collect();
        for monitor in &self.monitors {
            let stale = !self.groups_watched.contains_key(&monitor.group_id)
                || !watched_datasets.contains(monitor.dataset_id.as_str());
            if stale && !monitor.stop.load(Ordering::Acquire) {
                tracing::debug!(
                    group_id = monitor.group_id,
                    dataset = monitor.dataset_name,
                    "ending monitor task"
                );
                monitor.stop.store(true, Ordering::Release);
            }
        }
        self.monitors.retain(|monitor| !monitor.finished.load(Ordering::Acquire));
    }
}

#[async_trait]
impl PeriodicTask for PowerBiFetchDatasetsTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let groups = self.get_groups().await?;
        self.sync_groups(groups);

        let group_ids: Vec<String> = self.groups_watched.keys().cloned().collect();
        for group_id in group_ids {
            let datasets = self.get_datasets(&group_id).await?;
            for dataset in self.sync_datasets(&group_id, &datasets) {
                let stop = Arc::new(AtomicBool::new(false));
                let monitor = PowerBiMonitorRunTask::new(
                    &self.config,
                    self.client.clone(),
                    group_id.clone(),
                    dataset.clone(),
                    self.outbound.clone(),
                    stop.clone(),
                );
                let finished = spawn_watcher(&self.nursery, period(self.config.period), monitor);
                self.monitors.push(MonitorHandle {
                    group_id: group_id.clone(),
                    dataset_id: dataset.id,
                    dataset_name: dataset.name,
                    stop,
                    finished,
                });
            }
        }

        self.end_stale_monitors();
        Ok(())
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<PowerBiConfig>()?;
    let agent_config = context.registry.lookup::<PowerBiConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let fetcher = PowerBiFetchDatasetsTask::new(&context, nursery.clone(), outbound)?;
    nursery.spawn(
        PeriodicLoop::new(period(agent_config.datasets_fetching_period), fetcher)
            .run(nursery.clone()),
    );
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> PowerBiConfig {
        let mut config = PowerBiConfig {
            base_api_url: Url::parse(&server.uri()).unwrap(),
            groups: Vec::new(),
            datasets_fetching_period: 15.0,
            period: 5.0,
        };
        config.validate().unwrap();
        config
    }

    fn test_client() -> HttpClient {
        get_client(&HttpClientConfig::default(), None).unwrap()
    }

    fn dataset() -> DatasetRecord {
        DatasetRecord {
            id: "ds-1".into(),
            name: "Finance".into(),
            is_refreshable: true,
            web_url: Some("https://app.powerbi.com/datasets/ds-1".into()),
        }
    }

    fn monitor(
        server: &MockServer,
    ) -> (PowerBiMonitorRunTask, crate::runtime::Receiver<Event>, Arc<AtomicBool>) {
        let (tx, rx) = channel::channel::<Event>(0);
        let stop = Arc::new(AtomicBool::new(false));
        let task = PowerBiMonitorRunTask::new(
            &test_config(server),
            test_client(),
            "grp-1".into(),
            dataset(),
            tx,
            stop.clone(),
        );
        (task, rx, stop)
    }

    fn refresh_json(status: &str, start: &str, end: Option<&str>, exception: Option<&str>) -> Value {
        let mut record = json!({
            "requestId": "req-1",
            "refreshType": "Scheduled",
            "status": status,
            "startTime": start,
        });
        if let Some(end) = end {
            record["endTime"] = json!(end);
        }
        if let Some(exception) = exception {
            record["serviceExceptionJson"] = json!(exception);
        }
        json!({"value": [record]})
    }

    fn future_start() -> String {
        (Utc::now() + chrono::Duration::seconds(30)).to_rfc3339()
    }

    #[test]
    fn status_mapping_treats_unknown_as_running() {
        assert_eq!(get_status("Unknown"), Status::Running);
        assert_eq!(get_status("Completed"), Status::Completed);
        assert_eq!(get_status("Cancelled"), Status::CompletedWithWarnings);
        assert_eq!(get_status("Failed"), Status::Failed);
        assert_eq!(get_status("Disabled"), Status::Unknown);
        assert_eq!(get_status("Renamed"), Status::Unknown);
    }

    #[test]
    fn error_message_uses_the_decoded_error_code() {
        assert_eq!(
            refresh_error_message(Some(r#"{"errorCode": "Gateway_Offline"}"#)),
            "Gateway is offline."
        );
        // Unknown codes fall through verbatim.
        assert_eq!(
            refresh_error_message(Some(r#"{"errorCode": "Brand_New_Error"}"#)),
            "Brand_New_Error"
        );
        assert_eq!(refresh_error_message(None), "");
    }

    #[tokio::test]
    async fn running_refresh_emits_task_and_run_events() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/groups/grp-1/datasets/ds-1/refreshes"))
            .and(query_param("$top", "1"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(refresh_json("Unknown", &future_start(), None, None)),
            )
            .mount(&server)
            .await;

        let (mut task, mut rx, _stop) = monitor(&server);
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        // Unchanged status on the next tick is quiet.
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, Some(Status::Running));
        assert_eq!(events[0].task_key.as_deref(), Some("req-1"));
        assert_eq!(events[1].task_key, None);
        assert_eq!(events[1].pipeline_key.as_deref(), Some("ds-1"));
    }

    #[tokio::test]
    async fn failed_refresh_reports_translated_error_and_closes_run() {
        let server = MockServer::start().await;
        let start = future_start();
        let end = (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
        Mock::given(method("GET"))
            .and(path("/groups/grp-1/datasets/ds-1/refreshes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(refresh_json(
                "Failed",
                &start,
                Some(&end),
                Some(r#"{"errorCode": "ProcessingTimeOut"}"#),
            )))
            .mount(&server)
            .await;

        let (mut task, mut rx, _stop) = monitor(&server);
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        // The refresh is remembered; no duplicate events on the next tick.
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].log_level, Some(LogLevel::Error));
        assert_eq!(
            events[0].message.as_deref(),
            Some("Processing of the data source timed out.")
        );
        assert_eq!(events[1].status, Some(Status::Failed));
        assert_eq!(events[1].task_key.as_deref(), Some("req-1"));
        assert_eq!(events[2].status, Some(Status::Failed));
        assert_eq!(events[2].task_key, None);
    }

    #[tokio::test]
    async fn completed_refresh_emits_write_operations_for_bound_reports() {
        let server = MockServer::start().await;
        let start = future_start();
        let end = (Utc::now() + chrono::Duration::seconds(60)).to_rfc3339();
        Mock::given(method("GET"))
            .and(path("/groups/grp-1/datasets/ds-1/refreshes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(refresh_json(
                "Completed",
                &start,
                Some(&end),
                None,
            )))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/groups/grp-1/reports"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "value": [
                    {"id": "rep-1", "name": "Monthly", "reportType": "PowerBIReport",
                     "datasetId": "ds-1", "webUrl": "https://app.powerbi.com/reports/rep-1"},
                    {"id": "rep-2", "name": "Other", "reportType": "PowerBIReport",
                     "datasetId": "ds-other"}
                ]
            })))
            .mount(&server)
            .await;

        let (mut task, mut rx, _stop) = monitor(&server);
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        // Task close, one WRITE for the bound report, run close.
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].status, Some(Status::Completed));
        assert_eq!(events[1].operation, Some(Operation::Write));
        assert_eq!(events[1].dataset_key.as_deref(), Some("rep-1"));
        assert_eq!(events[2].status, Some(Status::Completed));
        assert_eq!(events[2].task_key, None);
    }

    #[tokio::test]
    async fn refreshes_that_predate_the_monitor_are_ignored() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(refresh_json(
                "Completed",
                "2020-01-01T00:00:00Z",
                Some("2020-01-01T00:10:00Z"),
                None,
            )))
            .mount(&server)
            .await;

        let (mut task, mut rx, _stop) = monitor(&server);
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        drop(task);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stop_flag_winds_the_monitor_down() {
        let server = MockServer::start().await;
        let (mut task, _rx, stop) = monitor(&server);
        stop.store(true, Ordering::Release);
        task.execute(Utc::now(), Utc::now()).await.unwrap();
        assert!(task.is_done());
    }
}
