//! Databricks agent: lists job runs started in the listing window and
//! watches each run and its tasks. A run that terminates unsuccessfully is
//! re-polled at a slower cadence to capture repairs and late task states.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use reqwest::Method;
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig, HttpClientConfig};
use crate::events::{Event, LogLevel, Status};
use crate::http::{get_client, load_agent_authenticator, Call, HttpClient, RequestHandle};
use crate::runtime::{period, Nursery, PeriodicLoop, PeriodicTask, Sender, TaskError};

use super::watch::{spawn_watcher, WatchMap};
use super::{
    event_channel, run_until_shutdown, spawn_outbound, timestamp_from_millis, AgentContext,
};

pub const COMPONENT_TOOL: &str = "databricks";

/// The Azure service principal scope assigned to Databricks.
pub const DATABRICKS_SPN_SCOPE: &str = "2ff814a6-3304-4ab8-85cb-cd0e6f879c1d/.default";

const VALID_FAILURE_STATES: &[&str] = &[
    "FAILED",
    "TIMEDOUT",
    "CANCELED",
    "MAXIMUM_CONCURRENT_RUNS_REACHED",
    "EXCLUDED",
    "SUCCESS_WITH_FAILURES",
    "UPSTREAM_FAILED",
    "UPSTREAM_CANCELED",
];

const PENDING_STATES: &[&str] = &["PENDING", "RUNNING", "TERMINATING", "WAITING_FOR_RETRY", "BLOCKED"];

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DatabricksConfig {
    pub databricks_host: Url,
    #[serde(default = "defaults::jobs_version")]
    pub databricks_jobs_version: String,
    /// Job names to observe; empty observes everything.
    #[serde(default)]
    pub databricks_jobs: Vec<String>,
    #[serde(default = "defaults::timeout")]
    pub timeout: f64,
    #[serde(default = "defaults::period")]
    pub period: f64,
    /// When a run fails, keep watching it every this many seconds...
    #[serde(default = "defaults::failed_watch_period")]
    pub databricks_failed_watch_period: f64,
    /// ...for at most this many seconds since the watcher started.
    #[serde(default = "defaults::failed_watch_max_time")]
    pub databricks_failed_watch_max_time: f64,
}

mod defaults {
    pub fn jobs_version() -> String {
        "2.1".to_string()
    }
    pub fn timeout() -> f64 {
        120.0
    }
    pub fn period() -> f64 {
        5.0
    }
    pub fn failed_watch_period() -> f64 {
        600.0
    }
    pub fn failed_watch_max_time() -> f64 {
        604_800.0
    }
}

impl ConfigBlock for DatabricksConfig {
    const NAME: &'static str = "databricks";
    const ENV_PREFIX: &'static str = "DK_";
    const FIELDS: &'static [&'static str] = &[
        "databricks_host",
        "databricks_jobs_version",
        "databricks_jobs",
        "timeout",
        "period",
        "databricks_failed_watch_period",
        "databricks_failed_watch_max_time",
    ];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_http_url(Self::NAME, "databricks_host", &self.databricks_host)?;
        if self.databricks_jobs_version != "2.1" {
            return Err(ConfigError::invalid(
                Self::NAME,
                format!(
                    "databricks_jobs_version - unsupported value '{}'",
                    self.databricks_jobs_version
                ),
            ));
        }
        for (field, value) in [
            ("timeout", self.timeout),
            ("period", self.period),
            ("databricks_failed_watch_period", self.databricks_failed_watch_period),
            ("databricks_failed_watch_max_time", self.databricks_failed_watch_max_time),
        ] {
            types::require_non_negative(Self::NAME, field, value)?;
        }
        types::ensure_trailing_slash(&mut self.databricks_host);
        Ok(())
    }
}

/// Map a run or task `state` object onto a normalized status.
fn get_status(state: &Value) -> Status {
    let life_cycle = state.get("life_cycle_state").and_then(Value::as_str).unwrap_or("");
    let result = state.get("result_state").and_then(Value::as_str);

    if PENDING_STATES.contains(&life_cycle) {
        return Status::Running;
    }
    match (life_cycle, result) {
        ("TERMINATED", Some("SUCCESS")) => Status::Completed,
        ("TERMINATED", Some(r)) if VALID_FAILURE_STATES.contains(&r) => Status::Failed,
        ("TERMINATED" | "INTERNAL_ERROR", Some("SKIPPED")) => Status::CompletedWithWarnings,
        ("TERMINATED" | "INTERNAL_ERROR", _) => Status::Failed,
        _ => {
            tracing::warn!(state = %state, "unrecognized status, defaulting to UNKNOWN");
            Status::Unknown
        }
    }
}

fn is_repair_run(run: &Value) -> bool {
    run.get("trigger").and_then(Value::as_str) == Some("RETRY")
}

/// Numeric or string JSON ids, normalized to a string key.
fn id_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Tracked state of one task inside a watched run. The Databricks response's
/// `run_id` is the task key; its `task_key` field is the human name.
struct RunTaskData {
    status: Status,
    task_key: String,
    name: String,
    external_url: Option<String>,
    #[allow(dead_code)]
    attempt_number: i64,
}

impl RunTaskData {
    fn new(task_key: String, task_json: &Value) -> Self {
        Self {
            status: Status::Unknown,
            task_key,
            name: task_json
                .get("task_key")
                .and_then(Value::as_str)
                .unwrap_or("missing_task_key")
                .to_string(),
            external_url: task_json
                .get("run_page_url")
                .and_then(Value::as_str)
                .map(str::to_string),
            attempt_number: task_json.get("attempt_number").and_then(Value::as_i64).unwrap_or(0),
        }
    }

    fn update(
        &mut self,
        task_json: &Value,
        run: &WatchedRunIdentity,
        metadata: &Value,
    ) -> Result<Vec<Event>, TaskError> {
        let status = get_status(task_json.get("state").unwrap_or(&Value::Null));
        if status == Status::Unknown || status == self.status {
            return Ok(Vec::new());
        }
        let time_field = if status.finished() { "end_time" } else { "start_time" };
        let timestamp = task_json
            .get(time_field)
            .and_then(Value::as_i64)
            .and_then(timestamp_from_millis)
            .ok_or_else(|| TaskError::failed(format!("task is missing {time_field}")))?;

        self.status = status;

        let mut status_event = Event::run_status(status);
        status_event.event_timestamp = Some(timestamp);
        status_event.pipeline_name = Some(run.pipeline_name.clone());
        status_event.pipeline_key = Some(run.pipeline_key.clone());
        status_event.run_key = Some(run.run_key.clone());
        status_event.task_name = Some(self.name.clone());
        status_event.task_key = Some(self.task_key.clone());
        status_event.metadata = Some(metadata.clone());
        status_event.external_url = self.external_url.clone();
        status_event.component_tool = Some(COMPONENT_TOOL.into());

        let mut events = vec![status_event];
        if status == Status::Failed {
            let state_message = task_json
                .pointer("/state/state_message")
                .and_then(Value::as_str)
                .unwrap_or("");
            let message = if state_message.is_empty() {
                format!("Task {} failed!", self.name)
            } else {
                state_message.to_string()
            };
            let mut log = Event::message_log(LogLevel::Error, message);
            log.event_timestamp = Some(timestamp);
            log.pipeline_name = Some(run.pipeline_name.clone());
            log.pipeline_key = Some(run.pipeline_key.clone());
            log.run_key = Some(run.run_key.clone());
            log.task_name = Some(self.name.clone());
            log.task_key = Some(self.task_key.clone());
            log.metadata = Some(metadata.clone());
            log.external_url = self.external_url.clone();
            log.component_tool = Some(COMPONENT_TOOL.into());
            events.push(log);
        }
        Ok(events)
    }
}

struct WatchedRunIdentity {
    pipeline_key: String,
    pipeline_name: String,
    run_key: String,
}

struct DatabricksWatchRunTask {
    config: Arc<DatabricksConfig>,
    endpoint: RequestHandle,
    identity: WatchedRunIdentity,
    tasks: HashMap<String, RunTaskData>,
    started_at: DateTime<Utc>,
    status: Status,
    outbound: Sender<Event>,
    done: bool,
    new_period: Option<std::time::Duration>,
}

impl DatabricksWatchRunTask {
    fn new(
        config: Arc<DatabricksConfig>,
        run: &Value,
        client: HttpClient,
        outbound: Sender<Event>,
    ) -> Option<Self> {
        let endpoint = RequestHandle::new(
            client,
            config.databricks_host.clone(),
            Method::GET,
            "api/{jobs_version}/jobs/runs/get",
        );
        let identity = WatchedRunIdentity {
            pipeline_key: id_string(run.get("job_id")?)?,
            pipeline_name: run.get("run_name").and_then(Value::as_str)?.to_string(),
            run_key: id_string(run.get("run_id")?)?,
        };
        Some(Self {
            config,
            endpoint,
            identity,
            tasks: HashMap::new(),
            started_at: Utc::now(),
            status: Status::Unknown,
            outbound,
            done: false,
            new_period: None,
        })
    }

    async fn update_run_status(&mut self, run_json: &Value, metadata: &Value) -> Result<(), TaskError> {
        let external_url = run_json
            .get("run_page_url")
            .and_then(Value::as_str)
            .map(str::to_string);
        let status = get_status(run_json.get("state").unwrap_or(&Value::Null));
        if status == self.status {
            return Ok(());
        }
        self.status = status;
        if !status.finished() {
            return Ok(());
        }

        let timestamp = run_json
            .get("end_time")
            .and_then(Value::as_i64)
            .and_then(timestamp_from_millis)
            .ok_or_else(|| TaskError::failed("finished run is missing end_time"))?;

        if status == Status::Failed {
            let state_message = run_json
                .pointer("/state/state_message")
                .and_then(Value::as_str)
                .unwrap_or("");
            let message = if state_message.is_empty() {
                format!("Run {} failed!", self.identity.pipeline_name)
            } else {
                state_message.to_string()
            };
            let mut log = Event::message_log(LogLevel::Error, message);
            log.event_timestamp = Some(timestamp);
            log.pipeline_name = Some(self.identity.pipeline_name.clone());
            log.pipeline_key = Some(self.identity.pipeline_key.clone());
            log.run_key = Some(self.identity.run_key.clone());
            log.metadata = Some(metadata.clone());
            log.external_url = external_url.clone();
            log.component_tool = Some(COMPONENT_TOOL.into());
            self.outbound.send(log).await?;
        }

        if metadata.get("repair_run") == Some(&Value::Bool(true)) {
            let mut log = Event::message_log(LogLevel::Info, "This is a repaired run.");
            log.event_timestamp = Some(timestamp);
            log.pipeline_name = Some(self.identity.pipeline_name.clone());
            log.pipeline_key = Some(self.identity.pipeline_key.clone());
            log.run_key = Some(self.identity.run_key.clone());
            log.metadata = Some(metadata.clone());
            log.external_url = external_url.clone();
            log.component_tool = Some(COMPONENT_TOOL.into());
            self.outbound.send(log).await?;
        }

        let mut event = Event::run_status(status);
        event.event_timestamp = Some(timestamp);
        event.pipeline_key = Some(self.identity.pipeline_key.clone());
        event.pipeline_name = Some(self.identity.pipeline_name.clone());
        event.run_key = Some(self.identity.run_key.clone());
        event.metadata = Some(metadata.clone());
        event.external_url = external_url;
        event.component_tool = Some(COMPONENT_TOOL.into());
        self.outbound.send(event).await?;

        if matches!(status, Status::Completed | Status::CompletedWithWarnings) {
            self.done = true;
        } else {
            tracing::info!(
                run_key = self.identity.run_key,
                "run did not complete successfully, watching at lower period"
            );
            self.new_period = Some(period(self.config.databricks_failed_watch_period));
        }
        Ok(())
    }

    async fn update_tasks(&mut self, run_json: &Value, metadata: &Value) -> Result<(), TaskError> {
        let Some(tasks) = run_json.get("tasks").and_then(Value::as_array) else {
            tracing::info!(run_key = self.identity.run_key, "no tasks found for run");
            return Ok(());
        };
        for task_json in tasks {
            let Some(task_key) = task_json.get("run_id").and_then(id_string) else {
                continue;
            };
            let entry = self
                .tasks
                .entry(task_key.clone())
                .or_insert_with(|| RunTaskData::new(task_key, task_json));
            let events = entry.update(task_json, &self.identity, metadata)?;
            for event in events {
                self.outbound.send(event).await?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for DatabricksWatchRunTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let response = self
            .endpoint
            .send(
                Call::new()
                    .query("run_id", self.identity.run_key.as_str())
                    .path_arg("jobs_version", self.config.databricks_jobs_version.as_str()),
            )
            .await?;
        if !response.status().is_success() {
            tracing::warn!(
                run_key = self.identity.run_key,
                status = response.status().as_u16(),
                "failed to get run"
            );
            return Ok(());
        }
        let run_json: Value = response.json()?;

        let metadata = json!({
            "job_id": run_json.get("job_id"),
            "run_id": run_json.get("run_id"),
            "creator_user_name": run_json.get("creator_user_name"),
            "number_in_job": run_json.get("number_in_job"),
            "original_attempt_run_id": run_json.get("original_attempt_run_id"),
            "schedule": run_json.get("schedule"),
            "trigger": run_json.get("trigger"),
            "run_name": run_json.get("run_name"),
            "run_type": run_json.get("run_type"),
            "repair_run": is_repair_run(&run_json),
        });

        // Task transitions first; the run-level event closes the tick.
        self.update_tasks(&run_json, &metadata).await?;
        self.update_run_status(&run_json, &metadata).await?;

        let budget = ChronoDuration::seconds(self.config.databricks_failed_watch_max_time as i64);
        if self.started_at + budget < Utc::now() {
            tracing::info!(run_key = self.identity.run_key, "finishing extended watch for run");
            self.done = true;
        }
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.done
    }

    fn take_period_update(&mut self) -> Option<std::time::Duration> {
        self.new_period.take()
    }
}

struct DatabricksListRunsTask {
    config: Arc<DatabricksConfig>,
    client: HttpClient,
    endpoint: RequestHandle,
    nursery: Nursery,
    outbound: Sender<Event>,
    watched: WatchMap,
}

impl DatabricksListRunsTask {
    fn new(
        context: &AgentContext,
        nursery: Nursery,
        outbound: Sender<Event>,
    ) -> anyhow::Result<Self> {
        let registry = &context.registry;
        let config = registry.lookup::<DatabricksConfig>()?;
        let auth = load_agent_authenticator(registry, DATABRICKS_SPN_SCOPE)?;
        let client = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), Some(auth))?;
        let endpoint = RequestHandle::new(
            client.clone(),
            config.databricks_host.clone(),
            Method::GET,
            "api/{jobs_version}/jobs/runs/list",
        );

        if config.databricks_jobs.is_empty() {
            tracing::debug!("no job filter defined, observing all jobs");
        } else {
            tracing::debug!(jobs = ?config.databricks_jobs, "observing a filtered set of jobs");
        }

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
impl PeriodicTask for DatabricksListRunsTask {
    async fn execute(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        self.watched.reap();

        let mut page_token: Option<String> = None;
        loop {
            let mut call = Call::new()
                .query("expand_tasks", "true")
                .query("start_time_from", previous.timestamp_millis().to_string())
                .query("start_time_to", current.timestamp_millis().to_string())
                .path_arg("jobs_version", self.config.databricks_jobs_version.as_str());
            if let Some(token) = &page_token {
                call = call.query("page_token", token.as_str());
            }

            let response = self.endpoint.send(call).await?;
            if !response.status().is_success() {
                tracing::warn!(status = response.status().as_u16(), "failed to list job runs");
                return Ok(());
            }
            let body: Value = response.json()?;

            let has_more = body.get("has_more").and_then(Value::as_bool).unwrap_or(false);
            page_token = body
                .get("next_page_token")
                .and_then(Value::as_str)
                .map(str::to_string);

            let Some(runs) = body.get("runs").and_then(Value::as_array) else {
                tracing::debug!("no runs for jobs found in page for period");
                return Ok(());
            };

            for run in runs {
                let Some(run_key) = run.get("run_id").and_then(id_string) else {
                    continue;
                };
                if self.watched.contains(&run_key) {
                    continue;
                }
                if !self.config.databricks_jobs.is_empty() {
                    let run_name = run.get("run_name").and_then(Value::as_str).unwrap_or("");
                    if !self.config.databricks_jobs.iter().any(|job| job == run_name) {
                        continue;
                    }
                }

                let Some(watcher) = DatabricksWatchRunTask::new(
                    self.config.clone(),
                    run,
                    self.client.clone(),
                    self.outbound.clone(),
                ) else {
                    tracing::warn!("listed run is missing job_id, run_id or run_name, skipping");
                    continue;
                };
                tracing::debug!(run_key, "run to be observed");
                let finished = spawn_watcher(&self.nursery, period(self.config.period), watcher);
                self.watched.track(run_key, finished);
            }

            if !has_more {
                break;
            }
        }
        Ok(())
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<DatabricksConfig>()?;
    let agent_config = context.registry.lookup::<DatabricksConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let lister = DatabricksListRunsTask::new(&context, nursery.clone(), outbound)?;
    nursery.spawn(PeriodicLoop::new(period(agent_config.period), lister).run(nursery.clone()));
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::channel;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> DatabricksConfig {
        let mut config = DatabricksConfig {
            databricks_host: Url::parse(&server.uri()).unwrap(),
            databricks_jobs_version: "2.1".into(),
            databricks_jobs: Vec::new(),
            timeout: 120.0,
            period: 5.0,
            databricks_failed_watch_period: 600.0,
            databricks_failed_watch_max_time: 604_800.0,
        };
        config.validate().unwrap();
        config
    }

    fn test_client() -> HttpClient {
        get_client(&HttpClientConfig::default(), None).unwrap()
    }

    fn watcher_for(
        config: DatabricksConfig,
    ) -> (DatabricksWatchRunTask, crate::runtime::Receiver<Event>) {
        let (tx, rx) = channel::channel::<Event>(0);
        let watcher = DatabricksWatchRunTask::new(
            Arc::new(config),
            &json!({"job_id": 7, "run_id": 42, "run_name": "nightly"}),
            test_client(),
            tx,
        )
        .unwrap();
        (watcher, rx)
    }

    #[test]
    fn status_mapping_covers_lifecycle_and_result_states() {
        assert_eq!(get_status(&json!({"life_cycle_state": "RUNNING"})), Status::Running);
        assert_eq!(
            get_status(&json!({"life_cycle_state": "TERMINATED", "result_state": "SUCCESS"})),
            Status::Completed
        );
        assert_eq!(
            get_status(&json!({"life_cycle_state": "TERMINATED", "result_state": "FAILED"})),
            Status::Failed
        );
        assert_eq!(
            get_status(&json!({"life_cycle_state": "TERMINATED", "result_state": "SKIPPED"})),
            Status::CompletedWithWarnings
        );
        assert_eq!(
            get_status(&json!({"life_cycle_state": "INTERNAL_ERROR"})),
            Status::Failed
        );
        assert_eq!(get_status(&json!({"life_cycle_state": "SOMETHING_NEW"})), Status::Unknown);
    }

    #[tokio::test]
    async fn failed_run_emits_error_log_then_status_and_switches_cadence() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.1/jobs/runs/get"))
            .and(query_param("run_id", "42"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "run_id": 42,
                "job_id": 7,
                "run_name": "nightly",
                "state": {"life_cycle_state": "TERMINATED", "result_state": "FAILED", "state_message": "boom"},
                "end_time": 1_704_067_260_000_i64,
                "tasks": []
            })))
            .mount(&server)
            .await;

        let (mut watcher, mut rx) = watcher_for(test_config(&server));
        watcher.execute(Utc::now(), Utc::now()).await.unwrap();

        assert!(!watcher.is_done());
        assert_eq!(
            watcher.take_period_update(),
            Some(std::time::Duration::from_secs(600))
        );
        drop(watcher);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].log_level, Some(LogLevel::Error));
        assert_eq!(events[0].message.as_deref(), Some("boom"));

        assert_eq!(events[1].status, Some(Status::Failed));
        assert_eq!(events[1].run_key.as_deref(), Some("42"));
        assert_eq!(
            events[1].event_timestamp.unwrap().to_rfc3339(),
            "2024-01-01T00:01:00+00:00"
        );
    }

    #[tokio::test]
    async fn completed_run_finishes_the_watcher() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": {"life_cycle_state": "TERMINATED", "result_state": "SUCCESS"},
                "end_time": 1_704_067_260_000_i64,
                "tasks": []
            })))
            .mount(&server)
            .await;

        let (mut watcher, mut rx) = watcher_for(test_config(&server));
        watcher.execute(Utc::now(), Utc::now()).await.unwrap();
        assert!(watcher.is_done());
        drop(watcher);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, Some(Status::Completed));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn task_events_precede_the_run_event_in_the_same_tick() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": {"life_cycle_state": "TERMINATED", "result_state": "SUCCESS"},
                "end_time": 1_704_067_260_000_i64,
                "tasks": [{
                    "run_id": 9001,
                    "task_key": "ingest",
                    "state": {"life_cycle_state": "TERMINATED", "result_state": "SUCCESS"},
                    "start_time": 1_704_067_200_000_i64,
                    "end_time": 1_704_067_250_000_i64
                }]
            })))
            .mount(&server)
            .await;

        let (mut watcher, mut rx) = watcher_for(test_config(&server));
        watcher.execute(Utc::now(), Utc::now()).await.unwrap();
        drop(watcher);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].task_key.as_deref(), Some("9001"));
        assert_eq!(events[0].task_name.as_deref(), Some("ingest"));
        assert_eq!(events[1].task_key, None);
    }

    #[tokio::test]
    async fn watch_budget_expiry_forces_completion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": {"life_cycle_state": "RUNNING"},
                "tasks": []
            })))
            .mount(&server)
            .await;

        let mut config = test_config(&server);
        config.databricks_failed_watch_max_time = 0.0;
        let (mut watcher, _rx) = watcher_for(config);

        watcher.execute(Utc::now(), Utc::now()).await.unwrap();
        assert!(watcher.is_done());
    }

    #[tokio::test]
    async fn lister_filters_jobs_and_paginates() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/2.1/jobs/runs/list"))
            .and(query_param("page_token", "next-1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "has_more": false,
                "runs": [{"run_id": 2, "job_id": 7, "run_name": "other"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api/2.1/jobs/runs/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "has_more": true,
                "next_page_token": "next-1",
                "runs": [{"run_id": 1, "job_id": 7, "run_name": "nightly"}]
            })))
            .mount(&server)
            .await;
        // Watcher poll endpoint; keeps spawned watchers harmless.
        Mock::given(method("GET"))
            .and(path("/api/2.1/jobs/runs/get"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": {"life_cycle_state": "RUNNING"}, "tasks": []
            })))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let nursery = Nursery::new();
        let (tx, _rx) = channel::channel::<Event>(0);
        let mut lister = DatabricksListRunsTask {
            config: Arc::new(DatabricksConfig {
                databricks_jobs: vec!["nightly".into()],
                ..config.clone()
            }),
            client: test_client(),
            endpoint: RequestHandle::new(
                test_client(),
                config.databricks_host.clone(),
                Method::GET,
                "api/{jobs_version}/jobs/runs/list",
            ),
            nursery: nursery.clone(),
            outbound: tx,
            watched: WatchMap::new(),
        };

        let now = Utc::now();
        lister.execute(now, now).await.unwrap();
        // Only the filtered job from page one is watched; page two's run name
        // does not match.
        assert_eq!(lister.watched.len(), 1);
        assert!(lister.watched.contains("1"));

        nursery.cancel();
        nursery.wait().await.unwrap();
    }
}
