//! Airflow agent: lists DAG runs started in the listing window and watches
//! each run's state and task instances until the run finishes.

use std::collections::HashMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::{Method, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use url::Url;

use crate::config::{registry::ConfigBlock, types, ConfigError, CoreConfig, HttpClientConfig};
use crate::events::{Event, Status};
use crate::http::{
    get_client, load_agent_authenticator, Call, HttpClient, RequestHandle, RetryRule,
};
use crate::runtime::{period, Nursery, PeriodicLoop, PeriodicTask, Sender, TaskError};

use super::watch::{spawn_watcher, WatchMap};
use super::{
    event_channel, parse_timestamp, run_until_shutdown, spawn_outbound, AgentContext,
};

pub const COMPONENT_TOOL: &str = "airflow";

/// The stable REST API returns 503 while the scheduler restarts; retry
/// through it.
fn service_unavailable_retry() -> RetryRule {
    RetryRule::new(StatusCode::SERVICE_UNAVAILABLE, 5)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AirflowConfig {
    pub api_url: Url,
    #[serde(default = "default_period")]
    pub period: f64,
}

fn default_period() -> f64 {
    5.0
}

impl ConfigBlock for AirflowConfig {
    const NAME: &'static str = "airflow";
    const ENV_PREFIX: &'static str = "DK_AIRFLOW_";
    const FIELDS: &'static [&'static str] = &["api_url", "period"];

    fn validate(&mut self) -> Result<(), ConfigError> {
        types::require_http_url(Self::NAME, "api_url", &self.api_url)?;
        types::require_non_negative(Self::NAME, "period", self.period)?;
        types::ensure_trailing_slash(&mut self.api_url);
        Ok(())
    }
}

/// Airflow DAG run states are "queued", "running", "success", "failed".
fn get_status(state: &str) -> Status {
    match state.to_ascii_lowercase().as_str() {
        "queued" => Status::Unknown,
        "running" => Status::Running,
        "success" => Status::Completed,
        "failed" => Status::Failed,
        other => {
            tracing::warn!(state = other, "unrecognized status, defaulting to UNKNOWN");
            Status::Unknown
        }
    }
}

/// One observed task instance state.
#[derive(Debug, Clone)]
struct TaskSnapshot {
    name: String,
    timestamp: DateTime<Utc>,
    status: Status,
}

impl TaskSnapshot {
    fn from_json(data: &Value) -> Option<Self> {
        let name = data.get("task_id")?.as_str()?.to_string();
        let status = get_status(data.get("state").and_then(Value::as_str).unwrap_or(""));
        let field = if status.finished() { "end_date" } else { "start_date" };
        let timestamp = parse_timestamp(data.get(field)?.as_str()?)?;
        Some(Self {
            name,
            timestamp,
            status,
        })
    }

    /// Identity of this instance within a run, stable across polls. The name
    /// alone is not enough: a retried task reappears under the same name
    /// with a new timestamp.
    fn key(&self) -> String {
        format!("{}@{}", self.name, self.timestamp.to_rfc3339())
    }
}

struct AirflowWatchRunTask {
    run_endpoint: RequestHandle,
    tasks_endpoint: RequestHandle,
    pipeline_key: String,
    run_key: String,
    task_instances: HashMap<String, TaskSnapshot>,
    outbound: Sender<Event>,
    done: bool,
}

impl AirflowWatchRunTask {
    fn new(
        config: &AirflowConfig,
        client: HttpClient,
        pipeline_key: String,
        run_key: String,
        outbound: Sender<Event>,
    ) -> Self {
        let run_endpoint = RequestHandle::new(
            client.clone(),
            config.api_url.clone(),
            Method::GET,
            "dags/{dag_id}/dagRuns/{dag_run_id}",
        )
        .with_retry(service_unavailable_retry());
        let tasks_endpoint = RequestHandle::new(
            client,
            config.api_url.clone(),
            Method::GET,
            "dags/{dag_id}/dagRuns/{dag_run_id}/taskInstances",
        )
        .with_retry(service_unavailable_retry());
        Self {
            run_endpoint,
            tasks_endpoint,
            pipeline_key,
            run_key,
            task_instances: HashMap::new(),
            outbound,
            done: false,
        }
    }

    async fn update_task_instances(&mut self) -> Result<(), TaskError> {
        let response = self
            .tasks_endpoint
            .send(
                Call::new()
                    .path_arg("dag_id", self.pipeline_key.as_str())
                    .path_arg("dag_run_id", self.run_key.as_str()),
            )
            .await?;
        if !response.status().is_success() {
            tracing::warn!(
                pipeline_key = self.pipeline_key,
                run_key = self.run_key,
                status = response.status().as_u16(),
                "failed to get task instances"
            );
            return Ok(());
        }

        let body: Value = response.json()?;
        let instances = body
            .get("task_instances")
            .and_then(Value::as_array)
            .ok_or_else(|| TaskError::failed("task instance listing missing 'task_instances'"))?;

        for data in instances {
            let Some(task) = TaskSnapshot::from_json(data) else {
                tracing::warn!(run_key = self.run_key, "skipping unparsable task instance");
                continue;
            };
            let key = task.key();
            if let Some(previous) = self.task_instances.get(&key) {
                // Never resend a finished instance or an unchanged status.
                if previous.status.finished() || previous.status == task.status {
                    continue;
                }
            }

            let mut event = Event::run_status(task.status);
            event.event_timestamp = Some(task.timestamp);
            event.pipeline_key = Some(self.pipeline_key.clone());
            event.run_key = Some(self.run_key.clone());
            event.task_key = Some(task.name.clone());
            event.metadata = Some(json!({}));
            event.component_tool = Some(COMPONENT_TOOL.into());
            self.task_instances.insert(key, task);
            self.outbound.send(event).await?;
        }
        Ok(())
    }

    async fn update_run_status(&mut self) -> Result<(), TaskError> {
        let response = self
            .run_endpoint
            .send(
                Call::new()
                    .path_arg("dag_id", self.pipeline_key.as_str())
                    .path_arg("dag_run_id", self.run_key.as_str()),
            )
            .await?;
        if !response.status().is_success() {
            tracing::warn!(
                pipeline_key = self.pipeline_key,
                run_key = self.run_key,
                status = response.status().as_u16(),
                "failed to get DAG run"
            );
            return Ok(());
        }

        let data: Value = response.json()?;
        let status = get_status(data.get("state").and_then(Value::as_str).unwrap_or(""));
        if !status.finished() {
            return Ok(());
        }

        let Some(timestamp) = data
            .get("end_date")
            .and_then(Value::as_str)
            .and_then(parse_timestamp)
        else {
            tracing::warn!(run_key = self.run_key, "finished run is missing end_date");
            return Ok(());
        };

        tracing::info!(
            pipeline_key = self.pipeline_key,
            run_key = self.run_key,
            "finishing run"
        );
        let mut event = Event::run_status(status);
        event.event_timestamp = Some(timestamp);
        event.pipeline_key = Some(self.pipeline_key.clone());
        event.run_key = Some(self.run_key.clone());
        event.metadata = Some(json!({}));
        event.component_tool = Some(COMPONENT_TOOL.into());
        self.outbound.send(event).await?;
        self.done = true;
        Ok(())
    }
}

#[async_trait]
impl PeriodicTask for AirflowWatchRunTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        // Task transitions go out before the run's terminal event.
        self.update_task_instances().await?;
        self.update_run_status().await
    }

    fn is_done(&self) -> bool {
        self.done
    }
}

struct AirflowListRunsTask {
    config: std::sync::Arc<AirflowConfig>,
    client: HttpClient,
    dag_list_endpoint: RequestHandle,
    list_runs_endpoint: RequestHandle,
    nursery: Nursery,
    outbound: Sender<Event>,
    watched: WatchMap,
}

impl AirflowListRunsTask {
    fn new(
        context: &AgentContext,
        nursery: Nursery,
        outbound: Sender<Event>,
    ) -> anyhow::Result<Self> {
        let registry = &context.registry;
        let config = registry.lookup::<AirflowConfig>()?;
        let auth = load_agent_authenticator(registry, "")?;
        let client = get_client(registry.lookup::<HttpClientConfig>()?.as_ref(), Some(auth))?;

        let dag_list_endpoint = RequestHandle::new(
            client.clone(),
            config.api_url.clone(),
            Method::GET,
            "dags",
        )
        .with_retry(service_unavailable_retry());
        let list_runs_endpoint = RequestHandle::new(
            client.clone(),
            config.api_url.clone(),
            Method::POST,
            "dags/~/dagRuns/list",
        )
        .with_retry(service_unavailable_retry());

        Ok(Self {
            config,
            client,
            dag_list_endpoint,
            list_runs_endpoint,
            nursery,
            outbound,
            watched: WatchMap::new(),
        })
    }

    async fn get_dag_ids(&self) -> Result<Vec<String>, TaskError> {
        let response = self.dag_list_endpoint.send(Call::new()).await?;
        let body: Value = response.json()?;
        let mut ids: Vec<String> = body
            .get("dags")
            .and_then(Value::as_array)
            .ok_or_else(|| TaskError::failed("DAG listing missing 'dags'"))?
            .iter()
            .filter_map(|dag| dag.get("dag_id").and_then(Value::as_str))
            .map(str::to_string)
            .collect();
        ids.sort();
        Ok(ids)
    }
}

#[async_trait]
impl PeriodicTask for AirflowListRunsTask {
    async fn execute(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let dag_ids = self.get_dag_ids().await?;
        let payload = json!({
            "dag_ids": dag_ids,
            "execution_date_gte": previous.to_rfc3339(),
            "execution_date_lte": current.to_rfc3339(),
        });

        let response = self.list_runs_endpoint.send(Call::new().body(payload)).await?;
        if !response.status().is_success() {
            tracing::warn!(status = response.status().as_u16(), "failed to list DAG runs");
            return Ok(());
        }

        let body: Value = response.json()?;
        let empty = Vec::new();
        for run_data in body.get("dag_runs").and_then(Value::as_array).unwrap_or(&empty) {
            let (Some(pipeline_key), Some(run_key)) = (
                run_data.get("dag_id").and_then(Value::as_str),
                run_data.get("dag_run_id").and_then(Value::as_str),
            ) else {
                tracing::warn!("DAG run is missing dag_id or dag_run_id, skipping");
                continue;
            };

            let watch_key = format!("{pipeline_key}|{run_key}");
            if self.watched.contains(&watch_key) {
                continue;
            }

            let watcher = AirflowWatchRunTask::new(
                &self.config,
                self.client.clone(),
                pipeline_key.to_string(),
                run_key.to_string(),
                self.outbound.clone(),
            );
            let finished = spawn_watcher(&self.nursery, period(self.config.period), watcher);
            self.watched.track(watch_key, finished);
            tracing::debug!(pipeline_key, run_key, "run to be observed");
        }

        self.watched.reap();
        Ok(())
    }
}

pub async fn run(context: AgentContext) -> anyhow::Result<()> {
    context.registry.register::<AirflowConfig>()?;
    let agent_config = context.registry.lookup::<AirflowConfig>()?;
    let core = context.registry.lookup::<CoreConfig>()?;

    let (outbound, inbound) = event_channel(&core);
    let nursery = Nursery::new();
    let lister = AirflowListRunsTask::new(&context, nursery.clone(), outbound)?;
    nursery.spawn(PeriodicLoop::new(period(agent_config.period), lister).run(nursery.clone()));
    spawn_outbound(&nursery, &context, inbound, COMPONENT_TOOL)?;
    run_until_shutdown(nursery).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HttpClientConfig;
    use crate::runtime::channel;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn test_config(server: &MockServer) -> AirflowConfig {
        let mut config = AirflowConfig {
            api_url: Url::parse(&server.uri()).unwrap(),
            period: 5.0,
        };
        config.validate().unwrap();
        config
    }

    fn test_client() -> HttpClient {
        get_client(&HttpClientConfig::default(), None).unwrap()
    }

    #[test]
    fn status_mapping_round_trips_known_states() {
        assert_eq!(get_status("running"), Status::Running);
        assert_eq!(get_status("SUCCESS"), Status::Completed);
        assert_eq!(get_status("failed"), Status::Failed);
        assert_eq!(get_status("queued"), Status::Unknown);
        assert_eq!(get_status("definitely-new-state"), Status::Unknown);
    }

    #[test]
    fn snapshot_uses_end_date_only_when_finished() {
        let running = TaskSnapshot::from_json(&json!({
            "task_id": "t",
            "state": "running",
            "start_date": "2024-01-01T00:00:01+00:00",
            "end_date": "2024-01-01T00:00:59+00:00",
        }))
        .unwrap();
        assert_eq!(running.timestamp.to_rfc3339(), "2024-01-01T00:00:01+00:00");

        let finished = TaskSnapshot::from_json(&json!({
            "task_id": "t",
            "state": "success",
            "start_date": "2024-01-01T00:00:01+00:00",
            "end_date": "2024-01-01T00:00:59+00:00",
        }))
        .unwrap();
        assert_eq!(finished.timestamp.to_rfc3339(), "2024-01-01T00:00:59+00:00");
    }

    #[tokio::test]
    async fn watcher_emits_task_then_run_events_for_a_successful_run() {
        let server = MockServer::start().await;
        // First poll: everything running.
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1/taskInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_instances": [
                    {"task_id": "t", "state": "running", "start_date": "2024-01-01T00:00:01+00:00"}
                ]
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "running", "start_date": "2024-01-01T00:00:00+00:00"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        // Second poll: run and task succeeded.
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1/taskInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_instances": [
                    {"task_id": "t", "state": "success", "end_date": "2024-01-01T00:00:59+00:00"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "state": "success", "end_date": "2024-01-01T00:01:00+00:00"
            })))
            .mount(&server)
            .await;

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut watcher = AirflowWatchRunTask::new(
            &test_config(&server),
            test_client(),
            "d1".into(),
            "r1".into(),
            tx,
        );

        let now = Utc::now();
        watcher.execute(now, now).await.unwrap();
        assert!(!watcher.is_done());
        watcher.execute(now, now).await.unwrap();
        assert!(watcher.is_done());
        drop(watcher);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 3);

        assert_eq!(events[0].status, Some(Status::Running));
        assert_eq!(events[0].task_key.as_deref(), Some("t"));
        assert_eq!(
            events[0].event_timestamp.unwrap().to_rfc3339(),
            "2024-01-01T00:00:01+00:00"
        );

        assert_eq!(events[1].status, Some(Status::Completed));
        assert_eq!(events[1].task_key.as_deref(), Some("t"));
        assert_eq!(
            events[1].event_timestamp.unwrap().to_rfc3339(),
            "2024-01-01T00:00:59+00:00"
        );

        // Run event last, carrying the run's own end time.
        assert_eq!(events[2].status, Some(Status::Completed));
        assert_eq!(events[2].task_key, None);
        assert_eq!(events[2].run_key.as_deref(), Some("r1"));
        assert_eq!(
            events[2].event_timestamp.unwrap().to_rfc3339(),
            "2024-01-01T00:01:00+00:00"
        );
    }

    #[tokio::test]
    async fn watcher_does_not_resend_unchanged_or_finished_tasks() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1/taskInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "task_instances": [
                    {"task_id": "t", "state": "running", "start_date": "2024-01-01T00:00:01+00:00"}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "running"})))
            .mount(&server)
            .await;

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut watcher = AirflowWatchRunTask::new(
            &test_config(&server),
            test_client(),
            "d1".into(),
            "r1".into(),
            tx,
        );

        let now = Utc::now();
        watcher.execute(now, now).await.unwrap();
        watcher.execute(now, now).await.unwrap();
        drop(watcher);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        // Only the first RUNNING made it out.
        assert_eq!(events.len(), 1);
    }

    #[tokio::test]
    async fn lister_spawns_once_per_run_and_skips_empty_result() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/dags"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dags": [{"dag_id": "d1"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dags/~/dagRuns/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "dag_runs": [{"dag_id": "d1", "dag_run_id": "r1", "state": "running"}]
            })))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/dags/~/dagRuns/list"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"dag_runs": []})))
            .mount(&server)
            .await;
        // The spawned watcher's endpoints: keep it alive but idle.
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1/taskInstances"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"task_instances": []})))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/dags/d1/dagRuns/r1"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"state": "running"})))
            .mount(&server)
            .await;

        let config = test_config(&server);
        let nursery = Nursery::new();
        let (tx, _rx) = channel::channel::<Event>(0);
        let mut lister = AirflowListRunsTask {
            config: std::sync::Arc::new(config.clone()),
            client: test_client(),
            dag_list_endpoint: RequestHandle::new(
                test_client(),
                config.api_url.clone(),
                Method::GET,
                "dags",
            ),
            list_runs_endpoint: RequestHandle::new(
                test_client(),
                config.api_url.clone(),
                Method::POST,
                "dags/~/dagRuns/list",
            ),
            nursery: nursery.clone(),
            outbound: tx,
            watched: WatchMap::new(),
        };

        let now = Utc::now();
        lister.execute(now, now).await.unwrap();
        assert_eq!(lister.watched.len(), 1);

        // Same run listed again: no duplicate watcher.
        lister.execute(now, now).await.unwrap();
        assert_eq!(lister.watched.len(), 1);

        // Empty listing: nothing new.
        lister.execute(now, now).await.unwrap();
        assert_eq!(lister.watched.len(), 1);

        nursery.cancel();
        nursery.wait().await.unwrap();
    }
}
