//! The five cooperating SSIS tasks.
//!
//! Discovery never emits events itself; it only registers executions in the
//! shared state. Two pollers then fan execution updates and new statistics
//! into their channel handlers, which produce the actual events.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use std::sync::LazyLock;

use crate::events::{Event, Status};
use crate::runtime::{ChannelTask, PeriodicTask, Sender, TaskError};

use super::catalog::SsisCatalog;
use super::core::{
    status_transitions, ExecutableStatistic, Execution, ExecutionStatus, COMPONENT_TOOL,
};
use super::state::{Monitoring, SharedAgentState};

/// How many execution criteria are OR'ed together per statistics query.
const QUERY_BATCH_SIZE: usize = 100;

/// Loop iterations show up as a numeric index in container paths; the index
/// is stripped before a container path is registered.
static LOOP_INDEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\[\d+\]").unwrap_or_else(|_| unreachable!("static pattern")));

impl From<super::catalog::CatalogError> for TaskError {
    fn from(err: super::catalog::CatalogError) -> Self {
        TaskError::Failed(err.to_string())
    }
}

/// Polls the catalog for not-yet-known executions and registers them in the
/// agent state. Found executions are not sent downstream; that would race
/// with the update and statistics pollers.
pub struct FetchNewExecutionsTask {
    catalog: Arc<dyn SsisCatalog>,
    state: SharedAgentState,
}

impl FetchNewExecutionsTask {
    pub fn new(catalog: Arc<dyn SsisCatalog>, state: SharedAgentState) -> Self {
        Self { catalog, state }
    }
}

#[async_trait]
impl PeriodicTask for FetchNewExecutionsTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let last_known = self.state.lock().unwrap_or_else(|e| e.into_inner()).last_known_execution_id;

        match last_known {
            None => {
                tracing::info!("agent is starting from an empty state");
                match self.catalog.max_execution_id().await? {
                    Some(max_id) => {
                        tracing::info!(execution_id = max_id, "marked as the last known execution");
                        self.state
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .last_known_execution_id = Some(max_id);
                    }
                    None => tracing::info!("no executions found"),
                }
            }
            Some(last_known) => {
                tracing::info!(newer_than = last_known, "searching for new executions");
                let ids = self.catalog.execution_ids_after(last_known).await?;
                if ids.is_empty() {
                    tracing::info!("no new executions were found");
                    return Ok(());
                }
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                let mut newest = last_known;
                for execution_id in &ids {
                    state.start_monitoring(*execution_id);
                    newest = newest.max(*execution_id);
                }
                tracing::info!(
                    count = ids.len(),
                    last_execution_id = newest,
                    "found new executions to monitor"
                );
                state.last_known_execution_id = Some(newest);
            }
        }
        Ok(())
    }
}

/// Polls the catalog for monitored executions whose status moved since the
/// last look, grouping the query by last-seen status. Updated executions are
/// sent downstream for event processing.
pub struct FindUpdatedExecutionsTask {
    catalog: Arc<dyn SsisCatalog>,
    state: SharedAgentState,
    outbound: Sender<Execution>,
}

impl FindUpdatedExecutionsTask {
    pub fn new(
        catalog: Arc<dyn SsisCatalog>,
        state: SharedAgentState,
        outbound: Sender<Execution>,
    ) -> Self {
        Self {
            catalog,
            state,
            outbound,
        }
    }
}

#[async_trait]
impl PeriodicTask for FindUpdatedExecutionsTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        // One query per distinct last-seen status.
        let groups: Vec<(ExecutionStatus, Vec<i64>)> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let mut by_status: std::collections::BTreeMap<ExecutionStatus, Vec<i64>> =
                std::collections::BTreeMap::new();
            for id in state.monitored_ids(Monitoring::STATUS_CHANGE) {
                if let Some(execution) = state.monitored_executions.get(&id) {
                    by_status.entry(execution.last_seen_status).or_default().push(id);
                }
            }
            by_status.into_iter().collect()
        };

        for (status, ids) in groups {
            tracing::info!(status = ?status, "searching executions for updates");
            for execution in self
                .catalog
                .executions_changed_from(&ids, status.code())
                .await?
            {
                tracing::info!(execution_id = execution.execution_id, "updates detected");
                self.outbound.send(execution).await?;
            }
        }
        Ok(())
    }
}

/// Turns execution status transitions into run-status events. Executions
/// that reached a final status are removed from status-change monitoring.
pub struct HandleUpdatedExecutionTask {
    state: SharedAgentState,
    outbound: Sender<Event>,
}

impl HandleUpdatedExecutionTask {
    pub fn new(state: SharedAgentState, outbound: Sender<Event>) -> Self {
        Self { state, outbound }
    }
}

#[async_trait]
impl ChannelTask for HandleUpdatedExecutionTask {
    type Item = Execution;

    async fn execute(&mut self, execution: Execution) -> Result<(), TaskError> {
        let previous = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(execution_state) = state.monitored_executions.get(&execution.execution_id)
            else {
                tracing::warn!(
                    execution_id = execution.execution_id,
                    "update for an execution that is no longer monitored"
                );
                return Ok(());
            };
            execution_state.last_seen_status
        };
        let reported = execution
            .status_obj()
            .ok_or_else(|| TaskError::failed(format!("unknown execution status {}", execution.status)))?;

        tracing::info!(
            execution_id = execution.execution_id,
            from = ?previous,
            to = ?reported,
            "handling status transition"
        );

        let transitions = status_transitions(previous, reported);
        if transitions.is_empty() {
            tracing::info!("transition did not generate events");
        }

        let mut last_status = None;
        for status in transitions {
            let timestamp = if status == Status::Running {
                Some(execution.start_time)
            } else {
                execution.end_time
            };
            let Some(timestamp) = timestamp else {
                tracing::error!(status = ?status, "could not handle status transition without a timestamp");
                continue;
            };

            let mut event = Event::run_status(status);
            event.event_timestamp = Some(timestamp);
            event.pipeline_key = Some(execution.pipeline_key());
            event.pipeline_name = Some(execution.package_name.clone());
            event.run_key = Some(execution.run_key());
            event.component_tool = Some(COMPONENT_TOOL.into());
            tracing::info!(status = ?status, "emitting event");
            self.outbound.send(event).await?;
            last_status = Some(status);
        }

        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if last_status.is_some_and(Status::finished) {
            state.stop_monitoring(execution.execution_id, Monitoring::STATUS_CHANGE);
        } else if let Some(execution_state) =
            state.monitored_executions.get_mut(&execution.execution_id)
        {
            execution_state.last_seen_status = reported;
        }
        Ok(())
    }
}

/// Polls the catalog for statistics newer than each execution's last-seen
/// statistic id, in batches. An execution no longer monitored for status
/// changes that yields no new statistics is assumed fully captured and
/// leaves statistics monitoring.
pub struct FindAddedStatisticsTask {
    catalog: Arc<dyn SsisCatalog>,
    state: SharedAgentState,
    outbound: Sender<ExecutableStatistic>,
}

impl FindAddedStatisticsTask {
    pub fn new(
        catalog: Arc<dyn SsisCatalog>,
        state: SharedAgentState,
        outbound: Sender<ExecutableStatistic>,
    ) -> Self {
        Self {
            catalog,
            state,
            outbound,
        }
    }
}

#[async_trait]
impl PeriodicTask for FindAddedStatisticsTask {
    async fn execute(
        &mut self,
        _current: DateTime<Utc>,
        _previous: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let criteria: Vec<(i64, i64)> = {
            let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state
                .monitored_ids(Monitoring::STATISTICS_ADDED)
                .into_iter()
                .filter_map(|id| {
                    state
                        .monitored_executions
                        .get(&id)
                        .map(|execution| (id, execution.last_seen_statistic_id))
                })
                .collect()
        };

        let mut quiet: HashSet<i64> = criteria.iter().map(|(id, _)| *id).collect();
        for batch in criteria.chunks(QUERY_BATCH_SIZE) {
            tracing::info!(count = batch.len(), "searching for new tasks among monitored executions");
            for statistic in self.catalog.statistics_after(batch).await? {
                {
                    let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                    if let Some(execution) =
                        state.monitored_executions.get_mut(&statistic.execution_id)
                    {
                        execution.set_last_stat_id(statistic.statistics_id);
                    }
                }
                quiet.remove(&statistic.execution_id);
                self.outbound.send(statistic).await?;
            }
        }
        tracing::info!("done searching new tasks");

        // A finished execution with nothing new this round has been fully
        // captured by earlier rounds.
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        for (execution_id, _) in &criteria {
            let still_status_monitored = state
                .monitored_executions
                .get(execution_id)
                .is_some_and(|execution| execution.monitoring.intersects(Monitoring::STATUS_CHANGE));
            if !still_status_monitored && quiet.contains(execution_id) {
                state.stop_monitoring(*execution_id, Monitoring::STATISTICS_ADDED);
            }
        }
        Ok(())
    }
}

/// Reports each new statistic as a task: a RUNNING event at its start time
/// and the mapped terminal status at its end time. Container executables are
/// detected by path and skipped.
pub struct HandleNewStatisticsTask {
    state: SharedAgentState,
    outbound: Sender<Event>,
}

impl HandleNewStatisticsTask {
    pub fn new(state: SharedAgentState, outbound: Sender<Event>) -> Self {
        Self { state, outbound }
    }

    async fn emit(
        &self,
        statistic: &ExecutableStatistic,
        status: Status,
        timestamp: DateTime<Utc>,
    ) -> Result<(), TaskError> {
        let mut event = Event::run_status(status);
        event.event_timestamp = Some(timestamp);
        event.pipeline_key = Some(statistic.pipeline_key());
        event.pipeline_name = Some(statistic.pipeline_name());
        event.run_key = Some(statistic.run_key());
        event.task_key = Some(statistic.task_key());
        event.task_name = Some(statistic.task_name());
        event.component_tool = Some(COMPONENT_TOOL.into());
        tracing::info!(status = ?status, "emitting task event");
        self.outbound.send(event).await?;
        Ok(())
    }
}

#[async_trait]
impl ChannelTask for HandleNewStatisticsTask {
    type Item = ExecutableStatistic;

    async fn execute(&mut self, statistic: ExecutableStatistic) -> Result<(), TaskError> {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            let Some(execution) = state.monitored_executions.get_mut(&statistic.execution_id)
            else {
                return Ok(());
            };
            // Inner executables surface before their containers, so a path
            // previously recorded as a container is one.
            if execution.container_executables.contains(&statistic.execution_path) {
                return Ok(());
            }
            if let Some((container, _)) = statistic.execution_path.rsplit_once('\\') {
                let container = LOOP_INDEX.replace_all(container, "").into_owned();
                execution.container_executables.insert(container);
            }
        }

        let result = statistic.result_obj().ok_or_else(|| {
            TaskError::failed(format!(
                "unknown executable result {}",
                statistic.execution_result
            ))
        })?;
        self.emit(&statistic, Status::Running, statistic.start_time).await?;
        self.emit(&statistic, result.as_status(), statistic.end_time).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::ssis::catalog::CatalogError;
    use crate::agents::ssis::state::shared_state;
    use crate::runtime::channel;
    use chrono::TimeZone;
    use std::sync::Mutex;

    /// Scriptable in-memory catalog.
    #[derive(Default)]
    struct FakeCatalog {
        max_id: Mutex<Option<i64>>,
        new_ids: Mutex<Vec<i64>>,
        changed: Mutex<Vec<Execution>>,
        statistics: Mutex<Vec<ExecutableStatistic>>,
    }

    #[async_trait]
    impl SsisCatalog for FakeCatalog {
        async fn max_execution_id(&self) -> Result<Option<i64>, CatalogError> {
            Ok(*self.max_id.lock().unwrap())
        }

        async fn execution_ids_after(&self, last_known: i64) -> Result<Vec<i64>, CatalogError> {
            Ok(self
                .new_ids
                .lock()
                .unwrap()
                .iter()
                .copied()
                .filter(|id| *id > last_known)
                .collect())
        }

        async fn executions_changed_from(
            &self,
            ids: &[i64],
            status: i32,
        ) -> Result<Vec<Execution>, CatalogError> {
            Ok(self
                .changed
                .lock()
                .unwrap()
                .iter()
                .filter(|e| ids.contains(&e.execution_id) && e.status != status)
                .cloned()
                .collect())
        }

        async fn statistics_after(
            &self,
            criteria: &[(i64, i64)],
        ) -> Result<Vec<ExecutableStatistic>, CatalogError> {
            Ok(self
                .statistics
                .lock()
                .unwrap()
                .iter()
                .filter(|s| {
                    criteria
                        .iter()
                        .any(|(id, last)| s.execution_id == *id && s.statistics_id > *last)
                })
                .cloned()
                .collect())
        }
    }

    fn t(minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, minute, 0).unwrap()
    }

    fn execution(id: i64, status: ExecutionStatus) -> Execution {
        Execution {
            execution_id: id,
            folder_name: "Finance".into(),
            project_name: "ETL".into(),
            package_name: "Load.dtsx".into(),
            status: status.code(),
            start_time: t(0),
            end_time: Some(t(5)),
        }
    }

    fn statistic(execution_id: i64, statistics_id: i64, path: &str, result: i32) -> ExecutableStatistic {
        ExecutableStatistic {
            execution_id,
            folder_name: "Finance".into(),
            project_name: "ETL".into(),
            package_name: "Load.dtsx".into(),
            statistics_id,
            execution_path: path.into(),
            start_time: t(1),
            end_time: t(2),
            execution_result: result,
        }
    }

    #[tokio::test]
    async fn first_fetch_tick_only_records_the_high_water_mark() {
        let catalog = Arc::new(FakeCatalog::default());
        *catalog.max_id.lock().unwrap() = Some(41);
        catalog.new_ids.lock().unwrap().extend([40, 41]);

        let state = shared_state();
        let mut task = FetchNewExecutionsTask::new(catalog.clone(), state.clone());
        task.execute(t(0), t(0)).await.unwrap();

        let snapshot = state.lock().unwrap();
        assert_eq!(snapshot.last_known_execution_id, Some(41));
        assert!(snapshot.monitored_executions.is_empty());
    }

    #[tokio::test]
    async fn later_fetch_ticks_monitor_new_executions_and_advance() {
        let catalog = Arc::new(FakeCatalog::default());
        *catalog.max_id.lock().unwrap() = Some(41);
        let state = shared_state();
        let mut task = FetchNewExecutionsTask::new(catalog.clone(), state.clone());
        task.execute(t(0), t(0)).await.unwrap();

        catalog.new_ids.lock().unwrap().extend([42, 43]);
        task.execute(t(1), t(0)).await.unwrap();

        let snapshot = state.lock().unwrap();
        assert_eq!(snapshot.last_known_execution_id, Some(43));
        assert!(snapshot.monitored_executions.contains_key(&42));
        assert!(snapshot.monitored_executions.contains_key(&43));
    }

    #[tokio::test]
    async fn updated_executions_flow_downstream() {
        let catalog = Arc::new(FakeCatalog::default());
        catalog
            .changed
            .lock()
            .unwrap()
            .push(execution(7, ExecutionStatus::Running));

        let state = shared_state();
        state.lock().unwrap().start_monitoring(7);

        let (tx, mut rx) = channel::channel::<Execution>(0);
        let mut task = FindUpdatedExecutionsTask::new(catalog, state, tx);
        task.execute(t(0), t(0)).await.unwrap();
        drop(task);

        let received = rx.recv().await.unwrap();
        assert_eq!(received.execution_id, 7);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn execution_first_seen_at_succeeded_emits_running_then_completed() {
        let state = shared_state();
        state.lock().unwrap().start_monitoring(7);

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut task = HandleUpdatedExecutionTask::new(state.clone(), tx);
        task.execute(execution(7, ExecutionStatus::Succeeded)).await.unwrap();
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);

        assert_eq!(events[0].status, Some(Status::Running));
        assert_eq!(events[0].event_timestamp, Some(t(0)));
        assert_eq!(events[0].run_key.as_deref(), Some("Finance/ETL/Load.dtsx:7"));

        assert_eq!(events[1].status, Some(Status::Completed));
        assert_eq!(events[1].event_timestamp, Some(t(5)));

        // The terminal status ends status-change monitoring.
        let snapshot = state.lock().unwrap();
        let remaining = &snapshot.monitored_executions[&7];
        assert!(!remaining.monitoring.intersects(Monitoring::STATUS_CHANGE));
        assert!(remaining.monitoring.intersects(Monitoring::STATISTICS_ADDED));
    }

    #[tokio::test]
    async fn non_terminal_update_just_advances_last_seen_status() {
        let state = shared_state();
        state.lock().unwrap().start_monitoring(7);

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut task = HandleUpdatedExecutionTask::new(state.clone(), tx);
        task.execute(execution(7, ExecutionStatus::Running)).await.unwrap();
        drop(task);

        let event = rx.recv().await.unwrap();
        assert_eq!(event.status, Some(Status::Running));
        assert!(rx.recv().await.is_none());

        let snapshot = state.lock().unwrap();
        assert_eq!(
            snapshot.monitored_executions[&7].last_seen_status,
            ExecutionStatus::Running
        );
        assert!(snapshot.monitored_executions[&7]
            .monitoring
            .intersects(Monitoring::STATUS_CHANGE));
    }

    #[tokio::test]
    async fn statistics_poller_advances_cursor_and_stops_quiet_executions() {
        let catalog = Arc::new(FakeCatalog::default());
        catalog
            .statistics
            .lock()
            .unwrap()
            .push(statistic(7, 31, "Package\\Load Orders", 0));

        let state = shared_state();
        {
            let mut locked = state.lock().unwrap();
            locked.start_monitoring(7);
            // Execution 8 is already final and yields nothing this round.
            locked.start_monitoring(8);
            locked.stop_monitoring(8, Monitoring::STATUS_CHANGE);
        }

        let (tx, mut rx) = channel::channel::<ExecutableStatistic>(0);
        let mut task = FindAddedStatisticsTask::new(catalog, state.clone(), tx);
        task.execute(t(0), t(0)).await.unwrap();
        drop(task);

        assert_eq!(rx.recv().await.unwrap().statistics_id, 31);
        assert!(rx.recv().await.is_none());

        let snapshot = state.lock().unwrap();
        assert_eq!(snapshot.monitored_executions[&7].last_seen_statistic_id, 31);
        // Quiet and status-finished: fully captured, dropped from the map.
        assert!(!snapshot.monitored_executions.contains_key(&8));
    }

    #[tokio::test]
    async fn statistics_emit_running_then_terminal_pairs() {
        let state = shared_state();
        state.lock().unwrap().start_monitoring(7);

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut task = HandleNewStatisticsTask::new(state, tx);
        task.execute(statistic(7, 31, "Package\\Load Orders", 2)).await.unwrap();
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].status, Some(Status::Running));
        assert_eq!(events[0].event_timestamp, Some(t(1)));
        assert_eq!(events[0].task_name.as_deref(), Some("Load Orders"));
        assert_eq!(events[0].task_key.as_deref(), Some("Finance/ETL/Load.dtsx:31"));
        // Result code 2 (COMPLETED) reports with warnings.
        assert_eq!(events[1].status, Some(Status::CompletedWithWarnings));
        assert_eq!(events[1].event_timestamp, Some(t(2)));
    }

    #[tokio::test]
    async fn container_executables_are_collapsed() {
        let state = shared_state();
        state.lock().unwrap().start_monitoring(7);

        let (tx, mut rx) = channel::channel::<Event>(0);
        let mut task = HandleNewStatisticsTask::new(state.clone(), tx);

        // A child inside a loop iteration registers "Package\Loop" (index
        // stripped) as a container.
        task.execute(statistic(7, 31, "Package\\Loop[1]\\Child", 0)).await.unwrap();
        // The container itself is then skipped entirely.
        task.execute(statistic(7, 32, "Package\\Loop", 0)).await.unwrap();
        drop(task);

        let mut events = Vec::new();
        while let Some(event) = rx.recv().await {
            events.push(event);
        }
        assert_eq!(events.len(), 2);
        for event in &events {
            assert_eq!(event.task_name.as_deref(), Some("Child"));
        }

        let snapshot = state.lock().unwrap();
        assert!(snapshot.monitored_executions[&7]
            .container_executables
            .contains("Package\\Loop"));
    }
}
