//! Shared agent state for the SSIS tasks.
//!
//! All five tasks read and mutate this state; it is partitioned by execution
//! id and every mutation happens under one short-lived lock, never across an
//! await point.

use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex};

use bitflags::bitflags;

use super::core::ExecutionStatus;

bitflags! {
    /// What the agent still needs to observe about an execution.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Monitoring: u8 {
        const STATUS_CHANGE = 0b01;
        const STATISTICS_ADDED = 0b10;
    }
}

/// Per-execution monitoring state.
#[derive(Debug)]
pub struct ExecutionState {
    pub execution_id: i64,
    pub monitoring: Monitoring,
    pub last_seen_status: ExecutionStatus,
    pub last_seen_statistic_id: i64,
    /// Execution paths identified as containers; statistics for these paths
    /// are not reported as tasks.
    pub container_executables: HashSet<String>,
}

impl ExecutionState {
    fn new(execution_id: i64) -> Self {
        Self {
            execution_id,
            monitoring: Monitoring::all(),
            last_seen_status: ExecutionStatus::New,
            last_seen_statistic_id: 0,
            container_executables: HashSet::new(),
        }
    }

    pub fn set_last_stat_id(&mut self, statistic_id: i64) {
        self.last_seen_statistic_id = self.last_seen_statistic_id.max(statistic_id);
    }
}

#[derive(Debug, Default)]
pub struct AgentState {
    pub monitored_executions: BTreeMap<i64, ExecutionState>,
    pub last_known_execution_id: Option<i64>,
}

impl AgentState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start_monitoring(&mut self, execution_id: i64) {
        tracing::info!(execution_id, "execution added to the monitoring");
        self.monitored_executions
            .insert(execution_id, ExecutionState::new(execution_id));
    }

    pub fn stop_monitoring(&mut self, execution_id: i64, monitoring: Monitoring) {
        let Some(state) = self.monitored_executions.get_mut(&execution_id) else {
            return;
        };
        state.monitoring -= monitoring;
        if state.monitoring.is_empty() {
            tracing::info!(execution_id, "no longer monitoring execution");
            self.monitored_executions.remove(&execution_id);
        } else {
            tracing::info!(execution_id, ?monitoring, "no longer monitoring aspect of execution");
        }
    }

    /// Ids of the executions still monitored for the given aspect.
    pub fn monitored_ids(&self, monitoring: Monitoring) -> Vec<i64> {
        self.monitored_executions
            .values()
            .filter(|state| state.monitoring.intersects(monitoring))
            .map(|state| state.execution_id)
            .collect()
    }
}

pub type SharedAgentState = Arc<Mutex<AgentState>>;

pub fn shared_state() -> SharedAgentState {
    Arc::new(Mutex::new(AgentState::new()))
}
