//! SSIS catalog entities and the status translation tables.

use chrono::{DateTime, Utc};

use crate::events::Status;

pub const COMPONENT_TOOL: &str = "ssis";

/// Statuses an execution row can carry.
///
/// `New` does not exist in the catalog; it is the default for executions the
/// agent has discovered but not yet reconciled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ExecutionStatus {
    New = 0,
    Created = 1,
    Running = 2,
    Canceled = 3,
    Failed = 4,
    Pending = 5,
    EndedUnexpectedly = 6,
    Succeeded = 7,
    Stopping = 8,
    Completed = 9,
}

impl ExecutionStatus {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::New),
            1 => Some(Self::Created),
            2 => Some(Self::Running),
            3 => Some(Self::Canceled),
            4 => Some(Self::Failed),
            5 => Some(Self::Pending),
            6 => Some(Self::EndedUnexpectedly),
            7 => Some(Self::Succeeded),
            8 => Some(Self::Stopping),
            9 => Some(Self::Completed),
            _ => None,
        }
    }

    pub fn code(self) -> i32 {
        self as i32
    }
}

/// Results an executable-statistic row can carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StatisticResult {
    Succeeded = 0,
    Failed = 1,
    Completed = 2,
    Canceled = 3,
}

impl StatisticResult {
    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(Self::Succeeded),
            1 => Some(Self::Failed),
            2 => Some(Self::Completed),
            3 => Some(Self::Canceled),
            _ => None,
        }
    }

    /// The task status reported for this result.
    pub fn as_status(self) -> Status {
        match self {
            Self::Succeeded => Status::Completed,
            Self::Completed => Status::CompletedWithWarnings,
            Self::Canceled | Self::Failed => Status::Failed,
        }
    }
}

type TransitionRule = (Status, Option<&'static [ExecutionStatus]>, &'static [ExecutionStatus]);

/// Translations from an execution status transition to the statuses that
/// must be reported. Each entry is (reported status, accepted previous
/// statuses or any, captured statuses).
const EXPECTED_STATUS_TRANSITIONS: &[TransitionRule] = &[
    (
        Status::Running,
        Some(&[ExecutionStatus::New, ExecutionStatus::Created, ExecutionStatus::Pending]),
        &[
            ExecutionStatus::Running,
            ExecutionStatus::Failed,
            ExecutionStatus::Succeeded,
            ExecutionStatus::Completed,
            ExecutionStatus::EndedUnexpectedly,
        ],
    ),
    (Status::Completed, None, &[ExecutionStatus::Succeeded]),
    (Status::CompletedWithWarnings, None, &[ExecutionStatus::Completed]),
    (
        Status::Failed,
        None,
        &[ExecutionStatus::Failed, ExecutionStatus::EndedUnexpectedly],
    ),
];

/// The pipeline statuses implied by observing `reported` after `prev`, in
/// reporting order.
///
/// An execution found for the first time already at SUCCEEDED yields RUNNING
/// (with its start time) followed by COMPLETED (with its end time).
pub fn status_transitions(prev: ExecutionStatus, reported: ExecutionStatus) -> Vec<Status> {
    EXPECTED_STATUS_TRANSITIONS
        .iter()
        .filter(|(_, expected_prev, expected_reported)| {
            expected_prev.is_none_or(|accepted| accepted.contains(&prev))
                && expected_reported.contains(&reported)
        })
        .map(|(status, _, _)| *status)
        .collect()
}

fn pipeline_key_of(folder: &str, project: &str, package: &str) -> String {
    format!("{folder}/{project}/{package}")
}

/// A row from `[catalog].[executions]`; the pipeline-run side of the model.
#[derive(Debug, Clone)]
pub struct Execution {
    pub execution_id: i64,
    pub folder_name: String,
    pub project_name: String,
    pub package_name: String,
    pub status: i32,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
}

impl Execution {
    pub fn pipeline_key(&self) -> String {
        pipeline_key_of(&self.folder_name, &self.project_name, &self.package_name)
    }

    pub fn run_key(&self) -> String {
        format!("{}:{}", self.pipeline_key(), self.execution_id)
    }

    pub fn status_obj(&self) -> Option<ExecutionStatus> {
        ExecutionStatus::from_code(self.status)
    }
}

/// A row from `[catalog].[executable_statistics]`, joined with its
/// execution's naming columns; the task side of the model. Statistics are
/// final once written.
#[derive(Debug, Clone)]
pub struct ExecutableStatistic {
    pub execution_id: i64,
    pub folder_name: String,
    pub project_name: String,
    pub package_name: String,
    pub statistics_id: i64,
    pub execution_path: String,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub execution_result: i32,
}

impl ExecutableStatistic {
    pub fn pipeline_key(&self) -> String {
        pipeline_key_of(&self.folder_name, &self.project_name, &self.package_name)
    }

    pub fn pipeline_name(&self) -> String {
        self.package_name
            .strip_suffix(".dtsx")
            .unwrap_or(&self.package_name)
            .to_string()
    }

    pub fn run_key(&self) -> String {
        format!("{}:{}", self.pipeline_key(), self.execution_id)
    }

    pub fn task_key(&self) -> String {
        format!("{}:{}", self.pipeline_key(), self.statistics_id)
    }

    pub fn task_name(&self) -> String {
        self.execution_path
            .rsplit_once('\\')
            .map_or(self.execution_path.as_str(), |(_, leaf)| leaf)
            .to_string()
    }

    pub fn result_obj(&self) -> Option<StatisticResult> {
        StatisticResult::from_code(self.execution_result)
    }
}
