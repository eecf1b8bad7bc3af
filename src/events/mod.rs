//! Normalized lifecycle events flowing from watchers to the ingestion
//! service.
//!
//! Events are immutable after creation: built by exactly one watcher, sent
//! over the outbound channel, consumed once by the sender.

pub mod state;

pub use state::StateStore;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;

/// Maps to the URL paths of event types accepted by the ingestion API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventType {
    RunStatus,
    MessageLog,
    MetricLog,
    DatasetOperation,
    TestOutcomes,
}

impl EventType {
    pub fn path(self) -> &'static str {
        match self {
            Self::RunStatus => "run-status",
            Self::MessageLog => "message-log",
            Self::MetricLog => "metric-log",
            Self::DatasetOperation => "dataset-operation",
            Self::TestOutcomes => "test-outcomes",
        }
    }
}

/// Normalized run/task status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Status {
    Running,
    Completed,
    CompletedWithWarnings,
    Failed,
    Unknown,
}

impl Status {
    /// Terminal statuses; a run or task never leaves one.
    pub fn finished(self) -> bool {
        matches!(self, Self::Completed | Self::CompletedWithWarnings | Self::Failed)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogLevel {
    Error,
    Warning,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
    Read,
    Write,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
    pub name: String,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

/// One event payload. The `event_type` routes the event to its ingestion
/// path and is not part of the serialized body; absent fields are omitted.
#[derive(Debug, Clone, Serialize)]
pub struct Event {
    #[serde(skip)]
    pub event_type: EventType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub event_timestamp: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pipeline_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<Status>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_level: Option<LogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metric_value: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<Operation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dataset_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_outcomes: Option<Vec<TestOutcome>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub component_tool: Option<String>,
}

impl Event {
    pub fn new(event_type: EventType) -> Self {
        Self {
            event_type,
            event_timestamp: None,
            pipeline_key: None,
            pipeline_name: None,
            run_key: None,
            task_key: None,
            task_name: None,
            status: None,
            log_level: None,
            message: None,
            metric_key: None,
            metric_value: None,
            operation: None,
            dataset_key: None,
            dataset_name: None,
            test_outcomes: None,
            metadata: None,
            external_url: None,
            component_tool: None,
        }
    }

    pub fn run_status(status: Status) -> Self {
        let mut event = Self::new(EventType::RunStatus);
        event.status = Some(status);
        event
    }

    pub fn message_log(level: LogLevel, message: impl Into<String>) -> Self {
        let mut event = Self::new(EventType::MessageLog);
        event.log_level = Some(level);
        event.message = Some(message.into());
        event
    }

    pub fn metric_log(key: impl Into<String>, value: f64) -> Self {
        let mut event = Self::new(EventType::MetricLog);
        event.metric_key = Some(key.into());
        event.metric_value = Some(value);
        event
    }

    pub fn dataset_operation(operation: Operation) -> Self {
        let mut event = Self::new(EventType::DatasetOperation);
        event.operation = Some(operation);
        event
    }

    pub fn test_outcomes(outcomes: Vec<TestOutcome>) -> Self {
        let mut event = Self::new(EventType::TestOutcomes);
        event.test_outcomes = Some(outcomes);
        event
    }
}
