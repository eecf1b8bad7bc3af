//! Per-activity state for watched Synapse pipeline runs.
//!
//! An activity is the Synapse equivalent of a task. Copy activities
//! additionally expose the datasets they read and write through their user
//! properties.

use serde::Deserialize;
use serde_json::{json, Value};

use crate::events::{Event, LogLevel, Operation, Status};
use crate::runtime::{Sender, TaskError};

use super::{get_status, SynapseConfig, COMPONENT_TOOL};

/// One activity-run record from `queryActivityruns`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(super) struct ActivityRecord {
    pub activity_name: String,
    pub activity_type: String,
    pub activity_run_id: String,
    pub pipeline_name: String,
    pub pipeline_run_id: String,
    #[serde(default)]
    pub activity_run_start: Option<String>,
    #[serde(default)]
    pub activity_run_end: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub output: Option<Value>,
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub user_properties: Option<Value>,
}

/// Activity types with dedicated handling. Everything else goes through the
/// generic path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum ActivityKind {
    Copy,
    Generic,
}

impl ActivityKind {
    pub fn from_type(activity_type: &str) -> Self {
        match activity_type {
            "Copy" => Self::Copy,
            _ => Self::Generic,
        }
    }
}

pub(super) fn activity_click_back_url(config: &SynapseConfig, record: &ActivityRecord) -> Option<String> {
    let workspace_id = config.workspace_id()?;
    let base = super::BASE_CLICK_BACK_URL;
    let run_id = &record.pipeline_run_id;
    let query = |pairs: &[(&str, &str)]| {
        let mut serializer = url::form_urlencoded::Serializer::new(String::new());
        for (key, value) in pairs {
            serializer.append_pair(key, value);
        }
        serializer.finish()
    };
    let url = match record.activity_type.as_str() {
        "SynapseNotebook" => format!(
            "{base}/{run_id}?{}",
            query(&[("workspace", &workspace_id), ("snapshotId", &record.activity_run_id)])
        ),
        "ExecuteDataFlow" => format!(
            "{base}/{run_id}/{}?{}",
            record.activity_run_id,
            query(&[("workspace", &workspace_id)])
        ),
        _ => format!("{base}/{run_id}?{}", query(&[("workspace", &workspace_id)])),
    };
    Some(url)
}

/// Keeps the last reported status of one activity and emits events on
/// transitions.
pub(super) struct ActivityState {
    record: ActivityRecord,
    kind: ActivityKind,
    status: Status,
    click_back_url: Option<String>,
    outbound: Sender<Event>,
}

impl ActivityState {
    pub fn new(config: &SynapseConfig, record: ActivityRecord, outbound: Sender<Event>) -> Self {
        let kind = ActivityKind::from_type(&record.activity_type);
        let click_back_url = activity_click_back_url(config, &record);
        Self {
            record,
            kind,
            status: Status::Unknown,
            click_back_url,
            outbound,
        }
    }

    pub fn finished(&self) -> bool {
        self.status.finished()
    }

    pub fn name(&self) -> &str {
        &self.record.activity_name
    }

    async fn send_task_status(
        &self,
        status: Status,
        timestamp: Option<&str>,
        metadata: Value,
    ) -> Result<(), TaskError> {
        let mut event = Event::run_status(status);
        event.event_timestamp = timestamp.and_then(crate::agents::parse_timestamp);
        event.metadata = Some(metadata);
        event.pipeline_key = Some(self.record.pipeline_name.clone());
        event.run_key = Some(self.record.pipeline_run_id.clone());
        event.task_key = Some(self.record.activity_name.clone());
        event.external_url = self.click_back_url.clone();
        event.component_tool = Some(COMPONENT_TOOL.into());
        if status == Status::Running {
            event.task_name = Some(self.record.activity_name.clone());
        }
        self.outbound.send(event).await?;
        Ok(())
    }

    async fn send_error_log(
        &self,
        message: String,
        timestamp: Option<&str>,
        metadata: Value,
    ) -> Result<(), TaskError> {
        let mut event = Event::message_log(LogLevel::Error, message);
        event.event_timestamp = timestamp.and_then(crate::agents::parse_timestamp);
        event.metadata = Some(metadata);
        event.pipeline_key = Some(self.record.pipeline_name.clone());
        event.run_key = Some(self.record.pipeline_run_id.clone());
        event.task_key = Some(self.record.activity_name.clone());
        event.external_url = self.click_back_url.clone();
        event.component_tool = Some(COMPONENT_TOOL.into());
        self.outbound.send(event).await?;
        Ok(())
    }

    async fn send_dataset_operation(
        &self,
        dataset: &str,
        operation: Operation,
        timestamp: Option<&str>,
    ) -> Result<(), TaskError> {
        let mut event = Event::dataset_operation(operation);
        event.event_timestamp = timestamp.and_then(crate::agents::parse_timestamp);
        event.dataset_key = Some(dataset.to_string());
        event.metadata = Some(json!({
            "pipeline_name": self.record.pipeline_name,
            "pipeline_run_id": self.record.pipeline_run_id,
            "activity_name": self.record.activity_name,
            "activity_run_id": self.record.activity_run_id,
        }));
        event.external_url = self.click_back_url.clone();
        event.component_tool = Some(COMPONENT_TOOL.into());
        self.outbound.send(event).await?;
        Ok(())
    }

    /// Copy activities expose their source and sink dataset names through
    /// `userProperties`.
    async fn kind_update(&self, update: &ActivityRecord) -> Result<(), TaskError> {
        if self.kind != ActivityKind::Copy {
            return Ok(());
        }
        if !matches!(self.status, Status::Completed | Status::CompletedWithWarnings) {
            return Ok(());
        }
        let Some(user_properties) = update.user_properties.as_ref() else {
            return Ok(());
        };
        if let Some(source) = user_properties.get("Source").and_then(Value::as_str) {
            self.send_dataset_operation(source, Operation::Read, update.activity_run_end.as_deref())
                .await?;
        }
        if let Some(destination) = user_properties.get("Destination").and_then(Value::as_str) {
            self.send_dataset_operation(
                destination,
                Operation::Write,
                update.activity_run_end.as_deref(),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn update(&mut self, update: &ActivityRecord) -> Result<(), TaskError> {
        let previous = self.status;
        let observed = get_status(update.status.as_deref());
        if observed != Status::Unknown {
            self.status = observed;
        }
        if self.status == Status::Unknown || self.status == previous {
            return Ok(());
        }
        tracing::debug!(
            run_key = self.record.pipeline_run_id,
            activity = self.record.activity_name,
            status = ?self.status,
            "activity transition"
        );

        let metadata = json!({
            "activity_run_id": update.activity_run_id,
            "activity_type": update.activity_type,
        });

        if previous == Status::Unknown {
            let mut start_metadata = metadata.clone();
            start_metadata["activity_input"] = update.input.clone().unwrap_or(Value::Null);
            self.send_task_status(
                Status::Running,
                update.activity_run_start.as_deref(),
                start_metadata,
            )
            .await?;
        }

        self.kind_update(update).await?;

        if self.finished() {
            if let Some(message) = update
                .error
                .as_ref()
                .and_then(|error| error.get("message"))
                .and_then(Value::as_str)
                .filter(|message| !message.is_empty())
            {
                self.send_error_log(
                    message.to_string(),
                    update.activity_run_end.as_deref(),
                    metadata.clone(),
                )
                .await?;
            }
            let mut end_metadata = metadata;
            end_metadata["activity_output"] = update.output.clone().unwrap_or(Value::Null);
            self.send_task_status(self.status, update.activity_run_end.as_deref(), end_metadata)
                .await?;
        }
        Ok(())
    }
}
