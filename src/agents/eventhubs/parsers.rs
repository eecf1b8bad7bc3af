//! Parsers deciding whether an Event Hubs record is something we can
//! process, and how.
//!
//! An incoming record is handled by the first parser whose `applies` returns
//! true. The unknown-status parser sits first and swallows records whose
//! translated status is UNKNOWN.

use serde_json::{Map, Value};

use crate::agents::parse_timestamp;
use crate::events::{Event, Status};
use crate::runtime::TaskError;

use super::COMPONENT_TOOL;

pub(super) fn translate_status(status: &str) -> Status {
    match status {
        "InProgress" => Status::Running,
        "Succeeded" => Status::Completed,
        "Failed" => Status::Failed,
        other => {
            tracing::error!(status = other, "unrecognized status, defaulting to UNKNOWN");
            Status::Unknown
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub(super) enum KeyRelation {
    AllOf,
    OneOf,
    NoneOf,
}

/// Key-presence predicate over a record.
#[derive(Debug, Clone, Copy)]
pub(super) struct Keys {
    pub names: &'static [&'static str],
    pub relation: KeyRelation,
}

impl Keys {
    pub fn valid(&self, record: &Map<String, Value>) -> bool {
        match self.relation {
            KeyRelation::AllOf => self.names.iter().all(|name| record.contains_key(*name)),
            KeyRelation::OneOf => self.names.iter().any(|name| record.contains_key(*name)),
            KeyRelation::NoneOf => !self.names.iter().any(|name| record.contains_key(*name)),
        }
    }
}

pub(super) trait EventHubParser: Send + Sync {
    fn applies(&self, record: &Map<String, Value>) -> bool;
    fn publish(&self, record: &Map<String, Value>) -> Result<Vec<Event>, TaskError>;
}

/// Weeds out records without a usable status.
pub(super) struct UnknownStatusParser;

impl EventHubParser for UnknownStatusParser {
    fn applies(&self, record: &Map<String, Value>) -> bool {
        let status = record.get("status").and_then(Value::as_str).unwrap_or("");
        translate_status(status) == Status::Unknown
    }

    fn publish(&self, _record: &Map<String, Value>) -> Result<Vec<Event>, TaskError> {
        Ok(Vec::new())
    }
}

/// Azure Data Factory diagnostic records: pipeline and activity runs.
pub(super) struct AdfParser {
    valid_categories: &'static [&'static str],
    keys: &'static [Keys],
}

impl AdfParser {
    pub fn new() -> Self {
        Self {
            valid_categories: &["ActivityRuns", "PipelineRuns"],
            keys: &[
                Keys {
                    names: &["pipelineName", "resourceId", "status"],
                    relation: KeyRelation::AllOf,
                },
                Keys {
                    names: &["pipelineRunId", "runId"],
                    relation: KeyRelation::OneOf,
                },
                Keys {
                    names: &["start", "end"],
                    relation: KeyRelation::OneOf,
                },
            ],
        }
    }
}

fn first_string<'a>(record: &'a Map<String, Value>, keys: &[&str]) -> Option<&'a str> {
    keys.iter()
        .find_map(|key| record.get(*key).and_then(Value::as_str))
}

/// Output metrics worth reporting from a Copy activity.
const COPY_METRIC_KEYS: [&str; 4] = ["filesRead", "filesWritten", "dataRead", "dataWritten"];

impl EventHubParser for AdfParser {
    fn applies(&self, record: &Map<String, Value>) -> bool {
        let Some(category) = record.get("category").and_then(Value::as_str) else {
            return false;
        };
        if !self.valid_categories.contains(&category) {
            return false;
        }
        if !self.keys.iter().all(|keys| keys.valid(record)) {
            return false;
        }
        let status = record.get("status").and_then(Value::as_str).unwrap_or("");
        translate_status(status) != Status::Unknown
    }

    fn publish(&self, record: &Map<String, Value>) -> Result<Vec<Event>, TaskError> {
        let pipeline_key = record
            .get("pipelineName")
            .and_then(Value::as_str)
            .ok_or_else(|| TaskError::failed("record is missing pipelineName"))?;
        let run_key = first_string(record, &["pipelineRunId", "runId"])
            .ok_or_else(|| TaskError::failed("record is missing a run id"))?;
        let status = translate_status(
            record.get("status").and_then(Value::as_str).unwrap_or(""),
        );
        let timestamp = record
            .get("timestamp")
            .and_then(Value::as_str)
            .and_then(parse_timestamp);
        let task_key = record
            .get("activityName")
            .and_then(Value::as_str)
            .map(str::to_string);
        let metadata = record.get("properties").cloned();
        let resource_id = record.get("resourceId").and_then(Value::as_str).unwrap_or("");
        let external_url =
            format!("https://adf.azure.com/monitoring/pipelineruns/{run_key}?factory={resource_id}");

        let mut status_event = Event::run_status(status);
        status_event.event_timestamp = timestamp;
        status_event.pipeline_key = Some(pipeline_key.to_string());
        status_event.run_key = Some(run_key.to_string());
        status_event.task_key = task_key.clone();
        status_event.metadata = metadata.clone();
        status_event.external_url = Some(external_url.clone());
        status_event.component_tool = Some(COMPONENT_TOOL.into());
        let mut events = vec![status_event];

        let activity_type = record.get("activityType").and_then(Value::as_str);
        let output = record.get("properties").and_then(|v| v.pointer("/Output"));
        if activity_type == Some("Copy") {
            if let Some(output) = output.and_then(Value::as_object) {
                for metric_key in COPY_METRIC_KEYS {
                    let Some(metric_value) = output.get(metric_key).and_then(Value::as_f64) else {
                        continue;
                    };
                    let mut metric = Event::metric_log(metric_key, metric_value);
                    metric.event_timestamp = timestamp;
                    metric.pipeline_key = Some(pipeline_key.to_string());
                    metric.run_key = Some(run_key.to_string());
                    metric.task_key = task_key.clone();
                    metric.metadata = metadata.clone();
                    metric.external_url = Some(external_url.clone());
                    metric.component_tool = Some(COMPONENT_TOOL.into());
                    events.push(metric);
                }
            }
        }
        Ok(events)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record(value: Value) -> Map<String, Value> {
        value.as_object().cloned().unwrap()
    }

    fn adf_record() -> Map<String, Value> {
        record(json!({
            "category": "ActivityRuns",
            "pipelineName": "nightly",
            "resourceId": "/subscriptions/s/factories/f",
            "status": "Succeeded",
            "pipelineRunId": "run-1",
            "activityName": "CopyData",
            "activityType": "Copy",
            "start": "2024-04-01T00:00:00Z",
            "end": "2024-04-01T00:05:00Z",
            "timestamp": "2024-04-01T00:05:00Z",
            "properties": {"Output": {"filesRead": 3, "dataWritten": 1024, "throughput": 17}}
        }))
    }

    #[test]
    fn key_relations_check_presence() {
        let data = record(json!({"a": 1, "b": null}));
        assert!(Keys { names: &["a", "b"], relation: KeyRelation::AllOf }.valid(&data));
        assert!(!Keys { names: &["a", "c"], relation: KeyRelation::AllOf }.valid(&data));
        assert!(Keys { names: &["c", "b"], relation: KeyRelation::OneOf }.valid(&data));
        assert!(Keys { names: &["c", "d"], relation: KeyRelation::NoneOf }.valid(&data));
        assert!(!Keys { names: &["a"], relation: KeyRelation::NoneOf }.valid(&data));
    }

    #[test]
    fn unknown_status_parser_swallows_unmapped_statuses() {
        let parser = UnknownStatusParser;
        assert!(parser.applies(&record(json!({"status": "Queued"}))));
        assert!(parser.applies(&record(json!({}))));
        assert!(!parser.applies(&record(json!({"status": "Succeeded"}))));
        assert!(parser.publish(&record(json!({}))).unwrap().is_empty());
    }

    #[test]
    fn adf_parser_rejects_wrong_categories_and_missing_keys() {
        let parser = AdfParser::new();
        assert!(parser.applies(&adf_record()));

        let mut wrong_category = adf_record();
        wrong_category.insert("category".into(), json!("TriggerRuns"));
        assert!(!parser.applies(&wrong_category));

        let mut no_run_id = adf_record();
        no_run_id.remove("pipelineRunId");
        assert!(!parser.applies(&no_run_id));
        no_run_id.insert("runId".into(), json!("run-2"));
        assert!(parser.applies(&no_run_id));

        let mut unknown_status = adf_record();
        unknown_status.insert("status".into(), json!("Queued"));
        assert!(!parser.applies(&unknown_status));
    }

    #[test]
    fn adf_publish_emits_status_plus_copy_metrics() {
        let events = AdfParser::new().publish(&adf_record()).unwrap();
        assert_eq!(events.len(), 3);

        assert_eq!(events[0].status, Some(Status::Completed));
        assert_eq!(events[0].pipeline_key.as_deref(), Some("nightly"));
        assert_eq!(events[0].run_key.as_deref(), Some("run-1"));
        assert_eq!(events[0].task_key.as_deref(), Some("CopyData"));
        assert!(events[0]
            .external_url
            .as_deref()
            .unwrap()
            .contains("pipelineruns/run-1?factory="));

        let metric_keys: Vec<&str> = events[1..]
            .iter()
            .map(|event| event.metric_key.as_deref().unwrap())
            .collect();
        // Only the recognized metrics that are present in the output.
        assert_eq!(metric_keys, vec!["filesRead", "dataWritten"]);
        assert_eq!(events[1].metric_value, Some(3.0));
        assert_eq!(events[2].metric_value, Some(1024.0));
    }

    #[test]
    fn non_copy_activities_emit_no_metrics() {
        let mut plain = adf_record();
        plain.insert("activityType".into(), json!("Lookup"));
        let events = AdfParser::new().publish(&plain).unwrap();
        assert_eq!(events.len(), 1);
    }
}
