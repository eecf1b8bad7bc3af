//! Process-wide record of the last successful event delivery; read by the
//! heartbeat.

use std::sync::Mutex;

use chrono::{DateTime, Utc};

/// Write-through-max store: only timestamps greater than the current value
/// are accepted, so the reading never moves backwards.
#[derive(Debug, Default)]
pub struct StateStore {
    latest_event_timestamp: Mutex<Option<DateTime<Utc>>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn latest_event_timestamp(&self) -> Option<DateTime<Utc>> {
        *self
            .latest_event_timestamp
            .lock()
            .unwrap_or_else(|e| e.into_inner())
    }

    pub fn record_event_sent(&self, timestamp: DateTime<Utc>) {
        let mut latest = self
            .latest_event_timestamp
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        if latest.is_none_or(|current| current < timestamp) {
            *latest = Some(timestamp);
        }
    }
}
