//! Task traits and the error kinds loops know how to absorb.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;

use crate::http::HttpError;

/// Failure of a single task execution. Everything except `Unrecoverable` is
/// logged at the loop level and the loop continues.
#[derive(Debug, thiserror::Error)]
pub enum TaskError {
    /// Forces the whole scope down; the process exits 1.
    #[error("unrecoverable: {0}")]
    Unrecoverable(String),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("{0}")]
    Failed(String),
}

impl TaskError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }

    pub fn is_unrecoverable(&self) -> bool {
        matches!(self, Self::Unrecoverable(_))
    }
}

impl From<serde_json::Error> for TaskError {
    fn from(err: serde_json::Error) -> Self {
        Self::Failed(err.to_string())
    }
}

impl From<super::channel::ChannelClosed> for TaskError {
    fn from(err: super::channel::ChannelClosed) -> Self {
        Self::Failed(err.to_string())
    }
}

/// A task driven on a recurring tick with the current and previous tick
/// times.
#[async_trait]
pub trait PeriodicTask: Send {
    async fn execute(
        &mut self,
        current: DateTime<Utc>,
        previous: DateTime<Utc>,
    ) -> Result<(), TaskError>;

    /// Self-signalled completion; the loop stops after the tick that set it.
    fn is_done(&self) -> bool {
        false
    }

    /// One-shot request for a new loop period, taking effect from the next
    /// tick.
    fn take_period_update(&mut self) -> Option<Duration> {
        None
    }

    /// Resource release; runs exactly once when the loop exits, including on
    /// cancellation.
    async fn close(&mut self) {}
}

/// A task driven by values received from an inbound channel.
#[async_trait]
pub trait ChannelTask: Send {
    type Item: Send;

    async fn execute(&mut self, item: Self::Item) -> Result<(), TaskError>;

    async fn close(&mut self) {}
}
