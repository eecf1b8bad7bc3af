//! The cooperative runtime: a structured-concurrency nursery, bounded
//! in-process channels, task traits, and the loops that drive them.
//!
//! Everything runs on a current-thread tokio runtime; code between await
//! points is effectively atomic. The only sanctioned second OS thread is the
//! Event Hubs consumer bridge.

pub mod channel;
pub mod loops;
pub mod nursery;
pub mod task;

pub use channel::{channel, null_sender, Receiver, Sender};
pub use loops::{ChannelReceiveLoop, PeriodicLoop};
pub use nursery::{FatalError, Nursery};
pub use task::{ChannelTask, PeriodicTask, TaskError};

use std::time::Duration;

/// Seconds-as-f64 from configuration into a [`Duration`].
pub fn period(seconds: f64) -> Duration {
    Duration::from_secs_f64(seconds.max(0.0))
}
