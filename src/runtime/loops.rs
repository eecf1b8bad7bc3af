//! Loops drive tasks on recurring input: a timer tick or a channel.

use std::time::Duration;

use chrono::Utc;

use super::channel::Receiver;
use super::nursery::Nursery;
use super::task::{ChannelTask, PeriodicTask, TaskError};

fn absorb(err: &TaskError, nursery: &Nursery) -> bool {
    if err.is_unrecoverable() {
        nursery.fail(err.to_string());
        true
    } else {
        tracing::warn!(%err, "uncaught error during task execution");
        false
    }
}

/// Executes a task every `period`. Ticks are back-to-back sleep-then-invoke;
/// execution time is not deducted, so ticks drift forward under load.
pub struct PeriodicLoop<T: PeriodicTask> {
    period: Duration,
    task: T,
}

impl<T: PeriodicTask> PeriodicLoop<T> {
    pub fn new(period: Duration, task: T) -> Self {
        Self { period, task }
    }

    pub async fn run(mut self, nursery: Nursery) {
        let mut previous = Utc::now();
        loop {
            let current = Utc::now();
            if let Err(err) = self.task.execute(current, previous).await {
                if absorb(&err, &nursery) {
                    break;
                }
            }
            previous = current;
            if self.task.is_done() {
                break;
            }
            if let Some(new_period) = self.task.take_period_update() {
                self.period = new_period;
            }
            tokio::select! {
                () = nursery.cancelled() => break,
                () = tokio::time::sleep(self.period) => {}
            }
        }
        self.task.close().await;
    }
}

/// Drains an inbound channel, invoking the task once per value. Terminates
/// cleanly when every sender is gone.
pub struct ChannelReceiveLoop<T: ChannelTask> {
    inbound: Receiver<T::Item>,
    task: T,
}

impl<T: ChannelTask> ChannelReceiveLoop<T> {
    pub fn new(inbound: Receiver<T::Item>, task: T) -> Self {
        Self { inbound, task }
    }

    pub async fn run(mut self, nursery: Nursery) {
        loop {
            tokio::select! {
                () = nursery.cancelled() => break,
                received = self.inbound.recv() => match received {
                    Some(item) => {
                        if let Err(err) = self.task.execute(item).await {
                            if absorb(&err, &nursery) {
                                break;
                            }
                        }
                    }
                    None => {
                        tracing::warn!("inbound channel closed, stopping receive loop");
                        break;
                    }
                },
            }
        }
        self.task.close().await;
    }
}
