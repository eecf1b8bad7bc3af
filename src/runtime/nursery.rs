//! Structured-concurrency scope owning all of an agent's tasks.

use std::sync::{Arc, Mutex};

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// Recorded when a task signals an unrecoverable condition; the process exits
/// with status 1.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct FatalError(pub String);

/// Owns spawned tasks and propagates cancellation downward. Cloning yields a
/// handle to the same scope, so long-lived tasks (listers) can spawn child
/// watchers into it.
#[derive(Clone)]
pub struct Nursery {
    tracker: TaskTracker,
    cancel: CancellationToken,
    fatal: Arc<Mutex<Option<String>>>,
}

impl Nursery {
    pub fn new() -> Self {
        Self {
            tracker: TaskTracker::new(),
            cancel: CancellationToken::new(),
            fatal: Arc::new(Mutex::new(None)),
        }
    }

    pub fn spawn<F>(&self, future: F)
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        self.tracker.spawn(future);
    }

    /// Resolves when the scope is cancelled; loops select against this at
    /// their suspension points.
    pub async fn cancelled(&self) {
        self.cancel.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Graceful stop: children exit at their next suspension point.
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Record an unrecoverable failure and cancel the scope. The first
    /// recorded message wins.
    pub fn fail(&self, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(%message, "unrecoverable error, shutting down");
        let mut fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        fatal.get_or_insert(message);
        drop(fatal);
        self.cancel.cancel();
    }

    /// Wait for every task in the scope to finish. An `Err` means the scope
    /// was brought down by [`Nursery::fail`].
    pub async fn wait(&self) -> Result<(), FatalError> {
        self.tracker.close();
        self.tracker.wait().await;
        let fatal = self.fatal.lock().unwrap_or_else(|e| e.into_inner());
        match fatal.clone() {
            Some(message) => Err(FatalError(message)),
            None => Ok(()),
        }
    }
}

impl Default for Nursery {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_returns_ok_after_tasks_finish() {
        let nursery = Nursery::new();
        nursery.spawn(async {});
        assert!(nursery.wait().await.is_ok());
    }

    #[tokio::test]
    async fn fail_cancels_children_and_surfaces_the_message() {
        let nursery = Nursery::new();
        let child = nursery.clone();
        nursery.spawn(async move {
            child.cancelled().await;
        });
        nursery.fail("service account key rejected");

        let err = nursery.wait().await.unwrap_err();
        assert_eq!(err.0, "service account key rejected");
    }

    #[tokio::test]
    async fn first_fatal_message_wins() {
        let nursery = Nursery::new();
        nursery.fail("first");
        nursery.fail("second");
        let err = nursery.wait().await.unwrap_err();
        assert_eq!(err.0, "first");
    }

    #[tokio::test]
    async fn tasks_spawned_after_close_are_still_awaited() {
        let nursery = Nursery::new();
        let spawner = nursery.clone();
        let flag = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let seen = flag.clone();
        nursery.spawn(async move {
            spawner.spawn(async move {
                seen.store(true, std::sync::atomic::Ordering::Release);
            });
        });
        nursery.wait().await.unwrap();
        assert!(flag.load(std::sync::atomic::Ordering::Acquire));
    }
}
