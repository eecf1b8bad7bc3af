//! Bookkeeping for the hierarchical watcher pattern: listers spawn one
//! watcher per discovered run and reap the finished ones on later ticks.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::runtime::{Nursery, PeriodicLoop, PeriodicTask};

/// Watchers keyed by `run_key`. Each key has exactly one live watcher; a
/// finished watcher stays in the map until the next reap so a run seen again
/// in the same listing tick is not double-spawned.
#[derive(Default)]
pub struct WatchMap {
    watched: HashMap<String, Arc<AtomicBool>>,
}

impl WatchMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, run_key: &str) -> bool {
        self.watched.contains_key(run_key)
    }

    pub fn len(&self) -> usize {
        self.watched.len()
    }

    pub fn is_empty(&self) -> bool {
        self.watched.is_empty()
    }

    pub fn track(&mut self, run_key: impl Into<String>, finished: Arc<AtomicBool>) {
        self.watched.insert(run_key.into(), finished);
    }

    /// Drop entries whose watcher has finished; returns how many went away.
    pub fn reap(&mut self) -> usize {
        let before = self.watched.len();
        self.watched.retain(|run_key, finished| {
            let done = finished.load(Ordering::Acquire);
            if done {
                tracing::debug!(run_key, "removed finished watcher");
            }
            !done
        });
        before - self.watched.len()
    }
}

/// Start a watcher on the shared nursery under its own periodic loop. The
/// returned flag flips when the watcher's loop has fully exited.
pub fn spawn_watcher<T>(nursery: &Nursery, watch_period: Duration, task: T) -> Arc<AtomicBool>
where
    T: PeriodicTask + 'static,
{
    let finished = Arc::new(AtomicBool::new(false));
    let flag = finished.clone();
    let scope = nursery.clone();
    nursery.spawn(async move {
        PeriodicLoop::new(watch_period, task).run(scope).await;
        flag.store(true, Ordering::Release);
    });
    finished
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::TaskError;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};

    struct OneShot;

    #[async_trait]
    impl PeriodicTask for OneShot {
        async fn execute(
            &mut self,
            _current: DateTime<Utc>,
            _previous: DateTime<Utc>,
        ) -> Result<(), TaskError> {
            Ok(())
        }

        fn is_done(&self) -> bool {
            true
        }
    }

    #[tokio::test]
    async fn finished_watchers_are_reaped_on_the_next_tick() {
        let nursery = Nursery::new();
        let mut map = WatchMap::new();

        let flag = spawn_watcher(&nursery, Duration::from_secs(1), OneShot);
        map.track("r1", flag);
        assert!(map.contains("r1"));

        nursery.wait().await.unwrap();
        assert_eq!(map.reap(), 1);
        assert!(!map.contains("r1"));
    }

    #[tokio::test]
    async fn unfinished_watchers_survive_reaping() {
        let mut map = WatchMap::new();
        map.track("r2", Arc::new(AtomicBool::new(false)));
        assert_eq!(map.reap(), 0);
        assert!(map.contains("r2"));
        assert_eq!(map.len(), 1);
    }
}
