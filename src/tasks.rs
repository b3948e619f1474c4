//! Owned periodic background work
//!
//! Every timer in the crate (cache sweeps, the admission scheduler) runs as a
//! [`BackgroundTask`]: started explicitly, stopped explicitly, and aborted if
//! its handle is dropped without being stopped.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Handle to a periodic task spawned on the tokio runtime
pub struct BackgroundTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl BackgroundTask {
    /// Spawn `work` to run once per `interval`
    ///
    /// The first run happens one full interval after spawning.
    pub fn spawn<F, Fut>(name: &'static str, interval: Duration, mut work: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut stopped) = watch::channel(false);

        let handle = tokio::spawn(async move {
            let start = tokio::time::Instant::now() + interval;
            let mut ticker = tokio::time::interval_at(start, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        work().await;
                    }
                    changed = stopped.changed() => {
                        if changed.is_err() || *stopped.borrow() {
                            break;
                        }
                    }
                }
            }

            debug!(task = name, "Background task loop exited");
        });

        info!(task = name, interval_ms = %interval.as_millis(), "Background task started");

        Self {
            name,
            shutdown,
            handle: Some(handle),
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|handle| !handle.is_finished())
    }

    /// Signal the task to stop and wait for its current iteration to finish
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(task = self.name, error = %e, "Background task ended abnormally");
            }
        }
        info!(task = self.name, "Background task stopped");
    }
}

impl Drop for BackgroundTask {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tracing_test::traced_test;

    #[tokio::test(start_paused = true)]
    async fn test_task_runs_each_interval() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = BackgroundTask::spawn("test", Duration::from_secs(10), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(31)).await;
        assert_eq!(runs.load(Ordering::SeqCst), 3);

        task.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_stopped_task_no_longer_runs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();

        let task = BackgroundTask::spawn("test", Duration::from_secs(1), move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(task.is_running());
        task.stop().await;

        let after_stop = runs.load(Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(runs.load(Ordering::SeqCst), after_stop);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_lifecycle_is_logged() {
        let task = BackgroundTask::spawn("sweep", Duration::from_secs(60), || async {});
        assert!(logs_contain("Background task started"));

        task.stop().await;
        assert!(logs_contain("Background task stopped"));
    }
}
