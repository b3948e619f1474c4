use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

use super::{AdmissionError, AdmissionQueue, AdmissionStats, RateLimiter};
use crate::observability::metrics::record_admission;
use crate::tasks::BackgroundTask;

/// Front door for rate-limited work
///
/// Runs a continuation right away when the limiter has budget, otherwise
/// parks it in the client's admission queue. The continuation is not polled
/// until it is admitted, so a request that times out or is cancelled while
/// queued never starts. Queued work is released by [`AdmissionController::tick`]
/// and draws on the same limiter, so the limiter's rate bounds total
/// throughput.
pub struct AdmissionController {
    limiter: Arc<dyn RateLimiter>,
    queue: Arc<AdmissionQueue>,
    immediate: AtomicU64,
}

impl AdmissionController {
    pub fn new(limiter: Arc<dyn RateLimiter>, queue: Arc<AdmissionQueue>) -> Self {
        Self {
            limiter,
            queue,
            immediate: AtomicU64::new(0),
        }
    }

    pub fn queue(&self) -> &Arc<AdmissionQueue> {
        &self.queue
    }

    /// Admit with the configured default deadline
    pub async fn admit<F, T>(&self, client_id: &str, continuation: F) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        let deadline = self.queue.config().default_deadline;
        self.admit_with_deadline(client_id, deadline, continuation).await
    }

    pub async fn admit_with_deadline<F, T>(
        &self,
        client_id: &str,
        deadline: Duration,
        continuation: F,
    ) -> Result<T, AdmissionError>
    where
        F: Future<Output = T>,
    {
        // A client with queued work joins the back of its queue even if the
        // limiter would let this request through, to keep arrival order.
        if !self.queue.has_pending(client_id) && self.limiter.try_acquire(client_id) {
            self.immediate.fetch_add(1, Ordering::Relaxed);
            record_admission("immediate");
            return Ok(continuation.await);
        }

        let slot = self.queue.enqueue(client_id, deadline)?;
        let waited = slot.wait().await?;
        debug!(client_id = %client_id, waited_ms = waited.as_millis() as u64, "Admitted from queue");

        Ok(continuation.await)
    }

    /// Release queued work the limiter has budget for, at most `budget`
    pub fn tick(&self, budget: usize) -> usize {
        self.queue.tick_limited(self.limiter.as_ref(), budget)
    }

    /// Tick on the queue's configured interval
    pub fn start_scheduler(&self) -> BackgroundTask {
        self.queue.start_scheduler(Arc::clone(&self.limiter))
    }

    pub fn stats(&self) -> ControllerStats {
        ControllerStats {
            admitted_immediately: self.immediate.load(Ordering::Relaxed),
            queue: self.queue.stats(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ControllerStats {
    pub admitted_immediately: u64,
    pub queue: AdmissionStats,
}
