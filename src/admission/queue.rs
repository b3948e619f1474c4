//! Per-client admission queues
//!
//! Every client has its own bounded FIFO. Clients with pending entries sit
//! in a rotation; each tick walks the rotation, admitting the head entry of
//! one client at a time until the tick's budget is spent or the rate limiter
//! refuses every waiting client. Queued admissions draw on the same limiter
//! budget as immediate ones.
//! A client that still has entries goes to the back of the rotation, so a
//! busy client cannot starve a quiet one and fairness carries over from one
//! tick to the next.
//!
//! Waiting is done by the caller through a [`QueueSlot`]. The slot removes
//! its entry when it times out or is dropped, so cancelled requests leave
//! nothing behind.

use parking_lot::Mutex;
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::{AdmissionError, NoopRateLimiter, RateLimiter};
use crate::observability::metrics::{record_admission, record_admission_wait};
use crate::tasks::BackgroundTask;

type Admit = oneshot::Sender<Result<(), AdmissionError>>;

#[derive(Debug, Clone)]
pub struct AdmissionQueueConfig {
    /// Maximum pending entries per client
    pub per_client_capacity: usize,
    /// Residency limit applied when the caller gives none
    pub default_deadline: Duration,
    /// Scheduler interval; aligned with the limiter's replenishment period
    pub tick_interval: Duration,
    /// Upper bound on entries admitted per tick
    pub budget_per_tick: usize,
}

impl Default for AdmissionQueueConfig {
    fn default() -> Self {
        Self {
            per_client_capacity: 50,
            default_deadline: Duration::from_secs(30),
            tick_interval: Duration::from_secs(1),
            budget_per_tick: 10,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct AdmissionStats {
    /// Entries currently waiting
    pub depth: usize,
    /// Clients with at least one waiting entry
    pub waiting_clients: usize,
    pub enqueued: u64,
    pub drained: u64,
    pub rejected_full: u64,
    pub timed_out: u64,
    pub cancelled: u64,
}

struct QueueEntry {
    id: u64,
    enqueued_at: Instant,
    deadline: Instant,
    admit: Admit,
}

#[derive(Default)]
struct QueueState {
    clients: HashMap<String, VecDeque<QueueEntry>>,
    /// Clients with pending entries, next to be served at the front
    rotation: VecDeque<String>,
    next_id: u64,
    depth: usize,
    closed: bool,
    stats: AdmissionStats,
}

impl QueueState {
    fn remove(&mut self, client_id: &str, id: u64) -> Option<QueueEntry> {
        let queue = self.clients.get_mut(client_id)?;
        let position = queue.iter().position(|entry| entry.id == id)?;
        let entry = queue.remove(position)?;
        self.depth -= 1;
        if queue.is_empty() {
            self.clients.remove(client_id);
            self.rotation.retain(|c| c != client_id);
        }
        Some(entry)
    }

    /// Admit the head entry of the next client in the rotation that the
    /// limiter lets through
    ///
    /// Every waiting client is offered at most once per call. Dead entries
    /// are discarded before the limiter is asked, so budget is only spent on
    /// live waiters.
    fn admit_next(&mut self, now: Instant, limiter: &dyn RateLimiter) -> bool {
        for _ in 0..self.rotation.len() {
            let Some(client_id) = self.rotation.pop_front() else {
                break;
            };
            let Some(queue) = self.clients.get_mut(&client_id) else {
                continue;
            };

            let mut admitted = false;
            let mut expired = 0;
            let mut abandoned = 0;
            while let Some(entry) = queue.pop_front() {
                if entry.admit.is_closed() {
                    self.depth -= 1;
                    abandoned += 1;
                    continue;
                }
                if now >= entry.deadline {
                    self.depth -= 1;
                    let waited = now.saturating_duration_since(entry.enqueued_at);
                    let _ = entry.admit.send(Err(AdmissionError::QueueTimeout { waited }));
                    expired += 1;
                    continue;
                }
                if !limiter.try_acquire(&client_id) {
                    queue.push_front(entry);
                    break;
                }
                self.depth -= 1;
                if entry.admit.send(Ok(())).is_ok() {
                    record_admission_wait(now.saturating_duration_since(entry.enqueued_at));
                    admitted = true;
                    break;
                }
                abandoned += 1;
            }

            let drained_client = queue.is_empty();
            if drained_client {
                self.clients.remove(&client_id);
            } else {
                self.rotation.push_back(client_id);
            }

            self.stats.timed_out += expired;
            self.stats.cancelled += abandoned;
            if admitted {
                self.stats.drained += 1;
                return true;
            }
        }
        false
    }
}

/// Bounded, fair queue of requests waiting for rate budget
pub struct AdmissionQueue {
    config: AdmissionQueueConfig,
    state: Mutex<QueueState>,
}

impl AdmissionQueue {
    pub fn new(config: AdmissionQueueConfig) -> Self {
        Self {
            config,
            state: Mutex::new(QueueState::default()),
        }
    }

    pub fn config(&self) -> &AdmissionQueueConfig {
        &self.config
    }

    /// Append a waiter to `client_id`'s queue
    ///
    /// Fails with [`AdmissionError::QueueFull`] without queuing when the
    /// client is already at capacity.
    pub fn enqueue(self: &Arc<Self>, client_id: &str, deadline: Duration) -> Result<QueueSlot, AdmissionError> {
        let now = Instant::now();
        let (admit, receiver) = oneshot::channel();

        let mut state = self.state.lock();
        if state.closed {
            return Err(AdmissionError::Shutdown);
        }

        let pending = state.clients.get(client_id).map_or(0, VecDeque::len);
        if pending >= self.config.per_client_capacity {
            state.stats.rejected_full += 1;
            drop(state);
            record_admission("queue_full");
            debug!(client_id = %client_id, pending, "Admission queue full");
            return Err(AdmissionError::QueueFull {
                client_id: client_id.to_string(),
                capacity: self.config.per_client_capacity,
            });
        }

        let id = state.next_id;
        state.next_id += 1;
        let deadline = now + deadline;

        if pending == 0 {
            state.rotation.push_back(client_id.to_string());
        }
        state
            .clients
            .entry(client_id.to_string())
            .or_default()
            .push_back(QueueEntry {
                id,
                enqueued_at: now,
                deadline,
                admit,
            });
        state.depth += 1;
        state.stats.enqueued += 1;
        drop(state);

        record_admission("queued");

        Ok(QueueSlot {
            queue: Arc::clone(self),
            client_id: client_id.to_string(),
            id,
            enqueued_at: now,
            deadline,
            receiver: Some(receiver),
            settled: false,
        })
    }

    /// Whether `client_id` has entries waiting
    pub fn has_pending(&self, client_id: &str) -> bool {
        self.state.lock().clients.contains_key(client_id)
    }

    pub fn pending(&self, client_id: &str) -> usize {
        self.state.lock().clients.get(client_id).map_or(0, VecDeque::len)
    }

    pub fn depth(&self) -> usize {
        self.state.lock().depth
    }

    /// Admit up to `budget` entries round-robin across clients; returns how
    /// many entries were admitted
    pub fn tick(&self, budget: usize) -> usize {
        self.tick_limited(&NoopRateLimiter, budget)
    }

    /// Like [`AdmissionQueue::tick`], but every admission also consumes one
    /// unit from `limiter`
    ///
    /// The round ends early once the limiter refuses every waiting client.
    pub fn tick_limited(&self, limiter: &dyn RateLimiter, budget: usize) -> usize {
        let now = Instant::now();
        let mut state = self.state.lock();

        let mut admitted = 0;
        while admitted < budget && state.admit_next(now, limiter) {
            admitted += 1;
        }

        if admitted > 0 {
            debug!(admitted, remaining = state.depth, "Admission tick");
        }
        admitted
    }

    /// Fail every waiting entry and refuse new ones
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;

        let mut failed = 0;
        for (_, queue) in state.clients.drain() {
            for entry in queue {
                let _ = entry.admit.send(Err(AdmissionError::Shutdown));
                failed += 1;
            }
        }
        state.rotation.clear();
        state.depth = 0;

        if failed > 0 {
            warn!(failed, "Admission queue closed with waiting entries");
        }
    }

    pub fn stats(&self) -> AdmissionStats {
        let state = self.state.lock();
        AdmissionStats {
            depth: state.depth,
            waiting_clients: state.clients.len(),
            ..state.stats.clone()
        }
    }

    /// Start the scheduler that drains queued entries against `limiter`
    pub fn start_scheduler(self: &Arc<Self>, limiter: Arc<dyn RateLimiter>) -> BackgroundTask {
        let queue = Arc::clone(self);
        let budget = self.config.budget_per_tick;
        info!(
            budget_per_tick = budget,
            tick_ms = self.config.tick_interval.as_millis() as u64,
            "Starting admission scheduler"
        );
        BackgroundTask::spawn("admission-scheduler", self.config.tick_interval, move || {
            let queue = Arc::clone(&queue);
            let limiter = Arc::clone(&limiter);
            async move {
                queue.tick_limited(limiter.as_ref(), budget);
            }
        })
    }

    fn remove(&self, client_id: &str, id: u64) -> bool {
        self.state.lock().remove(client_id, id).is_some()
    }

    fn count_timeout(&self) {
        self.state.lock().stats.timed_out += 1;
    }

    fn count_cancelled(&self) {
        self.state.lock().stats.cancelled += 1;
    }
}

/// A caller's place in an admission queue
///
/// Dropping the slot before it resolves removes the entry.
pub struct QueueSlot {
    queue: Arc<AdmissionQueue>,
    client_id: String,
    id: u64,
    enqueued_at: Instant,
    deadline: Instant,
    receiver: Option<oneshot::Receiver<Result<(), AdmissionError>>>,
    settled: bool,
}

impl QueueSlot {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }

    /// Wait until admitted, timed out, or the queue shuts down
    ///
    /// Returns how long the entry waited.
    pub async fn wait(mut self) -> Result<Duration, AdmissionError> {
        let Some(mut receiver) = self.receiver.take() else {
            return Err(AdmissionError::Shutdown);
        };

        let result = match tokio::time::timeout_at(self.deadline, &mut receiver).await {
            Ok(Ok(outcome)) => outcome,
            // Sender dropped without an answer: the queue itself is gone
            Ok(Err(_)) => Err(AdmissionError::Shutdown),
            Err(_) => {
                let waited = self.enqueued_at.elapsed();
                if self.queue.remove(&self.client_id, self.id) {
                    self.queue.count_timeout();
                    Err(AdmissionError::QueueTimeout { waited })
                } else {
                    // Resolved by a tick at the same moment
                    receiver
                        .try_recv()
                        .unwrap_or(Err(AdmissionError::QueueTimeout { waited }))
                }
            }
        };
        self.settled = true;

        match &result {
            Ok(()) => record_admission("admitted"),
            Err(AdmissionError::QueueTimeout { .. }) => {
                record_admission("timeout");
                debug!(client_id = %self.client_id, "Admission deadline passed");
            }
            Err(_) => record_admission("shutdown"),
        }

        result.map(|()| self.enqueued_at.elapsed())
    }
}

impl Drop for QueueSlot {
    fn drop(&mut self) {
        if !self.settled && self.queue.remove(&self.client_id, self.id) {
            self.queue.count_cancelled();
            record_admission("cancelled");
            debug!(client_id = %self.client_id, "Queued request cancelled");
        }
    }
}
