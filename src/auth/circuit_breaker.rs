//! Circuit breaker for role store reads
//!
//! Authorization misses go to the role store. When the store is slow or
//! failing, the breaker stops sending it traffic so that requests fail fast
//! (and closed) instead of piling up behind timeouts.
//!
//! # States
//!
//! - **Closed**: reads pass through; consecutive failures are counted
//! - **Open**: reads are rejected without touching the store
//! - **HalfOpen**: after `half_open_timeout`, reads are let through again;
//!   `success_threshold` successes close the breaker, any failure reopens it

use serde::Serialize;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Circuit breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "Closed"),
            CircuitState::Open => write!(f, "Open"),
            CircuitState::HalfOpen => write!(f, "HalfOpen"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CircuitBreakerConfig {
    /// Consecutive failures before opening
    pub failure_threshold: u32,
    /// Consecutive half-open successes before closing
    pub success_threshold: u32,
    /// Upper bound on a single guarded call
    pub timeout: Duration,
    /// Time spent open before probing again
    pub half_open_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            timeout: Duration::from_secs(1),
            half_open_timeout: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Error)]
pub enum BreakerError<E> {
    #[error("circuit breaker is open")]
    Open,

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Inner(E),
}

#[derive(Debug, Clone, Serialize)]
pub struct CircuitBreakerStats {
    pub state: CircuitState,
    pub total_operations: u64,
    pub successful_operations: u64,
    pub failed_operations: u64,
    pub rejected_operations: u64,
    pub consecutive_failures: u32,
}

#[derive(Debug)]
struct BreakerState {
    state: CircuitState,
    failure_count: u32,
    success_count: u32,
    opened_at: Option<Instant>,
    total_operations: u64,
    successful_operations: u64,
    failed_operations: u64,
    rejected_operations: u64,
}

impl Default for BreakerState {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            success_count: 0,
            opened_at: None,
            total_operations: 0,
            successful_operations: 0,
            failed_operations: 0,
            rejected_operations: 0,
        }
    }
}

pub struct CircuitBreaker {
    name: &'static str,
    config: CircuitBreakerConfig,
    state: RwLock<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(name: &'static str, config: CircuitBreakerConfig) -> Self {
        debug!(
            breaker = name,
            failure_threshold = config.failure_threshold,
            timeout_ms = config.timeout.as_millis() as u64,
            "Creating circuit breaker"
        );
        Self {
            name,
            config,
            state: RwLock::new(BreakerState::default()),
        }
    }

    /// Run `f` through the breaker
    ///
    /// The state lock is released before `f` is awaited.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        if !self.try_acquire().await {
            debug!(breaker = self.name, "Circuit breaker is open - rejecting call");
            return Err(BreakerError::Open);
        }

        match tokio::time::timeout(self.config.timeout, f()).await {
            Ok(Ok(value)) => {
                self.on_success().await;
                Ok(value)
            }
            Ok(Err(e)) => {
                warn!(breaker = self.name, error = %e, "Guarded operation failed");
                self.on_failure().await;
                Err(BreakerError::Inner(e))
            }
            Err(_) => {
                warn!(
                    breaker = self.name,
                    timeout_ms = self.config.timeout.as_millis() as u64,
                    "Guarded operation timed out"
                );
                self.on_failure().await;
                Err(BreakerError::Timeout(self.config.timeout))
            }
        }
    }

    pub async fn state(&self) -> CircuitState {
        self.state.read().await.state
    }

    pub async fn stats(&self) -> CircuitBreakerStats {
        let state = self.state.read().await;
        CircuitBreakerStats {
            state: state.state,
            total_operations: state.total_operations,
            successful_operations: state.successful_operations,
            failed_operations: state.failed_operations,
            rejected_operations: state.rejected_operations,
            consecutive_failures: state.failure_count,
        }
    }

    async fn try_acquire(&self) -> bool {
        let mut state = self.state.write().await;
        state.total_operations += 1;

        match state.state {
            CircuitState::Closed | CircuitState::HalfOpen => true,
            CircuitState::Open => {
                let ready = state
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.config.half_open_timeout);
                if ready {
                    state.state = CircuitState::HalfOpen;
                    state.success_count = 0;
                    info!(breaker = self.name, "Circuit breaker half-open, probing");
                    true
                } else {
                    state.rejected_operations += 1;
                    false
                }
            }
        }
    }

    async fn on_success(&self) {
        let mut state = self.state.write().await;
        state.successful_operations += 1;

        match state.state {
            CircuitState::Closed => state.failure_count = 0,
            CircuitState::HalfOpen => {
                state.success_count += 1;
                if state.success_count >= self.config.success_threshold {
                    state.state = CircuitState::Closed;
                    state.failure_count = 0;
                    state.opened_at = None;
                    info!(breaker = self.name, "Circuit breaker closed");
                }
            }
            CircuitState::Open => {}
        }
    }

    async fn on_failure(&self) {
        let mut state = self.state.write().await;
        state.failed_operations += 1;

        let open = match state.state {
            CircuitState::Closed => {
                state.failure_count += 1;
                state.failure_count >= self.config.failure_threshold
            }
            CircuitState::HalfOpen => true,
            CircuitState::Open => false,
        };

        if open {
            state.state = CircuitState::Open;
            state.opened_at = Some(Instant::now());
            warn!(
                breaker = self.name,
                failures = state.failure_count,
                "Circuit breaker opened"
            );
        }
    }
}
