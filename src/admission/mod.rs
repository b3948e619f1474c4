//! Admission control
//!
//! Requests over the rate budget are queued instead of rejected. Each client
//! gets a bounded FIFO queue; a scheduler drains the queues round-robin,
//! one entry per client per round, whenever budget is replenished.

use std::time::Duration;
use thiserror::Error;

pub mod controller;
pub mod limiter;
pub mod queue;

pub use controller::*;
pub use limiter::*;
pub use queue::*;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdmissionError {
    #[error("admission queue for client {client_id} is full ({capacity} pending)")]
    QueueFull { client_id: String, capacity: usize },

    #[error("request waited {waited:?} in the admission queue without being admitted")]
    QueueTimeout { waited: Duration },

    #[error("admission queue is shut down")]
    Shutdown,
}

impl AdmissionError {
    pub fn code(&self) -> &'static str {
        match self {
            AdmissionError::QueueFull { .. } => "QUEUE_FULL",
            AdmissionError::QueueTimeout { .. } => "QUEUE_TIMEOUT",
            AdmissionError::Shutdown => "SHUTTING_DOWN",
        }
    }
}
