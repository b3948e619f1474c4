use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use uuid::Uuid;

pub mod audit;
pub mod cache;
pub mod circuit_breaker;
pub mod errors;
pub mod evaluator;
pub mod invalidation;
pub mod ip;
pub mod permissions;
pub mod service;
pub mod store;

pub use audit::*;
pub use cache::*;
pub use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig, CircuitState};
pub use errors::*;
pub use evaluator::*;
pub use invalidation::*;
pub use ip::*;
pub use permissions::*;
pub use service::*;
pub use store::*;

/// Already-resolved caller identity
///
/// Produced by the authentication layer in front of this crate and attached
/// to the request as an extension. The caller IP is trusted as given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub user_id: String,
    pub caller_ip: IpAddr,
    pub trace_id: String,
}

impl CallerIdentity {
    pub fn new(user_id: impl Into<String>, caller_ip: IpAddr) -> Self {
        Self {
            user_id: user_id.into(),
            caller_ip,
            trace_id: Uuid::new_v4().to_string(),
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = trace_id.into();
        self
    }

    /// Key used for per-client admission queues
    pub fn client_id(&self) -> &str {
        &self.user_id
    }
}
