//! Observability: structured logging and Prometheus metrics

pub mod logging;
pub mod metrics;
pub mod recorder;

pub use logging::{init_logging, redact_ip};
pub use recorder::{MetricsConfig, MetricsManager, get_metrics_manager, init_metrics};
