//! Authorization and admission gatekeeper for the PCF image service
//!
//! - [`auth`]: role evaluation, permission cache and its invalidation
//! - [`admission`]: per-client queues that hold requests until they are admitted
//! - [`pipeline`]: read-path deduplication and response caching
//! - [`middleware`]: axum layers wiring the above into a router
//! - [`components`]: the [`Gatekeeper`] bundle built from configuration

pub mod admission;
pub mod auth;
pub mod clock;
pub mod components;
pub mod config;
pub mod error;
pub mod middleware;
pub mod observability;
pub mod pipeline;
pub mod server;
pub mod tasks;

pub use components::{Gatekeeper, GatekeeperStats};
pub use config::{AppConfig, Cli, load_config};
pub use error::AppError;

use anyhow::Result;
use std::panic;
use std::sync::Arc;

use crate::observability::{MetricsConfig, init_logging, init_metrics};

/// Load configuration, initialize observability and serve until shutdown
pub async fn run_server(cli: Cli) -> Result<()> {
    let app_config = load_config(&cli)?;

    init_logging(&app_config.logging)?;

    panic::set_hook(Box::new(|panic_info| {
        tracing::error!(?panic_info, "FATAL: Panic occurred");
        std::process::exit(1);
    }));

    tracing::info!(
        environment = %app_config.environment,
        version = env!("CARGO_PKG_VERSION"),
        "PCF gatekeeper starting up"
    );

    let metrics = if app_config.metrics.enabled {
        Some(init_metrics(MetricsConfig {
            environment: app_config.environment.to_string(),
        })?)
    } else {
        None
    };

    let gatekeeper = Arc::new(Gatekeeper::new(&app_config));
    server::start_server(app_config, gatekeeper, metrics).await
}
