//! Prometheus metrics recorder
//!
//! The recorder is installed once per process. Its handle renders the text
//! exposition served by the diagnostics `/metrics` route.

use anyhow::{Result, anyhow};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::{Arc, OnceLock};

/// Settings for the metrics recorder
#[derive(Debug, Clone)]
pub struct MetricsConfig {
    /// Service environment (development, staging, production)
    pub environment: String,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            environment: "development".to_string(),
        }
    }
}

pub struct MetricsManager {
    handle: PrometheusHandle,
    config: MetricsConfig,
}

impl MetricsManager {
    /// Install the global Prometheus recorder
    pub fn install(config: MetricsConfig) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .add_global_label("service", "pcf-gatekeeper")
            .add_global_label("environment", &config.environment)
            .add_global_label("version", env!("CARGO_PKG_VERSION"))
            .install_recorder()
            .map_err(|e| anyhow!("Failed to install Prometheus recorder: {}", e))?;

        tracing::info!(environment = %config.environment, "Prometheus metrics recorder initialized");

        Ok(Self { handle, config })
    }

    /// Prometheus text exposition of every recorded metric
    pub fn render(&self) -> String {
        self.handle.render()
    }

    pub fn config(&self) -> &MetricsConfig {
        &self.config
    }
}

static METRICS_MANAGER: OnceLock<Arc<MetricsManager>> = OnceLock::new();

/// Install the process-wide recorder; fails if one is already installed
pub fn init_metrics(config: MetricsConfig) -> Result<Arc<MetricsManager>> {
    if METRICS_MANAGER.get().is_some() {
        return Err(anyhow!("Metrics manager was already initialized"));
    }
    let manager = Arc::new(MetricsManager::install(config)?);
    METRICS_MANAGER
        .set(manager.clone())
        .map_err(|_| anyhow!("Metrics manager was already initialized"))?;
    Ok(manager)
}

pub fn get_metrics_manager() -> Option<Arc<MetricsManager>> {
    METRICS_MANAGER.get().cloned()
}
