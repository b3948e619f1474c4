use anyhow::Result;
use axum::{
    Json, Router,
    extract::State,
    http::{StatusCode, header},
    middleware,
    response::{IntoResponse, Response},
    routing::get,
};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::auth::CircuitState;
use crate::components::Gatekeeper;
use crate::config::AppConfig;
use crate::middleware::metrics_middleware;
use crate::observability::MetricsManager;

/// Shared state of the diagnostics endpoints
#[derive(Clone)]
pub struct DiagnosticsState {
    gatekeeper: Arc<Gatekeeper>,
    metrics: Option<Arc<MetricsManager>>,
    ready: Arc<AtomicBool>,
}

impl DiagnosticsState {
    pub fn new(gatekeeper: Arc<Gatekeeper>, metrics: Option<Arc<MetricsManager>>) -> Self {
        Self {
            gatekeeper,
            metrics,
            ready: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn mark_ready(&self) {
        self.ready.store(true, Ordering::SeqCst);
    }

    pub fn mark_not_ready(&self) {
        self.ready.store(false, Ordering::SeqCst);
    }
}

/// Start the diagnostics HTTP server and run until a shutdown signal
///
/// Background tasks are started once the listener is bound and stopped
/// after the server drains, bounded by the configured shutdown timeout.
pub async fn start_server(
    config: AppConfig,
    gatekeeper: Arc<Gatekeeper>,
    metrics: Option<Arc<MetricsManager>>,
) -> Result<()> {
    let bind_addr = format!("{}:{}", config.server.bind, config.server.port);
    info!("Attempting to bind to {}", bind_addr);

    let listener = TcpListener::bind(&bind_addr).await.map_err(|e| {
        anyhow::anyhow!(
            "Failed to bind to {}: {}. Is another process using this port?",
            bind_addr,
            e
        )
    })?;
    info!("Server successfully bound to {}", bind_addr);

    let state = DiagnosticsState::new(Arc::clone(&gatekeeper), metrics);
    let app = create_router(state.clone());

    gatekeeper.start();
    state.mark_ready();

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.mark_not_ready();
    let timeout = Duration::from_secs(config.server.shutdown_timeout);
    if tokio::time::timeout(timeout, gatekeeper.shutdown()).await.is_err() {
        warn!(timeout_secs = config.server.shutdown_timeout, "Background tasks did not stop in time");
    }

    info!("Server shutdown complete");
    Ok(())
}

/// Liveness, readiness, statistics and Prometheus exposition
pub fn create_router(state: DiagnosticsState) -> Router {
    Router::new()
        .route("/metrics", get(metrics_handler))
        .route("/health", get(liveness_handler))
        .route("/health/liveness", get(liveness_handler))
        .route("/health/readiness", get(readiness_handler))
        .route("/stats", get(stats_handler))
        .with_state(state)
        .layer(middleware::from_fn(metrics_middleware))
        .layer(TraceLayer::new_for_http())
}

async fn liveness_handler() -> &'static str {
    "OK"
}

/// Ready once started, and only while role lookups can succeed
async fn readiness_handler(State(state): State<DiagnosticsState>) -> Response {
    let ready = state.ready.load(Ordering::SeqCst);
    let breaker = state.gatekeeper.authorization().breaker().state().await;
    let healthy = ready && breaker != CircuitState::Open;

    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    let body = json!({
        "status": if healthy { "ready" } else { "not_ready" },
        "started": ready,
        "role_store_breaker": breaker,
    });
    (status, Json(body)).into_response()
}

async fn stats_handler(State(state): State<DiagnosticsState>) -> Response {
    Json(state.gatekeeper.stats().await).into_response()
}

async fn metrics_handler(State(state): State<DiagnosticsState>) -> Response {
    match &state.metrics {
        Some(metrics) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            metrics.render(),
        )
            .into_response(),
        None => (StatusCode::NOT_FOUND, "metrics disabled").into_response(),
    }
}

/// Wait for SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), starting graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        }
    }
}
