//! HTTP surfaces for Kubernetes probes and Prometheus metrics

use std::sync::Arc;

use axum::{extract::State, http::StatusCode, response::IntoResponse, routing::get, Router};
use controller_lib::HealthRegistry;
use prometheus::{Encoder, TextEncoder};
use tracing::info;

/// Shared probe server state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
}

impl AppState {
    pub fn new(health_registry: HealthRegistry) -> Self {
        Self { health_registry }
    }
}

/// Liveness probe - literal "ok" while components are healthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.health_registry.healthy().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "unhealthy")
    }
}

/// Readiness probe - literal "ok" once initialized and healthy
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    if state.health_registry.ready().await {
        (StatusCode::OK, "ok")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "not ready")
    }
}

/// Prometheus metrics endpoint
async fn metrics() -> impl IntoResponse {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    encoder.encode(&metric_families, &mut buffer).unwrap();

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the probe router
pub fn health_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .with_state(state)
}

/// Create the metrics router
pub fn metrics_router() -> Router {
    Router::new().route("/metrics", get(metrics))
}

/// Serve the liveness/readiness probes
pub async fn serve_health(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = health_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting health server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}

/// Serve the Prometheus metrics endpoint
pub async fn serve_metrics(port: u16) -> anyhow::Result<()> {
    let app = metrics_router();

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "starting metrics server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
