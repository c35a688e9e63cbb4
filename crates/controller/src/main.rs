//! calorimeter controller - continuous pprof profiling for Kubernetes
//! workloads.
//!
//! Watches ProfilingConfig resources, monitors matching pods, and uploads
//! captured profiles to S3-compatible object storage.

use std::sync::Arc;

use anyhow::Result;
use controller_lib::{
    components,
    profiler::PprofCapturer,
    reconciler::{self, Context, MonitorDeps, MonitorSet, ProfilePipeline},
    registry::PodRegistry,
    sampling::MetricsApiSampler,
    ControllerMetrics, HealthRegistry,
};
use kube::Client;
use tracing::info;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

mod api;
mod config;

const CONTROLLER_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    info!(version = CONTROLLER_VERSION, "starting calorimeter controller");

    // Load configuration
    let config = config::ControllerConfig::load()?;

    // Connect to the cluster; failure here is fatal and exits non-zero
    let client = Client::try_default().await?;

    // Initialize health registry and metrics
    let health_registry = HealthRegistry::new();
    health_registry.register(components::RECONCILER).await;
    health_registry.register(components::API).await;
    let metrics = ControllerMetrics::new();

    // Wire the reconciler's dependencies
    let deps = Arc::new(MonitorDeps {
        registry: PodRegistry::new(),
        sampler: Arc::new(MetricsApiSampler::new(client.clone())),
        pipeline: Arc::new(ProfilePipeline::new(
            client.clone(),
            Arc::new(PprofCapturer::new(client.clone())),
            metrics.clone(),
        )),
    });
    let ctx = Arc::new(Context {
        client,
        deps,
        monitors: MonitorSet::new(),
        metrics,
    });

    // Serve probes and metrics on their own ports
    let state = Arc::new(api::AppState::new(health_registry.clone()));
    let _health_server = tokio::spawn(api::serve_health(config.health_port, state));
    let _metrics_server = tokio::spawn(api::serve_metrics(config.metrics_port));

    health_registry.set_ready(true).await;

    // Run until the watch streams wind down on SIGINT/SIGTERM
    reconciler::run(ctx).await?;

    info!("shutting down");
    Ok(())
}
