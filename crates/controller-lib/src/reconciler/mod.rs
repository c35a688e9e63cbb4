//! Reconciliation of ProfilingConfig resources into live monitors.
//!
//! Each reconcile validates the config, refreshes the set of tracked pods,
//! publishes the observed count to status, and restarts the config's
//! monitor tasks under a fresh shutdown channel. Deletion tears the
//! monitors down via a finalizer.

mod monitors;

pub use monitors::{
    run_on_demand_monitor, run_threshold_monitor, CapturePipeline, MonitorDeps, MonitorSet,
    ProfilePipeline,
};

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::StreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::controller::{Action, Controller};
use kube::runtime::finalizer::{finalizer, Event};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tracing::{debug, info, warn};

use crate::crd::{Condition, ProfilingConfig};
use crate::error::{Error, Result};
use crate::observability::ControllerMetrics;
use crate::registry::pod_key;

/// Finalizer ensuring monitors are stopped before a config disappears.
pub const FINALIZER: &str = "calorimeter.io/teardown";

/// Interval between periodic re-reconciles of a healthy config.
pub const REQUEUE_INTERVAL: Duration = Duration::from_secs(30);

/// Shared state of the reconciler.
pub struct Context {
    pub client: Client,
    pub deps: Arc<MonitorDeps>,
    pub monitors: MonitorSet,
    pub metrics: ControllerMetrics,
}

/// Run the controller until its watch streams end (signal-driven).
pub async fn run(ctx: Arc<Context>) -> anyhow::Result<()> {
    let configs = Api::<ProfilingConfig>::all(ctx.client.clone());

    Controller::new(configs, watcher::Config::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(object) => debug!(?object, "reconciled"),
                Err(error) => warn!(%error, "reconcile failed"),
            }
        })
        .await;

    Ok(())
}

/// Reconcile one ProfilingConfig, routing through the finalizer so
/// deletion triggers teardown.
pub async fn reconcile(config: Arc<ProfilingConfig>, ctx: Arc<Context>) -> Result<Action> {
    let namespace = config.namespace().unwrap_or_default();
    let api: Api<ProfilingConfig> = Api::namespaced(ctx.client.clone(), &namespace);

    finalizer(&api, FINALIZER, config, |event| {
        let ctx = ctx.clone();
        async move {
            match event {
                Event::Apply(config) => apply(config, ctx).await,
                Event::Cleanup(config) => cleanup(config, ctx).await,
            }
        }
    })
    .await
    .map_err(|e| Error::Finalizer(Box::new(e)))
}

pub fn error_policy(_config: Arc<ProfilingConfig>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(%error, "reconcile error");
    Action::requeue(REQUEUE_INTERVAL)
}

/// Bring monitors and status in line with the config's desired state.
async fn apply(config: Arc<ProfilingConfig>, ctx: Arc<Context>) -> Result<Action> {
    let key = config.config_key();

    if let Err(error) = validate(&config) {
        warn!(config = %key, %error, "invalid configuration");
        // A rejected config runs no monitors; status is left untouched.
        ctx.monitors.stop(&key);
        ctx.metrics.set_active_configs(ctx.monitors.len() as i64);
        return Err(error);
    }

    let pods = ctx
        .deps
        .registry
        .list_matching(ctx.client.clone(), &config)
        .await?;
    info!(config = %key, count = pods.len(), "found matching pods");

    for pod in &pods {
        ctx.deps.registry.track(pod, &key).await;
    }
    let live: HashSet<String> = pods.iter().map(pod_key).collect();
    ctx.deps.registry.untrack_absent(&key, &live).await;
    ctx.metrics
        .set_tracked_pods(ctx.deps.registry.count().await as i64);

    update_status(&ctx, &config, pods.len()).await;

    ctx.monitors.start(&config, ctx.deps.clone());
    ctx.metrics.set_active_configs(ctx.monitors.len() as i64);

    Ok(Action::requeue(REQUEUE_INTERVAL))
}

/// Tear down a deleted config's monitors and tracking state.
async fn cleanup(config: Arc<ProfilingConfig>, ctx: Arc<Context>) -> Result<Action> {
    let key = config.config_key();
    info!(config = %key, "profiling config deleted, stopping monitors");

    ctx.monitors.stop(&key);
    ctx.deps.registry.untrack_config(&key).await;
    ctx.metrics.set_active_configs(ctx.monitors.len() as i64);
    ctx.metrics
        .set_tracked_pods(ctx.deps.registry.count().await as i64);

    Ok(Action::await_change())
}

/// Reject configs without a complete S3 destination.
pub fn validate(config: &ProfilingConfig) -> Result<()> {
    if config.spec.s3_config.bucket.is_empty() {
        return Err(Error::MissingBucket);
    }
    if config.spec.s3_config.region.is_empty() {
        return Err(Error::MissingRegion);
    }
    Ok(())
}

/// Patch observed pod count and the Ready condition. Failures are logged
/// and swallowed; the next reconcile retries.
async fn update_status(ctx: &Context, config: &ProfilingConfig, active_pods: usize) {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();
    let api: Api<ProfilingConfig> = Api::namespaced(ctx.client.clone(), &namespace);

    let existing = config.status.clone().unwrap_or_default();
    let condition = ready_condition(
        &existing.conditions,
        true,
        "MonitorsStarted",
        "profiling monitors active",
    );
    let patch = serde_json::json!({
        "status": {
            "activePods": active_pods as i64,
            "conditions": [condition],
        }
    });

    if let Err(error) = api
        .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
        .await
    {
        warn!(config = %config.config_key(), %error, "failed to update status");
    }
}

/// Build the Ready condition, keeping the previous transition timestamp
/// when the status value has not changed.
fn ready_condition(
    existing: &[Condition],
    ready: bool,
    reason: &str,
    message: &str,
) -> Condition {
    let status = if ready { "True" } else { "False" };
    let last_transition_time: DateTime<Utc> = existing
        .iter()
        .find(|condition| condition.r#type == "Ready" && condition.status == status)
        .map(|condition| condition.last_transition_time)
        .unwrap_or_else(Utc::now);

    Condition {
        r#type: "Ready".to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
    }
}
