//! Per-config monitor tasks.
//!
//! Every active ProfilingConfig owns two long-lived tasks: a threshold
//! monitor that samples utilization and captures when thresholds are
//! exceeded, and (when enabled) an on-demand monitor that captures every
//! tracked pod unconditionally. Both select against a shared shutdown
//! channel, so teardown cancels an in-flight tick at its next await.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, ResourceExt};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{info, warn};

use crate::crd::ProfilingConfig;
use crate::error::Result;
use crate::observability::ControllerMetrics;
use crate::profiler::ProfileCapturer;
use crate::registry::{pod_key, PodRegistry};
use crate::sampling::UtilizationSampler;
use crate::uploader::{S3Destination, S3Uploader, UploadReason};

/// Shared dependencies of the monitor tasks.
pub struct MonitorDeps {
    pub registry: PodRegistry,
    pub sampler: Arc<dyn UtilizationSampler>,
    pub pipeline: Arc<dyn CapturePipeline>,
}

/// The capture-and-publish sequence both monitors funnel into.
#[async_trait]
pub trait CapturePipeline: Send + Sync {
    /// Acquire the config's profile types from a pod and publish them.
    /// Success implies every profile was uploaded and status counters were
    /// advanced; any failure leaves cooldown and counters untouched.
    async fn capture_and_publish(
        &self,
        pod: &Pod,
        config: &ProfilingConfig,
        reason: UploadReason,
    ) -> Result<()>;
}

/// Live pipeline: pprof capture, per-capture S3 uploader, status update.
pub struct ProfilePipeline {
    client: Client,
    capturer: Arc<dyn ProfileCapturer>,
    metrics: ControllerMetrics,
}

impl ProfilePipeline {
    pub fn new(
        client: Client,
        capturer: Arc<dyn ProfileCapturer>,
        metrics: ControllerMetrics,
    ) -> Self {
        Self {
            client,
            capturer,
            metrics,
        }
    }

    /// Re-fetch the config and bump its capture statistics. Failures are
    /// logged and swallowed; the profile data is already durable.
    async fn record_stats(&self, config: &ProfilingConfig) {
        let namespace = config.namespace().unwrap_or_default();
        let name = config.name_any();
        let api: Api<ProfilingConfig> = Api::namespaced(self.client.clone(), &namespace);

        let latest = match api.get(&name).await {
            Ok(latest) => latest,
            // Config deleted mid-capture; the reconciler handles cleanup.
            Err(_) => return,
        };
        let status = latest.status.unwrap_or_default();

        let patch = serde_json::json!({
            "status": {
                "lastProfileTime": Utc::now(),
                "totalProfiles": status.total_profiles + 1,
                "totalUploads": status.total_uploads + 1,
            }
        });
        if let Err(error) = api
            .patch_status(&name, &PatchParams::default(), &Patch::Merge(&patch))
            .await
        {
            warn!(config = %config.config_key(), %error, "failed to update profile stats");
        }
    }
}

#[async_trait]
impl CapturePipeline for ProfilePipeline {
    async fn capture_and_publish(
        &self,
        pod: &Pod,
        config: &ProfilingConfig,
        reason: UploadReason,
    ) -> Result<()> {
        let profile_types = config.effective_profile_types();

        let started = std::time::Instant::now();
        let profiles = match self.capturer.capture(pod, &profile_types).await {
            Ok(profiles) => profiles,
            Err(error) => {
                self.metrics.inc_capture_errors();
                return Err(error);
            }
        };
        self.metrics
            .observe_capture_duration(started.elapsed().as_secs_f64());

        let uploader = S3Uploader::new(&S3Destination::from(&config.spec.s3_config)).await?;
        if let Err(error) = uploader.upload_profiles(pod, &profiles, reason).await {
            self.metrics.inc_capture_errors();
            return Err(error);
        }

        self.metrics.inc_profiles_captured(reason.as_str());
        self.metrics.add_profile_uploads(profiles.len() as u64);
        self.record_stats(config).await;
        Ok(())
    }
}

/// Running monitors, keyed by config `namespace/name`.
///
/// Reconciles are serialized per key by the controller runtime, so entries
/// are only ever replaced from one reconcile at a time; the map itself is
/// shared across configs.
#[derive(Clone, Default)]
pub struct MonitorSet {
    channels: Arc<DashMap<String, broadcast::Sender<()>>>,
}

impl MonitorSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Stop any monitors for the key. No-op when none are running.
    pub fn stop(&self, key: &str) {
        if let Some((_, shutdown)) = self.channels.remove(key) {
            let _ = shutdown.send(());
        }
    }

    /// Start fresh monitors for a config, replacing any existing ones.
    pub fn start(&self, config: &ProfilingConfig, deps: Arc<MonitorDeps>) {
        let key = config.config_key();
        self.stop(&key);

        let (shutdown, _) = broadcast::channel(1);
        let _threshold = tokio::spawn(run_threshold_monitor(
            config.clone(),
            deps.clone(),
            shutdown.subscribe(),
        ));
        if let Some(on_demand) = &config.spec.on_demand {
            if on_demand.enabled {
                let _on_demand = tokio::spawn(run_on_demand_monitor(
                    config.clone(),
                    on_demand.interval_seconds,
                    deps,
                    shutdown.subscribe(),
                ));
            }
        }
        self.channels.insert(key, shutdown);
    }

    pub fn contains(&self, key: &str) -> bool {
        self.channels.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.channels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }
}

/// Periodically sample tracked pods and capture when thresholds are
/// exceeded.
pub async fn run_threshold_monitor(
    config: ProfilingConfig,
    deps: Arc<MonitorDeps>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let key = config.config_key();
    let period = Duration::from_secs(config.spec.thresholds.check_interval_seconds);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(config = %key, period_secs = period.as_secs(), "starting threshold monitor");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(config = %key, "stopping threshold monitor");
                break;
            }
            _ = async {
                ticker.tick().await;
                threshold_tick(&config, &deps).await;
            } => {}
        }
    }
}

async fn threshold_tick(config: &ProfilingConfig, deps: &MonitorDeps) {
    let thresholds = &config.spec.thresholds;
    let cooldown = Duration::from_secs(thresholds.cooldown_seconds);

    for tracked in deps.registry.tracked().await {
        if !deps.registry.can_profile(&tracked.pod, cooldown).await {
            continue;
        }

        let utilization = match deps.sampler.sample(&tracked.pod).await {
            Ok(utilization) => utilization,
            Err(error) => {
                warn!(pod = %pod_key(&tracked.pod), %error, "failed to get pod metrics");
                continue;
            }
        };

        let Some(reason) = utilization.exceeded(
            thresholds.cpu_threshold_percent,
            thresholds.memory_threshold_percent,
        ) else {
            continue;
        };

        info!(pod = %pod_key(&tracked.pod), %reason, "threshold exceeded, capturing profile");
        match deps
            .pipeline
            .capture_and_publish(&tracked.pod, config, UploadReason::ThresholdExceeded)
            .await
        {
            Ok(()) => deps.registry.mark_profiled(&tracked.pod).await,
            Err(error) => {
                warn!(pod = %pod_key(&tracked.pod), %error, "failed to capture and upload profile");
            }
        }
    }
}

/// Periodically capture every tracked pod, ignoring cooldown and
/// utilization.
pub async fn run_on_demand_monitor(
    config: ProfilingConfig,
    interval_seconds: u64,
    deps: Arc<MonitorDeps>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let key = config.config_key();
    let period = Duration::from_secs(interval_seconds);
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

    info!(config = %key, period_secs = period.as_secs(), "starting on-demand monitor");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                info!(config = %key, "stopping on-demand monitor");
                break;
            }
            _ = async {
                ticker.tick().await;
                on_demand_tick(&config, &deps).await;
            } => {}
        }
    }
}

async fn on_demand_tick(config: &ProfilingConfig, deps: &MonitorDeps) {
    for tracked in deps.registry.tracked().await {
        info!(pod = %pod_key(&tracked.pod), "on-demand profiling");
        if let Err(error) = deps
            .pipeline
            .capture_and_publish(&tracked.pod, config, UploadReason::OnDemand)
            .await
        {
            warn!(pod = %pod_key(&tracked.pod), %error, "failed to capture on-demand profile");
        }
    }
}
