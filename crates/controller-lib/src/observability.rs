//! Prometheus metrics for the profiling controller.

use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Histogram, IntCounter, IntCounterVec, IntGauge,
};
use std::sync::OnceLock;

/// Histogram buckets for capture durations (seconds). CPU profiles block
/// for 30 seconds, so the range reaches well past that.
const CAPTURE_DURATION_BUCKETS: &[f64] = &[0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0];

/// Global metrics instance (registered once).
static GLOBAL_METRICS: OnceLock<ControllerMetricsInner> = OnceLock::new();

struct ControllerMetricsInner {
    profiles_captured: IntCounterVec,
    profile_uploads: IntCounter,
    capture_errors: IntCounter,
    capture_duration_seconds: Histogram,
    active_configs: IntGauge,
    tracked_pods: IntGauge,
}

impl ControllerMetricsInner {
    fn new() -> Self {
        Self {
            profiles_captured: register_int_counter_vec!(
                "calorimeter_profiles_captured_total",
                "Capture-and-publish cycles completed, by reason",
                &["reason"]
            )
            .expect("Failed to register profiles_captured_total"),

            profile_uploads: register_int_counter!(
                "calorimeter_profile_uploads_total",
                "Individual profile objects uploaded to the object store"
            )
            .expect("Failed to register profile_uploads_total"),

            capture_errors: register_int_counter!(
                "calorimeter_capture_errors_total",
                "Capture-and-publish cycles that failed"
            )
            .expect("Failed to register capture_errors_total"),

            capture_duration_seconds: register_histogram!(
                "calorimeter_capture_duration_seconds",
                "Time spent acquiring profiles from a pod",
                CAPTURE_DURATION_BUCKETS.to_vec()
            )
            .expect("Failed to register capture_duration_seconds"),

            active_configs: register_int_gauge!(
                "calorimeter_active_configs",
                "ProfilingConfigs with running monitors"
            )
            .expect("Failed to register active_configs"),

            tracked_pods: register_int_gauge!(
                "calorimeter_tracked_pods",
                "Pods currently tracked for profiling"
            )
            .expect("Failed to register tracked_pods"),
        }
    }
}

/// Lightweight handle to the global controller metrics.
///
/// Clones share the same underlying metrics.
#[derive(Clone)]
pub struct ControllerMetrics {
    _private: (),
}

impl Default for ControllerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ControllerMetrics {
    pub fn new() -> Self {
        GLOBAL_METRICS.get_or_init(ControllerMetricsInner::new);
        Self { _private: () }
    }

    fn inner(&self) -> &ControllerMetricsInner {
        GLOBAL_METRICS.get().expect("Metrics not initialized")
    }

    pub fn inc_profiles_captured(&self, reason: &str) {
        self.inner()
            .profiles_captured
            .with_label_values(&[reason])
            .inc();
    }

    pub fn add_profile_uploads(&self, count: u64) {
        self.inner().profile_uploads.inc_by(count);
    }

    pub fn inc_capture_errors(&self) {
        self.inner().capture_errors.inc();
    }

    pub fn observe_capture_duration(&self, duration_secs: f64) {
        self.inner().capture_duration_seconds.observe(duration_secs);
    }

    pub fn set_active_configs(&self, count: i64) {
        self.inner().active_configs.set(count);
    }

    pub fn set_tracked_pods(&self, count: i64) {
        self.inner().tracked_pods.set(count);
    }
}
