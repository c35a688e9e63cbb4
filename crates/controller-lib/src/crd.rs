//! The ProfilingConfig custom resource.
//!
//! A ProfilingConfig declares which pods to profile, the utilization
//! thresholds and schedules that trigger captures, and the S3 destination
//! profiles are published to.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Annotation that opts a pod into profiling when set to `"true"`.
pub const PROFILING_ENABLED_ANNOTATION: &str = "calorimeter.io/enabled";

/// Annotation that overrides the pprof port on a pod.
pub const PPROF_PORT_ANNOTATION: &str = "calorimeter.io/port";

/// Profile types captured when the spec lists none.
pub const DEFAULT_PROFILE_TYPES: &[&str] = &["heap", "cpu", "goroutine", "mutex"];

/// Desired state of a ProfilingConfig.
#[derive(CustomResource, Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "calorimeter.io",
    version = "v1alpha1",
    kind = "ProfilingConfig",
    plural = "profilingconfigs",
    status = "ProfilingConfigStatus",
    shortname = "pc",
    namespaced,
    printcolumn = r#"{"name":"Active Pods","type":"integer","jsonPath":".status.activePods"}"#,
    printcolumn = r#"{"name":"Total Profiles","type":"integer","jsonPath":".status.totalProfiles"}"#,
    printcolumn = r#"{"name":"Total Uploads","type":"integer","jsonPath":".status.totalUploads"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
pub struct ProfilingConfigSpec {
    /// Selector for target pods.
    #[serde(default)]
    pub selector: PodSelector,

    /// Thresholds that trigger opportunistic captures.
    #[serde(default)]
    pub thresholds: ThresholdConfig,

    /// Periodic unconditional capture, orthogonal to thresholds.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_demand: Option<OnDemandConfig>,

    /// Where captured profiles are uploaded.
    #[serde(default)]
    pub s3_config: S3Configuration,

    /// Profile types to capture, in order. Empty means heap, cpu,
    /// goroutine, mutex.
    #[serde(default)]
    pub profile_types: Vec<String>,
}

/// How target pods are selected.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct PodSelector {
    /// Namespace to watch for pods. Defaults to the ProfilingConfig's own
    /// namespace when empty.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,

    /// Label requirements; every pair must match. Empty matches all pods.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub label_selector: BTreeMap<String, String>,
}

/// Resource thresholds for triggering profiling.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ThresholdConfig {
    /// CPU usage as percent of aggregate request (0-100).
    #[serde(default = "default_cpu_threshold")]
    #[schemars(range(min = 0, max = 100))]
    pub cpu_threshold_percent: u32,

    /// Memory usage as percent of aggregate request (0-100).
    #[serde(default = "default_memory_threshold")]
    #[schemars(range(min = 0, max = 100))]
    pub memory_threshold_percent: u32,

    /// How often tracked pods are sampled, in seconds.
    #[serde(default = "default_check_interval")]
    #[schemars(range(min = 10))]
    pub check_interval_seconds: u64,

    /// Minimum seconds between threshold-driven captures of one pod.
    #[serde(default = "default_cooldown")]
    #[schemars(range(min = 60))]
    pub cooldown_seconds: u64,
}

impl Default for ThresholdConfig {
    fn default() -> Self {
        Self {
            cpu_threshold_percent: default_cpu_threshold(),
            memory_threshold_percent: default_memory_threshold(),
            check_interval_seconds: default_check_interval(),
            cooldown_seconds: default_cooldown(),
        }
    }
}

/// On-demand continuous profiling settings.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct OnDemandConfig {
    /// Whether on-demand profiling is enabled.
    pub enabled: bool,

    /// Capture interval in seconds.
    #[serde(default = "default_on_demand_interval")]
    #[schemars(range(min = 30, max = 60))]
    pub interval_seconds: u64,
}

/// S3 upload destination.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct S3Configuration {
    /// Bucket name.
    #[serde(default)]
    pub bucket: String,

    /// Key prefix for uploaded profiles.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub prefix: String,

    /// AWS region.
    #[serde(default)]
    pub region: String,

    /// Custom endpoint for S3-compatible services.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
}

/// Observed state of a ProfilingConfig.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct ProfilingConfigStatus {
    /// Number of pods currently being monitored.
    #[serde(default)]
    pub active_pods: i32,

    /// Timestamp of the last profile capture.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_profile_time: Option<DateTime<Utc>>,

    /// Total number of capture-and-publish cycles completed.
    #[serde(default)]
    pub total_profiles: i64,

    /// Total number of cycles whose uploads all succeeded.
    #[serde(default)]
    pub total_uploads: i64,

    /// Latest observations of the ProfilingConfig's state.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

/// A single condition record on the status.
#[derive(Serialize, Deserialize, Debug, Clone, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Condition type, e.g. `Ready`.
    pub r#type: String,
    /// `True` or `False`.
    pub status: String,
    /// Machine-readable reason for the last transition.
    pub reason: String,
    /// Human-readable detail.
    pub message: String,
    /// When the condition last changed status.
    pub last_transition_time: DateTime<Utc>,
}

impl ProfilingConfig {
    /// Namespace pods are listed in: the selector's namespace, or the
    /// ProfilingConfig's own namespace when unset.
    pub fn target_namespace(&self) -> String {
        if self.spec.selector.namespace.is_empty() {
            self.namespace().unwrap_or_default()
        } else {
            self.spec.selector.namespace.clone()
        }
    }

    /// Profile types to capture, falling back to the defaults.
    pub fn effective_profile_types(&self) -> Vec<String> {
        if self.spec.profile_types.is_empty() {
            DEFAULT_PROFILE_TYPES.iter().map(|t| t.to_string()).collect()
        } else {
            self.spec.profile_types.clone()
        }
    }

    /// `namespace/name` key identifying this config.
    pub fn config_key(&self) -> String {
        format!("{}/{}", self.namespace().unwrap_or_default(), self.name_any())
    }
}

fn default_cpu_threshold() -> u32 {
    80
}

fn default_memory_threshold() -> u32 {
    90
}

fn default_check_interval() -> u64 {
    30
}

fn default_cooldown() -> u64 {
    300
}

fn default_on_demand_interval() -> u64 {
    35
}
