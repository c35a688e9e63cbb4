//! Live pod utilization sampling via the metrics API.
//!
//! Usage is fetched per container from `metrics.k8s.io`, summed across the
//! pod, and expressed as percent of the aggregate resource requests from
//! the pod spec.

mod quantity;

pub use quantity::{cpu_millicores, memory_bytes};

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Pod;
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::Api;
use kube::{Client, ResourceExt};
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Per-container usage reported by the metrics API.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ContainerUsage {
    pub cpu: Quantity,
    pub memory: Quantity,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ContainerMetrics {
    pub name: String,
    pub usage: ContainerUsage,
}

/// The `metrics.k8s.io/v1beta1` PodMetrics resource.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct PodMetrics {
    pub metadata: ObjectMeta,
    pub timestamp: String,
    pub window: String,
    pub containers: Vec<ContainerMetrics>,
}

impl k8s_openapi::Resource for PodMetrics {
    type Scope = k8s_openapi::NamespaceResourceScope;

    const API_VERSION: &'static str = "metrics.k8s.io/v1beta1";
    const GROUP: &'static str = "metrics.k8s.io";
    const KIND: &'static str = "PodMetrics";
    const VERSION: &'static str = "v1beta1";
    const URL_PATH_SEGMENT: &'static str = "pods";
}

impl k8s_openapi::Metadata for PodMetrics {
    type Ty = ObjectMeta;

    fn metadata(&self) -> &Self::Ty {
        &self.metadata
    }

    fn metadata_mut(&mut self) -> &mut Self::Ty {
        &mut self.metadata
    }
}

/// Aggregated utilization of one pod, as percent of its requests.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PodUtilization {
    pub cpu_percent: f64,
    pub memory_percent: f64,
}

impl PodUtilization {
    /// Returns the reason a threshold is exceeded, or `None`.
    ///
    /// Comparison is strict; a value exactly at the threshold does not
    /// trigger. CPU is evaluated first, so it is the cited reason when
    /// both resources exceed.
    pub fn exceeded(&self, cpu_threshold: u32, memory_threshold: u32) -> Option<String> {
        if self.cpu_percent > cpu_threshold as f64 {
            return Some(format!(
                "CPU usage {:.2}% exceeds threshold {}%",
                self.cpu_percent, cpu_threshold
            ));
        }
        if self.memory_percent > memory_threshold as f64 {
            return Some(format!(
                "Memory usage {:.2}% exceeds threshold {}%",
                self.memory_percent, memory_threshold
            ));
        }
        None
    }
}

/// Source of live pod utilization.
#[async_trait]
pub trait UtilizationSampler: Send + Sync {
    /// Sample current utilization for a pod. Failure is transient; the
    /// caller logs and skips the tick.
    async fn sample(&self, pod: &Pod) -> Result<PodUtilization>;
}

/// Sampler backed by the cluster metrics API.
#[derive(Clone)]
pub struct MetricsApiSampler {
    client: Client,
}

impl MetricsApiSampler {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl UtilizationSampler for MetricsApiSampler {
    async fn sample(&self, pod: &Pod) -> Result<PodUtilization> {
        let namespace = pod.namespace().unwrap_or_default();
        let metrics = Api::<PodMetrics>::namespaced(self.client.clone(), &namespace)
            .get(&pod.name_any())
            .await?;
        Ok(compute_utilization(pod, &metrics))
    }
}

/// Compute percent-of-request utilization from raw usage and the pod spec.
///
/// Usage is summed across all reported containers; requests are summed
/// across all spec containers. A zero aggregate request yields zero
/// percent for that resource.
pub fn compute_utilization(pod: &Pod, metrics: &PodMetrics) -> PodUtilization {
    let mut usage_cpu = 0i64;
    let mut usage_memory = 0i64;
    for container in &metrics.containers {
        usage_cpu += cpu_millicores(&container.usage.cpu);
        usage_memory += memory_bytes(&container.usage.memory);
    }

    let mut request_cpu = 0i64;
    let mut request_memory = 0i64;
    if let Some(spec) = &pod.spec {
        for container in &spec.containers {
            let requests = container
                .resources
                .as_ref()
                .and_then(|resources| resources.requests.as_ref());
            if let Some(requests) = requests {
                if let Some(cpu) = requests.get("cpu") {
                    request_cpu += cpu_millicores(cpu);
                }
                if let Some(memory) = requests.get("memory") {
                    request_memory += memory_bytes(memory);
                }
            }
        }
    }

    let cpu_percent = if request_cpu > 0 {
        usage_cpu as f64 / request_cpu as f64 * 100.0
    } else {
        0.0
    };
    let memory_percent = if request_memory > 0 {
        usage_memory as f64 / request_memory as f64 * 100.0
    } else {
        0.0
    };

    PodUtilization {
        cpu_percent,
        memory_percent,
    }
}
