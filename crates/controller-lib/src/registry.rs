//! Tracking of pods selected for profiling.
//!
//! The registry pairs each matching pod with the ProfilingConfig that
//! selected it and remembers when it was last profiled, so the threshold
//! monitor can enforce cooldowns. All state is memory-resident; a restart
//! resets cooldowns.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::{Api, ListParams};
use kube::{Client, ResourceExt};
use tokio::sync::RwLock;
use tracing::debug;

use crate::crd::{ProfilingConfig, PROFILING_ENABLED_ANNOTATION};
use crate::error::Result;

/// A pod being monitored for profiling, owned by one ProfilingConfig.
#[derive(Debug, Clone)]
pub struct TrackedPod {
    pub pod: Pod,
    pub config_key: String,
}

#[derive(Default)]
struct RegistryInner {
    tracked: HashMap<String, Arc<TrackedPod>>,
    last_profiled: HashMap<String, DateTime<Utc>>,
}

/// Registry of pods selected for profiling.
///
/// Clones share the same underlying state. Mutations and snapshots go
/// through a single lock; snapshots clone the `Arc` entries so no lock is
/// held while callers iterate.
#[derive(Clone, Default)]
pub struct PodRegistry {
    inner: Arc<RwLock<RegistryInner>>,
}

/// `namespace/name` key identifying a pod.
pub fn pod_key(pod: &Pod) -> String {
    format!("{}/{}", pod.namespace().unwrap_or_default(), pod.name_any())
}

/// True iff the pod is Running and carries the profiling opt-in annotation.
pub fn is_profileable(pod: &Pod) -> bool {
    let running = pod
        .status
        .as_ref()
        .and_then(|status| status.phase.as_deref())
        == Some("Running");
    running && profiling_enabled(pod)
}

fn profiling_enabled(pod: &Pod) -> bool {
    pod.annotations()
        .get(PROFILING_ENABLED_ANNOTATION)
        .map(String::as_str)
        == Some("true")
}

impl PodRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// List pods matching the config's selector that are profileable.
    ///
    /// The label selector is applied in the list call; phase and opt-in
    /// filtering happen client-side. Result order is not guaranteed.
    pub async fn list_matching(
        &self,
        client: Client,
        config: &ProfilingConfig,
    ) -> Result<Vec<Pod>> {
        let namespace = config.target_namespace();

        let mut params = ListParams::default();
        if !config.spec.selector.label_selector.is_empty() {
            let selector = config
                .spec
                .selector
                .label_selector
                .iter()
                .map(|(key, value)| format!("{key}={value}"))
                .collect::<Vec<_>>()
                .join(",");
            params = params.labels(&selector);
        }

        let pods = Api::<Pod>::namespaced(client, &namespace).list(&params).await?;
        Ok(pods.items.into_iter().filter(is_profileable).collect())
    }

    /// Start tracking a pod for a config, replacing any prior entry for the
    /// same pod key.
    pub async fn track(&self, pod: &Pod, config_key: &str) {
        let key = pod_key(pod);
        debug!(pod = %key, config = %config_key, "tracking pod");

        let mut inner = self.inner.write().await;
        inner.tracked.insert(
            key,
            Arc::new(TrackedPod {
                pod: pod.clone(),
                config_key: config_key.to_string(),
            }),
        );
    }

    /// Stop tracking a pod. No-op if it was not tracked.
    pub async fn untrack(&self, pod: &Pod) {
        let key = pod_key(pod);
        let mut inner = self.inner.write().await;
        inner.tracked.remove(&key);
        inner.last_profiled.remove(&key);
    }

    /// Drop entries owned by `config_key` whose pod key is not in `live`.
    pub async fn untrack_absent(&self, config_key: &str, live: &HashSet<String>) {
        let mut inner = self.inner.write().await;
        let stale: Vec<String> = inner
            .tracked
            .iter()
            .filter(|(key, tracked)| tracked.config_key == config_key && !live.contains(key.as_str()))
            .map(|(key, _)| key.clone())
            .collect();
        for key in stale {
            debug!(pod = %key, config = %config_key, "untracking pod absent from listing");
            inner.tracked.remove(&key);
            inner.last_profiled.remove(&key);
        }
    }

    /// Drop all entries owned by a deleted config.
    pub async fn untrack_config(&self, config_key: &str) {
        let mut inner = self.inner.write().await;
        let owned: Vec<String> = inner
            .tracked
            .iter()
            .filter(|(_, tracked)| tracked.config_key == config_key)
            .map(|(key, _)| key.clone())
            .collect();
        for key in owned {
            inner.tracked.remove(&key);
            inner.last_profiled.remove(&key);
        }
    }

    /// Snapshot of all tracked pods. The underlying pods may have since
    /// disappeared from the cluster.
    pub async fn tracked(&self) -> Vec<Arc<TrackedPod>> {
        let inner = self.inner.read().await;
        inner.tracked.values().cloned().collect()
    }

    /// True iff the pod has never been profiled or its cooldown has elapsed.
    pub async fn can_profile(&self, pod: &Pod, cooldown: Duration) -> bool {
        let key = pod_key(pod);
        let inner = self.inner.read().await;
        match inner.last_profiled.get(&key) {
            None => true,
            Some(last) => {
                let elapsed = Utc::now().signed_duration_since(*last);
                elapsed.num_milliseconds() > cooldown.as_millis() as i64
            }
        }
    }

    /// Record a successful threshold-driven capture at the current wall time.
    pub async fn mark_profiled(&self, pod: &Pod) {
        let key = pod_key(pod);
        let mut inner = self.inner.write().await;
        inner.last_profiled.insert(key, Utc::now());
    }

    /// Number of tracked pods.
    pub async fn count(&self) -> usize {
        self.inner.read().await.tracked.len()
    }
}
