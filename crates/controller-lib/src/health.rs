//! Liveness and readiness state behind the controller's probe endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::warn;

/// Health of a single component.
#[derive(Debug, Clone)]
pub struct ComponentHealth {
    pub healthy: bool,
    pub message: Option<String>,
    pub last_transition: i64,
}

impl ComponentHealth {
    fn healthy() -> Self {
        Self {
            healthy: true,
            message: None,
            last_transition: chrono::Utc::now().timestamp(),
        }
    }

    fn unhealthy(message: impl Into<String>) -> Self {
        Self {
            healthy: false,
            message: Some(message.into()),
            last_transition: chrono::Utc::now().timestamp(),
        }
    }
}

/// Component names for health tracking.
pub mod components {
    pub const RECONCILER: &str = "reconciler";
    pub const API: &str = "api";
}

/// Tracks per-component health and overall readiness.
///
/// Clones share the same state.
#[derive(Debug, Clone, Default)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a component as initially healthy.
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn set_healthy(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        let message = message.into();
        warn!(component = %name, %message, "component unhealthy");
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::unhealthy(message));
    }

    /// Mark the process ready to serve.
    pub async fn set_ready(&self, ready: bool) {
        *self.ready.write().await = ready;
    }

    /// True iff every registered component is healthy.
    pub async fn healthy(&self) -> bool {
        self.components
            .read()
            .await
            .values()
            .all(|component| component.healthy)
    }

    /// True iff the process is initialized and every component is healthy.
    pub async fn ready(&self) -> bool {
        *self.ready.read().await && self.healthy().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_empty_registry_is_healthy() {
        let registry = HealthRegistry::new();
        assert!(registry.healthy().await);
    }

    #[tokio::test]
    async fn test_not_ready_until_set() {
        let registry = HealthRegistry::new();
        assert!(!registry.ready().await);

        registry.set_ready(true).await;
        assert!(registry.ready().await);
    }

    #[tokio::test]
    async fn test_unhealthy_component_blocks_readiness() {
        let registry = HealthRegistry::new();
        registry.register(components::RECONCILER).await;
        registry.set_ready(true).await;

        registry
            .set_unhealthy(components::RECONCILER, "watch stream failed")
            .await;
        assert!(!registry.healthy().await);
        assert!(!registry.ready().await);

        registry.set_healthy(components::RECONCILER).await;
        assert!(registry.ready().await);
    }
}
