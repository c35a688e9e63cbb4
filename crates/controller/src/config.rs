//! Controller configuration

use anyhow::Result;
use serde::Deserialize;

/// Controller configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ControllerConfig {
    /// Port for the liveness/readiness probe server
    #[serde(default = "default_health_port")]
    pub health_port: u16,

    /// Port for the Prometheus metrics server
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

fn default_health_port() -> u16 {
    8081
}

fn default_metrics_port() -> u16 {
    8080
}

impl ControllerConfig {
    /// Load configuration from the environment
    pub fn load() -> Result<Self> {
        let config = config::Config::builder()
            .add_source(config::Environment::with_prefix("CALORIMETER"))
            .build()?;

        Ok(config.try_deserialize().unwrap_or_else(|_| ControllerConfig {
            health_port: default_health_port(),
            metrics_port: default_metrics_port(),
        }))
    }
}
