//! Core library for the calorimeter profiling controller.
//!
//! This crate provides:
//! - The ProfilingConfig custom resource types
//! - Tracking of pods selected for profiling
//! - Live utilization sampling against the metrics API
//! - pprof profile acquisition over pod port-forwards
//! - Profile publishing to S3-compatible object storage
//! - The reconciler and its per-config monitor tasks
//! - Health checks and Prometheus metrics

pub mod crd;
pub mod error;
pub mod health;
pub mod observability;
pub mod profiler;
pub mod reconciler;
pub mod registry;
pub mod sampling;
pub mod uploader;

pub use crd::{ProfilingConfig, ProfilingConfigSpec, ProfilingConfigStatus};
pub use error::{Error, Result};
pub use health::{components, HealthRegistry};
pub use observability::ControllerMetrics;
