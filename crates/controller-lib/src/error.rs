//! Error types for the profiling controller.

use thiserror::Error;

/// Errors that can occur while reconciling and profiling.
#[derive(Debug, Error)]
pub enum Error {
    /// ProfilingConfig has no S3 bucket.
    #[error("s3 bucket is required")]
    MissingBucket,

    /// ProfilingConfig has no S3 region.
    #[error("s3 region is required")]
    MissingRegion,

    /// Kubernetes API call failed.
    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    /// Port-forward could not be established or broke down.
    #[error("failed to setup port forward: {0}")]
    PortForward(String),

    /// pprof HTTP request failed at the transport level.
    #[error("pprof request failed: {0}")]
    Pprof(#[from] reqwest::Error),

    /// pprof endpoint answered with a non-success status.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(u16),

    /// Upload to the object store failed.
    #[error("failed to upload to s3: {0}")]
    Upload(String),

    /// Finalizer machinery failed around reconcile.
    #[error("finalizer error: {0}")]
    Finalizer(#[source] Box<kube::runtime::finalizer::Error<Error>>),
}

/// Result type for controller operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
