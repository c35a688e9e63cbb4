//! pprof profile acquisition from target pods.
//!
//! Captures tunnel through the pod `portforward` subresource: a local
//! listener on an OS-chosen port bridges TCP connections onto forwarded
//! streams, and profiles are fetched over plain HTTP against that local
//! port. The tunnel is torn down when the capture ends, on success or
//! failure.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Pod;
use kube::api::Api;
use kube::{Client, ResourceExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::debug;

use crate::crd::PPROF_PORT_ANNOTATION;
use crate::error::{Error, Result};

/// Default pprof port when a pod carries no port annotation.
pub const DEFAULT_PPROF_PORT: u16 = 6060;

/// How long to wait for the port-forward to become usable.
const PORT_FORWARD_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-request deadline. CPU profiling alone blocks for 30 seconds on the
/// target.
const PROFILE_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// A captured profile.
#[derive(Debug, Clone)]
pub struct Profile {
    pub profile_type: String,
    pub data: Vec<u8>,
    pub timestamp: DateTime<Utc>,
}

/// Source of captured profiles.
#[async_trait]
pub trait ProfileCapturer: Send + Sync {
    /// Capture the given profile types from a pod, preserving order.
    /// Any single failure aborts the whole capture.
    async fn capture(&self, pod: &Pod, profile_types: &[String]) -> Result<Vec<Profile>>;
}

/// Capturer that port-forwards to the pod's pprof endpoint.
///
/// Stateless; concurrent captures against distinct pods are safe.
#[derive(Clone)]
pub struct PprofCapturer {
    client: Client,
}

impl PprofCapturer {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ProfileCapturer for PprofCapturer {
    async fn capture(&self, pod: &Pod, profile_types: &[String]) -> Result<Vec<Profile>> {
        let port = pprof_port(pod);
        let tunnel = PortForwardTunnel::open(self.client.clone(), pod, port).await?;

        let http = reqwest::Client::builder()
            .timeout(PROFILE_REQUEST_TIMEOUT)
            .build()?;
        let base = format!("http://127.0.0.1:{}", tunnel.local_port());

        let mut profiles = Vec::with_capacity(profile_types.len());
        for profile_type in profile_types {
            profiles.push(fetch_profile(&http, &base, profile_type).await?);
        }
        Ok(profiles)
        // tunnel drops here, closing the forward on every exit path
    }
}

/// Fetch one profile over an established tunnel.
async fn fetch_profile(
    http: &reqwest::Client,
    base_url: &str,
    profile_type: &str,
) -> Result<Profile> {
    let url = format!("{}{}", base_url, profile_endpoint(profile_type));
    debug!(%url, "fetching profile");

    let response = http.get(&url).send().await?;
    if !response.status().is_success() {
        return Err(Error::UnexpectedStatus(response.status().as_u16()));
    }
    let data = response.bytes().await?.to_vec();

    Ok(Profile {
        profile_type: profile_type.to_string(),
        data,
        timestamp: Utc::now(),
    })
}

/// pprof endpoint path for a profile type. Unknown types pass through as
/// `/debug/pprof/<type>`; the remote server's response governs.
pub fn profile_endpoint(profile_type: &str) -> String {
    match profile_type {
        "heap" => "/debug/pprof/heap".to_string(),
        "cpu" => "/debug/pprof/profile?seconds=30".to_string(),
        "goroutine" => "/debug/pprof/goroutine".to_string(),
        "mutex" => "/debug/pprof/mutex".to_string(),
        "block" => "/debug/pprof/block".to_string(),
        "thread-create" | "threadcreate" => "/debug/pprof/threadcreate".to_string(),
        other => format!("/debug/pprof/{other}"),
    }
}

/// pprof port from the pod's annotation, or the default. Annotations that
/// do not parse into 1..=65535 fall back to the default.
pub fn pprof_port(pod: &Pod) -> u16 {
    let Some(value) = pod.annotations().get(PPROF_PORT_ANNOTATION) else {
        return DEFAULT_PPROF_PORT;
    };
    match value.parse::<i64>() {
        Ok(port) if (1..=65535).contains(&port) => port as u16,
        _ => DEFAULT_PPROF_PORT,
    }
}

/// A live tunnel from a local TCP port to one pod port.
///
/// Each accepted local connection gets its own forwarded stream. Dropping
/// the tunnel stops the listener and ends all forwarding.
struct PortForwardTunnel {
    local_port: u16,
    accept_task: tokio::task::JoinHandle<()>,
}

impl PortForwardTunnel {
    async fn open(client: Client, pod: &Pod, remote_port: u16) -> Result<Self> {
        let namespace = pod.namespace().unwrap_or_default();
        let name = pod.name_any();
        let pods: Api<Pod> = Api::namespaced(client, &namespace);

        // Establish one forward up front so an unreachable target fails
        // within the readiness timeout instead of on the first request.
        let probe = tokio::time::timeout(
            PORT_FORWARD_READY_TIMEOUT,
            pods.portforward(&name, &[remote_port]),
        )
        .await
        .map_err(|_| Error::PortForward("timeout waiting for port forward".to_string()))??;
        drop(probe);

        let listener = TcpListener::bind(("127.0.0.1", 0))
            .await
            .map_err(|e| Error::PortForward(e.to_string()))?;
        let local_port = listener
            .local_addr()
            .map_err(|e| Error::PortForward(e.to_string()))?
            .port();

        let accept_task = tokio::spawn(async move {
            loop {
                let (connection, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => break,
                };
                let pods = pods.clone();
                let name = name.clone();
                let _forward = tokio::spawn(async move {
                    if let Err(error) =
                        forward_connection(&pods, &name, remote_port, connection).await
                    {
                        debug!(pod = %name, %error, "port forward connection closed");
                    }
                });
            }
        });

        Ok(Self {
            local_port,
            accept_task,
        })
    }

    fn local_port(&self) -> u16 {
        self.local_port
    }
}

impl Drop for PortForwardTunnel {
    fn drop(&mut self) {
        self.accept_task.abort();
    }
}

async fn forward_connection(
    pods: &Api<Pod>,
    name: &str,
    port: u16,
    mut connection: TcpStream,
) -> anyhow::Result<()> {
    let mut forwarder = pods.portforward(name, &[port]).await?;
    let mut upstream = forwarder
        .take_stream(port)
        .ok_or_else(|| anyhow::anyhow!("no stream for forwarded port {port}"))?;
    tokio::io::copy_bidirectional(&mut connection, &mut upstream).await?;
    drop(upstream);
    forwarder.join().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use std::collections::BTreeMap;

    fn pod_with_port_annotation(value: Option<&str>) -> Pod {
        let mut annotations = BTreeMap::new();
        if let Some(value) = value {
            annotations.insert(PPROF_PORT_ANNOTATION.to_string(), value.to_string());
        }
        Pod {
            metadata: ObjectMeta {
                name: Some("test-pod".to_string()),
                namespace: Some("default".to_string()),
                annotations: Some(annotations),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    #[test]
    fn test_profile_endpoint_mapping() {
        assert_eq!(profile_endpoint("heap"), "/debug/pprof/heap");
        assert_eq!(profile_endpoint("cpu"), "/debug/pprof/profile?seconds=30");
        assert_eq!(profile_endpoint("goroutine"), "/debug/pprof/goroutine");
        assert_eq!(profile_endpoint("mutex"), "/debug/pprof/mutex");
        assert_eq!(profile_endpoint("block"), "/debug/pprof/block");
        assert_eq!(profile_endpoint("thread-create"), "/debug/pprof/threadcreate");
        assert_eq!(profile_endpoint("threadcreate"), "/debug/pprof/threadcreate");
    }

    #[test]
    fn test_profile_endpoint_passthrough() {
        assert_eq!(profile_endpoint("allocs"), "/debug/pprof/allocs");
    }

    #[test]
    fn test_pprof_port_default() {
        assert_eq!(pprof_port(&pod_with_port_annotation(None)), DEFAULT_PPROF_PORT);
    }

    #[test]
    fn test_pprof_port_from_annotation() {
        assert_eq!(pprof_port(&pod_with_port_annotation(Some("8080"))), 8080);
    }

    #[test]
    fn test_pprof_port_invalid_falls_back() {
        assert_eq!(
            pprof_port(&pod_with_port_annotation(Some("not-a-port"))),
            DEFAULT_PPROF_PORT
        );
        assert_eq!(pprof_port(&pod_with_port_annotation(Some("0"))), DEFAULT_PPROF_PORT);
        assert_eq!(pprof_port(&pod_with_port_annotation(Some("-1"))), DEFAULT_PPROF_PORT);
        assert_eq!(
            pprof_port(&pod_with_port_annotation(Some("70000"))),
            DEFAULT_PPROF_PORT
        );
    }

    #[tokio::test]
    async fn test_fetch_profile_success() {
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/debug/pprof/heap",
            get(|| async { vec![0x1f, 0x8b, 0x08, 0x00] }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = reqwest::Client::new();
        let profile = fetch_profile(&http, &base, "heap").await.unwrap();

        assert_eq!(profile.profile_type, "heap");
        assert_eq!(profile.data, vec![0x1f, 0x8b, 0x08, 0x00]);
    }

    #[tokio::test]
    async fn test_fetch_profile_non_success_status() {
        use axum::http::StatusCode;
        use axum::routing::get;

        let app = axum::Router::new().route(
            "/debug/pprof/mutex",
            get(|| async { StatusCode::NOT_FOUND }),
        );
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let base = format!("http://{}", listener.local_addr().unwrap());
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        let http = reqwest::Client::new();
        let err = fetch_profile(&http, &base, "mutex").await.unwrap_err();
        assert_eq!(err.to_string(), "unexpected status code: 404");
    }
}
