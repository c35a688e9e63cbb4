//! Publishing captured profiles to S3-compatible object storage.
//!
//! Keys follow `prefix/YYYY-MM-DD/service-name/YYYYMMDD-HHMMSS-type.pprof`
//! so profiles are queryable by day and logical service. Credentials come
//! from the ambient environment (IRSA / instance role / static keys).

use std::collections::HashMap;

use aws_config::Region;
use aws_sdk_s3::primitives::ByteStream;
use k8s_openapi::api::core::v1::Pod;
use kube::ResourceExt;
use tracing::debug;

use crate::crd::S3Configuration;
use crate::error::{Error, Result};
use crate::profiler::Profile;

/// Why a profile was captured; recorded in object metadata.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadReason {
    ThresholdExceeded,
    OnDemand,
}

impl UploadReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            UploadReason::ThresholdExceeded => "threshold-exceeded",
            UploadReason::OnDemand => "on-demand",
        }
    }
}

/// An object-store write target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Destination {
    pub bucket: String,
    pub prefix: String,
    pub region: String,
    pub endpoint: Option<String>,
}

impl From<&S3Configuration> for S3Destination {
    fn from(config: &S3Configuration) -> Self {
        Self {
            bucket: config.bucket.clone(),
            prefix: config.prefix.clone(),
            region: config.region.clone(),
            endpoint: config.endpoint.clone().filter(|e| !e.is_empty()),
        }
    }
}

/// Uploads profiles to one destination.
pub struct S3Uploader {
    client: aws_sdk_s3::Client,
    bucket: String,
    prefix: String,
}

impl S3Uploader {
    /// Build an authenticated client for a destination. A custom endpoint
    /// switches to path-style addressing for S3-compatible stores.
    pub async fn new(destination: &S3Destination) -> Result<Self> {
        let base = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(Region::new(destination.region.clone()))
            .load()
            .await;

        let client = match &destination.endpoint {
            Some(endpoint) => {
                let config = aws_sdk_s3::config::Builder::from(&base)
                    .endpoint_url(endpoint)
                    .force_path_style(true)
                    .build();
                aws_sdk_s3::Client::from_conf(config)
            }
            None => aws_sdk_s3::Client::new(&base),
        };

        Ok(Self {
            client,
            bucket: destination.bucket.clone(),
            prefix: destination.prefix.clone(),
        })
    }

    /// Upload a single profile.
    pub async fn upload_profile(
        &self,
        pod: &Pod,
        profile: &Profile,
        reason: UploadReason,
    ) -> Result<()> {
        let key = object_key(&self.prefix, pod, profile);
        let metadata = object_metadata(pod, profile, reason);
        debug!(bucket = %self.bucket, %key, "uploading profile");

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&key)
            .body(ByteStream::from(profile.data.clone()))
            .content_type("application/octet-stream")
            .set_metadata(Some(metadata))
            .send()
            .await
            .map_err(|e| Error::Upload(e.to_string()))?;

        Ok(())
    }

    /// Upload a batch sequentially, aborting on the first failure.
    pub async fn upload_profiles(
        &self,
        pod: &Pod,
        profiles: &[Profile],
        reason: UploadReason,
    ) -> Result<()> {
        for profile in profiles {
            self.upload_profile(pod, profile, reason).await?;
        }
        Ok(())
    }
}

/// Object key for a profile. Empty segments (no prefix) are collapsed.
pub fn object_key(prefix: &str, pod: &Pod, profile: &Profile) -> String {
    let date = profile.timestamp.format("%Y-%m-%d").to_string();
    let service = service_name(pod);
    let filename = format!(
        "{}-{}.pprof",
        profile.timestamp.format("%Y%m%d-%H%M%S"),
        profile.profile_type
    );

    [prefix, &date, &service, &filename]
        .iter()
        .filter(|segment| !segment.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}

/// Object metadata attached to each uploaded profile.
pub fn object_metadata(
    pod: &Pod,
    profile: &Profile,
    reason: UploadReason,
) -> HashMap<String, String> {
    let mut metadata = HashMap::from([
        ("pod-name".to_string(), pod.name_any()),
        ("pod-namespace".to_string(), pod.namespace().unwrap_or_default()),
        ("profile-type".to_string(), profile.profile_type.clone()),
        ("reason".to_string(), reason.as_str().to_string()),
        (
            "timestamp".to_string(),
            profile
                .timestamp
                .to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
        ),
    ]);

    for (key, value) in pod.labels() {
        metadata.insert(format!("pod-label-{key}"), value.clone());
    }

    metadata
}

/// Derive the logical service name a pod belongs to.
///
/// Tried in order: the `app.kubernetes.io/name`, `app`, and `k8s-app`
/// labels, the first owner reference (ReplicaSet hash suffix stripped),
/// then the pod name with its last two dash segments stripped.
pub fn service_name(pod: &Pod) -> String {
    for key in ["app.kubernetes.io/name", "app", "k8s-app"] {
        if let Some(value) = pod.labels().get(key) {
            if !value.is_empty() {
                return value.clone();
            }
        }
    }

    if let Some(owner) = pod.owner_references().first() {
        if owner.kind == "ReplicaSet" {
            if let Some((stem, _)) = owner.name.rsplit_once('-') {
                if !stem.is_empty() {
                    return stem.to_string();
                }
            }
        }
        return owner.name.clone();
    }

    let name = pod.name_any();
    let mut segments = name.rsplitn(3, '-');
    let _ = segments.next();
    let _ = segments.next();
    match segments.next() {
        Some(stem) if !stem.is_empty() => stem.to_string(),
        _ => name,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
    use std::collections::BTreeMap;

    fn pod(name: &str, labels: &[(&str, &str)], owner: Option<(&str, &str)>) -> Pod {
        Pod {
            metadata: ObjectMeta {
                name: Some(name.to_string()),
                namespace: Some("default".to_string()),
                labels: Some(
                    labels
                        .iter()
                        .map(|(k, v)| (k.to_string(), v.to_string()))
                        .collect::<BTreeMap<_, _>>(),
                ),
                owner_references: owner.map(|(kind, owner_name)| {
                    vec![OwnerReference {
                        kind: kind.to_string(),
                        name: owner_name.to_string(),
                        ..Default::default()
                    }]
                }),
                ..Default::default()
            },
            ..Default::default()
        }
    }

    fn profile_at(profile_type: &str, timestamp: chrono::DateTime<chrono::Utc>) -> Profile {
        Profile {
            profile_type: profile_type.to_string(),
            data: vec![1, 2, 3],
            timestamp,
        }
    }

    #[test]
    fn test_service_name_prefers_recommended_label() {
        let pod = pod(
            "web-app-7d8f9c5b6d-xyz456",
            &[("app.kubernetes.io/name", "my-service"), ("app", "other")],
            Some(("ReplicaSet", "web-app-7d8f9c5b6d")),
        );
        assert_eq!(service_name(&pod), "my-service");
    }

    #[test]
    fn test_service_name_app_label() {
        let pod = pod(
            "web-app-7d8f9c5b6d-xyz456",
            &[("app", "other")],
            Some(("ReplicaSet", "web-app-7d8f9c5b6d")),
        );
        assert_eq!(service_name(&pod), "other");
    }

    #[test]
    fn test_service_name_k8s_app_label() {
        let pod = pod("some-pod-abc-def", &[("k8s-app", "auth-service")], None);
        assert_eq!(service_name(&pod), "auth-service");
    }

    #[test]
    fn test_service_name_replicaset_owner_strips_hash() {
        let pod = pod(
            "web-app-7d8f9c5b6d-xyz456",
            &[],
            Some(("ReplicaSet", "web-app-7d8f9c5b6d")),
        );
        assert_eq!(service_name(&pod), "web-app");
    }

    #[test]
    fn test_service_name_statefulset_owner_unchanged() {
        let pod = pod("database-0", &[], Some(("StatefulSet", "database")));
        assert_eq!(service_name(&pod), "database");
    }

    #[test]
    fn test_service_name_pod_name_fallback() {
        let pod = pod("web-app-7d8f9c5b6d-xyz456", &[], None);
        assert_eq!(service_name(&pod), "web-app");
    }

    #[test]
    fn test_service_name_short_pod_name_unchanged() {
        let pod = pod("database-0", &[], None);
        assert_eq!(service_name(&pod), "database-0");
    }

    #[test]
    fn test_service_name_is_deterministic() {
        let pod = pod(
            "web-app-7d8f9c5b6d-xyz456",
            &[("app", "payments")],
            Some(("ReplicaSet", "web-app-7d8f9c5b6d")),
        );
        assert_eq!(service_name(&pod), service_name(&pod));
    }

    #[test]
    fn test_object_key_format() {
        let pod = pod("api-6f7b8-x1", &[("app", "api")], None);
        let timestamp = chrono::Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap();
        let profile = profile_at("heap", timestamp);

        assert_eq!(
            object_key("profiles", &pod, &profile),
            "profiles/2024-03-15/api/20240315-103045-heap.pprof"
        );
    }

    #[test]
    fn test_object_key_empty_prefix_collapsed() {
        let pod = pod("api-6f7b8-x1", &[("app", "api")], None);
        let timestamp = chrono::Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap();
        let profile = profile_at("cpu", timestamp);

        assert_eq!(
            object_key("", &pod, &profile),
            "2024-03-15/api/20240315-103045-cpu.pprof"
        );
    }

    #[test]
    fn test_object_keys_distinct_across_timestamps() {
        let pod = pod("api-6f7b8-x1", &[("app", "api")], None);
        let first = profile_at(
            "heap",
            chrono::Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap(),
        );
        let second = profile_at(
            "heap",
            chrono::Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 46).unwrap(),
        );
        assert_ne!(object_key("p", &pod, &first), object_key("p", &pod, &second));
    }

    #[test]
    fn test_object_metadata_contents() {
        let pod = pod("api-6f7b8-x1", &[("app", "api"), ("tier", "backend")], None);
        let timestamp = chrono::Utc.with_ymd_and_hms(2024, 3, 15, 10, 30, 45).unwrap();
        let profile = profile_at("goroutine", timestamp);

        let metadata = object_metadata(&pod, &profile, UploadReason::ThresholdExceeded);

        assert_eq!(metadata["pod-name"], "api-6f7b8-x1");
        assert_eq!(metadata["pod-namespace"], "default");
        assert_eq!(metadata["profile-type"], "goroutine");
        assert_eq!(metadata["reason"], "threshold-exceeded");
        assert_eq!(metadata["timestamp"], "2024-03-15T10:30:45Z");
        assert_eq!(metadata["pod-label-app"], "api");
        assert_eq!(metadata["pod-label-tier"], "backend");
    }

    #[test]
    fn test_metadata_key_date_matches_timestamp() {
        let pod = pod("api-6f7b8-x1", &[("app", "api")], None);
        let timestamp = chrono::Utc.with_ymd_and_hms(2024, 12, 31, 23, 59, 59).unwrap();
        let profile = profile_at("heap", timestamp);

        let key = object_key("profiles", &pod, &profile);
        let metadata = object_metadata(&pod, &profile, UploadReason::OnDemand);

        assert!(key.contains("/2024-12-31/"));
        assert!(metadata["timestamp"].starts_with("2024-12-31"));
        assert_eq!(metadata["reason"], "on-demand");
    }

    #[test]
    fn test_destination_from_config_drops_empty_endpoint() {
        let config = S3Configuration {
            bucket: "profiles".to_string(),
            prefix: "pprof".to_string(),
            region: "us-west-2".to_string(),
            endpoint: Some(String::new()),
        };
        let destination = S3Destination::from(&config);
        assert_eq!(destination.endpoint, None);
    }
}
