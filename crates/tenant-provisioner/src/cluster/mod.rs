//! Cluster control-plane access.
//!
//! The provisioner only needs create-if-absent, get, and targeted patch
//! semantics, so [`ClusterApi`] exposes exactly those over typed objects.
//! [`KubeCluster`] implements it with `kube`; `testing::FakeCluster` keeps
//! objects in memory.

mod client;
pub mod crds;

use std::fmt::Debug;

use async_trait::async_trait;
use kube::Resource;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

pub use client::KubeCluster;

/// Any typed Kubernetes object the provisioner manages.
pub trait ClusterObject:
    Resource<DynamicType = ()> + Clone + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<K> ClusterObject for K where
    K: Resource<DynamicType = ()>
        + Clone
        + Debug
        + Serialize
        + DeserializeOwned
        + Send
        + Sync
        + 'static
{
}

/// Errors raised by cluster adapters.
#[derive(Debug, Error)]
pub enum ClusterError {
    #[error("cluster API request failed: {0}")]
    Kube(#[from] kube::Error),

    #[error("cluster API unreachable: {0}")]
    Unreachable(String),

    #[error("{kind} {name} not found")]
    NotFound { kind: String, name: String },

    #[error("{kind} {name} already exists")]
    AlreadyExists { kind: String, name: String },

    #[error("conflict applying {kind} {name}: {message}")]
    Conflict {
        kind: String,
        name: String,
        message: String,
    },

    #[error("failed to convert {kind}: {source}")]
    Serialization {
        kind: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("invalid cluster configuration: {0}")]
    Config(String),
}

impl ClusterError {
    /// Whether retrying the same request may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Unreachable(_) => true,
            Self::Kube(kube::Error::Api(response)) => {
                matches!(response.code, 429 | 500 | 502 | 503 | 504)
            }
            Self::Kube(kube::Error::HyperError(_) | kube::Error::Service(_)) => true,
            _ => false,
        }
    }
}

/// Typed access to the cluster API.
///
/// `namespace` is `None` for cluster-scoped kinds.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Fetch an object, `None` if it does not exist.
    async fn get<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, ClusterError>;

    /// Create an object. Fails with [`ClusterError::AlreadyExists`] if present.
    async fn create<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        object: &K,
    ) -> Result<K, ClusterError>;

    /// Apply an RFC 7386 JSON merge patch.
    async fn merge_patch<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError>;

    /// Server-side apply a partial object under `field_manager`.
    ///
    /// List fields declared as maps (such as Gateway listeners, keyed by name)
    /// merge entry-by-entry, so applying one entry never removes others.
    async fn apply_patch<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        field_manager: &str,
        patch: &Value,
    ) -> Result<K, ClusterError>;

    /// API server URL to put in rendered client configurations.
    fn api_endpoint(&self) -> String;
}

/// Result of an idempotent upsert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    /// The object did not exist and was created.
    Created,
    /// The object existed and was reconciled.
    Updated,
    /// The object already matched.
    Unchanged,
}

impl Applied {
    /// Combine the outcomes of several objects managed by one step.
    #[must_use]
    pub fn and(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unchanged, Self::Unchanged) => Self::Unchanged,
            (Self::Created, Self::Created) => Self::Created,
            _ => Self::Updated,
        }
    }

    /// Fold a list of outcomes, `Unchanged` when empty.
    #[must_use]
    pub fn all(outcomes: impl IntoIterator<Item = Self>) -> Self {
        let mut iter = outcomes.into_iter();
        let Some(first) = iter.next() else {
            return Self::Unchanged;
        };
        iter.fold(first, Self::and)
    }
}

/// Create `desired` if absent, otherwise merge-patch it when it has drifted.
///
/// Drift is judged on the fields `desired` sets: extra fields the server or
/// other controllers add to the live object are ignored.
///
/// # Errors
///
/// Returns an error if any cluster call fails.
pub async fn ensure_object<C, K>(
    cluster: &C,
    namespace: Option<&str>,
    desired: &K,
) -> Result<Applied, ClusterError>
where
    C: ClusterApi + ?Sized,
    K: ClusterObject,
{
    let kind = K::kind(&()).to_string();
    let name = desired
        .meta()
        .name
        .clone()
        .ok_or_else(|| ClusterError::Config(format!("{kind} has no name")))?;

    let existing = match cluster.get::<K>(namespace, &name).await? {
        Some(existing) => existing,
        None => match cluster.create(namespace, desired).await {
            Ok(_) => {
                debug!(kind = %kind, name = %name, "Created object");
                return Ok(Applied::Created);
            }
            // Lost a race with another writer: reconcile against theirs.
            Err(ClusterError::AlreadyExists { .. }) => cluster
                .get::<K>(namespace, &name)
                .await?
                .ok_or_else(|| ClusterError::NotFound {
                    kind: kind.clone(),
                    name: name.clone(),
                })?,
            Err(e) => return Err(e),
        },
    };

    let patch = desired_fields(desired, &kind)?;
    let live = to_json(&existing, &kind)?;
    if json_contains(&live, &patch) {
        debug!(kind = %kind, name = %name, "Object already up to date");
        return Ok(Applied::Unchanged);
    }

    cluster.merge_patch::<K>(namespace, &name, &patch).await?;
    debug!(kind = %kind, name = %name, "Reconciled drifted object");
    Ok(Applied::Updated)
}

fn to_json<K: Serialize>(object: &K, kind: &str) -> Result<Value, ClusterError> {
    serde_json::to_value(object).map_err(|source| ClusterError::Serialization {
        kind: kind.to_string(),
        source,
    })
}

/// The part of `desired` that is meaningful as a merge patch: everything but
/// type information, status, and server-owned metadata.
fn desired_fields<K: Serialize>(desired: &K, kind: &str) -> Result<Value, ClusterError> {
    let mut value = to_json(desired, kind)?;
    if let Value::Object(map) = &mut value {
        map.remove("apiVersion");
        map.remove("kind");
        map.remove("status");
        if let Some(Value::Object(meta)) = map.get_mut("metadata") {
            meta.retain(|k, _| k == "labels" || k == "annotations");
            if meta.is_empty() {
                map.remove("metadata");
            }
        }
    }
    Ok(value)
}

/// Whether every field set in `expected` has the same value in `actual`.
///
/// Arrays must match element-wise; objects only need to contain the expected keys.
#[must_use]
pub fn json_contains(actual: &Value, expected: &Value) -> bool {
    match (actual, expected) {
        (Value::Object(actual), Value::Object(expected)) => expected
            .iter()
            .all(|(k, v)| actual.get(k).is_some_and(|a| json_contains(a, v))),
        (Value::Array(actual), Value::Array(expected)) => {
            actual.len() == expected.len()
                && actual
                    .iter()
                    .zip(expected)
                    .all(|(a, e)| json_contains(a, e))
        }
        _ => actual == expected,
    }
}

#[cfg(test)]
mod tests {
    use k8s_openapi::api::core::v1::ConfigMap;
    use kube::api::ObjectMeta;
    use serde_json::json;

    use super::*;
    use crate::testing::FakeCluster;

    fn config_map(value: &str) -> ConfigMap {
        ConfigMap {
            metadata: ObjectMeta {
                name: Some("settings".into()),
                namespace: Some("acme-alpha".into()),
                ..ObjectMeta::default()
            },
            data: Some([("mode".to_string(), value.to_string())].into()),
            ..ConfigMap::default()
        }
    }

    #[test]
    fn test_json_contains_ignores_extra_fields() {
        let actual = json!({"a": 1, "b": {"c": 2, "d": 3}, "list": [{"x": 1, "y": 2}]});
        assert!(json_contains(&actual, &json!({"b": {"c": 2}})));
        assert!(json_contains(&actual, &json!({"list": [{"x": 1}]})));
        assert!(!json_contains(&actual, &json!({"b": {"c": 3}})));
        assert!(!json_contains(&actual, &json!({"list": []})));
        assert!(!json_contains(&actual, &json!({"missing": 1})));
    }

    #[test]
    fn test_applied_combination() {
        assert_eq!(Applied::all([Applied::Created, Applied::Created]), Applied::Created);
        assert_eq!(
            Applied::all([Applied::Unchanged, Applied::Unchanged]),
            Applied::Unchanged
        );
        assert_eq!(Applied::all([Applied::Unchanged, Applied::Created]), Applied::Updated);
        assert_eq!(Applied::all([]), Applied::Unchanged);
    }

    #[tokio::test]
    async fn test_ensure_object_creates_then_noops() {
        let cluster = FakeCluster::new();
        let desired = config_map("strict");

        assert_eq!(
            ensure_object(&cluster, Some("acme-alpha"), &desired).await.unwrap(),
            Applied::Created
        );
        assert_eq!(
            ensure_object(&cluster, Some("acme-alpha"), &desired).await.unwrap(),
            Applied::Unchanged
        );
        assert_eq!(cluster.count::<ConfigMap>(), 1);
    }

    #[tokio::test]
    async fn test_ensure_object_reconciles_drift() {
        let cluster = FakeCluster::new();
        ensure_object(&cluster, Some("acme-alpha"), &config_map("strict"))
            .await
            .unwrap();

        let applied = ensure_object(&cluster, Some("acme-alpha"), &config_map("relaxed"))
            .await
            .unwrap();
        assert_eq!(applied, Applied::Updated);

        let live: ConfigMap = cluster.object(Some("acme-alpha"), "settings").unwrap();
        assert_eq!(live.data.unwrap()["mode"], "relaxed");
    }
}
