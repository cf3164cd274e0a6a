//! `kube`-backed cluster adapter.

use std::path::Path;

use async_trait::async_trait;
use kube::api::{Api, ApiResource, DynamicObject, Patch, PatchParams, PostParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use tracing::debug;

use super::{ClusterApi, ClusterError, ClusterObject};
use crate::retry::{retry_transient, RetryConfig};

/// Cluster adapter talking to a real API server.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    endpoint: String,
    retry: RetryConfig,
}

impl KubeCluster {
    /// Connect using an explicit kubeconfig file, or the inferred
    /// configuration (in-cluster, `$KUBECONFIG`, `~/.kube/config`).
    ///
    /// # Errors
    ///
    /// Returns [`ClusterError::Config`] if no usable configuration is found.
    pub async fn connect(kubeconfig: Option<&Path>, retry: RetryConfig) -> Result<Self, ClusterError> {
        let config = match kubeconfig {
            Some(path) => {
                let raw = Kubeconfig::read_from(path).map_err(|e| {
                    ClusterError::Config(format!("cannot read {}: {e}", path.display()))
                })?;
                Config::from_custom_kubeconfig(raw, &KubeConfigOptions::default())
                    .await
                    .map_err(|e| ClusterError::Config(e.to_string()))?
            }
            None => Config::infer()
                .await
                .map_err(|e| ClusterError::Config(e.to_string()))?,
        };

        let endpoint = config.cluster_url.to_string();
        let client = Client::try_from(config)?;
        debug!(endpoint = %endpoint, "Connected to cluster API");

        Ok(Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            retry,
        })
    }

    fn api<K: ClusterObject>(&self, namespace: Option<&str>) -> Api<DynamicObject> {
        let resource = ApiResource::erase::<K>(&());
        match namespace {
            Some(namespace) => Api::namespaced_with(self.client.clone(), namespace, &resource),
            None => Api::all_with(self.client.clone(), &resource),
        }
    }
}

fn kind_of<K: ClusterObject>() -> String {
    K::kind(&()).to_string()
}

fn convert<T: Serialize, U: DeserializeOwned>(value: &T, kind: &str) -> Result<U, ClusterError> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(|source| ClusterError::Serialization {
            kind: kind.to_string(),
            source,
        })
}

fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

#[async_trait]
impl ClusterApi for KubeCluster {
    async fn get<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
    ) -> Result<Option<K>, ClusterError> {
        let kind = kind_of::<K>();
        let api = self.api::<K>(namespace);
        let found = retry_transient(&self.retry, "cluster get", ClusterError::is_transient, || async {
            api.get_opt(name).await.map_err(ClusterError::from)
        })
        .await?;

        found.map(|object| convert(&object, &kind)).transpose()
    }

    async fn create<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        object: &K,
    ) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let name = object.meta().name.clone().unwrap_or_default();
        let dynamic: DynamicObject = convert(object, &kind)?;
        let api = self.api::<K>(namespace);

        let created = retry_transient(&self.retry, "cluster create", ClusterError::is_transient, || async {
            api.create(&PostParams::default(), &dynamic)
                .await
                .map_err(|e| {
                    if is_status(&e, 409) {
                        ClusterError::AlreadyExists {
                            kind: kind.clone(),
                            name: name.clone(),
                        }
                    } else {
                        ClusterError::from(e)
                    }
                })
        })
        .await?;

        convert(&created, &kind)
    }

    async fn merge_patch<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let api = self.api::<K>(namespace);

        let patched = retry_transient(&self.retry, "cluster merge patch", ClusterError::is_transient, || async {
            api.patch(name, &PatchParams::default(), &Patch::Merge(patch))
                .await
                .map_err(|e| {
                    if is_status(&e, 404) {
                        ClusterError::NotFound {
                            kind: kind.clone(),
                            name: name.to_string(),
                        }
                    } else {
                        ClusterError::from(e)
                    }
                })
        })
        .await?;

        convert(&patched, &kind)
    }

    async fn apply_patch<K: ClusterObject>(
        &self,
        namespace: Option<&str>,
        name: &str,
        field_manager: &str,
        patch: &Value,
    ) -> Result<K, ClusterError> {
        let kind = kind_of::<K>();
        let api = self.api::<K>(namespace);
        let params = PatchParams::apply(field_manager);

        let applied = retry_transient(&self.retry, "cluster apply", ClusterError::is_transient, || async {
            api.patch(name, &params, &Patch::Apply(patch))
                .await
                .map_err(|e| match e {
                    kube::Error::Api(response) if response.code == 409 => ClusterError::Conflict {
                        kind: kind.clone(),
                        name: name.to_string(),
                        message: response.message,
                    },
                    other => ClusterError::from(other),
                })
        })
        .await?;

        convert(&applied, &kind)
    }

    fn api_endpoint(&self) -> String {
        self.endpoint.clone()
    }
}
