//! CI/CD service identities: a namespace-scoped deployer account and the
//! kubeconfig pipelines use to act as it.

use k8s_openapi::api::core::v1::{Secret, ServiceAccount};
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use kube::api::ObjectMeta;
use tracing::{debug, info};

use crate::cluster::{ensure_object, Applied, ClusterApi};
use crate::config::IdentityConfig;
use crate::error::ProvisionError;
use crate::kubeconfig::{self, KubeconfigParams};
use crate::namespace::managed_labels;
use crate::retry::{poll_until, Clock, PollOutcome};
use crate::store::{Artifact, CredentialStore};
use crate::tenant::TenantEnvironment;

pub const SERVICE_ACCOUNT: &str = "ci-deployer";
pub const TOKEN_SECRET: &str = "ci-deployer-token";

const TOKEN_SECRET_TYPE: &str = "kubernetes.io/service-account-token";
const SERVICE_ACCOUNT_ANNOTATION: &str = "kubernetes.io/service-account.name";

const DEPLOYER_VERBS: [&str; 7] = ["get", "list", "watch", "create", "update", "patch", "delete"];

/// (API group, resources) the deployer may manage.
const DEPLOYER_RESOURCES: [(&str, &[&str]); 5] = [
    (
        "",
        &[
            "pods",
            "pods/log",
            "services",
            "configmaps",
            "secrets",
            "persistentvolumeclaims",
        ],
    ),
    ("apps", &["deployments", "statefulsets", "replicasets"]),
    ("batch", &["jobs", "cronjobs"]),
    ("networking.k8s.io", &["ingresses"]),
    ("gateway.networking.k8s.io", &["httproutes"]),
];

/// A provisioned deployer identity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceIdentity {
    pub namespace: String,
    pub service_account: String,
    /// Where the rendered kubeconfig is stored.
    pub kubeconfig: Artifact,
    pub applied: Applied,
}

fn meta(name: &str, target: &TenantEnvironment) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(target.namespace()),
        labels: Some(managed_labels(target)),
        ..ObjectMeta::default()
    }
}

fn deployer_role(target: &TenantEnvironment) -> Role {
    let rules = DEPLOYER_RESOURCES
        .iter()
        .map(|(group, resources)| PolicyRule {
            api_groups: Some(vec![(*group).to_string()]),
            resources: Some(resources.iter().map(|r| (*r).to_string()).collect()),
            verbs: DEPLOYER_VERBS.iter().map(|v| (*v).to_string()).collect(),
            ..PolicyRule::default()
        })
        .collect();

    Role {
        metadata: meta(SERVICE_ACCOUNT, target),
        rules: Some(rules),
    }
}

fn deployer_binding(target: &TenantEnvironment) -> RoleBinding {
    RoleBinding {
        metadata: meta(SERVICE_ACCOUNT, target),
        role_ref: RoleRef {
            api_group: "rbac.authorization.k8s.io".to_string(),
            kind: "Role".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: SERVICE_ACCOUNT.to_string(),
            namespace: Some(target.namespace()),
            ..Subject::default()
        }]),
    }
}

fn token_secret(target: &TenantEnvironment) -> Secret {
    let mut metadata = meta(TOKEN_SECRET, target);
    metadata.annotations = Some(
        [(
            SERVICE_ACCOUNT_ANNOTATION.to_string(),
            SERVICE_ACCOUNT.to_string(),
        )]
        .into(),
    );

    Secret {
        metadata,
        type_: Some(TOKEN_SECRET_TYPE.to_string()),
        ..Secret::default()
    }
}

/// Token and CA bundle once the token controller has filled the Secret.
fn populated(secret: &Secret) -> Option<(String, Vec<u8>)> {
    let data = secret.data.as_ref()?;
    let token = data.get("token").filter(|t| !t.0.is_empty())?;
    let ca = data.get("ca.crt").filter(|c| !c.0.is_empty())?;
    let token = String::from_utf8(token.0.clone()).ok()?;
    Some((token, ca.0.clone()))
}

/// Write an artifact unless it already holds `contents`.
fn store_artifact(
    store: &dyn CredentialStore,
    artifact: &Artifact,
    contents: &[u8],
) -> Result<Applied, ProvisionError> {
    match store.read_artifact(artifact)? {
        Some(existing) if existing == contents => Ok(Applied::Unchanged),
        existing => {
            store.write_artifact(artifact, contents)?;
            Ok(if existing.is_some() {
                Applied::Updated
            } else {
                Applied::Created
            })
        }
    }
}

/// Provisions deployer identities and stores their kubeconfigs.
pub struct AccessManager<'a, C: ClusterApi> {
    cluster: &'a C,
    store: &'a dyn CredentialStore,
    clock: &'a dyn Clock,
    config: &'a IdentityConfig,
}

impl<'a, C: ClusterApi> AccessManager<'a, C> {
    pub fn new(
        cluster: &'a C,
        store: &'a dyn CredentialStore,
        clock: &'a dyn Clock,
        config: &'a IdentityConfig,
    ) -> Self {
        Self {
            cluster,
            store,
            clock,
            config,
        }
    }

    /// Ensure the deployer account, its role and token exist in the target
    /// namespace, then store a kubeconfig for it.
    ///
    /// The first populated token Secret also provides the cluster CA artifact.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::TokenNotPopulated`] if the token controller
    /// does not fill the Secret in time, or any cluster or store error.
    pub async fn ensure_service_identity(
        &self,
        target: &TenantEnvironment,
    ) -> Result<ServiceIdentity, ProvisionError> {
        let namespace = target.namespace();
        let ns = Some(namespace.as_str());

        let account = ServiceAccount {
            metadata: meta(SERVICE_ACCOUNT, target),
            ..ServiceAccount::default()
        };
        let objects_applied = Applied::all([
            ensure_object(self.cluster, ns, &account).await?,
            ensure_object(self.cluster, ns, &deployer_role(target)).await?,
            ensure_object(self.cluster, ns, &deployer_binding(target)).await?,
            ensure_object(self.cluster, ns, &token_secret(target)).await?,
        ]);

        let outcome = poll_until(
            self.clock,
            self.config.poll_interval(),
            self.config.timeout(),
            || async {
                let secret = self.cluster.get::<Secret>(ns, TOKEN_SECRET).await?;
                Ok::<_, ProvisionError>(secret.as_ref().and_then(populated))
            },
        )
        .await?;

        let PollOutcome::Ready((token, ca)) = outcome else {
            return Err(ProvisionError::TokenNotPopulated {
                namespace,
                service_account: SERVICE_ACCOUNT.to_string(),
                waited_secs: self.config.token_timeout_secs,
            });
        };
        debug!(namespace = %namespace, "Service account token populated");

        let server = self
            .config
            .api_endpoint
            .clone()
            .unwrap_or_else(|| self.cluster.api_endpoint());
        let rendered = kubeconfig::render(&KubeconfigParams {
            cluster_name: &namespace,
            server: &server,
            ca_pem: &ca,
            namespace: &namespace,
            user: SERVICE_ACCOUNT,
            token: &token,
        })?;

        let artifact = Artifact::kubeconfig(target);
        let kubeconfig_applied = store_artifact(self.store, &artifact, rendered.as_bytes())?;
        store_artifact(self.store, &Artifact::ClusterCa, &ca)?;

        let applied = objects_applied.and(kubeconfig_applied);
        info!(namespace = %namespace, outcome = ?applied, "Service identity ensured");

        Ok(ServiceIdentity {
            namespace,
            service_account: SERVICE_ACCOUNT.to_string(),
            kubeconfig: artifact,
            applied,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use crate::tenant::{Environment, Tenant};
    use crate::testing::{FakeClock, FakeCluster};

    fn target() -> TenantEnvironment {
        TenantEnvironment::new(&Tenant::new("acme").unwrap(), Environment::Prod)
    }

    #[test]
    fn test_role_is_namespace_scoped() {
        let role = deployer_role(&target());
        assert_eq!(role.metadata.namespace.as_deref(), Some("acme-prod"));
        let rules = role.rules.unwrap();
        assert!(rules.iter().all(|r| r.verbs.contains(&"delete".to_string())));
        assert!(rules
            .iter()
            .any(|r| r.resources.as_ref().unwrap().contains(&"httproutes".to_string())));
    }

    #[tokio::test]
    async fn test_identity_provisioning_stores_kubeconfig() {
        let cluster = FakeCluster::new();
        let store = MemoryStore::new();
        let clock = FakeClock::new();
        let config = IdentityConfig::default();
        let manager = AccessManager::new(&cluster, &store, &clock, &config);

        let identity = manager.ensure_service_identity(&target()).await.unwrap();

        assert_eq!(identity.applied, Applied::Created);
        let account: ServiceAccount = cluster.object(Some("acme-prod"), SERVICE_ACCOUNT).unwrap();
        assert_eq!(account.metadata.name.as_deref(), Some("ci-deployer"));

        let rendered = store.read_artifact(&identity.kubeconfig).unwrap().unwrap();
        let rendered = String::from_utf8(rendered).unwrap();
        let token = cluster.service_account_token("acme-prod");
        assert!(rendered.contains(&token));
        assert!(rendered.contains("namespace: acme-prod"));
        assert!(store.read_artifact(&Artifact::ClusterCa).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_rerun_is_unchanged() {
        let cluster = FakeCluster::new();
        let store = MemoryStore::new();
        let clock = FakeClock::new();
        let config = IdentityConfig::default();
        let manager = AccessManager::new(&cluster, &store, &clock, &config);

        manager.ensure_service_identity(&target()).await.unwrap();
        let writes = store.write_count();
        let again = manager.ensure_service_identity(&target()).await.unwrap();

        assert_eq!(again.applied, Applied::Unchanged);
        assert_eq!(store.write_count(), writes);
    }

    #[tokio::test]
    async fn test_unpopulated_token_is_a_hard_failure() {
        let cluster = FakeCluster::new();
        cluster.set_populate_tokens(false);
        let store = MemoryStore::new();
        let clock = FakeClock::new();
        let config = IdentityConfig::default();
        let manager = AccessManager::new(&cluster, &store, &clock, &config);

        let err = manager.ensure_service_identity(&target()).await.unwrap_err();

        assert!(matches!(err, ProvisionError::TokenNotPopulated { waited_secs: 10, .. }));
        assert!(clock.elapsed() <= config.timeout() + config.poll_interval());
        assert!(store.read_artifact(&Artifact::kubeconfig(&target())).unwrap().is_none());
    }
}
