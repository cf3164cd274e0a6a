//! Tenant namespaces with quotas, limit ranges and pod-security labels.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{
    LimitRange, LimitRangeItem, LimitRangeSpec, Namespace, ResourceQuota, ResourceQuotaSpec,
};
use k8s_openapi::apimachinery::pkg::api::resource::Quantity;
use kube::api::ObjectMeta;
use tracing::info;

use crate::cluster::{ensure_object, Applied, ClusterApi, ClusterError};
use crate::config::EnvironmentProfile;
use crate::tenant::TenantEnvironment;

pub const RESOURCE_QUOTA: &str = "tenant-quota";
pub const LIMIT_RANGE: &str = "tenant-limits";

pub const MANAGED_BY_LABEL: &str = "app.kubernetes.io/managed-by";
pub const MANAGED_BY: &str = "tenant-provisioner";
pub const TENANT_LABEL: &str = "tenant-provisioner.io/tenant";
pub const ENVIRONMENT_LABEL: &str = "tenant-provisioner.io/environment";
const POD_SECURITY_LABEL: &str = "pod-security.kubernetes.io/enforce";

/// Labels stamped on every object the provisioner creates for a tenant.
#[must_use]
pub fn managed_labels(target: &TenantEnvironment) -> BTreeMap<String, String> {
    BTreeMap::from([
        (MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string()),
        (TENANT_LABEL.to_string(), target.tenant.to_string()),
        (
            ENVIRONMENT_LABEL.to_string(),
            target.environment.to_string(),
        ),
    ])
}

fn quantities(entries: &[(&str, &str)]) -> BTreeMap<String, Quantity> {
    entries
        .iter()
        .map(|(k, v)| ((*k).to_string(), Quantity((*v).to_string())))
        .collect()
}

fn meta(name: &str, target: &TenantEnvironment) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(target.namespace()),
        labels: Some(managed_labels(target)),
        ..ObjectMeta::default()
    }
}

/// Desired Namespace object.
#[must_use]
pub fn namespace(target: &TenantEnvironment) -> Namespace {
    let mut labels = managed_labels(target);
    labels.insert(
        POD_SECURITY_LABEL.to_string(),
        target.environment.pod_security_level().to_string(),
    );

    Namespace {
        metadata: ObjectMeta {
            name: Some(target.namespace()),
            labels: Some(labels),
            ..ObjectMeta::default()
        },
        ..Namespace::default()
    }
}

/// Desired ResourceQuota.
#[must_use]
pub fn resource_quota(target: &TenantEnvironment, profile: &EnvironmentProfile) -> ResourceQuota {
    let pods = profile.pods.to_string();
    ResourceQuota {
        metadata: meta(RESOURCE_QUOTA, target),
        spec: Some(ResourceQuotaSpec {
            hard: Some(quantities(&[
                ("requests.cpu", profile.requests_cpu.as_str()),
                ("requests.memory", profile.requests_memory.as_str()),
                ("limits.cpu", profile.limits_cpu.as_str()),
                ("limits.memory", profile.limits_memory.as_str()),
                ("pods", pods.as_str()),
            ])),
            ..ResourceQuotaSpec::default()
        }),
        ..ResourceQuota::default()
    }
}

/// Desired LimitRange giving every container a default request and limit.
#[must_use]
pub fn limit_range(target: &TenantEnvironment, profile: &EnvironmentProfile) -> LimitRange {
    LimitRange {
        metadata: meta(LIMIT_RANGE, target),
        spec: Some(LimitRangeSpec {
            limits: vec![LimitRangeItem {
                type_: "Container".to_string(),
                default: Some(quantities(&[
                    ("cpu", profile.default_cpu.as_str()),
                    ("memory", profile.default_memory.as_str()),
                ])),
                default_request: Some(quantities(&[
                    ("cpu", profile.default_request_cpu.as_str()),
                    ("memory", profile.default_request_memory.as_str()),
                ])),
                ..LimitRangeItem::default()
            }],
        }),
    }
}

/// Create or reconcile the namespace, its quota and its limit range.
///
/// # Errors
///
/// Returns an error if the cluster API is unreachable or rejects a write.
pub async fn ensure_namespace<C: ClusterApi>(
    cluster: &C,
    target: &TenantEnvironment,
    profile: &EnvironmentProfile,
) -> Result<Applied, ClusterError> {
    let name = target.namespace();

    let namespace_applied = ensure_object(cluster, None, &namespace(target)).await?;
    let quota_applied =
        ensure_object(cluster, Some(&name), &resource_quota(target, profile)).await?;
    let limits_applied = ensure_object(cluster, Some(&name), &limit_range(target, profile)).await?;

    let applied = Applied::all([namespace_applied, quota_applied, limits_applied]);
    info!(namespace = %name, outcome = ?applied, "Namespace ensured");
    Ok(applied)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EnvironmentProfiles;
    use crate::tenant::{Environment, Tenant};
    use crate::testing::FakeCluster;

    fn target(environment: Environment) -> TenantEnvironment {
        TenantEnvironment::new(&Tenant::new("acme").unwrap(), environment)
    }

    #[test]
    fn test_pod_security_is_stricter_for_prod() {
        let alpha = namespace(&target(Environment::Alpha));
        let prod = namespace(&target(Environment::Prod));
        assert_eq!(alpha.metadata.labels.unwrap()[POD_SECURITY_LABEL], "baseline");
        assert_eq!(prod.metadata.labels.unwrap()[POD_SECURITY_LABEL], "restricted");
    }

    #[tokio::test]
    async fn test_ensure_namespace_is_idempotent() {
        let cluster = FakeCluster::new();
        let profiles = EnvironmentProfiles::default();
        let t = target(Environment::Alpha);

        let first = ensure_namespace(&cluster, &t, &profiles.alpha).await.unwrap();
        let second = ensure_namespace(&cluster, &t, &profiles.alpha).await.unwrap();

        assert_eq!(first, Applied::Created);
        assert_eq!(second, Applied::Unchanged);
        assert_eq!(cluster.count::<Namespace>(), 1);
        assert_eq!(cluster.count::<ResourceQuota>(), 1);
        assert_eq!(cluster.count::<LimitRange>(), 1);
    }

    #[tokio::test]
    async fn test_quota_changes_apply_on_rerun() {
        let cluster = FakeCluster::new();
        let mut profile = EnvironmentProfiles::default().prod;
        let t = target(Environment::Prod);
        ensure_namespace(&cluster, &t, &profile).await.unwrap();

        profile.pods = 99;
        let applied = ensure_namespace(&cluster, &t, &profile).await.unwrap();
        assert_eq!(applied, Applied::Updated);

        let quota: ResourceQuota = cluster.object(Some("acme-prod"), RESOURCE_QUOTA).unwrap();
        let hard = quota.spec.unwrap().hard.unwrap();
        assert_eq!(hard["pods"], Quantity("99".into()));
    }

    #[tokio::test]
    async fn test_unreachable_cluster_is_an_error() {
        let cluster = FakeCluster::new();
        cluster.set_unreachable(true);
        let profiles = EnvironmentProfiles::default();

        let result = ensure_namespace(&cluster, &target(Environment::Alpha), &profiles.alpha).await;
        assert!(matches!(result, Err(ClusterError::Unreachable(_))));
    }
}
