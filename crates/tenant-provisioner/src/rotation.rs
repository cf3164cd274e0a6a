//! Infrastructure credential rotation.
//!
//! A rotation moves through [`RotationPhase`] in order. Database role
//! passwords change in one transaction authenticated with the old admin
//! password, and the store is rewritten only after that transaction commits.
//! If the database side fails the store is not touched. If the store write
//! fails after commit, the old passwords are restored with the new admin
//! credential so the recorded and live values converge again.

use std::collections::BTreeSet;
use std::fmt;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::Secret;
use serde::Serialize;
use serde_json::{json, Map, Value};
use thiserror::Error;
use tracing::{debug, error, info, instrument, warn};

use crate::cluster::{ClusterApi, ClusterError};
use crate::config::{
    DatabaseConfig, ProvisionerConfig, RotatedCredential, RotationConfig, SecretTarget,
    WorkloadKind, WorkloadRef,
};
use crate::database::{AdminCredential, DatabaseEngine, DatabaseError, PasswordChange};
use crate::error::ErrorClass;
use crate::report::{EXIT_OK, EXIT_PARTIAL, EXIT_VALIDATION};
use crate::store::{generate_password_unlike, CredentialStore, RecordDomain, StoreError};

/// Pod template annotation whose change triggers a rolling restart.
pub const RESTARTED_AT_ANNOTATION: &str = "kubectl.kubernetes.io/restartedAt";

/// Rotation progress, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RotationPhase {
    Locked,
    Generating,
    ApplyingToLiveSystem,
    Persisting,
    Restarting,
    Done,
}

impl fmt::Display for RotationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Locked => "locked",
            Self::Generating => "generating",
            Self::ApplyingToLiveSystem => "applying-to-live-system",
            Self::Persisting => "persisting",
            Self::Restarting => "restarting",
            Self::Done => "done",
        })
    }
}

#[derive(Debug, Error)]
pub enum RotationError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("{key} is not set in the infrastructure record")]
    MissingCredential { key: String },

    #[error("database rejected the password change, stored credentials are unchanged: {source}")]
    LiveChangeFailed {
        #[source]
        source: DatabaseError,
    },

    #[error(
        "new passwords are live but could not be stored (previous passwords restored: {rolled_back}): {source}"
    )]
    PersistFailed {
        #[source]
        source: StoreError,
        rolled_back: bool,
    },
}

impl RotationError {
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(StoreError::Locked { .. }) | Self::MissingCredential { .. } => {
                ErrorClass::Validation
            }
            Self::LiveChangeFailed { source } if source.is_transient() => ErrorClass::Transient,
            Self::Store(_) | Self::LiveChangeFailed { .. } => ErrorClass::Hard,
            Self::PersistFailed { .. } => ErrorClass::RotationInvariant,
        }
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        match self.class() {
            ErrorClass::Validation => EXIT_VALIDATION,
            _ => EXIT_PARTIAL,
        }
    }
}

/// Whether a credential's cluster Secret copy was updated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum SecretSync {
    Synced,
    NotConfigured,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CredentialOutcome {
    pub key: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub database_role: Option<String>,
    pub secret: SecretSync,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RestartOutcome {
    pub workload: String,
    pub restarted: bool,
}

/// Everything one `rotate` run did after the new values were stored.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RotationReport {
    pub credentials: Vec<CredentialOutcome>,
    pub restarts: Vec<RestartOutcome>,
    /// Soft failures after persistence.
    pub warnings: Vec<String>,
}

impl RotationReport {
    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.warnings.is_empty() {
            EXIT_OK
        } else {
            EXIT_PARTIAL
        }
    }
}

struct Rotated<'c> {
    credential: &'c RotatedCredential,
    previous: String,
    next: String,
}

fn enter(phase: RotationPhase) {
    debug!(phase = %phase, "Rotation phase");
}

fn role_changes(
    rotated: &[Rotated<'_>],
    select: impl Fn(&Rotated<'_>) -> String,
) -> Vec<PasswordChange> {
    rotated
        .iter()
        .filter_map(|r| {
            r.credential.database_role.as_ref().map(|role| PasswordChange {
                role: role.clone(),
                password: select(r),
            })
        })
        .collect()
}

fn secret_patch(target: &SecretTarget, value: &str) -> Value {
    let mut data = Map::new();
    data.insert(target.key.clone(), Value::String(STANDARD.encode(value)));
    json!({ "data": data })
}

fn restart_patch(timestamp: &str) -> Value {
    let mut annotations = Map::new();
    annotations.insert(
        RESTARTED_AT_ANNOTATION.to_string(),
        Value::String(timestamp.to_string()),
    );
    json!({ "spec": { "template": { "metadata": { "annotations": annotations } } } })
}

/// Rotates the configured infrastructure credentials.
pub struct Rotator<'a, C: ClusterApi> {
    cluster: &'a C,
    engine: &'a dyn DatabaseEngine,
    store: &'a dyn CredentialStore,
    database: &'a DatabaseConfig,
    rotation: &'a RotationConfig,
}

impl<'a, C: ClusterApi> Rotator<'a, C> {
    pub fn new(
        cluster: &'a C,
        engine: &'a dyn DatabaseEngine,
        store: &'a dyn CredentialStore,
        config: &'a ProvisionerConfig,
    ) -> Self {
        Self {
            cluster,
            engine,
            store,
            database: &config.database,
            rotation: &config.rotation,
        }
    }

    /// Rotate every configured credential.
    ///
    /// # Errors
    ///
    /// Fails before any change if the store is locked or not writable, or a
    /// configured credential is missing from the infrastructure record.
    /// [`RotationError::LiveChangeFailed`] leaves both sides untouched.
    /// [`RotationError::PersistFailed`] reports whether the live change was
    /// reverted. Secret sync and restart problems are returned as warnings in
    /// the report.
    #[instrument(skip(self), fields(credentials = self.rotation.credentials.len()))]
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        let _lock = self.store.lock()?;
        enter(RotationPhase::Locked);

        let domain = RecordDomain::Infrastructure;
        let record = self.store.read_record(&domain)?.unwrap_or_default();
        let admin_key = &self.database.admin_password_key;
        let admin = AdminCredential {
            user: self.database.admin_user.clone(),
            password: record
                .get(admin_key)
                .cloned()
                .ok_or_else(|| RotationError::MissingCredential {
                    key: admin_key.clone(),
                })?,
        };

        enter(RotationPhase::Generating);
        let mut rotated = Vec::with_capacity(self.rotation.credentials.len());
        for credential in &self.rotation.credentials {
            let previous = record.get(&credential.key).cloned().ok_or_else(|| {
                RotationError::MissingCredential {
                    key: credential.key.clone(),
                }
            })?;
            let next = generate_password_unlike(Some(&previous));
            rotated.push(Rotated {
                credential,
                previous,
                next,
            });
        }
        if rotated.is_empty() {
            warn!("No credentials configured for rotation");
            return Ok(RotationReport::default());
        }
        self.store.preflight()?;

        enter(RotationPhase::ApplyingToLiveSystem);
        let changes = role_changes(&rotated, |r| r.next.clone());
        if !changes.is_empty() {
            let mut session = self
                .engine
                .connect(&admin)
                .await
                .map_err(|source| RotationError::LiveChangeFailed { source })?;
            session
                .change_passwords(&changes)
                .await
                .map_err(|source| RotationError::LiveChangeFailed { source })?;
            info!(roles = changes.len(), "Database role passwords changed");
        }

        let new_admin = AdminCredential {
            user: admin.user.clone(),
            password: rotated
                .iter()
                .find(|r| &r.credential.key == admin_key)
                .map_or_else(|| admin.password.clone(), |r| r.next.clone()),
        };

        enter(RotationPhase::Persisting);
        let mut updated = record.clone();
        for r in &rotated {
            updated.insert(r.credential.key.clone(), r.next.clone());
        }
        if let Err(source) = self.store.write_record(&domain, &updated) {
            error!(error = %source, "Failed to persist rotated credentials");
            let rolled_back = self.roll_back(&new_admin, &rotated).await;
            return Err(RotationError::PersistFailed {
                source,
                rolled_back,
            });
        }
        info!(credentials = rotated.len(), "Rotated credentials persisted");

        let mut report = RotationReport::default();
        if !changes.is_empty() {
            self.verify_admin(&new_admin, &mut report).await;
        }

        enter(RotationPhase::Restarting);
        for r in &rotated {
            let secret = match &r.credential.secret {
                None => SecretSync::NotConfigured,
                Some(target) => match self.sync_secret(target, &r.next).await {
                    Ok(()) => SecretSync::Synced,
                    Err(e) => {
                        report.warnings.push(format!(
                            "secret {}/{} for {} not updated: {e}",
                            target.namespace, target.name, r.credential.key
                        ));
                        SecretSync::Failed
                    }
                },
            };
            report.credentials.push(CredentialOutcome {
                key: r.credential.key.clone(),
                database_role: r.credential.database_role.clone(),
                secret,
            });
        }

        let workloads: BTreeSet<&WorkloadRef> = rotated
            .iter()
            .filter_map(|r| r.credential.restart.as_ref())
            .collect();
        let timestamp = chrono::Utc::now().to_rfc3339();
        for workload in workloads {
            let restarted = match self.restart(workload, &timestamp).await {
                Ok(()) => true,
                Err(e) => {
                    report
                        .warnings
                        .push(format!("{workload} not restarted: {e}"));
                    false
                }
            };
            report.restarts.push(RestartOutcome {
                workload: workload.to_string(),
                restarted,
            });
        }

        enter(RotationPhase::Done);
        info!(warnings = report.warnings.len(), "Rotation complete");
        Ok(report)
    }

    async fn roll_back(&self, new_admin: &AdminCredential, rotated: &[Rotated<'_>]) -> bool {
        let changes = role_changes(rotated, |r| r.previous.clone());
        if changes.is_empty() {
            return true;
        }
        let result = async {
            let mut session = self.engine.connect(new_admin).await?;
            session.change_passwords(&changes).await
        }
        .await;

        match result {
            Ok(()) => {
                warn!(roles = changes.len(), "Restored previous database passwords");
                true
            }
            Err(e) => {
                error!(error = %e, "Failed to restore previous database passwords");
                false
            }
        }
    }

    async fn verify_admin(&self, admin: &AdminCredential, report: &mut RotationReport) {
        let database = &self.database.maintenance_database;
        match self
            .engine
            .verify_login(&admin.user, &admin.password, database)
            .await
        {
            Ok(true) => debug!(user = %admin.user, "New admin credential verified"),
            Ok(false) => report
                .warnings
                .push(format!("new password for {} was rejected by the database", admin.user)),
            Err(e) => report
                .warnings
                .push(format!("could not verify new password for {}: {e}", admin.user)),
        }
    }

    async fn sync_secret(&self, target: &SecretTarget, value: &str) -> Result<(), ClusterError> {
        self.cluster
            .merge_patch::<Secret>(
                Some(&target.namespace),
                &target.name,
                &secret_patch(target, value),
            )
            .await?;
        debug!(namespace = %target.namespace, name = %target.name, "Secret synced");
        Ok(())
    }

    async fn restart(&self, workload: &WorkloadRef, timestamp: &str) -> Result<(), ClusterError> {
        let ns = Some(workload.namespace.as_str());
        let patch = restart_patch(timestamp);
        match workload.kind {
            WorkloadKind::Deployment => {
                self.cluster
                    .merge_patch::<Deployment>(ns, &workload.name, &patch)
                    .await?;
            }
            WorkloadKind::StatefulSet => {
                self.cluster
                    .merge_patch::<StatefulSet>(ns, &workload.name, &patch)
                    .await?;
            }
        }
        info!(workload = %workload, "Restart triggered");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeMap;

    use k8s_openapi::api::apps::v1::{DeploymentSpec, StatefulSetSpec};
    use k8s_openapi::ByteString;
    use kube::api::ObjectMeta;

    use super::*;
    use crate::database::MockDatabaseEngine;
    use crate::store::MemoryStore;
    use crate::testing::{FakeCluster, FakeDatabase};

    const OLD: [(&str, &str); 6] = [
        ("POSTGRES_ADMIN_PASSWORD", "old-admin"),
        ("KEYCLOAK_DB_PASSWORD", "old-kc-db"),
        ("KEYCLOAK_ADMIN_PASSWORD", "old-kc-admin"),
        ("GRAFANA_DB_PASSWORD", "old-grafana-db"),
        ("GRAFANA_ADMIN_PASSWORD", "old-grafana-admin"),
        ("PROMETHEUS_BASIC_AUTH_PASSWORD", "old-prom"),
    ];

    fn database() -> FakeDatabase {
        FakeDatabase::new("old-admin")
            .with_role("keycloak", "old-kc-db")
            .with_role("grafana", "old-grafana-db")
    }

    fn meta(namespace: &str, name: &str) -> ObjectMeta {
        ObjectMeta {
            name: Some(name.into()),
            namespace: Some(namespace.into()),
            ..ObjectMeta::default()
        }
    }

    fn cluster_with_consumers(config: &ProvisionerConfig) -> FakeCluster {
        let cluster = FakeCluster::new();
        for credential in &config.rotation.credentials {
            if let Some(target) = &credential.secret {
                cluster.insert(
                    Some(&target.namespace),
                    &Secret {
                        metadata: meta(&target.namespace, &target.name),
                        data: Some(BTreeMap::from([(
                            target.key.clone(),
                            ByteString(b"old".to_vec()),
                        )])),
                        ..Secret::default()
                    },
                );
            }
            if let Some(workload) = &credential.restart {
                let metadata = meta(&workload.namespace, &workload.name);
                match workload.kind {
                    WorkloadKind::Deployment => cluster.insert(
                        Some(&workload.namespace),
                        &Deployment {
                            metadata,
                            spec: Some(DeploymentSpec::default()),
                            ..Deployment::default()
                        },
                    ),
                    WorkloadKind::StatefulSet => cluster.insert(
                        Some(&workload.namespace),
                        &StatefulSet {
                            metadata,
                            spec: Some(StatefulSetSpec::default()),
                            ..StatefulSet::default()
                        },
                    ),
                }
            }
        }
        cluster
    }

    fn infrastructure(store: &MemoryStore) -> BTreeMap<String, String> {
        store
            .read_record(&RecordDomain::Infrastructure)
            .unwrap()
            .unwrap()
    }

    #[tokio::test]
    async fn test_rotation_changes_every_credential() {
        let config = ProvisionerConfig::default();
        let cluster = cluster_with_consumers(&config);
        let db = database();
        let store = MemoryStore::with_infrastructure(&OLD);

        let report = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap();

        assert_eq!(report.exit_code(), EXIT_OK, "{:?}", report.warnings);
        let stored = infrastructure(&store);
        for (key, old) in OLD {
            assert_ne!(stored[key], old, "{key} was not rotated");
        }
        assert_eq!(db.role_password("postgres").unwrap(), stored["POSTGRES_ADMIN_PASSWORD"]);
        assert_eq!(db.role_password("keycloak").unwrap(), stored["KEYCLOAK_DB_PASSWORD"]);
        assert_eq!(db.role_password("grafana").unwrap(), stored["GRAFANA_DB_PASSWORD"]);

        assert!(report.credentials.iter().all(|c| c.secret == SecretSync::Synced));
        let secret: Secret = cluster.object(Some("monitoring"), "grafana-admin").unwrap();
        let synced = &secret.data.unwrap()["admin-password"];
        assert_eq!(synced.0, stored["GRAFANA_ADMIN_PASSWORD"].as_bytes());
    }

    #[tokio::test]
    async fn test_each_workload_restarts_once() {
        let config = ProvisionerConfig::default();
        let cluster = cluster_with_consumers(&config);
        let db = database();
        let store = MemoryStore::with_infrastructure(&OLD);

        let report = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap();

        let restarted: Vec<_> = report.restarts.iter().map(|r| r.workload.as_str()).collect();
        assert_eq!(
            restarted,
            [
                "deployment monitoring/grafana",
                "statefulset identity/keycloak",
                "statefulset monitoring/prometheus",
            ]
        );
        let grafana: Deployment = cluster.object(Some("monitoring"), "grafana").unwrap();
        let annotations = grafana.spec.unwrap().template.metadata.unwrap().annotations.unwrap();
        assert!(annotations.contains_key(RESTARTED_AT_ANNOTATION));
    }

    #[tokio::test]
    async fn test_unreachable_database_leaves_store_untouched() {
        let config = ProvisionerConfig::default();
        let cluster = FakeCluster::new();
        let store = MemoryStore::with_infrastructure(&OLD);
        let view = store.clone();

        let mut engine = MockDatabaseEngine::new();
        engine.expect_connect().times(1).returning(move |admin| {
            assert_eq!(admin.password, "old-admin");
            assert_eq!(view.write_count(), 0);
            Err(DatabaseError::Unreachable {
                host: "db".into(),
                port: 5432,
                message: "connection refused".into(),
            })
        });
        engine.expect_verify_login().never();

        let err = Rotator::new(&cluster, &engine, &store, &config)
            .rotate()
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::LiveChangeFailed { .. }));
        assert_eq!(err.class(), ErrorClass::Transient);
        assert_eq!(store.write_count(), 0);
        assert_eq!(infrastructure(&store)["POSTGRES_ADMIN_PASSWORD"], "old-admin");
    }

    #[tokio::test]
    async fn test_rejected_transaction_changes_nothing() {
        let config = ProvisionerConfig::default();
        let cluster = cluster_with_consumers(&config);
        let db = database();
        db.fail_statement("ALTER ROLE grafana");
        let store = MemoryStore::with_infrastructure(&OLD);

        let err = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::LiveChangeFailed { .. }));
        assert_eq!(store.write_count(), 0);
        assert_eq!(db.role_password("postgres").as_deref(), Some("old-admin"));
        assert_eq!(db.role_password("keycloak").as_deref(), Some("old-kc-db"));
        let secret: Secret = cluster.object(Some("identity"), "keycloak-db").unwrap();
        assert_eq!(secret.data.unwrap()["password"].0, b"old");
    }

    #[tokio::test]
    async fn test_persist_failure_restores_previous_passwords() {
        let config = ProvisionerConfig::default();
        let cluster = FakeCluster::new();
        let db = database();
        let store = MemoryStore::with_infrastructure(&OLD);
        store.fail_writes(true);

        let err = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::PersistFailed { rolled_back: true, .. }));
        assert_eq!(err.class(), ErrorClass::RotationInvariant);
        assert_eq!(db.role_password("postgres").as_deref(), Some("old-admin"));
        assert_eq!(db.role_password("grafana").as_deref(), Some("old-grafana-db"));
        assert_eq!(infrastructure(&store)["POSTGRES_ADMIN_PASSWORD"], "old-admin");
    }

    #[tokio::test]
    async fn test_unwritable_store_is_detected_before_database_changes() {
        let config = ProvisionerConfig::default();
        let cluster = FakeCluster::new();
        let db = database();
        let store = MemoryStore::with_infrastructure(&OLD);
        store.set_read_only(true);

        let err = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap_err();

        assert!(matches!(err, RotationError::Store(_)));
        assert_eq!(db.sessions(), 0);
    }

    #[tokio::test]
    async fn test_missing_credential_is_a_validation_error() {
        let config = ProvisionerConfig::default();
        let cluster = FakeCluster::new();
        let db = database();
        let store = MemoryStore::with_infrastructure(&OLD[..5]);

        let err = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap_err();

        assert!(matches!(
            &err,
            RotationError::MissingCredential { key } if key == "PROMETHEUS_BASIC_AUTH_PASSWORD"
        ));
        assert_eq!(err.exit_code(), EXIT_VALIDATION);
        assert_eq!(db.sessions(), 0);
    }

    #[tokio::test]
    async fn test_missing_consumer_secret_is_a_warning() {
        let config = ProvisionerConfig::default();
        let cluster = FakeCluster::new();
        let db = database();
        let store = MemoryStore::with_infrastructure(&OLD);

        let report = Rotator::new(&cluster, &db, &store, &config)
            .rotate()
            .await
            .unwrap();

        assert_eq!(report.exit_code(), EXIT_PARTIAL);
        assert!(report.credentials.iter().all(|c| c.secret == SecretSync::Failed));
        assert!(report.restarts.iter().all(|r| !r.restarted));
        assert_ne!(infrastructure(&store)["POSTGRES_ADMIN_PASSWORD"], "old-admin");
    }

    #[test]
    fn test_patches_use_literal_keys() {
        let target = SecretTarget {
            namespace: "monitoring".into(),
            name: "grafana-admin".into(),
            key: "admin-password".into(),
        };
        let patch = secret_patch(&target, "pw");
        assert_eq!(patch["data"]["admin-password"], STANDARD.encode("pw"));

        let restart = restart_patch("2026-01-01T00:00:00Z");
        assert_eq!(
            restart["spec"]["template"]["metadata"]["annotations"][RESTARTED_AT_ANNOTATION],
            "2026-01-01T00:00:00Z"
        );
    }
}
