//! Per-tenant database credentials.
//!
//! [`DatabaseEngine`] and [`DatabaseSession`] are the seams to the shared
//! engine; [`PostgresEngine`] is the production adapter. [`DatabaseProvisioner`]
//! turns a tenant × environment into a role, a database, a namespace Secret
//! and a stored password.

mod postgres;

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::ByteString;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::cluster::{ensure_object, Applied, ClusterApi};
use crate::config::DatabaseConfig;
use crate::error::ProvisionError;
use crate::namespace::managed_labels;
use crate::store::{generate_password_unlike, CredentialStore, RecordDomain};
use crate::tenant::TenantEnvironment;

pub use postgres::PostgresEngine;

/// Name of the per-namespace Secret holding the tenant's database credential.
pub const CREDENTIALS_SECRET: &str = "database-credentials";

/// Errors raised by database adapters.
///
/// Messages never include passwords.
#[derive(Debug, Error)]
pub enum DatabaseError {
    #[error("database {host}:{port} unreachable: {message}")]
    Unreachable {
        host: String,
        port: u16,
        message: String,
    },

    #[error("authentication failed for role '{role}'")]
    AuthenticationFailed { role: String },

    #[error("{statement} rejected: {message}")]
    Statement { statement: String, message: String },
}

impl DatabaseError {
    /// Whether retrying the same call may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unreachable { .. })
    }
}

/// TLS negotiation mode for engine connections and rendered URLs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SslMode {
    Disable,
    Allow,
    #[default]
    Prefer,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Disable => "disable",
            Self::Allow => "allow",
            Self::Prefer => "prefer",
            Self::Require => "require",
            Self::VerifyCa => "verify-ca",
            Self::VerifyFull => "verify-full",
        }
    }
}

/// Where the shared engine listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseEndpoint {
    pub host: String,
    pub port: u16,
    pub ssl_mode: SslMode,
}

/// Superuser credential used for administrative sessions.
#[derive(Clone, PartialEq, Eq)]
pub struct AdminCredential {
    pub user: String,
    pub password: String,
}

impl fmt::Debug for AdminCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AdminCredential")
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// One role password change within a rotation transaction.
#[derive(Clone, PartialEq, Eq)]
pub struct PasswordChange {
    pub role: String,
    pub password: String,
}

impl fmt::Debug for PasswordChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PasswordChange")
            .field("role", &self.role)
            .finish_non_exhaustive()
    }
}

/// Connection details handed to a tenant workload.
#[derive(Clone, PartialEq, Eq)]
pub struct DatabaseCredential {
    pub host: String,
    pub port: u16,
    pub database: String,
    pub username: String,
    pub password: String,
    pub ssl_mode: SslMode,
}

impl fmt::Debug for DatabaseCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatabaseCredential")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("database", &self.database)
            .field("username", &self.username)
            .finish_non_exhaustive()
    }
}

impl DatabaseCredential {
    /// libpq-style connection URL.
    #[must_use]
    pub fn url(&self) -> String {
        format!(
            "postgresql://{}:{}@{}:{}/{}?sslmode={}",
            self.username,
            self.password,
            self.host,
            self.port,
            self.database,
            self.ssl_mode.as_str()
        )
    }

    /// JDBC connection URL.
    #[must_use]
    pub fn jdbc_url(&self) -> String {
        format!(
            "jdbc:postgresql://{}:{}/{}?user={}&password={}&sslmode={}",
            self.host,
            self.port,
            self.database,
            self.username,
            self.password,
            self.ssl_mode.as_str()
        )
    }

    /// Keys of the `database-credentials` Secret.
    #[must_use]
    pub fn secret_data(&self) -> BTreeMap<String, String> {
        BTreeMap::from([
            ("host".to_string(), self.host.clone()),
            ("port".to_string(), self.port.to_string()),
            ("database".to_string(), self.database.clone()),
            ("username".to_string(), self.username.clone()),
            ("password".to_string(), self.password.clone()),
            ("DATABASE_URL".to_string(), self.url()),
            ("JDBC_DATABASE_URL".to_string(), self.jdbc_url()),
        ])
    }
}

/// The shared database engine.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DatabaseEngine: Send + Sync {
    /// Open an administrative session.
    async fn connect(
        &self,
        admin: &AdminCredential,
    ) -> Result<Box<dyn DatabaseSession>, DatabaseError>;

    /// Check whether `user` can log in to `database` with `password`.
    ///
    /// Rejected credentials are `Ok(false)`; only connectivity problems are errors.
    async fn verify_login(
        &self,
        user: &str,
        password: &str,
        database: &str,
    ) -> Result<bool, DatabaseError>;

    fn endpoint(&self) -> DatabaseEndpoint;
}

/// An open administrative session.
#[async_trait]
pub trait DatabaseSession: Send {
    async fn role_exists(&mut self, role: &str) -> Result<bool, DatabaseError>;

    async fn create_role(&mut self, role: &str, password: &str) -> Result<(), DatabaseError>;

    async fn alter_role_password(&mut self, role: &str, password: &str)
        -> Result<(), DatabaseError>;

    async fn database_exists(&mut self, database: &str) -> Result<bool, DatabaseError>;

    async fn create_database(&mut self, database: &str, owner: &str) -> Result<(), DatabaseError>;

    async fn grant_all(&mut self, database: &str, role: &str) -> Result<(), DatabaseError>;

    /// Apply every change in one transaction: all take effect or none do.
    async fn change_passwords(&mut self, changes: &[PasswordChange]) -> Result<(), DatabaseError>;
}

/// Read the admin credential from the infrastructure record.
///
/// # Errors
///
/// Returns [`ProvisionError::MissingPrerequisite`] if the key is absent.
pub fn admin_credential(
    store: &dyn CredentialStore,
    config: &DatabaseConfig,
) -> Result<AdminCredential, ProvisionError> {
    let password = store
        .get(&RecordDomain::Infrastructure, &config.admin_password_key)?
        .ok_or_else(|| {
            ProvisionError::MissingPrerequisite(format!(
                "{} is not set in the infrastructure record",
                config.admin_password_key
            ))
        })?;

    Ok(AdminCredential {
        user: config.admin_user.clone(),
        password,
    })
}

/// Result of [`DatabaseProvisioner::ensure_database`].
#[derive(Debug, Clone)]
pub struct DatabaseOutcome {
    pub credential: DatabaseCredential,
    pub applied: Applied,
    /// Whether a new password was generated this run.
    pub rotated: bool,
}

/// Creates and reconciles tenant roles, databases and credential Secrets.
pub struct DatabaseProvisioner<'a, C: ClusterApi> {
    engine: &'a dyn DatabaseEngine,
    store: &'a dyn CredentialStore,
    cluster: &'a C,
    config: &'a DatabaseConfig,
}

impl<'a, C: ClusterApi> DatabaseProvisioner<'a, C> {
    pub fn new(
        engine: &'a dyn DatabaseEngine,
        store: &'a dyn CredentialStore,
        cluster: &'a C,
        config: &'a DatabaseConfig,
    ) -> Self {
        Self {
            engine,
            store,
            cluster,
            config,
        }
    }

    /// Ensure the tenant environment has a working role, database and Secret.
    ///
    /// A stored password is kept when it still logs in to the live database;
    /// otherwise a fresh one is generated and applied before it is stored.
    ///
    /// # Errors
    ///
    /// Returns an error if the admin credential is missing, the engine is
    /// unreachable or rejects a statement, or the Secret or store write fails.
    pub async fn ensure_database(
        &self,
        target: &TenantEnvironment,
    ) -> Result<DatabaseOutcome, ProvisionError> {
        let admin = admin_credential(self.store, self.config)?;
        let role = target.database_user();
        let database = target.database_name();
        let domain = RecordDomain::Tenant(target.tenant.clone());
        let key = target.password_key();

        let mut session = self.engine.connect(&admin).await?;
        let role_exists = session.role_exists(&role).await?;
        let database_exists = session.database_exists(&database).await?;
        let stored = self.store.get(&domain, &key)?;

        let reusable = match stored.as_deref() {
            Some(password) if role_exists && database_exists => {
                self.engine.verify_login(&role, password, &database).await?
            }
            _ => false,
        };

        let (password, role_applied) = match stored {
            Some(password) if reusable => {
                debug!(role = %role, "Stored password is live, keeping it");
                (password, Applied::Unchanged)
            }
            previous => {
                let password = generate_password_unlike(previous.as_deref());
                if role_exists {
                    session.alter_role_password(&role, &password).await?;
                    info!(role = %role, "Reset database role password");
                    (password, Applied::Updated)
                } else {
                    session.create_role(&role, &password).await?;
                    info!(role = %role, "Created database role");
                    (password, Applied::Created)
                }
            }
        };

        let database_applied = if database_exists {
            Applied::Unchanged
        } else {
            session.create_database(&database, &role).await?;
            info!(database = %database, owner = %role, "Created database");
            Applied::Created
        };
        session.grant_all(&database, &role).await?;

        let endpoint = self.engine.endpoint();
        let credential = DatabaseCredential {
            host: endpoint.host,
            port: endpoint.port,
            database,
            username: role,
            password,
            ssl_mode: endpoint.ssl_mode,
        };

        let namespace = target.namespace();
        let secret = credentials_secret(target, &credential);
        let secret_applied = ensure_object(self.cluster, Some(&namespace), &secret).await?;

        if !reusable {
            self.store.set(&domain, &key, &credential.password)?;
            debug!(tenant = %target.tenant, key = %key, "Stored database password");
        }

        Ok(DatabaseOutcome {
            credential,
            applied: Applied::all([role_applied, database_applied, secret_applied]),
            rotated: !reusable,
        })
    }
}

fn credentials_secret(target: &TenantEnvironment, credential: &DatabaseCredential) -> Secret {
    let data = credential
        .secret_data()
        .into_iter()
        .map(|(k, v)| (k, ByteString(v.into_bytes())))
        .collect();

    Secret {
        metadata: ObjectMeta {
            name: Some(CREDENTIALS_SECRET.to_string()),
            namespace: Some(target.namespace()),
            labels: Some(managed_labels(target)),
            ..ObjectMeta::default()
        },
        type_: Some("Opaque".to_string()),
        data: Some(data),
        ..Secret::default()
    }
}
