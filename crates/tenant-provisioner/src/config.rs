//! Provisioner configuration.
//!
//! Loaded from a TOML file. Every field has a default, so a missing file or a
//! partial file is valid.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};

use crate::database::SslMode;
use crate::retry::RetryConfig;
use crate::tenant::Environment;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/tenant-provisioner/config.toml";

/// Default credential store location.
pub const DEFAULT_STORE_DIR: &str = "/var/lib/tenant-provisioner";

/// Top-level configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProvisionerConfig {
    /// Root of the credential store.
    pub store_dir: PathBuf,
    /// Domain tenant hostnames are created under.
    pub base_domain: String,
    pub database: DatabaseConfig,
    pub gateway: GatewayConfig,
    pub certificate: CertificateConfig,
    pub identity: IdentityConfig,
    pub environments: EnvironmentProfiles,
    pub retry: RetryConfig,
    pub rotation: RotationConfig,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from(DEFAULT_STORE_DIR),
            base_domain: "apps.example.com".into(),
            database: DatabaseConfig::default(),
            gateway: GatewayConfig::default(),
            certificate: CertificateConfig::default(),
            identity: IdentityConfig::default(),
            environments: EnvironmentProfiles::default(),
            retry: RetryConfig::default(),
            rotation: RotationConfig::default(),
        }
    }
}

/// Shared database engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub host: String,
    pub port: u16,
    /// Superuser role the provisioner connects as.
    pub admin_user: String,
    /// Infrastructure record key holding the admin password.
    pub admin_password_key: String,
    /// Database to connect to for administrative statements.
    pub maintenance_database: String,
    pub ssl_mode: SslMode,
    pub connect_timeout_secs: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".into(),
            port: 5432,
            admin_user: "postgres".into(),
            admin_password_key: "POSTGRES_ADMIN_PASSWORD".into(),
            maintenance_database: "postgres".into(),
            ssl_mode: SslMode::Prefer,
            connect_timeout_secs: 10,
        }
    }
}

/// Shared ingress gateway and the issuer certificates are requested from.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    pub namespace: String,
    pub name: String,
    /// `ClusterIssuer` referenced by every tenant certificate.
    pub issuer: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            namespace: "gateway-system".into(),
            name: "shared-gateway".into(),
            issuer: "letsencrypt-prod".into(),
        }
    }
}

/// Certificate readiness polling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CertificateConfig {
    pub poll_interval_secs: u64,
    pub timeout_secs: u64,
}

impl Default for CertificateConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: 5,
            timeout_secs: 120,
        }
    }
}

impl CertificateConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// CI/CD service identity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdentityConfig {
    pub token_poll_interval_secs: u64,
    pub token_timeout_secs: u64,
    /// API server URL written into kubeconfigs. Defaults to the URL the
    /// provisioner itself connected to.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_endpoint: Option<String>,
}

impl Default for IdentityConfig {
    fn default() -> Self {
        Self {
            token_poll_interval_secs: 1,
            token_timeout_secs: 10,
            api_endpoint: None,
        }
    }
}

impl IdentityConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.token_poll_interval_secs)
    }

    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.token_timeout_secs)
    }
}

/// Resource sizing per environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentProfiles {
    pub alpha: EnvironmentProfile,
    pub prod: EnvironmentProfile,
}

impl Default for EnvironmentProfiles {
    fn default() -> Self {
        Self {
            alpha: EnvironmentProfile {
                requests_cpu: "2".into(),
                requests_memory: "4Gi".into(),
                limits_cpu: "4".into(),
                limits_memory: "8Gi".into(),
                pods: 20,
                default_cpu: "500m".into(),
                default_memory: "512Mi".into(),
                default_request_cpu: "100m".into(),
                default_request_memory: "128Mi".into(),
            },
            prod: EnvironmentProfile::default(),
        }
    }
}

impl EnvironmentProfiles {
    #[must_use]
    pub fn for_environment(&self, environment: Environment) -> &EnvironmentProfile {
        match environment {
            Environment::Alpha => &self.alpha,
            Environment::Prod => &self.prod,
        }
    }
}

/// ResourceQuota and LimitRange values for one environment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EnvironmentProfile {
    pub requests_cpu: String,
    pub requests_memory: String,
    pub limits_cpu: String,
    pub limits_memory: String,
    pub pods: u32,
    /// Default container limit.
    pub default_cpu: String,
    pub default_memory: String,
    /// Default container request.
    pub default_request_cpu: String,
    pub default_request_memory: String,
}

impl Default for EnvironmentProfile {
    fn default() -> Self {
        Self {
            requests_cpu: "4".into(),
            requests_memory: "8Gi".into(),
            limits_cpu: "8".into(),
            limits_memory: "16Gi".into(),
            pods: 50,
            default_cpu: "1".into(),
            default_memory: "1Gi".into(),
            default_request_cpu: "250m".into(),
            default_request_memory: "256Mi".into(),
        }
    }
}

/// Infrastructure credentials rotated by `tenantctl rotate`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub credentials: Vec<RotatedCredential>,
}

impl Default for RotationConfig {
    fn default() -> Self {
        let secret = |namespace: &str, name: &str, key: &str| {
            Some(SecretTarget {
                namespace: namespace.into(),
                name: name.into(),
                key: key.into(),
            })
        };
        let restart = |kind: WorkloadKind, namespace: &str, name: &str| {
            Some(WorkloadRef {
                kind,
                namespace: namespace.into(),
                name: name.into(),
            })
        };

        Self {
            credentials: vec![
                RotatedCredential {
                    key: "POSTGRES_ADMIN_PASSWORD".into(),
                    database_role: Some("postgres".into()),
                    secret: secret("databases", "postgres-admin", "password"),
                    restart: None,
                },
                RotatedCredential {
                    key: "KEYCLOAK_DB_PASSWORD".into(),
                    database_role: Some("keycloak".into()),
                    secret: secret("identity", "keycloak-db", "password"),
                    restart: restart(WorkloadKind::StatefulSet, "identity", "keycloak"),
                },
                RotatedCredential {
                    key: "KEYCLOAK_ADMIN_PASSWORD".into(),
                    database_role: None,
                    secret: secret("identity", "keycloak-admin", "password"),
                    restart: restart(WorkloadKind::StatefulSet, "identity", "keycloak"),
                },
                RotatedCredential {
                    key: "GRAFANA_DB_PASSWORD".into(),
                    database_role: Some("grafana".into()),
                    secret: secret("monitoring", "grafana-db", "password"),
                    restart: restart(WorkloadKind::Deployment, "monitoring", "grafana"),
                },
                RotatedCredential {
                    key: "GRAFANA_ADMIN_PASSWORD".into(),
                    database_role: None,
                    secret: secret("monitoring", "grafana-admin", "admin-password"),
                    restart: restart(WorkloadKind::Deployment, "monitoring", "grafana"),
                },
                RotatedCredential {
                    key: "PROMETHEUS_BASIC_AUTH_PASSWORD".into(),
                    database_role: None,
                    secret: secret("monitoring", "prometheus-basic-auth", "password"),
                    restart: restart(WorkloadKind::StatefulSet, "monitoring", "prometheus"),
                },
            ],
        }
    }
}

/// One rotated infrastructure credential.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RotatedCredential {
    /// Infrastructure record key.
    pub key: String,
    /// Database role whose password is this credential.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database_role: Option<String>,
    /// Cluster Secret holding a copy for a consuming workload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<SecretTarget>,
    /// Workload to restart so it picks up the new value.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub restart: Option<WorkloadRef>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretTarget {
    pub namespace: String,
    pub name: String,
    pub key: String,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WorkloadRef {
    pub kind: WorkloadKind,
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl std::fmt::Display for WorkloadRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.kind {
            WorkloadKind::Deployment => "deployment",
            WorkloadKind::StatefulSet => "statefulset",
        };
        write!(f, "{kind} {}/{}", self.namespace, self.name)
    }
}

impl ProvisionerConfig {
    /// Load configuration from `path`. A missing file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read, parsed, or validated.
    pub fn load(path: &Path) -> Result<Self> {
        let config = match std::fs::read_to_string(path) {
            Ok(raw) => toml::from_str::<Self>(&raw)
                .with_context(|| format!("Failed to parse {}", path.display()))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", path.display()));
            }
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings that would make polling or rotation misbehave.
    ///
    /// # Errors
    ///
    /// Returns an error describing the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        let polls = [
            (
                "certificate",
                self.certificate.poll_interval_secs,
                self.certificate.timeout_secs,
            ),
            (
                "identity token",
                self.identity.token_poll_interval_secs,
                self.identity.token_timeout_secs,
            ),
        ];
        for (what, interval, timeout) in polls {
            if interval == 0 {
                bail!("{what} poll interval must be greater than zero");
            }
            if timeout < interval {
                bail!("{what} timeout ({timeout}s) is shorter than its poll interval ({interval}s)");
            }
        }

        if self.retry.max_attempts == 0 {
            bail!("retry.max_attempts must be at least 1");
        }
        if self.base_domain.trim().is_empty() {
            bail!("base_domain must not be empty");
        }

        let mut seen = BTreeSet::new();
        for credential in &self.rotation.credentials {
            if !seen.insert(credential.key.as_str()) {
                bail!("rotation credential {} is listed twice", credential.key);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ProvisionerConfig::default();
        assert_eq!(config.store_dir, PathBuf::from(DEFAULT_STORE_DIR));
        assert_eq!(config.certificate.poll_interval(), Duration::from_secs(5));
        assert_eq!(config.certificate.timeout(), Duration::from_secs(120));
        assert_eq!(config.identity.timeout(), Duration::from_secs(10));
        assert_eq!(config.rotation.credentials.len(), 6);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ProvisionerConfig::load(&dir.path().join("absent.toml")).unwrap();
        assert_eq!(config, ProvisionerConfig::default());
    }

    #[test]
    fn test_partial_file_overrides_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
base_domain = "tenants.internal"

[database]
host = "db.internal"
ssl_mode = "require"

[environments.prod]
pods = 80
"#
        )
        .unwrap();

        let config = ProvisionerConfig::load(file.path()).unwrap();
        assert_eq!(config.base_domain, "tenants.internal");
        assert_eq!(config.database.host, "db.internal");
        assert_eq!(config.database.port, 5432);
        assert_eq!(config.database.ssl_mode, SslMode::Require);
        assert_eq!(config.environments.prod.pods, 80);
        assert_eq!(config.environments.prod.limits_memory, "16Gi");
        assert_eq!(config.environments.alpha.pods, 20);
    }

    #[test]
    fn test_validation_rejects_bad_polling() {
        let mut config = ProvisionerConfig::default();
        config.certificate.poll_interval_secs = 0;
        assert!(config.validate().is_err());

        let mut config = ProvisionerConfig::default();
        config.identity.token_timeout_secs = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_duplicate_rotation_keys() {
        let mut config = ProvisionerConfig::default();
        let duplicate = config.rotation.credentials[0].clone();
        config.rotation.credentials.push(duplicate);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_rotation_credentials_parse_from_toml() {
        let config: ProvisionerConfig = toml::from_str(
            r#"
[[rotation.credentials]]
key = "POSTGRES_ADMIN_PASSWORD"
database_role = "postgres"

[[rotation.credentials]]
key = "APP_PASSWORD"
secret = { namespace = "apps", name = "app", key = "password" }
restart = { kind = "Deployment", namespace = "apps", name = "app" }
"#,
        )
        .unwrap();

        assert_eq!(config.rotation.credentials.len(), 2);
        let app = &config.rotation.credentials[1];
        assert_eq!(app.restart.as_ref().unwrap().kind, WorkloadKind::Deployment);
        assert_eq!(app.restart.as_ref().unwrap().to_string(), "deployment apps/app");
    }
}
