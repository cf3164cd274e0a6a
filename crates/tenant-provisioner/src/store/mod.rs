//! Credential store.
//!
//! The store holds every secret the provisioner generates: infrastructure-wide
//! credentials, per-tenant database passwords, rendered kubeconfig bundles and
//! the cluster CA. Components receive it as a [`CredentialStore`] trait object;
//! [`FileStore`] is the production adapter and [`MemoryStore`] backs tests.

mod file;
mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use rand::distributions::Alphanumeric;
use rand::Rng;
use thiserror::Error;

use crate::tenant::{Environment, Tenant, TenantEnvironment};

pub use file::FileStore;
pub use memory::MemoryStore;

/// Length of every generated password.
pub const PASSWORD_LENGTH: usize = 32;

/// A key/value record.
pub type Record = BTreeMap<String, String>;

/// Errors raised by credential store adapters.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("credential store I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed record {path} at line {line}: {message}")]
    Malformed {
        path: PathBuf,
        line: usize,
        message: String,
    },

    #[error("invalid entry '{key}': {reason}")]
    InvalidEntry { key: String, reason: String },

    #[error("credential store is locked by pid {holder} ({path})")]
    Locked { path: PathBuf, holder: String },

    #[error("{path} is accessible by other users (mode {mode:o})")]
    InsecurePermissions { path: PathBuf, mode: u32 },
}

/// A key/value record domain.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RecordDomain {
    /// Infrastructure-wide credentials (database admin, identity provider, metrics).
    Infrastructure,
    /// Secrets of one onboarded tenant, keyed per environment.
    Tenant(Tenant),
}

impl fmt::Display for RecordDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Infrastructure => f.write_str("infrastructure"),
            Self::Tenant(tenant) => write!(f, "tenant {tenant}"),
        }
    }
}

/// A stored file artifact.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Artifact {
    /// PEM bundle of the cluster certificate authority.
    ClusterCa,
    /// CI/CD kubeconfig of one tenant × environment.
    Kubeconfig {
        tenant: Tenant,
        environment: Environment,
    },
}

impl Artifact {
    /// Kubeconfig artifact for a tenant × environment.
    #[must_use]
    pub fn kubeconfig(target: &TenantEnvironment) -> Self {
        Self::Kubeconfig {
            tenant: target.tenant.clone(),
            environment: target.environment,
        }
    }

    /// File name the artifact is stored and exported under.
    #[must_use]
    pub fn file_name(&self) -> String {
        match self {
            Self::ClusterCa => "cluster-ca.crt".to_string(),
            Self::Kubeconfig {
                tenant,
                environment,
            } => format!("{tenant}-{environment}.kubeconfig"),
        }
    }
}

impl fmt::Display for Artifact {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ClusterCa => f.write_str("cluster CA certificate"),
            Self::Kubeconfig {
                tenant,
                environment,
            } => write!(f, "kubeconfig {tenant}/{environment}"),
        }
    }
}

/// Holds the store's advisory lock until dropped.
#[must_use = "the lock is released when the guard is dropped"]
pub struct StoreLock {
    release: Option<Box<dyn FnOnce() + Send>>,
}

impl StoreLock {
    pub(crate) fn new(release: impl FnOnce() + Send + 'static) -> Self {
        Self {
            release: Some(Box::new(release)),
        }
    }
}

impl Drop for StoreLock {
    fn drop(&mut self) {
        if let Some(release) = self.release.take() {
            release();
        }
    }
}

impl fmt::Debug for StoreLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreLock").finish_non_exhaustive()
    }
}

/// Persistent secret storage shared by every component.
///
/// Records are always rewritten whole. Callers that read, modify and write a
/// record must hold [`CredentialStore::lock`] for the duration.
pub trait CredentialStore: Send + Sync {
    /// Read a whole record, `None` if it was never written.
    ///
    /// # Errors
    ///
    /// Returns an error if the record exists but cannot be read or parsed.
    fn read_record(&self, domain: &RecordDomain) -> Result<Option<Record>, StoreError>;

    /// Replace a whole record atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if an entry is invalid or the write fails.
    fn write_record(&self, domain: &RecordDomain, record: &Record) -> Result<(), StoreError>;

    /// Read an artifact's bytes, `None` if absent.
    ///
    /// # Errors
    ///
    /// Returns an error if the artifact exists but cannot be read.
    fn read_artifact(&self, artifact: &Artifact) -> Result<Option<Vec<u8>>, StoreError>;

    /// Replace an artifact atomically.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    fn write_artifact(&self, artifact: &Artifact, contents: &[u8]) -> Result<(), StoreError>;

    /// Tenants that have a record.
    ///
    /// # Errors
    ///
    /// Returns an error if the store cannot be listed.
    fn list_tenants(&self) -> Result<Vec<Tenant>, StoreError>;

    /// Acquire the advisory lock guarding read-modify-write cycles.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Locked`] if another invocation holds it.
    fn lock(&self) -> Result<StoreLock, StoreError>;

    /// Check that a subsequent write would succeed, without modifying anything.
    ///
    /// # Errors
    ///
    /// Returns an error if the store is not writable.
    fn preflight(&self) -> Result<(), StoreError> {
        Ok(())
    }

    /// Read a single value.
    ///
    /// # Errors
    ///
    /// Propagates [`CredentialStore::read_record`] errors.
    fn get(&self, domain: &RecordDomain, key: &str) -> Result<Option<String>, StoreError> {
        Ok(self
            .read_record(domain)?
            .and_then(|mut record| record.remove(key)))
    }

    /// Set a single value, creating the record if needed.
    ///
    /// # Errors
    ///
    /// Propagates read and write errors.
    fn set(&self, domain: &RecordDomain, key: &str, value: &str) -> Result<(), StoreError> {
        let mut record = self.read_record(domain)?.unwrap_or_default();
        record.insert(key.to_string(), value.to_string());
        self.write_record(domain, &record)
    }
}

/// Generate a fresh password: 32 alphanumeric characters, safe in URLs and SQL literals.
#[must_use]
pub fn generate_password() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(PASSWORD_LENGTH)
        .map(char::from)
        .collect()
}

/// Generate a password guaranteed to differ from `previous`.
#[must_use]
pub fn generate_password_unlike(previous: Option<&str>) -> String {
    loop {
        let candidate = generate_password();
        if Some(candidate.as_str()) != previous {
            return candidate;
        }
    }
}

/// Reject keys and values the record format cannot represent.
pub(crate) fn validate_entry(key: &str, value: &str) -> Result<(), StoreError> {
    let invalid = |reason: &str| StoreError::InvalidEntry {
        key: key.to_string(),
        reason: reason.to_string(),
    };

    if key.is_empty() {
        return Err(invalid("key must not be empty"));
    }
    if !key
        .chars()
        .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(invalid("key must be upper-case letters, digits and underscores"));
    }
    if value.contains(['\n', '\r']) {
        return Err(invalid("value must be a single line"));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_passwords_are_alphanumeric() {
        let password = generate_password();
        assert_eq!(password.len(), PASSWORD_LENGTH);
        assert!(password.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn test_generated_passwords_are_fresh() {
        let first = generate_password();
        let second = generate_password_unlike(Some(&first));
        assert_ne!(first, second);
    }

    #[test]
    fn test_entry_validation() {
        assert!(validate_entry("POSTGRES_ADMIN_PASSWORD", "abc").is_ok());
        assert!(validate_entry("lower", "abc").is_err());
        assert!(validate_entry("", "abc").is_err());
        assert!(validate_entry("KEY", "multi\nline").is_err());
    }

    #[test]
    fn test_artifact_file_names() {
        let tenant = Tenant::new("acme").unwrap();
        let artifact = Artifact::kubeconfig(&TenantEnvironment::new(&tenant, Environment::Prod));
        assert_eq!(artifact.file_name(), "acme-prod.kubeconfig");
        assert_eq!(Artifact::ClusterCa.file_name(), "cluster-ca.crt");
    }

    #[test]
    fn test_default_get_and_set() {
        let store = MemoryStore::new();
        let domain = RecordDomain::Infrastructure;
        assert_eq!(store.get(&domain, "KEY").unwrap(), None);
        store.set(&domain, "KEY", "value").unwrap();
        store.set(&domain, "OTHER", "x").unwrap();
        assert_eq!(store.get(&domain, "KEY").unwrap().as_deref(), Some("value"));
        assert_eq!(store.read_record(&domain).unwrap().unwrap().len(), 2);
    }
}
