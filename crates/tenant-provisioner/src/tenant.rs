//! Tenant and environment identifiers.
//!
//! Every name the provisioner creates (namespaces, database roles, certificate
//! secrets, gateway listeners, store keys) is derived here so that the naming
//! convention lives in exactly one place.

use std::fmt;
use std::str::FromStr;
use std::sync::LazyLock;

use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ProvisionError;

/// Longest tenant name accepted. `<tenant>-alpha-tls` must fit a 63 character DNS label.
pub const MAX_TENANT_LEN: usize = 40;

static TENANT_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-z]([a-z0-9-]*[a-z0-9])?$").expect("tenant pattern is valid")
});

/// An onboarded application, identified by an immutable name.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Tenant(String);

impl Tenant {
    /// Validate and wrap a tenant name.
    ///
    /// # Errors
    ///
    /// Returns [`ProvisionError::InvalidTenant`] if the name is empty, too long, or
    /// contains characters outside lowercase alphanumerics and hyphens.
    pub fn new(name: &str) -> Result<Self, ProvisionError> {
        let invalid = |reason: &str| ProvisionError::InvalidTenant {
            name: name.to_string(),
            reason: reason.to_string(),
        };

        if name.is_empty() {
            return Err(invalid("name must not be empty"));
        }
        if name.len() > MAX_TENANT_LEN {
            return Err(invalid(&format!(
                "name must be at most {MAX_TENANT_LEN} characters"
            )));
        }
        if !TENANT_PATTERN.is_match(name) {
            return Err(invalid(
                "use lowercase letters, digits and hyphens; start with a letter and do not end with a hyphen",
            ));
        }

        Ok(Self(name.to_string()))
    }

    /// The raw tenant name.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Tenant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Tenant {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for Tenant {
    type Error = ProvisionError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(&value)
    }
}

impl From<Tenant> for String {
    fn from(tenant: Tenant) -> Self {
        tenant.0
    }
}

/// Deployment track of a tenant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Environment {
    /// Pre-production track.
    Alpha,
    /// Production track.
    Prod,
}

impl Environment {
    /// Every environment, in provisioning order.
    pub const ALL: [Self; 2] = [Self::Alpha, Self::Prod];

    /// Lowercase name used in resource names.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Alpha => "alpha",
            Self::Prod => "prod",
        }
    }

    /// Pod Security Standard enforced on the environment's namespace.
    #[must_use]
    pub fn pod_security_level(self) -> &'static str {
        match self {
            Self::Alpha => "baseline",
            Self::Prod => "restricted",
        }
    }

    /// Prefix of this environment's keys in a tenant's store record.
    #[must_use]
    pub fn store_prefix(self) -> &'static str {
        match self {
            Self::Alpha => "ALPHA",
            Self::Prod => "PROD",
        }
    }
}

impl fmt::Display for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Environment {
    type Err = ProvisionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "alpha" => Ok(Self::Alpha),
            "prod" => Ok(Self::Prod),
            _ => Err(ProvisionError::InvalidEnvironment(s.to_string())),
        }
    }
}

/// One tenant × environment pair and the names derived from it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TenantEnvironment {
    /// Owning tenant.
    pub tenant: Tenant,
    /// Deployment track.
    pub environment: Environment,
}

impl TenantEnvironment {
    #[must_use]
    pub fn new(tenant: &Tenant, environment: Environment) -> Self {
        Self {
            tenant: tenant.clone(),
            environment,
        }
    }

    /// Namespace name, `<tenant>-<environment>`.
    #[must_use]
    pub fn namespace(&self) -> String {
        format!("{}-{}", self.tenant, self.environment)
    }

    /// Database role name. Matches the namespace to avoid collisions.
    #[must_use]
    pub fn database_user(&self) -> String {
        self.namespace()
    }

    /// Database name. Matches the namespace to avoid collisions.
    #[must_use]
    pub fn database_name(&self) -> String {
        self.namespace()
    }

    /// Externally reachable hostname. Production gets the bare tenant name.
    #[must_use]
    pub fn hostname(&self, base_domain: &str) -> String {
        match self.environment {
            Environment::Prod => format!("{}.{base_domain}", self.tenant),
            Environment::Alpha => format!("{}-alpha.{base_domain}", self.tenant),
        }
    }

    /// Certificate resource name, also used as its TLS secret name.
    #[must_use]
    pub fn certificate_name(&self) -> String {
        format!("{}-tls", self.namespace())
    }

    /// Gateway listener name.
    #[must_use]
    pub fn listener_name(&self) -> String {
        format!("https-{}", self.namespace())
    }

    /// Key of the database password in the tenant's store record.
    #[must_use]
    pub fn password_key(&self) -> String {
        format!("{}_DATABASE_PASSWORD", self.environment.store_prefix())
    }
}

impl fmt::Display for TenantEnvironment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.tenant, self.environment)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_valid_tenant_names() {
        for name in ["acme", "a", "acme-corp", "team42", "x-1-y"] {
            assert!(Tenant::new(name).is_ok(), "{name} should be valid");
        }
    }

    #[test]
    fn test_invalid_tenant_names() {
        for name in ["", "Acme", "1acme", "acme-", "-acme", "acme_corp", "acme.corp", "ac me"] {
            assert!(Tenant::new(name).is_err(), "{name:?} should be rejected");
        }
        let long = "a".repeat(MAX_TENANT_LEN + 1);
        assert!(Tenant::new(&long).is_err());
        assert!(Tenant::new(&"a".repeat(MAX_TENANT_LEN)).is_ok());
    }

    #[test]
    fn test_environment_parsing() {
        assert_eq!("alpha".parse::<Environment>().unwrap(), Environment::Alpha);
        assert_eq!("PROD".parse::<Environment>().unwrap(), Environment::Prod);
        assert!("staging".parse::<Environment>().is_err());
    }

    #[test]
    fn test_derived_names() {
        let tenant = Tenant::new("acme").unwrap();
        let alpha = TenantEnvironment::new(&tenant, Environment::Alpha);
        let prod = TenantEnvironment::new(&tenant, Environment::Prod);

        assert_eq!(alpha.namespace(), "acme-alpha");
        assert_eq!(alpha.database_user(), "acme-alpha");
        assert_eq!(alpha.hostname("apps.example.com"), "acme-alpha.apps.example.com");
        assert_eq!(prod.hostname("apps.example.com"), "acme.apps.example.com");
        assert_eq!(prod.certificate_name(), "acme-prod-tls");
        assert_eq!(prod.listener_name(), "https-acme-prod");
        assert_eq!(alpha.password_key(), "ALPHA_DATABASE_PASSWORD");
    }

    #[test]
    fn test_longest_name_fits_dns_label() {
        let tenant = Tenant::new(&"a".repeat(MAX_TENANT_LEN)).unwrap();
        let target = TenantEnvironment::new(&tenant, Environment::Alpha);
        assert!(target.certificate_name().len() <= 63);
        assert!(target.listener_name().len() <= 63);
    }

    #[test]
    fn test_pod_security_is_stricter_for_prod() {
        assert_eq!(Environment::Alpha.pod_security_level(), "baseline");
        assert_eq!(Environment::Prod.pod_security_level(), "restricted");
    }
}
