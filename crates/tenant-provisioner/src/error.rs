//! Provisioning errors and their classification.

use std::path::PathBuf;

use thiserror::Error;

use crate::cluster::ClusterError;
use crate::database::DatabaseError;
use crate::store::StoreError;

/// How the orchestrator treats an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Bad input or missing prerequisite. Fatal before any side effect.
    Validation,
    /// Infrastructure temporarily unavailable. Retried at the call site.
    Transient,
    /// Recorded and reported, the run continues.
    Soft,
    /// Aborts the current environment's remaining steps.
    Hard,
    /// Stored and live credentials could diverge.
    RotationInvariant,
}

/// Errors raised by the provisioning components.
#[derive(Debug, Error)]
pub enum ProvisionError {
    #[error("invalid tenant name '{name}': {reason}")]
    InvalidTenant { name: String, reason: String },

    #[error("unknown environment '{0}' (expected alpha or prod)")]
    InvalidEnvironment(String),

    #[error("missing prerequisite: {0}")]
    MissingPrerequisite(String),

    #[error(transparent)]
    Cluster(#[from] ClusterError),

    #[error(transparent)]
    Database(#[from] DatabaseError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(
        "token for service account {namespace}/{service_account} not populated after {waited_secs}s"
    )]
    TokenNotPopulated {
        namespace: String,
        service_account: String,
        waited_secs: u64,
    },

    #[error("gateway {gateway} has no HTTP listener able to serve {hostname}")]
    MissingHttpListener { gateway: String, hostname: String },

    #[error("failed to render client configuration: {0}")]
    Render(String),

    #[error("nothing stored for {0}")]
    ArtifactMissing(String),

    #[error("failed to export to {path}: {source}")]
    Export {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ProvisionError {
    /// Classify this error for the orchestrator's failure policy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::InvalidTenant { .. }
            | Self::InvalidEnvironment(_)
            | Self::MissingPrerequisite(_)
            | Self::ArtifactMissing(_) => ErrorClass::Validation,
            Self::Cluster(e) if e.is_transient() => ErrorClass::Transient,
            Self::Database(e) if e.is_transient() => ErrorClass::Transient,
            Self::Store(StoreError::Locked { .. }) => ErrorClass::Validation,
            Self::Cluster(_)
            | Self::Database(_)
            | Self::Store(_)
            | Self::TokenNotPopulated { .. }
            | Self::MissingHttpListener { .. }
            | Self::Render(_)
            | Self::Export { .. } => ErrorClass::Hard,
        }
    }
}
