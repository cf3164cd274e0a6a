//! Tenant provisioning for a shared Kubernetes cluster.
//!
//! Onboarding a tenant creates, for each environment, a namespace with quotas,
//! a database with its own role, a CI/CD service identity and an HTTPS
//! listener on the shared gateway backed by an issued certificate. Every step
//! is idempotent. Credentials are kept in a [`store::CredentialStore`].
//!
//! # Example
//!
//! ```ignore
//! use tenant_provisioner::cluster::KubeCluster;
//! use tenant_provisioner::database::PostgresEngine;
//! use tenant_provisioner::retry::TokioClock;
//! use tenant_provisioner::store::FileStore;
//! use tenant_provisioner::{Provisioner, ProvisionerConfig, Tenant};
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = ProvisionerConfig::default();
//!     let store = FileStore::open(&config.store_dir)?;
//!     let cluster = KubeCluster::connect(None, config.retry.clone()).await?;
//!     let database = PostgresEngine::new(&config.database, config.retry.clone());
//!     let report = Provisioner::new(&cluster, &database, &store, &TokioClock, &config)
//!         .onboard(&Tenant::new("acme")?)
//!         .await?;
//!     std::process::exit(report.exit_code());
//! }
//! ```

// Allow product names without backticks in doc comments
#![allow(clippy::doc_markdown)]
// Allow imports after statements in functions
#![allow(clippy::items_after_statements)]

pub mod certificate;
pub mod cluster;
pub mod config;
pub mod database;
pub mod error;
pub mod export;
pub mod gateway;
pub mod identity;
pub mod kubeconfig;
pub mod namespace;
pub mod orchestrator;
pub mod report;
pub mod retry;
pub mod rotation;
pub mod store;
pub mod tenant;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod ui;

// Re-export commonly used types at the crate root
pub use config::ProvisionerConfig;
pub use error::{ErrorClass, ProvisionError};
pub use orchestrator::Provisioner;
pub use report::{Report, Step, StepStatus};
pub use tenant::{Environment, Tenant, TenantEnvironment};
