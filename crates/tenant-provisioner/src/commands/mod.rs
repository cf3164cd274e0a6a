//! tenantctl subcommands.

pub mod export;
pub mod onboard;
pub mod rotate;
pub mod show;

use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::ValueEnum;
use tenant_provisioner::cluster::KubeCluster;
use tenant_provisioner::database::PostgresEngine;
use tenant_provisioner::store::FileStore;
use tenant_provisioner::ProvisionerConfig;

/// How results are printed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum OutputFormat {
    #[default]
    Text,
    Json,
}

/// State shared by every subcommand.
pub struct Context {
    pub config: ProvisionerConfig,
    pub kubeconfig: Option<PathBuf>,
    pub output: OutputFormat,
}

impl Context {
    pub fn open_store(&self) -> Result<FileStore> {
        FileStore::open(&self.config.store_dir).with_context(|| {
            format!(
                "Failed to open credential store at {}",
                self.config.store_dir.display()
            )
        })
    }

    pub async fn connect_cluster(&self) -> Result<KubeCluster> {
        KubeCluster::connect(self.kubeconfig.as_deref(), self.config.retry.clone())
            .await
            .context("Failed to connect to the cluster API")
    }

    pub fn database(&self) -> PostgresEngine {
        PostgresEngine::new(&self.config.database, self.config.retry.clone())
    }
}
