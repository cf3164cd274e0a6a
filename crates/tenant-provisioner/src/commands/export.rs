//! Export commands - copy stored artifacts out of the credential store.

use std::path::PathBuf;

use anyhow::Result;
use clap::Args;
use tenant_provisioner::{export, ui, Environment, Tenant};

use super::Context;

/// Export the cluster CA certificate.
#[derive(Args)]
pub struct ExportCertCommand {
    /// Destination file or directory.
    dest: PathBuf,
}

impl ExportCertCommand {
    /// Run the export-cert command.
    ///
    /// # Errors
    ///
    /// Returns an error if the certificate was never stored or cannot be written.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let store = ctx.open_store()?;
        let path = export::export_cert(&store, &self.dest)?;
        ui::print_success(&format!("Cluster CA written to {}", path.display()));
        Ok(0)
    }
}

/// Export a tenant environment's CI/CD kubeconfig.
#[derive(Args)]
pub struct ExportKubeconfigCommand {
    /// Tenant name.
    tenant: String,

    /// Environment (alpha or prod).
    environment: String,

    /// Destination file or directory.
    dest: PathBuf,
}

impl ExportKubeconfigCommand {
    /// Run the export-kubeconfig command.
    ///
    /// # Errors
    ///
    /// Returns an error if the arguments are invalid or the kubeconfig was
    /// never stored or cannot be written.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let tenant = Tenant::new(&self.tenant)?;
        let environment: Environment = self.environment.parse()?;
        let store = ctx.open_store()?;
        let path = export::export_kubeconfig(&store, &tenant, environment, &self.dest)?;
        ui::print_success(&format!("Kubeconfig written to {}", path.display()));
        Ok(0)
    }
}
