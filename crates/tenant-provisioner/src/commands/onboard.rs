//! Onboard command - provision a tenant in every environment.

use anyhow::Result;
use clap::Args;
use tenant_provisioner::retry::TokioClock;
use tenant_provisioner::{ui, Provisioner, Tenant};
use tracing::info;

use super::{Context, OutputFormat};

/// Provision namespaces, databases, CI/CD access and TLS for a tenant.
#[derive(Args)]
pub struct OnboardCommand {
    /// Tenant name (lowercase letters, digits and hyphens).
    tenant: String,
}

impl OnboardCommand {
    /// Run the onboard command. Returns the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant name is invalid, a prerequisite is
    /// missing, or the store or cluster cannot be opened.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let tenant = Tenant::new(&self.tenant)?;
        let store = ctx.open_store()?;
        let cluster = ctx.connect_cluster().await?;
        let database = ctx.database();
        let clock = TokioClock;

        if ctx.output == OutputFormat::Text {
            ui::print_section(&format!("Onboarding {tenant}"));
            ui::print_kv("Base domain", &ctx.config.base_domain);
            ui::print_kv(
                "Gateway",
                &format!("{}/{}", ctx.config.gateway.namespace, ctx.config.gateway.name),
            );
        }
        info!(tenant = %tenant, "Starting onboarding");

        let report = Provisioner::new(&cluster, &database, &store, &clock, &ctx.config)
            .onboard(&tenant)
            .await?;

        match ctx.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => ui::print_report(&report),
        }
        Ok(report.exit_code())
    }
}
