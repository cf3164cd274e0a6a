//! Show command - print stored credentials to stdout.

use anyhow::Result;
use clap::Args;
use tenant_provisioner::{export, Tenant};

use super::{Context, OutputFormat};

/// Print infrastructure credentials, or a tenant's record with --tenant.
#[derive(Args)]
pub struct ShowCommand {
    /// Only keys of this service (e.g. grafana, keycloak).
    service: Option<String>,

    /// Print this tenant's record instead.
    #[arg(long)]
    tenant: Option<String>,
}

impl ShowCommand {
    /// Run the show command.
    ///
    /// # Errors
    ///
    /// Returns an error if the tenant name is invalid or the record is missing.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let tenant = self.tenant.as_deref().map(Tenant::new).transpose()?;
        let store = ctx.open_store()?;
        let record = export::show(&store, self.service.as_deref(), tenant.as_ref())?;

        match ctx.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&record)?),
            OutputFormat::Text => {
                for (key, value) in &record {
                    println!("{key}={value}");
                }
            }
        }
        Ok(0)
    }
}
