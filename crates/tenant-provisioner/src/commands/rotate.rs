//! Rotate command - replace every infrastructure credential.

use anyhow::Result;
use clap::Args;
use tenant_provisioner::retry::TokioClock;
use tenant_provisioner::{ui, Provisioner};

use super::{Context, OutputFormat};

/// Rotate infrastructure credentials without locking services out.
#[derive(Args)]
pub struct RotateCommand {}

impl RotateCommand {
    /// Run the rotate command. Returns the process exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the rotation could not be applied. Rotation errors
    /// are passed through unwrapped so the caller can classify them.
    pub async fn run(&self, ctx: &Context) -> Result<i32> {
        let store = ctx.open_store()?;
        let cluster = ctx.connect_cluster().await?;
        let database = ctx.database();
        let clock = TokioClock;

        if ctx.output == OutputFormat::Text {
            ui::print_step(&format!(
                "Rotating {} credentials",
                ctx.config.rotation.credentials.len()
            ));
        }

        let report = Provisioner::new(&cluster, &database, &store, &clock, &ctx.config)
            .rotate()
            .await?;

        match ctx.output {
            OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
            OutputFormat::Text => ui::print_rotation(&report),
        }
        Ok(report.exit_code())
    }
}
