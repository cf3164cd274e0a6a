//! tenantctl - tenant onboarding for a shared Kubernetes cluster.
//!
//! Provisions per-tenant namespaces, databases, CI/CD identities and TLS,
//! rotates infrastructure credentials, and exports stored secrets.

// Allow async functions that don't use await (uniform command signatures)
#![allow(clippy::unused_async)]

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand, ValueEnum};
use tenant_provisioner::config::DEFAULT_CONFIG_PATH;
use tenant_provisioner::report::{EXIT_PARTIAL, EXIT_VALIDATION};
use tenant_provisioner::rotation::RotationError;
use tenant_provisioner::{ui, ErrorClass, ProvisionError, ProvisionerConfig};
use tracing::error;
use tracing_subscriber::EnvFilter;

mod commands;

use commands::export::{ExportCertCommand, ExportKubeconfigCommand};
use commands::onboard::OnboardCommand;
use commands::rotate::RotateCommand;
use commands::show::ShowCommand;
use commands::{Context, OutputFormat};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Tenant provisioner for a shared Kubernetes cluster.
#[derive(Parser)]
#[command(
    name = "tenantctl",
    version,
    about = "Onboard tenants onto the shared cluster",
    long_about = "Provision isolated tenant environments on a shared cluster.\n\n\
                  Each tenant gets alpha and prod namespaces with quotas, a database\n\
                  per environment, a CI/CD service identity and a TLS listener on the\n\
                  shared gateway.\n\n\
                  All operations are idempotent - re-running onboard converges\n\
                  without duplicating anything."
)]
#[command(propagate_version = true)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Log line format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    log_format: LogFormat,

    /// Configuration file. Missing means defaults.
    #[arg(long, global = true, env = "TENANTCTL_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Override the credential store directory.
    #[arg(long, global = true)]
    store_dir: Option<PathBuf>,

    /// Path to kubeconfig file. Defaults to in-cluster or ~/.kube/config.
    #[arg(long, global = true, env = "KUBECONFIG")]
    kubeconfig: Option<PathBuf>,

    /// Result format.
    #[arg(long, global = true, value_enum, default_value = "text")]
    output: OutputFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Onboard a tenant into the alpha and prod environments.
    Onboard(OnboardCommand),

    /// Rotate infrastructure credentials.
    ///
    /// Changes database role passwords in one transaction, stores the new
    /// values, then updates dependent Secrets and restarts their workloads.
    Rotate(RotateCommand),

    /// Print stored credentials.
    Show(ShowCommand),

    /// Export the cluster CA certificate.
    ExportCert(ExportCertCommand),

    /// Export a tenant environment's CI/CD kubeconfig.
    ExportKubeconfig(ExportKubeconfigCommand),
}

fn init_tracing(verbose: bool, format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,tenant_provisioner=debug,tenantctl=debug")
        } else {
            EnvFilter::new("warn,tenant_provisioner=info,tenantctl=info")
        }
    });

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

/// Exit code for an error that stopped a command.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(rotation) = err.downcast_ref::<RotationError>() {
        return rotation.exit_code();
    }
    match err.downcast_ref::<ProvisionError>().map(ProvisionError::class) {
        Some(ErrorClass::Validation) | None => EXIT_VALIDATION,
        Some(_) => EXIT_PARTIAL,
    }
}

async fn run(cli: Cli) -> Result<i32> {
    let mut config = ProvisionerConfig::load(&cli.config)
        .with_context(|| format!("Failed to load configuration from {}", cli.config.display()))?;
    if let Some(store_dir) = cli.store_dir {
        config.store_dir = store_dir;
    }

    let ctx = Context {
        config,
        kubeconfig: cli.kubeconfig,
        output: cli.output,
    };

    match cli.command {
        Commands::Onboard(cmd) => cmd.run(&ctx).await,
        Commands::Rotate(cmd) => cmd.run(&ctx).await,
        Commands::Show(cmd) => cmd.run(&ctx).await,
        Commands::ExportCert(cmd) => cmd.run(&ctx).await,
        Commands::ExportKubeconfig(cmd) => cmd.run(&ctx).await,
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose, cli.log_format);

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            error!(error = %e, "Command failed");
            ui::print_error(&format!("{e:#}"));
            exit_code_for(&e)
        }
    };
    ExitCode::from(u8::try_from(code).unwrap_or(1))
}
