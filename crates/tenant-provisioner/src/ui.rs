//! Console output for the tenantctl CLI.
//!
//! Nothing here receives secret values. `show` writes records to stdout itself.

use colored::{ColoredString, Colorize};

use crate::report::{Report, StepStatus};
use crate::rotation::{RotationReport, SecretSync};

/// Print a section header.
pub fn print_section(title: &str) {
    println!();
    println!("{}", "═".repeat(70).bright_black());
    println!("{}", title.cyan().bold());
    println!("{}", "═".repeat(70).bright_black());
    println!();
}

/// Print a step indicator with message.
pub fn print_step(message: &str) {
    println!("{} {}", "▶".cyan(), message.bold());
}

/// Print a success message.
pub fn print_success(message: &str) {
    println!("{} {}", "✓".green().bold(), message.green());
}

/// Print a warning message.
pub fn print_warning(message: &str) {
    println!("{} {}", "⚠".yellow().bold(), message.yellow());
}

/// Print an error message.
pub fn print_error(message: &str) {
    eprintln!("{} {}", "✗".red().bold(), message.red());
}

/// Print a key-value pair.
pub fn print_kv(key: &str, value: &str) {
    println!("  {} {}", format!("{key}:").bright_black(), value.green());
}

fn colored_status(status: StepStatus) -> ColoredString {
    let label = format!("{:<8}", status.as_str());
    match status {
        StepStatus::Created | StepStatus::Updated => label.green(),
        StepStatus::NoOp => label.bright_black(),
        StepStatus::Pending => label.yellow(),
        StepStatus::Failed => label.red().bold(),
        StepStatus::Skipped => label.yellow().dimmed(),
    }
}

/// Print the step × environment × outcome summary.
pub fn print_report(report: &Report) {
    print_section(&format!("Onboarding summary: {}", report.tenant));
    println!(
        "  {:<22} {:<12} {:<8}  {}",
        "STEP".bold(),
        "ENVIRONMENT".bold(),
        "STATUS".bold(),
        "DETAIL".bold()
    );
    for outcome in &report.outcomes {
        println!(
            "  {:<22} {:<12} {}  {}",
            outcome.step.as_str(),
            outcome.environment.as_str(),
            colored_status(outcome.status),
            outcome.detail.as_deref().unwrap_or("").bright_black()
        );
    }
    println!();

    if report.is_success() {
        print_success(&format!("Tenant {} onboarded", report.tenant));
    } else {
        print_warning(&format!(
            "Tenant {} onboarded with incomplete steps, re-run onboard once resolved",
            report.tenant
        ));
    }
}

/// Print the outcome of a rotation.
pub fn print_rotation(report: &RotationReport) {
    print_section("Credential rotation");
    for credential in &report.credentials {
        let secret = match credential.secret {
            SecretSync::Synced => "secret synced".green(),
            SecretSync::NotConfigured => "no secret".bright_black(),
            SecretSync::Failed => "secret NOT synced".red(),
        };
        let role = credential
            .database_role
            .as_deref()
            .map(|r| format!("role {r}"))
            .unwrap_or_default();
        println!("  {} {:<32} {:<16} {secret}", "✓".green(), credential.key, role);
    }
    for restart in &report.restarts {
        if restart.restarted {
            println!("  {} restarted {}", "⟳".cyan(), restart.workload);
        } else {
            println!("  {} not restarted {}", "✗".red(), restart.workload);
        }
    }
    println!();

    for warning in &report.warnings {
        print_warning(warning);
    }
    if report.warnings.is_empty() {
        print_success(&format!("Rotated {} credentials", report.credentials.len()));
    }
}
