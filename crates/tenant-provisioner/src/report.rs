//! Onboarding report and the step failure policy.

use std::fmt;

use serde::Serialize;

use crate::cluster::Applied;
use crate::error::ErrorClass;
use crate::tenant::{Environment, Tenant};

/// Exit code for a fully successful run.
pub const EXIT_OK: i32 = 0;
/// Exit code for validation or prerequisite errors.
pub const EXIT_VALIDATION: i32 = 1;
/// Exit code when some steps did not complete.
pub const EXIT_PARTIAL: i32 = 2;

/// One onboarding step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Step {
    Namespace,
    Database,
    ServiceIdentity,
    GatewayPrecondition,
    Certificate,
    Listener,
}

impl Step {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Namespace => "namespace",
            Self::Database => "database",
            Self::ServiceIdentity => "service-identity",
            Self::GatewayPrecondition => "gateway-precondition",
            Self::Certificate => "certificate",
            Self::Listener => "listener",
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StepStatus {
    Created,
    Updated,
    /// Already in the desired state.
    NoOp,
    /// Started but not finished within the wait window.
    Pending,
    Failed,
    /// Not attempted because an earlier step failed.
    Skipped,
}

impl StepStatus {
    /// Whether the step reached its desired state.
    #[must_use]
    pub fn is_ok(self) -> bool {
        matches!(self, Self::Created | Self::Updated | Self::NoOp)
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::NoOp => "no-op",
            Self::Pending => "pending",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        }
    }
}

impl From<Applied> for StepStatus {
    fn from(applied: Applied) -> Self {
        match applied {
            Applied::Created => Self::Created,
            Applied::Updated => Self::Updated,
            Applied::Unchanged => Self::NoOp,
        }
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the orchestrator does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailurePolicy {
    Continue,
    /// Skip the environment's remaining provisioning steps.
    AbortEnvironment,
    /// Skip certificate and listener for this hostname.
    SkipHostname,
    /// Skip only the listener for this hostname.
    SkipListener,
}

/// The failure policy table.
#[must_use]
pub fn failure_policy(step: Step, status: StepStatus) -> FailurePolicy {
    match (step, status) {
        (Step::Namespace | Step::Database | Step::ServiceIdentity, StepStatus::Failed) => {
            FailurePolicy::AbortEnvironment
        }
        (Step::GatewayPrecondition, StepStatus::Failed) => FailurePolicy::SkipHostname,
        (Step::Certificate, StepStatus::Failed) => FailurePolicy::SkipListener,
        // A pending certificate still gets its listener: the gateway picks
        // the secret up once issued.
        _ => FailurePolicy::Continue,
    }
}

/// Error class of an incomplete step. `None` when the step reached its
/// desired state or was skipped.
#[must_use]
pub fn outcome_class(step: Step, status: StepStatus) -> Option<ErrorClass> {
    match (step, status) {
        (_, s) if s.is_ok() || s == StepStatus::Skipped => None,
        (Step::Certificate, _) => Some(ErrorClass::Soft),
        (_, StepStatus::Pending) => Some(ErrorClass::Soft),
        _ => Some(ErrorClass::Hard),
    }
}

/// One row of the summary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepOutcome {
    pub step: Step,
    pub environment: Environment,
    pub status: StepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Everything one `onboard` run did.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub tenant: Tenant,
    pub outcomes: Vec<StepOutcome>,
}

impl Report {
    #[must_use]
    pub fn new(tenant: Tenant) -> Self {
        Self {
            tenant,
            outcomes: Vec::new(),
        }
    }

    pub fn record(
        &mut self,
        step: Step,
        environment: Environment,
        status: StepStatus,
        detail: Option<String>,
    ) {
        self.outcomes.push(StepOutcome {
            step,
            environment,
            status,
            detail,
        });
    }

    /// Outcome of `step` in `environment`, if it was recorded.
    #[must_use]
    pub fn outcome(&self, step: Step, environment: Environment) -> Option<&StepOutcome> {
        self.outcomes
            .iter()
            .find(|o| o.step == step && o.environment == environment)
    }

    /// Whether every recorded step reached its desired state.
    #[must_use]
    pub fn is_success(&self) -> bool {
        self.outcomes.iter().all(|o| o.status.is_ok())
    }

    #[must_use]
    pub fn exit_code(&self) -> i32 {
        if self.is_success() {
            EXIT_OK
        } else {
            EXIT_PARTIAL
        }
    }
}
