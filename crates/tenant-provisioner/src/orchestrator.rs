//! Tenant onboarding orchestration.
//!
//! [`Provisioner::onboard`] runs, for each environment, namespace → database →
//! service identity, then for each hostname gateway precondition →
//! certificate → listener. Hostname work lives in the gateway namespace and
//! runs whatever happened to the environment. Completed steps are never
//! rolled back; what happens after a failure is decided by [`failure_policy`].

use tracing::{error, info, instrument, warn};

use crate::certificate::{CertificateIssuer, CertificateOutcome, CertificateStatus};
use crate::cluster::ClusterApi;
use crate::config::ProvisionerConfig;
use crate::database::{admin_credential, DatabaseEngine, DatabaseProvisioner};
use crate::error::{ErrorClass, ProvisionError};
use crate::gateway::{check_http_listener, ensure_listener, GatewayRef, ListenerStatus};
use crate::identity::AccessManager;
use crate::namespace::ensure_namespace;
use crate::report::{failure_policy, outcome_class, FailurePolicy, Report, Step, StepStatus};
use crate::retry::Clock;
use crate::rotation::{RotationError, RotationReport, Rotator};
use crate::store::CredentialStore;
use crate::tenant::{Environment, Tenant, TenantEnvironment};

pub use crate::export::{export_cert, export_kubeconfig, show};

type StepResult = Result<(StepStatus, Option<String>), ProvisionError>;

/// Record a step result and return what to do next.
fn record(
    report: &mut Report,
    step: Step,
    environment: Environment,
    result: StepResult,
) -> FailurePolicy {
    let (status, detail) = match result {
        Ok(outcome) => outcome,
        Err(e) => {
            error!(
                step = %step,
                environment = %environment,
                class = ?e.class(),
                error = %e,
                "Step failed"
            );
            (StepStatus::Failed, Some(e.to_string()))
        }
    };
    if outcome_class(step, status) == Some(ErrorClass::Soft) {
        warn!(
            step = %step,
            environment = %environment,
            status = %status,
            detail = detail.as_deref().unwrap_or_default(),
            "Step incomplete"
        );
    }
    report.record(step, environment, status, detail);
    failure_policy(step, status)
}

fn skip(report: &mut Report, environment: Environment, steps: &[Step]) {
    for step in steps {
        report.record(*step, environment, StepStatus::Skipped, None);
    }
}

fn certificate_step(outcome: &CertificateOutcome) -> (StepStatus, Option<String>) {
    match &outcome.status {
        CertificateStatus::Ready if outcome.created => (StepStatus::Created, None),
        CertificateStatus::Ready => (StepStatus::NoOp, None),
        CertificateStatus::Pending => (
            StepStatus::Pending,
            Some("still issuing, the listener serves it once ready".to_string()),
        ),
        CertificateStatus::Failed { reason } => (StepStatus::Failed, Some(reason.clone())),
    }
}

/// Drives onboarding and rotation against injected collaborators.
pub struct Provisioner<'a, C: ClusterApi> {
    cluster: &'a C,
    database: &'a dyn DatabaseEngine,
    store: &'a dyn CredentialStore,
    clock: &'a dyn Clock,
    config: &'a ProvisionerConfig,
}

impl<'a, C: ClusterApi> Provisioner<'a, C> {
    pub fn new(
        cluster: &'a C,
        database: &'a dyn DatabaseEngine,
        store: &'a dyn CredentialStore,
        clock: &'a dyn Clock,
        config: &'a ProvisionerConfig,
    ) -> Self {
        Self {
            cluster,
            database,
            store,
            clock,
            config,
        }
    }

    fn gateway(&self) -> GatewayRef {
        GatewayRef {
            namespace: self.config.gateway.namespace.clone(),
            name: self.config.gateway.name.clone(),
        }
    }

    /// Onboard a tenant into every environment.
    ///
    /// # Errors
    ///
    /// Returns an error only when nothing was attempted: the store is locked
    /// or the database admin credential is missing. Step failures are
    /// recorded in the report.
    #[instrument(skip(self), fields(tenant = %tenant))]
    pub async fn onboard(&self, tenant: &Tenant) -> Result<Report, ProvisionError> {
        let _lock = self.store.lock()?;
        admin_credential(self.store, &self.config.database)?;

        let mut report = Report::new(tenant.clone());
        let targets: Vec<_> = Environment::ALL
            .into_iter()
            .map(|environment| TenantEnvironment::new(tenant, environment))
            .collect();
        for target in &targets {
            self.provision_environment(target, &mut report).await;
        }
        for target in &targets {
            self.expose_hostname(target, &mut report).await;
        }

        if report.is_success() {
            info!("Tenant onboarded");
        } else {
            warn!("Tenant onboarded with incomplete steps");
        }
        Ok(report)
    }

    /// Namespace, database and service identity.
    async fn provision_environment(&self, target: &TenantEnvironment, report: &mut Report) {
        let environment = target.environment;
        let profile = self.config.environments.for_environment(environment);
        info!(environment = %environment, namespace = %target.namespace(), "Provisioning environment");

        let namespace = ensure_namespace(self.cluster, target, profile)
            .await
            .map(|applied| (StepStatus::from(applied), None))
            .map_err(ProvisionError::from);
        if record(report, Step::Namespace, environment, namespace) == FailurePolicy::AbortEnvironment
        {
            skip(report, environment, &[Step::Database, Step::ServiceIdentity]);
            return;
        }

        let database = DatabaseProvisioner::new(
            self.database,
            self.store,
            self.cluster,
            &self.config.database,
        )
        .ensure_database(target)
        .await
        .map(|outcome| {
            let detail = outcome.rotated.then(|| "new password generated".to_string());
            (StepStatus::from(outcome.applied), detail)
        });
        if record(report, Step::Database, environment, database) == FailurePolicy::AbortEnvironment {
            skip(report, environment, &[Step::ServiceIdentity]);
            return;
        }

        let identity = AccessManager::new(self.cluster, self.store, self.clock, &self.config.identity)
            .ensure_service_identity(target)
            .await
            .map(|identity| (StepStatus::from(identity.applied), None));
        record(report, Step::ServiceIdentity, environment, identity);
    }

    /// Gateway precondition, certificate and listener for one hostname.
    async fn expose_hostname(&self, target: &TenantEnvironment, report: &mut Report) {
        let environment = target.environment;
        let hostname = target.hostname(&self.config.base_domain);
        let gateway = self.gateway();
        info!(environment = %environment, hostname = %hostname, "Exposing hostname");

        let precondition = check_http_listener(self.cluster, &gateway, &hostname)
            .await
            .map(|()| (StepStatus::NoOp, None));
        if record(report, Step::GatewayPrecondition, environment, precondition)
            == FailurePolicy::SkipHostname
        {
            skip(report, environment, &[Step::Certificate, Step::Listener]);
            return;
        }

        let secret_name = target.certificate_name();
        let certificate = CertificateIssuer::new(
            self.cluster,
            self.clock,
            &self.config.gateway,
            &self.config.certificate,
        )
        .ensure_certificate(&hostname, &secret_name)
        .await
        .map(|outcome| certificate_step(&outcome))
        .map_err(ProvisionError::from);
        if record(report, Step::Certificate, environment, certificate) == FailurePolicy::SkipListener
        {
            skip(report, environment, &[Step::Listener]);
            return;
        }

        let listener = ensure_listener(
            self.cluster,
            &gateway,
            &target.listener_name(),
            &hostname,
            &secret_name,
        )
        .await
        .map(|status| match status {
            ListenerStatus::Added => (StepStatus::Created, None),
            ListenerStatus::AlreadyPresent => (StepStatus::NoOp, None),
        })
        .map_err(ProvisionError::from);
        record(report, Step::Listener, environment, listener);
    }

    /// Rotate the configured infrastructure credentials.
    ///
    /// # Errors
    ///
    /// See [`Rotator::rotate`].
    pub async fn rotate(&self) -> Result<RotationReport, RotationError> {
        Rotator::new(self.cluster, self.database, self.store, self.config)
            .rotate()
            .await
    }
}
