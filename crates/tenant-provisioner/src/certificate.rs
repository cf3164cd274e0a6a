//! TLS certificate requests against the shared cert-manager issuer.

use std::fmt;

use kube::api::ObjectMeta;
use tracing::{debug, info, warn};

use crate::cluster::crds::{Certificate, CertificateSpec, IssuerRef};
use crate::cluster::{ClusterApi, ClusterError};
use crate::config::{CertificateConfig, GatewayConfig};
use crate::namespace::{MANAGED_BY, MANAGED_BY_LABEL};
use crate::retry::{poll_until, Clock, PollOutcome};

/// Issuance state at the end of [`CertificateIssuer::ensure_certificate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CertificateStatus {
    /// The TLS secret is populated.
    Ready,
    /// Still issuing when the poll window closed.
    Pending,
    /// The issuer gave up. Needs operator follow-up.
    Failed { reason: String },
}

impl fmt::Display for CertificateStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Ready => f.write_str("ready"),
            Self::Pending => f.write_str("pending"),
            Self::Failed { reason } => write!(f, "failed: {reason}"),
        }
    }
}

/// Result of one certificate request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateOutcome {
    /// Whether this run created the Certificate resource.
    pub created: bool,
    pub status: CertificateStatus,
}

/// Requests certificates in the gateway namespace and waits for issuance.
pub struct CertificateIssuer<'a, C: ClusterApi> {
    cluster: &'a C,
    clock: &'a dyn Clock,
    gateway: &'a GatewayConfig,
    config: &'a CertificateConfig,
}

impl<'a, C: ClusterApi> CertificateIssuer<'a, C> {
    pub fn new(
        cluster: &'a C,
        clock: &'a dyn Clock,
        gateway: &'a GatewayConfig,
        config: &'a CertificateConfig,
    ) -> Self {
        Self {
            cluster,
            clock,
            gateway,
            config,
        }
    }

    fn desired(&self, hostname: &str, secret_name: &str) -> Certificate {
        let mut certificate = Certificate::new(
            secret_name,
            CertificateSpec {
                secret_name: secret_name.to_string(),
                dns_names: vec![hostname.to_string()],
                issuer_ref: IssuerRef {
                    name: self.gateway.issuer.clone(),
                    kind: "ClusterIssuer".to_string(),
                },
            },
        );
        certificate.metadata = ObjectMeta {
            name: Some(secret_name.to_string()),
            namespace: Some(self.gateway.namespace.clone()),
            labels: Some([(MANAGED_BY_LABEL.to_string(), MANAGED_BY.to_string())].into()),
            ..ObjectMeta::default()
        };
        certificate
    }

    /// Request a certificate for `hostname` unless one named `secret_name`
    /// exists, then poll until it is ready, fails, or the window closes.
    ///
    /// Returns within the configured timeout plus one poll interval.
    ///
    /// # Errors
    ///
    /// Returns an error only for cluster API failures. Slow or failed
    /// issuance is reported through [`CertificateStatus`].
    pub async fn ensure_certificate(
        &self,
        hostname: &str,
        secret_name: &str,
    ) -> Result<CertificateOutcome, ClusterError> {
        let namespace = self.gateway.namespace.as_str();

        let created = if self
            .cluster
            .get::<Certificate>(Some(namespace), secret_name)
            .await?
            .is_some()
        {
            debug!(certificate = %secret_name, "Certificate already requested");
            false
        } else {
            match self
                .cluster
                .create(Some(namespace), &self.desired(hostname, secret_name))
                .await
            {
                Ok(_) => {
                    info!(certificate = %secret_name, hostname = %hostname, "Requested certificate");
                    true
                }
                Err(ClusterError::AlreadyExists { .. }) => false,
                Err(e) => return Err(e),
            }
        };

        let outcome = poll_until(
            self.clock,
            self.config.poll_interval(),
            self.config.timeout(),
            || async {
                let current = self
                    .cluster
                    .get::<Certificate>(Some(namespace), secret_name)
                    .await?;
                let status = current.and_then(|c| c.status).unwrap_or_default();
                if status.is_ready() {
                    return Ok::<_, ClusterError>(Some(CertificateStatus::Ready));
                }
                Ok(status
                    .failure()
                    .map(|reason| CertificateStatus::Failed { reason }))
            },
        )
        .await?;

        let status = match outcome {
            PollOutcome::Ready(status) => status,
            PollOutcome::TimedOut => CertificateStatus::Pending,
        };
        match &status {
            CertificateStatus::Ready => info!(certificate = %secret_name, "Certificate ready"),
            CertificateStatus::Pending => warn!(
                certificate = %secret_name,
                waited_secs = self.config.timeout_secs,
                "Certificate still issuing"
            ),
            CertificateStatus::Failed { reason } => {
                warn!(certificate = %secret_name, reason = %reason, "Certificate issuance failed");
            }
        }

        Ok(CertificateOutcome { created, status })
    }
}
