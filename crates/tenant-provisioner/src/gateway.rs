//! Per-tenant HTTPS listeners on the shared Gateway.
//!
//! Listeners are added with server-side apply under a field manager unique to
//! each listener. The Gateway API declares `spec.listeners` as a list map keyed
//! by `name`, so one tenant's apply neither replaces nor prunes another's entry.

use std::fmt;

use serde_json::json;
use tracing::{debug, info};

use crate::cluster::crds::{CertificateRef, Gateway, Listener, ListenerTls};
use crate::cluster::{ClusterApi, ClusterError};
use crate::error::ProvisionError;

const FIELD_MANAGER_PREFIX: &str = "tenant-provisioner";

/// A Gateway resource by namespace and name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayRef {
    pub namespace: String,
    pub name: String,
}

impl fmt::Display for GatewayRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.namespace, self.name)
    }
}

/// Result of [`ensure_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenerStatus {
    Added,
    AlreadyPresent,
}

/// The HTTPS listener entry for one hostname.
#[must_use]
pub fn https_listener(name: &str, hostname: &str, cert_secret: &str) -> Listener {
    Listener {
        name: name.to_string(),
        hostname: Some(hostname.to_string()),
        port: 443,
        protocol: "HTTPS".to_string(),
        tls: Some(ListenerTls {
            mode: "Terminate".to_string(),
            certificate_refs: vec![CertificateRef {
                kind: "Secret".to_string(),
                name: cert_secret.to_string(),
            }],
        }),
        allowed_routes: Some(json!({"namespaces": {"from": "All"}})),
    }
}

async fn read_gateway<C: ClusterApi>(
    cluster: &C,
    gateway: &GatewayRef,
) -> Result<Gateway, ClusterError> {
    cluster
        .get::<Gateway>(Some(&gateway.namespace), &gateway.name)
        .await?
        .ok_or_else(|| ClusterError::NotFound {
            kind: "Gateway".to_string(),
            name: gateway.to_string(),
        })
}

/// Check that the gateway can serve the HTTP-01 challenge for `hostname`.
///
/// # Errors
///
/// Returns [`ProvisionError::MissingHttpListener`] if no HTTP listener covers
/// the hostname, or a cluster error if the gateway cannot be read.
pub async fn check_http_listener<C: ClusterApi>(
    cluster: &C,
    gateway: &GatewayRef,
    hostname: &str,
) -> Result<(), ProvisionError> {
    let current = read_gateway(cluster, gateway).await?;
    let covered = current
        .spec
        .listeners
        .iter()
        .any(|l| l.protocol.eq_ignore_ascii_case("HTTP") && l.serves(hostname));

    if covered {
        Ok(())
    } else {
        Err(ProvisionError::MissingHttpListener {
            gateway: gateway.to_string(),
            hostname: hostname.to_string(),
        })
    }
}

/// Add an HTTPS listener for `hostname` unless one named `listener_name` exists.
///
/// # Errors
///
/// Returns an error if the gateway is missing or the patch is rejected.
pub async fn ensure_listener<C: ClusterApi>(
    cluster: &C,
    gateway: &GatewayRef,
    listener_name: &str,
    hostname: &str,
    cert_secret: &str,
) -> Result<ListenerStatus, ClusterError> {
    let current = read_gateway(cluster, gateway).await?;
    if current.spec.listeners.iter().any(|l| l.name == listener_name) {
        debug!(gateway = %gateway, listener = %listener_name, "Listener already present");
        return Ok(ListenerStatus::AlreadyPresent);
    }

    let listener = https_listener(listener_name, hostname, cert_secret);
    // Only the new entry: apply merges it into the listener map.
    let patch = json!({
        "apiVersion": "gateway.networking.k8s.io/v1",
        "kind": "Gateway",
        "metadata": {"name": gateway.name, "namespace": gateway.namespace},
        "spec": {
            "gatewayClassName": current.spec.gateway_class_name,
            "listeners": [listener],
        },
    });

    let field_manager = format!("{FIELD_MANAGER_PREFIX}-{listener_name}");
    cluster
        .apply_patch::<Gateway>(Some(&gateway.namespace), &gateway.name, &field_manager, &patch)
        .await?;

    info!(gateway = %gateway, listener = %listener_name, hostname = %hostname, "Added gateway listener");
    Ok(ListenerStatus::Added)
}
