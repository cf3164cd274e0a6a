//! Third-party resource kinds the provisioner writes: cert-manager
//! `Certificate` and Gateway API `Gateway`.
//!
//! Only the fields the provisioner reads or sets are modelled.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(group = "cert-manager.io", version = "v1", kind = "Certificate")]
#[kube(namespaced)]
#[kube(status = "IssuanceStatus")]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    pub secret_name: String,
    pub dns_names: Vec<String>,
    pub issuer_ref: IssuerRef,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct IssuerRef {
    pub name: String,
    pub kind: String,
}

#[derive(Deserialize, Serialize, Clone, Debug, Default, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IssuanceStatus {
    #[serde(default)]
    pub conditions: Vec<CertificateCondition>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_failure_time: Option<String>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct CertificateCondition {
    #[serde(rename = "type")]
    pub type_: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl IssuanceStatus {
    fn condition(&self, type_: &str) -> Option<&CertificateCondition> {
        self.conditions.iter().find(|c| c.type_ == type_)
    }

    /// Whether the issuer reports the certificate as issued.
    #[must_use]
    pub fn is_ready(&self) -> bool {
        self.condition("Ready").is_some_and(|c| c.status == "True")
    }

    /// Failure reported by the issuer, if issuance has definitively failed.
    #[must_use]
    pub fn failure(&self) -> Option<String> {
        let failed = self
            .conditions
            .iter()
            .find(|c| (c.type_ == "Issuing" || c.type_ == "Ready") && c.reason.as_deref() == Some("Failed"));

        match (failed, &self.last_failure_time) {
            (Some(condition), _) => Some(
                condition
                    .message
                    .clone()
                    .unwrap_or_else(|| format!("{} condition reports Failed", condition.type_)),
            ),
            (None, Some(at)) => Some(
                self.condition("Ready")
                    .and_then(|c| c.message.clone())
                    .unwrap_or_else(|| format!("issuance failed at {at}")),
            ),
            (None, None) => None,
        }
    }
}

#[derive(CustomResource, Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[kube(group = "gateway.networking.k8s.io", version = "v1", kind = "Gateway")]
#[kube(namespaced)]
#[serde(rename_all = "camelCase")]
pub struct GatewaySpec {
    pub gateway_class_name: String,
    #[serde(default)]
    pub listeners: Vec<Listener>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Listener {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    pub port: u16,
    pub protocol: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<ListenerTls>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_routes: Option<Value>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ListenerTls {
    pub mode: String,
    #[serde(default)]
    pub certificate_refs: Vec<CertificateRef>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq)]
pub struct CertificateRef {
    pub kind: String,
    pub name: String,
}

impl Listener {
    /// Whether this listener would accept traffic for `hostname`.
    ///
    /// An absent hostname matches everything; `*.example.com` matches exactly
    /// one extra label.
    #[must_use]
    pub fn serves(&self, hostname: &str) -> bool {
        match self.hostname.as_deref() {
            None => true,
            Some(pattern) if pattern == hostname => true,
            Some(pattern) => pattern.strip_prefix("*.").is_some_and(|suffix| {
                hostname
                    .strip_suffix(suffix)
                    .and_then(|head| head.strip_suffix('.'))
                    .is_some_and(|label| !label.is_empty() && !label.contains('.'))
            }),
        }
    }
}
