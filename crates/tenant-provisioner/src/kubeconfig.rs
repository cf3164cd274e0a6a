//! Self-contained kubeconfig rendering for CI/CD service identities.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use kube::config::{AuthInfo, Cluster, Context, Kubeconfig, NamedAuthInfo, NamedCluster, NamedContext};

use crate::error::ProvisionError;

/// Inputs for one kubeconfig. `ca_pem` is the raw PEM bundle.
#[derive(Clone)]
pub struct KubeconfigParams<'a> {
    pub cluster_name: &'a str,
    pub server: &'a str,
    pub ca_pem: &'a [u8],
    pub namespace: &'a str,
    pub user: &'a str,
    pub token: &'a str,
}

/// Render a kubeconfig with one cluster, one user and one context.
///
/// # Errors
///
/// Returns [`ProvisionError::Render`] if serialization fails.
pub fn render(params: &KubeconfigParams<'_>) -> Result<String, ProvisionError> {
    let context = format!("{}@{}", params.user, params.cluster_name);
    let document = Kubeconfig {
        api_version: Some("v1".to_string()),
        kind: Some("Config".to_string()),
        clusters: vec![NamedCluster {
            name: params.cluster_name.to_string(),
            cluster: Some(Cluster {
                server: Some(params.server.to_string()),
                certificate_authority_data: Some(STANDARD.encode(params.ca_pem)),
                ..Cluster::default()
            }),
        }],
        contexts: vec![NamedContext {
            name: context.clone(),
            context: Some(Context {
                cluster: params.cluster_name.to_string(),
                user: Some(params.user.to_string()),
                namespace: Some(params.namespace.to_string()),
                extensions: None,
            }),
        }],
        current_context: Some(context),
        auth_infos: vec![NamedAuthInfo {
            name: params.user.to_string(),
            auth_info: Some(AuthInfo {
                token: Some(params.token.to_string().into()),
                ..AuthInfo::default()
            }),
        }],
        ..Kubeconfig::default()
    };

    serde_yaml::to_string(&document).map_err(|e| ProvisionError::Render(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rendered_kubeconfig_is_self_contained() {
        let rendered = render(&KubeconfigParams {
            cluster_name: "acme-alpha",
            server: "https://10.0.0.1:6443",
            ca_pem: b"-----BEGIN CERTIFICATE-----\nMIIB\n-----END CERTIFICATE-----\n",
            namespace: "acme-alpha",
            user: "ci-deployer",
            token: "tok",
        })
        .unwrap();

        let parsed: serde_yaml::Value = serde_yaml::from_str(&rendered).unwrap();
        assert_eq!(parsed["kind"], "Config");
        assert_eq!(parsed["current-context"], "ci-deployer@acme-alpha");
        assert_eq!(parsed["clusters"][0]["cluster"]["server"], "https://10.0.0.1:6443");
        assert_eq!(parsed["contexts"][0]["context"]["namespace"], "acme-alpha");
        assert_eq!(parsed["users"][0]["user"]["token"], "tok");

        let ca = parsed["clusters"][0]["cluster"]["certificate-authority-data"]
            .as_str()
            .unwrap();
        let decoded = STANDARD.decode(ca).unwrap();
        assert!(decoded.starts_with(b"-----BEGIN CERTIFICATE-----"));
    }

    #[test]
    fn test_rendered_kubeconfig_loads_as_kube_config() {
        let rendered = render(&KubeconfigParams {
            cluster_name: "acme-prod",
            server: "https://k8s.example.com",
            ca_pem: b"ca",
            namespace: "acme-prod",
            user: "ci-deployer",
            token: "tok",
        })
        .unwrap();

        let config = Kubeconfig::from_yaml(&rendered).unwrap();
        assert_eq!(config.current_context.as_deref(), Some("ci-deployer@acme-prod"));
        assert_eq!(config.clusters.len(), 1);
        assert_eq!(config.auth_infos[0].name, "ci-deployer");
    }
}
