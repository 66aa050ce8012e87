//! Kubeconfig generation for control-plane components
//!
//! Each kubeconfig embeds the cluster CA and a client certificate issued
//! by it. Files are written only if absent, like every other PKI artifact.

use std::path::{Path, PathBuf};

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::ca::{CertSpec, CertificateAuthority};
use crate::files::{write_if_absent, WriteOutcome, KEY_MODE};
use crate::{PkiError, Result};

/// Cluster name used inside generated kubeconfigs
pub const CLUSTER_NAME: &str = "kubernetes";

/// Admin kubeconfig file name
pub const ADMIN_CONF: &str = "admin.conf";
/// Kubelet kubeconfig file name
pub const KUBELET_CONF: &str = "kubelet.conf";
/// Controller-manager kubeconfig file name
pub const CONTROLLER_MANAGER_CONF: &str = "controller-manager.conf";
/// Scheduler kubeconfig file name
pub const SCHEDULER_CONF: &str = "scheduler.conf";

/// Kubeconfig document
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Kubeconfig {
    /// API version
    pub api_version: String,
    /// Kind (always "Config")
    pub kind: String,
    /// Clusters
    pub clusters: Vec<NamedCluster>,
    /// Users
    pub users: Vec<NamedUser>,
    /// Contexts
    pub contexts: Vec<NamedContext>,
    /// Current context
    pub current_context: String,
}

/// Cluster entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedCluster {
    /// Cluster name
    pub name: String,
    /// Cluster config
    pub cluster: ClusterConfig,
}

/// Cluster configuration
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct ClusterConfig {
    /// API server URL
    pub server: String,
    /// CA certificate (base64 encoded PEM)
    pub certificate_authority_data: String,
}

/// User entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedUser {
    /// User name
    pub name: String,
    /// User config
    pub user: UserConfig,
}

/// Client certificate credentials
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct UserConfig {
    /// Client certificate (base64 encoded PEM)
    pub client_certificate_data: String,
    /// Client key (base64 encoded PEM)
    pub client_key_data: String,
}

/// Context entry
#[derive(Debug, Serialize, Deserialize)]
pub struct NamedContext {
    /// Context name
    pub name: String,
    /// Context config
    pub context: ContextConfig,
}

/// Context configuration
#[derive(Debug, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Cluster name (reference)
    pub cluster: String,
    /// User name (reference)
    pub user: String,
}

/// A kubeconfig to generate: file name plus the client identity inside it
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KubeconfigSpec {
    /// File name inside the kubeconfig directory
    pub file_name: &'static str,
    /// Client certificate identity
    pub client: CertSpec,
}

/// The kubeconfigs every master needs
pub fn control_plane_kubeconfigs(node_name: &str) -> Vec<KubeconfigSpec> {
    vec![
        KubeconfigSpec {
            file_name: ADMIN_CONF,
            client: CertSpec::client("kubernetes-admin").with_organization("system:masters"),
        },
        KubeconfigSpec {
            file_name: KUBELET_CONF,
            client: CertSpec::client(format!("system:node:{}", node_name))
                .with_organization("system:nodes"),
        },
        KubeconfigSpec {
            file_name: CONTROLLER_MANAGER_CONF,
            client: CertSpec::client("system:kube-controller-manager"),
        },
        KubeconfigSpec {
            file_name: SCHEDULER_CONF,
            client: CertSpec::client("system:kube-scheduler"),
        },
    ]
}

/// Build a single-context kubeconfig for `user`
pub fn build_kubeconfig(
    server: &str,
    ca_cert_pem: &str,
    user: &str,
    client_cert_pem: &str,
    client_key_pem: &str,
) -> Kubeconfig {
    let context = format!("{}@{}", user, CLUSTER_NAME);
    Kubeconfig {
        api_version: "v1".to_string(),
        kind: "Config".to_string(),
        clusters: vec![NamedCluster {
            name: CLUSTER_NAME.to_string(),
            cluster: ClusterConfig {
                server: server.to_string(),
                certificate_authority_data: STANDARD.encode(ca_cert_pem),
            },
        }],
        users: vec![NamedUser {
            name: user.to_string(),
            user: UserConfig {
                client_certificate_data: STANDARD.encode(client_cert_pem),
                client_key_data: STANDARD.encode(client_key_pem),
            },
        }],
        contexts: vec![NamedContext {
            name: context.clone(),
            context: ContextConfig {
                cluster: CLUSTER_NAME.to_string(),
                user: user.to_string(),
            },
        }],
        current_context: context,
    }
}

/// Write every missing kubeconfig in `specs` to `dir`
///
/// Client certificates are only issued for files that do not exist yet.
pub fn write_kubeconfigs(
    dir: &Path,
    server: &str,
    ca: &CertificateAuthority,
    specs: &[KubeconfigSpec],
) -> Result<Vec<(PathBuf, WriteOutcome)>> {
    let mut outcomes = Vec::with_capacity(specs.len());
    for spec in specs {
        let path = dir.join(spec.file_name);
        if path.exists() {
            outcomes.push((path, WriteOutcome::AlreadyPresent));
            continue;
        }

        let (cert_pem, key_pem) = ca.issue(&spec.client)?;
        let kubeconfig = build_kubeconfig(
            server,
            ca.cert_pem(),
            &spec.client.common_name,
            &cert_pem,
            &key_pem,
        );
        let yaml = serde_yaml::to_string(&kubeconfig).map_err(|e| {
            PkiError::CertificateGenerationFailed(format!(
                "failed to serialize {}: {}",
                spec.file_name, e
            ))
        })?;

        let outcome = write_if_absent(&path, yaml.as_bytes(), KEY_MODE)?;
        if outcome == WriteOutcome::Written {
            info!(path = %path.display(), user = %spec.client.common_name, "Wrote kubeconfig");
        }
        outcomes.push((path, outcome));
    }
    Ok(outcomes)
}
