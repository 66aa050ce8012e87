//! Bootstrap configuration
//!
//! [`BootstrapConfig`] is built once per invocation and never mutated by the
//! coordinator. Paths default to the kubeadm layout under `/etc/kubernetes`.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use kmm_pki::ApiServerIdentity;

use crate::retry::{RetryConfig, DEFAULT_POLL_INTERVAL};
use crate::{Error, Result};

/// Default store key holding the shared asset bundle
pub const DEFAULT_ASSET_KEY: &str = "kmm-asset-key";

/// Default store key used as the creation lock
pub const DEFAULT_LOCK_KEY: &str = "kmm-asset-lock";

/// Default directory for kubeconfig files
pub const DEFAULT_KUBERNETES_DIR: &str = "/etc/kubernetes";

/// Default PKI directory
pub const DEFAULT_PKI_DIR: &str = "/etc/kubernetes/pki";

/// Names of the coordination-store keys used by the protocol
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StoreKeys {
    /// Key the shared bundle is published under
    pub asset_key: String,
    /// Key used as the creation lock
    pub lock_key: String,
}

impl Default for StoreKeys {
    fn default() -> Self {
        Self {
            asset_key: DEFAULT_ASSET_KEY.to_string(),
            lock_key: DEFAULT_LOCK_KEY.to_string(),
        }
    }
}

impl StoreKeys {
    /// Default key names under `prefix`, for isolating clusters or tests
    pub fn namespaced(prefix: &str) -> Self {
        let prefix = prefix.trim_end_matches('/');
        Self {
            asset_key: format!("{}/{}", prefix, DEFAULT_ASSET_KEY),
            lock_key: format!("{}/{}", prefix, DEFAULT_LOCK_KEY),
        }
    }
}

/// Cluster parameters that drive material generation and cluster setup
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClusterParams {
    /// This node's name
    pub node_name: String,
    /// Address the API server advertises
    pub advertise_address: IpAddr,
    /// API server secure port
    pub api_server_port: u16,
    /// Service network CIDR
    pub service_cidr: String,
    /// Pod network CIDR, substituted into the network plugin manifest
    pub pod_network_cidr: String,
    /// Cluster DNS domain
    pub dns_domain: String,
    /// Extra API server certificate SANs
    pub api_server_sans: Vec<String>,
}

impl Default for ClusterParams {
    fn default() -> Self {
        Self {
            node_name: "localhost".to_string(),
            advertise_address: IpAddr::from([127, 0, 0, 1]),
            api_server_port: 6443,
            service_cidr: "10.96.0.0/12".to_string(),
            pod_network_cidr: "10.32.0.0/12".to_string(),
            dns_domain: "cluster.local".to_string(),
            api_server_sans: Vec::new(),
        }
    }
}

impl ClusterParams {
    /// Identity used for the API server certificate
    pub fn api_server_identity(&self) -> ApiServerIdentity {
        ApiServerIdentity {
            node_name: self.node_name.clone(),
            advertise_address: self.advertise_address,
            bind_port: self.api_server_port,
            service_cidr: self.service_cidr.clone(),
            dns_domain: self.dns_domain.clone(),
            extra_sans: self.api_server_sans.clone(),
        }
    }
}

/// Input of one bootstrap invocation
#[derive(Clone, Debug)]
pub struct BootstrapConfig {
    /// Pre-provisioned cluster CA certificate (copied into the PKI dir)
    pub kube_ca_cert: PathBuf,
    /// Pre-provisioned cluster CA key (symlinked into the PKI dir)
    pub kube_ca_key: PathBuf,
    /// Canonical PKI directory
    pub pki_dir: PathBuf,
    /// Directory kubeconfig files are written to
    pub kubeconfig_dir: PathBuf,
    /// Coordination-store key names
    pub keys: StoreKeys,
    /// Poll policy while waiting for another node to publish
    pub retry: RetryConfig,
    /// Cluster-specific generation parameters
    pub cluster: ClusterParams,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            kube_ca_cert: PathBuf::from("/srv/kubernetes/ca.crt"),
            kube_ca_key: PathBuf::from("/srv/kubernetes/ca.key"),
            pki_dir: PathBuf::from(DEFAULT_PKI_DIR),
            kubeconfig_dir: PathBuf::from(DEFAULT_KUBERNETES_DIR),
            keys: StoreKeys::default(),
            retry: RetryConfig::fixed(DEFAULT_POLL_INTERVAL),
            cluster: ClusterParams::default(),
        }
    }
}

impl BootstrapConfig {
    /// Config with the given CA inputs and defaults for everything else
    pub fn new(kube_ca_cert: impl Into<PathBuf>, kube_ca_key: impl Into<PathBuf>) -> Self {
        Self {
            kube_ca_cert: kube_ca_cert.into(),
            kube_ca_key: kube_ca_key.into(),
            ..Default::default()
        }
    }

    /// Set the PKI directory
    pub fn with_pki_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.pki_dir = dir.into();
        self
    }

    /// Set the kubeconfig directory
    pub fn with_kubeconfig_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.kubeconfig_dir = dir.into();
        self
    }

    /// Set the store key names
    pub fn with_keys(mut self, keys: StoreKeys) -> Self {
        self.keys = keys;
        self
    }

    /// Set the poll policy
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Set the cluster parameters
    pub fn with_cluster(mut self, cluster: ClusterParams) -> Self {
        self.cluster = cluster;
        self
    }

    /// Canonical path of the CA certificate inside the PKI dir
    pub fn ca_cert_file(&self) -> PathBuf {
        kmm_pki::files::path_for_cert(&self.pki_dir, kmm_pki::layout::CA)
    }

    /// Canonical path of the CA key inside the PKI dir
    pub fn ca_key_file(&self) -> PathBuf {
        kmm_pki::files::path_for_key(&self.pki_dir, kmm_pki::layout::CA)
    }

    /// Path of the admin kubeconfig
    pub fn admin_kubeconfig(&self) -> PathBuf {
        self.kubeconfig_dir.join(kmm_pki::kubeconfig::ADMIN_CONF)
    }

    /// Reject configurations the protocol cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.keys.asset_key.is_empty() || self.keys.lock_key.is_empty() {
            return Err(Error::config("store key names must not be empty"));
        }
        if self.keys.asset_key == self.keys.lock_key {
            return Err(Error::config(format!(
                "asset key and lock key must differ (both are '{}')",
                self.keys.asset_key
            )));
        }
        if self.retry.initial_delay.is_zero() {
            return Err(Error::config("poll interval must be greater than zero"));
        }
        if !self.pki_dir.is_absolute() {
            return Err(Error::config(format!(
                "PKI directory must be absolute: {}",
                self.pki_dir.display()
            )));
        }
        if self.cluster.node_name.is_empty() {
            return Err(Error::config("node name must not be empty"));
        }
        Ok(())
    }
}

/// Duration parser for CLI arguments given in whole seconds
pub fn parse_seconds(arg: &str) -> std::result::Result<Duration, String> {
    arg.parse::<u64>()
        .map(Duration::from_secs)
        .map_err(|e| format!("expected whole seconds: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_mirror_kubeadm_layout() {
        let config = BootstrapConfig::default();
        assert_eq!(config.ca_cert_file(), PathBuf::from("/etc/kubernetes/pki/ca.crt"));
        assert_eq!(config.ca_key_file(), PathBuf::from("/etc/kubernetes/pki/ca.key"));
        assert_eq!(
            config.admin_kubeconfig(),
            PathBuf::from("/etc/kubernetes/admin.conf")
        );
        assert_eq!(config.keys.asset_key, "kmm-asset-key");
        assert_eq!(config.keys.lock_key, "kmm-asset-lock");
        assert_eq!(config.retry, RetryConfig::fixed(Duration::from_secs(20)));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn namespaced_keys_are_prefixed() {
        let keys = StoreKeys::namespaced("/test-42/");
        assert_eq!(keys.asset_key, "/test-42/kmm-asset-key");
        assert_eq!(keys.lock_key, "/test-42/kmm-asset-lock");
    }

    #[test]
    fn identical_keys_are_rejected() {
        let config = BootstrapConfig::default().with_keys(StoreKeys {
            asset_key: "same".to_string(),
            lock_key: "same".to_string(),
        });
        assert!(matches!(config.validate(), Err(Error::Config { .. })));
    }

    #[test]
    fn zero_poll_interval_is_rejected() {
        let config = BootstrapConfig::default().with_retry(RetryConfig::fixed(Duration::ZERO));
        assert!(config.validate().is_err());
    }

    #[test]
    fn relative_pki_dir_is_rejected() {
        let config = BootstrapConfig::default().with_pki_dir("pki");
        assert!(config.validate().is_err());
    }

    #[test]
    fn api_server_identity_carries_cluster_params() {
        let params = ClusterParams {
            node_name: "master-2".to_string(),
            api_server_sans: vec!["lb.example.com".to_string()],
            ..Default::default()
        };
        let identity = params.api_server_identity();
        assert_eq!(identity.node_name, "master-2");
        assert_eq!(identity.bind_port, 6443);
        assert_eq!(identity.extra_sans, vec!["lb.example.com"]);
    }

    #[test]
    fn seconds_parser() {
        assert_eq!(parse_seconds("30").unwrap(), Duration::from_secs(30));
        assert!(parse_seconds("soon").is_err());
    }
}
