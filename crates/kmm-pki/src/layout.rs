//! Control-plane PKI layout
//!
//! The file set follows kubeadm's `/etc/kubernetes/pki`:
//!
//! | entry                      | kind       | shared |
//! |----------------------------|------------|--------|
//! | `ca`                       | CA         | yes    |
//! | `front-proxy-ca`           | CA         | yes    |
//! | `sa`                       | key pair   | yes    |
//! | `apiserver`                | server     | no     |
//! | `apiserver-kubelet-client` | client     | no     |
//! | `front-proxy-client`       | client     | no     |
//!
//! Shared entries must be identical on every master and travel in the
//! asset bundle. Per-node entries are derived locally from the shared CAs,
//! since the apiserver certificate carries node-specific SANs.

use std::net::IpAddr;
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::ca::{generate_key_pair, CertSpec, CertificateAuthority};
use crate::files::{
    cert_or_key_exist, try_load_cert_and_key, write_cert_and_key, write_key, write_public_key,
};
use crate::{PkiError, Result};

/// Cluster CA
pub const CA: &str = "ca";
/// API server serving certificate
pub const APISERVER: &str = "apiserver";
/// API server client certificate towards kubelets
pub const APISERVER_KUBELET_CLIENT: &str = "apiserver-kubelet-client";
/// Aggregation-layer CA
pub const FRONT_PROXY_CA: &str = "front-proxy-ca";
/// Aggregation-layer client certificate
pub const FRONT_PROXY_CLIENT: &str = "front-proxy-client";
/// Service-account signing key pair
pub const SERVICE_ACCOUNT: &str = "sa";

/// Common name of the cluster CA
pub const CA_COMMON_NAME: &str = "kubernetes";

/// Node-specific inputs for the API server certificate
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiServerIdentity {
    /// Node hostname
    pub node_name: String,
    /// Address the API server advertises
    pub advertise_address: IpAddr,
    /// API server secure port
    pub bind_port: u16,
    /// Service network CIDR; its first address is the `kubernetes` service IP
    pub service_cidr: String,
    /// Cluster DNS domain
    pub dns_domain: String,
    /// Additional SANs (load balancer names, public addresses)
    pub extra_sans: Vec<String>,
}

impl ApiServerIdentity {
    /// API server URL used in kubeconfigs
    pub fn server_url(&self) -> String {
        match self.advertise_address {
            IpAddr::V4(ip) => format!("https://{}:{}", ip, self.bind_port),
            IpAddr::V6(ip) => format!("https://[{}]:{}", ip, self.bind_port),
        }
    }

    /// SANs of the API server serving certificate
    pub fn sans(&self) -> Result<Vec<String>> {
        let mut sans = vec![
            self.node_name.clone(),
            "kubernetes".to_string(),
            "kubernetes.default".to_string(),
            "kubernetes.default.svc".to_string(),
            format!("kubernetes.default.svc.{}", self.dns_domain),
            self.advertise_address.to_string(),
            first_service_ip(&self.service_cidr)?.to_string(),
        ];
        for san in &self.extra_sans {
            if !sans.contains(san) {
                sans.push(san.clone());
            }
        }
        Ok(sans)
    }
}

/// First usable address of a CIDR (the network address plus one)
pub fn first_service_ip(cidr: &str) -> Result<IpAddr> {
    let invalid = || PkiError::CertificateGenerationFailed(format!("invalid service CIDR '{}'", cidr));

    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let prefix: u32 = prefix.parse().map_err(|_| invalid())?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;

    match addr {
        IpAddr::V4(ip) if prefix <= 30 => {
            let mask = u32::MAX.checked_shl(32 - prefix).unwrap_or(0);
            Ok(IpAddr::V4(((u32::from(ip) & mask) + 1).into()))
        }
        IpAddr::V6(ip) if prefix <= 126 => {
            let mask = u128::MAX.checked_shl(128 - prefix).unwrap_or(0);
            Ok(IpAddr::V6(((u128::from(ip) & mask) + 1).into()))
        }
        _ => Err(invalid()),
    }
}

/// The PKI directory and the operations that populate it
#[derive(Clone, Debug)]
pub struct PkiLayout {
    pki_dir: PathBuf,
}

impl PkiLayout {
    /// Layout rooted at `pki_dir`
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
        }
    }

    /// Root directory
    pub fn pki_dir(&self) -> &Path {
        &self.pki_dir
    }

    /// File names (relative to the PKI dir) that make up the shared bundle
    pub fn shared_files() -> Vec<String> {
        vec![
            format!("{}.crt", CA),
            format!("{}.key", CA),
            format!("{}.crt", FRONT_PROXY_CA),
            format!("{}.key", FRONT_PROXY_CA),
            format!("{}.key", SERVICE_ACCOUNT),
            format!("{}.pub", SERVICE_ACCOUNT),
        ]
    }

    /// Load the cluster CA from disk
    pub fn load_ca(&self) -> Result<CertificateAuthority> {
        try_load_cert_and_key(&self.pki_dir, CA)
    }

    /// Create the missing cluster-shared entries: both CAs and the
    /// service-account key pair. Returns the names of entries created.
    pub fn ensure_shared(&self) -> Result<Vec<&'static str>> {
        let mut created = Vec::new();
        self.ensure_shared_entries(&mut created)?;
        Ok(created)
    }

    /// Create every missing entry of the layout.
    ///
    /// Existing CAs are loaded and used for signing; nothing already on
    /// disk is replaced. Returns the names of entries that were created.
    pub fn ensure_all(&self, identity: &ApiServerIdentity) -> Result<Vec<&'static str>> {
        let mut created = Vec::new();
        let (ca, front_proxy_ca) = self.ensure_shared_entries(&mut created)?;

        self.ensure_leaf(
            &ca,
            APISERVER,
            &CertSpec::server("kube-apiserver", identity.sans()?),
            &mut created,
        )?;
        self.ensure_leaf(
            &ca,
            APISERVER_KUBELET_CLIENT,
            &CertSpec::client("kube-apiserver-kubelet-client").with_organization("system:masters"),
            &mut created,
        )?;
        self.ensure_leaf(
            &front_proxy_ca,
            FRONT_PROXY_CLIENT,
            &CertSpec::client("front-proxy-client"),
            &mut created,
        )?;

        if created.is_empty() {
            debug!(pki_dir = %self.pki_dir.display(), "PKI already complete");
        } else {
            info!(pki_dir = %self.pki_dir.display(), created = ?created, "Created PKI entries");
        }
        Ok(created)
    }

    /// Returns the cluster CA and the front-proxy CA
    fn ensure_shared_entries(
        &self,
        created: &mut Vec<&'static str>,
    ) -> Result<(CertificateAuthority, CertificateAuthority)> {
        let ca = self.ensure_ca(CA, CA_COMMON_NAME, created)?;
        let front_proxy_ca = self.ensure_ca(FRONT_PROXY_CA, FRONT_PROXY_CA, created)?;

        if !cert_or_key_exist(&self.pki_dir, SERVICE_ACCOUNT) {
            let (private_pem, public_pem) = generate_key_pair()?;
            write_key(&self.pki_dir, SERVICE_ACCOUNT, &private_pem)?;
            write_public_key(&self.pki_dir, SERVICE_ACCOUNT, &public_pem)?;
            created.push(SERVICE_ACCOUNT);
        }
        Ok((ca, front_proxy_ca))
    }

    fn ensure_ca(
        &self,
        name: &'static str,
        common_name: &str,
        created: &mut Vec<&'static str>,
    ) -> Result<CertificateAuthority> {
        if cert_or_key_exist(&self.pki_dir, name) {
            debug!(name = %name, "Using existing CA");
            return try_load_cert_and_key(&self.pki_dir, name);
        }

        let ca = CertificateAuthority::new(common_name)?;
        write_cert_and_key(&self.pki_dir, name, ca.cert_pem(), ca.key_pem())?;
        created.push(name);
        Ok(ca)
    }

    fn ensure_leaf(
        &self,
        ca: &CertificateAuthority,
        name: &'static str,
        spec: &CertSpec,
        created: &mut Vec<&'static str>,
    ) -> Result<()> {
        if cert_or_key_exist(&self.pki_dir, name) {
            return Ok(());
        }
        let (cert_pem, key_pem) = ca.issue(spec)?;
        write_cert_and_key(&self.pki_dir, name, &cert_pem, &key_pem)?;
        created.push(name);
        Ok(())
    }
}
