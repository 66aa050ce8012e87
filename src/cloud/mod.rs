//! Cloud asset staging
//!
//! Before bootstrap runs, the CA inputs are fetched from wherever the cloud
//! environment keeps them and saved at fixed local paths. Each file is written
//! only if its path does not exist yet; certificates are world-readable and
//! keys are readable by owner and group only.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use kmm_pki::files::write_if_absent;
use kmm_pki::WriteOutcome;
use tracing::info;

use crate::{Error, Result};

/// Mode for saved CA certificates
pub const CERT_FILE_MODE: u32 = 0o644;

/// Mode for saved CA keys
pub const KEY_FILE_MODE: u32 = 0o640;

/// File names read by [`DirectoryAssetSource`]
pub const ETCD_CA_CERT_FILE: &str = "etcd-ca.crt";
/// See [`ETCD_CA_CERT_FILE`]
pub const ETCD_CA_KEY_FILE: &str = "etcd-ca.key";
/// See [`ETCD_CA_CERT_FILE`]
pub const KUBE_CA_CERT_FILE: &str = "kube-ca.crt";
/// See [`ETCD_CA_CERT_FILE`]
pub const KUBE_CA_KEY_FILE: &str = "kube-ca.key";

/// CA material handed out by the cloud environment
#[derive(Clone, PartialEq, Eq)]
pub struct CloudAssets {
    /// etcd CA certificate
    pub etcd_ca_cert: Vec<u8>,
    /// etcd CA key
    pub etcd_ca_key: Vec<u8>,
    /// Kubernetes CA certificate
    pub kube_ca_cert: Vec<u8>,
    /// Kubernetes CA key
    pub kube_ca_key: Vec<u8>,
}

impl std::fmt::Debug for CloudAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CloudAssets")
            .field("etcd_ca_cert", &self.etcd_ca_cert.len())
            .field("etcd_ca_key", &"<redacted>")
            .field("kube_ca_cert", &self.kube_ca_cert.len())
            .field("kube_ca_key", &"<redacted>")
            .finish()
    }
}

/// Read-only source of [`CloudAssets`]
#[async_trait]
pub trait CloudAssetSource: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str;

    /// Fetch all four blobs
    async fn fetch(&self) -> Result<CloudAssets>;
}

/// Reads the assets from a directory, typically a mounted secret
#[derive(Clone, Debug)]
pub struct DirectoryAssetSource {
    dir: PathBuf,
}

impl DirectoryAssetSource {
    /// Source reading from `dir`
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.dir.join(name);
        fs::read(&path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                Error::missing_input(&path)
            } else {
                Error::io(&path, e)
            }
        })
    }
}

#[async_trait]
impl CloudAssetSource for DirectoryAssetSource {
    fn name(&self) -> &str {
        "directory"
    }

    async fn fetch(&self) -> Result<CloudAssets> {
        Ok(CloudAssets {
            etcd_ca_cert: self.read(ETCD_CA_CERT_FILE)?,
            etcd_ca_key: self.read(ETCD_CA_KEY_FILE)?,
            kube_ca_cert: self.read(KUBE_CA_CERT_FILE)?,
            kube_ca_key: self.read(KUBE_CA_KEY_FILE)?,
        })
    }
}

/// Where each asset is saved
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssetTargets {
    /// etcd CA certificate path
    pub etcd_ca_cert: PathBuf,
    /// etcd CA key path
    pub etcd_ca_key: PathBuf,
    /// Kubernetes CA certificate path
    pub kube_ca_cert: PathBuf,
    /// Kubernetes CA key path
    pub kube_ca_key: PathBuf,
}

impl Default for AssetTargets {
    fn default() -> Self {
        Self {
            etcd_ca_cert: PathBuf::from("/srv/etcd/ca.crt"),
            etcd_ca_key: PathBuf::from("/srv/etcd/ca.key"),
            kube_ca_cert: PathBuf::from("/srv/kubernetes/ca.crt"),
            kube_ca_key: PathBuf::from("/srv/kubernetes/ca.key"),
        }
    }
}

/// Fetch assets from `source` and save each one whose target path is free.
///
/// Existing files are never touched. Returns the outcome for every target.
pub async fn save_cloud_assets(
    source: &dyn CloudAssetSource,
    targets: &AssetTargets,
) -> Result<Vec<(PathBuf, WriteOutcome)>> {
    let assets = source.fetch().await?;
    info!(source = source.name(), "Fetched cloud assets");

    let files: [(&Path, &[u8], u32); 4] = [
        (targets.etcd_ca_cert.as_path(), assets.etcd_ca_cert.as_slice(), CERT_FILE_MODE),
        (targets.etcd_ca_key.as_path(), assets.etcd_ca_key.as_slice(), KEY_FILE_MODE),
        (targets.kube_ca_cert.as_path(), assets.kube_ca_cert.as_slice(), CERT_FILE_MODE),
        (targets.kube_ca_key.as_path(), assets.kube_ca_key.as_slice(), KEY_FILE_MODE),
    ];

    let mut outcomes = Vec::with_capacity(files.len());
    for (path, contents, mode) in files {
        let outcome = write_if_absent(path, contents, mode)?;
        match outcome {
            WriteOutcome::Written => info!(path = %path.display(), "Saved cloud asset"),
            WriteOutcome::AlreadyPresent => {
                info!(path = %path.display(), "Cloud asset exists already")
            }
        }
        outcomes.push((path.to_path_buf(), outcome));
    }
    Ok(outcomes)
}
