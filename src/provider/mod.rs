//! Bootstrap material provider
//!
//! The coordinator decides *who* creates the shared material; a
//! [`MaterialProvider`] knows *what* that material is and how it lands on
//! disk. Each operation is a single call with no internal retry, and any
//! error is handed back to the coordinator unchanged.
//!
//! Material created by this node stays staged outside the PKI directory
//! until the coordinator has published it and moves on to finalizing. If
//! publishing fails and the node later adopts another node's bundle, none
//! of its own candidate keys are left behind to shadow the adopted ones.

use std::sync::Arc;

use async_trait::async_trait;
use kmm_pki::kubeconfig::{control_plane_kubeconfigs, write_kubeconfigs};
use kmm_pki::{AssetBundle, PkiLayout, StagedMaterial, WriteOutcome};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::network::{KubeApplier, ManifestApplier, WeaveNetwork};
use crate::{Error, Result};

/// Creates, packages, installs and finalizes the cluster's PKI material
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait MaterialProvider: Send + Sync {
    /// Generate the shared CA material into this node's working files,
    /// leaving installed material untouched
    async fn create_shared_material(&self, config: &BootstrapConfig) -> Result<()>;

    /// Package the material this node created (or, failing that, has
    /// installed) for publishing
    async fn serialize_installed_material(&self, config: &BootstrapConfig) -> Result<Vec<u8>>;

    /// Write a bundle fetched from the store to local disk
    async fn install_material(&self, config: &BootstrapConfig, bundle: &[u8]) -> Result<()>;

    /// Install material this node created and published, then re-derive
    /// missing node-local artifacts and write kubeconfigs
    async fn finalize_local_material(&self, config: &BootstrapConfig) -> Result<()>;

    /// Cluster-wide setup that must happen exactly once, on the creating node
    async fn run_one_time_cluster_setup(&self, config: &BootstrapConfig) -> Result<()>;
}

/// Provider producing the kubeadm PKI layout and installing Weave Net
pub struct KubeadmProvider {
    network: WeaveNetwork,
    applier: Arc<dyn ManifestApplier>,
    staged: Mutex<Option<StagedMaterial>>,
}

impl KubeadmProvider {
    /// Provider applying cluster setup through `applier`
    pub fn new(applier: Arc<dyn ManifestApplier>) -> Self {
        Self {
            network: WeaveNetwork::default(),
            applier,
            staged: Mutex::new(None),
        }
    }

    /// Provider applying cluster setup with the admin kubeconfig it writes
    pub fn for_config(config: &BootstrapConfig) -> Self {
        Self::new(Arc::new(KubeApplier::new(config.admin_kubeconfig())))
    }

    /// Fill in every missing PKI entry. Key generation is CPU bound, so it
    /// runs on the blocking pool.
    async fn ensure_pki(config: &BootstrapConfig) -> Result<Vec<&'static str>> {
        let layout = PkiLayout::new(&config.pki_dir);
        let identity = config.cluster.api_server_identity();
        tokio::task::spawn_blocking(move || layout.ensure_all(&identity))
            .await
            .map_err(|e| Error::provider("ensure_pki", e.to_string()))?
            .map_err(Error::from)
    }
}

#[async_trait]
impl MaterialProvider for KubeadmProvider {
    async fn create_shared_material(&self, config: &BootstrapConfig) -> Result<()> {
        // Replaces (and removes) whatever an earlier attempt staged
        let mut slot = self.staged.lock().await;
        *slot = None;

        let layout = PkiLayout::new(&config.pki_dir);
        let staged = tokio::task::spawn_blocking(move || layout.stage_shared())
            .await
            .map_err(|e| Error::provider("create_shared_material", e.to_string()))??;

        info!(
            staged = %staged.path().display(),
            created = ?staged.created(),
            "Created shared PKI material"
        );
        *slot = Some(staged);
        Ok(())
    }

    async fn serialize_installed_material(&self, config: &BootstrapConfig) -> Result<Vec<u8>> {
        let owner = &config.cluster.node_name;
        let bundle = match self.staged.lock().await.as_ref() {
            Some(staged) => staged.bundle(owner)?,
            None => AssetBundle::from_dir(&config.pki_dir, &PkiLayout::shared_files(), owner)?,
        };
        Ok(bundle.encode()?)
    }

    async fn install_material(&self, config: &BootstrapConfig, bundle: &[u8]) -> Result<()> {
        if let Some(discarded) = self.staged.lock().await.take() {
            debug!(staged = %discarded.path().display(), "Discarding unpublished shared material");
        }

        let bundle = AssetBundle::decode(bundle)?;
        let outcomes = bundle.install(&config.pki_dir)?;
        for (name, outcome) in outcomes {
            if outcome == WriteOutcome::AlreadyPresent {
                debug!(file = %name, "Kept local copy of shared file");
            }
        }
        Ok(())
    }

    async fn finalize_local_material(&self, config: &BootstrapConfig) -> Result<()> {
        if let Some(staged) = self.staged.lock().await.take() {
            staged.promote(&config.pki_dir, &config.cluster.node_name)?;
            info!(pki_dir = %config.pki_dir.display(), "Installed published shared material");
        }
        Self::ensure_pki(config).await?;

        let layout = PkiLayout::new(&config.pki_dir);
        let ca = layout.load_ca()?;
        let identity = config.cluster.api_server_identity();
        let written = write_kubeconfigs(
            &config.kubeconfig_dir,
            &identity.server_url(),
            &ca,
            &control_plane_kubeconfigs(&config.cluster.node_name),
        )?;

        let new = written
            .iter()
            .filter(|(_, o)| *o == WriteOutcome::Written)
            .count();
        info!(
            kubeconfig_dir = %config.kubeconfig_dir.display(),
            written = new,
            "Finalized local material"
        );
        Ok(())
    }

    async fn run_one_time_cluster_setup(&self, config: &BootstrapConfig) -> Result<()> {
        self.network
            .create(self.applier.as_ref(), &config.cluster.pod_network_cidr)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ClusterParams;
    use crate::network::MockManifestApplier;
    use crate::staging::prepare_local_pki;
    use kmm_pki::kubeconfig::{ADMIN_CONF, KUBELET_CONF};
    use kmm_pki::CertificateAuthority;
    use std::fs;
    use std::path::Path;

    /// A node with the same pre-provisioned CA as every other node
    fn node(root: &Path, name: &str, ca: &CertificateAuthority) -> BootstrapConfig {
        let secrets = root.join(name).join("secrets");
        fs::create_dir_all(&secrets).unwrap();
        fs::write(secrets.join("ca.crt"), ca.cert_pem()).unwrap();
        fs::write(secrets.join("ca.key"), ca.key_pem()).unwrap();

        let config = BootstrapConfig::new(secrets.join("ca.crt"), secrets.join("ca.key"))
            .with_pki_dir(root.join(name).join("pki"))
            .with_kubeconfig_dir(root.join(name))
            .with_cluster(ClusterParams {
                node_name: name.to_string(),
                ..Default::default()
            });
        prepare_local_pki(&config).unwrap();
        config
    }

    fn provider() -> KubeadmProvider {
        KubeadmProvider::new(Arc::new(MockManifestApplier::new()))
    }

    #[tokio::test]
    async fn created_material_stays_staged_until_finalize() {
        let root = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let config = node(root.path(), "master-0", &ca);
        let p = provider();

        p.create_shared_material(&config).await.unwrap();
        assert!(!config.pki_dir.join("sa.key").exists());
        assert!(!config.pki_dir.join("front-proxy-ca.key").exists());

        let bytes = p.serialize_installed_material(&config).await.unwrap();
        p.finalize_local_material(&config).await.unwrap();

        let published = AssetBundle::decode(&bytes).unwrap();
        assert_eq!(
            fs::read(config.pki_dir.join("sa.key")).unwrap(),
            published.file("sa.key").unwrap().unwrap()
        );
        assert_eq!(
            fs::read_to_string(config.pki_dir.join("ca.crt")).unwrap(),
            ca.cert_pem()
        );
        assert!(fs::symlink_metadata(config.pki_dir.join("ca.key"))
            .unwrap()
            .file_type()
            .is_symlink());
        assert!(config.pki_dir.join("apiserver.crt").exists());

        // Only the published files and per-node entries remain
        let leftovers = fs::read_dir(&config.pki_dir)
            .unwrap()
            .filter(|e| {
                let name = e.as_ref().unwrap().file_name();
                name.to_string_lossy().starts_with(kmm_pki::staged::STAGING_PREFIX)
            })
            .count();
        assert_eq!(leftovers, 0);
    }

    #[tokio::test]
    async fn bundle_carries_only_shared_files() {
        let root = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let config = node(root.path(), "master-0", &ca);
        let p = provider();

        p.create_shared_material(&config).await.unwrap();
        let bytes = p.serialize_installed_material(&config).await.unwrap();
        let bundle = AssetBundle::decode(&bytes).unwrap();

        assert_eq!(bundle.owner, "master-0");
        let names: Vec<_> = bundle.files.keys().cloned().collect();
        let mut expected = PkiLayout::shared_files();
        expected.sort();
        assert_eq!(names, expected);
        assert!(!bundle.files.contains_key("apiserver.crt"));
        assert_eq!(bundle.file("ca.crt").unwrap().unwrap(), ca.cert_pem().as_bytes());
    }

    #[tokio::test]
    async fn adopting_node_converges_on_creator_material() {
        let root = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let creator = node(root.path(), "master-0", &ca);
        let adopter = node(root.path(), "master-1", &ca);

        let first = provider();
        first.create_shared_material(&creator).await.unwrap();
        let bytes = first.serialize_installed_material(&creator).await.unwrap();
        first.finalize_local_material(&creator).await.unwrap();

        let second = provider();
        second.install_material(&adopter, &bytes).await.unwrap();
        second.finalize_local_material(&adopter).await.unwrap();

        for shared in ["front-proxy-ca.crt", "front-proxy-ca.key", "sa.key", "sa.pub"] {
            assert_eq!(
                fs::read(creator.pki_dir.join(shared)).unwrap(),
                fs::read(adopter.pki_dir.join(shared)).unwrap(),
                "{} differs",
                shared
            );
        }
        assert!(adopter.pki_dir.join("apiserver.crt").exists());
        assert!(adopter.kubeconfig_dir.join(ADMIN_CONF).exists());
        let kubelet = fs::read_to_string(adopter.kubeconfig_dir.join(KUBELET_CONF)).unwrap();
        assert!(kubelet.contains("system:node:master-1"));
    }

    #[tokio::test]
    async fn unpublished_material_is_discarded_when_adopting() {
        let root = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let loser = node(root.path(), "master-0", &ca);
        let winner = node(root.path(), "master-1", &ca);

        // master-0 created material but never got to publish it
        let p = provider();
        p.create_shared_material(&loser).await.unwrap();
        let unpublished = p.serialize_installed_material(&loser).await.unwrap();

        let w = provider();
        w.create_shared_material(&winner).await.unwrap();
        let published = w.serialize_installed_material(&winner).await.unwrap();
        w.finalize_local_material(&winner).await.unwrap();

        p.install_material(&loser, &published).await.unwrap();
        p.finalize_local_material(&loser).await.unwrap();

        let sa_key = fs::read(loser.pki_dir.join("sa.key")).unwrap();
        assert_eq!(sa_key, fs::read(winner.pki_dir.join("sa.key")).unwrap());
        assert_ne!(
            sa_key,
            AssetBundle::decode(&unpublished)
                .unwrap()
                .file("sa.key")
                .unwrap()
                .unwrap()
        );
    }

    #[tokio::test]
    async fn corrupt_bundle_is_rejected() {
        let root = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let config = node(root.path(), "master-0", &ca);

        let err = provider()
            .install_material(&config, b"not json")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Pki(_)));
    }

    #[tokio::test]
    async fn cluster_setup_applies_network_for_pod_cidr() {
        let root = tempfile::tempdir().unwrap();
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let config = node(root.path(), "master-0", &ca);

        let mut applier = MockManifestApplier::new();
        applier
            .expect_apply()
            .withf(|m| m.contains("value: \"10.32.0.0/12\""))
            .times(1)
            .returning(|_| Ok(()));

        KubeadmProvider::new(Arc::new(applier))
            .run_one_time_cluster_setup(&config)
            .await
            .unwrap();
    }
}
