//! Pod network plugin
//!
//! The network plugin is installed once per cluster, by the node that created
//! the shared material. Its manifest is rendered from an embedded template
//! with the pod network CIDR substituted in, then applied to the cluster
//! through a [`ManifestApplier`].

use std::net::IpAddr;
use std::path::PathBuf;

use async_trait::async_trait;
use minijinja::{context, Environment};
#[cfg(any(test, feature = "mock"))]
use mockall::automock;
use tracing::info;

use crate::kube_utils;
use crate::{Error, Result};

/// Weave Net version deployed by default
pub const WEAVE_VERSION: &str = "2.8.1";

/// Image repository for the Weave Net images
pub const WEAVE_IMAGE_REPOSITORY: &str = "weaveworks";

const WEAVE_TEMPLATE: &str = include_str!("../../templates/weave-net.yaml");

/// Applies rendered manifests to the cluster
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait ManifestApplier: Send + Sync {
    /// Apply a multi-document manifest, documents in order
    async fn apply(&self, manifests: &str) -> Result<()>;
}

/// [`ManifestApplier`] that server-side applies through the API server
#[derive(Clone, Debug)]
pub struct KubeApplier {
    kubeconfig: PathBuf,
}

impl KubeApplier {
    /// Applier authenticating with the kubeconfig at `kubeconfig`.
    ///
    /// The file is read on each apply, so it may be written after construction.
    pub fn new(kubeconfig: impl Into<PathBuf>) -> Self {
        Self {
            kubeconfig: kubeconfig.into(),
        }
    }
}

#[async_trait]
impl ManifestApplier for KubeApplier {
    async fn apply(&self, manifests: &str) -> Result<()> {
        let client = kube_utils::create_client(&self.kubeconfig).await?;
        kube_utils::apply_manifests(&client, manifests).await
    }
}

/// Weave Net network plugin
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WeaveNetwork {
    /// Image tag
    pub version: String,
    /// Registry and organization the images are pulled from
    pub image_repository: String,
}

impl Default for WeaveNetwork {
    fn default() -> Self {
        Self {
            version: WEAVE_VERSION.to_string(),
            image_repository: WEAVE_IMAGE_REPOSITORY.to_string(),
        }
    }
}

impl WeaveNetwork {
    /// Plugin name
    pub fn name(&self) -> &'static str {
        "weave"
    }

    /// Render the manifest for the pod network `pod_cidr`
    pub fn render(&self, pod_cidr: &str) -> Result<String> {
        validate_cidr(pod_cidr)?;

        let mut env = Environment::new();
        env.add_template("weave-net", WEAVE_TEMPLATE)
            .map_err(|e| Error::manifest(format!("invalid weave template: {}", e)))?;
        env.get_template("weave-net")
            .and_then(|t| {
                t.render(context! {
                    network => pod_cidr,
                    version => &self.version,
                    image_repository => &self.image_repository,
                })
            })
            .map_err(|e| Error::manifest(format!("failed to render weave manifest: {}", e)))
    }

    /// Render and apply the plugin for `pod_cidr`
    pub async fn create(&self, applier: &dyn ManifestApplier, pod_cidr: &str) -> Result<()> {
        let manifest = self.render(pod_cidr)?;
        applier.apply(&manifest).await?;
        info!(plugin = self.name(), pod_cidr = %pod_cidr, "Installed pod network");
        Ok(())
    }
}

/// Reject anything that is not `<ip>/<prefix>` with a prefix valid for the family
pub fn validate_cidr(cidr: &str) -> Result<()> {
    let invalid = || Error::config(format!("invalid pod network CIDR '{}'", cidr));

    let (addr, prefix) = cidr.split_once('/').ok_or_else(invalid)?;
    let addr: IpAddr = addr.parse().map_err(|_| invalid())?;
    let prefix: u8 = prefix.parse().map_err(|_| invalid())?;
    let max = if addr.is_ipv4() { 32 } else { 128 };
    if prefix > max {
        return Err(invalid());
    }
    Ok(())
}
