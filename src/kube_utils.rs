//! Kubernetes client helpers
//!
//! Client construction from a kubeconfig file and server-side apply of
//! untyped manifests through `Api<DynamicObject>`.

use std::path::Path;
use std::time::Duration;

use kube::api::{Api, DynamicObject, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::ApiResource;
use kube::{Client, Config};
use tracing::debug;

use crate::{Error, Result};

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "kmm";

/// Connect timeout for the API server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Read timeout for the API server
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Create a client from the kubeconfig at `path`
pub async fn create_client(path: &Path) -> Result<Client> {
    let kubeconfig = Kubeconfig::read_from(path)
        .map_err(|e| Error::config(format!("failed to read kubeconfig {}: {}", path.display(), e)))?;
    let mut config = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| Error::config(format!("failed to load kubeconfig {}: {}", path.display(), e)))?;
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);
    Ok(Client::try_from(config)?)
}

/// Identity and body of a single manifest document
#[derive(Debug, Clone)]
pub struct ManifestMetadata {
    /// Parsed document
    pub value: serde_json::Value,
    /// `metadata.name`
    pub name: String,
    /// `metadata.namespace`, if namespaced
    pub namespace: Option<String>,
    /// Resource type derived from apiVersion and kind
    pub api_resource: ApiResource,
}

/// Parse a YAML or JSON manifest and extract what is needed to apply it
pub fn parse_manifest(manifest: &str) -> Result<ManifestMetadata> {
    let value: serde_json::Value = if manifest.trim_start().starts_with('{') {
        serde_json::from_str(manifest)
            .map_err(|e| Error::manifest(format!("invalid JSON manifest: {}", e)))?
    } else {
        crate::yaml::parse_yaml(manifest)
            .map_err(|e| Error::manifest(format!("invalid YAML manifest: {}", e)))?
    };

    let field = |pointer: &str| value.pointer(pointer).and_then(|v| v.as_str()).map(String::from);
    let api_version =
        field("/apiVersion").ok_or_else(|| Error::manifest("manifest missing apiVersion"))?;
    let kind = field("/kind").ok_or_else(|| Error::manifest("manifest missing kind"))?;
    let name =
        field("/metadata/name").ok_or_else(|| Error::manifest("manifest missing metadata.name"))?;
    let namespace = field("/metadata/namespace");

    Ok(ManifestMetadata {
        api_resource: build_api_resource(&api_version, &kind),
        value,
        name,
        namespace,
    })
}

/// Build an `ApiResource` from apiVersion and kind without discovery
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Plural resource name for `kind`
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();
    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Split a multi-document YAML string into documents that declare an apiVersion
pub fn split_documents(manifests: &str) -> Vec<&str> {
    manifests
        .split("\n---")
        .map(str::trim)
        .filter(|doc| doc.contains("apiVersion"))
        .collect()
}

/// Server-side apply a single manifest
pub async fn apply_manifest(client: &Client, manifest: &str) -> Result<()> {
    let metadata = parse_manifest(manifest)?;
    let params = PatchParams::apply(FIELD_MANAGER).force();

    let api: Api<DynamicObject> = match &metadata.namespace {
        Some(ns) => Api::namespaced_with(client.clone(), ns, &metadata.api_resource),
        None => Api::all_with(client.clone(), &metadata.api_resource),
    };
    api.patch(&metadata.name, &params, &Patch::Apply(&metadata.value))
        .await?;

    debug!(kind = %metadata.api_resource.kind, name = %metadata.name, "Applied manifest");
    Ok(())
}

/// Apply every document of a multi-document manifest, in order
pub async fn apply_manifests(client: &Client, manifests: &str) -> Result<()> {
    for doc in split_documents(manifests) {
        apply_manifest(client, doc).await?;
    }
    Ok(())
}
