//! Command-line interface
//!
//! Every flag can also be set through the environment variable named in its
//! help text, so the binary can be driven entirely from a systemd unit or a
//! cloud-init environment file.

use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kmm_store::{EtcdSettings, EtcdStore};
use tracing::{info, warn};

use crate::cloud::{save_cloud_assets, AssetTargets, DirectoryAssetSource};
use crate::config::{
    parse_seconds, BootstrapConfig, ClusterParams, StoreKeys, DEFAULT_KUBERNETES_DIR,
    DEFAULT_PKI_DIR,
};
use crate::coordinator::Coordinator;
use crate::provider::KubeadmProvider;
use crate::retry::{retry_with_backoff, RetryConfig};
use crate::staging;
use crate::Result;

/// kmm - race-safe bootstrap of shared control-plane PKI
#[derive(Parser, Debug)]
#[command(name = "kmm", version, about, long_about = None)]
pub struct Cli {
    /// Emit logs as JSON
    #[arg(long, global = true, env = "KMM_LOG_JSON")]
    pub log_json: bool,

    /// Command to run
    #[command(subcommand)]
    pub command: Commands,
}

/// Subcommands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Obtain the cluster's shared PKI, creating it if no master has yet
    Bootstrap(BootstrapArgs),

    /// Release the creation lock and/or delete the published assets
    ///
    /// Deleting the assets while masters are bootstrapping can produce a
    /// second CA. Only do this when every master is stopped.
    Cleanup(CleanupArgs),

    /// Save the CA inputs from a secrets directory onto local disk
    CloudAssets(CloudAssetsArgs),
}

/// Coordination store connection
#[derive(Args, Debug, Clone)]
pub struct StoreArgs {
    /// etcd client endpoints, comma separated
    #[arg(
        long = "etcd-endpoints",
        env = "ETCD_ENDPOINTS",
        value_delimiter = ',',
        default_value = "http://127.0.0.1:2379"
    )]
    pub endpoints: Vec<String>,

    /// Prefix for the asset and lock keys
    #[arg(long, env = "KMM_KEY_PREFIX")]
    pub key_prefix: Option<String>,

    /// Lease on the creation lock in seconds; unset keeps the lock until released
    #[arg(long, env = "KMM_LOCK_TTL", value_parser = parse_seconds)]
    pub lock_ttl: Option<Duration>,

    /// Attempts at connecting to etcd before giving up
    #[arg(long, env = "KMM_CONNECT_ATTEMPTS", default_value_t = 5)]
    pub connect_attempts: u32,
}

impl StoreArgs {
    /// Store key names
    pub fn keys(&self) -> StoreKeys {
        match &self.key_prefix {
            Some(prefix) => StoreKeys::namespaced(prefix),
            None => StoreKeys::default(),
        }
    }

    /// etcd settings, with `identity` written under the lock key
    pub fn settings(&self, identity: &str) -> EtcdSettings {
        EtcdSettings {
            endpoints: self.endpoints.clone(),
            lock_ttl: self.lock_ttl,
            identity: identity.to_string(),
            ..Default::default()
        }
    }

    /// Connect to etcd, retrying with backoff
    pub async fn connect(&self, identity: &str) -> Result<EtcdStore> {
        let settings = self.settings(identity);
        let retry = RetryConfig::with_max_attempts(self.connect_attempts.max(1));
        let store = retry_with_backoff(&retry, "connect_etcd", || EtcdStore::connect(&settings))
            .await?;
        info!(endpoints = ?settings.endpoints, "Connected to etcd");
        Ok(store)
    }
}

/// Arguments for `kmm bootstrap`
#[derive(Args, Debug, Clone)]
pub struct BootstrapArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Pre-provisioned cluster CA certificate
    #[arg(long, env = "KMM_KUBE_CA_CERT", default_value = "/srv/kubernetes/ca.crt")]
    pub kube_ca_cert: PathBuf,

    /// Pre-provisioned cluster CA key
    #[arg(long, env = "KMM_KUBE_CA_KEY", default_value = "/srv/kubernetes/ca.key")]
    pub kube_ca_key: PathBuf,

    /// PKI directory
    #[arg(long, env = "KMM_PKI_DIR", default_value = DEFAULT_PKI_DIR)]
    pub pki_dir: PathBuf,

    /// Directory kubeconfig files are written to
    #[arg(long, env = "KMM_KUBECONFIG_DIR", default_value = DEFAULT_KUBERNETES_DIR)]
    pub kubeconfig_dir: PathBuf,

    /// This node's name
    #[arg(long, env = "KMM_NODE_NAME")]
    pub node_name: String,

    /// Address the API server advertises
    #[arg(long, env = "KMM_ADVERTISE_ADDRESS")]
    pub advertise_address: IpAddr,

    /// API server secure port
    #[arg(long, env = "KMM_API_SERVER_PORT", default_value_t = 6443)]
    pub api_server_port: u16,

    /// Service network CIDR
    #[arg(long, env = "KMM_SERVICE_CIDR", default_value = "10.96.0.0/12")]
    pub service_cidr: String,

    /// Pod network CIDR
    #[arg(long, env = "KMM_POD_NETWORK_CIDR", default_value = "10.32.0.0/12")]
    pub pod_network_cidr: String,

    /// Cluster DNS domain
    #[arg(long, env = "KMM_DNS_DOMAIN", default_value = "cluster.local")]
    pub dns_domain: String,

    /// Extra API server certificate SANs, comma separated
    #[arg(long, env = "KMM_API_SERVER_SANS", value_delimiter = ',')]
    pub api_server_sans: Vec<String>,

    /// Seconds between polls while another master creates the assets
    #[arg(long, env = "KMM_POLL_INTERVAL", value_parser = parse_seconds, default_value = "20")]
    pub poll_interval: Duration,

    /// Back off exponentially with jitter, up to the poll interval
    #[arg(long, env = "KMM_EXPONENTIAL_BACKOFF")]
    pub exponential_backoff: bool,

    /// Give up after waiting this many seconds in total
    #[arg(long, env = "KMM_MAX_WAIT", value_parser = parse_seconds)]
    pub max_wait: Option<Duration>,
}

impl BootstrapArgs {
    /// Poll policy from the flags
    pub fn retry(&self) -> RetryConfig {
        let retry = if self.exponential_backoff {
            let initial = Duration::from_secs(1).min(self.poll_interval);
            RetryConfig::exponential(initial, self.poll_interval)
        } else {
            RetryConfig::fixed(self.poll_interval)
        };
        match self.max_wait {
            Some(max_wait) => retry.with_max_wait(max_wait),
            None => retry,
        }
    }

    /// Bootstrap configuration from the flags
    pub fn to_config(&self) -> BootstrapConfig {
        BootstrapConfig::new(&self.kube_ca_cert, &self.kube_ca_key)
            .with_pki_dir(&self.pki_dir)
            .with_kubeconfig_dir(&self.kubeconfig_dir)
            .with_keys(self.store.keys())
            .with_retry(self.retry())
            .with_cluster(ClusterParams {
                node_name: self.node_name.clone(),
                advertise_address: self.advertise_address,
                api_server_port: self.api_server_port,
                service_cidr: self.service_cidr.clone(),
                pod_network_cidr: self.pod_network_cidr.clone(),
                dns_domain: self.dns_domain.clone(),
                api_server_sans: self.api_server_sans.clone(),
            })
    }
}

/// Arguments for `kmm cleanup`
#[derive(Args, Debug, Clone)]
pub struct CleanupArgs {
    #[command(flatten)]
    store: StoreArgs,

    /// Release the creation lock
    #[arg(long)]
    pub release_lock: bool,

    /// Delete the published assets
    #[arg(long)]
    pub delete_assets: bool,
}

/// Arguments for `kmm cloud-assets`
#[derive(Args, Debug, Clone)]
pub struct CloudAssetsArgs {
    /// Directory holding etcd-ca.crt, etcd-ca.key, kube-ca.crt and kube-ca.key
    #[arg(long, env = "KMM_CLOUD_ASSET_DIR")]
    pub source_dir: PathBuf,

    /// Where to save the etcd CA certificate
    #[arg(long, env = "KMM_ETCD_CA_CERT", default_value = "/srv/etcd/ca.crt")]
    pub etcd_ca_cert: PathBuf,

    /// Where to save the etcd CA key
    #[arg(long, env = "KMM_ETCD_CA_KEY", default_value = "/srv/etcd/ca.key")]
    pub etcd_ca_key: PathBuf,

    /// Where to save the cluster CA certificate
    #[arg(long, env = "KMM_KUBE_CA_CERT", default_value = "/srv/kubernetes/ca.crt")]
    pub kube_ca_cert: PathBuf,

    /// Where to save the cluster CA key
    #[arg(long, env = "KMM_KUBE_CA_KEY", default_value = "/srv/kubernetes/ca.key")]
    pub kube_ca_key: PathBuf,
}

impl CloudAssetsArgs {
    /// Target paths from the flags
    pub fn targets(&self) -> AssetTargets {
        AssetTargets {
            etcd_ca_cert: self.etcd_ca_cert.clone(),
            etcd_ca_key: self.etcd_ca_key.clone(),
            kube_ca_cert: self.kube_ca_cert.clone(),
            kube_ca_key: self.kube_ca_key.clone(),
        }
    }
}

impl Cli {
    /// Run the selected command
    pub async fn run(self) -> Result<()> {
        match self.command {
            Commands::Bootstrap(args) => run_bootstrap(args).await,
            Commands::Cleanup(args) => run_cleanup(args).await,
            Commands::CloudAssets(args) => run_cloud_assets(args).await,
        }
    }
}

async fn run_bootstrap(args: BootstrapArgs) -> Result<()> {
    let config = args.to_config();
    config.validate()?;
    staging::check_inputs(&config)?;

    let store = args.store.connect(&config.cluster.node_name).await?;
    let provider = KubeadmProvider::for_config(&config);
    let outcome = Coordinator::new(store, provider)
        .acquire_or_create_shared_assets(&config)
        .await?;

    info!(node = %config.cluster.node_name, outcome = ?outcome, "Bootstrap complete");
    Ok(())
}

async fn run_cleanup(args: CleanupArgs) -> Result<()> {
    if !args.release_lock && !args.delete_assets {
        warn!("Nothing to clean up; pass --release-lock and/or --delete-assets");
        return Ok(());
    }

    let config = BootstrapConfig::default().with_keys(args.store.keys());
    let store = args.store.connect("kmm-cleanup").await?;
    let provider = KubeadmProvider::for_config(&config);
    Coordinator::new(store, provider)
        .clean_up(&config, args.release_lock, args.delete_assets)
        .await
}

async fn run_cloud_assets(args: CloudAssetsArgs) -> Result<()> {
    let source = DirectoryAssetSource::new(&args.source_dir);
    save_cloud_assets(&source, &args.targets()).await?;
    Ok(())
}
