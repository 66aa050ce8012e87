//! Concurrent bootstrap against a shared in-memory store
//!
//! Each task plays one master node with its own disk; only the store is
//! shared between them.

use std::fs;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use kmm::config::{BootstrapConfig, ClusterParams};
use kmm::network::ManifestApplier;
use kmm::provider::{KubeadmProvider, MaterialProvider};
use kmm::retry::{RetryConfig, Sleeper};
use kmm::{BootstrapOutcome, Coordinator, Error, Result, StoreKeys};
use kmm_pki::CertificateAuthority;
use kmm_store::{CoordinationStore, MemoryStore, StoreError};

/// Lets the other racers run instead of waiting on a clock
struct YieldSleeper;

#[async_trait]
impl Sleeper for YieldSleeper {
    async fn sleep(&self, _: Duration) {
        tokio::task::yield_now().await;
    }
}

#[derive(Default)]
struct Tally {
    created: AtomicUsize,
    installed: Mutex<Vec<Vec<u8>>>,
    published: Mutex<Vec<Vec<u8>>>,
    finalized: AtomicUsize,
    cluster_setups: AtomicUsize,
}

/// Provider whose "material" is the name of the node that created it
struct FakeProvider {
    node: String,
    tally: Arc<Tally>,
    fail_creation: bool,
}

#[async_trait]
impl MaterialProvider for FakeProvider {
    async fn create_shared_material(&self, _: &BootstrapConfig) -> Result<()> {
        if self.fail_creation {
            return Err(Error::provider("create_shared_material", "simulated crash"));
        }
        self.tally.created.fetch_add(1, Ordering::SeqCst);
        // Give racers a chance to observe the lock held and the bundle missing
        tokio::task::yield_now().await;
        Ok(())
    }

    async fn serialize_installed_material(&self, _: &BootstrapConfig) -> Result<Vec<u8>> {
        let bundle = format!("material from {}", self.node).into_bytes();
        self.tally.published.lock().unwrap().push(bundle.clone());
        Ok(bundle)
    }

    async fn install_material(&self, _: &BootstrapConfig, bundle: &[u8]) -> Result<()> {
        self.tally.installed.lock().unwrap().push(bundle.to_vec());
        Ok(())
    }

    async fn finalize_local_material(&self, _: &BootstrapConfig) -> Result<()> {
        self.tally.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn run_one_time_cluster_setup(&self, _: &BootstrapConfig) -> Result<()> {
        self.tally.cluster_setups.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Per-node disk with the pre-provisioned CA inputs
fn node_config(root: &std::path::Path, name: &str, keys: &StoreKeys) -> BootstrapConfig {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("secrets")).unwrap();
    fs::write(dir.join("secrets/ca.crt"), "CA CERT").unwrap();
    fs::write(dir.join("secrets/ca.key"), "CA KEY").unwrap();

    let mut config = BootstrapConfig::new(dir.join("secrets/ca.crt"), dir.join("secrets/ca.key"))
        .with_pki_dir(dir.join("pki"))
        .with_kubeconfig_dir(&dir)
        .with_keys(keys.clone())
        .with_retry(RetryConfig::fixed(Duration::from_millis(1)));
    config.cluster.node_name = name.to_string();
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn exactly_one_of_many_racing_nodes_creates() {
    const NODES: usize = 8;

    let root = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let keys = StoreKeys::namespaced("/race");
    let tally = Arc::new(Tally::default());

    let mut handles = Vec::new();
    for i in 0..NODES {
        let name = format!("master-{}", i);
        let config = node_config(root.path(), &name, &keys);
        let provider = FakeProvider {
            node: name,
            tally: tally.clone(),
            fail_creation: false,
        };
        let coordinator = Coordinator::with_sleeper(store.clone(), provider, YieldSleeper);
        handles.push(tokio::spawn(async move {
            coordinator.acquire_or_create_shared_assets(&config).await
        }));
    }

    let outcomes: Vec<BootstrapOutcome> = futures::future::join_all(handles)
        .await
        .into_iter()
        .map(|joined| joined.unwrap().unwrap())
        .collect();

    let creators = outcomes.iter().filter(|o| o.is_creator()).count();
    assert_eq!(creators, 1);
    assert_eq!(tally.created.load(Ordering::SeqCst), 1);
    assert_eq!(tally.cluster_setups.load(Ordering::SeqCst), 1);
    assert_eq!(tally.finalized.load(Ordering::SeqCst), NODES);

    let published = tally.published.lock().unwrap().clone();
    assert_eq!(published.len(), 1);

    let installed = tally.installed.lock().unwrap().clone();
    assert_eq!(installed.len(), NODES - 1);
    assert!(installed.iter().all(|bundle| *bundle == published[0]));

    assert_eq!(store.get(&keys.asset_key).await.unwrap(), published[0]);
}

#[tokio::test]
async fn fresh_node_adopts_existing_bundle_without_locking() {
    let root = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let keys = StoreKeys::namespaced("/adopt");
    store
        .put_if_absent(&keys.asset_key, b"material from master-0")
        .await
        .unwrap();

    let tally = Arc::new(Tally::default());
    let provider = FakeProvider {
        node: "master-3".to_string(),
        tally: tally.clone(),
        fail_creation: false,
    };
    let config = node_config(root.path(), "master-3", &keys);
    let coordinator = Coordinator::with_sleeper(store.clone(), provider, YieldSleeper);

    let outcome = coordinator
        .acquire_or_create_shared_assets(&config)
        .await
        .unwrap();

    assert_eq!(outcome, BootstrapOutcome::Adopted);
    assert!(!store.contains(&keys.lock_key));
    assert_eq!(
        tally.installed.lock().unwrap().as_slice(),
        &[b"material from master-0".to_vec()]
    );
    assert_eq!(tally.cluster_setups.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failed_creator_leaves_lock_free_for_the_next_node() {
    let root = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let keys = StoreKeys::namespaced("/retry");
    let tally = Arc::new(Tally::default());

    let crashing = Coordinator::with_sleeper(
        store.clone(),
        FakeProvider {
            node: "master-0".to_string(),
            tally: tally.clone(),
            fail_creation: true,
        },
        YieldSleeper,
    );
    let err = crashing
        .acquire_or_create_shared_assets(&node_config(root.path(), "master-0", &keys))
        .await
        .unwrap_err();
    assert!(matches!(err, Error::Provider { .. }));
    assert!(!store.contains(&keys.lock_key));
    assert!(!store.contains(&keys.asset_key));

    // The lock is free again, so the next node takes over creation
    let healthy = Coordinator::with_sleeper(
        store.clone(),
        FakeProvider {
            node: "master-1".to_string(),
            tally: tally.clone(),
            fail_creation: false,
        },
        YieldSleeper,
    );
    let outcome = healthy
        .acquire_or_create_shared_assets(&node_config(root.path(), "master-1", &keys))
        .await
        .unwrap();
    assert_eq!(outcome, BootstrapOutcome::Created);
    assert_eq!(
        store.get(&keys.asset_key).await.unwrap(),
        b"material from master-1".to_vec()
    );
}

#[tokio::test]
async fn clean_up_allows_forced_rebootstrap() {
    let root = tempfile::tempdir().unwrap();
    let store = MemoryStore::new();
    let keys = StoreKeys::namespaced("/reset");
    let tally = Arc::new(Tally::default());
    let config = node_config(root.path(), "master-0", &keys);

    let coordinator = Coordinator::with_sleeper(
        store.clone(),
        FakeProvider {
            node: "master-0".to_string(),
            tally: tally.clone(),
            fail_creation: false,
        },
        YieldSleeper,
    );
    coordinator
        .acquire_or_create_shared_assets(&config)
        .await
        .unwrap();
    assert!(store.contains(&keys.lock_key));
    assert!(store.contains(&keys.asset_key));

    coordinator.clean_up(&config, true, true).await.unwrap();
    assert!(store.is_empty());
    assert!(store.acquire_lock(&keys.lock_key).await.unwrap());
}

/// Memory store whose first publish fails, as if etcd dropped the request
#[derive(Clone)]
struct FlakyPublishStore {
    inner: MemoryStore,
    failed_once: Arc<AtomicBool>,
}

#[async_trait]
impl CoordinationStore for FlakyPublishStore {
    async fn get(&self, key: &str) -> kmm_store::Result<Vec<u8>> {
        self.inner.get(key).await
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> kmm_store::Result<()> {
        if !self.failed_once.swap(true, Ordering::SeqCst) {
            return Err(StoreError::backend("put", "request timed out"));
        }
        self.inner.put_if_absent(key, value).await
    }

    async fn delete(&self, key: &str) -> kmm_store::Result<()> {
        self.inner.delete(key).await
    }

    async fn acquire_lock(&self, name: &str) -> kmm_store::Result<bool> {
        self.inner.acquire_lock(name).await
    }

    async fn release_lock(&self, name: &str) -> kmm_store::Result<()> {
        self.inner.release_lock(name).await
    }
}

struct NoopApplier;

#[async_trait]
impl ManifestApplier for NoopApplier {
    async fn apply(&self, _: &str) -> Result<()> {
        Ok(())
    }
}

/// Per-node disk holding the real cluster CA every master is provisioned with
fn kubeadm_node(
    root: &std::path::Path,
    name: &str,
    ca: &CertificateAuthority,
    keys: &StoreKeys,
) -> BootstrapConfig {
    let dir = root.join(name);
    fs::create_dir_all(dir.join("secrets")).unwrap();
    fs::write(dir.join("secrets/ca.crt"), ca.cert_pem()).unwrap();
    fs::write(dir.join("secrets/ca.key"), ca.key_pem()).unwrap();

    BootstrapConfig::new(dir.join("secrets/ca.crt"), dir.join("secrets/ca.key"))
        .with_pki_dir(dir.join("pki"))
        .with_kubeconfig_dir(&dir)
        .with_keys(keys.clone())
        .with_retry(RetryConfig::fixed(Duration::from_millis(1)))
        .with_cluster(ClusterParams {
            node_name: name.to_string(),
            ..Default::default()
        })
}

#[tokio::test]
async fn node_that_failed_to_publish_adopts_the_winners_keys() {
    let root = tempfile::tempdir().unwrap();
    let ca = CertificateAuthority::new("kubernetes").unwrap();
    let keys = StoreKeys::namespaced("/flaky");
    let store = FlakyPublishStore {
        inner: MemoryStore::new(),
        failed_once: Arc::new(AtomicBool::new(false)),
    };
    let a_config = kubeadm_node(root.path(), "master-a", &ca, &keys);
    let b_config = kubeadm_node(root.path(), "master-b", &ca, &keys);

    let a = Coordinator::with_sleeper(
        store.clone(),
        KubeadmProvider::new(Arc::new(NoopApplier)),
        YieldSleeper,
    );
    let b = Coordinator::with_sleeper(
        store.clone(),
        KubeadmProvider::new(Arc::new(NoopApplier)),
        YieldSleeper,
    );

    // master-a wins the lock and generates material, but publishing fails
    let err = a.acquire_or_create_shared_assets(&a_config).await.unwrap_err();
    assert!(matches!(err, Error::Store(_)));
    assert!(!store.inner.contains(&keys.lock_key));
    assert!(!a_config.pki_dir.join("sa.key").exists());

    let outcome = b.acquire_or_create_shared_assets(&b_config).await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Created);

    let outcome = a.acquire_or_create_shared_assets(&a_config).await.unwrap();
    assert_eq!(outcome, BootstrapOutcome::Adopted);

    for shared in ["sa.key", "sa.pub", "front-proxy-ca.crt", "front-proxy-ca.key"] {
        assert_eq!(
            fs::read(a_config.pki_dir.join(shared)).unwrap(),
            fs::read(b_config.pki_dir.join(shared)).unwrap(),
            "{} differs between masters",
            shared
        );
    }
}
