//! Bootstrap coordinator
//!
//! Every master node runs the same bootstrap call at roughly the same time,
//! with no prior coordination. The coordinator makes exactly one of them
//! create the shared PKI material and makes every other node install that
//! same material.
//!
//! # Protocol
//!
//! ```text
//! loop:
//!   get(asset key)
//!     found        -> install bundle, finalize
//!     missing      -> try lock (non-blocking)
//!                       won  -> create, serialize, put_if_absent, finalize, cluster setup
//!                       lost -> back off, loop
//!     other error  -> fail
//! ```
//!
//! A losing node never waits on the lock itself. The winner may die after
//! taking it, so losers keep re-checking whether a bundle has appeared.
//!
//! The only total order relied on is the store's create-only write: the first
//! `put_if_absent` of the bundle wins, and bundle presence (not lock release)
//! tells the other nodes that creation finished. On a failure between taking
//! the lock and publishing, the lock is released on a best-effort basis and
//! the original error is returned.

use kmm_store::CoordinationStore;
use tracing::{debug, error, info, warn};

use crate::config::BootstrapConfig;
use crate::provider::MaterialProvider;
use crate::retry::{Sleeper, TokioSleeper};
use crate::staging;
use crate::{Error, Result};

/// How this node ended up with the shared material
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BootstrapOutcome {
    /// This node generated and published the material
    Created,
    /// This node installed material published by another node
    Adopted,
}

impl BootstrapOutcome {
    /// Whether this node created the material
    pub fn is_creator(self) -> bool {
        self == BootstrapOutcome::Created
    }
}

/// Runs the bootstrap protocol for one node
pub struct Coordinator<S, P, Sl = TokioSleeper> {
    store: S,
    provider: P,
    sleeper: Sl,
}

impl<S, P> Coordinator<S, P, TokioSleeper>
where
    S: CoordinationStore,
    P: MaterialProvider,
{
    /// Coordinator that waits on the tokio timer between polls
    pub fn new(store: S, provider: P) -> Self {
        Self::with_sleeper(store, provider, TokioSleeper)
    }
}

impl<S, P, Sl> Coordinator<S, P, Sl>
where
    S: CoordinationStore,
    P: MaterialProvider,
    Sl: Sleeper,
{
    /// Coordinator using `sleeper` between polls
    pub fn with_sleeper(store: S, provider: P, sleeper: Sl) -> Self {
        Self {
            store,
            provider,
            sleeper,
        }
    }

    /// Make this node's PKI match the cluster-wide shared material, creating
    /// that material if no node has yet.
    ///
    /// Returns once local material is installed and finalized. Local
    /// preconditions are checked before the store is contacted. Only "bundle
    /// not yet published" is retried; every other failure is returned as is.
    pub async fn acquire_or_create_shared_assets(
        &self,
        config: &BootstrapConfig,
    ) -> Result<BootstrapOutcome> {
        config.validate()?;
        staging::prepare_local_pki(config)?;

        let outcome = self.converge(config).await?;

        self.provider.finalize_local_material(config).await?;
        if outcome.is_creator() {
            self.provider.run_one_time_cluster_setup(config).await?;
        }

        info!(
            node = %config.cluster.node_name,
            outcome = ?outcome,
            "Shared assets in place"
        );
        Ok(outcome)
    }

    /// Poll for the bundle, racing for creation while it is missing
    async fn converge(&self, config: &BootstrapConfig) -> Result<BootstrapOutcome> {
        let keys = &config.keys;
        let mut backoff = config.retry.backoff();
        let mut attempt = 0u32;

        loop {
            attempt += 1;

            match self.store.get(&keys.asset_key).await {
                Ok(bundle) => {
                    info!(key = %keys.asset_key, attempt, "Found published shared assets");
                    self.provider.install_material(config, &bundle).await?;
                    return Ok(BootstrapOutcome::Adopted);
                }
                Err(e) if e.is_key_missing() => {
                    debug!(key = %keys.asset_key, attempt, "Shared assets not published yet");
                }
                Err(e) => return Err(e.into()),
            }

            if self.store.acquire_lock(&keys.lock_key).await? {
                info!(lock = %keys.lock_key, "Acquired creation lock, creating shared assets");
                self.create_and_publish(config).await?;
                return Ok(BootstrapOutcome::Created);
            }

            let Some(delay) = backoff.next_delay() else {
                warn!(waited = ?backoff.waited(), "Gave up waiting for shared assets");
                return Err(Error::Timeout {
                    waited: backoff.waited(),
                });
            };
            info!(
                lock = %keys.lock_key,
                attempt,
                delay_ms = delay.as_millis() as u64,
                "Another node holds the creation lock, waiting"
            );
            self.sleeper.sleep(delay).await;
        }
    }

    /// Generate and publish while holding the lock; release it if that fails
    async fn create_and_publish(&self, config: &BootstrapConfig) -> Result<()> {
        let result = async {
            self.provider.create_shared_material(config).await?;
            let bundle = self.provider.serialize_installed_material(config).await?;
            self.store.put_if_absent(&config.keys.asset_key, &bundle).await?;
            info!(key = %config.keys.asset_key, bytes = bundle.len(), "Published shared assets");
            Ok::<(), Error>(())
        }
        .await;

        if let Err(e) = &result {
            self.release_after_failure(&config.keys.lock_key, e).await;
        }
        result
    }

    async fn release_after_failure(&self, lock_key: &str, cause: &Error) {
        match self.store.release_lock(lock_key).await {
            Ok(()) => warn!(lock = %lock_key, error = %cause, "Released creation lock after failure"),
            Err(release_err) => error!(
                lock = %lock_key,
                error = %release_err,
                cause = %cause,
                "Failed to release creation lock; manual cleanup may be needed"
            ),
        }
    }

    /// Release the creation lock and/or delete the published bundle.
    ///
    /// Deleting the bundle while nodes are bootstrapping lets a second CA be
    /// created; that coordination is the caller's job.
    pub async fn clean_up(
        &self,
        config: &BootstrapConfig,
        release_lock: bool,
        delete_assets: bool,
    ) -> Result<()> {
        if release_lock {
            self.store.release_lock(&config.keys.lock_key).await?;
            info!(lock = %config.keys.lock_key, "Released creation lock");
        }
        if delete_assets {
            self.store.delete(&config.keys.asset_key).await?;
            warn!(key = %config.keys.asset_key, "Deleted published shared assets");
        }
        Ok(())
    }
}
