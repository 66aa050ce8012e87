//! etcd v3 coordination store
//!
//! Create-only semantics come from a transaction guarded by
//! `version(key) == 0`: the put only happens when the key has never been
//! written (or was deleted since). The lock is the same transaction on the
//! lock key, so it is non-blocking: losing the compare means "not acquired".
//!
//! When a lock TTL is configured the lock key is attached to an etcd lease,
//! so a holder that crashes before publishing or releasing does not leave
//! the lock orphaned forever.

use std::time::Duration;

use async_trait::async_trait;
use etcd_client::{Client, Compare, CompareOp, ConnectOptions, PutOptions, Txn, TxnOp};
use tracing::{debug, info, warn};

use crate::{CoordinationStore, Result, StoreError};

/// Default timeout for establishing the etcd connection
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default timeout for individual etcd requests
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Connection settings for [`EtcdStore`]
#[derive(Clone, Debug)]
pub struct EtcdSettings {
    /// Client endpoints (e.g. `http://127.0.0.1:2379`)
    pub endpoints: Vec<String>,
    /// Timeout for establishing the connection
    pub connect_timeout: Duration,
    /// Timeout for each request
    pub request_timeout: Duration,
    /// Lease attached to the lock key; `None` keeps the lock until released
    pub lock_ttl: Option<Duration>,
    /// Value written under the lock key, identifying the holder
    pub identity: String,
}

impl Default for EtcdSettings {
    fn default() -> Self {
        Self {
            endpoints: vec!["http://127.0.0.1:2379".to_string()],
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            lock_ttl: None,
            identity: "kmm".to_string(),
        }
    }
}

/// [`CoordinationStore`] backed by etcd
#[derive(Clone)]
pub struct EtcdStore {
    client: Client,
    lock_ttl: Option<Duration>,
    identity: String,
}

impl std::fmt::Debug for EtcdStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EtcdStore")
            .field("lock_ttl", &self.lock_ttl)
            .field("identity", &self.identity)
            .finish_non_exhaustive()
    }
}

impl EtcdStore {
    /// Connect to etcd with the given settings
    pub async fn connect(settings: &EtcdSettings) -> Result<Self> {
        if settings.endpoints.is_empty() {
            return Err(StoreError::connection("no etcd endpoints configured"));
        }

        let options = ConnectOptions::new()
            .with_connect_timeout(settings.connect_timeout)
            .with_timeout(settings.request_timeout);

        let client = Client::connect(&settings.endpoints, Some(options))
            .await
            .map_err(|e| StoreError::connection(e.to_string()))?;

        info!(endpoints = ?settings.endpoints, "Connected to etcd");

        Ok(Self {
            client,
            lock_ttl: settings.lock_ttl,
            identity: settings.identity.clone(),
        })
    }

    /// Put `value` under `key` if the key has never been created.
    ///
    /// Returns whether the write happened.
    async fn create_if_absent(
        &self,
        key: &str,
        value: &[u8],
        options: Option<PutOptions>,
        operation: &str,
    ) -> Result<bool> {
        let mut client = self.client.clone();
        let txn = Txn::new()
            .when(vec![Compare::version(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(key, value, options)]);

        let response = client
            .txn(txn)
            .await
            .map_err(|e| StoreError::backend(operation, e.to_string()))?;
        Ok(response.succeeded())
    }

    /// Lease to attach to the lock key, if a TTL is configured
    async fn grant_lock_lease(&self, name: &str) -> Result<Option<i64>> {
        let Some(ttl) = self.lock_ttl else {
            return Ok(None);
        };

        let mut client = self.client.clone();
        let lease = client
            .lease_grant(ttl_seconds(ttl), None)
            .await
            .map_err(|e| StoreError::backend("lock", e.to_string()))?;

        debug!(lock = %name, lease_id = lease.id(), ttl_secs = ttl.as_secs(), "Granted lock lease");
        Ok(Some(lease.id()))
    }

    /// Drop a lease that ended up attached to nothing. It would expire on
    /// its own, so a failure here is only logged.
    async fn revoke_lease(&self, name: &str, lease_id: i64) {
        let mut client = self.client.clone();
        match client.lease_revoke(lease_id).await {
            Ok(_) => debug!(lock = %name, lease_id, "Revoked unused lock lease"),
            Err(e) => warn!(lock = %name, lease_id, error = %e, "Failed to revoke unused lock lease"),
        }
    }
}

/// The lease granted for a lock attempt is only kept when the lock was won
fn lease_to_revoke(lease_id: Option<i64>, acquired: bool) -> Option<i64> {
    lease_id.filter(|_| !acquired)
}

/// etcd leases are whole seconds with a minimum of one
fn ttl_seconds(ttl: Duration) -> i64 {
    i64::try_from(ttl.as_secs()).unwrap_or(i64::MAX).max(1)
}

#[async_trait]
impl CoordinationStore for EtcdStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        let mut client = self.client.clone();
        let response = client
            .get(key, None)
            .await
            .map_err(|e| StoreError::backend("get", e.to_string()))?;

        response
            .kvs()
            .first()
            .map(|kv| kv.value().to_vec())
            .ok_or_else(|| StoreError::key_missing(key))
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.create_if_absent(key, value, None, "put").await? {
            Ok(())
        } else {
            Err(StoreError::already_exists(key))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let mut client = self.client.clone();
        client
            .delete(key, None)
            .await
            .map_err(|e| StoreError::backend("delete", e.to_string()))?;
        Ok(())
    }

    async fn acquire_lock(&self, name: &str) -> Result<bool> {
        let lease_id = self.grant_lock_lease(name).await?;
        let options = lease_id.map(|id| PutOptions::new().with_lease(id));
        let attempt = self
            .create_if_absent(name, self.identity.as_bytes(), options, "lock")
            .await;

        // A failed transaction leaves the lease as unused as a lost compare
        let acquired = attempt.as_ref().is_ok_and(|won| *won);
        if let Some(id) = lease_to_revoke(lease_id, acquired) {
            self.revoke_lease(name, id).await;
        }

        let acquired = attempt?;
        debug!(lock = %name, identity = %self.identity, acquired, "Lock attempt");
        Ok(acquired)
    }

    async fn release_lock(&self, name: &str) -> Result<()> {
        self.delete(name).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ttl_rounds_down_to_whole_seconds_with_floor_of_one() {
        assert_eq!(ttl_seconds(Duration::from_secs(30)), 30);
        assert_eq!(ttl_seconds(Duration::from_millis(2500)), 2);
        assert_eq!(ttl_seconds(Duration::from_millis(10)), 1);
    }

    #[test]
    fn only_a_won_lock_keeps_its_lease() {
        assert_eq!(lease_to_revoke(Some(7), false), Some(7));
        assert_eq!(lease_to_revoke(Some(7), true), None);
        assert_eq!(lease_to_revoke(None, false), None);
        assert_eq!(lease_to_revoke(None, true), None);
    }

    #[test]
    fn default_settings_point_at_local_etcd_without_lease() {
        let settings = EtcdSettings::default();
        assert_eq!(settings.endpoints, vec!["http://127.0.0.1:2379"]);
        assert!(settings.lock_ttl.is_none());
        assert_eq!(settings.connect_timeout, DEFAULT_CONNECT_TIMEOUT);
    }

    #[tokio::test]
    async fn connect_without_endpoints_fails_fast() {
        let settings = EtcdSettings {
            endpoints: vec![],
            ..Default::default()
        };
        let err = EtcdStore::connect(&settings).await.unwrap_err();
        assert!(matches!(err, StoreError::Connection { .. }));
    }
}
