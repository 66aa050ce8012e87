//! In-process coordination store
//!
//! All clones share one map behind a mutex, so every racer in a test sees
//! the same state. Each operation runs under a single lock acquisition,
//! which is what makes `put_if_absent` and `acquire_lock` atomic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tracing::trace;

use crate::{CoordinationStore, Result, StoreError};

/// Value written under a lock key by [`MemoryStore::acquire_lock`]
const LOCK_HOLDER_VALUE: &[u8] = b"locked";

/// Process-local [`CoordinationStore`]
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    entries: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    /// Create an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// True when `key` currently has a value (locks included)
    pub fn contains(&self, key: &str) -> bool {
        self.lock_entries()
            .map(|entries| entries.contains_key(key))
            .unwrap_or(false)
    }

    /// Number of keys currently stored
    pub fn len(&self) -> usize {
        self.lock_entries().map(|e| e.len()).unwrap_or(0)
    }

    /// True when the store holds no keys
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock_entries(&self) -> Result<MutexGuard<'_, HashMap<String, Vec<u8>>>> {
        self.entries
            .lock()
            .map_err(|_| StoreError::backend("lock", "memory store mutex poisoned"))
    }

    fn insert_if_absent(&self, key: &str, value: &[u8]) -> Result<bool> {
        let mut entries = self.lock_entries()?;
        if entries.contains_key(key) {
            return Ok(false);
        }
        entries.insert(key.to_string(), value.to_vec());
        Ok(true)
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Vec<u8>> {
        self.lock_entries()?
            .get(key)
            .cloned()
            .ok_or_else(|| StoreError::key_missing(key))
    }

    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<()> {
        if self.insert_if_absent(key, value)? {
            trace!(key = %key, bytes = value.len(), "created key");
            Ok(())
        } else {
            Err(StoreError::already_exists(key))
        }
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.lock_entries()?.remove(key);
        Ok(())
    }

    async fn acquire_lock(&self, name: &str) -> Result<bool> {
        self.insert_if_absent(name, LOCK_HOLDER_VALUE)
    }

    async fn release_lock(&self, name: &str) -> Result<()> {
        self.delete(name).await
    }
}
