//! Coordination store client for kmm
//!
//! A thin contract over a key-value service that offers exactly what the
//! bootstrap protocol needs and nothing more:
//!
//! - `get` that tells "key absent" apart from every other failure
//! - `put_if_absent`, an atomic create-only write
//! - `delete`
//! - a named, non-blocking mutual-exclusion lock
//!
//! # Backends
//!
//! - [`MemoryStore`] - process-local store for tests and single-node runs
//! - [`EtcdStore`] - etcd v3, using transactions for create-only semantics
//!
//! Store handles are cheap to clone and carry no protocol state between
//! calls; all cross-call state lives in the store itself.

#![deny(missing_docs)]

pub mod error;
pub mod etcd;
pub mod memory;

use async_trait::async_trait;
#[cfg(any(test, feature = "mock"))]
use mockall::automock;

pub use error::StoreError;
pub use etcd::{EtcdSettings, EtcdStore};
pub use memory::MemoryStore;

/// Result type for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

/// Key-value operations required by the bootstrap coordinator.
///
/// Implementations must guarantee:
/// - `get` returns [`StoreError::KeyMissing`] if and only if the key is absent
/// - `put_if_absent` is atomic; a losing writer gets [`StoreError::AlreadyExists`]
///   and the stored value is left untouched
/// - `acquire_lock` never blocks waiting for the holder; it answers
///   `Ok(true)` to exactly one concurrent caller and `Ok(false)` to the rest
#[cfg_attr(any(test, feature = "mock"), automock)]
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Read the value stored under `key`
    async fn get(&self, key: &str) -> Result<Vec<u8>>;

    /// Store `value` under `key` only if the key currently has no value
    async fn put_if_absent(&self, key: &str, value: &[u8]) -> Result<()>;

    /// Remove `key`. Removing an absent key is not an error.
    async fn delete(&self, key: &str) -> Result<()>;

    /// Try to take the lock called `name` without waiting
    async fn acquire_lock(&self, name: &str) -> Result<bool>;

    /// Release the lock called `name`
    async fn release_lock(&self, name: &str) -> Result<()>;
}
