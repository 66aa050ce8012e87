//! Store error types

use thiserror::Error;

/// Errors returned by a [`CoordinationStore`](crate::CoordinationStore)
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum StoreError {
    /// The requested key has no value
    #[error("key not found: {key}")]
    KeyMissing {
        /// Key that was looked up
        key: String,
    },

    /// A create-only write lost against an existing value
    #[error("key already exists: {key}")]
    AlreadyExists {
        /// Key that was written
        key: String,
    },

    /// Could not reach the store
    #[error("store connection error: {message}")]
    Connection {
        /// Description of the failure
        message: String,
    },

    /// The store answered with an error
    #[error("store error during {operation}: {message}")]
    Backend {
        /// Store operation that failed (get, put, delete, lock)
        operation: String,
        /// Description of the failure
        message: String,
    },
}

impl StoreError {
    /// Create a key-missing error
    pub fn key_missing(key: impl Into<String>) -> Self {
        Self::KeyMissing { key: key.into() }
    }

    /// Create an already-exists error
    pub fn already_exists(key: impl Into<String>) -> Self {
        Self::AlreadyExists { key: key.into() }
    }

    /// Create a connection error
    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection {
            message: msg.into(),
        }
    }

    /// Create a backend error for the given operation
    pub fn backend(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Backend {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// True when the error only says the key is absent
    pub fn is_key_missing(&self) -> bool {
        matches!(self, Self::KeyMissing { .. })
    }

    /// True for failures a caller may reasonably retry later
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Connection { .. } | Self::Backend { .. })
    }
}
