//! Error types for kmm
//!
//! Errors carry the context needed to act on them: which path was missing,
//! which provider step failed, how long the coordinator waited.

use std::path::PathBuf;
use std::time::Duration;

use kmm_pki::PkiError;
use kmm_store::StoreError;
use thiserror::Error;

/// Main error type for kmm operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// A required local input file does not exist
    #[error("required input not found: {}", path.display())]
    MissingInput {
        /// The missing path
        path: PathBuf,
    },

    /// Coordination store failure (other than a missing key)
    #[error("coordination store error: {0}")]
    Store(#[from] StoreError),

    /// Certificate or key material failure
    #[error("pki error: {0}")]
    Pki(#[from] PkiError),

    /// Local filesystem failure
    #[error("IO error on {}: {source}", path.display())]
    Io {
        /// Path being operated on
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A material provider step failed
    #[error("provider error during {operation}: {message}")]
    Provider {
        /// Provider operation that failed
        operation: String,
        /// Description of the failure
        message: String,
    },

    /// The coordinator waited longer than the retry policy allows
    #[error("timed out waiting for shared assets after {waited:?}")]
    Timeout {
        /// Total backoff time spent before giving up
        waited: Duration,
    },

    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// A manifest could not be rendered or parsed
    #[error("manifest error: {message}")]
    Manifest {
        /// Description of the failure
        message: String,
    },

    /// Invalid configuration
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },
}

impl Error {
    /// Create a missing-input error for `path`
    pub fn missing_input(path: impl Into<PathBuf>) -> Self {
        Self::MissingInput { path: path.into() }
    }

    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Create a provider error for the given operation
    pub fn provider(operation: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provider {
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create a manifest error
    pub fn manifest(msg: impl Into<String>) -> Self {
        Self::Manifest {
            message: msg.into(),
        }
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Whether re-running the whole bootstrap later could succeed.
    ///
    /// Misconfiguration never heals by itself; store outages and timeouts can.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::MissingInput { .. } | Error::Config { .. } | Error::Manifest { .. } => false,
            Error::Store(e) => e.is_retryable(),
            Error::Timeout { .. } | Error::Kube(_) => true,
            Error::Pki(_) | Error::Io { .. } | Error::Provider { .. } => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a node started with the wrong CA path fails with the path in the message
    #[test]
    fn story_missing_input_names_the_path() {
        let err = Error::missing_input("/srv/kubernetes/ca.crt");
        assert_eq!(
            err.to_string(),
            "required input not found: /srv/kubernetes/ca.crt"
        );
        assert!(!err.is_retryable());
    }

    /// Story: store outages are surfaced but the caller may retry the call
    #[test]
    fn story_store_outage_is_retryable_by_caller() {
        let err: Error = StoreError::connection("connection refused").into();
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_retryable());

        let lost_race: Error = StoreError::already_exists("kmm-asset-key").into();
        assert!(!lost_race.is_retryable());
    }

    /// Story: provider failures keep the failing step in the message
    #[test]
    fn story_provider_errors_name_the_operation() {
        let err = Error::provider("create_shared_material", "disk full");
        assert_eq!(
            err.to_string(),
            "provider error during create_shared_material: disk full"
        );
    }

    #[test]
    fn timeout_reports_waited_duration() {
        let err = Error::Timeout {
            waited: Duration::from_secs(60),
        };
        assert!(err.to_string().contains("60s"));
        assert!(err.is_retryable());
    }

    #[test]
    fn pki_errors_convert() {
        let err: Error = PkiError::ParseError("bad pem".to_string()).into();
        assert!(matches!(err, Error::Pki(_)));
        assert!(err.to_string().contains("bad pem"));
    }
}
