//! Control-plane PKI material for kmm
//!
//! Building blocks the bootstrap material provider is assembled from:
//!
//! - [`ca`] - certificate authority creation/loading and leaf signing (rcgen)
//! - [`files`] - write-if-absent file helpers and validated loading
//! - [`layout`] - the kubeadm PKI file set and which parts are cluster-shared
//! - [`bundle`] - the serialized shared asset bundle stored in the coordination store
//! - [`staged`] - shared material generated outside the PKI dir until it is published
//! - [`kubeconfig`] - kubeconfig files for the admin and control-plane components
//!
//! # File ownership
//!
//! Nothing in this crate overwrites an existing file. A file already present
//! at a target path is assumed correct and left untouched; callers learn
//! about it through [`files::WriteOutcome::AlreadyPresent`].

#![deny(missing_docs)]

pub mod bundle;
pub mod ca;
pub mod files;
pub mod kubeconfig;
pub mod layout;
pub mod staged;

use std::path::PathBuf;

use thiserror::Error;

pub use bundle::AssetBundle;
pub use ca::{CertSpec, CertificateAuthority};
pub use files::WriteOutcome;
pub use layout::{ApiServerIdentity, PkiLayout};
pub use staged::StagedMaterial;

/// PKI errors
#[derive(Debug, Error)]
pub enum PkiError {
    /// Filesystem error on a specific path
    #[error("IO error on {path}: {source}")]
    Io {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// Key generation failed
    #[error("key generation failed: {0}")]
    KeyGenerationFailed(String),

    /// Certificate generation failed
    #[error("certificate generation failed: {0}")]
    CertificateGenerationFailed(String),

    /// Certificate or key parsing error
    #[error("parse error: {0}")]
    ParseError(String),

    /// Certificate validity starts in the future
    #[error("certificate {path} is not valid yet")]
    NotYetValid {
        /// Certificate file
        path: PathBuf,
    },

    /// Certificate validity has ended
    #[error("certificate {path} has expired")]
    Expired {
        /// Certificate file
        path: PathBuf,
    },

    /// Shared bundle could not be decoded or contains unsafe entries
    #[error("invalid asset bundle: {0}")]
    InvalidBundle(String),
}

impl PkiError {
    /// Wrap an IO error with the path it happened on
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }
}

/// Result type for PKI operations
pub type Result<T> = std::result::Result<T, PkiError>;

/// Parse PEM-encoded data and return the DER bytes
pub fn parse_pem(pem_data: &str) -> Result<Vec<u8>> {
    let pem_obj = ::pem::parse(pem_data.as_bytes())
        .map_err(|e| PkiError::ParseError(format!("failed to parse PEM: {}", e)))?;
    Ok(pem_obj.contents().to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pem_rejects_garbage() {
        let err = parse_pem("definitely not pem").unwrap_err();
        assert!(matches!(err, PkiError::ParseError(_)));
    }

    #[test]
    fn parse_pem_returns_der_contents() {
        let ca = CertificateAuthority::new("kubernetes").unwrap();
        let der = parse_pem(ca.cert_pem()).unwrap();
        // DER certificates start with a SEQUENCE tag
        assert_eq!(der[0], 0x30);
    }

    #[test]
    fn io_errors_name_the_path() {
        let err = PkiError::io(
            "/etc/kubernetes/pki/ca.crt",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert!(err.to_string().contains("/etc/kubernetes/pki/ca.crt"));
    }
}
