//! Shared asset bundle
//!
//! The bundle is what the creating master publishes to the coordination
//! store and every other master installs. On the wire it is JSON:
//!
//! ```json
//! {
//!   "owner": "master-0",
//!   "createdAt": "2024-05-01T10:00:00Z",
//!   "files": { "ca.crt": "<base64>", "ca.key": "<base64>", ... }
//! }
//! ```

use std::collections::BTreeMap;
use std::path::{Component, Path};

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::files::{write_if_absent, WriteOutcome, CERT_MODE, KEY_MODE};
use crate::{PkiError, Result};

/// The serialized set of cluster-shared secrets
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetBundle {
    /// Node that created the material
    pub owner: String,
    /// When the bundle was assembled
    pub created_at: DateTime<Utc>,
    /// File name (relative to the PKI dir) to base64 file content
    pub files: BTreeMap<String, String>,
}

impl AssetBundle {
    /// Read `names` from `pki_dir` into a new bundle owned by `owner`
    pub fn from_dir(pki_dir: &Path, names: &[String], owner: &str) -> Result<Self> {
        let mut files = BTreeMap::new();
        for name in names {
            validate_name(name)?;
            let path = pki_dir.join(name);
            let contents = std::fs::read(&path).map_err(|e| PkiError::io(&path, e))?;
            files.insert(name.clone(), STANDARD.encode(contents));
        }

        Ok(Self {
            owner: owner.to_string(),
            created_at: Utc::now(),
            files,
        })
    }

    /// Encode for storage
    pub fn encode(&self) -> Result<Vec<u8>> {
        serde_json::to_vec(self)
            .map_err(|e| PkiError::InvalidBundle(format!("failed to serialize bundle: {}", e)))
    }

    /// Decode a stored bundle, rejecting unsafe file names and bad base64
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let bundle: Self = serde_json::from_slice(bytes)
            .map_err(|e| PkiError::InvalidBundle(format!("failed to parse bundle: {}", e)))?;

        for (name, contents) in &bundle.files {
            validate_name(name)?;
            STANDARD.decode(contents).map_err(|e| {
                PkiError::InvalidBundle(format!("{} is not valid base64: {}", name, e))
            })?;
        }
        Ok(bundle)
    }

    /// Decoded content of `name`
    pub fn file(&self, name: &str) -> Result<Option<Vec<u8>>> {
        self.files
            .get(name)
            .map(|b64| {
                STANDARD.decode(b64).map_err(|e| {
                    PkiError::InvalidBundle(format!("{} is not valid base64: {}", name, e))
                })
            })
            .transpose()
    }

    /// Write every file into `pki_dir`, skipping files that already exist
    pub fn install(&self, pki_dir: &Path) -> Result<Vec<(String, WriteOutcome)>> {
        let mut outcomes = Vec::with_capacity(self.files.len());
        for name in self.files.keys() {
            validate_name(name)?;
            let contents = self.file(name)?.unwrap_or_default();
            let outcome = write_if_absent(&pki_dir.join(name), &contents, mode_for(name))?;
            outcomes.push((name.clone(), outcome));
        }

        let written = outcomes
            .iter()
            .filter(|(_, o)| *o == WriteOutcome::Written)
            .count();
        info!(
            owner = %self.owner,
            created_at = %self.created_at,
            written,
            skipped = outcomes.len() - written,
            "Installed shared assets"
        );
        Ok(outcomes)
    }
}

/// Private keys stay owner-only; everything else is world-readable
fn mode_for(name: &str) -> u32 {
    if name.ends_with(".key") {
        KEY_MODE
    } else {
        CERT_MODE
    }
}

/// A bundle entry must be a plain relative path inside the PKI dir
fn validate_name(name: &str) -> Result<()> {
    let path = Path::new(name);
    let safe = !name.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if safe {
        Ok(())
    } else {
        Err(PkiError::InvalidBundle(format!(
            "unsafe file name in bundle: {:?}",
            name
        )))
    }
}
