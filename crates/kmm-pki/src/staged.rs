//! Shared material generated off to the side of the PKI directory
//!
//! A node that wins the creation lock may still fail to publish, and then
//! it has to adopt whatever another node publishes. Its own candidate
//! material must not be sitting in the PKI dir at that point, since
//! installation never replaces existing files. Candidates are therefore
//! generated in a hidden temporary directory under the PKI dir and only
//! [promoted](StagedMaterial::promote) once published. Dropping a
//! [`StagedMaterial`] removes the directory.

use std::path::Path;

use tempfile::TempDir;
use tracing::debug;

use crate::bundle::AssetBundle;
use crate::files::{ensure_dir, WriteOutcome};
use crate::layout::PkiLayout;
use crate::{PkiError, Result};

/// Name prefix of staging directories inside the PKI dir
pub const STAGING_PREFIX: &str = ".kmm-staged-";

/// Candidate shared material awaiting publication
#[derive(Debug)]
pub struct StagedMaterial {
    dir: TempDir,
    created: Vec<&'static str>,
}

impl StagedMaterial {
    /// Directory holding the staged files
    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    /// Shared entries generated rather than carried over from the PKI dir
    pub fn created(&self) -> &[&'static str] {
        &self.created
    }

    /// Package the staged files for publishing
    pub fn bundle(&self, owner: &str) -> Result<AssetBundle> {
        AssetBundle::from_dir(self.path(), &PkiLayout::shared_files(), owner)
    }

    /// Install the staged files into `pki_dir` and remove the staging dir.
    ///
    /// Files already in `pki_dir` are kept, as with any bundle install.
    pub fn promote(self, pki_dir: &Path, owner: &str) -> Result<Vec<(String, WriteOutcome)>> {
        let outcomes = self.bundle(owner)?.install(pki_dir)?;
        debug!(staged = %self.path().display(), "Promoted staged shared material");
        Ok(outcomes)
    }
}

impl PkiLayout {
    /// Generate the shared entries in a fresh staging directory.
    ///
    /// Shared files already in the PKI dir (the provisioned CA, say) are
    /// carried into the staging dir first so they are reused, not replaced.
    pub fn stage_shared(&self) -> Result<StagedMaterial> {
        let pki_dir = self.pki_dir();
        ensure_dir(pki_dir)?;
        let dir = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(pki_dir)
            .map_err(|e| PkiError::io(pki_dir, e))?;

        let present: Vec<String> = PkiLayout::shared_files()
            .into_iter()
            .filter(|name| pki_dir.join(name).exists())
            .collect();
        AssetBundle::from_dir(pki_dir, &present, "local")?.install(dir.path())?;

        let created = PkiLayout::new(dir.path()).ensure_shared()?;
        debug!(
            staged = %dir.path().display(),
            reused = ?present,
            created = ?created,
            "Staged shared material"
        );
        Ok(StagedMaterial { dir, created })
    }
}
