//! Local preconditions and CA staging
//!
//! Before touching the coordination store a node checks that the
//! pre-provisioned CA inputs exist, creates the PKI directory, and places the
//! CA into it:
//!
//! - the CA certificate is **copied**; certificates are public and may be
//!   duplicated freely
//! - the CA key is **symlinked**; the key must exist in exactly one place on
//!   the filesystem, the provisioned input path
//!
//! Both placements are create-only. A file already at the destination is
//! taken as correct and left alone, so staging can run any number of times.

use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::symlink;
use std::path::Path;

use kmm_pki::files::{ensure_dir, write_if_absent, CERT_MODE};
use kmm_pki::WriteOutcome;
use tracing::{debug, info};

use crate::config::BootstrapConfig;
use crate::{Error, Result};

/// Fail with [`Error::MissingInput`] unless `path` exists
pub fn require_input(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Err(Error::missing_input(path)),
        Err(e) => Err(Error::io(path, e)),
    }
}

/// Check the CA certificate and key inputs, in that order
pub fn check_inputs(config: &BootstrapConfig) -> Result<()> {
    require_input(&config.kube_ca_cert)?;
    require_input(&config.kube_ca_key)?;
    Ok(())
}

/// Copy the CA certificate to `dest` unless something is already there
pub fn stage_ca_cert(src: &Path, dest: &Path) -> Result<WriteOutcome> {
    if dest.symlink_metadata().is_ok() {
        debug!(dest = %dest.display(), "CA certificate already staged");
        return Ok(WriteOutcome::AlreadyPresent);
    }

    let contents = fs::read(src).map_err(|e| Error::io(src, e))?;
    let outcome = write_if_absent(dest, &contents, CERT_MODE)?;
    if outcome == WriteOutcome::Written {
        info!(src = %src.display(), dest = %dest.display(), "Copied CA certificate");
    }
    Ok(outcome)
}

/// Symlink `dest` to the CA key at `src` unless something is already there.
///
/// The link target is the canonical path of `src`, so it resolves no matter
/// which directory `dest` lives in.
pub fn link_ca_key(src: &Path, dest: &Path) -> Result<WriteOutcome> {
    if dest.symlink_metadata().is_ok() {
        debug!(dest = %dest.display(), "CA key already linked");
        return Ok(WriteOutcome::AlreadyPresent);
    }

    let target = fs::canonicalize(src).map_err(|e| Error::io(src, e))?;
    match symlink(&target, dest) {
        Ok(()) => {
            info!(target = %target.display(), link = %dest.display(), "Linked CA key");
            Ok(WriteOutcome::Written)
        }
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(WriteOutcome::AlreadyPresent),
        Err(e) => Err(Error::io(dest, e)),
    }
}

/// Run every local precondition and staging step for `config`.
///
/// Touches only the local filesystem.
pub fn prepare_local_pki(config: &BootstrapConfig) -> Result<()> {
    check_inputs(config)?;
    ensure_dir(&config.pki_dir)?;
    stage_ca_cert(&config.kube_ca_cert, &config.ca_cert_file())?;
    link_ca_key(&config.kube_ca_key, &config.ca_key_file())?;
    Ok(())
}
