//! PKI file helpers
//!
//! Certificates live at `<pki_dir>/<name>.crt`, private keys at
//! `<pki_dir>/<name>.key` and bare public keys at `<pki_dir>/<name>.pub`.
//!
//! Every write is create-only and atomic: contents go to a temporary file
//! in the target directory, which is then linked into place only if nothing
//! exists there yet. An existing file is never truncated, even when two
//! writers race, and a failed write never leaves a partial file behind.

use std::fs::{self, File, Permissions};
use std::io::{self, ErrorKind, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use tracing::debug;
use x509_parser::prelude::*;

use crate::ca::CertificateAuthority;
use crate::{parse_pem, PkiError, Result};

/// Permission bits for certificates and public keys
pub const CERT_MODE: u32 = 0o644;

/// Permission bits for private keys
pub const KEY_MODE: u32 = 0o600;

/// Permission bits for directories created on demand
pub const DIR_MODE: u32 = 0o755;

/// Whether a write-if-absent call created the file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The file did not exist and was written
    Written,
    /// A file was already present and was left untouched
    AlreadyPresent,
}

/// Path of the certificate called `name`
pub fn path_for_cert(pki_dir: &Path, name: &str) -> PathBuf {
    pki_dir.join(format!("{}.crt", name))
}

/// Path of the private key called `name`
pub fn path_for_key(pki_dir: &Path, name: &str) -> PathBuf {
    pki_dir.join(format!("{}.key", name))
}

/// Path of the public key called `name`
pub fn path_for_public_key(pki_dir: &Path, name: &str) -> PathBuf {
    pki_dir.join(format!("{}.pub", name))
}

/// Create `dir` and any missing parents. An existing directory is fine.
pub fn ensure_dir(dir: &Path) -> Result<()> {
    fs::DirBuilder::new()
        .recursive(true)
        .mode(DIR_MODE)
        .create(dir)
        .map_err(|e| PkiError::io(dir, e))
}

/// Write `contents` to `path` with `mode` unless the path already exists
pub fn write_if_absent(path: &Path, contents: &[u8], mode: u32) -> Result<WriteOutcome> {
    write_new_file(path, mode, |file| file.write_all(contents))
}

/// Create `path` from whatever `fill` writes, unless the path already exists.
///
/// `fill` writes into a temporary sibling; the target only appears once the
/// data is synced, so an error or crash part-way leaves nothing at `path`.
fn write_new_file<F>(path: &Path, mode: u32, fill: F) -> Result<WriteOutcome>
where
    F: FnOnce(&mut File) -> io::Result<()>,
{
    if fs::symlink_metadata(path).is_ok() {
        debug!(path = %path.display(), "File already present, leaving untouched");
        return Ok(WriteOutcome::AlreadyPresent);
    }

    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    ensure_dir(parent)?;

    let mut temp = NamedTempFile::new_in(parent).map_err(|e| PkiError::io(parent, e))?;
    temp.as_file()
        .set_permissions(Permissions::from_mode(mode))
        .and_then(|_| fill(temp.as_file_mut()))
        .and_then(|_| temp.as_file().sync_all())
        .map_err(|e| PkiError::io(path, e))?;

    match temp.persist_noclobber(path) {
        Ok(_) => {}
        Err(e) if e.error.kind() == ErrorKind::AlreadyExists => {
            debug!(path = %path.display(), "File appeared concurrently, leaving untouched");
            return Ok(WriteOutcome::AlreadyPresent);
        }
        Err(e) => return Err(PkiError::io(path, e.error)),
    }

    debug!(path = %path.display(), mode = format!("{:o}", mode), "Wrote file");
    Ok(WriteOutcome::Written)
}

/// Write a certificate PEM as `<name>.crt`
pub fn write_cert(pki_dir: &Path, name: &str, cert_pem: &str) -> Result<WriteOutcome> {
    write_if_absent(&path_for_cert(pki_dir, name), cert_pem.as_bytes(), CERT_MODE)
}

/// Write a private key PEM as `<name>.key`
pub fn write_key(pki_dir: &Path, name: &str, key_pem: &str) -> Result<WriteOutcome> {
    write_if_absent(&path_for_key(pki_dir, name), key_pem.as_bytes(), KEY_MODE)
}

/// Write a public key PEM as `<name>.pub`
pub fn write_public_key(pki_dir: &Path, name: &str, public_pem: &str) -> Result<WriteOutcome> {
    write_if_absent(
        &path_for_public_key(pki_dir, name),
        public_pem.as_bytes(),
        CERT_MODE,
    )
}

/// Write key then certificate for `name`
pub fn write_cert_and_key(
    pki_dir: &Path,
    name: &str,
    cert_pem: &str,
    key_pem: &str,
) -> Result<()> {
    write_key(pki_dir, name, key_pem)?;
    write_cert(pki_dir, name, cert_pem)?;
    Ok(())
}

/// True if the certificate or the key for `name` exists (either one is enough)
pub fn cert_or_key_exist(pki_dir: &Path, name: &str) -> bool {
    path_for_cert(pki_dir, name).exists() || path_for_key(pki_dir, name).exists()
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|e| PkiError::io(path, e))
}

/// Load any certificate file and check it is currently valid
pub fn try_load_any_cert(path: &Path) -> Result<String> {
    let cert_pem = read_to_string(path)?;
    let der = parse_pem(&cert_pem)?;
    let (_, cert) = X509Certificate::from_der(&der).map_err(|e| {
        PkiError::ParseError(format!(
            "couldn't parse certificate {}: {}",
            path.display(),
            e
        ))
    })?;

    let now = ::time::OffsetDateTime::now_utc().unix_timestamp();
    if now < cert.validity().not_before.timestamp() {
        return Err(PkiError::NotYetValid {
            path: path.to_path_buf(),
        });
    }
    if now > cert.validity().not_after.timestamp() {
        return Err(PkiError::Expired {
            path: path.to_path_buf(),
        });
    }

    Ok(cert_pem)
}

/// Load `<name>.crt` and check it is currently valid
pub fn try_load_cert(pki_dir: &Path, name: &str) -> Result<String> {
    try_load_any_cert(&path_for_cert(pki_dir, name))
}

/// Load any private key file and check it parses
pub fn try_load_any_key(path: &Path) -> Result<String> {
    let key_pem = read_to_string(path)?;
    rcgen::KeyPair::from_pem(&key_pem).map_err(|e| {
        PkiError::ParseError(format!(
            "couldn't load the private key file {}: {}",
            path.display(),
            e
        ))
    })?;
    Ok(key_pem)
}

/// Load `<name>.key` and check it parses
pub fn try_load_key(pki_dir: &Path, name: &str) -> Result<String> {
    try_load_any_key(&path_for_key(pki_dir, name))
}

/// Load `<name>.crt` and `<name>.key` as a certificate authority
pub fn try_load_cert_and_key(pki_dir: &Path, name: &str) -> Result<CertificateAuthority> {
    let cert_pem = try_load_cert(pki_dir, name)?;
    let key_pem = try_load_key(pki_dir, name)?;
    CertificateAuthority::from_pem(&cert_pem, &key_pem)
}
