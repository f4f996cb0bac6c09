/**
 * PEM/X.509 helpers and the on-disk store for resolved credential material
 */
use super::dirty_state::CredentialInvalidator;
use super::object_key::ObjectKey;
use crate::error::{Error, Result};
use rustls::pki_types::PrivateKeyDer;
use rustls::pki_types::pem::PemObject;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use tempfile::NamedTempFile;
use time::OffsetDateTime;
use tracing::{debug, info, warn};
use x509_parser::pem::{Pem, parse_x509_pem};

/// Identity of a parsed certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateIdentity {
    pub common_name: String,
    pub not_after: OffsetDateTime,
}

/// A parsed certificate along with its DER bytes
#[derive(Debug, Clone)]
pub struct ParsedCertificate {
    pub der: Vec<u8>,
    pub identity: CertificateIdentity,
}

/// Decode the first PEM block of `data`
///
/// # Errors
///
/// Returns a parse error when `data` holds no PEM block.
pub fn decode_pem(data: &[u8], what: &str) -> Result<Pem> {
    parse_x509_pem(data)
        .map(|(_, pem)| pem)
        .map_err(|e| Error::parse(format!("{what} is not valid PEM: {e:?}")))
}

/// Parse a PEM encoded X.509 certificate
///
/// # Errors
///
/// Returns a parse error for malformed PEM or DER content.
pub fn parse_certificate(data: &[u8]) -> Result<ParsedCertificate> {
    let pem = decode_pem(data, "certificate")?;
    let cert = pem
        .parse_x509()
        .map_err(|e| Error::parse(format!("invalid x509 certificate: {e}")))?;

    let common_name = cert
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .unwrap_or_default()
        .to_string();
    let not_after = cert.validity().not_after.to_datetime();

    Ok(ParsedCertificate {
        der: pem.contents.clone(),
        identity: CertificateIdentity {
            common_name,
            not_after,
        },
    })
}

/// Check that `data` holds a usable PEM private key (PKCS#1, PKCS#8 or SEC1)
///
/// # Errors
///
/// Returns a parse error when no key can be decoded or the key type is unsupported.
pub fn validate_private_key(data: &[u8]) -> Result<()> {
    let key = PrivateKeyDer::from_pem_slice(data)
        .map_err(|e| Error::parse(format!("invalid private key: {e}")))?;
    rustls::crypto::aws_lc_rs::sign::any_supported_type(&key)
        .map_err(|e| Error::parse(format!("unsupported private key: {e}")))?;
    Ok(())
}

/// Hex SHA-256 over `parts`, each prefixed by its big-endian `u64` length
#[must_use]
pub fn fingerprint(parts: &[&[u8]]) -> String {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update((part.len() as u64).to_be_bytes());
        hasher.update(part);
    }
    hex::encode(hasher.finalize())
}

/// Files written for secrets, named after the secret and rewritten only on content change
#[derive(Debug)]
pub struct CertificateStore {
    dir: PathBuf,
    written: Mutex<HashMap<ObjectKey, Vec<PathBuf>>>,
}

impl CertificateStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            written: Mutex::new(HashMap::new()),
        }
    }

    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// `<dir>/<ns>_<name>.pem` holding the certificate followed by the key
    ///
    /// # Errors
    ///
    /// Returns an i/o error if the file can not be written.
    pub fn store_tls(&self, key: &ObjectKey, crt: &[u8], pem_key: &[u8]) -> Result<PathBuf> {
        let mut content = crt.to_vec();
        if !content.ends_with(b"\n") {
            content.push(b'\n');
        }
        content.extend_from_slice(pem_key);
        let path = self.dir.join(format!("{}.pem", key.file_stem()));
        self.write_if_changed(key, &path, &content)?;
        Ok(path)
    }

    /// `<dir>/ca/<ns>_<name>.pem` and, when given, `<dir>/ca/<ns>_<name>-crl.pem`
    ///
    /// # Errors
    ///
    /// Returns an i/o error if a file can not be written.
    pub fn store_ca(
        &self,
        key: &ObjectKey,
        ca: &[u8],
        crl: Option<&[u8]>,
    ) -> Result<(PathBuf, Option<PathBuf>)> {
        let ca_dir = self.dir.join("ca");
        let ca_path = ca_dir.join(format!("{}.pem", key.file_stem()));
        self.write_if_changed(key, &ca_path, ca)?;

        let crl_path = match crl {
            Some(crl) => {
                let path = ca_dir.join(format!("{}-crl.pem", key.file_stem()));
                self.write_if_changed(key, &path, crl)?;
                Some(path)
            }
            None => None,
        };
        Ok((ca_path, crl_path))
    }

    /// `<dir>/dhparam/<ns>_<name>.pem`
    ///
    /// # Errors
    ///
    /// Returns an i/o error if the file can not be written.
    pub fn store_dh_param(&self, key: &ObjectKey, dh: &[u8]) -> Result<PathBuf> {
        let path = self
            .dir
            .join("dhparam")
            .join(format!("{}.pem", key.file_stem()));
        self.write_if_changed(key, &path, dh)?;
        Ok(path)
    }

    /// Returns whether the file was (re)written
    ///
    /// New content goes to a temporary sibling that is renamed over `path`,
    /// so readers see either the old file or the new one.
    fn write_if_changed(&self, key: &ObjectKey, path: &Path, content: &[u8]) -> Result<bool> {
        if let Ok(existing) = fs::read(path) {
            if fingerprint(&[existing.as_slice()]) == fingerprint(&[content]) {
                debug!("Unchanged content for {}, keeping {}", key, path.display());
                self.track(key, path);
                return Ok(false);
            }
        }
        let parent = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        fs::create_dir_all(parent)?;
        let mut file = NamedTempFile::new_in(parent)?;
        file.write_all(content)?;
        file.as_file().sync_all()?;
        file.persist(path).map_err(|e| Error::Io(e.error))?;

        self.track(key, path);
        info!("💾 Wrote credential file {} for {}", path.display(), key);
        Ok(true)
    }

    fn track(&self, key: &ObjectKey, path: &Path) {
        let mut written = self.written.lock().unwrap_or_else(PoisonError::into_inner);
        let paths = written.entry(key.clone()).or_default();
        if !paths.iter().any(|p| p == path) {
            paths.push(path.to_path_buf());
        }
    }
}

impl CredentialInvalidator for CertificateStore {
    fn invalidate(&self, secret: &ObjectKey) {
        let paths = self
            .written
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(secret)
            .unwrap_or_default();
        for path in paths {
            match fs::remove_file(&path) {
                Ok(()) => debug!("🗑️  Removed {} of deleted secret {}", path.display(), secret),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove {}: {}", path.display(), e),
            }
        }
    }
}
