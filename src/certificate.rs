//! One installed certificate.
//!
//! A [`Certificate`] owns the raw bytes it was installed from, the identity
//! parsed out of them, and the path of the regular file that backs it on
//! disk. Server/Client input must carry the matching private key in the same
//! PEM; Authority input only needs a certificate.

use std::fmt;
use std::fs;
use std::io::Cursor;
use std::path::{Path, PathBuf};

use log::{debug, info};
use openssl::asn1::{Asn1Time, Asn1TimeRef};
use openssl::ec::EcKey;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;
use openssl::x509::{X509NameRef, X509};
use rustls_pemfile::Item;
use serde::Serialize;

use crate::config::CertType;
use crate::error::{CertError, Result};
use crate::util;

/// Mode for files holding certificates (Server/Client files include a key).
const CERT_FILE_MODE: u32 = 0o600;

/// Stable identifier of an entry within a store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct CertId(pub u64);

impl fmt::Display for CertId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where candidate certificate material comes from.
#[derive(Debug, Clone)]
pub enum CertSource {
    Path(PathBuf),
    Pem(Vec<u8>),
}

impl CertSource {
    pub fn read(&self) -> Result<Vec<u8>> {
        match self {
            CertSource::Pem(bytes) => Ok(bytes.clone()),
            CertSource::Path(path) => fs::read(path).map_err(|e| {
                CertError::internal(format!("cannot read {}: {e}", path.display()))
            }),
        }
    }
}

// ── Identity ──────────────────────────────────────────────────────────────────

/// Fields parsed out of a certificate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub subject:      String,
    pub issuer:       String,
    /// UTC epoch seconds.
    pub not_before:   i64,
    pub not_after:    i64,
    /// OpenSSL `X509_NAME_hash` of the subject.
    pub subject_hash: u32,
}

impl Identity {
    /// Hex form used for `<hash>.<n>` directory references.
    pub fn subject_hash_hex(&self) -> String {
        format!("{:08x}", self.subject_hash)
    }
}

/// Certificate material that passed validation but is not installed yet.
#[derive(Debug, Clone)]
pub struct Parsed {
    pub raw:      Vec<u8>,
    pub identity: Identity,
}

/// Validate `raw` as certificate material for a store of `cert_type`.
///
/// Every decoding problem is reported as `InvalidCertificate`.
pub fn parse(raw: Vec<u8>, cert_type: CertType) -> Result<Parsed> {
    let mut cert_der = None;
    let mut key = None;

    for item in rustls_pemfile::read_all(&mut Cursor::new(&raw)) {
        let item = item.map_err(|e| CertError::invalid(format!("malformed PEM: {e}")))?;
        match item {
            Item::X509Certificate(der) => {
                if cert_der.is_none() {
                    cert_der = Some(der.as_ref().to_vec());
                }
            }
            Item::Pkcs1Key(der) if key.is_none() => {
                key = Some(decode_key(Rsa::private_key_from_der(der.secret_pkcs1_der())
                    .and_then(PKey::from_rsa))?);
            }
            Item::Pkcs8Key(der) if key.is_none() => {
                key = Some(decode_key(PKey::private_key_from_pkcs8(der.secret_pkcs8_der()))?);
            }
            Item::Sec1Key(der) if key.is_none() => {
                key = Some(decode_key(EcKey::private_key_from_der(der.secret_sec1_der())
                    .and_then(PKey::from_ec_key))?);
            }
            _ => {}
        }
    }

    let cert_der = cert_der.ok_or_else(|| CertError::invalid("no certificate found"))?;
    let cert = X509::from_der(&cert_der)
        .map_err(|e| CertError::invalid(format!("cannot decode certificate: {e}")))?;

    if cert_type.is_single() {
        let key = key.ok_or_else(|| CertError::invalid("private key missing"))?;
        let public = cert
            .public_key()
            .map_err(|e| CertError::invalid(format!("cannot read public key: {e}")))?;
        if !public.public_eq(&key) {
            return Err(CertError::invalid("private key does not match certificate"));
        }
    }

    let identity = identity_of(&cert)?;
    Ok(Parsed { raw, identity })
}

fn decode_key(
    key: std::result::Result<PKey<Private>, openssl::error::ErrorStack>,
) -> Result<PKey<Private>> {
    key.map_err(|e| CertError::invalid(format!("cannot decode private key: {e}")))
}

fn identity_of(cert: &X509) -> Result<Identity> {
    let not_before = epoch_seconds(cert.not_before())?;
    let not_after  = epoch_seconds(cert.not_after())?;
    if not_before > not_after {
        return Err(CertError::invalid("validity window ends before it starts"));
    }
    Ok(Identity {
        subject:      dn_string(cert.subject_name()),
        issuer:       dn_string(cert.issuer_name()),
        not_before,
        not_after,
        subject_hash: cert.subject_name_hash(),
    })
}

fn epoch_seconds(t: &Asn1TimeRef) -> Result<i64> {
    let epoch = Asn1Time::from_unix(0)?;
    let diff = epoch
        .diff(t)
        .map_err(|e| CertError::invalid(format!("bad validity time: {e}")))?;
    Ok(i64::from(diff.days) * 86_400 + i64::from(diff.secs))
}

/// `O=Example,CN=host`: entries in certificate order, short names.
fn dn_string(name: &X509NameRef) -> String {
    name.entries()
        .map(|entry| {
            let key = entry
                .object()
                .nid()
                .short_name()
                .map(str::to_string)
                .unwrap_or_else(|_| entry.object().to_string());
            let value = entry
                .data()
                .as_utf8()
                .map(|s| s.to_string())
                .unwrap_or_default();
            format!("{key}={value}")
        })
        .collect::<Vec<_>>()
        .join(",")
}

// ── Installed entry ───────────────────────────────────────────────────────────

#[derive(Debug)]
pub struct Certificate {
    id:        CertId,
    cert_type: CertType,
    file_path: PathBuf,
    raw:       Vec<u8>,
    identity:  Identity,
}

impl Certificate {
    /// Write validated material to `file_path` and wrap it as an entry.
    pub fn install(id: CertId, cert_type: CertType, file_path: PathBuf, parsed: Parsed) -> Result<Self> {
        util::atomic_write(&file_path, &parsed.raw, CERT_FILE_MODE).map_err(|e| {
            CertError::internal(format!("cannot write {}: {e}", file_path.display()))
        })?;
        info!("certificate {id} installed at {}", file_path.display());
        Ok(Self::adopt(id, cert_type, file_path, parsed))
    }

    /// Wrap material that already lives at `file_path` (startup scan,
    /// watcher discovery).
    pub fn adopt(id: CertId, cert_type: CertType, file_path: PathBuf, parsed: Parsed) -> Self {
        Self {
            id,
            cert_type,
            file_path,
            raw:      parsed.raw,
            identity: parsed.identity,
        }
    }

    /// Load and validate the file at `path` in place.
    pub fn load(id: CertId, cert_type: CertType, path: &Path) -> Result<Self> {
        let raw = CertSource::Path(path.to_path_buf()).read()?;
        let parsed = parse(raw, cert_type)?;
        Ok(Self::adopt(id, cert_type, path.to_path_buf(), parsed))
    }

    pub fn id(&self) -> CertId { self.id }
    pub fn identity(&self) -> &Identity { &self.identity }
    pub fn file_path(&self) -> &Path { &self.file_path }
    pub fn raw(&self) -> &[u8] { &self.raw }

    /// Byte-for-byte comparison with the installed content.
    pub fn is_same(&self, candidate: &[u8]) -> bool {
        self.raw == candidate
    }

    /// Overwrite the backing file with new material. Identity and bytes only
    /// change once the new file is in place.
    pub fn replace(&mut self, parsed: Parsed) -> Result<()> {
        util::atomic_write(&self.file_path, &parsed.raw, CERT_FILE_MODE).map_err(|e| {
            CertError::internal(format!("cannot write {}: {e}", self.file_path.display()))
        })?;
        info!("certificate {} replaced ({})", self.id, parsed.identity.subject);
        self.raw = parsed.raw;
        self.identity = parsed.identity;
        Ok(())
    }

    /// Re-read the backing file after an external modification.
    pub fn refresh(&mut self) -> Result<()> {
        let raw = CertSource::Path(self.file_path.clone()).read()?;
        let parsed = parse(raw, self.cert_type)?;
        debug!("certificate {} refreshed from {}", self.id, self.file_path.display());
        self.raw = parsed.raw;
        self.identity = parsed.identity;
        Ok(())
    }

    /// Remove the backing file. The caller drops the entry afterwards.
    pub fn remove(&self) -> Result<()> {
        util::remove_if_exists(&self.file_path).map_err(|e| {
            CertError::internal(format!("cannot remove {}: {e}", self.file_path.display()))
        })?;
        info!("certificate {} removed from {}", self.id, self.file_path.display());
        Ok(())
    }

    /// Move the backing file to `to` within the same file system.
    pub fn relocate(&mut self, to: PathBuf) -> Result<()> {
        fs::rename(&self.file_path, &to).map_err(|e| {
            CertError::internal(format!(
                "cannot move {} to {}: {e}",
                self.file_path.display(),
                to.display()
            ))
        })?;
        debug!("certificate {} moved to {}", self.id, to.display());
        self.file_path = to;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil;

    #[test]
    fn authority_identity() {
        let pem = testutil::ca_pem("localhost", 365000);
        let parsed = parse(pem.clone(), CertType::Authority).unwrap();
        let id = &parsed.identity;
        assert_eq!(id.subject, "O=openbmc-project.xyz,CN=localhost");
        assert_eq!(id.issuer, id.subject);
        assert_eq!(id.not_after - id.not_before, 365000 * 24 * 3600);
        assert_eq!(id.subject_hash_hex().len(), 8);
        assert_eq!(parsed.raw, pem);
    }

    #[test]
    fn never_expiring_root() {
        let pem = testutil::ca_pem_with_window(0, 253_402_300_799);
        let id = parse(pem, CertType::Authority).unwrap().identity;
        assert_eq!(id.not_before, 0);
        assert_eq!(id.not_after, 253_402_300_799);
    }

    #[test]
    fn same_subject_same_hash() {
        let a = parse(testutil::ca_pem("root", 30), CertType::Authority).unwrap();
        let b = parse(testutil::ca_pem("root", 30), CertType::Authority).unwrap();
        assert_ne!(a.raw, b.raw);
        assert_eq!(a.identity.subject_hash, b.identity.subject_hash);
    }

    #[test]
    fn server_needs_matching_key() {
        parse(testutil::server_pem("host"), CertType::Server).unwrap();

        let missing = parse(testutil::ca_pem("host", 30), CertType::Client).unwrap_err();
        assert!(matches!(missing, CertError::InvalidCertificate(_)), "{missing}");

        let mismatched = testutil::server_pem_with_foreign_key("host");
        let err = parse(mismatched, CertType::Server).unwrap_err();
        assert!(matches!(err, CertError::InvalidCertificate(_)), "{err}");
    }

    #[test]
    fn key_only_and_garbage_rejected() {
        for input in [Vec::new(), b"not a certificate".to_vec(), testutil::key_only_pem()] {
            let err = parse(input, CertType::Authority).unwrap_err();
            assert!(matches!(err, CertError::InvalidCertificate(_)), "{err}");
        }
    }

    #[test]
    fn corrupted_body_is_invalid_not_internal() {
        let pem = String::from_utf8(testutil::ca_pem("host", 30)).unwrap();
        let broken = pem.replacen("MI", "AA", 1);
        let err = parse(broken.into_bytes(), CertType::Authority).unwrap_err();
        assert!(matches!(err, CertError::InvalidCertificate(_)), "{err}");
    }

    #[test]
    fn install_replace_remove() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pem");
        let first = testutil::server_pem("one");
        let parsed = parse(first.clone(), CertType::Server).unwrap();
        let mut cert = Certificate::install(CertId(1), CertType::Server, path.clone(), parsed).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
        assert!(cert.is_same(&first));

        let second = testutil::server_pem("two");
        cert.replace(parse(second.clone(), CertType::Server).unwrap()).unwrap();
        assert_eq!(cert.id(), CertId(1));
        assert_eq!(fs::read(&path).unwrap(), second);
        assert!(!cert.is_same(&first));
        assert!(cert.identity().subject.ends_with("CN=two"));

        cert.remove().unwrap();
        assert!(!path.exists());
    }

    #[test]
    fn refresh_picks_up_external_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.pem");
        fs::write(&path, testutil::server_pem("before")).unwrap();
        let mut cert = Certificate::load(CertId(7), CertType::Client, &path).unwrap();

        let after = testutil::server_pem("after");
        fs::write(&path, &after).unwrap();
        cert.refresh().unwrap();
        assert_eq!(cert.id(), CertId(7));
        assert!(cert.is_same(&after));
        assert!(cert.identity().subject.ends_with("CN=after"));
    }

    #[test]
    fn relocate_moves_backing_file() {
        let dir = tempfile::tempdir().unwrap();
        let from = dir.path().join("ca.pem");
        let pem = testutil::ca_pem("moved", 30);
        fs::write(&from, &pem).unwrap();
        let mut cert = Certificate::load(CertId(3), CertType::Authority, &from).unwrap();

        let to = dir.path().join("moved.pem");
        cert.relocate(to.clone()).unwrap();
        assert!(!from.exists());
        assert_eq!(cert.file_path(), to.as_path());
        assert_eq!(fs::read(&to).unwrap(), pem);

        let err = cert.relocate(dir.path().join("missing/dir.pem")).unwrap_err();
        assert!(matches!(err, CertError::InternalFailure(_)));
        assert_eq!(cert.file_path(), to.as_path());
    }
}
