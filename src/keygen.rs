//! Key pair generation and private key files.
//!
//! Independent of any store state: the CSR worker and the store constructor
//! both call in here.

use std::fs;
use std::path::Path;
use std::str::FromStr;

use log::info;
use openssl::asn1::Asn1Object;
use openssl::ec::{Asn1Flag, EcGroup, EcKey};
use openssl::nid::Nid;
use openssl::pkey::{PKey, Private};
use openssl::rsa::Rsa;

use crate::error::{CertError, Result};
use crate::util;

/// The only RSA modulus size accepted for CSRs.
pub const SUPPORTED_RSA_BITS: u32 = 2048;

/// secp224r1 offers strength comparable to 2048-bit RSA (RFC 5349).
pub const DEFAULT_EC_CURVE: &str = "secp224r1";

/// Service RSA key generated once per store, next to the install path.
pub const RSA_KEY_FILE: &str = ".rsaprivkey.pem";

const KEY_FILE_MODE: u32 = 0o600;

/// NIST names that OpenSSL's object table does not know.
const NIST_ALIASES: &[(&str, &str)] = &[
    ("P-192",     "prime192v1"),
    ("P-224",     "secp224r1"),
    ("P-256",     "prime256v1"),
    ("secp256r1", "prime256v1"),
    ("P-384",     "secp384r1"),
    ("P-521",     "secp521r1"),
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyAlgorithm {
    Rsa,
    Ec,
}

impl FromStr for KeyAlgorithm {
    type Err = CertError;

    /// `"RSA"`, `"EC"`, or empty (EC is the default).
    fn from_str(s: &str) -> Result<Self> {
        match s {
            "RSA"     => Ok(KeyAlgorithm::Rsa),
            "EC" | "" => Ok(KeyAlgorithm::Ec),
            other => Err(CertError::InvalidArgument {
                name:  "KEYPAIRALGORITHM",
                value: other.to_string(),
            }),
        }
    }
}

/// Check an RSA bit length request; 0 selects the default.
pub fn rsa_bits(requested: i64) -> Result<u32> {
    match requested {
        0 => Ok(SUPPORTED_RSA_BITS),
        n if n == SUPPORTED_RSA_BITS as i64 => Ok(SUPPORTED_RSA_BITS),
        n => Err(CertError::InvalidArgument {
            name:  "KEYBITLENGTH",
            value: n.to_string(),
        }),
    }
}

/// Map a curve name to its NID; empty selects [`DEFAULT_EC_CURVE`].
///
/// Any short name, long name or OID in OpenSSL's object table is accepted
/// as long as it names a curve OpenSSL can build a group for.
pub fn resolve_curve(name: &str) -> Result<Nid> {
    let name = if name.is_empty() { DEFAULT_EC_CURVE } else { name };
    let name = NIST_ALIASES
        .iter()
        .find(|(alias, _)| *alias == name)
        .map_or(name, |(_, canonical)| *canonical);
    let unknown = || CertError::internal(format!("unknown EC curve {name:?}"));

    let nid = Asn1Object::from_str(name).map_err(|_| unknown())?.nid();
    if nid == Nid::UNDEF || EcGroup::from_curve_name(nid).is_err() {
        return Err(unknown());
    }
    Ok(nid)
}

pub fn generate_rsa(bits: u32) -> Result<PKey<Private>> {
    let rsa = Rsa::generate(bits)?;
    Ok(PKey::from_rsa(rsa)?)
}

/// Generate a key on a named curve. The named-curve flag makes the key
/// loadable by TLS stacks that refuse explicit parameters.
pub fn generate_ec(curve: &str) -> Result<PKey<Private>> {
    let nid = resolve_curve(curve)?;
    let mut group = EcGroup::from_curve_name(nid)?;
    group.set_asn1_flag(Asn1Flag::NAMED_CURVE);
    let key = EcKey::generate(&group)?;
    Ok(PKey::from_ec_key(key)?)
}

pub fn load_private_key(path: &Path) -> Result<PKey<Private>> {
    let pem = fs::read(path).map_err(|e| {
        CertError::internal(format!("cannot read private key {}: {e}", path.display()))
    })?;
    Ok(PKey::private_key_from_pem(&pem)?)
}

/// Write `key` as PKCS#8 PEM, replacing any previous file.
pub fn write_private_key(path: &Path, key: &PKey<Private>) -> Result<()> {
    let pem = key.private_key_to_pem_pkcs8()?;
    util::remove_if_exists(path)?;
    util::atomic_write(path, &pem, KEY_FILE_MODE)?;
    Ok(())
}

/// Create the service RSA key file if it does not exist yet.
/// Returns `true` when a new key was generated.
pub fn ensure_rsa_key_file(path: &Path) -> Result<bool> {
    if path.exists() {
        return Ok(false);
    }
    info!("generating {SUPPORTED_RSA_BITS}-bit service RSA key {}", path.display());
    let key = generate_rsa(SUPPORTED_RSA_BITS)?;
    write_private_key(path, &key)?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use openssl::pkey::Id;

    #[test]
    fn algorithm_selector() {
        assert_eq!("RSA".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Rsa);
        assert_eq!("EC".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ec);
        assert_eq!("".parse::<KeyAlgorithm>().unwrap(), KeyAlgorithm::Ec);
        let err = "DSA".parse::<KeyAlgorithm>().unwrap_err();
        assert!(matches!(err, CertError::InvalidArgument { name: "KEYPAIRALGORITHM", .. }));
    }

    #[test]
    fn only_2048_bit_rsa() {
        assert_eq!(rsa_bits(0).unwrap(), 2048);
        assert_eq!(rsa_bits(2048).unwrap(), 2048);
        assert!(matches!(rsa_bits(4096), Err(CertError::InvalidArgument { .. })));
        assert!(matches!(rsa_bits(-1), Err(CertError::InvalidArgument { .. })));
    }

    #[test]
    fn curve_resolution() {
        assert_eq!(resolve_curve("").unwrap(), Nid::SECP224R1);
        assert_eq!(resolve_curve("secp521r1").unwrap(), Nid::SECP521R1);
        assert_eq!(resolve_curve("P-256").unwrap(), Nid::X9_62_PRIME256V1);
        assert_eq!(resolve_curve("secp256r1").unwrap(), Nid::X9_62_PRIME256V1);
        assert!(matches!(resolve_curve("NotARealCurve"), Err(CertError::InternalFailure(_))));
        // known to the object table, but not a curve
        assert!(matches!(resolve_curve("sha256"), Err(CertError::InternalFailure(_))));
    }

    #[test]
    fn any_openssl_curve_is_accepted() {
        assert_eq!(resolve_curve("secp192k1").unwrap(), Nid::SECP192K1);
        assert_eq!(resolve_curve("prime192v1").unwrap(), Nid::X9_62_PRIME192V1);

        let brainpool = Asn1Object::from_str("brainpoolP256r1").unwrap().nid();
        assert_eq!(resolve_curve("brainpoolP256r1").unwrap(), brainpool);
        let key = generate_ec("brainpoolP256r1").unwrap();
        assert_eq!(key.ec_key().unwrap().group().curve_name(), Some(brainpool));
    }

    #[test]
    fn ec_key_on_requested_curve() {
        let key = generate_ec("secp384r1").unwrap();
        assert_eq!(key.id(), Id::EC);
        let ec = key.ec_key().unwrap();
        assert_eq!(ec.group().curve_name(), Some(Nid::SECP384R1));
    }

    #[test]
    fn rsa_key_file_created_once() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(RSA_KEY_FILE);
        assert!(ensure_rsa_key_file(&path).unwrap());
        let first = fs::read(&path).unwrap();
        assert!(!ensure_rsa_key_file(&path).unwrap());
        assert_eq!(fs::read(&path).unwrap(), first);

        let key = load_private_key(&path).unwrap();
        assert_eq!(key.bits(), SUPPORTED_RSA_BITS);
    }
}
