//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::ec::{EcGroup, EcKey};
use openssl::hash::MessageDigest;
use openssl::nid::Nid;
use openssl::pkey::PKey;
use openssl::x509::{X509Builder, X509NameBuilder};

use certmgr::reload::ServiceReloader;
use certmgr::{CertType, CsrHandle, CsrStatus, ManagerHandle, StoreConfig};

/// Path of the binary under test; the CSR worker is this binary too.
pub const CERTMGR: &str = env!("CARGO_BIN_EXE_certmgr");

pub struct NoReload;

impl ServiceReloader for NoReload {
    fn reload_or_restart(&self, _unit: &str) -> certmgr::Result<()> {
        Ok(())
    }
}

pub fn server_store(root: &Path) -> StoreConfig {
    StoreConfig {
        cert_type:             CertType::Server,
        endpoint:              "https".into(),
        install_path:          root.join("https/server.pem"),
        legacy_authority_path: root.join("Root-CA.pem"),
        ..StoreConfig::default()
    }
}

pub fn https_dir(root: &Path) -> PathBuf {
    root.join("https")
}

/// Self-signed CA certificate PEM for `cn`, valid for a year.
pub fn ca_pem(cn: &str) -> Vec<u8> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).unwrap();
    let key = PKey::from_ec_key(EcKey::generate(&group).unwrap()).unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("O", "openbmc-project.xyz").unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();

    let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64;
    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&Asn1Integer::from_bn(&serial).unwrap()).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::from_unix(now).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::from_unix(now + 365 * 86_400).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    builder.build().to_pem().unwrap()
}

/// Poll until the CSR generation leaves `Pending`.
pub async fn wait_settled(handle: &ManagerHandle, csr: CsrHandle) -> CsrStatus {
    for _ in 0..300 {
        match handle.csr_status(csr).await.unwrap() {
            CsrStatus::Pending => tokio::time::sleep(Duration::from_millis(100)).await,
            settled => return settled,
        }
    }
    panic!("CSR generation {} never completed", csr.0);
}
