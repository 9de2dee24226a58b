//! Self-signed certificate fixtures for unit tests.

use std::time::{SystemTime, UNIX_EPOCH};

use openssl::asn1::{Asn1Integer, Asn1Time};
use openssl::bn::{BigNum, MsbOption};
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::x509::{X509Builder, X509NameBuilder, X509};

use crate::keygen;

pub const ORG: &str = "openbmc-project.xyz";

fn now() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs() as i64
}

/// Self-signed certificate with a fresh P-256 key and a random serial, so two
/// calls with the same `cn` share a subject but never their bytes.
pub fn self_signed(cn: &str, not_before: i64, not_after: i64) -> (X509, PKey<Private>) {
    let key = keygen::generate_ec("prime256v1").unwrap();

    let mut name = X509NameBuilder::new().unwrap();
    name.append_entry_by_text("O", ORG).unwrap();
    name.append_entry_by_text("CN", cn).unwrap();
    let name = name.build();

    let mut serial = BigNum::new().unwrap();
    serial.rand(64, MsbOption::MAYBE_ZERO, false).unwrap();
    let serial = Asn1Integer::from_bn(&serial).unwrap();

    let mut builder = X509Builder::new().unwrap();
    builder.set_version(2).unwrap();
    builder.set_serial_number(&serial).unwrap();
    builder.set_subject_name(&name).unwrap();
    builder.set_issuer_name(&name).unwrap();
    builder.set_pubkey(&key).unwrap();
    builder.set_not_before(&Asn1Time::from_unix(not_before).unwrap()).unwrap();
    builder.set_not_after(&Asn1Time::from_unix(not_after).unwrap()).unwrap();
    builder.sign(&key, MessageDigest::sha256()).unwrap();
    (builder.build(), key)
}

/// Certificate-only PEM valid from now for `days`.
pub fn ca_pem(cn: &str, days: i64) -> Vec<u8> {
    let start = now();
    let (cert, _) = self_signed(cn, start, start + days * 86_400);
    cert.to_pem().unwrap()
}

/// `localhost` certificate with an explicit validity window (epoch seconds).
pub fn ca_pem_with_window(not_before: i64, not_after: i64) -> Vec<u8> {
    let (cert, _) = self_signed("localhost", not_before, not_after);
    cert.to_pem().unwrap()
}

/// Certificate followed by its private key.
pub fn server_pem(cn: &str) -> Vec<u8> {
    let start = now();
    let (cert, key) = self_signed(cn, start, start + 365 * 86_400);
    let mut pem = cert.to_pem().unwrap();
    pem.extend(key.private_key_to_pem_pkcs8().unwrap());
    pem
}

/// Certificate followed by a key that does not belong to it.
pub fn server_pem_with_foreign_key(cn: &str) -> Vec<u8> {
    let start = now();
    let (cert, _) = self_signed(cn, start, start + 365 * 86_400);
    let other = keygen::generate_ec("prime256v1").unwrap();
    let mut pem = cert.to_pem().unwrap();
    pem.extend(other.private_key_to_pem_pkcs8().unwrap());
    pem
}

pub fn key_only_pem() -> Vec<u8> {
    keygen::generate_ec("prime256v1")
        .unwrap()
        .private_key_to_pem_pkcs8()
        .unwrap()
}
