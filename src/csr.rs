//! Certificate signing request generation.
//!
//! Split in two halves:
//!   - [`prepare`] runs on the event loop: validates the caller's fields and
//!     produces a [`CsrJob`]. Anything rejected here is `InvalidArgument` and
//!     no file is touched.
//!   - [`run_job`] runs inside the isolated `csr-worker` process: generates
//!     or loads the key, builds and signs the request, writes both files.

use std::fmt;
use std::fs;
use std::net::IpAddr;
use std::path::{Path, PathBuf};

use log::info;
use openssl::hash::MessageDigest;
use openssl::pkey::{PKey, Private};
use openssl::stack::Stack;
use openssl::x509::extension::{
    ExtendedKeyUsage, KeyUsage as KeyUsageExt, SubjectAlternativeName,
};
use openssl::x509::{X509NameBuilder, X509Req, X509ReqBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{CertError, Result};
use crate::keygen::{self, KeyAlgorithm, RSA_KEY_FILE};
use crate::util;

pub const CSR_FILE:         &str = "domain.csr";
pub const PRIVATE_KEY_FILE: &str = "privkey.pem";

const CSR_FILE_MODE: u32 = 0o644;

// ── Request fields ────────────────────────────────────────────────────────────

/// Caller-supplied CSR parameters. Empty strings and zero mean "not given".
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CsrRequest {
    pub alternative_names:   Vec<String>,
    pub challenge_password:  String,
    pub city:                String,
    pub common_name:         String,
    pub contact_person:      String,
    pub country:             String,
    pub email:               String,
    pub given_name:          String,
    pub initials:            String,
    pub key_bit_length:      i64,
    pub key_curve_id:        String,
    pub key_pair_algorithm:  String,
    pub key_usage:           Vec<String>,
    pub organization:        String,
    pub organizational_unit: String,
    pub state:               String,
    pub surname:             String,
    pub unstructured_name:   String,
}

impl CsrRequest {
    /// Subject entries in encoding order, by OpenSSL short name.
    fn subject_fields(&self) -> [(&'static str, &str); 13] {
        [
            ("challengePassword", &self.challenge_password),
            ("L",                 &self.city),
            ("CN",                &self.common_name),
            ("name",              &self.contact_person),
            ("C",                 &self.country),
            ("emailAddress",      &self.email),
            ("GN",                &self.given_name),
            ("initials",          &self.initials),
            ("O",                 &self.organization),
            ("OU",                &self.organizational_unit),
            ("ST",                &self.state),
            ("SN",                &self.surname),
            ("unstructuredName",  &self.unstructured_name),
        ]
    }
}

// ── Key usage classification ──────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BasicUsage {
    DigitalSignature,
    NonRepudiation,
    KeyEncipherment,
    DataEncipherment,
    KeyAgreement,
    KeyCertSign,
    CrlSign,
    EncipherOnly,
    DecipherOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtendedUsage {
    ServerAuth,
    ClientAuth,
    CodeSigning,
    EmailProtection,
    TimeStamping,
    OcspSigning,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Usage {
    Basic(BasicUsage),
    Extended(ExtendedUsage),
}

/// Accepted spellings: management-API names and OpenSSL short names.
const USAGES: &[(&str, Usage)] = &[
    ("DigitalSignature",      Usage::Basic(BasicUsage::DigitalSignature)),
    ("digitalSignature",      Usage::Basic(BasicUsage::DigitalSignature)),
    ("NonRepudiation",        Usage::Basic(BasicUsage::NonRepudiation)),
    ("nonRepudiation",        Usage::Basic(BasicUsage::NonRepudiation)),
    ("KeyEncipherment",       Usage::Basic(BasicUsage::KeyEncipherment)),
    ("keyEncipherment",       Usage::Basic(BasicUsage::KeyEncipherment)),
    ("DataEncipherment",      Usage::Basic(BasicUsage::DataEncipherment)),
    ("dataEncipherment",      Usage::Basic(BasicUsage::DataEncipherment)),
    ("KeyAgreement",          Usage::Basic(BasicUsage::KeyAgreement)),
    ("keyAgreement",          Usage::Basic(BasicUsage::KeyAgreement)),
    ("KeyCertSign",           Usage::Basic(BasicUsage::KeyCertSign)),
    ("keyCertSign",           Usage::Basic(BasicUsage::KeyCertSign)),
    ("CRLSigning",            Usage::Basic(BasicUsage::CrlSign)),
    ("cRLSign",               Usage::Basic(BasicUsage::CrlSign)),
    ("EncipherOnly",          Usage::Basic(BasicUsage::EncipherOnly)),
    ("encipherOnly",          Usage::Basic(BasicUsage::EncipherOnly)),
    ("DecipherOnly",          Usage::Basic(BasicUsage::DecipherOnly)),
    ("decipherOnly",          Usage::Basic(BasicUsage::DecipherOnly)),
    ("ServerAuthentication",  Usage::Extended(ExtendedUsage::ServerAuth)),
    ("serverAuth",            Usage::Extended(ExtendedUsage::ServerAuth)),
    ("ClientAuthentication",  Usage::Extended(ExtendedUsage::ClientAuth)),
    ("clientAuth",            Usage::Extended(ExtendedUsage::ClientAuth)),
    ("CodeSigning",           Usage::Extended(ExtendedUsage::CodeSigning)),
    ("codeSigning",           Usage::Extended(ExtendedUsage::CodeSigning)),
    ("EmailProtection",       Usage::Extended(ExtendedUsage::EmailProtection)),
    ("emailProtection",       Usage::Extended(ExtendedUsage::EmailProtection)),
    ("Timestamping",          Usage::Extended(ExtendedUsage::TimeStamping)),
    ("timeStamping",          Usage::Extended(ExtendedUsage::TimeStamping)),
    ("OCSPSigning",           Usage::Extended(ExtendedUsage::OcspSigning)),
];

pub fn classify_usage(name: &str) -> Result<Usage> {
    USAGES
        .iter()
        .find(|(n, _)| *n == name)
        .map(|(_, u)| *u)
        .ok_or_else(|| CertError::InvalidArgument {
            name:  "KEYUSAGE",
            value: name.to_string(),
        })
}

fn split_usages(names: &[String]) -> Result<(Vec<BasicUsage>, Vec<ExtendedUsage>)> {
    let mut basic = Vec::new();
    let mut extended = Vec::new();
    for name in names {
        match classify_usage(name)? {
            Usage::Basic(u)    => basic.push(u),
            Usage::Extended(u) => extended.push(u),
        }
    }
    Ok((basic, extended))
}

// ── Job preparation (event loop side) ─────────────────────────────────────────

/// Where the worker gets its key pair from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeySpec {
    /// Reuse the store's service RSA key.
    Rsa { key_file: PathBuf },
    /// Fresh key on a named curve (empty = default curve).
    Ec { curve: String },
}

/// Everything the worker process needs; sent to it as JSON.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CsrJob {
    pub request:          CsrRequest,
    pub key:              KeySpec,
    pub private_key_path: PathBuf,
    pub csr_path:         PathBuf,
}

/// Validate `request` and describe the work for a store whose CSR artifacts
/// live in `dir`.
pub fn prepare(request: CsrRequest, dir: &Path) -> Result<CsrJob> {
    let key = match request.key_pair_algorithm.parse::<KeyAlgorithm>()? {
        KeyAlgorithm::Rsa => {
            keygen::rsa_bits(request.key_bit_length)?;
            KeySpec::Rsa { key_file: dir.join(RSA_KEY_FILE) }
        }
        KeyAlgorithm::Ec => KeySpec::Ec { curve: request.key_curve_id.clone() },
    };
    split_usages(&request.key_usage)?;

    Ok(CsrJob {
        request,
        key,
        private_key_path: dir.join(PRIVATE_KEY_FILE),
        csr_path:         dir.join(CSR_FILE),
    })
}

// ── Worker side ───────────────────────────────────────────────────────────────

/// Build and sign the PKCS#10 request for `request` with `key`.
pub fn build_request(request: &CsrRequest, key: &PKey<Private>) -> Result<X509Req> {
    let mut name = X509NameBuilder::new()?;
    for (field, value) in request.subject_fields() {
        if value.is_empty() {
            continue;
        }
        name.append_entry_by_text(field, value).map_err(|e| {
            CertError::internal(format!("cannot set subject {field}={value}: {e}"))
        })?;
    }
    let name = name.build();

    let mut builder = X509ReqBuilder::new()?;
    builder.set_version(0)?;
    builder.set_subject_name(&name)?;
    builder.set_pubkey(key)?;

    let mut extensions = Stack::new()?;
    if !request.alternative_names.is_empty() {
        let mut san = SubjectAlternativeName::new();
        for alt in &request.alternative_names {
            if alt.parse::<IpAddr>().is_ok() {
                san.ip(alt);
            } else if alt.contains("://") {
                san.uri(alt);
            } else if alt.contains('@') {
                san.email(alt);
            } else {
                san.dns(alt);
            }
        }
        let ext = {
            let ctx = builder.x509v3_context(None);
            san.build(&ctx)?
        };
        extensions.push(ext)?;
    }

    let (basic, extended) = split_usages(&request.key_usage)?;
    if !basic.is_empty() {
        let mut ku = KeyUsageExt::new();
        for usage in basic {
            match usage {
                BasicUsage::DigitalSignature => ku.digital_signature(),
                BasicUsage::NonRepudiation   => ku.non_repudiation(),
                BasicUsage::KeyEncipherment  => ku.key_encipherment(),
                BasicUsage::DataEncipherment => ku.data_encipherment(),
                BasicUsage::KeyAgreement     => ku.key_agreement(),
                BasicUsage::KeyCertSign      => ku.key_cert_sign(),
                BasicUsage::CrlSign          => ku.crl_sign(),
                BasicUsage::EncipherOnly     => ku.encipher_only(),
                BasicUsage::DecipherOnly     => ku.decipher_only(),
            };
        }
        extensions.push(ku.build()?)?;
    }
    if !extended.is_empty() {
        let mut eku = ExtendedKeyUsage::new();
        for usage in extended {
            match usage {
                ExtendedUsage::ServerAuth      => eku.server_auth(),
                ExtendedUsage::ClientAuth      => eku.client_auth(),
                ExtendedUsage::CodeSigning     => eku.code_signing(),
                ExtendedUsage::EmailProtection => eku.email_protection(),
                ExtendedUsage::TimeStamping    => eku.time_stamping(),
                ExtendedUsage::OcspSigning     => eku.other("OCSPSigning"),
            };
        }
        extensions.push(eku.build()?)?;
    }
    if !extensions.is_empty() {
        builder.add_extensions(&extensions)?;
    }

    builder.sign(key, MessageDigest::sha256())?;
    Ok(builder.build())
}

/// Execute a job: obtain the key, sign, then write the private key and the
/// CSR. Nothing is written unless signing succeeded.
pub fn run_job(job: &CsrJob) -> Result<()> {
    let key = match &job.key {
        KeySpec::Rsa { key_file } => {
            if !key_file.exists() {
                return Err(CertError::internal(format!(
                    "service RSA key {} is missing",
                    key_file.display()
                )));
            }
            keygen::load_private_key(key_file)?
        }
        KeySpec::Ec { curve } => keygen::generate_ec(curve)?,
    };

    let req = build_request(&job.request, &key)?;
    let pem = req.to_pem()?;

    info!("writing private key to {}", job.private_key_path.display());
    keygen::write_private_key(&job.private_key_path, &key)?;

    info!("writing CSR to {}", job.csr_path.display());
    util::remove_if_exists(&job.csr_path)?;
    util::atomic_write(&job.csr_path, &pem, CSR_FILE_MODE)?;
    Ok(())
}

// ── Result object ─────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum CsrStatus {
    Pending,
    Succeeded,
    Failed,
}

impl fmt::Display for CsrStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CsrStatus::Pending   => "pending",
            CsrStatus::Succeeded => "succeeded",
            CsrStatus::Failed    => "failed",
        };
        f.write_str(s)
    }
}

/// Identifies one CSR generation; stale handles stop resolving once a newer
/// generation starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CsrHandle(pub u64);

/// The single CSR result a store exposes.
#[derive(Debug, Clone)]
pub struct CsrResult {
    pub handle:   CsrHandle,
    pub status:   CsrStatus,
    pub csr_path: PathBuf,
}

impl CsrResult {
    pub fn pending(handle: CsrHandle, csr_path: PathBuf) -> Self {
        Self { handle, status: CsrStatus::Pending, csr_path }
    }

    /// The CSR as PEM text, once generation succeeded.
    pub fn read(&self) -> Result<String> {
        match self.status {
            CsrStatus::Pending => Err(CertError::NotReady),
            CsrStatus::Failed  => Err(CertError::internal("CSR generation failed")),
            CsrStatus::Succeeded => {
                let pem = fs::read(&self.csr_path).map_err(|e| {
                    CertError::internal(format!("cannot read {}: {e}", self.csr_path.display()))
                })?;
                let req = X509Req::from_pem(&pem)?;
                String::from_utf8(req.to_pem()?)
                    .map_err(|e| CertError::internal(format!("CSR is not UTF-8: {e}")))
            }
        }
    }
}
