//! Error types for the certificate manager.
//!
//! The first group of variants are the outcomes callers act on; the `#[from]`
//! wrappers at the bottom are all internal failures (filesystem, OpenSSL,
//! serialization) that are not attributable to caller input.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CertError {
    #[error("invalid certificate: {0}")]
    InvalidCertificate(String),

    #[error("not allowed: certificate already exists")]
    DuplicateCertificate,

    #[error("not allowed: {0}")]
    CapacityExceeded(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("invalid argument {name}: {value:?}")]
    InvalidArgument { name: &'static str, value: String },

    #[error("CSR generation has not completed")]
    NotReady,

    #[error("internal failure: {0}")]
    InternalFailure(String),

    #[error("Config: {0}")]
    Config(String),

    #[error("IO: {0}")]
    Io(#[from] std::io::Error),

    #[error("OpenSSL: {0}")]
    Ssl(#[from] openssl::error::ErrorStack),

    #[error("JSON: {0}")]
    Json(#[from] serde_json::Error),
}

impl CertError {
    /// Policy rejections the caller can correct (maps to a "not allowed"
    /// outcome at the RPC boundary).
    pub fn is_not_allowed(&self) -> bool {
        matches!(self, Self::DuplicateCertificate | Self::CapacityExceeded(_))
    }

    pub(crate) fn invalid(msg: impl Into<String>) -> Self {
        Self::InvalidCertificate(msg.into())
    }

    pub(crate) fn internal(msg: impl Into<String>) -> Self {
        Self::InternalFailure(msg.into())
    }
}

pub type Result<T> = std::result::Result<T, CertError>;
