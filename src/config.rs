//! Certificate manager configuration.
//!
//! Parses a `key = value` file (same layout as the other device daemon
//! configs); command-line flags are applied on top by `main`.

use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use crate::error::{CertError, Result};

// Default policy constants
pub const MAX_AUTHORITY_CERTS: usize = 10;
const LEGACY_AUTHORITY_PATH:   &str  = "/etc/ssl/certs/Root-CA.pem";
const OBJECT_PREFIX:           &str  = "/xyz/openbmc_project/certs";

/// Which kind of service a store holds certificates for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CertType {
    /// Single certificate + private key presented by a local server.
    Server,
    /// Single certificate + private key presented by a local client.
    Client,
    /// Directory of trusted certificates, hash-indexed for OpenSSL lookup.
    Authority,
}

impl Default for CertType {
    fn default() -> Self { CertType::Server }
}

impl CertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CertType::Server    => "server",
            CertType::Client    => "client",
            CertType::Authority => "authority",
        }
    }

    /// Server and Client stores hold exactly one certificate with its key.
    pub fn is_single(&self) -> bool {
        !matches!(self, CertType::Authority)
    }
}

impl fmt::Display for CertType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CertType {
    type Err = CertError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "server"    => Ok(CertType::Server),
            "client"    => Ok(CertType::Client),
            "authority" => Ok(CertType::Authority),
            other       => Err(CertError::Config(format!("unknown certificate type {other:?}"))),
        }
    }
}

/// Settings for one certificate store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub cert_type: CertType,
    /// Service endpoint name (e.g. "https", "ldap"); part of object paths.
    pub endpoint: String,
    /// Server/Client: certificate file. Authority: certificate directory.
    pub install_path: PathBuf,
    /// Unit to reload after every change; empty disables the reload hook.
    pub unit: String,
    pub max_authority_certs: usize,
    /// Single-file trust anchor migrated into an Authority store at startup.
    pub legacy_authority_path: PathBuf,
    pub object_prefix: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            cert_type:             CertType::Server,
            endpoint:              String::new(),
            install_path:          PathBuf::new(),
            unit:                  String::new(),
            max_authority_certs:   MAX_AUTHORITY_CERTS,
            legacy_authority_path: PathBuf::from(LEGACY_AUTHORITY_PATH),
            object_prefix:         OBJECT_PREFIX.to_string(),
        }
    }
}

impl StoreConfig {
    /// Externally visible path of this store, e.g.
    /// `/xyz/openbmc_project/certs/server/https`.
    pub fn object_path(&self) -> String {
        format!("{}/{}/{}", self.object_prefix, self.cert_type, self.endpoint)
    }

    /// Directory holding the store's files: the install path itself for
    /// Authority stores, its parent otherwise.
    pub fn store_dir(&self) -> PathBuf {
        if self.cert_type.is_single() {
            parent_or_dot(&self.install_path)
        } else {
            self.install_path.clone()
        }
    }

    /// Directory receiving the service RSA key and the CSR artifacts.
    pub fn csr_dir(&self) -> PathBuf {
        parent_or_dot(&self.install_path)
    }
}

fn parent_or_dot(path: &Path) -> PathBuf {
    match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    }
}

/// Full daemon configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub store:      StoreConfig,
    pub pid_file:   Option<PathBuf>,
    pub log_syslog: bool,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            store:      StoreConfig::default(),
            pid_file:   None,
            log_syslog: true,
        }
    }
}

/// Parse `path` as a `certmgr.conf` key=value configuration file.
pub fn load_config(path: &Path) -> Result<ServiceConfig> {
    let content = fs::read_to_string(path)
        .map_err(|e| CertError::Config(format!("cannot read {}: {e}", path.display())))?;
    parse_config(&content)
}

/// Parse configuration text; unknown keys are ignored.
pub fn parse_config(content: &str) -> Result<ServiceConfig> {
    let mut cfg = ServiceConfig::default();

    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let mut parts = line.splitn(2, '=');
        let key = match parts.next() {
            Some(k) => k.trim().to_ascii_lowercase(),
            None => continue,
        };
        let val = match parts.next() {
            Some(v) => v.trim().to_string(),
            None => continue,
        };
        if val.is_empty() {
            continue;
        }

        match key.as_str() {
            "type"                  => cfg.store.cert_type             = val.parse()?,
            "endpoint"              => cfg.store.endpoint              = val,
            "install_path"          => cfg.store.install_path          = PathBuf::from(&val),
            "unit"                  => cfg.store.unit                  = val,
            "max_authority_certs"   => {
                cfg.store.max_authority_certs = val.parse().unwrap_or(MAX_AUTHORITY_CERTS);
            }
            "legacy_authority_path" => cfg.store.legacy_authority_path = PathBuf::from(&val),
            "object_prefix"         => cfg.store.object_prefix         = val,
            "pid_file"              => cfg.pid_file                    = Some(PathBuf::from(&val)),
            "log_syslog"            => cfg.log_syslog = val == "true" || val == "1" || val == "yes",
            _ => {} // ignore unknown keys
        }
    }

    Ok(cfg)
}

/// Validate that required fields are populated.
pub fn validate_config(cfg: &StoreConfig) -> Result<()> {
    if cfg.install_path.as_os_str().is_empty() {
        return Err(CertError::Config("install_path is required".into()));
    }
    if cfg.endpoint.is_empty() {
        return Err(CertError::Config("endpoint is required".into()));
    }
    if cfg.cert_type == CertType::Authority && cfg.max_authority_certs == 0 {
        return Err(CertError::Config("max_authority_certs must be at least 1".into()));
    }
    if cfg.cert_type.is_single() && cfg.install_path.file_name().is_none() {
        return Err(CertError::Config(format!(
            "install_path {} must name a file for {} certificates",
            cfg.install_path.display(),
            cfg.cert_type
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_file() {
        let text = "\
# LDAP trust anchors
type = authority
endpoint = ldap
install_path = /etc/ssl/certs/authority
unit = nslcd.service
max_authority_certs = 4
log_syslog = no
bogus = ignored
";
        let cfg = parse_config(text).unwrap();
        assert_eq!(cfg.store.cert_type, CertType::Authority);
        assert_eq!(cfg.store.endpoint, "ldap");
        assert_eq!(cfg.store.install_path, PathBuf::from("/etc/ssl/certs/authority"));
        assert_eq!(cfg.store.unit, "nslcd.service");
        assert_eq!(cfg.store.max_authority_certs, 4);
        assert!(!cfg.log_syslog);
        assert_eq!(cfg.store.object_path(), "/xyz/openbmc_project/certs/authority/ldap");
        assert_eq!(cfg.store.store_dir(), PathBuf::from("/etc/ssl/certs/authority"));
        assert_eq!(cfg.store.csr_dir(), PathBuf::from("/etc/ssl/certs"));
    }

    #[test]
    fn unknown_type_rejected() {
        let err = parse_config("type = bogus").unwrap_err();
        assert!(matches!(err, CertError::Config(_)), "{err}");
    }

    #[test]
    fn bad_number_falls_back_to_default() {
        let cfg = parse_config("max_authority_certs = lots").unwrap();
        assert_eq!(cfg.store.max_authority_certs, MAX_AUTHORITY_CERTS);
    }

    #[test]
    fn validation_requires_path_and_endpoint() {
        let mut cfg = StoreConfig::default();
        assert!(validate_config(&cfg).is_err());
        cfg.install_path = PathBuf::from("/etc/ssl/certs/https/server.pem");
        assert!(validate_config(&cfg).is_err());
        cfg.endpoint = "https".into();
        validate_config(&cfg).unwrap();
        assert_eq!(cfg.store_dir(), PathBuf::from("/etc/ssl/certs/https"));
    }
}
