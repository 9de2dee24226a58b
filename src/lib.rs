//! Certificate lifecycle manager: Server, Client and Authority certificate
//! stores with CSR generation in an isolated worker process.

pub mod certificate;
pub mod config;
pub mod csr;
pub mod error;
pub mod executor;
pub mod keygen;
pub mod layout;
pub mod manager;
pub mod reload;
pub mod util;
pub mod watch;

#[cfg(test)]
mod testutil;

pub use certificate::{CertId, CertSource};
pub use config::{CertType, ServiceConfig, StoreConfig};
pub use csr::{CsrHandle, CsrRequest, CsrStatus};
pub use error::{CertError, Result};
pub use manager::{EntrySummary, Manager, ManagerHandle};
