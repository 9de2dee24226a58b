//! Service reload hook, run after every committed store mutation.

use std::path::PathBuf;
use std::process::{Command, Stdio};

use log::debug;

use crate::error::{CertError, Result};

pub trait ServiceReloader: Send {
    /// Ask the service supervisor to reload (or restart) `unit`.
    fn reload_or_restart(&self, unit: &str) -> Result<()>;
}

/// `systemctl reload-or-restart <unit>`; blocks until systemctl returns.
pub struct Systemctl {
    program: PathBuf,
}

impl Systemctl {
    pub fn new() -> Self {
        Self::with_program("systemctl")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }
}

impl Default for Systemctl {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceReloader for Systemctl {
    fn reload_or_restart(&self, unit: &str) -> Result<()> {
        debug!("{} reload-or-restart {unit}", self.program.display());
        let status = Command::new(&self.program)
            .args(["reload-or-restart", unit])
            .stdin(Stdio::null())
            .status()
            .map_err(|e| {
                CertError::internal(format!("cannot run {}: {e}", self.program.display()))
            })?;
        if !status.success() {
            return Err(CertError::internal(format!(
                "reload-or-restart {unit} failed: {status}"
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exit_status_maps_to_result() {
        Systemctl::with_program("true").reload_or_restart("nginx.service").unwrap();

        let err = Systemctl::with_program("false")
            .reload_or_restart("nginx.service")
            .unwrap_err();
        assert!(matches!(err, CertError::InternalFailure(_)), "{err}");
    }

    #[test]
    fn missing_program_is_internal_failure() {
        let err = Systemctl::with_program("/nonexistent/systemctl")
            .reload_or_restart("nslcd.service")
            .unwrap_err();
        assert!(matches!(err, CertError::InternalFailure(_)), "{err}");
    }
}
