//! Background execution of CSR jobs.
//!
//! Key generation can take long enough to stall the event loop, and a crash
//! inside OpenSSL must not take the store down with it, so the production
//! executor runs each job in a fresh child process: the daemon binary itself,
//! invoked as `certmgr csr-worker` with the job as JSON on stdin. Only the
//! exit status crosses back.

use std::path::PathBuf;
use std::process::Stdio;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use log::{debug, error, warn};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::csr::CsrJob;
use crate::error::{CertError, Result};

/// Hidden subcommand the child is started with.
pub const WORKER_SUBCOMMAND: &str = "csr-worker";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// Resolves once the background task has finished.
pub type Completion = BoxFuture<'static, TaskOutcome>;

pub trait BackgroundExecutor: Send {
    /// Start `job`. An `Err` means the task could not be started at all.
    fn execute(&self, job: &CsrJob) -> Result<Completion>;
}

pub struct ProcessExecutor {
    program: PathBuf,
}

impl ProcessExecutor {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self { program: program.into() }
    }

    /// Re-execute the running binary.
    pub fn current_exe() -> Result<Self> {
        let exe = std::env::current_exe()
            .map_err(|e| CertError::internal(format!("cannot locate own executable: {e}")))?;
        Ok(Self::new(exe))
    }
}

impl BackgroundExecutor for ProcessExecutor {
    fn execute(&self, job: &CsrJob) -> Result<Completion> {
        let payload = serde_json::to_vec(job)?;

        let mut child = Command::new(&self.program)
            .arg(WORKER_SUBCOMMAND)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::inherit())
            .spawn()
            .map_err(|e| {
                CertError::internal(format!("cannot start {}: {e}", self.program.display()))
            })?;
        let mut stdin = child
            .stdin
            .take()
            .ok_or_else(|| CertError::internal("CSR worker has no stdin"))?;
        let pid = child.id().unwrap_or_default();
        debug!("CSR worker started (pid {pid})");

        Ok(async move {
            if let Err(e) = stdin.write_all(&payload).await {
                warn!("cannot send job to CSR worker {pid}: {e}");
            }
            drop(stdin);

            match child.wait().await {
                Ok(status) if status.success() => TaskOutcome::Success,
                Ok(status) => {
                    warn!("CSR worker {pid} exited with {status}");
                    TaskOutcome::Failure
                }
                Err(e) => {
                    error!("waiting for CSR worker {pid}: {e}");
                    TaskOutcome::Failure
                }
            }
        }
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::csr::{self, CsrRequest};

    fn job() -> CsrJob {
        csr::prepare(CsrRequest::default(), std::path::Path::new("/tmp")).unwrap()
    }

    // `true` and `false` ignore their arguments and stdin, which is enough to
    // check the exit-status mapping without the real worker.
    #[tokio::test]
    async fn exit_status_is_outcome() {
        let ok = ProcessExecutor::new("true").execute(&job()).unwrap();
        assert_eq!(ok.await, TaskOutcome::Success);

        let failed = ProcessExecutor::new("false").execute(&job()).unwrap();
        assert_eq!(failed.await, TaskOutcome::Failure);
    }

    #[tokio::test]
    async fn spawn_failure_is_reported_synchronously() {
        let err = ProcessExecutor::new("/nonexistent/certmgr").execute(&job()).err().unwrap();
        assert!(matches!(err, CertError::InternalFailure(_)), "{err}");
    }
}
