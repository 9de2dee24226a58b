//! Passive watcher for a single installed certificate file.
//!
//! The parent directory is watched rather than the file itself so that both
//! in-place rewrites (`IN_CLOSE_WRITE`) and rename-into-place replacements
//! (`IN_MOVED_TO`) are seen, and so the watch survives the file being
//! deleted and recreated.

use std::ffi::OsString;
use std::io;
use std::os::fd::{AsFd, AsRawFd, RawFd};
use std::path::{Path, PathBuf};

use log::debug;
use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify, WatchDescriptor};
use tokio::io::unix::AsyncFd;
use tokio::io::Interest;

use crate::error::{CertError, Result};

/// Newtype so the inotify descriptor can be registered with the reactor.
struct InotifyFd(Inotify);

impl AsRawFd for InotifyFd {
    fn as_raw_fd(&self) -> RawFd {
        self.0.as_fd().as_raw_fd()
    }
}

pub struct Watcher {
    fd:        AsyncFd<InotifyFd>,
    dir:       PathBuf,
    file_name: OsString,
    wd:        Option<WatchDescriptor>,
}

impl Watcher {
    /// Start watching `path`. Must be called from within a tokio runtime.
    pub fn new(path: &Path) -> Result<Self> {
        let file_name = path
            .file_name()
            .ok_or_else(|| CertError::internal(format!("{} has no file name", path.display())))?
            .to_os_string();
        let dir = match path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };

        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)
            .map_err(io::Error::from)?;
        let mut watcher = Self {
            fd: AsyncFd::try_with_interest(InotifyFd(inotify), Interest::READABLE)
                .map_err(io::Error::from)?,
            dir,
            file_name,
            wd: None,
        };
        watcher.start()?;
        Ok(watcher)
    }

    pub fn start(&mut self) -> Result<()> {
        if self.wd.is_none() {
            let wd = self
                .fd
                .get_ref()
                .0
                .add_watch(&self.dir, AddWatchFlags::IN_CLOSE_WRITE | AddWatchFlags::IN_MOVED_TO)
                .map_err(io::Error::from)?;
            debug!("watching {}/{:?}", self.dir.display(), self.file_name);
            self.wd = Some(wd);
        }
        Ok(())
    }

    pub fn stop(&mut self) -> Result<()> {
        if let Some(wd) = self.wd.take() {
            self.fd.get_ref().0.rm_watch(wd).map_err(io::Error::from)?;
        }
        Ok(())
    }

    /// Wait until the watched file is written or replaced.
    ///
    /// Events for other names in the directory, and events queued before a
    /// `stop()`, are discarded.
    pub async fn changed(&mut self) -> Result<()> {
        loop {
            let mut guard = self.fd.readable().await?;
            let events = match guard.try_io(|fd| fd.get_ref().0.read_events().map_err(io::Error::from)) {
                Ok(result) => result?,
                Err(_would_block) => continue,
            };
            let hit = events.iter().any(|ev| {
                self.wd == Some(ev.wd) && ev.name.as_deref() == Some(self.file_name.as_os_str())
            });
            if hit {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tokio::time::timeout;

    const WAIT: Duration = Duration::from_secs(5);
    const QUIET: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn fires_on_write_and_rename() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.pem");
        let mut watcher = Watcher::new(&path).unwrap();

        fs::write(&path, "one").unwrap();
        timeout(WAIT, watcher.changed()).await.unwrap().unwrap();

        let staged = dir.path().join("staged");
        fs::write(&staged, "two").unwrap();
        // the write to "staged" must not count
        fs::rename(&staged, &path).unwrap();
        timeout(WAIT, watcher.changed()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn ignores_other_files_and_stopped_periods() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("client.pem");
        let mut watcher = Watcher::new(&path).unwrap();

        fs::write(dir.path().join("other.pem"), "x").unwrap();
        assert!(timeout(QUIET, watcher.changed()).await.is_err());

        watcher.stop().unwrap();
        fs::write(&path, "own write").unwrap();
        watcher.start().unwrap();
        assert!(timeout(QUIET, watcher.changed()).await.is_err());

        fs::write(&path, "external").unwrap();
        timeout(WAIT, watcher.changed()).await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn registers_with_reactor_and_rejects_bare_root() {
        assert!(Watcher::new(Path::new("/")).is_err());

        let dir = tempfile::tempdir().unwrap();
        let mut watcher = Watcher::new(&dir.path().join("ca.pem")).unwrap();
        assert!(timeout(QUIET, watcher.changed()).await.is_err());
    }
}
