//! Certificate store and its event loop.
//!
//! A [`Manager`] owns every entry of one store. All operations run to
//! completion on a single task; the other sources of events (the install-path
//! watcher and CSR worker completions) are multiplexed into the same loop by
//! [`Manager::run`], so no locking is needed anywhere in the store.
//!
//! Flow of a mutation:
//!   1. validate against capacity / uniqueness
//!   2. write the backing file (watcher paused for Server/Client)
//!   3. update the entry list
//!   4. rebuild the Authority link layout
//!   5. reload the consuming service

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::certificate::{self, CertId, CertSource, Certificate};
use crate::config::{CertType, StoreConfig};
use crate::csr::{self, CsrHandle, CsrRequest, CsrResult, CsrStatus};
use crate::error::{CertError, Result};
use crate::executor::{BackgroundExecutor, TaskOutcome};
use crate::keygen::{self, RSA_KEY_FILE};
use crate::layout;
use crate::reload::ServiceReloader;
use crate::watch::Watcher;

const STORE_DIR_MODE: u32 = 0o700;
const REQUEST_QUEUE:  usize = 16;
const BACKING_PREFIX: &str = "cert-";

/// One row of [`Manager::list`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EntrySummary {
    pub id:          CertId,
    pub object_path: String,
    pub subject:     String,
    pub issuer:      String,
    pub not_before:  i64,
    pub not_after:   i64,
}

type CsrCompletion = (CsrHandle, TaskOutcome);

pub struct Manager {
    config:   StoreConfig,
    entries:  Vec<Certificate>,
    next_id:  u64,
    watcher:  Option<Watcher>,
    reloader: Box<dyn ServiceReloader>,
    executor: Box<dyn BackgroundExecutor>,

    csr:            Option<CsrResult>,
    csr_generation: u64,
    csr_tx:         mpsc::UnboundedSender<CsrCompletion>,
    csr_rx:         mpsc::UnboundedReceiver<CsrCompletion>,
}

impl Manager {
    /// Open the store described by `config`: create its directory, adopt what
    /// is already on disk and start watching. Must run inside a tokio runtime.
    pub fn new(
        config:   StoreConfig,
        reloader: Box<dyn ServiceReloader>,
        executor: Box<dyn BackgroundExecutor>,
    ) -> Result<Self> {
        let dir = config.store_dir();
        fs::create_dir_all(&dir).map_err(|e| {
            CertError::internal(format!("cannot create {}: {e}", dir.display()))
        })?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(STORE_DIR_MODE))?;

        let (csr_tx, csr_rx) = mpsc::unbounded_channel();
        let mut mgr = Self {
            config,
            entries: Vec::new(),
            next_id: 1,
            watcher: None,
            reloader,
            executor,
            csr: None,
            csr_generation: 0,
            csr_tx,
            csr_rx,
        };

        match mgr.config.cert_type {
            CertType::Server | CertType::Client => {
                let key_file = mgr.config.csr_dir().join(RSA_KEY_FILE);
                if let Err(e) = keygen::ensure_rsa_key_file(&key_file) {
                    error!("cannot create service RSA key {}: {e}", key_file.display());
                }
                mgr.scan_single();
                match Watcher::new(&mgr.config.install_path) {
                    Ok(w)  => mgr.watcher = Some(w),
                    Err(e) => error!("cannot watch {}: {e}", mgr.config.install_path.display()),
                }
            }
            CertType::Authority => {
                mgr.scan_authority()?;
                mgr.rebuild_layout()?;
                mgr.migrate_legacy();
            }
        }

        info!(
            "{} store {} ready with {} certificate(s)",
            mgr.config.cert_type,
            mgr.config.object_path(),
            mgr.entries.len()
        );
        Ok(mgr)
    }

    // ── Store operations ──────────────────────────────────────────────────────

    pub fn install(&mut self, source: CertSource) -> Result<CertId> {
        self.check_capacity()?;
        let parsed = certificate::parse(source.read()?, self.config.cert_type)?;
        if self.entries.iter().any(|e| e.is_same(&parsed.raw)) {
            return Err(CertError::DuplicateCertificate);
        }

        let id = CertId(self.next_id);
        let path = self.new_backing_path(id);
        self.pause_watch();
        let installed = Certificate::install(id, self.config.cert_type, path, parsed);
        self.resume_watch();

        self.entries.push(installed?);
        self.next_id += 1;
        self.commit()?;
        Ok(id)
    }

    pub fn replace(&mut self, id: CertId, source: CertSource) -> Result<()> {
        let idx = self.position(id)?;
        let parsed = certificate::parse(source.read()?, self.config.cert_type)?;
        let duplicate = self
            .entries
            .iter()
            .enumerate()
            .any(|(i, e)| i != idx && e.is_same(&parsed.raw));
        if duplicate {
            return Err(CertError::DuplicateCertificate);
        }

        self.pause_watch();
        let replaced = self.entries[idx].replace(parsed);
        self.resume_watch();
        replaced?;

        self.commit()
    }

    pub fn delete(&mut self, id: CertId) -> Result<()> {
        let idx = self.position(id)?;
        self.entries[idx].remove()?;
        self.entries.remove(idx);
        self.commit()
    }

    /// Remove every entry. Files that cannot be removed are logged; the first
    /// such failure is returned after the store has been emptied.
    pub fn delete_all(&mut self) -> Result<()> {
        let mut failed = None;
        for entry in self.entries.drain(..) {
            if let Err(e) = entry.remove() {
                error!("delete-all: {e}");
                failed.get_or_insert(e);
            }
        }
        self.commit()?;
        failed.map_or(Ok(()), Err)
    }

    pub fn list(&self) -> Vec<EntrySummary> {
        self.entries
            .iter()
            .map(|e| {
                let identity = e.identity();
                EntrySummary {
                    id:          e.id(),
                    object_path: self.entry_object_path(e.id()),
                    subject:     identity.subject.clone(),
                    issuer:      identity.issuer.clone(),
                    not_before:  identity.not_before,
                    not_after:   identity.not_after,
                }
            })
            .collect()
    }

    pub fn entry_object_path(&self, id: CertId) -> String {
        format!("{}/{id}", self.config.object_path())
    }

    // ── CSR pipeline ──────────────────────────────────────────────────────────

    /// Start a CSR generation. The previous result is discarded first, even
    /// when the new request turns out to be invalid.
    pub fn generate_csr(&mut self, request: CsrRequest) -> Result<CsrHandle> {
        self.csr = None;
        let job = csr::prepare(request, &self.config.csr_dir())?;
        let completion = self.executor.execute(&job)?;

        self.csr_generation += 1;
        let handle = CsrHandle(self.csr_generation);
        self.csr = Some(CsrResult::pending(handle, job.csr_path));

        let tx = self.csr_tx.clone();
        tokio::spawn(async move {
            let outcome = completion.await;
            let _ = tx.send((handle, outcome));
        });
        info!("CSR generation {} started", handle.0);
        Ok(handle)
    }

    pub fn read_csr(&self, handle: CsrHandle) -> Result<String> {
        self.csr_result(handle)?.read()
    }

    pub fn csr_status(&self, handle: CsrHandle) -> Result<CsrStatus> {
        Ok(self.csr_result(handle)?.status)
    }

    fn csr_result(&self, handle: CsrHandle) -> Result<&CsrResult> {
        match &self.csr {
            Some(result) if result.handle == handle => Ok(result),
            _ => Err(CertError::NotFound(format!("CSR request {}", handle.0))),
        }
    }

    fn on_csr_complete(&mut self, handle: CsrHandle, outcome: TaskOutcome) {
        match &mut self.csr {
            Some(result) if result.handle == handle => {
                result.status = match outcome {
                    TaskOutcome::Success => CsrStatus::Succeeded,
                    TaskOutcome::Failure => CsrStatus::Failed,
                };
                match result.status {
                    CsrStatus::Succeeded => info!("CSR generation {} succeeded", handle.0),
                    _ => error!("CSR generation {} failed", handle.0),
                }
            }
            _ => debug!("ignoring completion of superseded CSR generation {}", handle.0),
        }
    }

    // ── Watcher ───────────────────────────────────────────────────────────────

    fn on_file_changed(&mut self) {
        match self.entries.first_mut() {
            Some(entry) => match entry.refresh() {
                Ok(()) => info!("certificate {} changed on disk", entry.id()),
                Err(e) => error!("cannot refresh certificate {}: {e}", entry.id()),
            },
            None => self.scan_single(),
        }
    }

    fn pause_watch(&mut self) {
        if let Some(w) = &mut self.watcher {
            if let Err(e) = w.stop() {
                warn!("cannot pause watcher: {e}");
            }
        }
    }

    fn resume_watch(&mut self) {
        if let Some(w) = &mut self.watcher {
            if let Err(e) = w.start() {
                error!("cannot resume watcher: {e}");
            }
        }
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    fn position(&self, id: CertId) -> Result<usize> {
        self.entries
            .iter()
            .position(|e| e.id() == id)
            .ok_or_else(|| CertError::NotFound(format!("certificate {id}")))
    }

    fn check_capacity(&self) -> Result<()> {
        match self.config.cert_type {
            CertType::Server | CertType::Client if !self.entries.is_empty() => {
                Err(CertError::CapacityExceeded("certificate already exists".into()))
            }
            CertType::Authority if self.entries.len() >= self.config.max_authority_certs => {
                Err(CertError::CapacityExceeded("certificates limit reached".into()))
            }
            _ => Ok(()),
        }
    }

    /// Authority files carry their id in the name, so a later process adopts
    /// each file under the id it was installed with.
    fn new_backing_path(&self, id: CertId) -> PathBuf {
        match self.config.cert_type {
            CertType::Authority => self
                .config
                .install_path
                .join(format!("{BACKING_PREFIX}{:06}.{}.pem", id.0, Uuid::new_v4())),
            _ => self.config.install_path.clone(),
        }
    }

    /// Post-mutation bookkeeping. The mutation itself is already committed.
    fn commit(&mut self) -> Result<()> {
        let rebuilt = self.rebuild_layout();
        self.reload();
        rebuilt
    }

    fn rebuild_layout(&self) -> Result<()> {
        if self.config.cert_type != CertType::Authority {
            return Ok(());
        }
        let links = layout::plan(
            self.entries
                .iter()
                .map(|e| (e.identity().subject_hash, e.file_path())),
        );
        layout::rebuild(&self.config.install_path, &links).map_err(|e| {
            error!("cannot rebuild links in {}: {e}", self.config.install_path.display());
            match e {
                CertError::InternalFailure(_) => e,
                other => CertError::internal(other.to_string()),
            }
        })
    }

    fn reload(&self) {
        let unit = &self.config.unit;
        if unit.is_empty() {
            return;
        }
        match self.reloader.reload_or_restart(unit) {
            Ok(())  => info!("reloaded {unit}"),
            Err(e)  => error!("cannot reload {unit}: {e}"),
        }
    }

    /// Adopt the Server/Client install file if one is present.
    fn scan_single(&mut self) {
        let path = self.config.install_path.clone();
        if !path.exists() {
            return;
        }
        let id = CertId(self.next_id);
        match Certificate::load(id, self.config.cert_type, &path) {
            Ok(entry) => {
                info!("adopted certificate {id} from {}", path.display());
                self.entries.push(entry);
                self.next_id += 1;
            }
            Err(e) => error!("ignoring {}: {e}", path.display()),
        }
    }

    /// Adopt every certificate file in the Authority directory.
    ///
    /// Files written by the store are adopted under the id in their name, in
    /// id order. Any other file is adopted after them under a fresh id and
    /// renamed to carry it.
    fn scan_authority(&mut self) -> Result<()> {
        let dir = self.config.install_path.clone();
        let mut numbered = Vec::new();
        let mut foreign = Vec::new();
        for dent in fs::read_dir(&dir)? {
            let dent = dent?;
            let name = dent.file_name().to_string_lossy().into_owned();
            if !dent.file_type()?.is_file() || name.starts_with('.') {
                continue;
            }
            match backing_file_id(&name) {
                Some(id) => numbered.push((id, dent.path())),
                None => foreign.push(dent.path()),
            }
        }
        numbered.sort();
        foreign.sort();
        self.next_id = numbered.last().map_or(1, |(id, _)| id + 1);

        for (id, path) in numbered {
            if self.entries.last().is_some_and(|e| e.id() == CertId(id)) {
                warn!("{} reuses certificate id {id}", path.display());
                continue;
            }
            self.adopt_authority(CertId(id), &path);
        }
        for path in foreign {
            let id = CertId(self.next_id);
            if self.adopt_authority(id, &path) {
                self.next_id += 1;
                let to = self.new_backing_path(id);
                if let Some(entry) = self.entries.last_mut() {
                    if let Err(e) = entry.relocate(to) {
                        warn!("{e}; its id will change on restart");
                    }
                }
            }
        }
        Ok(())
    }

    fn adopt_authority(&mut self, id: CertId, path: &Path) -> bool {
        if self.entries.len() >= self.config.max_authority_certs {
            warn!("certificate limit reached; not adopting {}", path.display());
            return false;
        }
        match Certificate::load(id, CertType::Authority, path) {
            Ok(entry) if self.entries.iter().any(|e| e.is_same(entry.raw())) => {
                warn!("{} duplicates an adopted certificate", path.display());
                false
            }
            Ok(entry) => {
                debug!("adopted certificate {id} from {}", path.display());
                self.entries.push(entry);
                true
            }
            Err(e) => {
                error!("ignoring {}: {e}", path.display());
                false
            }
        }
    }

    /// Move a pre-existing single-file trust anchor into the store.
    fn migrate_legacy(&mut self) {
        let legacy = self.config.legacy_authority_path.clone();
        let non_empty = fs::metadata(&legacy).map(|m| m.len() > 0).unwrap_or(false);
        if !non_empty {
            return;
        }
        info!("migrating legacy authority certificate {}", legacy.display());
        match self.install(CertSource::Path(legacy.clone())) {
            Ok(_) | Err(CertError::DuplicateCertificate) => {
                if let Err(e) = fs::remove_file(&legacy) {
                    error!("cannot remove {}: {e}", legacy.display());
                }
            }
            Err(e) => error!("legacy migration of {} failed: {e}", legacy.display()),
        }
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    // ── Event loop ────────────────────────────────────────────────────────────

    /// Move the store onto its own task and return a handle to it.
    /// The task ends once every handle has been dropped.
    pub fn spawn(self) -> (ManagerHandle, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(REQUEST_QUEUE);
        let task = tokio::spawn(self.run(rx));
        (ManagerHandle { tx }, task)
    }

    async fn run(mut self, mut requests: mpsc::Receiver<Request>) {
        loop {
            let event = tokio::select! {
                req = requests.recv() => match req {
                    Some(req) => Event::Request(req),
                    None => break,
                },
                changed = file_changed(&mut self.watcher) => Event::FileChanged(changed),
                Some((handle, outcome)) = self.csr_rx.recv() => Event::CsrDone(handle, outcome),
            };

            match event {
                Event::Request(req) => self.handle(req),
                Event::FileChanged(Ok(())) => self.on_file_changed(),
                Event::FileChanged(Err(e)) => {
                    error!("watcher failed, no longer watching: {e}");
                    self.watcher = None;
                }
                Event::CsrDone(handle, outcome) => self.on_csr_complete(handle, outcome),
            }
        }
        debug!("certificate manager for {} stopped", self.config.object_path());
    }

    fn handle(&mut self, req: Request) {
        // A dropped reply receiver only means the caller went away.
        match req {
            Request::Install { source, reply }     => { let _ = reply.send(self.install(source)); }
            Request::Replace { id, source, reply } => { let _ = reply.send(self.replace(id, source)); }
            Request::Delete { id, reply }          => { let _ = reply.send(self.delete(id)); }
            Request::DeleteAll { reply }           => { let _ = reply.send(self.delete_all()); }
            Request::List { reply }                => { let _ = reply.send(self.list()); }
            Request::GenerateCsr { request, reply } => {
                let _ = reply.send(self.generate_csr(request));
            }
            Request::ReadCsr { handle, reply }     => { let _ = reply.send(self.read_csr(handle)); }
            Request::CsrStatus { handle, reply }   => { let _ = reply.send(self.csr_status(handle)); }
        }
    }
}

/// The id encoded in a backing file name written by [`Manager::install`].
fn backing_file_id(name: &str) -> Option<u64> {
    let (digits, _) = name.strip_prefix(BACKING_PREFIX)?.split_once('.')?;
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok().filter(|id| *id > 0)
}

async fn file_changed(watcher: &mut Option<Watcher>) -> Result<()> {
    match watcher {
        Some(w) => w.changed().await,
        None => std::future::pending().await,
    }
}

enum Event {
    Request(Request),
    FileChanged(Result<()>),
    CsrDone(CsrHandle, TaskOutcome),
}

enum Request {
    Install     { source: CertSource, reply: oneshot::Sender<Result<CertId>> },
    Replace     { id: CertId, source: CertSource, reply: oneshot::Sender<Result<()>> },
    Delete      { id: CertId, reply: oneshot::Sender<Result<()>> },
    DeleteAll   { reply: oneshot::Sender<Result<()>> },
    List        { reply: oneshot::Sender<Vec<EntrySummary>> },
    GenerateCsr { request: CsrRequest, reply: oneshot::Sender<Result<CsrHandle>> },
    ReadCsr     { handle: CsrHandle, reply: oneshot::Sender<Result<String>> },
    CsrStatus   { handle: CsrHandle, reply: oneshot::Sender<Result<CsrStatus>> },
}

// ── Handle ────────────────────────────────────────────────────────────────────

/// Cloneable front end to a running [`Manager`].
#[derive(Clone)]
pub struct ManagerHandle {
    tx: mpsc::Sender<Request>,
}

impl ManagerHandle {
    async fn call<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Request) -> Result<T> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(make(reply))
            .await
            .map_err(|_| CertError::internal("certificate manager is not running"))?;
        rx.await
            .map_err(|_| CertError::internal("certificate manager stopped"))
    }

    pub async fn install(&self, source: CertSource) -> Result<CertId> {
        self.call(|reply| Request::Install { source, reply }).await?
    }

    pub async fn replace(&self, id: CertId, source: CertSource) -> Result<()> {
        self.call(|reply| Request::Replace { id, source, reply }).await?
    }

    pub async fn delete(&self, id: CertId) -> Result<()> {
        self.call(|reply| Request::Delete { id, reply }).await?
    }

    pub async fn delete_all(&self) -> Result<()> {
        self.call(|reply| Request::DeleteAll { reply }).await?
    }

    pub async fn list(&self) -> Result<Vec<EntrySummary>> {
        self.call(|reply| Request::List { reply }).await
    }

    pub async fn generate_csr(&self, request: CsrRequest) -> Result<CsrHandle> {
        self.call(|reply| Request::GenerateCsr { request, reply }).await?
    }

    pub async fn read_csr(&self, handle: CsrHandle) -> Result<String> {
        self.call(|reply| Request::ReadCsr { handle, reply }).await?
    }

    pub async fn csr_status(&self, handle: CsrHandle) -> Result<CsrStatus> {
        self.call(|reply| Request::CsrStatus { handle, reply }).await?
    }
}
