//! Certificate manager daemon and command-line front end.
//!
//! Usage:
//!   certmgr -c /etc/certmgr/https.conf                 # serve (default)
//!   certmgr -c /etc/certmgr/ldap-ca.conf list --json
//!   certmgr -t server -e https -p /etc/ssl/certs/https/server.pem install bundle.pem
//!   certmgr -c /etc/certmgr/https.conf generate-csr --common-name host.example

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use tokio::signal::unix::{signal, SignalKind};

use certmgr::config::{self, ServiceConfig, StoreConfig};
use certmgr::csr::{self, CsrJob, CsrRequest, CsrStatus};
use certmgr::executor::ProcessExecutor;
use certmgr::reload::Systemctl;
use certmgr::util;
use certmgr::{CertId, CertSource, EntrySummary, Manager, ManagerHandle};

const DEFAULT_CONFIG: &str = "/etc/certmgr/certmgr.conf";
const CSR_POLL:       Duration = Duration::from_millis(200);

// ── CLI ───────────────────────────────────────────────────────────────────────

#[derive(Debug, Parser)]
#[command(name = "certmgr", about = "X.509 certificate store manager")]
struct Cli {
    /// Path to the configuration file.
    #[arg(short = 'c', long = "config")]
    config: Option<PathBuf>,

    /// Log to stderr instead of syslog (useful for debugging).
    #[arg(long)]
    stderr: bool,

    /// Store type: server, client or authority.
    #[arg(short = 't', long = "type")]
    cert_type: Option<String>,

    /// Service endpoint name (e.g. https, ldap).
    #[arg(short = 'e', long)]
    endpoint: Option<String>,

    /// Certificate file (server/client) or directory (authority).
    #[arg(short = 'p', long = "path")]
    install_path: Option<PathBuf>,

    /// Unit to reload after changes.
    #[arg(short = 'u', long)]
    unit: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the store daemon (default).
    Serve,

    #[command(flatten)]
    Store(StoreCommand),

    /// Generate one CSR from a JSON job on stdin (started by the daemon).
    #[command(hide = true)]
    CsrWorker,
}

#[derive(Debug, Subcommand)]
enum StoreCommand {
    /// Install a PEM file.
    Install { file: PathBuf },
    /// Replace certificate <ID> with a PEM file.
    Replace { id: u64, file: PathBuf },
    /// Delete certificate <ID>.
    Delete { id: u64 },
    /// Delete every certificate in the store.
    DeleteAll,
    /// List installed certificates.
    List {
        #[arg(long)]
        json: bool,
    },
    /// Generate a CSR and print it once ready.
    GenerateCsr(CsrArgs),
}

#[derive(Debug, Clone, Args)]
struct CsrArgs {
    #[arg(long = "alt-name")]
    alternative_names: Vec<String>,
    #[arg(long, default_value = "")]
    challenge_password: String,
    #[arg(long, default_value = "")]
    city: String,
    #[arg(long, default_value = "")]
    common_name: String,
    #[arg(long, default_value = "")]
    contact_person: String,
    #[arg(long, default_value = "")]
    country: String,
    #[arg(long, default_value = "")]
    email: String,
    #[arg(long, default_value = "")]
    given_name: String,
    #[arg(long, default_value = "")]
    initials: String,
    /// RSA modulus size; 0 selects the default.
    #[arg(long, default_value_t = 0)]
    key_bit_length: i64,
    /// EC curve name; empty selects secp224r1.
    #[arg(long, default_value = "")]
    key_curve_id: String,
    /// RSA or EC (default).
    #[arg(long, default_value = "")]
    key_pair_algorithm: String,
    #[arg(long = "key-usage")]
    key_usage: Vec<String>,
    #[arg(long, default_value = "")]
    organization: String,
    #[arg(long, default_value = "")]
    organizational_unit: String,
    #[arg(long, default_value = "")]
    state: String,
    #[arg(long, default_value = "")]
    surname: String,
    #[arg(long, default_value = "")]
    unstructured_name: String,
}

impl From<CsrArgs> for CsrRequest {
    fn from(a: CsrArgs) -> Self {
        CsrRequest {
            alternative_names:   a.alternative_names,
            challenge_password:  a.challenge_password,
            city:                a.city,
            common_name:         a.common_name,
            contact_person:      a.contact_person,
            country:             a.country,
            email:               a.email,
            given_name:          a.given_name,
            initials:            a.initials,
            key_bit_length:      a.key_bit_length,
            key_curve_id:        a.key_curve_id,
            key_pair_algorithm:  a.key_pair_algorithm,
            key_usage:           a.key_usage,
            organization:        a.organization,
            organizational_unit: a.organizational_unit,
            state:               a.state,
            surname:             a.surname,
            unstructured_name:   a.unstructured_name,
        }
    }
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let command = match cli.command {
        Some(Command::CsrWorker) => process::exit(csr_worker()),
        Some(Command::Store(ref c)) => Some(c),
        Some(Command::Serve) | None => None,
    };

    let cfg = match load_settings(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("certmgr: config error: {e:#}");
            process::exit(1);
        }
    };

    // One-shot commands keep stdout for their output and log warnings only.
    let (use_syslog, level) = match command {
        None    => (cfg.log_syslog && !cli.stderr, log::LevelFilter::Debug),
        Some(_) => (false, log::LevelFilter::Warn),
    };
    if let Err(e) = setup_logging(use_syslog, level) {
        eprintln!("certmgr: {e:#}");
        process::exit(1);
    }

    let result = match command {
        None    => serve(cfg).await,
        Some(c) => run_command(cfg.store, c).await,
    };
    if let Err(e) = result {
        error!("{e:#}");
        eprintln!("certmgr: {e:#}");
        process::exit(1);
    }
}

fn load_settings(cli: &Cli) -> anyhow::Result<ServiceConfig> {
    let mut cfg = match &cli.config {
        Some(path) => config::load_config(path)?,
        None if Path::new(DEFAULT_CONFIG).exists() => config::load_config(Path::new(DEFAULT_CONFIG))?,
        None => ServiceConfig::default(),
    };

    if let Some(t) = &cli.cert_type {
        cfg.store.cert_type = t.parse()?;
    }
    if let Some(e) = &cli.endpoint {
        cfg.store.endpoint = e.clone();
    }
    if let Some(p) = &cli.install_path {
        cfg.store.install_path = p.clone();
    }
    if let Some(u) = &cli.unit {
        cfg.store.unit = u.clone();
    }

    config::validate_config(&cfg.store)?;
    Ok(cfg)
}

fn open_store(store: StoreConfig) -> anyhow::Result<Manager> {
    let executor = ProcessExecutor::current_exe()?;
    let manager = Manager::new(store, Box::new(Systemctl::new()), Box::new(executor))
        .context("cannot open certificate store")?;
    Ok(manager)
}

// ── Daemon ────────────────────────────────────────────────────────────────────

async fn serve(cfg: ServiceConfig) -> anyhow::Result<()> {
    if let Some(pid_file) = &cfg.pid_file {
        if let Err(e) = util::write_pid_file(pid_file) {
            error!("cannot write PID file {}: {e}", pid_file.display());
        }
    }

    let manager = open_store(cfg.store)?;
    info!("certmgr serving {}", manager.config().object_path());
    let (_handle, task) = manager.spawn();

    let mut sigterm = signal(SignalKind::terminate()).context("cannot install SIGTERM handler")?;
    let result = tokio::select! {
        res = task => Err(anyhow::anyhow!("certificate manager exited unexpectedly: {res:?}")),
        _ = tokio::signal::ctrl_c() => { info!("interrupted, shutting down"); Ok(()) }
        _ = sigterm.recv() => { info!("terminated, shutting down"); Ok(()) }
    };

    if let Some(pid_file) = &cfg.pid_file {
        util::remove_pid_file(pid_file);
    }
    result
}

// ── One-shot commands ─────────────────────────────────────────────────────────

async fn run_command(store: StoreConfig, command: &StoreCommand) -> anyhow::Result<()> {
    let mut manager = open_store(store)?;

    match command {
        StoreCommand::Install { file } => {
            let id = manager.install(CertSource::Path(file.clone()))?;
            println!("{}", manager.entry_object_path(id));
        }
        StoreCommand::Replace { id, file } => {
            manager.replace(CertId(*id), CertSource::Path(file.clone()))?;
        }
        StoreCommand::Delete { id } => manager.delete(CertId(*id))?,
        StoreCommand::DeleteAll     => manager.delete_all()?,
        StoreCommand::List { json } => print_list(&manager.list(), *json)?,
        StoreCommand::GenerateCsr(args) => {
            let request = CsrRequest::from(args.clone());
            let (handle, _task) = manager.spawn();
            let pem = wait_for_csr(&handle, request).await?;
            print!("{pem}");
        }
    }
    Ok(())
}

async fn wait_for_csr(handle: &ManagerHandle, request: CsrRequest) -> anyhow::Result<String> {
    let csr = handle.generate_csr(request).await?;
    loop {
        match handle.csr_status(csr).await? {
            CsrStatus::Pending => tokio::time::sleep(CSR_POLL).await,
            _ => return Ok(handle.read_csr(csr).await?),
        }
    }
}

fn print_list(entries: &[EntrySummary], json: bool) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(entries)?);
        return Ok(());
    }
    for e in entries {
        println!("{:<4} {}", e.id, e.object_path);
        println!("     subject:    {}", e.subject);
        println!("     issuer:     {}", e.issuer);
        println!("     not before: {}", format_time(e.not_before));
        println!("     not after:  {}", format_time(e.not_after));
    }
    Ok(())
}

fn format_time(secs: i64) -> String {
    DateTime::<Utc>::from_timestamp(secs, 0)
        .map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| secs.to_string())
}

// ── CSR worker ────────────────────────────────────────────────────────────────

/// Body of the isolated child process. Returns the exit status.
fn csr_worker() -> i32 {
    let _ = env_logger::Builder::from_default_env()
        .filter_level(log::LevelFilter::Info)
        .target(env_logger::Target::Stderr)
        .try_init();

    let mut input = String::new();
    if let Err(e) = std::io::stdin().read_to_string(&mut input) {
        error!("csr-worker: cannot read job: {e}");
        return 1;
    }
    let job: CsrJob = match serde_json::from_str(&input) {
        Ok(job) => job,
        Err(e) => {
            error!("csr-worker: malformed job: {e}");
            return 1;
        }
    };
    match csr::run_job(&job) {
        Ok(()) => 0,
        Err(e) => {
            error!("csr-worker: CSR generation failed: {e}");
            1
        }
    }
}

// ── Logging setup ─────────────────────────────────────────────────────────────

fn setup_logging(use_syslog: bool, level: log::LevelFilter) -> anyhow::Result<()> {
    if use_syslog {
        let formatter = syslog::Formatter3164 {
            facility: syslog::Facility::LOG_DAEMON,
            hostname: None,
            process:  "certmgr".into(),
            pid:      process::id(),
        };
        let logger = syslog::unix(formatter)
            .map_err(|e| anyhow::anyhow!("syslog connect failed: {e}"))?;
        log::set_boxed_logger(Box::new(syslog::BasicLogger::new(logger)))
            .map(|()| log::set_max_level(log::LevelFilter::Info))
            .map_err(|e| anyhow::anyhow!("set_logger: {e}"))?;
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(level)
            .init();
    }
    Ok(())
}
