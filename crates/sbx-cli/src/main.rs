//! sbx: Shoebox zero-knowledge photo backup CLI
//!
//! Commands:
//!   init [--import]                 - create a master key (new or from a recovery phrase)
//!   backup [--every SECS]           - back up the configured photo directories
//!   restore (--id ID | --all)       - decrypt backed-up files into a directory
//!   status                          - show record counts and failed files
//!   change-password                 - re-wrap the master key under a new password
//!   reset-history                   - forget failed records
//!   cleanup [--days N]              - forget failed records older than N days
//!   check                           - verify storage connectivity

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use sbx_core::config::SbxConfig;
use sbx_core::types::{DownloadPhase, SyncStatus, UploadStep};
use sbx_crypto::{
    change_password, generate_mnemonic, master_key_from_mnemonic, MasterKey, Session,
    WrappedMasterKey,
};
use sbx_storage::{build_operator, check_health, OpendalStorage, StorageClient, StorageCredentials};
use sbx_sync::{
    DeviceIdentity, DirectorySink, DirectorySource, DownloadOrchestrator, JsonRecordStore,
    PhaseProgress, RecordStore, SyncContext, UploadOrchestrator, UploadReport, UploadSettings,
};
use secrecy::{ExposeSecret, SecretString};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

// ── CLI structure ──────────────────────────────────────────────────────────────

#[derive(Parser, Debug)]
#[command(
    name = "sbx",
    version,
    about = "Shoebox zero-knowledge photo backup",
    long_about = "sbx: encrypt photos and videos on this device and back them up to S3 or WebDAV"
)]
struct Cli {
    /// Path to shoebox.toml configuration file
    #[arg(
        long,
        short = 'c',
        env = "SBX_CONFIG",
        default_value = "~/.config/shoebox/shoebox.toml"
    )]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error); overrides [log].level
    #[arg(long, env = "SBX_LOG")]
    log: Option<String>,

    /// Log format; overrides [log].format
    #[arg(long, env = "SBX_LOG_FORMAT")]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormat {
    Json,
    Text,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create the master key and protect it with a password
    Init {
        /// Restore the master key from an existing 12-word recovery phrase
        #[arg(long)]
        import: bool,
        /// Replace an existing key file
        #[arg(long)]
        force: bool,
    },

    /// Back up new and changed files
    ///
    /// The password is read from SBX_PASSWORD or prompted for.
    Backup {
        /// Keep running, starting a new pass every SECS seconds
        #[arg(long, value_name = "SECS")]
        every: Option<u64>,
    },

    /// Decrypt backed-up files into a directory
    Restore {
        /// Record id to restore (see `sbx status --all`)
        #[arg(long, conflicts_with = "all", required_unless_present = "all")]
        id: Option<String>,
        /// Restore every synced file
        #[arg(long)]
        all: bool,
        /// Destination directory
        #[arg(long, default_value = "restored")]
        dest: PathBuf,
    },

    /// Show backup status
    Status {
        /// List every record, not just failures and conflicts
        #[arg(long)]
        all: bool,
        /// Print counters as JSON
        #[arg(long)]
        json: bool,
    },

    /// Change the password protecting the master key
    #[command(name = "change-password")]
    ChangePassword,

    /// Forget all failed records (remote content is untouched)
    #[command(name = "reset-history")]
    ResetHistory,

    /// Forget failed records last attempted more than N days ago
    Cleanup {
        /// Age in days (default: sync.failed_retention_days)
        #[arg(long)]
        days: Option<u64>,
    },

    /// Check storage connectivity
    Check,
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = expand_tilde(&cli.config);
    let (config, found) = load_config(&config_path).await?;

    let level = cli.log.clone().unwrap_or_else(|| config.log.level.clone());
    let format = cli.log_format.unwrap_or(if config.log.format == "json" {
        LogFormat::Json
    } else {
        LogFormat::Text
    });
    init_logging(&level, format);
    if !found {
        warn!(
            "config file not found: {}  (using defaults)",
            config_path.display()
        );
    }

    match cli.command {
        Commands::Init { import, force } => cmd_init(&config, import, force).await,
        Commands::Backup { every } => cmd_backup(&config, every).await,
        Commands::Restore { id, all, dest } => cmd_restore(&config, id.as_deref(), all, &dest).await,
        Commands::Status { all, json } => cmd_status(&config, all, json).await,
        Commands::ChangePassword => cmd_change_password(&config),
        Commands::ResetHistory => cmd_reset_history(&config).await,
        Commands::Cleanup { days } => cmd_cleanup(&config, days).await,
        Commands::Check => cmd_check(&config).await,
    }
}

// ── Config and logging ────────────────────────────────────────────────────────

async fn load_config(path: &Path) -> Result<(SbxConfig, bool)> {
    if path.exists() {
        let content = tokio::fs::read_to_string(path)
            .await
            .with_context(|| format!("reading config: {}", path.display()))?;
        let config = SbxConfig::from_toml(&content)
            .with_context(|| format!("parsing config: {}", path.display()))?;
        Ok((config, true))
    } else {
        Ok((SbxConfig::default(), false))
    }
}

fn init_logging(level: &str, format: LogFormat) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    match format {
        LogFormat::Json => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().json().with_writer(std::io::stderr))
                .init();
        }
        LogFormat::Text => {
            tracing_subscriber::registry()
                .with(filter)
                .with(fmt::layer().with_writer(std::io::stderr))
                .init();
        }
    }
}

/// Expand `~` in path to the user's home directory
fn expand_tilde(path: &Path) -> PathBuf {
    let s = path.to_string_lossy();
    match s.strip_prefix("~/") {
        Some(rest) => {
            let home = std::env::var("HOME").unwrap_or_default();
            PathBuf::from(home).join(rest)
        }
        None => path.to_path_buf(),
    }
}

fn device_identity_path(config: &SbxConfig) -> PathBuf {
    match &config.sync.device_identity {
        Some(p) => expand_tilde(p),
        None => expand_tilde(&config.crypto.key_file).with_file_name("device.json"),
    }
}

// ── Passwords and the key file ────────────────────────────────────────────────

fn read_password(prompt: &str) -> Result<SecretString> {
    if let Ok(pw) = std::env::var("SBX_PASSWORD") {
        return Ok(SecretString::from(pw));
    }
    let pw = rpassword::prompt_password(prompt).context("reading password")?;
    Ok(SecretString::from(pw))
}

fn read_new_password() -> Result<SecretString> {
    let first = rpassword::prompt_password("New password: ").context("reading password")?;
    if first.is_empty() {
        bail!("password must not be empty");
    }
    let second = rpassword::prompt_password("Repeat password: ").context("reading password")?;
    if first != second {
        bail!("passwords do not match");
    }
    Ok(SecretString::from(first))
}

fn read_key_file(config: &SbxConfig) -> Result<WrappedMasterKey> {
    let path = expand_tilde(&config.crypto.key_file);
    let json = std::fs::read_to_string(&path).with_context(|| {
        format!(
            "reading key file {} (run `sbx init` first)",
            path.display()
        )
    })?;
    WrappedMasterKey::from_json(&json).with_context(|| format!("parsing key file {}", path.display()))
}

fn write_key_file(config: &SbxConfig, envelope: &WrappedMasterKey) -> Result<PathBuf> {
    let path = expand_tilde(&config.crypto.key_file);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let tmp = path.with_extension("tmp");
    std::fs::write(&tmp, envelope.to_json()?)
        .with_context(|| format!("writing {}", tmp.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&tmp, std::fs::Permissions::from_mode(0o600))?;
    }
    std::fs::rename(&tmp, &path).with_context(|| format!("writing {}", path.display()))?;
    Ok(path)
}

fn unlock_master_key(config: &SbxConfig) -> Result<MasterKey> {
    let envelope = read_key_file(config)?;
    let password = read_password("Password: ")?;
    envelope
        .open(&password)
        .context("unlocking master key (wrong password?)")
}

// ── Wiring ────────────────────────────────────────────────────────────────────

fn open_records(config: &SbxConfig) -> Result<Arc<JsonRecordStore>> {
    let path = expand_tilde(&config.sync.state_db);
    let store = JsonRecordStore::open(&path)
        .with_context(|| format!("opening record store: {}", path.display()))?;
    Ok(Arc::new(store))
}

fn open_storage(config: &SbxConfig) -> Result<Arc<OpendalStorage>> {
    let op = build_operator(&config.storage, &StorageCredentials::from_env())
        .context("building storage operator")?;
    Ok(Arc::new(OpendalStorage::new(op)))
}

fn build_context(config: &SbxConfig, session: Arc<Session>) -> Result<SyncContext> {
    let device = DeviceIdentity::load_or_create(
        &device_identity_path(config),
        config.sync.device_name.as_deref(),
    )
    .context("loading device identity")?;
    let records: Arc<dyn RecordStore> = open_records(config)?;
    let storage: Arc<dyn StorageClient> = open_storage(config)?;
    Ok(SyncContext::new(session, records, storage, device))
}

fn photo_source(config: &SbxConfig) -> DirectorySource {
    let mut source = config.source.clone();
    source.roots = source.roots.iter().map(|r| expand_tilde(r)).collect();
    DirectorySource::new(&source)
}

fn unlocked_session(config: &SbxConfig) -> Result<Arc<Session>> {
    let master = unlock_master_key(config)?;
    Ok(Arc::new(Session::unlocked(
        master,
        Duration::from_secs(config.crypto.idle_lock_secs),
    )))
}

/// Lock the session once it has been idle for its timeout. Never locks
/// while `busy` is set.
fn spawn_idle_lock(session: Arc<Session>, busy: Arc<AtomicBool>) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(15));
        loop {
            tick.tick().await;
            if busy.load(Ordering::SeqCst) {
                continue;
            }
            if session.lock_if_idle(std::time::Instant::now()) {
                info!("session locked after idle timeout");
            }
        }
    })
}

// ── Progress bar helpers ──────────────────────────────────────────────────────

fn make_spinner(prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new_spinner();
    pb.set_style(ProgressStyle::with_template("{prefix:.bold} {spinner} {msg}")?);
    pb.set_prefix(prefix.to_string());
    pb.enable_steady_tick(Duration::from_millis(80));
    Ok(pb)
}

fn make_progress_bar(total: u64, prefix: &str) -> Result<ProgressBar> {
    let pb = ProgressBar::new(total);
    pb.set_style(
        ProgressStyle::with_template("{prefix:.bold} [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")?
            .progress_chars("=>-"),
    );
    pb.set_prefix(prefix.to_string());
    Ok(pb)
}

fn step_label(step: UploadStep) -> &'static str {
    match step {
        UploadStep::Hashing => "hashing",
        UploadStep::Encrypting => "encrypting",
        UploadStep::GeneratingPath => "naming",
        UploadStep::UploadingFile => "uploading",
        UploadStep::UploadingMetadata => "metadata",
        UploadStep::Done => "done",
    }
}

fn fmt_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = KB * 1024;
    const GB: u64 = MB * 1024;
    if bytes >= GB {
        format!("{:.1} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.1} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.1} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

// ── `sbx init` ────────────────────────────────────────────────────────────────

async fn cmd_init(config: &SbxConfig, import: bool, force: bool) -> Result<()> {
    let key_path = expand_tilde(&config.crypto.key_file);
    if key_path.exists() && !force {
        bail!(
            "key file already exists: {} (use --force to replace it)",
            key_path.display()
        );
    }

    let master = if import {
        let words = rpassword::prompt_password("Recovery phrase (12 words): ")
            .context("reading recovery phrase")?;
        master_key_from_mnemonic(&words).context("invalid recovery phrase")?
    } else {
        let (words, master) = generate_mnemonic()?;
        println!("Your recovery phrase (write it down; it is shown only once):");
        println!();
        for (i, word) in words.split_whitespace().enumerate() {
            println!("  {:>2}. {}", i + 1, word);
        }
        println!();
        master
    };

    let password = read_new_password()?;
    let envelope = WrappedMasterKey::create(&master, &password, config.crypto.pbkdf2_iterations)?;
    let path = write_key_file(config, &envelope)?;

    let device = DeviceIdentity::load_or_create(
        &device_identity_path(config),
        config.sync.device_name.as_deref(),
    )?;
    println!("Key file:  {}", path.display());
    println!("Device:    {} ({})", device.name, device.short_id());
    Ok(())
}

// ── `sbx backup` ──────────────────────────────────────────────────────────────

async fn cmd_backup(config: &SbxConfig, every: Option<u64>) -> Result<()> {
    if config.source.roots.is_empty() {
        bail!("no source directories configured ([source] roots)");
    }
    let session = unlocked_session(config)?;
    let ctx = build_context(config, Arc::clone(&session))?;
    let source = photo_source(config);

    let mut settings = UploadSettings::from_config(config);
    settings.temp_dir = expand_tilde(&settings.temp_dir);
    let orchestrator = UploadOrchestrator::new(ctx, Arc::new(source), settings);

    let busy = Arc::new(AtomicBool::new(false));
    let idle = spawn_idle_lock(Arc::clone(&session), Arc::clone(&busy));
    {
        let control = orchestrator.control().clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\ncancelling; waiting for in-flight files...");
                control.cancel();
            }
        });
    }

    let result = loop {
        if !session.is_unlocked() {
            session.unlock(unlock_master_key(config)?);
        }
        busy.store(true, Ordering::SeqCst);
        let run = run_with_progress(&orchestrator).await;
        busy.store(false, Ordering::SeqCst);
        let report = match run {
            Ok(r) => r,
            Err(e) => break Err(e),
        };
        print_report(&report);

        let Some(secs) = every else { break Ok(()) };
        if report.cancelled {
            break Ok(());
        }
        info!(next_in_secs = secs, "waiting for next backup pass");
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_secs(secs)) => {}
            _ = orchestrator.control().token().cancelled() => break Ok(()),
        }
    };
    idle.abort();
    session.lock();
    result
}

async fn run_with_progress(orchestrator: &UploadOrchestrator) -> Result<UploadReport> {
    let pb = make_spinner("backup")?;
    pb.set_message("scanning...");

    let ticker = {
        let pb = pb.clone();
        let progress = orchestrator.progress().clone();
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(Duration::from_millis(250));
            loop {
                tick.tick().await;
                let in_flight = progress.snapshot();
                if in_flight.is_empty() {
                    continue;
                }
                let parts: Vec<String> = in_flight
                    .iter()
                    .map(|f| {
                        let pct = (f.bytes_processed * 100)
                            .checked_div(f.bytes_total)
                            .unwrap_or(0);
                        format!("{} {} {pct}%", f.file_name, step_label(f.step))
                    })
                    .collect();
                pb.set_message(parts.join(" | "));
            }
        })
    };

    let result = orchestrator.run().await;
    ticker.abort();
    pb.finish_and_clear();
    result.context("backup run failed")
}

fn print_report(report: &UploadReport) {
    let state = if report.cancelled {
        "cancelled"
    } else if report.locked {
        "stopped (session locked)"
    } else {
        "complete"
    };
    println!("Backup {state}:");
    println!("  scanned:   {}", report.scanned);
    println!("  queued:    {}", report.queued);
    println!("  synced:    {}", report.synced);
    println!("  skipped:   {}", report.skipped);
    println!("  failed:    {}", report.failed);
    println!("  conflicts: {}", report.conflicts);
}

// ── `sbx restore` ─────────────────────────────────────────────────────────────

async fn cmd_restore(config: &SbxConfig, id: Option<&str>, all: bool, dest: &Path) -> Result<()> {
    let session = unlocked_session(config)?;
    let ctx = build_context(config, Arc::clone(&session))?;
    let sink = DirectorySink::new(dest);
    let downloader = DownloadOrchestrator::new(ctx, Arc::new(sink), &config.storage.prefix);

    let result = if all {
        let pb = make_spinner("restore")?;
        pb.set_message("restoring all synced files...");
        let outcomes = downloader.restore_all().await?;
        pb.finish_and_clear();

        let mut failed = 0;
        let mut bytes = 0;
        for (id, outcome) in &outcomes {
            match outcome {
                Ok(file) => bytes += file.bytes,
                Err(e) => {
                    failed += 1;
                    eprintln!("  {id}: {e}");
                }
            }
        }
        println!("Restore complete:");
        println!("  restored: {} files ({})", outcomes.len() - failed, fmt_bytes(bytes));
        println!("  failed:   {failed}");
        println!("  into:     {}", dest.display());
        if failed > 0 {
            Err(anyhow::anyhow!("{failed} file(s) could not be restored"))
        } else {
            Ok(())
        }
    } else {
        let id = id.context("--id or --all is required")?;
        let pb = make_progress_bar(0, "restore")?;
        let bar = pb.clone();
        let progress: PhaseProgress =
            Arc::new(move |phase: DownloadPhase, done: u64, total: u64| {
                bar.set_message(phase.to_string());
                bar.set_length(total);
                bar.set_position(done);
            });
        let restored = downloader.restore_with_progress(id, Some(progress)).await;
        pb.finish_and_clear();
        match restored {
            Ok(file) => {
                println!("Restored {}", file.metadata.original_name);
                println!("  path:   {}", file.path.display());
                println!("  bytes:  {}", fmt_bytes(file.bytes));
                println!("  type:   {}", file.metadata.mime_type);
                Ok(())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("restoring {id}"))),
        }
    };
    session.lock();
    result
}

// ── `sbx status` ──────────────────────────────────────────────────────────────

async fn cmd_status(config: &SbxConfig, all: bool, json: bool) -> Result<()> {
    let records = open_records(config)?;
    let list = records.all().await?;
    let counters = sbx_sync::SyncCounters::from_records(&list);

    if json {
        println!("{}", serde_json::to_string_pretty(&counters)?);
        return Ok(());
    }

    println!("Record store: {}", expand_tilde(&config.sync.state_db).display());
    println!("  synced:    {}", counters.synced);
    println!("  pending:   {}", counters.pending);
    println!("  uploading: {}", counters.uploading);
    println!("  failed:    {}", counters.failed);
    println!("  conflict:  {}", counters.conflict);

    let shown: Vec<_> = list
        .iter()
        .filter(|r| all || matches!(r.status, SyncStatus::Failed | SyncStatus::Conflict))
        .collect();
    if !shown.is_empty() {
        println!();
    }
    for r in shown {
        println!("{}  {:<9}  {}", r.id, r.status.as_str(), r.local_path);
        if let Some(err) = &r.last_error {
            println!("    retries: {}  error: {err}", r.retry_count);
        }
    }
    Ok(())
}

// ── `sbx change-password` ─────────────────────────────────────────────────────

fn cmd_change_password(config: &SbxConfig) -> Result<()> {
    let envelope = read_key_file(config)?;
    let old = SecretString::from(
        rpassword::prompt_password("Current password: ").context("reading password")?,
    );
    let new = read_new_password()?;
    if old.expose_secret() == new.expose_secret() {
        bail!("new password is the same as the current one");
    }
    let rewrapped = change_password(&envelope, &old, &new).context("wrong current password?")?;
    let path = write_key_file(config, &rewrapped)?;
    println!("Password changed ({})", path.display());
    Ok(())
}

// ── `sbx reset-history` / `sbx cleanup` ───────────────────────────────────────

fn maintenance_orchestrator(config: &SbxConfig) -> Result<UploadOrchestrator> {
    // Record maintenance never touches keys
    let session = Arc::new(Session::new(Duration::ZERO));
    let ctx = build_context(config, session)?;
    let source = photo_source(config);
    let mut settings = UploadSettings::from_config(config);
    settings.temp_dir = expand_tilde(&settings.temp_dir);
    Ok(UploadOrchestrator::new(ctx, Arc::new(source), settings))
}

async fn cmd_reset_history(config: &SbxConfig) -> Result<()> {
    let removed = maintenance_orchestrator(config)?.reset_history().await?;
    println!("Removed {removed} failed record(s)");
    Ok(())
}

async fn cmd_cleanup(config: &SbxConfig, days: Option<u64>) -> Result<()> {
    let days = days.unwrap_or(config.sync.failed_retention_days);
    let removed = maintenance_orchestrator(config)?
        .cleanup_failed(Duration::from_secs(days * 86_400))
        .await?;
    println!("Removed {removed} failed record(s) older than {days} day(s)");
    Ok(())
}

// ── `sbx check` ───────────────────────────────────────────────────────────────

async fn cmd_check(config: &SbxConfig) -> Result<()> {
    println!(
        "Storage: {} {} (bucket: {}, prefix: {})",
        config.storage.backend, config.storage.endpoint, config.storage.bucket, config.storage.prefix
    );
    let op = build_operator(&config.storage, &StorageCredentials::from_env())
        .context("building storage operator")?;
    match check_health(&op).await {
        Ok(()) => println!("  connection: ok"),
        Err(e) => bail!("storage check failed: {e}"),
    }

    let key_path = expand_tilde(&config.crypto.key_file);
    match read_key_file(config) {
        Ok(envelope) => println!(
            "  key file:   {} ({} iterations)",
            key_path.display(),
            envelope.iterations
        ),
        Err(_) => println!("  key file:   missing ({})", key_path.display()),
    }
    Ok(())
}
