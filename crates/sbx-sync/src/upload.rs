//! Upload orchestrator: scan, batch, and run per-file backup pipelines.
//!
//! A run resets records a crashed run left `Uploading`, purges stale temp
//! ciphertext, folds change-source candidates into the record store, then
//! processes every `Pending` or `Failed` record in sequential batches. Each
//! batch runs its pipelines concurrently behind a semaphore sized from the
//! batch's estimated memory cost.
//!
//! Per file:
//! ```text
//! claim ─▶ Hashing ─▶ Encrypting ─▶ GeneratingPath ─▶ UploadingFile ─▶ UploadingMetadata ─▶ Done
//! ```
//! Hashing and encryption share one read of the source; its bytes are
//! reported under `Hashing`. Pause and cancel are observed between steps.
//!
//! Remote names are derived from content, so an object already present at
//! a file's name holds that content: the file is marked stored without a
//! second upload. Only a write rejected by the store (409/412) renames.

use sbx_core::config::SbxConfig;
use sbx_core::types::{
    unix_now, CandidateFile, FileMetadata, SyncRecord, SyncStatus, UploadStep, METADATA_VERSION,
};
use sbx_core::{SbxError, SbxResult};
use sbx_crypto::names::{RemotePaths, SourceDigest};
use sbx_crypto::stream::blob_overhead;
use sbx_crypto::{encrypt_stream_named, open_metadata, seal_metadata, Cek, EncryptOutcome, ProgressFn};
use sbx_storage::{RemoteEntry, TransferProgress, UploadMode};
use serde::Serialize;
use std::collections::HashMap;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::concurrency::{
    plan_concurrency, ChunkPolicy, ConfiguredBudget, MemoryProbe, MAX_CONCURRENCY,
};
use crate::context::SyncContext;
use crate::control::RunControl;
use crate::progress::ProgressTracker;
use crate::retry::{retry, RetryPolicy};
use crate::source::ChangeSource;

/// Suffix of in-flight ciphertext artifacts in the temp directory.
const TEMP_SUFFIX: &str = ".enc.tmp";

/// Tunables for upload runs.
#[derive(Debug, Clone)]
pub struct UploadSettings {
    pub batch_size: usize,
    pub max_concurrency: usize,
    pub retry: RetryPolicy,
    pub chunks: ChunkPolicy,
    pub pause_poll: Duration,
    pub cancel_grace: Duration,
    pub temp_dir: PathBuf,
    pub remote_prefix: String,
    /// Headroom for the default memory probe
    pub memory_budget: u64,
}

impl UploadSettings {
    pub fn from_config(config: &SbxConfig) -> Self {
        let sync = &config.sync;
        Self {
            batch_size: sync.batch_size.max(1),
            max_concurrency: sync.max_concurrency.clamp(1, MAX_CONCURRENCY),
            retry: RetryPolicy::from_config(sync),
            chunks: ChunkPolicy::from_config(sync),
            pause_poll: Duration::from_millis(sync.pause_poll_ms.max(1)),
            cancel_grace: Duration::from_secs(sync.cancel_grace_secs),
            temp_dir: sync.temp_dir.clone(),
            remote_prefix: config.storage.prefix.clone(),
            memory_budget: ConfiguredBudget::from_config(sync).headroom_bytes(),
        }
    }
}

/// Summary of one upload run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct UploadReport {
    /// Candidates reported by the change source
    pub scanned: usize,
    /// Records selected for processing
    pub queued: usize,
    pub synced: usize,
    pub failed: usize,
    /// Unchanged files, lost claims, and files found already stored
    pub skipped: usize,
    /// Writes rejected by the store (renamed or parked in `Conflict`)
    pub conflicts: usize,
    pub cancelled: bool,
    /// The session locked mid-run; remaining files were left `Pending`
    pub locked: bool,
}

/// Record counts by status, refreshed after every batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SyncCounters {
    pub pending: usize,
    pub uploading: usize,
    pub synced: usize,
    pub failed: usize,
    pub conflict: usize,
}

impl SyncCounters {
    pub fn from_records(records: &[SyncRecord]) -> Self {
        let mut c = Self::default();
        for r in records {
            match r.status {
                SyncStatus::Pending => c.pending += 1,
                SyncStatus::Uploading => c.uploading += 1,
                SyncStatus::Synced => c.synced += 1,
                SyncStatus::Failed => c.failed += 1,
                SyncStatus::Conflict => c.conflict += 1,
            }
        }
        c
    }
}

/// How a file's ciphertext will be sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferPlan {
    pub mode: UploadMode,
    pub ciphertext_len: u64,
    pub parts: u64,
}

/// Plan the transfer of a `size`-byte plaintext.
pub fn transfer_plan(size: u64, mime_type: Option<&str>, chunks: &ChunkPolicy) -> TransferPlan {
    let ciphertext_len = size + blob_overhead();
    let mode = if chunks.is_chunked(size, mime_type) {
        UploadMode::Chunked {
            chunk_size: usize::try_from(chunks.chunk_size).unwrap_or(usize::MAX),
        }
    } else {
        UploadMode::Direct
    };
    TransferPlan {
        mode,
        ciphertext_len,
        parts: mode.part_count(ciphertext_len),
    }
}

/// Remove ciphertext artifacts left behind by an interrupted run.
pub fn purge_temp_artifacts(dir: &Path) -> SbxResult<usize> {
    if !dir.exists() {
        return Ok(0);
    }
    let mut removed = 0;
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_artifact = path
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.ends_with(TEMP_SUFFIX));
        if is_artifact && path.is_file() {
            std::fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        info!(dir = %dir.display(), removed, "purged stale ciphertext artifacts");
    }
    Ok(removed)
}

/// Temp ciphertext file, deleted on drop whatever the pipeline outcome.
struct TempArtifact(PathBuf);

impl Drop for TempArtifact {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.0.display(), "failed to remove temp artifact: {e}");
            }
        }
    }
}

fn open_source(path: &Path) -> SbxResult<std::fs::File> {
    std::fs::File::open(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            SbxError::SourceMissing(path.display().to_string())
        } else {
            SbxError::Io(e)
        }
    })
}

async fn blocking<T: Send + 'static>(
    f: impl FnOnce() -> SbxResult<T> + Send + 'static,
) -> SbxResult<T> {
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| SbxError::Other(e.into()))?
}

/// Result of one successful pipeline attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Attempt {
    Uploaded,
    /// Content and remote objects already match the record
    AlreadyStored,
    /// The store rejected our write to the name
    Collision,
}

/// Where one file ended up after its pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileOutcome {
    Synced,
    Skipped,
    Requeued,
    Conflict,
    Failed,
    Cancelled,
    Locked,
}

impl UploadReport {
    fn tally(&mut self, outcome: FileOutcome) {
        match outcome {
            FileOutcome::Synced => self.synced += 1,
            FileOutcome::Skipped => self.skipped += 1,
            FileOutcome::Requeued | FileOutcome::Conflict => self.conflicts += 1,
            FileOutcome::Failed => self.failed += 1,
            FileOutcome::Cancelled => self.cancelled = true,
            FileOutcome::Locked => self.locked = true,
        }
    }
}

struct Shared {
    ctx: SyncContext,
    source: Arc<dyn ChangeSource>,
    probe: Arc<dyn MemoryProbe>,
    settings: UploadSettings,
    paths: RemotePaths,
    progress: ProgressTracker,
    control: RunControl,
    counters: Mutex<SyncCounters>,
    running: tokio::sync::Mutex<()>,
    /// Serializes writers of one remote name within a run
    stem_locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Drives backup runs. Cheap to clone; clones share state and control.
#[derive(Clone)]
pub struct UploadOrchestrator {
    shared: Arc<Shared>,
}

impl UploadOrchestrator {
    pub fn new(ctx: SyncContext, source: Arc<dyn ChangeSource>, settings: UploadSettings) -> Self {
        let probe = Arc::new(ConfiguredBudget::new(settings.memory_budget));
        Self::with_probe(ctx, source, settings, probe)
    }

    pub fn with_probe(
        ctx: SyncContext,
        source: Arc<dyn ChangeSource>,
        settings: UploadSettings,
        probe: Arc<dyn MemoryProbe>,
    ) -> Self {
        let paths = RemotePaths::new(&settings.remote_prefix);
        Self {
            shared: Arc::new(Shared {
                ctx,
                source,
                probe,
                settings,
                paths,
                progress: ProgressTracker::new(),
                control: RunControl::new(),
                counters: Mutex::new(SyncCounters::default()),
                running: tokio::sync::Mutex::new(()),
                stem_locks: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn control(&self) -> &RunControl {
        &self.shared.control
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.shared.progress
    }

    /// Counters as of the last batch boundary.
    pub fn counters(&self) -> SyncCounters {
        *self
            .shared
            .counters
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    pub async fn refresh_counters(&self) -> SbxResult<SyncCounters> {
        self.shared.refresh_counters().await
    }

    /// Delete every Failed record. Remote content is untouched.
    pub async fn reset_history(&self) -> SbxResult<usize> {
        let n = self.shared.ctx.records.delete_failed(None).await?;
        info!(removed = n, "reset failed history");
        self.shared.refresh_counters().await?;
        Ok(n)
    }

    /// Delete Failed records last attempted more than `older_than` ago.
    pub async fn cleanup_failed(&self, older_than: Duration) -> SbxResult<usize> {
        let cutoff = unix_now().saturating_sub(older_than.as_secs());
        let n = self.shared.ctx.records.delete_failed(Some(cutoff)).await?;
        info!(removed = n, cutoff, "cleaned up old failed records");
        self.shared.refresh_counters().await?;
        Ok(n)
    }

    /// Run one backup pass. Only one pass runs at a time per orchestrator.
    pub async fn run(&self) -> SbxResult<UploadReport> {
        let _running = self.shared.running.try_lock().map_err(|_| {
            SbxError::InvalidInput("a backup run is already in progress".into())
        })?;
        let shared = &self.shared;
        let records = &shared.ctx.records;

        let reset = records
            .set_status_where(SyncStatus::Uploading, SyncStatus::Pending)
            .await?;
        if reset > 0 {
            info!(reset, "re-queued records left uploading by an interrupted run");
        }
        let temp_dir = shared.settings.temp_dir.clone();
        blocking(move || {
            std::fs::create_dir_all(&temp_dir)?;
            purge_temp_artifacts(&temp_dir)
        })
        .await?;

        let mut report = UploadReport::default();
        let candidates = shared.source.candidates().await?;
        report.scanned = candidates.len();
        report.skipped += shared.upsert_candidates(&candidates).await?;

        let queue = records
            .list_by_status(&[SyncStatus::Pending, SyncStatus::Failed])
            .await?;
        report.queued = queue.len();
        info!(scanned = report.scanned, queued = report.queued, "backup run started");

        for (n, batch) in queue.chunks(shared.settings.batch_size).enumerate() {
            if shared.control.checkpoint(shared.settings.pause_poll).await.is_err() {
                report.cancelled = true;
                break;
            }
            shared.run_batch(n, batch, &mut report).await;
            shared.refresh_counters().await?;
            if report.cancelled || report.locked {
                break;
            }
        }
        shared
            .stem_locks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();

        let requeued = records
            .set_status_where(SyncStatus::Uploading, SyncStatus::Pending)
            .await?;
        if requeued > 0 {
            debug!(requeued, "returned in-flight records to pending");
        }
        shared.refresh_counters().await?;

        info!(
            synced = report.synced,
            failed = report.failed,
            skipped = report.skipped,
            conflicts = report.conflicts,
            cancelled = report.cancelled,
            locked = report.locked,
            "backup run finished"
        );
        Ok(report)
    }
}

impl Shared {
    async fn refresh_counters(&self) -> SbxResult<SyncCounters> {
        let all = self.ctx.records.all().await?;
        let counters = SyncCounters::from_records(&all);
        *self.counters.lock().unwrap_or_else(PoisonError::into_inner) = counters;
        Ok(counters)
    }

    /// Insert new candidates and re-queue changed ones. Returns how many
    /// were already synced and unchanged.
    async fn upsert_candidates(&self, candidates: &[CandidateFile]) -> SbxResult<usize> {
        let records = &self.ctx.records;
        let now = unix_now();
        let mut unchanged = 0;
        for candidate in candidates {
            match records.get_by_local_path(&candidate.local_identifier).await? {
                None => {
                    let record = SyncRecord::new(candidate, now);
                    debug!(path = %record.local_path, id = %record.id, "new file");
                    records.insert(record).await?;
                }
                Some(mut record) if record.is_changed(candidate) => {
                    debug!(path = %record.local_path, "file changed, re-queueing");
                    record.mtime = candidate.mtime;
                    record.size = candidate.size;
                    record.mime_type = candidate.mime_type.clone();
                    record.status = SyncStatus::Pending;
                    record.retry_count = 0;
                    record.last_error = None;
                    record.conflict_suffix = None;
                    record.content_hash = None;
                    record.remote_version = None;
                    record.updated_at = now;
                    records.update(record).await?;
                }
                Some(record) => {
                    if record.status == SyncStatus::Synced {
                        unchanged += 1;
                    }
                }
            }
        }
        Ok(unchanged)
    }

    async fn run_batch(self: &Arc<Self>, n: usize, batch: &[SyncRecord], report: &mut UploadReport) {
        let permits = plan_concurrency(
            batch,
            self.probe.as_ref(),
            &self.settings.chunks,
            self.settings.max_concurrency,
        );
        debug!(batch = n, files = batch.len(), permits, "starting batch");
        let semaphore = Arc::new(Semaphore::new(permits));

        let mut tasks = JoinSet::new();
        for record in batch.iter().cloned() {
            let shared = Arc::clone(self);
            let semaphore = Arc::clone(&semaphore);
            tasks.spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return FileOutcome::Cancelled;
                };
                if shared.control.checkpoint(shared.settings.pause_poll).await.is_err() {
                    return FileOutcome::Cancelled;
                }
                shared.process_file(record).await
            });
        }

        let mut deadline = None;
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, tasks.join_next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        warn!(remaining = tasks.len(), "grace period over, aborting pipelines");
                        tasks.abort_all();
                        while tasks.join_next().await.is_some() {}
                        report.cancelled = true;
                        break;
                    }
                },
                None => tokio::select! {
                    next = tasks.join_next() => next,
                    _ = self.control.token().cancelled() => {
                        deadline = Some(tokio::time::Instant::now() + self.settings.cancel_grace);
                        report.cancelled = true;
                        continue;
                    }
                },
            };
            match next {
                None => break,
                Some(Ok(outcome)) => report.tally(outcome),
                Some(Err(e)) => {
                    warn!("upload task ended abnormally: {e}");
                    report.failed += 1;
                }
            }
        }
        self.progress_clear(batch);
    }

    fn progress_clear(&self, batch: &[SyncRecord]) {
        for record in batch {
            self.progress.finish(&record.id);
        }
    }

    /// Claim, run with retries, and settle the record's final status.
    async fn process_file(&self, record: SyncRecord) -> FileOutcome {
        let records = &self.ctx.records;
        let id = record.id.clone();
        let name = record.file_name().to_string();

        match records
            .update_if_status_equals(&id, record.status, SyncStatus::Uploading)
            .await
        {
            Ok(1) => {}
            Ok(_) => {
                debug!(file = %name, "claim lost, skipping");
                return FileOutcome::Skipped;
            }
            Err(e) => {
                warn!(file = %name, "claim failed: {e}");
                return FileOutcome::Failed;
            }
        }

        self.progress.begin(&id, &name, record.size);
        let retried = retry(&self.settings.retry, &self.control, &name, |attempt| {
            let id = id.clone();
            async move {
                if attempt > 1 {
                    self.progress.restart(&id);
                }
                let result = self.attempt(&id).await;
                if let Err(e) = &result {
                    if !matches!(e, SbxError::Cancelled | SbxError::Locked) {
                        self.note_failure(&id, e).await;
                    }
                }
                result
            }
        })
        .await;
        self.progress.finish(&id);

        let settled = match retried.result {
            Ok(Attempt::Uploaded) => Ok(FileOutcome::Synced),
            Ok(Attempt::AlreadyStored) => Ok(FileOutcome::Skipped),
            Ok(Attempt::Collision) => self.settle_collision(&id).await,
            Err(SbxError::Cancelled) => records
                .update_if_status_equals(&id, SyncStatus::Uploading, SyncStatus::Pending)
                .await
                .map(|_| FileOutcome::Cancelled),
            Err(SbxError::Locked) => {
                info!(file = %name, "session locked, leaving file for the next run");
                records
                    .update_if_status_equals(&id, SyncStatus::Uploading, SyncStatus::Pending)
                    .await
                    .map(|_| FileOutcome::Locked)
            }
            Err(e) => {
                warn!(file = %name, attempts = retried.attempts, "upload failed: {e}");
                records
                    .update_if_status_equals(&id, SyncStatus::Uploading, SyncStatus::Failed)
                    .await
                    .map(|_| FileOutcome::Failed)
            }
        };
        settled.unwrap_or_else(|e| {
            warn!(file = %name, "could not settle record: {e}");
            FileOutcome::Failed
        })
    }

    async fn note_failure(&self, id: &str, err: &SbxError) {
        let records = &self.ctx.records;
        let result = async {
            if let Some(mut record) = records.get(id).await? {
                let now = unix_now();
                record.retry_count += 1;
                record.last_error = Some(err.to_string());
                record.last_attempt_at = Some(now);
                record.updated_at = now;
                records.update(record).await?;
            }
            Ok::<(), SbxError>(())
        }
        .await;
        if let Err(e) = result {
            warn!(id, "could not record failure: {e}");
        }
    }

    /// First rejected write: tag the name with this device and re-queue.
    /// A tagged name that is still rejected parks the record in `Conflict`.
    async fn settle_collision(&self, id: &str) -> SbxResult<FileOutcome> {
        let records = &self.ctx.records;
        let mut record = records
            .get(id)
            .await?
            .ok_or_else(|| SbxError::RecordStateConflict(id.to_string()))?;
        let now = unix_now();
        record.updated_at = now;
        record.last_attempt_at = Some(now);

        if record.conflict_suffix.is_none() {
            let suffix = self.ctx.device.short_id();
            info!(file = %record.file_name(), suffix = %suffix, "remote write rejected, renaming");
            record.conflict_suffix = Some(suffix);
            record.remote_name = None;
            record.remote_version = None;
            record.last_error = Some("remote write conflict; renamed with device suffix".into());
            record.status = SyncStatus::Pending;
            records.update(record).await?;
            Ok(FileOutcome::Requeued)
        } else {
            warn!(file = %record.file_name(), "remote write still rejected after rename");
            record.last_error = Some("remote write conflict after rename".into());
            record.status = SyncStatus::Conflict;
            records.update(record).await?;
            Ok(FileOutcome::Conflict)
        }
    }

    /// Give up the claim while paused so the record reads `Pending`, then
    /// reclaim on resume.
    async fn pause_point(&self, id: &str) -> SbxResult<()> {
        let poll = self.settings.pause_poll;
        if !self.control.is_paused() {
            return self.control.checkpoint(poll).await;
        }
        let records = &self.ctx.records;
        records
            .update_if_status_equals(id, SyncStatus::Uploading, SyncStatus::Pending)
            .await?;
        self.control.checkpoint(poll).await?;
        if records
            .update_if_status_equals(id, SyncStatus::Pending, SyncStatus::Uploading)
            .await?
            == 0
        {
            return Err(SbxError::RecordStateConflict(id.to_string()));
        }
        Ok(())
    }

    async fn load_claimed(&self, id: &str) -> SbxResult<SyncRecord> {
        match self.ctx.records.get(id).await? {
            Some(r) if r.status == SyncStatus::Uploading => Ok(r),
            _ => Err(SbxError::RecordStateConflict(id.to_string())),
        }
    }

    async fn attempt(&self, id: &str) -> SbxResult<Attempt> {
        let ctx = &self.ctx;
        let record = self.load_claimed(id).await?;
        if self.still_stored(&record).await? {
            debug!(file = %record.file_name(), "already stored, nothing to upload");
            self.mark_synced(id).await?;
            return Ok(Attempt::AlreadyStored);
        }
        let path = self.source.resolve(&record.local_path)?;

        // Hashing, with encryption in the same pass
        let salt = ctx.session.filename_salt()?;
        let cek = ctx.ceks.get_or_create_cek(&record.cek_id, &ctx.session).await?;
        let artifact = TempArtifact(self.settings.temp_dir.join(format!("{id}{TEMP_SUFFIX}")));
        let (outcome, digest): (EncryptOutcome, SourceDigest) = {
            let target = artifact.0.clone();
            let cek = cek.clone();
            let tracker = self.progress.clone();
            let rid = id.to_string();
            let total = record.size;
            blocking(move || {
                let reader = BufReader::new(open_source(&path)?);
                let writer = BufWriter::new(std::fs::File::create(&target)?);
                let report = move |done: u64, all: u64| tracker.set_bytes(&rid, done, all);
                let cb: ProgressFn<'_> = &report;
                encrypt_stream_named(&cek, &salt, reader, writer, total, Some(cb))
            })
            .await?
        };

        // Encrypting
        self.progress.set_step(id, UploadStep::Encrypting);
        self.progress
            .set_bytes(id, outcome.ciphertext_len, outcome.ciphertext_len);
        self.pause_point(id).await?;

        // GeneratingPath
        self.progress.set_step(id, UploadStep::GeneratingPath);
        let stem = RemotePaths::stem(&digest.remote_name, record.conflict_suffix.as_deref());
        let data_path = self.paths.data(&stem);
        let meta_path = self.paths.metadata(&stem);
        let _writer = self.lock_stem(&stem).await;
        let existing = ctx.storage.stat_file(&data_path).await?;
        let ours = existing
            .as_ref()
            .is_some_and(|e| e.etag.is_some() && e.etag == record.remote_version);
        if let Some(entry) = existing.as_ref().filter(|_| !ours) {
            if let Some(stored) = self.adopt_stored(&record, &digest, &stem, entry).await? {
                return Ok(stored);
            }
        }
        self.pause_point(id).await?;

        // UploadingFile
        self.progress.set_step(id, UploadStep::UploadingFile);
        let plan = transfer_plan(outcome.plaintext_len, record.mime_type.as_deref(), &self.settings.chunks);
        let version = match existing.as_ref().filter(|_| ours) {
            Some(entry) => {
                debug!(path = %data_path, "data object already ours, sending metadata only");
                entry.etag.clone().unwrap_or_default()
            }
            None => {
                let tracker = self.progress.clone();
                let rid = id.to_string();
                let on_progress: TransferProgress =
                    Arc::new(move |done, all| tracker.set_bytes(&rid, done, all));
                match ctx
                    .storage
                    .upload_file(&artifact.0, &data_path, outcome.ciphertext_len, plan.mode, Some(on_progress))
                    .await
                {
                    Err(e) if matches!(e.status(), Some(409) | Some(412)) => {
                        debug!(path = %data_path, "store rejected write: {e}");
                        return Ok(Attempt::Collision);
                    }
                    other => other?,
                }
            }
        };
        drop(artifact);

        // The data object is ours from here on, even if the run stops now
        let mut record = self.load_claimed(id).await?;
        record.content_hash = Some(outcome.content_hash.clone());
        record.remote_name = Some(stem.clone());
        record.remote_version = Some(version);
        record.updated_at = unix_now();
        ctx.records.update(record.clone()).await?;
        self.pause_point(id).await?;

        // UploadingMetadata
        self.progress.set_step(id, UploadStep::UploadingMetadata);
        let metadata = FileMetadata {
            version: METADATA_VERSION,
            original_name: record.file_name().to_string(),
            timestamp: record.mtime,
            location: None,
            mime_type: record
                .mime_type
                .clone()
                .unwrap_or_else(|| "application/octet-stream".into()),
            size: outcome.plaintext_len,
            content_hash: outcome.content_hash,
            device_id: ctx.device.device_id.clone(),
            cek_id: record.cek_id.clone(),
            created_at: unix_now(),
        };
        let sealed = seal_metadata(&cek, &metadata)?;
        ctx.storage.upload_metadata(&meta_path, sealed).await?;

        self.mark_synced(id).await?;
        self.progress.set_step(id, UploadStep::Done);
        info!(
            file = %record.file_name(),
            path = %data_path,
            bytes = outcome.ciphertext_len,
            parts = plan.parts,
            "backed up"
        );
        Ok(Attempt::Uploaded)
    }

    async fn lock_stem(&self, stem: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.stem_locks.lock().unwrap_or_else(PoisonError::into_inner);
            Arc::clone(locks.entry(stem.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    /// A record whose recorded objects are still in place, checked before
    /// the source is read again.
    async fn still_stored(&self, record: &SyncRecord) -> SbxResult<bool> {
        let (Some(stem), Some(version)) = (&record.remote_name, &record.remote_version) else {
            return Ok(false);
        };
        if record.content_hash.is_none() {
            return Ok(false);
        }
        let storage = &self.ctx.storage;
        let Some(data) = storage.stat_file(&self.paths.data(stem)).await? else {
            return Ok(false);
        };
        if data.etag.as_ref() != Some(version) {
            return Ok(false);
        }
        Ok(storage.stat_file(&self.paths.metadata(stem)).await?.is_some())
    }

    /// Take over an object another writer stored under our content name.
    ///
    /// With its metadata present, the content is already backed up: the
    /// record points at that object and nothing is uploaded. If a local CEK
    /// opens the metadata, the record switches to that key so it can be
    /// restored here. A data object without metadata is an unfinished
    /// write, so `None` is returned and the caller overwrites it.
    async fn adopt_stored(
        &self,
        record: &SyncRecord,
        digest: &SourceDigest,
        stem: &str,
        data: &RemoteEntry,
    ) -> SbxResult<Option<Attempt>> {
        let ctx = &self.ctx;
        let meta_path = self.paths.metadata(stem);
        if ctx.storage.stat_file(&meta_path).await?.is_none() {
            debug!(path = %meta_path, "data without metadata, overwriting");
            return Ok(None);
        }
        let sealed = ctx.storage.download_file(&meta_path, None).await?;
        let cek_id = match self.matching_cek(record, digest, &sealed).await? {
            Some(cek_id) => cek_id,
            None => {
                info!(
                    file = %record.file_name(),
                    "content already stored under a key held elsewhere"
                );
                record.cek_id.clone()
            }
        };

        let mut adopted = self.load_claimed(&record.id).await?;
        adopted.cek_id = cek_id;
        adopted.content_hash = Some(digest.content_hash.clone());
        adopted.remote_name = Some(stem.to_string());
        adopted.remote_version = data.etag.clone();
        adopted.updated_at = unix_now();
        ctx.records.update(adopted).await?;
        self.mark_synced(&record.id).await?;
        self.progress.set_step(&record.id, UploadStep::Done);
        info!(file = %record.file_name(), name = %stem, "content already stored, skipped upload");
        Ok(Some(Attempt::AlreadyStored))
    }

    /// Id of a locally held CEK that opens `sealed` and whose metadata
    /// describes this content.
    async fn matching_cek(
        &self,
        record: &SyncRecord,
        digest: &SourceDigest,
        sealed: &[u8],
    ) -> SbxResult<Option<String>> {
        let ctx = &self.ctx;
        let mut candidates = vec![record.cek_id.clone()];
        for other in ctx.records.all().await? {
            if other.id != record.id
                && other.content_hash.as_deref() == Some(digest.content_hash.as_str())
                && !candidates.contains(&other.cek_id)
            {
                candidates.push(other.cek_id);
            }
        }
        for cek_id in candidates {
            let cek: Cek = match ctx.ceks.get_cek(&cek_id, &ctx.session).await {
                Ok(cek) => cek,
                Err(SbxError::Locked) => return Err(SbxError::Locked),
                Err(_) => continue,
            };
            if let Ok(metadata) = open_metadata(&cek, sealed) {
                if metadata.content_hash == digest.content_hash {
                    return Ok(Some(metadata.cek_id));
                }
            }
        }
        Ok(None)
    }

    async fn mark_synced(&self, id: &str) -> SbxResult<()> {
        let records = &self.ctx.records;
        let mut record = self.load_claimed(id).await?;
        let now = unix_now();
        record.retry_count = 0;
        record.last_error = None;
        record.last_attempt_at = Some(now);
        record.synced_at = Some(now);
        record.updated_at = now;
        records.update(record).await?;
        if records
            .update_if_status_equals(id, SyncStatus::Uploading, SyncStatus::Synced)
            .await?
            == 0
        {
            return Err(SbxError::RecordStateConflict(id.to_string()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_plan_uses_ten_chunks() {
        let plan = transfer_plan(50_000_000, Some("video/mp4"), &ChunkPolicy::default());
        assert_eq!(
            plan.mode,
            UploadMode::Chunked {
                chunk_size: 5 * 1024 * 1024
            }
        );
        assert_eq!(plan.ciphertext_len, 50_000_029);
        assert_eq!(plan.parts, 10);
    }

    #[test]
    fn test_small_photo_plan_is_direct() {
        let plan = transfer_plan(3_000_000, Some("image/jpeg"), &ChunkPolicy::default());
        assert_eq!(plan.mode, UploadMode::Direct);
        assert_eq!(plan.parts, 1);
    }

    #[test]
    fn test_large_photo_plan_is_chunked() {
        let plan = transfer_plan(12 * 1024 * 1024, Some("image/x-adobe-dng"), &ChunkPolicy::default());
        assert!(matches!(plan.mode, UploadMode::Chunked { .. }));
        assert_eq!(plan.parts, 3);
    }

    #[test]
    fn test_settings_cap_concurrency_at_three() {
        let mut config = SbxConfig::default();
        config.sync.max_concurrency = 8;
        assert_eq!(UploadSettings::from_config(&config).max_concurrency, 3);
        config.sync.max_concurrency = 0;
        assert_eq!(UploadSettings::from_config(&config).max_concurrency, 1);
    }

    #[test]
    fn test_purge_only_removes_artifacts() {
        let tmp = tempfile::TempDir::new().unwrap();
        std::fs::write(tmp.path().join("abc.enc.tmp"), b"x").unwrap();
        std::fs::write(tmp.path().join("keep.txt"), b"y").unwrap();
        assert_eq!(purge_temp_artifacts(tmp.path()).unwrap(), 1);
        assert!(tmp.path().join("keep.txt").exists());
        assert_eq!(purge_temp_artifacts(&tmp.path().join("missing")).unwrap(), 0);
    }

    #[test]
    fn test_counters_from_records() {
        let candidate = CandidateFile {
            local_identifier: "/a.jpg".into(),
            mtime: 1,
            size: 1,
            mime_type: None,
        };
        let mut a = SyncRecord::new(&candidate, 0);
        let mut b = a.clone();
        a.status = SyncStatus::Synced;
        b.status = SyncStatus::Failed;
        let c = SyncCounters::from_records(&[a, b]);
        assert_eq!(c.synced, 1);
        assert_eq!(c.failed, 1);
        assert_eq!(c.pending, 0);
    }
}
