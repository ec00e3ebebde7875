//! Download orchestrator: fetch, decrypt, and hand off one record at a time.
//!
//! Nothing is persisted on failure; the error carries the phase it happened in.
//!
//! Phases run in order: DownloadingFile, DownloadingMetadata, GettingCek,
//! DecryptingMetadata, DecryptingFile, SavingFile. The CEK is fetched before
//! the metadata is opened since the metadata is sealed under it.

use bytes::Bytes;
use sbx_core::types::{DownloadPhase, FileMetadata, SyncRecord, SyncStatus};
use sbx_core::{SbxError, SbxResult};
use sbx_crypto::names::RemotePaths;
use sbx_crypto::{decrypt_stream, open_metadata, Cek, ProgressFn};
use sbx_storage::TransferProgress;
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::SyncContext;
use crate::control::RunControl;
use crate::sink::RestoreSink;

/// A restore that failed, with the phase it failed in.
#[derive(Debug, Error)]
#[error("{phase} failed: {source}")]
pub struct RestoreError {
    pub phase: DownloadPhase,
    #[source]
    pub source: SbxError,
}

trait InPhase<T> {
    fn in_phase(self, phase: DownloadPhase) -> Result<T, RestoreError>;
}

impl<T> InPhase<T> for SbxResult<T> {
    fn in_phase(self, phase: DownloadPhase) -> Result<T, RestoreError> {
        self.map_err(|source| RestoreError { phase, source })
    }
}

/// Restore progress: the current phase with bytes done and total for it.
pub type PhaseProgress = Arc<dyn Fn(DownloadPhase, u64, u64) + Send + Sync>;

fn enter(progress: &Option<PhaseProgress>, phase: DownloadPhase, total: u64) {
    if let Some(cb) = progress {
        cb(phase, 0, total);
    }
}

/// A successfully restored file.
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredFile {
    pub record_id: String,
    pub path: PathBuf,
    pub bytes: u64,
    pub metadata: FileMetadata,
}

pub struct DownloadOrchestrator {
    ctx: SyncContext,
    sink: Arc<dyn RestoreSink>,
    paths: RemotePaths,
    control: RunControl,
}

impl DownloadOrchestrator {
    pub fn new(ctx: SyncContext, sink: Arc<dyn RestoreSink>, remote_prefix: &str) -> Self {
        Self {
            ctx,
            sink,
            paths: RemotePaths::new(remote_prefix),
            control: RunControl::new(),
        }
    }

    pub fn control(&self) -> &RunControl {
        &self.control
    }

    pub async fn restore(&self, record_id: &str) -> Result<RestoredFile, RestoreError> {
        self.restore_with_progress(record_id, None).await
    }

    pub async fn restore_with_progress(
        &self,
        record_id: &str,
        progress: Option<PhaseProgress>,
    ) -> Result<RestoredFile, RestoreError> {
        use DownloadPhase::*;
        let ctx = &self.ctx;

        let record = self.synced_record(record_id).await.in_phase(DownloadingFile)?;
        let stem = record.remote_name.clone().unwrap_or_default();
        let data_path = self.paths.data(&stem);
        let meta_path = self.paths.metadata(&stem);

        enter(&progress, DownloadingFile, 0);
        let transfer: Option<TransferProgress> = progress.clone().map(|cb| {
            let bytes: TransferProgress =
                Arc::new(move |done: u64, total: u64| cb(DownloadingFile, done, total));
            bytes
        });
        let blob = ctx
            .storage
            .download_file(&data_path, transfer)
            .await
            .in_phase(DownloadingFile)?;
        debug!(path = %data_path, bytes = blob.len(), "downloaded ciphertext");

        enter(&progress, DownloadingMetadata, 0);
        let sealed = ctx
            .storage
            .download_file(&meta_path, None)
            .await
            .in_phase(DownloadingMetadata)?;

        enter(&progress, GettingCek, 0);
        let record_cek = ctx
            .ceks
            .get_cek(&record.cek_id, &ctx.session)
            .await
            .in_phase(GettingCek)?;

        enter(&progress, DecryptingMetadata, sealed.len() as u64);
        let metadata = open_metadata(&record_cek, &sealed).in_phase(DecryptingMetadata)?;

        let cek = if metadata.cek_id == record.cek_id {
            record_cek
        } else {
            warn!(
                record = %record.cek_id,
                metadata = %metadata.cek_id,
                "metadata names a different content key"
            );
            ctx.ceks
                .get_cek(&metadata.cek_id, &ctx.session)
                .await
                .in_phase(GettingCek)?
        };

        enter(&progress, DecryptingFile, blob.len() as u64);
        let plaintext = decrypt(cek, blob, progress.clone())
            .await
            .in_phase(DecryptingFile)?;
        if plaintext.len() as u64 != metadata.size {
            return Err(RestoreError {
                phase: DecryptingFile,
                source: SbxError::InvalidInput(format!(
                    "decrypted {} bytes, metadata says {}",
                    plaintext.len(),
                    metadata.size
                )),
            });
        }

        enter(&progress, SavingFile, plaintext.len() as u64);
        let path = self
            .sink
            .save(&plaintext, &metadata)
            .await
            .in_phase(SavingFile)?;
        info!(id = record_id, name = %metadata.original_name, "restore complete");

        Ok(RestoredFile {
            record_id: record_id.to_string(),
            path,
            bytes: plaintext.len() as u64,
            metadata,
        })
    }

    /// Restore every synced record in turn. Stops early if cancelled.
    pub async fn restore_all(&self) -> SbxResult<Vec<(String, Result<RestoredFile, RestoreError>)>> {
        let records = self.ctx.records.list_by_status(&[SyncStatus::Synced]).await?;
        let mut outcomes = Vec::with_capacity(records.len());
        for record in records {
            if self.control.is_cancelled() {
                break;
            }
            let outcome = self.restore(&record.id).await;
            if let Err(e) = &outcome {
                warn!(file = %record.file_name(), "restore failed: {e}");
            }
            outcomes.push((record.id, outcome));
        }
        Ok(outcomes)
    }

    async fn synced_record(&self, record_id: &str) -> SbxResult<SyncRecord> {
        let record = self
            .ctx
            .records
            .get(record_id)
            .await?
            .ok_or_else(|| SbxError::InvalidInput(format!("no record with id {record_id}")))?;
        if record.status != SyncStatus::Synced || record.remote_name.is_none() {
            return Err(SbxError::InvalidInput(format!(
                "record {record_id} is {}, not synced",
                record.status
            )));
        }
        Ok(record)
    }
}

async fn decrypt(cek: Cek, blob: Bytes, progress: Option<PhaseProgress>) -> SbxResult<Vec<u8>> {
    tokio::task::spawn_blocking(move || -> SbxResult<Vec<u8>> {
        let mut out = Vec::with_capacity(blob.len());
        let report = move |done: u64, total: u64| {
            if let Some(cb) = &progress {
                cb(DownloadPhase::DecryptingFile, done, total);
            }
        };
        let cb: ProgressFn<'_> = &report;
        decrypt_stream(&cek, &blob[..], &mut out, blob.len() as u64, Some(cb))?;
        Ok(out)
    })
    .await
    .map_err(|e| SbxError::Other(e.into()))?
}
