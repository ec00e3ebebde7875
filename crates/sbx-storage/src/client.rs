//! Remote store interface and its OpenDAL implementation.
//!
//! The store is untrusted: everything passed through here is already
//! ciphertext under an HMAC-derived name.

use async_trait::async_trait;
use bytes::Bytes;
use opendal::{ErrorKind, Metadata, Operator};
use sbx_core::{SbxError, SbxResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tracing::{debug, info};

/// Progress callback for transfers: (bytes_done, bytes_total)
pub type TransferProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

/// How a data object is sent to the store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    /// Single request with the whole body
    Direct,
    /// Multipart/streamed upload in fixed-size parts
    Chunked { chunk_size: usize },
}

impl UploadMode {
    /// Number of requests needed to send `size` bytes.
    pub fn part_count(&self, size: u64) -> u64 {
        match self {
            UploadMode::Direct => 1,
            UploadMode::Chunked { chunk_size } => {
                let chunk = (*chunk_size).max(1) as u64;
                size.div_ceil(chunk).max(1)
            }
        }
    }
}

/// One object or directory in a listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub path: String,
    pub size: u64,
    /// Store-assigned version tag (ETag, or a stable substitute)
    pub etag: Option<String>,
    pub last_modified: Option<String>,
    pub is_directory: bool,
}

#[async_trait]
pub trait StorageClient: Send + Sync {
    /// Upload the file at `source`; returns the new object's version tag.
    async fn upload_file(
        &self,
        source: &Path,
        remote_path: &str,
        size: u64,
        mode: UploadMode,
        progress: Option<TransferProgress>,
    ) -> SbxResult<String>;

    async fn upload_metadata(&self, remote_path: &str, data: Vec<u8>) -> SbxResult<()>;

    async fn download_file(
        &self,
        remote_path: &str,
        progress: Option<TransferProgress>,
    ) -> SbxResult<Bytes>;

    async fn list_files(&self, path: &str) -> SbxResult<Vec<RemoteEntry>>;

    /// `Ok(None)` if the object does not exist.
    async fn stat_file(&self, remote_path: &str) -> SbxResult<Option<RemoteEntry>>;

    async fn delete_file(&self, remote_path: &str) -> SbxResult<()>;

    async fn check_connection(&self) -> bool;

    async fn create_directory(&self, path: &str) -> SbxResult<()>;
}

/// Translate an OpenDAL error into a transport error with an HTTP-like status.
pub fn map_opendal_error(err: opendal::Error, action: &str, path: &str) -> SbxError {
    let status = match err.kind() {
        ErrorKind::NotFound => Some(404),
        ErrorKind::PermissionDenied => Some(403),
        ErrorKind::AlreadyExists => Some(409),
        ErrorKind::ConditionNotMatch => Some(412),
        ErrorKind::RangeNotSatisfied => Some(416),
        ErrorKind::RateLimited => Some(429),
        ErrorKind::ConfigInvalid
        | ErrorKind::Unsupported
        | ErrorKind::IsADirectory
        | ErrorKind::NotADirectory
        | ErrorKind::IsSameFile => Some(400),
        _ => None,
    };
    SbxError::transport(status, format!("{action} {path}: {err}"))
}

fn source_error(err: std::io::Error, source: &Path) -> SbxError {
    if err.kind() == std::io::ErrorKind::NotFound {
        SbxError::SourceMissing(source.display().to_string())
    } else {
        SbxError::Io(err)
    }
}

/// Version tag for an object: the ETag if the backend reports one,
/// otherwise content MD5, otherwise length plus modification time.
pub fn version_tag(meta: &Metadata) -> String {
    if let Some(etag) = meta.etag() {
        return etag.trim_matches('"').to_string();
    }
    if let Some(md5) = meta.content_md5() {
        return format!("md5:{md5}");
    }
    match meta.last_modified() {
        Some(ts) => format!("len:{}@{ts}", meta.content_length()),
        None => format!("len:{}", meta.content_length()),
    }
}

fn entry_from(path: &str, meta: &Metadata) -> RemoteEntry {
    RemoteEntry {
        path: path.to_string(),
        size: meta.content_length(),
        etag: if meta.is_dir() {
            None
        } else {
            Some(version_tag(meta))
        },
        last_modified: meta.last_modified().map(|t| t.to_string()),
        is_directory: meta.is_dir(),
    }
}

async fn read_full(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// [`StorageClient`] backed by an OpenDAL operator.
#[derive(Clone)]
pub struct OpendalStorage {
    op: Operator,
}

impl OpendalStorage {
    pub fn new(op: Operator) -> Self {
        Self { op }
    }

    /// In-memory store, for tests and dry runs.
    pub fn memory() -> SbxResult<Self> {
        let op = Operator::new(opendal::services::Memory::default())
            .map_err(|e| SbxError::Config(format!("creating memory operator: {e}")))?
            .finish();
        Ok(Self::new(op))
    }

    pub fn operator(&self) -> &Operator {
        &self.op
    }

    /// Part-wise upload. Backends without multi-write support get the parts
    /// staged in memory and sent in one request.
    async fn upload_chunked(
        &self,
        source: &Path,
        remote_path: &str,
        size: u64,
        chunk_size: usize,
        progress: Option<&TransferProgress>,
    ) -> SbxResult<()> {
        let chunk_size = chunk_size.max(1);
        let mut file = tokio::fs::File::open(source)
            .await
            .map_err(|e| source_error(e, source))?;

        let multi = self.op.info().full_capability().write_can_multi;
        let mut writer = if multi {
            Some(
                self.op
                    .writer_with(remote_path)
                    .chunk(chunk_size)
                    .await
                    .map_err(|e| map_opendal_error(e, "open writer", remote_path))?,
            )
        } else {
            None
        };
        let mut staged = Vec::new();

        let mut sent = 0u64;
        let mut parts = 0u64;
        loop {
            let mut buf = vec![0u8; chunk_size];
            let n = match read_full(&mut file, &mut buf).await {
                Ok(n) => n,
                Err(e) => {
                    if let Some(w) = writer.as_mut() {
                        let _ = w.abort().await;
                    }
                    return Err(source_error(e, source));
                }
            };
            if n == 0 {
                break;
            }
            buf.truncate(n);
            match writer.as_mut() {
                Some(w) => {
                    if let Err(e) = w.write(buf).await {
                        let _ = w.abort().await;
                        return Err(map_opendal_error(e, "upload part", remote_path));
                    }
                }
                None => staged.extend_from_slice(&buf),
            }
            sent += n as u64;
            parts += 1;
            if let Some(cb) = progress {
                cb(sent, size.max(sent));
            }
        }

        match writer {
            Some(mut w) => {
                w.close()
                    .await
                    .map_err(|e| map_opendal_error(e, "complete upload", remote_path))?;
            }
            None => {
                self.op
                    .write(remote_path, staged)
                    .await
                    .map_err(|e| map_opendal_error(e, "upload", remote_path))?;
            }
        }
        debug!(path = %remote_path, parts, bytes = sent, multi, "chunked upload complete");
        Ok(())
    }
}

#[async_trait]
impl StorageClient for OpendalStorage {
    async fn upload_file(
        &self,
        source: &Path,
        remote_path: &str,
        size: u64,
        mode: UploadMode,
        progress: Option<TransferProgress>,
    ) -> SbxResult<String> {
        match mode {
            UploadMode::Direct => {
                let data = tokio::fs::read(source)
                    .await
                    .map_err(|e| source_error(e, source))?;
                let len = data.len() as u64;
                self.op
                    .write(remote_path, data)
                    .await
                    .map_err(|e| map_opendal_error(e, "upload", remote_path))?;
                if let Some(cb) = &progress {
                    cb(len, size.max(len));
                }
            }
            UploadMode::Chunked { chunk_size } => {
                self.upload_chunked(source, remote_path, size, chunk_size, progress.as_ref())
                    .await?;
            }
        }

        let meta = self
            .op
            .stat(remote_path)
            .await
            .map_err(|e| map_opendal_error(e, "stat", remote_path))?;
        let tag = version_tag(&meta);
        info!(path = %remote_path, bytes = meta.content_length(), version = %tag, "uploaded object");
        Ok(tag)
    }

    async fn upload_metadata(&self, remote_path: &str, data: Vec<u8>) -> SbxResult<()> {
        self.op
            .write(remote_path, data)
            .await
            .map_err(|e| map_opendal_error(e, "upload metadata", remote_path))?;
        Ok(())
    }

    async fn download_file(
        &self,
        remote_path: &str,
        progress: Option<TransferProgress>,
    ) -> SbxResult<Bytes> {
        let buf = self
            .op
            .read(remote_path)
            .await
            .map_err(|e| map_opendal_error(e, "download", remote_path))?;
        let bytes = buf.to_bytes();
        if let Some(cb) = &progress {
            cb(bytes.len() as u64, bytes.len() as u64);
        }
        Ok(bytes)
    }

    async fn list_files(&self, path: &str) -> SbxResult<Vec<RemoteEntry>> {
        let entries = self
            .op
            .list(path)
            .await
            .map_err(|e| map_opendal_error(e, "list", path))?;
        Ok(entries
            .iter()
            .filter(|e| e.path() != path)
            .map(|e| entry_from(e.path(), e.metadata()))
            .collect())
    }

    async fn stat_file(&self, remote_path: &str) -> SbxResult<Option<RemoteEntry>> {
        match self.op.stat(remote_path).await {
            Ok(meta) => Ok(Some(entry_from(remote_path, &meta))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(map_opendal_error(e, "stat", remote_path)),
        }
    }

    async fn delete_file(&self, remote_path: &str) -> SbxResult<()> {
        self.op
            .delete(remote_path)
            .await
            .map_err(|e| map_opendal_error(e, "delete", remote_path))
    }

    async fn check_connection(&self) -> bool {
        crate::health::is_healthy(&self.op).await
    }

    async fn create_directory(&self, path: &str) -> SbxResult<()> {
        let dir = if path.ends_with('/') {
            path.to_string()
        } else {
            format!("{path}/")
        };
        self.op
            .create_dir(&dir)
            .await
            .map_err(|e| map_opendal_error(e, "create directory", &dir))
    }
}
