#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use sbx_core::config::{SbxConfig, SourceConfig};
use sbx_core::types::SyncRecord;
use sbx_core::{SbxError, SbxResult};
use sbx_crypto::names::RemotePaths;
use sbx_crypto::{remote_name, MasterKey, Session};
use sbx_storage::{OpendalStorage, RemoteEntry, StorageClient, TransferProgress, UploadMode};
use sbx_sync::{
    DeviceIdentity, DirectorySink, DirectorySource, DownloadOrchestrator, JsonRecordStore,
    RecordStore, SyncContext, UploadOrchestrator, UploadSettings,
};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::Notify;

pub const MASTER: [u8; 32] = [7u8; 32];

/// Injected failure for data uploads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fault {
    None,
    Status(u16),
    Timeout,
    /// Block until the task is dropped
    Hang,
}

/// In-memory store that counts uploads and can fail them on demand.
pub struct FlakyStorage {
    pub inner: OpendalStorage,
    fault: Mutex<Fault>,
    pub upload_calls: AtomicUsize,
    pub modes: Mutex<Vec<UploadMode>>,
    pub started: Notify,
    on_upload: Mutex<Option<Box<dyn FnOnce() + Send>>>,
}

impl FlakyStorage {
    pub fn new() -> Self {
        Self {
            inner: OpendalStorage::memory().unwrap(),
            fault: Mutex::new(Fault::None),
            upload_calls: AtomicUsize::new(0),
            modes: Mutex::new(Vec::new()),
            started: Notify::new(),
            on_upload: Mutex::new(None),
        }
    }

    /// Run `hook` once, at the start of the next data upload.
    pub fn on_next_upload(&self, hook: impl FnOnce() + Send + 'static) {
        *self.on_upload.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_fault(&self, fault: Fault) {
        *self.fault.lock().unwrap() = fault;
    }

    pub fn uploads(&self) -> usize {
        self.upload_calls.load(Ordering::SeqCst)
    }

    pub async fn put(&self, path: &str, data: &[u8]) {
        self.inner.operator().write(path, data.to_vec()).await.unwrap();
    }

    pub async fn get(&self, path: &str) -> Option<Vec<u8>> {
        self.inner
            .operator()
            .read(path)
            .await
            .ok()
            .map(|b| b.to_vec())
    }
}

#[async_trait]
impl StorageClient for FlakyStorage {
    async fn upload_file(
        &self,
        source: &Path,
        remote_path: &str,
        size: u64,
        mode: UploadMode,
        progress: Option<TransferProgress>,
    ) -> SbxResult<String> {
        self.upload_calls.fetch_add(1, Ordering::SeqCst);
        self.modes.lock().unwrap().push(mode);
        let hook = self.on_upload.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        let fault = *self.fault.lock().unwrap();
        match fault {
            Fault::None => {
                self.inner
                    .upload_file(source, remote_path, size, mode, progress)
                    .await
            }
            Fault::Status(code) => Err(SbxError::transport(Some(code), format!("HTTP {code}"))),
            Fault::Timeout => Err(SbxError::transport(None, "request timed out")),
            Fault::Hang => {
                self.started.notify_one();
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Err(SbxError::transport(None, "hung upload finished"))
            }
        }
    }

    async fn upload_metadata(&self, remote_path: &str, data: Vec<u8>) -> SbxResult<()> {
        self.inner.upload_metadata(remote_path, data).await
    }

    async fn download_file(
        &self,
        remote_path: &str,
        progress: Option<TransferProgress>,
    ) -> SbxResult<Bytes> {
        self.inner.download_file(remote_path, progress).await
    }

    async fn list_files(&self, path: &str) -> SbxResult<Vec<RemoteEntry>> {
        self.inner.list_files(path).await
    }

    async fn stat_file(&self, remote_path: &str) -> SbxResult<Option<RemoteEntry>> {
        self.inner.stat_file(remote_path).await
    }

    async fn delete_file(&self, remote_path: &str) -> SbxResult<()> {
        self.inner.delete_file(remote_path).await
    }

    async fn check_connection(&self) -> bool {
        self.inner.check_connection().await
    }

    async fn create_directory(&self, path: &str) -> SbxResult<()> {
        self.inner.create_directory(path).await
    }
}

/// A photo library, a record store, and an in-memory remote.
pub struct Harness {
    _tmp: TempDir,
    pub root: PathBuf,
    pub photos: PathBuf,
    pub storage: Arc<FlakyStorage>,
    pub records: Arc<JsonRecordStore>,
    pub ctx: SyncContext,
    pub paths: RemotePaths,
}

impl Harness {
    pub fn new() -> Self {
        Self::sharing(Arc::new(FlakyStorage::new()))
    }

    /// A second library with its own records, backing up to `storage`.
    pub fn sharing(storage: Arc<FlakyStorage>) -> Self {
        let tmp = TempDir::new().unwrap();
        let root = tmp.path().to_path_buf();
        let photos = root.join("photos");
        std::fs::create_dir_all(&photos).unwrap();

        let records = Arc::new(JsonRecordStore::open(&root.join("records.json")).unwrap());
        let ctx = Self::context(&records, &storage, MASTER);
        Self {
            _tmp: tmp,
            root,
            photos,
            storage,
            records,
            ctx,
            paths: RemotePaths::new("backup"),
        }
    }

    /// A context over the same records and store with another master key.
    pub fn context(
        records: &Arc<JsonRecordStore>,
        storage: &Arc<FlakyStorage>,
        master: [u8; 32],
    ) -> SyncContext {
        let session = Arc::new(Session::unlocked(
            MasterKey::from_bytes(master),
            Duration::ZERO,
        ));
        let device = DeviceIdentity {
            device_id: "0badc0de-1111-4222-8333-444455556666".into(),
            name: "test-device".into(),
            created_at: 0,
        };
        SyncContext::new(
            session,
            records.clone() as Arc<dyn RecordStore>,
            storage.clone() as Arc<dyn StorageClient>,
            device,
        )
    }

    pub fn settings(&self) -> UploadSettings {
        let mut config = SbxConfig::default();
        config.sync.temp_dir = self.temp_dir();
        config.storage.prefix = "backup".into();
        UploadSettings::from_config(&config)
    }

    pub fn temp_dir(&self) -> PathBuf {
        self.root.join("tmp")
    }

    pub fn orchestrator(&self) -> UploadOrchestrator {
        self.orchestrator_with(|_| {})
    }

    pub fn orchestrator_with(&self, tweak: impl FnOnce(&mut UploadSettings)) -> UploadOrchestrator {
        let mut settings = self.settings();
        tweak(&mut settings);
        let source = DirectorySource::new(&SourceConfig {
            roots: vec![self.photos.clone()],
            ..SourceConfig::default()
        });
        UploadOrchestrator::new(self.ctx.clone(), Arc::new(source), settings)
    }

    pub fn downloader(&self) -> DownloadOrchestrator {
        let sink = DirectorySink::new(self.root.join("restored"));
        DownloadOrchestrator::new(self.ctx.clone(), Arc::new(sink), "backup")
    }

    pub fn write_photo(&self, name: &str, bytes: &[u8]) -> PathBuf {
        let path = self.photos.join(name);
        std::fs::write(&path, bytes).unwrap();
        path
    }

    pub async fn record_for(&self, path: &Path) -> SyncRecord {
        self.records
            .get_by_local_path(&path.to_string_lossy())
            .await
            .unwrap()
            .expect("record exists")
    }

    /// Data object path the given content would be stored under.
    pub fn data_path_for(&self, content: &[u8], suffix: Option<&str>) -> String {
        let name = remote_name(content, &MasterKey::from_bytes(MASTER)).unwrap();
        self.paths.data(&RemotePaths::stem(&name, suffix))
    }

    pub fn metadata_path_for(&self, content: &[u8], suffix: Option<&str>) -> String {
        let name = remote_name(content, &MasterKey::from_bytes(MASTER)).unwrap();
        self.paths.metadata(&RemotePaths::stem(&name, suffix))
    }

    pub fn temp_artifacts(&self) -> usize {
        std::fs::read_dir(self.temp_dir())
            .map(|d| d.filter_map(Result::ok).count())
            .unwrap_or(0)
    }
}

/// Deterministic pseudo-random bytes.
pub fn sample(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}
