//! sbx-sync: backup engine for Shoebox
//!
//! Record store, CEK store, change source and restore sink collaborators,
//! and the upload/download orchestrators that drive them.

pub mod cek_store;
pub mod concurrency;
pub mod context;
pub mod control;
pub mod device;
pub mod download;
pub mod progress;
pub mod retry;
pub mod sink;
pub mod source;
pub mod store;
pub mod upload;

pub use cek_store::CekStore;
pub use concurrency::{ChunkPolicy, ConfiguredBudget, MemoryProbe};
pub use context::SyncContext;
pub use control::RunControl;
pub use device::DeviceIdentity;
pub use download::{DownloadOrchestrator, PhaseProgress, RestoreError, RestoredFile};
pub use progress::{FileUploadState, ProgressTracker, StepObserver};
pub use retry::RetryPolicy;
pub use sink::{DirectorySink, RestoreSink};
pub use source::{ChangeSource, DirectorySource};
pub use store::{JsonRecordStore, RecordStore};
pub use upload::{SyncCounters, UploadOrchestrator, UploadReport, UploadSettings};
