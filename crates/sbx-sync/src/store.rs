//! Persistent sync records and wrapped CEKs.
//!
//! `RecordStore` is the seam the orchestrators depend on. `JsonRecordStore`
//! keeps everything in memory and mirrors each mutation to a JSON file via
//! an atomic write (temp file, then rename), so a crash never leaves a
//! half-written store behind.

use async_trait::async_trait;
use sbx_core::types::{SyncRecord, SyncStatus, WrappedCekRecord};
use sbx_core::{SbxError, SbxResult};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, id: &str) -> SbxResult<Option<SyncRecord>>;

    async fn get_by_local_path(&self, local_path: &str) -> SbxResult<Option<SyncRecord>>;

    /// Insert a new record. Fails if the id already exists.
    async fn insert(&self, record: SyncRecord) -> SbxResult<()>;

    /// Replace an existing record. Fails if the id is unknown.
    async fn update(&self, record: SyncRecord) -> SbxResult<()>;

    /// Compare-and-set on status. Returns the number of rows changed (0 or 1).
    async fn update_if_status_equals(
        &self,
        id: &str,
        expected: SyncStatus,
        new: SyncStatus,
    ) -> SbxResult<usize>;

    /// Rewrite every record in `from` to `to`. Returns the number changed.
    async fn set_status_where(&self, from: SyncStatus, to: SyncStatus) -> SbxResult<usize>;

    async fn list_by_status(&self, statuses: &[SyncStatus]) -> SbxResult<Vec<SyncRecord>>;

    async fn all(&self) -> SbxResult<Vec<SyncRecord>>;

    /// Delete Failed records, optionally only those last attempted before
    /// `attempted_before` (Unix seconds). Returns the number deleted.
    async fn delete_failed(&self, attempted_before: Option<u64>) -> SbxResult<usize>;

    async fn get_wrapped_cek(&self, cek_id: &str) -> SbxResult<Option<WrappedCekRecord>>;

    /// Insert unless a CEK with this id exists. Returns true if inserted.
    async fn insert_wrapped_cek_if_absent(&self, record: WrappedCekRecord) -> SbxResult<bool>;
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreFile {
    #[serde(default)]
    records: HashMap<String, SyncRecord>,
    #[serde(default)]
    ceks: HashMap<String, WrappedCekRecord>,
}

/// JSON-file record store.
pub struct JsonRecordStore {
    /// `None` keeps the store purely in memory
    db_path: Option<PathBuf>,
    inner: Mutex<StoreFile>,
}

impl JsonRecordStore {
    /// Load or create a store at the given path.
    pub fn open(db_path: &Path) -> SbxResult<Self> {
        let inner = if db_path.exists() {
            let content = std::fs::read_to_string(db_path)?;
            serde_json::from_str(&content).map_err(|e| {
                SbxError::Config(format!("parsing record store {}: {e}", db_path.display()))
            })?
        } else {
            StoreFile::default()
        };
        tracing::debug!(
            path = %db_path.display(),
            records = inner.records.len(),
            ceks = inner.ceks.len(),
            "opened record store"
        );
        Ok(Self {
            db_path: Some(db_path.to_path_buf()),
            inner: Mutex::new(inner),
        })
    }

    pub fn in_memory() -> Self {
        Self {
            db_path: None,
            inner: Mutex::new(StoreFile::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, StoreFile> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Write the whole store atomically. Called with the lock held so
    /// concurrent writers cannot interleave files.
    fn persist(&self, data: &StoreFile) -> SbxResult<()> {
        let Some(db_path) = &self.db_path else {
            return Ok(());
        };
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let json = serde_json::to_vec_pretty(data)?;
        let tmp_path = db_path.with_extension("tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, db_path)?;
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().records.is_empty()
    }
}

#[async_trait]
impl RecordStore for JsonRecordStore {
    async fn get(&self, id: &str) -> SbxResult<Option<SyncRecord>> {
        Ok(self.lock().records.get(id).cloned())
    }

    async fn get_by_local_path(&self, local_path: &str) -> SbxResult<Option<SyncRecord>> {
        Ok(self
            .lock()
            .records
            .values()
            .find(|r| r.local_path == local_path)
            .cloned())
    }

    async fn insert(&self, record: SyncRecord) -> SbxResult<()> {
        let mut data = self.lock();
        if data.records.contains_key(&record.id) {
            return Err(SbxError::InvalidInput(format!(
                "record {} already exists",
                record.id
            )));
        }
        data.records.insert(record.id.clone(), record);
        self.persist(&data)
    }

    async fn update(&self, record: SyncRecord) -> SbxResult<()> {
        let mut data = self.lock();
        match data.records.get_mut(&record.id) {
            Some(slot) => *slot = record,
            None => {
                return Err(SbxError::RecordStateConflict(format!(
                    "record {} no longer exists",
                    record.id
                )))
            }
        }
        self.persist(&data)
    }

    async fn update_if_status_equals(
        &self,
        id: &str,
        expected: SyncStatus,
        new: SyncStatus,
    ) -> SbxResult<usize> {
        let mut data = self.lock();
        let changed = match data.records.get_mut(id) {
            Some(r) if r.status == expected => {
                r.status = new;
                r.updated_at = sbx_core::types::unix_now();
                1
            }
            _ => 0,
        };
        if changed > 0 {
            self.persist(&data)?;
        }
        Ok(changed)
    }

    async fn set_status_where(&self, from: SyncStatus, to: SyncStatus) -> SbxResult<usize> {
        let mut data = self.lock();
        let now = sbx_core::types::unix_now();
        let mut changed = 0;
        for r in data.records.values_mut().filter(|r| r.status == from) {
            r.status = to;
            r.updated_at = now;
            changed += 1;
        }
        if changed > 0 {
            self.persist(&data)?;
        }
        Ok(changed)
    }

    async fn list_by_status(&self, statuses: &[SyncStatus]) -> SbxResult<Vec<SyncRecord>> {
        let mut out: Vec<SyncRecord> = self
            .lock()
            .records
            .values()
            .filter(|r| statuses.contains(&r.status))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(out)
    }

    async fn all(&self) -> SbxResult<Vec<SyncRecord>> {
        let mut out: Vec<SyncRecord> = self.lock().records.values().cloned().collect();
        out.sort_by(|a, b| a.local_path.cmp(&b.local_path));
        Ok(out)
    }

    async fn delete_failed(&self, attempted_before: Option<u64>) -> SbxResult<usize> {
        let mut data = self.lock();
        let before = data.records.len();
        data.records.retain(|_, r| {
            if r.status != SyncStatus::Failed {
                return true;
            }
            match attempted_before {
                None => false,
                Some(cutoff) => r.last_attempt_at.unwrap_or(r.updated_at) >= cutoff,
            }
        });
        let removed = before - data.records.len();
        if removed > 0 {
            self.persist(&data)?;
        }
        Ok(removed)
    }

    async fn get_wrapped_cek(&self, cek_id: &str) -> SbxResult<Option<WrappedCekRecord>> {
        Ok(self.lock().ceks.get(cek_id).cloned())
    }

    async fn insert_wrapped_cek_if_absent(&self, record: WrappedCekRecord) -> SbxResult<bool> {
        let mut data = self.lock();
        if data.ceks.contains_key(&record.cek_id) {
            return Ok(false);
        }
        data.ceks.insert(record.cek_id.clone(), record);
        self.persist(&data)?;
        Ok(true)
    }
}
