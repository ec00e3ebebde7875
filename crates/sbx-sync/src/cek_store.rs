//! Per-file content encryption keys: lookup, creation, and persistence.
//!
//! A CEK is created once per id and never regenerated. First-use calls for
//! the same id serialize on a per-id async mutex, so concurrent callers all
//! observe the key the first one persisted.

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use sbx_core::types::{unix_now, WrappedCekRecord};
use sbx_core::{SbxError, SbxResult};
use sbx_crypto::{generate_cek, unwrap_cek, wrap_cek, Cek, Session};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

use crate::store::RecordStore;

pub struct CekStore {
    records: Arc<dyn RecordStore>,
    device_id: String,
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl CekStore {
    pub fn new(records: Arc<dyn RecordStore>, device_id: impl Into<String>) -> Self {
        Self {
            records,
            device_id: device_id.into(),
            locks: Mutex::new(HashMap::new()),
        }
    }

    fn id_lock(&self, cek_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(locks.entry(cek_id.to_string()).or_default())
    }

    fn release(&self, cek_id: &str, lock: Arc<tokio::sync::Mutex<()>>) {
        let mut locks = self.locks.lock().unwrap_or_else(PoisonError::into_inner);
        // Map entry plus our handle: nobody else is waiting on this id
        if Arc::strong_count(&lock) <= 2 {
            locks.remove(cek_id);
        }
    }

    fn decode(session: &Session, record: &WrappedCekRecord) -> SbxResult<Cek> {
        let wrapped = STANDARD.decode(&record.wrapped).map_err(|e| {
            SbxError::InvalidInput(format!("wrapped CEK {} is not base64: {e}", record.cek_id))
        })?;
        session.with_master_key(|mk| unwrap_cek(mk, &wrapped))
    }

    /// Return the CEK for `cek_id`, creating and persisting it on first use.
    pub async fn get_or_create_cek(&self, cek_id: &str, session: &Session) -> SbxResult<Cek> {
        let lock = self.id_lock(cek_id);
        let result = {
            let _guard = lock.lock().await;
            self.get_or_create_locked(cek_id, session).await
        };
        self.release(cek_id, lock);
        result
    }

    async fn get_or_create_locked(&self, cek_id: &str, session: &Session) -> SbxResult<Cek> {
        if let Some(existing) = self.records.get_wrapped_cek(cek_id).await? {
            return Self::decode(session, &existing);
        }

        let cek = generate_cek();
        let wrapped = session.with_master_key(|mk| wrap_cek(mk, &cek))?;
        let record = WrappedCekRecord {
            cek_id: cek_id.to_string(),
            wrapped: STANDARD.encode(wrapped),
            device_id: self.device_id.clone(),
            created_at: unix_now(),
        };

        if self.records.insert_wrapped_cek_if_absent(record).await? {
            debug!(cek_id, "created content key");
            return Ok(cek);
        }

        // Another process stored one first; theirs is authoritative
        match self.records.get_wrapped_cek(cek_id).await? {
            Some(existing) => Self::decode(session, &existing),
            None => Err(SbxError::RecordStateConflict(format!(
                "content key {cek_id} vanished during creation"
            ))),
        }
    }

    /// Look up an existing CEK. Never creates one.
    pub async fn get_cek(&self, cek_id: &str, session: &Session) -> SbxResult<Cek> {
        match self.records.get_wrapped_cek(cek_id).await? {
            Some(existing) => Self::decode(session, &existing),
            None => Err(SbxError::InvalidInput(format!(
                "no content key stored for id {cek_id}"
            ))),
        }
    }
}
