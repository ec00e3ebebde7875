//! Collaborators shared by the upload and download orchestrators.

use sbx_crypto::Session;
use sbx_storage::StorageClient;
use std::sync::Arc;

use crate::cek_store::CekStore;
use crate::device::DeviceIdentity;
use crate::store::RecordStore;

/// Everything a pipeline needs besides its own settings. Cheap to clone.
#[derive(Clone)]
pub struct SyncContext {
    pub session: Arc<Session>,
    pub records: Arc<dyn RecordStore>,
    pub ceks: Arc<CekStore>,
    pub storage: Arc<dyn StorageClient>,
    pub device: DeviceIdentity,
}

impl SyncContext {
    pub fn new(
        session: Arc<Session>,
        records: Arc<dyn RecordStore>,
        storage: Arc<dyn StorageClient>,
        device: DeviceIdentity,
    ) -> Self {
        let ceks = Arc::new(CekStore::new(Arc::clone(&records), device.device_id.clone()));
        Self {
            session,
            records,
            ceks,
            storage,
            device,
        }
    }
}

impl std::fmt::Debug for SyncContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncContext")
            .field("session", &self.session)
            .field("device", &self.device.device_id)
            .finish_non_exhaustive()
    }
}
