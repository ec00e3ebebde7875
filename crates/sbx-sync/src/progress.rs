//! Live per-file upload state for in-flight pipelines.

use sbx_core::types::UploadStep;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Snapshot of one in-flight file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileUploadState {
    pub record_id: String,
    pub file_name: String,
    pub step: UploadStep,
    pub bytes_processed: u64,
    pub bytes_total: u64,
}

/// Called with the new state whenever a file enters a step.
pub type StepObserver = Arc<dyn Fn(&FileUploadState) + Send + Sync>;

/// Shared map of in-flight files. Cheap to clone.
#[derive(Clone, Default)]
pub struct ProgressTracker {
    inner: Arc<Mutex<HashMap<String, FileUploadState>>>,
    observer: Arc<Mutex<Option<StepObserver>>>,
}

impl std::fmt::Debug for ProgressTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProgressTracker")
            .field("in_flight", &self.lock().len())
            .finish()
    }
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, FileUploadState>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Install a callback for step transitions, replacing any previous one.
    pub fn on_step(&self, observer: impl Fn(&FileUploadState) + Send + Sync + 'static) {
        *self.observer.lock().unwrap_or_else(PoisonError::into_inner) = Some(Arc::new(observer));
    }

    fn notify(&self, state: Option<FileUploadState>) {
        let Some(state) = state else { return };
        let observer = self
            .observer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(observer) = observer {
            observer(&state);
        }
    }

    pub fn begin(&self, record_id: &str, file_name: &str, bytes_total: u64) {
        let state = FileUploadState {
            record_id: record_id.to_string(),
            file_name: file_name.to_string(),
            step: UploadStep::Hashing,
            bytes_processed: 0,
            bytes_total,
        };
        self.lock().insert(record_id.to_string(), state.clone());
        self.notify(Some(state));
    }

    /// Move to `step`. Steps only advance; a backwards move is ignored.
    pub fn set_step(&self, record_id: &str, step: UploadStep) {
        let entered = match self.lock().get_mut(record_id) {
            Some(state) if step > state.step => {
                state.step = step;
                state.bytes_processed = 0;
                Some(state.clone())
            }
            _ => None,
        };
        self.notify(entered);
    }

    /// Restart from `Hashing` for a new attempt.
    pub fn restart(&self, record_id: &str) {
        let entered = self.lock().get_mut(record_id).map(|state| {
            state.step = UploadStep::Hashing;
            state.bytes_processed = 0;
            state.clone()
        });
        self.notify(entered);
    }

    pub fn set_bytes(&self, record_id: &str, processed: u64, total: u64) {
        if let Some(state) = self.lock().get_mut(record_id) {
            state.bytes_processed = processed;
            state.bytes_total = total;
        }
    }

    /// Remove a file that has left the batch.
    pub fn finish(&self, record_id: &str) {
        self.lock().remove(record_id);
    }

    pub fn get(&self, record_id: &str) -> Option<FileUploadState> {
        self.lock().get(record_id).cloned()
    }

    pub fn snapshot(&self) -> Vec<FileUploadState> {
        let mut all: Vec<_> = self.lock().values().cloned().collect();
        all.sort_by(|a, b| a.file_name.cmp(&b.file_name));
        all
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steps_only_advance() {
        let t = ProgressTracker::new();
        t.begin("r1", "a.jpg", 100);
        t.set_step("r1", UploadStep::UploadingFile);
        t.set_step("r1", UploadStep::Encrypting);
        assert_eq!(t.get("r1").unwrap().step, UploadStep::UploadingFile);

        t.restart("r1");
        assert_eq!(t.get("r1").unwrap().step, UploadStep::Hashing);
    }

    #[test]
    fn test_observer_sees_each_step_once() {
        let t = ProgressTracker::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        t.on_step(move |s| sink.lock().unwrap().push(s.step));

        t.begin("r1", "a.jpg", 10);
        t.set_step("r1", UploadStep::Encrypting);
        t.set_step("r1", UploadStep::Encrypting);
        t.set_bytes("r1", 5, 10);
        t.set_step("r1", UploadStep::Hashing);
        t.set_step("r1", UploadStep::Done);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![UploadStep::Hashing, UploadStep::Encrypting, UploadStep::Done]
        );
    }

    #[test]
    fn test_bytes_and_finish() {
        let t = ProgressTracker::new();
        t.begin("r1", "a.jpg", 100);
        t.set_bytes("r1", 40, 100);
        assert_eq!(t.get("r1").unwrap().bytes_processed, 40);

        t.finish("r1");
        assert!(t.get("r1").is_none());
        assert!(t.is_empty());
        // Updates for unknown files are ignored
        t.set_bytes("r1", 1, 1);
        assert!(t.snapshot().is_empty());
    }
}
