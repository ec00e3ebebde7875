//! Unlocked-session state: the in-memory master key and its lock.
//!
//! Constructed by the application root and shared as `Arc<Session>`.
//! Readers borrow the key for the duration of a closure; `lock()` takes the
//! write side, so it waits for in-flight users and then drops (zeroizes)
//! the key.

use sbx_core::{SbxError, SbxResult};
use std::sync::{Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};
use tracing::{debug, info};

use crate::kdf::MasterKey;
use crate::names::FilenameSalt;

pub struct Session {
    master: RwLock<Option<MasterKey>>,
    last_used: Mutex<Instant>,
    idle_timeout: Duration,
}

impl Session {
    /// A locked session. `idle_timeout` of zero disables idle locking.
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            master: RwLock::new(None),
            last_used: Mutex::new(Instant::now()),
            idle_timeout,
        }
    }

    pub fn unlocked(master: MasterKey, idle_timeout: Duration) -> Self {
        let session = Self::new(idle_timeout);
        session.unlock(master);
        session
    }

    pub fn unlock(&self, master: MasterKey) {
        let mut guard = self.master.write().unwrap_or_else(PoisonError::into_inner);
        *guard = Some(master);
        drop(guard);
        self.touch();
        info!("session unlocked");
    }

    /// Drop the master key. Blocks until current readers finish.
    pub fn lock(&self) {
        let mut guard = self.master.write().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            info!("session locked");
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.master
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .is_some()
    }

    /// Run `f` with the master key, or fail with `Locked`.
    pub fn with_master_key<T>(&self, f: impl FnOnce(&MasterKey) -> SbxResult<T>) -> SbxResult<T> {
        let guard = self.master.read().unwrap_or_else(PoisonError::into_inner);
        let master = guard.as_ref().ok_or(SbxError::Locked)?;
        let out = f(master);
        drop(guard);
        self.touch();
        out
    }

    pub fn filename_salt(&self) -> SbxResult<FilenameSalt> {
        self.with_master_key(FilenameSalt::derive)
    }

    /// Lock if the key has not been used for the idle timeout.
    ///
    /// Returns true if this call locked the session.
    pub fn lock_if_idle(&self, now: Instant) -> bool {
        if self.idle_timeout.is_zero() || !self.is_unlocked() {
            return false;
        }
        let last = *self.last_used.lock().unwrap_or_else(PoisonError::into_inner);
        if now.saturating_duration_since(last) < self.idle_timeout {
            return false;
        }
        debug!(idle_secs = self.idle_timeout.as_secs(), "idle timeout reached");
        self.lock();
        true
    }

    fn touch(&self) {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("unlocked", &self.is_unlocked())
            .field("idle_timeout", &self.idle_timeout)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::KEY_SIZE;
    use std::sync::Arc;

    fn key() -> MasterKey {
        MasterKey::from_bytes([3u8; KEY_SIZE])
    }

    #[test]
    fn test_locked_session_refuses() {
        let session = Session::new(Duration::ZERO);
        let err = session.with_master_key(|_| Ok(())).unwrap_err();
        assert!(matches!(err, SbxError::Locked));
    }

    #[test]
    fn test_unlock_then_lock() {
        let session = Session::new(Duration::ZERO);
        session.unlock(key());
        let first = session.with_master_key(|mk| Ok(mk.as_bytes()[0])).unwrap();
        assert_eq!(first, 3);

        session.lock();
        assert!(!session.is_unlocked());
        assert!(matches!(
            session.with_master_key(|_| Ok(())),
            Err(SbxError::Locked)
        ));
    }

    #[test]
    fn test_closure_error_propagates() {
        let session = Session::unlocked(key(), Duration::ZERO);
        let err = session
            .with_master_key::<()>(|_| Err(SbxError::InvalidInput("boom".into())))
            .unwrap_err();
        assert!(matches!(err, SbxError::InvalidInput(_)));
    }

    #[test]
    fn test_lock_if_idle() {
        let session = Session::unlocked(key(), Duration::from_secs(60));
        assert!(!session.lock_if_idle(Instant::now()));
        assert!(session.is_unlocked());

        assert!(session.lock_if_idle(Instant::now() + Duration::from_secs(61)));
        assert!(!session.is_unlocked());
    }

    #[test]
    fn test_zero_timeout_never_idles() {
        let session = Session::unlocked(key(), Duration::ZERO);
        assert!(!session.lock_if_idle(Instant::now() + Duration::from_secs(3600)));
        assert!(session.is_unlocked());
    }

    #[test]
    fn test_shared_across_threads() {
        let session = Arc::new(Session::unlocked(key(), Duration::ZERO));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let s = Arc::clone(&session);
                std::thread::spawn(move || s.filename_salt().map(|salt| salt.as_bytes()[0]))
            })
            .collect();
        let firsts: Vec<u8> = handles
            .into_iter()
            .map(|h| h.join().unwrap().unwrap())
            .collect();
        assert!(firsts.windows(2).all(|w| w[0] == w[1]));
    }
}
