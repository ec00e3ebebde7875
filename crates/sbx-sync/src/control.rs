//! Pause and cancel signals for a running backup.

use sbx_core::{SbxError, SbxResult};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Cooperative run control. Workers call [`RunControl::checkpoint`] between
/// pipeline steps; nothing is interrupted mid-step.
#[derive(Debug, Clone)]
pub struct RunControl {
    cancel: CancellationToken,
    paused: Arc<watch::Sender<bool>>,
}

impl Default for RunControl {
    fn default() -> Self {
        Self::new()
    }
}

impl RunControl {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self {
            cancel: CancellationToken::new(),
            paused: Arc::new(tx),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
        // Wake anyone parked on the pause channel
        self.paused.send_replace(*self.paused.borrow());
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn pause(&self) {
        self.paused.send_replace(true);
    }

    pub fn resume(&self) {
        self.paused.send_replace(false);
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.borrow()
    }

    pub fn token(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Return immediately if running, wait while paused, and fail with
    /// `Cancelled` once cancelled. Re-checks at least every `poll`.
    pub async fn checkpoint(&self, poll: Duration) -> SbxResult<()> {
        let mut rx = self.paused.subscribe();
        loop {
            if self.cancel.is_cancelled() {
                return Err(SbxError::Cancelled);
            }
            if !*rx.borrow_and_update() {
                return Ok(());
            }
            tokio::select! {
                _ = self.cancel.cancelled() => return Err(SbxError::Cancelled),
                _ = rx.changed() => {}
                _ = tokio::time::sleep(poll) => {}
            }
        }
    }

    /// Sleep for `delay` unless cancelled first.
    pub async fn sleep(&self, delay: Duration) -> SbxResult<()> {
        tokio::select! {
            _ = self.cancel.cancelled() => Err(SbxError::Cancelled),
            _ = tokio::time::sleep(delay) => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const POLL: Duration = Duration::from_millis(500);

    #[tokio::test]
    async fn test_checkpoint_passes_when_running() {
        let control = RunControl::new();
        assert!(control.checkpoint(POLL).await.is_ok());
    }

    #[tokio::test]
    async fn test_checkpoint_fails_after_cancel() {
        let control = RunControl::new();
        control.cancel();
        assert!(matches!(
            control.checkpoint(POLL).await,
            Err(SbxError::Cancelled)
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_paused_checkpoint_waits_for_resume() {
        let control = RunControl::new();
        control.pause();

        let waiter = {
            let c = control.clone();
            tokio::spawn(async move { c.checkpoint(POLL).await })
        };
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(!waiter.is_finished());

        control.resume();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_while_paused() {
        let control = RunControl::new();
        control.pause();
        let waiter = {
            let c = control.clone();
            tokio::spawn(async move { c.checkpoint(POLL).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.cancel();
        assert!(matches!(waiter.await.unwrap(), Err(SbxError::Cancelled)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sleep_is_cancellable() {
        let control = RunControl::new();
        let c = control.clone();
        let sleeper = tokio::spawn(async move { c.sleep(Duration::from_secs(3600)).await });
        tokio::time::sleep(Duration::from_secs(1)).await;
        control.cancel();
        assert!(matches!(sleeper.await.unwrap(), Err(SbxError::Cancelled)));
    }
}
