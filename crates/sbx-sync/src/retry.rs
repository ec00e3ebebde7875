//! Per-file retry with exponential backoff.

use sbx_core::config::SyncConfig;
use sbx_core::{SbxError, SbxResult};
use std::future::Future;
use std::time::Duration;
use tracing::{debug, warn};

use crate::control::RunControl;

/// Exponential backoff: the wait after the n-th failure is `base · 2^(n-1)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 5,
            base: Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            max_retries: config.max_retries,
            base: Duration::from_millis(config.backoff_base_ms),
        }
    }

    /// Total attempts including the first.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries.saturating_add(1)
    }

    /// Delay before retry number `retry` (1-based).
    pub fn delay_for(&self, retry: u32) -> Duration {
        let shift = retry.saturating_sub(1).min(16);
        self.base.saturating_mul(1u32 << shift)
    }
}

/// Outcome of [`retry`]: the last result and how many attempts ran.
#[derive(Debug)]
pub struct Retried<T> {
    pub result: SbxResult<T>,
    pub attempts: u32,
}

/// Run `op` until it succeeds, fails with a non-retryable error, or the
/// policy is exhausted. `op` receives the 1-based attempt number.
///
/// Backoff sleeps end early with `Cancelled` if `control` is cancelled.
pub async fn retry<T, F, Fut>(
    policy: &RetryPolicy,
    control: &RunControl,
    label: &str,
    mut op: F,
) -> Retried<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = SbxResult<T>>,
{
    let mut attempt = 1;
    loop {
        let err = match op(attempt).await {
            Ok(value) => {
                return Retried {
                    result: Ok(value),
                    attempts: attempt,
                }
            }
            Err(e) => e,
        };

        if !err.is_retryable() {
            debug!(label, attempt, "not retrying: {err}");
            return Retried {
                result: Err(err),
                attempts: attempt,
            };
        }
        if attempt >= policy.max_attempts() {
            warn!(label, attempts = attempt, "giving up: {err}");
            return Retried {
                result: Err(err),
                attempts: attempt,
            };
        }

        let delay = policy.delay_for(attempt);
        warn!(label, attempt, delay_ms = delay.as_millis() as u64, "retrying: {err}");
        if control.sleep(delay).await.is_err() {
            return Retried {
                result: Err(SbxError::Cancelled),
                attempts: attempt,
            };
        }
        attempt += 1;
    }
}
