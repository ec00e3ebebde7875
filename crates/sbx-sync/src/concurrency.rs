//! Adaptive per-batch concurrency from estimated memory cost.

use sbx_core::config::SyncConfig;
use sbx_core::types::SyncRecord;
use sbx_core::SbxError;
use tracing::{debug, warn};

const MIB: u64 = 1024 * 1024;

/// Fixed per-pipeline overhead (buffers, metadata, bookkeeping).
const PIPELINE_OVERHEAD: u64 = 2 * MIB;

/// Hard ceiling on concurrent pipelines, whatever the configuration says.
pub const MAX_CONCURRENCY: usize = 3;

/// Reports how much memory the process may still use.
pub trait MemoryProbe: Send + Sync {
    fn headroom_bytes(&self) -> u64;
}

/// Fixed headroom taken from configuration.
#[derive(Debug, Clone, Copy)]
pub struct ConfiguredBudget {
    bytes: u64,
}

impl ConfiguredBudget {
    pub fn new(bytes: u64) -> Self {
        Self { bytes }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.memory_budget_mb.saturating_mul(MIB))
    }
}

impl MemoryProbe for ConfiguredBudget {
    fn headroom_bytes(&self) -> u64 {
        self.bytes
    }
}

/// How a file of a given size and type is transferred.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPolicy {
    pub threshold: u64,
    pub chunk_size: u64,
}

impl Default for ChunkPolicy {
    fn default() -> Self {
        Self {
            threshold: 10 * MIB,
            chunk_size: 5 * MIB,
        }
    }
}

impl ChunkPolicy {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            threshold: config.chunk_threshold_mb.saturating_mul(MIB),
            chunk_size: config.chunk_size_mb.max(1).saturating_mul(MIB),
        }
    }

    /// Videos and anything above the threshold go up in chunks.
    pub fn is_chunked(&self, size: u64, mime_type: Option<&str>) -> bool {
        mime_type.is_some_and(|m| m.starts_with("video/")) || size > self.threshold
    }
}

/// Peak memory one pipeline is expected to need for a file.
pub fn estimate_file_memory(size: u64, chunked: bool, chunk_size: u64) -> u64 {
    let encrypted = size.saturating_add(size / 20);
    let chunk = if chunked { chunk_size } else { 0 };
    size.saturating_add(encrypted)
        .saturating_add(chunk)
        .saturating_add(PIPELINE_OVERHEAD)
}

/// Concurrency for one batch: how many of its costliest files fit in 70%
/// of the headroom, clamped to `[1, max_concurrency]` and the batch size.
/// `max_concurrency` itself never exceeds [`MAX_CONCURRENCY`].
pub fn plan_concurrency(
    batch: &[SyncRecord],
    probe: &dyn MemoryProbe,
    chunks: &ChunkPolicy,
    max_concurrency: usize,
) -> usize {
    if batch.is_empty() {
        return 1;
    }
    let budget = probe.headroom_bytes() / 10 * 7;
    let per_file = batch
        .iter()
        .map(|r| {
            let chunked = chunks.is_chunked(r.size, r.mime_type.as_deref());
            estimate_file_memory(r.size, chunked, chunks.chunk_size)
        })
        .max()
        .unwrap_or(PIPELINE_OVERHEAD);

    let feasible = usize::try_from(budget / per_file.max(1)).unwrap_or(usize::MAX);
    if feasible == 0 {
        let err = SbxError::ResourceExhausted(format!(
            "largest file needs ~{} MiB, budget is {} MiB",
            per_file / MIB,
            budget / MIB
        ));
        warn!("{err}; continuing one file at a time");
        return 1;
    }

    let cap = max_concurrency.clamp(1, MAX_CONCURRENCY);
    let planned = feasible.min(cap).min(batch.len());
    debug!(batch = batch.len(), per_file, budget, planned, "planned batch concurrency");
    planned
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::types::CandidateFile;

    fn record(size: u64, mime: &str) -> SyncRecord {
        SyncRecord::new(
            &CandidateFile {
                local_identifier: format!("/p/{size}"),
                mtime: 1,
                size,
                mime_type: Some(mime.into()),
            },
            0,
        )
    }

    #[test]
    fn test_chunk_policy() {
        let policy = ChunkPolicy::default();
        assert!(policy.is_chunked(1024, Some("video/mp4")));
        assert!(policy.is_chunked(11 * MIB, Some("image/jpeg")));
        assert!(!policy.is_chunked(10 * MIB, Some("image/jpeg")));
        assert!(!policy.is_chunked(100, None));
    }

    #[test]
    fn test_estimate() {
        assert_eq!(estimate_file_memory(0, false, 5 * MIB), 2 * MIB);
        assert_eq!(
            estimate_file_memory(20 * MIB, true, 5 * MIB),
            20 * MIB + 21 * MIB + 5 * MIB + 2 * MIB
        );
    }

    #[test]
    fn test_small_files_cap_at_max() {
        let batch: Vec<_> = (0..10).map(|i| record(1000 + i, "image/jpeg")).collect();
        let probe = ConfiguredBudget::new(512 * MIB);
        assert_eq!(plan_concurrency(&batch, &probe, &ChunkPolicy::default(), 3), 3);
    }

    #[test]
    fn test_configured_max_above_ceiling_is_capped() {
        let batch: Vec<_> = (0..10).map(|i| record(1000 + i, "image/jpeg")).collect();
        let budget = ConfiguredBudget::new(4096 * MIB);
        assert_eq!(
            plan_concurrency(&batch, &budget, &ChunkPolicy::default(), 8),
            MAX_CONCURRENCY
        );
        assert_eq!(plan_concurrency(&batch, &budget, &ChunkPolicy::default(), 0), 1);
    }

    #[test]
    fn test_clamped_to_batch_size() {
        let batch = vec![record(1000, "image/jpeg"), record(2000, "image/jpeg")];
        let probe = ConfiguredBudget::new(512 * MIB);
        assert_eq!(plan_concurrency(&batch, &probe, &ChunkPolicy::default(), 3), 2);
    }

    #[test]
    fn test_large_files_reduce_concurrency() {
        // 100 MiB video needs ~212 MiB; 70% of 512 MiB fits one
        let batch = vec![record(100 * MIB, "video/mp4"), record(1000, "image/jpeg")];
        let probe = ConfiguredBudget::new(512 * MIB);
        assert_eq!(plan_concurrency(&batch, &probe, &ChunkPolicy::default(), 3), 1);
    }

    #[test]
    fn test_exhausted_budget_still_runs_one() {
        let batch = vec![record(1024 * MIB, "video/mp4")];
        let probe = ConfiguredBudget::new(16 * MIB);
        assert_eq!(plan_concurrency(&batch, &probe, &ChunkPolicy::default(), 3), 1);
    }
}
