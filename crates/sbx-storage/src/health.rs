//! Storage health check

use opendal::Operator;
use sbx_core::SbxResult;

use crate::client::map_opendal_error;

/// Verify the storage endpoint is reachable by listing the root
pub async fn check_health(op: &Operator) -> SbxResult<()> {
    op.list("/")
        .await
        .map(|_| ())
        .map_err(|e| map_opendal_error(e, "health check", "/"))
}

/// Returns true if storage is reachable, false otherwise (non-panicking)
pub async fn is_healthy(op: &Operator) -> bool {
    match check_health(op).await {
        Ok(()) => true,
        Err(e) => {
            tracing::warn!(error = %e, "storage health check failed");
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_backend_is_healthy() {
        let op = Operator::new(opendal::services::Memory::default())
            .unwrap()
            .finish();
        assert!(is_healthy(&op).await);
        assert!(check_health(&op).await.is_ok());
    }
}
