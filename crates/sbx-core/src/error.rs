use thiserror::Error;

pub type SbxResult<T> = Result<T, SbxError>;

/// Transport status codes that will not succeed on a retry.
pub const NON_RETRYABLE_STATUS: &[u16] = &[400, 401, 403, 404, 409, 423];

#[derive(Debug, Error)]
pub enum SbxError {
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// GCM tag mismatch: wrong password, wrong key, or tampered bytes.
    #[error("authentication failed: {0}")]
    AuthenticationFailure(String),

    #[error("unsupported format version: {0}")]
    UnsupportedFormatVersion(u8),

    #[error("crypto failure: {0}")]
    CryptoFailure(String),

    #[error("source file missing: {0}")]
    SourceMissing(String),

    #[error("transport error{}: {message}", status_suffix(.status))]
    Transport {
        status: Option<u16>,
        message: String,
    },

    /// An optimistic status transition lost to another writer.
    #[error("record state changed underneath: {0}")]
    RecordStateConflict(String),

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("session is locked")]
    Locked,

    #[error("operation cancelled")]
    Cancelled,

    #[error("config error: {0}")]
    Config(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn status_suffix(status: &Option<u16>) -> String {
    status.map(|s| format!(" ({s})")).unwrap_or_default()
}

impl SbxError {
    pub fn transport(status: Option<u16>, message: impl Into<String>) -> Self {
        SbxError::Transport {
            status,
            message: message.into(),
        }
    }

    /// HTTP-like status attached to a transport failure, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            SbxError::Transport { status, .. } => *status,
            _ => None,
        }
    }

    /// Whether the per-file pipeline should be attempted again after this error.
    ///
    /// Missing sources, lost claims, and 4xx client errors fail on first
    /// occurrence. Crypto errors are deterministic for the same inputs and
    /// are never retried either.
    pub fn is_retryable(&self) -> bool {
        match self {
            SbxError::Transport {
                status: Some(code), ..
            } => !NON_RETRYABLE_STATUS.contains(code),
            SbxError::Transport { status: None, .. } => true,
            SbxError::Io(_) | SbxError::ResourceExhausted(_) | SbxError::Other(_) => true,
            SbxError::SourceMissing(_)
            | SbxError::RecordStateConflict(_)
            | SbxError::InvalidInput(_)
            | SbxError::AuthenticationFailure(_)
            | SbxError::UnsupportedFormatVersion(_)
            | SbxError::CryptoFailure(_)
            | SbxError::Locked
            | SbxError::Cancelled
            | SbxError::Config(_)
            | SbxError::Serialization(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_errors_are_not_retryable() {
        for code in [400, 401, 403, 404, 409, 423] {
            let err = SbxError::transport(Some(code), "client error");
            assert!(!err.is_retryable(), "{code} must not be retried");
        }
    }

    #[test]
    fn server_and_network_errors_are_retryable() {
        assert!(SbxError::transport(Some(500), "internal").is_retryable());
        assert!(SbxError::transport(Some(503), "unavailable").is_retryable());
        assert!(SbxError::transport(None, "timed out").is_retryable());
    }

    #[test]
    fn pipeline_errors_classification() {
        assert!(!SbxError::SourceMissing("a.jpg".into()).is_retryable());
        assert!(!SbxError::RecordStateConflict("id".into()).is_retryable());
        assert!(!SbxError::AuthenticationFailure("tag".into()).is_retryable());
        assert!(SbxError::Io(std::io::Error::other("disk")).is_retryable());
    }

    #[test]
    fn transport_display_includes_status() {
        let err = SbxError::transport(Some(404), "Not Found");
        assert_eq!(err.to_string(), "transport error (404): Not Found");
        let err = SbxError::transport(None, "connection reset");
        assert_eq!(err.to_string(), "transport error: connection reset");
    }
}
