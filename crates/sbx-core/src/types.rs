use serde::{Deserialize, Serialize};

/// Persistent sync status of a local file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SyncStatus {
    /// Observed locally, waiting for an upload attempt
    Pending,
    /// Claimed by an active pipeline
    Uploading,
    /// Ciphertext and metadata are stored remotely
    Synced,
    /// Last attempt failed; eligible for another run
    Failed,
    /// Remote name collided with another writer's object
    Conflict,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Pending => "pending",
            SyncStatus::Uploading => "uploading",
            SyncStatus::Synced => "synced",
            SyncStatus::Failed => "failed",
            SyncStatus::Conflict => "conflict",
        }
    }
}

impl std::fmt::Display for SyncStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-file record kept by the record store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncRecord {
    /// Stable record identifier (UUID v4)
    pub id: String,
    /// Local identifier reported by the change source (usually a path)
    pub local_path: String,
    /// mtime as Unix timestamp (seconds) when last observed
    pub mtime: u64,
    /// Size in bytes when last observed
    pub size: u64,
    /// MIME type guessed by the change source
    #[serde(default)]
    pub mime_type: Option<String>,
    /// SHA-256 of the plaintext at last successful encryption (hex)
    #[serde(default)]
    pub content_hash: Option<String>,
    /// Remote name stem (hex HMAC, possibly with a device suffix)
    #[serde(default)]
    pub remote_name: Option<String>,
    /// Version tag (etag) returned by storage for the data object
    #[serde(default)]
    pub remote_version: Option<String>,
    /// Identifier of the CEK protecting this file
    pub cek_id: String,
    /// Device suffix applied after a remote name collision
    #[serde(default)]
    pub conflict_suffix: Option<String>,
    pub status: SyncStatus,
    #[serde(default)]
    pub retry_count: u32,
    #[serde(default)]
    pub last_error: Option<String>,
    pub created_at: u64,
    pub updated_at: u64,
    #[serde(default)]
    pub last_attempt_at: Option<u64>,
    #[serde(default)]
    pub synced_at: Option<u64>,
}

impl SyncRecord {
    /// Create a fresh `Pending` record for a newly observed file.
    pub fn new(candidate: &CandidateFile, now: u64) -> Self {
        Self {
            id: new_id(),
            local_path: candidate.local_identifier.clone(),
            mtime: candidate.mtime,
            size: candidate.size,
            mime_type: candidate.mime_type.clone(),
            content_hash: None,
            remote_name: None,
            remote_version: None,
            cek_id: new_id(),
            conflict_suffix: None,
            status: SyncStatus::Pending,
            retry_count: 0,
            last_error: None,
            created_at: now,
            updated_at: now,
            last_attempt_at: None,
            synced_at: None,
        }
    }

    /// Whether a candidate's stat differs from what was last recorded.
    pub fn is_changed(&self, candidate: &CandidateFile) -> bool {
        self.mtime != candidate.mtime || self.size != candidate.size
    }

    /// Display name for logs and metadata (final path component).
    pub fn file_name(&self) -> &str {
        self.local_path
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(&self.local_path)
    }
}

/// A wrapped CEK as persisted by the record store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedCekRecord {
    pub cek_id: String,
    /// `IV(12) ‖ AES-256-GCM(CEK) ‖ tag(16)`, base64
    pub wrapped: String,
    /// Device that generated the key
    pub device_id: String,
    pub created_at: u64,
}

/// A file reported by the change source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateFile {
    pub local_identifier: String,
    pub mtime: u64,
    pub size: u64,
    #[serde(default)]
    pub mime_type: Option<String>,
}

/// Optional capture location carried in encrypted metadata.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoLocation {
    pub lat: f64,
    pub lon: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alt: Option<f64>,
}

/// Plaintext metadata, sealed under the file's CEK before upload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileMetadata {
    pub version: u32,
    pub original_name: String,
    /// Capture/modification time (Unix seconds)
    pub timestamp: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<GeoLocation>,
    pub mime_type: String,
    pub size: u64,
    /// SHA-256 of the plaintext (hex)
    pub content_hash: String,
    pub device_id: String,
    pub cek_id: String,
    pub created_at: u64,
}

/// Current metadata schema version.
pub const METADATA_VERSION: u32 = 1;

/// Steps of the per-file upload pipeline, in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum UploadStep {
    Hashing,
    Encrypting,
    GeneratingPath,
    UploadingFile,
    UploadingMetadata,
    Done,
}

/// Phases of a single-record restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DownloadPhase {
    DownloadingFile,
    DownloadingMetadata,
    GettingCek,
    DecryptingMetadata,
    DecryptingFile,
    SavingFile,
}

impl std::fmt::Display for DownloadPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            DownloadPhase::DownloadingFile => "downloading file",
            DownloadPhase::DownloadingMetadata => "downloading metadata",
            DownloadPhase::DecryptingMetadata => "decrypting metadata",
            DownloadPhase::GettingCek => "getting CEK",
            DownloadPhase::DecryptingFile => "decrypting file",
            DownloadPhase::SavingFile => "saving file",
        };
        f.write_str(s)
    }
}

/// Generate a new random identifier (UUID v4).
pub fn new_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Current Unix time in seconds.
pub fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
