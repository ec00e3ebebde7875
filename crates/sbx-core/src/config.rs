use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration (loaded from shoebox.toml)
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SbxConfig {
    pub storage: StorageConfig,
    pub sync: SyncConfig,
    pub crypto: CryptoConfig,
    pub source: SourceConfig,
    pub log: LogConfig,
}

impl SbxConfig {
    /// Parse a TOML document, filling every missing key with its default.
    pub fn from_toml(content: &str) -> crate::SbxResult<Self> {
        toml::from_str(content).map_err(|e| crate::SbxError::Config(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Backend kind: "s3", "webdav", or "memory"
    pub backend: String,
    /// Service endpoint (S3 endpoint or WebDAV base URL)
    pub endpoint: String,
    /// S3 region (default: us-east-1)
    pub region: String,
    /// S3 bucket name
    pub bucket: String,
    /// Remote directory all objects are written under
    pub prefix: String,
    /// Refuse plaintext HTTP endpoints
    pub enforce_tls: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// JSON record store path
    pub state_db: PathBuf,
    /// Directory for temporary ciphertext artifacts
    pub temp_dir: PathBuf,
    /// Records processed per batch
    pub batch_size: usize,
    /// Upper bound on concurrent pipelines per batch
    pub max_concurrency: usize,
    /// Memory budget used by the adaptive concurrency estimate
    pub memory_budget_mb: u64,
    /// Files larger than this are uploaded in chunks
    pub chunk_threshold_mb: u64,
    /// Chunk size for chunked uploads
    pub chunk_size_mb: u64,
    /// Retries per file after the first attempt before it is marked failed
    pub max_retries: u32,
    /// First backoff delay; doubles after every failed attempt
    pub backoff_base_ms: u64,
    /// How often a paused run re-checks its control state
    pub pause_poll_ms: u64,
    /// Grace period for in-flight pipelines after cancellation
    pub cancel_grace_secs: u64,
    /// Failed records older than this are dropped by `cleanup`
    pub failed_retention_days: u64,
    /// Path to the device identity JSON file
    pub device_identity: Option<PathBuf>,
    /// Device name (defaults to hostname)
    pub device_name: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CryptoConfig {
    /// Wrapped master key envelope (JSON)
    pub key_file: PathBuf,
    /// PBKDF2-HMAC-SHA256 iterations for the password KEK
    pub pbkdf2_iterations: u32,
    /// Lock the session after this many idle seconds (0 = never)
    pub idle_lock_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Directories scanned for photos and videos
    pub roots: Vec<PathBuf>,
    /// File extensions considered media (lowercase, no dot)
    pub extensions: Vec<String>,
    /// Glob patterns matched against file names to exclude
    pub exclude_patterns: Vec<String>,
    /// Whether to descend into hidden directories
    pub include_hidden: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Log level (default: info)
    pub level: String,
    /// Log format: "json" or "text"
    pub format: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: "s3".into(),
            endpoint: "http://localhost:8333".into(),
            region: "us-east-1".into(),
            bucket: "shoebox".into(),
            prefix: "backup".into(),
            enforce_tls: false,
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            state_db: PathBuf::from("~/.local/share/shoebox/records.json"),
            temp_dir: PathBuf::from("~/.cache/shoebox/tmp"),
            batch_size: 20,
            max_concurrency: 3,
            memory_budget_mb: 512,
            chunk_threshold_mb: 10,
            chunk_size_mb: 5,
            max_retries: 5,
            backoff_base_ms: 1000,
            pause_poll_ms: 500,
            cancel_grace_secs: 10,
            failed_retention_days: 30,
            device_identity: None,
            device_name: None,
        }
    }
}

impl Default for CryptoConfig {
    fn default() -> Self {
        Self {
            key_file: PathBuf::from("~/.config/shoebox/master.key.json"),
            pbkdf2_iterations: 100_000,
            idle_lock_secs: 300,
        }
    }
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            roots: Vec::new(),
            extensions: [
                "jpg", "jpeg", "png", "heic", "heif", "gif", "webp", "dng", "mp4", "mov", "m4v",
                "3gp", "mkv", "webm",
            ]
            .iter()
            .map(|s| s.to_string())
            .collect(),
            exclude_patterns: Vec::new(),
            include_hidden: false,
        }
    }
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: "info".into(),
            format: "text".into(),
        }
    }
}
