//! Change source: where candidate files come from.
//!
//! `DirectorySource` walks local photo directories and reports every media
//! file with its stat; the orchestrator diffs that against the records.

use async_trait::async_trait;
use sbx_core::config::SourceConfig;
use sbx_core::types::CandidateFile;
use sbx_core::{SbxError, SbxResult};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::warn;

#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Every file currently eligible for backup.
    async fn candidates(&self) -> SbxResult<Vec<CandidateFile>>;

    /// Resolve a candidate's identifier to a readable local path.
    /// Fails with `SourceMissing` if the file is gone.
    fn resolve(&self, local_identifier: &str) -> SbxResult<PathBuf>;
}

/// MIME type for a media file extension.
pub fn mime_for_extension(ext: &str) -> Option<&'static str> {
    let mime = match ext.to_ascii_lowercase().as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "heif" => "image/heif",
        "tif" | "tiff" => "image/tiff",
        "bmp" => "image/bmp",
        "dng" => "image/x-adobe-dng",
        "cr2" => "image/x-canon-cr2",
        "nef" => "image/x-nikon-nef",
        "arw" => "image/x-sony-arw",
        "mp4" => "video/mp4",
        "m4v" => "video/x-m4v",
        "mov" => "video/quicktime",
        "avi" => "video/x-msvideo",
        "mkv" => "video/x-matroska",
        "webm" => "video/webm",
        "3gp" => "video/3gpp",
        _ => return None,
    };
    Some(mime)
}

/// Walks configured directories for media files.
#[derive(Debug, Clone)]
pub struct DirectorySource {
    roots: Vec<PathBuf>,
    extensions: Vec<String>,
    excludes: Vec<glob::Pattern>,
    include_hidden: bool,
}

impl DirectorySource {
    pub fn new(config: &SourceConfig) -> Self {
        let excludes = config
            .exclude_patterns
            .iter()
            .filter_map(|p| match glob::Pattern::new(p) {
                Ok(pattern) => Some(pattern),
                Err(e) => {
                    warn!(pattern = %p, "ignoring invalid exclude pattern: {e}");
                    None
                }
            })
            .collect();
        Self {
            roots: config.roots.clone(),
            extensions: config
                .extensions
                .iter()
                .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
                .collect(),
            excludes,
            include_hidden: config.include_hidden,
        }
    }

    fn wants(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map(|e| self.extensions.iter().any(|x| x.eq_ignore_ascii_case(e)))
            .unwrap_or(false)
    }

    fn walk(&self, dir: &Path, out: &mut Vec<CandidateFile>) -> SbxResult<()> {
        for entry in std::fs::read_dir(dir)? {
            let entry = entry?;
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if self.excludes.iter().any(|p| p.matches(name)) {
                continue;
            }
            if name.starts_with('.') && !self.include_hidden {
                continue;
            }

            let meta = match entry.metadata() {
                Ok(m) => m,
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable entry: {e}");
                    continue;
                }
            };
            if meta.is_dir() {
                self.walk(&path, out)?;
            } else if meta.is_file() && self.wants(&path) {
                let mtime = meta
                    .modified()
                    .ok()
                    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                    .map(|d| d.as_secs())
                    .unwrap_or(0);
                let mime = path
                    .extension()
                    .and_then(|e| e.to_str())
                    .and_then(mime_for_extension)
                    .map(str::to_string);
                out.push(CandidateFile {
                    local_identifier: path.to_string_lossy().into_owned(),
                    mtime,
                    size: meta.len(),
                    mime_type: mime,
                });
            }
        }
        Ok(())
    }

    fn scan(&self) -> SbxResult<Vec<CandidateFile>> {
        let mut out = Vec::new();
        for root in &self.roots {
            if !root.is_dir() {
                warn!(root = %root.display(), "source root is not a directory, skipping");
                continue;
            }
            self.walk(root, &mut out)?;
        }
        out.sort_by(|a, b| a.local_identifier.cmp(&b.local_identifier));
        Ok(out)
    }
}

#[async_trait]
impl ChangeSource for DirectorySource {
    async fn candidates(&self) -> SbxResult<Vec<CandidateFile>> {
        let source = self.clone();
        tokio::task::spawn_blocking(move || source.scan())
            .await
            .map_err(|e| SbxError::Other(e.into()))?
    }

    fn resolve(&self, local_identifier: &str) -> SbxResult<PathBuf> {
        let path = PathBuf::from(local_identifier);
        if path.is_file() {
            Ok(path)
        } else {
            Err(SbxError::SourceMissing(local_identifier.to_string()))
        }
    }
}
