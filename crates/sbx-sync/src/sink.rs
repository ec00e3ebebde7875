//! Restore sink: where decrypted files are handed off.

use async_trait::async_trait;
use sbx_core::types::FileMetadata;
use sbx_core::{SbxError, SbxResult};
use std::path::{Path, PathBuf};
use tracing::info;

#[async_trait]
pub trait RestoreSink: Send + Sync {
    /// Store verified plaintext. Returns where it was written.
    async fn save(&self, plaintext: &[u8], metadata: &FileMetadata) -> SbxResult<PathBuf>;
}

/// Writes restored files into a directory under their original names.
#[derive(Debug, Clone)]
pub struct DirectorySink {
    dest: PathBuf,
}

impl DirectorySink {
    pub fn new(dest: impl Into<PathBuf>) -> Self {
        Self { dest: dest.into() }
    }

    pub fn dest(&self) -> &Path {
        &self.dest
    }
}

/// Keep only the final path component; never write outside the destination.
fn safe_file_name(original: &str) -> String {
    let name = original
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or_default()
        .trim();
    if name.is_empty() || name == "." || name == ".." {
        "restored".to_string()
    } else {
        name.to_string()
    }
}

/// `photo.jpg` → `photo (1).jpg`, `photo (2).jpg`, ...
fn numbered(name: &str, n: u32) -> String {
    match name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({n}).{ext}"),
        _ => format!("{name} ({n})"),
    }
}

fn write_unique(dest: &Path, name: &str, plaintext: &[u8]) -> SbxResult<PathBuf> {
    std::fs::create_dir_all(dest)?;

    let mut target = dest.join(name);
    let mut n = 0;
    while target.exists() {
        if std::fs::read(&target)? == plaintext {
            return Ok(target);
        }
        n += 1;
        target = dest.join(numbered(name, n));
    }

    let tmp = dest.join(format!(".{name}.partial"));
    std::fs::write(&tmp, plaintext)?;
    std::fs::rename(&tmp, &target)?;
    Ok(target)
}

#[async_trait]
impl RestoreSink for DirectorySink {
    async fn save(&self, plaintext: &[u8], metadata: &FileMetadata) -> SbxResult<PathBuf> {
        let name = safe_file_name(&metadata.original_name);
        let dest = self.dest.clone();
        let data = plaintext.to_vec();
        let path = tokio::task::spawn_blocking(move || write_unique(&dest, &name, &data))
            .await
            .map_err(|e| SbxError::Other(e.into()))??;
        info!(path = %path.display(), bytes = plaintext.len(), "restored file");
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sbx_core::types::METADATA_VERSION;
    use tempfile::TempDir;

    fn meta(name: &str) -> FileMetadata {
        FileMetadata {
            version: METADATA_VERSION,
            original_name: name.into(),
            timestamp: 0,
            location: None,
            mime_type: "image/jpeg".into(),
            size: 0,
            content_hash: String::new(),
            device_id: "d".into(),
            cek_id: "c".into(),
            created_at: 0,
        }
    }

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("IMG_1.jpg"), "IMG_1.jpg");
        assert_eq!(safe_file_name("/etc/../../passwd"), "passwd");
        assert_eq!(safe_file_name("..\\..\\x.png"), "x.png");
        assert_eq!(safe_file_name(".."), "restored");
        assert_eq!(safe_file_name(""), "restored");
    }

    #[test]
    fn test_numbered() {
        assert_eq!(numbered("photo.jpg", 1), "photo (1).jpg");
        assert_eq!(numbered("README", 2), "README (2)");
    }

    #[tokio::test]
    async fn test_save_and_deduplicate_names() {
        let tmp = TempDir::new().unwrap();
        let sink = DirectorySink::new(tmp.path().join("out"));

        let a = sink.save(b"first", &meta("p.jpg")).await.unwrap();
        let same = sink.save(b"first", &meta("p.jpg")).await.unwrap();
        let b = sink.save(b"second", &meta("p.jpg")).await.unwrap();

        assert_eq!(a, same);
        assert_eq!(b.file_name().unwrap(), "p (1).jpg");
        assert_eq!(std::fs::read(&a).unwrap(), b"first");
        assert_eq!(std::fs::read(&b).unwrap(), b"second");
    }
}
