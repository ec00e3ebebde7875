//! Content-derived remote names
//!
//! Remote object names are `hex(HMAC-SHA256(filename_salt, content))` where
//! `filename_salt = HMAC-SHA256(master, "filename_salt")`. The same content
//! always maps to the same name under one account; names reveal nothing
//! about the local filename, device, or timestamp and cannot be inverted
//! without the master key.

use hmac::{Hmac, Mac};
use sbx_core::{SbxError, SbxResult};
use sha2::{Digest, Sha256};
use zeroize::Zeroize;

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

type HmacSha256 = Hmac<Sha256>;

const SALT_LABEL: &[u8] = b"filename_salt";

/// Suffix of the encrypted content object
pub const DATA_SUFFIX: &str = ".enc";

/// Suffix of the encrypted metadata object
pub const METADATA_SUFFIX: &str = ".meta";

fn hmac(key: &[u8]) -> SbxResult<HmacSha256> {
    <HmacSha256 as Mac>::new_from_slice(key)
        .map_err(|e| SbxError::CryptoFailure(format!("HMAC init: {e}")))
}

/// Per-account HMAC key for remote names. Zeroized on drop.
pub struct FilenameSalt {
    bytes: [u8; KEY_SIZE],
}

impl FilenameSalt {
    pub fn derive(master: &MasterKey) -> SbxResult<Self> {
        let mut mac = hmac(master.as_bytes())?;
        mac.update(SALT_LABEL);
        let mut bytes = [0u8; KEY_SIZE];
        bytes.copy_from_slice(&mac.finalize().into_bytes());
        Ok(Self { bytes })
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for FilenameSalt {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for FilenameSalt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FilenameSalt")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Remote name stem for in-memory content.
pub fn remote_name(content: &[u8], master: &MasterKey) -> SbxResult<String> {
    let salt = FilenameSalt::derive(master)?;
    let mut hasher = RemoteNameHasher::new(&salt)?;
    hasher.update(content);
    Ok(hasher.finish().remote_name)
}

/// Name, hash and length of one file's content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceDigest {
    /// Lowercase hex HMAC, without suffix
    pub remote_name: String,
    /// SHA-256 of the content, hex
    pub content_hash: String,
    pub size: u64,
}

/// Incremental remote-name computation, paired with a plain SHA-256.
pub struct RemoteNameHasher {
    mac: HmacSha256,
    sha: Sha256,
    len: u64,
}

impl RemoteNameHasher {
    pub fn new(salt: &FilenameSalt) -> SbxResult<Self> {
        Ok(Self {
            mac: hmac(salt.as_bytes())?,
            sha: Sha256::new(),
            len: 0,
        })
    }

    pub fn update(&mut self, data: &[u8]) {
        self.mac.update(data);
        self.sha.update(data);
        self.len += data.len() as u64;
    }

    pub fn finish(self) -> SourceDigest {
        SourceDigest {
            remote_name: hex::encode(self.mac.finalize().into_bytes()),
            content_hash: hex::encode(self.sha.finalize()),
            size: self.len,
        }
    }

    /// Feed the HMAC only. For callers that hash the content themselves.
    pub(crate) fn update_name(&mut self, data: &[u8]) {
        self.mac.update(data);
        self.len += data.len() as u64;
    }

    pub(crate) fn finish_with_hash(self, content_hash: String) -> SourceDigest {
        SourceDigest {
            remote_name: hex::encode(self.mac.finalize().into_bytes()),
            content_hash,
            size: self.len,
        }
    }
}

/// Joins the configured remote prefix with name stems.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemotePaths {
    prefix: String,
}

impl RemotePaths {
    pub fn new(prefix: &str) -> Self {
        Self {
            prefix: prefix.trim_matches('/').to_string(),
        }
    }

    /// Stem with an optional conflict suffix: `<stem>` or `<stem>-<suffix>`.
    pub fn stem(name: &str, conflict_suffix: Option<&str>) -> String {
        match conflict_suffix {
            Some(s) if !s.is_empty() => format!("{name}-{s}"),
            _ => name.to_string(),
        }
    }

    pub fn data(&self, stem: &str) -> String {
        self.join(&format!("{stem}{DATA_SUFFIX}"))
    }

    pub fn metadata(&self, stem: &str) -> String {
        self.join(&format!("{stem}{METADATA_SUFFIX}"))
    }

    /// Directory listing path for the prefix
    pub fn root(&self) -> String {
        if self.prefix.is_empty() {
            "/".to_string()
        } else {
            format!("{}/", self.prefix)
        }
    }

    fn join(&self, object: &str) -> String {
        if self.prefix.is_empty() {
            object.to_string()
        } else {
            format!("{}/{object}", self.prefix)
        }
    }
}
