//! Encrypted per-file metadata
//!
//! Stored next to the content blob as `<name>.meta`:
//! `[12-byte IV][AES-256-GCM(JSON)][16-byte tag]` under the file's CEK.

use sbx_core::types::{FileMetadata, METADATA_VERSION};
use sbx_core::{SbxError, SbxResult};
use zeroize::Zeroizing;

use crate::aead::{open, seal};
use crate::keys::Cek;

/// Serialize and encrypt metadata under the file's CEK.
pub fn seal_metadata(cek: &Cek, metadata: &FileMetadata) -> SbxResult<Vec<u8>> {
    let json = Zeroizing::new(serde_json::to_vec(metadata)?);
    seal(cek.as_bytes(), &json)
}

/// Decrypt and parse a metadata blob.
pub fn open_metadata(cek: &Cek, sealed: &[u8]) -> SbxResult<FileMetadata> {
    let json = open(cek.as_bytes(), sealed)?;
    let metadata: FileMetadata = serde_json::from_slice(&json)?;
    if metadata.version > METADATA_VERSION {
        return Err(SbxError::InvalidInput(format!(
            "metadata schema version {} is newer than supported ({METADATA_VERSION})",
            metadata.version
        )));
    }
    Ok(metadata)
}
