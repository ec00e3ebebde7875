//! Per-file content encryption keys and their wrapping under the master key

use rand::RngCore;
use sbx_core::{SbxError, SbxResult};
use zeroize::Zeroize;

use crate::aead::{open, seal};
use crate::kdf::MasterKey;
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// A per-file 256-bit content encryption key. Zeroized on drop.
#[derive(Clone)]
pub struct Cek {
    bytes: [u8; KEY_SIZE],
}

impl Cek {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Cek {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl PartialEq for Cek {
    fn eq(&self, other: &Self) -> bool {
        self.bytes
            .iter()
            .zip(other.bytes.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}

impl Eq for Cek {}

impl std::fmt::Debug for Cek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cek").field("bytes", &"[REDACTED]").finish()
    }
}

/// Generate a random 256-bit CEK.
pub fn generate_cek() -> Cek {
    let mut bytes = [0u8; KEY_SIZE];
    rand::thread_rng().fill_bytes(&mut bytes);
    Cek::from_bytes(bytes)
}

/// Wrap (encrypt) a CEK under the master key.
///
/// Output: `[12-byte IV][32-byte ciphertext][16-byte tag]`
pub fn wrap_cek(master: &MasterKey, cek: &Cek) -> SbxResult<Vec<u8>> {
    seal(master.as_bytes(), cek.as_bytes())
}

/// Unwrap (decrypt) a CEK produced by [`wrap_cek`].
pub fn unwrap_cek(master: &MasterKey, wrapped: &[u8]) -> SbxResult<Cek> {
    if wrapped.len() != IV_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(SbxError::InvalidInput(format!(
            "wrapped CEK has wrong size: {} bytes (expected {})",
            wrapped.len(),
            IV_SIZE + KEY_SIZE + TAG_SIZE
        )));
    }

    let plaintext = open(master.as_bytes(), wrapped)?;
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    Ok(Cek::from_bytes(bytes))
}
