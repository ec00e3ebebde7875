//! Key derivation: password → KEK via PBKDF2-HMAC-SHA256

use pbkdf2::pbkdf2_hmac;
use secrecy::{ExposeSecret, SecretString};
use sbx_core::{SbxError, SbxResult};
use sha2::Sha256;
use zeroize::Zeroize;

use crate::KEY_SIZE;

/// Minimum accepted KDF salt length
pub const MIN_SALT_LEN: usize = 16;

/// Salt length generated for new envelopes
pub const SALT_LEN: usize = 32;

/// Default PBKDF2 iteration count
pub const DEFAULT_ITERATIONS: u32 = 100_000;

/// The 256-bit account master key.
///
/// Zeroized on drop to prevent secrets lingering in memory.
#[derive(Clone)]
pub struct MasterKey {
    bytes: [u8; KEY_SIZE],
}

impl MasterKey {
    pub fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for MasterKey {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for MasterKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MasterKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Password-derived key-encryption key. Only ever wraps the master key.
pub struct Kek {
    bytes: [u8; KEY_SIZE],
}

impl Kek {
    pub fn as_bytes(&self) -> &[u8; KEY_SIZE] {
        &self.bytes
    }
}

impl Drop for Kek {
    fn drop(&mut self) {
        self.bytes.zeroize();
    }
}

impl std::fmt::Debug for Kek {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kek").field("bytes", &"[REDACTED]").finish()
    }
}

/// Derive a KEK from a password with PBKDF2-HMAC-SHA256.
pub fn derive_kek(password: &SecretString, salt: &[u8], iterations: u32) -> SbxResult<Kek> {
    let password = password.expose_secret();
    if password.is_empty() {
        return Err(SbxError::InvalidInput("password must not be empty".into()));
    }
    if salt.len() < MIN_SALT_LEN {
        return Err(SbxError::InvalidInput(format!(
            "salt too short: {} bytes (minimum {MIN_SALT_LEN})",
            salt.len()
        )));
    }
    if iterations == 0 {
        return Err(SbxError::InvalidInput(
            "iteration count must be positive".into(),
        ));
    }

    let mut bytes = [0u8; KEY_SIZE];
    pbkdf2_hmac::<Sha256>(password.as_bytes(), salt, iterations, &mut bytes);
    Ok(Kek { bytes })
}
