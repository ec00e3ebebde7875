//! One-shot AES-256-GCM sealing for small blobs (wrapped keys, metadata).
//!
//! Sealed format: `[12-byte IV][ciphertext][16-byte tag]`

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes256Gcm, Nonce,
};
use rand::RngCore;
use sbx_core::{SbxError, SbxResult};
use zeroize::Zeroizing;

use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

/// Generate a fresh random IV.
pub fn random_iv() -> [u8; IV_SIZE] {
    let mut iv = [0u8; IV_SIZE];
    rand::thread_rng().fill_bytes(&mut iv);
    iv
}

/// Encrypt `plaintext` under `key` with a fresh random IV.
pub fn seal(key: &[u8; KEY_SIZE], plaintext: &[u8]) -> SbxResult<Vec<u8>> {
    seal_with_iv(key, &random_iv(), plaintext)
}

/// Encrypt with a caller-chosen IV. Never reuse an IV under the same key.
pub fn seal_with_iv(
    key: &[u8; KEY_SIZE],
    iv: &[u8; IV_SIZE],
    plaintext: &[u8],
) -> SbxResult<Vec<u8>> {
    let cipher = Aes256Gcm::new(key.into());
    let ciphertext = cipher
        .encrypt(Nonce::from_slice(iv), plaintext)
        .map_err(|e| SbxError::CryptoFailure(format!("AES-GCM encryption failed: {e}")))?;

    let mut out = Vec::with_capacity(IV_SIZE + ciphertext.len());
    out.extend_from_slice(iv);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a sealed blob. The plaintext is zeroized when dropped.
pub fn open(key: &[u8; KEY_SIZE], sealed: &[u8]) -> SbxResult<Zeroizing<Vec<u8>>> {
    if sealed.len() < IV_SIZE + TAG_SIZE {
        return Err(SbxError::InvalidInput(format!(
            "sealed blob too short: {} bytes (minimum {})",
            sealed.len(),
            IV_SIZE + TAG_SIZE
        )));
    }

    let (iv, ciphertext) = sealed.split_at(IV_SIZE);
    let cipher = Aes256Gcm::new(key.into());
    cipher
        .decrypt(Nonce::from_slice(iv), ciphertext)
        .map(Zeroizing::new)
        .map_err(|_| SbxError::AuthenticationFailure("wrong key or corrupted data".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_seal_open_roundtrip() {
        let key = [9u8; KEY_SIZE];
        let sealed = seal(&key, b"small secret").unwrap();
        assert_eq!(sealed.len(), IV_SIZE + 12 + TAG_SIZE);
        assert_eq!(open(&key, &sealed).unwrap().as_slice(), b"small secret");
    }

    #[test]
    fn test_seal_uses_fresh_iv() {
        let key = [9u8; KEY_SIZE];
        let a = seal(&key, b"same").unwrap();
        let b = seal(&key, b"same").unwrap();
        assert_ne!(a[..IV_SIZE], b[..IV_SIZE]);
        assert_ne!(a, b);
    }

    #[test]
    fn test_open_wrong_key() {
        let sealed = seal(&[1u8; KEY_SIZE], b"data").unwrap();
        let err = open(&[2u8; KEY_SIZE], &sealed).unwrap_err();
        assert!(matches!(err, SbxError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_open_too_short() {
        let err = open(&[1u8; KEY_SIZE], &[0u8; 20]).unwrap_err();
        assert!(matches!(err, SbxError::InvalidInput(_)));
    }
}
