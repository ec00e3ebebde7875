//! BIP-39 recovery phrase
//!
//! The master key is the first 256 bits of the BIP-39 seed of a 12-word
//! mnemonic (empty passphrase). The phrase is shown to the user once and is
//! the only way to recover the account if the password is lost.

use bip39::Mnemonic;
use rand::RngCore;
use sbx_core::{SbxError, SbxResult};
use zeroize::{Zeroize, Zeroizing};

use crate::kdf::MasterKey;
use crate::KEY_SIZE;

/// 12 words = 128 bits of entropy
const ENTROPY_LEN: usize = 16;

/// Generate a new 12-word mnemonic and the master key it encodes.
pub fn generate_mnemonic() -> SbxResult<(Zeroizing<String>, MasterKey)> {
    let mut entropy = Zeroizing::new([0u8; ENTROPY_LEN]);
    rand::thread_rng().fill_bytes(entropy.as_mut());

    let mnemonic = Mnemonic::from_entropy(entropy.as_ref())
        .map_err(|e| SbxError::CryptoFailure(format!("mnemonic generation failed: {e}")))?;

    let words = Zeroizing::new(mnemonic.to_string());
    let master = master_key_from_mnemonic(&words)?;
    Ok((words, master))
}

/// Derive the master key from a mnemonic. Deterministic.
pub fn master_key_from_mnemonic(words: &str) -> SbxResult<MasterKey> {
    let normalized = Zeroizing::new(
        words
            .split_whitespace()
            .map(str::to_lowercase)
            .collect::<Vec<_>>()
            .join(" "),
    );
    let mnemonic = Mnemonic::parse_normalized(&normalized)
        .map_err(|e| SbxError::InvalidInput(format!("invalid recovery phrase: {e}")))?;

    let mut seed = mnemonic.to_seed_normalized("");
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&seed[..KEY_SIZE]);
    seed.zeroize();
    Ok(MasterKey::from_bytes(bytes))
}

#[cfg(test)]
mod tests {
    use super::*;

    const ABANDON: &str = "abandon abandon abandon abandon abandon abandon \
                           abandon abandon abandon abandon abandon about";

    #[test]
    fn test_known_mnemonic_vector() {
        let key = master_key_from_mnemonic(ABANDON).unwrap();
        assert_eq!(
            hex::encode(key.as_bytes()),
            "5eb00bbddcf069084889a8ab9155568165f5c453ccb85e70811aaed6f6da5fc1"
        );
    }

    #[test]
    fn test_generate_mnemonic() {
        let (words, key) = generate_mnemonic().unwrap();
        assert_eq!(words.split_whitespace().count(), 12);
        assert_ne!(key.as_bytes(), &[0u8; KEY_SIZE]);
    }

    #[test]
    fn test_mnemonic_recovery_roundtrip() {
        let (words, original) = generate_mnemonic().unwrap();
        let recovered = master_key_from_mnemonic(&words).unwrap();
        assert_eq!(original.as_bytes(), recovered.as_bytes());
    }

    #[test]
    fn test_extra_whitespace_is_tolerated() {
        let spaced = format!("  {}  ", ABANDON.replace(' ', "   "));
        let a = master_key_from_mnemonic(&spaced).unwrap();
        let b = master_key_from_mnemonic(ABANDON).unwrap();
        assert_eq!(a.as_bytes(), b.as_bytes());
    }

    #[test]
    fn test_invalid_mnemonic() {
        assert!(matches!(
            master_key_from_mnemonic("not a valid mnemonic at all"),
            Err(SbxError::InvalidInput(_))
        ));
        // Valid words, bad checksum
        let bad = ABANDON.replace("about", "abandon");
        assert!(matches!(
            master_key_from_mnemonic(&bad),
            Err(SbxError::InvalidInput(_))
        ));
    }
}
