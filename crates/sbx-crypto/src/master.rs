//! Password-protected master key envelope
//!
//! The envelope is the only persisted form of the master key:
//! ```text
//! { kdf params, salt, IV ‖ AES-256-GCM_kek(master) ‖ tag, IV ‖ AES-256-GCM_master(check) ‖ tag }
//! ```
//! Unwrapping with the wrong password fails GCM authentication; there is no
//! separate password hash. Changing the password re-wraps only the master
//! key, so file keys and ciphertext are untouched.

use rand::RngCore;
use secrecy::SecretString;
use serde::{Deserialize, Serialize};
use sbx_core::{SbxError, SbxResult};
use zeroize::Zeroizing;

use crate::aead::{open, seal};
use crate::kdf::{derive_kek, Kek, MasterKey, SALT_LEN};
use crate::{IV_SIZE, KEY_SIZE, TAG_SIZE};

const ENVELOPE_VERSION: u32 = 1;
const KDF_NAME: &str = "pbkdf2-hmac-sha256";

/// Persisted, password-wrapped master key.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WrappedMasterKey {
    pub version: u32,
    pub kdf: String,
    pub iterations: u32,
    #[serde(with = "b64")]
    pub salt: Vec<u8>,
    /// `IV ‖ AES-256-GCM(master) ‖ tag` under the KEK
    #[serde(with = "b64")]
    pub wrapped_key: Vec<u8>,
    /// `IV ‖ AES-256-GCM(random check value) ‖ tag` under the master key
    #[serde(with = "b64")]
    pub verification: Vec<u8>,
}

/// Wrap the master key under a KEK with a fresh random IV.
pub fn wrap_master_key(master: &MasterKey, kek: &Kek) -> SbxResult<Vec<u8>> {
    seal(kek.as_bytes(), master.as_bytes())
}

/// Unwrap the master key. A wrong KEK yields `AuthenticationFailure`.
pub fn unwrap_master_key(wrapped: &[u8], kek: &Kek) -> SbxResult<MasterKey> {
    if wrapped.len() != IV_SIZE + KEY_SIZE + TAG_SIZE {
        return Err(SbxError::InvalidInput(format!(
            "wrapped master key has wrong size: {} bytes",
            wrapped.len()
        )));
    }
    let plaintext = open(kek.as_bytes(), wrapped)?;
    let mut bytes = [0u8; KEY_SIZE];
    bytes.copy_from_slice(&plaintext);
    Ok(MasterKey::from_bytes(bytes))
}

impl WrappedMasterKey {
    /// Build a new envelope for `master` protected by `password`.
    pub fn create(master: &MasterKey, password: &SecretString, iterations: u32) -> SbxResult<Self> {
        let mut salt = vec![0u8; SALT_LEN];
        rand::thread_rng().fill_bytes(&mut salt);

        let kek = derive_kek(password, &salt, iterations)?;
        let wrapped_key = wrap_master_key(master, &kek)?;

        let mut check = Zeroizing::new([0u8; KEY_SIZE]);
        rand::thread_rng().fill_bytes(check.as_mut());
        let verification = seal(master.as_bytes(), check.as_ref())?;

        Ok(Self {
            version: ENVELOPE_VERSION,
            kdf: KDF_NAME.to_string(),
            iterations,
            salt,
            wrapped_key,
            verification,
        })
    }

    /// Recover the master key with `password`.
    pub fn open(&self, password: &SecretString) -> SbxResult<MasterKey> {
        if self.kdf != KDF_NAME {
            return Err(SbxError::InvalidInput(format!(
                "unsupported key derivation: {}",
                self.kdf
            )));
        }
        let kek = derive_kek(password, &self.salt, self.iterations)?;
        let master = unwrap_master_key(&self.wrapped_key, &kek)?;
        if !self.matches(&master) {
            return Err(SbxError::AuthenticationFailure(
                "master key failed verification".into(),
            ));
        }
        Ok(master)
    }

    /// Whether `master` is the key this envelope was created for.
    ///
    /// Used to confirm an imported mnemonic belongs to this account.
    pub fn matches(&self, master: &MasterKey) -> bool {
        open(master.as_bytes(), &self.verification).is_ok()
    }

    pub fn to_json(&self) -> SbxResult<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json(data: &str) -> SbxResult<Self> {
        Ok(serde_json::from_str(data)?)
    }
}

/// Re-wrap the master key under a new password with a fresh salt.
///
/// The verification blob is carried over unchanged; it depends only on the
/// master key.
pub fn change_password(
    envelope: &WrappedMasterKey,
    old: &SecretString,
    new: &SecretString,
) -> SbxResult<WrappedMasterKey> {
    let master = envelope.open(old)?;

    let mut salt = vec![0u8; SALT_LEN];
    rand::thread_rng().fill_bytes(&mut salt);
    let kek = derive_kek(new, &salt, envelope.iterations)?;
    let wrapped_key = wrap_master_key(&master, &kek)?;

    Ok(WrappedMasterKey {
        version: ENVELOPE_VERSION,
        kdf: KDF_NAME.to_string(),
        iterations: envelope.iterations,
        salt,
        wrapped_key,
        verification: envelope.verification.clone(),
    })
}

mod b64 {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_str(&STANDARD.encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(d)?;
        STANDARD.decode(s).map_err(serde::de::Error::custom)
    }
}
