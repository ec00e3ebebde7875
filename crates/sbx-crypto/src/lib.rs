//! sbx-crypto: client-side encryption for Shoebox
//!
//! Key hierarchy:
//! ```text
//! Password ──PBKDF2-HMAC-SHA256──▶ KEK (ephemeral)
//!                                   └── wraps Master Key (AES-256-GCM)
//! Mnemonic ──BIP-39 seed──────────▶ Master Key (256-bit, memory only)
//!   ├── Content Encryption Key (per file, random, wrapped by master key)
//!   │   ├── file blob:  VERSION ‖ IV ‖ AES-256-GCM(content) ‖ tag
//!   │   └── metadata:   IV ‖ AES-256-GCM(JSON) ‖ tag
//!   └── Filename salt (HMAC-SHA256(master, "filename_salt"))
//!       └── remote name = hex(HMAC-SHA256(salt, content))
//! ```
//!
//! The store only ever sees ciphertext and HMAC-derived names.

pub mod aead;
pub mod kdf;
pub mod keys;
pub mod master;
pub mod metadata;
pub mod names;
pub mod recovery;
pub mod session;
pub mod stream;

pub use aead::{open, seal};
pub use kdf::{derive_kek, Kek, MasterKey};
pub use keys::{generate_cek, unwrap_cek, wrap_cek, Cek};
pub use master::{change_password, unwrap_master_key, wrap_master_key, WrappedMasterKey};
pub use metadata::{open_metadata, seal_metadata};
pub use names::{remote_name, FilenameSalt, SourceDigest};
pub use recovery::{generate_mnemonic, master_key_from_mnemonic};
pub use session::Session;
pub use stream::{decrypt_stream, encrypt_stream, encrypt_stream_named, EncryptOutcome};

/// Size of every symmetric key in the hierarchy (256-bit)
pub const KEY_SIZE: usize = 32;

/// Size of an AES-GCM IV (96-bit)
pub const IV_SIZE: usize = 12;

/// Size of a GCM authentication tag
pub const TAG_SIZE: usize = 16;

/// Current encrypted file format version
pub const FORMAT_VERSION: u8 = 1;

/// Plaintext bytes fed through the AEAD per step (fixed for format version 1)
pub const STREAM_CHUNK_SIZE: usize = 64 * 1024;

/// Progress callback: (bytes_processed, bytes_total)
pub type ProgressFn<'a> = &'a (dyn Fn(u64, u64) + Send + Sync);
