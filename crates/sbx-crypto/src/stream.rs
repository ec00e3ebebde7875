//! Streaming file codec: AES-256-GCM over arbitrarily large content
//!
//! Blob format (version 1):
//! ```text
//! [1-byte version][12-byte IV][ciphertext][16-byte GCM tag]
//! ```
//!
//! The content is one GCM message; plaintext is fed through it in
//! [`STREAM_CHUNK_SIZE`] steps so memory stays bounded regardless of file
//! size. The output is byte-identical to a one-shot AES-256-GCM seal with
//! the same key and IV.
//!
//! Decryption writes plaintext before the tag has been checked. Callers must
//! write to a scratch location and discard it if this returns an error.

use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use aes::Aes256;
use ghash::universal_hash::UniversalHash;
use ghash::{Block, GHash};
use sbx_core::{SbxError, SbxResult};
use sha2::{Digest, Sha256};
use std::io::{ErrorKind, Read, Write};
use zeroize::{Zeroize, Zeroizing};

use crate::aead::random_iv;
use crate::keys::Cek;
use crate::names::{FilenameSalt, RemoteNameHasher, SourceDigest};
use crate::{ProgressFn, FORMAT_VERSION, IV_SIZE, KEY_SIZE, STREAM_CHUNK_SIZE, TAG_SIZE};

type Aes256Ctr = ctr::Ctr32BE<Aes256>;

/// Result of encrypting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptOutcome {
    /// SHA-256 of the plaintext, hex
    pub content_hash: String,
    pub plaintext_len: u64,
    /// Total blob length including version, IV and tag
    pub ciphertext_len: u64,
}

/// Header plus trailer overhead added to every blob.
pub const fn blob_overhead() -> u64 {
    (1 + IV_SIZE + TAG_SIZE) as u64
}

/// Incremental GCM state: CTR keystream plus GHASH over the ciphertext.
struct GcmCore {
    ctr: Aes256Ctr,
    ghash: GHash,
    tag_mask: Block,
    pending: [u8; 16],
    pending_len: usize,
    ct_len: u64,
}

impl GcmCore {
    fn new(key: &[u8; KEY_SIZE], iv: &[u8; IV_SIZE]) -> Self {
        let cipher = Aes256::new(key.into());

        let mut h = Block::default();
        cipher.encrypt_block(&mut h);
        let ghash = GHash::new(&h);
        h.as_mut_slice().zeroize();

        let mut j0 = [0u8; 16];
        j0[..IV_SIZE].copy_from_slice(iv);
        j0[15] = 1;
        let mut tag_mask = Block::from(j0);
        cipher.encrypt_block(&mut tag_mask);

        // Payload keystream starts at inc32(J0)
        let mut counter = j0;
        counter[15] = 2;
        let ctr = Aes256Ctr::new(key.into(), &counter.into());

        Self {
            ctr,
            ghash,
            tag_mask,
            pending: [0u8; 16],
            pending_len: 0,
            ct_len: 0,
        }
    }

    fn keystream(&mut self, buf: &mut [u8]) {
        self.ctr.apply_keystream(buf);
    }

    /// Feed ciphertext into GHASH, buffering any partial trailing block.
    fn absorb(&mut self, mut ct: &[u8]) {
        self.ct_len += ct.len() as u64;

        if self.pending_len > 0 {
            let take = (16 - self.pending_len).min(ct.len());
            self.pending[self.pending_len..self.pending_len + take].copy_from_slice(&ct[..take]);
            self.pending_len += take;
            ct = &ct[take..];
            if self.pending_len < 16 {
                return;
            }
            self.ghash.update(&[Block::from(self.pending)]);
            self.pending_len = 0;
        }

        let full = ct.len() / 16 * 16;
        if full > 0 {
            self.ghash.update_padded(&ct[..full]);
        }
        let rest = &ct[full..];
        self.pending[..rest.len()].copy_from_slice(rest);
        self.pending_len = rest.len();
    }

    fn finalize(mut self) -> [u8; TAG_SIZE] {
        if self.pending_len > 0 {
            self.ghash.update_padded(&self.pending[..self.pending_len]);
        }
        let mut lengths = [0u8; 16];
        lengths[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        self.ghash.update(&[Block::from(lengths)]);

        let s = self.ghash.clone().finalize();
        let mut tag = [0u8; TAG_SIZE];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = s[i] ^ self.tag_mask[i];
        }
        tag
    }
}

impl Drop for GcmCore {
    fn drop(&mut self) {
        self.tag_mask.as_mut_slice().zeroize();
        self.pending.zeroize();
    }
}

/// Read until `buf` is full or EOF. Returns the number of bytes read.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

fn report(progress: Option<ProgressFn<'_>>, done: u64, total: u64) {
    if let Some(cb) = progress {
        cb(done, total);
    }
}

/// Encrypt `reader` into `writer` under `cek` with a fresh random IV.
///
/// `total` is only used for progress reporting; pass 0 if unknown.
pub fn encrypt_stream<R: Read, W: Write>(
    cek: &Cek,
    reader: R,
    writer: W,
    total: u64,
    progress: Option<ProgressFn<'_>>,
) -> SbxResult<EncryptOutcome> {
    encrypt_stream_with_iv(cek, &random_iv(), reader, writer, total, progress)
}

/// Encrypt with a caller-chosen IV. An IV must never repeat under one CEK.
pub fn encrypt_stream_with_iv<R: Read, W: Write>(
    cek: &Cek,
    iv: &[u8; IV_SIZE],
    reader: R,
    writer: W,
    total: u64,
    progress: Option<ProgressFn<'_>>,
) -> SbxResult<EncryptOutcome> {
    encrypt_core(cek, iv, reader, writer, total, progress, None)
}

/// Encrypt and derive the remote name in the same read of `reader`.
///
/// The returned digest's `content_hash` equals the outcome's.
pub fn encrypt_stream_named<R: Read, W: Write>(
    cek: &Cek,
    salt: &FilenameSalt,
    reader: R,
    writer: W,
    total: u64,
    progress: Option<ProgressFn<'_>>,
) -> SbxResult<(EncryptOutcome, SourceDigest)> {
    let mut names = RemoteNameHasher::new(salt)?;
    let outcome = encrypt_core(
        cek,
        &random_iv(),
        reader,
        writer,
        total,
        progress,
        Some(&mut names),
    )?;
    let digest = names.finish_with_hash(outcome.content_hash.clone());
    Ok((outcome, digest))
}

fn encrypt_core<R: Read, W: Write>(
    cek: &Cek,
    iv: &[u8; IV_SIZE],
    mut reader: R,
    mut writer: W,
    total: u64,
    progress: Option<ProgressFn<'_>>,
    mut names: Option<&mut RemoteNameHasher>,
) -> SbxResult<EncryptOutcome> {
    let mut gcm = GcmCore::new(cek.as_bytes(), iv);
    let mut hasher = Sha256::new();

    writer.write_all(&[FORMAT_VERSION])?;
    writer.write_all(iv)?;

    let mut buf = Zeroizing::new(vec![0u8; STREAM_CHUNK_SIZE]);
    let mut processed = 0u64;
    loop {
        let n = read_full(&mut reader, &mut buf)?;
        if n == 0 {
            break;
        }
        let chunk = &mut buf[..n];
        hasher.update(&*chunk);
        if let Some(names) = names.as_deref_mut() {
            names.update_name(chunk);
        }
        gcm.keystream(chunk);
        gcm.absorb(chunk);
        writer.write_all(chunk)?;

        processed += n as u64;
        report(progress, processed, total.max(processed));
        if n < STREAM_CHUNK_SIZE {
            break;
        }
    }

    writer.write_all(&gcm.finalize())?;
    writer.flush()?;

    Ok(EncryptOutcome {
        content_hash: hex::encode(hasher.finalize()),
        plaintext_len: processed,
        ciphertext_len: processed + blob_overhead(),
    })
}

/// Decrypt a version-1 blob from `reader` into `writer`.
///
/// Returns the plaintext length. `total` is the blob length for progress
/// reporting; pass 0 if unknown.
pub fn decrypt_stream<R: Read, W: Write>(
    cek: &Cek,
    mut reader: R,
    mut writer: W,
    total: u64,
    progress: Option<ProgressFn<'_>>,
) -> SbxResult<u64> {
    let mut version = [0u8; 1];
    if read_full(&mut reader, &mut version)? == 0 {
        return Err(SbxError::InvalidInput("encrypted blob is empty".into()));
    }
    if version[0] != FORMAT_VERSION {
        return Err(SbxError::UnsupportedFormatVersion(version[0]));
    }

    let mut iv = [0u8; IV_SIZE];
    if read_full(&mut reader, &mut iv)? < IV_SIZE {
        return Err(SbxError::InvalidInput(
            "encrypted blob truncated in header".into(),
        ));
    }

    let mut gcm = GcmCore::new(cek.as_bytes(), &iv);

    // The last TAG_SIZE bytes of the stream are the tag, so always hold them back.
    let mut buf = Zeroizing::new(vec![0u8; STREAM_CHUNK_SIZE + TAG_SIZE]);
    let mut filled = 0usize;
    let mut written = 0u64;
    let mut consumed = (1 + IV_SIZE) as u64;
    loop {
        let n = read_full(&mut reader, &mut buf[filled..])?;
        filled += n;
        if filled < buf.len() {
            break;
        }
        let chunk = &mut buf[..STREAM_CHUNK_SIZE];
        gcm.absorb(chunk);
        gcm.keystream(chunk);
        writer.write_all(chunk)?;
        buf.copy_within(STREAM_CHUNK_SIZE.., 0);
        filled = TAG_SIZE;

        written += STREAM_CHUNK_SIZE as u64;
        consumed += STREAM_CHUNK_SIZE as u64;
        report(progress, consumed, total.max(consumed));
    }

    if filled < TAG_SIZE {
        return Err(SbxError::InvalidInput(
            "encrypted blob truncated: missing authentication tag".into(),
        ));
    }

    let body_len = filled - TAG_SIZE;
    let mut expected = [0u8; TAG_SIZE];
    expected.copy_from_slice(&buf[body_len..filled]);

    let body = &mut buf[..body_len];
    gcm.absorb(body);
    gcm.keystream(body);
    writer.write_all(body)?;
    written += body_len as u64;
    consumed += filled as u64;

    let computed = gcm.finalize();
    let diff = computed
        .iter()
        .zip(expected.iter())
        .fold(0u8, |acc, (a, b)| acc | (a ^ b));
    if diff != 0 {
        return Err(SbxError::AuthenticationFailure(
            "file blob failed authentication".into(),
        ));
    }

    writer.flush()?;
    report(progress, consumed, total.max(consumed));
    Ok(written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aead::seal_with_iv;
    use std::sync::atomic::{AtomicU64, Ordering};

    fn key_0_to_31() -> Cek {
        let mut k = [0u8; KEY_SIZE];
        for (i, b) in k.iter_mut().enumerate() {
            *b = i as u8;
        }
        Cek::from_bytes(k)
    }

    fn iv_a0() -> [u8; IV_SIZE] {
        let mut iv = [0u8; IV_SIZE];
        for (i, b) in iv.iter_mut().enumerate() {
            *b = 0xa0 + i as u8;
        }
        iv
    }

    fn encrypt_vec(cek: &Cek, iv: &[u8; IV_SIZE], data: &[u8]) -> Vec<u8> {
        let mut out = Vec::new();
        encrypt_stream_with_iv(cek, iv, data, &mut out, data.len() as u64, None).unwrap();
        out
    }

    fn decrypt_vec(cek: &Cek, blob: &[u8]) -> SbxResult<Vec<u8>> {
        let mut out = Vec::new();
        decrypt_stream(cek, blob, &mut out, blob.len() as u64, None)?;
        Ok(out)
    }

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i * 31 % 251) as u8).collect()
    }

    #[test]
    fn test_known_vector() {
        let blob = encrypt_vec(&key_0_to_31(), &iv_a0(), b"shoebox!!\n");
        let mut expected = vec![0x01];
        expected.extend_from_slice(&iv_a0());
        expected.extend_from_slice(
            &hex::decode("9570134827a47a9e436ff3ea552e82fa73a8e6a86a17dcc8b188").unwrap(),
        );
        assert_eq!(blob, expected);
        assert_eq!(decrypt_vec(&key_0_to_31(), &blob).unwrap(), b"shoebox!!\n");
    }

    #[test]
    fn test_nist_zero_key_vector() {
        let blob = encrypt_vec(&Cek::from_bytes([0u8; KEY_SIZE]), &[0u8; IV_SIZE], &[0u8; 16]);
        assert_eq!(
            hex::encode(&blob[1 + IV_SIZE..]),
            "cea7403d4d606b6e074ec5d3baf39d18d0d1c8a799996bf0265b98b5d48ab919"
        );
    }

    #[test]
    fn test_matches_one_shot_gcm() {
        let cek = key_0_to_31();
        let iv = iv_a0();
        let data = pattern(3 * STREAM_CHUNK_SIZE + 1000);

        let streamed = encrypt_vec(&cek, &iv, &data);
        let one_shot = seal_with_iv(cek.as_bytes(), &iv, &data).unwrap();
        assert_eq!(streamed[0], FORMAT_VERSION);
        assert_eq!(&streamed[1..], one_shot.as_slice());
    }

    #[test]
    fn test_roundtrip_at_chunk_boundaries() {
        let cek = key_0_to_31();
        for len in [
            0,
            1,
            15,
            16,
            17,
            STREAM_CHUNK_SIZE - 1,
            STREAM_CHUNK_SIZE,
            STREAM_CHUNK_SIZE + 1,
            STREAM_CHUNK_SIZE + TAG_SIZE,
            2 * STREAM_CHUNK_SIZE,
        ] {
            let data = pattern(len);
            let blob = encrypt_vec(&cek, &iv_a0(), &data);
            assert_eq!(blob.len() as u64, len as u64 + blob_overhead());
            assert_eq!(decrypt_vec(&cek, &blob).unwrap(), data, "len {len}");
        }
    }

    #[test]
    fn test_outcome_reports_hash_and_sizes() {
        let data = b"hello photo";
        let mut out = Vec::new();
        let outcome =
            encrypt_stream(&key_0_to_31(), &data[..], &mut out, data.len() as u64, None).unwrap();
        assert_eq!(outcome.plaintext_len, data.len() as u64);
        assert_eq!(outcome.ciphertext_len, out.len() as u64);
        assert_eq!(outcome.content_hash, hex::encode(Sha256::digest(data)));
    }

    #[test]
    fn test_named_pass_matches_separate_name() {
        let master = crate::MasterKey::from_bytes([7u8; KEY_SIZE]);
        let salt = FilenameSalt::derive(&master).unwrap();
        let cek = key_0_to_31();
        let data = pattern(2 * STREAM_CHUNK_SIZE + 333);

        let seen = std::sync::Mutex::new(Vec::new());
        let report = |done: u64, total: u64| seen.lock().unwrap().push((done, total));
        let mut blob = Vec::new();
        let (outcome, digest) = encrypt_stream_named(
            &cek,
            &salt,
            &data[..],
            &mut blob,
            data.len() as u64,
            Some(&report),
        )
        .unwrap();
        let total = data.len() as u64;
        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                (STREAM_CHUNK_SIZE as u64, total),
                (2 * STREAM_CHUNK_SIZE as u64, total),
                (total, total)
            ]
        );
        assert_eq!(digest.remote_name, crate::remote_name(&data, &master).unwrap());
        assert_eq!(digest.content_hash, outcome.content_hash);
        assert_eq!(digest.content_hash, hex::encode(Sha256::digest(&data)));
        assert_eq!(digest.size, data.len() as u64);
        assert_eq!(decrypt_vec(&cek, &blob).unwrap(), data);
    }

    #[test]
    fn test_random_iv_differs() {
        let cek = key_0_to_31();
        let mut a = Vec::new();
        let mut b = Vec::new();
        encrypt_stream(&cek, &b"same"[..], &mut a, 4, None).unwrap();
        encrypt_stream(&cek, &b"same"[..], &mut b, 4, None).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_key_fails() {
        let blob = encrypt_vec(&key_0_to_31(), &iv_a0(), b"secret");
        let err = decrypt_vec(&Cek::from_bytes([9u8; KEY_SIZE]), &blob).unwrap_err();
        assert!(matches!(err, SbxError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_unsupported_version() {
        let mut blob = encrypt_vec(&key_0_to_31(), &iv_a0(), b"secret");
        blob[0] = 2;
        let err = decrypt_vec(&key_0_to_31(), &blob).unwrap_err();
        assert!(matches!(err, SbxError::UnsupportedFormatVersion(2)));
    }

    #[test]
    fn test_truncated_input() {
        let cek = key_0_to_31();
        assert!(matches!(
            decrypt_vec(&cek, &[]),
            Err(SbxError::InvalidInput(_))
        ));
        assert!(matches!(
            decrypt_vec(&cek, &[1u8; 8]),
            Err(SbxError::InvalidInput(_))
        ));
        // Full header but fewer than TAG_SIZE bytes after it
        assert!(matches!(
            decrypt_vec(&cek, &[1u8; 1 + IV_SIZE + 10]),
            Err(SbxError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_truncated_tail_fails_authentication() {
        let cek = key_0_to_31();
        let blob = encrypt_vec(&cek, &iv_a0(), &pattern(5000));
        let err = decrypt_vec(&cek, &blob[..blob.len() - 1]).unwrap_err();
        assert!(matches!(err, SbxError::AuthenticationFailure(_)));
    }

    #[test]
    fn test_progress_reaches_total() {
        let data = pattern(2 * STREAM_CHUNK_SIZE + 7);
        let last = AtomicU64::new(0);
        let cb: ProgressFn<'_> = &|done: u64, total: u64| {
            assert!(done <= total);
            last.store(done, Ordering::SeqCst);
        };
        let mut blob = Vec::new();
        encrypt_stream(&key_0_to_31(), &data[..], &mut blob, data.len() as u64, Some(cb)).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), data.len() as u64);

        let mut plain = Vec::new();
        decrypt_stream(&key_0_to_31(), &blob[..], &mut plain, blob.len() as u64, Some(cb)).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), blob.len() as u64);
    }

    mod prop {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(48))]

            #[test]
            fn roundtrip(data in proptest::collection::vec(any::<u8>(), 0..200_000)) {
                let cek = key_0_to_31();
                let blob = encrypt_vec(&cek, &iv_a0(), &data);
                prop_assert_eq!(decrypt_vec(&cek, &blob).unwrap(), data);
            }

            #[test]
            fn any_flipped_byte_is_rejected(
                data in proptest::collection::vec(any::<u8>(), 1..4096),
                pos in any::<proptest::sample::Index>(),
                mask in 1u8..=255,
            ) {
                let cek = key_0_to_31();
                let mut blob = encrypt_vec(&cek, &iv_a0(), &data);
                // Skip the version byte; that path has its own error
                let idx = 1 + pos.index(blob.len() - 1);
                blob[idx] ^= mask;
                prop_assert!(matches!(
                    decrypt_vec(&cek, &blob),
                    Err(SbxError::AuthenticationFailure(_))
                ));
            }
        }
    }
}
