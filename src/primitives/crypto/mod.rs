//! Authenticated encryption for everything written to disk.
//!
//! A sealed unit has the layout `[nonce 12][ciphertext N][tag 16]`. The caller
//! supplies a 64-bit associated value (usually the file offset or page id) that
//! is authenticated but not stored, so a unit copied to a different position
//! fails to open.

#![forbid(unsafe_code)]

mod pool;

use std::fmt;

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce, Tag};
use rand::RngCore;
use zeroize::Zeroize;

use crate::types::{Result, SealError};

pub use pool::{BufferPool, PoolStats, PooledBuf};

/// Length of the random nonce stored in front of each sealed unit.
pub const NONCE_LEN: usize = 12;
/// Length of the authentication tag stored after the ciphertext.
pub const TAG_LEN: usize = 16;
/// Bytes a sealed unit occupies beyond its plaintext.
pub const SEAL_OVERHEAD: usize = NONCE_LEN + TAG_LEN;
/// Length of a [`CipherKey`] in bytes.
pub const KEY_LEN: usize = 32;

/// AES-256 key material, wiped from memory on drop.
#[derive(Clone)]
pub struct CipherKey([u8; KEY_LEN]);

impl CipherKey {
    /// Builds a key from exactly 32 bytes.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; KEY_LEN] = bytes
            .try_into()
            .map_err(|_| SealError::Invalid("cipher key must be 32 bytes"))?;
        Ok(Self(arr))
    }

    /// Generates a fresh random key.
    pub fn generate() -> Self {
        let mut arr = [0u8; KEY_LEN];
        rand::thread_rng().fill_bytes(&mut arr);
        Self(arr)
    }
}

impl Drop for CipherKey {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl fmt::Debug for CipherKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CipherKey(<redacted>)")
    }
}

/// AES-256-GCM sealing of fixed units.
pub struct PageCipher {
    aead: Aes256Gcm,
}

impl PageCipher {
    /// Creates a cipher bound to `key`.
    pub fn new(key: &CipherKey) -> Self {
        let aead = Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&key.0));
        Self { aead }
    }

    /// Size of a sealed unit holding `plain_len` bytes.
    pub const fn sealed_len(plain_len: usize) -> usize {
        plain_len + SEAL_OVERHEAD
    }

    /// Encrypts in place.
    ///
    /// `buf` must be `plain_len + SEAL_OVERHEAD` bytes long with the plaintext
    /// already placed at `buf[NONCE_LEN..NONCE_LEN + plain_len]`.
    pub fn seal_in_place(&self, associated: u64, buf: &mut [u8]) -> Result<()> {
        if buf.len() < SEAL_OVERHEAD {
            return Err(SealError::Invalid("sealed buffer shorter than overhead"));
        }
        let (nonce, rest) = buf.split_at_mut(NONCE_LEN);
        rand::thread_rng().fill_bytes(nonce);
        let body_len = rest.len() - TAG_LEN;
        let (body, tag_out) = rest.split_at_mut(body_len);
        let tag = self
            .aead
            .encrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &associated.to_be_bytes(),
                body,
            )
            .map_err(|_| SealError::Invalid("plaintext too large to seal"))?;
        tag_out.copy_from_slice(tag.as_slice());
        Ok(())
    }

    /// Decrypts in place and returns the plaintext sub-slice of `buf`.
    ///
    /// A tag mismatch yields [`SealError::Corruption`]; the buffer contents are
    /// unspecified afterwards and must not be used.
    pub fn open_in_place<'a>(&self, associated: u64, buf: &'a mut [u8]) -> Result<&'a mut [u8]> {
        if buf.len() < SEAL_OVERHEAD {
            return Err(SealError::Truncated("sealed unit shorter than overhead"));
        }
        let (nonce, rest) = buf.split_at_mut(NONCE_LEN);
        let body_len = rest.len() - TAG_LEN;
        let (body, tag) = rest.split_at_mut(body_len);
        self.aead
            .decrypt_in_place_detached(
                Nonce::from_slice(nonce),
                &associated.to_be_bytes(),
                body,
                Tag::from_slice(tag),
            )
            .map_err(|_| SealError::Corruption("authentication tag mismatch"))?;
        Ok(body)
    }

    /// Allocating convenience wrapper around [`PageCipher::seal_in_place`].
    pub fn seal(&self, associated: u64, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; Self::sealed_len(plaintext.len())];
        buf[NONCE_LEN..NONCE_LEN + plaintext.len()].copy_from_slice(plaintext);
        self.seal_in_place(associated, &mut buf)?;
        Ok(buf)
    }

    /// Allocating convenience wrapper around [`PageCipher::open_in_place`].
    pub fn open(&self, associated: u64, sealed: &[u8]) -> Result<Vec<u8>> {
        let mut buf = sealed.to_vec();
        let plain = self.open_in_place(associated, &mut buf)?.to_vec();
        buf.zeroize();
        Ok(plain)
    }
}

impl fmt::Debug for PageCipher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("PageCipher(aes-256-gcm)")
    }
}
