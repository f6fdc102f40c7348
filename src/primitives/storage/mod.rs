//! Encrypted byte-range and sealed-frame I/O on top of [`FileIo`].
//!
//! Ranges are sealed units written at a caller-chosen offset. Frames are
//! length-prefixed sealed units appended to log-structured files:
//! `[u32 BE sealed_len][u64 BE label][nonce | ciphertext | tag]`. Both
//! authenticate the file offset, so bytes moved to another position fail to
//! decrypt. The label is a cleartext hint naming what the frame belongs to; it
//! is only consulted for frames that fail authentication.

#![forbid(unsafe_code)]

use std::sync::Arc;

use tracing::{debug, warn};

use crate::primitives::crypto::{BufferPool, PageCipher, NONCE_LEN, SEAL_OVERHEAD};
use crate::primitives::io::FileIo;
use crate::types::{Result, SealError};

/// Size of the buffer rented once per scan.
pub const SCAN_CHUNK: usize = 64 * 1024;
/// Length of a frame's cleartext header: sealed length plus label.
pub const FRAME_HEADER_LEN: usize = 4 + 8;
/// Largest sealed frame accepted by scans; anything larger is treated as garbage.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;
/// Default file size from which scans use the memory-mapped path.
pub const DEFAULT_MMAP_THRESHOLD: u64 = 8 * 1024 * 1024;

/// Whether a scan should keep going.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ScanControl {
    /// Visit the next frame.
    Continue,
    /// Stop after this frame.
    Stop,
}

/// Summary returned by frame scans.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanOutcome {
    /// Frames handed to the visitor.
    pub frames: u64,
    /// End offset of the last structurally complete frame.
    pub valid_up_to: u64,
    /// Complete frames whose authentication failed. They were skipped.
    pub corrupt_frames: Vec<CorruptFrame>,
    /// True when trailing bytes did not form a complete frame.
    pub torn_tail: bool,
    /// True when the visitor asked to stop.
    pub stopped: bool,
}

/// A structurally complete frame whose contents failed authentication.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct CorruptFrame {
    /// Offset of the frame header.
    pub offset: u64,
    /// Cleartext label written with the frame. It may itself be damaged.
    pub label: u64,
}

/// Encrypting view of a file.
pub struct EncryptedStorage {
    io: Arc<dyn FileIo>,
    cipher: Arc<PageCipher>,
    pool: Arc<BufferPool>,
    mmap_threshold: u64,
}

impl EncryptedStorage {
    /// Wraps `io`, sealing with `cipher` and renting scratch space from `pool`.
    pub fn new(io: Arc<dyn FileIo>, cipher: Arc<PageCipher>, pool: Arc<BufferPool>) -> Self {
        Self {
            io,
            cipher,
            pool,
            mmap_threshold: DEFAULT_MMAP_THRESHOLD,
        }
    }

    /// Sets the file size from which scans switch to the memory-mapped path.
    pub fn with_mmap_threshold(mut self, bytes: u64) -> Self {
        self.mmap_threshold = bytes;
        self
    }

    /// Underlying file.
    pub fn io(&self) -> &Arc<dyn FileIo> {
        &self.io
    }

    /// Buffer pool used for every read and write.
    pub fn pool(&self) -> &Arc<BufferPool> {
        &self.pool
    }

    /// Cipher used for sealing.
    pub fn cipher(&self) -> &Arc<PageCipher> {
        &self.cipher
    }

    /// Current file length in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true when the file holds no bytes.
    pub fn is_empty(&self) -> Result<bool> {
        self.io.is_empty()
    }

    /// Flushes to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()
    }

    /// Truncates the file.
    pub fn truncate(&self, len: u64) -> Result<()> {
        self.io.truncate(len)
    }

    /// Reads and decrypts the unit of `len` plaintext bytes sealed at `offset`.
    pub fn read_range(&self, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut out = vec![0u8; len];
        self.read_range_into(offset, &mut out)?;
        Ok(out)
    }

    /// Like [`EncryptedStorage::read_range`] but decrypts into `dst`.
    pub fn read_range_into(&self, offset: u64, dst: &mut [u8]) -> Result<()> {
        let mut sealed = self.pool.rent(PageCipher::sealed_len(dst.len()));
        self.io.read_at(offset, &mut sealed)?;
        let plain = self.cipher.open_in_place(offset, &mut sealed)?;
        dst.copy_from_slice(plain);
        Ok(())
    }

    /// Encrypts `plaintext` and writes the sealed unit at `offset`.
    ///
    /// The unit occupies `plaintext.len() + SEAL_OVERHEAD` bytes on disk.
    pub fn write_range(&self, offset: u64, plaintext: &[u8]) -> Result<()> {
        let mut sealed = self.pool.rent(PageCipher::sealed_len(plaintext.len()));
        sealed[NONCE_LEN..NONCE_LEN + plaintext.len()].copy_from_slice(plaintext);
        self.cipher.seal_in_place(offset, &mut sealed)?;
        self.io.write_at(offset, &sealed)
    }

    /// Number of bytes a frame holding `plain_len` bytes occupies.
    pub const fn frame_len(plain_len: usize) -> usize {
        FRAME_HEADER_LEN + plain_len + SEAL_OVERHEAD
    }

    /// Seals `plaintext` as a frame at `offset` tagged with `label` and
    /// returns the bytes written.
    pub fn write_frame(&self, offset: u64, label: u64, plaintext: &[u8]) -> Result<u64> {
        let total = Self::frame_len(plaintext.len());
        if total - FRAME_HEADER_LEN > MAX_FRAME_LEN {
            return Err(SealError::Invalid("frame exceeds maximum length"));
        }
        let mut buf = self.pool.rent(total);
        let sealed_len = (total - FRAME_HEADER_LEN) as u32;
        buf[..4].copy_from_slice(&sealed_len.to_be_bytes());
        buf[4..FRAME_HEADER_LEN].copy_from_slice(&label.to_be_bytes());
        let body = &mut buf[FRAME_HEADER_LEN..];
        body[NONCE_LEN..NONCE_LEN + plaintext.len()].copy_from_slice(plaintext);
        self.cipher.seal_in_place(offset, body)?;
        self.io.write_at(offset, &buf)?;
        Ok(total as u64)
    }

    /// Reads and decrypts the frame starting at `offset`.
    pub fn read_frame(&self, offset: u64) -> Result<Vec<u8>> {
        let mut header = [0u8; FRAME_HEADER_LEN];
        self.io.read_at(offset, &mut header)?;
        let (sealed_len, _) = parse_header(&header);
        if !(SEAL_OVERHEAD..=MAX_FRAME_LEN).contains(&sealed_len) {
            return Err(SealError::Corruption("frame length out of range"));
        }
        let mut sealed = self.pool.rent(sealed_len);
        self.io
            .read_at(offset + FRAME_HEADER_LEN as u64, &mut sealed)?;
        let plain = self.cipher.open_in_place(offset, &mut sealed)?;
        Ok(plain.to_vec())
    }

    /// Visits every frame from `start` to the current end of file.
    ///
    /// Frames that fail authentication are skipped and reported. A frame whose
    /// declared length runs past the end of the file ends the scan as a torn tail.
    pub fn scan_frames<F>(&self, start: u64, mut visit: F) -> Result<ScanOutcome>
    where
        F: FnMut(u64, &[u8]) -> Result<ScanControl>,
    {
        let end = self.io.len()?;
        if end.saturating_sub(start) >= self.mmap_threshold {
            if let Some(map) = self.io.map_readonly()? {
                let end = end.min(map.len() as u64);
                return self.scan_mapped(&map[..end as usize], start, &mut visit);
            }
        }
        self.scan_chunked(start, end, &mut visit)
    }

    /// Visits frames whose plaintext starts with `prefix`.
    pub fn scan_prefix<F>(&self, start: u64, prefix: &[u8], mut visit: F) -> Result<ScanOutcome>
    where
        F: FnMut(u64, &[u8]) -> Result<ScanControl>,
    {
        self.scan_frames(start, |offset, plain| {
            if plain.starts_with(prefix) {
                visit(offset, plain)
            } else {
                Ok(ScanControl::Continue)
            }
        })
    }

    fn scan_chunked(
        &self,
        start: u64,
        end: u64,
        visit: &mut dyn FnMut(u64, &[u8]) -> Result<ScanControl>,
    ) -> Result<ScanOutcome> {
        let mut outcome = ScanOutcome {
            valid_up_to: start,
            ..ScanOutcome::default()
        };
        let mut chunk = self.pool.rent(SCAN_CHUNK);
        let mut chunk_start = start;
        let mut filled = 0usize;
        let mut pos = start;
        while pos < end {
            let rel = (pos - chunk_start) as usize;
            if rel + FRAME_HEADER_LEN > filled {
                chunk_start = pos;
                filled = self.refill(&mut chunk, pos, end)?;
                if filled < FRAME_HEADER_LEN {
                    outcome.torn_tail = true;
                    break;
                }
            }
            let rel = (pos - chunk_start) as usize;
            let (sealed_len, label) = parse_header(&chunk[rel..rel + FRAME_HEADER_LEN]);
            if !(SEAL_OVERHEAD..=MAX_FRAME_LEN).contains(&sealed_len) {
                outcome.torn_tail = true;
                break;
            }
            let frame_len = FRAME_HEADER_LEN + sealed_len;
            if pos + frame_len as u64 > end {
                outcome.torn_tail = true;
                break;
            }
            let control = if frame_len <= SCAN_CHUNK {
                if rel + frame_len > filled {
                    chunk_start = pos;
                    filled = self.refill(&mut chunk, pos, end)?;
                }
                let rel = (pos - chunk_start) as usize;
                let body = &mut chunk[rel + FRAME_HEADER_LEN..rel + frame_len];
                self.visit_sealed(pos, label, body, &mut outcome, visit)?
            } else {
                let mut big = self.pool.rent(sealed_len);
                self.io.read_at(pos + FRAME_HEADER_LEN as u64, &mut big)?;
                self.visit_sealed(pos, label, &mut big, &mut outcome, visit)?
            };
            pos += frame_len as u64;
            outcome.valid_up_to = pos;
            if control == ScanControl::Stop {
                outcome.stopped = true;
                break;
            }
        }
        Ok(outcome)
    }

    fn scan_mapped(
        &self,
        map: &[u8],
        start: u64,
        visit: &mut dyn FnMut(u64, &[u8]) -> Result<ScanControl>,
    ) -> Result<ScanOutcome> {
        debug!(bytes = map.len(), start, "storage.scan.mapped");
        let mut outcome = ScanOutcome {
            valid_up_to: start,
            ..ScanOutcome::default()
        };
        let mut pos = start as usize;
        while pos < map.len() {
            if pos + FRAME_HEADER_LEN > map.len() {
                outcome.torn_tail = true;
                break;
            }
            let (sealed_len, label) = parse_header(&map[pos..pos + FRAME_HEADER_LEN]);
            let body_start = pos + FRAME_HEADER_LEN;
            if !(SEAL_OVERHEAD..=MAX_FRAME_LEN).contains(&sealed_len)
                || body_start + sealed_len > map.len()
            {
                outcome.torn_tail = true;
                break;
            }
            let mut body = self.pool.rent(sealed_len);
            body.copy_from_slice(&map[body_start..body_start + sealed_len]);
            let control = self.visit_sealed(pos as u64, label, &mut body, &mut outcome, visit)?;
            pos = body_start + sealed_len;
            outcome.valid_up_to = pos as u64;
            if control == ScanControl::Stop {
                outcome.stopped = true;
                break;
            }
        }
        Ok(outcome)
    }

    fn visit_sealed(
        &self,
        offset: u64,
        label: u64,
        body: &mut [u8],
        outcome: &mut ScanOutcome,
        visit: &mut dyn FnMut(u64, &[u8]) -> Result<ScanControl>,
    ) -> Result<ScanControl> {
        match self.cipher.open_in_place(offset, body) {
            Ok(plain) => {
                outcome.frames += 1;
                visit(offset, plain)
            }
            Err(SealError::Corruption(reason)) => {
                warn!(offset, label, reason, "storage.scan.corrupt_frame");
                outcome.corrupt_frames.push(CorruptFrame { offset, label });
                Ok(ScanControl::Continue)
            }
            Err(err) => Err(err),
        }
    }

    fn refill(&self, chunk: &mut [u8], pos: u64, end: u64) -> Result<usize> {
        let want = (end - pos).min(chunk.len() as u64) as usize;
        self.io.read_at(pos, &mut chunk[..want])?;
        Ok(want)
    }
}

/// Splits a frame header into sealed length and label.
fn parse_header(header: &[u8]) -> (usize, u64) {
    let mut len = [0u8; 4];
    len.copy_from_slice(&header[..4]);
    let mut label = [0u8; 8];
    label.copy_from_slice(&header[4..FRAME_HEADER_LEN]);
    (u32::from_be_bytes(len) as usize, u64::from_be_bytes(label))
}
