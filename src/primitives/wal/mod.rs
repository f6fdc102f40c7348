#![forbid(unsafe_code)]

mod committer;

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::primitives::crypto::{BufferPool, PageCipher, NONCE_LEN, SEAL_OVERHEAD};
use crate::primitives::io::FileIo;
use crate::types::{crc32, Lsn, Result, SealError};

pub use committer::{CommitConfig, CommitReceipt, CommitterStats, Durability, GroupCommitter, WalEntry};

const WAL_MAGIC: [u8; 4] = *b"SLWL";
const WAL_FORMAT_VERSION: u16 = 1;
const FLAG_ENCRYPTED: u16 = 0x1;
/// Length of the WAL file header.
pub const FILE_HEADER_LEN: usize = 16;
const LEN_PREFIX: usize = 4;
const CRC_SUFFIX: usize = 4;
/// Fixed part of a record body: sequence number, opcode and payload length.
const BODY_HEADER_LEN: usize = 8 + 1 + 4;
const MAX_RECORD_BODY: usize = 64 * 1024 * 1024;
const GROUP_FLAG: u8 = 0x80;

/// Operation carried by a WAL record.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum WalOp {
    /// Row insert.
    Insert,
    /// Row update.
    Update,
    /// Row delete.
    Delete,
    /// Closes a multi-record group.
    Commit,
}

impl WalOp {
    fn as_u8(self) -> u8 {
        match self {
            WalOp::Insert => 1,
            WalOp::Update => 2,
            WalOp::Delete => 3,
            WalOp::Commit => 4,
        }
    }

    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(WalOp::Insert),
            2 => Some(WalOp::Update),
            3 => Some(WalOp::Delete),
            4 => Some(WalOp::Commit),
            _ => None,
        }
    }
}

/// One immutable log record.
#[derive(Clone, Eq, PartialEq)]
pub struct WalRecord {
    /// Strictly increasing sequence number.
    pub seq: Lsn,
    /// Operation.
    pub op: WalOp,
    /// True when the record only becomes valid once a following `Commit` record is read.
    pub grouped: bool,
    /// Opaque payload.
    pub payload: Vec<u8>,
}

impl WalRecord {
    /// Creates a standalone record.
    pub fn new(seq: Lsn, op: WalOp, payload: Vec<u8>) -> Self {
        Self {
            seq,
            op,
            grouped: false,
            payload,
        }
    }

    fn body_len(&self, encrypted: bool) -> usize {
        let plain = BODY_HEADER_LEN + self.payload.len();
        if encrypted {
            plain + SEAL_OVERHEAD
        } else {
            plain
        }
    }

    fn encode_plain_body(&self, dst: &mut [u8]) {
        let op = if self.grouped {
            self.op.as_u8() | GROUP_FLAG
        } else {
            self.op.as_u8()
        };
        dst[0..8].copy_from_slice(&self.seq.0.to_be_bytes());
        dst[8] = op;
        dst[9..13].copy_from_slice(&(self.payload.len() as u32).to_be_bytes());
        dst[13..13 + self.payload.len()].copy_from_slice(&self.payload);
    }

    fn decode_plain_body(src: &[u8]) -> Option<Self> {
        if src.len() < BODY_HEADER_LEN {
            return None;
        }
        let seq = Lsn(u64::from_be_bytes(src[0..8].try_into().ok()?));
        let raw_op = src[8];
        let op = WalOp::from_u8(raw_op & !GROUP_FLAG)?;
        let payload_len = u32::from_be_bytes(src[9..13].try_into().ok()?) as usize;
        if payload_len != src.len() - BODY_HEADER_LEN {
            return None;
        }
        Some(Self {
            seq,
            op,
            grouped: raw_op & GROUP_FLAG != 0,
            payload: src[BODY_HEADER_LEN..].to_vec(),
        })
    }
}

impl fmt::Debug for WalRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalRecord")
            .field("seq", &self.seq)
            .field("op", &self.op)
            .field("grouped", &self.grouped)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

/// Options for opening a write-ahead log.
#[derive(Clone)]
pub struct WalOptions {
    /// Seals record bodies when set.
    pub cipher: Option<Arc<PageCipher>>,
    /// Scratch buffers for encoding and decoding.
    pub pool: Arc<BufferPool>,
}

impl WalOptions {
    /// Plaintext log.
    pub fn plain(pool: Arc<BufferPool>) -> Self {
        Self { cipher: None, pool }
    }

    /// Encrypted log.
    pub fn encrypted(cipher: Arc<PageCipher>, pool: Arc<BufferPool>) -> Self {
        Self {
            cipher: Some(cipher),
            pool,
        }
    }
}

/// Statistics tracking WAL operations.
#[derive(Clone, Debug, Default)]
pub struct WalStats {
    /// Records appended since open.
    pub records_appended: u64,
    /// Bytes appended since open.
    pub bytes_appended: u64,
    /// Coalesced batch writes.
    pub batches: u64,
    /// Sync calls issued.
    pub syncs: u64,
}

/// Result of replaying a log.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RecoveryReport {
    /// Data records handed to the replay callback.
    pub records_replayed: u64,
    /// Sequence number of the last valid record.
    pub last_seq: Lsn,
    /// File offset up to which records were kept.
    pub valid_up_to: u64,
    /// Bytes dropped from the tail (torn write, corrupt record or unfinished group).
    pub discarded_bytes: u64,
}

struct WalState {
    append_offset: u64,
    last_seq: Lsn,
    stats: WalStats,
}

/// Append-only log of checksummed, optionally encrypted records.
///
/// File layout: a 16-byte header followed by frames of
/// `[u32 BE body_len][body][u32 BE crc32(body)]`.
pub struct Wal {
    io: Arc<dyn FileIo>,
    cipher: Option<Arc<PageCipher>>,
    pool: Arc<BufferPool>,
    state: Mutex<WalState>,
}

impl Wal {
    /// Opens or creates a log. Call [`Wal::recover`] before appending to an existing file.
    pub fn open(io: Arc<dyn FileIo>, options: WalOptions) -> Result<Self> {
        let encrypted = options.cipher.is_some();
        let len = io.len()?;
        if len < FILE_HEADER_LEN as u64 {
            io.write_at(0, &encode_header(encrypted))?;
            io.truncate(FILE_HEADER_LEN as u64)?;
        } else {
            let mut buf = [0u8; FILE_HEADER_LEN];
            io.read_at(0, &mut buf)?;
            let flags = decode_header(&buf)?;
            if (flags & FLAG_ENCRYPTED != 0) != encrypted {
                return Err(SealError::Invalid("wal encryption setting mismatch"));
            }
        }
        let append_offset = io.len()?.max(FILE_HEADER_LEN as u64);
        Ok(Self {
            io,
            cipher: options.cipher,
            pool: options.pool,
            state: Mutex::new(WalState {
                append_offset,
                last_seq: Lsn(0),
                stats: WalStats::default(),
            }),
        })
    }

    /// Appends one record without syncing.
    pub fn append(&self, record: &WalRecord) -> Result<()> {
        self.append_batch(&[record])
    }

    /// Appends records with a single write call. Does not sync.
    pub fn append_batch(&self, records: &[&WalRecord]) -> Result<()> {
        if records.is_empty() {
            return Ok(());
        }
        let encrypted = self.cipher.is_some();
        let mut state = self.state.lock();
        let mut prev = state.last_seq;
        let mut total = 0usize;
        for record in records {
            if record.seq <= prev {
                return Err(SealError::Invalid("wal sequence numbers must increase"));
            }
            let body = record.body_len(encrypted);
            if body > MAX_RECORD_BODY {
                return Err(SealError::Invalid("wal record exceeds maximum size"));
            }
            prev = record.seq;
            total += LEN_PREFIX + body + CRC_SUFFIX;
        }
        let start = state.append_offset;
        let mut buf = self.pool.rent(total);
        let mut pos = 0usize;
        for record in records {
            let body_len = record.body_len(encrypted);
            let frame_off = start + pos as u64;
            buf[pos..pos + LEN_PREFIX].copy_from_slice(&(body_len as u32).to_be_bytes());
            let body = &mut buf[pos + LEN_PREFIX..pos + LEN_PREFIX + body_len];
            match &self.cipher {
                Some(cipher) => {
                    record.encode_plain_body(&mut body[NONCE_LEN..]);
                    cipher.seal_in_place(frame_off, body)?;
                }
                None => record.encode_plain_body(body),
            }
            let crc = crc32(&[body]);
            let crc_at = pos + LEN_PREFIX + body_len;
            buf[crc_at..crc_at + CRC_SUFFIX].copy_from_slice(&crc.to_be_bytes());
            pos = crc_at + CRC_SUFFIX;
        }
        self.io.write_at(start, &buf)?;
        state.append_offset += total as u64;
        state.last_seq = prev;
        state.stats.records_appended += records.len() as u64;
        state.stats.bytes_appended += total as u64;
        state.stats.batches += 1;
        debug!(
            records = records.len(),
            bytes = total,
            offset = start,
            "wal.append_batch"
        );
        Ok(())
    }

    /// Flushes appended records to stable storage.
    pub fn sync(&self) -> Result<()> {
        self.io.sync_all()?;
        self.state.lock().stats.syncs += 1;
        Ok(())
    }

    /// Creates an iterator over the records currently on disk.
    pub fn iter(&self) -> Result<WalIterator<'_>> {
        Ok(WalIterator {
            wal: self,
            offset: FILE_HEADER_LEN as u64,
            end: self.io.len()?,
            prev_seq: Lsn(0),
            valid_up_to: FILE_HEADER_LEN as u64,
        })
    }

    /// Replays valid records in sequence order and truncates whatever follows them.
    ///
    /// Replay stops at the first truncated, checksum-failing, undecryptable or
    /// out-of-order record; that point is treated as the torn tail of an
    /// incomplete flush. Grouped records are replayed only when their closing
    /// `Commit` record is valid. `Commit` records themselves are not passed to
    /// `apply`. Replaying the same file twice yields the same calls.
    pub fn recover<F>(&self, mut apply: F) -> Result<RecoveryReport>
    where
        F: FnMut(&WalRecord) -> Result<()>,
    {
        let mut iter = self.iter()?;
        let end = iter.end;
        let mut report = RecoveryReport::default();
        let mut pending: Vec<WalRecord> = Vec::new();
        let mut group_start = None;
        let mut last_committed_seq = Lsn(0);
        let mut keep_up_to = FILE_HEADER_LEN as u64;
        loop {
            let offset = iter.offset;
            let Some(record) = iter.next_record()? else {
                break;
            };
            if record.grouped {
                group_start.get_or_insert(offset);
                pending.push(record);
                continue;
            }
            if record.op == WalOp::Commit {
                for grouped in pending.drain(..) {
                    apply(&grouped)?;
                    report.records_replayed += 1;
                }
            } else {
                // A standalone record after an unfinished group: the group never committed.
                if !pending.is_empty() {
                    break;
                }
                apply(&record)?;
                report.records_replayed += 1;
            }
            group_start = None;
            last_committed_seq = record.seq;
            keep_up_to = iter.valid_up_to();
        }
        if let Some(start) = group_start {
            keep_up_to = keep_up_to.min(start);
        }
        report.last_seq = last_committed_seq;
        report.valid_up_to = keep_up_to;
        report.discarded_bytes = end.saturating_sub(keep_up_to);
        if report.discarded_bytes > 0 {
            warn!(
                discarded = report.discarded_bytes,
                valid_up_to = keep_up_to,
                "wal.recover.truncate_tail"
            );
            self.io.truncate(keep_up_to)?;
        }
        {
            let mut state = self.state.lock();
            state.append_offset = keep_up_to;
            state.last_seq = state.last_seq.max(last_committed_seq);
        }
        info!(
            records = report.records_replayed,
            last_seq = report.last_seq.0,
            "wal.recover.complete"
        );
        Ok(report)
    }

    /// Drops every record, keeping the header. Sequence numbers keep increasing.
    pub fn reset(&self) -> Result<u64> {
        let mut state = self.state.lock();
        let before = state.append_offset;
        self.io.truncate(FILE_HEADER_LEN as u64)?;
        self.io.sync_all()?;
        state.append_offset = FILE_HEADER_LEN as u64;
        state.stats.syncs += 1;
        debug!(reclaimed = before - FILE_HEADER_LEN as u64, "wal.reset");
        Ok(before - FILE_HEADER_LEN as u64)
    }

    /// Sequence number of the last appended or recovered record.
    pub fn last_seq(&self) -> Lsn {
        self.state.lock().last_seq
    }

    /// Returns current statistics for this WAL instance.
    pub fn stats(&self) -> WalStats {
        self.state.lock().stats.clone()
    }

    /// Returns the total size of the WAL file in bytes.
    pub fn len(&self) -> Result<u64> {
        self.io.len()
    }

    /// Returns true if the WAL contains no records.
    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? <= FILE_HEADER_LEN as u64)
    }
}

/// Sequential reader over the records of a [`Wal`].
///
/// Stops at the first record that is incomplete or fails validation.
pub struct WalIterator<'a> {
    wal: &'a Wal,
    offset: u64,
    end: u64,
    prev_seq: Lsn,
    valid_up_to: u64,
}

impl WalIterator<'_> {
    /// Reads the next valid record, or `None` at the end of the valid prefix.
    pub fn next_record(&mut self) -> Result<Option<WalRecord>> {
        if self.offset + LEN_PREFIX as u64 > self.end {
            return Ok(self.stop());
        }
        let mut prefix = [0u8; LEN_PREFIX];
        if !read_or_eof(&*self.wal.io, self.offset, &mut prefix)? {
            return Ok(self.stop());
        }
        let body_len = u32::from_be_bytes(prefix) as usize;
        let min_body = BODY_HEADER_LEN
            + if self.wal.cipher.is_some() {
                SEAL_OVERHEAD
            } else {
                0
            };
        if body_len < min_body || body_len > MAX_RECORD_BODY {
            return Ok(self.stop());
        }
        let frame_len = LEN_PREFIX + body_len + CRC_SUFFIX;
        if self.offset + frame_len as u64 > self.end {
            return Ok(self.stop());
        }
        let mut buf = self.wal.pool.rent(body_len + CRC_SUFFIX);
        if !read_or_eof(&*self.wal.io, self.offset + LEN_PREFIX as u64, &mut buf)? {
            return Ok(self.stop());
        }
        let stored_crc = u32::from_be_bytes(
            buf[body_len..body_len + CRC_SUFFIX]
                .try_into()
                .unwrap_or([0; 4]),
        );
        let body = &mut buf[..body_len];
        if crc32(&[body]) != stored_crc {
            debug!(offset = self.offset, "wal.iter.crc_mismatch");
            return Ok(self.stop());
        }
        let plain: &[u8] = match &self.wal.cipher {
            Some(cipher) => match cipher.open_in_place(self.offset, body) {
                Ok(plain) => plain,
                Err(_) => {
                    debug!(offset = self.offset, "wal.iter.decrypt_failed");
                    return Ok(self.stop());
                }
            },
            None => body,
        };
        let Some(record) = WalRecord::decode_plain_body(plain) else {
            return Ok(self.stop());
        };
        if record.seq <= self.prev_seq {
            debug!(offset = self.offset, seq = record.seq.0, "wal.iter.seq_regression");
            return Ok(self.stop());
        }
        self.prev_seq = record.seq;
        self.offset += frame_len as u64;
        self.valid_up_to = self.offset;
        Ok(Some(record))
    }

    /// Returns the file offset up to which records have been validated.
    pub fn valid_up_to(&self) -> u64 {
        self.valid_up_to
    }

    fn stop(&mut self) -> Option<WalRecord> {
        self.offset = self.end;
        None
    }
}

fn read_or_eof(io: &dyn FileIo, off: u64, dst: &mut [u8]) -> Result<bool> {
    match io.read_at(off, dst) {
        Ok(()) => Ok(true),
        Err(SealError::Truncated(_)) => Ok(false),
        Err(SealError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err),
    }
}

fn encode_header(encrypted: bool) -> [u8; FILE_HEADER_LEN] {
    let mut buf = [0u8; FILE_HEADER_LEN];
    buf[0..4].copy_from_slice(&WAL_MAGIC);
    buf[4..6].copy_from_slice(&WAL_FORMAT_VERSION.to_be_bytes());
    let flags = if encrypted { FLAG_ENCRYPTED } else { 0 };
    buf[6..8].copy_from_slice(&flags.to_be_bytes());
    let crc = crc32(&[&buf[..12]]);
    buf[12..16].copy_from_slice(&crc.to_be_bytes());
    buf
}

fn decode_header(buf: &[u8; FILE_HEADER_LEN]) -> Result<u16> {
    if buf[0..4] != WAL_MAGIC {
        return Err(SealError::Corruption("wal magic mismatch"));
    }
    let stored_crc = u32::from_be_bytes([buf[12], buf[13], buf[14], buf[15]]);
    if crc32(&[&buf[..12]]) != stored_crc {
        return Err(SealError::Corruption("wal header crc mismatch"));
    }
    let version = u16::from_be_bytes([buf[4], buf[5]]);
    if version != WAL_FORMAT_VERSION {
        return Err(SealError::Corruption("wal format version mismatch"));
    }
    if buf[8..12] != [0; 4] {
        return Err(SealError::Corruption("wal reserved header bytes non-zero"));
    }
    Ok(u16::from_be_bytes([buf[6], buf[7]]))
}
