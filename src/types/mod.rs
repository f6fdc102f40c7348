//! Shared identifiers, the error taxonomy and checksum helpers.

#![forbid(unsafe_code)]

use std::fmt;
use std::io;

pub mod checksum;

pub use checksum::{crc32, Crc32};

/// Identifier of a fixed-size page inside a page file. Page 0 holds file metadata.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct PageId(pub u32);

/// Sequence number of a WAL record.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct Lsn(pub u64);

/// Identifier of a table whose rows share one storage engine instance.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct TableId(pub u32);

/// Opaque handle used to retrieve a row from the engine that produced it.
///
/// Callers must not interpret the variants. References handed out by the
/// append-only engine are invalidated by [`crate::storage::StorageEngine::vacuum`].
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub enum RowRef {
    /// Byte offset of the first version of a row in an append-only log.
    Offset(u64),
    /// Slot inside a page of a page-based file.
    Slot {
        /// Page holding the slot.
        page: PageId,
        /// Slot index within the page.
        slot: u16,
    },
    /// Logical row id that survives compaction.
    Row(u64),
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RowRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RowRef::Offset(off) => write!(f, "@{off}"),
            RowRef::Slot { page, slot } => write!(f, "{page}:{slot}"),
            RowRef::Row(id) => write!(f, "#{id}"),
        }
    }
}

impl Lsn {
    /// Returns the following sequence number.
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

/// Errors surfaced by every layer of the engine.
#[derive(thiserror::Error, Debug)]
pub enum SealError {
    /// Underlying I/O failure.
    #[error("IO: {0}")]
    Io(#[from] io::Error),
    /// Checksum or authentication tag mismatch. Fatal for the affected unit only.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
    /// Short read, usually the torn tail of an incomplete flush.
    #[error("truncated data: {0}")]
    Truncated(&'static str),
    /// A WAL flush failed; every waiter of the batch receives this.
    #[error("flush failure: {0}")]
    FlushFailure(String),
    /// Disk full or allocation failure while extending storage.
    #[error("capacity exceeded: {0}")]
    CapacityExceeded(&'static str),
    /// Invalid argument or configuration.
    #[error("invalid argument: {0}")]
    Invalid(&'static str),
    /// Invalid argument with a formatted message.
    #[error("invalid argument: {0}")]
    InvalidOwned(String),
    /// The addressed row does not exist.
    #[error("not found")]
    NotFound,
    /// The component has been shut down.
    #[error("closed")]
    Closed,
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, SealError>;

impl SealError {
    /// Maps a write-side I/O error, turning "no space left" into [`SealError::CapacityExceeded`].
    pub fn from_write(err: io::Error) -> Self {
        if is_disk_full(&err) {
            SealError::CapacityExceeded("no space left on device")
        } else {
            SealError::Io(err)
        }
    }

    /// Returns true for errors that indicate damaged bytes rather than a failed operation.
    pub fn is_corruption(&self) -> bool {
        matches!(self, SealError::Corruption(_) | SealError::Truncated(_))
    }
}

#[cfg(unix)]
fn is_disk_full(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOSPC)
}

#[cfg(not(unix))]
fn is_disk_full(_err: &io::Error) -> bool {
    false
}

/// Duplicates an error so it can be handed to several waiters.
pub fn clone_error(err: &SealError) -> SealError {
    match err {
        SealError::Io(io_err) => SealError::Io(io::Error::new(io_err.kind(), io_err.to_string())),
        SealError::Corruption(msg) => SealError::Corruption(msg),
        SealError::Truncated(msg) => SealError::Truncated(msg),
        SealError::FlushFailure(msg) => SealError::FlushFailure(msg.clone()),
        SealError::CapacityExceeded(msg) => SealError::CapacityExceeded(msg),
        SealError::Invalid(msg) => SealError::Invalid(msg),
        SealError::InvalidOwned(msg) => SealError::InvalidOwned(msg.clone()),
        SealError::NotFound => SealError::NotFound,
        SealError::Closed => SealError::Closed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn clone_error_preserves_io_kind() {
        let err = SealError::Io(io::Error::new(io::ErrorKind::UnexpectedEof, "eof"));
        match clone_error(&err) {
            SealError::Io(inner) => assert_eq!(inner.kind(), io::ErrorKind::UnexpectedEof),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn row_ref_display_is_compact() {
        assert_eq!(RowRef::Offset(16).to_string(), "@16");
        assert_eq!(
            RowRef::Slot {
                page: PageId(3),
                slot: 7
            }
            .to_string(),
            "3:7"
        );
        assert_eq!(RowRef::Row(9).to_string(), "#9");
    }

    #[cfg(unix)]
    #[test]
    fn enospc_maps_to_capacity_exceeded() {
        let err = io::Error::from_raw_os_error(libc::ENOSPC);
        assert!(matches!(
            SealError::from_write(err),
            SealError::CapacityExceeded(_)
        ));
    }
}
