//! Low-level primitives for building the storage engines.
//!
//! Everything here is table-agnostic: the engines in [`crate::storage`]
//! combine these pieces into row stores.

/// Authenticated encryption and scratch buffer pooling.
///
/// Every byte that reaches disk passes through [`crypto::PageCipher`].
pub mod crypto;

/// Positioned file access and read-only mapping.
pub mod io;

/// Slotted pages, the free list, and the LRU page cache.
pub mod pager;

/// Encrypted range and frame I/O on top of [`io::FileIo`].
pub mod storage;

/// Write-ahead log format, recovery, and the group committer.
pub mod wal;
