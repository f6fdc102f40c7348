//! SealDB: an embedded storage core with encryption at rest.
//!
//! Rows are stored as opaque bytes in one of three engines (append-only,
//! page-based, or hybrid WAL + pages). Every byte written is sealed with
//! AES-256-GCM. The WAL batches concurrent commits into one flush, and
//! per-column hash indexes are built lazily from engine scans.

#![warn(missing_docs)]

pub mod db;
pub mod primitives;
pub mod storage;
pub mod types;

pub use db::{StorageContext, StoreConfig, Table};
pub use storage::{EngineKind, StorageEngine};
pub use types::{Result, RowRef, SealError, TableId};
