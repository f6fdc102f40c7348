//! Pluggable row storage engines and the hash index subsystem.
//!
//! Every engine stores opaque row bytes per table and hands out [`RowRef`]
//! handles. [`open_engine`] picks the implementation named by [`EngineKind`].

mod append_only;
mod hybrid;
mod paged;

/// Hash index subsystem.
///
/// Lazily loaded per-column equality indexes maintained through engine hooks.
pub mod index;

/// Pluggable metrics hooks.
pub mod metrics;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::primitives::crypto::{BufferPool, PageCipher};
use crate::primitives::pager::{PagerOptions, PagerStats};
use crate::primitives::storage::DEFAULT_MMAP_THRESHOLD;
use crate::primitives::wal::{CommitConfig, WalStats};
use crate::types::{Result, RowRef, TableId};

pub use crate::primitives::storage::ScanControl;
pub use append_only::AppendOnlyEngine;
pub use hybrid::HybridEngine;
pub use metrics::{default_metrics, CounterMetrics, NoopMetrics, StorageMetrics};
pub use paged::PagedEngine;

/// Which storage engine backs a table.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EngineKind {
    /// Log-structured file; updates append new versions.
    AppendOnly,
    /// Slotted pages with in-place update and a free list.
    #[default]
    Paged,
    /// WAL writes with an in-memory overlay compacted into pages.
    Hybrid,
}

/// Callback used by [`StorageEngine::scan`].
pub type ScanVisitor<'a> = dyn FnMut(RowRef, &[u8]) -> Result<ScanControl> + 'a;

/// Common row storage contract.
///
/// References returned by `insert` stay valid across updates. Compaction may
/// invalidate them for engines whose [`VacuumReport::refs_invalidated`] is non-zero.
pub trait StorageEngine: Send + Sync {
    /// Engine flavor.
    fn kind(&self) -> EngineKind;

    /// Stores a new row.
    fn insert(&self, table: TableId, row: &[u8]) -> Result<RowRef>;

    /// Returns the current bytes of a row, or `None` if it does not exist.
    fn read(&self, table: TableId, row: RowRef) -> Result<Option<Vec<u8>>>;

    /// Replaces a row. Fails with `NotFound` for missing rows.
    fn update(&self, table: TableId, row: RowRef, data: &[u8]) -> Result<()>;

    /// Removes a row. Fails with `NotFound` for missing rows.
    fn delete(&self, table: TableId, row: RowRef) -> Result<()>;

    /// Visits every live row of `table`. The visitor must not write to this engine.
    fn scan(&self, table: TableId, visit: &mut ScanVisitor<'_>) -> Result<()>;

    /// Makes every acknowledged write durable in the engine's primary file.
    fn checkpoint(&self) -> Result<()>;

    /// Reclaims space held by superseded data.
    fn vacuum(&self) -> Result<VacuumReport>;

    /// Returns a statistics snapshot.
    fn stats(&self) -> EngineStats;
}

/// Outcome of a compaction pass.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct VacuumReport {
    /// Bytes returned to the file system.
    pub bytes_reclaimed: u64,
    /// Distinct tables whose data was rewritten.
    pub tables_compacted: usize,
    /// Log entries or superseded versions folded away.
    pub entries_folded: u64,
    /// Row references that no longer resolve and must be looked up again.
    pub refs_invalidated: u64,
}

/// Statistics snapshot of an engine.
#[derive(Clone, Debug, Default, Serialize)]
pub struct EngineStats {
    /// Engine flavor.
    pub kind: EngineKind,
    /// Size of the primary data file.
    pub file_bytes: u64,
    /// Live rows tracked in memory, where the engine tracks them.
    pub live_rows: Option<u64>,
    /// Page cache statistics for page-backed engines.
    pub pager: Option<PagerStats>,
    /// WAL statistics for log-backed engines.
    #[serde(skip)]
    pub wal: Option<WalStats>,
    /// WAL entries not yet compacted into pages.
    pub overlay_entries: usize,
    /// Message of the flush failure that poisoned the WAL, if any.
    pub wal_failure: Option<String>,
    /// Damaged units skipped while opening or scanning.
    pub corrupt_units: u64,
}

/// Shared resources and tuning for opening engines.
#[derive(Clone)]
pub struct EngineOptions {
    /// Cipher sealing every byte written.
    pub cipher: Arc<PageCipher>,
    /// Scratch buffer pool used for encryption.
    pub pool: Arc<BufferPool>,
    /// Metrics sink.
    pub metrics: Arc<dyn StorageMetrics>,
    /// Page size and cache capacity.
    pub pager: PagerOptions,
    /// Group commit tuning for WAL-backed engines.
    pub commit: CommitConfig,
    /// Files at least this large are scanned through a memory map.
    pub mmap_scan_threshold: u64,
    /// Period of background compaction for the hybrid engine.
    pub vacuum_interval: Option<Duration>,
    /// Overlay size that triggers background compaction.
    pub vacuum_threshold_entries: usize,
}

impl EngineOptions {
    /// Default tuning around the given cipher and pool.
    pub fn new(cipher: Arc<PageCipher>, pool: Arc<BufferPool>) -> Self {
        Self {
            cipher,
            pool,
            metrics: default_metrics(),
            pager: PagerOptions::default(),
            commit: CommitConfig::default(),
            mmap_scan_threshold: DEFAULT_MMAP_THRESHOLD,
            vacuum_interval: None,
            vacuum_threshold_entries: 4096,
        }
    }
}

/// Opens the engine selected by `kind` at `path`.
///
/// The hybrid engine also creates `<path>.wal` next to its page file.
pub fn open_engine(
    kind: EngineKind,
    path: &Path,
    options: &EngineOptions,
) -> Result<Arc<dyn StorageEngine>> {
    Ok(match kind {
        EngineKind::AppendOnly => Arc::new(AppendOnlyEngine::open(path, options)?),
        EngineKind::Paged => Arc::new(PagedEngine::open(path, options)?),
        EngineKind::Hybrid => Arc::new(HybridEngine::open(path, options)?),
    })
}
