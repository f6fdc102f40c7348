use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, info, warn};

use super::{EngineKind, EngineOptions, EngineStats, ScanVisitor, StorageEngine, VacuumReport};
use crate::primitives::io::StdFileIo;
use crate::primitives::storage::{CorruptFrame, EncryptedStorage, ScanControl};
use crate::storage::metrics::StorageMetrics;
use crate::types::{Result, RowRef, SealError, TableId};

const TAG_PUT: u8 = 1;
const TAG_TOMBSTONE: u8 = 2;
const RECORD_HEADER_LEN: usize = 1 + 4 + 8;

/// Newest version of a row.
#[derive(Clone, Copy, Debug)]
struct Version {
    table: TableId,
    offset: u64,
}

struct AppendState {
    storage: EncryptedStorage,
    end: u64,
    /// Origin offset (the row's reference) to its newest version.
    versions: FxHashMap<u64, Version>,
    /// Rows whose newest frame failed authentication. They are never served
    /// from an older version; reads fail until the row is rewritten or deleted.
    damaged: FxHashSet<u64>,
    superseded: u64,
    corrupt: u64,
}

impl AppendState {
    fn check_damaged(&self, origin: u64) -> Result<()> {
        if self.damaged.contains(&origin) {
            return Err(SealError::Corruption(
                "newest version of the row failed authentication",
            ));
        }
        Ok(())
    }
}

/// Log-structured engine: every write appends a sealed frame, nothing is overwritten.
///
/// Frame plaintext is `tag u8 | table u32 | origin u64 | row bytes`. `origin` is
/// the offset of the row's first version and doubles as its [`RowRef::Offset`].
/// The map from origin to newest version is rebuilt by scanning on open.
/// Every frame is labelled with its origin in clear, so a frame that fails
/// authentication still names the row it belonged to.
pub struct AppendOnlyEngine {
    path: PathBuf,
    options: EngineOptions,
    state: RwLock<AppendState>,
}

impl AppendOnlyEngine {
    /// Opens or creates the log at `path`, truncating a torn tail.
    pub fn open(path: &Path, options: &EngineOptions) -> Result<Self> {
        let storage = open_storage(path, options)?;
        let mut versions: FxHashMap<u64, Version> = FxHashMap::default();
        let mut last_frame: FxHashMap<u64, u64> = FxHashMap::default();
        let mut superseded = 0u64;
        let outcome = storage.scan_frames(0, |offset, plain| {
            let Some((tag, table, origin, _)) = decode_record(plain) else {
                return Err(SealError::Corruption("append-only record header malformed"));
            };
            last_frame.insert(origin, offset);
            match tag {
                TAG_PUT => {
                    if versions.insert(origin, Version { table, offset }).is_some() {
                        superseded += 1;
                    }
                }
                _ => {
                    if versions.remove(&origin).is_some() {
                        superseded += 1;
                    }
                    superseded += 1;
                }
            }
            Ok(ScanControl::Continue)
        })?;
        let len = storage.len()?;
        if outcome.torn_tail && outcome.valid_up_to < len {
            warn!(
                path = %path.display(),
                discarded = len - outcome.valid_up_to,
                "append_only.open.truncate_tail"
            );
            storage.truncate(outcome.valid_up_to)?;
        }
        let corrupt = outcome.corrupt_frames.len() as u64;
        let damaged = damaged_rows(&outcome.corrupt_frames, &last_frame);
        if corrupt > 0 {
            warn!(
                path = %path.display(),
                corrupt,
                damaged_rows = damaged.len(),
                "append_only.open.corrupt_frames"
            );
            for _ in 0..corrupt {
                options.metrics.corruption_detected("frame");
            }
        }
        info!(
            path = %path.display(),
            rows = versions.len(),
            frames = outcome.frames,
            "append_only.open"
        );
        Ok(Self {
            path: path.to_path_buf(),
            options: options.clone(),
            state: RwLock::new(AppendState {
                end: outcome.valid_up_to,
                storage,
                versions,
                damaged,
                superseded,
                corrupt,
            }),
        })
    }

    fn metrics(&self) -> &dyn StorageMetrics {
        &*self.options.metrics
    }
}

impl StorageEngine for AppendOnlyEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::AppendOnly
    }

    fn insert(&self, table: TableId, row: &[u8]) -> Result<RowRef> {
        let mut state = self.state.write();
        let offset = state.end;
        let record = encode_record(TAG_PUT, table, offset, row);
        state.end += state.storage.write_frame(offset, offset, &record)?;
        state.versions.insert(offset, Version { table, offset });
        Ok(RowRef::Offset(offset))
    }

    fn read(&self, table: TableId, row: RowRef) -> Result<Option<Vec<u8>>> {
        let RowRef::Offset(origin) = row else {
            return Ok(None);
        };
        let state = self.state.read();
        state.check_damaged(origin)?;
        let Some(version) = state.versions.get(&origin).copied() else {
            return Ok(None);
        };
        if version.table != table {
            return Ok(None);
        }
        let plain = state.storage.read_frame(version.offset).inspect_err(|err| {
            if err.is_corruption() {
                self.metrics().corruption_detected("frame");
            }
        })?;
        match decode_record(&plain) {
            Some((TAG_PUT, _, rec_origin, data)) if rec_origin == origin => Ok(Some(data.to_vec())),
            _ => Err(SealError::Corruption("append-only version does not match its row")),
        }
    }

    fn update(&self, table: TableId, row: RowRef, data: &[u8]) -> Result<()> {
        let RowRef::Offset(origin) = row else {
            return Err(SealError::NotFound);
        };
        let mut state = self.state.write();
        let damaged = state.damaged.contains(&origin);
        match state.versions.get(&origin) {
            Some(version) if version.table == table => {}
            _ if damaged => {}
            _ => return Err(SealError::NotFound),
        }
        let offset = state.end;
        let record = encode_record(TAG_PUT, table, origin, data);
        state.end += state.storage.write_frame(offset, origin, &record)?;
        state.versions.insert(origin, Version { table, offset });
        state.damaged.remove(&origin);
        state.superseded += 1;
        Ok(())
    }

    fn delete(&self, table: TableId, row: RowRef) -> Result<()> {
        let RowRef::Offset(origin) = row else {
            return Err(SealError::NotFound);
        };
        let mut state = self.state.write();
        let damaged = state.damaged.contains(&origin);
        match state.versions.get(&origin) {
            Some(version) if version.table == table => {}
            _ if damaged => {}
            _ => return Err(SealError::NotFound),
        }
        let offset = state.end;
        let record = encode_record(TAG_TOMBSTONE, table, origin, &[]);
        state.end += state.storage.write_frame(offset, origin, &record)?;
        state.versions.remove(&origin);
        state.damaged.remove(&origin);
        state.superseded += 2;
        Ok(())
    }

    /// Visits the newest version of every row of `table`.
    ///
    /// Fails with [`SealError::Corruption`] when a row that may belong to
    /// `table` has a newest version that cannot be authenticated.
    fn scan(&self, table: TableId, visit: &mut ScanVisitor<'_>) -> Result<()> {
        let state = self.state.read();
        let versions = &state.versions;
        let end = state.end;
        let owned_or_unknown = |origin: &u64| {
            versions
                .get(origin)
                .map_or(true, |version| version.table == table)
        };
        if state.damaged.iter().any(owned_or_unknown) {
            return Err(SealError::Corruption(
                "newest version of a row failed authentication",
            ));
        }
        let outcome = state.storage.scan_frames(0, |offset, plain| {
            if offset >= end {
                return Ok(ScanControl::Stop);
            }
            let Some((TAG_PUT, rec_table, origin, data)) = decode_record(plain) else {
                return Ok(ScanControl::Continue);
            };
            if rec_table != table {
                return Ok(ScanControl::Continue);
            }
            match versions.get(&origin) {
                Some(version) if version.offset == offset => visit(RowRef::Offset(origin), data),
                _ => Ok(ScanControl::Continue),
            }
        })?;
        if outcome.corrupt_frames.is_empty() {
            return Ok(());
        }
        warn!(corrupt = outcome.corrupt_frames.len(), "append_only.scan.corrupt_frames");
        let current = outcome.corrupt_frames.iter().any(|frame| {
            versions
                .get(&frame.label)
                .is_some_and(|version| version.offset == frame.offset && version.table == table)
        });
        if current {
            self.metrics().corruption_detected("frame");
            return Err(SealError::Corruption("current row version failed authentication"));
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.state.read().storage.sync()
    }

    /// Rewrites the newest version of every live row into a fresh file.
    ///
    /// Every row moves, so all outstanding references are invalidated.
    fn vacuum(&self) -> Result<VacuumReport> {
        let mut state = self.state.write();
        if !state.damaged.is_empty() {
            return Err(SealError::Corruption(
                "refusing to compact while rows have unauthenticated versions",
            ));
        }
        let compact_path = self.path.with_extension("compact");
        if compact_path.exists() {
            std::fs::remove_file(&compact_path)?;
        }
        let target = open_storage(&compact_path, &self.options)?;
        let mut live: Vec<(u64, Version)> = state.versions.iter().map(|(o, v)| (*o, *v)).collect();
        live.sort_unstable_by_key(|(_, version)| version.offset);

        let mut versions = FxHashMap::default();
        let mut tables = FxHashSet::default();
        let mut end = 0u64;
        for (origin, version) in &live {
            let plain = state.storage.read_frame(version.offset)?;
            let Some((TAG_PUT, table, rec_origin, data)) = decode_record(&plain) else {
                return Err(SealError::Corruption("append-only version does not match its row"));
            };
            if rec_origin != *origin {
                return Err(SealError::Corruption("append-only version does not match its row"));
            }
            let record = encode_record(TAG_PUT, table, end, data);
            let written = target.write_frame(end, end, &record)?;
            versions.insert(end, Version { table, offset: end });
            tables.insert(table);
            end += written;
        }
        target.sync()?;
        drop(target);
        let old_len = state.end;
        std::fs::rename(&compact_path, &self.path)?;
        state.storage = open_storage(&self.path, &self.options)?;
        state.storage.sync()?;
        state.end = end;
        state.versions = versions;
        let report = VacuumReport {
            bytes_reclaimed: old_len.saturating_sub(end),
            tables_compacted: tables.len(),
            entries_folded: state.superseded,
            refs_invalidated: live.len() as u64,
        };
        state.superseded = 0;
        info!(
            path = %self.path.display(),
            reclaimed = report.bytes_reclaimed,
            rows = live.len(),
            "append_only.vacuum"
        );
        Ok(report)
    }

    fn stats(&self) -> EngineStats {
        let state = self.state.read();
        EngineStats {
            kind: EngineKind::AppendOnly,
            file_bytes: state.end,
            live_rows: Some(state.versions.len() as u64),
            corrupt_units: state.corrupt,
            ..EngineStats::default()
        }
    }
}

fn open_storage(path: &Path, options: &EngineOptions) -> Result<EncryptedStorage> {
    let io = Arc::new(StdFileIo::open(path)?);
    debug!(path = %path.display(), "append_only.open_storage");
    Ok(EncryptedStorage::new(io, Arc::clone(&options.cipher), Arc::clone(&options.pool))
        .with_mmap_threshold(options.mmap_scan_threshold))
}

/// Rows whose last frame in the log is one that failed authentication.
///
/// A damaged frame followed by a valid frame of the same row was an older
/// version and is harmless.
fn damaged_rows(corrupt: &[CorruptFrame], last_frame: &FxHashMap<u64, u64>) -> FxHashSet<u64> {
    corrupt
        .iter()
        .filter(|frame| {
            last_frame
                .get(&frame.label)
                .map_or(true, |&last| frame.offset > last)
        })
        .map(|frame| frame.label)
        .collect()
}

fn encode_record(tag: u8, table: TableId, origin: u64, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(RECORD_HEADER_LEN + data.len());
    out.push(tag);
    out.extend_from_slice(&table.0.to_be_bytes());
    out.extend_from_slice(&origin.to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn decode_record(plain: &[u8]) -> Option<(u8, TableId, u64, &[u8])> {
    if plain.len() < RECORD_HEADER_LEN {
        return None;
    }
    let tag = plain[0];
    if tag != TAG_PUT && tag != TAG_TOMBSTONE {
        return None;
    }
    let table = TableId(u32::from_be_bytes(plain[1..5].try_into().ok()?));
    let origin = u64::from_be_bytes(plain[5..13].try_into().ok()?);
    Some((tag, table, origin, &plain[RECORD_HEADER_LEN..]))
}
