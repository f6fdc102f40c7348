use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::{Mutex, MutexGuard, RwLock};
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{debug, error, info, warn};

use super::paged::{open_page_file, place_row, read_row, remove_slot};
use super::{EngineKind, EngineOptions, EngineStats, ScanVisitor, StorageEngine, VacuumReport};
use crate::primitives::io::StdFileIo;
use crate::primitives::pager::{PageFile, SlotContent};
use crate::primitives::storage::ScanControl;
use crate::primitives::wal::{GroupCommitter, Wal, WalEntry, WalOp, WalOptions, WalRecord};
use crate::types::{Lsn, PageId, Result, RowRef, SealError, TableId};

const ROW_ID_LEN: usize = 8;
/// Page rows start with the row id and the generation of the fold that wrote them.
const ROW_PREFIX_LEN: usize = ROW_ID_LEN + 8;
const PAYLOAD_HEADER_LEN: usize = ROW_ID_LEN + 4;
const ROW_LOCK_STRIPES: usize = 64;

#[derive(Clone, Debug)]
enum OverlayEntry {
    Put { table: TableId, data: Vec<u8> },
    Delete { table: TableId },
}

impl OverlayEntry {
    fn table(&self) -> TableId {
        match self {
            OverlayEntry::Put { table, .. } | OverlayEntry::Delete { table } => *table,
        }
    }
}

#[derive(Clone, Debug)]
struct OverlaySlot {
    seq: Lsn,
    entry: OverlayEntry,
}

#[derive(Clone, Copy, Debug)]
struct PageLoc {
    table: TableId,
    page: PageId,
    slot: u16,
}

#[derive(Default)]
struct HybridState {
    /// Changes logged in the WAL but not yet folded into pages.
    overlay: FxHashMap<u64, OverlaySlot>,
    /// Page location of every folded row.
    locations: FxHashMap<u64, PageLoc>,
    next_row_id: u64,
    /// Generation of the last fold; every vacuum stamps its rows with a new one.
    generation: u64,
}

impl HybridState {
    fn current_table(&self, row_id: u64) -> Option<TableId> {
        match self.overlay.get(&row_id) {
            Some(OverlaySlot {
                entry: OverlayEntry::Put { table, .. },
                ..
            }) => Some(*table),
            Some(_) => None,
            None => self.locations.get(&row_id).map(|loc| loc.table),
        }
    }

    fn apply(&mut self, row_id: u64, seq: Lsn, entry: OverlayEntry) {
        match self.overlay.get(&row_id) {
            Some(existing) if existing.seq > seq => {}
            _ => {
                self.overlay.insert(row_id, OverlaySlot { seq, entry });
            }
        }
    }

    fn live_rows(&self) -> u64 {
        let mut live = self.locations.len() as i64;
        for (row_id, slot) in &self.overlay {
            let folded = self.locations.contains_key(row_id);
            match (&slot.entry, folded) {
                (OverlayEntry::Put { .. }, false) => live += 1,
                (OverlayEntry::Delete { .. }, true) => live -= 1,
                _ => {}
            }
        }
        live.max(0) as u64
    }
}

struct HybridInner {
    path: PathBuf,
    pager: Mutex<PageFile>,
    committer: GroupCommitter,
    state: RwLock<HybridState>,
    /// Writers hold it shared; compaction holds it exclusively so the WAL is quiet.
    gate: RwLock<()>,
    /// Serializes update and delete of one row from the existence check
    /// through the WAL append.
    row_locks: Vec<Mutex<()>>,
    max_row_len: usize,
    vacuum_threshold: usize,
}

struct Compactor {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// WAL-first engine: writes are group-committed to `<path>.wal` and kept in an
/// in-memory overlay; reads consult the overlay before the page file.
///
/// Rows are addressed by a logical id ([`RowRef::Row`]) that survives
/// compaction. Page rows carry the id and a fold generation as a prefix so the
/// id map is rebuilt from the pages on open, then the WAL is replayed on top.
/// If an interrupted fold left two copies of a row on disk, the copy with the
/// newer generation wins and the other slot is removed.
pub struct HybridEngine {
    inner: Arc<HybridInner>,
    compactor: Mutex<Option<Compactor>>,
}

impl HybridEngine {
    /// Opens the page file at `path` and its log at `<path>.wal`, replaying the log.
    pub fn open(path: &Path, options: &EngineOptions) -> Result<Self> {
        let mut pager = open_page_file(path, options)?;
        let mut state = HybridState::default();
        let mut max_id = 0u64;
        let mut generations: FxHashMap<u64, u64> = FxHashMap::default();
        let mut stale = Vec::new();
        let ids: Vec<PageId> = pager.page_ids().collect();
        for id in ids {
            let rows = pager.read(id, |p| {
                (0..p.slot_count())
                    .filter_map(|slot| match p.get(slot) {
                        SlotContent::Row { table, data, .. } => {
                            decode_row_prefix(data)
                                .map(|(row_id, generation)| (row_id, generation, table, slot))
                        }
                        _ => None,
                    })
                    .collect::<Vec<_>>()
            })?;
            for (row_id, generation, table, slot) in rows {
                max_id = max_id.max(row_id);
                state.generation = state.generation.max(generation);
                let loc = PageLoc { table, page: id, slot };
                match generations.get(&row_id) {
                    Some(&kept) if kept >= generation => stale.push(loc),
                    Some(_) => {
                        if let Some(old) = state.locations.insert(row_id, loc) {
                            stale.push(old);
                        }
                        generations.insert(row_id, generation);
                    }
                    None => {
                        state.locations.insert(row_id, loc);
                        generations.insert(row_id, generation);
                    }
                }
            }
        }
        if !stale.is_empty() {
            warn!(path = %path.display(), copies = stale.len(), "hybrid.open.stale_copies");
            for loc in &stale {
                remove_slot(&mut pager, loc.page, loc.slot)?;
            }
            pager.checkpoint()?;
        }

        let wal_path = wal_path(path);
        let wal = Wal::open(
            Arc::new(StdFileIo::open(&wal_path)?),
            WalOptions::encrypted(Arc::clone(&options.cipher), Arc::clone(&options.pool)),
        )?;
        let report = wal.recover(|record| {
            let row_id = replay_record(&mut state, record)?;
            max_id = max_id.max(row_id);
            Ok(())
        })?;
        state.next_row_id = pager.next_row_id().max(max_id + 1);
        let max_row_len = pager.max_row_len().saturating_sub(ROW_PREFIX_LEN);
        let committer = GroupCommitter::with_metrics(
            Arc::new(wal),
            options.commit,
            Arc::clone(&options.metrics),
        )?;
        info!(
            path = %path.display(),
            folded_rows = state.locations.len(),
            replayed = report.records_replayed,
            overlay = state.overlay.len(),
            "hybrid.open"
        );

        let inner = Arc::new(HybridInner {
            path: path.to_path_buf(),
            pager: Mutex::new(pager),
            committer,
            state: RwLock::new(state),
            gate: RwLock::new(()),
            row_locks: (0..ROW_LOCK_STRIPES).map(|_| Mutex::new(())).collect(),
            max_row_len,
            vacuum_threshold: options.vacuum_threshold_entries.max(1),
        });
        let compactor = match options.vacuum_interval {
            Some(interval) => Some(spawn_compactor(&inner, interval)?),
            None => None,
        };
        Ok(Self {
            inner,
            compactor: Mutex::new(compactor),
        })
    }

    /// Inserts several rows with one atomic WAL group.
    pub fn insert_many<R: AsRef<[u8]>>(&self, table: TableId, rows: &[R]) -> Result<Vec<RowRef>> {
        if rows.is_empty() {
            return Ok(Vec::new());
        }
        let inner = &self.inner;
        for row in rows {
            inner.check_len(row.as_ref())?;
        }
        let _gate = inner.gate.read();
        let first = {
            let mut state = inner.state.write();
            let first = state.next_row_id;
            state.next_row_id += rows.len() as u64;
            first
        };
        let entries = rows
            .iter()
            .enumerate()
            .map(|(i, row)| {
                WalEntry::new(
                    WalOp::Insert,
                    encode_payload(first + i as u64, table, row.as_ref()),
                )
            })
            .collect::<Vec<_>>();
        let count = entries.len() as u64;
        let receipt = inner.committer.commit_group(entries)?;
        // A group of n records is followed by its commit marker.
        let first_seq = if count > 1 {
            receipt.seq.0 - count
        } else {
            receipt.seq.0
        };
        let mut state = inner.state.write();
        let mut refs = Vec::with_capacity(rows.len());
        for (i, row) in rows.iter().enumerate() {
            let row_id = first + i as u64;
            state.apply(
                row_id,
                Lsn(first_seq + i as u64),
                OverlayEntry::Put {
                    table,
                    data: row.as_ref().to_vec(),
                },
            );
            refs.push(RowRef::Row(row_id));
        }
        Ok(refs)
    }

    /// Entries waiting to be folded into pages.
    pub fn overlay_len(&self) -> usize {
        self.inner.state.read().overlay.len()
    }

    /// Blocks until every accepted write is synced to the WAL.
    pub fn flush(&self) -> Result<()> {
        self.inner.committer.flush()
    }

    /// The failure message of a prior WAL flush, if the log is poisoned.
    pub fn wal_failure(&self) -> Option<String> {
        self.inner.committer.failure()
    }
}

impl Drop for HybridEngine {
    fn drop(&mut self) {
        if let Some(compactor) = self.compactor.lock().take() {
            drop(compactor.stop);
            if compactor.handle.join().is_err() {
                error!("hybrid.compactor.panicked");
            }
        }
        if let Err(err) = self.inner.committer.shutdown() {
            error!(error = %err, "hybrid.close.wal_shutdown_failed");
        }
    }
}

impl HybridInner {
    fn check_len(&self, row: &[u8]) -> Result<()> {
        if row.len() > self.max_row_len {
            return Err(SealError::CapacityExceeded("row larger than a page"));
        }
        Ok(())
    }

    fn row_lock(&self, row_id: u64) -> MutexGuard<'_, ()> {
        self.row_locks[(row_id % ROW_LOCK_STRIPES as u64) as usize].lock()
    }

    fn log(&self, op: WalOp, row_id: u64, table: TableId, data: &[u8]) -> Result<Lsn> {
        let receipt = self
            .committer
            .commit(WalEntry::new(op, encode_payload(row_id, table, data)))?;
        Ok(receipt.seq)
    }

    fn vacuum(&self) -> Result<VacuumReport> {
        let _gate = self.gate.write();
        self.committer.flush()?;
        let mut state = self.state.write();
        let mut pager = self.pager.lock();
        let mut pending: Vec<(u64, OverlaySlot)> = state
            .overlay
            .iter()
            .map(|(row_id, slot)| (*row_id, slot.clone()))
            .collect();
        pending.sort_unstable_by_key(|(row_id, _)| *row_id);

        state.generation += 1;
        let generation = state.generation;
        let mut tables = FxHashSet::default();
        let mut record = Vec::new();
        for (row_id, slot) in &pending {
            tables.insert(slot.entry.table());
            match &slot.entry {
                OverlayEntry::Put { table, data } => {
                    record.clear();
                    record.extend_from_slice(&row_id.to_be_bytes());
                    record.extend_from_slice(&generation.to_be_bytes());
                    record.extend_from_slice(data);
                    if let Some(loc) = state.locations.get(row_id).copied() {
                        let table = *table;
                        if pager.write(loc.page, |p| p.replace(loc.slot, table, &record))? {
                            state.locations.insert(*row_id, PageLoc { table, ..loc });
                            continue;
                        }
                        remove_slot(&mut pager, loc.page, loc.slot)?;
                    }
                    let (page, slot) = place_row(&mut pager, *table, &record, false, None)?;
                    state.locations.insert(
                        *row_id,
                        PageLoc {
                            table: *table,
                            page,
                            slot,
                        },
                    );
                }
                OverlayEntry::Delete { .. } => {
                    if let Some(loc) = state.locations.remove(row_id) {
                        remove_slot(&mut pager, loc.page, loc.slot)?;
                    }
                }
            }
        }
        pager.set_next_row_id(state.next_row_id);
        pager.checkpoint()?;
        let reclaimed = self.committer.wal().reset()?;
        state.overlay.clear();
        let report = VacuumReport {
            bytes_reclaimed: reclaimed,
            tables_compacted: tables.len(),
            entries_folded: pending.len() as u64,
            refs_invalidated: 0,
        };
        info!(
            path = %self.path.display(),
            folded = report.entries_folded,
            tables = report.tables_compacted,
            reclaimed = report.bytes_reclaimed,
            "hybrid.vacuum"
        );
        Ok(report)
    }
}

impl StorageEngine for HybridEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Hybrid
    }

    fn insert(&self, table: TableId, row: &[u8]) -> Result<RowRef> {
        let inner = &self.inner;
        inner.check_len(row)?;
        let _gate = inner.gate.read();
        let row_id = {
            let mut state = inner.state.write();
            let row_id = state.next_row_id;
            state.next_row_id += 1;
            row_id
        };
        let seq = inner.log(WalOp::Insert, row_id, table, row)?;
        inner.state.write().apply(
            row_id,
            seq,
            OverlayEntry::Put {
                table,
                data: row.to_vec(),
            },
        );
        Ok(RowRef::Row(row_id))
    }

    fn read(&self, table: TableId, row: RowRef) -> Result<Option<Vec<u8>>> {
        let RowRef::Row(row_id) = row else {
            return Ok(None);
        };
        let state = self.inner.state.read();
        match state.overlay.get(&row_id) {
            Some(OverlaySlot {
                entry: OverlayEntry::Put { table: owner, data },
                ..
            }) => return Ok((*owner == table).then(|| data.clone())),
            Some(_) => return Ok(None),
            None => {}
        }
        let Some(loc) = state.locations.get(&row_id).copied() else {
            return Ok(None);
        };
        if loc.table != table {
            return Ok(None);
        }
        let mut pager = self.inner.pager.lock();
        let Some(mut bytes) = read_row(&mut pager, loc.page, loc.slot)? else {
            return Err(SealError::Corruption("hybrid row location points at an empty slot"));
        };
        if decode_row_prefix(&bytes).map(|(id, _)| id) != Some(row_id) {
            return Err(SealError::Corruption("hybrid row id prefix mismatch"));
        }
        bytes.drain(..ROW_PREFIX_LEN);
        Ok(Some(bytes))
    }

    fn update(&self, table: TableId, row: RowRef, data: &[u8]) -> Result<()> {
        let RowRef::Row(row_id) = row else {
            return Err(SealError::NotFound);
        };
        let inner = &self.inner;
        inner.check_len(data)?;
        let _gate = inner.gate.read();
        let _row = inner.row_lock(row_id);
        if inner.state.read().current_table(row_id) != Some(table) {
            return Err(SealError::NotFound);
        }
        let seq = inner.log(WalOp::Update, row_id, table, data)?;
        inner.state.write().apply(
            row_id,
            seq,
            OverlayEntry::Put {
                table,
                data: data.to_vec(),
            },
        );
        Ok(())
    }

    fn delete(&self, table: TableId, row: RowRef) -> Result<()> {
        let RowRef::Row(row_id) = row else {
            return Err(SealError::NotFound);
        };
        let inner = &self.inner;
        let _gate = inner.gate.read();
        let _row = inner.row_lock(row_id);
        if inner.state.read().current_table(row_id) != Some(table) {
            return Err(SealError::NotFound);
        }
        let seq = inner.log(WalOp::Delete, row_id, table, &[])?;
        inner
            .state
            .write()
            .apply(row_id, seq, OverlayEntry::Delete { table });
        Ok(())
    }

    fn scan(&self, table: TableId, visit: &mut ScanVisitor<'_>) -> Result<()> {
        let rows = {
            let state = self.inner.state.read();
            let mut folded: Vec<(u64, PageLoc)> = state
                .locations
                .iter()
                .filter(|(row_id, loc)| loc.table == table && !state.overlay.contains_key(row_id))
                .map(|(row_id, loc)| (*row_id, *loc))
                .collect();
            folded.sort_unstable_by_key(|(_, loc)| (loc.page, loc.slot));
            let mut rows = Vec::with_capacity(folded.len());
            let mut pager = self.inner.pager.lock();
            for (row_id, loc) in folded {
                if let Some(mut bytes) = read_row(&mut pager, loc.page, loc.slot)? {
                    bytes.drain(..ROW_PREFIX_LEN.min(bytes.len()));
                    rows.push((row_id, bytes));
                }
            }
            drop(pager);
            let mut pending: Vec<(u64, Vec<u8>)> = state
                .overlay
                .iter()
                .filter_map(|(row_id, slot)| match &slot.entry {
                    OverlayEntry::Put { table: owner, data } if *owner == table => {
                        Some((*row_id, data.clone()))
                    }
                    _ => None,
                })
                .collect();
            pending.sort_unstable_by_key(|(row_id, _)| *row_id);
            rows.extend(pending);
            rows
        };
        for (row_id, data) in rows {
            if visit(RowRef::Row(row_id), &data)? == ScanControl::Stop {
                break;
            }
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.inner.committer.flush()?;
        self.inner.pager.lock().checkpoint()?;
        Ok(())
    }

    /// Folds the overlay into pages and empties the WAL.
    fn vacuum(&self) -> Result<VacuumReport> {
        self.inner.vacuum()
    }

    fn stats(&self) -> EngineStats {
        let inner = &self.inner;
        let (overlay_entries, live_rows) = {
            let state = inner.state.read();
            (state.overlay.len(), state.live_rows())
        };
        let pager = inner.pager.lock();
        EngineStats {
            kind: EngineKind::Hybrid,
            file_bytes: pager.storage().len().unwrap_or(0),
            live_rows: Some(live_rows),
            pager: Some(pager.stats()),
            wal: Some(inner.committer.wal().stats()),
            overlay_entries,
            wal_failure: inner.committer.failure(),
            corrupt_units: 0,
        }
    }
}

fn spawn_compactor(inner: &Arc<HybridInner>, interval: Duration) -> Result<Compactor> {
    let (stop, rx) = mpsc::channel::<()>();
    let weak: Weak<HybridInner> = Arc::downgrade(inner);
    let handle = thread::Builder::new()
        .name("sealdb-hybrid-vacuum".into())
        .spawn(move || loop {
            match rx.recv_timeout(interval) {
                Err(RecvTimeoutError::Timeout) => {}
                _ => break,
            }
            let Some(inner) = weak.upgrade() else {
                break;
            };
            let backlog = inner.state.read().overlay.len();
            if backlog < inner.vacuum_threshold {
                continue;
            }
            match inner.vacuum() {
                Ok(report) => debug!(folded = report.entries_folded, "hybrid.compactor.tick"),
                Err(err) => warn!(error = %err, "hybrid.compactor.failed"),
            }
        })?;
    Ok(Compactor { stop, handle })
}

/// Applies one recovered WAL record to the overlay and returns its row id.
fn replay_record(state: &mut HybridState, record: &WalRecord) -> Result<u64> {
    let (row_id, table, data) = decode_payload(&record.payload)
        .ok_or(SealError::Corruption("hybrid wal payload malformed"))?;
    let entry = match record.op {
        WalOp::Insert | WalOp::Update => OverlayEntry::Put {
            table,
            data: data.to_vec(),
        },
        WalOp::Delete => OverlayEntry::Delete { table },
        WalOp::Commit => return Ok(row_id),
    };
    state.apply(row_id, record.seq, entry);
    Ok(row_id)
}

fn wal_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_owned();
    os.push(".wal");
    PathBuf::from(os)
}

fn encode_payload(row_id: u64, table: TableId, data: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PAYLOAD_HEADER_LEN + data.len());
    out.extend_from_slice(&row_id.to_be_bytes());
    out.extend_from_slice(&table.0.to_be_bytes());
    out.extend_from_slice(data);
    out
}

fn decode_payload(payload: &[u8]) -> Option<(u64, TableId, &[u8])> {
    if payload.len() < PAYLOAD_HEADER_LEN {
        return None;
    }
    let row_id = read_row_id(payload);
    let table = TableId(u32::from_be_bytes(payload[8..12].try_into().ok()?));
    Some((row_id, table, &payload[PAYLOAD_HEADER_LEN..]))
}

fn read_row_id(bytes: &[u8]) -> u64 {
    let mut raw = [0u8; ROW_ID_LEN];
    raw.copy_from_slice(&bytes[..ROW_ID_LEN]);
    u64::from_be_bytes(raw)
}

/// Row id and fold generation of a page row.
fn decode_row_prefix(bytes: &[u8]) -> Option<(u64, u64)> {
    if bytes.len() < ROW_PREFIX_LEN {
        return None;
    }
    let generation = u64::from_be_bytes(bytes[ROW_ID_LEN..ROW_PREFIX_LEN].try_into().ok()?);
    Some((read_row_id(bytes), generation))
}
