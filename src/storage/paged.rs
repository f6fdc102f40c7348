use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use rustc_hash::FxHashSet;
use tracing::{debug, error, info};

use super::{EngineKind, EngineOptions, EngineStats, ScanVisitor, StorageEngine, VacuumReport};
use crate::primitives::io::StdFileIo;
use crate::primitives::pager::{PageFile, PagerStats, SlotContent};
use crate::primitives::storage::{EncryptedStorage, ScanControl};
use crate::types::{PageId, Result, RowRef, SealError, TableId};

/// Where a row's bytes currently live.
#[derive(Clone, Copy, Debug)]
struct Target {
    page: PageId,
    slot: u16,
    forwarded: bool,
}

/// Page-based engine with in-place updates.
///
/// Rows are addressed by `(page, slot)`. An update that outgrows its page moves
/// the row and leaves a forwarding stub, so the reference stays valid. Deleting
/// the last row of a page puts the page on the free list.
pub struct PagedEngine {
    path: PathBuf,
    pager: Mutex<PageFile>,
}

impl PagedEngine {
    /// Opens or creates the page file at `path`.
    pub fn open(path: &Path, options: &EngineOptions) -> Result<Self> {
        let pager = open_page_file(path, options)?;
        info!(path = %path.display(), pages = pager.page_count(), "paged.open");
        Ok(Self {
            path: path.to_path_buf(),
            pager: Mutex::new(pager),
        })
    }

    /// Page cache statistics.
    pub fn pager_stats(&self) -> PagerStats {
        self.pager.lock().stats()
    }
}

impl Drop for PagedEngine {
    fn drop(&mut self) {
        if let Err(err) = self.pager.get_mut().checkpoint() {
            error!(path = %self.path.display(), error = %err, "paged.close.checkpoint_failed");
        }
    }
}

impl StorageEngine for PagedEngine {
    fn kind(&self) -> EngineKind {
        EngineKind::Paged
    }

    fn insert(&self, table: TableId, row: &[u8]) -> Result<RowRef> {
        let mut pager = self.pager.lock();
        let (page, slot) = place_row(&mut pager, table, row, false, None)?;
        Ok(RowRef::Slot { page, slot })
    }

    fn read(&self, table: TableId, row: RowRef) -> Result<Option<Vec<u8>>> {
        let RowRef::Slot { page, slot } = row else {
            return Ok(None);
        };
        let mut pager = self.pager.lock();
        let Some(target) = resolve(&mut pager, table, page, slot)? else {
            return Ok(None);
        };
        read_row(&mut pager, target.page, target.slot)
    }

    fn update(&self, table: TableId, row: RowRef, data: &[u8]) -> Result<()> {
        let RowRef::Slot { page, slot } = row else {
            return Err(SealError::NotFound);
        };
        let mut pager = self.pager.lock();
        let Some(target) = resolve(&mut pager, table, page, slot)? else {
            return Err(SealError::NotFound);
        };
        if data.len() > pager.max_row_len() {
            return Err(SealError::CapacityExceeded("row larger than a page"));
        }
        if pager.write(target.page, |p| p.replace(target.slot, table, data))? {
            return Ok(());
        }
        if target.forwarded {
            remove_slot(&mut pager, target.page, target.slot)?;
        }
        let (new_page, new_slot) = place_row(&mut pager, table, data, true, Some(page))?;
        pager.write(page, |p| p.set_forward(slot, table, new_page, new_slot))?;
        debug!(
            from = %row,
            to_page = new_page.0,
            to_slot = new_slot,
            "paged.update.forward"
        );
        Ok(())
    }

    fn delete(&self, table: TableId, row: RowRef) -> Result<()> {
        let RowRef::Slot { page, slot } = row else {
            return Err(SealError::NotFound);
        };
        let mut pager = self.pager.lock();
        let Some(target) = resolve(&mut pager, table, page, slot)? else {
            return Err(SealError::NotFound);
        };
        if target.forwarded {
            remove_slot(&mut pager, target.page, target.slot)?;
        }
        remove_slot(&mut pager, page, slot)?;
        Ok(())
    }

    fn scan(&self, table: TableId, visit: &mut ScanVisitor<'_>) -> Result<()> {
        let mut id = 1u32;
        loop {
            let rows = {
                let mut pager = self.pager.lock();
                if id >= pager.page_count() {
                    break;
                }
                collect_page_rows(&mut pager, table, PageId(id))?
            };
            for (row, data) in rows {
                if visit(row, &data)? == ScanControl::Stop {
                    return Ok(());
                }
            }
            id += 1;
        }
        Ok(())
    }

    fn checkpoint(&self) -> Result<()> {
        self.pager.lock().checkpoint()?;
        Ok(())
    }

    /// Moves forwarded rows back into their home page where room has opened up.
    fn vacuum(&self) -> Result<VacuumReport> {
        let mut pager = self.pager.lock();
        let mut folded = 0u64;
        let mut tables = FxHashSet::default();
        let ids: Vec<PageId> = pager.page_ids().collect();
        for id in ids {
            let stubs: Vec<(u16, TableId, PageId, u16)> = pager.read(id, |p| {
                (0..p.slot_count())
                    .filter_map(|slot| match p.get(slot) {
                        SlotContent::Forward { table, page, slot: target } => {
                            Some((slot, table, page, target))
                        }
                        _ => None,
                    })
                    .collect()
            })?;
            for (slot, table, target_page, target_slot) in stubs {
                let Some(data) = read_row(&mut pager, target_page, target_slot)? else {
                    continue;
                };
                if pager.write(id, |p| p.replace(slot, table, &data))? {
                    remove_slot(&mut pager, target_page, target_slot)?;
                    folded += 1;
                    tables.insert(table);
                }
            }
        }
        pager.checkpoint()?;
        info!(path = %self.path.display(), folded, "paged.vacuum");
        Ok(VacuumReport {
            bytes_reclaimed: 0,
            tables_compacted: tables.len(),
            entries_folded: folded,
            refs_invalidated: 0,
        })
    }

    fn stats(&self) -> EngineStats {
        let pager = self.pager.lock();
        EngineStats {
            kind: EngineKind::Paged,
            file_bytes: pager.storage().len().unwrap_or(0),
            pager: Some(pager.stats()),
            ..EngineStats::default()
        }
    }
}

pub(crate) fn open_page_file(path: &Path, options: &EngineOptions) -> Result<PageFile> {
    let io = Arc::new(StdFileIo::open(path)?);
    let storage = EncryptedStorage::new(io, Arc::clone(&options.cipher), Arc::clone(&options.pool));
    PageFile::open(storage, options.pager, Arc::clone(&options.metrics))
}

/// Stores a record on the active page, a reused free page or a new page.
///
/// `avoid` keeps a relocated row off the page it is leaving.
pub(crate) fn place_row(
    pager: &mut PageFile,
    table: TableId,
    data: &[u8],
    moved: bool,
    avoid: Option<PageId>,
) -> Result<(PageId, u16)> {
    if data.len() > pager.max_row_len() {
        return Err(SealError::CapacityExceeded("row larger than a page"));
    }
    let insert = |page: &mut crate::primitives::pager::Page| {
        if moved {
            page.insert_moved(table, data)
        } else {
            page.insert(table, data)
        }
    };
    if let Some(active) = pager.active_page() {
        if Some(active) != avoid && pager.read(active, |p| p.fits(data.len()))? {
            if let Some(slot) = pager.write(active, insert)? {
                return Ok((active, slot));
            }
        }
    }
    let page = pager.allocate()?;
    let slot = pager
        .write(page, insert)?
        .ok_or(SealError::CapacityExceeded("row larger than a page"))?;
    pager.set_active_page(Some(page));
    Ok((page, slot))
}

/// Frees a slot and releases its page once the page holds nothing.
pub(crate) fn remove_slot(pager: &mut PageFile, page: PageId, slot: u16) -> Result<bool> {
    let (removed, empty) = pager.write(page, |p| {
        let removed = p.remove(slot);
        (removed, p.is_empty())
    })?;
    if removed && empty {
        pager.release(page)?;
    }
    Ok(removed)
}

/// Copies the row bytes stored in a slot.
pub(crate) fn read_row(pager: &mut PageFile, page: PageId, slot: u16) -> Result<Option<Vec<u8>>> {
    pager.read(page, |p| match p.get(slot) {
        SlotContent::Row { data, .. } => Some(data.to_vec()),
        _ => None,
    })
}

fn resolve(pager: &mut PageFile, table: TableId, page: PageId, slot: u16) -> Result<Option<Target>> {
    if page.0 == 0 || page.0 >= pager.page_count() {
        return Ok(None);
    }
    let target = pager.read(page, |p| match p.get(slot) {
        SlotContent::Row {
            table: owner,
            moved: false,
            ..
        } if owner == table => Some(Target {
            page,
            slot,
            forwarded: false,
        }),
        SlotContent::Forward {
            table: owner,
            page: target_page,
            slot: target_slot,
        } if owner == table => Some(Target {
            page: target_page,
            slot: target_slot,
            forwarded: true,
        }),
        _ => None,
    })?;
    if let Some(target) = target.filter(|t| t.forwarded) {
        let valid = target.page.0 != 0
            && target.page.0 < pager.page_count()
            && pager.read(target.page, |p| {
                matches!(p.get(target.slot), SlotContent::Row { table: owner, moved: true, .. } if owner == table)
            })?;
        if !valid {
            return Err(SealError::Corruption("forwarding stub points at a missing row"));
        }
    }
    Ok(target)
}

fn collect_page_rows(
    pager: &mut PageFile,
    table: TableId,
    id: PageId,
) -> Result<Vec<(RowRef, Vec<u8>)>> {
    let mut forwards = Vec::new();
    let mut rows = pager.read(id, |p| {
        let mut rows = Vec::new();
        for slot in 0..p.slot_count() {
            match p.get(slot) {
                SlotContent::Row {
                    table: owner,
                    data,
                    moved: false,
                } if owner == table => rows.push((RowRef::Slot { page: id, slot }, data.to_vec())),
                SlotContent::Forward {
                    table: owner,
                    page,
                    slot: target,
                } if owner == table => forwards.push((slot, page, target)),
                _ => {}
            }
        }
        rows
    })?;
    for (slot, page, target) in forwards {
        if let Some(data) = read_row(pager, page, target)? {
            rows.push((RowRef::Slot { page: id, slot }, data));
        }
    }
    Ok(rows)
}
