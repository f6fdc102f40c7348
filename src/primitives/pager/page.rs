use std::ops::Range;

use crate::types::{PageId, Result, SealError, TableId};

/// Length of the page header.
pub const PAGE_HEADER_LEN: usize = 16;
/// Length of one slot directory entry.
pub const SLOT_ENTRY_LEN: usize = 8;
/// Smallest space reserved for a record, large enough to hold a forwarding stub.
pub const MIN_RECORD_LEN: usize = 12;
/// Table id prefix stored in front of every record.
pub const RECORD_PREFIX_LEN: usize = 4;

const HDR_PAGE_ID: Range<usize> = 0..4;
const HDR_FREE_NEXT: Range<usize> = 4..8;
const HDR_SLOT_COUNT: Range<usize> = 8..10;
const HDR_FLAGS: usize = 10;
const HDR_KIND: usize = 11;
const HDR_DATA_START: Range<usize> = 12..14;
const HDR_LIVE_COUNT: Range<usize> = 14..16;

const FLAG_DIRTY: u8 = 0x1;

const SLOT_VACANT: u16 = 0;
const SLOT_LIVE: u16 = 0x1;
const SLOT_FORWARD: u16 = 0x2;
const SLOT_MOVED: u16 = 0x4;

/// What a page is used for.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PageKind {
    /// On the free list.
    Free,
    /// Holds slotted rows.
    Data,
}

impl PageKind {
    fn as_u8(self) -> u8 {
        match self {
            PageKind::Free => 0,
            PageKind::Data => 1,
        }
    }
}

/// Decoded contents of one slot.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum SlotContent<'a> {
    /// Nothing stored.
    Vacant,
    /// A row. `moved` rows are reachable only through a forwarding stub.
    Row {
        /// Owning table.
        table: TableId,
        /// Row bytes.
        data: &'a [u8],
        /// True for rows relocated here from another page.
        moved: bool,
    },
    /// A stub pointing at the row's current location.
    Forward {
        /// Owning table.
        table: TableId,
        /// Page holding the row.
        page: PageId,
        /// Slot holding the row.
        slot: u16,
    },
}

#[derive(Clone, Copy, Debug)]
struct SlotEntry {
    off: u16,
    len: u16,
    cap: u16,
    flags: u16,
}

/// A decrypted slotted page.
///
/// Layout: 16-byte header, slot directory growing upward, record bytes growing
/// downward from the end. Records are kept packed, so the gap between the slot
/// directory and the lowest record is all the free space the page has.
#[derive(Clone)]
pub struct Page {
    buf: Vec<u8>,
}

impl Page {
    /// Creates an empty data page of `size` plaintext bytes.
    pub fn new(id: PageId, size: usize) -> Self {
        let mut page = Self { buf: vec![0u8; size] };
        page.buf[HDR_PAGE_ID].copy_from_slice(&id.0.to_be_bytes());
        page.reset();
        page
    }

    /// Wraps decrypted page bytes, validating the header.
    pub fn from_bytes(buf: Vec<u8>, expected: PageId) -> Result<Self> {
        if buf.len() < PAGE_HEADER_LEN || buf.len() > u16::MAX as usize + 1 {
            return Err(SealError::Corruption("page length out of range"));
        }
        let page = Self { buf };
        if page.id() != expected {
            return Err(SealError::Corruption("page id mismatch"));
        }
        let dir_end = page.dir_end();
        let data_start = page.data_start();
        if dir_end > data_start || data_start > page.buf.len() {
            return Err(SealError::Corruption("page slot directory overlaps data"));
        }
        for slot in 0..page.slot_count() {
            let entry = page.entry(slot);
            let end = entry.off as usize + entry.cap as usize;
            if entry.flags != SLOT_VACANT
                && ((entry.off as usize) < data_start || end > page.buf.len() || entry.len > entry.cap)
            {
                return Err(SealError::Corruption("page slot out of bounds"));
            }
        }
        Ok(page)
    }

    /// Raw plaintext bytes.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    /// Page id recorded in the header.
    pub fn id(&self) -> PageId {
        PageId(read_u32(&self.buf[HDR_PAGE_ID]))
    }

    /// Next page on the free list, or `None`.
    pub fn free_next(&self) -> Option<PageId> {
        match read_u32(&self.buf[HDR_FREE_NEXT]) {
            0 => None,
            id => Some(PageId(id)),
        }
    }

    /// Sets the free-list link.
    pub fn set_free_next(&mut self, next: Option<PageId>) {
        let raw = next.map_or(0, |id| id.0);
        self.buf[HDR_FREE_NEXT].copy_from_slice(&raw.to_be_bytes());
    }

    /// Number of slot directory entries, vacant ones included.
    pub fn slot_count(&self) -> u16 {
        read_u16(&self.buf[HDR_SLOT_COUNT])
    }

    /// Occupied slots: rows, stubs and moved rows.
    pub fn live_count(&self) -> u16 {
        read_u16(&self.buf[HDR_LIVE_COUNT])
    }

    /// True when no slot is occupied.
    pub fn is_empty(&self) -> bool {
        self.live_count() == 0
    }

    /// Page kind.
    pub fn kind(&self) -> PageKind {
        match self.buf[HDR_KIND] {
            0 => PageKind::Free,
            _ => PageKind::Data,
        }
    }

    /// Sets the page kind.
    pub fn set_kind(&mut self, kind: PageKind) {
        self.buf[HDR_KIND] = kind.as_u8();
    }

    /// True when the page holds changes not yet written to disk.
    pub fn is_dirty(&self) -> bool {
        self.buf[HDR_FLAGS] & FLAG_DIRTY != 0
    }

    /// Sets or clears the dirty flag.
    pub fn set_dirty(&mut self, dirty: bool) {
        if dirty {
            self.buf[HDR_FLAGS] |= FLAG_DIRTY;
        } else {
            self.buf[HDR_FLAGS] &= !FLAG_DIRTY;
        }
    }

    /// Drops every slot and record. Keeps the id.
    pub fn reset(&mut self) {
        let size = self.buf.len();
        self.buf[HDR_FREE_NEXT.start..].fill(0);
        self.set_kind(PageKind::Data);
        self.set_data_start(size);
    }

    /// Bytes available for one more record, accounting for a new slot entry if needed.
    pub fn free_space(&self) -> usize {
        let gap = self.data_start() - self.dir_end();
        if self.vacant_slot().is_some() {
            gap
        } else {
            gap.saturating_sub(SLOT_ENTRY_LEN)
        }
    }

    /// Largest row that fits in an empty page of `size` plaintext bytes.
    pub const fn max_row_len(size: usize) -> usize {
        size - PAGE_HEADER_LEN - SLOT_ENTRY_LEN - RECORD_PREFIX_LEN
    }

    /// True when a row of `len` bytes can be inserted.
    pub fn fits(&self, len: usize) -> bool {
        record_cap(len) <= self.free_space()
    }

    /// Stores a row and returns its slot.
    pub fn insert(&mut self, table: TableId, data: &[u8]) -> Option<u16> {
        self.insert_record(table, data, SLOT_LIVE)
    }

    /// Stores a row relocated from another page.
    pub fn insert_moved(&mut self, table: TableId, data: &[u8]) -> Option<u16> {
        self.insert_record(table, data, SLOT_MOVED)
    }

    /// Reads a slot.
    pub fn get(&self, slot: u16) -> SlotContent<'_> {
        if slot >= self.slot_count() {
            return SlotContent::Vacant;
        }
        let entry = self.entry(slot);
        if entry.flags == SLOT_VACANT {
            return SlotContent::Vacant;
        }
        let record = &self.buf[entry.off as usize..entry.off as usize + entry.len as usize];
        let table = TableId(read_u32(&record[..RECORD_PREFIX_LEN]));
        let body = &record[RECORD_PREFIX_LEN..];
        if entry.flags & SLOT_FORWARD != 0 {
            return SlotContent::Forward {
                table,
                page: PageId(read_u32(&body[0..4])),
                slot: read_u16(&body[4..6]),
            };
        }
        SlotContent::Row {
            table,
            data: body,
            moved: entry.flags & SLOT_MOVED != 0,
        }
    }

    /// Replaces the row in `slot`, keeping the slot number.
    ///
    /// Overwrites in place when the new row fits the reserved space, otherwise
    /// repacks the page to make room. Returns false when the page cannot hold it.
    pub fn replace(&mut self, slot: u16, table: TableId, data: &[u8]) -> bool {
        if slot >= self.slot_count() {
            return false;
        }
        let entry = self.entry(slot);
        if entry.flags == SLOT_VACANT {
            return false;
        }
        let flags = if entry.flags & SLOT_MOVED != 0 {
            SLOT_MOVED
        } else {
            SLOT_LIVE
        };
        let len = RECORD_PREFIX_LEN + data.len();
        if len <= entry.cap as usize {
            self.write_record(entry.off as usize, table, data);
            self.set_entry(
                slot,
                SlotEntry {
                    len: len as u16,
                    flags,
                    ..entry
                },
            );
            return true;
        }
        let gap = self.data_start() - self.dir_end();
        if gap + (entry.cap as usize) < record_cap(data.len()) {
            return false;
        }
        self.set_entry(slot, SlotEntry { off: 0, len: 0, cap: 0, flags: SLOT_VACANT });
        self.compact();
        self.place(slot, table, data, flags);
        true
    }

    /// Turns `slot` into a forwarding stub. The stub always fits any occupied slot.
    pub fn set_forward(&mut self, slot: u16, table: TableId, page: PageId, target: u16) {
        let entry = self.entry(slot);
        let off = entry.off as usize;
        self.buf[off..off + 4].copy_from_slice(&table.0.to_be_bytes());
        self.buf[off + 4..off + 8].copy_from_slice(&page.0.to_be_bytes());
        self.buf[off + 8..off + 10].copy_from_slice(&target.to_be_bytes());
        self.set_entry(
            slot,
            SlotEntry {
                len: (RECORD_PREFIX_LEN + 6) as u16,
                flags: SLOT_FORWARD,
                ..entry
            },
        );
    }

    /// Frees a slot and returns its space to the page immediately.
    pub fn remove(&mut self, slot: u16) -> bool {
        if slot >= self.slot_count() || self.entry(slot).flags == SLOT_VACANT {
            return false;
        }
        self.set_entry(slot, SlotEntry { off: 0, len: 0, cap: 0, flags: SLOT_VACANT });
        let mut count = self.slot_count();
        while count > 0 && self.entry(count - 1).flags == SLOT_VACANT {
            count -= 1;
        }
        self.set_slot_count(count);
        self.set_live_count(self.live_count() - 1);
        self.compact();
        true
    }

    fn insert_record(&mut self, table: TableId, data: &[u8], flags: u16) -> Option<u16> {
        if !self.fits(data.len()) {
            return None;
        }
        let slot = match self.vacant_slot() {
            Some(slot) => slot,
            None => {
                let slot = self.slot_count();
                self.set_slot_count(slot + 1);
                slot
            }
        };
        self.place(slot, table, data, flags);
        self.set_live_count(self.live_count() + 1);
        Some(slot)
    }

    fn place(&mut self, slot: u16, table: TableId, data: &[u8], flags: u16) {
        let cap = record_cap(data.len());
        let off = self.data_start() - cap;
        self.write_record(off, table, data);
        self.set_data_start(off);
        self.set_entry(
            slot,
            SlotEntry {
                off: off as u16,
                len: (RECORD_PREFIX_LEN + data.len()) as u16,
                cap: cap as u16,
                flags,
            },
        );
    }

    fn write_record(&mut self, off: usize, table: TableId, data: &[u8]) {
        self.buf[off..off + RECORD_PREFIX_LEN].copy_from_slice(&table.0.to_be_bytes());
        let start = off + RECORD_PREFIX_LEN;
        self.buf[start..start + data.len()].copy_from_slice(data);
    }

    /// Packs all records against the end of the page. Slot numbers are preserved.
    fn compact(&mut self) {
        let mut records: Vec<(u16, SlotEntry, Vec<u8>)> = Vec::new();
        for slot in 0..self.slot_count() {
            let entry = self.entry(slot);
            if entry.flags == SLOT_VACANT {
                continue;
            }
            let off = entry.off as usize;
            records.push((slot, entry, self.buf[off..off + entry.cap as usize].to_vec()));
        }
        let mut data_start = self.buf.len();
        for (slot, entry, bytes) in records {
            data_start -= bytes.len();
            self.buf[data_start..data_start + bytes.len()].copy_from_slice(&bytes);
            self.set_entry(
                slot,
                SlotEntry {
                    off: data_start as u16,
                    ..entry
                },
            );
        }
        let dir_end = self.dir_end();
        self.buf[dir_end..data_start].fill(0);
        self.set_data_start(data_start);
    }

    fn vacant_slot(&self) -> Option<u16> {
        (0..self.slot_count()).find(|&slot| self.entry(slot).flags == SLOT_VACANT)
    }

    fn dir_end(&self) -> usize {
        PAGE_HEADER_LEN + self.slot_count() as usize * SLOT_ENTRY_LEN
    }

    fn data_start(&self) -> usize {
        match read_u16(&self.buf[HDR_DATA_START]) {
            0 => self.buf.len(),
            raw => raw as usize,
        }
    }

    fn set_data_start(&mut self, value: usize) {
        // A full-size page stores its end as 0 since 65536 does not fit in u16.
        let raw = if value >= self.buf.len() { 0 } else { value as u16 };
        self.buf[HDR_DATA_START].copy_from_slice(&raw.to_be_bytes());
    }

    fn set_slot_count(&mut self, count: u16) {
        self.buf[HDR_SLOT_COUNT].copy_from_slice(&count.to_be_bytes());
    }

    fn set_live_count(&mut self, count: u16) {
        self.buf[HDR_LIVE_COUNT].copy_from_slice(&count.to_be_bytes());
    }

    fn entry(&self, slot: u16) -> SlotEntry {
        let base = PAGE_HEADER_LEN + slot as usize * SLOT_ENTRY_LEN;
        let raw = &self.buf[base..base + SLOT_ENTRY_LEN];
        SlotEntry {
            off: read_u16(&raw[0..2]),
            len: read_u16(&raw[2..4]),
            cap: read_u16(&raw[4..6]),
            flags: read_u16(&raw[6..8]),
        }
    }

    fn set_entry(&mut self, slot: u16, entry: SlotEntry) {
        let base = PAGE_HEADER_LEN + slot as usize * SLOT_ENTRY_LEN;
        let raw = &mut self.buf[base..base + SLOT_ENTRY_LEN];
        raw[0..2].copy_from_slice(&entry.off.to_be_bytes());
        raw[2..4].copy_from_slice(&entry.len.to_be_bytes());
        raw[4..6].copy_from_slice(&entry.cap.to_be_bytes());
        raw[6..8].copy_from_slice(&entry.flags.to_be_bytes());
    }
}

fn record_cap(data_len: usize) -> usize {
    (RECORD_PREFIX_LEN + data_len).max(MIN_RECORD_LEN)
}

fn read_u16(bytes: &[u8]) -> u16 {
    u16::from_be_bytes([bytes[0], bytes[1]])
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}
