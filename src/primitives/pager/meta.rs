use std::ops::Range;

use crate::types::{crc32, PageId, Result, SealError};

const META_MAGIC: [u8; 4] = *b"SLPG";
const META_FORMAT_VERSION: u16 = 1;

const META_MAGIC_RANGE: Range<usize> = 0..4;
const META_VERSION: Range<usize> = 4..6;
const META_RESERVED: Range<usize> = 6..8;
const META_PAGE_SIZE: Range<usize> = 8..12;
const META_PAGE_COUNT: Range<usize> = 12..16;
const META_FREE_HEAD: Range<usize> = 16..20;
const META_FREE_COUNT: Range<usize> = 20..24;
const META_ACTIVE_PAGE: Range<usize> = 24..28;
const META_RESERVED_2: Range<usize> = 28..32;
const META_NEXT_ROW_ID: Range<usize> = 32..40;
const META_CRC: Range<usize> = 40..44;
/// Bytes of page 0 used by the meta record.
pub const META_LEN: usize = 44;

/// File metadata stored in page 0.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Meta {
    /// Size of each on-disk page in bytes, seal overhead included.
    pub page_size: u32,
    /// Pages in the file, meta page included.
    pub page_count: u32,
    /// Head of the free-list chain.
    pub free_head: Option<PageId>,
    /// Pages currently on the free list.
    pub free_count: u32,
    /// Page receiving new inserts.
    pub active_page: Option<PageId>,
    /// High-water mark of the logical row id allocator.
    pub next_row_id: u64,
}

impl Meta {
    /// Metadata for a freshly created file.
    pub fn new(page_size: u32) -> Self {
        Self {
            page_size,
            page_count: 1,
            free_head: None,
            free_count: 0,
            active_page: None,
            next_row_id: 1,
        }
    }

    /// Encodes into the start of `buf` and zeroes the rest.
    pub fn encode(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() < META_LEN {
            return Err(SealError::Invalid("meta buffer too small"));
        }
        buf.fill(0);
        buf[META_MAGIC_RANGE].copy_from_slice(&META_MAGIC);
        buf[META_VERSION].copy_from_slice(&META_FORMAT_VERSION.to_be_bytes());
        buf[META_PAGE_SIZE].copy_from_slice(&self.page_size.to_be_bytes());
        buf[META_PAGE_COUNT].copy_from_slice(&self.page_count.to_be_bytes());
        buf[META_FREE_HEAD].copy_from_slice(&raw_page(self.free_head).to_be_bytes());
        buf[META_FREE_COUNT].copy_from_slice(&self.free_count.to_be_bytes());
        buf[META_ACTIVE_PAGE].copy_from_slice(&raw_page(self.active_page).to_be_bytes());
        buf[META_NEXT_ROW_ID].copy_from_slice(&self.next_row_id.to_be_bytes());
        let crc = crc32(&[&buf[..META_CRC.start]]);
        buf[META_CRC].copy_from_slice(&crc.to_be_bytes());
        Ok(())
    }

    /// Decodes and verifies a meta record.
    pub fn decode(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_LEN {
            return Err(SealError::Truncated("meta page truncated"));
        }
        if buf[META_MAGIC_RANGE] != META_MAGIC {
            return Err(SealError::Corruption("meta magic mismatch"));
        }
        let stored = u32::from_be_bytes(to_array(&buf[META_CRC]));
        if crc32(&[&buf[..META_CRC.start]]) != stored {
            return Err(SealError::Corruption("meta crc mismatch"));
        }
        if u16::from_be_bytes(to_array(&buf[META_VERSION])) != META_FORMAT_VERSION {
            return Err(SealError::Corruption("meta format version mismatch"));
        }
        if buf[META_RESERVED].iter().chain(&buf[META_RESERVED_2]).any(|b| *b != 0) {
            return Err(SealError::Corruption("meta reserved bytes non-zero"));
        }
        let meta = Self {
            page_size: u32::from_be_bytes(to_array(&buf[META_PAGE_SIZE])),
            page_count: u32::from_be_bytes(to_array(&buf[META_PAGE_COUNT])),
            free_head: opt_page(u32::from_be_bytes(to_array(&buf[META_FREE_HEAD]))),
            free_count: u32::from_be_bytes(to_array(&buf[META_FREE_COUNT])),
            active_page: opt_page(u32::from_be_bytes(to_array(&buf[META_ACTIVE_PAGE]))),
            next_row_id: u64::from_be_bytes(to_array(&buf[META_NEXT_ROW_ID])),
        };
        if meta.page_count == 0 {
            return Err(SealError::Corruption("meta page count is zero"));
        }
        for page in [meta.free_head, meta.active_page].into_iter().flatten() {
            if page.0 >= meta.page_count {
                return Err(SealError::Corruption("meta page pointer out of range"));
            }
        }
        Ok(meta)
    }
}

fn raw_page(page: Option<PageId>) -> u32 {
    page.map_or(0, |id| id.0)
}

fn opt_page(raw: u32) -> Option<PageId> {
    (raw != 0).then_some(PageId(raw))
}

fn to_array<const N: usize>(bytes: &[u8]) -> [u8; N] {
    let mut out = [0u8; N];
    out.copy_from_slice(bytes);
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn meta_roundtrip() -> Result<()> {
        let meta = Meta {
            page_size: 4096,
            page_count: 12,
            free_head: Some(PageId(4)),
            free_count: 2,
            active_page: Some(PageId(11)),
            next_row_id: 77,
        };
        let mut buf = vec![0xAAu8; 200];
        meta.encode(&mut buf)?;
        assert_eq!(Meta::decode(&buf)?, meta);
        Ok(())
    }

    #[test]
    fn meta_detects_bit_flip() -> Result<()> {
        let mut buf = vec![0u8; 64];
        Meta::new(4096).encode(&mut buf)?;
        buf[13] ^= 0x01;
        assert!(matches!(Meta::decode(&buf), Err(SealError::Corruption(_))));
        Ok(())
    }
}
