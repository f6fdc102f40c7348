use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use serde::Serialize;
use tracing::{debug, info};

use super::freelist::FreeList;
use super::meta::{Meta, META_LEN};
use super::page::Page;
use crate::primitives::crypto::SEAL_OVERHEAD;
use crate::primitives::storage::EncryptedStorage;
use crate::storage::metrics::StorageMetrics;
use crate::types::{PageId, Result, SealError};

/// Smallest supported page size.
pub const MIN_PAGE_SIZE: usize = 512;
/// Largest supported page size.
pub const MAX_PAGE_SIZE: usize = 64 * 1024;

/// Configuration options for a [`PageFile`].
#[derive(Clone, Copy, Debug)]
pub struct PagerOptions {
    /// On-disk page size, a power of two between 512 and 65536.
    pub page_size: usize,
    /// Maximum number of decrypted pages kept in memory.
    pub cache_capacity: usize,
}

impl Default for PagerOptions {
    fn default() -> Self {
        Self {
            page_size: 4096,
            cache_capacity: 1024,
        }
    }
}

impl PagerOptions {
    /// Checks the page size and cache capacity.
    pub fn validate(&self) -> Result<()> {
        if !self.page_size.is_power_of_two()
            || !(MIN_PAGE_SIZE..=MAX_PAGE_SIZE).contains(&self.page_size)
        {
            return Err(SealError::Invalid(
                "page size must be a power of two between 512 and 65536",
            ));
        }
        if self.cache_capacity == 0 {
            return Err(SealError::Invalid("page cache capacity must be at least 1"));
        }
        Ok(())
    }
}

/// Statistics for monitoring page cache behavior.
#[derive(Clone, Debug, Default, Eq, PartialEq, Serialize)]
pub struct PagerStats {
    /// Pages currently resident in the cache.
    pub resident_pages: usize,
    /// Resident pages with unwritten changes.
    pub dirty_pages: usize,
    /// Cache capacity in pages.
    pub cache_capacity: usize,
    /// Pages in the file, meta page included.
    pub page_count: u32,
    /// Pages on the free list.
    pub free_pages: u32,
    /// Page requests served from the cache.
    pub hits: u64,
    /// Page requests that read from disk.
    pub misses: u64,
    /// Pages evicted from the cache.
    pub evictions: u64,
    /// Dirty pages written on eviction.
    pub dirty_writebacks: u64,
}

/// Encrypted page file with an LRU cache of decrypted pages.
///
/// Page `n` is sealed at offset `n * page_size`; the plaintext of every page is
/// `page_size - SEAL_OVERHEAD` bytes. Page 0 holds the [`Meta`] record. Writes
/// only mark pages dirty; dirty pages reach disk when evicted or on
/// [`PageFile::checkpoint`].
pub struct PageFile {
    storage: EncryptedStorage,
    page_size: usize,
    plain_size: usize,
    cache: LruCache<PageId, Page>,
    meta: Meta,
    free: FreeList,
    metrics: Arc<dyn StorageMetrics>,
    stats: PagerStats,
}

impl PageFile {
    /// Opens an existing page file or initializes an empty one.
    pub fn open(
        storage: EncryptedStorage,
        options: PagerOptions,
        metrics: Arc<dyn StorageMetrics>,
    ) -> Result<Self> {
        options.validate()?;
        let page_size = options.page_size;
        let plain_size = page_size - SEAL_OVERHEAD;
        let capacity = NonZeroUsize::new(options.cache_capacity)
            .ok_or(SealError::Invalid("page cache capacity must be at least 1"))?;
        let meta = if storage.is_empty()? {
            let meta = Meta::new(page_size as u32);
            write_meta(&storage, plain_size, &meta)?;
            storage.sync()?;
            meta
        } else {
            let buf = storage.read_range(0, plain_size)?;
            let meta = Meta::decode(&buf[..META_LEN.min(buf.len())])?;
            if meta.page_size as usize != page_size {
                return Err(SealError::InvalidOwned(format!(
                    "page size mismatch: file uses {}, configured {}",
                    meta.page_size, page_size
                )));
            }
            meta
        };
        info!(
            page_size,
            page_count = meta.page_count,
            free_pages = meta.free_count,
            "pager.open"
        );
        Ok(Self {
            storage,
            page_size,
            plain_size,
            cache: LruCache::new(capacity),
            free: FreeList::new(meta.free_head, meta.free_count),
            meta,
            metrics,
            stats: PagerStats {
                cache_capacity: options.cache_capacity,
                ..PagerStats::default()
            },
        })
    }

    /// On-disk page size.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Decrypted bytes per page.
    pub fn plain_size(&self) -> usize {
        self.plain_size
    }

    /// Largest row a single page can hold.
    pub fn max_row_len(&self) -> usize {
        Page::max_row_len(self.plain_size)
    }

    /// Pages in the file, meta page included.
    pub fn page_count(&self) -> u32 {
        self.meta.page_count
    }

    /// Page currently receiving inserts.
    pub fn active_page(&self) -> Option<PageId> {
        self.meta.active_page
    }

    /// Sets the page receiving inserts.
    pub fn set_active_page(&mut self, page: Option<PageId>) {
        self.meta.active_page = page;
    }

    /// Persisted row id high-water mark.
    pub fn next_row_id(&self) -> u64 {
        self.meta.next_row_id
    }

    /// Updates the row id high-water mark; written on the next checkpoint.
    pub fn set_next_row_id(&mut self, next: u64) {
        self.meta.next_row_id = next;
    }

    /// Ids of all pages after the meta page.
    pub fn page_ids(&self) -> impl Iterator<Item = PageId> {
        (1..self.meta.page_count).map(PageId)
    }

    /// Runs `f` on a page.
    pub fn read<R>(&mut self, id: PageId, f: impl FnOnce(&Page) -> R) -> Result<R> {
        let page = self.fetch(id)?;
        Ok(f(page))
    }

    /// Runs `f` on a page and marks it dirty.
    pub fn write<R>(&mut self, id: PageId, f: impl FnOnce(&mut Page) -> R) -> Result<R> {
        let page = self.fetch(id)?;
        page.set_dirty(true);
        Ok(f(page))
    }

    /// Returns a page for new rows: the free-list head if any, else a new page at the end.
    pub fn allocate(&mut self) -> Result<PageId> {
        if let Some(head) = self.free.head() {
            let mut free = self.free;
            let page = self.fetch(head)?;
            free.pop(page)?;
            page.set_dirty(true);
            self.free = free;
            debug!(page = head.0, "pager.allocate.reuse");
            return Ok(head);
        }
        if self.meta.page_count == u32::MAX {
            return Err(SealError::CapacityExceeded("page id space exhausted"));
        }
        let id = PageId(self.meta.page_count);
        self.meta.page_count += 1;
        let mut page = Page::new(id, self.plain_size);
        page.set_dirty(true);
        self.admit(id, page)?;
        debug!(page = id.0, "pager.allocate.extend");
        Ok(id)
    }

    /// Pushes an empty page onto the free list.
    pub fn release(&mut self, id: PageId) -> Result<()> {
        let mut free = self.free;
        let page = self.fetch(id)?;
        if !page.is_empty() {
            return Err(SealError::Invalid("only empty pages can be released"));
        }
        free.push(page);
        page.set_dirty(true);
        self.free = free;
        if self.meta.active_page == Some(id) {
            self.meta.active_page = None;
        }
        debug!(page = id.0, free_pages = self.free.len(), "pager.release");
        Ok(())
    }

    /// Writes every dirty page and the meta page, then syncs. Returns pages written.
    pub fn checkpoint(&mut self) -> Result<usize> {
        let mut dirty: Vec<PageId> = self
            .cache
            .iter()
            .filter(|(_, page)| page.is_dirty())
            .map(|(id, _)| *id)
            .collect();
        dirty.sort_unstable();
        for id in &dirty {
            if let Some(page) = self.cache.peek_mut(id) {
                write_page(&self.storage, self.page_size, page)?;
            }
        }
        self.meta.free_head = self.free.head();
        self.meta.free_count = self.free.len();
        write_meta(&self.storage, self.plain_size, &self.meta)?;
        self.storage.sync()?;
        info!(pages = dirty.len(), page_count = self.meta.page_count, "pager.checkpoint");
        Ok(dirty.len())
    }

    /// Drops every cached page. Dirty pages are written first.
    pub fn clear_cache(&mut self) -> Result<()> {
        self.checkpoint()?;
        self.cache.clear();
        Ok(())
    }

    /// Returns a snapshot of cache and allocation statistics.
    pub fn stats(&self) -> PagerStats {
        PagerStats {
            resident_pages: self.cache.len(),
            dirty_pages: self.cache.iter().filter(|(_, page)| page.is_dirty()).count(),
            page_count: self.meta.page_count,
            free_pages: self.free.len(),
            ..self.stats.clone()
        }
    }

    /// Underlying encrypted file.
    pub fn storage(&self) -> &EncryptedStorage {
        &self.storage
    }

    fn fetch(&mut self, id: PageId) -> Result<&mut Page> {
        if id.0 == 0 || id.0 >= self.meta.page_count {
            return Err(SealError::InvalidOwned(format!("page {id} out of range")));
        }
        if self.cache.contains(&id) {
            self.stats.hits += 1;
            self.metrics.cache_hit();
            return self
                .cache
                .get_mut(&id)
                .ok_or(SealError::Corruption("cached page vanished"));
        }
        self.stats.misses += 1;
        self.metrics.cache_miss();
        let page = self.load(id)?;
        self.admit(id, page)
    }

    fn load(&self, id: PageId) -> Result<Page> {
        let offset = page_offset(id, self.page_size);
        let mut buf = vec![0u8; self.plain_size];
        match self.storage.read_range_into(offset, &mut buf) {
            Ok(()) => {}
            Err(err) => {
                if err.is_corruption() {
                    self.metrics.corruption_detected("page");
                }
                return Err(err);
            }
        }
        let page = Page::from_bytes(buf, id).inspect_err(|_| {
            self.metrics.corruption_detected("page");
        })?;
        Ok(page)
    }

    /// Inserts a page into the cache, writing back the least recently used page if it is dirty.
    fn admit(&mut self, id: PageId, page: Page) -> Result<&mut Page> {
        if self.cache.len() >= self.cache.cap().get() {
            if let Some((victim_id, mut victim)) = self.cache.pop_lru() {
                let dirty = victim.is_dirty();
                if dirty {
                    if let Err(err) = write_page(&self.storage, self.page_size, &mut victim) {
                        self.cache.push(victim_id, victim);
                        return Err(err);
                    }
                    self.stats.dirty_writebacks += 1;
                }
                self.stats.evictions += 1;
                self.metrics.page_evicted(dirty);
                debug!(page = victim_id.0, dirty, "pager.evict");
            }
        }
        self.cache.push(id, page);
        self.cache
            .get_mut(&id)
            .ok_or(SealError::Corruption("cached page vanished"))
    }
}

fn page_offset(id: PageId, page_size: usize) -> u64 {
    u64::from(id.0) * page_size as u64
}

fn write_page(storage: &EncryptedStorage, page_size: usize, page: &mut Page) -> Result<()> {
    page.set_dirty(false);
    let result = storage.write_range(page_offset(page.id(), page_size), page.as_bytes());
    if result.is_err() {
        page.set_dirty(true);
    }
    result
}

fn write_meta(storage: &EncryptedStorage, plain_size: usize, meta: &Meta) -> Result<()> {
    let mut buf = vec![0u8; plain_size];
    meta.encode(&mut buf)?;
    storage.write_range(0, &buf)
}
