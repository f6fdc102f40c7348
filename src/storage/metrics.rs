use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Trait for tracking storage operations and cache behavior.
///
/// Engines and the page cache call into this on their hot paths, so
/// implementations must be cheap and thread-safe.
pub trait StorageMetrics: Send + Sync {
    /// A page request was served from the cache.
    fn cache_hit(&self);

    /// A page had to be read and decrypted from disk.
    fn cache_miss(&self);

    /// A page left the cache.
    ///
    /// # Parameters
    /// * `dirty` - Whether the page had to be written back first.
    fn page_evicted(&self, dirty: bool);

    /// A WAL batch was written.
    fn wal_batch(&self, records: usize);

    /// Checksum or authentication failure.
    ///
    /// # Parameters
    /// * `unit` - What was damaged: "page", "frame" or "wal".
    fn corruption_detected(&self, unit: &'static str);
}

/// A no-op implementation of [`StorageMetrics`] that discards all recorded metrics.
#[derive(Default)]
pub struct NoopMetrics;

impl StorageMetrics for NoopMetrics {
    fn cache_hit(&self) {}
    fn cache_miss(&self) {}
    fn page_evicted(&self, _dirty: bool) {}
    fn wal_batch(&self, _records: usize) {}
    fn corruption_detected(&self, _unit: &'static str) {}
}

/// A thread-safe counter-based implementation of [`StorageMetrics`].
#[derive(Default)]
pub struct CounterMetrics {
    /// Page requests served from the cache.
    pub cache_hits: AtomicU64,

    /// Page requests that went to disk.
    pub cache_misses: AtomicU64,

    /// Pages evicted from the cache.
    pub evictions: AtomicU64,

    /// Evicted pages that were written back.
    pub dirty_writebacks: AtomicU64,

    /// WAL batches written.
    pub wal_batches: AtomicU64,

    /// WAL records written.
    pub wal_records: AtomicU64,

    /// Damaged pages encountered.
    pub corrupt_pages: AtomicU64,

    /// Damaged frames or WAL records encountered.
    pub corrupt_records: AtomicU64,
}

impl CounterMetrics {
    /// Total corruption events of any kind.
    pub fn corruption_events(&self) -> u64 {
        self.corrupt_pages.load(Ordering::Relaxed) + self.corrupt_records.load(Ordering::Relaxed)
    }
}

impl StorageMetrics for CounterMetrics {
    fn cache_hit(&self) {
        self.cache_hits.fetch_add(1, Ordering::Relaxed);
    }

    fn cache_miss(&self) {
        self.cache_misses.fetch_add(1, Ordering::Relaxed);
    }

    fn page_evicted(&self, dirty: bool) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
        if dirty {
            self.dirty_writebacks.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn wal_batch(&self, records: usize) {
        self.wal_batches.fetch_add(1, Ordering::Relaxed);
        self.wal_records.fetch_add(records as u64, Ordering::Relaxed);
    }

    fn corruption_detected(&self, unit: &'static str) {
        match unit {
            "page" => {
                self.corrupt_pages.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.corrupt_records.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

/// Returns the default metrics implementation wrapped in an [`Arc`].
///
/// The default implementation is [`NoopMetrics`], which discards everything.
pub fn default_metrics() -> Arc<dyn StorageMetrics> {
    Arc::new(NoopMetrics)
}
