use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::debug;
use zeroize::Zeroize;

const MIN_CLASS_SHIFT: u32 = 9;
const MAX_CLASS_SHIFT: u32 = 24;
const CLASS_COUNT: usize = (MAX_CLASS_SHIFT - MIN_CLASS_SHIFT + 1) as usize;
const DEFAULT_RETAINED_PER_CLASS: usize = 16;

/// Counters describing pool usage.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    /// Buffers handed out.
    pub rents: u64,
    /// Buffers handed back.
    pub returns: u64,
    /// Rents that required a fresh allocation.
    pub allocations: u64,
    /// Buffers currently rented.
    pub outstanding: u64,
}

/// Thread-safe pool of scratch buffers used by the encryption path.
///
/// Buffers are bucketed by power-of-two size classes. Every buffer sitting in
/// the pool is all zeroes; a [`PooledBuf`] wipes the bytes it exposed before
/// going back.
pub struct BufferPool {
    classes: Mutex<Vec<Vec<Vec<u8>>>>,
    retained_per_class: usize,
    rents: AtomicU64,
    returns: AtomicU64,
    allocations: AtomicU64,
}

impl BufferPool {
    /// Creates an empty pool.
    pub fn new() -> Self {
        Self::with_retention(DEFAULT_RETAINED_PER_CLASS)
    }

    /// Creates a pool keeping at most `retained_per_class` idle buffers per size class.
    pub fn with_retention(retained_per_class: usize) -> Self {
        Self {
            classes: Mutex::new(vec![Vec::new(); CLASS_COUNT]),
            retained_per_class,
            rents: AtomicU64::new(0),
            returns: AtomicU64::new(0),
            allocations: AtomicU64::new(0),
        }
    }

    /// Rents a zeroed buffer of exactly `len` visible bytes.
    pub fn rent(&self, len: usize) -> PooledBuf<'_> {
        self.rents.fetch_add(1, Ordering::Relaxed);
        let buf = match class_index(len) {
            Some(idx) => {
                let recycled = self.classes.lock()[idx].pop();
                match recycled {
                    Some(buf) => buf,
                    None => self.allocate(class_size(idx)),
                }
            }
            None => self.allocate(len),
        };
        PooledBuf {
            pool: self,
            buf,
            len,
        }
    }

    /// Returns a snapshot of the usage counters.
    pub fn stats(&self) -> PoolStats {
        let rents = self.rents.load(Ordering::Relaxed);
        let returns = self.returns.load(Ordering::Relaxed);
        PoolStats {
            rents,
            returns,
            allocations: self.allocations.load(Ordering::Relaxed),
            outstanding: rents.saturating_sub(returns),
        }
    }

    /// Number of buffers currently rented and not yet returned.
    pub fn outstanding(&self) -> u64 {
        self.stats().outstanding
    }

    fn allocate(&self, size: usize) -> Vec<u8> {
        self.allocations.fetch_add(1, Ordering::Relaxed);
        debug!(size, "crypto.pool.allocate");
        vec![0u8; size]
    }

    fn give_back(&self, buf: Vec<u8>) {
        self.returns.fetch_add(1, Ordering::Relaxed);
        let Some(idx) = class_index(buf.len()) else {
            return;
        };
        if class_size(idx) != buf.len() {
            return;
        }
        let mut classes = self.classes.lock();
        if classes[idx].len() < self.retained_per_class {
            classes[idx].push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("stats", &self.stats())
            .finish()
    }
}

fn class_index(len: usize) -> Option<usize> {
    if len > 1usize << MAX_CLASS_SHIFT {
        return None;
    }
    let size = len.max(1).next_power_of_two();
    let shift = size.trailing_zeros().max(MIN_CLASS_SHIFT);
    if shift > MAX_CLASS_SHIFT {
        None
    } else {
        Some((shift - MIN_CLASS_SHIFT) as usize)
    }
}

fn class_size(idx: usize) -> usize {
    1usize << (idx as u32 + MIN_CLASS_SHIFT)
}

/// A rented buffer; wiped and returned to its pool on drop, on every exit path.
pub struct PooledBuf<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
    len: usize,
}

impl Deref for PooledBuf<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.buf[..self.len]
    }
}

impl DerefMut for PooledBuf<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.buf[..self.len]
    }
}

impl Drop for PooledBuf<'_> {
    fn drop(&mut self) {
        self.buf[..self.len].zeroize();
        let buf = std::mem::take(&mut self.buf);
        self.pool.give_back(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rent_reuses_returned_buffers() {
        let pool = BufferPool::new();
        {
            let mut buf = pool.rent(1000);
            assert_eq!(buf.len(), 1000);
            buf.fill(0xAB);
        }
        {
            let buf = pool.rent(900);
            assert!(buf.iter().all(|&b| b == 0), "returned buffers are wiped");
        }
        let stats = pool.stats();
        assert_eq!(stats.rents, 2);
        assert_eq!(stats.returns, 2);
        assert_eq!(stats.allocations, 1);
        assert_eq!(stats.outstanding, 0);
    }

    #[test]
    fn oversized_requests_bypass_classes() {
        let pool = BufferPool::new();
        {
            let buf = pool.rent((1 << MAX_CLASS_SHIFT) + 1);
            assert_eq!(pool.outstanding(), 1);
            drop(buf);
        }
        assert_eq!(pool.outstanding(), 0);
        let _again = pool.rent((1 << MAX_CLASS_SHIFT) + 1);
        assert_eq!(pool.stats().allocations, 2);
    }

    #[test]
    fn buffer_returned_when_scope_unwinds() {
        let pool = BufferPool::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _buf = pool.rent(64);
            panic!("boom");
        }));
        assert!(result.is_err());
        assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn size_classes_are_powers_of_two() {
        assert_eq!(class_index(1), Some(0));
        assert_eq!(class_index(512), Some(0));
        assert_eq!(class_index(513), Some(1));
        assert_eq!(class_size(1), 1024);
        assert_eq!(class_index(1 << 25), None);
    }
}
