#![allow(missing_docs)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Barrier, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use sealdb::primitives::crypto::BufferPool;
use sealdb::primitives::io::{FileIo, StdFileIo};
use sealdb::primitives::wal::{
    CommitConfig, Durability, GroupCommitter, Wal, WalEntry, WalOp, WalOptions,
};
use sealdb::types::{Lsn, Result, SealError};
use tempfile::tempdir;

/// Counts `sync_all` calls and can be told to fail or hold them.
struct CountingIo {
    inner: StdFileIo,
    syncs: AtomicUsize,
    fail_sync: AtomicBool,
    entered: AtomicUsize,
    held: Mutex<bool>,
    released: Condvar,
}

impl CountingIo {
    fn open(path: &std::path::Path) -> Result<Arc<Self>> {
        Ok(Arc::new(Self {
            inner: StdFileIo::open(path)?,
            syncs: AtomicUsize::new(0),
            fail_sync: AtomicBool::new(false),
            entered: AtomicUsize::new(0),
            held: Mutex::new(false),
            released: Condvar::new(),
        }))
    }

    fn syncs(&self) -> usize {
        self.syncs.load(Ordering::SeqCst)
    }

    /// Makes every later `sync_all` block until [`CountingIo::release`].
    fn hold(&self) {
        *self.held.lock().unwrap() = true;
    }

    fn release(&self) {
        *self.held.lock().unwrap() = false;
        self.released.notify_all();
    }

    fn wait_for_sync_entry(&self, count: usize) {
        while self.entered.load(Ordering::SeqCst) < count {
            thread::sleep(Duration::from_millis(1));
        }
    }
}

impl FileIo for CountingIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.inner.write_at(off, src)
    }

    fn sync_all(&self) -> Result<()> {
        self.entered.fetch_add(1, Ordering::SeqCst);
        let mut held = self.held.lock().unwrap();
        while *held {
            held = self.released.wait(held).unwrap();
        }
        drop(held);
        if self.fail_sync.load(Ordering::SeqCst) {
            return Err(SealError::Io(std::io::Error::other("injected sync failure")));
        }
        self.inner.sync_all()?;
        self.syncs.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn len(&self) -> Result<u64> {
        self.inner.len()
    }

    fn truncate(&self, len: u64) -> Result<()> {
        self.inner.truncate(len)
    }
}

fn committer(io: &Arc<CountingIo>, config: CommitConfig) -> Result<GroupCommitter> {
    let file: Arc<dyn FileIo> = io.clone();
    let wal = Wal::open(file, WalOptions::plain(Arc::new(BufferPool::new())))?;
    GroupCommitter::new(Arc::new(wal), config)
}

fn full_sync_config(max_batch_size: usize, delay_ms: u64) -> CommitConfig {
    CommitConfig {
        max_batch_size,
        max_batch_delay: Duration::from_millis(delay_ms),
        durability: Durability::FullSync,
    }
}

#[test]
fn lone_full_sync_commit_does_not_wait_for_the_batch_window() -> Result<()> {
    let dir = tempdir()?;
    let io = CountingIo::open(&dir.path().join("log.wal"))?;
    let committer = committer(&io, full_sync_config(100, 400))?;

    for i in 0..3u8 {
        let started = Instant::now();
        let receipt = committer.commit(WalEntry::new(WalOp::Insert, vec![i; 8]))?;
        let elapsed = started.elapsed();
        assert!(receipt.durable);
        assert!(
            elapsed < Duration::from_millis(200),
            "commit {i} took {elapsed:?} with an empty queue"
        );
    }
    assert_eq!(io.syncs(), 3);
    assert_eq!(committer.stats().batches, 3);
    Ok(())
}

#[test]
fn commits_queued_behind_a_flush_share_the_next_one() -> Result<()> {
    let dir = tempdir()?;
    let io = CountingIo::open(&dir.path().join("log.wal"))?;
    let committer = Arc::new(committer(&io, full_sync_config(10, 500))?);
    assert_eq!(io.syncs(), 0);

    // Park the worker inside the first flush so the next commits pile up.
    io.hold();
    let warm_up = {
        let committer = Arc::clone(&committer);
        thread::spawn(move || committer.commit(WalEntry::new(WalOp::Insert, vec![0xAA])))
    };
    io.wait_for_sync_entry(1);

    let start = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..3u8)
        .map(|i| {
            let committer = Arc::clone(&committer);
            let io = Arc::clone(&io);
            let start = Arc::clone(&start);
            thread::spawn(move || -> Result<Lsn> {
                start.wait();
                let receipt = committer.commit(WalEntry::new(WalOp::Insert, vec![i; 16]))?;
                // Success is only reported once the shared flush happened.
                assert_eq!(io.syncs(), 2);
                assert!(receipt.durable);
                Ok(receipt.seq)
            })
        })
        .collect();
    start.wait();
    thread::sleep(Duration::from_millis(100));
    assert_eq!(io.syncs(), 0);
    io.release();

    let first = warm_up.join().expect("warm-up thread panicked")?;
    assert_eq!(first.seq, Lsn(1));
    let mut seqs = Vec::new();
    for handle in handles {
        seqs.push(handle.join().expect("commit thread panicked")?);
    }
    seqs.sort();
    assert_eq!(seqs, vec![Lsn(2), Lsn(3), Lsn(4)]);
    assert_eq!(io.syncs(), 2);
    let stats = committer.stats();
    assert_eq!(stats.batches, 2);
    assert_eq!(stats.largest_batch, 3);
    Ok(())
}

#[test]
fn sequence_numbers_follow_submission_order() -> Result<()> {
    let dir = tempdir()?;
    let io = CountingIo::open(&dir.path().join("log.wal"))?;
    let committer = committer(
        &io,
        CommitConfig {
            max_batch_size: 4,
            max_batch_delay: Duration::from_millis(1),
            durability: Durability::Async,
        },
    )?;
    let mut last = Lsn(0);
    for i in 0..50u32 {
        let receipt = committer.commit(WalEntry::new(WalOp::Insert, i.to_be_bytes().to_vec()))?;
        assert!(receipt.seq > last);
        assert!(!receipt.durable);
        last = receipt.seq;
    }
    committer.flush()?;

    let mut iter = committer.wal().iter()?;
    let mut payloads = Vec::new();
    let mut prev = Lsn(0);
    while let Some(record) = iter.next_record()? {
        assert!(record.seq > prev);
        prev = record.seq;
        payloads.push(u32::from_be_bytes(record.payload[..4].try_into().unwrap()));
    }
    assert_eq!(payloads, (0..50).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn failed_flush_reaches_every_waiter_and_poisons() -> Result<()> {
    let dir = tempdir()?;
    let io = CountingIo::open(&dir.path().join("log.wal"))?;
    let committer = Arc::new(committer(
        &io,
        CommitConfig {
            max_batch_size: 8,
            max_batch_delay: Duration::from_millis(200),
            durability: Durability::FullSync,
        },
    )?);
    io.fail_sync.store(true, Ordering::SeqCst);

    let start = Arc::new(Barrier::new(4));
    let handles: Vec<_> = (0..4u8)
        .map(|i| {
            let committer = Arc::clone(&committer);
            let start = Arc::clone(&start);
            thread::spawn(move || {
                start.wait();
                committer.commit(WalEntry::new(WalOp::Insert, vec![i]))
            })
        })
        .collect();
    for handle in handles {
        let outcome = handle.join().expect("commit thread panicked");
        assert!(matches!(outcome, Err(SealError::FlushFailure(_))));
    }
    assert!(committer.failure().is_some());

    // The log stays failed even once the disk recovers.
    io.fail_sync.store(false, Ordering::SeqCst);
    assert!(matches!(
        committer.commit(WalEntry::new(WalOp::Insert, vec![9])),
        Err(SealError::FlushFailure(_))
    ));
    Ok(())
}

#[test]
fn async_failure_surfaces_on_next_commit() -> Result<()> {
    let dir = tempdir()?;
    let io = CountingIo::open(&dir.path().join("log.wal"))?;
    let committer = committer(
        &io,
        CommitConfig {
            max_batch_size: 1,
            max_batch_delay: Duration::ZERO,
            durability: Durability::Async,
        },
    )?;
    io.fail_sync.store(true, Ordering::SeqCst);
    committer.commit(WalEntry::new(WalOp::Insert, vec![1]))?;
    assert!(committer.flush().is_err());
    assert!(matches!(
        committer.commit(WalEntry::new(WalOp::Insert, vec![2])),
        Err(SealError::FlushFailure(_))
    ));
    assert_eq!(committer.stats().lost_records, 1);
    Ok(())
}

#[test]
fn shutdown_drains_then_rejects() -> Result<()> {
    let dir = tempdir()?;
    let io = CountingIo::open(&dir.path().join("log.wal"))?;
    let committer = committer(
        &io,
        CommitConfig {
            durability: Durability::Async,
            ..CommitConfig::default()
        },
    )?;
    for i in 0..10u8 {
        committer.commit(WalEntry::new(WalOp::Insert, vec![i]))?;
    }
    committer.shutdown()?;
    committer.shutdown()?;
    assert!(committer.is_closed());
    assert_eq!(committer.wal().stats().records_appended, 10);
    assert!(matches!(
        committer.commit(WalEntry::new(WalOp::Insert, vec![0])),
        Err(SealError::Closed)
    ));
    Ok(())
}
