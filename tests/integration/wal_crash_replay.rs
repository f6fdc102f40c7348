#![allow(missing_docs)]

use std::fs::OpenOptions;
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::sync::Arc;

use proptest::prelude::*;
use sealdb::primitives::crypto::{BufferPool, CipherKey, PageCipher};
use sealdb::primitives::io::StdFileIo;
use sealdb::primitives::wal::{
    CommitConfig, GroupCommitter, Wal, WalEntry, WalOp, WalOptions, WalRecord, FILE_HEADER_LEN,
};
use sealdb::types::{Lsn, Result};
use tempfile::tempdir;

fn open_wal(path: &Path, encrypted: bool) -> Result<Wal> {
    let pool = Arc::new(BufferPool::new());
    let options = if encrypted {
        let cipher = Arc::new(PageCipher::new(&CipherKey::from_bytes(&[3u8; 32])?));
        WalOptions::encrypted(cipher, pool)
    } else {
        WalOptions::plain(pool)
    };
    Wal::open(Arc::new(StdFileIo::open(path)?), options)
}

/// Appends `count` records and returns the file offset after each one.
fn write_records(wal: &Wal, count: u64, payload_len: usize) -> Result<Vec<u64>> {
    let mut ends = Vec::new();
    for seq in 1..=count {
        let payload = vec![seq as u8; payload_len];
        wal.append(&WalRecord::new(Lsn(seq), WalOp::Insert, payload))?;
        ends.push(wal.len()?);
    }
    wal.sync()?;
    Ok(ends)
}

fn replay(wal: &Wal) -> Result<Vec<WalRecord>> {
    let mut seen = Vec::new();
    wal.recover(|record| {
        seen.push(record.clone());
        Ok(())
    })?;
    Ok(seen)
}

fn flip_byte(path: &Path, offset: u64) -> Result<()> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut byte = [0u8; 1];
    file.seek(SeekFrom::Start(offset))?;
    file.read_exact(&mut byte)?;
    file.seek(SeekFrom::Start(offset))?;
    file.write_all(&[byte[0] ^ 0xFF])?;
    Ok(())
}

fn truncate(path: &Path, len: u64) -> Result<()> {
    OpenOptions::new().write(true).open(path)?.set_len(len)?;
    Ok(())
}

#[test]
fn corrupt_fifth_record_bounds_replay() -> Result<()> {
    for encrypted in [false, true] {
        let dir = tempdir()?;
        let path = dir.path().join("log.wal");
        let ends = {
            let wal = open_wal(&path, encrypted)?;
            write_records(&wal, 10, 24)?
        };
        // Last byte of the fifth frame is part of its CRC.
        flip_byte(&path, ends[4] - 1)?;

        let wal = open_wal(&path, encrypted)?;
        let mut seen = Vec::new();
        let report = wal.recover(|record| {
            seen.push(record.seq);
            Ok(())
        })?;
        assert_eq!(seen, vec![Lsn(1), Lsn(2), Lsn(3), Lsn(4)]);
        assert_eq!(report.records_replayed, 4);
        assert_eq!(report.last_seq, Lsn(4));
        assert_eq!(report.valid_up_to, ends[3]);
        assert_eq!(report.discarded_bytes, ends[9] - ends[3]);
        assert_eq!(wal.len()?, ends[3]);

        // New appends continue after the last valid record.
        wal.append(&WalRecord::new(Lsn(5), WalOp::Update, b"again".to_vec()))?;
        wal.sync()?;
        drop(wal);
        let wal = open_wal(&path, encrypted)?;
        assert_eq!(replay(&wal)?.len(), 5);
    }
    Ok(())
}

#[test]
fn replay_is_idempotent() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("log.wal");
    {
        let wal = open_wal(&path, true)?;
        write_records(&wal, 6, 40)?;
    }
    let first = replay(&open_wal(&path, true)?)?;
    let second = replay(&open_wal(&path, true)?)?;
    assert_eq!(first.len(), 6);
    assert_eq!(first, second);
    Ok(())
}

#[test]
fn unfinished_group_is_not_replayed() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("log.wal");
    {
        let wal = Arc::new(open_wal(&path, false)?);
        let committer = GroupCommitter::new(Arc::clone(&wal), CommitConfig::default())?;
        committer.commit(WalEntry::new(WalOp::Insert, b"solo".to_vec()))?;
        committer.commit_group(vec![
            WalEntry::new(WalOp::Insert, b"a".to_vec()),
            WalEntry::new(WalOp::Insert, b"b".to_vec()),
        ])?;
        committer.shutdown()?;
    }
    let full = replay(&open_wal(&path, false)?)?;
    assert_eq!(full.len(), 3);
    assert!(full.iter().all(|record| record.op != WalOp::Commit));

    // Cut into the commit marker: the group must vanish as a whole.
    let len = std::fs::metadata(&path)?.len();
    truncate(&path, len - 2)?;
    let wal = open_wal(&path, false)?;
    let partial = replay(&wal)?;
    assert_eq!(partial.len(), 1);
    assert_eq!(partial[0].payload, b"solo".to_vec());
    assert_eq!(wal.last_seq(), Lsn(1));
    Ok(())
}

#[test]
fn header_only_file_recovers_empty() -> Result<()> {
    let dir = tempdir()?;
    let path = dir.path().join("log.wal");
    let wal = open_wal(&path, false)?;
    let report = wal.recover(|_| Ok(()))?;
    assert_eq!(report.records_replayed, 0);
    assert_eq!(wal.len()?, FILE_HEADER_LEN as u64);
    drop(wal);
    // A plaintext log cannot be reopened as an encrypted one.
    assert!(open_wal(&path, true).is_err());
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn torn_tail_replays_only_whole_records(
        sizes in prop::collection::vec(0usize..200, 1..12),
        cut_ratio in 0.0f64..=1.0,
        encrypted in any::<bool>(),
    ) {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log.wal");
        let ends = {
            let wal = open_wal(&path, encrypted).unwrap();
            let mut ends = Vec::new();
            for (i, size) in sizes.iter().enumerate() {
                let record = WalRecord::new(Lsn(i as u64 + 1), WalOp::Insert, vec![7u8; *size]);
                wal.append(&record).unwrap();
                ends.push(wal.len().unwrap());
            }
            wal.sync().unwrap();
            ends
        };
        let header = FILE_HEADER_LEN as u64;
        let total = *ends.last().unwrap();
        let cut = header + ((total - header) as f64 * cut_ratio) as u64;
        truncate(&path, cut).unwrap();

        let wal = open_wal(&path, encrypted).unwrap();
        let replayed = replay(&wal).unwrap();
        let expected = ends.iter().filter(|end| **end <= cut).count();
        prop_assert_eq!(replayed.len(), expected);
        for (i, record) in replayed.iter().enumerate() {
            prop_assert_eq!(record.seq, Lsn(i as u64 + 1));
            prop_assert_eq!(record.payload.len(), sizes[i]);
        }
        let valid = if expected == 0 { header } else { ends[expected - 1] };
        prop_assert_eq!(wal.len().unwrap(), valid);
    }
}
