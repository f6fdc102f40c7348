#![allow(missing_docs)]

use std::collections::BTreeSet;

use sealdb::primitives::crypto::CipherKey;
use sealdb::storage::index::IndexKey;
use sealdb::storage::EngineKind;
use sealdb::types::{Result, SealError, TableId};
use sealdb::{StorageContext, StoreConfig, Table};
use tempfile::tempdir;

fn key_column(data: &[u8]) -> Option<IndexKey> {
    data.iter().position(|b| *b == b'|').map(|at| data[..at].to_vec())
}

fn context(root: &std::path::Path) -> Result<StorageContext> {
    let config = StoreConfig {
        engine: EngineKind::Paged,
        page_size: 4096,
        page_cache_capacity: 100,
        ..StoreConfig::default()
    };
    StorageContext::new(root, &CipherKey::from_bytes(&[0x42; 32])?, config)
}

fn row(i: usize) -> Vec<u8> {
    format!("key_{i}|{}", "x".repeat(480)).into_bytes()
}

fn resident_pages(table: &Table) -> Result<usize> {
    table
        .stats()
        .pager
        .map(|pager| pager.resident_pages)
        .ok_or(SealError::Invalid("paged table without pager stats"))
}

#[test]
fn bulk_load_of_thousand_rows_then_point_lookup() -> Result<()> {
    let dir = tempdir()?;
    let ctx = context(dir.path())?;
    let table = ctx.open_table(TableId(1), "items")?;
    table.create_index("key", key_column)?;
    let index = table.index().ok_or(SealError::Invalid("indexes disabled"))?;
    index.ensure_loaded("key")?;

    let mut batch = table.begin_batch();
    let mut refs = Vec::with_capacity(1000);
    for i in 0..1000 {
        refs.push(batch.insert(&row(i))?);
        if i % 100 == 0 {
            assert!(resident_pages(&table)? <= 100);
        }
    }
    // Nothing reaches the index before the batch finishes.
    assert!(table.lookup("key", b"key_500")?.is_empty());
    assert_eq!(batch.finish(), 1000);

    assert_eq!(table.lookup("key", b"key_500")?, BTreeSet::from([refs[500]]));
    assert_eq!(table.lookup_where("key = 'key_999'")?, Some(BTreeSet::from([refs[999]])));
    assert_eq!(table.lookup_where("key = 'key_1' OR key = 'key_2'")?, None);
    assert!(resident_pages(&table)? <= 100);

    let stats = table.stats().pager.ok_or(SealError::Invalid("no pager stats"))?;
    assert!(stats.page_count > 100, "rows should not fit in the cache");
    assert!(stats.evictions > 0);
    Ok(())
}

#[test]
fn lazy_load_scans_existing_rows_once() -> Result<()> {
    let dir = tempdir()?;
    let ctx = context(dir.path())?;
    let table = ctx.open_table(TableId(1), "items")?;
    table.create_index("key", key_column)?;

    let mut batch = table.begin_batch();
    let refs = (0..300)
        .map(|i| batch.insert(&row(i)))
        .collect::<Result<Vec<_>>>()?;
    batch.finish();

    let index = table.index().ok_or(SealError::Invalid("indexes disabled"))?;
    assert!(!index.is_loaded("key"));
    assert_eq!(table.lookup("key", b"key_42")?, BTreeSet::from([refs[42]]));
    assert!(index.is_loaded("key"));
    assert!(resident_pages(&table)? <= 100);

    // Later writes go through the immediate consumer.
    let extra = table.insert(&row(42))?;
    assert_eq!(
        table.lookup("key", b"key_42")?,
        BTreeSet::from([refs[42], extra])
    );
    Ok(())
}

#[test]
fn batch_applies_in_recorded_order() -> Result<()> {
    let dir = tempdir()?;
    let ctx = context(dir.path())?;
    let table = ctx.open_table_with(TableId(1), "ordered", EngineKind::Hybrid)?;
    table.create_index("key", key_column)?;
    let index = table.index().ok_or(SealError::Invalid("indexes disabled"))?;
    index.ensure_loaded("key")?;

    let mut batch = table.begin_batch();
    let a = batch.insert(b"first|1")?;
    batch.update(a, b"second|1")?;
    let b = batch.insert(b"first|2")?;
    batch.delete(b)?;
    assert_eq!(batch.finish(), 4);

    assert!(table.lookup("key", b"first")?.is_empty());
    assert_eq!(table.lookup("key", b"second")?, BTreeSet::from([a]));
    let snapshot = index.export("key").ok_or(SealError::Invalid("not loaded"))?;
    assert_eq!(snapshot.len(), 1);
    Ok(())
}
