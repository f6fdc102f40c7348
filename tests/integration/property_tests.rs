#![allow(missing_docs)]

use std::sync::Arc;

use proptest::prelude::*;
use sealdb::primitives::crypto::{BufferPool, CipherKey, PageCipher, SEAL_OVERHEAD};
use sealdb::primitives::io::StdFileIo;
use sealdb::primitives::storage::EncryptedStorage;
use sealdb::storage::index::{IndexKey, IndexSnapshot};
use sealdb::storage::EngineKind;
use sealdb::types::TableId;
use sealdb::{StorageContext, StoreConfig};
use tempfile::tempdir;

fn first_byte(data: &[u8]) -> Option<IndexKey> {
    data.first().map(|b| vec![*b])
}

fn build_index(rows: &[Vec<u8>], batched: bool) -> IndexSnapshot {
    let dir = tempdir().unwrap();
    let config = StoreConfig {
        engine: EngineKind::Paged,
        page_size: 1024,
        page_cache_capacity: 8,
        ..StoreConfig::default()
    };
    let ctx = StorageContext::new(dir.path(), &CipherKey::from_bytes(&[1; 32]).unwrap(), config)
        .unwrap();
    let table = ctx.open_table(TableId(1), "rows").unwrap();
    table.create_index("k", first_byte).unwrap();
    let index = table.index().unwrap();
    index.ensure_loaded("k").unwrap();
    if batched {
        let mut batch = table.begin_batch();
        for row in rows {
            batch.insert(row).unwrap();
        }
        batch.finish();
    } else {
        for row in rows {
            table.insert(row).unwrap();
        }
    }
    index.export("k").unwrap()
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn sealed_units_round_trip(
        payload in prop::collection::vec(any::<u8>(), 0..4096),
        associated in any::<u64>(),
    ) {
        let cipher = PageCipher::new(&CipherKey::from_bytes(&[5; 32]).unwrap());
        let sealed = cipher.seal(associated, &payload).unwrap();
        prop_assert_eq!(sealed.len(), payload.len() + SEAL_OVERHEAD);
        prop_assert_eq!(cipher.open(associated, &sealed).unwrap(), payload);
        // The associated data binds a unit to its position.
        prop_assert!(cipher.open(associated.wrapping_add(1), &sealed).is_err());
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn pages_round_trip_for_every_page_size(
        shift in 9u32..=16,
        page_no in 0u64..4,
        seed in prop::collection::vec(any::<u8>(), 1..64),
    ) {
        let page_size = 1usize << shift;
        let dir = tempdir().unwrap();
        let io = Arc::new(StdFileIo::open(dir.path().join("pages")).unwrap());
        let cipher = Arc::new(PageCipher::new(&CipherKey::from_bytes(&[6; 32]).unwrap()));
        let pool = Arc::new(BufferPool::new());
        let storage = EncryptedStorage::new(io, cipher, Arc::clone(&pool));
        let plain: Vec<u8> = seed.iter().copied().cycle().take(page_size - SEAL_OVERHEAD).collect();
        let offset = page_no * page_size as u64;
        storage.write_range(offset, &plain).unwrap();
        prop_assert_eq!(storage.read_range(offset, plain.len()).unwrap(), plain);
        prop_assert_eq!(pool.outstanding(), 0);
    }

    #[test]
    fn batched_and_immediate_indexes_agree(
        rows in prop::collection::vec(
            (0u8..6, prop::collection::vec(any::<u8>(), 0..48))
                .prop_map(|(key, mut rest)| { rest.insert(0, key); rest }),
            1..80,
        ),
    ) {
        let immediate = build_index(&rows, false);
        let batched = build_index(&rows, true);
        prop_assert_eq!(immediate, batched);
    }
}
