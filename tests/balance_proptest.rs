//! Property-based coverage for the AVL balance/cardinality invariants,
//! mirroring the teacher's `disk_v2::common` `proptest!` block: random
//! insert/delete sequences, checked through the one public structural
//! window this store exposes — `Store::scan`.

use avlfile::{OpenOptionsBuilder, Store};
use proptest::prelude::*;

fn open(path: &std::path::Path) -> Store {
    let options = OpenOptionsBuilder::from_path(path)
        .key_count(1)
        .data_len(4)
        .build()
        .expect("valid options");
    Store::open(options, |_key: u32, a: &[u8], b: &[u8]| a.cmp(b)).expect("open")
}

fn assert_balanced(store: &Store) {
    let report = store.scan(0).expect("scan");
    assert!(report.divergence.is_none(), "{:?}", report.divergence);
    assert_eq!(report.count as i64, store.live_count());
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn insert_then_delete_all_keeps_every_tree_balanced(
        keys in prop::collection::hash_set(0u32..2_000, 1..400),
    ) {
        let keys: Vec<u32> = keys.into_iter().collect();
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut store = open(file.path());

        for &k in &keys {
            store.insert(&k.to_ne_bytes()).expect("insert");
            assert_balanced(&store);
        }
        prop_assert_eq!(store.live_count() as usize, keys.len());

        for &k in keys.iter().rev() {
            store.delete(&k.to_ne_bytes()).expect("delete");
            assert_balanced(&store);
        }
        prop_assert_eq!(store.live_count(), 0);
    }

    #[test]
    fn interleaved_insert_delete_keeps_every_tree_balanced(
        ops in prop::collection::vec((0u32..200, any::<bool>()), 1..400),
    ) {
        let file = tempfile::NamedTempFile::new().expect("tempfile");
        let mut store = open(file.path());
        let mut live = std::collections::HashSet::new();

        for (k, want_insert) in ops {
            if want_insert {
                if live.insert(k) {
                    store.insert(&k.to_ne_bytes()).expect("insert");
                }
            } else if live.remove(&k) {
                store.delete(&k.to_ne_bytes()).expect("delete");
            }
            assert_balanced(&store);
        }
        prop_assert_eq!(store.live_count() as usize, live.len());
    }
}
