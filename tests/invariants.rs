//! Acceptance tests for the six concrete scenarios this format is built
//! around. Each stands up its own temp-file store through the public API
//! only; deep structural checks (balance/thread correctness) are exercised
//! via [`avlfile::Store::scan`], the one public window onto tree shape.

use std::cmp::Ordering;

use avlfile::{OpenOptionsBuilder, Store};
use rand::seq::SliceRandom;
use rand::{rngs::StdRng, SeedableRng};

fn single_key_store(path: &std::path::Path) -> Store {
    let options = OpenOptionsBuilder::from_path(path)
        .key_count(1)
        .data_len(4)
        .build()
        .expect("valid options");
    Store::open(options, |_key: u32, a: &[u8], b: &[u8]| a.cmp(b)).expect("open")
}

fn key0(v: u32) -> Vec<u8> {
    v.to_ne_bytes().to_vec()
}

fn read_key0(buf: &[u8]) -> u32 {
    u32::from_ne_bytes(buf[0..4].try_into().unwrap())
}

/// Scenario 1: ascending traversal via `startge`/`next` over distinct keys.
#[test]
fn scenario1_startge_next_visits_in_ascending_order() {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    let mut store = single_key_store(file.path());

    store.insert(&key0(1)).expect("insert 1");
    store.insert(&key0(2)).expect("insert 2");
    store.insert(&key0(3)).expect("insert 3");

    let mut seen = vec![read_key0(&store.startge(&key0(0), 0).expect("startge"))];
    while let Ok(buf) = store.next(0) {
        seen.push(read_key0(&buf));
    }
    assert_eq!(seen, vec![1, 2, 3]);
}

/// Scenario 2: duplicate key0, delete the exact middle payload, the other
/// two survive an ascending traversal.
#[test]
fn scenario2_delete_exact_duplicate_preserves_the_others() {
    let file = tempfile::NamedTempFile::new().expect("tempfile");

    // Three records tie under key0 = 1; they're bytewise distinguished by a
    // tag byte appended to the 4-byte key0 field. The comparator only looks
    // at the first 4 bytes, so the tree sees a tie run of three.
    let options = OpenOptionsBuilder::from_path(file.path())
        .key_count(1)
        .data_len(5)
        .build()
        .expect("options");
    let cmp = |_key: u32, a: &[u8], b: &[u8]| a[0..4].cmp(&b[0..4]);
    let mut store = Store::open(options, cmp).expect("open with wider payload");

    let tagged = |tag: u8| -> Vec<u8> {
        let mut buf = 1u32.to_ne_bytes().to_vec();
        buf.push(tag);
        buf
    };
    store.insert(&tagged(b'a')).expect("insert a");
    store.insert(&tagged(b'b')).expect("insert b");
    store.insert(&tagged(b'c')).expect("insert c");

    store.delete(&tagged(b'b')).expect("delete exact b");

    let probe = {
        let mut b = 0u32.to_ne_bytes().to_vec();
        b.push(0);
        b
    };
    let mut tags = vec![*store.startge(&probe, 0).expect("startge").last().unwrap()];
    while let Ok(buf) = store.next(0) {
        tags.push(*buf.last().unwrap());
    }
    tags.sort();
    assert_eq!(tags, vec![b'a', b'c']);
}

/// Scenario 3: a second opener's `readseq` walk skips a record deleted by
/// the first opener after the walk started but before it got there, rather
/// than repeating a record or aborting.
#[test]
fn scenario3_readseq_skips_concurrently_deleted_record() {
    const N: u32 = 1000;
    let file = tempfile::NamedTempFile::new().expect("tempfile");

    let mut h1 = single_key_store(file.path());
    let mut order: Vec<u32> = (0..N).collect();
    let mut rng = StdRng::seed_from_u64(7);
    order.shuffle(&mut rng);
    for &k in &order {
        h1.insert(&key0(k)).expect("insert");
    }

    // readseq visits most-recently-inserted first, i.e. `order` reversed.
    let mut expected: Vec<u32> = order.iter().rev().copied().collect();

    let mut h2 = single_key_store(file.path());
    h2.startseq().expect("startseq");

    let mut visited = Vec::new();
    for _ in 0..10 {
        visited.push(read_key0(&h2.readseq().expect("readseq")));
    }

    // Delete a record h2 has not reached yet.
    let victim = expected[500];
    h1.delete(&key0(victim)).expect("delete victim");

    loop {
        match h2.readseq() {
            Ok(buf) => visited.push(read_key0(&buf)),
            Err(e) if e.is_not_found() => break,
            Err(e) => panic!("unexpected readseq error: {e}"),
        }
    }

    expected.retain(|&v| v != victim);
    assert_eq!(visited, expected, "h2 must skip the deleted record exactly once, never repeat, never abort");
}

/// Scenario 4: bulk insert then full reverse-order delete drains the store
/// back to empty, and `squash` returns the file to its minimal footprint.
#[test]
fn scenario4_bulk_insert_delete_then_squash_reclaims_space() {
    const N: u32 = 10_000;
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    let mut store = single_key_store(file.path());

    // The baseline footprint: header plus this handle's own cursor slot,
    // allocated at `open()` time before any record exists.
    let baseline_len = store.file_len();

    let mut order: Vec<u32> = (0..N).collect();
    let mut rng = StdRng::seed_from_u64(11);
    order.shuffle(&mut rng);
    for &k in &order {
        store.insert(&key0(k)).expect("insert");
    }
    assert_eq!(store.live_count(), N as i64);

    for &k in order.iter().rev() {
        store.delete(&key0(k)).expect("delete");
    }
    assert_eq!(store.live_count(), 0);

    let report = store.scan(0).expect("scan");
    assert_eq!(report.count, 0);
    assert!(report.divergence.is_none());

    store.squash().expect("squash");
    assert_eq!(store.file_len(), baseline_len);
}

/// Scenario 5: two records tie on key0 but are distinguished on key1;
/// `update` with a record equal on every key to one of them replaces only
/// that payload's mutable tail, leaving the other untouched.
#[test]
fn scenario5_update_replaces_only_the_cross_key_equal_record() {
    // Payload: key0 (4 bytes) | tag (1 byte, part of key1's ordering) |
    // value (3 bytes, not part of any key — the mutable payload `update`
    // overwrites).
    fn payload(k0: u32, tag: u8, value: [u8; 3]) -> Vec<u8> {
        let mut buf = k0.to_ne_bytes().to_vec();
        buf.push(tag);
        buf.extend_from_slice(&value);
        buf
    }
    fn cmp(key: u32, a: &[u8], b: &[u8]) -> Ordering {
        match key {
            0 => a[0..4].cmp(&b[0..4]),
            1 => a[0..5].cmp(&b[0..5]),
            _ => unreachable!(),
        }
    }

    let file = tempfile::NamedTempFile::new().expect("tempfile");
    let options = OpenOptionsBuilder::from_path(file.path())
        .key_count(2)
        .data_len(8)
        .build()
        .expect("options");
    let mut store = Store::open(options, cmp).expect("open");

    store.insert(&payload(7, b'x', [0, 0, 0])).expect("insert x");
    store.insert(&payload(7, b'y', [0, 0, 0])).expect("insert y");

    store
        .update(&payload(7, b'y', [1, 2, 3]))
        .expect("update the y record");

    let found_y = store.find(&payload(7, b'y', [0, 0, 0]), 1).expect("find y");
    assert_eq!(&found_y[5..8], &[1, 2, 3]);
    let found_x = store.find(&payload(7, b'x', [0, 0, 0]), 1).expect("find x");
    assert_eq!(&found_x[5..8], &[0, 0, 0]);
}

/// Scenario 6: AVL worst-case height bounds hold for a range of sizes.
#[test]
fn scenario6_scan_height_within_avl_bounds() {
    let file = tempfile::NamedTempFile::new().expect("tempfile");
    let mut rng = StdRng::seed_from_u64(3);

    for &n in &[1u32, 2, 5, 10, 50, 100, 500, 1_000, 5_000, 10_000] {
        let path = file.path().with_extension(format!("n{n}"));
        let mut store = single_key_store(&path);
        let mut order: Vec<u32> = (0..n).collect();
        order.shuffle(&mut rng);
        for &k in &order {
            store.insert(&key0(k)).expect("insert");
        }

        let report = store.scan(0).expect("scan");
        assert!(report.divergence.is_none());
        assert_eq!(report.count, n as u64);

        let lower = ((n + 1) as f64).log2().ceil() as u32;
        let upper = 1.4405 * ((n + 2) as f64).log2();
        assert!(
            report.height >= lower && (report.height as f64) <= upper,
            "n={n}: height {} not within [{lower}, {upper}]",
            report.height
        );
        let _ = std::fs::remove_file(&path);
    }
}
