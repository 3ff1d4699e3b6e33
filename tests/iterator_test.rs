//! Range iteration: ordering, bounds, seeks.

mod common;

use burrow::Database;
use common::{key, open_db, small_tree_config, temp_path, value};
use rand::prelude::*;

fn collect(iter: &mut burrow::DbIterator) -> Vec<(Vec<u8>, Vec<u8>)> {
    let mut out = Vec::new();
    while iter.valid() {
        out.push((iter.key().unwrap().to_vec(), iter.value().unwrap().to_vec()));
        iter.next();
    }
    assert!(iter.error().is_none(), "iterator error: {:?}", iter.error());
    out
}

#[test]
fn test_full_scan_in_order() {
    let (db, _path) = open_db("iter_full");
    for i in (0..100u32).rev() {
        db.put(&key(i), &value(i)).unwrap();
    }

    let mut iter = db.iterator(None, None).unwrap();
    let all = collect(&mut iter);
    assert_eq!(all.len(), 100);
    for (i, (k, v)) in all.iter().enumerate() {
        assert_eq!(k, &key(i as u32));
        assert_eq!(v, &value(i as u32));
    }
}

#[test]
fn test_empty_database_scan() {
    let (db, _path) = open_db("iter_empty");
    let mut iter = db.iterator(None, None).unwrap();
    assert!(!iter.valid());
    assert!(iter.key().is_none());
    iter.next(); // must not panic or error
    assert!(iter.error().is_none());
}

#[test]
fn test_half_open_range() {
    let (db, _path) = open_db("iter_range");
    for i in 0..50u32 {
        db.put(&key(i), &value(i)).unwrap();
    }

    // [key(10), key(20)) contains exactly keys 10..=19.
    let mut iter = db.iterator(Some(&key(10)), Some(&key(20))).unwrap();
    let hits = collect(&mut iter);
    assert_eq!(hits.len(), 10);
    assert_eq!(hits[0].0, key(10));
    assert_eq!(hits[9].0, key(19));
}

#[test]
fn test_range_bounds_between_keys() {
    let (db, _path) = open_db("iter_between");
    for i in (0..40u32).step_by(2) {
        db.put(&key(i), &value(i)).unwrap();
    }

    // Bounds that fall on absent keys.
    let mut iter = db.iterator(Some(&key(5)), Some(&key(11))).unwrap();
    let hits = collect(&mut iter);
    assert_eq!(
        hits.iter().map(|(k, _)| k.clone()).collect::<Vec<_>>(),
        vec![key(6), key(8), key(10)]
    );
}

#[test]
fn test_seek_and_rescan() {
    let (db, _path) = open_db("iter_seek");
    for i in 0..30u32 {
        db.put(&key(i), &value(i)).unwrap();
    }

    let mut iter = db.iterator(None, None).unwrap();
    iter.seek(&key(25));
    assert!(iter.valid());
    assert_eq!(iter.key().unwrap(), key(25).as_slice());

    // Seek to an absent key lands on its successor.
    db.delete(&key(27)).unwrap();
    iter.seek(&key(27));
    assert_eq!(iter.key().unwrap(), key(28).as_slice());

    iter.seek_to_first();
    assert_eq!(iter.key().unwrap(), key(0).as_slice());

    iter.seek_to_last();
    assert_eq!(iter.key().unwrap(), key(29).as_slice());
    iter.next();
    assert!(!iter.valid());
}

#[test]
fn test_seek_to_last_respects_end_bound() {
    let (db, _path) = open_db("iter_last_bound");
    for i in 0..30u32 {
        db.put(&key(i), &value(i)).unwrap();
    }
    let mut iter = db.iterator(None, Some(&key(17))).unwrap();
    iter.seek_to_last();
    assert_eq!(iter.key().unwrap(), key(16).as_slice());
}

#[test]
fn test_closed_iterator_is_invalid() {
    let (db, _path) = open_db("iter_closed");
    db.put(b"a", b"1").unwrap();
    let mut iter = db.iterator(None, None).unwrap();
    assert!(iter.valid());
    iter.close();
    assert!(!iter.valid());
    assert!(iter.key().is_none());
}

/// Iterator fidelity on a multi-leaf tree: every key exactly once, in
/// order, none skipped.
#[test]
fn test_scan_across_many_leaves() {
    let path = temp_path("iter_leaves");
    let db = Database::open(&path, small_tree_config()).unwrap();

    let mut rng = StdRng::seed_from_u64(42);
    let mut ids: Vec<u32> = (0..800).collect();
    ids.shuffle(&mut rng);
    for &i in &ids {
        db.put(&key(i), &value(i)).unwrap();
    }

    let mut iter = db.iterator(None, None).unwrap();
    let all = collect(&mut iter);
    assert_eq!(all.len(), 800);
    for (i, (k, _)) in all.iter().enumerate() {
        assert_eq!(k, &key(i as u32));
    }

    // And a bounded sub-scan of the same tree.
    let mut iter = db.iterator(Some(&key(123)), Some(&key(456))).unwrap();
    let slice = collect(&mut iter);
    assert_eq!(slice.len(), 333);
    assert_eq!(slice.first().unwrap().0, key(123));
    assert_eq!(slice.last().unwrap().0, key(455));
}
