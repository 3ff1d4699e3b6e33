//! Basic key-value semantics through the public API.

mod common;

use burrow::{Config, Database, Error};
use common::{open_db, temp_path};

#[test]
fn test_basic_crud() {
    let (db, _path) = open_db("crud_basic");
    assert_eq!(db.stats().unwrap().key_count, 0);

    db.put(b"user:1", b"alice@x").unwrap();
    assert_eq!(db.stats().unwrap().key_count, 1);

    assert_eq!(db.get(b"user:1").unwrap(), b"alice@x");
    assert!(db.exists(b"user:1").unwrap());

    db.delete(b"user:1").unwrap();
    assert!(matches!(db.get(b"user:1"), Err(Error::KeyNotFound)));
    assert!(!db.exists(b"user:1").unwrap());
    assert_eq!(db.stats().unwrap().key_count, 0);

    db.close().unwrap();
}

#[test]
fn test_overwrite_keeps_key_count() {
    let (db, _path) = open_db("crud_overwrite");

    db.put(b"color", b"red").unwrap();
    db.put(b"color", b"blue").unwrap();
    db.put(b"color", b"green").unwrap();

    assert_eq!(db.get(b"color").unwrap(), b"green");
    assert_eq!(db.stats().unwrap().key_count, 1);
}

#[test]
fn test_delete_missing_key() {
    let (db, _path) = open_db("crud_delete_missing");
    db.put(b"here", b"1").unwrap();
    assert!(matches!(db.delete(b"gone"), Err(Error::KeyNotFound)));
    // The failed delete leaves the database untouched.
    assert_eq!(db.get(b"here").unwrap(), b"1");
    assert_eq!(db.stats().unwrap().key_count, 1);
}

#[test]
fn test_key_and_value_bounds() {
    let path = temp_path("crud_bounds");
    let mut config = Config::default();
    config.max_key_size = 16;
    config.max_value_size = 32;
    let db = Database::open(&path, config).unwrap();

    assert!(matches!(db.put(b"", b"v"), Err(Error::InvalidKey { .. })));

    let max_key = vec![b'k'; 16];
    db.put(&max_key, b"v").unwrap();
    let too_long = vec![b'k'; 17];
    assert!(matches!(
        db.put(&too_long, b"v"),
        Err(Error::KeyTooLarge { len: 17, max: 16 })
    ));

    let max_value = vec![b'v'; 32];
    db.put(b"k", &max_value).unwrap();
    let oversized = vec![b'v'; 33];
    assert!(matches!(
        db.put(b"k", &oversized),
        Err(Error::ValueTooLarge { len: 33, max: 32 })
    ));

    // Empty values are legal.
    db.put(b"empty", b"").unwrap();
    assert_eq!(db.get(b"empty").unwrap(), b"");
}

#[test]
fn test_operations_after_close() {
    let (db, _path) = open_db("crud_closed");
    db.put(b"a", b"1").unwrap();
    db.close().unwrap();

    assert!(matches!(db.put(b"b", b"2"), Err(Error::Closed)));
    assert!(matches!(db.get(b"a"), Err(Error::Closed)));
    assert!(matches!(db.stats(), Err(Error::Closed)));
    // Close is idempotent.
    db.close().unwrap();
}

#[test]
fn test_second_process_locked_out() {
    let (db, path) = open_db("crud_lock");
    match Database::open(&path, Config::default()) {
        Err(Error::StorageLocked { .. }) => {}
        other => panic!("expected StorageLocked, got {:?}", other.map(|_| ())),
    }
    db.close().unwrap();
    // Released on close.
    Database::open(&path, Config::default()).unwrap();
}

#[test]
fn test_invalid_configs_rejected() {
    let path = temp_path("crud_config");

    let mut config = Config::default();
    config.page_size = 4096;
    assert!(matches!(
        Database::open(&path, config),
        Err(Error::InvalidConfig { .. })
    ));

    let mut config = Config::default();
    config.leaf_capacity = 64;
    config.max_value_size = 4096;
    assert!(matches!(
        Database::open(&path, config),
        Err(Error::InvalidConfig { .. })
    ));
}

#[test]
fn test_read_only_rejects_writes() {
    let (db, path) = open_db("crud_read_only");
    db.put(b"k", b"v").unwrap();
    db.close().unwrap();

    let mut config = Config::default();
    config.read_only = true;
    let db = Database::open(&path, config).unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"v");
    assert!(matches!(db.put(b"x", b"y"), Err(Error::ReadOnly)));
    assert!(matches!(db.delete(b"k"), Err(Error::ReadOnly)));
    assert!(matches!(db.begin(Default::default()), Err(Error::ReadOnly)));
}

#[test]
fn test_stats_track_pages_and_size() {
    let (db, _path) = open_db("crud_stats");
    for i in 0..50u32 {
        db.put(common::key(i).as_slice(), common::value(i).as_slice())
            .unwrap();
    }
    let stats = db.stats().unwrap();
    assert_eq!(stats.key_count, 50);
    assert!(stats.page_count >= 3);
    assert_eq!(stats.data_size, stats.page_count as u64 * 8192);
    assert_eq!(stats.txn_count, 0);
}

#[test]
fn test_file_layout() {
    let (db, path) = open_db("crud_layout");
    db.put(b"k", b"v").unwrap();

    let mut db_file = path.clone().into_os_string();
    db_file.push(".db");
    let mut lock_file = db_file.clone();
    lock_file.push(".lock");
    let mut wal_file = db_file.clone();
    wal_file.push(".wal");

    assert!(std::path::Path::new(&db_file).exists());
    assert!(std::path::Path::new(&lock_file).exists());
    assert!(std::path::Path::new(&wal_file).exists());

    let size = std::fs::metadata(&db_file).unwrap().len();
    assert_eq!(size % 8192, 0, "db file must be whole pages");

    db.close().unwrap();
    assert!(!std::path::Path::new(&lock_file).exists());
}
