//! Concurrency: isolation levels, deadlock resolution, lock timeouts,
//! and multi-threaded workloads.

mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use burrow::{Config, Database, Error, IsolationLevel, TxnOptions};
use common::{key, open_db, temp_path, value};

fn opts(isolation: IsolationLevel) -> TxnOptions {
    TxnOptions {
        isolation: Some(isolation),
        timeout: None,
    }
}

#[test]
fn test_transaction_commit_and_rollback() {
    let (db, _path) = open_db("cc_txn_basic");

    let txn = db.begin(Default::default()).unwrap();
    txn.put(b"a", b"1").unwrap();
    // The transaction reads its own writes.
    assert_eq!(txn.get(b"a").unwrap(), b"1");
    txn.commit().unwrap();
    assert_eq!(db.get(b"a").unwrap(), b"1");

    let txn = db.begin(Default::default()).unwrap();
    txn.put(b"b", b"2").unwrap();
    txn.delete(b"a").unwrap();
    txn.rollback().unwrap();

    // No trace of the rolled-back transaction.
    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert!(matches!(db.get(b"b"), Err(Error::KeyNotFound)));
    assert_eq!(db.stats().unwrap().key_count, 1);
}

#[test]
fn test_drop_rolls_back() {
    let (db, _path) = open_db("cc_drop");
    {
        let txn = db.begin(Default::default()).unwrap();
        txn.put(b"ghost", b"boo").unwrap();
    }
    assert!(!db.exists(b"ghost").unwrap());
    assert_eq!(db.stats().unwrap().txn_count, 0);
}

#[test]
fn test_read_uncommitted_sees_in_flight_writes() {
    let (db, _path) = open_db("cc_ru");
    db.put(b"k", b"old").unwrap();

    let writer = db.begin(Default::default()).unwrap();
    writer.put(b"k", b"new").unwrap();

    let reader = db.begin(opts(IsolationLevel::ReadUncommitted)).unwrap();
    assert_eq!(reader.get(b"k").unwrap(), b"new");
    reader.commit().unwrap();

    writer.rollback().unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"old");
}

#[test]
fn test_read_committed_allows_non_repeatable_reads() {
    let (db, _path) = open_db("cc_rc");
    let db = Arc::new(db);
    db.put(b"k", b"v1").unwrap();

    let reader = db.begin(opts(IsolationLevel::ReadCommitted)).unwrap();
    assert_eq!(reader.get(b"k").unwrap(), b"v1");

    // A read-committed reader holds no lock after the read, so a
    // concurrent writer gets through immediately.
    let db2 = Arc::clone(&db);
    let writer = thread::spawn(move || db2.put(b"k", b"v2"));
    writer.join().unwrap().unwrap();

    assert_eq!(reader.get(b"k").unwrap(), b"v2");
    reader.commit().unwrap();
}

#[test]
fn test_repeatable_read_blocks_writer() {
    let (db, _path) = open_db("cc_rr");
    let db = Arc::new(db);
    db.put(b"k", b"v1").unwrap();

    let reader = db.begin(opts(IsolationLevel::RepeatableRead)).unwrap();
    assert_eq!(reader.get(b"k").unwrap(), b"v1");

    let db2 = Arc::clone(&db);
    let writer = thread::spawn(move || db2.put(b"k", b"v2"));
    thread::sleep(Duration::from_millis(150));
    assert!(!writer.is_finished(), "writer must wait for the long S lock");

    // Reads stay repeatable while the writer waits.
    assert_eq!(reader.get(b"k").unwrap(), b"v1");
    reader.commit().unwrap();

    writer.join().unwrap().unwrap();
    assert_eq!(db.get(b"k").unwrap(), b"v2");
}

/// Two read-then-write transactions on the same data deadlock; the
/// detector aborts exactly one within its interval and the other
/// commits.
#[test]
fn test_deadlock_detected_and_resolved() {
    let (db, _path) = open_db("cc_deadlock");
    let db = Arc::new(db);
    db.put(b"r1", b"a").unwrap();
    db.put(b"r2", b"b").unwrap();

    let barrier = Arc::new(Barrier::new(2));
    let deadlocks = Arc::new(AtomicU32::new(0));
    let commits = Arc::new(AtomicU32::new(0));

    let mut handles = Vec::new();
    for (mine, theirs) in [(&b"r1"[..], &b"r2"[..]), (&b"r2"[..], &b"r1"[..])] {
        let db = Arc::clone(&db);
        let barrier = Arc::clone(&barrier);
        let deadlocks = Arc::clone(&deadlocks);
        let commits = Arc::clone(&commits);
        let (mine, theirs) = (mine.to_vec(), theirs.to_vec());
        handles.push(thread::spawn(move || {
            let txn = db.begin(opts(IsolationLevel::RepeatableRead)).unwrap();
            txn.get(&mine).unwrap();
            barrier.wait();
            match txn.put(&theirs, b"mine") {
                Ok(()) => {
                    txn.commit().unwrap();
                    commits.fetch_add(1, Ordering::SeqCst);
                }
                Err(Error::TxnDeadlock { .. }) => {
                    txn.rollback().unwrap();
                    deadlocks.fetch_add(1, Ordering::SeqCst);
                }
                Err(e) => panic!("unexpected error: {}", e),
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(deadlocks.load(Ordering::SeqCst), 1, "exactly one victim");
    assert_eq!(commits.load(Ordering::SeqCst), 1, "survivor commits");

    // Both resources are lock-free afterwards.
    let txn = db.begin(Default::default()).unwrap();
    txn.put(b"r1", b"free").unwrap();
    txn.put(b"r2", b"free").unwrap();
    txn.commit().unwrap();
}

#[test]
fn test_lock_wait_times_out() {
    let path = temp_path("cc_timeout");
    let mut config = Config::default();
    config.transaction_timeout = Some(Duration::from_millis(200));
    config.deadlock_detection_enabled = false;
    let db = Database::open(&path, config).unwrap();

    let holder = db.begin(Default::default()).unwrap();
    holder.put(b"k", b"held").unwrap();

    // The second writer waits on the tree lock until its deadline.
    match db.put(b"other", b"blocked") {
        Err(Error::TxnTimeout { .. }) => {}
        other => panic!("expected TxnTimeout, got {:?}", other),
    }
    holder.commit().unwrap();

    db.put(b"other", b"now fine").unwrap();
}

#[test]
fn test_max_active_transactions() {
    let path = temp_path("cc_max_txn");
    let mut config = Config::default();
    config.max_active_transactions = 2;
    let db = Database::open(&path, config).unwrap();

    let _t1 = db.begin(Default::default()).unwrap();
    let _t2 = db.begin(Default::default()).unwrap();
    match db.begin(Default::default()) {
        Err(e @ Error::StorageUnavailable { .. }) => assert!(e.is_retryable()),
        other => panic!("expected StorageUnavailable, got {:?}", other.map(|_| ())),
    }
    drop(_t1);
    db.begin(Default::default()).unwrap();
}

#[test]
fn test_concurrent_disjoint_writers() {
    let (db, _path) = open_db("cc_writers");
    let db = Arc::new(db);

    let mut handles = Vec::new();
    for t in 0..4u32 {
        let db = Arc::clone(&db);
        handles.push(thread::spawn(move || {
            for i in 0..100u32 {
                let id = t * 1000 + i;
                db.put(&key(id), &value(id)).unwrap();
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    db.verify_structure().unwrap();
    assert_eq!(db.stats().unwrap().key_count, 400);
    for t in 0..4u32 {
        for i in 0..100u32 {
            let id = t * 1000 + i;
            assert_eq!(db.get(&key(id)).unwrap(), value(id));
        }
    }
}

#[test]
fn test_concurrent_readers_during_writes() {
    let (db, _path) = open_db("cc_mixed");
    let db = Arc::new(db);
    for i in 0..200u32 {
        db.put(&key(i), &value(i)).unwrap();
    }

    let stop = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();

    for _ in 0..3 {
        let db = Arc::clone(&db);
        let stop = Arc::clone(&stop);
        handles.push(thread::spawn(move || {
            while stop.load(Ordering::Relaxed) == 0 {
                // Existing keys always resolve to their original value
                // or the writer's overwrite, never garbage.
                let i = 17u32;
                let v = db.get(&key(i)).unwrap();
                assert!(v == value(i) || v == b"overwritten");
            }
        }));
    }

    for round in 0..50u32 {
        db.put(&key(17), b"overwritten").unwrap();
        db.put(&key(200 + round), &value(round)).unwrap();
    }
    stop.store(1, Ordering::Relaxed);
    for handle in handles {
        handle.join().unwrap();
    }
    db.verify_structure().unwrap();
}

/// Serializable read-modify-write increments never lose updates:
/// whatever interleaving the lock manager admits is equivalent to some
/// serial order.
#[test]
fn test_serializable_counter_increments() {
    let (db, _path) = open_db("cc_serializable");
    let db = Arc::new(db);
    db.put(b"counter", b"0").unwrap();

    let successes = Arc::new(AtomicU32::new(0));
    let mut handles = Vec::new();
    for _ in 0..4 {
        let db = Arc::clone(&db);
        let successes = Arc::clone(&successes);
        handles.push(thread::spawn(move || {
            for _ in 0..10 {
                loop {
                    let txn = match db.begin(opts(IsolationLevel::Serializable)) {
                        Ok(txn) => txn,
                        Err(e) if e.is_retryable() => continue,
                        Err(e) => panic!("begin: {}", e),
                    };
                    let step = (|| -> burrow::Result<()> {
                        let raw = txn.get(b"counter")?;
                        let n: u64 = String::from_utf8(raw).unwrap().parse().unwrap();
                        txn.put(b"counter", (n + 1).to_string().as_bytes())?;
                        Ok(())
                    })();
                    match step {
                        Ok(()) => match txn.commit() {
                            Ok(()) => {
                                successes.fetch_add(1, Ordering::SeqCst);
                                break;
                            }
                            Err(e) if e.is_retryable() => continue,
                            Err(e) => panic!("commit: {}", e),
                        },
                        Err(e) if e.is_retryable() => {
                            let _ = txn.rollback();
                            continue;
                        }
                        Err(e) => panic!("step: {}", e),
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }

    let total = successes.load(Ordering::SeqCst);
    assert_eq!(total, 40);
    let raw = db.get(b"counter").unwrap();
    let n: u64 = String::from_utf8(raw).unwrap().parse().unwrap();
    assert_eq!(n, total as u64, "no lost updates under serializable");
}
