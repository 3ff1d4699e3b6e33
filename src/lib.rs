//! burrow: an embedded key-value storage engine.
//!
//! On-disk state is a B+ tree over fixed 8 KiB pages in a single file,
//! cached by a buffer pool with LRU eviction, protected by a
//! write-ahead log with ARIES-style recovery, and exposed through ACID
//! transactions under strict two-phase locking.
//!
//! ```no_run
//! use burrow::{Config, Database};
//!
//! let db = Database::open("example.db", Config::default()).unwrap();
//! db.put(b"user:1", b"alice@example.com").unwrap();
//! assert_eq!(db.get(b"user:1").unwrap(), b"alice@example.com");
//! db.close().unwrap();
//! ```

mod btree;
mod codec;
mod config;
mod db;
mod error;
mod storage;
mod txn;
mod wal;

pub use config::{Config, IsolationLevel, RetryPolicy, TxnOptions};
pub use db::{Database, DatabaseStats, DbIterator, Transaction};
pub use error::{Error, Result};
pub use storage::buffer_pool::BufferPoolStats;
pub use storage::disk::DiskStats;
pub use storage::page::{PageId, PAGE_SIZE};

use std::time::Duration;

/// Retries `op` on retryable errors (conflicts, deadlocks, transient
/// storage pressure) with exponential backoff per the policy.
pub fn with_retry<T>(policy: &RetryPolicy, mut op: impl FnMut() -> Result<T>) -> Result<T> {
    let mut delay = policy.initial_delay;
    let mut attempt = 0;
    loop {
        match op() {
            Ok(value) => return Ok(value),
            Err(e) if e.is_retryable() && attempt < policy.max_retries => {
                attempt += 1;
                log::debug!("retry {} after {}: backing off {:?}", attempt, e, delay);
                std::thread::sleep(delay);
                let next = delay.as_secs_f64() * policy.backoff_multiplier;
                delay = Duration::from_secs_f64(next).min(policy.max_delay);
            }
            Err(e) => return Err(e),
        }
    }
}
