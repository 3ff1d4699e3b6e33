//! Shared helpers for the integration suites.
#![allow(dead_code)] // each suite uses a different subset

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Once;

use burrow::{Config, Database};

static INIT: Once = Once::new();
static COUNTER: AtomicU32 = AtomicU32::new(0);

pub fn setup() {
    INIT.call_once(|| {
        let _ = env_logger::builder().is_test(true).try_init();
    });
}

/// Fresh database path under the system temp dir, cleaned of any
/// leftovers from a previous run.
pub fn temp_path(name: &str) -> PathBuf {
    setup();
    let n = COUNTER.fetch_add(1, Ordering::Relaxed);
    let dir = std::env::temp_dir().join(format!("burrow-it-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{}-{}", name, n));
    for suffix in ["", ".db", ".db.lock", ".db.wal"] {
        let mut os = path.clone().into_os_string();
        os.push(suffix);
        let _ = std::fs::remove_file(PathBuf::from(os));
    }
    path
}

pub fn open_db(name: &str) -> (Database, PathBuf) {
    let path = temp_path(name);
    let db = Database::open(&path, Config::default()).unwrap();
    (db, path)
}

/// A configuration that splits and merges early, and evicts often.
pub fn small_tree_config() -> Config {
    let mut config = Config::default();
    config.leaf_capacity = 4;
    config.branching_factor = 4;
    config.cache_size = 64;
    config
}

pub fn key(i: u32) -> Vec<u8> {
    format!("key{:06}", i).into_bytes()
}

pub fn value(i: u32) -> Vec<u8> {
    format!("value{:06}", i).into_bytes()
}
