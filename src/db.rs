//! The database handle: component wiring, the public key-value API,
//! transactions, iteration, and the background workers.
//!
//! Everything hangs off the handle; there is no process-wide state.
//! `open` runs recovery when the previous shutdown was not clean, then
//! starts the WAL flusher, the deadlock detector and the checkpointer.
//! `close` (or drop) stops them, rolls back stragglers, flushes, writes
//! a final checkpoint and marks the shutdown clean.

use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam::channel::{bounded, Receiver, RecvTimeoutError, Sender};
use log::{debug, error, info, warn};

use crate::btree::iter::TreeCursor;
use crate::btree::tree::BTree;
use crate::config::{Config, TxnOptions};
use crate::error::{Error, Result};
use crate::storage::buffer_pool::{BufferPool, BufferPoolStats};
use crate::storage::disk::{DiskManager, DiskStats};
use crate::storage::page::{PageId, PAGE_SIZE};
use crate::storage::page_store::PageStore;
use crate::txn::locks::LockManager;
use crate::txn::wait_for::WaitForGraph;
use crate::txn::{TxnCtx, TxnManager};
use crate::wal::log_manager::LogManager;
use crate::wal::record::{CheckpointPayload, LogRecordKind, Lsn, NO_LSN};
use crate::wal::recovery;

/// How often the WAL flusher forces buffered records to disk.
const WAL_FLUSH_INTERVAL: Duration = Duration::from_millis(50);
/// How often the checkpointer runs when nothing forces one earlier.
const CHECKPOINT_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, Default)]
pub struct DatabaseStats {
    pub key_count: i64,
    pub data_size: u64,
    pub page_count: u32,
    pub free_page_count: u32,
    pub txn_count: usize,
}

pub(crate) struct Engine {
    pub(crate) config: Config,
    pub(crate) disk: Arc<DiskManager>,
    pub(crate) wal: Arc<LogManager>,
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) store: Arc<PageStore>,
    pub(crate) tree: BTree,
    pub(crate) txns: TxnManager,
    last_checkpoint_lsn: AtomicU64,
    closed: AtomicBool,
    read_gate: Gate,
    write_gate: Gate,
}

pub struct Database {
    engine: Arc<Engine>,
    shutdown: Mutex<Option<Sender<()>>>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl Database {
    pub fn open(path: impl AsRef<Path>, config: Config) -> Result<Self> {
        config.validate()?;

        let disk = Arc::new(DiskManager::open(path.as_ref(), &config)?);
        let fresh = disk.page_count() == 0;
        if fresh {
            if config.read_only {
                return Err(Error::StorageUnavailable {
                    reason: "cannot create a database in read-only mode".to_string(),
                });
            }
            PageStore::initialize(&disk)?;
        }
        disk.check_integrity()?;

        let wal = Arc::new(LogManager::open(disk.path())?);

        let mut recovered_max_page: Option<PageId> = None;
        let mut last_checkpoint = 0;
        if !fresh {
            let meta = PageStore::read_meta_state(&disk)?;
            last_checkpoint = meta.last_checkpoint_lsn;
            if !meta.clean_shutdown {
                if config.read_only {
                    return Err(Error::StorageUnavailable {
                        reason: "recovery required but the database is read-only".to_string(),
                    });
                }
                info!("unclean shutdown detected, running recovery");
                let report = recovery::recover(&disk, &wal)?;
                recovered_max_page = Some(report.max_page_id);
            }
        }

        let pool = Arc::new(BufferPool::new(
            Arc::clone(&disk),
            Arc::clone(&wal),
            config.frame_count(),
        ));
        let store = Arc::new(PageStore::load(Arc::clone(&pool), Arc::clone(&disk))?);
        let locks = Arc::new(LockManager::new());
        let tree_latch = Arc::new(std::sync::RwLock::new(()));
        let tree = BTree::new(
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&wal),
            Arc::clone(&locks),
            Arc::clone(&tree_latch),
            &config,
        );
        let txns = TxnManager::new(
            Arc::clone(&wal),
            Arc::clone(&pool),
            Arc::clone(&store),
            Arc::clone(&locks),
            tree_latch,
            &config,
        );

        if let Some(max_page) = recovered_max_page {
            store.ensure_next_page_id(max_page + 1);
            store.rebuild_free_list()?;
            let keys = tree.count_keys()?;
            store.set_num_keys(keys);
            info!("rebuilt counters after recovery: {} keys", keys);
        }

        let engine = Arc::new(Engine {
            read_gate: Gate::new(config.max_concurrent_reads),
            write_gate: Gate::new(config.max_concurrent_writes),
            config,
            disk,
            wal,
            pool,
            store,
            tree,
            txns,
            last_checkpoint_lsn: AtomicU64::new(last_checkpoint),
            closed: AtomicBool::new(false),
        });

        // Mark the file as open; a crash from here on triggers
        // recovery.
        if !engine.config.read_only {
            engine.store.save_meta(false, last_checkpoint)?;
        }

        let db = Self {
            engine,
            shutdown: Mutex::new(None),
            workers: Mutex::new(Vec::new()),
        };
        if !db.engine.config.read_only {
            db.start_workers();
        }
        info!("database open at {:?}", db.engine.disk.path());
        Ok(db)
    }

    fn start_workers(&self) {
        let (tx, rx) = bounded::<()>(0);
        *self.shutdown.lock().unwrap() = Some(tx);
        let mut workers = self.workers.lock().unwrap();

        // WAL flusher: bounds how much of the tail a crash can lose
        // between commits.
        workers.push(spawn_worker(
            "wal-flusher",
            rx.clone(),
            WAL_FLUSH_INTERVAL,
            {
                let engine = Arc::clone(&self.engine);
                move || {
                    if let Err(e) = engine.wal.flush_all() {
                        warn!("wal flusher: {}", e);
                    }
                }
            },
        ));

        if self.engine.config.deadlock_detection_enabled {
            workers.push(spawn_worker(
                "deadlock-detector",
                rx.clone(),
                self.engine.config.deadlock_detection_interval,
                {
                    let engine = Arc::clone(&self.engine);
                    move || {
                        let edges = engine.txns.locks.wait_for_edges();
                        if edges.is_empty() {
                            return;
                        }
                        if let Some(cycle) = WaitForGraph::from_edges(&edges).find_cycle() {
                            // Youngest victim: ids are assigned
                            // monotonically.
                            let victim = *cycle.iter().max().unwrap();
                            info!("deadlock cycle {:?}, aborting txn {}", cycle, victim);
                            engine.txns.locks.doom(victim);
                        }
                    }
                },
            ));
        }

        workers.push(spawn_worker("checkpointer", rx, CHECKPOINT_INTERVAL, {
            let engine = Arc::clone(&self.engine);
            move || {
                if let Err(e) = checkpoint(&engine) {
                    warn!("checkpointer: {}", e);
                }
            }
        }));
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let engine = self.engine()?;
        let _gate = engine.write_gate.enter();
        engine.check_writable()?;
        let id = engine.txns.begin(TxnOptions::default())?;
        match engine
            .txns
            .with_op(id, |ctx| engine.tree.put(ctx, key, value))
        {
            Ok(()) => engine.txns.commit(id),
            Err(e) => {
                rollback_quietly(engine, id);
                Err(e)
            }
        }
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let engine = self.engine()?;
        let _gate = engine.read_gate.enter();
        let txn = engine.txns.read_ctx(None);
        let result = engine.tree.get(&txn, key);
        engine.txns.locks.release_all(txn.id);
        result
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        let engine = self.engine()?;
        let _gate = engine.write_gate.enter();
        engine.check_writable()?;
        let id = engine.txns.begin(TxnOptions::default())?;
        match engine.txns.with_op(id, |ctx| engine.tree.delete(ctx, key)) {
            Ok(()) => engine.txns.commit(id),
            Err(e) => {
                rollback_quietly(engine, id);
                Err(e)
            }
        }
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let engine = self.engine()?;
        let _gate = engine.read_gate.enter();
        let txn = engine.txns.read_ctx(None);
        let result = engine.tree.exists(&txn, key);
        engine.txns.locks.release_all(txn.id);
        result
    }

    /// Forward iterator over `[start, end)`; `None` bounds are open.
    pub fn iterator(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> Result<DbIterator> {
        let engine = self.engine()?;
        let txn = engine.txns.read_ctx(None);
        let mut cursor = TreeCursor::new(start.unwrap_or(&[]), end);
        let mut error = None;
        if let Err(e) = cursor.seek_to_first(&engine.tree, &txn) {
            error = Some(e);
        }
        Ok(DbIterator {
            engine: Arc::clone(engine),
            txn,
            cursor,
            closed: false,
            error,
        })
    }

    pub fn begin(&self, opts: TxnOptions) -> Result<Transaction> {
        let engine = self.engine()?;
        engine.check_writable()?;
        let id = engine.txns.begin(opts)?;
        Ok(Transaction {
            engine: Arc::clone(engine),
            id,
            finished: false,
        })
    }

    pub fn stats(&self) -> Result<DatabaseStats> {
        let engine = self.engine()?;
        let page_count = engine.disk.page_count();
        Ok(DatabaseStats {
            key_count: engine.store.num_keys(),
            data_size: page_count as u64 * PAGE_SIZE as u64,
            page_count,
            free_page_count: engine.store.free_page_count(),
            txn_count: engine.txns.active_count(),
        })
    }

    pub fn disk_stats(&self) -> Result<DiskStats> {
        Ok(self.engine()?.disk.stats())
    }

    pub fn buffer_pool_stats(&self) -> Result<BufferPoolStats> {
        Ok(self.engine()?.pool.stats())
    }

    /// File-level integrity check (size is a whole number of pages).
    pub fn check_integrity(&self) -> Result<()> {
        self.engine()?.disk.check_integrity()
    }

    /// Deep structural check of the tree invariants. Expensive; meant
    /// for tests and offline verification.
    pub fn verify_structure(&self) -> Result<()> {
        self.engine()?.tree.check_structure()
    }

    /// Takes a fuzzy checkpoint now and reclaims the log head.
    pub fn checkpoint(&self) -> Result<()> {
        let engine = self.engine()?;
        engine.check_writable()?;
        checkpoint(engine)?;
        Ok(())
    }

    pub fn close(&self) -> Result<()> {
        if self.engine.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Stop the workers: dropping the sender closes the channel.
        *self.shutdown.lock().unwrap() = None;
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }

        if self.engine.config.read_only {
            return self.engine.disk.close();
        }

        for id in self.engine.txns.active_ids() {
            warn!("rolling back transaction {} left open at close", id);
            let _ = self.engine.txns.abort(id);
        }

        let lsn = checkpoint(&self.engine)?;
        self.engine.store.save_meta(true, lsn)?;
        self.engine.disk.close()?;
        info!("database closed cleanly");
        Ok(())
    }

    /// Tears the handle down as a crash would: background workers stop,
    /// but nothing is flushed, no checkpoint is taken and the
    /// clean-shutdown marker stays unset, so the next open runs
    /// recovery. The file lock is released so the same process can
    /// reopen. For crash testing.
    #[doc(hidden)]
    pub fn simulate_crash(&self) {
        if self.engine.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        *self.shutdown.lock().unwrap() = None;
        for worker in self.workers.lock().unwrap().drain(..) {
            let _ = worker.join();
        }
        let _ = self.engine.disk.close();
    }

    fn engine(&self) -> Result<&Arc<Engine>> {
        if self.engine.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(&self.engine)
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            error!("close on drop failed: {}", e);
        }
    }
}

impl Engine {
    fn check_writable(&self) -> Result<()> {
        if self.config.read_only {
            return Err(Error::ReadOnly);
        }
        Ok(())
    }
}

/// Emits a checkpoint record carrying the transaction-table and
/// dirty-page-table snapshots, flushes every dirty page (honoring the
/// WAL rule), persists the meta page, and compacts the log below the
/// reclaim horizon.
fn checkpoint(engine: &Engine) -> Result<Lsn> {
    let payload = CheckpointPayload {
        active_txns: engine.txns.active_snapshot(),
        dirty_pages: engine.pool.dirty_page_table(),
    };
    let lsn = engine
        .wal
        .append(LogRecordKind::Checkpoint, 0, NO_LSN, payload.encode())?;
    engine.wal.flush_all()?;
    engine.pool.flush_all()?;
    engine.disk.sync()?;
    engine.last_checkpoint_lsn.store(lsn, Ordering::Release);
    engine.store.save_meta(false, lsn)?;

    // Records older than the checkpoint are reclaimable, except those
    // a still-active transaction may need for rollback.
    let horizon = engine
        .txns
        .min_active_first_lsn()
        .map_or(lsn, |oldest| oldest.min(lsn));
    engine.wal.compact(horizon)?;
    debug!("checkpoint at lsn {}", lsn);
    Ok(lsn)
}

fn rollback_quietly(engine: &Engine, id: u64) {
    if let Err(e) = engine.txns.abort(id) {
        warn!("rollback of txn {} failed: {}", id, e);
    }
}

fn spawn_worker(
    name: &'static str,
    shutdown: Receiver<()>,
    interval: Duration,
    mut work: impl FnMut() + Send + 'static,
) -> JoinHandle<()> {
    std::thread::Builder::new()
        .name(name.to_string())
        .spawn(move || {
            debug!("{} started", name);
            loop {
                match shutdown.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => work(),
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
            }
            debug!("{} stopped", name);
        })
        .expect("failed to spawn background worker")
}

/// An explicit transaction. Dropping it without `commit` rolls it
/// back.
pub struct Transaction {
    engine: Arc<Engine>,
    id: u64,
    finished: bool,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn put(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.engine
            .txns
            .with_op(self.id, |ctx| self.engine.tree.put(ctx, key, value))
    }

    pub fn get(&self, key: &[u8]) -> Result<Vec<u8>> {
        let txn = self.engine.txns.ctx(self.id)?;
        self.engine.tree.get(&txn, key)
    }

    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.engine
            .txns
            .with_op(self.id, |ctx| self.engine.tree.delete(ctx, key))
    }

    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        let txn = self.engine.txns.ctx(self.id)?;
        self.engine.tree.exists(&txn, key)
    }

    pub fn commit(mut self) -> Result<()> {
        self.finished = true;
        match self.engine.txns.commit(self.id) {
            Ok(()) => Ok(()),
            Err(e) => {
                // A failed commit must not leave the transaction's
                // locks and writes dangling.
                rollback_quietly(&self.engine, self.id);
                Err(e)
            }
        }
    }

    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        self.engine.txns.abort(self.id)
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if !self.finished {
            rollback_quietly(&self.engine, self.id);
        }
    }
}

/// Forward range iterator. Mirrors the cursor API: `valid` / `next` /
/// `key` / `value` plus seeks; errors park in `error()` and invalidate
/// the iterator.
pub struct DbIterator {
    engine: Arc<Engine>,
    txn: TxnCtx,
    cursor: TreeCursor,
    closed: bool,
    error: Option<Error>,
}

impl DbIterator {
    pub fn valid(&self) -> bool {
        !self.closed && self.error.is_none() && self.cursor.valid()
    }

    pub fn key(&self) -> Option<&[u8]> {
        if self.valid() {
            self.cursor.key()
        } else {
            None
        }
    }

    pub fn value(&self) -> Option<&[u8]> {
        if self.valid() {
            self.cursor.value()
        } else {
            None
        }
    }

    pub fn next(&mut self) {
        if self.closed || self.error.is_some() {
            return;
        }
        if let Err(e) = self.cursor.advance(&self.engine.tree, &self.txn) {
            self.error = Some(e);
        }
    }

    pub fn seek(&mut self, target: &[u8]) {
        if self.closed {
            self.error = Some(Error::IteratorClosed);
            return;
        }
        self.error = None;
        if let Err(e) = self.cursor.seek(&self.engine.tree, &self.txn, target) {
            self.error = Some(e);
        }
    }

    pub fn seek_to_first(&mut self) {
        if self.closed {
            self.error = Some(Error::IteratorClosed);
            return;
        }
        self.error = None;
        if let Err(e) = self.cursor.seek_to_first(&self.engine.tree, &self.txn) {
            self.error = Some(e);
        }
    }

    pub fn seek_to_last(&mut self) {
        if self.closed {
            self.error = Some(Error::IteratorClosed);
            return;
        }
        self.error = None;
        if let Err(e) = self.cursor.seek_to_last(&self.engine.tree, &self.txn) {
            self.error = Some(e);
        }
    }

    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    pub fn close(&mut self) {
        if !self.closed {
            self.engine.txns.locks.release_all(self.txn.id);
            self.closed = true;
        }
    }
}

impl Drop for DbIterator {
    fn drop(&mut self) {
        self.close();
    }
}

/// Counting gate bounding concurrent operations; 0 means unlimited.
struct Gate {
    limit: usize,
    count: Mutex<usize>,
    released: Condvar,
}

struct GateGuard<'a>(Option<&'a Gate>);

impl Gate {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            count: Mutex::new(0),
            released: Condvar::new(),
        }
    }

    fn enter(&self) -> GateGuard<'_> {
        if self.limit == 0 {
            return GateGuard(None);
        }
        let mut count = self.count.lock().unwrap();
        while *count >= self.limit {
            count = self.released.wait(count).unwrap();
        }
        *count += 1;
        GateGuard(Some(self))
    }
}

impl Drop for GateGuard<'_> {
    fn drop(&mut self) {
        if let Some(gate) = self.0 {
            let mut count = gate.count.lock().unwrap();
            *count -= 1;
            gate.released.notify_one();
        }
    }
}
