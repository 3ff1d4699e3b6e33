//! Transaction lifecycle: begin, commit, abort, undo chains.
//!
//! Strict two-phase locking: X locks always, and S locks under
//! repeatable read and above, are held until transaction end. Aborts
//! walk the in-memory undo chain backwards, restore before-images and
//! emit compensation records so rollback itself survives a crash.

pub mod locks;
pub mod wait_for;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use log::{debug, info};

use crate::config::{Config, IsolationLevel, TxnOptions};
use crate::error::{Error, Result};
use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::{Page, PageId};
use crate::storage::page_store::PageStore;
use crate::txn::locks::LockManager;
use crate::wal::log_manager::LogManager;
use crate::wal::record::{CompensationPayload, LogRecordKind, Lsn, NO_LSN};

/// What a tree operation needs to know about its transaction.
#[derive(Clone, Copy)]
pub struct TxnCtx {
    pub id: u64,
    pub isolation: IsolationLevel,
    pub deadline: Option<Instant>,
}

/// One entry of a transaction's in-memory undo chain.
pub struct UndoEntry {
    pub lsn: Lsn,
    pub page_id: PageId,
    pub before: Vec<u8>,
}

/// Mutable per-operation view of a transaction, lent to the tree.
pub struct OpCtx<'a> {
    pub txn: TxnCtx,
    pub last_lsn: &'a mut Lsn,
    pub undo: &'a mut Vec<UndoEntry>,
    /// Pages to return to the free list if the transaction commits.
    pub freed: &'a mut Vec<PageId>,
    /// Net key-count change, reversed on abort.
    pub key_delta: &'a mut i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Committed,
    Aborted,
}

struct TxnRecord {
    isolation: IsolationLevel,
    deadline: Option<Instant>,
    start_time: Instant,
    state: TxnState,
    first_lsn: Lsn,
    last_lsn: Lsn,
    undo: Vec<UndoEntry>,
    freed: Vec<PageId>,
    key_delta: i64,
}

pub struct TxnManager {
    next_id: AtomicU64,
    registry: Mutex<HashMap<u64, Arc<Mutex<TxnRecord>>>>,
    pub locks: Arc<LockManager>,
    wal: Arc<LogManager>,
    pool: Arc<BufferPool>,
    store: Arc<PageStore>,
    /// The tree's structural latch; held exclusively while rollback
    /// rewrites pages so readers never see a half-restored tree.
    tree_latch: Arc<RwLock<()>>,
    default_isolation: IsolationLevel,
    default_timeout: Option<Duration>,
    max_active: usize,
}

impl TxnManager {
    pub fn new(
        wal: Arc<LogManager>,
        pool: Arc<BufferPool>,
        store: Arc<PageStore>,
        locks: Arc<LockManager>,
        tree_latch: Arc<RwLock<()>>,
        config: &Config,
    ) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            registry: Mutex::new(HashMap::new()),
            locks,
            wal,
            pool,
            store,
            tree_latch,
            default_isolation: config.default_isolation_level,
            default_timeout: config.transaction_timeout,
            max_active: config.max_active_transactions,
        }
    }

    pub fn begin(&self, opts: TxnOptions) -> Result<u64> {
        {
            let registry = self.registry.lock().unwrap();
            if self.max_active > 0 && registry.len() >= self.max_active {
                return Err(Error::StorageUnavailable {
                    reason: format!("{} active transactions, limit reached", registry.len()),
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let begin_lsn = self.wal.append(LogRecordKind::Begin, id, NO_LSN, Vec::new())?;

        let timeout = opts.timeout.or(self.default_timeout);
        let record = TxnRecord {
            isolation: opts.isolation.unwrap_or(self.default_isolation),
            deadline: timeout.map(|t| Instant::now() + t),
            start_time: Instant::now(),
            state: TxnState::Active,
            first_lsn: begin_lsn,
            last_lsn: begin_lsn,
            undo: Vec::new(),
            freed: Vec::new(),
            key_delta: 0,
        };
        self.registry
            .lock()
            .unwrap()
            .insert(id, Arc::new(Mutex::new(record)));
        debug!("txn {} began", id);
        Ok(id)
    }

    /// Runs one operation inside the transaction. The operation works
    /// on local accumulators which are merged back afterwards, so the
    /// record mutex is never held across a lock wait; transactions are
    /// single-threaded by contract, so nothing else mutates the record
    /// meanwhile. The merge happens even when the operation fails:
    /// whatever it logged must stay on the undo chain for rollback.
    pub fn with_op<T>(&self, id: u64, f: impl FnOnce(&mut OpCtx<'_>) -> Result<T>) -> Result<T> {
        let cell = self.record(id)?;
        let txn = {
            let rec = cell.lock().unwrap();
            if rec.state != TxnState::Active {
                return Err(Error::TxnConflict { txn_id: id });
            }
            if let Some(deadline) = rec.deadline {
                if Instant::now() >= deadline {
                    return Err(Error::TxnTimeout { txn_id: id });
                }
            }
            TxnCtx {
                id,
                isolation: rec.isolation,
                deadline: rec.deadline,
            }
        };

        let mut last_lsn = cell.lock().unwrap().last_lsn;
        let mut undo = Vec::new();
        let mut freed = Vec::new();
        let mut key_delta = 0i64;
        let result = {
            let mut ctx = OpCtx {
                txn,
                last_lsn: &mut last_lsn,
                undo: &mut undo,
                freed: &mut freed,
                key_delta: &mut key_delta,
            };
            f(&mut ctx)
        };

        let mut rec = cell.lock().unwrap();
        rec.last_lsn = last_lsn;
        rec.undo.append(&mut undo);
        rec.freed.append(&mut freed);
        rec.key_delta += key_delta;
        result
    }

    /// A lightweight context for auto-commit reads: a unique id for the
    /// lock manager, no registry entry, no begin record. The caller
    /// releases the locks when the read finishes.
    pub fn read_ctx(&self, isolation: Option<IsolationLevel>) -> TxnCtx {
        TxnCtx {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            isolation: isolation.unwrap_or(self.default_isolation),
            deadline: self.default_timeout.map(|t| Instant::now() + t),
        }
    }

    pub fn ctx(&self, id: u64) -> Result<TxnCtx> {
        let cell = self.record(id)?;
        let rec = cell.lock().unwrap();
        if rec.state != TxnState::Active {
            return Err(Error::TxnConflict { txn_id: id });
        }
        Ok(TxnCtx {
            id,
            isolation: rec.isolation,
            deadline: rec.deadline,
        })
    }

    /// Appends the commit record, forces the log through it (several
    /// committers share one fsync), applies deferred page frees and
    /// releases all locks.
    pub fn commit(&self, id: u64) -> Result<()> {
        let cell = self.record(id)?;
        let mut rec = cell.lock().unwrap();
        if rec.state != TxnState::Active {
            return Err(Error::TxnConflict { txn_id: id });
        }

        let commit_lsn = self
            .wal
            .append(LogRecordKind::Commit, id, rec.last_lsn, Vec::new())?;
        self.wal.flush_until(commit_lsn)?;

        for pid in rec.freed.drain(..) {
            self.store.free_page(pid)?;
        }

        rec.state = TxnState::Committed;
        drop(rec);
        self.locks.release_all(id);
        self.registry.lock().unwrap().remove(&id);
        debug!("txn {} committed at lsn {}", id, commit_lsn);
        Ok(())
    }

    /// Rolls the transaction back: walks the undo chain in reverse,
    /// restores each before-image, and logs a compensation record per
    /// undo so recovery never repeats completed undo work.
    pub fn abort(&self, id: u64) -> Result<()> {
        let cell = self.record(id)?;
        let mut rec = cell.lock().unwrap();
        if rec.state != TxnState::Active {
            return Err(Error::TxnConflict { txn_id: id });
        }

        let entries = std::mem::take(&mut rec.undo);
        {
            // Restores swap whole pages; the exclusive latch keeps
            // concurrent descents from seeing a half-rolled-back tree.
            let _latch = self.tree_latch.write().unwrap();
            for (i, entry) in entries.iter().enumerate().rev() {
                let undo_next = if i == 0 { NO_LSN } else { entries[i - 1].lsn };
                let payload = CompensationPayload {
                    page_id: entry.page_id,
                    undo_next_lsn: undo_next,
                    image: entry.before.clone(),
                };
                let clr_lsn = self.wal.append(
                    LogRecordKind::Compensation,
                    id,
                    rec.last_lsn,
                    payload.encode(),
                )?;
                rec.last_lsn = clr_lsn;

                let page_rc = self.pool.get_page(entry.page_id)?;
                {
                    let mut page = page_rc.write().unwrap();
                    let mut restored = Page::deserialize(&entry.before, false)?;
                    restored.lsn = clr_lsn;
                    *page = restored;
                }
                self.pool.unpin_page(entry.page_id, true)?;
            }
        }

        self.wal
            .append(LogRecordKind::Abort, id, rec.last_lsn, Vec::new())?;

        // Deferred frees die with the transaction; the pages they named
        // are reachable again after the undo above.
        rec.freed.clear();
        self.store.add_keys(-rec.key_delta);
        rec.state = TxnState::Aborted;
        let lifetime = rec.start_time.elapsed();
        drop(rec);

        self.locks.release_all(id);
        self.registry.lock().unwrap().remove(&id);
        info!("txn {} aborted and rolled back after {:?}", id, lifetime);
        Ok(())
    }

    pub fn active_count(&self) -> usize {
        self.registry.lock().unwrap().len()
    }

    /// Transaction-table snapshot for a checkpoint record. The
    /// registry lock is dropped before the per-record locks are taken,
    /// so commits are never stuck behind a snapshot.
    pub fn active_snapshot(&self) -> Vec<(u64, Lsn)> {
        let cells: Vec<(u64, Arc<Mutex<TxnRecord>>)> = {
            let registry = self.registry.lock().unwrap();
            registry
                .iter()
                .map(|(&id, cell)| (id, Arc::clone(cell)))
                .collect()
        };
        cells
            .into_iter()
            .map(|(id, cell)| (id, cell.lock().unwrap().last_lsn))
            .collect()
    }

    /// Lowest begin-LSN among active transactions; bounds how much log
    /// a checkpoint may reclaim.
    pub fn min_active_first_lsn(&self) -> Option<Lsn> {
        let cells: Vec<Arc<Mutex<TxnRecord>>> = {
            let registry = self.registry.lock().unwrap();
            registry.values().map(Arc::clone).collect()
        };
        cells
            .into_iter()
            .map(|cell| cell.lock().unwrap().first_lsn)
            .min()
    }

    /// Ids of all active transactions, oldest first.
    pub fn active_ids(&self) -> Vec<u64> {
        let registry = self.registry.lock().unwrap();
        let mut ids: Vec<u64> = registry.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    fn record(&self, id: u64) -> Result<Arc<Mutex<TxnRecord>>> {
        self.registry
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or(Error::TxnConflict { txn_id: id })
    }
}
