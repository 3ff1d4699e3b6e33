//! Transactional lock manager.
//!
//! Locks are taken on page resources and held per strict 2PL: X locks
//! to transaction end, S locks for a duration set by the isolation
//! level. Each resource has a queue whose prefix is the granted set and
//! whose suffix is FIFO waiters; a waiter is granted only when it is
//! compatible with every granted holder and every waiter ahead of it,
//! so a blocked writer blocks later readers instead of starving.
//! Upgrades (S held, X requested) jump the queue and wait only for the
//! other current holders.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::storage::page::PageId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    S,
    X,
    IS,
    IX,
    SIX,
}

impl LockMode {
    /// The lock compatibility matrix.
    pub fn compatible(held: LockMode, requested: LockMode) -> bool {
        use LockMode::*;
        match (held, requested) {
            (S, S) | (S, IS) => true,
            (X, _) | (_, X) => false,
            (IS, S) | (IS, IS) | (IS, IX) | (IS, SIX) => true,
            (IX, IS) | (IX, IX) => true,
            (SIX, IS) => true,
            _ => false,
        }
    }

    /// Whether holding `self` already satisfies a request for `other`.
    fn covers(self, other: LockMode) -> bool {
        use LockMode::*;
        if self == other {
            return true;
        }
        match (self, other) {
            (X, _) => true,
            (SIX, S) | (SIX, IS) | (SIX, IX) => true,
            (S, IS) | (IX, IS) => true,
            _ => false,
        }
    }
}

struct LockRequest {
    txn_id: u64,
    mode: LockMode,
    granted: bool,
    /// Upgrades re-use the holder's queue slot and bypass FIFO.
    upgrade: bool,
}

#[derive(Default)]
struct LockQueue {
    requests: VecDeque<LockRequest>,
}

impl LockQueue {
    fn holder(&self, txn_id: u64) -> Option<&LockRequest> {
        self.requests
            .iter()
            .find(|r| r.txn_id == txn_id && r.granted)
    }

    /// A request is grantable when it is compatible with every granted
    /// holder and, unless it is an upgrade, with every distinct waiter
    /// queued ahead of it.
    fn grantable(&self, txn_id: u64, mode: LockMode, upgrade: bool) -> bool {
        for r in &self.requests {
            if r.txn_id == txn_id {
                if !r.granted {
                    // Reached our own waiter entry; nothing ahead
                    // blocks us.
                    return true;
                }
                continue;
            }
            if r.granted {
                if !LockMode::compatible(r.mode, mode) {
                    return false;
                }
            } else if !upgrade && !LockMode::compatible(r.mode, mode) {
                return false;
            }
        }
        true
    }
}

struct LockTables {
    queues: HashMap<PageId, LockQueue>,
    held: HashMap<u64, HashSet<PageId>>,
    /// Deadlock victims; their next (or current) lock wait fails.
    doomed: HashSet<u64>,
}

pub struct LockManager {
    tables: Mutex<LockTables>,
    wakeup: Condvar,
}

impl LockManager {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(LockTables {
                queues: HashMap::new(),
                held: HashMap::new(),
                doomed: HashSet::new(),
            }),
            wakeup: Condvar::new(),
        }
    }

    /// Blocking acquisition. Fails with `TxnDeadlock` if the detector
    /// dooms this transaction while it waits, or `TxnTimeout` past the
    /// deadline.
    pub fn acquire(
        &self,
        txn_id: u64,
        resource: PageId,
        mode: LockMode,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut tables = self.tables.lock().unwrap();
        let mut enqueued = false;

        loop {
            if tables.doomed.remove(&txn_id) {
                // Drop only the waiter entry; granted locks stay until
                // the rollback releases them.
                remove_waiter(&mut tables, txn_id, resource);
                self.wakeup.notify_all();
                return Err(Error::TxnDeadlock { txn_id });
            }

            match self.try_grant(&mut tables, txn_id, resource, mode, enqueued) {
                Grant::Granted => {
                    self.wakeup.notify_all();
                    return Ok(());
                }
                Grant::MustWait => {
                    enqueued = true;
                    trace!("txn {} waits for {:?} on page {}", txn_id, mode, resource);
                    let wait = match deadline {
                        Some(d) => {
                            let now = Instant::now();
                            if now >= d {
                                remove_waiter(&mut tables, txn_id, resource);
                                self.wakeup.notify_all();
                                return Err(Error::TxnTimeout { txn_id });
                            }
                            (d - now).min(Duration::from_millis(50))
                        }
                        // Re-check periodically so a doom marker is
                        // never missed.
                        None => Duration::from_millis(50),
                    };
                    let (guard, _timeout) = self.wakeup.wait_timeout(tables, wait).unwrap();
                    tables = guard;
                }
            }
        }
    }

    /// Non-blocking acquisition; never enqueues.
    pub fn try_acquire(&self, txn_id: u64, resource: PageId, mode: LockMode) -> Result<bool> {
        let mut tables = self.tables.lock().unwrap();
        if tables.doomed.remove(&txn_id) {
            return Err(Error::TxnDeadlock { txn_id });
        }
        match self.try_grant(&mut tables, txn_id, resource, mode, false) {
            Grant::Granted => Ok(true),
            Grant::MustWait => {
                remove_waiter(&mut tables, txn_id, resource);
                Ok(false)
            }
        }
    }

    /// Releases a short read lock (Read Committed). Only an entry held
    /// in exactly S mode is dropped: when the request was satisfied by
    /// an X or SIX lock the transaction already held, that lock must
    /// survive until transaction end.
    pub fn release_shared(&self, txn_id: u64, resource: PageId) {
        let mut tables = self.tables.lock().unwrap();
        if let Some(queue) = tables.queues.get_mut(&resource) {
            let held_plain_s = queue
                .requests
                .iter()
                .any(|r| r.txn_id == txn_id && r.granted && r.mode == LockMode::S);
            if !held_plain_s {
                return;
            }
            queue
                .requests
                .retain(|r| r.txn_id != txn_id || !r.granted);
            if queue.requests.is_empty() {
                tables.queues.remove(&resource);
            }
        }
        if let Some(set) = tables.held.get_mut(&txn_id) {
            set.remove(&resource);
        }
        self.wakeup.notify_all();
    }

    /// Releases everything a transaction holds or waits for; the end
    /// of its shrinking phase.
    pub fn release_all(&self, txn_id: u64) {
        let mut tables = self.tables.lock().unwrap();
        let resources: Vec<PageId> = tables
            .held
            .remove(&txn_id)
            .map(|s| s.into_iter().collect())
            .unwrap_or_default();
        for resource in resources {
            remove_requests(&mut tables, txn_id, resource);
        }
        // Drop any in-flight waiter entries too.
        let pages: Vec<PageId> = tables.queues.keys().copied().collect();
        for page in pages {
            remove_requests(&mut tables, txn_id, page);
        }
        tables.doomed.remove(&txn_id);
        debug!("txn {} released all locks", txn_id);
        self.wakeup.notify_all();
    }

    /// Marks a transaction as a deadlock victim and wakes it.
    pub fn doom(&self, txn_id: u64) {
        let mut tables = self.tables.lock().unwrap();
        tables.doomed.insert(txn_id);
        self.wakeup.notify_all();
    }

    /// Edges `waiter -> blocker` for the deadlock detector.
    pub fn wait_for_edges(&self) -> Vec<(u64, u64)> {
        let tables = self.tables.lock().unwrap();
        let mut edges = Vec::new();
        for queue in tables.queues.values() {
            for (i, waiter) in queue.requests.iter().enumerate() {
                if waiter.granted {
                    continue;
                }
                for other in queue.requests.iter().take(if waiter.upgrade {
                    queue.requests.len()
                } else {
                    i
                }) {
                    let blocking = if other.granted || !waiter.upgrade {
                        !LockMode::compatible(other.mode, waiter.mode)
                    } else {
                        false
                    };
                    if blocking && other.txn_id != waiter.txn_id {
                        edges.push((waiter.txn_id, other.txn_id));
                    }
                }
            }
        }
        edges
    }

    fn try_grant(
        &self,
        tables: &mut LockTables,
        txn_id: u64,
        resource: PageId,
        mode: LockMode,
        already_enqueued: bool,
    ) -> Grant {
        let queue = tables.queues.entry(resource).or_default();

        if let Some(holder) = queue.holder(txn_id) {
            if holder.mode.covers(mode) {
                return Grant::Granted;
            }
            // Upgrade: grantable once no other holder conflicts. The
            // holder entry is promoted in place and any waiter entry
            // from an earlier blocked attempt is dropped.
            if queue.grantable(txn_id, mode, true) {
                let holder = queue
                    .requests
                    .iter_mut()
                    .find(|r| r.txn_id == txn_id && r.granted)
                    .unwrap();
                holder.mode = mode;
                queue
                    .requests
                    .retain(|r| r.txn_id != txn_id || r.granted);
                return Grant::Granted;
            }
            if !already_enqueued {
                queue.requests.push_back(LockRequest {
                    txn_id,
                    mode,
                    granted: false,
                    upgrade: true,
                });
            }
            return Grant::MustWait;
        }

        if queue.grantable(txn_id, mode, false) {
            // Replace a waiter entry with a granted one, or append.
            if let Some(pos) = queue
                .requests
                .iter()
                .position(|r| r.txn_id == txn_id && !r.granted)
            {
                queue.requests[pos].granted = true;
                queue.requests[pos].mode = mode;
            } else {
                queue.requests.push_back(LockRequest {
                    txn_id,
                    mode,
                    granted: true,
                    upgrade: false,
                });
            }
            tables.held.entry(txn_id).or_default().insert(resource);
            return Grant::Granted;
        }

        if !already_enqueued {
            queue.requests.push_back(LockRequest {
                txn_id,
                mode,
                granted: false,
                upgrade: false,
            });
        }
        Grant::MustWait
    }
}

enum Grant {
    Granted,
    MustWait,
}

fn remove_requests(tables: &mut LockTables, txn_id: u64, resource: PageId) {
    if let Some(queue) = tables.queues.get_mut(&resource) {
        queue.requests.retain(|r| r.txn_id != txn_id);
        if queue.requests.is_empty() {
            tables.queues.remove(&resource);
        }
    }
}

fn remove_waiter(tables: &mut LockTables, txn_id: u64, resource: PageId) {
    if let Some(queue) = tables.queues.get_mut(&resource) {
        queue.requests.retain(|r| r.txn_id != txn_id || r.granted);
        if queue.requests.is_empty() {
            tables.queues.remove(&resource);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_compatibility_matrix() {
        use LockMode::*;
        let table = [
            (S, S, true),
            (S, X, false),
            (S, IS, true),
            (S, IX, false),
            (S, SIX, false),
            (X, S, false),
            (X, X, false),
            (X, IS, false),
            (X, IX, false),
            (X, SIX, false),
            (IS, S, true),
            (IS, X, false),
            (IS, IS, true),
            (IS, IX, true),
            (IS, SIX, true),
            (IX, S, false),
            (IX, X, false),
            (IX, IS, true),
            (IX, IX, true),
            (IX, SIX, false),
            (SIX, S, false),
            (SIX, X, false),
            (SIX, IS, true),
            (SIX, IX, false),
            (SIX, SIX, false),
        ];
        for (held, req, expect) in table {
            assert_eq!(
                LockMode::compatible(held, req),
                expect,
                "held {:?}, requested {:?}",
                held,
                req
            );
        }
    }

    #[test]
    fn test_shared_locks_coexist() {
        let mgr = LockManager::new();
        mgr.acquire(1, 10, LockMode::S, None).unwrap();
        mgr.acquire(2, 10, LockMode::S, None).unwrap();
        assert!(!mgr.try_acquire(3, 10, LockMode::X).unwrap());
        mgr.release_all(1);
        mgr.release_all(2);
        assert!(mgr.try_acquire(3, 10, LockMode::X).unwrap());
    }

    #[test]
    fn test_reacquire_is_idempotent() {
        let mgr = LockManager::new();
        mgr.acquire(1, 10, LockMode::X, None).unwrap();
        mgr.acquire(1, 10, LockMode::X, None).unwrap();
        mgr.acquire(1, 10, LockMode::S, None).unwrap(); // covered by X
    }

    #[test]
    fn test_upgrade_when_sole_holder() {
        let mgr = LockManager::new();
        mgr.acquire(1, 10, LockMode::S, None).unwrap();
        mgr.acquire(1, 10, LockMode::X, None).unwrap();
        assert!(!mgr.try_acquire(2, 10, LockMode::S).unwrap());
    }

    #[test]
    fn test_blocked_writer_blocks_later_readers() {
        let mgr = Arc::new(LockManager::new());
        mgr.acquire(1, 10, LockMode::S, None).unwrap();

        // Writer 2 queues behind the reader.
        let m = Arc::clone(&mgr);
        let writer = thread::spawn(move || m.acquire(2, 10, LockMode::X, None));
        thread::sleep(Duration::from_millis(50));

        // Reader 3 must not jump over the waiting writer.
        assert!(!mgr.try_acquire(3, 10, LockMode::S).unwrap());

        mgr.release_all(1);
        writer.join().unwrap().unwrap();
        mgr.release_all(2);
        assert!(mgr.try_acquire(3, 10, LockMode::S).unwrap());
    }

    #[test]
    fn test_waiter_granted_on_release() {
        let mgr = Arc::new(LockManager::new());
        mgr.acquire(1, 10, LockMode::X, None).unwrap();

        let m = Arc::clone(&mgr);
        let waiter = thread::spawn(move || {
            m.acquire(2, 10, LockMode::X, None).unwrap();
            m.release_all(2);
        });
        thread::sleep(Duration::from_millis(30));
        mgr.release_all(1);
        waiter.join().unwrap();
    }

    #[test]
    fn test_doomed_waiter_gets_deadlock_error() {
        let mgr = Arc::new(LockManager::new());
        mgr.acquire(1, 10, LockMode::X, None).unwrap();

        let m = Arc::clone(&mgr);
        let waiter = thread::spawn(move || m.acquire(2, 10, LockMode::X, None));
        thread::sleep(Duration::from_millis(30));
        mgr.doom(2);
        match waiter.join().unwrap() {
            Err(Error::TxnDeadlock { txn_id: 2 }) => {}
            other => panic!("expected deadlock error, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_timeout() {
        let mgr = LockManager::new();
        mgr.acquire(1, 10, LockMode::X, None).unwrap();
        let deadline = Some(Instant::now() + Duration::from_millis(80));
        match mgr.acquire(2, 10, LockMode::X, deadline) {
            Err(Error::TxnTimeout { txn_id: 2 }) => {}
            other => panic!("expected timeout, got {:?}", other),
        }
    }

    #[test]
    fn test_wait_for_edges_reports_blockers() {
        let mgr = Arc::new(LockManager::new());
        mgr.acquire(1, 10, LockMode::X, None).unwrap();
        let m = Arc::clone(&mgr);
        let _waiter = thread::spawn(move || {
            let _ = m.acquire(2, 10, LockMode::X, None);
        });
        thread::sleep(Duration::from_millis(30));
        let edges = mgr.wait_for_edges();
        assert!(edges.contains(&(2, 1)));
        mgr.doom(2);
    }

    #[test]
    fn test_intention_locks_coexist_on_table_resource() {
        let mgr = LockManager::new();
        mgr.acquire(1, 1, LockMode::IS, None).unwrap();
        mgr.acquire(2, 1, LockMode::IX, None).unwrap();
        mgr.acquire(3, 1, LockMode::IS, None).unwrap();
        assert!(!mgr.try_acquire(4, 1, LockMode::S).unwrap());
        mgr.release_all(2);
        assert!(mgr.try_acquire(4, 1, LockMode::S).unwrap());
    }
}
