//! B+ tree over buffer-pool pages.
//!
//! Concurrency model: a tree-wide latch protects structural integrity
//! (shared for reads, exclusive for writes); transactional page locks
//! provide isolation. Writers serialize on an X lock on the tree meta
//! page held to transaction end, so at most one transaction mutates the
//! structure at a time; readers lock only the leaf they read. The latch
//! is never held across a blocking lock acquisition: both paths drop
//! it, wait, retake it and revalidate.

use std::io::Cursor;
use std::sync::{Arc, RwLock};

use log::trace;

use crate::codec::{ByteWriter, Decode};
use crate::config::{Config, IsolationLevel};
use crate::error::{Error, Result};
use crate::btree::node::Node;
use crate::storage::buffer_pool::BufferPool;
use crate::storage::page::{Page, PageId, PageType, INVALID_PAGE_ID, TREE_META_PAGE_ID};
use crate::storage::page_store::PageStore;
use crate::txn::locks::{LockManager, LockMode};
use crate::txn::{OpCtx, TxnCtx, UndoEntry};
use crate::wal::log_manager::LogManager;
use crate::wal::record::{LogRecordKind, UpdatePayload};

pub struct BTree {
    pub(crate) pool: Arc<BufferPool>,
    pub(crate) store: Arc<PageStore>,
    pub(crate) wal: Arc<LogManager>,
    pub(crate) locks: Arc<LockManager>,
    /// Tree-wide structural latch, shared with the transaction manager
    /// so rollback can restore pages atomically with respect to
    /// readers.
    pub(crate) latch: Arc<RwLock<()>>,
    pub(crate) leaf_capacity: usize,
    pub(crate) branching_factor: usize,
    pub(crate) max_key: usize,
    pub(crate) max_value: usize,
}

impl BTree {
    pub fn new(
        pool: Arc<BufferPool>,
        store: Arc<PageStore>,
        wal: Arc<LogManager>,
        locks: Arc<LockManager>,
        latch: Arc<RwLock<()>>,
        config: &Config,
    ) -> Self {
        Self {
            pool,
            store,
            wal,
            locks,
            latch,
            leaf_capacity: config.leaf_capacity,
            branching_factor: config.branching_factor,
            max_key: config.max_key_size,
            max_value: config.max_value_size,
        }
    }

    pub fn validate_key(&self, key: &[u8]) -> Result<()> {
        if key.is_empty() {
            return Err(Error::InvalidKey {
                reason: "empty key".to_string(),
            });
        }
        if key.len() > self.max_key {
            return Err(Error::KeyTooLarge {
                len: key.len(),
                max: self.max_key,
            });
        }
        Ok(())
    }

    pub fn validate_value(&self, value: &[u8]) -> Result<()> {
        if value.len() > self.max_value {
            return Err(Error::ValueTooLarge {
                len: value.len(),
                max: self.max_value,
            });
        }
        Ok(())
    }

    /// Reads (root, height) from the tree meta page.
    pub(crate) fn tree_meta(&self) -> Result<(PageId, u32)> {
        let page_rc = self.pool.get_page(TREE_META_PAGE_ID)?;
        let result = {
            let page = page_rc.read().unwrap();
            let mut r = Cursor::new(page.body());
            let root = PageId::decode_from(&mut r)?;
            let height = u32::decode_from(&mut r)?;
            (root, height)
        };
        self.pool.unpin_page(TREE_META_PAGE_ID, false)?;
        Ok(result)
    }

    /// Descends from the root to the leaf responsible for `key`,
    /// returning the leaf page id and the internal path (root first).
    /// Caller holds the tree latch.
    pub(crate) fn descend(&self, key: &[u8]) -> Result<(PageId, Vec<PageId>)> {
        let (root, _) = self.tree_meta()?;
        let mut pid = root;
        let mut path = Vec::new();
        loop {
            let page_rc = self.pool.get_page(pid)?;
            let page = page_rc.read().unwrap();
            match page.page_type {
                PageType::Leaf => {
                    drop(page);
                    self.pool.unpin_page(pid, false)?;
                    return Ok((pid, path));
                }
                PageType::Internal => {
                    let node = Node::decode(&page)?;
                    let next = node.children[node.child_index(key)];
                    drop(page);
                    self.pool.unpin_page(pid, false)?;
                    path.push(pid);
                    pid = next;
                }
                other => {
                    drop(page);
                    self.pool.unpin_page(pid, false)?;
                    return Err(Error::Corrupted {
                        context: format!("descent reached {:?} page {}", other, pid),
                    });
                }
            }
        }
    }

    pub(crate) fn read_node(&self, pid: PageId) -> Result<Node> {
        let page_rc = self.pool.get_page(pid)?;
        let result = {
            let page = page_rc.read().unwrap();
            if page.page_type != PageType::Leaf && page.page_type != PageType::Internal {
                Err(Error::Corrupted {
                    context: format!("page {} is {:?}, not a tree node", pid, page.page_type),
                })
            } else {
                Node::decode(&page)
            }
        };
        self.pool.unpin_page(pid, false)?;
        result
    }

    pub fn get(&self, txn: &TxnCtx, key: &[u8]) -> Result<Vec<u8>> {
        self.validate_key(key)?;
        self.with_locked_leaf(txn, key, |_, node| match node.search(key) {
            Ok(pos) => Ok(node.values[pos].clone()),
            Err(_) => Err(Error::KeyNotFound),
        })
    }

    pub fn exists(&self, txn: &TxnCtx, key: &[u8]) -> Result<bool> {
        match self.get(txn, key) {
            Ok(_) => Ok(true),
            Err(Error::KeyNotFound) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Runs `f` on the leaf responsible for `key`, honoring the
    /// transaction's isolation level. The S lock is acquired without
    /// holding the tree latch; after a blocking wait the descent is
    /// revalidated because a writer may have moved the key meanwhile.
    pub(crate) fn with_locked_leaf<T>(
        &self,
        txn: &TxnCtx,
        key: &[u8],
        f: impl Fn(PageId, &Node) -> Result<T>,
    ) -> Result<T> {
        // Serializable transactions also hold a shared lock on the tree
        // meta page, which keeps writers out entirely and so prevents
        // phantoms.
        if txn.isolation == IsolationLevel::Serializable {
            self.locks
                .acquire(txn.id, TREE_META_PAGE_ID, LockMode::S, txn.deadline)?;
        }

        loop {
            let leaf_pid = {
                let _guard = self.latch.read().unwrap();
                let (leaf_pid, _) = self.descend(key)?;

                if txn.isolation == IsolationLevel::ReadUncommitted {
                    return f(leaf_pid, &self.read_node(leaf_pid)?);
                }
                if self.locks.try_acquire(txn.id, leaf_pid, LockMode::S)? {
                    let out = f(leaf_pid, &self.read_node(leaf_pid)?);
                    if txn.isolation == IsolationLevel::ReadCommitted {
                        self.locks.release_shared(txn.id, leaf_pid);
                    }
                    return out;
                }
                leaf_pid
            };

            // Contended: wait for the lock latch-free, then check the
            // leaf still covers the key.
            self.locks
                .acquire(txn.id, leaf_pid, LockMode::S, txn.deadline)?;
            let _guard = self.latch.read().unwrap();
            let (now_pid, _) = self.descend(key)?;
            if now_pid == leaf_pid {
                let out = f(leaf_pid, &self.read_node(leaf_pid)?);
                if txn.isolation == IsolationLevel::ReadCommitted {
                    self.locks.release_shared(txn.id, leaf_pid);
                }
                return out;
            }
            trace!(
                "leaf for key moved from page {} to {}, retrying",
                leaf_pid,
                now_pid
            );
            if txn.isolation == IsolationLevel::ReadCommitted {
                self.locks.release_shared(txn.id, leaf_pid);
            }
        }
    }

    /// Logs a full before/after image update of a page, applies the
    /// mutation in memory, stamps the page LSN and records the undo
    /// entry. The page stays pinned by the caller, which unpins it
    /// dirty.
    pub(crate) fn apply_update(
        &self,
        ctx: &mut OpCtx<'_>,
        page_rc: &Arc<RwLock<Page>>,
        mutate: impl FnOnce(&mut Page),
    ) -> Result<()> {
        let mut page = page_rc.write().unwrap();
        let before = page.serialize();
        mutate(&mut page);
        let after = page.serialize();

        let payload = UpdatePayload {
            page_id: page.id,
            offset: 0,
            before: before.clone(),
            after,
        };
        let lsn = self.wal.append(
            LogRecordKind::Update,
            ctx.txn.id,
            *ctx.last_lsn,
            payload.encode(),
        )?;
        *ctx.last_lsn = lsn;
        page.lsn = lsn;
        ctx.undo.push(UndoEntry {
            lsn,
            page_id: page.id,
            before,
        });
        Ok(())
    }

    /// Rewrites the tree meta page (root and height) as a logged
    /// mutation of the calling transaction.
    pub(crate) fn set_tree_meta(&self, ctx: &mut OpCtx<'_>, root: PageId, height: u32) -> Result<()> {
        let page_rc = self.pool.get_page(TREE_META_PAGE_ID)?;
        let result = self.apply_update(ctx, &page_rc, |page| {
            let mut w = ByteWriter::new();
            w.put(&root);
            w.put(&height);
            page.set_body(w.as_slice(), 0);
        });
        self.pool.unpin_page(TREE_META_PAGE_ID, result.is_ok())?;
        result
    }

    /// Walks the leaf chain and counts keys; used after recovery to
    /// rebuild the persistent key counter.
    pub fn count_keys(&self) -> Result<i64> {
        let (root, _) = self.tree_meta()?;
        let mut pid = root;
        // Find the leftmost leaf.
        loop {
            let node = self.read_node(pid)?;
            if node.is_leaf {
                break;
            }
            pid = node.children[0];
        }
        let mut count = 0i64;
        while pid != INVALID_PAGE_ID {
            let node = self.read_node(pid)?;
            count += node.keys.len() as i64;
            pid = node.next;
        }
        Ok(count)
    }

    /// Structural invariant check: equal leaf depth, sorted keys,
    /// separator bounds, and a leaf chain in ascending key order.
    /// Intended for tests and deep integrity scans.
    pub fn check_structure(&self) -> Result<()> {
        let _guard = self.latch.read().unwrap();
        let (root, height) = self.tree_meta()?;
        let mut leaves = Vec::new();
        self.check_subtree(root, height, 0, None, None, &mut leaves)?;

        // The leaf chain must visit exactly the leaves found by the
        // depth-first walk, left to right.
        let mut pid = *leaves.first().unwrap_or(&INVALID_PAGE_ID);
        let mut chained = Vec::new();
        let mut last_key: Option<Vec<u8>> = None;
        while pid != INVALID_PAGE_ID {
            chained.push(pid);
            if chained.len() > leaves.len() {
                return Err(corrupt("leaf chain longer than leaf count".to_string()));
            }
            let node = self.read_node(pid)?;
            for key in &node.keys {
                if let Some(prev) = &last_key {
                    if key <= prev {
                        return Err(corrupt(format!("leaf chain keys out of order at {}", pid)));
                    }
                }
                last_key = Some(key.clone());
            }
            pid = node.next;
        }
        if chained != leaves {
            return Err(corrupt(format!(
                "leaf chain {:?} disagrees with tree order {:?}",
                chained, leaves
            )));
        }
        Ok(())
    }

    fn check_subtree(
        &self,
        pid: PageId,
        height: u32,
        depth: u32,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        leaves: &mut Vec<PageId>,
    ) -> Result<()> {
        let node = self.read_node(pid)?;

        for window in node.keys.windows(2) {
            if window[0] >= window[1] {
                return Err(corrupt(format!("keys not strictly sorted in page {}", pid)));
            }
        }
        for key in &node.keys {
            if let Some(lower) = lower {
                if key.as_slice() < lower {
                    return Err(corrupt(format!("key below subtree bound in page {}", pid)));
                }
            }
            if let Some(upper) = upper {
                if key.as_slice() >= upper {
                    return Err(corrupt(format!("key above subtree bound in page {}", pid)));
                }
            }
        }

        if node.is_leaf {
            if depth != height {
                return Err(corrupt(format!(
                    "leaf {} at depth {} but tree height is {}",
                    pid, depth, height
                )));
            }
            leaves.push(pid);
            return Ok(());
        }

        if node.keys.is_empty() && depth > 0 {
            return Err(corrupt(format!("empty internal page {}", pid)));
        }
        for (i, &child) in node.children.iter().enumerate() {
            let child_lower = if i == 0 {
                lower
            } else {
                Some(node.keys[i - 1].as_slice())
            };
            let child_upper = if i == node.keys.len() {
                upper
            } else {
                Some(node.keys[i].as_slice())
            };
            self.check_subtree(child, height, depth + 1, child_lower, child_upper, leaves)?;
        }
        Ok(())
    }
}

fn corrupt(context: String) -> Error {
    Error::Corrupted { context }
}
