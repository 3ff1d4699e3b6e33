//! Forward range scans over the leaf chain.
//!
//! The cursor snapshots one leaf at a time under the tree latch and a
//! short shared lock, then re-positions by key for the next batch, so a
//! structural change between batches costs a re-descent instead of a
//! wrong result. Within a batch the view is the leaf as it was at
//! snapshot time.

use log::trace;

use crate::btree::node::Node;
use crate::btree::tree::BTree;
use crate::config::IsolationLevel;
use crate::error::{Error, Result};
use crate::storage::page::INVALID_PAGE_ID;
use crate::txn::locks::LockMode;
use crate::txn::TxnCtx;

/// Position of a batch refill relative to its bound key.
#[derive(Clone, Copy, PartialEq, Eq)]
enum Bound {
    Include,
    Exclude,
}

pub struct TreeCursor {
    start: Vec<u8>,
    end: Option<Vec<u8>>,
    batch: Vec<(Vec<u8>, Vec<u8>)>,
    idx: usize,
    /// Set when the chain end or the range end was reached.
    exhausted: bool,
}

impl TreeCursor {
    pub fn new(start: &[u8], end: Option<&[u8]>) -> Self {
        Self {
            start: start.to_vec(),
            end: end.map(|e| e.to_vec()),
            batch: Vec::new(),
            idx: 0,
            exhausted: false,
        }
    }

    pub fn valid(&self) -> bool {
        self.idx < self.batch.len()
    }

    pub fn key(&self) -> Option<&[u8]> {
        self.batch.get(self.idx).map(|(k, _)| k.as_slice())
    }

    pub fn value(&self) -> Option<&[u8]> {
        self.batch.get(self.idx).map(|(_, v)| v.as_slice())
    }

    /// Positions at the first entry `>= target` within the range.
    pub fn seek(&mut self, tree: &BTree, txn: &TxnCtx, target: &[u8]) -> Result<()> {
        let target = if target < self.start.as_slice() {
            self.start.clone()
        } else {
            target.to_vec()
        };
        self.exhausted = false;
        self.refill(tree, txn, &target, Bound::Include)
    }

    pub fn seek_to_first(&mut self, tree: &BTree, txn: &TxnCtx) -> Result<()> {
        self.exhausted = false;
        let start = self.start.clone();
        self.refill(tree, txn, &start, Bound::Include)
    }

    /// Positions at the last entry of the range; `advance` from there
    /// exhausts the cursor.
    pub fn seek_to_last(&mut self, tree: &BTree, txn: &TxnCtx) -> Result<()> {
        self.batch.clear();
        self.idx = 0;
        self.exhausted = true;

        let _guard = tree.latch.read().unwrap();
        let (root, _) = tree.tree_meta()?;
        if let Some((key, value)) = self.last_in_subtree(tree, txn, root)? {
            self.batch = vec![(key, value)];
            self.exhausted = false;
        }
        Ok(())
    }

    /// Moves to the next entry, refilling from the tree when the
    /// current leaf snapshot is spent.
    pub fn advance(&mut self, tree: &BTree, txn: &TxnCtx) -> Result<()> {
        if self.idx < self.batch.len() {
            self.idx += 1;
        }
        if self.idx < self.batch.len() || self.exhausted {
            return Ok(());
        }
        match self.batch.last().map(|(k, _)| k.clone()) {
            Some(last_key) => self.refill(tree, txn, &last_key, Bound::Exclude),
            None => {
                self.exhausted = true;
                Ok(())
            }
        }
    }

    /// Loads the next batch: all entries of the leaf covering `bound`
    /// that are past it (and before `end`), falling through to the next
    /// leaf in the chain when that yields nothing.
    fn refill(&mut self, tree: &BTree, txn: &TxnCtx, bound: &[u8], mode: Bound) -> Result<()> {
        self.batch.clear();
        self.idx = 0;

        loop {
            let (_pid, node) = self.locked_snapshot_by_key(tree, txn, bound)?;

            if self.fill_from(&node, bound, mode) {
                return Ok(());
            }
            if self.exhausted || node.next == INVALID_PAGE_ID {
                self.exhausted = true;
                return Ok(());
            }

            // The covering leaf had nothing past the bound; its chain
            // successor starts above the bound by the separator
            // invariant, so one more hop settles it.
            let next_pid = node.next;
            match self.try_snapshot_by_pid(tree, txn, next_pid, bound)? {
                Some(next_node) => {
                    if self.fill_from(&next_node, bound, mode) {
                        return Ok(());
                    }
                    if next_node.next == INVALID_PAGE_ID {
                        self.exhausted = true;
                        return Ok(());
                    }
                    // Only possible on pathological empty leaves;
                    // re-seek from the successor's high key.
                    trace!("empty leaf {} during scan, re-seeking", next_pid);
                    continue;
                }
                None => {
                    // Lost a race with a structural change; re-descend.
                    continue;
                }
            }
        }
    }

    /// Copies entries within the range from `node` into the batch.
    /// Returns false when nothing qualified. Sets `exhausted` when the
    /// range end cuts the leaf short.
    fn fill_from(&mut self, node: &Node, bound: &[u8], mode: Bound) -> bool {
        for (key, value) in node.keys.iter().zip(node.values.iter()) {
            let past_bound = match mode {
                Bound::Include => key.as_slice() >= bound,
                Bound::Exclude => key.as_slice() > bound,
            };
            if !past_bound {
                continue;
            }
            if let Some(end) = &self.end {
                if key >= end {
                    self.exhausted = true;
                    break;
                }
            }
            self.batch.push((key.clone(), value.clone()));
        }
        !self.batch.is_empty()
    }

    /// Leaf snapshot via key descent, with the same latch-free lock
    /// dance as point reads.
    fn locked_snapshot_by_key(
        &self,
        tree: &BTree,
        txn: &TxnCtx,
        key: &[u8],
    ) -> Result<(u32, Node)> {
        tree.with_locked_leaf(txn, key, |pid, node| Ok((pid, node.clone())))
    }

    /// Leaf snapshot by page id, used for the single chain hop. Returns
    /// `None` when the page is no longer the leaf it was (freed, reused
    /// or moved), in which case the caller re-descends.
    fn try_snapshot_by_pid(
        &self,
        tree: &BTree,
        txn: &TxnCtx,
        pid: u32,
        bound: &[u8],
    ) -> Result<Option<Node>> {
        if txn.isolation == IsolationLevel::ReadUncommitted {
            return Ok(self.plausible_successor(tree, pid, bound)?);
        }
        if !tree.locks.try_acquire(txn.id, pid, LockMode::S)? {
            // Contended: give up on the hop; the caller re-descends by
            // key, which revalidates from the root.
            return Ok(None);
        }
        let node = self.plausible_successor(tree, pid, bound)?;
        if txn.isolation == IsolationLevel::ReadCommitted {
            tree.locks.release_shared(txn.id, pid);
        }
        Ok(node)
    }

    fn plausible_successor(&self, tree: &BTree, pid: u32, bound: &[u8]) -> Result<Option<Node>> {
        let node = match tree.read_node(pid) {
            Ok(node) => node,
            Err(Error::Corrupted { .. }) => return Ok(None),
            Err(e) => return Err(e),
        };
        if !node.is_leaf {
            return Ok(None);
        }
        // A chain successor's keys all sort above the bound; anything
        // else means the page was recycled since the snapshot.
        if let Some(first) = node.keys.first() {
            if first.as_slice() <= bound {
                return Ok(None);
            }
        }
        Ok(Some(node))
    }

    /// Rightmost in-range entry under `pid`, walking children right to
    /// left until one yields.
    fn last_in_subtree(
        &self,
        tree: &BTree,
        txn: &TxnCtx,
        pid: u32,
    ) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let node = tree.read_node(pid)?;
        if node.is_leaf {
            // Lock leaves we actually read, same as point reads.
            if txn.isolation != IsolationLevel::ReadUncommitted {
                if !tree.locks.try_acquire(txn.id, pid, LockMode::S)? {
                    return Err(Error::TxnConflict { txn_id: txn.id });
                }
            }
            let found = node
                .keys
                .iter()
                .zip(node.values.iter())
                .rev()
                .find(|(k, _)| {
                    k.as_slice() >= self.start.as_slice()
                        && self
                            .end
                            .as_ref()
                            .map_or(true, |e| k.as_slice() < e.as_slice())
                })
                .map(|(k, v)| (k.clone(), v.clone()));
            if txn.isolation == IsolationLevel::ReadCommitted {
                tree.locks.release_shared(txn.id, pid);
            }
            return Ok(found);
        }

        let upper = match &self.end {
            Some(end) => node.child_index(end),
            None => node.children.len() - 1,
        };
        for i in (0..=upper).rev() {
            if let Some(found) = self.last_in_subtree(tree, txn, node.children[i])? {
                return Ok(Some(found));
            }
        }
        Ok(None)
    }
}
