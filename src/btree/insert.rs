//! Insertion and node splitting.
//!
//! A writing transaction first takes an X lock on the tree meta page,
//! so at most one transaction mutates the tree at a time. Each put then
//! runs in two phases under the exclusive tree latch: a planning phase
//! that finds the leaf, locks it and allocates pages for the expected
//! split chain, and a mutation phase that performs the insert and
//! splits with no further blocking. Whenever a lock would block, the
//! latch is dropped for the wait and the plan restarts; already
//! allocated scratch pages are kept and reused.

use std::sync::{Arc, RwLock};

use log::trace;

use crate::btree::node::Node;
use crate::btree::tree::BTree;
use crate::error::{Error, Result};
use crate::storage::page::{Page, PageId, PageType, INVALID_PAGE_ID, TREE_META_PAGE_ID};
use crate::txn::locks::LockMode;
use crate::txn::OpCtx;

type Scratch = Vec<(PageId, Arc<RwLock<Page>>)>;

impl BTree {
    pub fn put(&self, ctx: &mut OpCtx<'_>, key: &[u8], value: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        self.validate_value(value)?;
        self.locks.acquire(
            ctx.txn.id,
            TREE_META_PAGE_ID,
            LockMode::X,
            ctx.txn.deadline,
        )?;

        let mut scratch: Scratch = Vec::new();
        let outcome = self.put_planned(ctx, key, value, &mut scratch);
        self.return_scratch(scratch, outcome.is_ok())?;
        outcome
    }

    /// Frees planning over-allocations. Their X locks stay until
    /// transaction end, which is harmless: the pages sit on the free
    /// list and no later writer runs before this transaction finishes.
    fn return_scratch(&self, scratch: Scratch, healthy: bool) -> Result<()> {
        for (pid, _rc) in scratch {
            self.pool.unpin_page(pid, false)?;
            if healthy {
                self.store.free_page(pid)?;
            }
        }
        Ok(())
    }

    fn put_planned(
        &self,
        ctx: &mut OpCtx<'_>,
        key: &[u8],
        value: &[u8],
        scratch: &mut Scratch,
    ) -> Result<()> {
        loop {
            let guard = self.latch.write().unwrap();
            let (leaf_pid, path) = self.descend(key)?;

            if !self.locks.try_acquire(ctx.txn.id, leaf_pid, LockMode::X)? {
                drop(guard);
                self.locks
                    .acquire(ctx.txn.id, leaf_pid, LockMode::X, ctx.txn.deadline)?;
                continue;
            }

            let leaf = self.read_node(leaf_pid)?;
            let needed = if leaf.search(key).is_ok() {
                0
            } else {
                self.count_split_pages(&leaf, &path)?
            };

            // Top up the scratch pool. A fresh page's X lock is
            // uncontended except when a reader still holds a stale S
            // on a recycled id; then wait latch-free and replan.
            let mut replan = false;
            while scratch.len() < needed {
                let page_rc = self.store.allocate(PageType::Overflow)?;
                let pid = page_rc.read().unwrap().id;
                if self.locks.try_acquire(ctx.txn.id, pid, LockMode::X)? {
                    scratch.push((pid, page_rc));
                    continue;
                }
                drop(guard);
                self.locks
                    .acquire(ctx.txn.id, pid, LockMode::X, ctx.txn.deadline)?;
                scratch.push((pid, page_rc));
                replan = true;
                break;
            }
            if replan {
                continue;
            }

            return self.insert_at_leaf(ctx, key, value, leaf_pid, &path, scratch);
        }
    }

    /// Number of fresh pages an insert into this leaf will consume:
    /// one per splitting node, plus one if the split chain reaches the
    /// root.
    fn count_split_pages(&self, leaf: &Node, path: &[PageId]) -> Result<usize> {
        if leaf.keys.len() + 1 <= self.leaf_capacity {
            return Ok(0);
        }
        let mut needed = 1;
        for &ancestor in path.iter().rev() {
            let node = self.read_node(ancestor)?;
            if node.keys.len() + 1 > self.branching_factor - 1 {
                needed += 1;
            } else {
                // This ancestor absorbs the promoted separator.
                return Ok(needed);
            }
        }
        // Every node on the path splits; the root needs a replacement.
        Ok(needed + 1)
    }

    fn insert_at_leaf(
        &self,
        ctx: &mut OpCtx<'_>,
        key: &[u8],
        value: &[u8],
        leaf_pid: PageId,
        path: &[PageId],
        scratch: &mut Scratch,
    ) -> Result<()> {
        let leaf_rc = self.pool.get_page(leaf_pid)?;
        let mut node = Node::decode(&leaf_rc.read().unwrap())?;

        match node.search(key) {
            Ok(pos) => {
                // Overwrite in place; the key count is unchanged.
                node.values[pos] = value.to_vec();
                let result = self.apply_update(ctx, &leaf_rc, |page| node.store_into(page));
                self.pool.unpin_page(leaf_pid, result.is_ok())?;
                return result;
            }
            Err(pos) => {
                node.keys.insert(pos, key.to_vec());
                node.values.insert(pos, value.to_vec());
            }
        }
        *ctx.key_delta += 1;
        self.store.add_keys(1);

        if node.keys.len() <= self.leaf_capacity {
            let result = self.apply_update(ctx, &leaf_rc, |page| node.store_into(page));
            self.pool.unpin_page(leaf_pid, result.is_ok())?;
            return result;
        }

        // Leaf split: keep the lower half, move the upper half into a
        // fresh right sibling, promote the sibling's first key.
        let (right_pid, right_rc) = scratch.pop().expect("split plan under-allocated");
        let keep = node.keys.len() / 2;
        let mut right = Node::new_leaf();
        right.keys = node.keys.split_off(keep);
        right.values = node.values.split_off(keep);
        right.next = node.next;
        right.parent = node.parent;
        node.next = right_pid;
        let separator = right.keys[0].clone();
        trace!(
            "splitting leaf {}: {} keys stay, {} move to {}",
            leaf_pid,
            keep,
            right.keys.len(),
            right_pid
        );

        let result = self.apply_update(ctx, &right_rc, |page| {
            page.page_type = PageType::Leaf;
            right.store_into(page);
        });
        self.pool.unpin_page(right_pid, result.is_ok())?;
        result?;

        let result = self.apply_update(ctx, &leaf_rc, |page| node.store_into(page));
        self.pool.unpin_page(leaf_pid, result.is_ok())?;
        result?;

        self.propagate_split(ctx, separator, leaf_pid, right_pid, path, scratch)
    }

    /// Inserts `(separator, right_pid)` into the parent chain, splitting
    /// internal nodes as they overflow, growing the tree at the root.
    fn propagate_split(
        &self,
        ctx: &mut OpCtx<'_>,
        separator: Vec<u8>,
        left_pid: PageId,
        right_pid: PageId,
        path: &[PageId],
        scratch: &mut Scratch,
    ) -> Result<()> {
        let mut separator = separator;
        let mut child_pid = left_pid;
        let mut right_pid = right_pid;

        for &ancestor in path.iter().rev() {
            let anc_rc = self.pool.get_page(ancestor)?;
            let mut node = Node::decode(&anc_rc.read().unwrap())?;

            let idx = node
                .children
                .iter()
                .position(|&c| c == child_pid)
                .ok_or_else(|| Error::Corrupted {
                    context: format!("page {} lost child {}", ancestor, child_pid),
                })?;
            node.keys.insert(idx, separator.clone());
            node.children.insert(idx + 1, right_pid);

            if node.keys.len() <= self.branching_factor - 1 {
                let result = self.apply_update(ctx, &anc_rc, |page| node.store_into(page));
                self.pool.unpin_page(ancestor, result.is_ok())?;
                return result;
            }

            // Internal split: promote the middle key.
            let (new_pid, new_rc) = scratch.pop().expect("split plan under-allocated");
            let mid = node.keys.len() / 2;
            let mut right = Node::new_internal();
            right.keys = node.keys.split_off(mid + 1);
            right.children = node.children.split_off(mid + 1);
            right.parent = node.parent;
            let promoted = node.keys.pop().expect("split of an empty internal node");
            trace!(
                "splitting internal {}: promoting separator to the next level",
                ancestor
            );

            let result = self.apply_update(ctx, &new_rc, |page| {
                page.page_type = PageType::Internal;
                right.store_into(page);
            });
            self.pool.unpin_page(new_pid, result.is_ok())?;
            result?;

            let result = self.apply_update(ctx, &anc_rc, |page| node.store_into(page));
            self.pool.unpin_page(ancestor, result.is_ok())?;
            result?;

            separator = promoted;
            child_pid = ancestor;
            right_pid = new_pid;
        }

        // The root itself split: a new internal root takes over.
        let (root_pid, root_rc) = scratch.pop().expect("split plan under-allocated");
        let mut root = Node::new_internal();
        root.keys = vec![separator];
        root.children = vec![child_pid, right_pid];
        root.parent = INVALID_PAGE_ID;

        let result = self.apply_update(ctx, &root_rc, |page| {
            page.page_type = PageType::Internal;
            root.store_into(page);
        });
        self.pool.unpin_page(root_pid, result.is_ok())?;
        result?;

        let (_, height) = self.tree_meta()?;
        trace!("tree grows to height {} with root {}", height + 1, root_pid);
        self.set_tree_meta(ctx, root_pid, height + 1)
    }
}
