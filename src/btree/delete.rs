//! Deletion with sibling borrow / merge rebalancing.
//!
//! Same two-phase shape as insertion: plan under the exclusive tree
//! latch (find the leaf, lock it and the one sibling the fix will
//! touch), then mutate without further blocking. Underflow fixes walk
//! up the tree: borrow from an adjacent sibling through the shared
//! parent when it can spare an entry, merge with it otherwise. An
//! internal root left with a single child is contracted away.

use crate::btree::node::Node;
use crate::btree::tree::BTree;
use crate::error::{Error, Result};
use crate::storage::page::{PageId, TREE_META_PAGE_ID};
use crate::txn::locks::LockMode;
use crate::txn::OpCtx;

use log::trace;

/// How an underflowed child is repaired, and with which sibling.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Fix {
    BorrowLeft(PageId),
    BorrowRight(PageId),
    MergeLeft(PageId),
    MergeRight(PageId),
}

impl Fix {
    fn sibling(self) -> PageId {
        match self {
            Fix::BorrowLeft(p) | Fix::BorrowRight(p) | Fix::MergeLeft(p) | Fix::MergeRight(p) => p,
        }
    }
}

impl BTree {
    pub fn delete(&self, ctx: &mut OpCtx<'_>, key: &[u8]) -> Result<()> {
        self.validate_key(key)?;
        self.locks.acquire(
            ctx.txn.id,
            TREE_META_PAGE_ID,
            LockMode::X,
            ctx.txn.deadline,
        )?;

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
            if leaf.search(key).is_err() {
                return Err(Error::KeyNotFound);
            }

            // If removing the key underflows the leaf, the fix touches
            // exactly one sibling leaf; lock it up front so the
            // mutation phase never waits.
            if !path.is_empty() && leaf.keys.len() - 1 < self.min_leaf_keys() {
                let parent = self.read_node(path[path.len() - 1])?;
                let idx = child_position(&parent, leaf_pid)?;
                let fix = self.choose_fix(&parent, idx, true)?;
                let sibling = fix.sibling();
                if !self.locks.try_acquire(ctx.txn.id, sibling, LockMode::X)? {
                    drop(guard);
                    self.locks
                        .acquire(ctx.txn.id, sibling, LockMode::X, ctx.txn.deadline)?;
                    continue;
                }
            }

            return self.delete_at_leaf(ctx, key, leaf_pid, &path);
        }
    }

    pub(crate) fn min_leaf_keys(&self) -> usize {
        self.leaf_capacity / 2
    }

    /// Internal nodes underflow a little below the literal half so two
    /// minimal siblings plus the pulled-down separator always fit back
    /// into one node.
    pub(crate) fn min_internal_keys(&self) -> usize {
        (self.branching_factor / 2).saturating_sub(1).max(1)
    }

    fn delete_at_leaf(
        &self,
        ctx: &mut OpCtx<'_>,
        key: &[u8],
        leaf_pid: PageId,
        path: &[PageId],
    ) -> Result<()> {
        let leaf_rc = self.pool.get_page(leaf_pid)?;
        let mut node = Node::decode(&leaf_rc.read().unwrap())?;
        let pos = match node.search(key) {
            Ok(pos) => pos,
            Err(_) => {
                self.pool.unpin_page(leaf_pid, false)?;
                return Err(Error::KeyNotFound);
            }
        };
        node.keys.remove(pos);
        node.values.remove(pos);

        let result = self.apply_update(ctx, &leaf_rc, |page| node.store_into(page));
        self.pool.unpin_page(leaf_pid, result.is_ok())?;
        result?;

        *ctx.key_delta -= 1;
        self.store.add_keys(-1);

        self.rebalance_upward(ctx, leaf_pid, node.keys.len(), true, path)?;
        self.contract_root(ctx)
    }

    /// Repairs underflow from the leaf up. Borrowing ends the walk; a
    /// merge removes a separator from the parent, which may underflow
    /// in turn.
    fn rebalance_upward(
        &self,
        ctx: &mut OpCtx<'_>,
        mut child_pid: PageId,
        mut child_keys: usize,
        mut child_is_leaf: bool,
        path: &[PageId],
    ) -> Result<()> {
        for depth in (0..path.len()).rev() {
            let min = if child_is_leaf {
                self.min_leaf_keys()
            } else {
                self.min_internal_keys()
            };
            if child_keys >= min {
                return Ok(());
            }

            let parent_pid = path[depth];
            let parent_rc = self.pool.get_page(parent_pid)?;
            let mut parent = Node::decode(&parent_rc.read().unwrap())?;
            let idx = child_position(&parent, child_pid)?;
            let fix = self.choose_fix(&parent, idx, child_is_leaf)?;
            trace!(
                "underflow at page {} (depth {}): {:?}",
                child_pid,
                depth,
                fix
            );

            let merged = match fix {
                Fix::BorrowLeft(left_pid) => {
                    self.borrow_left(ctx, &mut parent, idx, left_pid, child_pid, child_is_leaf)?;
                    false
                }
                Fix::BorrowRight(right_pid) => {
                    self.borrow_right(ctx, &mut parent, idx, right_pid, child_pid, child_is_leaf)?;
                    false
                }
                Fix::MergeLeft(left_pid) => {
                    self.merge(ctx, &mut parent, idx - 1, left_pid, child_pid, child_is_leaf)?;
                    true
                }
                Fix::MergeRight(right_pid) => {
                    self.merge(ctx, &mut parent, idx, child_pid, right_pid, child_is_leaf)?;
                    true
                }
            };

            let parent_keys = parent.keys.len();
            let result = self.apply_update(ctx, &parent_rc, |page| parent.store_into(page));
            self.pool.unpin_page(parent_pid, result.is_ok())?;
            result?;

            if !merged {
                return Ok(());
            }
            child_pid = parent_pid;
            child_keys = parent_keys;
            child_is_leaf = false;
        }
        Ok(())
    }

    /// Picks the repair: borrow from a sibling that can spare an entry
    /// (left preferred), otherwise merge (left preferred).
    fn choose_fix(&self, parent: &Node, idx: usize, child_is_leaf: bool) -> Result<Fix> {
        let min = if child_is_leaf {
            self.min_leaf_keys()
        } else {
            self.min_internal_keys()
        };

        let left = if idx > 0 {
            Some(parent.children[idx - 1])
        } else {
            None
        };
        let right = if idx + 1 < parent.children.len() {
            Some(parent.children[idx + 1])
        } else {
            None
        };

        if let Some(left_pid) = left {
            if self.read_node(left_pid)?.keys.len() > min {
                return Ok(Fix::BorrowLeft(left_pid));
            }
        }
        if let Some(right_pid) = right {
            if self.read_node(right_pid)?.keys.len() > min {
                return Ok(Fix::BorrowRight(right_pid));
            }
        }
        if let Some(left_pid) = left {
            return Ok(Fix::MergeLeft(left_pid));
        }
        if let Some(right_pid) = right {
            return Ok(Fix::MergeRight(right_pid));
        }
        Err(Error::Corrupted {
            context: "underflowed child has no siblings".to_string(),
        })
    }

    fn borrow_left(
        &self,
        ctx: &mut OpCtx<'_>,
        parent: &mut Node,
        idx: usize,
        left_pid: PageId,
        child_pid: PageId,
        child_is_leaf: bool,
    ) -> Result<()> {
        let left_rc = self.pool.get_page(left_pid)?;
        let mut left = Node::decode(&left_rc.read().unwrap())?;
        let child_rc = self.pool.get_page(child_pid)?;
        let mut child = Node::decode(&child_rc.read().unwrap())?;

        if child_is_leaf {
            let key = left.keys.pop().expect("borrow from an empty leaf");
            let value = left.values.pop().expect("leaf keys/values diverged");
            child.keys.insert(0, key.clone());
            child.values.insert(0, value);
            parent.keys[idx - 1] = key;
        } else {
            // Rotate through the parent separator.
            let separator = parent.keys[idx - 1].clone();
            child.keys.insert(0, separator);
            child
                .children
                .insert(0, left.children.pop().expect("internal without children"));
            parent.keys[idx - 1] = left.keys.pop().expect("borrow from an empty internal");
        }

        let result = self.apply_update(ctx, &left_rc, |page| left.store_into(page));
        self.pool.unpin_page(left_pid, result.is_ok())?;
        result?;
        let result = self.apply_update(ctx, &child_rc, |page| child.store_into(page));
        self.pool.unpin_page(child_pid, result.is_ok())?;
        result
    }

    fn borrow_right(
        &self,
        ctx: &mut OpCtx<'_>,
        parent: &mut Node,
        idx: usize,
        right_pid: PageId,
        child_pid: PageId,
        child_is_leaf: bool,
    ) -> Result<()> {
        let right_rc = self.pool.get_page(right_pid)?;
        let mut right = Node::decode(&right_rc.read().unwrap())?;
        let child_rc = self.pool.get_page(child_pid)?;
        let mut child = Node::decode(&child_rc.read().unwrap())?;

        if child_is_leaf {
            let key = right.keys.remove(0);
            let value = right.values.remove(0);
            child.keys.push(key);
            child.values.push(value);
            parent.keys[idx] = right.keys[0].clone();
        } else {
            let separator = parent.keys[idx].clone();
            child.keys.push(separator);
            child.children.push(right.children.remove(0));
            parent.keys[idx] = right.keys.remove(0);
        }

        let result = self.apply_update(ctx, &right_rc, |page| right.store_into(page));
        self.pool.unpin_page(right_pid, result.is_ok())?;
        result?;
        let result = self.apply_update(ctx, &child_rc, |page| child.store_into(page));
        self.pool.unpin_page(child_pid, result.is_ok())?;
        result
    }

    /// Merges `children[sep_idx + 1]` into `children[sep_idx]`, pulling
    /// the separator down for internals, and defers the right page to
    /// the commit-time free list.
    fn merge(
        &self,
        ctx: &mut OpCtx<'_>,
        parent: &mut Node,
        sep_idx: usize,
        left_pid: PageId,
        right_pid: PageId,
        child_is_leaf: bool,
    ) -> Result<()> {
        let left_rc = self.pool.get_page(left_pid)?;
        let mut left = Node::decode(&left_rc.read().unwrap())?;
        let right_rc = self.pool.get_page(right_pid)?;
        let mut right = Node::decode(&right_rc.read().unwrap())?;

        if child_is_leaf {
            left.keys.append(&mut right.keys);
            left.values.append(&mut right.values);
            left.next = right.next;
        } else {
            left.keys.push(parent.keys[sep_idx].clone());
            left.keys.append(&mut right.keys);
            left.children.append(&mut right.children);
        }
        parent.keys.remove(sep_idx);
        parent.children.remove(sep_idx + 1);

        let result = self.apply_update(ctx, &left_rc, |page| left.store_into(page));
        self.pool.unpin_page(left_pid, result.is_ok())?;
        result?;
        self.pool.unpin_page(right_pid, false)?;

        ctx.freed.push(right_pid);
        trace!("merged page {} into {}", right_pid, left_pid);
        Ok(())
    }

    /// An internal root with no keys routes everything through its
    /// single child; that child becomes the root.
    fn contract_root(&self, ctx: &mut OpCtx<'_>) -> Result<()> {
        let (root_pid, height) = self.tree_meta()?;
        let root = self.read_node(root_pid)?;
        if root.is_leaf || !root.keys.is_empty() {
            return Ok(());
        }
        let new_root = root.children[0];
        trace!(
            "contracting root {} to {}, height {} -> {}",
            root_pid,
            new_root,
            height,
            height - 1
        );
        self.set_tree_meta(ctx, new_root, height - 1)?;
        ctx.freed.push(root_pid);
        Ok(())
    }
}

fn child_position(parent: &Node, child: PageId) -> Result<usize> {
    parent
        .children
        .iter()
        .position(|&c| c == child)
        .ok_or_else(|| Error::Corrupted {
            context: format!("parent lost child page {}", child),
        })
}
