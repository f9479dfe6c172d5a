//! Order-preserving B+tree over the page store.
//!
//! Leaves hold (key, value) pairs and a right-sibling link; internal nodes
//! hold separator keys and child pointers. All mutation goes through a
//! [`PageStore`], so the same engine runs against the shared pager and
//! against a transaction's private workspace.
//!
//! Insertion is a single top-down pass with preemptive splitting: a full
//! child is split *before* descending into it, and the updated parent is
//! written back through the store at the split boundary, before the next
//! page is fetched. The child index is then recomputed from the post-split
//! parent by binary search; the resulting index addresses `children` only,
//! so `index == key_count` (a key at or past the current maximum) selects
//! the rightmost child instead of reading past the key array.
//!
//! Underflow repair after delete borrows from the right sibling first and
//! falls back to the left, merging when neither has a key to spare.

pub mod iterator;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::node::{
    InternalNode, LeafNode, Node, MAX_KEY_LEN, MAX_VALUE_LEN, MIN_KEYS,
};
use crate::storage::page::PageId;
use crate::storage::pager::PageStore;
use bytes::Bytes;
use log::debug;

pub struct BTree<'a, S: PageStore> {
    store: &'a mut S,
    root: PageId,
}

impl<'a, S: PageStore> BTree<'a, S> {
    /// Create a new tree: allocates and writes an empty root leaf.
    pub fn create(store: &'a mut S) -> StorageResult<Self> {
        let root = store.allocate()?;
        store.store(root, Node::Leaf(LeafNode::default()))?;
        Ok(Self { store, root })
    }

    /// Open an existing tree rooted at `root`.
    pub fn open(store: &'a mut S, root: PageId) -> Self {
        Self { store, root }
    }

    /// Current root page. Callers persist this in the catalog; it changes
    /// on root split and root collapse.
    pub fn root(&self) -> PageId {
        self.root
    }

    pub fn store(&mut self) -> &mut S {
        self.store
    }

    /// Point lookup.
    pub fn search(&mut self, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let mut current = self.root;
        loop {
            match self.load_tree_node(current)? {
                Node::Leaf(leaf) => {
                    return Ok(leaf
                        .search(key)
                        .ok()
                        .map(|i| leaf.entries[i].1.clone()));
                }
                Node::Internal(node) => {
                    current = node.children[node.child_index(key)];
                }
                _ => unreachable!(),
            }
        }
    }

    /// Insert or overwrite. The most recent insert for a key wins.
    pub fn insert(&mut self, key: Bytes, value: Bytes) -> StorageResult<()> {
        if key.len() > MAX_KEY_LEN {
            return Err(StorageError::TooBig {
                kind: "key",
                len: key.len(),
                max: MAX_KEY_LEN,
            });
        }
        if value.len() > MAX_VALUE_LEN {
            return Err(StorageError::TooBig {
                kind: "value",
                len: value.len(),
                max: MAX_VALUE_LEN,
            });
        }

        self.split_root_if_full()?;

        let mut current = self.root;
        loop {
            match self.load_tree_node(current)? {
                Node::Leaf(mut leaf) => {
                    match leaf.search(&key) {
                        Ok(i) => leaf.entries[i].1 = value,
                        Err(i) => leaf.entries.insert(i, (key, value)),
                    }
                    self.store.store(current, Node::Leaf(leaf))?;
                    return Ok(());
                }
                Node::Internal(mut node) => {
                    let idx = node.child_index(&key);
                    let child_id = node.children[idx];
                    let child = self.load_tree_node(child_id)?;

                    let child_full = match &child {
                        Node::Leaf(leaf) => leaf.is_full(),
                        Node::Internal(n) => n.is_full(),
                        _ => unreachable!(),
                    };
                    if child_full {
                        let (sep, new_id) = self.split_child(child_id, child)?;
                        node.keys.insert(idx, sep);
                        node.children.insert(idx + 1, new_id);
                        // Persist the updated parent before the next page
                        // fetch; a descent through a stale parent is how
                        // order corruption enters the tree.
                        self.store.store(current, Node::Internal(node.clone()))?;

                        // Recompute the descent index from the post-split
                        // node. It ranges over 0..=key_count and indexes
                        // `children` only.
                        let idx = node.child_index(&key);
                        current = node.children[idx];
                    } else {
                        current = child_id;
                    }
                }
                _ => unreachable!(),
            }
        }
    }

    /// Remove a key. `KeyNotFound` if absent; the tree is unchanged then.
    pub fn delete(&mut self, key: &[u8]) -> StorageResult<()> {
        self.delete_rec(self.root, key)?;

        // Collapse the root while it is an internal node with one child.
        loop {
            match self.load_tree_node(self.root)? {
                Node::Internal(node) if node.keys.is_empty() => {
                    let child = node.children[0];
                    let old_root = self.root;
                    self.store.free(old_root)?;
                    self.root = child;
                    debug!("btree root collapse: {} -> {}", old_root, child);
                }
                _ => return Ok(()),
            }
        }
    }

    /// Number of levels from the root down to the leaves.
    pub fn height(&mut self) -> StorageResult<u32> {
        let mut current = self.root;
        let mut height = 1;
        loop {
            match self.load_tree_node(current)? {
                Node::Leaf(_) => return Ok(height),
                Node::Internal(node) => {
                    current = node.children[0];
                    height += 1;
                }
                _ => unreachable!(),
            }
        }
    }

    /// Full structural audit: every key strictly greater than its
    /// predecessor in an in-order walk, separator bounds honored, all
    /// leaves at equal depth. Any violation is `OrderMismatch`, reported
    /// and never repaired.
    pub fn verify(&mut self) -> StorageResult<()> {
        let mut last: Option<Bytes> = None;
        self.verify_rec(self.root, None, None, &mut last)?;
        Ok(())
    }

    fn verify_rec(
        &mut self,
        page_id: PageId,
        lower: Option<&Bytes>,
        upper: Option<&Bytes>,
        last: &mut Option<Bytes>,
    ) -> StorageResult<u32> {
        let in_bounds = |key: &Bytes| {
            lower.map_or(true, |lo| key >= lo) && upper.map_or(true, |hi| key < hi)
        };
        match self.load_tree_node(page_id)? {
            Node::Leaf(leaf) => {
                for (key, _) in &leaf.entries {
                    let ordered = last.as_ref().map_or(true, |prev| prev < key);
                    if !ordered || !in_bounds(key) {
                        return Err(StorageError::OrderMismatch { page_id });
                    }
                    *last = Some(key.clone());
                }
                Ok(1)
            }
            Node::Internal(node) => {
                if node.keys.iter().any(|k| !in_bounds(k)) {
                    return Err(StorageError::OrderMismatch { page_id });
                }
                let mut depth = None;
                for (i, &child) in node.children.iter().enumerate() {
                    let lo = if i == 0 { lower } else { Some(&node.keys[i - 1]) };
                    let hi = if i == node.keys.len() {
                        upper
                    } else {
                        Some(&node.keys[i])
                    };
                    let d = self.verify_rec(child, lo, hi, last)?;
                    if *depth.get_or_insert(d) != d {
                        return Err(StorageError::OrderMismatch { page_id });
                    }
                }
                Ok(depth.unwrap_or(1) + 1)
            }
            _ => unreachable!(),
        }
    }

    /// Descend to the leaf that contains `key`, or the leftmost leaf when
    /// `key` is `None`. Used by range scans.
    pub(crate) fn leaf_containing(
        &mut self,
        key: Option<&[u8]>,
    ) -> StorageResult<(PageId, LeafNode)> {
        let mut current = self.root;
        loop {
            match self.load_tree_node(current)? {
                Node::Leaf(leaf) => return Ok((current, leaf)),
                Node::Internal(node) => {
                    let idx = key.map_or(0, |k| node.child_index(k));
                    current = node.children[idx];
                }
                _ => unreachable!(),
            }
        }
    }

    /// Load a page that must be a leaf (following sibling links).
    pub(crate) fn load_leaf(&mut self, page_id: PageId) -> StorageResult<LeafNode> {
        match self.load_tree_node(page_id)? {
            Node::Leaf(leaf) => Ok(leaf),
            _ => Err(StorageError::OrderMismatch { page_id }),
        }
    }

    /// Load a page that must be a tree node. A free or meta page inside
    /// the tree means the structure is damaged.
    fn load_tree_node(&mut self, page_id: PageId) -> StorageResult<Node> {
        match self.store.load(page_id)? {
            node @ (Node::Leaf(_) | Node::Internal(_)) => Ok(node),
            _ => Err(StorageError::OrderMismatch { page_id }),
        }
    }

    fn split_root_if_full(&mut self) -> StorageResult<()> {
        let node = self.load_tree_node(self.root)?;
        let full = match &node {
            Node::Leaf(leaf) => leaf.is_full(),
            Node::Internal(n) => n.is_full(),
            _ => unreachable!(),
        };
        if !full {
            return Ok(());
        }

        let old_root = self.root;
        let (sep, new_id) = self.split_child(old_root, node)?;
        let new_root = InternalNode {
            keys: vec![sep],
            children: vec![old_root, new_id],
        };
        let new_root_id = self.store.allocate()?;
        self.store.store(new_root_id, Node::Internal(new_root))?;
        self.root = new_root_id;
        debug!("btree root split: {} -> {}", old_root, new_root_id);
        Ok(())
    }

    /// Split a full node at its median. Both halves are written through the
    /// store before returning. Returns the separator key and the new right
    /// sibling's page.
    fn split_child(&mut self, page_id: PageId, node: Node) -> StorageResult<(Bytes, PageId)> {
        let new_id = self.store.allocate()?;
        match node {
            Node::Leaf(mut leaf) => {
                let right_entries = leaf.entries.split_off(leaf.entries.len() / 2);
                // B+tree leaf split: the separator is copied up, the entry
                // itself stays in the right half.
                let sep = right_entries[0].0.clone();
                let right = LeafNode {
                    entries: right_entries,
                    next_leaf: leaf.next_leaf,
                };
                leaf.next_leaf = Some(new_id);
                self.store.store(new_id, Node::Leaf(right))?;
                self.store.store(page_id, Node::Leaf(leaf))?;
                Ok((sep, new_id))
            }
            Node::Internal(mut node) => {
                let mid = node.keys.len() / 2;
                let right_keys = node.keys.split_off(mid + 1);
                let sep = node.keys.pop().ok_or(StorageError::OrderMismatch { page_id })?;
                let right_children = node.children.split_off(mid + 1);
                let right = InternalNode {
                    keys: right_keys,
                    children: right_children,
                };
                self.store.store(new_id, Node::Internal(right))?;
                self.store.store(page_id, Node::Internal(node))?;
                Ok((sep, new_id))
            }
            _ => Err(StorageError::OrderMismatch { page_id }),
        }
    }

    /// Returns true when this subtree ended up under `MIN_KEYS` and its
    /// parent must repair it.
    fn delete_rec(&mut self, page_id: PageId, key: &[u8]) -> StorageResult<bool> {
        match self.load_tree_node(page_id)? {
            Node::Leaf(mut leaf) => {
                let i = leaf.search(key).map_err(|_| StorageError::KeyNotFound)?;
                leaf.entries.remove(i);
                let underflow = leaf.entries.len() < MIN_KEYS;
                self.store.store(page_id, Node::Leaf(leaf))?;
                Ok(underflow)
            }
            Node::Internal(mut node) => {
                let idx = node.child_index(key);
                let child_underflow = self.delete_rec(node.children[idx], key)?;
                if !child_underflow {
                    return Ok(false);
                }
                self.fix_underflow(&mut node, idx)?;
                let underflow = node.keys.len() < MIN_KEYS;
                self.store.store(page_id, Node::Internal(node))?;
                Ok(underflow)
            }
            _ => Err(StorageError::OrderMismatch { page_id }),
        }
    }

    /// Repair child `idx` of `parent` after it dropped below `MIN_KEYS`.
    /// Borrow from the right sibling first, then the left; merge when
    /// neither has a spare key. `parent` is mutated in place and written
    /// back by the caller.
    fn fix_underflow(&mut self, parent: &mut InternalNode, idx: usize) -> StorageResult<()> {
        let child_id = parent.children[idx];

        if idx + 1 < parent.children.len() {
            let right_id = parent.children[idx + 1];
            if self.node_len(right_id)? > MIN_KEYS {
                return self.borrow_from_right(parent, idx, child_id, right_id);
            }
        }
        if idx > 0 {
            let left_id = parent.children[idx - 1];
            if self.node_len(left_id)? > MIN_KEYS {
                return self.borrow_from_left(parent, idx, child_id, left_id);
            }
        }

        // Merge with the right sibling, or with the left when the child is
        // the rightmost.
        if idx + 1 < parent.children.len() {
            self.merge_children(parent, idx)
        } else {
            self.merge_children(parent, idx - 1)
        }
    }

    fn node_len(&mut self, page_id: PageId) -> StorageResult<usize> {
        Ok(match self.load_tree_node(page_id)? {
            Node::Leaf(leaf) => leaf.entries.len(),
            Node::Internal(node) => node.keys.len(),
            _ => unreachable!(),
        })
    }

    fn borrow_from_right(
        &mut self,
        parent: &mut InternalNode,
        idx: usize,
        child_id: PageId,
        right_id: PageId,
    ) -> StorageResult<()> {
        let child = self.load_tree_node(child_id)?;
        let right = self.load_tree_node(right_id)?;
        match (child, right) {
            (Node::Leaf(mut child), Node::Leaf(mut right)) => {
                child.entries.push(right.entries.remove(0));
                parent.keys[idx] = right.entries[0].0.clone();
                self.store.store(child_id, Node::Leaf(child))?;
                self.store.store(right_id, Node::Leaf(right))?;
            }
            (Node::Internal(mut child), Node::Internal(mut right)) => {
                // Rotate through the separator.
                child.keys.push(parent.keys[idx].clone());
                parent.keys[idx] = right.keys.remove(0);
                child.children.push(right.children.remove(0));
                self.store.store(child_id, Node::Internal(child))?;
                self.store.store(right_id, Node::Internal(right))?;
            }
            _ => return Err(StorageError::OrderMismatch { page_id: child_id }),
        }
        Ok(())
    }

    fn borrow_from_left(
        &mut self,
        parent: &mut InternalNode,
        idx: usize,
        child_id: PageId,
        left_id: PageId,
    ) -> StorageResult<()> {
        let child = self.load_tree_node(child_id)?;
        let left = self.load_tree_node(left_id)?;
        match (child, left) {
            (Node::Leaf(mut child), Node::Leaf(mut left)) => {
                let moved = left
                    .entries
                    .pop()
                    .ok_or(StorageError::OrderMismatch { page_id: left_id })?;
                parent.keys[idx - 1] = moved.0.clone();
                child.entries.insert(0, moved);
                self.store.store(child_id, Node::Leaf(child))?;
                self.store.store(left_id, Node::Leaf(left))?;
            }
            (Node::Internal(mut child), Node::Internal(mut left)) => {
                let sep = std::mem::replace(
                    &mut parent.keys[idx - 1],
                    left.keys
                        .pop()
                        .ok_or(StorageError::OrderMismatch { page_id: left_id })?,
                );
                child.keys.insert(0, sep);
                let moved_child = left
                    .children
                    .pop()
                    .ok_or(StorageError::OrderMismatch { page_id: left_id })?;
                child.children.insert(0, moved_child);
                self.store.store(child_id, Node::Internal(child))?;
                self.store.store(left_id, Node::Internal(left))?;
            }
            _ => return Err(StorageError::OrderMismatch { page_id: child_id }),
        }
        Ok(())
    }

    /// Merge `children[i + 1]` into `children[i]` and free the right page.
    fn merge_children(&mut self, parent: &mut InternalNode, i: usize) -> StorageResult<()> {
        let left_id = parent.children[i];
        let right_id = parent.children[i + 1];
        let left = self.load_tree_node(left_id)?;
        let right = self.load_tree_node(right_id)?;
        match (left, right) {
            (Node::Leaf(mut left), Node::Leaf(right)) => {
                left.entries.extend(right.entries);
                left.next_leaf = right.next_leaf;
                self.store.store(left_id, Node::Leaf(left))?;
            }
            (Node::Internal(mut left), Node::Internal(right)) => {
                left.keys.push(parent.keys[i].clone());
                left.keys.extend(right.keys);
                left.children.extend(right.children);
                self.store.store(left_id, Node::Internal(left))?;
            }
            _ => return Err(StorageError::OrderMismatch { page_id: left_id }),
        }
        parent.keys.remove(i);
        parent.children.remove(i + 1);
        self.store.free(right_id)?;
        debug!("btree merge: {} absorbed {}", left_id, right_id);
        Ok(())
    }
}
