//! Write transaction mechanics: the single-writer gate and the private
//! copy-on-write workspace.
//!
//! A write transaction never touches the shared cache. Every page it reads
//! is copied into its [`Workspace`], every page it writes stays there, and
//! allocation and freeing operate on a private snapshot of the meta page.
//! Until commit publication nothing a transaction did is observable, and
//! nothing it wrote can be evicted out from under it.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::node::{MetaNode, Node};
use crate::storage::page::PageId;
use crate::storage::pager::{PageStore, Pager};
use crate::transaction::id::{TransactionId, TransactionIdGenerator};
use crate::transaction::state::TransactionState;
use log::debug;
use parking_lot::{Condvar, Mutex};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Serializes writers. Acquisition blocks until the holder releases or the
/// timeout elapses, in which case the caller gets `Busy`.
pub struct WriteGate {
    held: Mutex<bool>,
    available: Condvar,
}

impl WriteGate {
    pub fn new() -> Self {
        Self {
            held: Mutex::new(false),
            available: Condvar::new(),
        }
    }

    pub fn acquire(&self, timeout: Duration) -> StorageResult<()> {
        let deadline = Instant::now() + timeout;
        let mut held = self.held.lock();
        while *held {
            if self.available.wait_until(&mut held, deadline).timed_out() {
                return Err(StorageError::Busy);
            }
        }
        *held = true;
        Ok(())
    }

    pub fn release(&self) {
        *self.held.lock() = false;
        self.available.notify_one();
    }
}

impl Default for WriteGate {
    fn default() -> Self {
        Self::new()
    }
}

/// Private page overlay for one write transaction.
///
/// Loads fall through to the shared pager for pages the transaction has
/// not touched; stores, allocations, and frees are recorded locally. The
/// meta snapshot carries the transaction's view of the page count, the
/// free-list head, and the catalog.
pub struct Workspace {
    pager: Pager,
    nodes: HashMap<PageId, Node>,
    meta: MetaNode,
}

impl Workspace {
    pub fn new(pager: Pager) -> Self {
        let meta = pager.meta();
        Workspace {
            pager,
            nodes: HashMap::new(),
            meta,
        }
    }

    pub fn meta(&self) -> &MetaNode {
        &self.meta
    }

    pub fn meta_mut(&mut self) -> &mut MetaNode {
        &mut self.meta
    }

    /// Number of pages this transaction has written.
    pub fn dirty_len(&self) -> usize {
        self.nodes.len()
    }

    /// Drain the written pages in id order, leaving the workspace empty.
    fn drain_dirty(&mut self) -> Vec<(PageId, Node)> {
        let mut pages: Vec<(PageId, Node)> = self.nodes.drain().collect();
        pages.sort_by_key(|(page_id, _)| page_id.0);
        pages
    }
}

impl PageStore for Workspace {
    fn load(&mut self, page_id: PageId) -> StorageResult<Node> {
        if let Some(node) = self.nodes.get(&page_id) {
            return Ok(node.clone());
        }
        self.pager.read(page_id)
    }

    fn store(&mut self, page_id: PageId, node: Node) -> StorageResult<()> {
        self.nodes.insert(page_id, node);
        Ok(())
    }

    fn allocate(&mut self) -> StorageResult<PageId> {
        match self.meta.free_head {
            Some(head) => {
                let next = match self.load(head)? {
                    Node::Free { next } => next,
                    // The free-list head must be a free page; anything else
                    // means the list structure is damaged.
                    _ => return Err(StorageError::ChecksumMismatch { page_id: head }),
                };
                self.meta.free_head = next;
                Ok(head)
            }
            None => {
                let page_id = PageId(self.meta.page_count);
                self.meta.page_count += 1;
                Ok(page_id)
            }
        }
    }

    fn free(&mut self, page_id: PageId) -> StorageResult<()> {
        if matches!(self.load(page_id)?, Node::Free { .. }) {
            return Err(StorageError::DoubleFree(page_id));
        }
        let next = self.meta.free_head;
        self.meta.free_head = Some(page_id);
        self.nodes.insert(page_id, Node::Free { next });
        Ok(())
    }
}

/// Hands out transaction ids and admits one writer at a time.
pub struct TransactionManager {
    ids: TransactionIdGenerator,
    gate: Arc<WriteGate>,
    lock_timeout: Duration,
}

impl TransactionManager {
    pub fn new(lock_timeout: Duration) -> Self {
        Self {
            ids: TransactionIdGenerator::new(),
            gate: Arc::new(WriteGate::new()),
            lock_timeout,
        }
    }

    /// Begin a write transaction. Blocks behind the current writer, if any;
    /// `Busy` once the lock timeout elapses.
    pub fn begin(&self, pager: &Pager) -> StorageResult<WriteHandle> {
        self.gate.acquire(self.lock_timeout)?;
        let id = self.ids.generate();
        debug!("transaction {} started", id);
        Ok(WriteHandle {
            id,
            state: TransactionState::Active,
            workspace: Workspace::new(pager.clone()),
            gate: Arc::clone(&self.gate),
            gate_held: true,
        })
    }
}

/// One write transaction's identity, state, and workspace. Dropping a
/// handle that never committed discards the workspace and releases the
/// writer gate, which is all a rollback requires.
pub struct WriteHandle {
    id: TransactionId,
    state: TransactionState,
    workspace: Workspace,
    gate: Arc<WriteGate>,
    gate_held: bool,
}

impl WriteHandle {
    pub fn id(&self) -> TransactionId {
        self.id
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn ensure_active(&self) -> StorageResult<()> {
        if self.state.is_active() {
            Ok(())
        } else {
            Err(StorageError::TransactionClosed)
        }
    }

    pub fn workspace_mut(&mut self) -> &mut Workspace {
        &mut self.workspace
    }

    pub fn mark_committing(&mut self) {
        self.state = TransactionState::Committing;
    }

    /// Take everything the transaction wrote, for WAL logging and
    /// publication: the dirty pages in id order plus the meta snapshot.
    pub fn commit_set(&mut self) -> (Vec<(PageId, Node)>, MetaNode) {
        let pages = self.workspace.drain_dirty();
        (pages, self.workspace.meta.clone())
    }

    pub fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
        self.release_gate();
        debug!("transaction {} committed", self.id);
    }

    pub fn mark_aborted(&mut self) {
        self.state = TransactionState::Aborted;
        self.workspace.nodes.clear();
        self.release_gate();
        debug!("transaction {} aborted", self.id);
    }

    fn release_gate(&mut self) {
        if std::mem::take(&mut self.gate_held) {
            self.gate.release();
        }
    }
}

impl Drop for WriteHandle {
    fn drop(&mut self) {
        if !self.state.is_terminal() {
            self.mark_aborted();
        }
        self.release_gate();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::page::node::LeafNode;
    use anyhow::Result;
    use bytes::Bytes;
    use tempfile::tempdir;

    fn leaf(tag: u8) -> Node {
        Node::Leaf(LeafNode {
            entries: vec![(
                Bytes::copy_from_slice(&[tag]),
                Bytes::copy_from_slice(&[tag]),
            )],
            next_leaf: None,
        })
    }

    #[test]
    fn test_workspace_writes_are_private() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::create(&dir.path().join("test.db"), 8)?;
        let mut workspace = Workspace::new(pager.clone());

        let a = workspace.allocate()?;
        workspace.store(a, leaf(1))?;

        // Visible inside the workspace, invisible through the shared pager.
        assert_eq!(workspace.load(a)?, leaf(1));
        assert!(matches!(
            pager.read(a),
            Err(StorageError::OutOfRange(id)) if id == a
        ));
        assert_eq!(pager.dirty_count(), 0);
        Ok(())
    }

    #[test]
    fn test_workspace_reads_fall_through_to_pager() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = Pager::create(&dir.path().join("test.db"), 8)?;

        let a = pager.allocate()?;
        pager.store(a, leaf(7))?;

        let mut workspace = Workspace::new(pager.clone());
        assert_eq!(workspace.load(a)?, leaf(7));
        Ok(())
    }

    #[test]
    fn test_workspace_free_list_is_private() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::create(&dir.path().join("test.db"), 8)?;
        let mut workspace = Workspace::new(pager.clone());

        let a = workspace.allocate()?;
        workspace.store(a, leaf(1))?;
        workspace.free(a)?;
        assert_eq!(workspace.meta().free_head, Some(a));
        assert_eq!(pager.meta().free_head, None);

        // Double free inside the workspace is still caught.
        assert!(matches!(
            workspace.free(a),
            Err(StorageError::DoubleFree(id)) if id == a
        ));

        // The freed page is recycled by the same transaction.
        assert_eq!(workspace.allocate()?, a);
        assert_eq!(workspace.meta().free_head, None);
        Ok(())
    }

    #[test]
    fn test_second_writer_times_out_with_busy() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::create(&dir.path().join("test.db"), 8)?;
        let manager = TransactionManager::new(Duration::from_millis(20));

        let first = manager.begin(&pager)?;
        assert!(matches!(manager.begin(&pager), Err(StorageError::Busy)));

        drop(first);
        let second = manager.begin(&pager)?;
        assert!(second.state().is_active());
        Ok(())
    }

    #[test]
    fn test_drop_rolls_back_and_releases_gate() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::create(&dir.path().join("test.db"), 8)?;
        let manager = TransactionManager::new(Duration::from_millis(20));

        {
            let mut handle = manager.begin(&pager)?;
            let a = handle.workspace_mut().allocate()?;
            handle.workspace_mut().store(a, leaf(1))?;
            // Dropped without commit.
        }

        // Nothing leaked into the shared state, and the gate is free.
        assert_eq!(pager.meta().page_count, 1);
        assert_eq!(pager.dirty_count(), 0);
        let handle = manager.begin(&pager)?;
        assert!(handle.state().is_active());
        Ok(())
    }

    #[test]
    fn test_closed_handle_rejects_operations() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::create(&dir.path().join("test.db"), 8)?;
        let manager = TransactionManager::new(Duration::from_millis(20));

        let mut handle = manager.begin(&pager)?;
        handle.mark_aborted();
        assert!(matches!(
            handle.ensure_active(),
            Err(StorageError::TransactionClosed)
        ));
        Ok(())
    }

    #[test]
    fn test_commit_set_is_ordered_by_page_id() -> Result<()> {
        let dir = tempdir()?;
        let pager = Pager::create(&dir.path().join("test.db"), 8)?;
        let manager = TransactionManager::new(Duration::from_millis(20));

        let mut handle = manager.begin(&pager)?;
        let workspace = handle.workspace_mut();
        let a = workspace.allocate()?;
        let b = workspace.allocate()?;
        let c = workspace.allocate()?;
        workspace.store(c, leaf(3))?;
        workspace.store(a, leaf(1))?;
        workspace.store(b, leaf(2))?;

        let (pages, meta) = handle.commit_set();
        let ids: Vec<PageId> = pages.iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![a, b, c]);
        assert_eq!(meta.page_count, 4);
        Ok(())
    }
}
