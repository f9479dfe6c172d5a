//! Public facade: [`Database`], [`TableHandle`], [`Transaction`], [`Scan`].
//!
//! A `Database` is cheap to clone and safe to share across threads. Writes
//! go through explicit transactions or the autocommit wrappers, which run
//! the same commit protocol: page after-images to the WAL, commit marker,
//! fsync, then publication into the shared pager under the commit lock.
//! Readers take the commit lock in read mode, so a scan observes the state
//! as of its start for as long as it lives.

use crate::btree::iterator::LeafCursor;
use crate::btree::BTree;
use crate::recovery;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::node::Node;
use crate::storage::page::PageId;
use crate::storage::pager::Pager;
use crate::storage::wal::{WalManager, WalRecord};
use crate::transaction::manager::{TransactionManager, WriteHandle};
use bytes::Bytes;
use log::{debug, info, warn};
use parking_lot::{ArcRwLockReadGuard, Mutex, RawRwLock, RwLock};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs. The page size is fixed; everything else has a default
/// that suits tests and small embedded workloads.
#[derive(Debug, Clone)]
pub struct DatabaseConfig {
    /// Decoded pages the shared cache may hold.
    pub cache_capacity: usize,
    /// How long writers wait for the write gate or the commit lock before
    /// failing `Busy`.
    pub lock_timeout: Duration,
    /// WAL size in bytes that triggers an automatic checkpoint at commit.
    pub checkpoint_threshold: u64,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            cache_capacity: 1024,
            lock_timeout: Duration::from_secs(5),
            checkpoint_threshold: 4 * 1024 * 1024,
        }
    }
}

/// Names a table in the catalog. The root page is resolved per operation,
/// since it moves whenever a commit splits or collapses the tree root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TableHandle {
    name: String,
}

impl TableHandle {
    pub fn name(&self) -> &str {
        &self.name
    }
}

struct Shared {
    pager: Pager,
    wal: Mutex<WalManager>,
    transactions: TransactionManager,
    commit_lock: Arc<RwLock<()>>,
    config: DatabaseConfig,
}

#[derive(Clone)]
pub struct Database {
    shared: Arc<Shared>,
}

fn wal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push("-wal");
    PathBuf::from(name)
}

impl Database {
    /// Create a new database file (and its WAL sidecar) at `path`.
    pub fn create(path: &Path) -> StorageResult<Database> {
        let config = DatabaseConfig::default();
        let pager = Pager::create(path, config.cache_capacity)?;
        let wal = WalManager::open(&wal_path(path))?;
        Ok(Self::assemble(pager, wal, config))
    }

    /// Open an existing database, replaying the WAL before serving reads.
    pub fn open(path: &Path) -> StorageResult<Database> {
        Self::open_with_config(path, DatabaseConfig::default())
    }

    pub fn open_with_config(path: &Path, config: DatabaseConfig) -> StorageResult<Database> {
        let pager = Pager::open(path, config.cache_capacity)?;
        let mut wal = WalManager::open(&wal_path(path))?;
        recovery::replay(&mut wal, &pager)?;
        Ok(Self::assemble(pager, wal, config))
    }

    fn assemble(pager: Pager, wal: WalManager, config: DatabaseConfig) -> Database {
        Database {
            shared: Arc::new(Shared {
                pager,
                wal: Mutex::new(wal),
                transactions: TransactionManager::new(config.lock_timeout),
                commit_lock: Arc::new(RwLock::new(())),
                config,
            }),
        }
    }

    /// Begin a write transaction. At most one is active at a time; `Busy`
    /// once the lock timeout elapses behind another writer.
    pub fn begin(&self) -> StorageResult<Transaction> {
        let handle = self.shared.transactions.begin(&self.shared.pager)?;
        Ok(Transaction {
            shared: Arc::clone(&self.shared),
            handle,
        })
    }

    /// Create a table with a fresh B-tree root (autocommit).
    pub fn create_table(&self, name: &str) -> StorageResult<TableHandle> {
        let mut txn = self.begin()?;
        let handle = txn.create_table(name)?;
        txn.commit()?;
        Ok(handle)
    }

    pub fn open_table(&self, name: &str) -> StorageResult<TableHandle> {
        let _read = self.shared.commit_lock.read();
        if self.shared.pager.meta().catalog.contains_key(name) {
            Ok(TableHandle {
                name: name.to_string(),
            })
        } else {
            Err(StorageError::TableNotFound(name.to_string()))
        }
    }

    pub fn get(&self, table: &TableHandle, key: &[u8]) -> StorageResult<Option<Bytes>> {
        let _read = self.shared.commit_lock.read();
        let root = self.table_root(table)?;
        let mut pager = self.shared.pager.clone();
        BTree::open(&mut pager, root).search(key)
    }

    /// Insert or overwrite one entry (autocommit).
    pub fn put(&self, table: &TableHandle, key: Bytes, value: Bytes) -> StorageResult<()> {
        let mut txn = self.begin()?;
        txn.put(table, key, value)?;
        txn.commit()
    }

    /// Delete one entry (autocommit). `KeyNotFound` if absent.
    pub fn delete(&self, table: &TableHandle, key: &[u8]) -> StorageResult<()> {
        let mut txn = self.begin()?;
        txn.delete(table, key)?;
        txn.commit()
    }

    /// Ordered scan of `[start, end]` (inclusive bounds, `None` meaning
    /// unbounded). The scan holds the commit lock in read mode for its
    /// lifetime, so it sees the state as of this call.
    pub fn scan(
        &self,
        table: &TableHandle,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> StorageResult<Scan> {
        let guard = self.shared.commit_lock.read_arc();
        let root = self.table_root(table)?;
        Ok(Scan {
            _guard: guard,
            pager: self.shared.pager.clone(),
            root,
            cursor: LeafCursor::new(start.map(Bytes::copy_from_slice)),
            end: end.map(Bytes::copy_from_slice),
            buffer: VecDeque::new(),
            failed: false,
        })
    }

    /// Persist all dirty pages and truncate the WAL.
    pub fn checkpoint(&self) -> StorageResult<()> {
        let mut wal = self.shared.wal.lock();
        recovery::checkpoint(&self.shared.pager, &mut wal)?;
        info!("checkpoint complete, wal size {}", wal.size());
        Ok(())
    }

    /// Integrity audit of one table: key ordering, separator bounds, and
    /// uniform leaf depth. Any violation is `OrderMismatch`.
    pub fn verify(&self, table: &TableHandle) -> StorageResult<()> {
        let _read = self.shared.commit_lock.read();
        let root = self.table_root(table)?;
        let mut pager = self.shared.pager.clone();
        BTree::open(&mut pager, root).verify()
    }

    fn table_root(&self, table: &TableHandle) -> StorageResult<PageId> {
        self.shared
            .pager
            .meta()
            .catalog
            .get(&table.name)
            .copied()
            .ok_or_else(|| StorageError::TableNotFound(table.name.clone()))
    }
}

/// A write transaction. Mutations accumulate in a private workspace and
/// become visible and durable only at [`Transaction::commit`]. Dropping an
/// uncommitted transaction rolls it back.
pub struct Transaction {
    shared: Arc<Shared>,
    handle: WriteHandle,
}

impl Transaction {
    pub fn create_table(&mut self, name: &str) -> StorageResult<TableHandle> {
        self.handle.ensure_active()?;
        let workspace = self.handle.workspace_mut();
        if workspace.meta().catalog.contains_key(name) {
            return Err(StorageError::AlreadyExists(name.to_string()));
        }
        let root = BTree::create(&mut *workspace)?.root();
        workspace.meta_mut().catalog.insert(name.to_string(), root);
        Ok(TableHandle {
            name: name.to_string(),
        })
    }

    pub fn get(&mut self, table: &TableHandle, key: &[u8]) -> StorageResult<Option<Bytes>> {
        self.handle.ensure_active()?;
        let root = self.table_root(table)?;
        BTree::open(self.handle.workspace_mut(), root).search(key)
    }

    pub fn put(&mut self, table: &TableHandle, key: Bytes, value: Bytes) -> StorageResult<()> {
        self.handle.ensure_active()?;
        let root = self.table_root(table)?;
        let workspace = self.handle.workspace_mut();
        let mut tree = BTree::open(&mut *workspace, root);
        tree.insert(key, value)?;
        let new_root = tree.root();
        if new_root != root {
            workspace
                .meta_mut()
                .catalog
                .insert(table.name.clone(), new_root);
        }
        Ok(())
    }

    pub fn delete(&mut self, table: &TableHandle, key: &[u8]) -> StorageResult<()> {
        self.handle.ensure_active()?;
        let root = self.table_root(table)?;
        let workspace = self.handle.workspace_mut();
        let mut tree = BTree::open(&mut *workspace, root);
        tree.delete(key)?;
        let new_root = tree.root();
        if new_root != root {
            workspace
                .meta_mut()
                .catalog
                .insert(table.name.clone(), new_root);
        }
        Ok(())
    }

    /// Make the transaction durable and visible.
    ///
    /// Protocol: take the commit lock, append a `PageImage` record per
    /// dirty page plus the meta page, append the `Commit` marker, fsync
    /// the WAL (the durability point), then publish the pages and meta
    /// state into the shared pager. The lock is taken *before* the fsync:
    /// once the commit marker is durable, publication is infallible, so a
    /// commit either fails with nothing in the log or applies both on disk
    /// and in memory. `Busy` when readers hold the lock past the timeout.
    pub fn commit(mut self) -> StorageResult<()> {
        self.handle.ensure_active()?;
        self.handle.mark_committing();
        let id = self.handle.id();
        let (pages, meta) = self.handle.commit_set();

        let publish_guard = self
            .shared
            .commit_lock
            .try_write_for(self.shared.config.lock_timeout)
            .ok_or(StorageError::Busy)?;

        let mut wal = self.shared.wal.lock();
        for (page_id, node) in &pages {
            let image = node.encode()?.to_vec();
            let lsn = wal.next_lsn();
            wal.append(&WalRecord::page_image(lsn, id.0, *page_id, image))?;
        }
        let meta_image = Node::Meta(meta.clone()).encode()?.to_vec();
        let lsn = wal.next_lsn();
        wal.append(&WalRecord::page_image(lsn, id.0, PageId::META, meta_image))?;
        let lsn = wal.next_lsn();
        wal.append(&WalRecord::commit(lsn, id.0))?;
        wal.sync()?;

        debug!("transaction {} publishing {} pages", id, pages.len());
        self.shared.pager.publish(pages, meta);
        drop(publish_guard);
        self.handle.mark_committed();

        // The transaction is committed at this point; a failed
        // auto-checkpoint must not turn its result into an error.
        if wal.size() > self.shared.config.checkpoint_threshold {
            if let Err(e) = recovery::checkpoint(&self.shared.pager, &mut wal) {
                warn!("auto-checkpoint after transaction {} failed: {}", id, e);
            }
        }
        Ok(())
    }

    /// Discard every buffered change. No I/O is involved.
    pub fn rollback(mut self) {
        self.handle.mark_aborted();
    }

    fn table_root(&mut self, table: &TableHandle) -> StorageResult<PageId> {
        self.handle
            .workspace_mut()
            .meta()
            .catalog
            .get(&table.name)
            .copied()
            .ok_or_else(|| StorageError::TableNotFound(table.name.clone()))
    }
}

/// Lazy ordered iterator over one table's entries. Holds the commit lock
/// in read mode, so commits wait for outstanding scans.
pub struct Scan {
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
    pager: Pager,
    root: PageId,
    cursor: LeafCursor,
    end: Option<Bytes>,
    buffer: VecDeque<(Bytes, Bytes)>,
    failed: bool,
}

impl Iterator for Scan {
    type Item = StorageResult<(Bytes, Bytes)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if self.buffer.is_empty() && !self.cursor.is_done() {
            let mut pager = self.pager.clone();
            let mut tree = BTree::open(&mut pager, self.root);
            match self.cursor.next_batch(&mut tree, self.end.as_deref()) {
                Ok(batch) => self.buffer.extend(batch),
                Err(e) => {
                    self.failed = true;
                    return Some(Err(e));
                }
            }
        }
        self.buffer.pop_front().map(Ok)
    }
}
