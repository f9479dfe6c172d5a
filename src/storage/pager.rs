//! Page store: block allocation, free list, cache, and the meta page.
//!
//! The [`Pager`] owns the backing file, the bounded node cache, and the
//! in-memory copy of the meta page (page count, free-list head, catalog).
//! There is no ambient global state; everything is a field of one `Pager`
//! instance shared via `Arc`.
//!
//! Free pages form an on-page linked list: each free page stores the id of
//! the next free page, and the meta page stores the head. Allocation pops
//! the head; freeing pushes onto it. Freeing a page that is already a
//! free-list member fails with `DoubleFree`.

use crate::storage::buffer::NodeCache;
use crate::storage::disk::FileManager;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::node::{MetaNode, Node};
use crate::storage::page::PageId;
use log::debug;
use parking_lot::Mutex;
use std::path::Path;
use std::sync::Arc;

/// Uniform access to pages, implemented both by the [`Pager`] (direct,
/// shared state) and by the transaction workspace (private copy-on-write
/// overlay). The B-tree engine is written against this trait so the same
/// algorithms serve both recovery and transactional mutation.
pub trait PageStore {
    fn load(&mut self, page_id: PageId) -> StorageResult<Node>;
    fn store(&mut self, page_id: PageId, node: Node) -> StorageResult<()>;

    /// Take a fresh page from the free list or by growing the file.
    fn allocate(&mut self) -> StorageResult<PageId>;

    /// Return a page to the free list; `DoubleFree` if it is already free.
    fn free(&mut self, page_id: PageId) -> StorageResult<()>;
}

#[derive(Clone)]
pub struct Pager {
    inner: Arc<PagerInner>,
}

struct PagerInner {
    disk: Mutex<FileManager>,
    cache: Mutex<NodeCache>,
    meta: Mutex<MetaNode>,
}

impl Pager {
    /// Create a fresh database file: writes and fsyncs the meta page.
    pub fn create(path: &Path, cache_capacity: usize) -> StorageResult<Pager> {
        let mut disk = FileManager::create(path)?;
        let meta = MetaNode::new();
        disk.write_page(PageId::META, Node::Meta(meta.clone()).encode()?.as_ref())?;
        disk.sync()?;
        Ok(Pager {
            inner: Arc::new(PagerInner {
                disk: Mutex::new(disk),
                cache: Mutex::new(NodeCache::new(cache_capacity)),
                meta: Mutex::new(meta),
            }),
        })
    }

    /// Open an existing database file, validating the meta page. A missing,
    /// unreadable, or checksum-invalid meta page is `CorruptHeader`.
    pub fn open(path: &Path, cache_capacity: usize) -> StorageResult<Pager> {
        let mut disk = FileManager::open(path)?;
        if disk.num_pages()? == 0 {
            return Err(StorageError::CorruptHeader);
        }
        let mut buf = vec![0u8; crate::storage::page::PAGE_SIZE];
        disk.read_page(PageId::META, &mut buf)?;
        let meta = match Node::decode(PageId::META, &buf) {
            Ok(Node::Meta(meta)) => meta,
            Ok(_) => return Err(StorageError::CorruptHeader),
            Err(e) if e.is_corruption() => return Err(StorageError::CorruptHeader),
            Err(e) => return Err(e),
        };
        Ok(Pager {
            inner: Arc::new(PagerInner {
                disk: Mutex::new(disk),
                cache: Mutex::new(NodeCache::new(cache_capacity)),
                meta: Mutex::new(meta),
            }),
        })
    }

    /// Read a decoded page, from the cache when present. `OutOfRange` if
    /// the id is beyond the allocated page count.
    pub fn read(&self, page_id: PageId) -> StorageResult<Node> {
        if page_id.0 >= self.inner.meta.lock().page_count {
            return Err(StorageError::OutOfRange(page_id));
        }
        if let Some(node) = self.inner.cache.lock().get(page_id) {
            return Ok(node);
        }
        let mut buf = vec![0u8; crate::storage::page::PAGE_SIZE];
        self.inner.disk.lock().read_page(page_id, &mut buf)?;
        let node = Node::decode(page_id, &buf)?;
        self.inner.cache.lock().insert(page_id, node.clone(), false);
        Ok(node)
    }

    /// Install a page in the cache, marked dirty. Not durable until
    /// [`Pager::flush`].
    pub fn write(&self, page_id: PageId, node: Node) {
        self.inner.cache.lock().insert(page_id, node, true);
    }

    /// Snapshot of the meta page state.
    pub fn meta(&self) -> MetaNode {
        self.inner.meta.lock().clone()
    }

    /// Replace the meta page state (commit publication, recovery).
    pub fn set_meta(&self, meta: MetaNode) {
        *self.inner.meta.lock() = meta;
    }

    /// Publish a batch of committed pages and the updated meta state into
    /// the shared cache. Callers serialize publication via the commit lock.
    pub fn publish(&self, pages: Vec<(PageId, Node)>, meta: MetaNode) {
        let mut cache = self.inner.cache.lock();
        for (page_id, node) in pages {
            cache.insert(page_id, node, true);
        }
        drop(cache);
        *self.inner.meta.lock() = meta;
    }

    /// Force every dirty page and the meta page (free-list head included)
    /// to disk and fsync.
    pub fn flush(&self) -> StorageResult<()> {
        let dirty = self.inner.cache.lock().take_dirty();
        let meta = self.inner.meta.lock().clone();
        let mut disk = self.inner.disk.lock();
        let count = dirty.len();
        for (page_id, node) in dirty {
            disk.write_page(page_id, node.encode()?.as_ref())?;
        }
        disk.write_page(PageId::META, Node::Meta(meta).encode()?.as_ref())?;
        disk.sync()?;
        debug!("pager flush: {} dirty pages persisted", count);
        Ok(())
    }

    pub fn dirty_count(&self) -> usize {
        self.inner.cache.lock().dirty_count()
    }
}

impl PageStore for Pager {
    fn load(&mut self, page_id: PageId) -> StorageResult<Node> {
        self.read(page_id)
    }

    fn store(&mut self, page_id: PageId, node: Node) -> StorageResult<()> {
        self.write(page_id, node);
        Ok(())
    }

    fn allocate(&mut self) -> StorageResult<PageId> {
        let head = self.inner.meta.lock().free_head;
        match head {
            Some(head) => {
                let next = match self.read(head)? {
                    Node::Free { next } => next,
                    // The free-list head must be a free page; anything else
                    // means the list structure is damaged.
                    _ => return Err(StorageError::ChecksumMismatch { page_id: head }),
                };
                self.inner.meta.lock().free_head = next;
                Ok(head)
            }
            None => {
                let mut meta = self.inner.meta.lock();
                let page_id = PageId(meta.page_count);
                meta.page_count += 1;
                Ok(page_id)
            }
        }
    }

    fn free(&mut self, page_id: PageId) -> StorageResult<()> {
        if matches!(self.read(page_id)?, Node::Free { .. }) {
            return Err(StorageError::DoubleFree(page_id));
        }
        let mut meta = self.inner.meta.lock();
        let next = meta.free_head;
        meta.free_head = Some(page_id);
        drop(meta);
        self.write(page_id, Node::Free { next });
        Ok(())
    }
}
