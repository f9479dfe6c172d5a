//! Bounded in-memory cache of decoded pages.
//!
//! The cache holds committed pages only; transaction-private buffers live in
//! the transaction workspace until commit publication. Clean pages are
//! evicted in LRU order when the cache exceeds its capacity. Dirty pages
//! (committed, WAL-logged, but not yet checkpointed) are never evicted; they
//! are drained by [`NodeCache::take_dirty`] at checkpoint time, so the cache
//! may transiently exceed capacity between checkpoints.

pub mod lru;

use crate::storage::page::node::Node;
use crate::storage::page::PageId;
use lru::LruReplacer;
use std::collections::HashMap;

struct CachedNode {
    node: Node,
    dirty: bool,
}

pub struct NodeCache {
    nodes: HashMap<PageId, CachedNode>,
    replacer: LruReplacer,
    capacity: usize,
}

impl NodeCache {
    pub fn new(capacity: usize) -> Self {
        Self {
            nodes: HashMap::with_capacity(capacity),
            replacer: LruReplacer::new(),
            capacity,
        }
    }

    /// Look up a page, refreshing its recency.
    pub fn get(&mut self, page_id: PageId) -> Option<Node> {
        let entry = self.nodes.get(&page_id)?;
        let node = entry.node.clone();
        if !entry.dirty {
            self.replacer.touch(page_id);
        }
        Some(node)
    }

    /// Install a page. Dirty pages are exempt from eviction until
    /// [`NodeCache::take_dirty`] drains them.
    pub fn insert(&mut self, page_id: PageId, node: Node, dirty: bool) {
        self.nodes.insert(page_id, CachedNode { node, dirty });
        if dirty {
            self.replacer.remove(page_id);
        } else {
            self.replacer.touch(page_id);
        }
        self.evict_excess();
    }

    /// Drop a page from the cache (e.g. when it is freed).
    pub fn remove(&mut self, page_id: PageId) {
        self.nodes.remove(&page_id);
        self.replacer.remove(page_id);
    }

    /// Take all dirty pages, marking them clean and evictable again.
    pub fn take_dirty(&mut self) -> Vec<(PageId, Node)> {
        let mut out = Vec::new();
        for (&page_id, entry) in self.nodes.iter_mut() {
            if entry.dirty {
                entry.dirty = false;
                out.push((page_id, entry.node.clone()));
            }
        }
        out.sort_by_key(|(page_id, _)| *page_id);
        for (page_id, _) in &out {
            self.replacer.touch(*page_id);
        }
        self.evict_excess();
        out
    }

    pub fn dirty_count(&self) -> usize {
        self.nodes.values().filter(|e| e.dirty).count()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    fn evict_excess(&mut self) {
        while self.nodes.len() > self.capacity {
            match self.replacer.evict() {
                Some(victim) => {
                    self.nodes.remove(&victim);
                }
                // Everything left is dirty; overflow until the next
                // checkpoint drains it.
                None => break,
            }
        }
    }
}
