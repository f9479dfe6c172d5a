use crate::storage::page::PageId;
use std::collections::{HashMap, VecDeque};

/// Tracks evictable pages in least-recently-used order.
///
/// Only pages registered here may be evicted; the cache keeps dirty pages
/// out of the replacer entirely.
#[derive(Debug, Default)]
pub struct LruReplacer {
    /// Queue of evictable pages (least recently used at front).
    lru_list: VecDeque<PageId>,
    /// Map to track position in the LRU list for removal.
    page_map: HashMap<PageId, usize>,
}

impl LruReplacer {
    pub fn new() -> Self {
        Self::default()
    }

    fn update_indices(&mut self) {
        for (idx, &page_id) in self.lru_list.iter().enumerate() {
            self.page_map.insert(page_id, idx);
        }
    }

    /// Pick and remove the eviction victim, if any.
    pub fn evict(&mut self) -> Option<PageId> {
        let page_id = self.lru_list.pop_front()?;
        self.page_map.remove(&page_id);
        self.update_indices();
        Some(page_id)
    }

    /// Mark a page as evictable, moving it to the most-recently-used slot.
    pub fn touch(&mut self, page_id: PageId) {
        self.remove(page_id);
        self.lru_list.push_back(page_id);
        self.page_map.insert(page_id, self.lru_list.len() - 1);
    }

    /// Take a page out of eviction consideration.
    pub fn remove(&mut self, page_id: PageId) {
        if let Some(idx) = self.page_map.remove(&page_id) {
            self.lru_list.remove(idx);
            self.update_indices();
        }
    }

    pub fn len(&self) -> usize {
        self.lru_list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lru_list.is_empty()
    }
}
