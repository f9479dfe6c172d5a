//! Ordered range scans over the leaf chain.
//!
//! A [`LeafCursor`] yields entries one leaf batch at a time. It is
//! restartable: it remembers the last key it handed out and re-seeks from
//! there, so it never holds page references between batches and survives
//! the tree being reopened through a different store.

use crate::btree::BTree;
use crate::storage::error::StorageResult;
use crate::storage::pager::PageStore;
use bytes::Bytes;

enum CursorPos {
    /// Before the first batch; the bound is the inclusive start key.
    Start(Option<Bytes>),
    /// Resume strictly after this key.
    After(Bytes),
    Done,
}

pub struct LeafCursor {
    pos: CursorPos,
}

impl LeafCursor {
    /// Cursor over keys in `[start, end]` (both inclusive, `None` meaning
    /// unbounded).
    pub fn new(start: Option<Bytes>) -> Self {
        Self {
            pos: CursorPos::Start(start),
        }
    }

    pub fn is_done(&self) -> bool {
        matches!(self.pos, CursorPos::Done)
    }

    /// Produce the next batch of in-range entries, in key order. An empty
    /// batch means the scan is exhausted.
    pub fn next_batch<S: PageStore>(
        &mut self,
        tree: &mut BTree<'_, S>,
        end: Option<&[u8]>,
    ) -> StorageResult<Vec<(Bytes, Bytes)>> {
        let seek = match &self.pos {
            CursorPos::Done => return Ok(Vec::new()),
            CursorPos::Start(start) => start.clone(),
            CursorPos::After(last) => Some(last.clone()),
        };

        let (_, mut leaf) = tree.leaf_containing(seek.as_deref())?;
        let mut batch = Vec::new();
        let mut past_end = false;

        loop {
            for (key, value) in &leaf.entries {
                let before_start = match &self.pos {
                    CursorPos::Start(Some(start)) => key < start,
                    CursorPos::Start(None) => false,
                    CursorPos::After(last) => key <= last,
                    CursorPos::Done => unreachable!(),
                };
                if before_start {
                    continue;
                }
                if end.is_some_and(|e| key.as_ref() > e) {
                    past_end = true;
                    break;
                }
                batch.push((key.clone(), value.clone()));
            }

            if past_end || batch.is_empty() {
                match leaf.next_leaf {
                    Some(next) if !past_end => leaf = tree.load_leaf(next)?,
                    _ => break,
                }
            } else {
                break;
            }
        }

        self.pos = match batch.last() {
            Some((last, _)) if !past_end => CursorPos::After(last.clone()),
            _ => CursorPos::Done,
        };
        Ok(batch)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::pager::Pager;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    fn key(n: u32) -> Bytes {
        Bytes::copy_from_slice(format!("{:08}", n).as_bytes())
    }

    fn value(n: u32) -> Bytes {
        Bytes::copy_from_slice(format!("v{}", n).as_bytes())
    }

    fn populated_tree(n: u32) -> Result<(Pager, crate::storage::page::PageId, TempDir)> {
        let dir = tempdir()?;
        let mut pager = Pager::create(&dir.path().join("test.db"), 256)?;
        let mut tree = BTree::create(&mut pager)?;
        for i in 1..=n {
            tree.insert(key(i), value(i))?;
        }
        let root = tree.root();
        Ok((pager, root, dir))
    }

    fn collect_scan(
        pager: &mut Pager,
        root: crate::storage::page::PageId,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<Vec<u32>> {
        let mut tree = BTree::open(pager, root);
        let mut cursor = LeafCursor::new(start.map(key));
        let end_key = end.map(key);
        let mut out = Vec::new();
        loop {
            let batch = cursor.next_batch(&mut tree, end_key.as_deref())?;
            if batch.is_empty() {
                break;
            }
            for (k, _) in batch {
                out.push(String::from_utf8_lossy(&k).parse::<u32>()?);
            }
        }
        Ok(out)
    }

    #[test]
    fn test_full_scan_is_ordered() -> Result<()> {
        let (mut pager, root, _dir) = populated_tree(500)?;
        let keys = collect_scan(&mut pager, root, None, None)?;
        assert_eq!(keys, (1..=500).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_bounded_scan_is_inclusive() -> Result<()> {
        let (mut pager, root, _dir) = populated_tree(500)?;
        let keys = collect_scan(&mut pager, root, Some(100), Some(200))?;
        assert_eq!(keys, (100..=200).collect::<Vec<_>>());
        Ok(())
    }

    #[test]
    fn test_scan_with_missing_bound_keys() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = Pager::create(&dir.path().join("test.db"), 256)?;
        let mut tree = BTree::create(&mut pager)?;
        for i in (2..=100).step_by(2) {
            tree.insert(key(i), value(i))?;
        }
        let root = tree.root();

        // Odd bounds are absent keys; the scan snaps to what exists.
        let keys = collect_scan(&mut pager, root, Some(9), Some(21))?;
        assert_eq!(keys, vec![10, 12, 14, 16, 18, 20]);
        Ok(())
    }

    #[test]
    fn test_scan_after_deletes() -> Result<()> {
        let (mut pager, root, _dir) = populated_tree(200)?;
        let root = {
            let mut tree = BTree::open(&mut pager, root);
            for n in 50..=150 {
                tree.delete(&key(n))?;
            }
            tree.root()
        };

        let keys = collect_scan(&mut pager, root, Some(1), Some(200))?;
        let expect: Vec<u32> = (1..=49).chain(151..=200).collect();
        assert_eq!(keys, expect);
        Ok(())
    }

    #[test]
    fn test_empty_range() -> Result<()> {
        let (mut pager, root, _dir) = populated_tree(50)?;
        let keys = collect_scan(&mut pager, root, Some(300), Some(400))?;
        assert!(keys.is_empty());

        let keys = collect_scan(&mut pager, root, None, Some(0))?;
        assert!(keys.is_empty());
        Ok(())
    }

    #[test]
    fn test_scan_on_empty_tree() -> Result<()> {
        let dir = tempdir()?;
        let mut pager = Pager::create(&dir.path().join("test.db"), 16)?;
        let root = BTree::create(&mut pager)?.root();

        let keys = collect_scan(&mut pager, root, None, None)?;
        assert!(keys.is_empty());
        Ok(())
    }
}
