//! Decoded in-memory representation of a page.
//!
//! A [`Node`] is the unit the B-tree and the transaction layer work with;
//! the pager encodes/decodes it to and from the fixed binary page format.
//! Decoding verifies the page checksum and the intra-node key ordering, so
//! a `Node` in memory is always well-formed.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{
    seal_page, verify_page, PageHeader, PageId, PageType, PAGE_HEADER_SIZE, PAGE_SIZE,
};
use byteorder::{ByteOrder, LittleEndian};
use bytes::Bytes;
use std::collections::BTreeMap;

/// Magic number at the start of the meta page payload ("OAKD").
pub const MAGIC: u32 = 0x4f414b44;

/// On-disk format version.
pub const FORMAT_VERSION: u16 = 1;

/// Maximum number of keys per node. A node holding `MAX_KEYS` entries of
/// maximum length still encodes within one page.
pub const MAX_KEYS: usize = 16;

/// Minimum number of keys per non-root node.
pub const MIN_KEYS: usize = 7;

/// Maximum key length in bytes.
pub const MAX_KEY_LEN: usize = 96;

/// Maximum value length in bytes.
pub const MAX_VALUE_LEN: usize = 140;

/// Leaf node: ordered (key, value) pairs plus the right-sibling link.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafNode {
    pub entries: Vec<(Bytes, Bytes)>,
    pub next_leaf: Option<PageId>,
}

impl LeafNode {
    /// Binary search for `key`; `Ok` holds the entry index, `Err` the
    /// insertion point.
    pub fn search(&self, key: &[u8]) -> Result<usize, usize> {
        self.entries.binary_search_by(|(k, _)| k.as_ref().cmp(key))
    }

    pub fn is_full(&self) -> bool {
        self.entries.len() >= MAX_KEYS
    }
}

/// Internal node: separator keys and `keys.len() + 1` children. For child
/// index `i`, subtree keys `k` satisfy `keys[i-1] <= k < keys[i]`.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct InternalNode {
    pub keys: Vec<Bytes>,
    pub children: Vec<PageId>,
}

impl InternalNode {
    /// Index of the child to descend into for `key`. The result is in
    /// `0..=keys.len()` and is only ever used to index `children`; it must
    /// never be used to index `keys` without a bounds check.
    pub fn child_index(&self, key: &[u8]) -> usize {
        match self.keys.binary_search_by(|k| k.as_ref().cmp(key)) {
            Ok(i) => i + 1,
            Err(i) => i,
        }
    }

    pub fn is_full(&self) -> bool {
        self.keys.len() >= MAX_KEYS
    }
}

/// Meta page contents: file identity, allocation state, and the catalog
/// mapping table names to B-tree root pages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetaNode {
    pub page_count: u32,
    pub free_head: Option<PageId>,
    pub catalog: BTreeMap<String, PageId>,
}

impl MetaNode {
    pub fn new() -> Self {
        Self {
            page_count: 1,
            free_head: None,
            catalog: BTreeMap::new(),
        }
    }
}

impl Default for MetaNode {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
    Free { next: Option<PageId> },
    Meta(MetaNode),
}

impl Node {
    pub fn page_type(&self) -> PageType {
        match self {
            Node::Leaf(_) => PageType::Leaf,
            Node::Internal(_) => PageType::Internal,
            Node::Free { .. } => PageType::Free,
            Node::Meta(_) => PageType::Meta,
        }
    }

    /// Encode into a sealed page image.
    pub fn encode(&self) -> StorageResult<Box<[u8; PAGE_SIZE]>> {
        let mut buf = Box::new([0u8; PAGE_SIZE]);
        let mut header = PageHeader::new(self.page_type());
        let mut pos = PAGE_HEADER_SIZE;

        match self {
            Node::Leaf(leaf) => {
                header.key_count = leaf.entries.len() as u16;
                header.pointer = PageId::to_pointer(leaf.next_leaf);
                for (key, value) in &leaf.entries {
                    LittleEndian::write_u16(&mut buf[pos..pos + 2], key.len() as u16);
                    LittleEndian::write_u16(&mut buf[pos + 2..pos + 4], value.len() as u16);
                    pos += 4;
                    buf[pos..pos + key.len()].copy_from_slice(key);
                    pos += key.len();
                    buf[pos..pos + value.len()].copy_from_slice(value);
                    pos += value.len();
                }
            }
            Node::Internal(node) => {
                debug_assert_eq!(node.children.len(), node.keys.len() + 1);
                header.key_count = node.keys.len() as u16;
                // Rightmost child lives in the header pointer slot.
                header.pointer = node.children[node.keys.len()].0;
                for (key, child) in node.keys.iter().zip(&node.children) {
                    LittleEndian::write_u16(&mut buf[pos..pos + 2], key.len() as u16);
                    pos += 2;
                    buf[pos..pos + key.len()].copy_from_slice(key);
                    pos += key.len();
                    LittleEndian::write_u32(&mut buf[pos..pos + 4], child.0);
                    pos += 4;
                }
            }
            Node::Free { next } => {
                header.pointer = PageId::to_pointer(*next);
            }
            Node::Meta(meta) => {
                header.key_count = meta.catalog.len() as u16;
                header.pointer = PageId::to_pointer(meta.free_head);
                LittleEndian::write_u32(&mut buf[pos..pos + 4], MAGIC);
                LittleEndian::write_u16(&mut buf[pos + 4..pos + 6], FORMAT_VERSION);
                LittleEndian::write_u32(&mut buf[pos + 6..pos + 10], meta.page_count);
                pos += 10;
                let catalog = bincode::serialize(&meta.catalog)?;
                if pos + 4 + catalog.len() > PAGE_SIZE {
                    return Err(StorageError::TooBig {
                        kind: "catalog",
                        len: catalog.len(),
                        max: PAGE_SIZE - pos - 4,
                    });
                }
                LittleEndian::write_u32(&mut buf[pos..pos + 4], catalog.len() as u32);
                pos += 4;
                buf[pos..pos + catalog.len()].copy_from_slice(&catalog);
            }
        }

        header.write_to(buf.as_mut());
        seal_page(buf.as_mut());
        Ok(buf)
    }

    /// Decode a page image, verifying the checksum and the key ordering.
    pub fn decode(page_id: PageId, buf: &[u8]) -> StorageResult<Node> {
        verify_page(page_id, buf)?;
        let header = PageHeader::read_from(page_id, buf)?;
        let mut pos = PAGE_HEADER_SIZE;

        // A sealed page whose structure does not parse is corruption, the
        // same class as a failed checksum.
        let corrupt = || StorageError::ChecksumMismatch { page_id };

        match header.page_type {
            PageType::Leaf => {
                let mut entries = Vec::with_capacity(header.key_count as usize);
                for _ in 0..header.key_count {
                    if pos + 4 > PAGE_SIZE {
                        return Err(corrupt());
                    }
                    let klen = LittleEndian::read_u16(&buf[pos..pos + 2]) as usize;
                    let vlen = LittleEndian::read_u16(&buf[pos + 2..pos + 4]) as usize;
                    pos += 4;
                    if pos + klen + vlen > PAGE_SIZE {
                        return Err(corrupt());
                    }
                    let key = Bytes::copy_from_slice(&buf[pos..pos + klen]);
                    pos += klen;
                    let value = Bytes::copy_from_slice(&buf[pos..pos + vlen]);
                    pos += vlen;
                    entries.push((key, value));
                }
                check_sorted(page_id, entries.iter().map(|(k, _)| k))?;
                Ok(Node::Leaf(LeafNode {
                    entries,
                    next_leaf: PageId::from_pointer(header.pointer),
                }))
            }
            PageType::Internal => {
                let mut keys = Vec::with_capacity(header.key_count as usize);
                let mut children = Vec::with_capacity(header.key_count as usize + 1);
                for _ in 0..header.key_count {
                    if pos + 2 > PAGE_SIZE {
                        return Err(corrupt());
                    }
                    let klen = LittleEndian::read_u16(&buf[pos..pos + 2]) as usize;
                    pos += 2;
                    if pos + klen + 4 > PAGE_SIZE {
                        return Err(corrupt());
                    }
                    keys.push(Bytes::copy_from_slice(&buf[pos..pos + klen]));
                    pos += klen;
                    children.push(PageId(LittleEndian::read_u32(&buf[pos..pos + 4])));
                    pos += 4;
                }
                children.push(PageId(header.pointer));
                check_sorted(page_id, keys.iter())?;
                Ok(Node::Internal(InternalNode { keys, children }))
            }
            PageType::Free => Ok(Node::Free {
                next: PageId::from_pointer(header.pointer),
            }),
            PageType::Meta => {
                if LittleEndian::read_u32(&buf[pos..pos + 4]) != MAGIC
                    || LittleEndian::read_u16(&buf[pos + 4..pos + 6]) != FORMAT_VERSION
                {
                    return Err(StorageError::CorruptHeader);
                }
                let page_count = LittleEndian::read_u32(&buf[pos + 6..pos + 10]);
                pos += 10;
                let len = LittleEndian::read_u32(&buf[pos..pos + 4]) as usize;
                pos += 4;
                if pos + len > PAGE_SIZE {
                    return Err(StorageError::CorruptHeader);
                }
                let catalog = bincode::deserialize(&buf[pos..pos + len])?;
                Ok(Node::Meta(MetaNode {
                    page_count,
                    free_head: PageId::from_pointer(header.pointer),
                    catalog,
                }))
            }
        }
    }
}

fn check_sorted<'a>(
    page_id: PageId,
    keys: impl Iterator<Item = &'a Bytes>,
) -> StorageResult<()> {
    let mut prev: Option<&Bytes> = None;
    for key in keys {
        if let Some(p) = prev {
            if p.as_ref() >= key.as_ref() {
                return Err(StorageError::OrderMismatch { page_id });
            }
        }
        prev = Some(key);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn b(s: &str) -> Bytes {
        Bytes::copy_from_slice(s.as_bytes())
    }

    #[test]
    fn test_full_node_fits_in_a_page() {
        // The count-based bounds only work if a maximal node encodes
        // within PAGE_SIZE.
        let leaf = PAGE_HEADER_SIZE + MAX_KEYS * (4 + MAX_KEY_LEN + MAX_VALUE_LEN);
        let internal = PAGE_HEADER_SIZE + MAX_KEYS * (2 + MAX_KEY_LEN + 4);
        assert!(leaf <= PAGE_SIZE);
        assert!(internal <= PAGE_SIZE);
    }

    #[test]
    fn test_leaf_round_trip() {
        let leaf = LeafNode {
            entries: vec![(b("apple"), b("1")), (b("mango"), b("2")), (b("pear"), b(""))],
            next_leaf: Some(PageId(9)),
        };
        let buf = Node::Leaf(leaf.clone()).encode().unwrap();
        let decoded = Node::decode(PageId(3), buf.as_ref()).unwrap();
        assert_eq!(decoded, Node::Leaf(leaf));
    }

    #[test]
    fn test_internal_round_trip() {
        let node = InternalNode {
            keys: vec![b("d"), b("m")],
            children: vec![PageId(4), PageId(5), PageId(6)],
        };
        let buf = Node::Internal(node.clone()).encode().unwrap();
        let decoded = Node::decode(PageId(2), buf.as_ref()).unwrap();
        assert_eq!(decoded, Node::Internal(node));
    }

    #[test]
    fn test_free_and_meta_round_trip() {
        let buf = Node::Free { next: Some(PageId(11)) }.encode().unwrap();
        assert_eq!(
            Node::decode(PageId(5), buf.as_ref()).unwrap(),
            Node::Free { next: Some(PageId(11)) }
        );

        let mut meta = MetaNode::new();
        meta.page_count = 42;
        meta.free_head = Some(PageId(17));
        meta.catalog.insert("users".to_string(), PageId(1));
        let buf = Node::Meta(meta.clone()).encode().unwrap();
        assert_eq!(
            Node::decode(PageId::META, buf.as_ref()).unwrap(),
            Node::Meta(meta)
        );
    }

    #[test]
    fn test_decode_rejects_unsorted_leaf() {
        let leaf = LeafNode {
            entries: vec![(b("z"), b("1")), (b("a"), b("2"))],
            next_leaf: None,
        };
        // Encoding does not re-check ordering; decode must.
        let buf = Node::Leaf(leaf).encode().unwrap();
        let err = Node::decode(PageId(3), buf.as_ref()).unwrap_err();
        assert!(matches!(err, StorageError::OrderMismatch { .. }));
    }

    #[test]
    fn test_decode_rejects_duplicate_keys() {
        let leaf = LeafNode {
            entries: vec![(b("a"), b("1")), (b("a"), b("2"))],
            next_leaf: None,
        };
        let buf = Node::Leaf(leaf).encode().unwrap();
        assert!(Node::decode(PageId(3), buf.as_ref()).is_err());
    }

    #[test]
    fn test_decode_rejects_corrupt_payload() {
        let leaf = LeafNode {
            entries: vec![(b("a"), b("1"))],
            next_leaf: None,
        };
        let mut buf = Node::Leaf(leaf).encode().unwrap();
        buf[PAGE_HEADER_SIZE + 5] ^= 0xff;
        let err = Node::decode(PageId(3), buf.as_ref()).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_meta_bad_magic_is_corrupt_header() {
        let buf = Node::Meta(MetaNode::new()).encode().unwrap();
        let mut tampered = *buf;
        LittleEndian::write_u32(&mut tampered[PAGE_HEADER_SIZE..PAGE_HEADER_SIZE + 4], 0xdead);
        seal_page(&mut tampered);
        let err = Node::decode(PageId::META, &tampered).unwrap_err();
        assert!(matches!(err, StorageError::CorruptHeader));
    }

    #[test]
    fn test_child_index_never_indexes_keys_out_of_bounds() {
        let node = InternalNode {
            keys: vec![b("b"), b("d")],
            children: vec![PageId(1), PageId(2), PageId(3)],
        };
        assert_eq!(node.child_index(b"a"), 0);
        assert_eq!(node.child_index(b"b"), 1);
        assert_eq!(node.child_index(b"c"), 1);
        assert_eq!(node.child_index(b"d"), 2);
        // A key past the maximum selects the rightmost child; the index
        // equals keys.len() and must only ever index `children`.
        assert_eq!(node.child_index(b"zzz"), node.keys.len());
    }
}
