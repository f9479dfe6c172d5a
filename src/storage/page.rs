//! Fixed-size page format.
//!
//! Every page in the backing file is [`PAGE_SIZE`] bytes and starts with a
//! 16-byte header:
//!
//! ```text
//! offset 0   page type (u8)
//! offset 1   reserved
//! offset 2   key count (u16 LE)
//! offset 4   pointer (u32 LE): next leaf / rightmost child / next free /
//!            free-list head, depending on the page type
//! offset 8   CRC32 of the page with this field zeroed (u32 LE)
//! offset 12  reserved (u32)
//! ```

pub mod node;

use crate::storage::error::{StorageError, StorageResult};
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Size of a page in bytes.
pub const PAGE_SIZE: usize = 4096;

/// Size of the common page header.
pub const PAGE_HEADER_SIZE: usize = 16;

/// Stable identifier of a fixed-size block in the backing file.
///
/// Page 0 is always the meta page; the raw value 0 doubles as the "no page"
/// sentinel in on-disk pointer fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct PageId(pub u32);

impl PageId {
    /// The meta page, always page 0.
    pub const META: PageId = PageId(0);

    /// Encode an optional page reference as an on-disk pointer field.
    pub fn to_pointer(id: Option<PageId>) -> u32 {
        id.map_or(0, |p| p.0)
    }

    /// Decode an on-disk pointer field (0 means "no page").
    pub fn from_pointer(raw: u32) -> Option<PageId> {
        if raw == 0 { None } else { Some(PageId(raw)) }
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// On-disk page type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageType {
    Meta = 1,
    Leaf = 2,
    Internal = 3,
    Free = 4,
}

impl PageType {
    pub fn from_u8(raw: u8) -> Option<PageType> {
        match raw {
            1 => Some(PageType::Meta),
            2 => Some(PageType::Leaf),
            3 => Some(PageType::Internal),
            4 => Some(PageType::Free),
            _ => None,
        }
    }
}

/// Decoded common page header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageHeader {
    pub page_type: PageType,
    pub key_count: u16,
    /// Meaning depends on `page_type`; 0 means "no page".
    pub pointer: u32,
}

impl PageHeader {
    pub fn new(page_type: PageType) -> Self {
        Self {
            page_type,
            key_count: 0,
            pointer: 0,
        }
    }

    /// Write the header fields into a page buffer. The checksum field is
    /// left untouched; call [`seal_page`] once the payload is complete.
    pub fn write_to(&self, buf: &mut [u8]) {
        debug_assert!(buf.len() == PAGE_SIZE);
        buf[0] = self.page_type as u8;
        buf[1] = 0;
        LittleEndian::write_u16(&mut buf[2..4], self.key_count);
        LittleEndian::write_u32(&mut buf[4..8], self.pointer);
        LittleEndian::write_u32(&mut buf[12..16], 0);
    }

    /// Read the header fields from a page buffer, failing on an unknown
    /// page type tag.
    pub fn read_from(page_id: PageId, buf: &[u8]) -> StorageResult<Self> {
        debug_assert!(buf.len() == PAGE_SIZE);
        let page_type = PageType::from_u8(buf[0])
            .ok_or(StorageError::ChecksumMismatch { page_id })?;
        Ok(Self {
            page_type,
            key_count: LittleEndian::read_u16(&buf[2..4]),
            pointer: LittleEndian::read_u32(&buf[4..8]),
        })
    }
}

/// Compute the CRC32 of a page with the checksum field treated as zero.
pub fn page_checksum(buf: &[u8]) -> u32 {
    debug_assert!(buf.len() == PAGE_SIZE);
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[..8]);
    hasher.update(&[0u8; 4]);
    hasher.update(&buf[12..]);
    hasher.finalize()
}

/// Stamp the page checksum into the header.
pub fn seal_page(buf: &mut [u8]) {
    let crc = page_checksum(buf);
    LittleEndian::write_u32(&mut buf[8..12], crc);
}

/// Verify the stored page checksum.
pub fn verify_page(page_id: PageId, buf: &[u8]) -> StorageResult<()> {
    let stored = LittleEndian::read_u32(&buf[8..12]);
    if stored != page_checksum(buf) {
        return Err(StorageError::ChecksumMismatch { page_id });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pointer_encoding() {
        assert_eq!(PageId::to_pointer(None), 0);
        assert_eq!(PageId::to_pointer(Some(PageId(9))), 9);
        assert_eq!(PageId::from_pointer(0), None);
        assert_eq!(PageId::from_pointer(9), Some(PageId(9)));
    }

    #[test]
    fn test_header_round_trip() {
        let mut buf = [0u8; PAGE_SIZE];
        let header = PageHeader {
            page_type: PageType::Internal,
            key_count: 12,
            pointer: 77,
        };
        header.write_to(&mut buf);

        let decoded = PageHeader::read_from(PageId(1), &buf).unwrap();
        assert_eq!(decoded, header);
    }

    #[test]
    fn test_unknown_page_type_rejected() {
        let mut buf = [0u8; PAGE_SIZE];
        buf[0] = 0xff;
        assert!(PageHeader::read_from(PageId(1), &buf).is_err());
    }

    #[test]
    fn test_checksum_seal_and_verify() {
        let mut buf = [0u8; PAGE_SIZE];
        PageHeader::new(PageType::Leaf).write_to(&mut buf);
        buf[100] = 42;
        seal_page(&mut buf);

        verify_page(PageId(1), &buf).unwrap();

        // Flip a payload byte: verification must fail.
        buf[100] = 43;
        let err = verify_page(PageId(1), &buf).unwrap_err();
        assert!(err.is_corruption());
    }

    #[test]
    fn test_checksum_ignores_its_own_field() {
        let mut buf = [0u8; PAGE_SIZE];
        PageHeader::new(PageType::Leaf).write_to(&mut buf);
        let before = page_checksum(&buf);
        seal_page(&mut buf);
        assert_eq!(before, page_checksum(&buf));
    }
}
