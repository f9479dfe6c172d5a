//! WAL record types and on-disk framing.
//!
//! Each record is framed as `{length: u32, crc32: u32, payload}` where the
//! payload is the bincode encoding of [`WalRecord`]. The CRC covers the
//! payload only; a frame whose CRC does not match is treated as the torn
//! tail of a crashed write, not as corruption of earlier records.

use crate::storage::page::PageId;
use byteorder::{ByteOrder, LittleEndian};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Log sequence number. Monotonically increasing; replay applies records in
/// LSN order. 0 is the invalid/initial value.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
pub struct Lsn(pub u64);

impl Lsn {
    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Lsn({})", self.0)
    }
}

/// Size of the `{length, crc32}` frame prefix.
pub const FRAME_HEADER_SIZE: usize = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WalRecordKind {
    /// Absolute after-image of one page.
    PageImage { page_id: PageId, image: Vec<u8> },
    /// Terminal commit marker; records of transactions lacking one are
    /// discarded on replay.
    Commit,
    /// Log base marker written after a checkpoint reset.
    Checkpoint,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalRecord {
    pub lsn: Lsn,
    pub transaction_id: u64,
    pub kind: WalRecordKind,
}

impl WalRecord {
    pub fn page_image(lsn: Lsn, transaction_id: u64, page_id: PageId, image: Vec<u8>) -> Self {
        WalRecord {
            lsn,
            transaction_id,
            kind: WalRecordKind::PageImage { page_id, image },
        }
    }

    pub fn commit(lsn: Lsn, transaction_id: u64) -> Self {
        WalRecord {
            lsn,
            transaction_id,
            kind: WalRecordKind::Commit,
        }
    }

    pub fn checkpoint(lsn: Lsn) -> Self {
        WalRecord {
            lsn,
            transaction_id: 0,
            kind: WalRecordKind::Checkpoint,
        }
    }

    /// Encode into a framed byte sequence ready for appending.
    pub fn encode(&self) -> Result<Vec<u8>, bincode::Error> {
        let payload = bincode::serialize(self)?;
        let mut out = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
        let mut header = [0u8; FRAME_HEADER_SIZE];
        LittleEndian::write_u32(&mut header[0..4], payload.len() as u32);
        LittleEndian::write_u32(&mut header[4..8], crc32fast::hash(&payload));
        out.extend_from_slice(&header);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Decode one framed record from the front of `buf`. Returns the record
    /// and the number of bytes consumed, or `None` when the buffer ends in
    /// a truncated or checksum-invalid frame (the effective end of log).
    pub fn decode_from(buf: &[u8]) -> Option<(WalRecord, usize)> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        let len = LittleEndian::read_u32(&buf[0..4]) as usize;
        let crc = LittleEndian::read_u32(&buf[4..8]);
        let end = FRAME_HEADER_SIZE.checked_add(len)?;
        if buf.len() < end {
            return None;
        }
        let payload = &buf[FRAME_HEADER_SIZE..end];
        if crc32fast::hash(payload) != crc {
            return None;
        }
        let record = bincode::deserialize(payload).ok()?;
        Some((record, end))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode_round_trip() {
        let record = WalRecord::page_image(Lsn(3), 7, PageId(2), vec![1, 2, 3, 4]);
        let bytes = record.encode().unwrap();
        let (decoded, used) = WalRecord::decode_from(&bytes).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(used, bytes.len());
    }

    #[test]
    fn test_truncated_frame_is_end_of_log() {
        let record = WalRecord::commit(Lsn(1), 9);
        let bytes = record.encode().unwrap();

        for cut in 0..bytes.len() {
            assert!(WalRecord::decode_from(&bytes[..cut]).is_none());
        }
    }

    #[test]
    fn test_bad_crc_is_end_of_log() {
        let record = WalRecord::commit(Lsn(1), 9);
        let mut bytes = record.encode().unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;
        assert!(WalRecord::decode_from(&bytes).is_none());
    }

    #[test]
    fn test_decode_consumes_one_frame() {
        let a = WalRecord::commit(Lsn(1), 1);
        let b = WalRecord::checkpoint(Lsn(2));
        let mut bytes = a.encode().unwrap();
        bytes.extend_from_slice(&b.encode().unwrap());

        let (first, used) = WalRecord::decode_from(&bytes).unwrap();
        assert_eq!(first, a);
        let (second, _) = WalRecord::decode_from(&bytes[used..]).unwrap();
        assert_eq!(second, b);
    }
}
