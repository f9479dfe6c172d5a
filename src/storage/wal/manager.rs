//! WAL manager: buffered append, fsync, scan, and checkpoint reset.

use crate::storage::error::StorageResult;
use crate::storage::wal::record::{Lsn, WalRecord};
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Manages a single append-only log file.
///
/// Appends accumulate in an in-memory buffer; [`WalManager::sync`] writes
/// the buffer to the file and fsyncs it. Nothing appended is durable until
/// `sync` returns.
pub struct WalManager {
    file: File,
    buffer: Vec<u8>,
    file_len: u64,
    next_lsn: Lsn,
}

impl WalManager {
    /// Open the log file, creating it if absent. Scans existing records to
    /// restore the LSN counter; a torn tail is tolerated and ignored.
    pub fn open(path: &Path) -> StorageResult<WalManager> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let mut manager = WalManager {
            file,
            buffer: Vec::new(),
            file_len: 0,
            next_lsn: Lsn(1),
        };
        manager.file_len = manager.file.metadata()?.len();
        let records = manager.scan()?;
        if let Some(last) = records.last() {
            manager.next_lsn = last.lsn.next();
        }
        Ok(manager)
    }

    /// Hand out the next LSN.
    pub fn next_lsn(&mut self) -> Lsn {
        let lsn = self.next_lsn;
        self.next_lsn = lsn.next();
        lsn
    }

    /// Append a record to the in-memory buffer.
    pub fn append(&mut self, record: &WalRecord) -> StorageResult<()> {
        let bytes = record.encode()?;
        self.buffer.extend_from_slice(&bytes);
        Ok(())
    }

    /// Write the buffer to the file and fsync. After this returns, every
    /// appended record is durable.
    pub fn sync(&mut self) -> StorageResult<()> {
        if !self.buffer.is_empty() {
            self.file.seek(SeekFrom::Start(self.file_len))?;
            self.file.write_all(&self.buffer)?;
            self.file_len += self.buffer.len() as u64;
            self.buffer.clear();
        }
        self.file.sync_all()?;
        Ok(())
    }

    /// Read all durable records in order, stopping at the first truncated
    /// or checksum-invalid frame.
    pub fn scan(&mut self) -> StorageResult<Vec<WalRecord>> {
        let mut raw = Vec::with_capacity(self.file_len as usize);
        self.file.seek(SeekFrom::Start(0))?;
        self.file.read_to_end(&mut raw)?;

        let mut records = Vec::new();
        let mut pos = 0;
        while let Some((record, used)) = WalRecord::decode_from(&raw[pos..]) {
            records.push(record);
            pos += used;
        }
        if pos < raw.len() {
            warn!(
                "wal: torn tail at byte {} of {}, ignoring {} trailing bytes",
                pos,
                raw.len(),
                raw.len() - pos
            );
        }
        Ok(records)
    }

    /// Truncate the log after a checkpoint and write a fresh base marker.
    pub fn reset(&mut self) -> StorageResult<()> {
        self.buffer.clear();
        self.file.set_len(0)?;
        self.file_len = 0;
        let base = WalRecord::checkpoint(self.next_lsn());
        self.append(&base)?;
        self.sync()?;
        debug!("wal reset at {}", base.lsn);
        Ok(())
    }

    /// Durable plus buffered size in bytes, used for the auto-checkpoint
    /// threshold.
    pub fn size(&self) -> u64 {
        self.file_len + self.buffer.len() as u64
    }
}
