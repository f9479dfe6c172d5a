//! Fixed-size block I/O over a single backing file.
//!
//! The file manager knows nothing about page contents; it reads and writes
//! raw [`PAGE_SIZE`] blocks. Durability is explicit: writes land in the OS
//! page cache until [`FileManager::sync`] is called.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{PageId, PAGE_SIZE};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub struct FileManager {
    file: File,
}

impl FileManager {
    /// Create the backing file. Refuses to touch an existing file, so a
    /// database cannot be clobbered by a second `create` on the same path.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;
        Ok(Self { file })
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self { file })
    }

    pub fn read_page(&mut self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        let offset = Self::page_offset(page_id);
        if offset >= self.file.metadata()?.len() {
            return Err(StorageError::OutOfRange(page_id));
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_page(&mut self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        debug_assert_eq!(data.len(), PAGE_SIZE);
        let offset = Self::page_offset(page_id);
        let file_size = self.file.metadata()?.len();
        if offset >= file_size {
            self.file.set_len(offset + PAGE_SIZE as u64)?;
        }
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    /// Number of whole pages currently in the file.
    pub fn num_pages(&self) -> StorageResult<u32> {
        Ok((self.file.metadata()?.len() / PAGE_SIZE as u64) as u32)
    }

    pub fn sync(&mut self) -> StorageResult<()> {
        self.file.sync_all()?;
        Ok(())
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id.0 as u64 * PAGE_SIZE as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        {
            let fm = FileManager::create(&path)?;
            assert_eq!(fm.num_pages()?, 0);
        }
        {
            let fm = FileManager::open(&path)?;
            assert_eq!(fm.num_pages()?, 0);
        }
        Ok(())
    }

    #[test]
    fn test_create_refuses_existing_file() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");
        let mut fm = FileManager::create(&path)?;
        fm.write_page(PageId(0), &vec![7u8; PAGE_SIZE])?;
        fm.sync()?;
        drop(fm);

        assert!(matches!(
            FileManager::create(&path),
            Err(StorageError::Io(ref e)) if e.kind() == std::io::ErrorKind::AlreadyExists
        ));

        // The original file is untouched.
        let mut fm = FileManager::open(&path)?;
        let mut buf = vec![0u8; PAGE_SIZE];
        fm.read_page(PageId(0), &mut buf)?;
        assert_eq!(buf[0], 7);
        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let mut fm = FileManager::create(&dir.path().join("test.db"))?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        fm.write_page(PageId(0), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        fm.read_page(PageId(0), &mut read_buf)?;
        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);
        Ok(())
    }

    #[test]
    fn test_read_past_end_is_out_of_range() -> Result<()> {
        let dir = tempdir()?;
        let mut fm = FileManager::create(&dir.path().join("test.db"))?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let err = fm.read_page(PageId(10), &mut buf).unwrap_err();
        assert!(matches!(err, StorageError::OutOfRange(PageId(10))));
        Ok(())
    }

    #[test]
    fn test_file_growth_on_write() -> Result<()> {
        let dir = tempdir()?;
        let mut fm = FileManager::create(&dir.path().join("test.db"))?;

        let buf = vec![5u8; PAGE_SIZE];
        fm.write_page(PageId(5), &buf)?;
        assert_eq!(fm.num_pages()?, 6);
        Ok(())
    }

    #[test]
    fn test_page_boundary_isolation() -> Result<()> {
        let dir = tempdir()?;
        let mut fm = FileManager::create(&dir.path().join("test.db"))?;

        fm.write_page(PageId(0), &vec![1u8; PAGE_SIZE])?;
        fm.write_page(PageId(1), &vec![2u8; PAGE_SIZE])?;

        let mut buf = vec![0u8; PAGE_SIZE];
        fm.read_page(PageId(0), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 1));
        fm.read_page(PageId(1), &mut buf)?;
        assert!(buf.iter().all(|&b| b == 2));
        Ok(())
    }

    #[test]
    fn test_persistence_across_reopen() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        {
            let mut fm = FileManager::create(&path)?;
            fm.write_page(PageId(0), &vec![99u8; PAGE_SIZE])?;
            fm.sync()?;
        }
        {
            let mut fm = FileManager::open(&path)?;
            let mut buf = vec![0u8; PAGE_SIZE];
            fm.read_page(PageId(0), &mut buf)?;
            assert_eq!(buf[0], 99);
        }
        Ok(())
    }
}
