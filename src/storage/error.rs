//! Storage layer error types.

use crate::storage::page::PageId;
use thiserror::Error;

/// Errors that can occur in the storage engine.
///
/// Variants fall into four classes: corruption (`CorruptHeader`,
/// `ChecksumMismatch`, `OrderMismatch`) is fatal to the affected structure
/// and never auto-repaired; resource errors (`Io`, `Serialization`) abort
/// the active transaction; logical outcomes (`KeyNotFound`, `AlreadyExists`,
/// ...) are ordinary recoverable results; `Busy` means the caller lost the
/// write-lock race and may retry.
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("corrupt database header: bad magic or unsupported version")]
    CorruptHeader,

    #[error("checksum mismatch on page {page_id}")]
    ChecksumMismatch { page_id: PageId },

    #[error("key ordering invariant violated on page {page_id}")]
    OrderMismatch { page_id: PageId },

    #[error("page {0} is out of range")]
    OutOfRange(PageId),

    #[error("page {0} is already on the free list")]
    DoubleFree(PageId),

    #[error("key not found")]
    KeyNotFound,

    #[error("table {0:?} not found")]
    TableNotFound(String),

    #[error("table {0:?} already exists")]
    AlreadyExists(String),

    #[error("{kind} length {len} exceeds the maximum of {max} bytes")]
    TooBig {
        kind: &'static str,
        len: usize,
        max: usize,
    },

    #[error("database is busy: write lock not acquired within the timeout")]
    Busy,

    #[error("transaction is no longer active")]
    TransactionClosed,

    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl StorageError {
    /// True for the corruption class: the structure must be treated as
    /// damaged and the operation must not be retried.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::CorruptHeader
                | StorageError::ChecksumMismatch { .. }
                | StorageError::OrderMismatch { .. }
        )
    }
}

impl From<bincode::Error> for StorageError {
    fn from(e: bincode::Error) -> Self {
        StorageError::Serialization(e.to_string())
    }
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_corruption_classification() {
        assert!(StorageError::CorruptHeader.is_corruption());
        assert!(StorageError::ChecksumMismatch { page_id: PageId(3) }.is_corruption());
        assert!(StorageError::OrderMismatch { page_id: PageId(1) }.is_corruption());
        assert!(!StorageError::KeyNotFound.is_corruption());
        assert!(!StorageError::Busy.is_corruption());
    }

    #[test]
    fn test_display_messages() {
        let err = StorageError::DoubleFree(PageId(7));
        assert!(err.to_string().contains("7"));

        let err = StorageError::TooBig {
            kind: "key",
            len: 200,
            max: 96,
        };
        assert!(err.to_string().contains("key"));
        assert!(err.to_string().contains("96"));
    }
}
