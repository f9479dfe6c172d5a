//! Storage layer for oakdb.
//!
//! Page-based foundation beneath the B-tree engine. Key components:
//!
//! - **Page / Node**: fixed-size (4KB) checksummed blocks and their decoded
//!   in-memory form
//! - **FileManager**: raw block I/O over the single backing file
//! - **Pager**: allocation, free list, and a bounded LRU cache of decoded
//!   pages
//! - **WAL**: append-only durability log of page after-images, replayed on
//!   startup
//!
//! Everything above this layer reaches disk exclusively through the
//! [`Pager`] and the [`wal::WalManager`].

pub mod buffer;
pub mod disk;
pub mod error;
pub mod page;
pub mod pager;
pub mod wal;

pub use error::{StorageError, StorageResult};
pub use page::{PageId, PAGE_SIZE};
pub use pager::{PageStore, Pager};
