//! oakdb: an embedded, crash-safe, ordered key-value storage engine.
//!
//! The engine is the storage core of a relational database: named tables
//! backed by on-disk B+trees over a paged file, with a write-ahead log for
//! durability and single-writer transactions with copy-on-write isolation.
//!
//! ```no_run
//! use oakdb::{Database, StorageResult};
//! use bytes::Bytes;
//!
//! fn main() -> StorageResult<()> {
//!     let db = Database::create(std::path::Path::new("app.db"))?;
//!     let users = db.create_table("users")?;
//!     db.put(&users, Bytes::from("alice"), Bytes::from("42"))?;
//!     assert_eq!(db.get(&users, b"alice")?, Some(Bytes::from("42")));
//!     Ok(())
//! }
//! ```

pub mod btree;
pub mod database;
pub mod recovery;
pub mod storage;
pub mod transaction;

pub use database::{Database, DatabaseConfig, Scan, TableHandle, Transaction};
pub use storage::{StorageError, StorageResult};
