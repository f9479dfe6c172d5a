//! Write-ahead log.
//!
//! Durability mechanism: every page mutated by a transaction is appended to
//! the log as an absolute after-image, followed by a commit marker, and the
//! log is fsynced before the transaction is considered durable. Pages are
//! only checkpointed into the main page store after their images are in the
//! log (the write-ahead rule). Startup replays the log; a checkpoint
//! persists the page store and resets the log.

pub mod manager;
pub mod record;

pub use manager::WalManager;
pub use record::{Lsn, WalRecord, WalRecordKind};
