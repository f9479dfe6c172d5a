//! Write transactions: identity, lifecycle state, the single-writer gate,
//! and the copy-on-write workspace each transaction mutates in private.

pub mod id;
pub mod manager;
pub mod state;

pub use id::TransactionId;
pub use manager::{TransactionManager, Workspace, WriteHandle};
pub use state::TransactionState;
