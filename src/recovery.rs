//! Startup recovery: redo committed transactions from the WAL.
//!
//! The log holds absolute page after-images, so redo is a matter of
//! applying the images of every transaction that reached its commit
//! marker, in LSN order. Transactions without a marker are discarded
//! wholesale; nothing they logged is applied. Replaying the same log
//! twice produces the same database state.

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::node::Node;
use crate::storage::page::PageId;
use crate::storage::pager::Pager;
use crate::storage::wal::{WalManager, WalRecordKind};
use log::info;
use std::collections::HashSet;

/// Replay the log into the pager, then flush and reset the log. Returns
/// the number of page images applied.
pub fn replay(wal: &mut WalManager, pager: &Pager) -> StorageResult<usize> {
    let records = wal.scan()?;

    let committed: HashSet<u64> = records
        .iter()
        .filter(|record| matches!(record.kind, WalRecordKind::Commit))
        .map(|record| record.transaction_id)
        .collect();

    let mut applied = 0;
    for record in &records {
        let (page_id, image) = match &record.kind {
            WalRecordKind::PageImage { page_id, image } => (*page_id, image),
            _ => continue,
        };
        if !committed.contains(&record.transaction_id) {
            continue;
        }
        let node = Node::decode(page_id, image)?;
        if page_id == PageId::META {
            match node {
                Node::Meta(meta) => pager.set_meta(meta),
                _ => return Err(StorageError::CorruptHeader),
            }
        } else {
            pager.write(page_id, node);
        }
        applied += 1;
    }

    if applied > 0 {
        pager.flush()?;
        info!(
            "recovery: applied {} page images from {} committed transactions",
            applied,
            committed.len()
        );
    }
    wal.reset()?;
    Ok(applied)
}

/// Persist every dirty page and truncate the log. After this the log
/// contains only its base marker and the file is self-contained.
pub fn checkpoint(pager: &Pager, wal: &mut WalManager) -> StorageResult<()> {
    pager.flush()?;
    wal.reset()?;
    Ok(())
}
