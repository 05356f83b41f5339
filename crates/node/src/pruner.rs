//! Periodic block pruning.
//!
//! Every `prune_interval` the pruner walks the path from the recorded
//! root to the last executed block and drops everything but the most
//! recent `block_history_size` entries: the oldest kept block becomes the
//! new root, and every block outside its descendant closure is deleted.
//! The deletions and the root-hash update commit in one atomic batch, so
//! a crash leaves either the old or the new root fully consistent.

use gridbot_storage::{BlockStore, Database, StorageError, ViewStateStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Background pruning task. A failed pass is logged and retried on the
/// next interval; the pruning transaction is all-or-nothing.
pub async fn run_pruner(
    db: Arc<Database>,
    interval: Duration,
    block_history_size: usize,
    cancel: CancellationToken,
) {
    let block_store = BlockStore::new(db.clone());
    let view_store = ViewStateStore::new(db.clone());

    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // The first tick fires immediately; pruning right at startup is
    // pointless, so consume it.
    ticker.tick().await;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {
                match prune_once(&db, &block_store, &view_store, block_history_size) {
                    Ok(0) => debug!("pruning pass found nothing to prune"),
                    Ok(pruned) => info!(pruned, "pruned old blocks"),
                    Err(e) => warn!(error = %e, "pruning pass failed, retrying next interval"),
                }
            }
        }
    }
}

/// One pruning pass. Returns the number of path entries that fell out of
/// the retention window.
pub fn prune_once(
    db: &Database,
    block_store: &BlockStore,
    view_store: &ViewStateStore,
    block_history_size: usize,
) -> Result<usize, StorageError> {
    let bundle = view_store.bundle()?;
    let path = block_store.path_from_root(&bundle.last_executed_block_hash)?;
    if path.len() <= block_history_size {
        return Ok(0);
    }

    let cut = path.len() - block_history_size;
    // The oldest block inside the retention window becomes the new root.
    let new_root = path[cut];

    let mut ops = block_store.prune_ops(&new_root)?;
    ops.push(view_store.set_root_op(new_root)?);
    db.write_ops(ops)?;
    Ok(cut)
}
