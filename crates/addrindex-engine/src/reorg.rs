//! Divergence detection and bounded chain rollback.
//!
//! When the next remote block does not extend the local tip, the handler
//! walks the locally stored chain backward, re-fetching the corresponding
//! remote block, until it finds the common ancestor. Rollback then proceeds
//! one height at a time: each step deletes a single block level in its own
//! storage transaction under the exclusive barrier, which bounds the size
//! of any rollback transaction for arbitrarily deep reorgs.

use std::sync::Arc;

use tracing::warn;

use addrindex_core::error::IndexError;
use addrindex_core::event::IndexEvent;
use addrindex_core::lock::ResourceLock;
use addrindex_core::types::ChainTip;
use addrindex_storage::LedgerStore;

use crate::node::NodeClient;

/// Where the engine stands relative to the remote chain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncState {
    /// The local tip lies on the remote chain.
    InSync,
    /// A divergence was detected; the common ancestor is being located.
    Diverged,
    /// Rolling back toward the common ancestor, one level at a time.
    RollingBack,
}

impl std::fmt::Display for SyncState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InSync => write!(f, "in-sync"),
            Self::Diverged => write!(f, "diverged"),
            Self::RollingBack => write!(f, "rolling-back"),
        }
    }
}

/// Finds common ancestors and unwinds the local chain to them.
pub struct ReorgHandler {
    store: Arc<dyn LedgerStore>,
    node: Arc<dyn NodeClient>,
    lock: Arc<ResourceLock>,
}

impl ReorgHandler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        node: Arc<dyn NodeClient>,
        lock: Arc<ResourceLock>,
    ) -> Self {
        Self { store, node, lock }
    }

    /// Locate the highest locally stored block that still lies on the
    /// remote chain.
    ///
    /// The walk starts at `min(local, remote)` height and moves down one
    /// stored block per step, re-fetching the remote block above the cursor
    /// and comparing its declared parent hash against the stored hash. A
    /// walk exceeding the remote depth indicates an inconsistent node; it
    /// is logged and the current cursor returned, leaving the bounded
    /// one-level rollback to make progress anyway.
    pub async fn find_common_ancestor(
        &self,
        local: &ChainTip,
        remote: &ChainTip,
    ) -> Result<ChainTip, IndexError> {
        let mut cursor = if local.height > remote.height {
            match self.store.block_at(remote.height).await? {
                Some(tip) => tip,
                None => ChainTip::empty(),
            }
        } else {
            local.clone()
        };

        let bound = local.height.min(remote.height).max(0) + 1;
        let mut steps = 0i64;

        while !cursor.is_empty() {
            // At the remote tip itself there is no block above to fetch;
            // compare hashes directly.
            let on_remote_chain = if cursor.height == remote.height {
                cursor.hash == remote.hash
            } else {
                self.node.block_at(cursor.height + 1).await?.extends(&cursor)
            };
            if on_remote_chain {
                break;
            }
            steps += 1;
            if steps > bound {
                warn!(
                    %local,
                    %remote,
                    steps,
                    "ancestor walk exceeded the remote chain depth; continuing with bounded rollback"
                );
                break;
            }
            cursor = match self.store.block_at(cursor.height - 1).await? {
                Some(tip) => tip,
                None => ChainTip::empty(),
            };
        }

        Ok(cursor)
    }

    /// Unwind exactly one level toward `ancestor_height` and return the new
    /// local tip.
    ///
    /// Runs under the exclusive barrier so no import can interleave, and in
    /// one storage transaction so the level disappears atomically along
    /// with its `BlockRemoved` / unconfirm events.
    pub async fn rollback_step(
        &self,
        local: &ChainTip,
        ancestor_height: i64,
    ) -> Result<ChainTip, IndexError> {
        let target = ancestor_height.max(local.height - 1);

        self.lock
            .exclusive(|| async {
                let mut w = self.store.begin().await?;
                let outcome = w.rollback_above(target).await?;

                for removed in &outcome.blocks {
                    w.queue_event(IndexEvent::BlockRemoved {
                        hash: removed.hash.clone(),
                        height: removed.height,
                    });
                }
                for txid in &outcome.txids {
                    w.queue_event(IndexEvent::Tx {
                        txid: txid.clone(),
                        block_hash: None,
                        block_height: None,
                    });
                }
                for touch in &outcome.touched {
                    w.queue_event(IndexEvent::Address {
                        address: touch.address.clone(),
                        txid: touch.txid.clone(),
                        block_hash: None,
                        block_height: None,
                    });
                }

                let tip = w.latest_block().await?;
                w.commit().await?;
                warn!(target, tip = %tip, "rolled back one level");
                Ok(tip)
            })
            .await
    }
}
