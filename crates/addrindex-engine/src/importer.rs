//! Atomic import of blocks and unconfirmed transactions.
//!
//! Both paths run under `ResourceLock::with_lock` over every txid they may
//! touch, and each maps to exactly one storage transaction: a failure
//! anywhere aborts the whole unit of work and nothing becomes visible.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use tracing::{info, warn};

use addrindex_core::error::IndexError;
use addrindex_core::event::IndexEvent;
use addrindex_core::lock::ResourceLock;
use addrindex_core::orphan::OrphanPool;
use addrindex_core::types::{is_coinbase_input, Block, HistoryRow, Transaction};
use addrindex_storage::LedgerStore;

/// Result of an unconfirmed-transaction import attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnconfirmedOutcome {
    /// The transaction and its history rows were committed.
    Imported,
    /// A row for this txid already existed; nothing was written.
    AlreadyKnown,
    /// At least one input references an unknown transaction; the txid was
    /// parked in the orphan pool and nothing was written.
    Orphaned,
}

/// Writes blocks and unconfirmed transactions into the ledger.
pub struct BlockImporter {
    store: Arc<dyn LedgerStore>,
    lock: Arc<ResourceLock>,
    orphans: Arc<Mutex<OrphanPool>>,
}

impl BlockImporter {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        lock: Arc<ResourceLock>,
        orphans: Arc<Mutex<OrphanPool>>,
    ) -> Self {
        Self {
            store,
            lock,
            orphans,
        }
    }

    /// Import one block at `height` atomically.
    ///
    /// Transactions already known unconfirmed are upgraded in place rather
    /// than reinserted; their mempool spend links get the confirmed height.
    pub async fn import_block(&self, block: &Block, height: i64) -> Result<(), IndexError> {
        let txids = block.txids();
        self.lock
            .with_lock(block.lock_keys(), || async {
                let mut w = self.store.begin().await?;

                w.insert_block(height, &block.hash, &block.header, &txids)
                    .await?;
                w.queue_event(IndexEvent::Block {
                    hash: block.hash.clone(),
                    height,
                });

                // Transactions and outputs.
                let mut upgraded: HashSet<&str> = HashSet::new();
                for tx in &block.transactions {
                    if w.transaction_height(&tx.txid).await?.is_some() {
                        upgraded.insert(&tx.txid);
                        let addresses = w.confirm_transaction(&tx.txid, height).await?;
                        for address in addresses {
                            w.queue_event(IndexEvent::Address {
                                address,
                                txid: tx.txid.clone(),
                                block_hash: Some(block.hash.clone()),
                                block_height: Some(height),
                            });
                        }
                    } else {
                        w.insert_transaction(&tx.txid, &tx.raw, Some(height)).await?;
                        for (vout, output) in tx.outputs.iter().enumerate() {
                            for address in &output.addresses {
                                w.insert_output(&HistoryRow {
                                    address: address.clone(),
                                    output_txid: tx.txid.clone(),
                                    output_index: vout as u32,
                                    value: output.value,
                                    script: output.script.clone(),
                                    output_height: Some(height),
                                    input_txid: None,
                                    input_height: None,
                                })
                                .await?;
                                w.queue_event(IndexEvent::Address {
                                    address: address.clone(),
                                    txid: tx.txid.clone(),
                                    block_hash: Some(block.hash.clone()),
                                    block_height: Some(height),
                                });
                            }
                        }
                    }
                    w.queue_event(IndexEvent::Tx {
                        txid: tx.txid.clone(),
                        block_hash: Some(block.hash.clone()),
                        block_height: Some(height),
                    });
                }

                // Inputs.
                for (tx_index, tx) in block.transactions.iter().enumerate() {
                    for (input_index, input) in tx.inputs.iter().enumerate() {
                        if is_coinbase_input(tx_index, input_index, input) {
                            continue;
                        }
                        let addresses = if upgraded.contains(tx.txid.as_str()) {
                            // The spend link was written by the mempool
                            // import; only its height is missing.
                            w.confirm_input(&input.prev_txid, input.prev_vout, height)
                                .await?
                        } else {
                            w.link_input(
                                &input.prev_txid,
                                input.prev_vout,
                                &tx.txid,
                                Some(height),
                            )
                            .await?
                        };
                        for address in addresses {
                            w.queue_event(IndexEvent::Address {
                                address,
                                txid: tx.txid.clone(),
                                block_hash: Some(block.hash.clone()),
                                block_height: Some(height),
                            });
                        }
                    }
                }

                w.commit().await?;
                info!(
                    height,
                    hash = %block.hash,
                    txs = block.transactions.len(),
                    "block imported"
                );
                Ok(())
            })
            .await
    }

    /// Try to import a transaction seen in the mempool.
    ///
    /// If any input references an unknown transaction the txid is parked in
    /// the orphan pool instead and nothing is written.
    pub async fn import_unconfirmed(
        &self,
        tx: &Transaction,
    ) -> Result<UnconfirmedOutcome, IndexError> {
        let prev_txids = tx.prev_txids();
        let mut keys = prev_txids.clone();
        keys.push(tx.txid.clone());

        self.lock
            .with_lock(keys, || async {
                let mut w = self.store.begin().await?;

                if w.transaction_height(&tx.txid).await?.is_some() {
                    return Ok(UnconfirmedOutcome::AlreadyKnown);
                }

                let known: HashSet<String> =
                    w.known_txids(&prev_txids).await?.into_iter().collect();
                let missing: Vec<String> = prev_txids
                    .iter()
                    .filter(|id| !known.contains(*id))
                    .cloned()
                    .collect();
                if !missing.is_empty() {
                    warn!(
                        txid = %tx.txid,
                        deps = %missing.join(", "),
                        "orphan transaction parked"
                    );
                    self.orphans.lock().unwrap().register(&tx.txid, missing);
                    return Ok(UnconfirmedOutcome::Orphaned);
                }

                w.insert_transaction(&tx.txid, &tx.raw, None).await?;
                w.queue_event(IndexEvent::Tx {
                    txid: tx.txid.clone(),
                    block_hash: None,
                    block_height: None,
                });

                for (vout, output) in tx.outputs.iter().enumerate() {
                    for address in &output.addresses {
                        w.insert_output(&HistoryRow {
                            address: address.clone(),
                            output_txid: tx.txid.clone(),
                            output_index: vout as u32,
                            value: output.value,
                            script: output.script.clone(),
                            output_height: None,
                            input_txid: None,
                            input_height: None,
                        })
                        .await?;
                        w.queue_event(IndexEvent::Address {
                            address: address.clone(),
                            txid: tx.txid.clone(),
                            block_hash: None,
                            block_height: None,
                        });
                    }
                }

                for input in &tx.inputs {
                    let addresses = w
                        .link_input(&input.prev_txid, input.prev_vout, &tx.txid, None)
                        .await?;
                    for address in addresses {
                        w.queue_event(IndexEvent::Address {
                            address,
                            txid: tx.txid.clone(),
                            block_hash: None,
                            block_height: None,
                        });
                    }
                }

                w.commit().await?;
                Ok(UnconfirmedOutcome::Imported)
            })
            .await
    }
}
