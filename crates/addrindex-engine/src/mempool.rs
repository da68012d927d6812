//! Mempool reconciliation: diff the local unconfirmed set against the
//! node's mempool and import/evict the difference.
//!
//! Eviction can optionally try to resubmit first: the candidates are
//! ordered so a spender is sent after the local unconfirmed transaction it
//! spends from, and only those the node still refuses are deleted.
//! Reconciliation is eventually consistent; a transient failure simply
//! leaves the sets divergent until the next pass.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::sync::Arc;

use tracing::{debug, info};

use addrindex_core::error::IndexError;
use addrindex_core::event::IndexEvent;
use addrindex_core::lock::ResourceLock;
use addrindex_storage::{LedgerStore, StoredTransaction};

use crate::node::NodeClient;

/// Reconciles local unconfirmed transactions with the node's mempool.
pub struct MempoolReconciler {
    store: Arc<dyn LedgerStore>,
    node: Arc<dyn NodeClient>,
    lock: Arc<ResourceLock>,
    rebroadcast: bool,
    remove_chunk: usize,
}

impl MempoolReconciler {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        node: Arc<dyn NodeClient>,
        lock: Arc<ResourceLock>,
        rebroadcast: bool,
        remove_chunk: usize,
    ) -> Self {
        Self {
            store,
            node,
            lock,
            rebroadcast,
            remove_chunk,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// Evicts local unconfirmed transactions the node no longer knows
    /// (after an optional rebroadcast attempt) and returns the txids the
    /// node has that the index is missing, for the caller to route through
    /// the unconfirmed import path.
    pub async fn reconcile(&self) -> Result<Vec<String>, IndexError> {
        let remote = self.node.mempool_txids().await?;
        let local = self.store.unconfirmed_txids().await?;

        let remote_set: HashSet<&String> = remote.iter().collect();
        let local_set: HashSet<&String> = local.iter().collect();

        let mut to_remove: Vec<String> = local
            .iter()
            .filter(|id| !remote_set.contains(*id))
            .cloned()
            .collect();
        let to_add: Vec<String> = remote
            .iter()
            .filter(|id| !local_set.contains(*id))
            .cloned()
            .collect();

        if self.rebroadcast && !to_remove.is_empty() {
            to_remove = self.rebroadcast_failures(to_remove).await?;
        }
        if !to_remove.is_empty() {
            self.evict(&to_remove).await?;
        }

        info!(
            removed = to_remove.len(),
            missing = to_add.len(),
            "mempool reconciled"
        );
        Ok(to_add)
    }

    /// Resubmit `txids` to the node in dependency order and return the ones
    /// it refused.
    async fn rebroadcast_failures(&self, txids: Vec<String>) -> Result<Vec<String>, IndexError> {
        let txs = self.store.raw_transactions(&txids).await?;
        let edges = self.store.spend_edges(&txids).await?;

        let mut failed = Vec::new();
        for tx in sort_by_dependency(txs, &edges) {
            if let Err(err) = self.node.send_transaction(&tx.raw).await {
                debug!(txid = %tx.txid, %err, "rebroadcast refused");
                failed.push(tx.txid);
            }
        }
        Ok(failed)
    }

    /// Delete the given unconfirmed transactions in chunks, each chunk in
    /// its own storage transaction under the exclusive barrier so no
    /// concurrent import can race the eviction.
    async fn evict(&self, txids: &[String]) -> Result<(), IndexError> {
        for chunk in txids.chunks(self.remove_chunk) {
            self.lock
                .exclusive(|| async {
                    let mut w = self.store.begin().await?;
                    let outcome = w.remove_unconfirmed(chunk).await?;
                    for txid in &outcome.txids {
                        w.queue_event(IndexEvent::TxRemoved { txid: txid.clone() });
                    }
                    for touch in &outcome.touched {
                        w.queue_event(IndexEvent::Address {
                            address: touch.address.clone(),
                            txid: touch.txid.clone(),
                            block_hash: None,
                            block_height: None,
                        });
                    }
                    w.commit().await
                })
                .await?;
        }
        Ok(())
    }
}

/// Order transactions so every spender comes after the transaction it
/// spends from. `edges` are `(spender, source)` pairs within the set.
fn sort_by_dependency(
    txs: Vec<StoredTransaction>,
    edges: &[(String, String)],
) -> Vec<StoredTransaction> {
    let mut indegree: HashMap<&str, usize> =
        txs.iter().map(|tx| (tx.txid.as_str(), 0)).collect();
    let mut children: HashMap<&str, Vec<&str>> = HashMap::new();
    for (spender, source) in edges {
        if indegree.contains_key(spender.as_str()) && indegree.contains_key(source.as_str()) {
            *indegree.get_mut(spender.as_str()).unwrap() += 1;
            children
                .entry(source.as_str())
                .or_default()
                .push(spender.as_str());
        }
    }

    let by_id: HashMap<&str, &StoredTransaction> =
        txs.iter().map(|tx| (tx.txid.as_str(), tx)).collect();

    let mut ready: BinaryHeap<Reverse<&str>> = indegree
        .iter()
        .filter(|(_, n)| **n == 0)
        .map(|(id, _)| Reverse(*id))
        .collect();

    let mut ordered: Vec<StoredTransaction> = Vec::with_capacity(txs.len());
    let mut seen: HashSet<&str> = HashSet::new();
    while let Some(Reverse(id)) = ready.pop() {
        seen.insert(id);
        ordered.push((*by_id[id]).clone());
        for child in children.get(id).into_iter().flatten() {
            let n = indegree.get_mut(child).unwrap();
            *n -= 1;
            if *n == 0 {
                ready.push(Reverse(*child));
            }
        }
    }

    // A dependency cycle cannot occur among valid transactions; if the
    // store ever produced one, append the remainder in id order.
    if ordered.len() < txs.len() {
        let mut rest: Vec<&StoredTransaction> = txs
            .iter()
            .filter(|tx| !seen.contains(tx.txid.as_str()))
            .collect();
        rest.sort_by(|a, b| a.txid.cmp(&b.txid));
        ordered.extend(rest.into_iter().cloned());
    }
    ordered
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stored(txid: &str) -> StoredTransaction {
        StoredTransaction {
            txid: txid.into(),
            raw: format!("raw-{txid}"),
            height: None,
        }
    }

    fn edge(spender: &str, source: &str) -> (String, String) {
        (spender.into(), source.into())
    }

    fn position(ordered: &[StoredTransaction], txid: &str) -> usize {
        ordered.iter().position(|tx| tx.txid == txid).unwrap()
    }

    #[test]
    fn sources_come_before_spenders() {
        let ordered = sort_by_dependency(
            vec![stored("t3"), stored("t1"), stored("t2")],
            &[edge("t2", "t1"), edge("t3", "t2")],
        );
        assert!(position(&ordered, "t1") < position(&ordered, "t2"));
        assert!(position(&ordered, "t2") < position(&ordered, "t3"));
    }

    #[test]
    fn independent_transactions_keep_id_order() {
        let ordered = sort_by_dependency(vec![stored("b"), stored("a")], &[]);
        assert_eq!(ordered[0].txid, "a");
        assert_eq!(ordered[1].txid, "b");
    }

    #[test]
    fn diamond_dependency() {
        // t4 spends from t2 and t3; both spend from t1.
        let ordered = sort_by_dependency(
            vec![stored("t4"), stored("t2"), stored("t3"), stored("t1")],
            &[
                edge("t2", "t1"),
                edge("t3", "t1"),
                edge("t4", "t2"),
                edge("t4", "t3"),
            ],
        );
        assert_eq!(position(&ordered, "t1"), 0);
        assert_eq!(position(&ordered, "t4"), 3);
    }

    #[test]
    fn edges_outside_the_set_are_ignored() {
        let ordered = sort_by_dependency(vec![stored("t2")], &[edge("t2", "t1")]);
        assert_eq!(ordered.len(), 1);
        assert_eq!(ordered[0].txid, "t2");
    }
}
