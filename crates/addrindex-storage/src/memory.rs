//! In-memory storage backend.
//!
//! Keeps the whole ledger in RAM behind a mutex. Writers snapshot the data
//! on begin, mutate the snapshot, and swap it back on commit; a global
//! write gate serializes units of work so a commit can never clobber a
//! concurrent one. Useful for tests and short-lived indexes.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use addrindex_core::error::IndexError;
use addrindex_core::event::{EventBus, IndexEvent};
use addrindex_core::types::{ChainTip, HistoryRow};

use crate::{
    AddressTouch, EvictionOutcome, LedgerStore, LedgerWriter, RollbackOutcome, StoredTransaction,
};

#[derive(Debug, Clone)]
struct MemBlock {
    hash: String,
    header: String,
    txids: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct MemData {
    blocks: BTreeMap<i64, MemBlock>,
    txs: HashMap<String, StoredTransaction>,
    history: Vec<HistoryRow>,
}

impl MemData {
    fn latest(&self) -> ChainTip {
        match self.blocks.last_key_value() {
            Some((height, block)) => ChainTip::new(block.hash.clone(), *height),
            None => ChainTip::empty(),
        }
    }
}

/// In-memory ledger store.
///
/// All data is lost when the store is dropped.
pub struct MemoryStore {
    data: Arc<Mutex<MemData>>,
    write_gate: Arc<AsyncMutex<()>>,
    bus: EventBus,
}

impl MemoryStore {
    pub fn new(bus: EventBus) -> Self {
        Self {
            data: Arc::new(Mutex::new(MemData::default())),
            write_gate: Arc::new(AsyncMutex::new(())),
            bus,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(EventBus::default())
    }
}

#[async_trait]
impl LedgerStore for MemoryStore {
    async fn begin(&self) -> Result<Box<dyn LedgerWriter>, IndexError> {
        let gate = self.write_gate.clone().lock_owned().await;
        let work = self.data.lock().unwrap().clone();
        Ok(Box::new(MemoryWriter {
            data: self.data.clone(),
            work,
            events: Vec::new(),
            bus: self.bus.clone(),
            _gate: gate,
        }))
    }

    async fn latest_block(&self) -> Result<ChainTip, IndexError> {
        Ok(self.data.lock().unwrap().latest())
    }

    async fn block_at(&self, height: i64) -> Result<Option<ChainTip>, IndexError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .blocks
            .get(&height)
            .map(|b| ChainTip::new(b.hash.clone(), height)))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<ChainTip>, IndexError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .blocks
            .iter()
            .find(|(_, b)| b.hash == hash)
            .map(|(height, b)| ChainTip::new(b.hash.clone(), *height)))
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<StoredTransaction>, IndexError> {
        Ok(self.data.lock().unwrap().txs.get(txid).cloned())
    }

    async fn unconfirmed_txids(&self) -> Result<Vec<String>, IndexError> {
        let mut ids: Vec<String> = self
            .data
            .lock()
            .unwrap()
            .txs
            .values()
            .filter(|tx| tx.height.is_none())
            .map(|tx| tx.txid.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }

    async fn raw_transactions(
        &self,
        txids: &[String],
    ) -> Result<Vec<StoredTransaction>, IndexError> {
        let data = self.data.lock().unwrap();
        Ok(txids
            .iter()
            .filter_map(|id| data.txs.get(id).cloned())
            .collect())
    }

    async fn spend_edges(&self, txids: &[String]) -> Result<Vec<(String, String)>, IndexError> {
        let set: HashSet<&String> = txids.iter().collect();
        let data = self.data.lock().unwrap();
        let mut edges = Vec::new();
        for row in &data.history {
            let Some(spender) = &row.input_txid else {
                continue;
            };
            if spender != &row.output_txid
                && set.contains(spender)
                && set.contains(&row.output_txid)
            {
                edges.push((spender.clone(), row.output_txid.clone()));
            }
        }
        edges.sort();
        edges.dedup();
        Ok(edges)
    }

    async fn history(&self, address: &str) -> Result<Vec<HistoryRow>, IndexError> {
        Ok(self
            .data
            .lock()
            .unwrap()
            .history
            .iter()
            .filter(|row| row.address == address)
            .cloned()
            .collect())
    }

    fn events(&self) -> EventBus {
        self.bus.clone()
    }
}

struct MemoryWriter {
    data: Arc<Mutex<MemData>>,
    work: MemData,
    events: Vec<IndexEvent>,
    bus: EventBus,
    _gate: OwnedMutexGuard<()>,
}

#[async_trait]
impl LedgerWriter for MemoryWriter {
    async fn latest_block(&mut self) -> Result<ChainTip, IndexError> {
        Ok(self.work.latest())
    }

    async fn known_txids(&mut self, txids: &[String]) -> Result<Vec<String>, IndexError> {
        let mut known: Vec<String> = txids
            .iter()
            .filter(|id| self.work.txs.contains_key(*id))
            .cloned()
            .collect();
        known.sort();
        known.dedup();
        Ok(known)
    }

    async fn transaction_height(
        &mut self,
        txid: &str,
    ) -> Result<Option<Option<i64>>, IndexError> {
        Ok(self.work.txs.get(txid).map(|tx| tx.height))
    }

    async fn insert_block(
        &mut self,
        height: i64,
        hash: &str,
        header: &str,
        txids: &[String],
    ) -> Result<(), IndexError> {
        if self.work.blocks.contains_key(&height) {
            return Err(IndexError::Storage(format!(
                "block row at height {height} already exists"
            )));
        }
        self.work.blocks.insert(
            height,
            MemBlock {
                hash: hash.to_string(),
                header: header.to_string(),
                txids: txids.to_vec(),
            },
        );
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        txid: &str,
        raw: &str,
        height: Option<i64>,
    ) -> Result<(), IndexError> {
        if self.work.txs.contains_key(txid) {
            return Err(IndexError::Storage(format!(
                "transaction row {txid} already exists"
            )));
        }
        self.work.txs.insert(
            txid.to_string(),
            StoredTransaction {
                txid: txid.to_string(),
                raw: raw.to_string(),
                height,
            },
        );
        Ok(())
    }

    async fn confirm_transaction(
        &mut self,
        txid: &str,
        height: i64,
    ) -> Result<Vec<String>, IndexError> {
        let tx = self.work.txs.get_mut(txid).ok_or_else(|| {
            IndexError::Storage(format!("cannot confirm unknown transaction {txid}"))
        })?;
        tx.height = Some(height);

        let mut addresses = Vec::new();
        for row in &mut self.work.history {
            if row.output_txid == txid {
                row.output_height = Some(height);
                addresses.push(row.address.clone());
            }
        }
        Ok(addresses)
    }

    async fn insert_output(&mut self, row: &HistoryRow) -> Result<(), IndexError> {
        self.work.history.push(row.clone());
        Ok(())
    }

    async fn link_input(
        &mut self,
        prev_txid: &str,
        prev_vout: u32,
        input_txid: &str,
        input_height: Option<i64>,
    ) -> Result<Vec<String>, IndexError> {
        let mut addresses = Vec::new();
        for row in &mut self.work.history {
            if row.output_txid == prev_txid && row.output_index == prev_vout {
                row.input_txid = Some(input_txid.to_string());
                row.input_height = input_height;
                addresses.push(row.address.clone());
            }
        }
        Ok(addresses)
    }

    async fn confirm_input(
        &mut self,
        prev_txid: &str,
        prev_vout: u32,
        input_height: i64,
    ) -> Result<Vec<String>, IndexError> {
        let mut addresses = Vec::new();
        for row in &mut self.work.history {
            if row.output_txid == prev_txid && row.output_index == prev_vout {
                row.input_height = Some(input_height);
                addresses.push(row.address.clone());
            }
        }
        Ok(addresses)
    }

    async fn rollback_above(&mut self, height: i64) -> Result<RollbackOutcome, IndexError> {
        let mut outcome = RollbackOutcome::default();

        let above = self.work.blocks.split_off(&(height + 1));
        for (h, block) in above.into_iter().rev() {
            outcome.blocks.push(ChainTip::new(block.hash, h));
        }

        let mut txids: Vec<String> = self
            .work
            .txs
            .values()
            .filter(|tx| tx.height.is_some_and(|h| h > height))
            .map(|tx| tx.txid.clone())
            .collect();
        txids.sort();
        for id in &txids {
            if let Some(tx) = self.work.txs.get_mut(id) {
                tx.height = None;
            }
        }
        outcome.txids = txids;

        for row in &mut self.work.history {
            if row.output_height.is_some_and(|h| h > height) {
                row.output_height = None;
                outcome.touched.push(AddressTouch {
                    address: row.address.clone(),
                    txid: row.output_txid.clone(),
                });
            }
            if row.input_height.is_some_and(|h| h > height) {
                row.input_height = None;
                if let Some(spender) = &row.input_txid {
                    outcome.touched.push(AddressTouch {
                        address: row.address.clone(),
                        txid: spender.clone(),
                    });
                }
            }
        }
        Ok(outcome)
    }

    async fn remove_unconfirmed(
        &mut self,
        txids: &[String],
    ) -> Result<EvictionOutcome, IndexError> {
        let mut removed: HashSet<String> = HashSet::new();
        for id in txids {
            if self
                .work
                .txs
                .get(id)
                .is_some_and(|tx| tx.height.is_none())
            {
                self.work.txs.remove(id);
                removed.insert(id.clone());
            }
        }

        let mut outcome = EvictionOutcome::default();
        self.work.history.retain(|row| {
            if removed.contains(&row.output_txid) {
                outcome.touched.push(AddressTouch {
                    address: row.address.clone(),
                    txid: row.output_txid.clone(),
                });
                return false;
            }
            true
        });
        for row in &mut self.work.history {
            let unwind = row.input_height.is_none()
                && row
                    .input_txid
                    .as_ref()
                    .is_some_and(|spender| removed.contains(spender));
            if unwind {
                let spender = row.input_txid.take().unwrap_or_default();
                outcome.touched.push(AddressTouch {
                    address: row.address.clone(),
                    txid: spender,
                });
            }
        }
        outcome.txids = removed.into_iter().collect();
        outcome.txids.sort();
        Ok(outcome)
    }

    fn queue_event(&mut self, event: IndexEvent) {
        self.events.push(event);
    }

    async fn commit(self: Box<Self>) -> Result<(), IndexError> {
        let this = *self;
        *this.data.lock().unwrap() = this.work;
        this.bus.publish_all(this.events);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn output_row(address: &str, txid: &str, vout: u32, height: Option<i64>) -> HistoryRow {
        HistoryRow {
            address: address.into(),
            output_txid: txid.into(),
            output_index: vout,
            value: 5_000,
            script: "76a914".into(),
            output_height: height,
            input_txid: None,
            input_height: None,
        }
    }

    #[tokio::test]
    async fn empty_store_has_sentinel_tip() {
        let store = MemoryStore::default();
        assert_eq!(store.latest_block().await.unwrap(), ChainTip::empty());
    }

    #[tokio::test]
    async fn commit_makes_mutations_visible() {
        let store = MemoryStore::default();

        let mut w = store.begin().await.unwrap();
        w.insert_block(0, "b0", "h0", &["t0".into()]).await.unwrap();
        w.insert_transaction("t0", "raw0", Some(0)).await.unwrap();
        w.commit().await.unwrap();

        assert_eq!(store.latest_block().await.unwrap(), ChainTip::new("b0", 0));
        assert_eq!(
            store.get_transaction("t0").await.unwrap().unwrap().height,
            Some(0)
        );
    }

    #[tokio::test]
    async fn dropped_writer_discards_mutations_and_events() {
        let store = MemoryStore::default();
        let mut rx = store.events().subscribe();

        {
            let mut w = store.begin().await.unwrap();
            w.insert_block(0, "b0", "h0", &[]).await.unwrap();
            w.queue_event(IndexEvent::Block {
                hash: "b0".into(),
                height: 0,
            });
            // dropped without commit
        }

        assert!(store.latest_block().await.unwrap().is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn events_publish_only_after_commit() {
        let store = MemoryStore::default();
        let mut rx = store.events().subscribe();

        let mut w = store.begin().await.unwrap();
        w.queue_event(IndexEvent::Block {
            hash: "b0".into(),
            height: 0,
        });
        assert!(rx.try_recv().is_err());
        w.commit().await.unwrap();

        assert!(matches!(
            rx.try_recv().unwrap(),
            IndexEvent::Block { height: 0, .. }
        ));
    }

    #[tokio::test]
    async fn confirm_transaction_updates_outputs() {
        let store = MemoryStore::default();

        let mut w = store.begin().await.unwrap();
        w.insert_transaction("t1", "raw1", None).await.unwrap();
        w.insert_output(&output_row("addr1", "t1", 0, None))
            .await
            .unwrap();
        w.commit().await.unwrap();

        let mut w = store.begin().await.unwrap();
        let addresses = w.confirm_transaction("t1", 7).await.unwrap();
        w.commit().await.unwrap();
        assert_eq!(addresses, vec!["addr1"]);

        let rows = store.history("addr1").await.unwrap();
        assert_eq!(rows[0].output_height, Some(7));
        assert_eq!(
            store.get_transaction("t1").await.unwrap().unwrap().height,
            Some(7)
        );
    }

    #[tokio::test]
    async fn rollback_clears_heights_but_keeps_spender_links() {
        let store = MemoryStore::default();

        let mut w = store.begin().await.unwrap();
        w.insert_block(0, "b0", "h0", &["t0".into()]).await.unwrap();
        w.insert_block(1, "b1", "h1", &["t1".into()]).await.unwrap();
        w.insert_transaction("t0", "raw0", Some(0)).await.unwrap();
        w.insert_transaction("t1", "raw1", Some(1)).await.unwrap();
        w.insert_output(&output_row("addr0", "t0", 0, Some(0)))
            .await
            .unwrap();
        w.link_input("t0", 0, "t1", Some(1)).await.unwrap();
        w.commit().await.unwrap();

        let mut w = store.begin().await.unwrap();
        let outcome = w.rollback_above(0).await.unwrap();
        w.commit().await.unwrap();

        assert_eq!(outcome.blocks, vec![ChainTip::new("b1", 1)]);
        assert_eq!(outcome.txids, vec!["t1"]);

        assert_eq!(store.latest_block().await.unwrap(), ChainTip::new("b0", 0));
        assert_eq!(
            store.get_transaction("t1").await.unwrap().unwrap().height,
            None
        );
        let rows = store.history("addr0").await.unwrap();
        assert_eq!(rows[0].input_txid.as_deref(), Some("t1")); // mempool spend now
        assert_eq!(rows[0].input_height, None);
        assert_eq!(rows[0].output_height, Some(0)); // t0 untouched
    }

    #[tokio::test]
    async fn remove_unconfirmed_unwinds_spender_links() {
        let store = MemoryStore::default();

        let mut w = store.begin().await.unwrap();
        w.insert_transaction("t0", "raw0", Some(0)).await.unwrap();
        w.insert_output(&output_row("addr0", "t0", 0, Some(0)))
            .await
            .unwrap();
        w.insert_transaction("t1", "raw1", None).await.unwrap();
        w.insert_output(&output_row("addr1", "t1", 0, None))
            .await
            .unwrap();
        w.link_input("t0", 0, "t1", None).await.unwrap();
        w.commit().await.unwrap();

        let mut w = store.begin().await.unwrap();
        let outcome = w.remove_unconfirmed(&["t1".into()]).await.unwrap();
        w.commit().await.unwrap();

        assert_eq!(outcome.txids, vec!["t1"]);
        assert!(outcome.touched.iter().any(|t| t.address == "addr1"));
        assert!(outcome.touched.iter().any(|t| t.address == "addr0"));

        assert!(store.get_transaction("t1").await.unwrap().is_none());
        assert!(store.history("addr1").await.unwrap().is_empty());
        let rows = store.history("addr0").await.unwrap();
        assert_eq!(rows[0].input_txid, None); // spend unwound
    }

    #[tokio::test]
    async fn remove_unconfirmed_skips_confirmed_rows() {
        let store = MemoryStore::default();

        let mut w = store.begin().await.unwrap();
        w.insert_transaction("t0", "raw0", Some(0)).await.unwrap();
        w.commit().await.unwrap();

        let mut w = store.begin().await.unwrap();
        let outcome = w.remove_unconfirmed(&["t0".into()]).await.unwrap();
        w.commit().await.unwrap();

        assert!(outcome.txids.is_empty());
        assert!(outcome.touched.is_empty());
        assert!(store.get_transaction("t0").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn spend_edges_within_set() {
        let store = MemoryStore::default();

        let mut w = store.begin().await.unwrap();
        w.insert_transaction("t1", "raw1", None).await.unwrap();
        w.insert_output(&output_row("addr1", "t1", 0, None))
            .await
            .unwrap();
        w.insert_transaction("t2", "raw2", None).await.unwrap();
        w.link_input("t1", 0, "t2", None).await.unwrap();
        w.commit().await.unwrap();

        let edges = store
            .spend_edges(&["t1".into(), "t2".into()])
            .await
            .unwrap();
        assert_eq!(edges, vec![("t2".into(), "t1".into())]);

        // Source outside the set: no edge.
        let edges = store.spend_edges(&["t2".into()]).await.unwrap();
        assert!(edges.is_empty());
    }
}
