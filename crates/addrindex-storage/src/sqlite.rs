//! SQLite storage backend for AddrIndex.
//!
//! Persists blocks, transactions, and address history to a single SQLite
//! file. Uses `sqlx` with WAL mode for concurrent read performance; every
//! [`LedgerWriter`] maps to one SQLite transaction, so a unit of work is
//! atomic and a dropped writer rolls back.
//!
//! # Usage
//! ```rust,no_run
//! use addrindex_core::event::EventBus;
//! use addrindex_storage::sqlite::SqliteStore;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // File-backed (persistent)
//! let store = SqliteStore::open("./index.db", EventBus::default()).await?;
//!
//! // In-memory (tests / ephemeral)
//! let store = SqliteStore::in_memory(EventBus::default()).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, SqlitePool, Transaction};
use tracing::debug;

use addrindex_core::error::IndexError;
use addrindex_core::event::{EventBus, IndexEvent};
use addrindex_core::types::{ChainTip, HistoryRow};

use crate::{
    AddressTouch, EvictionOutcome, LedgerStore, LedgerWriter, RollbackOutcome, StoredTransaction,
};

/// SQLite-backed ledger store.
pub struct SqliteStore {
    pool: SqlitePool,
    bus: EventBus,
}

impl SqliteStore {
    /// Open (or create) a SQLite database at `path`.
    ///
    /// The path may be a plain file path (`"./index.db"`) or a full SQLite
    /// URL (`"sqlite:./index.db?mode=rwc"`).
    pub async fn open(path: &str, bus: EventBus) -> Result<Self, IndexError> {
        let url = if path.starts_with("sqlite:") {
            path.to_string()
        } else {
            format!("sqlite:{path}?mode=rwc")
        };

        let pool = SqlitePool::connect(&url)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        let store = Self { pool, bus };
        store.init_schema().await?;
        Ok(store)
    }

    /// Open an in-memory SQLite database on a single connection.
    ///
    /// All data is lost when the pool is dropped. Ideal for tests.
    pub async fn in_memory(bus: EventBus) -> Result<Self, IndexError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        let store = Self { pool, bus };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), IndexError> {
        sqlx::query("PRAGMA journal_mode=WAL;")
            .execute(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS blocks (
                height INTEGER PRIMARY KEY,
                hash   TEXT NOT NULL UNIQUE,
                header TEXT NOT NULL,
                txids  TEXT NOT NULL
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS transactions (
                txid   TEXT PRIMARY KEY,
                raw    TEXT NOT NULL,
                height INTEGER
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        sqlx::query(
            "CREATE TABLE IF NOT EXISTS history (
                address       TEXT NOT NULL,
                output_txid   TEXT NOT NULL,
                output_index  INTEGER NOT NULL,
                value         INTEGER NOT NULL,
                script        TEXT NOT NULL,
                output_height INTEGER,
                input_txid    TEXT,
                input_height  INTEGER,
                PRIMARY KEY (address, output_txid, output_index)
            );",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        for stmt in [
            "CREATE INDEX IF NOT EXISTS idx_transactions_height ON transactions (height);",
            "CREATE INDEX IF NOT EXISTS idx_history_output ON history (output_txid, output_index);",
            "CREATE INDEX IF NOT EXISTS idx_history_input ON history (input_txid);",
        ] {
            sqlx::query(stmt)
                .execute(&self.pool)
                .await
                .map_err(|e| IndexError::Storage(e.to_string()))?;
        }

        Ok(())
    }
}

/// `?, ?, …` placeholder list for an `IN` clause.
fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

#[async_trait]
impl LedgerStore for SqliteStore {
    async fn begin(&self) -> Result<Box<dyn LedgerWriter>, IndexError> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        Ok(Box::new(SqliteWriter {
            tx,
            events: Vec::new(),
            bus: self.bus.clone(),
        }))
    }

    async fn latest_block(&self) -> Result<ChainTip, IndexError> {
        let row = sqlx::query("SELECT height, hash FROM blocks ORDER BY height DESC LIMIT 1")
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(match row {
            Some(r) => ChainTip::new(r.get::<String, _>("hash"), r.get::<i64, _>("height")),
            None => ChainTip::empty(),
        })
    }

    async fn block_at(&self, height: i64) -> Result<Option<ChainTip>, IndexError> {
        let row = sqlx::query("SELECT hash FROM blocks WHERE height = ?")
            .bind(height)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(row.map(|r| ChainTip::new(r.get::<String, _>("hash"), height)))
    }

    async fn block_by_hash(&self, hash: &str) -> Result<Option<ChainTip>, IndexError> {
        let row = sqlx::query("SELECT height FROM blocks WHERE hash = ?")
            .bind(hash)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(row.map(|r| ChainTip::new(hash, r.get::<i64, _>("height"))))
    }

    async fn get_transaction(
        &self,
        txid: &str,
    ) -> Result<Option<StoredTransaction>, IndexError> {
        let row = sqlx::query("SELECT txid, raw, height FROM transactions WHERE txid = ?")
            .bind(txid)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(row.map(|r| StoredTransaction {
            txid: r.get("txid"),
            raw: r.get("raw"),
            height: r.get("height"),
        }))
    }

    async fn unconfirmed_txids(&self) -> Result<Vec<String>, IndexError> {
        let rows = sqlx::query(
            "SELECT txid FROM transactions WHERE height IS NULL ORDER BY txid",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("txid")).collect())
    }

    async fn raw_transactions(
        &self,
        txids: &[String],
    ) -> Result<Vec<StoredTransaction>, IndexError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT txid, raw, height FROM transactions WHERE txid IN ({}) ORDER BY txid",
            placeholders(txids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in txids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| StoredTransaction {
                txid: r.get("txid"),
                raw: r.get("raw"),
                height: r.get("height"),
            })
            .collect())
    }

    async fn spend_edges(&self, txids: &[String]) -> Result<Vec<(String, String)>, IndexError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let marks = placeholders(txids.len());
        let sql = format!(
            "SELECT DISTINCT input_txid, output_txid FROM history
             WHERE input_txid IN ({marks}) AND output_txid IN ({marks})
               AND input_txid != output_txid
             ORDER BY input_txid, output_txid"
        );
        let mut query = sqlx::query(&sql);
        for id in txids.iter().chain(txids.iter()) {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| (r.get("input_txid"), r.get("output_txid")))
            .collect())
    }

    async fn history(&self, address: &str) -> Result<Vec<HistoryRow>, IndexError> {
        let rows = sqlx::query(
            "SELECT address, output_txid, output_index, value, script,
                    output_height, input_txid, input_height
             FROM history WHERE address = ? ORDER BY rowid",
        )
        .bind(address)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows
            .iter()
            .map(|r| HistoryRow {
                address: r.get("address"),
                output_txid: r.get("output_txid"),
                output_index: r.get::<i64, _>("output_index") as u32,
                value: r.get("value"),
                script: r.get("script"),
                output_height: r.get("output_height"),
                input_txid: r.get("input_txid"),
                input_height: r.get("input_height"),
            })
            .collect())
    }

    fn events(&self) -> EventBus {
        self.bus.clone()
    }
}

struct SqliteWriter {
    tx: Transaction<'static, sqlx::Sqlite>,
    events: Vec<IndexEvent>,
    bus: EventBus,
}

#[async_trait]
impl LedgerWriter for SqliteWriter {
    async fn latest_block(&mut self) -> Result<ChainTip, IndexError> {
        let row = sqlx::query("SELECT height, hash FROM blocks ORDER BY height DESC LIMIT 1")
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(match row {
            Some(r) => ChainTip::new(r.get::<String, _>("hash"), r.get::<i64, _>("height")),
            None => ChainTip::empty(),
        })
    }

    async fn known_txids(&mut self, txids: &[String]) -> Result<Vec<String>, IndexError> {
        if txids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT txid FROM transactions WHERE txid IN ({}) ORDER BY txid",
            placeholders(txids.len())
        );
        let mut query = sqlx::query(&sql);
        for id in txids {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("txid")).collect())
    }

    async fn transaction_height(
        &mut self,
        txid: &str,
    ) -> Result<Option<Option<i64>>, IndexError> {
        let row = sqlx::query("SELECT height FROM transactions WHERE txid = ?")
            .bind(txid)
            .fetch_optional(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(row.map(|r| r.get("height")))
    }

    async fn insert_block(
        &mut self,
        height: i64,
        hash: &str,
        header: &str,
        txids: &[String],
    ) -> Result<(), IndexError> {
        let txids_json = serde_json::to_string(txids)
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        sqlx::query("INSERT INTO blocks (height, hash, header, txids) VALUES (?, ?, ?, ?)")
            .bind(height)
            .bind(hash)
            .bind(header)
            .bind(&txids_json)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        debug!(height, hash, "block row staged");
        Ok(())
    }

    async fn insert_transaction(
        &mut self,
        txid: &str,
        raw: &str,
        height: Option<i64>,
    ) -> Result<(), IndexError> {
        sqlx::query("INSERT INTO transactions (txid, raw, height) VALUES (?, ?, ?)")
            .bind(txid)
            .bind(raw)
            .bind(height)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn confirm_transaction(
        &mut self,
        txid: &str,
        height: i64,
    ) -> Result<Vec<String>, IndexError> {
        let updated = sqlx::query("UPDATE transactions SET height = ? WHERE txid = ?")
            .bind(height)
            .bind(txid)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        if updated.rows_affected() == 0 {
            return Err(IndexError::Storage(format!(
                "cannot confirm unknown transaction {txid}"
            )));
        }

        let rows = sqlx::query(
            "UPDATE history SET output_height = ? WHERE output_txid = ? RETURNING address",
        )
        .bind(height)
        .bind(txid)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("address")).collect())
    }

    async fn insert_output(&mut self, row: &HistoryRow) -> Result<(), IndexError> {
        sqlx::query(
            "INSERT INTO history (address, output_txid, output_index, value, script,
                                  output_height, input_txid, input_height)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&row.address)
        .bind(&row.output_txid)
        .bind(row.output_index as i64)
        .bind(row.value)
        .bind(&row.script)
        .bind(row.output_height)
        .bind(&row.input_txid)
        .bind(row.input_height)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(())
    }

    async fn link_input(
        &mut self,
        prev_txid: &str,
        prev_vout: u32,
        input_txid: &str,
        input_height: Option<i64>,
    ) -> Result<Vec<String>, IndexError> {
        let rows = sqlx::query(
            "UPDATE history SET input_txid = ?, input_height = ?
             WHERE output_txid = ? AND output_index = ? RETURNING address",
        )
        .bind(input_txid)
        .bind(input_height)
        .bind(prev_txid)
        .bind(prev_vout as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("address")).collect())
    }

    async fn confirm_input(
        &mut self,
        prev_txid: &str,
        prev_vout: u32,
        input_height: i64,
    ) -> Result<Vec<String>, IndexError> {
        let rows = sqlx::query(
            "UPDATE history SET input_height = ?
             WHERE output_txid = ? AND output_index = ? RETURNING address",
        )
        .bind(input_height)
        .bind(prev_txid)
        .bind(prev_vout as i64)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(rows.iter().map(|r| r.get("address")).collect())
    }

    async fn rollback_above(&mut self, height: i64) -> Result<RollbackOutcome, IndexError> {
        let mut outcome = RollbackOutcome::default();

        let rows = sqlx::query(
            "SELECT height, hash FROM blocks WHERE height > ? ORDER BY height DESC",
        )
        .bind(height)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;
        outcome.blocks = rows
            .iter()
            .map(|r| ChainTip::new(r.get::<String, _>("hash"), r.get::<i64, _>("height")))
            .collect();

        sqlx::query("DELETE FROM blocks WHERE height > ?")
            .bind(height)
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        let rows = sqlx::query(
            "UPDATE transactions SET height = NULL WHERE height > ? RETURNING txid",
        )
        .bind(height)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;
        outcome.txids = rows.iter().map(|r| r.get("txid")).collect();
        outcome.txids.sort();

        let rows = sqlx::query(
            "UPDATE history SET output_height = NULL
             WHERE output_height > ? RETURNING address, output_txid",
        )
        .bind(height)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;
        for r in &rows {
            outcome.touched.push(AddressTouch {
                address: r.get("address"),
                txid: r.get("output_txid"),
            });
        }

        let rows = sqlx::query(
            "UPDATE history SET input_height = NULL
             WHERE input_height > ? RETURNING address, input_txid",
        )
        .bind(height)
        .fetch_all(&mut *self.tx)
        .await
        .map_err(|e| IndexError::Storage(e.to_string()))?;
        for r in &rows {
            if let Some(spender) = r.get::<Option<String>, _>("input_txid") {
                outcome.touched.push(AddressTouch {
                    address: r.get("address"),
                    txid: spender,
                });
            }
        }

        debug!(
            above = height,
            blocks = outcome.blocks.len(),
            txs = outcome.txids.len(),
            "rolled back storage"
        );
        Ok(outcome)
    }

    async fn remove_unconfirmed(
        &mut self,
        txids: &[String],
    ) -> Result<EvictionOutcome, IndexError> {
        if txids.is_empty() {
            return Ok(EvictionOutcome::default());
        }
        let marks = placeholders(txids.len());

        // Only rows that really are unconfirmed get removed.
        let sql = format!(
            "SELECT txid FROM transactions WHERE height IS NULL AND txid IN ({marks}) ORDER BY txid"
        );
        let mut query = sqlx::query(&sql);
        for id in txids {
            query = query.bind(id);
        }
        let removed: Vec<String> = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?
            .iter()
            .map(|r| r.get("txid"))
            .collect();
        if removed.is_empty() {
            return Ok(EvictionOutcome::default());
        }
        let marks = placeholders(removed.len());

        let sql = format!("DELETE FROM transactions WHERE txid IN ({marks})");
        let mut query = sqlx::query(&sql);
        for id in &removed {
            query = query.bind(id);
        }
        query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        let mut outcome = EvictionOutcome {
            txids: removed.clone(),
            touched: Vec::new(),
        };

        let sql = format!(
            "DELETE FROM history WHERE output_txid IN ({marks}) RETURNING address, output_txid"
        );
        let mut query = sqlx::query(&sql);
        for id in &removed {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        for r in &rows {
            outcome.touched.push(AddressTouch {
                address: r.get("address"),
                txid: r.get("output_txid"),
            });
        }

        // Unwind mempool spends referencing the removed transactions. The
        // spender id is read before the update nulls it out.
        let sql = format!(
            "SELECT address, input_txid FROM history
             WHERE input_height IS NULL AND input_txid IN ({marks})"
        );
        let mut query = sqlx::query(&sql);
        for id in &removed {
            query = query.bind(id);
        }
        let rows = query
            .fetch_all(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        for r in &rows {
            if let Some(spender) = r.get::<Option<String>, _>("input_txid") {
                outcome.touched.push(AddressTouch {
                    address: r.get("address"),
                    txid: spender,
                });
            }
        }

        let sql = format!(
            "UPDATE history SET input_txid = NULL
             WHERE input_height IS NULL AND input_txid IN ({marks})"
        );
        let mut query = sqlx::query(&sql);
        for id in &removed {
            query = query.bind(id);
        }
        query
            .execute(&mut *self.tx)
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;

        Ok(outcome)
    }

    fn queue_event(&mut self, event: IndexEvent) {
        self.events.push(event);
    }

    async fn commit(self: Box<Self>) -> Result<(), IndexError> {
        let this = *self;
        this.tx
            .commit()
            .await
            .map_err(|e| IndexError::Storage(e.to_string()))?;
        this.bus.publish_all(this.events);
        Ok(())
    }
}

// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    async fn store() -> SqliteStore {
        SqliteStore::in_memory(EventBus::new(64)).await.unwrap()
    }

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
        let store = store().await;
        assert_eq!(store.latest_block().await.unwrap(), ChainTip::empty());
    }

    #[tokio::test]
    async fn block_and_transaction_roundtrip() {
        let store = store().await;

        let mut w = store.begin().await.unwrap();
        w.insert_block(0, "b0", "h0", &["t0".into()]).await.unwrap();
        w.insert_transaction("t0", "raw0", Some(0)).await.unwrap();
        w.commit().await.unwrap();

        assert_eq!(store.latest_block().await.unwrap(), ChainTip::new("b0", 0));
        assert_eq!(
            store.block_at(0).await.unwrap(),
            Some(ChainTip::new("b0", 0))
        );
        assert!(store.block_at(5).await.unwrap().is_none());
        assert_eq!(
            store.block_by_hash("b0").await.unwrap(),
            Some(ChainTip::new("b0", 0))
        );
        assert!(store.block_by_hash("nope").await.unwrap().is_none());

        let tx = store.get_transaction("t0").await.unwrap().unwrap();
        assert_eq!(tx.raw, "raw0");
        assert_eq!(tx.height, Some(0));
    }

    #[tokio::test]
    async fn dropped_writer_rolls_back() {
        let store = store().await;

        {
            let mut w = store.begin().await.unwrap();
            w.insert_block(0, "b0", "h0", &[]).await.unwrap();
            // dropped without commit
        }

        assert!(store.latest_block().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn confirm_transaction_returns_touched_addresses() {
        let store = store().await;

        let mut w = store.begin().await.unwrap();
        w.insert_transaction("t1", "raw1", None).await.unwrap();
        w.insert_output(&output_row("addr1", "t1", 0, None))
            .await
            .unwrap();
        w.insert_output(&output_row("addr2", "t1", 1, None))
            .await
            .unwrap();
        w.commit().await.unwrap();

        let mut w = store.begin().await.unwrap();
        let mut addresses = w.confirm_transaction("t1", 3).await.unwrap();
        w.commit().await.unwrap();
        addresses.sort();
        assert_eq!(addresses, vec!["addr1", "addr2"]);

        assert_eq!(
            store.history("addr1").await.unwrap()[0].output_height,
            Some(3)
        );
    }

    #[tokio::test]
    async fn unconfirmed_txids_only_lists_null_heights() {
        let store = store().await;

        let mut w = store.begin().await.unwrap();
        w.insert_transaction("tc", "raw", Some(1)).await.unwrap();
        w.insert_transaction("tb", "raw", None).await.unwrap();
        w.insert_transaction("ta", "raw", None).await.unwrap();
        w.commit().await.unwrap();

        assert_eq!(store.unconfirmed_txids().await.unwrap(), vec!["ta", "tb"]);
    }

    #[tokio::test]
    async fn rollback_above_unwinds_one_level() {
        let store = store().await;

        let mut w = store.begin().await.unwrap();
        w.insert_block(0, "b0", "h0", &["t0".into()]).await.unwrap();
        w.insert_block(1, "b1", "h1", &["t1".into()]).await.unwrap();
        w.insert_transaction("t0", "raw0", Some(0)).await.unwrap();
        w.insert_transaction("t1", "raw1", Some(1)).await.unwrap();
        w.insert_output(&output_row("addr0", "t0", 0, Some(0)))
            .await
            .unwrap();
        w.insert_output(&output_row("addr1", "t1", 0, Some(1)))
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
        let rows = store.history("addr1").await.unwrap();
        assert_eq!(rows[0].output_height, None);
        let rows = store.history("addr0").await.unwrap();
        assert_eq!(rows[0].input_txid.as_deref(), Some("t1"));
        assert_eq!(rows[0].input_height, None);
    }

    #[tokio::test]
    async fn remove_unconfirmed_deletes_rows_and_unwinds_spends() {
        let store = store().await;

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
        let outcome = w
            .remove_unconfirmed(&["t1".into(), "t0".into()])
            .await
            .unwrap();
        w.commit().await.unwrap();

        // t0 is confirmed and must survive.
        assert_eq!(outcome.txids, vec!["t1"]);
        assert!(store.get_transaction("t0").await.unwrap().is_some());
        assert!(store.get_transaction("t1").await.unwrap().is_none());
        assert!(store.history("addr1").await.unwrap().is_empty());
        assert_eq!(store.history("addr0").await.unwrap()[0].input_txid, None);
        assert!(outcome.touched.iter().any(|t| t.address == "addr0"));
    }

    #[tokio::test]
    async fn events_publish_only_after_commit() {
        let store = store().await;
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
}
