//! addrindex-storage — pluggable storage backends for AddrIndex.
//!
//! Backends:
//! - [`memory`] — in-memory (dev/testing, no persistence)
//! - `sqlite` — SQLite via `sqlx` (embedded, single-file persistence;
//!   feature `sqlite`)
//!
//! All mutation happens through a [`LedgerWriter`]: a unit of work that is
//! applied atomically on [`LedgerWriter::commit`] and discarded on drop.
//! Writers also carry the [`IndexEvent`]s describing their mutations; the
//! backend publishes them to the store's [`EventBus`] only after the commit
//! succeeds, so subscribers never observe an event before the state it
//! describes is durable.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use addrindex_core::error::IndexError;
use addrindex_core::event::{EventBus, IndexEvent};
use addrindex_core::types::{ChainTip, HistoryRow};

pub mod memory;

#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::MemoryStore;

/// A transaction row as stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredTransaction {
    pub txid: String,
    pub raw: String,
    /// `None` while the transaction is unconfirmed.
    pub height: Option<i64>,
}

/// One (address, txid) pair affected by a mutation, used to emit
/// address-touched events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressTouch {
    pub address: String,
    pub txid: String,
}

/// Everything a single rollback transaction changed.
#[derive(Debug, Clone, Default)]
pub struct RollbackOutcome {
    /// Removed blocks, highest first.
    pub blocks: Vec<ChainTip>,
    /// Transactions whose height was cleared.
    pub txids: Vec<String>,
    /// History rows whose output or input height was cleared.
    pub touched: Vec<AddressTouch>,
}

/// Everything an unconfirmed-eviction transaction changed.
#[derive(Debug, Clone, Default)]
pub struct EvictionOutcome {
    /// Transactions actually deleted (rows that were still unconfirmed).
    pub txids: Vec<String>,
    /// History rows deleted or whose spender link was unwound.
    pub touched: Vec<AddressTouch>,
}

/// A single atomic unit of work against the ledger.
///
/// Reads observe the writer's own pending mutations. Dropping a writer
/// without committing discards every mutation and every queued event.
#[async_trait]
pub trait LedgerWriter: Send {
    // ── reads inside the transaction ──────────────────────────────────────

    async fn latest_block(&mut self) -> Result<ChainTip, IndexError>;

    /// Which of `txids` already have a transaction row (any height).
    async fn known_txids(&mut self, txids: &[String]) -> Result<Vec<String>, IndexError>;

    /// `None` if the txid is unknown; `Some(height)` otherwise.
    async fn transaction_height(&mut self, txid: &str)
        -> Result<Option<Option<i64>>, IndexError>;

    // ── block / transaction import ────────────────────────────────────────

    async fn insert_block(
        &mut self,
        height: i64,
        hash: &str,
        header: &str,
        txids: &[String],
    ) -> Result<(), IndexError>;

    async fn insert_transaction(
        &mut self,
        txid: &str,
        raw: &str,
        height: Option<i64>,
    ) -> Result<(), IndexError>;

    /// Upgrade an existing transaction row to `height` and mark its output
    /// history rows confirmed. Returns the addresses of the rows touched.
    async fn confirm_transaction(
        &mut self,
        txid: &str,
        height: i64,
    ) -> Result<Vec<String>, IndexError>;

    async fn insert_output(&mut self, row: &HistoryRow) -> Result<(), IndexError>;

    /// Record `input_txid` as the spender of (`prev_txid`, `prev_vout`).
    /// `input_height` is `None` for a mempool spend. Returns the addresses
    /// of the rows touched.
    async fn link_input(
        &mut self,
        prev_txid: &str,
        prev_vout: u32,
        input_txid: &str,
        input_height: Option<i64>,
    ) -> Result<Vec<String>, IndexError>;

    /// Confirm a spend that was already linked while unconfirmed: set only
    /// the input height. Returns the addresses of the rows touched.
    async fn confirm_input(
        &mut self,
        prev_txid: &str,
        prev_vout: u32,
        input_height: i64,
    ) -> Result<Vec<String>, IndexError>;

    // ── rollback / eviction ───────────────────────────────────────────────

    /// Delete every block above `height`, clear the height of every
    /// transaction confirmed above it, and clear output/input heights on
    /// affected history rows. Spender links (`input_txid`) survive as
    /// mempool spends.
    async fn rollback_above(&mut self, height: i64) -> Result<RollbackOutcome, IndexError>;

    /// Delete unconfirmed transactions: their rows, their history rows, and
    /// any spender link elsewhere that referenced them while unconfirmed.
    /// Confirmed rows with the same txids are left untouched.
    async fn remove_unconfirmed(
        &mut self,
        txids: &[String],
    ) -> Result<EvictionOutcome, IndexError>;

    // ── events / commit ───────────────────────────────────────────────────

    /// Queue an event for publication after a successful commit.
    fn queue_event(&mut self, event: IndexEvent);

    /// Apply the unit of work atomically, then publish queued events.
    async fn commit(self: Box<Self>) -> Result<(), IndexError>;
}

/// The durable ledger: blocks, transactions, and address history.
#[async_trait]
pub trait LedgerStore: Send + Sync {
    /// Start a unit of work.
    async fn begin(&self) -> Result<Box<dyn LedgerWriter>, IndexError>;

    async fn latest_block(&self) -> Result<ChainTip, IndexError>;

    async fn block_at(&self, height: i64) -> Result<Option<ChainTip>, IndexError>;

    async fn block_by_hash(&self, hash: &str) -> Result<Option<ChainTip>, IndexError>;

    async fn get_transaction(&self, txid: &str)
        -> Result<Option<StoredTransaction>, IndexError>;

    /// Txids of every transaction with no height, sorted.
    async fn unconfirmed_txids(&self) -> Result<Vec<String>, IndexError>;

    /// Raw bytes for the given txids (unknown ids are skipped).
    async fn raw_transactions(
        &self,
        txids: &[String],
    ) -> Result<Vec<StoredTransaction>, IndexError>;

    /// Spend edges among `txids` derived from history rows: `(spender,
    /// source)` pairs where both ends are in the given set.
    async fn spend_edges(&self, txids: &[String]) -> Result<Vec<(String, String)>, IndexError>;

    /// All history rows for an address, oldest output first.
    async fn history(&self, address: &str) -> Result<Vec<HistoryRow>, IndexError>;

    /// The bus this store publishes committed events on.
    fn events(&self) -> EventBus;
}
