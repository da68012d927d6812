//! Typed index notifications and the broadcast bus that delivers them.
//!
//! Storage writers queue events while a transaction is open and the store
//! publishes them only after a successful commit, so a subscriber can never
//! observe a notification before the state it describes is durable.
//!
//! Delivery ordering: `Block` events are published in strictly increasing
//! height order, `BlockRemoved` events in strictly decreasing height order
//! (both a consequence of the serialized import lane committing one height
//! per transaction). Unconfirmed-transaction events carry no cross-tx
//! ordering guarantee beyond per-transaction atomicity.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// An index state-change notification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum IndexEvent {
    /// A block was imported.
    Block { hash: String, height: i64 },
    /// A block was rolled back during a reorg.
    BlockRemoved { hash: String, height: i64 },
    /// A transaction was imported or (re)confirmed. Block fields are `None`
    /// for mempool transactions and for confirmed transactions that were
    /// just unconfirmed by a rollback.
    Tx {
        txid: String,
        block_hash: Option<String>,
        block_height: Option<i64>,
    },
    /// An unconfirmed transaction was evicted from the index.
    TxRemoved { txid: String },
    /// A history row for this address was created or updated.
    Address {
        address: String,
        txid: String,
        block_hash: Option<String>,
        block_height: Option<i64>,
    },
}

/// Broadcast bus for [`IndexEvent`]s.
///
/// Cloning is cheap; all clones publish into the same channel. Subscribers
/// that fall behind the channel capacity observe a `Lagged` gap rather than
/// blocking the publisher.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<IndexEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<IndexEvent> {
        self.tx.subscribe()
    }

    /// Publish one event. A send error only means there are currently no
    /// subscribers, which is not a failure.
    pub fn publish(&self, event: IndexEvent) {
        let _ = self.tx.send(event);
    }

    pub fn publish_all(&self, events: impl IntoIterator<Item = IndexEvent>) {
        for event in events {
            self.publish(event);
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(1024)
    }
}
