//! The seam between the engine and the remote full node.
//!
//! A transport crate implements [`NodeClient`] over whatever wire the node
//! speaks (JSON-RPC, P2P inventory messages); the engine only depends on
//! this trait. Inventory announcements arrive on the [`NodeEvent`] stream.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use addrindex_core::error::IndexError;
use addrindex_core::types::{Block, ChainTip, Transaction};

/// An announcement from the node's event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeEvent {
    /// A new block hash was announced.
    NewBlock(String),
    /// A new transaction id was announced.
    NewTx(String),
}

/// Static facts about the connected node, checked once at startup.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeInfo {
    /// Network name the node is running on (e.g. `"livenet"`, `"testnet"`).
    pub network: String,
    pub version: String,
    /// The node's current best height.
    pub height: i64,
}

/// Client interface to the remote full node.
#[async_trait]
pub trait NodeClient: Send + Sync {
    async fn node_info(&self) -> Result<NodeInfo, IndexError>;

    /// The node's current best (hash, height).
    async fn latest(&self) -> Result<ChainTip, IndexError>;

    /// Fetch the block at `height` on the node's current best chain.
    async fn block_at(&self, height: i64) -> Result<Block, IndexError>;

    /// Fetch a transaction by id, decoded.
    async fn transaction(&self, txid: &str) -> Result<Transaction, IndexError>;

    /// Submit a raw transaction. Rejections surface as
    /// [`IndexError::SendRejected`] with the node's code and message.
    async fn send_transaction(&self, raw: &str) -> Result<(), IndexError>;

    /// Txids currently in the node's mempool.
    async fn mempool_txids(&self) -> Result<Vec<String>, IndexError>;

    /// Subscribe to block/transaction announcements.
    fn subscribe(&self) -> broadcast::Receiver<NodeEvent>;
}
