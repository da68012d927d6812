//! Shared types for the index engine.

use serde::{Deserialize, Serialize};

/// The all-zero hash, used as the previous-block pointer of the genesis block
/// and as the previous-txid of a coinbase input.
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

// ─── ChainTip ─────────────────────────────────────────────────────────────────

/// The tip of a chain as a (hash, height) pair.
///
/// Height `-1` together with [`ZERO_HASH`] denotes the empty chain (nothing
/// indexed yet); the first real block sits at height `0`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainTip {
    pub hash: String,
    pub height: i64,
}

impl ChainTip {
    pub fn new(hash: impl Into<String>, height: i64) -> Self {
        Self {
            hash: hash.into(),
            height,
        }
    }

    /// The empty-chain sentinel.
    pub fn empty() -> Self {
        Self {
            hash: ZERO_HASH.to_string(),
            height: -1,
        }
    }

    /// Returns `true` if nothing has been indexed yet.
    pub fn is_empty(&self) -> bool {
        self.height < 0
    }
}

impl std::fmt::Display for ChainTip {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.hash, self.height)
    }
}

// ─── Transactions ─────────────────────────────────────────────────────────────

/// One transaction input: a reference to a previous output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxInput {
    /// Txid of the transaction whose output is being spent.
    pub prev_txid: String,
    /// Output index within that transaction.
    pub prev_vout: u32,
}

/// One transaction output.
///
/// `addresses` is the decoded address set for the output script — the
/// node-facing codec resolves scripts to addresses before the engine sees
/// them. Outputs with no decodable address have an empty list and produce no
/// history rows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxOutput {
    /// Value in satoshis.
    pub value: i64,
    /// Output script, hex-encoded.
    pub script: String,
    pub addresses: Vec<String>,
}

/// A decoded transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transaction {
    pub txid: String,
    /// Raw transaction bytes, hex-encoded.
    pub raw: String,
    pub inputs: Vec<TxInput>,
    pub outputs: Vec<TxOutput>,
}

impl Transaction {
    /// Unique previous-txids referenced by this transaction's inputs.
    pub fn prev_txids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.inputs.iter().map(|i| i.prev_txid.clone()).collect();
        ids.sort();
        ids.dedup();
        ids
    }
}

/// Returns `true` if the given input is a coinbase input: input 0 of
/// transaction 0 of a block, spending the zero hash at the maximum vout.
pub fn is_coinbase_input(tx_index: usize, input_index: usize, input: &TxInput) -> bool {
    tx_index == 0
        && input_index == 0
        && input.prev_vout == u32::MAX
        && input.prev_txid == ZERO_HASH
}

// ─── Block ────────────────────────────────────────────────────────────────────

/// A block as fetched from the node, with its transactions fully decoded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Block {
    pub hash: String,
    /// Hash of the previous block as declared in this block's header.
    pub prev_hash: String,
    /// Raw block header, hex-encoded.
    pub header: String,
    pub transactions: Vec<Transaction>,
}

impl Block {
    /// Returns `true` if this block's declared parent is `tip`.
    pub fn extends(&self, tip: &ChainTip) -> bool {
        self.prev_hash == tip.hash
    }

    /// Ordered txids of the contained transactions.
    pub fn txids(&self) -> Vec<String> {
        self.transactions.iter().map(|tx| tx.txid.clone()).collect()
    }

    /// The key set a block import must hold: every contained txid plus every
    /// previous-txid referenced by any input, deduplicated.
    pub fn lock_keys(&self) -> Vec<String> {
        let mut keys = self.txids();
        for tx in &self.transactions {
            for input in &tx.inputs {
                keys.push(input.prev_txid.clone());
            }
        }
        keys.sort();
        keys.dedup();
        keys
    }
}

// ─── HistoryRow ───────────────────────────────────────────────────────────────

/// One address-history row: a tracked-address output and, once spent, its
/// spending input.
///
/// Invariants: `output_height` is set iff the owning transaction is
/// confirmed; `input_height` is set iff the spending transaction is
/// confirmed. `input_txid` may be set with `input_height` still unset when
/// the spend has only been seen in the mempool.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub address: String,
    pub output_txid: String,
    pub output_index: u32,
    /// Output value in satoshis.
    pub value: i64,
    /// Output script, hex-encoded.
    pub script: String,
    pub output_height: Option<i64>,
    pub input_txid: Option<String>,
    pub input_height: Option<i64>,
}

// ─── Tests ────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn tx(txid: &str, prevs: &[(&str, u32)]) -> Transaction {
        Transaction {
            txid: txid.into(),
            raw: format!("raw-{txid}"),
            inputs: prevs
                .iter()
                .map(|(id, vout)| TxInput {
                    prev_txid: (*id).into(),
                    prev_vout: *vout,
                })
                .collect(),
            outputs: vec![],
        }
    }

    #[test]
    fn empty_tip_sentinel() {
        let tip = ChainTip::empty();
        assert_eq!(tip.height, -1);
        assert_eq!(tip.hash, ZERO_HASH);
        assert!(tip.is_empty());
        assert!(!ChainTip::new("aa", 0).is_empty());
    }

    #[test]
    fn block_extends_tip() {
        let tip = ChainTip::new("aa", 10);
        let block = Block {
            hash: "bb".into(),
            prev_hash: "aa".into(),
            header: String::new(),
            transactions: vec![],
        };
        assert!(block.extends(&tip));
        assert!(!block.extends(&ChainTip::new("cc", 10)));
    }

    #[test]
    fn lock_keys_cover_txids_and_prev_txids() {
        let block = Block {
            hash: "bb".into(),
            prev_hash: "aa".into(),
            header: String::new(),
            transactions: vec![tx("t1", &[("p1", 0)]), tx("t2", &[("p1", 1), ("t1", 0)])],
        };
        let keys = block.lock_keys();
        assert_eq!(keys, vec!["p1", "t1", "t2"]); // deduplicated
    }

    #[test]
    fn coinbase_detection() {
        let cb = TxInput {
            prev_txid: ZERO_HASH.into(),
            prev_vout: u32::MAX,
        };
        assert!(is_coinbase_input(0, 0, &cb));
        assert!(!is_coinbase_input(1, 0, &cb)); // not the first transaction
        assert!(!is_coinbase_input(0, 1, &cb)); // not the first input
        let normal = TxInput {
            prev_txid: "p1".into(),
            prev_vout: 0,
        };
        assert!(!is_coinbase_input(0, 0, &normal));
    }

    #[test]
    fn prev_txids_deduplicated() {
        let t = tx("t1", &[("p1", 0), ("p1", 1), ("p2", 0)]);
        assert_eq!(t.prev_txids(), vec!["p1", "p2"]);
    }
}
