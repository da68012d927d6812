//! addrindex-core — foundation for the reorg-safe address-history index engine.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine (addrindex-engine)
//!     ├── ResourceLock  (per-key mutual exclusion + exclusive barrier)
//!     ├── OrphanPool    (unresolved-input dependency graph)
//!     ├── EventBus      (typed, commit-ordered index notifications)
//!     └── LedgerStore   (addrindex-storage: memory / SQLite)
//! ```

pub mod error;
pub mod event;
pub mod lock;
pub mod orphan;
pub mod types;

pub use error::IndexError;
pub use event::{EventBus, IndexEvent};
pub use lock::ResourceLock;
pub use orphan::OrphanPool;
pub use types::{Block, ChainTip, HistoryRow, Transaction, TxInput, TxOutput, ZERO_HASH};
