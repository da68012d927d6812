//! addrindex-engine — keeps the local index consistent with a remote node.
//!
//! # Architecture
//!
//! ```text
//! SyncEngine (driver)
//!     ├── single-concurrency import lane
//!     │       ├── ReorgHandler     (divergence detection, bounded rollback)
//!     │       └── BlockImporter    (atomic block + history import)
//!     ├── bounded worker pool for unconfirmed transactions
//!     │       └── BlockImporter::import_unconfirmed + OrphanPool
//!     ├── MempoolReconciler  (local vs. remote unconfirmed set diff)
//!     └── SendTracker        (send_tx waiters with a timeout window)
//! ```
//!
//! All mutation goes through `ResourceLock`; the store is the durable
//! source of truth and is re-read after any failure.

pub mod config;
pub mod importer;
pub mod mempool;
pub mod node;
pub mod reorg;
pub mod sends;
pub mod sync;

pub use config::{EngineConfig, EngineConfigBuilder};
pub use importer::{BlockImporter, UnconfirmedOutcome};
pub use mempool::MempoolReconciler;
pub use node::{NodeClient, NodeEvent, NodeInfo};
pub use reorg::{ReorgHandler, SyncState};
pub use sends::SendTracker;
pub use sync::{EngineStatus, SyncEngine};
