//! The sync driver: ties reorg handling, block import, orphan resolution,
//! and mempool reconciliation together in response to node announcements.
//!
//! Block imports and rollback steps run on a single-concurrency lane; at
//! most one is active at any time. Unconfirmed-transaction imports run on a
//! bounded worker pool and serialize against the lane only where they share
//! txids, via `ResourceLock`. Failures are logged and retried after the
//! configured backoff; the engine never terminates on a transient error.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{broadcast, Semaphore};
use tracing::{debug, error, info, warn};

use addrindex_core::error::IndexError;
use addrindex_core::lock::ResourceLock;
use addrindex_core::orphan::OrphanPool;
use addrindex_core::types::ChainTip;
use addrindex_storage::LedgerStore;

use crate::config::EngineConfig;
use crate::importer::{BlockImporter, UnconfirmedOutcome};
use crate::mempool::MempoolReconciler;
use crate::node::{NodeClient, NodeEvent};
use crate::reorg::{ReorgHandler, SyncState};
use crate::sends::SendTracker;

/// Snapshot of the engine's position, served to operators.
#[derive(Debug, Clone, Serialize)]
pub struct EngineStatus {
    pub state: String,
    pub local: ChainTip,
    pub remote: ChainTip,
    /// Transactions parked waiting for a missing input.
    pub orphans: usize,
}

/// Drives the index toward the node's chain and mempool.
pub struct SyncEngine {
    store: Arc<dyn LedgerStore>,
    node: Arc<dyn NodeClient>,
    config: EngineConfig,
    orphans: Arc<Mutex<OrphanPool>>,
    importer: BlockImporter,
    reorg: ReorgHandler,
    reconciler: MempoolReconciler,
    sends: SendTracker,
    state: Mutex<SyncState>,
    remote_latest: Mutex<ChainTip>,
    tx_permits: Arc<Semaphore>,
}

impl SyncEngine {
    pub fn new(
        store: Arc<dyn LedgerStore>,
        node: Arc<dyn NodeClient>,
        config: EngineConfig,
    ) -> Self {
        let lock = Arc::new(ResourceLock::new());
        let orphans = Arc::new(Mutex::new(OrphanPool::new()));
        let importer = BlockImporter::new(store.clone(), lock.clone(), orphans.clone());
        let reorg = ReorgHandler::new(store.clone(), node.clone(), lock.clone());
        let reconciler = MempoolReconciler::new(
            store.clone(),
            node.clone(),
            lock,
            config.rebroadcast,
            config.mempool_remove_chunk,
        );
        let sends = SendTracker::new(Duration::from_secs(config.send_timeout_secs));
        let tx_permits = Arc::new(Semaphore::new(config.tx_workers.max(1)));

        Self {
            store,
            node,
            orphans,
            importer,
            reorg,
            reconciler,
            sends,
            state: Mutex::new(SyncState::InSync),
            remote_latest: Mutex::new(ChainTip::empty()),
            tx_permits,
            config,
        }
    }

    /// Run until the node's announcement stream closes.
    ///
    /// Validates the node's network, performs the startup catch-up and
    /// mempool reconciliation, then processes announcements: block hashes
    /// on the serialized import lane, txids on the worker pool.
    pub async fn run(self: Arc<Self>) -> Result<(), IndexError> {
        let node_info = self.node.node_info().await?;
        if node_info.network != self.config.network {
            return Err(IndexError::InvalidNetwork {
                node: node_info.network,
                configured: self.config.network.clone(),
            });
        }
        let local = self.store.latest_block().await?;
        info!(
            network = %node_info.network,
            version = %node_info.version,
            local = %local,
            node_height = node_info.height,
            "node checked"
        );

        self.catch_up_with_retry().await;
        self.reconcile_with_retry().await;

        // Announcements start buffering here; one more pass covers any
        // block that landed before the subscription.
        let mut events = self.node.subscribe();
        self.catch_up_with_retry().await;
        self.reconcile_with_retry().await;
        info!("initial sync complete; following node announcements");

        loop {
            match events.recv().await {
                Ok(NodeEvent::NewBlock(hash)) => {
                    debug!(%hash, "block announced");
                    self.catch_up_with_retry().await;
                    self.reconcile_with_retry().await;
                }
                Ok(NodeEvent::NewTx(txid)) => self.spawn_tx_import(txid),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "node announcements lagged; resyncing");
                    self.catch_up_with_retry().await;
                    self.reconcile_with_retry().await;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("node announcement stream closed; stopping");
                    return Ok(());
                }
            }
        }
    }

    /// Import remote blocks (rolling back first if diverged) until the
    /// local tip equals the node's tip.
    pub async fn catch_up(&self) -> Result<(), IndexError> {
        loop {
            let local = self.store.latest_block().await?;
            let remote = self.node.latest().await?;
            *self.remote_latest.lock().unwrap() = remote.clone();

            if local.hash == remote.hash {
                self.set_state(SyncState::InSync);
                return Ok(());
            }

            if remote.height > local.height {
                let height = local.height + 1;
                let candidate = self.node.block_at(height).await?;
                if candidate.extends(&local) {
                    self.importer.import_block(&candidate, height).await?;
                    let ready = self.resolve_confirmed(&candidate.txids());
                    self.drain_tx_queue(ready).await;
                    continue;
                }
            }

            // The remote chain no longer contains the local tip.
            self.set_state(SyncState::Diverged);
            warn!(%local, %remote, "chain diverged from node");
            let ancestor = self.reorg.find_common_ancestor(&local, &remote).await?;
            self.set_state(SyncState::RollingBack);

            let mut tip = local;
            while tip.height > ancestor.height {
                tip = self.reorg.rollback_step(&tip, ancestor.height).await?;
            }
            self.set_state(SyncState::InSync);
        }
    }

    /// One mempool reconciliation pass, importing whatever the node has
    /// that the index is missing.
    pub async fn reconcile_once(&self) -> Result<(), IndexError> {
        let to_add = self.reconciler.reconcile().await?;
        for txid in to_add {
            self.import_unconfirmed_txid(&txid).await;
        }
        Ok(())
    }

    /// Fetch and import one announced transaction, then drain any orphans
    /// it unblocked. Per-transaction failures are logged, not propagated;
    /// the next reconciliation pass picks up whatever was missed.
    pub async fn import_unconfirmed_txid(&self, txid: &str) {
        self.drain_tx_queue(vec![txid.to_string()]).await;
    }

    /// Submit a raw transaction and wait (bounded) for the outcome.
    pub async fn send_transaction(&self, raw: &str) -> Result<(), IndexError> {
        let (id, rx) = self.sends.register();
        let result = self.node.send_transaction(raw).await;
        self.sends.complete(id, result);
        self.sends.wait(id, rx).await
    }

    pub async fn status(&self) -> Result<EngineStatus, IndexError> {
        Ok(EngineStatus {
            state: self.state().to_string(),
            local: self.store.latest_block().await?,
            remote: self.remote_latest.lock().unwrap().clone(),
            orphans: self.orphans.lock().unwrap().len(),
        })
    }

    // ── internals ─────────────────────────────────────────────────────────

    /// Work queue for unconfirmed imports: drained iteratively so orphan
    /// resolution chains never recurse.
    async fn drain_tx_queue(&self, ready: Vec<String>) {
        let mut queue: VecDeque<String> = ready.into();
        while let Some(txid) = queue.pop_front() {
            match self.import_one(&txid).await {
                Ok(unblocked) => queue.extend(unblocked),
                Err(err) => error!(%txid, %err, "unconfirmed import failed"),
            }
        }
    }

    async fn import_one(&self, txid: &str) -> Result<Vec<String>, IndexError> {
        let tx = self.node.transaction(txid).await?;
        match self.importer.import_unconfirmed(&tx).await? {
            UnconfirmedOutcome::Imported | UnconfirmedOutcome::AlreadyKnown => {
                Ok(self.orphans.lock().unwrap().resolve(txid))
            }
            UnconfirmedOutcome::Orphaned => Ok(Vec::new()),
        }
    }

    /// Resolve orphans against a batch of just-confirmed txids.
    fn resolve_confirmed(&self, txids: &[String]) -> Vec<String> {
        let mut orphans = self.orphans.lock().unwrap();
        let mut ready = Vec::new();
        for txid in txids {
            ready.extend(orphans.resolve(txid));
        }
        ready
    }

    fn spawn_tx_import(self: &Arc<Self>, txid: String) {
        let engine = self.clone();
        tokio::spawn(async move {
            let Ok(_permit) = engine.tx_permits.clone().acquire_owned().await else {
                return;
            };
            engine.import_unconfirmed_txid(&txid).await;
        });
    }

    async fn catch_up_with_retry(&self) {
        loop {
            match self.catch_up().await {
                Ok(()) => return,
                Err(err) => {
                    // Reorg-adjacent failures back off longer than plain
                    // import failures.
                    let delay = match self.state() {
                        SyncState::InSync => self.config.import_retry_ms,
                        SyncState::Diverged | SyncState::RollingBack => {
                            self.config.reorg_retry_ms
                        }
                    };
                    error!(%err, delay_ms = delay, "block import failed; retrying");
                    tokio::time::sleep(Duration::from_millis(delay)).await;
                }
            }
        }
    }

    async fn reconcile_with_retry(&self) {
        loop {
            match self.reconcile_once().await {
                Ok(()) => return,
                Err(err) => {
                    error!(
                        %err,
                        delay_ms = self.config.mempool_retry_ms,
                        "mempool reconciliation failed; retrying"
                    );
                    tokio::time::sleep(Duration::from_millis(self.config.mempool_retry_ms))
                        .await;
                }
            }
        }
    }

    fn state(&self) -> SyncState {
        *self.state.lock().unwrap()
    }

    fn set_state(&self, state: SyncState) {
        *self.state.lock().unwrap() = state;
    }
}
