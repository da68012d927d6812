//! Engine configuration and builder.

use serde::{Deserialize, Serialize};

/// Tunables for a [`crate::SyncEngine`] instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Network the index is built for; the connected node must match.
    pub network: String,
    /// Bounded concurrency for unconfirmed-transaction imports.
    pub tx_workers: usize,
    /// Try to resubmit locally known unconfirmed transactions before
    /// evicting them during mempool reconciliation.
    pub rebroadcast: bool,
    /// How many txids one eviction transaction may delete.
    pub mempool_remove_chunk: usize,
    /// How long a send waiter may wait for its response (seconds).
    pub send_timeout_secs: u64,
    /// Retry delay after an import-loop failure (milliseconds).
    pub import_retry_ms: u64,
    /// Retry delay after a mempool-reconciliation failure (milliseconds).
    pub mempool_retry_ms: u64,
    /// Retry delay after a failure while diverged or rolling back
    /// (milliseconds).
    pub reorg_retry_ms: u64,
    /// Capacity of the index event channel.
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            network: "livenet".into(),
            tx_workers: 4,
            rebroadcast: true,
            mempool_remove_chunk: 250,
            send_timeout_secs: 30 * 60,
            import_retry_ms: 1_000,
            mempool_retry_ms: 5_000,
            reorg_retry_ms: 15_000,
            event_capacity: 1_024,
        }
    }
}

/// Fluent builder for [`EngineConfig`].
#[derive(Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn network(mut self, network: impl Into<String>) -> Self {
        self.config.network = network.into();
        self
    }

    pub fn tx_workers(mut self, workers: usize) -> Self {
        self.config.tx_workers = workers;
        self
    }

    pub fn rebroadcast(mut self, enabled: bool) -> Self {
        self.config.rebroadcast = enabled;
        self
    }

    pub fn mempool_remove_chunk(mut self, chunk: usize) -> Self {
        self.config.mempool_remove_chunk = chunk;
        self
    }

    pub fn send_timeout_secs(mut self, secs: u64) -> Self {
        self.config.send_timeout_secs = secs;
        self
    }

    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.network, "livenet");
        assert_eq!(cfg.tx_workers, 4);
        assert!(cfg.rebroadcast);
        assert_eq!(cfg.mempool_remove_chunk, 250);
        assert_eq!(cfg.send_timeout_secs, 1_800);
    }

    #[test]
    fn builder_overrides() {
        let cfg = EngineConfigBuilder::new()
            .network("testnet")
            .tx_workers(8)
            .rebroadcast(false)
            .build();
        assert_eq!(cfg.network, "testnet");
        assert_eq!(cfg.tx_workers, 8);
        assert!(!cfg.rebroadcast);
    }

    #[test]
    fn deserializes_with_defaults() {
        let cfg: EngineConfig = serde_json::from_str(r#"{"network": "regtest"}"#).unwrap();
        assert_eq!(cfg.network, "regtest");
        assert_eq!(cfg.import_retry_ms, 1_000);
    }
}
