//! Error types for the index engine.

use thiserror::Error;

/// Errors that can occur while synchronizing the index.
#[derive(Debug, Error)]
pub enum IndexError {
    #[error("node error: {0}")]
    Node(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("node is on network '{node}' but the index is configured for '{configured}'")]
    InvalidNetwork { node: String, configured: String },

    #[error("transaction rejected by node (code {code}): {message}")]
    SendRejected { code: i32, message: String },

    #[error("no send confirmation arrived within the timeout window")]
    SendTimeout,

    #[error("{0}")]
    Other(String),
}

impl IndexError {
    /// Returns `true` if this error came from submitting a transaction
    /// (rejection or timeout) rather than from the sync machinery itself.
    pub fn is_send_failure(&self) -> bool {
        matches!(self, Self::SendRejected { .. } | Self::SendTimeout)
    }
}
