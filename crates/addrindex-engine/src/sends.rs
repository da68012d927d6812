//! Pending send-transaction waiters.
//!
//! A caller submitting a transaction waits on a one-shot future keyed by a
//! locally generated request id. If no response arrives within the window
//! the wait fails with [`IndexError::SendTimeout`] and the pending entry is
//! discarded, so abandoned waiters cannot accumulate.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use addrindex_core::error::IndexError;

type SendResult = Result<(), IndexError>;

/// Registry of in-flight send requests.
pub struct SendTracker {
    pending: Mutex<HashMap<u64, oneshot::Sender<SendResult>>>,
    next_id: AtomicU64,
    window: Duration,
}

impl SendTracker {
    pub fn new(window: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            window,
        }
    }

    /// Register a new waiter and return its request id and receiver.
    pub fn register(&self) -> (u64, oneshot::Receiver<SendResult>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(id, tx);
        (id, rx)
    }

    /// Deliver the response for `id`. Returns `false` if the waiter already
    /// timed out and was discarded.
    pub fn complete(&self, id: u64, result: SendResult) -> bool {
        match self.pending.lock().unwrap().remove(&id) {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    /// Wait for the response to `id`, bounded by the tracker's window.
    pub async fn wait(
        &self,
        id: u64,
        rx: oneshot::Receiver<SendResult>,
    ) -> Result<(), IndexError> {
        match tokio::time::timeout(self.window, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(IndexError::Other("send waiter dropped".into())),
            Err(_) => {
                self.pending.lock().unwrap().remove(&id);
                Err(IndexError::SendTimeout)
            }
        }
    }

    /// Number of requests still waiting for a response.
    pub fn pending(&self) -> usize {
        self.pending.lock().unwrap().len()
    }
}
