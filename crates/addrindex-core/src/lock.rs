//! Per-key mutual exclusion with a global exclusive barrier.
//!
//! [`ResourceLock::with_lock`] serializes callers that share any key and
//! lets callers with disjoint key sets run concurrently.
//! [`ResourceLock::exclusive`] runs a closure with no `with_lock` body
//! active anywhere.
//!
//! Fairness: while an exclusive operation is pending, a `with_lock` call may
//! still *acquire* its keys (bookkeeping is never blocked by the barrier)
//! but must wait for the barrier to clear before its body runs. This keeps
//! new work from slipping in ahead of a pending exclusive operation.
//!
//! Keys, the barrier flag, and the running-body count are always released on
//! every exit path, including panics and future cancellation, via drop
//! guards.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Mutex;

use tokio::sync::watch;

#[derive(Default)]
struct LockState {
    /// Keys currently acquired by some `with_lock` call.
    held: HashSet<String>,
    /// Number of `with_lock` bodies currently executing.
    running: usize,
    /// Set while an exclusive operation is pending or executing.
    barrier: bool,
}

/// Fine-grained per-key lock table plus a global exclusive barrier.
pub struct ResourceLock {
    state: Mutex<LockState>,
    wake: watch::Sender<()>,
}

impl ResourceLock {
    pub fn new() -> Self {
        let (wake, _) = watch::channel(());
        Self {
            state: Mutex::new(LockState::default()),
            wake,
        }
    }

    /// Run `work` while holding every key in `keys`.
    ///
    /// Waits until none of the keys is held by another call, acquires them
    /// all atomically, waits out any pending exclusive barrier, then runs
    /// `work`. Keys are released when `work` finishes, errors, or the future
    /// is dropped.
    pub async fn with_lock<I, F, Fut, T>(&self, keys: I, work: F) -> T
    where
        I: IntoIterator<Item = String>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let mut keys: Vec<String> = keys.into_iter().collect();
        keys.sort();
        keys.dedup();

        // Acquire all keys at once; never blocked by the barrier.
        self.wait_until(|st| {
            if keys.iter().any(|k| st.held.contains(k)) {
                return false;
            }
            st.held.extend(keys.iter().cloned());
            true
        })
        .await;
        let _keys = KeyGuard { lock: self, keys: &keys };

        // Gate the body behind any pending exclusive operation.
        self.wait_until(|st| {
            if st.barrier {
                return false;
            }
            st.running += 1;
            true
        })
        .await;
        let _running = RunGuard { lock: self };

        work().await
    }

    /// Run `work` with no `with_lock` body active.
    ///
    /// Sets the barrier, waits for every executing `with_lock` body to
    /// finish, runs `work`, then clears the barrier. Only one exclusive
    /// operation runs at a time.
    pub async fn exclusive<F, Fut, T>(&self, work: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.wait_until(|st| {
            if st.barrier {
                return false;
            }
            st.barrier = true;
            true
        })
        .await;
        let _barrier = BarrierGuard { lock: self };

        self.wait_until(|st| st.running == 0).await;

        work().await
    }

    /// Wait until `claim` returns `true`. `claim` runs under the state
    /// mutex and may mutate state to record the claim it just made.
    async fn wait_until<F>(&self, mut claim: F)
    where
        F: FnMut(&mut LockState) -> bool,
    {
        let mut rx = self.wake.subscribe();
        loop {
            if claim(&mut self.state.lock().unwrap()) {
                return;
            }
            // A release between the check above and this await marks the
            // watch value unseen, so the wakeup cannot be missed.
            let _ = rx.changed().await;
        }
    }

    fn release(&self, f: impl FnOnce(&mut LockState)) {
        f(&mut self.state.lock().unwrap());
        self.wake.send_replace(());
    }
}

impl Default for ResourceLock {
    fn default() -> Self {
        Self::new()
    }
}

struct KeyGuard<'a> {
    lock: &'a ResourceLock,
    keys: &'a [String],
}

impl Drop for KeyGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(|st| {
            for key in self.keys {
                st.held.remove(key);
            }
        });
    }
}

struct RunGuard<'a> {
    lock: &'a ResourceLock,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(|st| st.running -= 1);
    }
}

struct BarrierGuard<'a> {
    lock: &'a ResourceLock,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        self.lock.release(|st| st.barrier = false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::sync::oneshot;
    use tokio::time::timeout;

    fn keys(ids: &[&str]) -> Vec<String> {
        ids.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn disjoint_keys_run_concurrently() {
        let lock = Arc::new(ResourceLock::new());
        let (tx_a, rx_a) = oneshot::channel::<()>();
        let (tx_b, rx_b) = oneshot::channel::<()>();

        // Each task signals the other from inside its body; this deadlocks
        // unless the two bodies run at the same time.
        let l = lock.clone();
        let a = tokio::spawn(async move {
            l.with_lock(keys(&["a"]), || async {
                tx_a.send(()).unwrap();
                rx_b.await.unwrap();
            })
            .await
        });
        let l = lock.clone();
        let b = tokio::spawn(async move {
            l.with_lock(keys(&["b"]), || async {
                tx_b.send(()).unwrap();
                rx_a.await.unwrap();
            })
            .await
        });

        timeout(Duration::from_secs(1), async {
            a.await.unwrap();
            b.await.unwrap();
        })
        .await
        .expect("disjoint calls must not serialize");
    }

    #[tokio::test]
    async fn shared_key_serializes() {
        let lock = Arc::new(ResourceLock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release_a, gate_a) = oneshot::channel::<()>();

        let l = lock.clone();
        let g = log.clone();
        let a = tokio::spawn(async move {
            l.with_lock(keys(&["k", "x"]), || async {
                g.lock().unwrap().push("a-start");
                gate_a.await.unwrap();
                g.lock().unwrap().push("a-end");
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;

        let l = lock.clone();
        let g = log.clone();
        let b = tokio::spawn(async move {
            l.with_lock(keys(&["k"]), || async {
                g.lock().unwrap().push("b");
            })
            .await
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(*log.lock().unwrap(), vec!["a-start"]); // b is parked

        release_a.send(()).unwrap();
        a.await.unwrap();
        b.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["a-start", "a-end", "b"]);
    }

    #[tokio::test]
    async fn exclusive_waits_for_holders_and_blocks_new_bodies() {
        let lock = Arc::new(ResourceLock::new());
        let log = Arc::new(Mutex::new(Vec::new()));
        let (release_a, gate_a) = oneshot::channel::<()>();

        let l = lock.clone();
        let g = log.clone();
        let a = tokio::spawn(async move {
            l.with_lock(keys(&["k"]), || async {
                g.lock().unwrap().push("a-start");
                gate_a.await.unwrap();
                g.lock().unwrap().push("a-end");
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let l = lock.clone();
        let g = log.clone();
        let excl = tokio::spawn(async move {
            l.exclusive(|| async {
                g.lock().unwrap().push("exclusive");
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        // b uses a different key, so it acquires immediately, but its body
        // must still wait behind the pending exclusive operation.
        let l = lock.clone();
        let g = log.clone();
        let b = tokio::spawn(async move {
            l.with_lock(keys(&["j"]), || async {
                g.lock().unwrap().push("b");
            })
            .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(*log.lock().unwrap(), vec!["a-start"]);

        release_a.send(()).unwrap();
        a.await.unwrap();
        excl.await.unwrap();
        b.await.unwrap();
        assert_eq!(
            *log.lock().unwrap(),
            vec!["a-start", "a-end", "exclusive", "b"]
        );
    }

    #[tokio::test]
    async fn keys_released_after_error() {
        let lock = ResourceLock::new();
        let result: Result<(), &str> = lock
            .with_lock(keys(&["k"]), || async { Err("boom") })
            .await;
        assert!(result.is_err());

        // The key must be free again.
        timeout(
            Duration::from_secs(1),
            lock.with_lock(keys(&["k"]), || async {}),
        )
        .await
        .expect("key leaked after a failed body");
    }

    #[tokio::test]
    async fn exclusive_operations_do_not_overlap() {
        let lock = Arc::new(ResourceLock::new());
        let active = Arc::new(Mutex::new(0usize));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let l = lock.clone();
            let a = active.clone();
            handles.push(tokio::spawn(async move {
                l.exclusive(|| async {
                    {
                        let mut n = a.lock().unwrap();
                        *n += 1;
                        assert_eq!(*n, 1, "two exclusive bodies overlapped");
                    }
                    tokio::time::sleep(Duration::from_millis(5)).await;
                    *a.lock().unwrap() -= 1;
                })
                .await
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
    }
}
