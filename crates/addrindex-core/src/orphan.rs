//! Dependency tracking for transactions that arrive before their inputs.
//!
//! An orphan is a transaction referencing a previous transaction the store
//! has never seen. The pool records which prerequisite txids each orphan is
//! waiting on and the inverse map from prerequisite to waiting orphans.
//! [`OrphanPool::resolve`] returns the orphans whose last missing
//! prerequisite just arrived; the caller schedules them on its work queue
//! rather than importing recursively.
//!
//! The pool is rebuilt empty on restart, and a prerequisite that never
//! arrives leaves its dependents in the pool until the process exits.

use std::collections::{HashMap, HashSet};

/// In-memory orphan dependency graph.
#[derive(Debug, Default)]
pub struct OrphanPool {
    /// Orphan txid → prerequisites it is still missing.
    deps: HashMap<String, HashSet<String>>,
    /// Prerequisite txid → orphans waiting on it.
    dependents: HashMap<String, HashSet<String>>,
}

impl OrphanPool {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `txid` as waiting on `missing`. Replaces any previous record
    /// for the same orphan.
    pub fn register(&mut self, txid: &str, missing: impl IntoIterator<Item = String>) {
        let missing: HashSet<String> = missing.into_iter().collect();
        if missing.is_empty() {
            return;
        }
        for dep in &missing {
            self.dependents
                .entry(dep.clone())
                .or_default()
                .insert(txid.to_string());
        }
        self.deps.insert(txid.to_string(), missing);
    }

    /// Mark `txid` as now known and return every orphan whose missing set
    /// just became empty, ready to be scheduled for import.
    pub fn resolve(&mut self, txid: &str) -> Vec<String> {
        let Some(waiting) = self.dependents.remove(txid) else {
            return Vec::new();
        };

        let mut ready = Vec::new();
        for orphan in waiting {
            let Some(deps) = self.deps.get_mut(&orphan) else {
                continue;
            };
            deps.remove(txid);
            if deps.is_empty() {
                self.deps.remove(&orphan);
                ready.push(orphan);
            }
        }
        ready.sort();
        ready
    }

    /// Returns `true` if `txid` is currently parked as an orphan.
    pub fn contains(&self, txid: &str) -> bool {
        self.deps.contains_key(txid)
    }

    /// Number of orphans currently waiting.
    pub fn len(&self) -> usize {
        self.deps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deps.is_empty()
    }
}
