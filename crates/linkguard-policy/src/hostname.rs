//! Virtual-host name pattern index.
//!
//! Operators may configure vhosts as patterns (`*.example.com`, `#.corp`).
//! An incoming Open hostname is mapped to the best-matching configured
//! pattern before the identity authority is consulted.
//!
//! One exclusive lock guards every operation; it is held only for the tree
//! call itself.

use std::sync::{Mutex, MutexGuard};

use linkguard_core::pattern_tree::normalize;
use linkguard_core::PatternTree;

/// A payload the index refused to take, handed back to the caller.
#[derive(Debug)]
pub struct PatternRejected<T> {
    /// The pattern as given to `add`.
    pub pattern: String,
    /// Normalized form of the pattern already holding the slot, or `None`
    /// if the index was unusable.
    pub existing: Option<String>,
    payload: T,
}

impl<T> PatternRejected<T> {
    pub fn into_payload(self) -> T {
        self.payload
    }
}

/// Thread-safe longest-match index of hostname patterns to payloads.
pub struct HostnamePatternIndex<T> {
    tree: Mutex<PatternTree<T>>,
}

impl<T> Default for HostnamePatternIndex<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> HostnamePatternIndex<T> {
    pub fn new() -> Self {
        Self {
            tree: Mutex::new(PatternTree::new()),
        }
    }

    // Poisoned mutex means a logic bug; callers treat it as "no index".
    fn locked(&self) -> Option<MutexGuard<'_, PatternTree<T>>> {
        self.tree.lock().ok()
    }

    /// Store `payload` under `pattern`. An equivalent pattern already present
    /// keeps its payload; the new one is returned inside the error.
    pub fn add(&self, pattern: &str, payload: T) -> Result<(), PatternRejected<T>> {
        let Some(mut tree) = self.locked() else {
            return Err(PatternRejected {
                pattern: pattern.to_string(),
                existing: None,
                payload,
            });
        };
        match tree.add(pattern, payload) {
            Ok(()) => Ok(()),
            Err(payload) => {
                drop(tree);
                let existing = Some(normalize(pattern));
                tracing::warn!(
                    pattern = %pattern,
                    existing = ?existing,
                    "vhost hostname pattern failed to replace optimized pattern"
                );
                Err(PatternRejected {
                    pattern: pattern.to_string(),
                    existing,
                    payload,
                })
            }
        }
    }

    /// Take the payload stored under exactly `pattern`.
    pub fn remove(&self, pattern: &str) -> Option<T> {
        let removed = self.locked()?.remove(pattern);
        if removed.is_none() {
            tracing::warn!(pattern = %pattern, "vhost hostname pattern for removal not found");
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.locked().map_or(0, |t| t.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T: Clone> HostnamePatternIndex<T> {
    /// Payload of the best pattern matching `hostname`.
    pub fn lookup(&self, hostname: &str) -> Option<T> {
        let found = self
            .locked()
            .and_then(|t| t.retrieve(hostname).map(|(_, v)| v.clone()));
        tracing::trace!(hostname = %hostname, matched = found.is_some(), "vhost hostname pattern lookup");
        found
    }
}
