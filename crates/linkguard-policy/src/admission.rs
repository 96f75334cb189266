//! Global connection admission (socket level, no identity).
//!
//! Every accepted socket is counted against `max_connections` before any AMQP
//! frame is read. There is no channel for an error condition at this point:
//! a refused socket is simply closed by the caller.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use serde::Serialize;

/// Counters exposed to management consumers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionSnapshot {
    pub connections_processed: u64,
    pub connections_denied: u64,
    pub connections_current: u64,
}

/// Process-wide connection gate. Construct once at startup and share via Arc;
/// tests build their own instances.
#[derive(Debug)]
pub struct AdmissionGate {
    max_connections: u64,
    stats: Mutex<AdmissionSnapshot>,
}

impl AdmissionGate {
    pub fn new(max_connections: u32) -> Self {
        Self {
            max_connections: u64::from(max_connections),
            stats: Mutex::new(AdmissionSnapshot::default()),
        }
    }

    pub fn max_connections(&self) -> u64 {
        self.max_connections
    }

    // Plain counters: a poisoned lock still holds consistent values.
    fn stats(&self) -> MutexGuard<'_, AdmissionSnapshot> {
        self.stats.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Count one accepted socket. Returns false when the gate is full.
    pub fn try_admit(&self, remote_host: &str) -> bool {
        let mut s = self.stats();
        s.connections_processed += 1;
        if s.connections_current < self.max_connections {
            s.connections_current += 1;
            tracing::trace!(rhost = %remote_host, current = s.connections_current, "ALLOW connection by global count");
            true
        } else {
            s.connections_denied += 1;
            tracing::info!(rhost = %remote_host, current = s.connections_current, "DENY connection by global count");
            false
        }
    }

    /// Release one previously admitted socket.
    ///
    /// # Panics
    /// If nothing is admitted; that is a lifecycle bug in the caller.
    pub fn release(&self) {
        let mut s = self.stats();
        assert!(s.connections_current > 0, "admission release without a matching admit");
        s.connections_current -= 1;
    }

    /// Admit and wrap the slot in a permit that releases it on drop.
    pub fn admit(self: &Arc<Self>, remote_host: &str) -> Option<AdmissionPermit> {
        self.try_admit(remote_host).then(|| AdmissionPermit {
            gate: Arc::clone(self),
        })
    }

    pub fn snapshot(&self) -> AdmissionSnapshot {
        *self.stats()
    }
}

/// RAII guard for one admitted connection.
#[derive(Debug)]
pub struct AdmissionPermit {
    gate: Arc<AdmissionGate>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.gate.release();
    }
}
