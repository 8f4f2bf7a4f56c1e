// Relay counters, shared read-only with other threads.
//
// The loop thread is the only writer. `RelayHandle::stats()` and tests read a
// `StatsSnapshot`, which is also logged as JSON when the loop stops.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

#[derive(Debug, Default)]
pub struct RelayStats {
    connected: AtomicU64,
    accepted: AtomicU64,
    refused: AtomicU64,
    disconnected: AtomicU64,
    bytes_received: AtomicU64,
    deliveries: AtomicU64,
    delivery_failures: AtomicU64,
}

impl RelayStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn connection_opened(&self) {
        self.connected.fetch_add(1, Ordering::Relaxed);
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_refused(&self) {
        self.refused.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connection_closed(&self) {
        self.connected.fetch_sub(1, Ordering::Relaxed);
        self.disconnected.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn bytes_received(&self, len: usize) {
        self.bytes_received.fetch_add(len as u64, Ordering::Relaxed);
    }

    pub(crate) fn delivered(&self, count: usize) {
        self.deliveries.fetch_add(count as u64, Ordering::Relaxed);
    }

    pub(crate) fn delivery_failed(&self, count: usize) {
        self.delivery_failures
            .fetch_add(count as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            connected: self.connected.load(Ordering::Relaxed),
            accepted: self.accepted.load(Ordering::Relaxed),
            refused: self.refused.load(Ordering::Relaxed),
            disconnected: self.disconnected.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            deliveries: self.deliveries.load(Ordering::Relaxed),
            delivery_failures: self.delivery_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time copy of `RelayStats`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatsSnapshot {
    /// Peers currently registered.
    pub connected: u64,
    /// Peers admitted since startup.
    pub accepted: u64,
    /// Connections closed at admission because the relay was full.
    pub refused: u64,
    /// Admitted peers that have since been torn down.
    pub disconnected: u64,
    pub bytes_received: u64,
    /// Payload copies handed to peers (written or queued).
    pub deliveries: u64,
    pub delivery_failures: u64,
}
