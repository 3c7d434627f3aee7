//! Live connection registry
//!
//! Tracks every accepted client connection from accept to handler exit.
//! Records are keyed by the client's `ip:port`, which is unique among live
//! TCP connections at any instant. Byte counters are updated by the relay
//! while stats snapshots read them concurrently, so counters are atomics
//! and the target is write-once.

pub mod stats;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, OnceLock};
use std::time::{SystemTime, UNIX_EPOCH};

use dashmap::DashMap;

pub use stats::{ConnectionSnapshot, ProxyStats, RegistrySnapshot};

/// Lifecycle of a tracked connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum LifecycleState {
    /// Accepted, handshake in progress, no target yet
    Handshaking = 0,
    /// Target resolved and upstream connected
    Connected = 1,
    /// Handler exited, record removed from the registry
    Closed = 2,
}

impl LifecycleState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => Self::Handshaking,
            1 => Self::Connected,
            _ => Self::Closed,
        }
    }
}

/// A single tracked connection
///
/// Shared between the connection handler (which writes counters and the
/// target) and stats snapshots (which only read).
#[derive(Debug)]
pub struct ConnectionRecord {
    id: String,
    start_time_ms: u64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    target: OnceLock<String>,
    state: AtomicU8,
}

impl ConnectionRecord {
    fn new(id: String) -> Self {
        let start_time_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;

        Self {
            id,
            start_time_ms,
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            target: OnceLock::new(),
            state: AtomicU8::new(LifecycleState::Handshaking as u8),
        }
    }

    /// The registry key: client `ip:port`
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Unix timestamp (milliseconds) at which the client was accepted
    #[must_use]
    pub fn start_time_ms(&self) -> u64 {
        self.start_time_ms
    }

    /// Record bytes relayed client → upstream
    pub fn add_bytes_sent(&self, bytes: u64) {
        self.bytes_sent.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Record bytes relayed upstream → client
    pub fn add_bytes_received(&self, bytes: u64) {
        self.bytes_received.fetch_add(bytes, Ordering::Relaxed);
    }

    /// Bytes relayed client → upstream so far
    #[must_use]
    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    /// Bytes relayed upstream → client so far
    #[must_use]
    pub fn bytes_received(&self) -> u64 {
        self.bytes_received.load(Ordering::Relaxed)
    }

    /// Mark the resolved destination and transition to `Connected`
    ///
    /// The target is write-once; a second call leaves the first value in
    /// place.
    pub fn set_connected(&self, target: String) {
        let _ = self.target.set(target);
        self.state
            .store(LifecycleState::Connected as u8, Ordering::Release);
    }

    /// The resolved destination, if the handshake got that far
    #[must_use]
    pub fn target(&self) -> Option<&str> {
        self.target.get().map(String::as_str)
    }

    /// Current lifecycle state
    #[must_use]
    pub fn state(&self) -> LifecycleState {
        LifecycleState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn mark_closed(&self) {
        self.state
            .store(LifecycleState::Closed as u8, Ordering::Release);
    }

    /// Point-in-time view of this record
    #[must_use]
    pub fn snapshot(&self) -> ConnectionSnapshot {
        ConnectionSnapshot {
            id: self.id.clone(),
            target: self.target.get().cloned(),
            bytes_sent: self.bytes_sent(),
            bytes_received: self.bytes_received(),
            start_time_ms: self.start_time_ms,
        }
    }
}

/// Concurrent store of live connection records
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    connections: DashMap<String, Arc<ConnectionRecord>>,
}

impl ConnectionRegistry {
    /// Create an empty registry
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a newly accepted client connection
    ///
    /// The returned record starts in `Handshaking` with zero counters and
    /// no target.
    #[must_use]
    pub fn register(&self, peer_addr: SocketAddr) -> Arc<ConnectionRecord> {
        let id = peer_addr.to_string();
        let record = Arc::new(ConnectionRecord::new(id.clone()));
        self.connections.insert(id, Arc::clone(&record));
        record
    }

    /// Remove a record; called exactly once when its handler exits
    pub fn remove(&self, id: &str) -> Option<Arc<ConnectionRecord>> {
        self.connections.remove(id).map(|(_, record)| {
            record.mark_closed();
            record
        })
    }

    /// Number of live records
    #[must_use]
    pub fn len(&self) -> usize {
        self.connections.len()
    }

    /// Check whether no connections are tracked
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Consistent snapshot of all live records
    ///
    /// The aggregate byte total is computed from the same per-record values
    /// that populate the list, so the total always equals the sum over the
    /// listed entries.
    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let mut connections = Vec::with_capacity(self.connections.len());
        let mut total_bytes = 0u64;

        for entry in self.connections.iter() {
            let snap = entry.value().snapshot();
            total_bytes = total_bytes
                .saturating_add(snap.bytes_sent)
                .saturating_add(snap.bytes_received);
            connections.push(snap);
        }

        RegistrySnapshot {
            total_connections: connections.len(),
            total_bytes,
            connections,
        }
    }
}
