//! Traffic statistics snapshot types
//!
//! Snapshots are plain serializable values handed to external consumers
//! (dashboard/API layer); nothing here holds locks or live references.

use serde::{Deserialize, Serialize};

/// Point-in-time view of one live connection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSnapshot {
    /// Registry key: client `ip:port`
    pub id: String,
    /// Resolved destination `host:port`, absent while handshaking
    pub target: Option<String>,
    /// Bytes relayed client → upstream
    pub bytes_sent: u64,
    /// Bytes relayed upstream → client
    pub bytes_received: u64,
    /// Unix timestamp (milliseconds) of the accept
    pub start_time_ms: u64,
}

impl ConnectionSnapshot {
    /// Total bytes relayed in both directions
    #[must_use]
    pub const fn total_bytes(&self) -> u64 {
        self.bytes_sent + self.bytes_received
    }
}

/// Registry-level snapshot: the live connection list plus its aggregate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegistrySnapshot {
    /// Number of live connections
    pub total_connections: usize,
    /// Sum of both byte counters over the listed connections
    pub total_bytes: u64,
    /// Per-connection views, taken in the same pass as the total
    pub connections: Vec<ConnectionSnapshot>,
}

/// Full server statistics snapshot for external consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyStats {
    /// Number of live connections
    pub total_connections: usize,
    /// Sum of both byte counters over `active_connections`
    pub total_bytes: u64,
    /// Per-connection views
    pub active_connections: Vec<ConnectionSnapshot>,
    /// The port the listener is actually bound to
    pub actual_port: u16,
    /// Whether dynamic port search / cluster bypass entries are active
    pub cluster_mode: bool,
    /// Pod identity (from `HOSTNAME` in cluster deployments)
    pub pod_name: String,
    /// The configured bypass set, sorted
    pub bypass_hosts: Vec<String>,
}

impl ProxyStats {
    /// Compose the full snapshot from a registry snapshot and server state
    #[must_use]
    pub fn from_registry(
        registry: RegistrySnapshot,
        actual_port: u16,
        cluster_mode: bool,
        pod_name: String,
        bypass_hosts: Vec<String>,
    ) -> Self {
        Self {
            total_connections: registry.total_connections,
            total_bytes: registry.total_bytes,
            active_connections: registry.connections,
            actual_port,
            cluster_mode,
            pod_name,
            bypass_hosts,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_snapshot_total() {
        let snap = ConnectionSnapshot {
            id: "10.0.0.1:55000".into(),
            target: Some("example.com:443".into()),
            bytes_sent: 100,
            bytes_received: 250,
            start_time_ms: 1_700_000_000_000,
        };
        assert_eq!(snap.total_bytes(), 350);
    }

    #[test]
    fn test_proxy_stats_serializes() {
        let stats = ProxyStats::from_registry(
            RegistrySnapshot {
                total_connections: 0,
                total_bytes: 0,
                connections: vec![],
            },
            8888,
            false,
            "unknown-pod".into(),
            vec!["localhost".into()],
        );

        let json = serde_json::to_string(&stats).unwrap();
        assert!(json.contains("\"actual_port\":8888"));
        assert!(json.contains("\"active_connections\":[]"));
        assert!(json.contains("\"pod_name\":\"unknown-pod\""));
    }
}
