//! Bypass policy for destinations the proxy must never relay
//!
//! Relaying traffic to the proxy's own control plane or to co-located
//! services would create a self-referential loop (client → proxy → proxy's
//! own API → proxy …). The policy is a pure predicate over an immutable set
//! built once at server startup:
//!
//! - loopback names (`localhost`, `127.0.0.1`, `::1`)
//! - the management API endpoints on loopback
//! - cluster-internal service names (cluster mode only)
//! - extra entries from configuration / `PROXY_BYPASS_HOSTS`
//!
//! In addition to set membership, any destination on the management API
//! port or on a well-known frontend port (80, 3000 by default) is bypassed
//! regardless of host.

use std::collections::BTreeSet;

use tracing::info;

use crate::config::BypassConfig;

/// Immutable bypass predicate for one server instance
#[derive(Debug, Clone)]
pub struct BypassPolicy {
    hosts: BTreeSet<String>,
    management_port: u16,
    frontend_ports: Vec<u16>,
}

impl BypassPolicy {
    /// Build the policy from configuration
    ///
    /// `cluster_mode` controls whether the cluster-internal service names
    /// are seeded into the set.
    #[must_use]
    pub fn from_config(config: &BypassConfig, cluster_mode: bool) -> Self {
        let mut hosts: BTreeSet<String> = BTreeSet::new();

        // Loopback matching is by name; 127.0.0.0/8 beyond 127.0.0.1 is
        // intentionally not swept in.
        hosts.insert("localhost".into());
        hosts.insert("127.0.0.1".into());
        hosts.insert("::1".into());

        hosts.insert(format!("127.0.0.1:{}", config.management_port));
        hosts.insert(format!("localhost:{}", config.management_port));

        if cluster_mode {
            hosts.extend(config.cluster_services.iter().cloned());
        }

        hosts.extend(
            config
                .hosts
                .iter()
                .map(|h| h.trim().to_string())
                .filter(|h| !h.is_empty()),
        );

        info!("Bypass set: {:?}", hosts);

        Self {
            hosts,
            management_port: config.management_port,
            frontend_ports: config.frontend_ports.clone(),
        }
    }

    /// Decide whether a destination must bypass the proxy
    ///
    /// Pure function over the policy's immutable state; no side effects.
    #[must_use]
    pub fn should_bypass(&self, host: &str, port: u16) -> bool {
        if host.is_empty() {
            return false;
        }

        if self.hosts.contains(host) {
            return true;
        }

        if self.hosts.contains(&format!("{host}:{port}")) {
            return true;
        }

        if port == self.management_port {
            return true;
        }

        self.frontend_ports.contains(&port)
    }

    /// The bypass set entries, sorted, for stats snapshots
    #[must_use]
    pub fn hosts(&self) -> Vec<String> {
        self.hosts.iter().cloned().collect()
    }
}
