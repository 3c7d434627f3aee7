//! Configuration types for proxy-relay
//!
//! This module defines all configuration structures used by the relay.
//! Configuration is loaded from JSON files and validated at startup.

use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Which proxy protocol a server instance speaks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProtocolKind {
    /// SOCKS5 (RFC 1928 subset: no-auth, CONNECT only)
    Socks5,
    /// HTTP proxy (CONNECT tunnels and absolute/relative requests)
    Http,
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Socks5 => write!(f, "socks5"),
            Self::Http => write!(f, "http"),
        }
    }
}

impl FromStr for ProtocolKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "socks5" | "socks" => Ok(Self::Socks5),
            "http" => Ok(Self::Http),
            other => Err(ConfigError::ValidationError(format!(
                "Unknown protocol kind: {other} (expected 'socks5' or 'http')"
            ))),
        }
    }
}

/// Root configuration structure
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Listener and relay settings
    #[serde(default)]
    pub server: ServerConfig,

    /// Bypass policy settings
    #[serde(default)]
    pub bypass: BypassConfig,

    /// Logging configuration
    #[serde(default)]
    pub log: LogConfig,
}

impl Config {
    /// Validate the configuration
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::ValidationError` if validation fails.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.server.validate()?;
        self.bypass.validate()?;
        Ok(())
    }

    /// Create a minimal default configuration
    #[must_use]
    pub fn default_config() -> Self {
        Self::default()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            bypass: BypassConfig::default(),
            log: LogConfig::default(),
        }
    }
}

/// Listener and relay settings
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Bind address (e.g., "0.0.0.0")
    #[serde(default = "default_bind_host")]
    pub bind_host: IpAddr,

    /// Requested listen port; the bound port may differ in cluster mode
    /// (port 0 always maps to an OS-assigned ephemeral port)
    #[serde(default = "default_port")]
    pub port: u16,

    /// Proxy protocol spoken on the listener
    #[serde(default = "default_protocol")]
    pub protocol: ProtocolKind,

    /// TCP accept backlog
    #[serde(default = "default_backlog")]
    pub backlog: u32,

    /// Handshake timeout in seconds (covers the full handshake including
    /// the upstream connect)
    #[serde(default = "default_handshake_timeout_secs")]
    pub handshake_timeout_secs: u64,

    /// Upstream connect timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Relay chunk size in bytes
    #[serde(default = "default_relay_buffer_size")]
    pub relay_buffer_size: usize,

    /// Run with dynamic port search and cluster-internal bypass entries.
    /// `None` means auto-detect from `KUBERNETES_SERVICE_HOST`.
    #[serde(default)]
    pub cluster_mode: Option<bool>,

    /// Pod identity reported in stats snapshots. `None` means read from
    /// `HOSTNAME` at load time.
    #[serde(default)]
    pub pod_name: Option<String>,
}

impl ServerConfig {
    /// Validate listener configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.backlog == 0 {
            return Err(ConfigError::ValidationError(
                "backlog must be greater than 0".into(),
            ));
        }

        if self.relay_buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "relay_buffer_size must be greater than 0".into(),
            ));
        }

        if self.connect_timeout_secs == 0 {
            return Err(ConfigError::ValidationError(
                "connect_timeout_secs must be greater than 0".into(),
            ));
        }

        Ok(())
    }

    /// Get the handshake timeout as a Duration
    #[must_use]
    pub const fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    /// Get the upstream connect timeout as a Duration
    #[must_use]
    pub const fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_host: default_bind_host(),
            port: default_port(),
            protocol: default_protocol(),
            backlog: default_backlog(),
            handshake_timeout_secs: default_handshake_timeout_secs(),
            connect_timeout_secs: default_connect_timeout_secs(),
            relay_buffer_size: default_relay_buffer_size(),
            cluster_mode: None,
            pod_name: None,
        }
    }
}

/// Bypass policy settings
///
/// The effective bypass set is built once at startup from these values:
/// loopback defaults, the management API endpoints, cluster service names
/// (cluster mode only), and any extra entries supplied here or via the
/// `PROXY_BYPASS_HOSTS` environment variable.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BypassConfig {
    /// Extra bypass entries: bare hosts or "host:port" pairs
    #[serde(default)]
    pub hosts: Vec<String>,

    /// Management API port; any destination on this port is bypassed
    #[serde(default = "default_management_port")]
    pub management_port: u16,

    /// Well-known frontend ports; any destination on these ports is bypassed
    #[serde(default = "default_frontend_ports")]
    pub frontend_ports: Vec<u16>,

    /// Cluster-internal service names added to the set in cluster mode
    #[serde(default = "default_cluster_services")]
    pub cluster_services: Vec<String>,
}

impl BypassConfig {
    /// Validate bypass configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.management_port == 0 {
            return Err(ConfigError::ValidationError(
                "management_port must be greater than 0".into(),
            ));
        }

        for entry in &self.hosts {
            if entry.trim().is_empty() {
                return Err(ConfigError::ValidationError(
                    "bypass hosts must not contain empty entries".into(),
                ));
            }
        }

        Ok(())
    }
}

impl Default for BypassConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            management_port: default_management_port(),
            frontend_ports: default_frontend_ports(),
            cluster_services: default_cluster_services(),
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: "text" or "json"
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Include the emitting module target in log lines
    #[serde(default)]
    pub target: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
            target: false,
        }
    }
}

fn default_bind_host() -> IpAddr {
    "0.0.0.0".parse().expect("static address")
}

const fn default_port() -> u16 {
    8888
}

const fn default_protocol() -> ProtocolKind {
    ProtocolKind::Http
}

const fn default_backlog() -> u32 {
    5
}

const fn default_handshake_timeout_secs() -> u64 {
    10
}

const fn default_connect_timeout_secs() -> u64 {
    10
}

const fn default_relay_buffer_size() -> usize {
    4096
}

const fn default_management_port() -> u16 {
    5000
}

fn default_frontend_ports() -> Vec<u16> {
    vec![80, 3000]
}

fn default_cluster_services() -> Vec<String> {
    vec![
        "backend-service".into(),
        "backend-service:5000".into(),
        "frontend-service".into(),
        "frontend-service:80".into(),
        "backend-service.vpn-proxy.svc.cluster.local".into(),
        "frontend-service.vpn-proxy.svc.cluster.local".into(),
    ]
}

fn default_log_level() -> String {
    "info".into()
}

fn default_log_format() -> String {
    "text".into()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = Config::default_config();
        assert!(config.validate().is_ok());
        assert_eq!(config.server.port, 8888);
        assert_eq!(config.server.backlog, 5);
        assert_eq!(config.server.relay_buffer_size, 4096);
        assert_eq!(config.bypass.management_port, 5000);
        assert_eq!(config.bypass.frontend_ports, vec![80, 3000]);
    }

    #[test]
    fn test_protocol_kind_parsing() {
        assert_eq!("socks5".parse::<ProtocolKind>().unwrap(), ProtocolKind::Socks5);
        assert_eq!("HTTP".parse::<ProtocolKind>().unwrap(), ProtocolKind::Http);
        assert!("ftp".parse::<ProtocolKind>().is_err());
        assert_eq!(ProtocolKind::Socks5.to_string(), "socks5");
    }

    #[test]
    fn test_validation_rejects_zero_backlog() {
        let mut config = Config::default_config();
        config.server.backlog = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_rejects_empty_bypass_entry() {
        let mut config = Config::default_config();
        config.bypass.hosts.push("  ".into());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_timeouts_as_durations() {
        let config = ServerConfig::default();
        assert_eq!(config.handshake_timeout(), Duration::from_secs(10));
        assert_eq!(config.connect_timeout(), Duration::from_secs(10));
    }
}
