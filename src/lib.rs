//! proxy-relay: dual-protocol forward proxy relay
//!
//! This crate provides a SOCKS5 and HTTP forward-proxy relay with a bypass
//! policy that keeps the proxy from relaying traffic to its own control
//! plane, plus live per-connection and aggregate traffic statistics.
//!
//! # Features
//!
//! - **SOCKS5 inbound**: no-auth negotiation, CONNECT with IPv4 and domain
//!   targets
//! - **HTTP inbound**: CONNECT tunnels and absolute/relative proxy
//!   requests with request-line rewriting
//! - **Bypass policy**: loopback, management-plane, and cluster-internal
//!   destinations are refused instead of relayed
//! - **Dynamic port selection**: sequential then random port search for
//!   clustered deployments
//! - **Connection registry**: live byte counters and consistent stats
//!   snapshots for external dashboards
//!
//! # Architecture
//!
//! ```text
//! Client → ProxyServer accept loop → handshake (SOCKS5 | HTTP)
//!                                        ↓
//!                                  bypass check
//!                                        ↓
//!                                 upstream connect
//!                                        ↓
//!                            relay pump ⇄ ConnectionRegistry
//! ```
//!
//! # Quick Start
//!
//! ```no_run
//! use proxy_relay::config::Config;
//! use proxy_relay::server::ProxyServer;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::default_config();
//! let server = ProxyServer::new(config);
//!
//! let actual_port = server.start().await?;
//! println!("proxy listening on port {actual_port}");
//!
//! // ... later
//! server.stop().await;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`bypass`]: bypass policy predicate
//! - [`config`]: configuration types and loading
//! - [`error`]: error types
//! - [`http`]: HTTP proxy handshake engine
//! - [`registry`]: connection registry and statistics
//! - [`relay`]: bidirectional relay pump
//! - [`server`]: proxy server orchestration
//! - [`socks5`]: SOCKS5 handshake engine

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod bypass;
pub mod config;
pub mod error;
pub mod http;
pub mod registry;
pub mod relay;
pub mod server;
pub mod socks5;

// Re-export commonly used types at the crate root
pub use bypass::BypassPolicy;
pub use config::{Config, ProtocolKind};
pub use error::{ConfigError, ConnectionError, HandshakeError, ListenError, ProxyError};
pub use registry::{ConnectionRegistry, ConnectionSnapshot, ProxyStats};
pub use server::ProxyServer;

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
