//! Proxy server orchestration
//!
//! [`ProxyServer`] owns the listening socket and the accept loop, wires
//! each accepted connection through the protocol handshake and the relay,
//! and exposes lifecycle and statistics accessors to external consumers
//! (CLI, dashboard/API layer).
//!
//! # Architecture
//!
//! ```text
//! ProxyServer::start
//!       |
//!       v
//! bind (+ port search in cluster mode) --> accept loop (one task)
//!                                               |
//!                                one task per connection
//!                                               |
//!                          handshake (SOCKS5 or HTTP, bypass check)
//!                                               |
//!                                       relay pump <---- shutdown watch
//!                                               |
//!                                   registry entry removed
//! ```
//!
//! `stop()` signals the watch channel: the accept loop exits (closing the
//! listener), and every in-flight relay observes the signal and winds down.
//! In-flight connections are never force-closed.

mod port;

use std::sync::atomic::{AtomicBool, AtomicU16, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::bypass::BypassPolicy;
use crate::config::{Config, ProtocolKind, ServerConfig};
use crate::error::{ConnectionError, HandshakeError, ProxyError};
use crate::registry::{ConnectionRecord, ConnectionRegistry, ProxyStats};
use crate::{http, relay, socks5};

/// Per-connection handler parameters shared by the accept loop
#[derive(Clone)]
struct HandlerContext {
    protocol: ProtocolKind,
    policy: Arc<BypassPolicy>,
    handshake_timeout: Duration,
    connect_timeout: Duration,
    buffer_size: usize,
    actual_port: u16,
}

/// Dual-protocol forward proxy server
pub struct ProxyServer {
    config: ServerConfig,
    cluster_mode: bool,
    pod_name: String,
    policy: Arc<BypassPolicy>,
    registry: Arc<ConnectionRegistry>,
    actual_port: AtomicU16,
    running: Arc<AtomicBool>,
    shutdown_tx: Mutex<watch::Sender<bool>>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyServer {
    /// Create a server from configuration; nothing is bound until
    /// [`start`](Self::start)
    #[must_use]
    pub fn new(config: Config) -> Self {
        let cluster_mode = config.server.cluster_mode.unwrap_or(false);
        let pod_name = config
            .server
            .pod_name
            .clone()
            .unwrap_or_else(|| "unknown-pod".into());
        let policy = Arc::new(BypassPolicy::from_config(&config.bypass, cluster_mode));
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            config: config.server,
            cluster_mode,
            pod_name,
            policy,
            registry: Arc::new(ConnectionRegistry::new()),
            actual_port: AtomicU16::new(0),
            running: Arc::new(AtomicBool::new(false)),
            shutdown_tx: Mutex::new(shutdown_tx),
            accept_task: Mutex::new(None),
        }
    }

    /// Bind the listener and spawn the accept loop
    ///
    /// Returns the actually bound port, which stays fixed until
    /// [`stop`](Self::stop). Calling `start` on a running server is a
    /// no-op returning the current port.
    ///
    /// # Errors
    ///
    /// Bind failures and `PortExhaustion` are the only errors surfaced
    /// here; everything that happens to individual connections later is
    /// contained in their handlers.
    pub async fn start(&self) -> Result<u16, ProxyError> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Ok(self.actual_port());
        }

        let (listener, actual) = match port::bind_with_search(
            self.config.bind_host,
            self.config.port,
            self.cluster_mode,
            self.config.backlog,
        ) {
            Ok(bound) => bound,
            Err(e) => {
                self.running.store(false, Ordering::SeqCst);
                return Err(e.into());
            }
        };

        self.actual_port.store(actual, Ordering::SeqCst);

        // Fresh shutdown channel for this run; receivers of a previous run
        // are already resolved.
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown_tx.lock().await = shutdown_tx;

        info!(
            "{} proxy server started on {}:{}",
            self.config.protocol, self.config.bind_host, actual
        );

        let ctx = HandlerContext {
            protocol: self.config.protocol,
            policy: Arc::clone(&self.policy),
            handshake_timeout: self.config.handshake_timeout(),
            connect_timeout: self.config.connect_timeout(),
            buffer_size: self.config.relay_buffer_size,
            actual_port: actual,
        };

        let registry = Arc::clone(&self.registry);
        let running = Arc::clone(&self.running);
        let handle = tokio::spawn(accept_loop(listener, ctx, registry, running, shutdown_rx));
        *self.accept_task.lock().await = Some(handle);

        Ok(actual)
    }

    /// Stop accepting and signal every in-flight relay to wind down
    ///
    /// The listening socket is closed before this returns. In-flight
    /// connections finish on their own after observing the signal;
    /// idempotent.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        let _ = self.shutdown_tx.lock().await.send(true);

        let handle = self.accept_task.lock().await.take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }

        info!("{} proxy server stopped", self.config.protocol);
    }

    /// Consistent statistics snapshot for external consumers
    #[must_use]
    pub fn stats(&self) -> ProxyStats {
        ProxyStats::from_registry(
            self.registry.snapshot(),
            self.actual_port(),
            self.cluster_mode,
            self.pod_name.clone(),
            self.policy.hosts(),
        )
    }

    /// The actually bound port (0 before the first successful start)
    #[must_use]
    pub fn actual_port(&self) -> u16 {
        self.actual_port.load(Ordering::SeqCst)
    }

    /// Whether the accept loop is live
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The protocol this server speaks
    #[must_use]
    pub fn protocol(&self) -> ProtocolKind {
        self.config.protocol
    }
}

/// Accept connections until the shutdown signal arrives
async fn accept_loop(
    listener: TcpListener,
    ctx: HandlerContext,
    registry: Arc<ConnectionRegistry>,
    running: Arc<AtomicBool>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer_addr)) => {
                        let record = registry.register(peer_addr);
                        debug!(peer = %peer_addr, "connection accepted");

                        let ctx = ctx.clone();
                        let registry = Arc::clone(&registry);
                        let shutdown_rx = shutdown_rx.clone();

                        tokio::spawn(async move {
                            let id = record.id().to_string();
                            let result =
                                handle_connection(stream, &record, &ctx, shutdown_rx).await;

                            match &result {
                                Ok(()) => debug!(
                                    id = %id,
                                    dest = record.target().unwrap_or("-"),
                                    sent = record.bytes_sent(),
                                    received = record.bytes_received(),
                                    "connection closed"
                                ),
                                Err(e) if e.is_refusal() => debug!(id = %id, "{e}"),
                                Err(e) => debug!(id = %id, error = %e, "connection ended"),
                            }

                            registry.remove(&id);
                        });
                    }
                    Err(e) => {
                        if running.load(Ordering::Relaxed) {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
            }
            res = shutdown_rx.changed() => {
                if res.is_err() || *shutdown_rx.borrow() {
                    info!("Accept loop stopping");
                    break;
                }
            }
        }
    }
    // Dropping the listener here closes the listening socket.
}

/// Run one connection: handshake, then relay until it ends
async fn handle_connection(
    mut stream: TcpStream,
    record: &ConnectionRecord,
    ctx: &HandlerContext,
    shutdown_rx: watch::Receiver<bool>,
) -> Result<(), ConnectionError> {
    stream.set_nodelay(true).map_err(HandshakeError::from)?;

    let handshake = tokio::time::timeout(ctx.handshake_timeout, async {
        match ctx.protocol {
            ProtocolKind::Socks5 => {
                socks5::handshake(&mut stream, &ctx.policy, ctx.actual_port, ctx.connect_timeout)
                    .await
                    .map(|h| (h.upstream, h.target))
            }
            ProtocolKind::Http => http::handshake(&mut stream, &ctx.policy, ctx.connect_timeout)
                .await
                .map(|h| (h.upstream, h.target)),
        }
    })
    .await;

    let (upstream, target) = match handshake {
        Ok(Ok(resolved)) => resolved,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => {
            return Err(ConnectionError::HandshakeTimeout {
                timeout_secs: ctx.handshake_timeout.as_secs(),
            })
        }
    };

    record.set_connected(target);

    relay::pump(stream, upstream, record, shutdown_rx, ctx.buffer_size)
        .await
        .map_err(ConnectionError::Relay)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config(protocol: ProtocolKind) -> Config {
        let mut config = Config::default_config();
        config.server.bind_host = "127.0.0.1".parse().unwrap();
        config.server.port = 0;
        config.server.protocol = protocol;
        config.server.cluster_mode = Some(false);
        config
    }

    #[tokio::test]
    async fn test_start_resolves_actual_port() {
        let server = ProxyServer::new(test_config(ProtocolKind::Http));
        assert_eq!(server.actual_port(), 0);
        assert!(!server.is_running());

        let actual = server.start().await.unwrap();
        assert_ne!(actual, 0);
        assert_eq!(server.actual_port(), actual);
        assert!(server.is_running());

        // Starting again is a no-op on the same port.
        let again = server.start().await.unwrap();
        assert_eq!(again, actual);

        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server = ProxyServer::new(test_config(ProtocolKind::Socks5));
        server.start().await.unwrap();

        server.stop().await;
        server.stop().await;
        assert!(!server.is_running());
    }

    #[tokio::test]
    async fn test_stats_shape() {
        let server = ProxyServer::new(test_config(ProtocolKind::Http));
        let actual = server.start().await.unwrap();

        let stats = server.stats();
        assert_eq!(stats.actual_port, actual);
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.total_bytes, 0);
        assert!(!stats.cluster_mode);
        assert!(stats.bypass_hosts.contains(&"localhost".to_string()));

        server.stop().await;
    }
}
