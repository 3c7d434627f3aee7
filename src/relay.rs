//! Bidirectional relay pump
//!
//! Copies bytes between an accepted client stream and its connected
//! upstream until either side closes, an I/O error occurs, or the server
//! signals shutdown. Each chunk is written in full (`write_all`), so a
//! short write can never silently drop data.
//!
//! Byte accounting goes to the shared [`ConnectionRecord`] as the data
//! moves: client → upstream increments `bytes_sent`, upstream → client
//! increments `bytes_received`. Stats snapshots therefore observe live
//! counters, not end-of-connection totals.

use std::io;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::watch;
use tracing::trace;

use crate::registry::ConnectionRecord;

/// Pump data between client and upstream until EOF, error, or shutdown
///
/// Both sockets are closed on every exit path (graceful shutdown of the
/// write halves, then drop).
///
/// # Errors
///
/// Returns the first read or write error from either side. A clean EOF on
/// either side is not an error.
pub async fn pump(
    client: TcpStream,
    upstream: TcpStream,
    record: &ConnectionRecord,
    mut shutdown: watch::Receiver<bool>,
    buffer_size: usize,
) -> io::Result<()> {
    let (mut client_read, mut client_write) = client.into_split();
    let (mut upstream_read, mut upstream_write) = upstream.into_split();

    let mut client_buf = vec![0u8; buffer_size];
    let mut upstream_buf = vec![0u8; buffer_size];

    let result = loop {
        tokio::select! {
            res = client_read.read(&mut client_buf) => {
                let n = match res {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = upstream_write.write_all(&client_buf[..n]).await {
                    break Err(e);
                }
                record.add_bytes_sent(n as u64);
                trace!(id = record.id(), bytes = n, "client -> upstream");
            }
            res = upstream_read.read(&mut upstream_buf) => {
                let n = match res {
                    Ok(0) => break Ok(()),
                    Ok(n) => n,
                    Err(e) => break Err(e),
                };
                if let Err(e) = client_write.write_all(&upstream_buf[..n]).await {
                    break Err(e);
                }
                record.add_bytes_received(n as u64);
                trace!(id = record.id(), bytes = n, "upstream -> client");
            }
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    trace!(id = record.id(), "relay stopping on shutdown signal");
                    break Ok(());
                }
            }
        }
    };

    let _ = upstream_write.shutdown().await;
    let _ = client_write.shutdown().await;

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::net::SocketAddr;
    use std::time::Duration;

    use tokio::net::TcpListener;

    use crate::registry::ConnectionRegistry;

    async fn tcp_pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let a = TcpStream::connect(addr).await.unwrap();
        let (b, _) = listener.accept().await.unwrap();
        (a, b)
    }

    fn test_record() -> (ConnectionRegistry, std::sync::Arc<ConnectionRecord>) {
        let registry = ConnectionRegistry::new();
        let peer: SocketAddr = "127.0.0.1:50000".parse().unwrap();
        let record = registry.register(peer);
        (registry, record)
    }

    #[tokio::test]
    async fn test_pump_both_directions_and_counters() {
        let (client_far, client_near) = tcp_pair().await;
        let (upstream_near, upstream_far) = tcp_pair().await;
        let (_registry, record) = test_record();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump_record = std::sync::Arc::clone(&record);
        let pump_task = tokio::spawn(async move {
            pump(client_near, upstream_near, &pump_record, shutdown_rx, 4096).await
        });

        let (mut client_far, mut upstream_far) = (client_far, upstream_far);

        // client -> upstream
        client_far.write_all(b"hello upstream").await.unwrap();
        let mut buf = [0u8; 14];
        upstream_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello upstream");

        // upstream -> client
        upstream_far.write_all(b"hi back").await.unwrap();
        let mut buf = [0u8; 7];
        client_far.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi back");

        // Closing the client ends the pump.
        drop(client_far);
        pump_task.await.unwrap().unwrap();

        assert_eq!(record.bytes_sent(), 14);
        assert_eq!(record.bytes_received(), 7);
    }

    #[tokio::test]
    async fn test_pump_stops_on_shutdown_signal() {
        let (client_far, client_near) = tcp_pair().await;
        let (upstream_near, upstream_far) = tcp_pair().await;
        let (_registry, record) = test_record();
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump_record = std::sync::Arc::clone(&record);
        let pump_task = tokio::spawn(async move {
            pump(client_near, upstream_near, &pump_record, shutdown_rx, 4096).await
        });

        // Neither side sends anything; the pump is parked on reads.
        shutdown_tx.send(true).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(1), pump_task)
            .await
            .expect("pump must observe the shutdown signal promptly")
            .unwrap();
        assert!(result.is_ok());

        drop(client_far);
        drop(upstream_far);
    }

    #[tokio::test]
    async fn test_pump_closes_upstream_when_client_closes() {
        let (client_far, client_near) = tcp_pair().await;
        let (upstream_near, mut upstream_far) = tcp_pair().await;
        let (_registry, record) = test_record();
        let (_shutdown_tx, shutdown_rx) = watch::channel(false);

        let pump_record = std::sync::Arc::clone(&record);
        let pump_task = tokio::spawn(async move {
            pump(client_near, upstream_near, &pump_record, shutdown_rx, 4096).await
        });

        drop(client_far);
        pump_task.await.unwrap().unwrap();

        // Upstream sees EOF once the pump exits.
        let mut buf = [0u8; 1];
        let n = tokio::time::timeout(Duration::from_secs(1), upstream_far.read(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(n, 0);
    }
}
