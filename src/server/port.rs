//! Listener construction and dynamic port selection
//!
//! In cluster deployments several replicas may race for the same port
//! range, so the requested port is only a starting point: up to 10
//! sequential candidates are tried, then 5 random candidates in 9000-9999.
//! Each candidate is claimed by binding the real listening socket
//! directly; there is no probe-and-rebind window to race against.

use std::net::{IpAddr, SocketAddr};

use rand::Rng;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::TcpListener;
use tracing::{debug, info};

use crate::error::ListenError;

/// Sequential candidates tried from the requested port upward
const SEQUENTIAL_ATTEMPTS: u16 = 10;
/// Random candidates tried in the high range after the sequential sweep
const RANDOM_ATTEMPTS: u32 = 5;
/// High range for random candidates
const RANDOM_PORT_RANGE: std::ops::RangeInclusive<u16> = 9000..=9999;

/// Bind a listening socket on one candidate address
fn bind_listener(addr: SocketAddr, backlog: u32) -> Result<TcpListener, ListenError> {
    let domain = if addr.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::STREAM, Some(Protocol::TCP))
        .map_err(|e| ListenError::bind(addr, e.to_string()))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ListenError::bind(addr, e.to_string()))?;
    socket
        .bind(&addr.into())
        .map_err(|e| ListenError::bind(addr, e.to_string()))?;
    socket
        .listen(backlog as i32)
        .map_err(|e| ListenError::bind(addr, e.to_string()))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| ListenError::bind(addr, e.to_string()))?;

    let std_listener: std::net::TcpListener = socket.into();
    TcpListener::from_std(std_listener).map_err(|e| ListenError::bind(addr, e.to_string()))
}

/// Bind the listener, searching for a free port in cluster mode
///
/// Outside cluster mode the requested port is bound directly (port 0 maps
/// to an OS-assigned ephemeral port). The returned port is always read
/// back from the bound socket.
///
/// # Errors
///
/// `PortExhaustion` when every candidate fails in cluster mode; a plain
/// bind error otherwise.
pub(crate) fn bind_with_search(
    host: IpAddr,
    requested: u16,
    cluster_mode: bool,
    backlog: u32,
) -> Result<(TcpListener, u16), ListenError> {
    if !cluster_mode {
        let listener = bind_listener(SocketAddr::new(host, requested), backlog)?;
        let actual = listener.local_addr()?.port();
        return Ok((listener, actual));
    }

    for offset in 0..SEQUENTIAL_ATTEMPTS {
        let Some(port) = requested.checked_add(offset) else {
            break;
        };
        match bind_listener(SocketAddr::new(host, port), backlog) {
            Ok(listener) => {
                let actual = listener.local_addr()?.port();
                if actual != requested {
                    info!("Requested port {} busy, bound {}", requested, actual);
                }
                return Ok((listener, actual));
            }
            Err(e) => {
                debug!("Port {} is not available: {}", port, e);
            }
        }
    }

    let mut rng = rand::thread_rng();
    for _ in 0..RANDOM_ATTEMPTS {
        let port = rng.gen_range(RANDOM_PORT_RANGE);
        match bind_listener(SocketAddr::new(host, port), backlog) {
            Ok(listener) => {
                let actual = listener.local_addr()?.port();
                info!("Bound random high-range port {}", actual);
                return Ok((listener, actual));
            }
            Err(e) => {
                debug!("Random port {} is not available: {}", port, e);
            }
        }
    }

    Err(ListenError::PortExhaustion {
        start_port: requested,
        sequential: u32::from(SEQUENTIAL_ATTEMPTS),
        random: RANDOM_ATTEMPTS,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn localhost() -> IpAddr {
        "127.0.0.1".parse().unwrap()
    }

    #[tokio::test]
    async fn test_direct_bind_ephemeral() {
        let (listener, actual) = bind_with_search(localhost(), 0, false, 5).unwrap();
        assert_ne!(actual, 0);
        assert_eq!(listener.local_addr().unwrap().port(), actual);
    }

    #[tokio::test]
    async fn test_cluster_search_skips_busy_port() {
        // Occupy a port, then ask the search to start there.
        let (occupied, busy_port) = bind_with_search(localhost(), 0, false, 5).unwrap();

        let (listener, actual) = bind_with_search(localhost(), busy_port, true, 5).unwrap();
        assert_ne!(actual, busy_port);
        assert_eq!(listener.local_addr().unwrap().port(), actual);

        drop(occupied);
    }

    #[tokio::test]
    async fn test_direct_bind_fails_on_busy_port_outside_cluster_mode() {
        let (_occupied, busy_port) = bind_with_search(localhost(), 0, false, 5).unwrap();

        let result = bind_with_search(localhost(), busy_port, false, 5);
        assert!(matches!(result, Err(ListenError::BindError { .. })));
    }
}
