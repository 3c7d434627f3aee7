//! SOCKS5 handshake engine
//!
//! Implements the inbound side of a SOCKS5 subset (RFC 1928): no-auth
//! negotiation and the CONNECT command with IPv4 and domain address types.
//!
//! # Protocol flow
//!
//! 1. Client sends the method-selection greeting; the server always selects
//!    no-authentication and replies `05 00` regardless of the offered
//!    methods.
//! 2. Client sends a CONNECT request. Unsupported commands and address
//!    types close the connection with no reply at all.
//! 3. The resolved target runs through the bypass policy; bypassed targets
//!    get `REP=0x02` (connection not allowed) and are never dialed.
//! 4. The upstream connect runs under a bounded timeout; failures also
//!    reply `REP=0x02` so the client fails fast.
//! 5. The success reply carries BND.ADDR=0.0.0.0 and BND.PORT set to the
//!    proxy's own listening port rather than the upstream socket's local
//!    endpoint; CONNECT clients ignore these fields.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::bypass::BypassPolicy;
use crate::error::HandshakeError;

/// SOCKS protocol version
pub const SOCKS5_VERSION: u8 = 0x05;
/// No-authentication method
pub const AUTH_METHOD_NONE: u8 = 0x00;
/// CONNECT command
pub const CMD_CONNECT: u8 = 0x01;
/// IPv4 address type
pub const ATYP_IPV4: u8 = 0x01;
/// Domain name address type
pub const ATYP_DOMAIN: u8 = 0x03;
/// Reply: succeeded
pub const REPLY_SUCCEEDED: u8 = 0x00;
/// Reply: connection not allowed (also used for failed upstream connects)
pub const REPLY_NOT_ALLOWED: u8 = 0x02;

/// Outcome of a completed SOCKS5 handshake
#[derive(Debug)]
pub struct Socks5Handshake {
    /// Connected upstream stream
    pub upstream: TcpStream,
    /// Resolved destination as `host:port`
    pub target: String,
}

/// Run the SOCKS5 handshake on an accepted client stream
///
/// On success the client has received the success reply and the returned
/// upstream stream is connected to the requested destination.
///
/// # Errors
///
/// - `UnsupportedVersion`, `UnsupportedCommand`, `UnsupportedAddressType`,
///   `Malformed`: the connection is closed without any reply bytes.
/// - `BypassRefused`, `UpstreamConnect`, `UpstreamTimeout`: a `REP=0x02`
///   reply has been written before the error is returned.
pub async fn handshake(
    client: &mut TcpStream,
    policy: &BypassPolicy,
    listen_port: u16,
    connect_timeout: Duration,
) -> Result<Socks5Handshake, HandshakeError> {
    // ========== Phase 1: Method selection ==========
    // Client: VER(1) NMETHODS(1) METHODS(0-255)
    let mut header = [0u8; 2];
    client
        .read_exact(&mut header)
        .await
        .map_err(|e| HandshakeError::malformed(format!("read greeting header: {e}")))?;

    let version = header[0];
    let nmethods = header[1] as usize;

    if version != SOCKS5_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }

    let mut methods = [0u8; 255];
    client
        .read_exact(&mut methods[..nmethods])
        .await
        .map_err(|e| HandshakeError::malformed(format!("read auth methods: {e}")))?;

    // No-auth is selected unconditionally; authenticated methods are out of
    // scope for this relay.
    client
        .write_all(&[SOCKS5_VERSION, AUTH_METHOD_NONE])
        .await?;

    // ========== Phase 2: Request ==========
    // Client: VER(1) CMD(1) RSV(1) ATYP(1) DST.ADDR(variable) DST.PORT(2)
    let mut request = [0u8; 4];
    client
        .read_exact(&mut request)
        .await
        .map_err(|e| HandshakeError::malformed(format!("read request header: {e}")))?;

    let version = request[0];
    let cmd = request[1];
    let atyp = request[3];

    if version != SOCKS5_VERSION {
        return Err(HandshakeError::UnsupportedVersion(version));
    }

    if cmd != CMD_CONNECT {
        // Closed with no reply; BIND and UDP-ASSOCIATE are unsupported.
        return Err(HandshakeError::UnsupportedCommand(cmd));
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client
                .read_exact(&mut octets)
                .await
                .map_err(|e| HandshakeError::malformed(format!("read ipv4 addr: {e}")))?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len_buf = [0u8; 1];
            client
                .read_exact(&mut len_buf)
                .await
                .map_err(|e| HandshakeError::malformed(format!("read domain len: {e}")))?;
            let domain_len = len_buf[0] as usize;
            if domain_len == 0 {
                return Err(HandshakeError::malformed("zero-length domain"));
            }

            let mut domain = vec![0u8; domain_len];
            client
                .read_exact(&mut domain)
                .await
                .map_err(|e| HandshakeError::malformed(format!("read domain: {e}")))?;
            String::from_utf8(domain)
                .map_err(|_| HandshakeError::malformed("domain is not valid UTF-8"))?
        }
        other => {
            // Closed with no reply; IPv6 requests are unsupported.
            return Err(HandshakeError::UnsupportedAddressType(other));
        }
    };

    let mut port_buf = [0u8; 2];
    client
        .read_exact(&mut port_buf)
        .await
        .map_err(|e| HandshakeError::malformed(format!("read port: {e}")))?;
    let port = u16::from_be_bytes(port_buf);

    let target = format!("{host}:{port}");
    trace!(dest = %target, "SOCKS5 CONNECT request parsed");

    // ========== Phase 3: Bypass check ==========
    if policy.should_bypass(&host, port) {
        debug!(dest = %target, "SOCKS5 request refused by bypass policy");
        send_reply(client, REPLY_NOT_ALLOWED, 0).await?;
        return Err(HandshakeError::BypassRefused { target });
    }

    // ========== Phase 4: Upstream connect ==========
    let upstream = match tokio::time::timeout(
        connect_timeout,
        TcpStream::connect((host.as_str(), port)),
    )
    .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            send_reply(client, REPLY_NOT_ALLOWED, 0).await?;
            return Err(HandshakeError::upstream(target, e));
        }
        Err(_) => {
            send_reply(client, REPLY_NOT_ALLOWED, 0).await?;
            return Err(HandshakeError::UpstreamTimeout {
                target,
                timeout_secs: connect_timeout.as_secs(),
            });
        }
    };

    // Success reply echoes the proxy's own listening port as BND.PORT.
    send_reply(client, REPLY_SUCCEEDED, listen_port).await?;

    Ok(Socks5Handshake { upstream, target })
}

/// Write a SOCKS5 reply: VER REP RSV ATYP=IPv4 BND.ADDR=0.0.0.0 BND.PORT
async fn send_reply(
    stream: &mut TcpStream,
    reply: u8,
    bound_port: u16,
) -> Result<(), HandshakeError> {
    let port = bound_port.to_be_bytes();
    let buf = [
        SOCKS5_VERSION,
        reply,
        0x00,
        ATYP_IPV4,
        0,
        0,
        0,
        0,
        port[0],
        port[1],
    ];
    stream.write_all(&buf).await?;
    Ok(())
}
