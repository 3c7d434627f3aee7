//! HTTP proxy handshake engine
//!
//! Implements the inbound side of an HTTP forward proxy:
//!
//! - **CONNECT tunnels**: `CONNECT host:port HTTP/1.1` is answered with
//!   `200 Connection established` and handed to the relay as an opaque
//!   byte tunnel. Bypassed targets still get the 200 but the connection is
//!   closed immediately so the client retries directly.
//! - **Plain requests**: absolute-URI targets (`GET http://host/path`) are
//!   rewritten to origin-relative form; relative targets resolve the
//!   destination from the `Host` header. The rewritten head and any
//!   already-buffered body bytes are forwarded verbatim before the relay
//!   takes over.
//!
//! Head bytes are accumulated until CRLFCRLF with a 64 KiB ceiling;
//! overflow and parse failures answer `400 Bad Request`, upstream connect
//! failures answer `502 Bad Gateway`, and bypassed plain requests answer
//! `502 Bypassed`.

use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, trace};

use crate::bypass::BypassPolicy;
use crate::error::HandshakeError;

/// Head accumulation ceiling
pub const MAX_HEAD_BYTES: usize = 64 * 1024;

/// Maximum number of headers parsed from a request head
const MAX_HEADERS: usize = 64;

const REPLY_ESTABLISHED: &[u8] = b"HTTP/1.1 200 Connection established\r\n\r\n";
const REPLY_BAD_REQUEST: &[u8] = b"HTTP/1.1 400 Bad Request\r\n\r\n";
const REPLY_BAD_GATEWAY: &[u8] = b"HTTP/1.1 502 Bad Gateway\r\n\r\n";
const REPLY_BYPASSED: &[u8] = b"HTTP/1.1 502 Bypassed\r\n\r\n";

/// Outcome of a completed HTTP handshake
#[derive(Debug)]
pub struct HttpHandshake {
    /// Connected upstream stream; for plain requests the rewritten request
    /// bytes have already been written to it
    pub upstream: TcpStream,
    /// Resolved destination as `host:port`
    pub target: String,
}

/// Run the HTTP proxy handshake on an accepted client stream
///
/// # Errors
///
/// Request errors (`BadRequest`, `RequestTooLarge`, `MissingHostHeader`),
/// `BypassRefused`, and upstream connect failures are returned after the
/// protocol-appropriate reply has been written. A client that disappears
/// mid-head yields `Malformed` with no reply.
pub async fn handshake(
    client: &mut TcpStream,
    policy: &BypassPolicy,
    connect_timeout: Duration,
) -> Result<HttpHandshake, HandshakeError> {
    let (buf, head_end) = read_head(client).await?;

    let line_end = match find_crlf(&buf) {
        Some(pos) => pos,
        None => {
            client.write_all(REPLY_BAD_REQUEST).await?;
            return Err(HandshakeError::bad_request("missing request line"));
        }
    };

    let request_line = match std::str::from_utf8(&buf[..line_end]) {
        Ok(line) => line,
        Err(_) => {
            client.write_all(REPLY_BAD_REQUEST).await?;
            return Err(HandshakeError::bad_request("request line is not UTF-8"));
        }
    };

    let Some((method, target, version)) = parse_request_line(request_line) else {
        client.write_all(REPLY_BAD_REQUEST).await?;
        return Err(HandshakeError::bad_request(format!(
            "malformed request line: {request_line:?}"
        )));
    };

    trace!(method, target, version, "HTTP request line parsed");

    if method == "CONNECT" {
        handle_connect(client, policy, connect_timeout, target, &buf[head_end..]).await
    } else {
        handle_plain(
            client,
            policy,
            connect_timeout,
            method,
            target,
            version,
            &buf,
            line_end,
        )
        .await
    }
}

/// CONNECT tunnel: reply 200 and hand the raw streams to the relay
async fn handle_connect(
    client: &mut TcpStream,
    policy: &BypassPolicy,
    connect_timeout: Duration,
    target: &str,
    buffered: &[u8],
) -> Result<HttpHandshake, HandshakeError> {
    let Some((host, port)) = parse_connect_target(target) else {
        client.write_all(REPLY_BAD_REQUEST).await?;
        return Err(HandshakeError::bad_request(format!(
            "malformed CONNECT target: {target:?}"
        )));
    };

    let target = format!("{host}:{port}");

    if policy.should_bypass(&host, port) {
        debug!(dest = %target, "CONNECT refused by bypass policy");
        // 200 then close: the client falls back to a direct connection.
        client.write_all(REPLY_ESTABLISHED).await?;
        return Err(HandshakeError::BypassRefused { target });
    }

    let mut upstream = connect_upstream(client, &host, port, connect_timeout).await?;

    client.write_all(REPLY_ESTABLISHED).await?;

    // Bytes the client pipelined behind its CONNECT head belong to the
    // tunnel and must arrive before relayed data.
    if !buffered.is_empty() {
        upstream.write_all(buffered).await?;
    }

    Ok(HttpHandshake { upstream, target })
}

/// Plain request: resolve the origin, rewrite the request line, forward
/// the buffered request bytes
#[allow(clippy::too_many_arguments)]
async fn handle_plain(
    client: &mut TcpStream,
    policy: &BypassPolicy,
    connect_timeout: Duration,
    method: &str,
    target: &str,
    version: &str,
    buf: &[u8],
    line_end: usize,
) -> Result<HttpHandshake, HandshakeError> {
    let (host, port, path) = if let Some(parsed) = parse_absolute_uri(target) {
        parsed
    } else if target.starts_with("http://") {
        client.write_all(REPLY_BAD_REQUEST).await?;
        return Err(HandshakeError::bad_request(format!(
            "unparseable absolute URI: {target:?}"
        )));
    } else {
        // Relative target: destination comes from the Host header.
        let Some(host_value) = host_header(buf)? else {
            client.write_all(REPLY_BAD_REQUEST).await?;
            return Err(HandshakeError::MissingHostHeader);
        };
        let Some((host, port)) = split_host_port(&host_value, 80) else {
            client.write_all(REPLY_BAD_REQUEST).await?;
            return Err(HandshakeError::bad_request(format!(
                "malformed Host header: {host_value:?}"
            )));
        };
        (host, port, target.to_string())
    };

    let target = format!("{host}:{port}");

    if policy.should_bypass(&host, port) {
        debug!(dest = %target, "HTTP request refused by bypass policy");
        client.write_all(REPLY_BYPASSED).await?;
        return Err(HandshakeError::BypassRefused { target });
    }

    let mut upstream = connect_upstream(client, &host, port, connect_timeout).await?;

    // Rewrite only the request line; headers and any buffered body bytes
    // are forwarded untouched.
    let rewritten = format!("{method} {path} {version}\r\n");
    upstream.write_all(rewritten.as_bytes()).await?;
    upstream.write_all(&buf[line_end + 2..]).await?;

    Ok(HttpHandshake { upstream, target })
}

/// Dial the origin under the connect timeout; failures answer 502
async fn connect_upstream(
    client: &mut TcpStream,
    host: &str,
    port: u16,
    connect_timeout: Duration,
) -> Result<TcpStream, HandshakeError> {
    match tokio::time::timeout(connect_timeout, TcpStream::connect((host, port))).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => {
            client.write_all(REPLY_BAD_GATEWAY).await?;
            Err(HandshakeError::upstream(format!("{host}:{port}"), e))
        }
        Err(_) => {
            client.write_all(REPLY_BAD_GATEWAY).await?;
            Err(HandshakeError::UpstreamTimeout {
                target: format!("{host}:{port}"),
                timeout_secs: connect_timeout.as_secs(),
            })
        }
    }
}

/// Accumulate bytes until CRLFCRLF; returns the buffer and the index just
/// past the terminator
async fn read_head(client: &mut TcpStream) -> Result<(Vec<u8>, usize), HandshakeError> {
    let mut buf = Vec::with_capacity(4096);
    let mut chunk = [0u8; 4096];

    loop {
        if let Some(end) = find_head_end(&buf) {
            return Ok((buf, end));
        }

        if buf.len() > MAX_HEAD_BYTES {
            client.write_all(REPLY_BAD_REQUEST).await?;
            return Err(HandshakeError::RequestTooLarge {
                limit: MAX_HEAD_BYTES,
            });
        }

        let n = client.read(&mut chunk).await?;
        if n == 0 {
            return Err(HandshakeError::malformed(
                "connection closed before end of headers",
            ));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Index just past the first CRLFCRLF, if present
fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

/// Index of the first CRLF
fn find_crlf(buf: &[u8]) -> Option<usize> {
    buf.windows(2).position(|w| w == b"\r\n")
}

/// Split `METHOD SP TARGET SP VERSION`
fn parse_request_line(line: &str) -> Option<(&str, &str, &str)> {
    let mut parts = line.split(' ').filter(|p| !p.is_empty());
    let method = parts.next()?;
    let target = parts.next()?;
    let version = parts.next()?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return None;
    }
    Some((method, target, version))
}

/// Parse an `http://` absolute URI into (host, port, origin-relative path)
///
/// Returns `None` for any other scheme or an empty authority.
fn parse_absolute_uri(uri: &str) -> Option<(String, u16, String)> {
    let rest = uri.strip_prefix("http://")?;

    let (authority, path) = match rest.find(|c| c == '/' || c == '?') {
        Some(pos) if rest.as_bytes()[pos] == b'/' => {
            (&rest[..pos], rest[pos..].to_string())
        }
        Some(pos) => (&rest[..pos], format!("/{}", &rest[pos..])),
        None => (rest, "/".to_string()),
    };

    if authority.is_empty() {
        return None;
    }

    let (host, port) = split_host_port(authority, 80)?;
    Some((host, port, path))
}

/// Parse a `CONNECT` target, which must carry an explicit port
fn parse_connect_target(target: &str) -> Option<(String, u16)> {
    let (host, port) = split_host_port(target, 0)?;
    if port == 0 {
        return None;
    }
    Some((host, port))
}

/// Split `host[:port]`, handling bracketed IPv6 literals
fn split_host_port(value: &str, default_port: u16) -> Option<(String, u16)> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    // [::1]:8080 or [::1]
    if let Some(rest) = value.strip_prefix('[') {
        let bracket_end = rest.find(']')?;
        let host = &rest[..bracket_end];
        let after = &rest[bracket_end + 1..];
        if after.is_empty() {
            return Some((host.to_string(), default_port));
        }
        let port = after.strip_prefix(':')?.parse().ok()?;
        return Some((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port_str)) if !host.is_empty() => {
            let port = port_str.parse().ok()?;
            Some((host.to_string(), port))
        }
        Some(_) => None,
        None => Some((value.to_string(), default_port)),
    }
}

/// Extract the `Host` header value from a request head, case-insensitively
fn host_header(head: &[u8]) -> Result<Option<String>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(head) {
        Ok(_) => {}
        Err(e) => {
            return Err(HandshakeError::bad_request(format!(
                "header parse failure: {e:?}"
            )))
        }
    }

    for header in req.headers.iter() {
        if header.name.eq_ignore_ascii_case("host") {
            let value = std::str::from_utf8(header.value)
                .map_err(|_| HandshakeError::bad_request("Host header is not UTF-8"))?;
            return Ok(Some(value.trim().to_string()));
        }
    }

    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::net::TcpListener;

    use crate::config::BypassConfig;

    #[test]
    fn test_find_head_end() {
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\n"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n\r\nbody"), Some(18));
        assert_eq!(find_head_end(b"GET / HTTP/1.1\r\n"), None);
        assert_eq!(find_head_end(b""), None);
    }

    #[test]
    fn test_parse_request_line() {
        assert_eq!(
            parse_request_line("GET http://example.com/ HTTP/1.1"),
            Some(("GET", "http://example.com/", "HTTP/1.1"))
        );
        assert_eq!(
            parse_request_line("CONNECT example.com:443 HTTP/1.1"),
            Some(("CONNECT", "example.com:443", "HTTP/1.1"))
        );
        assert!(parse_request_line("GET /").is_none());
        assert!(parse_request_line("GET / extra HTTP/1.1").is_none());
        assert!(parse_request_line("GET / FTP/1.0").is_none());
    }

    #[test]
    fn test_parse_absolute_uri() {
        assert_eq!(
            parse_absolute_uri("http://example.com/a/b?q=1"),
            Some(("example.com".into(), 80, "/a/b?q=1".into()))
        );
        assert_eq!(
            parse_absolute_uri("http://example.com:8080"),
            Some(("example.com".into(), 8080, "/".into()))
        );
        assert_eq!(
            parse_absolute_uri("http://example.com?q=1"),
            Some(("example.com".into(), 80, "/?q=1".into()))
        );
        assert!(parse_absolute_uri("https://example.com/").is_none());
        assert!(parse_absolute_uri("/relative/path").is_none());
        assert!(parse_absolute_uri("http://").is_none());
    }

    #[test]
    fn test_split_host_port() {
        assert_eq!(
            split_host_port("example.com:8080", 80),
            Some(("example.com".into(), 8080))
        );
        assert_eq!(
            split_host_port("example.com", 80),
            Some(("example.com".into(), 80))
        );
        assert_eq!(split_host_port("[::1]:443", 80), Some(("::1".into(), 443)));
        assert_eq!(split_host_port("[::1]", 80), Some(("::1".into(), 80)));
        assert_eq!(split_host_port("example.com:notaport", 80), None);
        assert_eq!(split_host_port("", 80), None);
    }

    #[test]
    fn test_parse_connect_target_requires_port() {
        assert_eq!(
            parse_connect_target("example.com:443"),
            Some(("example.com".into(), 443))
        );
        assert!(parse_connect_target("example.com").is_none());
    }

    #[test]
    fn test_host_header_case_insensitive() {
        let head = b"GET / HTTP/1.1\r\nhOsT: example.com:81\r\n\r\n";
        assert_eq!(host_header(head).unwrap(), Some("example.com:81".into()));

        let head = b"GET / HTTP/1.1\r\nAccept: */*\r\n\r\n";
        assert_eq!(host_header(head).unwrap(), None);
    }

    async fn paired_streams() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server_side, _) = listener.accept().await.unwrap();
        (client, server_side)
    }

    #[tokio::test]
    async fn test_connect_bypass_replies_200_then_closes() {
        let (mut client, mut server_side) = paired_streams().await;
        let policy = BypassPolicy::from_config(&BypassConfig::default(), false);

        let server = tokio::spawn(async move {
            handshake(&mut server_side, &policy, Duration::from_secs(1)).await
        });

        client
            .write_all(b"CONNECT localhost:9443 HTTP/1.1\r\nHost: localhost:9443\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, REPLY_ESTABLISHED);

        let result = server.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::BypassRefused { .. })));
    }

    #[tokio::test]
    async fn test_relative_request_without_host_gets_400() {
        let (mut client, mut server_side) = paired_streams().await;
        let policy = BypassPolicy::from_config(&BypassConfig::default(), false);

        let server = tokio::spawn(async move {
            handshake(&mut server_side, &policy, Duration::from_secs(1)).await
        });

        client
            .write_all(b"GET /index.html HTTP/1.1\r\nAccept: */*\r\n\r\n")
            .await
            .unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, REPLY_BAD_REQUEST);

        let result = server.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::MissingHostHeader)));
    }

    #[tokio::test]
    async fn test_garbage_request_line_gets_400() {
        let (mut client, mut server_side) = paired_streams().await;
        let policy = BypassPolicy::from_config(&BypassConfig::default(), false);

        let server = tokio::spawn(async move {
            handshake(&mut server_side, &policy, Duration::from_secs(1)).await
        });

        client.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();

        let mut response = Vec::new();
        client.read_to_end(&mut response).await.unwrap();
        assert_eq!(response, REPLY_BAD_REQUEST);

        let result = server.await.unwrap();
        assert!(matches!(result, Err(HandshakeError::BadRequest(_))));
    }
}
