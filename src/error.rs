//! Error types for proxy-relay
//!
//! This module defines the error hierarchy for the proxy relay core.
//! Errors are categorized by subsystem; per-connection errors are contained
//! within that connection's handler and never surface to the accept loop.

use std::io;

use thiserror::Error;

/// Top-level error type for proxy-relay
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Listener setup and port selection errors
    #[error("Listen error: {0}")]
    Listen(#[from] ListenError),

    /// Per-connection handling errors
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProxyError {
    /// Check if this error is recoverable (the server can keep running)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Config(_) => false,
            Self::Listen(e) => e.is_recoverable(),
            Self::Connection(_) => true,
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

/// Listener setup and port selection errors
#[derive(Debug, Error)]
pub enum ListenError {
    /// Failed to bind to a specific address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: String, reason: String },

    /// No port could be bound during dynamic port search
    #[error(
        "No available port: tried {sequential} sequential ports from {start_port} \
         and {random} random ports in 9000-9999"
    )]
    PortExhaustion {
        start_port: u16,
        sequential: u32,
        random: u32,
    },

    /// Failed to accept a connection
    #[error("Accept error: {0}")]
    AcceptError(String),

    /// I/O error
    #[error("Listener I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ListenError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::BindError { .. } => false,
            Self::PortExhaustion { .. } => false,
            Self::AcceptError(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: impl ToString, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr: addr.to_string(),
            reason: reason.into(),
        }
    }
}

/// Handshake errors for both protocol variants
///
/// Variants that carry a protocol-defined refusal (`BypassRefused`,
/// `UpstreamConnect`, `UpstreamTimeout`, and the HTTP request errors) are
/// raised after the refusal reply has been written to the client. The
/// remaining variants close the connection with no reply at all.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// Malformed protocol bytes (short read, bad framing)
    #[error("Malformed handshake: {0}")]
    Malformed(String),

    /// Client spoke a protocol version other than SOCKS5
    #[error("Unsupported SOCKS version: {0:#04x}")]
    UnsupportedVersion(u8),

    /// SOCKS5 command other than CONNECT
    #[error("Unsupported SOCKS5 command: {0:#04x}")]
    UnsupportedCommand(u8),

    /// SOCKS5 address type other than IPv4 or domain
    #[error("Unsupported SOCKS5 address type: {0:#04x}")]
    UnsupportedAddressType(u8),

    /// Target matched the bypass policy; refusal reply already sent
    #[error("Target {target} is bypassed")]
    BypassRefused { target: String },

    /// Upstream TCP connect failed; failure reply already sent
    #[error("Failed to connect upstream to {target}: {reason}")]
    UpstreamConnect { target: String, reason: String },

    /// Upstream TCP connect timed out; failure reply already sent
    #[error("Upstream connect to {target} timed out after {timeout_secs}s")]
    UpstreamTimeout { target: String, timeout_secs: u64 },

    /// HTTP request with a relative target and no Host header
    #[error("Missing Host header for relative request target")]
    MissingHostHeader,

    /// HTTP head exceeded the accumulation limit
    #[error("Request head exceeded {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// HTTP request line or headers could not be parsed
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// I/O error while reading or writing handshake bytes
    #[error("Handshake I/O error: {0}")]
    Io(#[from] io::Error),
}

impl HandshakeError {
    /// Create a malformed-handshake error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::Malformed(msg.into())
    }

    /// Create a bad-request error
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::BadRequest(msg.into())
    }

    /// Create an upstream connect error
    pub fn upstream(target: impl Into<String>, reason: impl ToString) -> Self {
        Self::UpstreamConnect {
            target: target.into(),
            reason: reason.to_string(),
        }
    }

    /// A bypass refusal is an enforced policy outcome, not a fault
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::BypassRefused { .. })
    }
}

/// Per-connection handling errors
#[derive(Debug, Error)]
pub enum ConnectionError {
    /// Handshake failed
    #[error("Handshake failed: {0}")]
    Handshake(#[from] HandshakeError),

    /// Handshake did not complete within the configured timeout
    #[error("Handshake timed out after {timeout_secs}s")]
    HandshakeTimeout { timeout_secs: u64 },

    /// Relay I/O failure after the tunnel was established
    #[error("Relay I/O error: {0}")]
    Relay(#[source] io::Error),
}

impl ConnectionError {
    /// Check whether this termination is a policy refusal rather than a fault
    #[must_use]
    pub fn is_refusal(&self) -> bool {
        matches!(self, Self::Handshake(e) if e.is_refusal())
    }
}

/// Type alias for Result with ProxyError
pub type Result<T> = std::result::Result<T, ProxyError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_recovery_classification() {
        let config_err = ConfigError::ValidationError("test".into());
        assert!(!ProxyError::from(config_err).is_recoverable());

        let accept_err = ListenError::AcceptError("test".into());
        assert!(accept_err.is_recoverable());

        let exhausted = ListenError::PortExhaustion {
            start_port: 8888,
            sequential: 10,
            random: 5,
        };
        assert!(!exhausted.is_recoverable());

        let conn_err = ConnectionError::Relay(io::Error::new(
            io::ErrorKind::ConnectionReset,
            "reset",
        ));
        assert!(ProxyError::from(conn_err).is_recoverable());
    }

    #[test]
    fn test_error_display() {
        let err = ListenError::PortExhaustion {
            start_port: 8888,
            sequential: 10,
            random: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("8888"));
        assert!(msg.contains("9000-9999"));

        let err = HandshakeError::UnsupportedAddressType(0x04);
        assert!(err.to_string().contains("0x04"));
    }

    #[test]
    fn test_refusal_classification() {
        let refusal = HandshakeError::BypassRefused {
            target: "localhost:5000".into(),
        };
        assert!(refusal.is_refusal());
        assert!(ConnectionError::from(refusal).is_refusal());

        let fault = HandshakeError::malformed("short read");
        assert!(!fault.is_refusal());
    }
}
