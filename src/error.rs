//! Error types for awg-bridge
//!
//! Errors are categorized by subsystem. Configuration errors are fatal and
//! user-visible at startup; relay errors are classified so the receive loop
//! can decide what survives (`is_recoverable`) — once the relay runs, no
//! transient error tears it down.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

use crate::config::ObfuscationError;

/// Top-level error type for awg-bridge
#[derive(Debug, Error)]
pub enum BridgeError {
    /// Configuration errors (file access, INI shape, field validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// UDP relay errors
    #[error("Relay error: {0}")]
    Relay(#[from] RelayError),

    /// Tunnel device errors
    #[error("Device error: {0}")]
    Device(#[from] DeviceError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Structural INI error (bad section, missing required key)
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Invalid field value (bad key, address, number)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// AmneziaWG parameter violation; Display is the user-visible contract
    #[error("{0}")]
    Obfuscation(#[from] ObfuscationError),

    /// I/O error while reading the config file
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors always require user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }

    /// Create a parse error
    pub fn parse(msg: impl Into<String>) -> Self {
        Self::ParseError(msg.into())
    }

    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// UDP relay errors
#[derive(Debug, Error)]
pub enum RelayError {
    /// Local UDP bind failed; fatal at startup
    #[error("Failed to bind relay socket to {addr}: {reason}")]
    Bind { addr: SocketAddr, reason: String },

    /// Tunnel-side dial failed during association creation
    #[error("Failed to dial {addr} through the tunnel: {reason}")]
    TunnelDial { addr: SocketAddr, reason: String },

    /// DNS resolution failed or returned no addresses
    #[error("DNS lookup failed for {host}: {reason}")]
    DnsFailure { host: String, reason: String },

    /// Datagram did not parse as a SOCKS5 UDP request
    #[error("Malformed SOCKS5 UDP datagram: {0}")]
    MalformedSocks5(String),

    /// Non-timeout read error on a tunnel connection
    #[error("Tunnel read failed: {0}")]
    TunnelRead(String),

    /// Write error on a tunnel connection (best-effort, swallowed)
    #[error("Tunnel write failed: {0}")]
    TunnelWrite(String),

    /// I/O error
    #[error("Relay I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl RelayError {
    /// Whether the relay loop survives this error
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Bind { .. } => false,
            Self::TunnelDial { .. }
            | Self::DnsFailure { .. }
            | Self::MalformedSocks5(_)
            | Self::TunnelRead(_)
            | Self::TunnelWrite(_) => true,
            Self::IoError(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut
                    | io::ErrorKind::Interrupted
                    | io::ErrorKind::WouldBlock
                    | io::ErrorKind::ConnectionReset
            ),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::Bind {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a tunnel dial error
    pub fn dial(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::TunnelDial {
            addr,
            reason: reason.into(),
        }
    }

    /// Create a DNS failure
    pub fn dns(host: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::DnsFailure {
            host: host.into(),
            reason: reason.into(),
        }
    }

    /// Create a malformed-datagram error
    pub fn malformed(msg: impl Into<String>) -> Self {
        Self::MalformedSocks5(msg.into())
    }
}

/// Tunnel device errors
#[derive(Debug, Error)]
pub enum DeviceError {
    /// Key was not valid Base64 or not 32 bytes
    #[error("Invalid key: {0}")]
    KeyError(String),

    /// IPC configuration text was rejected
    #[error("IPC configuration rejected: {0}")]
    IpcError(String),

    /// Device was used before `up()` or after shutdown
    #[error("Device is not up")]
    NotUp,

    /// Peer tunnel failure (socket, handshake)
    #[error("Peer tunnel error: {0}")]
    Tunnel(String),

    /// No peer routes the requested destination
    #[error("No peer allows destination {0}")]
    NoRoute(std::net::IpAddr),

    /// I/O error
    #[error("Device I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl DeviceError {
    /// Create a key error
    pub fn key(msg: impl Into<String>) -> Self {
        Self::KeyError(msg.into())
    }

    /// Create an IPC error
    pub fn ipc(msg: impl Into<String>) -> Self {
        Self::IpcError(msg.into())
    }

    /// Create a tunnel error
    pub fn tunnel(msg: impl Into<String>) -> Self {
        Self::Tunnel(msg.into())
    }
}

/// Type alias for Result with BridgeError
pub type Result<T> = std::result::Result<T, BridgeError>;
