//! Virtual network stack traits
//!
//! The relay never touches the tunnel engine directly; it dials UDP
//! "connections" through [`VirtualStack`] and moves datagrams over
//! [`VirtualUdpConn`]. The engine shipped in this crate implements both,
//! and tests substitute in-memory stacks behind the same seam.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use async_trait::async_trait;

/// A connected, datagram-oriented handle inside the tunnel.
///
/// Handles are connected semantics: `send` always targets the remote the
/// dial named, and `recv_deadline` only yields datagrams from it.
#[async_trait]
pub trait VirtualUdpConn: Send + Sync {
    /// Receive the next datagram into `buf`, waiting at most `deadline`.
    ///
    /// # Errors
    ///
    /// An elapsed deadline surfaces as [`io::ErrorKind::TimedOut`]; any
    /// other error means the connection is unusable and the caller should
    /// tear it down.
    async fn recv_deadline(&self, buf: &mut [u8], deadline: Duration) -> io::Result<usize>;

    /// Send one datagram to the connected remote.
    ///
    /// # Errors
    ///
    /// Returns the underlying I/O error; the relay treats send failures as
    /// best-effort losses.
    async fn send(&self, buf: &[u8]) -> io::Result<usize>;

    /// Release the connection. Idempotent; subsequent reads fail.
    fn close(&self);

    /// The remote this handle is connected to.
    fn remote_addr(&self) -> SocketAddr;
}

/// A stack able to open tunnel-side UDP connections.
#[async_trait]
pub trait VirtualStack: Send + Sync {
    /// Dial a UDP connection to `remote` through the tunnel.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when no route exists or the tunnel is down.
    async fn dial_udp(&self, remote: SocketAddr) -> io::Result<Box<dyn VirtualUdpConn>>;
}
