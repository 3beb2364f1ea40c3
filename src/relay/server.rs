//! SOCKS5 UDP relay server
//!
//! Binds the local UDP socket and runs the single-task receive loop:
//! datagrams from known clients are written straight to their tunnel
//! connection (no task hop, to keep latency down); the first datagram from
//! a new client wins the creation claim and dials the tunnel in a spawned
//! task, while racing datagrams are dropped. Each association gets a reader
//! task that polls the tunnel with a short deadline so it stays responsive
//! to shutdown signals, and a janitor evicts idle associations on a fixed
//! tick.
//!
//! Nothing past bind is fatal: dial and resolution failures drop the
//! triggering datagram and release the creation claim, write failures are
//! best-effort losses, and only a tunnel read error tears an association
//! down.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use super::dns_cache::DnsCache;
use super::pool::{ConnectionPool, ShutdownReceiver, UdpAssociation};
use super::socks5::{self, TargetAddr};
use crate::device::VirtualStack;
use crate::error::RelayError;
use crate::io::PacketBufferPool;

/// Default maximum number of live associations
pub const DEFAULT_MAX_ASSOCIATIONS: usize = 1000;
/// Default idle cutoff for the janitor
pub const DEFAULT_MAX_IDLE: Duration = Duration::from_secs(60);
/// Default janitor tick
pub const DEFAULT_JANITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Read deadline for per-association readers
pub const READ_DEADLINE: Duration = Duration::from_millis(50);

/// Relay configuration
#[derive(Debug, Clone)]
pub struct UdpRelayConfig {
    /// Local address to bind
    pub listen_addr: SocketAddr,
    /// Pool capacity
    pub max_associations: usize,
    /// Idle cutoff for janitor eviction
    pub max_idle: Duration,
    /// Janitor tick interval
    pub janitor_interval: Duration,
    /// Per-reader poll deadline
    pub read_deadline: Duration,
}

impl Default for UdpRelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: "127.0.0.1:1080".parse().expect("valid literal"),
            max_associations: DEFAULT_MAX_ASSOCIATIONS,
            max_idle: DEFAULT_MAX_IDLE,
            janitor_interval: DEFAULT_JANITOR_INTERVAL,
            read_deadline: READ_DEADLINE,
        }
    }
}

/// Relay counters
#[derive(Debug, Default)]
pub struct UdpRelayStats {
    /// Datagrams received on the local socket
    pub datagrams_received: AtomicU64,
    /// Payloads written to tunnel connections
    pub datagrams_relayed: AtomicU64,
    /// Replies sent back to clients
    pub replies_sent: AtomicU64,
    /// Datagrams dropped for failing to parse
    pub malformed_dropped: AtomicU64,
    /// Datagrams dropped because a creation was already in flight
    pub creation_contention_dropped: AtomicU64,
    /// Associations successfully created
    pub associations_created: AtomicU64,
    /// Failed dials or resolutions during creation
    pub creation_failures: AtomicU64,
}

impl UdpRelayStats {
    /// Snapshot the counters.
    #[must_use]
    pub fn snapshot(&self) -> UdpRelayStatsSnapshot {
        UdpRelayStatsSnapshot {
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
            datagrams_relayed: self.datagrams_relayed.load(Ordering::Relaxed),
            replies_sent: self.replies_sent.load(Ordering::Relaxed),
            malformed_dropped: self.malformed_dropped.load(Ordering::Relaxed),
            creation_contention_dropped: self
                .creation_contention_dropped
                .load(Ordering::Relaxed),
            associations_created: self.associations_created.load(Ordering::Relaxed),
            creation_failures: self.creation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Point-in-time snapshot of [`UdpRelayStats`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct UdpRelayStatsSnapshot {
    pub datagrams_received: u64,
    pub datagrams_relayed: u64,
    pub replies_sent: u64,
    pub malformed_dropped: u64,
    pub creation_contention_dropped: u64,
    pub associations_created: u64,
    pub creation_failures: u64,
}

/// The SOCKS5 UDP relay.
pub struct UdpRelay {
    config: UdpRelayConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    stack: Arc<dyn VirtualStack>,
    pool: Arc<ConnectionPool>,
    dns: Arc<DnsCache>,
    relay_buffers: Arc<PacketBufferPool>,
    reader_buffers: Arc<PacketBufferPool>,
    stats: Arc<UdpRelayStats>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
}

impl UdpRelay {
    /// Bind the local socket and build a relay over the given stack.
    ///
    /// # Errors
    ///
    /// Returns [`RelayError::Bind`] when the socket cannot be bound.
    pub async fn bind(
        config: UdpRelayConfig,
        stack: Arc<dyn VirtualStack>,
    ) -> Result<Self, RelayError> {
        let socket = UdpSocket::bind(config.listen_addr)
            .await
            .map_err(|e| RelayError::bind(config.listen_addr, e.to_string()))?;
        let local_addr = socket.local_addr().unwrap_or(config.listen_addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Ok(Self {
            pool: Arc::new(ConnectionPool::new(config.max_associations)),
            dns: Arc::new(DnsCache::with_defaults()),
            relay_buffers: Arc::new(PacketBufferPool::with_defaults()),
            reader_buffers: Arc::new(PacketBufferPool::with_defaults()),
            stats: Arc::new(UdpRelayStats::default()),
            config,
            socket: Arc::new(socket),
            local_addr,
            stack,
            shutdown_tx,
            shutdown_rx,
        })
    }

    /// The bound local address.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The association pool.
    #[must_use]
    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    /// Relay counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<UdpRelayStats> {
        &self.stats
    }

    /// Snapshot of the relay counters.
    #[must_use]
    pub fn stats_snapshot(&self) -> UdpRelayStatsSnapshot {
        self.stats.snapshot()
    }

    /// Ask the receive loop and janitor to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(true);
    }

    /// Run the receive loop and janitor until shutdown.
    ///
    /// No error past bind terminates the loop.
    ///
    /// # Errors
    ///
    /// Reserved for future fatal conditions; the current loop only exits
    /// on [`shutdown`](Self::shutdown).
    pub async fn run(&self) -> Result<(), RelayError> {
        info!(addr = %self.local_addr, "SOCKS5 UDP relay listening");

        self.spawn_janitor();

        let mut shutdown_rx = self.shutdown_rx.clone();
        loop {
            let mut buf = self.relay_buffers.get();
            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, client)) => {
                            self.stats.datagrams_received.fetch_add(1, Ordering::Relaxed);
                            self.handle_datagram(client, &buf[..len]).await;
                        }
                        Err(e) => {
                            warn!(error = %e, "relay receive error");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("SOCKS5 UDP relay shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }

    /// Process one datagram on the receive path.
    async fn handle_datagram(&self, client: SocketAddr, data: &[u8]) {
        let request = match socks5::parse_request(data) {
            Ok(req) => req,
            Err(e) => {
                self.stats.malformed_dropped.fetch_add(1, Ordering::Relaxed);
                trace!(%client, error = %e, "dropping malformed datagram");
                return;
            }
        };

        let key = client.to_string();

        // Hot path: known client, synchronous write under the association
        // write lock. Write failures are best-effort losses.
        if let Some(assoc) = self.pool.get(&key) {
            match assoc.write_payload(request.payload).await {
                Ok(()) => {
                    self.stats.datagrams_relayed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    trace!(%client, error = %e, "tunnel write failed");
                }
            }
            return;
        }

        // First datagram from this client: only the creation winner
        // proceeds, racing datagrams are dropped.
        if !self.pool.try_begin_creation(&key) {
            self.stats
                .creation_contention_dropped
                .fetch_add(1, Ordering::Relaxed);
            trace!(%client, "association creation already in flight");
            return;
        }

        let ctx = CreationContext {
            socket: Arc::clone(&self.socket),
            stack: Arc::clone(&self.stack),
            pool: Arc::clone(&self.pool),
            dns: Arc::clone(&self.dns),
            reader_buffers: Arc::clone(&self.reader_buffers),
            stats: Arc::clone(&self.stats),
            read_deadline: self.config.read_deadline,
        };
        let target = request.target.clone();
        let port = request.port;
        let payload = request.payload.to_vec();
        tokio::spawn(async move {
            create_association(ctx, client, key, target, port, payload).await;
        });
    }

    fn spawn_janitor(&self) {
        let pool = Arc::clone(&self.pool);
        let max_idle = self.config.max_idle;
        let interval = self.config.janitor_interval;
        let mut shutdown_rx = self.shutdown_rx.clone();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        pool.cleanup(max_idle);
                    }
                    _ = shutdown_rx.changed() => {
                        if *shutdown_rx.borrow() {
                            debug!("janitor stopping");
                            break;
                        }
                    }
                }
            }
        });
    }
}

impl std::fmt::Debug for UdpRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UdpRelay")
            .field("listen_addr", &self.config.listen_addr)
            .field("associations", &self.pool.len())
            .finish_non_exhaustive()
    }
}

/// Everything a creation task needs, bundled to keep the spawn readable.
struct CreationContext {
    socket: Arc<UdpSocket>,
    stack: Arc<dyn VirtualStack>,
    pool: Arc<ConnectionPool>,
    dns: Arc<DnsCache>,
    reader_buffers: Arc<PacketBufferPool>,
    stats: Arc<UdpRelayStats>,
    read_deadline: Duration,
}

/// Resolve, dial, register and prime a new association.
///
/// Any failure drops the triggering datagram and releases the creation
/// claim so the client's next datagram can retry.
async fn create_association(
    ctx: CreationContext,
    client: SocketAddr,
    key: String,
    target: TargetAddr,
    port: u16,
    payload: Vec<u8>,
) {
    let resolved_ip = match &target {
        TargetAddr::Ip(ip) => *ip,
        TargetAddr::Domain(host) => match ctx.dns.resolve(host).await {
            Ok(ip) => ip,
            Err(e) => {
                ctx.stats.creation_failures.fetch_add(1, Ordering::Relaxed);
                debug!(%client, host, error = %e, "DNS resolution failed");
                ctx.pool.end_creation(&key);
                return;
            }
        },
    };
    let remote = SocketAddr::new(resolved_ip, port);

    let conn = match ctx.stack.dial_udp(remote).await {
        Ok(conn) => conn,
        Err(e) => {
            ctx.stats.creation_failures.fetch_add(1, Ordering::Relaxed);
            debug!(%client, %remote, error = %e, "tunnel dial failed");
            ctx.pool.end_creation(&key);
            return;
        }
    };

    let (assoc, shutdown_rx) =
        UdpAssociation::new(Arc::from(conn), client, resolved_ip, port);
    ctx.pool.set(key.clone(), Arc::clone(&assoc));
    ctx.stats.associations_created.fetch_add(1, Ordering::Relaxed);
    debug!(%client, %remote, "association created");

    tokio::spawn(reader_task(
        Arc::clone(&ctx.socket),
        Arc::clone(&ctx.pool),
        Arc::clone(&assoc),
        shutdown_rx,
        key,
        Arc::clone(&ctx.reader_buffers),
        Arc::clone(&ctx.stats),
        ctx.read_deadline,
    ));

    match assoc.write_payload(&payload).await {
        Ok(()) => {
            ctx.stats.datagrams_relayed.fetch_add(1, Ordering::Relaxed);
        }
        Err(e) => {
            trace!(%client, error = %e, "initial tunnel write failed");
        }
    }
}

/// Per-association reader: poll the tunnel with a short deadline, forward
/// replies to the client, tear the association down on a real read error.
#[allow(clippy::too_many_arguments)]
async fn reader_task(
    socket: Arc<UdpSocket>,
    pool: Arc<ConnectionPool>,
    assoc: Arc<UdpAssociation>,
    mut shutdown_rx: ShutdownReceiver,
    key: String,
    buffers: Arc<PacketBufferPool>,
    stats: Arc<UdpRelayStats>,
    read_deadline: Duration,
) {
    let mut buf = buffers.get();
    loop {
        if shutdown_rx.try_recv().is_ok() {
            trace!(key, "reader received shutdown signal");
            return;
        }

        match assoc.conn().recv_deadline(&mut buf, read_deadline).await {
            Ok(len) => {
                assoc.touch();
                let reply = socks5::encode_response(
                    &buffers,
                    assoc.resolved_ip,
                    assoc.target_port,
                    &buf[..len],
                );
                // Best-effort send back to the client.
                if socket.send_to(&reply, assoc.client).await.is_ok() {
                    stats.replies_sent.fetch_add(1, Ordering::Relaxed);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::TimedOut => {
                // Deadline elapsed; loop to poll the shutdown signal.
            }
            Err(e) => {
                debug!(key, error = %e, "tunnel read failed, tearing down association");
                pool.delete(&key);
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = UdpRelayConfig::default();
        assert_eq!(config.listen_addr.port(), 1080);
        assert_eq!(config.max_associations, DEFAULT_MAX_ASSOCIATIONS);
        assert_eq!(config.max_idle, Duration::from_secs(60));
        assert_eq!(config.janitor_interval, Duration::from_secs(30));
        assert_eq!(config.read_deadline, Duration::from_millis(50));
    }

    #[test]
    fn test_stats_snapshot() {
        let stats = UdpRelayStats::default();
        stats.datagrams_received.fetch_add(12, Ordering::Relaxed);
        stats.replies_sent.fetch_add(7, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.datagrams_received, 12);
        assert_eq!(snapshot.replies_sent, 7);

        let json = serde_json::to_string(&snapshot).unwrap();
        assert!(json.contains("\"datagrams_received\":12"));
    }
}
