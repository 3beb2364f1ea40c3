//! Per-peer userspace WireGuard tunnel
//!
//! One boringtun `Tunn` plus one UDP socket per configured peer. A
//! background task drives the protocol: a 250 ms timer tick for keepalive
//! and handshake retransmission, and a receive loop that de-obfuscates,
//! decapsulates and hands decrypted IP packets to the device dispatcher.
//! The AmneziaWG wire transform is applied at the socket boundary in both
//! directions, and the junk-packet burst precedes the first handshake.
//!
//! Lock discipline: the `Tunn` mutex is only held across the (synchronous)
//! noise calls, never across an await.

use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::interval;
use tracing::{debug, trace, warn};

use super::obfuscate::WireObfuscator;
use crate::error::DeviceError;

/// Transport packet overhead added by encapsulation
pub const WG_TRANSPORT_OVERHEAD: usize = 32;
/// Handshake initiation size, the largest fixed-size message
pub const WG_HANDSHAKE_INIT_SIZE: usize = 148;
/// Timer tick driving keepalive and retransmission
const TIMER_TICK_MS: u64 = 250;
/// Receive buffer size for the tunnel socket
const RECV_BUFFER_SIZE: usize = 65536;

/// Static parameters for one peer tunnel.
#[derive(Debug, Clone)]
pub struct PeerTunnelConfig {
    /// Interface private key
    pub private_key: [u8; 32],
    /// Peer public key
    pub public_key: [u8; 32],
    /// Optional preshared key (all-zero means none)
    pub preshared_key: Option<[u8; 32]>,
    /// Resolved peer endpoint
    pub endpoint: SocketAddr,
    /// Persistent keepalive in seconds, 0 disables
    pub keepalive: u16,
    /// Fixed local port, 0 for ephemeral
    pub listen_port: u16,
    /// Prefixes this peer routes; empty routes everything
    pub allowed_ips: Vec<IpNet>,
    /// Tunnel index for the noise layer
    pub index: u32,
}

/// Traffic counters for one peer tunnel.
#[derive(Debug, Default)]
pub struct PeerTunnelStats {
    pub tx_packets: AtomicU64,
    pub rx_packets: AtomicU64,
    pub invalid_packets: AtomicU64,
}

/// A live peer tunnel.
pub struct PeerTunnel {
    tunn: Mutex<Box<Tunn>>,
    socket: Arc<UdpSocket>,
    obfuscator: Arc<WireObfuscator>,
    allowed_ips: Vec<IpNet>,
    endpoint: SocketAddr,
    running: AtomicBool,
    shutdown_tx: Mutex<Option<oneshot::Sender<()>>>,
    handshake_rx: watch::Receiver<bool>,
    stats: Arc<PeerTunnelStats>,
}

impl PeerTunnel {
    /// Bring the tunnel up: bind, emit the junk burst, initiate the
    /// handshake and spawn the background task. Decrypted IP packets are
    /// delivered on `inbound_tx`.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the noise state cannot be built or the
    /// socket fails to bind/connect.
    pub async fn spawn(
        config: PeerTunnelConfig,
        obfuscator: Arc<WireObfuscator>,
        inbound_tx: mpsc::Sender<Vec<u8>>,
    ) -> Result<Arc<Self>, DeviceError> {
        let static_private = StaticSecret::from(config.private_key);
        let peer_public = PublicKey::from(config.public_key);
        let keepalive = (config.keepalive > 0).then_some(config.keepalive);

        let tunn = Tunn::new(
            static_private,
            peer_public,
            config.preshared_key,
            keepalive,
            config.index,
            None,
        )
        .map_err(|e| DeviceError::tunnel(format!("failed to create tunnel: {e}")))?;

        let socket = UdpSocket::bind(("0.0.0.0", config.listen_port))
            .await
            .map_err(|e| DeviceError::tunnel(format!("failed to bind tunnel socket: {e}")))?;
        socket.connect(config.endpoint).await.map_err(|e| {
            DeviceError::tunnel(format!("failed to connect to {}: {e}", config.endpoint))
        })?;
        let socket = Arc::new(socket);

        let (handshake_tx, handshake_rx) = watch::channel(false);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();

        let tunnel = Arc::new(Self {
            tunn: Mutex::new(Box::new(tunn)),
            socket: Arc::clone(&socket),
            obfuscator,
            allowed_ips: config.allowed_ips,
            endpoint: config.endpoint,
            running: AtomicBool::new(true),
            shutdown_tx: Mutex::new(Some(shutdown_tx)),
            handshake_rx,
            stats: Arc::new(PeerTunnelStats::default()),
        });

        // Junk datagrams go out before any protocol traffic.
        for junk in tunnel.obfuscator.junk_packets() {
            if let Err(e) = socket.send(&junk).await {
                warn!(error = %e, "failed to send junk packet");
                break;
            }
        }

        tunnel.initiate_handshake().await?;

        tokio::spawn(run_tunnel_task(
            Arc::clone(&tunnel),
            inbound_tx,
            handshake_tx,
            shutdown_rx,
        ));

        debug!(endpoint = %tunnel.endpoint, "peer tunnel up");
        Ok(tunnel)
    }

    /// Whether this peer routes `ip`.
    #[must_use]
    pub fn allows(&self, ip: std::net::IpAddr) -> bool {
        self.match_prefix(ip).is_some()
    }

    /// The longest allowed-IPs prefix containing `ip`, `None` when no
    /// prefix matches. An empty list is the catch-all and matches with
    /// prefix length 0, so any configured prefix outranks it.
    #[must_use]
    pub fn match_prefix(&self, ip: std::net::IpAddr) -> Option<u8> {
        if self.allowed_ips.is_empty() {
            return Some(0);
        }
        self.allowed_ips
            .iter()
            .filter(|net| net.contains(&ip))
            .map(IpNet::prefix_len)
            .max()
    }

    /// The peer's endpoint.
    #[must_use]
    pub fn endpoint(&self) -> SocketAddr {
        self.endpoint
    }

    /// Whether the background task is live.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> &Arc<PeerTunnelStats> {
        &self.stats
    }

    /// Block until the first handshake completes or `timeout` elapses.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::Tunnel`] on timeout.
    pub async fn wait_handshake(&self, timeout: Duration) -> Result<(), DeviceError> {
        if *self.handshake_rx.borrow() {
            return Ok(());
        }
        let mut rx = self.handshake_rx.clone();
        tokio::time::timeout(timeout, async {
            loop {
                rx.changed()
                    .await
                    .map_err(|_| DeviceError::tunnel("tunnel task exited"))?;
                if *rx.borrow() {
                    return Ok(());
                }
            }
        })
        .await
        .map_err(|_| DeviceError::tunnel("handshake timed out"))?
    }

    /// Encrypt and send one IP packet to the peer.
    ///
    /// # Errors
    ///
    /// Surfaces socket errors and unrecoverable noise errors; `Done`
    /// results (packet queued pending handshake) are not errors.
    pub async fn send_ip_packet(&self, packet: &[u8]) -> io::Result<()> {
        let mut dst = vec![0u8; (packet.len() + WG_TRANSPORT_OVERHEAD).max(WG_HANDSHAKE_INIT_SIZE)];
        let wire = {
            let mut tunn = self.tunn.lock();
            match tunn.encapsulate(packet, &mut dst) {
                TunnResult::WriteToNetwork(data) => Some(self.obfuscator.obfuscate(data)),
                TunnResult::Done => None,
                TunnResult::Err(e) => {
                    return Err(io::Error::new(
                        io::ErrorKind::InvalidData,
                        format!("encapsulation failed: {e:?}"),
                    ));
                }
                _ => None,
            }
        };

        if let Some(wire) = wire {
            self.socket.send(&wire).await?;
            self.stats.tx_packets.fetch_add(1, Ordering::Relaxed);
        }
        Ok(())
    }

    /// Stop the background task. Idempotent.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(tx) = self.shutdown_tx.lock().take() {
            let _ = tx.send(());
        }
    }

    /// Send the handshake initiation datagram.
    async fn initiate_handshake(&self) -> Result<(), DeviceError> {
        let mut dst = vec![0u8; WG_HANDSHAKE_INIT_SIZE];
        let wire = {
            let mut tunn = self.tunn.lock();
            match tunn.format_handshake_initiation(&mut dst, false) {
                TunnResult::WriteToNetwork(data) => Some(self.obfuscator.obfuscate(data)),
                TunnResult::Done => None,
                TunnResult::Err(e) => {
                    return Err(DeviceError::tunnel(format!("handshake failed: {e:?}")));
                }
                _ => None,
            }
        };
        if let Some(wire) = wire {
            self.socket
                .send(&wire)
                .await
                .map_err(|e| DeviceError::tunnel(format!("failed to send handshake: {e}")))?;
            trace!(endpoint = %self.endpoint, "sent handshake initiation");
        }
        Ok(())
    }
}

impl std::fmt::Debug for PeerTunnel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerTunnel")
            .field("endpoint", &self.endpoint)
            .field("running", &self.is_running())
            .field("allowed_ips", &self.allowed_ips)
            .finish_non_exhaustive()
    }
}

/// Timer and receive loop for one peer tunnel.
async fn run_tunnel_task(
    tunnel: Arc<PeerTunnel>,
    inbound_tx: mpsc::Sender<Vec<u8>>,
    handshake_tx: watch::Sender<bool>,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    let mut ticker = interval(Duration::from_millis(TIMER_TICK_MS));
    let mut recv_buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut dst_buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut timer_buf = vec![0u8; WG_HANDSHAKE_INIT_SIZE];

    loop {
        tokio::select! {
            _ = &mut shutdown_rx => {
                debug!(endpoint = %tunnel.endpoint, "tunnel task stopping");
                break;
            }

            _ = ticker.tick() => {
                let wire = {
                    let mut tunn = tunnel.tunn.lock();
                    match tunn.update_timers(&mut timer_buf) {
                        TunnResult::WriteToNetwork(data) => {
                            Some(tunnel.obfuscator.obfuscate(data))
                        }
                        TunnResult::Err(e) => {
                            trace!(endpoint = %tunnel.endpoint, "timer error: {e:?}");
                            None
                        }
                        _ => None,
                    }
                };
                if let Some(wire) = wire {
                    if let Err(e) = tunnel.socket.send(&wire).await {
                        warn!(error = %e, "failed to send timer packet");
                    }
                }
            }

            result = tunnel.socket.recv(&mut recv_buf) => {
                match result {
                    Ok(len) => {
                        let Some(canonical) =
                            tunnel.obfuscator.deobfuscate(&recv_buf[..len])
                        else {
                            tunnel
                                .stats
                                .invalid_packets
                                .fetch_add(1, Ordering::Relaxed);
                            continue;
                        };
                        process_incoming(
                            &tunnel,
                            &canonical,
                            &mut dst_buf,
                            &inbound_tx,
                            &handshake_tx,
                        )
                        .await;
                    }
                    Err(e) => {
                        if tunnel.is_running() {
                            warn!(error = %e, "tunnel socket receive error");
                        }
                    }
                }
            }
        }
    }

    tunnel.running.store(false, Ordering::Release);
}

/// Decapsulate one canonical datagram and act on the result, draining any
/// queued continuation packets.
async fn process_incoming(
    tunnel: &Arc<PeerTunnel>,
    datagram: &[u8],
    dst_buf: &mut [u8],
    inbound_tx: &mpsc::Sender<Vec<u8>>,
    handshake_tx: &watch::Sender<bool>,
) {
    let step = {
        let mut tunn = tunnel.tunn.lock();
        decapsulate_step(&mut tunn, datagram, dst_buf, &tunnel.obfuscator)
    };

    match step {
        DecapStep::Deliver(packet) => {
            tunnel.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
            let _ = handshake_tx.send(true);
            if inbound_tx.send(packet).await.is_err() {
                trace!("device dispatcher gone, packet dropped");
            }
        }
        DecapStep::Respond(wire) => {
            if let Err(e) = tunnel.socket.send(&wire).await {
                warn!(error = %e, "failed to send protocol response");
            } else {
                let _ = handshake_tx.send(true);
            }
            // Drain packets the noise layer queued behind the handshake.
            loop {
                let step = {
                    let mut tunn = tunnel.tunn.lock();
                    decapsulate_step(&mut tunn, &[], dst_buf, &tunnel.obfuscator)
                };
                match step {
                    DecapStep::Deliver(packet) => {
                        tunnel.stats.rx_packets.fetch_add(1, Ordering::Relaxed);
                        if inbound_tx.send(packet).await.is_err() {
                            break;
                        }
                    }
                    DecapStep::Respond(wire) => {
                        if tunnel.socket.send(&wire).await.is_err() {
                            break;
                        }
                    }
                    DecapStep::Idle => break,
                }
            }
        }
        DecapStep::Idle => {}
    }
}

/// Outcome of one decapsulate call.
enum DecapStep {
    /// A decrypted IP packet for the dispatcher
    Deliver(Vec<u8>),
    /// A protocol datagram to put on the wire (already obfuscated)
    Respond(Vec<u8>),
    /// Nothing to do
    Idle,
}

fn decapsulate_step(
    tunn: &mut Tunn,
    datagram: &[u8],
    dst_buf: &mut [u8],
    obfuscator: &WireObfuscator,
) -> DecapStep {
    match tunn.decapsulate(None, datagram, dst_buf) {
        TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
            DecapStep::Deliver(data.to_vec())
        }
        TunnResult::WriteToNetwork(data) => DecapStep::Respond(obfuscator.obfuscate(data)),
        TunnResult::Done => DecapStep::Idle,
        TunnResult::Err(e) => {
            trace!("decapsulation error: {e:?}");
            DecapStep::Idle
        }
    }
}
