//! Userspace AmneziaWG tunnel device
//!
//! The engine behind the relay. Configuration flows the same way the
//! kernel device is driven: [`ipc::create_ipc_request`] compiles the
//! parsed file into `key=value` text, [`AwgDevice::ipc_set`] installs it,
//! and [`AwgDevice::up`] brings one [`tunnel::PeerTunnel`] up per peer and
//! starts the dispatcher that feeds decrypted packets into the
//! [`netstack::VirtualSockets`] table.
//!
//! The relay consumes the device through the [`VirtualStack`] trait only,
//! so tests can swap the whole engine for an in-memory stack.

pub mod ipc;
pub mod netstack;
pub mod obfuscate;
pub mod stack;
pub mod tunnel;

pub use ipc::create_ipc_request;
pub use netstack::{Datagram, DatagramReceiver, VirtualSockets};
pub use obfuscate::WireObfuscator;
pub use stack::{VirtualStack, VirtualUdpConn};
pub use tunnel::{PeerTunnel, PeerTunnelConfig, PeerTunnelStats};

use std::io;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use ipnet::IpNet;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use crate::config::{DeviceConfig, MagicHeaderInterval, ObfuscationConfig};
use crate::error::DeviceError;

/// Queue depth between the peer tunnels and the dispatcher
const INBOUND_CHANNEL_CAPACITY: usize = 1024;

/// Installed IPC configuration.
#[derive(Debug, Clone, Default)]
struct IpcSettings {
    private_key: Option<[u8; 32]>,
    listen_port: u16,
    obfuscation: ObfuscationConfig,
    peers: Vec<IpcPeer>,
}

#[derive(Debug, Clone)]
struct IpcPeer {
    public_key: [u8; 32],
    preshared_key: Option<[u8; 32]>,
    endpoint: Option<String>,
    keepalive: u16,
    allowed_ips: Vec<IpNet>,
}

/// Live state once the device is up.
struct DeviceState {
    peers: Vec<Arc<PeerTunnel>>,
    dispatcher: JoinHandle<()>,
}

/// The userspace tunnel device.
pub struct AwgDevice {
    addresses: Vec<IpAddr>,
    mtu: usize,
    sockets: Arc<VirtualSockets>,
    settings: Mutex<Option<IpcSettings>>,
    state: Mutex<Option<DeviceState>>,
    up: AtomicBool,
}

impl AwgDevice {
    /// Create a device with the given tunnel-side addresses and MTU.
    #[must_use]
    pub fn new(addresses: Vec<IpAddr>, mtu: usize) -> Self {
        Self {
            addresses,
            mtu,
            sockets: Arc::new(VirtualSockets::new()),
            settings: Mutex::new(None),
            state: Mutex::new(None),
            up: AtomicBool::new(false),
        }
    }

    /// Compile, install and bring up a device in one step.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when the IPC text is rejected or a peer
    /// tunnel fails to come up.
    pub async fn start(config: &DeviceConfig) -> Result<Arc<Self>, DeviceError> {
        let device = Arc::new(Self::new(config.addresses.clone(), config.mtu));
        device.ipc_set(&create_ipc_request(config))?;
        device.up().await?;
        Ok(device)
    }

    /// Install a configuration from IPC text. May be called again to
    /// replace the configuration while down.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError::IpcError`] naming the offending line.
    pub fn ipc_set(&self, request: &str) -> Result<(), DeviceError> {
        let settings = parse_ipc(request)?;
        if settings.private_key.is_none() {
            return Err(DeviceError::ipc("missing private_key"));
        }
        *self.settings.lock() = Some(settings);
        Ok(())
    }

    /// Bring the device up: spawn peer tunnels and the packet dispatcher.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] when no configuration is installed, an
    /// endpoint cannot be resolved, or a tunnel fails to start.
    pub async fn up(&self) -> Result<(), DeviceError> {
        if self.up.load(Ordering::Acquire) {
            return Ok(());
        }
        let settings = self
            .settings
            .lock()
            .clone()
            .ok_or_else(|| DeviceError::ipc("no configuration installed"))?;
        let private_key = settings.private_key.expect("checked in ipc_set");

        let obfuscator = Arc::new(WireObfuscator::from_config(Some(&settings.obfuscation)));
        let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CHANNEL_CAPACITY);

        let mut peers = Vec::new();
        for (index, peer) in settings.peers.iter().enumerate() {
            let Some(endpoint) = peer.endpoint.as_deref() else {
                warn!("skipping peer without endpoint");
                continue;
            };
            let endpoint = resolve_endpoint(endpoint).await?;

            let tunnel = PeerTunnel::spawn(
                PeerTunnelConfig {
                    private_key,
                    public_key: peer.public_key,
                    preshared_key: peer.preshared_key,
                    endpoint,
                    keepalive: peer.keepalive,
                    // Only the first tunnel can own the fixed port.
                    listen_port: if index == 0 { settings.listen_port } else { 0 },
                    allowed_ips: peer.allowed_ips.clone(),
                    index: index as u32,
                },
                Arc::clone(&obfuscator),
                inbound_tx.clone(),
            )
            .await?;
            peers.push(tunnel);
        }
        drop(inbound_tx);

        if peers.is_empty() {
            return Err(DeviceError::ipc("no usable peers configured"));
        }

        let dispatcher = tokio::spawn(dispatch_task(
            inbound_rx,
            Arc::clone(&self.sockets),
            self.addresses.clone(),
        ));

        *self.state.lock() = Some(DeviceState { peers, dispatcher });
        self.up.store(true, Ordering::Release);
        info!(peers = self.peer_count(), mtu = self.mtu, "device up");
        Ok(())
    }

    /// Tear the device down: stop every peer tunnel and the dispatcher.
    pub fn down(&self) {
        self.up.store(false, Ordering::Release);
        if let Some(state) = self.state.lock().take() {
            for peer in &state.peers {
                peer.shutdown();
            }
            state.dispatcher.abort();
            info!("device down");
        }
    }

    /// Whether the device is up.
    #[must_use]
    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    /// Number of live peer tunnels.
    #[must_use]
    pub fn peer_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.peers.len())
    }

    /// Wait for the first peer's handshake, mostly useful at startup.
    ///
    /// # Errors
    ///
    /// Returns [`DeviceError`] if the device is down or the handshake does
    /// not complete in time.
    pub async fn wait_handshake(&self, timeout: Duration) -> Result<(), DeviceError> {
        let peer = self
            .state
            .lock()
            .as_ref()
            .and_then(|s| s.peers.first().cloned())
            .ok_or(DeviceError::NotUp)?;
        peer.wait_handshake(timeout).await
    }

    /// The device address matching `remote`'s family.
    fn local_addr_for(&self, remote: IpAddr) -> Option<IpAddr> {
        self.addresses
            .iter()
            .copied()
            .find(|addr| addr.is_ipv4() == remote.is_ipv4())
    }
}

impl Drop for AwgDevice {
    fn drop(&mut self) {
        self.down();
    }
}

impl std::fmt::Debug for AwgDevice {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AwgDevice")
            .field("addresses", &self.addresses)
            .field("mtu", &self.mtu)
            .field("up", &self.is_up())
            .field("peers", &self.peer_count())
            .finish()
    }
}

#[async_trait]
impl VirtualStack for AwgDevice {
    async fn dial_udp(&self, remote: SocketAddr) -> io::Result<Box<dyn VirtualUdpConn>> {
        if !self.is_up() {
            return Err(io::Error::new(io::ErrorKind::NotConnected, "device is down"));
        }

        let peer = {
            let state = self.state.lock();
            state
                .as_ref()
                .and_then(|s| select_peer(&s.peers, remote.ip()))
        }
        .ok_or_else(|| io::Error::other(format!("no peer routes {}", remote.ip())))?;

        let local_ip = self.local_addr_for(remote.ip()).ok_or_else(|| {
            io::Error::other(format!("no device address for {} family", remote.ip()))
        })?;

        let (port, rx) = self
            .sockets
            .allocate()
            .ok_or_else(|| io::Error::other("virtual port space exhausted"))?;

        trace!(%remote, port, "virtual UDP dial");
        Ok(Box::new(NetstackUdpConn {
            local: SocketAddr::new(local_ip, port),
            remote,
            peer,
            sockets: Arc::clone(&self.sockets),
            rx: tokio::sync::Mutex::new(rx),
            mtu: self.mtu,
            closed: AtomicBool::new(false),
        }))
    }
}

/// Pick the peer whose allowed IPs match `ip` with the longest prefix,
/// cryptokey-routing style. Ties keep the earlier peer in file order.
fn select_peer(peers: &[Arc<PeerTunnel>], ip: IpAddr) -> Option<Arc<PeerTunnel>> {
    let mut best: Option<(u8, &Arc<PeerTunnel>)> = None;
    for peer in peers {
        if let Some(len) = peer.match_prefix(ip) {
            if best.map_or(true, |(best_len, _)| len > best_len) {
                best = Some((len, peer));
            }
        }
    }
    best.map(|(_, peer)| Arc::clone(peer))
}

/// Route decrypted IP packets to their virtual sockets.
async fn dispatch_task(
    mut inbound_rx: mpsc::Receiver<Vec<u8>>,
    sockets: Arc<VirtualSockets>,
    addresses: Vec<IpAddr>,
) {
    while let Some(packet) = inbound_rx.recv().await {
        let Some((src, dst, payload)) = netstack::parse_udp_frame(&packet) else {
            trace!("non-UDP packet from tunnel dropped");
            continue;
        };
        if !addresses.contains(&dst.ip()) {
            trace!(%dst, "packet for foreign address dropped");
            continue;
        }
        sockets.dispatch(
            dst.port(),
            Datagram {
                src,
                payload: bytes::Bytes::copy_from_slice(payload),
            },
        );
    }
    debug!("device dispatcher stopped");
}

/// A dialed UDP connection over the virtual stack.
struct NetstackUdpConn {
    local: SocketAddr,
    remote: SocketAddr,
    peer: Arc<PeerTunnel>,
    sockets: Arc<VirtualSockets>,
    rx: tokio::sync::Mutex<DatagramReceiver>,
    mtu: usize,
    closed: AtomicBool,
}

#[async_trait]
impl VirtualUdpConn for NetstackUdpConn {
    async fn recv_deadline(&self, buf: &mut [u8], deadline: Duration) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }

        let mut rx = self.rx.lock().await;
        let recv = tokio::time::timeout(deadline, async {
            loop {
                match rx.recv().await {
                    // Connected semantics: only the dialed remote gets
                    // through.
                    Some(datagram) if datagram.src == self.remote => return Some(datagram),
                    Some(_) => continue,
                    None => return None,
                }
            }
        })
        .await;

        match recv {
            Ok(Some(datagram)) => {
                let n = datagram.payload.len().min(buf.len());
                buf[..n].copy_from_slice(&datagram.payload[..n]);
                Ok(n)
            }
            Ok(None) => Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "virtual socket closed",
            )),
            Err(_) => Err(io::Error::new(io::ErrorKind::TimedOut, "read deadline elapsed")),
        }
    }

    async fn send(&self, buf: &[u8]) -> io::Result<usize> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "connection closed"));
        }

        let frame = netstack::build_udp_frame(self.local, self.remote, buf)
            .ok_or_else(|| io::Error::new(io::ErrorKind::InvalidInput, "address family mismatch"))?;

        // Oversized datagrams are dropped here, best-effort semantics.
        if frame.len() > self.mtu {
            trace!(len = frame.len(), mtu = self.mtu, "datagram exceeds MTU, dropped");
            return Ok(buf.len());
        }

        self.peer.send_ip_packet(&frame).await?;
        Ok(buf.len())
    }

    fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.sockets.release(self.local.port());
        }
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }
}

impl Drop for NetstackUdpConn {
    fn drop(&mut self) {
        self.close();
    }
}

/// Resolve a `host:port` endpoint string.
async fn resolve_endpoint(endpoint: &str) -> Result<SocketAddr, DeviceError> {
    if let Ok(addr) = SocketAddr::from_str(endpoint) {
        return Ok(addr);
    }
    tokio::net::lookup_host(endpoint)
        .await
        .map_err(|e| DeviceError::tunnel(format!("failed to resolve {endpoint}: {e}")))?
        .next()
        .ok_or_else(|| DeviceError::tunnel(format!("no addresses for {endpoint}")))
}

/// Parse IPC text into [`IpcSettings`].
fn parse_ipc(request: &str) -> Result<IpcSettings, DeviceError> {
    let mut settings = IpcSettings::default();

    for line in request.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (key, value) = line
            .split_once('=')
            .ok_or_else(|| DeviceError::ipc(format!("malformed line '{line}'")))?;

        match key {
            "private_key" => settings.private_key = Some(parse_hex_key(value)?),
            "listen_port" => {
                settings.listen_port = value
                    .parse()
                    .map_err(|_| DeviceError::ipc(format!("bad listen_port '{value}'")))?;
            }
            "jc" => settings.obfuscation.junk_packet_count = Some(parse_ipc_u32(key, value)?),
            "jmin" => settings.obfuscation.junk_packet_min_size = Some(parse_ipc_u32(key, value)?),
            "jmax" => settings.obfuscation.junk_packet_max_size = Some(parse_ipc_u32(key, value)?),
            "s1" => settings.obfuscation.init_packet_junk_size = Some(parse_ipc_u32(key, value)?),
            "s2" => {
                settings.obfuscation.response_packet_junk_size = Some(parse_ipc_u32(key, value)?);
            }
            "s3" => {
                settings.obfuscation.cookie_reply_packet_junk_size =
                    Some(parse_ipc_u32(key, value)?);
            }
            "s4" => {
                settings.obfuscation.transport_packet_junk_size = Some(parse_ipc_u32(key, value)?);
            }
            "h1" => settings.obfuscation.init_packet_magic_header = Some(parse_ipc_header(value)?),
            "h2" => {
                settings.obfuscation.response_packet_magic_header = Some(parse_ipc_header(value)?);
            }
            "h3" => {
                settings.obfuscation.underload_packet_magic_header =
                    Some(parse_ipc_header(value)?);
            }
            "h4" => {
                settings.obfuscation.transport_packet_magic_header = Some(parse_ipc_header(value)?);
            }
            // Signature payloads ride through to the handshake layer;
            // stored but not otherwise interpreted by this engine.
            "i1" => settings.obfuscation.i1 = Some(value.to_owned()),
            "i2" => settings.obfuscation.i2 = Some(value.to_owned()),
            "i3" => settings.obfuscation.i3 = Some(value.to_owned()),
            "i4" => settings.obfuscation.i4 = Some(value.to_owned()),
            "i5" => settings.obfuscation.i5 = Some(value.to_owned()),
            "public_key" => settings.peers.push(IpcPeer {
                public_key: parse_hex_key(value)?,
                preshared_key: None,
                endpoint: None,
                keepalive: 0,
                allowed_ips: Vec::new(),
            }),
            "preshared_key" => {
                let peer = current_peer(&mut settings, key)?;
                let psk = parse_hex_key(value)?;
                peer.preshared_key = (psk != [0u8; 32]).then_some(psk);
            }
            "endpoint" => {
                current_peer(&mut settings, key)?.endpoint = Some(value.to_owned());
            }
            "persistent_keepalive_interval" => {
                current_peer(&mut settings, key)?.keepalive = value
                    .parse()
                    .map_err(|_| DeviceError::ipc(format!("bad keepalive '{value}'")))?;
            }
            "allowed_ip" => {
                let net = value
                    .parse::<IpNet>()
                    .map_err(|_| DeviceError::ipc(format!("bad allowed_ip '{value}'")))?;
                current_peer(&mut settings, key)?.allowed_ips.push(net);
            }
            other => {
                return Err(DeviceError::ipc(format!("unknown key '{other}'")));
            }
        }
    }

    settings
        .obfuscation
        .validate()
        .map_err(|e| DeviceError::ipc(e.to_string()))?;

    Ok(settings)
}

fn current_peer<'a>(
    settings: &'a mut IpcSettings,
    key: &str,
) -> Result<&'a mut IpcPeer, DeviceError> {
    settings
        .peers
        .last_mut()
        .ok_or_else(|| DeviceError::ipc(format!("'{key}' before any public_key")))
}

fn parse_ipc_u32(key: &str, value: &str) -> Result<u32, DeviceError> {
    value
        .parse()
        .map_err(|_| DeviceError::ipc(format!("bad {key} '{value}'")))
}

fn parse_ipc_header(value: &str) -> Result<MagicHeaderInterval, DeviceError> {
    MagicHeaderInterval::from_str(value).map_err(|e| DeviceError::ipc(e.to_string()))
}

fn parse_hex_key(value: &str) -> Result<[u8; 32], DeviceError> {
    let value = value.trim();
    if value.len() != 64 {
        return Err(DeviceError::key(format!(
            "expected 64 hex chars, got {}",
            value.len()
        )));
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&value[i * 2..i * 2 + 2], 16)
            .map_err(|_| DeviceError::key("invalid hex digit"))?;
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    const PRIV: &str = "LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=";
    const PEER_PUB: &str = "e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=";

    fn device_conf(extra: &str) -> DeviceConfig {
        DeviceConfig::parse(&format!(
            "[Interface]\nPrivateKey = {PRIV}\nAddress = 10.5.0.2\nDNS = 1.1.1.1\n{extra}\n[Peer]\nPublicKey = {PEER_PUB}\nAllowedIPs = 0.0.0.0/0, ::/0\nEndpoint = 127.0.0.1:51820\nPersistentKeepalive = 25\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_ipc_roundtrip_minimal() {
        let conf = device_conf("");
        let settings = parse_ipc(&create_ipc_request(&conf)).unwrap();
        assert!(settings.private_key.is_some());
        assert_eq!(settings.peers.len(), 1);
        assert_eq!(settings.peers[0].keepalive, 25);
        assert_eq!(
            settings.peers[0].endpoint.as_deref(),
            Some("127.0.0.1:51820")
        );
        assert_eq!(settings.peers[0].allowed_ips.len(), 2);
        // The all-zero preshared key collapses back to none.
        assert!(settings.peers[0].preshared_key.is_none());
    }

    #[test]
    fn test_ipc_roundtrip_obfuscation() {
        let conf = device_conf(
            "Jc = 5\nJmin = 10\nJmax = 50\nS1 = 15\nS2 = 18\nH1 = 100-101\nH2 = 102-103\nH3 = 104\nH4 = 105-106\nI1 = <b 0xA1B2C3D4E5F6>\n",
        );
        let settings = parse_ipc(&create_ipc_request(&conf)).unwrap();
        let awg = &settings.obfuscation;
        assert_eq!(awg.junk_packet_count, Some(5));
        assert_eq!(awg.init_packet_junk_size, Some(15));
        assert_eq!(
            awg.init_packet_magic_header,
            Some(MagicHeaderInterval { min: 100, max: 101 })
        );
        assert_eq!(awg.i1.as_deref(), Some("<b 0xA1B2C3D4E5F6>"));
    }

    #[test]
    fn test_ipc_rejects_unknown_key() {
        let err = parse_ipc("private_key=00\nbogus=1\n").unwrap_err();
        assert!(err.to_string().contains("bogus") || err.to_string().contains("hex"));
    }

    #[test]
    fn test_ipc_rejects_peer_field_without_peer() {
        let err = parse_ipc("endpoint=1.2.3.4:5\n").unwrap_err();
        assert!(err.to_string().contains("public_key"));
    }

    #[test]
    fn test_ipc_rejects_invalid_obfuscation() {
        let key = "11".repeat(32);
        let err = parse_ipc(&format!("private_key={key}\njc=500\n")).unwrap_err();
        assert!(err
            .to_string()
            .contains("value of the Jc field must be within the range of 1 to 128"));
    }

    #[test]
    fn test_parse_hex_key() {
        let key = "0f".repeat(32);
        assert_eq!(parse_hex_key(&key).unwrap(), [0x0f; 32]);
        assert!(parse_hex_key("short").is_err());
        assert!(parse_hex_key(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_ipc_set_requires_private_key() {
        let device = AwgDevice::new(vec!["10.5.0.2".parse().unwrap()], 1420);
        let err = device.ipc_set("listen_port=1\n").unwrap_err();
        assert!(err.to_string().contains("private_key"));
    }

    #[tokio::test]
    async fn test_up_requires_configuration() {
        let device = AwgDevice::new(vec!["10.5.0.2".parse().unwrap()], 1420);
        assert!(device.up().await.is_err());
        assert!(!device.is_up());
    }

    #[tokio::test]
    async fn test_dial_on_down_device_fails() {
        let device = AwgDevice::new(vec!["10.5.0.2".parse().unwrap()], 1420);
        let err = match device.dial_udp("8.8.8.8:53".parse().unwrap()).await {
            Err(e) => e,
            Ok(_) => panic!("expected dial_udp to fail on a down device"),
        };
        assert_eq!(err.kind(), io::ErrorKind::NotConnected);
    }

    #[tokio::test]
    async fn test_device_start_and_dial() {
        let conf = device_conf("");
        let device = AwgDevice::start(&conf).await.unwrap();
        assert!(device.is_up());
        assert_eq!(device.peer_count(), 1);

        // The peer carries catch-all allowed IPs, so any v4 target routes.
        let conn = device.dial_udp("8.8.8.8:53".parse().unwrap()).await.unwrap();
        assert_eq!(conn.remote_addr(), "8.8.8.8:53".parse().unwrap());
        conn.close();

        device.down();
        assert!(!device.is_up());
    }

    #[tokio::test]
    async fn test_select_peer_prefers_longest_prefix() {
        use boringtun::x25519::{PublicKey, StaticSecret};

        let (tx, _rx) = mpsc::channel(16);
        let obfuscator = Arc::new(WireObfuscator::identity());

        // Catch-all peer first, more specific /8 peer second: the /8 must
        // win for addresses it covers regardless of list order.
        let mut peers = Vec::new();
        for (seed, port, allowed) in [
            (0x77u8, 51831u16, vec!["0.0.0.0/0".parse().unwrap()]),
            (0x88, 51832, vec!["10.0.0.0/8".parse().unwrap()]),
        ] {
            let secret = StaticSecret::from([seed; 32]);
            let tunnel = PeerTunnel::spawn(
                PeerTunnelConfig {
                    private_key: [0x11; 32],
                    public_key: PublicKey::from(&secret).to_bytes(),
                    preshared_key: None,
                    endpoint: format!("127.0.0.1:{port}").parse().unwrap(),
                    keepalive: 0,
                    listen_port: 0,
                    allowed_ips: allowed,
                    index: u32::from(seed),
                },
                Arc::clone(&obfuscator),
                tx.clone(),
            )
            .await
            .unwrap();
            peers.push(tunnel);
        }

        let specific = select_peer(&peers, "10.1.2.3".parse().unwrap()).unwrap();
        assert_eq!(specific.endpoint().port(), 51832);

        let fallback = select_peer(&peers, "8.8.8.8".parse().unwrap()).unwrap();
        assert_eq!(fallback.endpoint().port(), 51831);

        // No peer covers v6 here; selection must refuse rather than fall
        // back to the v4 catch-all.
        assert!(select_peer(&peers, "2001:db8::1".parse().unwrap()).is_none());

        for peer in &peers {
            peer.shutdown();
        }
    }

    #[tokio::test]
    async fn test_dial_without_matching_family_fails() {
        // Device only has a v4 address; the peer allows v6 targets too.
        let conf = device_conf("");
        let device = AwgDevice::start(&conf).await.unwrap();
        let err = match device.dial_udp("[2001:db8::1]:53".parse().unwrap()).await {
            Err(e) => e,
            Ok(_) => panic!("expected dial_udp to fail on address family mismatch"),
        };
        assert!(err.to_string().contains("family"));
        device.down();
    }
}
