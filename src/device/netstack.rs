//! UDP-only virtual socket table
//!
//! The tunnel moves whole IP packets; the relay wants UDP sockets. This
//! module bridges the two with a port table: each dialed connection owns an
//! ephemeral virtual port and an inbound channel, egress payloads are
//! framed as IPv4/IPv6 + UDP with the device address as source, and
//! decrypted ingress packets are parsed and dispatched to the owning port.
//!
//! Only plain UDP is understood — anything else coming out of the tunnel
//! (ICMP, TCP, v6 extension headers) is dropped by the dispatcher.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU16, Ordering};

use bytes::Bytes;
use dashmap::DashMap;
use tokio::sync::mpsc;
use tracing::trace;

/// First virtual ephemeral port
const EPHEMERAL_PORT_START: u16 = 32768;
/// Inbound datagrams buffered per virtual socket
const SOCKET_CHANNEL_CAPACITY: usize = 128;
/// IPv4 header length (no options are ever emitted)
const IPV4_HEADER_LEN: usize = 20;
/// IPv6 fixed header length
const IPV6_HEADER_LEN: usize = 40;
/// UDP header length
const UDP_HEADER_LEN: usize = 8;
/// IP protocol number for UDP
const PROTO_UDP: u8 = 17;

/// One datagram delivered to a virtual socket.
#[derive(Debug, Clone)]
pub struct Datagram {
    /// Tunnel-side sender
    pub src: SocketAddr,
    /// Payload
    pub payload: Bytes,
}

/// Receiver half of a virtual socket.
pub type DatagramReceiver = mpsc::Receiver<Datagram>;

/// Port-indexed registry of live virtual sockets.
#[derive(Debug, Default)]
pub struct VirtualSockets {
    ports: DashMap<u16, mpsc::Sender<Datagram>>,
    next_port: AtomicU16,
}

impl VirtualSockets {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            ports: DashMap::new(),
            next_port: AtomicU16::new(EPHEMERAL_PORT_START),
        }
    }

    /// Claim a free virtual port and its inbound channel.
    ///
    /// Returns `None` only when every ephemeral port is taken.
    #[must_use]
    pub fn allocate(&self) -> Option<(u16, DatagramReceiver)> {
        let span = usize::from(u16::MAX - EPHEMERAL_PORT_START) + 1;
        for _ in 0..span {
            let candidate = self.next_port.fetch_add(1, Ordering::Relaxed);
            let candidate = if candidate < EPHEMERAL_PORT_START {
                // The counter wrapped; push it back into the ephemeral
                // range and retry.
                self.next_port
                    .store(EPHEMERAL_PORT_START, Ordering::Relaxed);
                continue;
            } else {
                candidate
            };

            use dashmap::mapref::entry::Entry;
            let (tx, rx) = mpsc::channel(SOCKET_CHANNEL_CAPACITY);
            match self.ports.entry(candidate) {
                Entry::Occupied(_) => continue,
                Entry::Vacant(vacant) => {
                    vacant.insert(tx);
                    return Some((candidate, rx));
                }
            }
        }
        None
    }

    /// Release a virtual port. Idempotent.
    pub fn release(&self, port: u16) {
        self.ports.remove(&port);
    }

    /// Deliver an ingress datagram to the socket owning `dst_port`.
    ///
    /// Unknown ports and full channels drop the datagram (best-effort UDP).
    pub fn dispatch(&self, dst_port: u16, datagram: Datagram) {
        if let Some(tx) = self.ports.get(&dst_port) {
            if tx.try_send(datagram).is_err() {
                trace!(dst_port, "virtual socket queue full, datagram dropped");
            }
        } else {
            trace!(dst_port, "no virtual socket for port, datagram dropped");
        }
    }

    /// Number of live virtual sockets.
    #[must_use]
    pub fn len(&self) -> usize {
        self.ports.len()
    }

    /// Whether no virtual sockets exist.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.ports.is_empty()
    }
}

/// Frame a UDP payload into a full IP packet.
///
/// Returns `None` when the families of `src` and `dst` differ.
#[must_use]
pub fn build_udp_frame(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Option<Vec<u8>> {
    let udp_len = UDP_HEADER_LEN + payload.len();

    match (src.ip(), dst.ip()) {
        (IpAddr::V4(src_ip), IpAddr::V4(dst_ip)) => {
            let total_len = IPV4_HEADER_LEN + udp_len;
            let mut packet = vec![0u8; total_len];

            packet[0] = 0x45;
            packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            packet[8] = 64; // TTL
            packet[9] = PROTO_UDP;
            packet[12..16].copy_from_slice(&src_ip.octets());
            packet[16..20].copy_from_slice(&dst_ip.octets());
            let checksum = ipv4_header_checksum(&packet[..IPV4_HEADER_LEN]);
            packet[10..12].copy_from_slice(&checksum.to_be_bytes());

            write_udp_header(&mut packet[IPV4_HEADER_LEN..], src.port(), dst.port(), payload);
            let udp_sum = udp_checksum(
                &src_ip.octets(),
                &dst_ip.octets(),
                &packet[IPV4_HEADER_LEN..],
            );
            packet[IPV4_HEADER_LEN + 6..IPV4_HEADER_LEN + 8]
                .copy_from_slice(&udp_sum.to_be_bytes());
            Some(packet)
        }
        (IpAddr::V6(src_ip), IpAddr::V6(dst_ip)) => {
            let mut packet = vec![0u8; IPV6_HEADER_LEN + udp_len];

            packet[0] = 0x60;
            packet[4..6].copy_from_slice(&(udp_len as u16).to_be_bytes());
            packet[6] = PROTO_UDP;
            packet[7] = 64; // hop limit
            packet[8..24].copy_from_slice(&src_ip.octets());
            packet[24..40].copy_from_slice(&dst_ip.octets());

            write_udp_header(&mut packet[IPV6_HEADER_LEN..], src.port(), dst.port(), payload);
            let udp_sum = udp_checksum(
                &src_ip.octets(),
                &dst_ip.octets(),
                &packet[IPV6_HEADER_LEN..],
            );
            packet[IPV6_HEADER_LEN + 6..IPV6_HEADER_LEN + 8]
                .copy_from_slice(&udp_sum.to_be_bytes());
            Some(packet)
        }
        _ => None,
    }
}

/// Parse an IP packet into `(src, dst, udp payload)`.
///
/// Returns `None` for anything that is not a well-formed UDP packet.
#[must_use]
pub fn parse_udp_frame(packet: &[u8]) -> Option<(SocketAddr, SocketAddr, &[u8])> {
    if packet.is_empty() {
        return None;
    }
    match packet[0] >> 4 {
        4 => {
            if packet.len() < IPV4_HEADER_LEN + UDP_HEADER_LEN {
                return None;
            }
            let ihl = usize::from(packet[0] & 0x0f) * 4;
            if ihl < IPV4_HEADER_LEN || packet.len() < ihl + UDP_HEADER_LEN {
                return None;
            }
            if packet[9] != PROTO_UDP {
                return None;
            }
            let src_ip = IpAddr::from(<[u8; 4]>::try_from(&packet[12..16]).ok()?);
            let dst_ip = IpAddr::from(<[u8; 4]>::try_from(&packet[16..20]).ok()?);
            parse_udp_segment(&packet[ihl..], src_ip, dst_ip)
        }
        6 => {
            if packet.len() < IPV6_HEADER_LEN + UDP_HEADER_LEN {
                return None;
            }
            // Extension headers are not supported; next-header must be UDP.
            if packet[6] != PROTO_UDP {
                return None;
            }
            let src_ip = IpAddr::from(<[u8; 16]>::try_from(&packet[8..24]).ok()?);
            let dst_ip = IpAddr::from(<[u8; 16]>::try_from(&packet[24..40]).ok()?);
            parse_udp_segment(&packet[IPV6_HEADER_LEN..], src_ip, dst_ip)
        }
        _ => None,
    }
}

fn parse_udp_segment(
    segment: &[u8],
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Option<(SocketAddr, SocketAddr, &[u8])> {
    if segment.len() < UDP_HEADER_LEN {
        return None;
    }
    let src_port = u16::from_be_bytes([segment[0], segment[1]]);
    let dst_port = u16::from_be_bytes([segment[2], segment[3]]);
    let udp_len = usize::from(u16::from_be_bytes([segment[4], segment[5]]));
    if udp_len < UDP_HEADER_LEN || udp_len > segment.len() {
        return None;
    }
    Some((
        SocketAddr::new(src_ip, src_port),
        SocketAddr::new(dst_ip, dst_port),
        &segment[UDP_HEADER_LEN..udp_len],
    ))
}

fn write_udp_header(segment: &mut [u8], src_port: u16, dst_port: u16, payload: &[u8]) {
    let udp_len = (UDP_HEADER_LEN + payload.len()) as u16;
    segment[0..2].copy_from_slice(&src_port.to_be_bytes());
    segment[2..4].copy_from_slice(&dst_port.to_be_bytes());
    segment[4..6].copy_from_slice(&udp_len.to_be_bytes());
    segment[6..8].fill(0);
    segment[UDP_HEADER_LEN..UDP_HEADER_LEN + payload.len()].copy_from_slice(payload);
}

/// RFC 1071 ones-complement sum over a buffer.
fn ones_complement_sum(mut sum: u32, data: &[u8]) -> u32 {
    let mut chunks = data.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u32::from(u16::from_be_bytes([chunk[0], chunk[1]]));
    }
    if let [last] = chunks.remainder() {
        sum += u32::from(u16::from_be_bytes([*last, 0]));
    }
    sum
}

fn fold_checksum(mut sum: u32) -> u16 {
    while sum > 0xffff {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    !(sum as u16)
}

fn ipv4_header_checksum(header: &[u8]) -> u16 {
    // Checksum field (bytes 10..12) is zero at this point.
    fold_checksum(ones_complement_sum(0, header))
}

/// UDP checksum over the pseudo-header and segment; works for both
/// families because the pseudo-header is just addresses + proto + length.
fn udp_checksum(src: &[u8], dst: &[u8], segment: &[u8]) -> u16 {
    let mut sum = ones_complement_sum(0, src);
    sum = ones_complement_sum(sum, dst);
    sum += u32::from(PROTO_UDP);
    sum += segment.len() as u32;
    sum = ones_complement_sum(sum, segment);
    let folded = fold_checksum(sum);
    // An all-zero checksum is transmitted as all-ones.
    if folded == 0 {
        0xffff
    } else {
        folded
    }
}
