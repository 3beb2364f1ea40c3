//! SOCKS5 UDP datagram codec (RFC 1928 section 7)
//!
//! Request datagrams from local clients carry the target behind a small
//! header; replies carry the resolved source the same way:
//!
//! ```text
//! +------+------+------+----------+----------+----------+
//! | RSV  | FRAG | ATYP | DST.ADDR | DST.PORT |   DATA   |
//! +------+------+------+----------+----------+----------+
//! |  2   |  1   |  1   | Variable |    2     | Variable |
//! +------+------+------+----------+----------+----------+
//! ```
//!
//! Fragmentation is not supported: any nonzero FRAG is rejected, and
//! rejected datagrams are dropped silently by the relay. Replies always use
//! the IP the relay actually connected to (ATYP 0x01 or 0x04), never the
//! original domain.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::ops::Deref;
use std::sync::Arc;

use crate::error::RelayError;
use crate::io::{PacketBuffer, PacketBufferPool, PACKET_BUFFER_SIZE};

/// SOCKS5 address type: IPv4
pub const ATYP_IPV4: u8 = 0x01;
/// SOCKS5 address type: domain name
pub const ATYP_DOMAIN: u8 = 0x03;
/// SOCKS5 address type: IPv6
pub const ATYP_IPV6: u8 = 0x04;

/// Smallest valid datagram: header with an IPv4 address and empty payload
pub const HEADER_IPV4_LEN: usize = 10;
/// Header length with an IPv6 address
pub const HEADER_IPV6_LEN: usize = 22;

/// Target of a request datagram.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TargetAddr {
    /// Literal IPv4/IPv6 address
    Ip(IpAddr),
    /// Hostname requiring resolution
    Domain(String),
}

impl std::fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Ip(ip) => write!(f, "{ip}"),
            Self::Domain(d) => write!(f, "{d}"),
        }
    }
}

/// A parsed request datagram; `payload` borrows from the input buffer.
#[derive(Debug)]
pub struct UdpRequest<'a> {
    /// Requested destination
    pub target: TargetAddr,
    /// Destination port
    pub port: u16,
    /// Bytes consumed by the header
    pub header_len: usize,
    /// User payload following the header
    pub payload: &'a [u8],
}

/// Parse a request datagram.
///
/// # Errors
///
/// Returns [`RelayError::MalformedSocks5`] for short datagrams, nonzero
/// RSV/FRAG, unknown ATYP, or a declared length exceeding the buffer. The
/// relay drops such datagrams silently.
pub fn parse_request(data: &[u8]) -> Result<UdpRequest<'_>, RelayError> {
    if data.len() < HEADER_IPV4_LEN {
        return Err(RelayError::malformed(format!(
            "datagram too short: {} bytes",
            data.len()
        )));
    }
    if data[0] != 0 || data[1] != 0 {
        return Err(RelayError::malformed("nonzero RSV field"));
    }
    if data[2] != 0 {
        return Err(RelayError::malformed(format!(
            "fragmented datagram (FRAG={})",
            data[2]
        )));
    }

    match data[3] {
        ATYP_IPV4 => {
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            Ok(UdpRequest {
                target: TargetAddr::Ip(IpAddr::V4(ip)),
                port,
                header_len: HEADER_IPV4_LEN,
                payload: &data[HEADER_IPV4_LEN..],
            })
        }
        ATYP_DOMAIN => {
            let domain_len = data[4] as usize;
            let header_len = 5 + domain_len + 2;
            if data.len() < header_len {
                return Err(RelayError::malformed(format!(
                    "domain length {domain_len} exceeds datagram"
                )));
            }
            let domain = std::str::from_utf8(&data[5..5 + domain_len])
                .map_err(|_| RelayError::malformed("domain is not valid UTF-8"))?;
            let port = u16::from_be_bytes([data[5 + domain_len], data[6 + domain_len]]);
            Ok(UdpRequest {
                target: TargetAddr::Domain(domain.to_owned()),
                port,
                header_len,
                payload: &data[header_len..],
            })
        }
        ATYP_IPV6 => {
            if data.len() < HEADER_IPV6_LEN {
                return Err(RelayError::malformed("datagram too short for IPv6 address"));
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            let port = u16::from_be_bytes([data[20], data[21]]);
            Ok(UdpRequest {
                target: TargetAddr::Ip(IpAddr::V6(Ipv6Addr::from(octets))),
                port,
                header_len: HEADER_IPV6_LEN,
                payload: &data[HEADER_IPV6_LEN..],
            })
        }
        other => Err(RelayError::malformed(format!(
            "unknown address type {other:#04x}"
        ))),
    }
}

/// Header length for a reply carrying `ip`.
#[must_use]
pub const fn response_header_len(ip: &IpAddr) -> usize {
    match ip {
        IpAddr::V4(_) => HEADER_IPV4_LEN,
        IpAddr::V6(_) => HEADER_IPV6_LEN,
    }
}

/// An encoded reply datagram.
///
/// Backed by a pooled buffer when the reply fits in one; oversized replies
/// fall back to a one-shot heap buffer that never enters the pool.
pub struct ResponseDatagram {
    storage: Storage,
}

enum Storage {
    Pooled { buf: PacketBuffer, len: usize },
    Heap(Vec<u8>),
}

impl Deref for ResponseDatagram {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        match &self.storage {
            Storage::Pooled { buf, len } => &buf[..*len],
            Storage::Heap(vec) => vec,
        }
    }
}

impl AsRef<[u8]> for ResponseDatagram {
    fn as_ref(&self) -> &[u8] {
        self
    }
}

/// Build a reply datagram from the resolved IP, the original target port
/// and the payload read off the tunnel.
#[must_use]
pub fn encode_response(
    pool: &Arc<PacketBufferPool>,
    ip: IpAddr,
    port: u16,
    payload: &[u8],
) -> ResponseDatagram {
    let header_len = response_header_len(&ip);
    let total = header_len + payload.len();

    if total > PACKET_BUFFER_SIZE {
        let mut vec = vec![0u8; total];
        write_header(&mut vec, ip, port);
        vec[header_len..].copy_from_slice(payload);
        return ResponseDatagram {
            storage: Storage::Heap(vec),
        };
    }

    let mut buf = pool.get();
    write_header(&mut buf, ip, port);
    buf[header_len..total].copy_from_slice(payload);
    ResponseDatagram {
        storage: Storage::Pooled { buf, len: total },
    }
}

fn write_header(buf: &mut [u8], ip: IpAddr, port: u16) {
    buf[0] = 0;
    buf[1] = 0;
    buf[2] = 0;
    match ip {
        IpAddr::V4(v4) => {
            buf[3] = ATYP_IPV4;
            buf[4..8].copy_from_slice(&v4.octets());
            buf[8..10].copy_from_slice(&port.to_be_bytes());
        }
        IpAddr::V6(v6) => {
            buf[3] = ATYP_IPV6;
            buf[4..20].copy_from_slice(&v6.octets());
            buf[20..22].copy_from_slice(&port.to_be_bytes());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> Arc<PacketBufferPool> {
        Arc::new(PacketBufferPool::new(4))
    }

    fn ipv4_request(ip: [u8; 4], port: u16, payload: &[u8]) -> Vec<u8> {
        let mut data = vec![0, 0, 0, ATYP_IPV4];
        data.extend_from_slice(&ip);
        data.extend_from_slice(&port.to_be_bytes());
        data.extend_from_slice(payload);
        data
    }

    #[test]
    fn test_parse_ipv4() {
        let data = ipv4_request([8, 8, 8, 8], 53, b"query");
        let req = parse_request(&data).unwrap();
        assert_eq!(req.target, TargetAddr::Ip("8.8.8.8".parse().unwrap()));
        assert_eq!(req.port, 53);
        assert_eq!(req.header_len, HEADER_IPV4_LEN);
        assert_eq!(req.payload, b"query");
    }

    #[test]
    fn test_parse_domain() {
        let mut data = vec![0, 0, 0, ATYP_DOMAIN, 11];
        data.extend_from_slice(b"example.com");
        data.extend_from_slice(&443u16.to_be_bytes());
        data.extend_from_slice(b"hello");
        let req = parse_request(&data).unwrap();
        assert_eq!(req.target, TargetAddr::Domain("example.com".into()));
        assert_eq!(req.port, 443);
        assert_eq!(req.payload, b"hello");
    }

    #[test]
    fn test_parse_ipv6() {
        let mut data = vec![0, 0, 0, ATYP_IPV6];
        data.extend_from_slice(&Ipv6Addr::LOCALHOST.octets());
        data.extend_from_slice(&8080u16.to_be_bytes());
        data.extend_from_slice(&[0xAA, 0xBB]);
        let req = parse_request(&data).unwrap();
        assert_eq!(req.target, TargetAddr::Ip(IpAddr::V6(Ipv6Addr::LOCALHOST)));
        assert_eq!(req.port, 8080);
        assert_eq!(req.header_len, HEADER_IPV6_LEN);
        assert_eq!(req.payload, &[0xAA, 0xBB]);
    }

    #[test]
    fn test_reject_short_datagram() {
        assert!(parse_request(&[0, 0, 0, ATYP_IPV4, 1, 2]).is_err());
    }

    #[test]
    fn test_reject_nonzero_rsv() {
        let mut data = ipv4_request([1, 2, 3, 4], 1, b"");
        data[0] = 1;
        assert!(parse_request(&data).is_err());
    }

    #[test]
    fn test_reject_fragmented() {
        let mut data = ipv4_request([1, 2, 3, 4], 1, b"");
        data[2] = 1;
        assert!(parse_request(&data).is_err());
    }

    #[test]
    fn test_reject_unknown_atyp() {
        let mut data = ipv4_request([1, 2, 3, 4], 1, b"");
        data[3] = 0x05;
        assert!(parse_request(&data).is_err());
    }

    #[test]
    fn test_reject_domain_length_overrun() {
        // Declared domain length runs past the buffer
        let data = vec![0, 0, 0, ATYP_DOMAIN, 200, b'a', b'b'];
        assert!(parse_request(&data).is_err());
    }

    #[test]
    fn test_parse_empty_domain() {
        // A zero-length domain is structurally valid and yields an empty
        // host; resolution of it fails later on the creation path.
        let mut data = vec![0, 0, 0, ATYP_DOMAIN, 0];
        data.extend_from_slice(&443u16.to_be_bytes());
        data.extend_from_slice(b"abc");
        let req = parse_request(&data).unwrap();
        assert_eq!(req.target, TargetAddr::Domain(String::new()));
        assert_eq!(req.port, 443);
        assert_eq!(req.header_len, 7);
        assert_eq!(req.payload, b"abc");
    }

    #[test]
    fn test_reject_truncated_ipv6() {
        let mut data = vec![0, 0, 0, ATYP_IPV6];
        data.extend_from_slice(&[0u8; 10]);
        assert!(parse_request(&data).is_err());
    }

    #[test]
    fn test_response_roundtrip_ipv4() {
        let pool = pool();
        let ip: IpAddr = "93.184.216.34".parse().unwrap();
        let reply = encode_response(&pool, ip, 443, b"response-data");
        let req = parse_request(&reply).unwrap();
        assert_eq!(req.target, TargetAddr::Ip(ip));
        assert_eq!(req.port, 443);
        assert_eq!(req.payload, b"response-data");
    }

    #[test]
    fn test_response_roundtrip_ipv6() {
        let pool = pool();
        let ip: IpAddr = "2001:db8::1".parse().unwrap();
        let reply = encode_response(&pool, ip, 53, &[1, 2, 3]);
        assert_eq!(reply[3], ATYP_IPV6);
        assert_eq!(reply.len(), HEADER_IPV6_LEN + 3);
        let req = parse_request(&reply).unwrap();
        assert_eq!(req.target, TargetAddr::Ip(ip));
    }

    #[test]
    fn test_oversized_response_bypasses_pool() {
        let pool = pool();
        let payload = vec![0x42; PACKET_BUFFER_SIZE];
        let reply = encode_response(&pool, "10.0.0.1".parse().unwrap(), 9, &payload);
        assert_eq!(reply.len(), HEADER_IPV4_LEN + payload.len());
        drop(reply);
        // Heap fallback must not have entered the pool
        assert_eq!(pool.stats().returns(), 0);
    }

    #[test]
    fn test_empty_payload_roundtrip() {
        let pool = pool();
        let ip: IpAddr = "1.1.1.1".parse().unwrap();
        let reply = encode_response(&pool, ip, 5353, b"");
        assert_eq!(reply.len(), HEADER_IPV4_LEN);
        let req = parse_request(&reply).unwrap();
        assert!(req.payload.is_empty());
        assert_eq!(req.port, 5353);
    }
}
