//! SOCKS5 UDP relay
//!
//! The relay terminates the SOCKS5 UDP ASSOCIATE data path on a local
//! socket and bridges it into the tunnel's virtual network stack:
//!
//! ```text
//! client ──> receive loop ──> codec parse ──> pool lookup/create ──> tunnel conn
//!                                                                       │
//! client <── codec format <── per-association reader <─────────────────-┘
//! ```
//!
//! - [`socks5`]: datagram parse/format
//! - [`dns_cache`]: short-TTL host resolution for domain targets
//! - [`pool`]: association cache with eviction and creation dedup
//! - [`server`]: receive loop, reader tasks, janitor

pub mod dns_cache;
pub mod pool;
pub mod server;
pub mod socks5;

pub use dns_cache::{DnsCache, DNS_CACHE_TTL};
pub use pool::{ConnectionPool, ShutdownReceiver, UdpAssociation};
pub use server::{
    UdpRelay, UdpRelayConfig, UdpRelayStats, UdpRelayStatsSnapshot, DEFAULT_JANITOR_INTERVAL,
    DEFAULT_MAX_ASSOCIATIONS, DEFAULT_MAX_IDLE, READ_DEADLINE,
};
pub use socks5::{
    encode_response, parse_request, response_header_len, ResponseDatagram, TargetAddr,
    UdpRequest, ATYP_DOMAIN, ATYP_IPV4, ATYP_IPV6, HEADER_IPV4_LEN, HEADER_IPV6_LEN,
};
