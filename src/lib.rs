//! awg-bridge: userspace AmneziaWG tunnel with a SOCKS5 UDP relay
//!
//! The bridge terminates an AmneziaWG tunnel (WireGuard with junk packets,
//! padding prefixes and magic-header rewriting) entirely in process and
//! exposes it to local clients as a SOCKS5 UDP relay. No kernel devices,
//! raw sockets or routing table changes are involved.
//!
//! # Architecture
//!
//! ```text
//! SOCKS5 client ──UDP──> relay loop ──> connection pool ──> virtual stack
//!                                            │                    │
//!                                        DNS cache          peer tunnels
//!                                                           (boringtun +
//!                                                            AWG transform)
//! ```
//!
//! Configuration is a wg-quick style file with the AmneziaWG extension
//! keys on the `[Interface]` section; it is compiled into the engine's
//! `key=value` IPC text after cross-field validation.
//!
//! # Quick Start
//!
//! ```no_run
//! use awg_bridge::config::load_config;
//! use awg_bridge::device::AwgDevice;
//! use awg_bridge::relay::{UdpRelay, UdpRelayConfig};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = load_config("/etc/awg-bridge.conf")?;
//! let device = AwgDevice::start(&config).await?;
//!
//! let relay = UdpRelay::bind(UdpRelayConfig::default(), device).await?;
//! relay.run().await?;
//! # Ok(())
//! # }
//! ```
//!
//! # Modules
//!
//! - [`config`]: INI loading and the AmneziaWG parameter compiler
//! - [`device`]: the userspace tunnel engine and virtual network stack
//! - [`relay`]: the SOCKS5 UDP relay (codec, pool, DNS cache, server)
//! - [`io`]: packet buffer pooling
//! - [`error`]: error taxonomy

#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod device;
pub mod error;
pub mod io;
pub mod relay;

pub use config::{
    load_config, DeviceConfig, MagicHeaderInterval, ObfuscationConfig, ObfuscationError,
    PeerConfig,
};
pub use device::{
    create_ipc_request, AwgDevice, PeerTunnel, PeerTunnelConfig, VirtualStack, VirtualUdpConn,
    WireObfuscator,
};
pub use error::{BridgeError, ConfigError, DeviceError, RelayError, Result};
pub use relay::{
    ConnectionPool, DnsCache, UdpAssociation, UdpRelay, UdpRelayConfig, UdpRelayStats,
    UdpRelayStatsSnapshot,
};

/// Crate version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
