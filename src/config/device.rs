//! Device and peer configuration
//!
//! Builds [`DeviceConfig`] from a parsed INI document: interface identity
//! (key, addresses, DNS, MTU, listen port), the optional AmneziaWG
//! parameter block, and one [`PeerConfig`] per `[Peer]` section.
//!
//! Keys arrive Base64-encoded in the file and are re-encoded to lowercase
//! hex here, which is what the engine's IPC surface expects. A missing
//! preshared key becomes the all-zero key so the IPC emission never has to
//! special-case it.

use std::net::IpAddr;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;

use super::ini::{self, IniSection};
use super::obfuscation::ObfuscationConfig;
use crate::error::ConfigError;

/// Default device MTU when the file does not set one
pub const DEFAULT_MTU: usize = 1420;

/// Length of a WireGuard key in raw bytes
pub const KEY_LEN: usize = 32;

/// The all-zero preshared key in hex (the protocol's "no PSK" value)
const ZERO_PSK_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A single `[Peer]` section.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerConfig {
    /// Peer public key, lowercase hex
    pub public_key: String,
    /// Preshared key, lowercase hex (all zeros when not configured)
    pub preshared_key: String,
    /// Endpoint as written (`host:port`), resolved when the device dials
    pub endpoint: Option<String>,
    /// `PersistentKeepalive` in seconds, 0 when not configured
    pub keepalive: u16,
    /// `AllowedIPs` prefixes; empty means the catch-all defaults apply
    pub allowed_ips: Vec<IpNet>,
}

/// The `[Interface]` section plus all peers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Interface private key, lowercase hex
    pub private_key: String,
    /// Optional fixed listen port for the tunnel socket
    pub listen_port: Option<u16>,
    /// Device addresses inside the tunnel (CIDR suffixes stripped)
    pub addresses: Vec<IpAddr>,
    /// DNS servers advertised for the tunnel
    pub dns: Vec<IpAddr>,
    /// Device MTU
    pub mtu: usize,
    /// AmneziaWG parameters, absent for plain WireGuard configs
    pub obfuscation: Option<ObfuscationConfig>,
    /// Peers in file order
    pub peers: Vec<PeerConfig>,
}

impl DeviceConfig {
    /// Parse a configuration file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] on structural problems, invalid field
    /// values, or any violated AmneziaWG invariant (whose message is the
    /// user-visible contract).
    pub fn parse(input: &str) -> Result<Self, ConfigError> {
        let doc = ini::parse(input)?;
        let iface = &doc.interface;

        let private_key = iface
            .get("PrivateKey")
            .ok_or_else(|| ConfigError::parse("missing PrivateKey in [Interface]"))?;
        let private_key = base64_key_to_hex(private_key, "PrivateKey")?;

        let listen_port = parse_optional_number::<u16>(iface, "ListenPort")?;

        let addresses = parse_addr_list(iface, "Address")?;
        if addresses.is_empty() {
            return Err(ConfigError::parse("missing Address in [Interface]"));
        }
        let dns = parse_addr_list(iface, "DNS")?;

        let mtu = parse_optional_number::<usize>(iface, "MTU")?.unwrap_or(DEFAULT_MTU);

        let obfuscation = ObfuscationConfig::from_section(iface)?;

        let peers = doc
            .peers
            .iter()
            .map(parse_peer)
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self {
            private_key,
            listen_port,
            addresses,
            dns,
            mtu,
            obfuscation,
            peers,
        })
    }
}

fn parse_peer(section: &IniSection) -> Result<PeerConfig, ConfigError> {
    let public_key = section
        .get("PublicKey")
        .ok_or_else(|| ConfigError::parse("peer section missing PublicKey"))?;
    let public_key = base64_key_to_hex(public_key, "PublicKey")?;

    let preshared_key = match section.get("PresharedKey") {
        Some(psk) => base64_key_to_hex(psk, "PresharedKey")?,
        None => ZERO_PSK_HEX.to_owned(),
    };

    let endpoint = section.get("Endpoint").map(str::to_owned);
    if let Some(ep) = endpoint.as_deref() {
        if ep.rfind(':').is_none() {
            return Err(ConfigError::validation(format!(
                "peer Endpoint must be host:port, got '{ep}'"
            )));
        }
    }

    let keepalive = parse_optional_number::<u16>(section, "PersistentKeepalive")?.unwrap_or(0);

    let allowed_ips = section
        .get_list("AllowedIPs")
        .iter()
        .map(|entry| parse_prefix(entry))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(PeerConfig {
        public_key,
        preshared_key,
        endpoint,
        keepalive,
        allowed_ips,
    })
}

/// Decode a Base64 WireGuard key and re-encode it as lowercase hex.
fn base64_key_to_hex(key: &str, field: &str) -> Result<String, ConfigError> {
    let bytes = BASE64
        .decode(key.trim())
        .map_err(|e| ConfigError::validation(format!("{field} is not valid Base64: {e}")))?;
    if bytes.len() != KEY_LEN {
        return Err(ConfigError::validation(format!(
            "{field} must decode to {KEY_LEN} bytes, got {}",
            bytes.len()
        )));
    }
    let mut hex = String::with_capacity(KEY_LEN * 2);
    for b in bytes {
        use std::fmt::Write;
        let _ = write!(hex, "{b:02x}");
    }
    Ok(hex)
}

fn parse_optional_number<T: std::str::FromStr>(
    section: &IniSection,
    key: &str,
) -> Result<Option<T>, ConfigError> {
    match section.get(key) {
        None => Ok(None),
        Some(raw) => raw.trim().parse::<T>().map(Some).map_err(|_| {
            ConfigError::validation(format!("invalid value for {key}: '{raw}'"))
        }),
    }
}

/// Parse a comma list of addresses, accepting bare IPs or CIDR notation
/// and keeping only the address part.
fn parse_addr_list(section: &IniSection, key: &str) -> Result<Vec<IpAddr>, ConfigError> {
    section
        .get_list(key)
        .iter()
        .map(|entry| {
            let host = entry.split('/').next().unwrap_or(entry);
            host.parse::<IpAddr>().map_err(|_| {
                ConfigError::validation(format!("invalid {key} entry: '{entry}'"))
            })
        })
        .collect()
}

/// Parse an allowed-IPs entry, accepting bare IPs as host prefixes.
fn parse_prefix(entry: &str) -> Result<IpNet, ConfigError> {
    if let Ok(net) = entry.parse::<IpNet>() {
        return Ok(net);
    }
    entry
        .parse::<IpAddr>()
        .map(IpNet::from)
        .map_err(|_| ConfigError::validation(format!("invalid AllowedIPs entry: '{entry}'")))
}
