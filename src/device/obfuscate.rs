//! AmneziaWG wire transform
//!
//! Sits between the noise layer and the UDP socket. Egress packets get a
//! per-type random prefix (`S1`–`S4`) and their 4-byte type word replaced
//! with a value drawn from the effective magic header interval
//! (`H1`–`H4`); ingress packets are classified by their exact on-wire
//! length — which is why the configuration validator keeps the four padded
//! sizes pairwise distinct — then stripped and restored to canonical
//! WireGuard framing. A burst of junk datagrams (`Jc`/`Jmin`/`Jmax`)
//! precedes the first handshake to disturb flow fingerprints.
//!
//! With no parameters configured the transform is the identity and the
//! wire format is plain WireGuard.

use rand::Rng;

use crate::config::{
    MagicHeaderInterval, ObfuscationConfig, DEFAULT_MAGIC_HEADERS, MESSAGE_COOKIE_REPLY_SIZE,
    MESSAGE_INITIATION_SIZE, MESSAGE_RESPONSE_SIZE, MESSAGE_TRANSPORT_SIZE,
};

/// Canonical WireGuard message types, indexed by `type - 1`.
const MESSAGE_TYPES: [u32; 4] = [1, 2, 3, 4];

/// Fixed wire sizes per message type (transport is a minimum).
const BASE_SIZES: [u32; 4] = [
    MESSAGE_INITIATION_SIZE,
    MESSAGE_RESPONSE_SIZE,
    MESSAGE_COOKIE_REPLY_SIZE,
    MESSAGE_TRANSPORT_SIZE,
];

/// The compiled wire transform for one device.
#[derive(Debug, Clone)]
pub struct WireObfuscator {
    junk_count: u32,
    junk_min: u32,
    junk_max: u32,
    /// Prefix lengths per message type (`S1`–`S4`)
    prefixes: [u32; 4],
    /// Effective header intervals per message type (`H1`–`H4`)
    headers: [MagicHeaderInterval; 4],
    active: bool,
}

impl WireObfuscator {
    /// Compile the transform from validated parameters. `None` yields the
    /// identity transform.
    #[must_use]
    pub fn from_config(config: Option<&ObfuscationConfig>) -> Self {
        let Some(awg) = config else {
            return Self::identity();
        };
        if *awg == ObfuscationConfig::default() {
            return Self::identity();
        }
        Self {
            junk_count: awg.junk_packet_count.unwrap_or(0),
            junk_min: awg.junk_packet_min_size.unwrap_or(0),
            junk_max: awg.junk_packet_max_size.unwrap_or(0),
            prefixes: [
                awg.init_packet_junk_size.unwrap_or(0),
                awg.response_packet_junk_size.unwrap_or(0),
                awg.cookie_reply_packet_junk_size.unwrap_or(0),
                awg.transport_packet_junk_size.unwrap_or(0),
            ],
            headers: awg.effective_magic_headers(),
            active: true,
        }
    }

    /// The identity transform (plain WireGuard framing).
    #[must_use]
    pub fn identity() -> Self {
        let mut headers = [MagicHeaderInterval::scalar(0); 4];
        for (i, h) in headers.iter_mut().enumerate() {
            *h = MagicHeaderInterval::scalar(DEFAULT_MAGIC_HEADERS[i]);
        }
        Self {
            junk_count: 0,
            junk_min: 0,
            junk_max: 0,
            prefixes: [0; 4],
            headers,
            active: false,
        }
    }

    /// Whether any parameter differs from plain WireGuard.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        self.active
    }

    /// Junk datagrams to emit before the first handshake.
    #[must_use]
    pub fn junk_packets(&self) -> Vec<Vec<u8>> {
        let mut rng = rand::thread_rng();
        (0..self.junk_count)
            .map(|_| {
                let len = if self.junk_min >= self.junk_max {
                    self.junk_min
                } else {
                    rng.gen_range(self.junk_min..=self.junk_max)
                };
                let mut packet = vec![0u8; len as usize];
                rng.fill(packet.as_mut_slice());
                packet
            })
            .collect()
    }

    /// Transform an egress packet produced by the noise layer.
    ///
    /// Unknown type words pass through untouched (the noise layer never
    /// produces them; dropping here would hide bugs).
    #[must_use]
    pub fn obfuscate(&self, packet: &[u8]) -> Vec<u8> {
        if !self.active {
            return packet.to_vec();
        }
        let Some(kind) = message_kind(packet) else {
            return packet.to_vec();
        };

        let prefix_len = self.prefixes[kind] as usize;
        let mut rng = rand::thread_rng();
        let mut out = vec![0u8; prefix_len + packet.len()];
        rng.fill(&mut out[..prefix_len]);
        out[prefix_len..].copy_from_slice(packet);

        let interval = self.headers[kind];
        let header = if interval.is_scalar() {
            interval.min
        } else {
            rng.gen_range(interval.min..=interval.max)
        };
        out[prefix_len..prefix_len + 4].copy_from_slice(&header.to_le_bytes());
        out
    }

    /// Undo the transform on an ingress datagram.
    ///
    /// Classification is by exact length for the three fixed-size
    /// handshake messages; everything else is treated as transport.
    /// Returns `None` when the embedded header falls outside the expected
    /// interval — such datagrams are dropped.
    #[must_use]
    pub fn deobfuscate(&self, packet: &[u8]) -> Option<Vec<u8>> {
        if !self.active {
            return Some(packet.to_vec());
        }

        let len = packet.len() as u32;
        let kind = if len == BASE_SIZES[0] + self.prefixes[0] {
            0
        } else if len == BASE_SIZES[1] + self.prefixes[1] {
            1
        } else if len == BASE_SIZES[2] + self.prefixes[2] {
            2
        } else if len >= BASE_SIZES[3] + self.prefixes[3] {
            3
        } else {
            return None;
        };

        let prefix_len = self.prefixes[kind] as usize;
        let body = &packet[prefix_len..];
        let header = u32::from_le_bytes(body[..4].try_into().ok()?);
        if !self.headers[kind].contains(header) {
            return None;
        }

        let mut out = body.to_vec();
        out[..4].copy_from_slice(&MESSAGE_TYPES[kind].to_le_bytes());
        Some(out)
    }
}

/// Map a canonical packet to its message kind index, `None` for unknown
/// type words or runts.
fn message_kind(packet: &[u8]) -> Option<usize> {
    if packet.len() < 4 {
        return None;
    }
    let word = u32::from_le_bytes(packet[..4].try_into().ok()?);
    match word {
        1..=4 => Some(word as usize - 1),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ini;

    fn obfuscator(body: &str) -> WireObfuscator {
        let section = ini::parse(&format!("[Interface]\n{body}"))
            .unwrap()
            .interface;
        let config = ObfuscationConfig::from_section(&section).unwrap();
        WireObfuscator::from_config(config.as_ref())
    }

    fn canonical(kind: u32, len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; len];
        packet[..4].copy_from_slice(&kind.to_le_bytes());
        packet[4..].iter_mut().enumerate().for_each(|(i, b)| {
            *b = (i % 251) as u8;
        });
        packet
    }

    #[test]
    fn test_identity_passthrough() {
        let transform = WireObfuscator::identity();
        assert!(!transform.is_active());
        let packet = canonical(1, 148);
        assert_eq!(transform.obfuscate(&packet), packet);
        assert_eq!(transform.deobfuscate(&packet), Some(packet));
    }

    #[test]
    fn test_junk_packet_burst_shape() {
        let transform = obfuscator("Jc = 5\nJmin = 10\nJmax = 50\n");
        let burst = transform.junk_packets();
        assert_eq!(burst.len(), 5);
        for packet in burst {
            assert!((10..=50).contains(&packet.len()));
        }
    }

    #[test]
    fn test_no_junk_without_count() {
        let transform = obfuscator("S1 = 4\n");
        assert!(transform.junk_packets().is_empty());
    }

    #[test]
    fn test_init_roundtrip_with_prefix_and_header() {
        let transform = obfuscator("S1 = 16\nH1 = 100-200\n");
        let packet = canonical(1, 148);

        let wire = transform.obfuscate(&packet);
        assert_eq!(wire.len(), 148 + 16);
        let header = u32::from_le_bytes(wire[16..20].try_into().unwrap());
        assert!((100..=200).contains(&header));

        let restored = transform.deobfuscate(&wire).unwrap();
        assert_eq!(restored, packet);
    }

    #[test]
    fn test_response_roundtrip_scalar_header() {
        let transform = obfuscator("S2 = 8\nH2 = 7777\n");
        let packet = canonical(2, 92);
        let wire = transform.obfuscate(&packet);
        assert_eq!(wire.len(), 100);
        assert_eq!(
            u32::from_le_bytes(wire[8..12].try_into().unwrap()),
            7777
        );
        assert_eq!(transform.deobfuscate(&wire).unwrap(), packet);
    }

    #[test]
    fn test_transport_roundtrip_variable_length() {
        let transform = obfuscator("S4 = 12\nH4 = 50-60\n");
        for payload in [0usize, 16, 1024] {
            let packet = canonical(4, 32 + payload);
            let wire = transform.obfuscate(&packet);
            assert_eq!(wire.len(), 32 + payload + 12);
            assert_eq!(transform.deobfuscate(&wire).unwrap(), packet);
        }
    }

    #[test]
    fn test_cookie_reply_roundtrip() {
        let transform = obfuscator("S3 = 20\nH3 = 9000\n");
        let packet = canonical(3, 64);
        let wire = transform.obfuscate(&packet);
        assert_eq!(wire.len(), 84);
        assert_eq!(transform.deobfuscate(&wire).unwrap(), packet);
    }

    #[test]
    fn test_ingress_rejects_wrong_header() {
        let transform = obfuscator("H1 = 100-200\n");
        // A 148-byte datagram whose header word is outside [100, 200].
        let mut wire = canonical(1, 148);
        wire[..4].copy_from_slice(&999u32.to_le_bytes());
        assert_eq!(transform.deobfuscate(&wire), None);
    }

    #[test]
    fn test_ingress_rejects_runt() {
        let transform = obfuscator("S4 = 12\n");
        // Shorter than the minimum transport size plus prefix.
        assert_eq!(transform.deobfuscate(&[0u8; 20]), None);
    }

    #[test]
    fn test_default_headers_when_only_sizes_set() {
        let transform = obfuscator("S1 = 4\n");
        let packet = canonical(1, 148);
        let wire = transform.obfuscate(&packet);
        // Default H1 is the scalar 1, so the embedded word stays canonical.
        assert_eq!(u32::from_le_bytes(wire[4..8].try_into().unwrap()), 1);
        assert_eq!(transform.deobfuscate(&wire).unwrap(), packet);
    }

    #[test]
    fn test_length_classification_uses_configured_sizes() {
        let transform = obfuscator("S1 = 15\nS2 = 18\nS3 = 20\nS4 = 23\n");
        for (kind, base) in [(1u32, 148usize), (2, 92), (3, 64)] {
            let packet = canonical(kind, base);
            let wire = transform.obfuscate(&packet);
            assert_eq!(transform.deobfuscate(&wire).unwrap(), packet);
        }
    }
}
