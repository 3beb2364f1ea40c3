//! AmneziaWG obfuscation parameters
//!
//! The `[Interface]` section may carry the AmneziaWG extension keys: junk
//! packet controls (`Jc`, `Jmin`, `Jmax`), per-type padding sizes
//! (`S1`–`S4`), magic header intervals (`H1`–`H4`) and opaque payloads
//! (`I1`–`I5`). Every field is optional and zero is a meaningful value, so
//! presence is tracked with `Option`s.
//!
//! Validation enforces the cross-field invariants the wire transform relies
//! on. In particular, the receiver classifies obfuscated packets by their
//! exact on-wire length, so the four padded sizes must stay pairwise
//! distinct, and the four header intervals (user-supplied or default) must
//! never overlap. The `Display` strings of [`ObfuscationError`] are a
//! compatibility contract and are reported to the user verbatim.

use std::fmt;
use std::str::FromStr;

use thiserror::Error;

use super::ini::IniSection;

/// WireGuard handshake initiation size on the wire
pub const MESSAGE_INITIATION_SIZE: u32 = 148;
/// WireGuard handshake response size on the wire
pub const MESSAGE_RESPONSE_SIZE: u32 = 92;
/// WireGuard cookie reply size on the wire
pub const MESSAGE_COOKIE_REPLY_SIZE: u32 = 64;
/// Minimum WireGuard transport packet size on the wire
pub const MESSAGE_TRANSPORT_SIZE: u32 = 32;

/// Default magic header values when a field is not configured
pub const DEFAULT_MAGIC_HEADERS: [u32; 4] = [1, 2, 3, 4];

/// Upper bound for junk packet sizes
const JUNK_SIZE_LIMIT: u32 = 1280;
/// Bounds for the junk packet count
const JUNK_COUNT_MIN: u32 = 1;
const JUNK_COUNT_MAX: u32 = 128;

/// Violations of the AmneziaWG parameter invariants.
///
/// The `Display` output of each variant is reported verbatim at startup.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ObfuscationError {
    #[error("value of the Jc field must be within the range of 1 to 128")]
    JunkCountOutOfRange,

    #[error("value of the Jmin field must be less than or equal to Jmax field value")]
    JunkMinAboveMax,

    #[error("value of the Jmax field must be less than or equal 1280")]
    JunkMaxTooLarge,

    #[error("value of the field S1 + message initiation size (148) must not equal S2 + message response size (92)")]
    PacketSizeCollision,

    #[error("value of the field S1 + message initiation size (148) must not equal S2 + message response size (92) + S3 + cookie reply size (64) + S4 + transport packet size (32)")]
    PacketSizeCollisionExtended,

    #[error("values of the H1-H4 fields must be unique")]
    MagicHeaderOverlap,

    #[error("invalid magic header range: lower bound cannot exceed upper bound")]
    MagicHeaderInverted,

    #[error("empty magic header value")]
    EmptyMagicHeader,

    #[error("invalid magic header range format")]
    MagicHeaderFormat,

    #[error("invalid magic header value: {0}")]
    MagicHeaderNumber(String),

    #[error("invalid value for the {field} field: {value}")]
    InvalidNumber { field: &'static str, value: String },
}

/// An inclusive `[min, max]` range of 32-bit magic header values.
///
/// Scalars are represented as `min == max` and print back as the bare
/// number, so parse-then-format round-trips the configured literal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MagicHeaderInterval {
    pub min: u32,
    pub max: u32,
}

impl MagicHeaderInterval {
    /// A scalar interval containing exactly `value`.
    #[must_use]
    pub const fn scalar(value: u32) -> Self {
        Self {
            min: value,
            max: value,
        }
    }

    /// Whether this interval is a single value.
    #[must_use]
    pub const fn is_scalar(&self) -> bool {
        self.min == self.max
    }

    /// Whether `value` falls inside the interval (inclusive).
    #[must_use]
    pub const fn contains(&self, value: u32) -> bool {
        self.min <= value && value <= self.max
    }

    /// Inclusive overlap test against another interval.
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.min <= other.max && other.min <= self.max
    }
}

impl FromStr for MagicHeaderInterval {
    type Err = ObfuscationError;

    /// Accepts `"N"` or `"N-M"` with `N <= M`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.is_empty() {
            return Err(ObfuscationError::EmptyMagicHeader);
        }

        let mut parts = trimmed.splitn(3, '-');
        let lo = parts.next().unwrap_or("");
        if lo.is_empty() {
            return Err(ObfuscationError::MagicHeaderFormat);
        }
        let min: u32 = lo
            .parse()
            .map_err(|_| ObfuscationError::MagicHeaderNumber(lo.to_owned()))?;

        let Some(hi) = parts.next() else {
            return Ok(Self::scalar(min));
        };
        if parts.next().is_some() {
            return Err(ObfuscationError::MagicHeaderFormat);
        }
        if hi.is_empty() {
            return Err(ObfuscationError::MagicHeaderFormat);
        }
        let max: u32 = hi
            .parse()
            .map_err(|_| ObfuscationError::MagicHeaderNumber(hi.to_owned()))?;

        if min > max {
            return Err(ObfuscationError::MagicHeaderInverted);
        }
        Ok(Self { min, max })
    }
}

impl fmt::Display for MagicHeaderInterval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_scalar() {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Parsed AmneziaWG obfuscation parameters.
///
/// Absent fields stay `None`; `Some(0)` is distinct from absent because the
/// IPC emission only carries configured fields.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObfuscationConfig {
    /// `Jc` — number of junk packets before the handshake
    pub junk_packet_count: Option<u32>,
    /// `Jmin` — minimum junk packet size
    pub junk_packet_min_size: Option<u32>,
    /// `Jmax` — maximum junk packet size
    pub junk_packet_max_size: Option<u32>,
    /// `S1` — handshake initiation padding prefix
    pub init_packet_junk_size: Option<u32>,
    /// `S2` — handshake response padding prefix
    pub response_packet_junk_size: Option<u32>,
    /// `S3` — cookie reply padding prefix
    pub cookie_reply_packet_junk_size: Option<u32>,
    /// `S4` — transport packet padding prefix
    pub transport_packet_junk_size: Option<u32>,
    /// `H1` — handshake initiation header interval
    pub init_packet_magic_header: Option<MagicHeaderInterval>,
    /// `H2` — handshake response header interval
    pub response_packet_magic_header: Option<MagicHeaderInterval>,
    /// `H3` — cookie reply (underload) header interval
    pub underload_packet_magic_header: Option<MagicHeaderInterval>,
    /// `H4` — transport header interval
    pub transport_packet_magic_header: Option<MagicHeaderInterval>,
    /// `I1`–`I5` — opaque signature payloads, passed through verbatim
    pub i1: Option<String>,
    pub i2: Option<String>,
    pub i3: Option<String>,
    pub i4: Option<String>,
    pub i5: Option<String>,
}

fn parse_u32(section: &IniSection, key: &'static str) -> Result<Option<u32>, ObfuscationError> {
    match section.get(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse::<u32>()
            .map(Some)
            .map_err(|_| ObfuscationError::InvalidNumber {
                field: key,
                value: raw.to_owned(),
            }),
    }
}

fn parse_interval(
    section: &IniSection,
    key: &str,
) -> Result<Option<MagicHeaderInterval>, ObfuscationError> {
    section.get(key).map(MagicHeaderInterval::from_str).transpose()
}

impl ObfuscationConfig {
    /// Extract and validate the AmneziaWG keys of an `[Interface]` section.
    ///
    /// Returns `Ok(None)` when none of the extension keys are present, so a
    /// plain WireGuard config never grows an obfuscation block.
    ///
    /// # Errors
    ///
    /// Returns the first violated invariant, in the contractual order.
    pub fn from_section(section: &IniSection) -> Result<Option<Self>, ObfuscationError> {
        let config = Self {
            junk_packet_count: parse_u32(section, "Jc")?,
            junk_packet_min_size: parse_u32(section, "Jmin")?,
            junk_packet_max_size: parse_u32(section, "Jmax")?,
            init_packet_junk_size: parse_u32(section, "S1")?,
            response_packet_junk_size: parse_u32(section, "S2")?,
            cookie_reply_packet_junk_size: parse_u32(section, "S3")?,
            transport_packet_junk_size: parse_u32(section, "S4")?,
            init_packet_magic_header: parse_interval(section, "H1")?,
            response_packet_magic_header: parse_interval(section, "H2")?,
            underload_packet_magic_header: parse_interval(section, "H3")?,
            transport_packet_magic_header: parse_interval(section, "H4")?,
            i1: section.get("I1").map(str::to_owned),
            i2: section.get("I2").map(str::to_owned),
            i3: section.get("I3").map(str::to_owned),
            i4: section.get("I4").map(str::to_owned),
            i5: section.get("I5").map(str::to_owned),
        };

        if config == Self::default() {
            return Ok(None);
        }

        config.validate()?;
        Ok(Some(config))
    }

    /// Check the cross-field invariants, first failure wins.
    ///
    /// # Errors
    ///
    /// Returns the violated invariant; the `Display` string is reported to
    /// the user verbatim.
    pub fn validate(&self) -> Result<(), ObfuscationError> {
        if let Some(jc) = self.junk_packet_count {
            if !(JUNK_COUNT_MIN..=JUNK_COUNT_MAX).contains(&jc) {
                return Err(ObfuscationError::JunkCountOutOfRange);
            }
        }
        if let (Some(jmin), Some(jmax)) = (self.junk_packet_min_size, self.junk_packet_max_size) {
            if jmin > jmax {
                return Err(ObfuscationError::JunkMinAboveMax);
            }
        }
        if let Some(jmax) = self.junk_packet_max_size {
            if jmax > JUNK_SIZE_LIMIT {
                return Err(ObfuscationError::JunkMaxTooLarge);
            }
        }

        self.validate_packet_sizes()?;
        self.validate_magic_headers()
    }

    /// The four obfuscated fixed sizes must stay pairwise distinct: the
    /// receiver identifies handshake traffic by exact datagram length.
    fn validate_packet_sizes(&self) -> Result<(), ObfuscationError> {
        let sums = [
            self.init_packet_junk_size.map(|s| MESSAGE_INITIATION_SIZE + s),
            self.response_packet_junk_size.map(|s| MESSAGE_RESPONSE_SIZE + s),
            self.cookie_reply_packet_junk_size.map(|s| MESSAGE_COOKIE_REPLY_SIZE + s),
            self.transport_packet_junk_size.map(|s| MESSAGE_TRANSPORT_SIZE + s),
        ];

        for i in 0..sums.len() {
            let Some(a) = sums[i] else { continue };
            for b in sums[i + 1..].iter().flatten() {
                if a == *b {
                    // The long form is keyed on S3/S4 presence alone, not on
                    // which pair collided.
                    if self.cookie_reply_packet_junk_size.is_some()
                        || self.transport_packet_junk_size.is_some()
                    {
                        return Err(ObfuscationError::PacketSizeCollisionExtended);
                    }
                    return Err(ObfuscationError::PacketSizeCollision);
                }
            }
        }
        Ok(())
    }

    /// The effective intervals (defaults included) must be pairwise
    /// disjoint.
    fn validate_magic_headers(&self) -> Result<(), ObfuscationError> {
        let intervals = self.effective_magic_headers();
        for interval in &intervals {
            if interval.min > interval.max {
                return Err(ObfuscationError::MagicHeaderInverted);
            }
        }
        for i in 0..intervals.len() {
            for j in i + 1..intervals.len() {
                if intervals[i].overlaps(&intervals[j]) {
                    return Err(ObfuscationError::MagicHeaderOverlap);
                }
            }
        }
        Ok(())
    }

    /// The four header intervals the engine actually uses: configured
    /// values where present, the scalar defaults `1..4` otherwise.
    #[must_use]
    pub fn effective_magic_headers(&self) -> [MagicHeaderInterval; 4] {
        let fields = [
            self.init_packet_magic_header,
            self.response_packet_magic_header,
            self.underload_packet_magic_header,
            self.transport_packet_magic_header,
        ];
        let mut out = [MagicHeaderInterval::scalar(0); 4];
        for (i, field) in fields.into_iter().enumerate() {
            out[i] =
                field.unwrap_or(MagicHeaderInterval::scalar(DEFAULT_MAGIC_HEADERS[i]));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ini;

    fn section(body: &str) -> IniSection {
        ini::parse(&format!("[Interface]\n{body}"))
            .unwrap()
            .interface
    }

    #[test]
    fn test_absent_extension_keys_yield_none() {
        let s = section("PrivateKey = k\nAddress = 10.0.0.2\n");
        assert_eq!(ObfuscationConfig::from_section(&s).unwrap(), None);
    }

    #[test]
    fn test_zero_is_present() {
        let s = section("S1 = 0\n");
        let cfg = ObfuscationConfig::from_section(&s).unwrap().unwrap();
        assert_eq!(cfg.init_packet_junk_size, Some(0));
        assert_eq!(cfg.response_packet_junk_size, None);
    }

    #[test]
    fn test_interval_parse_scalar_and_range() {
        let scalar: MagicHeaderInterval = "7".parse().unwrap();
        assert_eq!(scalar, MagicHeaderInterval::scalar(7));
        assert!(scalar.is_scalar());

        let range: MagicHeaderInterval = "100-200".parse().unwrap();
        assert_eq!(range.min, 100);
        assert_eq!(range.max, 200);
        assert!(!range.is_scalar());
    }

    #[test]
    fn test_interval_parse_errors() {
        assert_eq!(
            "".parse::<MagicHeaderInterval>().unwrap_err(),
            ObfuscationError::EmptyMagicHeader
        );
        assert_eq!(
            "-5".parse::<MagicHeaderInterval>().unwrap_err(),
            ObfuscationError::MagicHeaderFormat
        );
        assert_eq!(
            "5-".parse::<MagicHeaderInterval>().unwrap_err(),
            ObfuscationError::MagicHeaderFormat
        );
        assert_eq!(
            "9-3".parse::<MagicHeaderInterval>().unwrap_err(),
            ObfuscationError::MagicHeaderInverted
        );
        assert!(matches!(
            "a-b".parse::<MagicHeaderInterval>().unwrap_err(),
            ObfuscationError::MagicHeaderNumber(_)
        ));
    }

    #[test]
    fn test_interval_roundtrip() {
        for literal in ["1", "42", "4294967295", "1-2", "100-4294967295"] {
            let parsed: MagicHeaderInterval = literal.parse().unwrap();
            assert_eq!(parsed.to_string(), literal);
        }
    }

    #[test]
    fn test_jc_range() {
        let s = section("Jc = 200\nJmin = 10\nJmax = 50\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::JunkCountOutOfRange
        );

        let s = section("Jc = 0\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::JunkCountOutOfRange
        );

        let s = section("Jc = 128\n");
        assert!(ObfuscationConfig::from_section(&s).is_ok());
    }

    #[test]
    fn test_jmin_jmax_order() {
        let s = section("Jc = 5\nJmin = 55\nJmax = 50\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::JunkMinAboveMax
        );
    }

    #[test]
    fn test_jmax_limit() {
        let s = section("Jc = 5\nJmin = 10\nJmax = 1300\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::JunkMaxTooLarge
        );
    }

    #[test]
    fn test_packet_size_collision_short_form() {
        // 148 + 0 == 92 + 56, neither S3 nor S4 set
        let s = section("S1 = 0\nS2 = 56\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::PacketSizeCollision
        );
    }

    #[test]
    fn test_packet_size_collision_long_form() {
        // 148 + 8 == 64 + 92, S3 set so the long form is used
        let s = section("S1 = 8\nS2 = 0\nS3 = 92\nS4 = 0\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::PacketSizeCollisionExtended
        );
    }

    #[test]
    fn test_packet_size_pairwise_distinct_passes() {
        let s = section("S1 = 15\nS2 = 18\nS3 = 20\nS4 = 23\n");
        assert!(ObfuscationConfig::from_section(&s).is_ok());
    }

    #[test]
    fn test_packet_size_unset_fields_do_not_collide() {
        // A1 = 156 would equal A3 = 156 only if S3 were set
        let s = section("S1 = 8\n");
        assert!(ObfuscationConfig::from_section(&s).is_ok());
    }

    #[test]
    fn test_header_overlap_exact_duplicate() {
        let s = section("H1 = 1\nH2 = 2\nH3 = 2\nH4 = 4\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::MagicHeaderOverlap
        );
    }

    #[test]
    fn test_header_overlap_ranges() {
        let s = section("H1 = 100-200\nH2 = 200-300\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::MagicHeaderOverlap
        );
    }

    #[test]
    fn test_header_overlap_against_default() {
        // default H2 is the scalar 2
        let s = section("H1 = 2\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::MagicHeaderOverlap
        );
    }

    #[test]
    fn test_header_overlap_is_symmetric() {
        let forward = section("H1 = 100-200\nH2 = 150-160\n");
        let reverse = section("H1 = 150-160\nH2 = 100-200\n");
        assert_eq!(
            ObfuscationConfig::from_section(&forward).unwrap_err(),
            ObfuscationConfig::from_section(&reverse).unwrap_err()
        );
    }

    #[test]
    fn test_disjoint_ranges_pass() {
        let s = section("H1 = 100-101\nH2 = 102-103\nH3 = 104\nH4 = 105-106\n");
        let cfg = ObfuscationConfig::from_section(&s).unwrap().unwrap();
        assert_eq!(
            cfg.init_packet_magic_header,
            Some(MagicHeaderInterval { min: 100, max: 101 })
        );
        assert_eq!(
            cfg.transport_packet_magic_header,
            Some(MagicHeaderInterval { min: 105, max: 106 })
        );
    }

    #[test]
    fn test_effective_headers_use_defaults() {
        let s = section("H4 = 40-50\n");
        let cfg = ObfuscationConfig::from_section(&s).unwrap().unwrap();
        let effective = cfg.effective_magic_headers();
        assert_eq!(effective[0], MagicHeaderInterval::scalar(1));
        assert_eq!(effective[1], MagicHeaderInterval::scalar(2));
        assert_eq!(effective[2], MagicHeaderInterval::scalar(3));
        assert_eq!(effective[3], MagicHeaderInterval { min: 40, max: 50 });
    }

    #[test]
    fn test_i_fields_pass_through() {
        let s = section("I1 = <b 0xA1B2C3D4E5F6><c>\n");
        let cfg = ObfuscationConfig::from_section(&s).unwrap().unwrap();
        assert_eq!(cfg.i1.as_deref(), Some("<b 0xA1B2C3D4E5F6><c>"));
        assert_eq!(cfg.i2, None);
    }

    #[test]
    fn test_validation_order_jc_first() {
        // Both Jc and the headers are invalid; Jc wins.
        let s = section("Jc = 0\nH1 = 2\n");
        assert_eq!(
            ObfuscationConfig::from_section(&s).unwrap_err(),
            ObfuscationError::JunkCountOutOfRange
        );
    }

    #[test]
    fn test_error_messages_verbatim() {
        assert_eq!(
            ObfuscationError::JunkCountOutOfRange.to_string(),
            "value of the Jc field must be within the range of 1 to 128"
        );
        assert_eq!(
            ObfuscationError::JunkMinAboveMax.to_string(),
            "value of the Jmin field must be less than or equal to Jmax field value"
        );
        assert_eq!(
            ObfuscationError::JunkMaxTooLarge.to_string(),
            "value of the Jmax field must be less than or equal 1280"
        );
        assert_eq!(
            ObfuscationError::PacketSizeCollision.to_string(),
            "value of the field S1 + message initiation size (148) must not equal S2 + message response size (92)"
        );
        assert_eq!(
            ObfuscationError::PacketSizeCollisionExtended.to_string(),
            "value of the field S1 + message initiation size (148) must not equal S2 + message response size (92) + S3 + cookie reply size (64) + S4 + transport packet size (32)"
        );
        assert_eq!(
            ObfuscationError::MagicHeaderOverlap.to_string(),
            "values of the H1-H4 fields must be unique"
        );
    }
}
