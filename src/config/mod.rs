//! Configuration types and loading
//!
//! The bridge reads a wg-quick style file with one `[Interface]` section
//! (interface identity plus the optional AmneziaWG extension keys) and any
//! number of `[Peer]` sections. Parsing is split into three layers:
//!
//! - [`ini`]: the section scanner (case-insensitive keys, comments,
//!   repeated peers)
//! - [`obfuscation`]: the AmneziaWG parameter block with its cross-field
//!   validation — error strings here are reported to the user verbatim
//! - [`device`]: assembly into [`DeviceConfig`] / [`PeerConfig`]

pub mod device;
pub mod ini;
pub mod obfuscation;

pub use device::{DeviceConfig, PeerConfig, DEFAULT_MTU, KEY_LEN};
pub use ini::{IniDocument, IniSection};
pub use obfuscation::{
    MagicHeaderInterval, ObfuscationConfig, ObfuscationError, DEFAULT_MAGIC_HEADERS,
    MESSAGE_COOKIE_REPLY_SIZE, MESSAGE_INITIATION_SIZE, MESSAGE_RESPONSE_SIZE,
    MESSAGE_TRANSPORT_SIZE,
};

use std::path::Path;

use crate::error::ConfigError;

/// Load and fully validate a configuration file from disk.
///
/// # Errors
///
/// Returns [`ConfigError`] when the file cannot be read or any field or
/// invariant is invalid.
pub fn load_config(path: impl AsRef<Path>) -> Result<DeviceConfig, ConfigError> {
    let path = path.as_ref();
    let input = std::fs::read_to_string(path).map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound {
            ConfigError::FileNotFound {
                path: path.display().to_string(),
            }
        } else {
            ConfigError::IoError(e)
        }
    })?;
    DeviceConfig::parse(&input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_config_missing_file() {
        let err = load_config("/nonexistent/awg-bridge.conf").unwrap_err();
        assert!(matches!(err, ConfigError::FileNotFound { .. }));
    }
}
