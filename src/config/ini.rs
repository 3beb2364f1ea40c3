//! wg-quick style INI scanning
//!
//! The bridge consumes the same `[Interface]` / `[Peer]` file layout as
//! `wg-quick`, with the AmneziaWG extension keys on the interface section.
//! Matching is case-insensitive for both section headers and keys, `#` and
//! `;` start comments, and repeated `[Peer]` sections accumulate.
//!
//! The scanner is deliberately lenient: unknown sections and keys are
//! ignored so configs written for richer tools still load.

use crate::error::ConfigError;

/// A single parsed section: ordered `(key, value)` pairs with the key
/// already lowercased.
#[derive(Debug, Clone, Default)]
pub struct IniSection {
    entries: Vec<(String, String)>,
}

impl IniSection {
    /// Look up the first value for `key` (case-insensitive).
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }

    /// Whether `key` is present at all.
    #[must_use]
    pub fn has(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Collect every occurrence of `key`, splitting each value on commas.
    #[must_use]
    pub fn get_list(&self, key: &str) -> Vec<String> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .filter(|(k, _)| *k == key)
            .flat_map(|(_, v)| v.split(','))
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect()
    }

    /// Number of entries in the section.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the section holds no entries.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn push(&mut self, key: &str, value: &str) {
        self.entries
            .push((key.to_ascii_lowercase(), value.to_owned()));
    }
}

/// A parsed configuration file: one interface section plus zero or more
/// peer sections in file order.
#[derive(Debug, Clone)]
pub struct IniDocument {
    /// The `[Interface]` section
    pub interface: IniSection,
    /// Every `[Peer]` section, in order
    pub peers: Vec<IniSection>,
}

/// Parse a configuration file into its sections.
///
/// # Errors
///
/// Returns [`ConfigError::ParseError`] if no `[Interface]` section is
/// present.
pub fn parse(input: &str) -> Result<IniDocument, ConfigError> {
    #[derive(PartialEq)]
    enum Section {
        None,
        Interface,
        Peer,
        Other,
    }

    let mut section = Section::None;
    let mut interface: Option<IniSection> = None;
    let mut peers: Vec<IniSection> = Vec::new();

    for line in input.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }

        if line.starts_with('[') && line.ends_with(']') {
            let name = line[1..line.len() - 1].trim();
            if name.eq_ignore_ascii_case("interface") {
                section = Section::Interface;
                interface.get_or_insert_with(IniSection::default);
            } else if name.eq_ignore_ascii_case("peer") {
                section = Section::Peer;
                peers.push(IniSection::default());
            } else {
                section = Section::Other;
            }
            continue;
        }

        let Some((key, value)) = line.split_once('=') else {
            continue;
        };
        let key = key.trim();
        let value = value.trim();
        if key.is_empty() {
            continue;
        }

        match section {
            Section::Interface => {
                if let Some(iface) = interface.as_mut() {
                    iface.push(key, value);
                }
            }
            Section::Peer => {
                if let Some(peer) = peers.last_mut() {
                    peer.push(key, value);
                }
            }
            Section::None | Section::Other => {}
        }
    }

    let interface = interface
        .ok_or_else(|| ConfigError::parse("missing [Interface] section"))?;

    Ok(IniDocument { interface, peers })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.5.0.2, fd00::2/64
DNS = 1.1.1.1
# a comment
; another comment

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = 94.140.11.15:51820
PersistentKeepalive = 25
";

    #[test]
    fn test_parse_sections() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(doc.peers.len(), 1);
        assert!(doc.interface.has("PrivateKey"));
        assert!(doc.peers[0].has("PublicKey"));
    }

    #[test]
    fn test_case_insensitive_keys() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(
            doc.interface.get("privatekey"),
            doc.interface.get("PrivateKey")
        );
        assert_eq!(
            doc.peers[0].get("ALLOWEDIPS"),
            doc.peers[0].get("AllowedIPs")
        );
    }

    #[test]
    fn test_comma_lists() {
        let doc = parse(SAMPLE).unwrap();
        assert_eq!(
            doc.interface.get_list("Address"),
            vec!["10.5.0.2".to_owned(), "fd00::2/64".to_owned()]
        );
        assert_eq!(
            doc.peers[0].get_list("AllowedIPs"),
            vec!["0.0.0.0/0".to_owned(), "::/0".to_owned()]
        );
    }

    #[test]
    fn test_indented_keys() {
        let doc = parse(
            "[Interface]\nPrivateKey = k\n\tAddress = 10.5.0.2\n\tDNS = 1.1.1.1\n",
        )
        .unwrap();
        assert_eq!(doc.interface.get("address"), Some("10.5.0.2"));
    }

    #[test]
    fn test_multiple_peers() {
        let input = "[Interface]\nPrivateKey = k\n[Peer]\nPublicKey = a\n[Peer]\nPublicKey = b\n";
        let doc = parse(input).unwrap();
        assert_eq!(doc.peers.len(), 2);
        assert_eq!(doc.peers[0].get("publickey"), Some("a"));
        assert_eq!(doc.peers[1].get("publickey"), Some("b"));
    }

    #[test]
    fn test_missing_interface_section() {
        let err = parse("[Peer]\nPublicKey = a\n").unwrap_err();
        assert!(err.to_string().contains("[Interface]"));
    }

    #[test]
    fn test_unknown_sections_ignored() {
        let input = "[Interface]\nPrivateKey = k\n[Routing]\nTable = 100\n";
        let doc = parse(input).unwrap();
        assert_eq!(doc.interface.len(), 1);
    }
}
