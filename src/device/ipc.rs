//! IPC configuration serialization
//!
//! The tunnel engine is configured through a newline-terminated `key=value`
//! text blob. Line order is part of the contract: device identity first,
//! then the AmneziaWG block (set fields only, in the fixed order
//! `jc jmin jmax s1 s2 s3 s4 h1 h2 h3 h4 i1 i2 i3 i4 i5`), then one block
//! per peer. A field that was not configured never produces a line.

use std::fmt::Write;

use crate::config::{DeviceConfig, ObfuscationConfig};

/// Serialize a device configuration into the engine's IPC text.
#[must_use]
pub fn create_ipc_request(conf: &DeviceConfig) -> String {
    let mut request = String::new();

    let _ = writeln!(request, "private_key={}", conf.private_key);
    if let Some(port) = conf.listen_port {
        let _ = writeln!(request, "listen_port={port}");
    }

    if let Some(awg) = &conf.obfuscation {
        write_obfuscation(&mut request, awg);
    }

    for peer in &conf.peers {
        let _ = writeln!(request, "public_key={}", peer.public_key);
        let _ = writeln!(
            request,
            "persistent_keepalive_interval={}",
            peer.keepalive
        );
        let _ = writeln!(request, "preshared_key={}", peer.preshared_key);
        if let Some(endpoint) = &peer.endpoint {
            let _ = writeln!(request, "endpoint={endpoint}");
        }
        if peer.allowed_ips.is_empty() {
            request.push_str("allowed_ip=0.0.0.0/0\n");
            request.push_str("allowed_ip=::0/0\n");
        } else {
            for net in &peer.allowed_ips {
                let _ = writeln!(request, "allowed_ip={net}");
            }
        }
    }

    request
}

fn write_obfuscation(request: &mut String, awg: &ObfuscationConfig) {
    let ints = [
        ("jc", awg.junk_packet_count),
        ("jmin", awg.junk_packet_min_size),
        ("jmax", awg.junk_packet_max_size),
        ("s1", awg.init_packet_junk_size),
        ("s2", awg.response_packet_junk_size),
        ("s3", awg.cookie_reply_packet_junk_size),
        ("s4", awg.transport_packet_junk_size),
    ];
    for (key, value) in ints {
        if let Some(v) = value {
            let _ = writeln!(request, "{key}={v}");
        }
    }

    let headers = [
        ("h1", awg.init_packet_magic_header),
        ("h2", awg.response_packet_magic_header),
        ("h3", awg.underload_packet_magic_header),
        ("h4", awg.transport_packet_magic_header),
    ];
    for (key, value) in headers {
        if let Some(interval) = value {
            let _ = writeln!(request, "{key}={interval}");
        }
    }

    let payloads = [
        ("i1", &awg.i1),
        ("i2", &awg.i2),
        ("i3", &awg.i3),
        ("i4", &awg.i4),
        ("i5", &awg.i5),
    ];
    for (key, value) in payloads {
        if let Some(v) = value {
            let _ = writeln!(request, "{key}={v}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;

    const PRIV: &str = "LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=";
    const PEER_PUB: &str = "e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=";

    fn parse(extra: &str) -> DeviceConfig {
        DeviceConfig::parse(&format!(
            "[Interface]\nPrivateKey = {PRIV}\nAddress = 10.5.0.2\nDNS = 1.1.1.1\n{extra}\n[Peer]\nPublicKey = {PEER_PUB}\nAllowedIPs = 0.0.0.0/0, ::/0\nEndpoint = 94.140.11.15:51820\nPersistentKeepalive = 25\n"
        ))
        .unwrap()
    }

    #[test]
    fn test_device_lines() {
        let conf = parse("ListenPort = 51821\n");
        let ipc = create_ipc_request(&conf);
        assert!(ipc.starts_with(&format!("private_key={}\n", conf.private_key)));
        assert!(ipc.contains("listen_port=51821\n"));
    }

    #[test]
    fn test_peer_lines() {
        let conf = parse("");
        let ipc = create_ipc_request(&conf);
        assert!(ipc.contains(&format!("public_key={}\n", conf.peers[0].public_key)));
        assert!(ipc.contains("persistent_keepalive_interval=25\n"));
        assert!(ipc.contains("endpoint=94.140.11.15:51820\n"));
        assert!(ipc.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(ipc.contains("allowed_ip=::/0\n"));
    }

    #[test]
    fn test_default_allowed_ips_when_none_configured() {
        let conf = DeviceConfig::parse(&format!(
            "[Interface]\nPrivateKey = {PRIV}\nAddress = 10.5.0.2\n[Peer]\nPublicKey = {PEER_PUB}\n"
        ))
        .unwrap();
        let ipc = create_ipc_request(&conf);
        assert!(ipc.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(ipc.contains("allowed_ip=::0/0\n"));
    }

    #[test]
    fn test_unset_fields_never_emit() {
        let conf = parse("I1 = <b 0xA1B2C3D4E5F6><c>\n");
        let ipc = create_ipc_request(&conf);
        assert!(ipc.contains("i1=<b 0xA1B2C3D4E5F6><c>\n"));
        assert!(!ipc.contains("jc="));
        assert!(!ipc.contains("h1="));
        assert!(!ipc.contains("s1="));
        assert!(!ipc.contains("i2="));
    }

    #[test]
    fn test_awg_block_order_and_ranges() {
        let conf = parse(
            "Jc = 5\nJmin = 10\nJmax = 50\nS1 = 15\nS2 = 18\nS3 = 20\nS4 = 23\nH1 = 100-101\nH2 = 102-103\nH3 = 104\nH4 = 105-106\n",
        );
        let ipc = create_ipc_request(&conf);
        assert!(ipc.contains("s3=20\n"));
        assert!(ipc.contains("s4=23\n"));
        assert!(ipc.contains("h1=100-101\n"));
        assert!(ipc.contains("h3=104\n"));
        assert!(ipc.contains("h4=105-106\n"));

        let jc = ipc.find("jc=5").unwrap();
        let jmin = ipc.find("jmin=10").unwrap();
        let s1 = ipc.find("s1=15").unwrap();
        let h1 = ipc.find("h1=").unwrap();
        let pk = ipc.find("public_key=").unwrap();
        assert!(jc < jmin && jmin < s1 && s1 < h1 && h1 < pk);
    }

    #[test]
    fn test_scalar_header_roundtrips_through_ipc() {
        let conf = parse("H1 = 7\nH2 = 1000-2000\nH3 = 3000\nH4 = 4000\n");
        let ipc = create_ipc_request(&conf);
        assert!(ipc.contains("h1=7\n"));
        assert!(ipc.contains("h2=1000-2000\n"));
    }
}
