//! Serialization of a parsed device configuration into the line-oriented
//! `key=value` request text consumed by the WireGuard device control plane.
//!
//! The serializer is pure: the same configuration always renders to
//! byte-identical output.

use std::fmt::Write;

use crate::config::{AsecConfig, DeviceConfig, PeerConfig};

/// Render the full device request (load path).
///
/// `replace_peers` is only emitted on a refresh of an already-configured
/// device, never on first load.
#[must_use]
pub fn device_request(conf: &DeviceConfig, replace_peers: bool) -> String {
    let mut request = String::new();

    let _ = writeln!(request, "private_key={}", conf.secret_key);

    if let Some(port) = conf.listen_port {
        let _ = writeln!(request, "listen_port={port}");
    }

    if let Some(asec) = &conf.asec {
        write_asec(&mut request, asec);
    }

    if replace_peers {
        request.push_str("replace_peers=true\n");
    }

    for peer in &conf.peers {
        write_peer(&mut request, peer, false);
    }

    request
}

/// Render an update-only request: device-level keys are omitted and every
/// peer block carries `update_only=true`.
#[must_use]
pub fn peer_update_request(conf: &DeviceConfig) -> String {
    let mut request = String::from("replace_peers=true\n");
    for peer in &conf.peers {
        write_peer(&mut request, peer, true);
    }
    request
}

fn write_asec(request: &mut String, asec: &AsecConfig) {
    let _ = writeln!(request, "jc={}", asec.junk_packet_count);
    let _ = writeln!(request, "jmin={}", asec.junk_packet_min_size);
    let _ = writeln!(request, "jmax={}", asec.junk_packet_max_size);
    let _ = writeln!(request, "s1={}", asec.init_packet_junk_size);
    let _ = writeln!(request, "s2={}", asec.response_packet_junk_size);
    let _ = writeln!(request, "h1={}", asec.init_packet_magic_header);
    let _ = writeln!(request, "h2={}", asec.response_packet_magic_header);
    let _ = writeln!(request, "h3={}", asec.underload_packet_magic_header);
    let _ = writeln!(request, "h4={}", asec.transport_packet_magic_header);

    let opaque = [
        ("i1", &asec.i1),
        ("i2", &asec.i2),
        ("i3", &asec.i3),
        ("i4", &asec.i4),
        ("i5", &asec.i5),
        ("j1", &asec.j1),
        ("j2", &asec.j2),
        ("j3", &asec.j3),
    ];
    for (key, value) in opaque {
        if let Some(value) = value {
            let _ = writeln!(request, "{key}={value}");
        }
    }
    if let Some(itime) = asec.itime {
        let _ = writeln!(request, "itime={itime}");
    }
}

fn write_peer(request: &mut String, peer: &PeerConfig, update_only: bool) {
    let _ = writeln!(request, "public_key={}", peer.public_key);
    if update_only {
        request.push_str("update_only=true\n");
    }
    let _ = writeln!(
        request,
        "persistent_keepalive_interval={}",
        peer.keep_alive
    );
    let _ = writeln!(request, "preshared_key={}", peer.preshared_key);

    if let Some(endpoint) = peer.endpoint {
        let _ = writeln!(request, "endpoint={endpoint}");
    }

    request.push_str("replace_allowed_ips=true\n");
    if peer.allowed_ips.is_empty() {
        request.push_str("allowed_ip=0.0.0.0/0\nallowed_ip=::/0\n");
    } else {
        for prefix in &peer.allowed_ips {
            let _ = writeln!(request, "allowed_ip={prefix}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;

    const CONFIG: &str = "
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.5.0.2
DNS = 1.1.1.1

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = 94.140.11.15:51820
PersistentKeepalive = 25";

    const ASEC_CONFIG: &str = "
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.5.0.2
ListenPort = 51821
Jc = 5
Jmin = 10
Jmax = 50
S1 = 15
S2 = 70
H1 = 1234
H2 = 2345
H3 = 3456
H4 = 4567
I1 = <b 0xf6ab3267fa>
ITime = 60

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
Endpoint = 94.140.11.15:51820";

    #[test]
    fn test_request_starts_with_private_key() {
        let conf = parse_config_str(CONFIG).unwrap();
        let request = device_request(&conf.device, false);
        assert!(request.starts_with("private_key="));
    }

    #[test]
    fn test_listen_port_iff_set() {
        let conf = parse_config_str(CONFIG).unwrap();
        assert!(!device_request(&conf.device, false).contains("listen_port="));

        let conf = parse_config_str(ASEC_CONFIG).unwrap();
        assert!(device_request(&conf.device, false).contains("listen_port=51821\n"));
    }

    #[test]
    fn test_asec_block_iff_configured() {
        let conf = parse_config_str(CONFIG).unwrap();
        let request = device_request(&conf.device, false);
        assert!(!request.contains("jc="));
        assert!(!request.contains("h1="));

        let conf = parse_config_str(ASEC_CONFIG).unwrap();
        let request = device_request(&conf.device, false);
        let jc = request.find("jc=5\n").unwrap();
        let h4 = request.find("h4=4567\n").unwrap();
        let i1 = request.find("i1=<b 0xf6ab3267fa>\n").unwrap();
        let itime = request.find("itime=60\n").unwrap();
        let first_peer = request.find("public_key=").unwrap();
        assert!(jc < h4 && h4 < i1 && i1 < itime && itime < first_peer);
    }

    #[test]
    fn test_peer_block_layout() {
        let conf = parse_config_str(CONFIG).unwrap();
        let request = device_request(&conf.device, false);
        let lines: Vec<&str> = request.lines().collect();
        let peer_start = lines.iter().position(|l| l.starts_with("public_key=")).unwrap();
        assert_eq!(
            lines[peer_start + 1],
            "persistent_keepalive_interval=25"
        );
        assert!(lines[peer_start + 2].starts_with("preshared_key="));
        assert_eq!(lines[peer_start + 3], "endpoint=94.140.11.15:51820");
        assert_eq!(lines[peer_start + 4], "replace_allowed_ips=true");
        assert_eq!(lines[peer_start + 5], "allowed_ip=0.0.0.0/0");
        assert_eq!(lines[peer_start + 6], "allowed_ip=::/0");
    }

    #[test]
    fn test_replace_allowed_ips_precedes_allowed_ip() {
        let conf = parse_config_str(ASEC_CONFIG).unwrap();
        let request = device_request(&conf.device, false);
        let replace = request.find("replace_allowed_ips=true\n").unwrap();
        let allowed = request.find("allowed_ip=").unwrap();
        assert!(replace < allowed);
        // Empty AllowedIPs falls back to the full-tunnel pair.
        assert!(request.contains("allowed_ip=0.0.0.0/0\nallowed_ip=::/0\n"));
    }

    #[test]
    fn test_replace_peers_only_on_refresh() {
        let conf = parse_config_str(CONFIG).unwrap();
        assert!(!device_request(&conf.device, false).contains("replace_peers=true"));
        let refresh = device_request(&conf.device, true);
        let replace = refresh.find("replace_peers=true\n").unwrap();
        let peer = refresh.find("public_key=").unwrap();
        assert!(replace < peer);
    }

    #[test]
    fn test_update_request_marks_peers_update_only() {
        let conf = parse_config_str(CONFIG).unwrap();
        let request = peer_update_request(&conf.device);
        assert!(request.starts_with("replace_peers=true\n"));
        let lines: Vec<&str> = request.lines().collect();
        let peer_start = lines.iter().position(|l| l.starts_with("public_key=")).unwrap();
        assert_eq!(lines[peer_start + 1], "update_only=true");
    }

    #[test]
    fn test_serialization_is_deterministic() {
        let conf = parse_config_str(ASEC_CONFIG).unwrap();
        let a = device_request(&conf.device, false);
        let b = device_request(&conf.device, false);
        assert_eq!(a, b);

        let reparsed = parse_config_str(ASEC_CONFIG).unwrap();
        assert_eq!(a, device_request(&reparsed.device, false));
    }

    #[test]
    fn test_all_values_lowercase_hex() {
        let conf = parse_config_str(CONFIG).unwrap();
        let request = device_request(&conf.device, false);
        for line in request.lines() {
            let (key, value) = line.split_once('=').unwrap();
            assert_eq!(key, key.to_ascii_lowercase());
            if key == "private_key" || key == "public_key" || key == "preshared_key" {
                assert!(value.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
            }
        }
    }
}
