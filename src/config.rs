use std::net::{IpAddr, SocketAddr, ToSocketAddrs};

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use ipnet::IpNet;

use crate::error::{AppError, Result};

/// A single parsed `[Peer]` section.
#[derive(Debug, Clone)]
pub struct PeerConfig {
    /// Peer public key as lowercase hex.
    pub public_key: String,
    /// Preshared key as lowercase hex; all zeros when absent.
    pub preshared_key: String,
    /// Resolved peer endpoint. Snapshot-resolved at parse time; DNS changes
    /// do not propagate without a restart.
    pub endpoint: Option<SocketAddr>,
    pub keep_alive: u16,
    /// Empty means the implicit `0.0.0.0/0` + `::/0` at serialization time.
    pub allowed_ips: Vec<IpNet>,
}

/// AmneziaWG obfuscation profile. Exists only if some ASec key appeared.
#[derive(Debug, Clone, Default)]
pub struct AsecConfig {
    pub junk_packet_count: u32,             // Jc
    pub junk_packet_min_size: u32,          // Jmin
    pub junk_packet_max_size: u32,          // Jmax
    pub init_packet_junk_size: u32,         // S1
    pub response_packet_junk_size: u32,     // S2
    pub init_packet_magic_header: u32,      // H1
    pub response_packet_magic_header: u32,  // H2
    pub underload_packet_magic_header: u32, // H3
    pub transport_packet_magic_header: u32, // H4
    pub i1: Option<String>,
    pub i2: Option<String>,
    pub i3: Option<String>,
    pub i4: Option<String>,
    pub i5: Option<String>,
    pub j1: Option<String>,
    pub j2: Option<String>,
    pub j3: Option<String>,
    pub itime: Option<u64>,
}

/// The `[Interface]` section: one WireGuard device.
#[derive(Debug, Clone)]
pub struct DeviceConfig {
    /// Device private key as lowercase hex.
    pub secret_key: String,
    /// Local interface addresses (CIDR prefixes discarded to the address).
    pub endpoint: Vec<IpAddr>,
    pub dns: Vec<IpAddr>,
    pub mtu: usize,
    pub listen_port: Option<u16>,
    pub check_alive: Vec<IpAddr>,
    /// Seconds between liveness probes; only legal with `check_alive` set.
    pub check_alive_interval: u64,
    pub peers: Vec<PeerConfig>,
    pub asec: Option<AsecConfig>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            secret_key: String::new(),
            endpoint: Vec::new(),
            dns: Vec::new(),
            mtu: 1420,
            listen_port: None,
            check_alive: Vec::new(),
            check_alive_interval: 5,
            peers: Vec::new(),
            asec: None,
        }
    }
}

/// A proxy or forwarder specification, one per config section.
#[derive(Debug, Clone)]
pub enum RoutineConfig {
    Socks5 {
        bind_address: String,
        username: String,
        password: String,
    },
    Http {
        bind_address: String,
        username: String,
        password: String,
    },
    TcpClientTunnel {
        bind_address: SocketAddr,
        target: String,
    },
    TcpServerTunnel {
        listen_port: u16,
        target: String,
    },
    StdioTunnel {
        target: String,
    },
}

#[derive(Debug, Clone)]
pub struct Configuration {
    pub device: DeviceConfig,
    pub routines: Vec<RoutineConfig>,
}

// ---------------------------------------------------------------------------
// INI scanning
//
// The format needs case-insensitive names, repeated sections and repeated
// keys, which rules out the usual registry INI readers. The scanner below is
// line-oriented: `#`/`;` comments, `[section]` headers, `key=value` pairs
// split at the first `=`.

#[derive(Debug)]
struct IniSection {
    name: String,
    entries: Vec<(String, String)>,
}

impl IniSection {
    /// First value for `key` (repeated keys shadow later occurrences).
    fn get(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        self.entries
            .iter()
            .find(|(k, _)| *k == key)
            .map(|(_, v)| v.as_str())
    }
}

#[derive(Debug)]
struct IniDocument {
    sections: Vec<IniSection>,
}

impl IniDocument {
    fn scan(input: &str) -> IniDocument {
        let mut sections = vec![IniSection {
            name: String::new(),
            entries: Vec::new(),
        }];

        for raw in input.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }
            if line.starts_with('[') && line.ends_with(']') {
                sections.push(IniSection {
                    name: line[1..line.len() - 1].trim().to_ascii_lowercase(),
                    entries: Vec::new(),
                });
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            let section = sections.last_mut().expect("root section always present");
            section
                .entries
                .push((key.trim().to_ascii_lowercase(), value.trim().to_string()));
        }

        IniDocument { sections }
    }

    fn root(&self) -> &IniSection {
        &self.sections[0]
    }

    fn sections_by_name(&self, name: &str) -> Vec<&IniSection> {
        let name = name.to_ascii_lowercase();
        self.sections.iter().filter(|s| s.name == name).collect()
    }
}

// ---------------------------------------------------------------------------
// Value parsing helpers

/// Read a string value, applying `$VAR` interpolation and `$$` de-escape.
fn parse_string(section: &IniSection, key: &str) -> Result<Option<String>> {
    let Some(value) = section.get(key) else {
        return Ok(None);
    };
    if let Some(rest) = value.strip_prefix("$$") {
        return Ok(Some(format!("${rest}")));
    }
    if let Some(name) = value.strip_prefix('$') {
        return match std::env::var(name) {
            Ok(resolved) => Ok(Some(resolved)),
            Err(_) => Err(AppError::config(format!(
                "{key} references unset environment variable {value}"
            ))),
        };
    }
    Ok(Some(value.to_string()))
}

fn require_string(section: &IniSection, key: &str) -> Result<String> {
    parse_string(section, key)?
        .filter(|v| !v.is_empty())
        .ok_or_else(|| AppError::config(format!("{key} should not be empty")))
}

fn parse_int(section: &IniSection, key: &str) -> Result<Option<i64>> {
    let Some(value) = parse_string(section, key)? else {
        return Ok(None);
    };
    value
        .parse::<i64>()
        .map(Some)
        .map_err(|_| AppError::config(format!("{key} is not an integer: {value}")))
}

fn parse_port(section: &IniSection, key: &str) -> Result<Option<u16>> {
    let Some(port) = parse_int(section, key)? else {
        return Ok(None);
    };
    if !(0..65536).contains(&port) {
        return Err(AppError::config("port should be >= 0 and < 65536"));
    }
    Ok(Some(port as u16))
}

fn decode_base64_key_to_hex(key: &str) -> Result<String> {
    let decoded = BASE64
        .decode(key)
        .map_err(|_| AppError::config(format!("invalid base64 string: {key}")))?;
    if decoded.len() != 32 {
        return Err(AppError::config(format!("key should be 32 bytes: {key}")));
    }
    Ok(to_hex(&decoded))
}

fn parse_base64_key(section: &IniSection, key: &str) -> Result<String> {
    let value = require_string(section, key)?;
    decode_base64_key_to_hex(&value)
}

pub(crate) fn to_hex(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{b:02x}");
    }
    out
}

/// Comma-separated list with per-element trimming; empty elements skipped.
fn split_list(value: &str) -> impl Iterator<Item = &str> {
    value.split(',').map(str::trim).filter(|s| !s.is_empty())
}

fn parse_addr_list(section: &IniSection, key: &str) -> Result<Vec<IpAddr>> {
    let Some(value) = parse_string(section, key)? else {
        return Ok(Vec::new());
    };
    let mut ips = Vec::new();
    for item in split_list(&value) {
        let ip: IpAddr = item
            .parse()
            .map_err(|_| AppError::config(format!("{key} contains an invalid address: {item}")))?;
        ips.push(ip);
    }
    Ok(ips)
}

/// Addresses where both a bare address and a CIDR prefix are accepted; the
/// prefix is discarded to the address.
fn parse_cidr_addr_list(section: &IniSection, key: &str) -> Result<Vec<IpAddr>> {
    let Some(value) = parse_string(section, key)? else {
        return Ok(Vec::new());
    };
    let mut ips = Vec::new();
    for item in split_list(&value) {
        if let Ok(ip) = item.parse::<IpAddr>() {
            ips.push(ip);
            continue;
        }
        let net: IpNet = item
            .parse()
            .map_err(|_| AppError::config(format!("{key} contains an invalid address: {item}")))?;
        ips.push(net.addr());
    }
    Ok(ips)
}

fn parse_allowed_ips(section: &IniSection) -> Result<Vec<IpNet>> {
    let Some(value) = parse_string(section, "AllowedIPs")? else {
        return Ok(Vec::new());
    };
    let mut prefixes = Vec::new();
    for item in split_list(&value) {
        let net: IpNet = item
            .parse()
            .map_err(|_| AppError::config(format!("AllowedIPs contains an invalid prefix: {item}")))?;
        prefixes.push(net);
    }
    Ok(prefixes)
}

fn split_host_port(addr: &str) -> Result<(String, u16)> {
    let (host, port) = if let Some(rest) = addr.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| AppError::config(format!("invalid endpoint: {addr}")))?;
        let port = rest[end + 1..]
            .strip_prefix(':')
            .ok_or_else(|| AppError::config(format!("invalid endpoint: {addr}")))?;
        (rest[..end].to_string(), port)
    } else {
        let colon = addr
            .rfind(':')
            .ok_or_else(|| AppError::config(format!("invalid endpoint: {addr}")))?;
        if addr[..colon].contains(':') {
            return Err(AppError::config(format!(
                "invalid endpoint (IPv6 must be bracketed): {addr}"
            )));
        }
        (addr[..colon].to_string(), &addr[colon + 1..])
    };
    let port: u16 = port
        .parse()
        .map_err(|_| AppError::config("port should be >= 0 and < 65536"))?;
    Ok((host, port))
}

/// Resolve `host:port` to a socket address via the system resolver.
///
/// Endpoints are snapshot-resolved: later DNS changes require a restart.
fn resolve_host_port(addr: &str) -> Result<SocketAddr> {
    let (host, port) = split_host_port(addr)?;
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SocketAddr::new(ip, port));
    }
    (host.as_str(), port)
        .to_socket_addrs()
        .map_err(|e| AppError::config(format!("cannot resolve endpoint {addr}: {e}")))?
        .next()
        .ok_or_else(|| AppError::config(format!("cannot resolve endpoint {addr}: no addresses")))
}

// ---------------------------------------------------------------------------
// Section parsing

fn parse_interface(doc: &IniDocument, device: &mut DeviceConfig) -> Result<()> {
    let sections = doc.sections_by_name("Interface");
    if sections.len() != 1 {
        return Err(AppError::config("one and only one [Interface] is expected"));
    }
    let section = sections[0];

    device.endpoint = parse_cidr_addr_list(section, "Address")?;
    device.secret_key = parse_base64_key(section, "PrivateKey")?;
    device.dns = parse_addr_list(section, "DNS")?;

    if let Some(mtu) = parse_int(section, "MTU")? {
        if mtu <= 0 {
            return Err(AppError::config("MTU should be a positive integer"));
        }
        device.mtu = mtu as usize;
    }

    device.listen_port = parse_port(section, "ListenPort")?;
    device.check_alive = parse_addr_list(section, "CheckAlive")?;

    if let Some(interval) = parse_int(section, "CheckAliveInterval")? {
        if device.check_alive.is_empty() {
            return Err(AppError::config(
                "CheckAliveInterval is only valid when CheckAlive is set",
            ));
        }
        if interval <= 0 {
            return Err(AppError::config(
                "CheckAliveInterval should be a positive integer",
            ));
        }
        device.check_alive_interval = interval as u64;
    }

    device.asec = parse_asec(section)?;

    Ok(())
}

fn parse_asec_count(
    section: &IniSection,
    key: &str,
    max: i64,
    asec: &mut Option<AsecConfig>,
) -> Result<Option<u32>> {
    let Some(value) = parse_int(section, key)? else {
        return Ok(None);
    };
    if value < 0 || value > max {
        return Err(AppError::config(format!(
            "value of the {key} field must be within the range of 0 to {max}"
        )));
    }
    asec.get_or_insert_with(AsecConfig::default);
    Ok(Some(value as u32))
}

fn parse_asec_magic(
    section: &IniSection,
    key: &str,
    asec: &mut Option<AsecConfig>,
) -> Result<Option<u32>> {
    let Some(value) = parse_int(section, key)? else {
        return Ok(None);
    };
    if !(1..=4294967295).contains(&value) {
        return Err(AppError::config(format!(
            "value of the {key} field must be within the range of 1 to 4294967295"
        )));
    }
    asec.get_or_insert_with(AsecConfig::default);
    Ok(Some(value as u32))
}

fn parse_asec_opaque(
    section: &IniSection,
    key: &str,
    asec: &mut Option<AsecConfig>,
) -> Result<Option<String>> {
    let Some(value) = parse_string(section, key)? else {
        return Ok(None);
    };
    asec.get_or_insert_with(AsecConfig::default);
    Ok(Some(value))
}

fn parse_asec(section: &IniSection) -> Result<Option<AsecConfig>> {
    let mut asec: Option<AsecConfig> = None;

    let jc = parse_asec_count(section, "Jc", 200, &mut asec)?;
    let jmin = parse_asec_count(section, "Jmin", 1280, &mut asec)?;
    let jmax = parse_asec_count(section, "Jmax", 1280, &mut asec)?;
    let s1 = parse_asec_count(section, "S1", 1280, &mut asec)?;
    let s2 = parse_asec_count(section, "S2", 1280, &mut asec)?;
    let h1 = parse_asec_magic(section, "H1", &mut asec)?;
    let h2 = parse_asec_magic(section, "H2", &mut asec)?;
    let h3 = parse_asec_magic(section, "H3", &mut asec)?;
    let h4 = parse_asec_magic(section, "H4", &mut asec)?;
    let i1 = parse_asec_opaque(section, "I1", &mut asec)?;
    let i2 = parse_asec_opaque(section, "I2", &mut asec)?;
    let i3 = parse_asec_opaque(section, "I3", &mut asec)?;
    let i4 = parse_asec_opaque(section, "I4", &mut asec)?;
    let i5 = parse_asec_opaque(section, "I5", &mut asec)?;
    let j1 = parse_asec_opaque(section, "J1", &mut asec)?;
    let j2 = parse_asec_opaque(section, "J2", &mut asec)?;
    let j3 = parse_asec_opaque(section, "J3", &mut asec)?;

    let itime = match parse_int(section, "ITime")? {
        Some(value) if value < 0 => {
            return Err(AppError::config(
                "value of the ITime field must be non-negative",
            ));
        }
        Some(value) => {
            asec.get_or_insert_with(AsecConfig::default);
            Some(value as u64)
        }
        None => None,
    };

    let Some(config) = asec.as_mut() else {
        return Ok(None);
    };

    config.junk_packet_count = jc.unwrap_or(0);
    config.junk_packet_min_size = jmin.unwrap_or(0);
    config.junk_packet_max_size = jmax.unwrap_or(0);
    config.init_packet_junk_size = s1.unwrap_or(0);
    config.response_packet_junk_size = s2.unwrap_or(0);
    config.init_packet_magic_header = h1.unwrap_or(0);
    config.response_packet_magic_header = h2.unwrap_or(0);
    config.underload_packet_magic_header = h3.unwrap_or(0);
    config.transport_packet_magic_header = h4.unwrap_or(0);
    config.i1 = i1;
    config.i2 = i2;
    config.i3 = i3;
    config.i4 = i4;
    config.i5 = i5;
    config.j1 = j1;
    config.j2 = j2;
    config.j3 = j3;
    config.itime = itime;

    validate_asec(config)?;
    Ok(asec)
}

fn validate_asec(config: &AsecConfig) -> Result<()> {
    if config.junk_packet_count > 0 && config.junk_packet_min_size > config.junk_packet_max_size {
        return Err(AppError::config(
            "value of the Jmin field must be less than or equal to Jmax field value",
        ));
    }

    // Junk-padded initiation and response frames must not alias in size.
    const MESSAGE_INITIATION_SIZE: u32 = 148;
    const MESSAGE_RESPONSE_SIZE: u32 = 92;
    if MESSAGE_INITIATION_SIZE + config.init_packet_junk_size
        == MESSAGE_RESPONSE_SIZE + config.response_packet_junk_size
    {
        return Err(AppError::config(
            "value of the field S1 + message initiation size (148) must not equal S2 + message response size (92)",
        ));
    }

    let headers = [
        config.init_packet_magic_header,
        config.response_packet_magic_header,
        config.underload_packet_magic_header,
        config.transport_packet_magic_header,
    ];
    let any_set = headers.iter().any(|&h| h != 0);
    if any_set {
        for (i, &h) in headers.iter().enumerate() {
            if h == 0 {
                return Err(AppError::config(format!(
                    "H{} is unset (0) while other headers are set; all H1-H4 must be explicitly set if any are used",
                    i + 1
                )));
            }
            if headers[..i].contains(&h) {
                return Err(AppError::config(format!(
                    "values of the H1-H4 fields must be unique; H{} conflicts",
                    i + 1
                )));
            }
        }
    }

    Ok(())
}

fn parse_peers(doc: &IniDocument, peers: &mut Vec<PeerConfig>) -> Result<()> {
    let sections = doc.sections_by_name("Peer");
    if sections.is_empty() {
        return Err(AppError::config("at least one [Peer] is expected"));
    }

    for section in sections {
        let mut peer = PeerConfig {
            public_key: parse_base64_key(section, "PublicKey")?,
            preshared_key:
                "0000000000000000000000000000000000000000000000000000000000000000".to_string(),
            endpoint: None,
            keep_alive: 0,
            allowed_ips: Vec::new(),
        };

        if let Some(psk) = parse_string(section, "PreSharedKey")? {
            peer.preshared_key = decode_base64_key_to_hex(&psk)?;
        }

        if let Some(endpoint) = parse_string(section, "Endpoint")? {
            peer.endpoint = Some(resolve_host_port(&endpoint.to_ascii_lowercase())?);
        }

        if let Some(keep_alive) = parse_int(section, "PersistentKeepalive")? {
            if !(0..65536).contains(&keep_alive) {
                return Err(AppError::config(
                    "PersistentKeepalive should be >= 0 and < 65536",
                ));
            }
            peer.keep_alive = keep_alive as u16;
        }

        peer.allowed_ips = parse_allowed_ips(section)?;
        peers.push(peer);
    }

    Ok(())
}

fn parse_socks5(section: &IniSection) -> Result<RoutineConfig> {
    Ok(RoutineConfig::Socks5 {
        bind_address: require_string(section, "BindAddress")?,
        username: parse_string(section, "Username")?.unwrap_or_default(),
        password: parse_string(section, "Password")?.unwrap_or_default(),
    })
}

fn parse_http(section: &IniSection) -> Result<RoutineConfig> {
    Ok(RoutineConfig::Http {
        bind_address: require_string(section, "BindAddress")?,
        username: parse_string(section, "Username")?.unwrap_or_default(),
        password: parse_string(section, "Password")?.unwrap_or_default(),
    })
}

fn parse_tcp_client_tunnel(section: &IniSection) -> Result<RoutineConfig> {
    let bind = require_string(section, "BindAddress")?;
    Ok(RoutineConfig::TcpClientTunnel {
        bind_address: resolve_host_port(&bind)?,
        target: require_string(section, "Target")?,
    })
}

fn parse_tcp_server_tunnel(section: &IniSection) -> Result<RoutineConfig> {
    let listen_port = parse_port(section, "ListenPort")?
        .ok_or_else(|| AppError::config("ListenPort should not be empty"))?;
    Ok(RoutineConfig::TcpServerTunnel {
        listen_port,
        target: require_string(section, "Target")?,
    })
}

fn parse_stdio_tunnel(section: &IniSection) -> Result<RoutineConfig> {
    Ok(RoutineConfig::StdioTunnel {
        target: require_string(section, "Target")?,
    })
}

fn parse_routines(
    routines: &mut Vec<RoutineConfig>,
    doc: &IniDocument,
    section_name: &str,
    f: fn(&IniSection) -> Result<RoutineConfig>,
) -> Result<()> {
    for section in doc.sections_by_name(section_name) {
        routines.push(f(section)?);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Entry points

/// Parse the configuration file at `path`.
pub fn parse_config(path: &str) -> Result<Configuration> {
    let text = std::fs::read_to_string(path)
        .map_err(|e| AppError::config(format!("cannot read {path}: {e}")))?;
    parse_config_str(&text)
}

/// Parse a configuration document held in memory.
pub fn parse_config_str(text: &str) -> Result<Configuration> {
    let doc = IniDocument::scan(text);

    // Device sections may be redirected to a standard WireGuard config file
    // while the proxy wiring stays in the outer document.
    let wg_doc;
    let device_doc = match parse_string(doc.root(), "WGConfig")? {
        Some(path) => {
            let text = std::fs::read_to_string(&path)
                .map_err(|e| AppError::config(format!("cannot read WGConfig {path}: {e}")))?;
            wg_doc = IniDocument::scan(&text);
            &wg_doc
        }
        None => &doc,
    };

    let mut device = DeviceConfig::default();
    parse_interface(device_doc, &mut device)?;
    parse_peers(device_doc, &mut device.peers)?;

    let mut routines = Vec::new();
    parse_routines(&mut routines, &doc, "Socks5", parse_socks5)?;
    parse_routines(&mut routines, &doc, "http", parse_http)?;
    parse_routines(&mut routines, &doc, "TCPClientTunnel", parse_tcp_client_tunnel)?;
    parse_routines(&mut routines, &doc, "TCPServerTunnel", parse_tcp_server_tunnel)?;
    parse_routines(&mut routines, &doc, "STDIOTunnel", parse_stdio_tunnel)?;

    Ok(Configuration { device, routines })
}
