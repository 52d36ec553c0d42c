//! WireGuard device control-plane over the boringtun protocol engine.
//!
//! Consumes the line-oriented UAPI request text (`ipc_set`), renders device
//! state back in UAPI get form (`ipc_get`), and pumps packets between the
//! virtual stack and the peer UDP endpoints. The Noise machinery itself is
//! boringtun's `Tunn`; this module owns peer routing, timers, roaming and
//! the AmneziaWG wire transforms.

use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use boringtun::noise::{Tunn, TunnResult};
use x25519_dalek::{PublicKey, StaticSecret};
use ipnet::IpNet;
use rand::Rng;
use rand::RngCore;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};

const TIMER_TICK: Duration = Duration::from_millis(250);
const WIRE_BUFFER: usize = 65535;

const MSG_INITIATION: u32 = 1;
const MSG_RESPONSE: u32 = 2;
const MSG_COOKIE: u32 = 3;
const MSG_TRANSPORT: u32 = 4;

const ZERO_PSK_HEX: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// AmneziaWG wire-transform parameters, straight from the UAPI request.
#[derive(Debug, Default, Clone)]
struct ObfsParams {
    jc: u32,
    jmin: u32,
    jmax: u32,
    s1: u32,
    s2: u32,
    h: [u32; 4],
    // Opaque pass-through values, echoed by ipc_get only.
    opaque: Vec<(String, String)>,
}

impl ObfsParams {
    /// Magic headers with the protocol defaults standing in for unset ones.
    fn headers(&self) -> [u32; 4] {
        if self.h.iter().all(|&h| h == 0) {
            [1, 2, 3, 4]
        } else {
            self.h
        }
    }
}

struct WgPeer {
    public_key_hex: String,
    preshared_hex: String,
    keepalive: u16,
    allowed_ips: Vec<IpNet>,
    endpoint: Mutex<Option<SocketAddr>>,
    tunn: Mutex<Tunn>,
    tx_bytes: AtomicU64,
    rx_bytes: AtomicU64,
    last_handshake: Mutex<Option<SystemTime>>,
}

impl WgPeer {
    fn current_endpoint(&self) -> Option<SocketAddr> {
        *self.endpoint.lock().expect("peer endpoint lock")
    }

    fn set_endpoint(&self, addr: SocketAddr) {
        *self.endpoint.lock().expect("peer endpoint lock") = Some(addr);
    }

    fn mark_handshake(&self) {
        *self.last_handshake.lock().expect("peer handshake lock") = Some(SystemTime::now());
    }
}

#[derive(Default)]
struct DeviceState {
    private_key: Option<StaticSecret>,
    private_key_hex: String,
    listen_port: u16,
    obfs: Option<ObfsParams>,
    peers: Vec<Arc<WgPeer>>,
}

struct DeviceInner {
    state: RwLock<DeviceState>,
    ingress: mpsc::Sender<Vec<u8>>,
    sock4: Mutex<Option<Arc<UdpSocket>>>,
    sock6: Mutex<Option<Arc<UdpSocket>>>,
    bound_port: Mutex<Option<u16>>,
    logger: slog::Logger,
}

/// A userspace WireGuard device bound to the virtual stack.
pub struct WgDevice {
    inner: Arc<DeviceInner>,
    egress: Mutex<Option<mpsc::UnboundedReceiver<Vec<u8>>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl WgDevice {
    /// Create a device over the stack's packet queues, using a default UDP
    /// binding once brought up.
    pub fn new(
        ingress: mpsc::Sender<Vec<u8>>,
        egress: mpsc::UnboundedReceiver<Vec<u8>>,
        logger: slog::Logger,
    ) -> Self {
        WgDevice {
            inner: Arc::new(DeviceInner {
                state: RwLock::new(DeviceState::default()),
                ingress,
                sock4: Mutex::new(None),
                sock6: Mutex::new(None),
                bound_port: Mutex::new(None),
                logger,
            }),
            egress: Mutex::new(Some(egress)),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Apply a UAPI set request.
    pub fn ipc_set(&self, request: &str) -> Result<()> {
        let mut state = self.inner.state.write().expect("device state lock");
        let mut builder: Option<PeerBuilder> = None;

        for line in request.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            let (key, value) = line
                .split_once('=')
                .ok_or_else(|| AppError::tunnel(format!("malformed UAPI line: {line}")))?;

            match key {
                "private_key" => {
                    let bytes = from_hex32(value)?;
                    state.private_key = Some(StaticSecret::from(bytes));
                    state.private_key_hex = value.to_string();
                }
                "listen_port" => {
                    state.listen_port = value
                        .parse()
                        .map_err(|_| AppError::tunnel(format!("bad listen_port: {value}")))?;
                }
                "jc" | "jmin" | "jmax" | "s1" | "s2" | "h1" | "h2" | "h3" | "h4" => {
                    let parsed: u32 = value
                        .parse()
                        .map_err(|_| AppError::tunnel(format!("bad {key}: {value}")))?;
                    let obfs = state.obfs.get_or_insert_with(ObfsParams::default);
                    match key {
                        "jc" => obfs.jc = parsed,
                        "jmin" => obfs.jmin = parsed,
                        "jmax" => obfs.jmax = parsed,
                        "s1" => obfs.s1 = parsed,
                        "s2" => obfs.s2 = parsed,
                        "h1" => obfs.h[0] = parsed,
                        "h2" => obfs.h[1] = parsed,
                        "h3" => obfs.h[2] = parsed,
                        "h4" => obfs.h[3] = parsed,
                        _ => unreachable!(),
                    }
                }
                "i1" | "i2" | "i3" | "i4" | "i5" | "j1" | "j2" | "j3" | "itime" => {
                    let obfs = state.obfs.get_or_insert_with(ObfsParams::default);
                    obfs.opaque.push((key.to_string(), value.to_string()));
                }
                "replace_peers" => {
                    state.peers.clear();
                }
                "public_key" => {
                    if let Some(done) = builder.take() {
                        done.build(&mut state)?;
                    }
                    builder = Some(PeerBuilder::new(value.to_string()));
                }
                _ => {
                    let peer = builder
                        .as_mut()
                        .ok_or_else(|| AppError::tunnel(format!("{key} outside a peer block")))?;
                    peer.apply(key, value)?;
                }
            }
        }

        if let Some(done) = builder.take() {
            done.build(&mut state)?;
        }

        Ok(())
    }

    /// Render the device state as a UAPI get response.
    pub fn ipc_get(&self) -> String {
        use std::fmt::Write;

        let state = self.inner.state.read().expect("device state lock");
        let mut out = String::new();
        let _ = writeln!(out, "private_key={}", state.private_key_hex);
        let port = self
            .inner
            .bound_port
            .lock()
            .expect("bound port lock")
            .unwrap_or(state.listen_port);
        let _ = writeln!(out, "listen_port={port}");

        if let Some(obfs) = &state.obfs {
            let _ = writeln!(out, "jc={}", obfs.jc);
            let _ = writeln!(out, "jmin={}", obfs.jmin);
            let _ = writeln!(out, "jmax={}", obfs.jmax);
            let _ = writeln!(out, "s1={}", obfs.s1);
            let _ = writeln!(out, "s2={}", obfs.s2);
            for (i, h) in obfs.h.iter().enumerate() {
                let _ = writeln!(out, "h{}={}", i + 1, h);
            }
            for (key, value) in &obfs.opaque {
                let _ = writeln!(out, "{key}={value}");
            }
        }

        for peer in &state.peers {
            let _ = writeln!(out, "public_key={}", peer.public_key_hex);
            let _ = writeln!(out, "preshared_key={}", peer.preshared_hex);
            if let Some(endpoint) = peer.current_endpoint() {
                let _ = writeln!(out, "endpoint={endpoint}");
            }
            let since_epoch = peer
                .last_handshake
                .lock()
                .expect("peer handshake lock")
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .unwrap_or(Duration::ZERO);
            let _ = writeln!(out, "last_handshake_time_sec={}", since_epoch.as_secs());
            let _ = writeln!(out, "last_handshake_time_nsec={}", since_epoch.subsec_nanos());
            let _ = writeln!(out, "tx_bytes={}", peer.tx_bytes.load(Ordering::Relaxed));
            let _ = writeln!(out, "rx_bytes={}", peer.rx_bytes.load(Ordering::Relaxed));
            let _ = writeln!(
                out,
                "persistent_keepalive_interval={}",
                peer.keepalive
            );
            for prefix in &peer.allowed_ips {
                let _ = writeln!(out, "allowed_ip={prefix}");
            }
        }

        out.push_str("protocol_version=1\n");
        out.push_str("errno=0\n");
        out
    }

    /// Bind the UDP sockets and start the pumps, timers and initial
    /// handshakes.
    pub async fn up(&self) -> Result<()> {
        let listen_port = {
            let state = self.inner.state.read().expect("device state lock");
            if state.private_key.is_none() {
                return Err(AppError::tunnel("device has no private key"));
            }
            state.listen_port
        };

        let sock4 = UdpSocket::bind(("0.0.0.0", listen_port))
            .await
            .map_err(|e| AppError::tunnel(format!("UDP bind failed: {e}")))?;
        let actual_port = sock4
            .local_addr()
            .map_err(|e| AppError::tunnel(format!("UDP local addr: {e}")))?
            .port();
        let sock4 = Arc::new(sock4);
        let sock6 = match UdpSocket::bind(("::", listen_port)).await {
            Ok(s) => Some(Arc::new(s)),
            Err(e) => {
                slog::debug!(self.inner.logger, "IPv6 UDP bind unavailable"; "error" => %e);
                None
            }
        };

        *self.inner.sock4.lock().expect("sock4 lock") = Some(sock4.clone());
        *self.inner.sock6.lock().expect("sock6 lock") = sock6.clone();
        *self.inner.bound_port.lock().expect("bound port lock") = Some(actual_port);

        let egress = self
            .egress
            .lock()
            .expect("egress lock")
            .take()
            .ok_or_else(|| AppError::tunnel("device already up"))?;

        let mut tasks = self.tasks.lock().expect("task lock");
        tasks.push(tokio::spawn(egress_pump(self.inner.clone(), egress)));
        tasks.push(tokio::spawn(recv_pump(self.inner.clone(), sock4)));
        if let Some(sock6) = sock6 {
            tasks.push(tokio::spawn(recv_pump(self.inner.clone(), sock6)));
        }
        tasks.push(tokio::spawn(timer_pump(self.inner.clone())));
        drop(tasks);

        initiate_handshakes(&self.inner).await;
        Ok(())
    }

    /// Stop the pumps. Peer state is retained.
    pub fn down(&self) {
        for task in self.tasks.lock().expect("task lock").drain(..) {
            task.abort();
        }
    }
}

impl Drop for WgDevice {
    fn drop(&mut self) {
        self.down();
    }
}

struct PeerBuilder {
    public_key_hex: String,
    preshared_hex: String,
    keepalive: u16,
    endpoint: Option<SocketAddr>,
    allowed_ips: Vec<IpNet>,
    update_only: bool,
}

impl PeerBuilder {
    fn new(public_key_hex: String) -> Self {
        PeerBuilder {
            public_key_hex,
            preshared_hex: ZERO_PSK_HEX.to_string(),
            keepalive: 0,
            endpoint: None,
            allowed_ips: Vec::new(),
            update_only: false,
        }
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<()> {
        match key {
            "update_only" => self.update_only = true,
            "preshared_key" => self.preshared_hex = value.to_string(),
            "persistent_keepalive_interval" => {
                self.keepalive = value
                    .parse()
                    .map_err(|_| AppError::tunnel(format!("bad keepalive: {value}")))?;
            }
            "endpoint" => {
                self.endpoint = Some(value.parse().map_err(|_| {
                    AppError::tunnel(format!("bad endpoint: {value}"))
                })?);
            }
            "replace_allowed_ips" => self.allowed_ips.clear(),
            "allowed_ip" => {
                self.allowed_ips.push(value.parse().map_err(|_| {
                    AppError::tunnel(format!("bad allowed_ip: {value}"))
                })?);
            }
            _ => return Err(AppError::tunnel(format!("unknown UAPI key: {key}"))),
        }
        Ok(())
    }

    fn build(self, state: &mut DeviceState) -> Result<()> {
        if self.update_only
            && !state
                .peers
                .iter()
                .any(|p| p.public_key_hex == self.public_key_hex)
        {
            return Ok(());
        }
        // Rebuilding an existing peer resets its sessions.
        state.peers.retain(|p| p.public_key_hex != self.public_key_hex);

        let private_key = state
            .private_key
            .clone()
            .ok_or_else(|| AppError::tunnel("peer specified before private_key"))?;
        let public_key = PublicKey::from(from_hex32(&self.public_key_hex)?);
        let preshared = if self.preshared_hex == ZERO_PSK_HEX {
            None
        } else {
            Some(from_hex32(&self.preshared_hex)?)
        };
        let keepalive = if self.keepalive == 0 {
            None
        } else {
            Some(self.keepalive)
        };

        let index = state.peers.len() as u32;
        let tunn = Tunn::new(private_key, public_key, preshared, keepalive, index, None)
            .map_err(|e| AppError::tunnel(format!("cannot create peer tunnel: {e}")))?;

        state.peers.push(Arc::new(WgPeer {
            public_key_hex: self.public_key_hex,
            preshared_hex: self.preshared_hex,
            keepalive: self.keepalive,
            allowed_ips: self.allowed_ips,
            endpoint: Mutex::new(self.endpoint),
            tunn: Mutex::new(*tunn),
            tx_bytes: AtomicU64::new(0),
            rx_bytes: AtomicU64::new(0),
            last_handshake: Mutex::new(None),
        }));
        Ok(())
    }
}

fn from_hex32(hex: &str) -> Result<[u8; 32]> {
    if hex.len() != 64 {
        return Err(AppError::tunnel(format!("key should be 32 bytes: {hex}")));
    }
    let mut out = [0u8; 32];
    for (i, byte) in out.iter_mut().enumerate() {
        *byte = u8::from_str_radix(&hex[i * 2..i * 2 + 2], 16)
            .map_err(|_| AppError::tunnel(format!("invalid hex key: {hex}")))?;
    }
    Ok(out)
}

// ---------------------------------------------------------------------------
// Packet pumps

fn destination_ip(packet: &[u8]) -> Option<IpAddr> {
    match packet.first()? >> 4 {
        4 if packet.len() >= 20 => {
            let mut octets = [0u8; 4];
            octets.copy_from_slice(&packet[16..20]);
            Some(IpAddr::from(octets))
        }
        6 if packet.len() >= 40 => {
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&packet[24..40]);
            Some(IpAddr::from(octets))
        }
        _ => None,
    }
}

fn route_packet(state: &DeviceState, dst: IpAddr) -> Option<Arc<WgPeer>> {
    let mut best: Option<(u8, Arc<WgPeer>)> = None;
    for peer in &state.peers {
        for net in &peer.allowed_ips {
            if net.contains(&dst) {
                let len = net.prefix_len();
                if best.as_ref().map_or(true, |(b, _)| len > *b) {
                    best = Some((len, peer.clone()));
                }
            }
        }
    }
    best.map(|(_, peer)| peer)
}

async fn egress_pump(inner: Arc<DeviceInner>, mut egress: mpsc::UnboundedReceiver<Vec<u8>>) {
    let mut scratch = vec![0u8; WIRE_BUFFER];
    while let Some(packet) = egress.recv().await {
        let Some(dst) = destination_ip(&packet) else {
            continue;
        };
        let peer = {
            let state = inner.state.read().expect("device state lock");
            route_packet(&state, dst)
        };
        let Some(peer) = peer else {
            slog::debug!(inner.logger, "no peer for destination"; "dst" => %dst);
            continue;
        };

        let wire = {
            let mut tunn = peer.tunn.lock().expect("peer tunn lock");
            match tunn.encapsulate(&packet, &mut scratch) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                TunnResult::Err(e) => {
                    slog::debug!(inner.logger, "encapsulate failed"; "error" => ?e);
                    None
                }
                _ => None,
            }
        };
        if let Some(wire) = wire {
            peer.tx_bytes
                .fetch_add(packet.len() as u64, Ordering::Relaxed);
            send_wire(&inner, &peer, wire).await;
        }
    }
}

async fn recv_pump(inner: Arc<DeviceInner>, socket: Arc<UdpSocket>) {
    let mut buf = vec![0u8; WIRE_BUFFER];
    let mut scratch = vec![0u8; WIRE_BUFFER];
    loop {
        let (n, src) = match socket.recv_from(&mut buf).await {
            Ok(received) => received,
            Err(e) => {
                slog::debug!(inner.logger, "UDP receive failed"; "error" => %e);
                return;
            }
        };

        let obfs = {
            let state = inner.state.read().expect("device state lock");
            state.obfs.clone()
        };
        let Some((msg_type, datagram)) = deobfuscate(obfs.as_ref(), &buf[..n]) else {
            continue;
        };

        // Prefer the peer whose recorded endpoint matches the sender, then
        // fall back to trying the rest (roaming, first contact).
        let candidates: Vec<Arc<WgPeer>> = {
            let state = inner.state.read().expect("device state lock");
            let mut peers = state.peers.clone();
            peers.sort_by_key(|p| p.current_endpoint() != Some(src));
            peers
        };

        for peer in candidates {
            let outcome = decapsulate_one(&peer, src, &datagram, &mut scratch);
            let Some((to_network, to_tunnel)) = outcome else {
                continue;
            };

            peer.set_endpoint(src);
            if msg_type == MSG_INITIATION || msg_type == MSG_RESPONSE {
                peer.mark_handshake();
            }
            for wire in to_network {
                send_wire(&inner, &peer, wire).await;
            }
            for plain in to_tunnel {
                peer.rx_bytes
                    .fetch_add(plain.len() as u64, Ordering::Relaxed);
                if inner.ingress.send(plain).await.is_err() {
                    return;
                }
            }
            break;
        }
    }
}

type DecapsulateOutcome = (Vec<Vec<u8>>, Vec<Vec<u8>>);

fn decapsulate_one(
    peer: &WgPeer,
    src: SocketAddr,
    datagram: &[u8],
    scratch: &mut [u8],
) -> Option<DecapsulateOutcome> {
    let mut tunn = peer.tunn.lock().expect("peer tunn lock");
    let mut to_network = Vec::new();
    let mut to_tunnel = Vec::new();

    match tunn.decapsulate(Some(src.ip()), datagram, scratch) {
        TunnResult::Err(_) => return None,
        TunnResult::WriteToNetwork(data) => {
            to_network.push(data.to_vec());
            // Flush whatever the engine queued behind the handshake.
            loop {
                match tunn.decapsulate(None, &[], scratch) {
                    TunnResult::WriteToNetwork(more) => to_network.push(more.to_vec()),
                    _ => break,
                }
            }
        }
        TunnResult::WriteToTunnelV4(data, _) | TunnResult::WriteToTunnelV6(data, _) => {
            to_tunnel.push(data.to_vec());
        }
        TunnResult::Done => {}
    }

    Some((to_network, to_tunnel))
}

async fn timer_pump(inner: Arc<DeviceInner>) {
    let mut scratch = vec![0u8; WIRE_BUFFER];
    let mut ticker = tokio::time::interval(TIMER_TICK);
    loop {
        ticker.tick().await;
        let peers: Vec<Arc<WgPeer>> = {
            let state = inner.state.read().expect("device state lock");
            state.peers.clone()
        };
        for peer in peers {
            let wire = {
                let mut tunn = peer.tunn.lock().expect("peer tunn lock");
                match tunn.update_timers(&mut scratch) {
                    TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                    TunnResult::Err(e) => {
                        slog::debug!(inner.logger, "timer update failed"; "error" => ?e);
                        None
                    }
                    _ => None,
                }
            };
            if let Some(wire) = wire {
                send_wire(&inner, &peer, wire).await;
            }
        }
    }
}

async fn initiate_handshakes(inner: &Arc<DeviceInner>) {
    let peers: Vec<Arc<WgPeer>> = {
        let state = inner.state.read().expect("device state lock");
        state.peers.clone()
    };
    let mut scratch = vec![0u8; WIRE_BUFFER];
    for peer in peers {
        if peer.current_endpoint().is_none() {
            continue;
        }
        let wire = {
            let mut tunn = peer.tunn.lock().expect("peer tunn lock");
            match tunn.format_handshake_initiation(&mut scratch, false) {
                TunnResult::WriteToNetwork(data) => Some(data.to_vec()),
                _ => None,
            }
        };
        if let Some(wire) = wire {
            send_wire(inner, &peer, wire).await;
        }
    }
}

/// Obfuscate (when configured) and transmit one wire datagram to the peer.
async fn send_wire(inner: &Arc<DeviceInner>, peer: &WgPeer, wire: Vec<u8>) {
    let Some(endpoint) = peer.current_endpoint() else {
        slog::debug!(inner.logger, "dropping packet for endpointless peer";
            "peer" => &peer.public_key_hex[..8]);
        return;
    };

    let socket = {
        let guard = if endpoint.is_ipv4() {
            inner.sock4.lock().expect("sock4 lock")
        } else {
            inner.sock6.lock().expect("sock6 lock")
        };
        guard.clone()
    };
    let Some(socket) = socket else {
        slog::debug!(inner.logger, "no socket for endpoint family"; "endpoint" => %endpoint);
        return;
    };

    let obfs = {
        let state = inner.state.read().expect("device state lock");
        state.obfs.clone()
    };

    if let Some(obfs) = &obfs {
        if message_type(&wire) == Some(MSG_INITIATION) && obfs.jc > 0 && obfs.jmax >= obfs.jmin {
            for _ in 0..obfs.jc {
                let junk = {
                    let mut rng = rand::thread_rng();
                    let len = if obfs.jmax > obfs.jmin {
                        rng.gen_range(obfs.jmin..=obfs.jmax) as usize
                    } else {
                        obfs.jmin as usize
                    };
                    if len == 0 {
                        continue;
                    }
                    let mut junk = vec![0u8; len];
                    rng.fill_bytes(&mut junk);
                    junk
                };
                if let Err(e) = socket.send_to(&junk, endpoint).await {
                    slog::debug!(inner.logger, "junk send failed"; "error" => %e);
                }
            }
        }
    }

    let wire = obfuscate(obfs.as_ref(), wire);
    if let Err(e) = socket.send_to(&wire, endpoint).await {
        slog::debug!(inner.logger, "UDP send failed"; "endpoint" => %endpoint, "error" => %e);
    }
}

// ---------------------------------------------------------------------------
// AmneziaWG wire transforms

fn message_type(wire: &[u8]) -> Option<u32> {
    if wire.len() < 4 {
        return None;
    }
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&wire[..4]);
    Some(u32::from_le_bytes(raw))
}

/// Apply magic headers and junk prefixes to an outgoing datagram.
fn obfuscate(params: Option<&ObfsParams>, mut wire: Vec<u8>) -> Vec<u8> {
    let Some(params) = params else {
        return wire;
    };
    let Some(msg_type) = message_type(&wire) else {
        return wire;
    };
    if !(MSG_INITIATION..=MSG_TRANSPORT).contains(&msg_type) {
        return wire;
    }

    let magic = params.headers()[(msg_type - 1) as usize].to_le_bytes();
    let junk_len = match msg_type {
        MSG_INITIATION => params.s1 as usize,
        MSG_RESPONSE => params.s2 as usize,
        _ => 0,
    };

    if junk_len > 0 {
        let mut out = vec![0u8; junk_len];
        rand::thread_rng().fill_bytes(&mut out);
        out.extend_from_slice(&wire);
        out[junk_len..junk_len + 4].copy_from_slice(&magic);
        out
    } else {
        wire[..4].copy_from_slice(&magic);
        wire
    }
}

/// Undo the wire transforms on an incoming datagram, returning the message
/// type and the clean WireGuard packet. `None` drops the datagram.
fn deobfuscate(params: Option<&ObfsParams>, data: &[u8]) -> Option<(u32, Vec<u8>)> {
    let Some(params) = params else {
        return message_type(data).map(|t| (t, data.to_vec()));
    };
    let headers = params.headers();

    let magic_at = |offset: usize| -> Option<u32> {
        if data.len() < offset + 4 {
            return None;
        }
        let mut raw = [0u8; 4];
        raw.copy_from_slice(&data[offset..offset + 4]);
        let value = u32::from_le_bytes(raw);
        headers.iter().position(|&h| h == value).map(|i| i as u32 + 1)
    };

    // Transport and cookie frames carry no junk prefix; check them first.
    if let Some(t @ (MSG_TRANSPORT | MSG_COOKIE)) = magic_at(0) {
        let mut clean = data.to_vec();
        clean[..4].copy_from_slice(&t.to_le_bytes());
        return Some((t, clean));
    }
    if let Some(MSG_RESPONSE) = magic_at(params.s2 as usize) {
        let mut clean = data[params.s2 as usize..].to_vec();
        clean[..4].copy_from_slice(&MSG_RESPONSE.to_le_bytes());
        return Some((MSG_RESPONSE, clean));
    }
    if let Some(MSG_INITIATION) = magic_at(params.s1 as usize) {
        let mut clean = data[params.s1 as usize..].to_vec();
        clean[..4].copy_from_slice(&MSG_INITIATION.to_le_bytes());
        return Some((MSG_INITIATION, clean));
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{parse_config_str, to_hex};
    use crate::uapi::device_request;

    const CONFIG: &str = "
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.5.0.2
ListenPort = 51820

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
AllowedIPs = 0.0.0.0/0, ::/0
Endpoint = 94.140.11.15:51820
PersistentKeepalive = 25";

    fn test_device() -> (WgDevice, mpsc::Receiver<Vec<u8>>) {
        let (ingress_tx, ingress_rx) = mpsc::channel(16);
        let (_egress_tx, egress_rx) = mpsc::unbounded_channel();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        (WgDevice::new(ingress_tx, egress_rx, logger), ingress_rx)
    }

    #[test]
    fn test_ipc_set_builds_peers() {
        let conf = parse_config_str(CONFIG).unwrap();
        let (device, _rx) = test_device();
        device.ipc_set(&device_request(&conf.device, false)).unwrap();

        let state = device.inner.state.read().unwrap();
        assert_eq!(state.listen_port, 51820);
        assert_eq!(state.peers.len(), 1);
        let peer = &state.peers[0];
        assert_eq!(peer.keepalive, 25);
        assert_eq!(peer.allowed_ips.len(), 2);
        assert_eq!(
            peer.current_endpoint(),
            Some("94.140.11.15:51820".parse().unwrap())
        );
    }

    #[test]
    fn test_ipc_set_rejects_unknown_key() {
        let (device, _rx) = test_device();
        let err = device.ipc_set("bogus_key=1\n").unwrap_err();
        assert!(err.to_string().contains("outside a peer block"));
    }

    #[test]
    fn test_ipc_get_round_trips_configuration() {
        let conf = parse_config_str(CONFIG).unwrap();
        let (device, _rx) = test_device();
        device.ipc_set(&device_request(&conf.device, false)).unwrap();

        let get = device.ipc_get();
        assert!(get.starts_with("private_key="));
        assert!(get.contains(&format!("public_key={}", conf.device.peers[0].public_key)));
        assert!(get.contains("persistent_keepalive_interval=25\n"));
        assert!(get.contains("allowed_ip=0.0.0.0/0\n"));
        assert!(get.contains("last_handshake_time_sec=0\n"));
        assert!(get.ends_with("protocol_version=1\nerrno=0\n"));
    }

    #[test]
    fn test_route_packet_longest_prefix() {
        let conf = parse_config_str(
            "
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.5.0.2

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
AllowedIPs = 0.0.0.0/0

[Peer]
PublicKey = SHnh4C2aDXhp1gjIqceGhJrhOLSeNYcqWLKcYnzj00U=
AllowedIPs = 10.6.0.0/16",
        )
        .unwrap();
        let (device, _rx) = test_device();
        device.ipc_set(&device_request(&conf.device, false)).unwrap();

        let state = device.inner.state.read().unwrap();
        let narrow = route_packet(&state, "10.6.1.1".parse().unwrap()).unwrap();
        assert_eq!(narrow.public_key_hex, conf.device.peers[1].public_key);
        let wide = route_packet(&state, "1.1.1.1".parse().unwrap()).unwrap();
        assert_eq!(wide.public_key_hex, conf.device.peers[0].public_key);
    }

    #[test]
    fn test_destination_ip_extraction() {
        let mut v4 = vec![0u8; 20];
        v4[0] = 0x45;
        v4[16..20].copy_from_slice(&[8, 8, 8, 8]);
        assert_eq!(destination_ip(&v4), Some("8.8.8.8".parse().unwrap()));

        let mut v6 = vec![0u8; 40];
        v6[0] = 0x60;
        v6[24..40].copy_from_slice(&"2001:db8::1".parse::<std::net::Ipv6Addr>().unwrap().octets());
        assert_eq!(destination_ip(&v6), Some("2001:db8::1".parse().unwrap()));
    }

    fn obfs_fixture() -> ObfsParams {
        ObfsParams {
            jc: 3,
            jmin: 10,
            jmax: 50,
            s1: 15,
            s2: 70,
            h: [1234, 2345, 3456, 4567],
            opaque: Vec::new(),
        }
    }

    #[test]
    fn test_obfuscation_round_trip_initiation() {
        let params = obfs_fixture();
        let mut packet = vec![0u8; 148];
        packet[..4].copy_from_slice(&MSG_INITIATION.to_le_bytes());
        packet[4..8].copy_from_slice(&[9, 9, 9, 9]);

        let wire = obfuscate(Some(&params), packet.clone());
        assert_eq!(wire.len(), 148 + 15);
        // The type field is replaced by the magic header after the junk.
        assert_eq!(&wire[15..19], &1234u32.to_le_bytes());

        let (msg_type, clean) = deobfuscate(Some(&params), &wire).unwrap();
        assert_eq!(msg_type, MSG_INITIATION);
        assert_eq!(clean, packet);
    }

    #[test]
    fn test_obfuscation_round_trip_transport() {
        let params = obfs_fixture();
        let mut packet = vec![0u8; 96];
        packet[..4].copy_from_slice(&MSG_TRANSPORT.to_le_bytes());
        packet[40] = 0x7F;

        let wire = obfuscate(Some(&params), packet.clone());
        assert_eq!(wire.len(), packet.len());
        assert_eq!(&wire[..4], &4567u32.to_le_bytes());

        let (msg_type, clean) = deobfuscate(Some(&params), &wire).unwrap();
        assert_eq!(msg_type, MSG_TRANSPORT);
        assert_eq!(clean, packet);
    }

    #[test]
    fn test_deobfuscate_drops_unknown_frames() {
        let params = obfs_fixture();
        let garbage = vec![0xFFu8; 64];
        assert!(deobfuscate(Some(&params), &garbage).is_none());
    }

    #[test]
    fn test_no_obfuscation_passthrough() {
        let mut packet = vec![0u8; 32];
        packet[..4].copy_from_slice(&MSG_TRANSPORT.to_le_bytes());
        let wire = obfuscate(None, packet.clone());
        assert_eq!(wire, packet);
        let (msg_type, clean) = deobfuscate(None, &packet).unwrap();
        assert_eq!(msg_type, MSG_TRANSPORT);
        assert_eq!(clean, packet);
    }

    #[test]
    fn test_from_hex32() {
        let hex = "2c0af568d48d17d774323c1480054ae34db44f437f139354b6a56fe449ec4b3d";
        let bytes = from_hex32(hex).unwrap();
        assert_eq!(to_hex(&bytes), hex);
        assert!(from_hex32("abcd").is_err());
        assert!(from_hex32(&"zz".repeat(32)).is_err());
    }
}
