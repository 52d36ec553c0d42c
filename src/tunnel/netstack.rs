//! Userspace network stack attached to the WireGuard device.
//!
//! A smoltcp interface runs over a channel-backed IP device: packets the
//! stack emits flow out through an unbounded channel to the device for
//! encapsulation, and decapsulated packets are injected back through a
//! bounded channel. One reactor task owns the interface and socket set;
//! socket wrappers talk to it through a shared mutex and smoltcp's native
//! recv/send wakers, nudging the reactor with a `Notify` whenever they
//! queue work.

use std::collections::VecDeque;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use smoltcp::iface::{Config, Interface, SocketHandle, SocketSet};
use smoltcp::phy::{Device, DeviceCapabilities, Medium, RxToken, TxToken};
use smoltcp::socket::{icmp, tcp, udp};
use smoltcp::time::Instant as SmolInstant;
use smoltcp::wire::{
    Icmpv4Packet, Icmpv4Repr, Icmpv6Packet, Icmpv6Repr, IpAddress, IpCidr, IpEndpoint,
    IpListenEndpoint,
};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::sync::mpsc;
use tokio::sync::Notify;

const TCP_BUFFER_SIZE: usize = 65535;
const UDP_PACKET_COUNT: usize = 8;
const UDP_BUFFER_SIZE: usize = 16384;
const ICMP_PACKET_COUNT: usize = 4;
const ICMP_BUFFER_SIZE: usize = 4096;
const INGRESS_QUEUE: usize = 256;

const EPHEMERAL_PORT_FIRST: u16 = 49152;

/// Packet channels linking the stack to the WireGuard device.
pub struct StackPipes {
    /// Decapsulated IP packets from the device are pushed here.
    pub ingress: mpsc::Sender<Vec<u8>>,
    /// IP packets the stack emits, awaiting encapsulation.
    pub egress: mpsc::UnboundedReceiver<Vec<u8>>,
}

/// Channel-backed IP device presented to smoltcp.
struct ChannelDevice {
    rx_queue: VecDeque<Vec<u8>>,
    egress: mpsc::UnboundedSender<Vec<u8>>,
    mtu: usize,
}

struct QueueRxToken {
    buffer: Vec<u8>,
}

impl RxToken for QueueRxToken {
    fn consume<R, F>(mut self, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        f(&mut self.buffer)
    }
}

struct ChannelTxToken {
    egress: mpsc::UnboundedSender<Vec<u8>>,
}

impl TxToken for ChannelTxToken {
    fn consume<R, F>(self, len: usize, f: F) -> R
    where
        F: FnOnce(&mut [u8]) -> R,
    {
        let mut buffer = vec![0u8; len];
        let result = f(&mut buffer);
        let _ = self.egress.send(buffer);
        result
    }
}

impl Device for ChannelDevice {
    type RxToken<'a> = QueueRxToken;
    type TxToken<'a> = ChannelTxToken;

    fn receive(&mut self, _timestamp: SmolInstant) -> Option<(Self::RxToken<'_>, Self::TxToken<'_>)> {
        let buffer = self.rx_queue.pop_front()?;
        Some((
            QueueRxToken { buffer },
            ChannelTxToken {
                egress: self.egress.clone(),
            },
        ))
    }

    fn transmit(&mut self, _timestamp: SmolInstant) -> Option<Self::TxToken<'_>> {
        Some(ChannelTxToken {
            egress: self.egress.clone(),
        })
    }

    fn capabilities(&self) -> DeviceCapabilities {
        let mut caps = DeviceCapabilities::default();
        caps.medium = Medium::Ip;
        caps.max_transmission_unit = self.mtu;
        caps
    }
}

struct StackState {
    iface: Interface,
    device: ChannelDevice,
    sockets: SocketSet<'static>,
    next_ephemeral: u16,
    next_icmp_ident: u16,
    // TCP handles whose owners are gone; removed once fully closed.
    reclaim: Vec<SocketHandle>,
}

impl StackState {
    fn alloc_port(&mut self) -> u16 {
        let port = self.next_ephemeral;
        self.next_ephemeral = if port == u16::MAX {
            EPHEMERAL_PORT_FIRST
        } else {
            port + 1
        };
        port
    }

    fn poll(&mut self) {
        let now = SmolInstant::now();
        let _ = self.iface.poll(now, &mut self.device, &mut self.sockets);
        let StackState { sockets, reclaim, .. } = self;
        reclaim.retain(|&handle| {
            if sockets.get::<tcp::Socket>(handle).state() == tcp::State::Closed {
                sockets.remove(handle);
                false
            } else {
                true
            }
        });
    }
}

struct StackShared {
    state: Mutex<StackState>,
    notify: Notify,
    local_addrs: Vec<IpAddr>,
}

impl StackShared {
    fn lock(&self) -> std::sync::MutexGuard<'_, StackState> {
        self.state.lock().expect("netstack state poisoned")
    }

    /// Wake the reactor so queued socket work gets flushed onto the wire.
    fn kick(&self) {
        self.notify.notify_one();
    }
}

/// Dial-capable handle onto the virtual stack ("Tnet").
#[derive(Clone)]
pub struct NetStack {
    shared: Arc<StackShared>,
}

fn to_ip_address(ip: IpAddr) -> IpAddress {
    match ip {
        IpAddr::V4(v4) => {
            let o = v4.octets();
            IpAddress::v4(o[0], o[1], o[2], o[3])
        }
        IpAddr::V6(v6) => {
            let s = v6.segments();
            IpAddress::v6(s[0], s[1], s[2], s[3], s[4], s[5], s[6], s[7])
        }
    }
}

fn to_endpoint(addr: SocketAddr) -> IpEndpoint {
    IpEndpoint::new(to_ip_address(addr.ip()), addr.port())
}

/// Build the virtual stack and spawn its reactor.
///
/// Mirrors the netstack contract of the original tunnel library: local
/// addresses and MTU in, a dialer handle plus the device-facing packet
/// queues out.
pub fn create(addresses: &[IpAddr], mtu: usize) -> (NetStack, StackPipes) {
    let (egress_tx, egress_rx) = mpsc::unbounded_channel();
    let (ingress_tx, ingress_rx) = mpsc::channel(INGRESS_QUEUE);

    let mut device = ChannelDevice {
        rx_queue: VecDeque::new(),
        egress: egress_tx,
        mtu,
    };

    let mut config = Config::new(smoltcp::wire::HardwareAddress::Ip);
    config.random_seed = rand::random();
    let mut iface = Interface::new(config, &mut device, SmolInstant::now());

    iface.update_ip_addrs(|addrs| {
        for addr in addresses {
            let cidr = match addr {
                IpAddr::V4(_) => IpCidr::new(to_ip_address(*addr), 32),
                IpAddr::V6(_) => IpCidr::new(to_ip_address(*addr), 128),
            };
            let _ = addrs.push(cidr);
        }
    });

    // Everything non-local goes to the device; the next hop is fictional on
    // an IP-medium interface, so the interface's own address serves.
    if let Some(v4) = addresses.iter().find(|a| a.is_ipv4()) {
        if let IpAddress::Ipv4(gw) = to_ip_address(*v4) {
            let _ = iface.routes_mut().add_default_ipv4_route(gw);
        }
    }
    if let Some(v6) = addresses.iter().find(|a| a.is_ipv6()) {
        if let IpAddress::Ipv6(gw) = to_ip_address(*v6) {
            let _ = iface.routes_mut().add_default_ipv6_route(gw);
        }
    }

    let shared = Arc::new(StackShared {
        state: Mutex::new(StackState {
            iface,
            device,
            sockets: SocketSet::new(vec![]),
            next_ephemeral: EPHEMERAL_PORT_FIRST,
            next_icmp_ident: 1,
            reclaim: Vec::new(),
        }),
        notify: Notify::new(),
        local_addrs: addresses.to_vec(),
    });

    tokio::spawn(reactor(shared.clone(), ingress_rx));

    (
        NetStack { shared },
        StackPipes {
            ingress: ingress_tx,
            egress: egress_rx,
        },
    )
}

async fn reactor(shared: Arc<StackShared>, mut ingress: mpsc::Receiver<Vec<u8>>) {
    loop {
        let delay = {
            let mut state = shared.lock();
            while let Ok(packet) = ingress.try_recv() {
                state.device.rx_queue.push_back(packet);
            }
            state.poll();
            let now = SmolInstant::now();
            let StackState { iface, sockets, .. } = &mut *state;
            iface.poll_delay(now, sockets)
        };

        match delay {
            Some(d) if d.total_micros() == 0 => continue,
            Some(d) => {
                let sleep = tokio::time::sleep(std::time::Duration::from_micros(d.total_micros()));
                tokio::select! {
                    packet = ingress.recv() => match packet {
                        Some(p) => shared.lock().device.rx_queue.push_back(p),
                        None => break,
                    },
                    _ = shared.notify.notified() => {}
                    _ = sleep => {}
                }
            }
            None => {
                tokio::select! {
                    packet = ingress.recv() => match packet {
                        Some(p) => shared.lock().device.rx_queue.push_back(p),
                        None => break,
                    },
                    _ = shared.notify.notified() => {}
                }
            }
        }
    }
}

impl NetStack {
    /// Open a TCP connection through the tunnel.
    pub async fn dial_tcp(&self, remote: SocketAddr) -> io::Result<TnetTcpStream> {
        let handle = {
            let mut state = self.shared.lock();
            let rx = tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]);
            let tx = tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]);
            let mut socket = tcp::Socket::new(rx, tx);
            let port = state.alloc_port();
            let StackState { iface, .. } = &mut *state;
            socket
                .connect(iface.context(), to_endpoint(remote), port)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, format!("connect: {e}")))?;
            state.sockets.add(socket)
        };
        self.shared.kick();

        let shared = self.shared.clone();
        let established = std::future::poll_fn(|cx| {
            let mut state = shared.lock();
            let socket = state.sockets.get_mut::<tcp::Socket>(handle);
            match socket.state() {
                tcp::State::SynSent | tcp::State::SynReceived => {
                    socket.register_send_waker(cx.waker());
                    Poll::Pending
                }
                _ if socket.may_send() => Poll::Ready(Ok(())),
                _ => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::ConnectionRefused,
                    format!("connection to {remote} refused"),
                ))),
            }
        })
        .await;

        if let Err(e) = established {
            let mut state = self.shared.lock();
            state.sockets.remove(handle);
            return Err(e);
        }

        Ok(TnetTcpStream {
            shared: self.shared.clone(),
            handle,
        })
    }

    /// Bind a "connected" UDP socket with the given remote.
    pub fn dial_udp(&self, remote: SocketAddr) -> io::Result<TnetUdpSocket> {
        let mut state = self.shared.lock();
        let rx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_COUNT],
            vec![0; UDP_BUFFER_SIZE],
        );
        let tx = udp::PacketBuffer::new(
            vec![udp::PacketMetadata::EMPTY; UDP_PACKET_COUNT],
            vec![0; UDP_BUFFER_SIZE],
        );
        let mut socket = udp::Socket::new(rx, tx);
        let port = state.alloc_port();
        socket
            .bind(IpListenEndpoint { addr: None, port })
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("udp bind: {e}")))?;
        let handle = state.sockets.add(socket);
        drop(state);

        Ok(TnetUdpSocket {
            shared: self.shared.clone(),
            handle,
            remote,
        })
    }

    /// Open an ICMP echo socket towards `remote`.
    pub fn dial_ping(&self, remote: IpAddr) -> io::Result<TnetPingSocket> {
        let mut state = self.shared.lock();
        let rx = icmp::PacketBuffer::new(
            vec![icmp::PacketMetadata::EMPTY; ICMP_PACKET_COUNT],
            vec![0; ICMP_BUFFER_SIZE],
        );
        let tx = icmp::PacketBuffer::new(
            vec![icmp::PacketMetadata::EMPTY; ICMP_PACKET_COUNT],
            vec![0; ICMP_BUFFER_SIZE],
        );
        let mut socket = icmp::Socket::new(rx, tx);
        let ident = state.next_icmp_ident;
        state.next_icmp_ident = state.next_icmp_ident.wrapping_add(1).max(1);
        socket
            .bind(icmp::Endpoint::Ident(ident))
            .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("icmp bind: {e}")))?;
        let handle = state.sockets.add(socket);

        let local = match remote {
            IpAddr::V4(_) => self.shared.local_addrs.iter().find(|a| a.is_ipv4()),
            IpAddr::V6(_) => self.shared.local_addrs.iter().find(|a| a.is_ipv6()),
        }
        .copied()
        .ok_or_else(|| {
            state.sockets.remove(handle);
            io::Error::new(
                io::ErrorKind::AddrNotAvailable,
                format!("no local address with the family of {remote}"),
            )
        })?;
        drop(state);

        Ok(TnetPingSocket {
            shared: self.shared.clone(),
            handle,
            remote,
            local,
            ident,
        })
    }

    /// Listen for TCP connections arriving over the tunnel.
    pub fn listen_tcp(&self, port: u16) -> io::Result<TnetTcpListener> {
        let mut state = self.shared.lock();
        let handle = listen_socket(&mut state, port)?;
        drop(state);
        Ok(TnetTcpListener {
            shared: self.shared.clone(),
            handle,
            port,
        })
    }
}

fn listen_socket(state: &mut StackState, port: u16) -> io::Result<SocketHandle> {
    let rx = tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]);
    let tx = tcp::SocketBuffer::new(vec![0; TCP_BUFFER_SIZE]);
    let mut socket = tcp::Socket::new(rx, tx);
    socket
        .listen(IpListenEndpoint { addr: None, port })
        .map_err(|e| io::Error::new(io::ErrorKind::AddrInUse, format!("listen: {e}")))?;
    Ok(state.sockets.add(socket))
}

/// A TCP connection running inside the virtual stack.
pub struct TnetTcpStream {
    shared: Arc<StackShared>,
    handle: SocketHandle,
}

impl AsyncRead for TnetTcpStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
        if socket.can_recv() {
            let n = socket
                .recv_slice(buf.initialize_unfilled())
                .map_err(|e| io::Error::new(io::ErrorKind::ConnectionReset, format!("recv: {e}")))?;
            buf.advance(n);
            drop(state);
            self.shared.kick();
            Poll::Ready(Ok(()))
        } else if !socket.may_recv() {
            // Remote closed and the buffer is drained.
            Poll::Ready(Ok(()))
        } else {
            socket.register_recv_waker(cx.waker());
            Poll::Pending
        }
    }
}

impl AsyncWrite for TnetTcpStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        let mut state = self.shared.lock();
        let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
        if socket.can_send() {
            let n = socket
                .send_slice(buf)
                .map_err(|e| io::Error::new(io::ErrorKind::BrokenPipe, format!("send: {e}")))?;
            drop(state);
            self.shared.kick();
            Poll::Ready(Ok(n))
        } else if !socket.may_send() {
            Poll::Ready(Err(io::ErrorKind::BrokenPipe.into()))
        } else {
            socket.register_send_waker(cx.waker());
            Poll::Pending
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
        if socket.send_queue() == 0 || !socket.may_send() {
            Poll::Ready(Ok(()))
        } else {
            socket.register_send_waker(cx.waker());
            drop(state);
            self.shared.kick();
            Poll::Pending
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
        let mut state = self.shared.lock();
        state.sockets.get_mut::<tcp::Socket>(self.handle).close();
        drop(state);
        self.shared.kick();
        Poll::Ready(Ok(()))
    }
}

impl Drop for TnetTcpStream {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.sockets.get_mut::<tcp::Socket>(self.handle).close();
        state.reclaim.push(self.handle);
        drop(state);
        self.shared.kick();
    }
}

/// A connected UDP socket inside the virtual stack.
pub struct TnetUdpSocket {
    shared: Arc<StackShared>,
    handle: SocketHandle,
    remote: SocketAddr,
}

impl TnetUdpSocket {
    pub fn send(&self, data: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        let endpoint = to_endpoint(self.remote);
        let socket = state.sockets.get_mut::<udp::Socket>(self.handle);
        socket
            .send_slice(data, endpoint)
            .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, format!("udp send: {e}")))?;
        drop(state);
        self.shared.kick();
        Ok(())
    }

    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        std::future::poll_fn(|cx| {
            let mut state = self.shared.lock();
            let socket = state.sockets.get_mut::<udp::Socket>(self.handle);
            if socket.can_recv() {
                match socket.recv_slice(buf) {
                    Ok((n, _meta)) => Poll::Ready(Ok(n)),
                    Err(e) => Poll::Ready(Err(io::Error::new(
                        io::ErrorKind::Other,
                        format!("udp recv: {e}"),
                    ))),
                }
            } else {
                socket.register_recv_waker(cx.waker());
                Poll::Pending
            }
        })
        .await
    }
}

impl Drop for TnetUdpSocket {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.sockets.remove(self.handle);
        drop(state);
        self.shared.kick();
    }
}

/// An ICMP echo socket inside the virtual stack.
pub struct TnetPingSocket {
    shared: Arc<StackShared>,
    handle: SocketHandle,
    remote: IpAddr,
    local: IpAddr,
    ident: u16,
}

impl std::fmt::Debug for TnetPingSocket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TnetPingSocket")
            .field("handle", &self.handle)
            .field("remote", &self.remote)
            .field("local", &self.local)
            .field("ident", &self.ident)
            .finish()
    }
}

impl TnetPingSocket {
    /// Send one echo request carrying `seq` and `payload`.
    pub fn send_echo(&self, seq: u16, payload: &[u8]) -> io::Result<()> {
        let mut state = self.shared.lock();
        let caps = state.device.capabilities().checksum;
        let socket = state.sockets.get_mut::<icmp::Socket>(self.handle);

        match self.remote {
            IpAddr::V4(_) => {
                let repr = Icmpv4Repr::EchoRequest {
                    ident: self.ident,
                    seq_no: seq,
                    data: payload,
                };
                let slot = socket
                    .send(repr.buffer_len(), to_ip_address(self.remote))
                    .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, format!("icmp send: {e}")))?;
                let mut packet = Icmpv4Packet::new_unchecked(slot);
                repr.emit(&mut packet, &caps);
            }
            IpAddr::V6(_) => {
                let repr = Icmpv6Repr::EchoRequest {
                    ident: self.ident,
                    seq_no: seq,
                    data: payload,
                };
                let src = to_ip_address(self.local);
                let dst = to_ip_address(self.remote);
                let slot = socket
                    .send(repr.buffer_len(), dst)
                    .map_err(|e| io::Error::new(io::ErrorKind::WouldBlock, format!("icmp send: {e}")))?;
                let mut packet = Icmpv6Packet::new_unchecked(slot);
                repr.emit(&src, &dst, &mut packet, &caps);
            }
        }
        drop(state);
        self.shared.kick();
        Ok(())
    }

    /// Receive the next echo reply as `(sequence, payload)`.
    pub async fn recv_echo(&self) -> io::Result<(u16, Vec<u8>)> {
        std::future::poll_fn(|cx| {
            let mut state = self.shared.lock();
            let socket = state.sockets.get_mut::<icmp::Socket>(self.handle);
            if !socket.can_recv() {
                socket.register_recv_waker(cx.waker());
                return Poll::Pending;
            }
            let (payload, _) = socket
                .recv()
                .map_err(|e| io::Error::new(io::ErrorKind::Other, format!("icmp recv: {e}")))?;

            let parsed = match self.remote {
                IpAddr::V4(_) => {
                    let packet = Icmpv4Packet::new_checked(payload)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    let caps = smoltcp::phy::ChecksumCapabilities::ignored();
                    match Icmpv4Repr::parse(&packet, &caps) {
                        Ok(Icmpv4Repr::EchoReply { seq_no, data, .. }) => {
                            Some((seq_no, data.to_vec()))
                        }
                        _ => None,
                    }
                }
                IpAddr::V6(_) => {
                    let packet = Icmpv6Packet::new_checked(payload)
                        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
                    let caps = smoltcp::phy::ChecksumCapabilities::ignored();
                    let src = to_ip_address(self.remote);
                    let dst = to_ip_address(self.local);
                    match Icmpv6Repr::parse(&src, &dst, &packet, &caps) {
                        Ok(Icmpv6Repr::EchoReply { seq_no, data, .. }) => {
                            Some((seq_no, data.to_vec()))
                        }
                        _ => None,
                    }
                }
            };

            match parsed {
                Some(reply) => Poll::Ready(Ok(reply)),
                None => Poll::Ready(Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "not an echo reply",
                ))),
            }
        })
        .await
    }
}

impl Drop for TnetPingSocket {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.sockets.remove(self.handle);
        drop(state);
        self.shared.kick();
    }
}

/// A TCP listener living on the virtual interface.
pub struct TnetTcpListener {
    shared: Arc<StackShared>,
    handle: SocketHandle,
    port: u16,
}

impl TnetTcpListener {
    /// Wait for the next established connection.
    pub async fn accept(&mut self) -> io::Result<TnetTcpStream> {
        let established = std::future::poll_fn(|cx| {
            let mut state = self.shared.lock();
            let socket = state.sockets.get_mut::<tcp::Socket>(self.handle);
            match socket.state() {
                tcp::State::Listen | tcp::State::SynReceived => {
                    socket.register_recv_waker(cx.waker());
                    socket.register_send_waker(cx.waker());
                    Poll::Pending
                }
                tcp::State::Closed => {
                    // Handshake aborted under us; go back to listening.
                    if let Err(e) = socket.listen(IpListenEndpoint {
                        addr: None,
                        port: self.port,
                    }) {
                        return Poll::Ready(Err(io::Error::new(
                            io::ErrorKind::AddrInUse,
                            format!("re-listen: {e}"),
                        )));
                    }
                    socket.register_recv_waker(cx.waker());
                    socket.register_send_waker(cx.waker());
                    Poll::Pending
                }
                _ => {
                    let established = self.handle;
                    match listen_socket(&mut state, self.port) {
                        Ok(next) => {
                            self.handle = next;
                            Poll::Ready(Ok(established))
                        }
                        Err(e) => Poll::Ready(Err(e)),
                    }
                }
            }
        })
        .await?;
        self.shared.kick();

        Ok(TnetTcpStream {
            shared: self.shared.clone(),
            handle: established,
        })
    }
}

impl Drop for TnetTcpListener {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        state.sockets.remove(self.handle);
        drop(state);
        self.shared.kick();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_ephemeral_port_allocation_wraps() {
        let (stack, _pipes) = create(&["10.0.0.2".parse().unwrap()], 1420);
        {
            let mut state = stack.shared.lock();
            state.next_ephemeral = u16::MAX;
            assert_eq!(state.alloc_port(), u16::MAX);
            assert_eq!(state.alloc_port(), EPHEMERAL_PORT_FIRST);
        }
    }

    #[tokio::test]
    async fn test_udp_socket_send_produces_egress_packet() {
        let (stack, mut pipes) = create(&["10.0.0.2".parse().unwrap()], 1420);
        let socket = stack.dial_udp("10.0.0.1:53".parse().unwrap()).unwrap();
        socket.send(b"hello").unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(1), pipes.egress.recv())
            .await
            .expect("timed out waiting for egress packet")
            .expect("egress channel closed");
        // IPv4 header: version nibble and UDP protocol.
        assert_eq!(packet[0] >> 4, 4);
        assert_eq!(packet[9], 17);
    }

    #[tokio::test]
    async fn test_ping_socket_emits_echo_request() {
        let (stack, mut pipes) = create(&["10.0.0.2".parse().unwrap()], 1420);
        let socket = stack.dial_ping("10.0.0.1".parse().unwrap()).unwrap();
        socket.send_echo(7, &[0xAB; 16]).unwrap();

        let packet = tokio::time::timeout(std::time::Duration::from_secs(1), pipes.egress.recv())
            .await
            .expect("timed out waiting for echo request")
            .expect("egress channel closed");
        assert_eq!(packet[0] >> 4, 4);
        assert_eq!(packet[9], 1); // ICMP
        let header_len = ((packet[0] & 0x0F) as usize) * 4;
        assert_eq!(packet[header_len], 8); // echo request
    }

    #[tokio::test]
    async fn test_dial_ping_requires_matching_family() {
        let (stack, _pipes) = create(&["10.0.0.2".parse().unwrap()], 1420);
        let err = stack.dial_ping("2001:db8::1".parse().unwrap()).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::AddrNotAvailable);
    }
}
