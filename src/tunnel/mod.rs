//! Userspace tunnel assembly: virtual stack + WireGuard device.

pub mod device;
pub mod netstack;

use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};

use crate::config::DeviceConfig;
use crate::dns::TunResolver;
use crate::error::Result;
use crate::uapi;

use device::WgDevice;
use netstack::{NetStack, TnetTcpStream};

/// The running tunnel: the dialer handle, the device, and the liveness
/// bookkeeping shared between the prober and the health endpoint.
pub struct VirtualTunnel {
    pub tnet: NetStack,
    pub device: WgDevice,
    pub logger: slog::Logger,
    pub config: DeviceConfig,
    ping_record: Mutex<HashMap<String, u64>>,
}

/// Stand up the tunnel: serialize the device request, create the virtual
/// stack, apply the request and bring the device up. Any failure aborts
/// startup.
pub async fn start_tunnel(config: DeviceConfig, logger: slog::Logger) -> Result<Arc<VirtualTunnel>> {
    let request = uapi::device_request(&config, false);

    let (tnet, pipes) = netstack::create(&config.endpoint, config.mtu);
    let device = WgDevice::new(pipes.ingress, pipes.egress, logger.clone());
    device.ipc_set(&request)?;
    device.up().await?;

    // Every probe target starts at 0 (never seen).
    let ping_record = config
        .check_alive
        .iter()
        .map(|addr| (addr.to_string(), 0))
        .collect();

    Ok(Arc::new(VirtualTunnel {
        tnet,
        device,
        logger,
        config,
        ping_record: Mutex::new(ping_record),
    }))
}

impl VirtualTunnel {
    #[must_use]
    pub fn resolver(&self) -> TunResolver {
        TunResolver::new(self.tnet.clone(), self.config.dns.clone())
    }

    /// Dial `host:port` through the tunnel. Names resolve via the virtual
    /// resolver; IPv6 literals opportunistically prefer an IPv4 resolution
    /// when one exists.
    pub async fn dial_host(&self, host: &str, port: u16) -> io::Result<TnetTcpStream> {
        let ip = match host.parse::<IpAddr>() {
            Ok(ip @ IpAddr::V6(_)) => match self.resolver().resolve(host).await {
                Ok(v4 @ IpAddr::V4(_)) => v4,
                _ => ip,
            },
            Ok(ip) => ip,
            Err(_) => self
                .resolver()
                .resolve(host)
                .await
                .map_err(|e| io::Error::new(io::ErrorKind::NotFound, e.to_string()))?,
        };
        self.tnet.dial_tcp(SocketAddr::new(ip, port)).await
    }

    /// Record a successful echo reply from `addr`.
    pub fn record_pong(&self, addr: &IpAddr) {
        let now = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.ping_record
            .lock()
            .expect("ping record lock")
            .insert(addr.to_string(), now);
    }

    /// Snapshot of the last-pong table for the health endpoint.
    #[must_use]
    pub fn ping_snapshot(&self) -> HashMap<String, u64> {
        self.ping_record.lock().expect("ping record lock").clone()
    }
}
