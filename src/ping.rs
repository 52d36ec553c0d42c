//! Liveness prober: periodic ICMP echoes over the tunnel.

use std::io;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use rand::RngCore;
use slog_scope::debug;
use tokio_util::sync::CancellationToken;

use crate::tunnel::VirtualTunnel;

const PAYLOAD_SIZE: usize = 16;

/// Dispatcher loop: every `CheckAliveInterval` seconds fan out one probe
/// sub-task per target. Stops at the next tick after cancellation.
pub async fn run(tunnel: Arc<VirtualTunnel>, token: CancellationToken) {
    if tunnel.config.check_alive.is_empty() {
        return;
    }
    let period = Duration::from_secs(tunnel.config.check_alive_interval);
    let mut ticker = tokio::time::interval(period);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("liveness prober exiting on cancellation");
                return;
            }
            _ = ticker.tick() => {
                for addr in &tunnel.config.check_alive {
                    probe(tunnel.clone(), *addr, period);
                }
            }
        }
    }
}

/// Send one echo request to `addr` and spawn a read sub-task that matches
/// the reply under a deadline of one probe period.
fn probe(tunnel: Arc<VirtualTunnel>, addr: IpAddr, deadline: Duration) {
    let socket = match tunnel.tnet.dial_ping(addr) {
        Ok(socket) => socket,
        Err(e) => {
            debug!("failed to open ping socket"; "addr" => %addr, "error" => %e);
            return;
        }
    };

    let mut payload = [0u8; PAYLOAD_SIZE];
    rand::thread_rng().fill_bytes(&mut payload);
    let seq: u16 = rand::random();

    if let Err(e) = socket.send_echo(seq, &payload) {
        debug!("failed to send ping"; "addr" => %addr, "error" => %e);
        return;
    }

    tokio::spawn(async move {
        let reply = tokio::time::timeout(deadline, async {
            loop {
                match socket.recv_echo().await {
                    Ok((reply_seq, reply_payload)) => {
                        if reply_seq == seq && reply_payload == payload {
                            return Ok(());
                        }
                        // Stale or foreign reply; keep reading until the
                        // deadline.
                    }
                    Err(e) if e.kind() == io::ErrorKind::InvalidData => {}
                    Err(e) => return Err(e),
                }
            }
        })
        .await;

        match reply {
            Ok(Ok(())) => tunnel.record_pong(&addr),
            Ok(Err(e)) => {
                debug!("failed to read ping reply"; "addr" => %addr, "error" => %e);
            }
            Err(_) => {
                debug!("ping reply timed out"; "addr" => %addr);
            }
        }
    });
}
