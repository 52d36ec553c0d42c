//! Static TCP and STDIO forwarders.
//!
//! A client tunnel accepts on the host network and dials the target through
//! the tunnel; a server tunnel accepts on the virtual interface and dials
//! the target on the host network; the stdio tunnel bridges the process
//! stdio to a single tunnel connection.

use std::net::SocketAddr;
use std::sync::Arc;

use slog_scope::{debug, error};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::proxy::split_target;
use crate::tunnel::VirtualTunnel;

pub async fn tcp_client_tunnel(
    bind_address: SocketAddr,
    target: &str,
    tunnel: Arc<VirtualTunnel>,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Bind {
            addr: bind_address.to_string(),
            source: e,
        })?;
    debug!("TCP client tunnel bound"; "addr" => %bind_address, "target" => target);
    let (host, port) = split_target(target, 0);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("TCP client tunnel exiting on cancellation"; "addr" => %bind_address);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (mut stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        error!("TCP client tunnel accept error"; "error" => %e);
                        continue;
                    }
                };
                debug!("TCP client tunnel connection"; "peer" => %peer_addr);
                let tunnel = tunnel.clone();
                let host = host.clone();
                tokio::spawn(async move {
                    match tunnel.dial_host(&host, port).await {
                        Ok(mut peer) => {
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut stream, &mut peer).await
                            {
                                debug!("TCP client tunnel relay closed"; "error" => %e);
                            }
                        }
                        Err(e) => {
                            debug!("TCP client tunnel dial failed"; "host" => &host, "error" => %e);
                        }
                    }
                });
            }
        }
    }
}

pub async fn tcp_server_tunnel(
    listen_port: u16,
    target: &str,
    tunnel: Arc<VirtualTunnel>,
    token: CancellationToken,
) -> Result<()> {
    let mut listener = tunnel.tnet.listen_tcp(listen_port).map_err(|e| AppError::Bind {
        addr: format!("tunnel port {listen_port}"),
        source: e,
    })?;
    debug!("TCP server tunnel listening"; "port" => listen_port, "target" => target);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("TCP server tunnel exiting on cancellation"; "port" => listen_port);
                return Ok(());
            }
            accepted = listener.accept() => {
                let mut stream = match accepted {
                    Ok(stream) => stream,
                    Err(e) => {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        error!("TCP server tunnel accept error"; "error" => %e);
                        continue;
                    }
                };
                debug!("TCP server tunnel connection"; "port" => listen_port);
                let target = target.to_string();
                tokio::spawn(async move {
                    match TcpStream::connect(&target).await {
                        Ok(mut peer) => {
                            if let Err(e) =
                                tokio::io::copy_bidirectional(&mut stream, &mut peer).await
                            {
                                debug!("TCP server tunnel relay closed"; "error" => %e);
                            }
                        }
                        Err(e) => {
                            debug!("TCP server tunnel dial failed"; "target" => &target, "error" => %e);
                        }
                    }
                });
            }
        }
    }
}

pub async fn stdio_tunnel(
    target: &str,
    tunnel: Arc<VirtualTunnel>,
    token: CancellationToken,
) -> Result<()> {
    let (host, port) = split_target(target, 0);
    let peer = tunnel
        .dial_host(&host, port)
        .await
        .map_err(|e| AppError::tunnel(format!("stdio tunnel dial {target}: {e}")))?;
    debug!("STDIO tunnel connected"; "target" => target);

    let (mut peer_read, mut peer_write) = tokio::io::split(peer);
    let mut stdin = tokio::io::stdin();
    let mut stdout = tokio::io::stdout();

    let upstream = async move { tokio::io::copy(&mut stdin, &mut peer_write).await };
    let downstream = async move { tokio::io::copy(&mut peer_read, &mut stdout).await };

    tokio::select! {
        _ = token.cancelled() => {}
        result = upstream => {
            if let Err(e) = result {
                debug!("STDIO tunnel upstream closed"; "error" => %e);
            }
        }
        result = downstream => {
            if let Err(e) = result {
                debug!("STDIO tunnel downstream closed"; "error" => %e);
            }
        }
    }
    Ok(())
}
