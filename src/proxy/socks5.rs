//! SOCKS5 proxy over the tunnel, with optional RFC 1929 username/password
//! authentication.

use std::net::{Ipv4Addr, Ipv6Addr};
use std::sync::Arc;

use slog_scope::{debug, error};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::proxy::CredentialValidator;
use crate::tunnel::VirtualTunnel;

const SOCKS_VERSION: u8 = 0x05;
const SUBNEGOTIATION_VERSION: u8 = 0x01;

const AUTH_NONE: u8 = 0x00;
const AUTH_USERPASS: u8 = 0x02;
const AUTH_NO_ACCEPTABLE: u8 = 0xFF;

const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

const REP_SUCCESS: u8 = 0x00;
const REP_GENERAL_FAILURE: u8 = 0x01;
const REP_CMD_NOT_SUPPORTED: u8 = 0x07;
const REP_ATYP_NOT_SUPPORTED: u8 = 0x08;

/// Fixed relay buffer size per direction.
const RELAY_BUFFER: usize = 256 * 1024;

pub async fn serve(
    bind_address: &str,
    auth: CredentialValidator,
    tunnel: Arc<VirtualTunnel>,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Bind {
            addr: bind_address.to_string(),
            source: e,
        })?;
    debug!("SOCKS5 listener bound"; "addr" => bind_address);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("SOCKS5 accept loop exiting on cancellation"; "addr" => bind_address);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        error!("SOCKS5 accept error"; "error" => %e);
                        continue;
                    }
                };
                debug!("SOCKS5 connection accepted"; "peer" => %peer_addr);
                let tunnel = tunnel.clone();
                let auth = auth.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, auth, tunnel).await {
                        debug!("SOCKS5 connection closed"; "error" => %e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    mut client: TcpStream,
    auth: CredentialValidator,
    tunnel: Arc<VirtualTunnel>,
) -> std::io::Result<()> {
    // Greeting: version + offered methods.
    let version = client.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unsupported SOCKS version: {version}"),
        ));
    }
    let nmethods = client.read_u8().await? as usize;
    let mut methods = vec![0u8; nmethods];
    client.read_exact(&mut methods).await?;

    if auth.required() {
        if !methods.contains(&AUTH_USERPASS) {
            client.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
            return Ok(());
        }
        client.write_all(&[SOCKS_VERSION, AUTH_USERPASS]).await?;
        if !subnegotiate(&mut client, &auth).await? {
            return Ok(());
        }
    } else {
        if !methods.contains(&AUTH_NONE) {
            client.write_all(&[SOCKS_VERSION, AUTH_NO_ACCEPTABLE]).await?;
            return Ok(());
        }
        client.write_all(&[SOCKS_VERSION, AUTH_NONE]).await?;
    }

    // Request: VER CMD RSV ATYP DST.ADDR DST.PORT
    let version = client.read_u8().await?;
    if version != SOCKS_VERSION {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("unexpected version in request: {version}"),
        ));
    }
    let cmd = client.read_u8().await?;
    let _reserved = client.read_u8().await?;
    let atyp = client.read_u8().await?;

    if cmd != CMD_CONNECT {
        send_reply(&mut client, REP_CMD_NOT_SUPPORTED).await?;
        return Ok(());
    }

    let host = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            client.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let len = client.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            client.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| {
                std::io::Error::new(std::io::ErrorKind::InvalidData, "non-UTF8 domain")
            })?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            client.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        _ => {
            send_reply(&mut client, REP_ATYP_NOT_SUPPORTED).await?;
            return Ok(());
        }
    };
    let port = client.read_u16().await?;
    debug!("SOCKS5 CONNECT"; "host" => &host, "port" => port);

    match tunnel.dial_host(&host, port).await {
        Ok(mut peer) => {
            send_reply(&mut client, REP_SUCCESS).await?;
            let relay = tokio::io::copy_bidirectional_with_sizes(
                &mut client,
                &mut peer,
                RELAY_BUFFER,
                RELAY_BUFFER,
            )
            .await;
            if let Err(e) = relay {
                debug!("SOCKS5 relay closed"; "error" => %e);
            }
        }
        Err(e) => {
            debug!("SOCKS5 dial failed"; "host" => &host, "port" => port, "error" => %e);
            send_reply(&mut client, REP_GENERAL_FAILURE).await?;
        }
    }

    Ok(())
}

/// RFC 1929 username/password subnegotiation. Returns whether the client
/// may proceed.
async fn subnegotiate(client: &mut TcpStream, auth: &CredentialValidator) -> std::io::Result<bool> {
    let version = client.read_u8().await?;
    if version != SUBNEGOTIATION_VERSION {
        client.write_all(&[SUBNEGOTIATION_VERSION, 0x01]).await?;
        return Ok(false);
    }

    let ulen = client.read_u8().await? as usize;
    let mut username = vec![0u8; ulen];
    client.read_exact(&mut username).await?;
    let plen = client.read_u8().await? as usize;
    let mut password = vec![0u8; plen];
    client.read_exact(&mut password).await?;

    let username = String::from_utf8_lossy(&username);
    let password = String::from_utf8_lossy(&password);
    if auth.valid(&username, &password) {
        client.write_all(&[SUBNEGOTIATION_VERSION, 0x00]).await?;
        Ok(true)
    } else {
        debug!("SOCKS5 authentication rejected"; "username" => username.as_ref());
        client.write_all(&[SUBNEGOTIATION_VERSION, 0x01]).await?;
        Ok(false)
    }
}

async fn send_reply(client: &mut TcpStream, reply: u8) -> std::io::Result<()> {
    // VER REP RSV ATYP BND.ADDR BND.PORT
    let response = [
        SOCKS_VERSION,
        reply,
        0x00,
        ATYP_IPV4,
        0, 0, 0, 0, // BND.ADDR
        0, 0, // BND.PORT
    ];
    client.write_all(&response).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::tunnel::start_tunnel;

    async fn idle_tunnel() -> Arc<VirtualTunnel> {
        let config = DeviceConfig {
            secret_key: "2c0af568d48d17d774323c1480054ae34db44f437f139354b6a56fe449ec4b3d"
                .to_string(),
            endpoint: vec!["10.64.0.2".parse().unwrap()],
            ..DeviceConfig::default()
        };
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        start_tunnel(config, logger).await.unwrap()
    }

    async fn spawn_server(auth: CredentialValidator) -> (std::net::SocketAddr, CancellationToken) {
        let tunnel = idle_tunnel().await;
        let token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let serve_token = token.clone();
        tokio::spawn(async move { serve(&addr.to_string(), auth, tunnel, serve_token).await });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        (addr, token)
    }

    #[tokio::test]
    async fn test_auth_required_rejects_noauth_only_client() {
        let (addr, token) =
            spawn_server(CredentialValidator::new("peter".into(), "hunter2".into())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, AUTH_NONE]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, AUTH_NO_ACCEPTABLE]);

        token.cancel();
    }

    #[tokio::test]
    async fn test_subnegotiation_rejects_wrong_password() {
        let (addr, token) =
            spawn_server(CredentialValidator::new("peter".into(), "hunter2".into())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(&[0x05, 0x01, AUTH_USERPASS])
            .await
            .unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, AUTH_USERPASS]);

        // VER ULEN "peter" PLEN "wrong"
        let mut negotiation = vec![0x01, 5];
        negotiation.extend_from_slice(b"peter");
        negotiation.push(5);
        negotiation.extend_from_slice(b"wrong");
        client.write_all(&negotiation).await.unwrap();
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x01, 0x01]);

        token.cancel();
    }

    #[tokio::test]
    async fn test_noauth_flow_rejects_unsupported_command() {
        let (addr, token) = spawn_server(CredentialValidator::new("".into(), "".into())).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&[0x05, 0x01, AUTH_NONE]).await.unwrap();
        let mut reply = [0u8; 2];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x05, AUTH_NONE]);

        // BIND request (0x02) to 1.2.3.4:80
        client
            .write_all(&[0x05, 0x02, 0x00, ATYP_IPV4, 1, 2, 3, 4, 0, 80])
            .await
            .unwrap();
        let mut response = [0u8; 10];
        client.read_exact(&mut response).await.unwrap();
        assert_eq!(response[1], REP_CMD_NOT_SUPPORTED);

        token.cancel();
    }
}
