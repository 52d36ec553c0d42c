//! Health endpoint: peer liveness and redacted device statistics.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use slog_scope::{debug, error};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::tunnel::VirtualTunnel;

/// Extra slack on top of the probe interval before a target counts as stale.
const STALENESS_GRACE_SECS: u64 = 2;

pub async fn serve(
    bind_address: &str,
    tunnel: Arc<VirtualTunnel>,
    token: CancellationToken,
) -> Result<()> {
    let listener = TcpListener::bind(bind_address)
        .await
        .map_err(|e| AppError::Bind {
            addr: bind_address.to_string(),
            source: e,
        })?;
    debug!("health endpoint bound"; "addr" => bind_address);
    serve_on(listener, tunnel, token).await
}

async fn serve_on(
    listener: TcpListener,
    tunnel: Arc<VirtualTunnel>,
    token: CancellationToken,
) -> Result<()> {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("health endpoint exiting on cancellation");
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, _) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        error!("health endpoint accept error"; "error" => %e);
                        continue;
                    }
                };
                let tunnel = tunnel.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, tunnel).await {
                        debug!("health connection closed"; "error" => %e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(mut stream: TcpStream, tunnel: Arc<VirtualTunnel>) -> std::io::Result<()> {
    let mut reader = BufReader::new(&mut stream);
    let mut request_line = String::new();
    reader.read_line(&mut request_line).await?;

    let path = request_line
        .split_whitespace()
        .nth(1)
        .unwrap_or("/")
        .split('?')
        .next()
        .unwrap_or("/");
    let path = if path.len() > 1 {
        path.trim_end_matches('/')
    } else {
        path
    };
    debug!("health request"; "path" => path);

    // Drain headers.
    loop {
        let mut line = String::new();
        reader.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
    }

    match path {
        "/readyz" => {
            let snapshot = tunnel.ping_snapshot();
            let body = match serde_json::to_string(&snapshot) {
                Ok(body) => body,
                Err(e) => {
                    error!("failed to encode ping record"; "error" => %e);
                    return respond(&mut stream, 500, "Internal Server Error", "text/plain", "")
                        .await;
                }
            };
            let now = SystemTime::now()
                .duration_since(UNIX_EPOCH)
                .map(|d| d.as_secs())
                .unwrap_or(0);
            let (code, reason) =
                if all_alive(&snapshot, tunnel.config.check_alive_interval, now) {
                    (200, "OK")
                } else {
                    (503, "Service Unavailable")
                };
            respond(&mut stream, code, reason, "application/json", &format!("{body}\n")).await
        }
        "/metrics" => {
            let dump = tunnel.device.ipc_get();
            respond(&mut stream, 200, "OK", "text/plain", &redact(&dump)).await
        }
        _ => respond(&mut stream, 404, "Not Found", "text/plain", "").await,
    }
}

/// Whether every probed target replied within one interval (plus grace).
fn all_alive(snapshot: &HashMap<String, u64>, interval: u64, now: u64) -> bool {
    snapshot
        .values()
        .all(|&last_pong| now.saturating_sub(last_pong) <= interval + STALENESS_GRACE_SECS)
}

/// Replace secret values in a UAPI get dump with `REDACTED`.
fn redact(dump: &str) -> String {
    let mut out = String::with_capacity(dump.len());
    for line in dump.lines() {
        match line.split_once('=') {
            Some((key @ ("private_key" | "preshared_key"), _)) => {
                out.push_str(key);
                out.push_str("=REDACTED\n");
            }
            _ => {
                out.push_str(line);
                out.push('\n');
            }
        }
    }
    out
}

async fn respond(
    stream: &mut TcpStream,
    code: u16,
    reason: &str,
    content_type: &str,
    body: &str,
) -> std::io::Result<()> {
    let response = format!(
        "HTTP/1.1 {code} {reason}\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        body.len()
    );
    stream.write_all(response.as_bytes()).await?;
    stream.shutdown().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::parse_config_str;
    use crate::tunnel::start_tunnel;
    use tokio::io::AsyncReadExt;

    #[test]
    fn test_redact_removes_secret_values() {
        let dump = "private_key=2c0af568d48d17d774323c1480054ae34db44f437f139354b6a56fe449ec4b3d\n\
                    listen_port=51820\n\
                    public_key=aabb\n\
                    preshared_key=ccdd\n\
                    errno=0\n";
        let redacted = redact(dump);
        assert!(redacted.contains("private_key=REDACTED\n"));
        assert!(redacted.contains("preshared_key=REDACTED\n"));
        assert!(redacted.contains("public_key=aabb\n"));
        assert!(!redacted.contains("2c0af568"));
        assert!(!redacted.contains("ccdd"));
    }

    #[test]
    fn test_all_alive_staleness_math() {
        let mut snapshot = HashMap::new();
        snapshot.insert("1.1.1.1".to_string(), 100u64);

        assert!(all_alive(&snapshot, 5, 100 + 5 + STALENESS_GRACE_SECS));
        assert!(!all_alive(&snapshot, 5, 100 + 5 + STALENESS_GRACE_SECS + 1));
        // Never-seen targets (0) are stale.
        snapshot.insert("8.8.8.8".to_string(), 0);
        assert!(!all_alive(&snapshot, 5, 100));
        // No targets at all is healthy.
        assert!(all_alive(&HashMap::new(), 5, 100));
    }

    async fn tunnel_with_check_alive() -> Arc<VirtualTunnel> {
        let conf = parse_config_str(
            "
[Interface]
PrivateKey = LAr1aNSNF9d0MjwUgAVC4020T0N/E5NUtqVv5EnsSz0=
Address = 10.64.0.2
CheckAlive = 1.1.1.1

[Peer]
PublicKey = e8LKAc+f9xEzq9Ar7+MfKRrs+gZ/4yzvpRJLRJ/VJ1w=
AllowedIPs = 0.0.0.0/0",
        )
        .unwrap();
        let logger = slog::Logger::root(slog::Discard, slog::o!());
        start_tunnel(conf.device, logger).await.unwrap()
    }

    async fn get(addr: std::net::SocketAddr, path: &str) -> (u16, String) {
        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(format!("GET {path} HTTP/1.1\r\nHost: health\r\n\r\n").as_bytes())
            .await
            .unwrap();
        let mut response = String::new();
        client.read_to_string(&mut response).await.unwrap();
        let code = response
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse().ok())
            .unwrap_or(0);
        let body = response
            .split_once("\r\n\r\n")
            .map(|(_, b)| b.to_string())
            .unwrap_or_default();
        (code, body)
    }

    #[tokio::test]
    async fn test_endpoint_paths() {
        let tunnel = tunnel_with_check_alive().await;
        let token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(serve_on(listener, tunnel.clone(), token.clone()));

        // Never-probed target: stale.
        let (code, body) = get(addr, "/readyz").await;
        assert_eq!(code, 503);
        assert!(body.contains("\"1.1.1.1\":0"));

        // After a recorded pong the endpoint reports healthy.
        tunnel.record_pong(&"1.1.1.1".parse().unwrap());
        let (code, body) = get(addr, "/readyz").await;
        assert_eq!(code, 200);
        assert!(!body.contains("\"1.1.1.1\":0"));

        let (code, body) = get(addr, "/metrics").await;
        assert_eq!(code, 200);
        assert!(body.contains("private_key=REDACTED"));
        assert!(body.contains("preshared_key=REDACTED"));
        assert!(body.contains("public_key="));

        let (code, _) = get(addr, "/nope").await;
        assert_eq!(code, 404);

        token.cancel();
    }
}
