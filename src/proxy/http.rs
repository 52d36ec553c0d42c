//! HTTP proxy over the tunnel: CONNECT tunneling plus plain-request relay,
//! with optional Basic proxy authentication.

use std::sync::Arc;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use slog_scope::{debug, error};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{AppError, Result};
use crate::proxy::{split_target, CredentialValidator};
use crate::tunnel::VirtualTunnel;

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
    debug!("HTTP listener bound"; "addr" => bind_address);

    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!("HTTP accept loop exiting on cancellation"; "addr" => bind_address);
                return Ok(());
            }
            accepted = listener.accept() => {
                let (stream, peer_addr) = match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        // Raced with shutdown-time listener teardown.
                        if token.is_cancelled() {
                            return Ok(());
                        }
                        error!("HTTP accept error"; "error" => %e);
                        continue;
                    }
                };
                debug!("HTTP connection accepted"; "peer" => %peer_addr);
                let tunnel = tunnel.clone();
                let auth = auth.clone();
                tokio::spawn(async move {
                    if let Err(e) = handle_connection(stream, auth, tunnel).await {
                        debug!("HTTP connection closed"; "error" => %e);
                    }
                });
            }
        }
    }
}

async fn handle_connection(
    stream: TcpStream,
    auth: CredentialValidator,
    tunnel: Arc<VirtualTunnel>,
) -> std::io::Result<()> {
    let mut client = BufReader::new(stream);

    let mut request_line = String::new();
    client.read_line(&mut request_line).await?;
    let request_line = request_line.trim_end().to_string();
    if request_line.is_empty() {
        return Ok(());
    }

    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        respond(&mut client, 400, "Bad Request", &[]).await?;
        return Ok(());
    };
    let method = method.to_string();
    let target = target.to_string();
    let version = version.to_string();

    let mut headers = Vec::new();
    loop {
        let mut line = String::new();
        client.read_line(&mut line).await?;
        if line.trim().is_empty() {
            break;
        }
        headers.push(line);
    }

    if let Err((code, reason, challenge)) = authenticate(&auth, &headers) {
        let extra: &[(&str, &str)] = if challenge {
            &[("Proxy-Authenticate", "Basic realm=\"Proxy\"")]
        } else {
            &[]
        };
        respond(&mut client, code, reason, extra).await?;
        debug!("HTTP authentication failed"; "status" => code);
        return Ok(());
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        handle_connect(client, &target, &tunnel).await
    } else if method.eq_ignore_ascii_case("GET") {
        handle_plain(client, &method, &target, &version, &headers, &tunnel).await
    } else {
        respond(&mut client, 405, "Method Not Allowed", &[]).await?;
        debug!("HTTP unsupported method"; "method" => method);
        Ok(())
    }
}

/// CONNECT tunneling: dial through the tunnel, acknowledge, then relay.
async fn handle_connect(
    mut client: BufReader<TcpStream>,
    target: &str,
    tunnel: &VirtualTunnel,
) -> std::io::Result<()> {
    let (host, port) = split_target(target, 443);
    debug!("HTTP CONNECT"; "target" => target);

    let mut peer = match tunnel.dial_host(&host, port).await {
        Ok(peer) => peer,
        Err(e) => {
            debug!("HTTP CONNECT dial failed"; "target" => target, "error" => %e);
            respond(&mut client, 502, "Bad Gateway", &[]).await?;
            return Ok(());
        }
    };

    client
        .get_mut()
        .write_all(b"HTTP/1.1 200 Connection established\r\n\r\n")
        .await?;

    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut peer).await {
        debug!("HTTP CONNECT relay closed"; "error" => %e);
    }
    Ok(())
}

/// Plain request relay: rewrite the absolute URI to origin form, forward the
/// request over the tunnel, then relay until both sides close.
async fn handle_plain(
    mut client: BufReader<TcpStream>,
    method: &str,
    target: &str,
    version: &str,
    headers: &[String],
    tunnel: &VirtualTunnel,
) -> std::io::Result<()> {
    let (authority, path) = parse_absolute_uri(target, headers);
    let Some(authority) = authority else {
        respond(&mut client, 400, "Bad Request", &[]).await?;
        return Ok(());
    };
    let (host, port) = split_target(&authority, 80);
    debug!("HTTP request"; "method" => method, "host" => &authority);

    let mut peer = match tunnel.dial_host(&host, port).await {
        Ok(peer) => peer,
        Err(e) => {
            debug!("HTTP dial failed"; "host" => &authority, "error" => %e);
            respond(&mut client, 502, "Bad Gateway", &[]).await?;
            return Ok(());
        }
    };

    peer.write_all(format!("{method} {path} {version}\r\n").as_bytes())
        .await?;
    let mut has_host = false;
    for header in headers {
        let lower = header.to_ascii_lowercase();
        if lower.starts_with("proxy-connection:") || lower.starts_with("proxy-authorization:") {
            continue;
        }
        if lower.starts_with("host:") {
            has_host = true;
        }
        peer.write_all(header.as_bytes()).await?;
    }
    if !has_host {
        peer.write_all(format!("Host: {authority}\r\n").as_bytes())
            .await?;
    }
    peer.write_all(b"\r\n").await?;

    // Any request body still sits in the client buffer; the relay carries it.
    if let Err(e) = tokio::io::copy_bidirectional(&mut client, &mut peer).await {
        debug!("HTTP relay closed"; "error" => %e);
    }
    Ok(())
}

/// Check `Proxy-Authorization` against the stored credentials.
///
/// Error carries (status, reason, send-challenge-header).
fn authenticate(
    auth: &CredentialValidator,
    headers: &[String],
) -> std::result::Result<(), (u16, &'static str, bool)> {
    if !auth.required() {
        return Ok(());
    }

    let value = headers.iter().find_map(|h| {
        let (name, value) = h.split_once(':')?;
        name.eq_ignore_ascii_case("proxy-authorization")
            .then(|| value.trim())
    });
    let Some(value) = value else {
        return Err((407, "Proxy Authentication Required", true));
    };

    let encoded = value.strip_prefix("Basic ").unwrap_or(value);
    let Ok(decoded) = BASE64.decode(encoded) else {
        return Err((406, "Not Acceptable", false));
    };
    let decoded = String::from_utf8_lossy(&decoded).into_owned();
    let Some((username, password)) = decoded.split_once(':') else {
        return Err((411, "Length Required", false));
    };
    if auth.valid(username, password) {
        Ok(())
    } else {
        Err((401, "Unauthorized", false))
    }
}

fn parse_absolute_uri(target: &str, headers: &[String]) -> (Option<String>, String) {
    let without_scheme = target
        .strip_prefix("http://")
        .or_else(|| target.strip_prefix("https://"));

    if let Some(rest) = without_scheme {
        return match rest.find('/') {
            Some(pos) => (Some(rest[..pos].to_string()), rest[pos..].to_string()),
            None => (Some(rest.to_string()), "/".to_string()),
        };
    }

    // Origin-form request line: the authority comes from the Host header.
    let host = headers.iter().find_map(|h| {
        let (name, value) = h.split_once(':')?;
        name.eq_ignore_ascii_case("host")
            .then(|| value.trim().to_string())
    });
    (host, target.to_string())
}

async fn respond(
    client: &mut BufReader<TcpStream>,
    code: u16,
    reason: &str,
    extra_headers: &[(&str, &str)],
) -> std::io::Result<()> {
    let mut response = format!("HTTP/1.1 {code} {reason}\r\n");
    for (name, value) in extra_headers {
        response.push_str(&format!("{name}: {value}\r\n"));
    }
    response.push_str("Content-Length: 0\r\n\r\n");
    client.get_mut().write_all(response.as_bytes()).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DeviceConfig;
    use crate::tunnel::start_tunnel;
    use tokio::io::AsyncReadExt;

    fn validator(user: &str, pass: &str) -> CredentialValidator {
        CredentialValidator::new(user.to_string(), pass.to_string())
    }

    fn basic_header(user: &str, pass: &str) -> String {
        format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode(format!("{user}:{pass}"))
        )
    }

    #[test]
    fn test_authenticate_disabled_without_credentials() {
        assert!(authenticate(&validator("", ""), &[]).is_ok());
    }

    #[test]
    fn test_authenticate_missing_header_is_407() {
        let err = authenticate(&validator("peter", "hunter2"), &[]).unwrap_err();
        assert_eq!(err.0, 407);
        assert!(err.2);
    }

    #[test]
    fn test_authenticate_bad_base64_is_406() {
        let headers = vec!["Proxy-Authorization: Basic !!!not-base64\r\n".to_string()];
        let err = authenticate(&validator("peter", "hunter2"), &headers).unwrap_err();
        assert_eq!(err.0, 406);
    }

    #[test]
    fn test_authenticate_malformed_pair_is_411() {
        let headers = vec![format!(
            "Proxy-Authorization: Basic {}\r\n",
            BASE64.encode("no-colon-here")
        )];
        let err = authenticate(&validator("peter", "hunter2"), &headers).unwrap_err();
        assert_eq!(err.0, 411);
    }

    #[test]
    fn test_authenticate_wrong_credentials_is_401() {
        let headers = vec![basic_header("peter", "wrong")];
        let err = authenticate(&validator("peter", "hunter2"), &headers).unwrap_err();
        assert_eq!(err.0, 401);
    }

    #[test]
    fn test_authenticate_accepts_valid_credentials() {
        let headers = vec![basic_header("peter", "hunter2")];
        assert!(authenticate(&validator("peter", "hunter2"), &headers).is_ok());
    }

    #[test]
    fn test_parse_absolute_uri_forms() {
        let (host, path) = parse_absolute_uri("http://example.com/foo/bar", &[]);
        assert_eq!(host.as_deref(), Some("example.com"));
        assert_eq!(path, "/foo/bar");

        let (host, path) = parse_absolute_uri("http://example.com:8080", &[]);
        assert_eq!(host.as_deref(), Some("example.com:8080"));
        assert_eq!(path, "/");

        let headers = vec!["Host: fallback.example\r\n".to_string()];
        let (host, path) = parse_absolute_uri("/index.html", &headers);
        assert_eq!(host.as_deref(), Some("fallback.example"));
        assert_eq!(path, "/index.html");
    }

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

    #[tokio::test]
    async fn test_proxy_requires_auth_end_to_end() {
        let tunnel = idle_tunnel().await;
        let token = CancellationToken::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let serve_token = token.clone();
        let handle = tokio::spawn(async move {
            serve(
                &addr.to_string(),
                CredentialValidator::new("peter".into(), "hunter2".into()),
                tunnel,
                serve_token,
            )
            .await
        });
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;

        let mut client = TcpStream::connect(addr).await.unwrap();
        client
            .write_all(b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n")
            .await
            .unwrap();
        let mut buf = vec![0u8; 256];
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 407"), "got: {response}");
        assert!(response.contains("Proxy-Authenticate: Basic realm=\"Proxy\""));

        // Unsupported method gets 405 even with valid credentials.
        let mut client = TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "DELETE http://example.com/ HTTP/1.1\r\n{}\r\n",
            basic_header("peter", "hunter2")
        );
        client.write_all(request.as_bytes()).await.unwrap();
        let n = client.read(&mut buf).await.unwrap();
        let response = String::from_utf8_lossy(&buf[..n]).into_owned();
        assert!(response.starts_with("HTTP/1.1 405"), "got: {response}");

        token.cancel();
        let result = tokio::time::timeout(std::time::Duration::from_secs(2), handle)
            .await
            .expect("accept loop did not exit on cancellation")
            .unwrap();
        assert!(result.is_ok());
    }
}
