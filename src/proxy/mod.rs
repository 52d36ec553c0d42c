//! Long-running proxy and forwarder routines.

pub mod forward;
pub mod http;
pub mod socks5;

use std::sync::Arc;

use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;

use crate::config::RoutineConfig;
use crate::error::Result;
use crate::tunnel::VirtualTunnel;

/// Stored proxy credentials, compared in constant time.
#[derive(Clone)]
pub struct CredentialValidator {
    username: String,
    password: String,
}

impl CredentialValidator {
    #[must_use]
    pub fn new(username: String, password: String) -> Self {
        CredentialValidator { username, password }
    }

    /// Authentication is required when either credential is non-empty.
    #[must_use]
    pub fn required(&self) -> bool {
        !self.username.is_empty() || !self.password.is_empty()
    }

    /// Compare both fields in constant time.
    #[must_use]
    pub fn valid(&self, username: &str, password: &str) -> bool {
        let user_ok = self.username.as_bytes().ct_eq(username.as_bytes());
        let pass_ok = self.password.as_bytes().ct_eq(password.as_bytes());
        bool::from(user_ok & pass_ok)
    }
}

impl RoutineConfig {
    /// Run this routine until cancellation. Exactly one long-running task
    /// per routine; sub-tasks per accepted connection.
    pub async fn spawn(self, tunnel: Arc<VirtualTunnel>, token: CancellationToken) -> Result<()> {
        match self {
            RoutineConfig::Socks5 {
                bind_address,
                username,
                password,
            } => {
                socks5::serve(
                    &bind_address,
                    CredentialValidator::new(username, password),
                    tunnel,
                    token,
                )
                .await
            }
            RoutineConfig::Http {
                bind_address,
                username,
                password,
            } => {
                http::serve(
                    &bind_address,
                    CredentialValidator::new(username, password),
                    tunnel,
                    token,
                )
                .await
            }
            RoutineConfig::TcpClientTunnel {
                bind_address,
                target,
            } => forward::tcp_client_tunnel(bind_address, &target, tunnel, token).await,
            RoutineConfig::TcpServerTunnel {
                listen_port,
                target,
            } => forward::tcp_server_tunnel(listen_port, &target, tunnel, token).await,
            RoutineConfig::StdioTunnel { target } => {
                forward::stdio_tunnel(&target, tunnel, token).await
            }
        }
    }
}

/// Split a `host:port` target, supplying `default_port` when absent.
pub(crate) fn split_target(target: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = target.strip_prefix('[') {
        if let Some(end) = rest.find(']') {
            let host = rest[..end].to_string();
            let port = rest[end + 1..]
                .strip_prefix(':')
                .and_then(|p| p.parse().ok())
                .unwrap_or(default_port);
            return (host, port);
        }
    }
    match target.rfind(':') {
        // Two or more colons without brackets is a bare IPv6 literal.
        Some(i) if !target[..i].contains(':') => {
            let port = target[i + 1..].parse().unwrap_or(default_port);
            (target[..i].to_string(), port)
        }
        Some(_) => (target.to_string(), default_port),
        None => (target.to_string(), default_port),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credentials_accept_matching_pair() {
        let validator = CredentialValidator::new("peter".into(), "hunter2".into());
        assert!(validator.required());
        assert!(validator.valid("peter", "hunter2"));
    }

    #[test]
    fn test_credentials_reject_mismatch() {
        let validator = CredentialValidator::new("peter".into(), "hunter2".into());
        assert!(!validator.valid("peter", "hunter3"));
        assert!(!validator.valid("petra", "hunter2"));
        assert!(!validator.valid("", ""));
    }

    #[test]
    fn test_credentials_not_required_when_empty() {
        let validator = CredentialValidator::new(String::new(), String::new());
        assert!(!validator.required());
        assert!(validator.valid("", ""));
    }

    #[test]
    fn test_split_target() {
        assert_eq!(split_target("example.com:8443", 443), ("example.com".into(), 8443));
        assert_eq!(split_target("example.com", 443), ("example.com".into(), 443));
        assert_eq!(split_target("[2001:db8::1]:995", 443), ("2001:db8::1".into(), 995));
        assert_eq!(split_target("2001:db8::1", 443), ("2001:db8::1".into(), 443));
        assert_eq!(split_target("10.0.0.1:80", 443), ("10.0.0.1".into(), 80));
    }
}
