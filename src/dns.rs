//! Name resolution over the tunnel.
//!
//! Queries go as plain UDP DNS through the virtual stack to the first
//! configured server, preferring A records and falling back to AAAA.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_proto::op::{Message, MessageType, OpCode, Query};
use hickory_proto::rr::{Name, RData, RecordType};

use crate::error::{AppError, Result};
use crate::tunnel::netstack::NetStack;

const QUERY_TIMEOUT: Duration = Duration::from_secs(5);
const RESPONSE_BUFFER: usize = 512;

pub struct TunResolver {
    tnet: NetStack,
    dns: Vec<IpAddr>,
}

impl TunResolver {
    #[must_use]
    pub fn new(tnet: NetStack, dns: Vec<IpAddr>) -> Self {
        TunResolver { tnet, dns }
    }

    /// Resolve `name`, preferring IPv4 (A) and falling back to IPv6 (AAAA).
    pub async fn resolve(&self, name: &str) -> Result<IpAddr> {
        let Some(server) = self.dns.first() else {
            return Err(AppError::Resolution("no DNS servers configured".into()));
        };
        let server = SocketAddr::new(*server, 53);

        let fqdn = if name.ends_with('.') {
            name.to_string()
        } else {
            format!("{name}.")
        };

        if let Ok(ip) = self.query(server, &fqdn, RecordType::A).await {
            return Ok(ip);
        }
        if let Ok(ip) = self.query(server, &fqdn, RecordType::AAAA).await {
            return Ok(ip);
        }
        Err(AppError::Resolution(format!(
            "no A or AAAA records found for {name}"
        )))
    }

    async fn query(&self, server: SocketAddr, fqdn: &str, qtype: RecordType) -> Result<IpAddr> {
        let name = Name::from_ascii(fqdn)
            .map_err(|e| AppError::Resolution(format!("invalid name {fqdn}: {e}")))?;

        let mut message = Message::new();
        message
            .set_id(rand::random())
            .set_message_type(MessageType::Query)
            .set_op_code(OpCode::Query)
            .set_recursion_desired(true)
            .add_query(Query::query(name, qtype));
        let packet = message
            .to_vec()
            .map_err(|e| AppError::Resolution(format!("cannot encode query: {e}")))?;

        let socket = self
            .tnet
            .dial_udp(server)
            .map_err(|e| AppError::Resolution(format!("cannot open DNS socket: {e}")))?;
        socket
            .send(&packet)
            .map_err(|e| AppError::Resolution(format!("cannot send query: {e}")))?;

        let mut buf = [0u8; RESPONSE_BUFFER];
        let n = tokio::time::timeout(QUERY_TIMEOUT, socket.recv(&mut buf))
            .await
            .map_err(|_| AppError::Resolution(format!("DNS query for {fqdn} timed out")))?
            .map_err(|e| AppError::Resolution(format!("cannot read response: {e}")))?;

        let response = Message::from_vec(&buf[..n])
            .map_err(|e| AppError::Resolution(format!("cannot decode response: {e}")))?;

        for record in response.answers() {
            match record.data() {
                Some(RData::A(a)) if qtype == RecordType::A => {
                    return Ok(IpAddr::V4(a.0));
                }
                Some(RData::AAAA(aaaa)) if qtype == RecordType::AAAA => {
                    return Ok(IpAddr::V6(aaaa.0));
                }
                _ => {}
            }
        }
        Err(AppError::Resolution("no matching DNS records found".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tunnel::netstack;

    #[tokio::test]
    async fn test_resolve_without_dns_servers() {
        let (tnet, _pipes) = netstack::create(&["10.0.0.2".parse().unwrap()], 1420);
        let resolver = TunResolver::new(tnet, Vec::new());
        let err = resolver.resolve("example.com").await.unwrap_err();
        assert!(err.to_string().contains("no DNS servers configured"));
    }

    #[tokio::test]
    async fn test_query_emitted_is_wellformed_dns() {
        let (tnet, mut pipes) = netstack::create(&["10.0.0.2".parse().unwrap()], 1420);
        let resolver = TunResolver::new(tnet, vec!["10.0.0.1".parse().unwrap()]);

        // Fire the resolution; it will time out, but the A query must hit
        // the egress queue as a valid DNS message to port 53.
        let handle = tokio::spawn(async move {
            let _ = resolver.resolve("example.com").await;
        });

        let packet = tokio::time::timeout(Duration::from_secs(1), pipes.egress.recv())
            .await
            .expect("no egress packet")
            .expect("egress closed");
        assert_eq!(packet[9], 17); // UDP
        let ihl = ((packet[0] & 0x0F) as usize) * 4;
        let dst_port = u16::from_be_bytes([packet[ihl + 2], packet[ihl + 3]]);
        assert_eq!(dst_port, 53);

        let dns_payload = &packet[ihl + 8..];
        let message = Message::from_vec(dns_payload).expect("valid DNS message");
        assert_eq!(message.queries().len(), 1);
        assert_eq!(message.queries()[0].query_type(), RecordType::A);
        assert_eq!(message.queries()[0].name().to_string(), "example.com.");
        assert!(message.recursion_desired());

        handle.abort();
    }
}
