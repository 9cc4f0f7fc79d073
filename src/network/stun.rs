//! Minimal STUN (RFC 5389) binding client.
//!
//! The query runs on the overlay's own socket before the listener starts, so
//! the mapping the server reports is the one peers will see.

use crate::utils::{NetworkError, Result};
use rand::RngCore;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;

const STUN_MAGIC_COOKIE: u32 = 0x2112_A442;
const BINDING_REQUEST: u16 = 0x0001;
const BINDING_SUCCESS: u16 = 0x0101;
const ATTR_MAPPED_ADDRESS: u16 = 0x0001;
const ATTR_XOR_MAPPED_ADDRESS: u16 = 0x0020;
const HEADER_LEN: usize = 20;

/// STUN transaction id
pub type TransactionId = [u8; 12];

/// Build a Binding Request with no attributes
pub fn build_binding_request(txid: &TransactionId) -> [u8; HEADER_LEN] {
    let mut buf = [0u8; HEADER_LEN];
    buf[0..2].copy_from_slice(&BINDING_REQUEST.to_be_bytes());
    // length stays 0
    buf[4..8].copy_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
    buf[8..20].copy_from_slice(txid);
    buf
}

/// Extract the reflexive address from a Binding Success Response.
///
/// Prefers XOR-MAPPED-ADDRESS and falls back to MAPPED-ADDRESS. Returns
/// `None` for anything that is not a success response to `txid`.
pub fn parse_binding_response(resp: &[u8], txid: &TransactionId) -> Option<SocketAddr> {
    if resp.len() < HEADER_LEN {
        return None;
    }
    let msg_type = u16::from_be_bytes([resp[0], resp[1]]);
    let msg_len = usize::from(u16::from_be_bytes([resp[2], resp[3]]));
    let cookie = u32::from_be_bytes([resp[4], resp[5], resp[6], resp[7]]);
    if msg_type != BINDING_SUCCESS
        || cookie != STUN_MAGIC_COOKIE
        || &resp[8..20] != txid
        || resp.len() < HEADER_LEN + msg_len
    {
        return None;
    }

    let mut mapped = None;
    let mut offset = HEADER_LEN;
    while offset + 4 <= HEADER_LEN + msg_len {
        let attr_type = u16::from_be_bytes([resp[offset], resp[offset + 1]]);
        let attr_len = usize::from(u16::from_be_bytes([resp[offset + 2], resp[offset + 3]]));
        offset += 4;
        let value = resp.get(offset..offset + attr_len)?;

        match attr_type {
            ATTR_XOR_MAPPED_ADDRESS => {
                if let Some(addr) = parse_address(value, Some(txid)) {
                    return Some(addr);
                }
            }
            ATTR_MAPPED_ADDRESS => mapped = mapped.or_else(|| parse_address(value, None)),
            _ => {}
        }

        offset += attr_len + (4 - attr_len % 4) % 4;
    }
    mapped
}

fn parse_address(value: &[u8], xor_with: Option<&TransactionId>) -> Option<SocketAddr> {
    if value.len() < 4 {
        return None;
    }
    let family = value[1];
    let mut port = u16::from_be_bytes([value[2], value[3]]);
    let cookie = STUN_MAGIC_COOKIE.to_be_bytes();

    if xor_with.is_some() {
        port ^= u16::from_be_bytes([cookie[0], cookie[1]]);
    }

    let ip = match family {
        0x01 => {
            let mut octets: [u8; 4] = value.get(4..8)?.try_into().ok()?;
            if xor_with.is_some() {
                for (byte, mask) in octets.iter_mut().zip(cookie) {
                    *byte ^= mask;
                }
            }
            IpAddr::V4(Ipv4Addr::from(octets))
        }
        0x02 => {
            let mut octets: [u8; 16] = value.get(4..20)?.try_into().ok()?;
            if let Some(txid) = xor_with {
                let mask = cookie.iter().chain(txid.iter());
                for (byte, mask) in octets.iter_mut().zip(mask) {
                    *byte ^= mask;
                }
            }
            IpAddr::V6(Ipv6Addr::from(octets))
        }
        _ => return None,
    };

    Some(SocketAddr::new(ip, port))
}

/// Queries one STUN server
#[derive(Debug, Clone)]
pub struct StunClient {
    server: String,
    timeout: Duration,
}

impl StunClient {
    /// Create a client for `server` (`host:port`)
    pub fn new(server: impl Into<String>, timeout: Duration) -> Self {
        Self {
            server: server.into(),
            timeout,
        }
    }

    /// Learn the public address of `socket`.
    ///
    /// Unrelated datagrams that arrive meanwhile are discarded; nothing else
    /// should be reading the socket yet.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::Stun` if the server cannot be resolved, does not
    /// answer in time, or answers with something unusable
    pub async fn query(&self, socket: &UdpSocket) -> Result<SocketAddr> {
        let target = tokio::net::lookup_host(self.server.as_str())
            .await
            .map_err(|e| stun_error(format!("resolve {}: {e}", self.server)))?
            .find(SocketAddr::is_ipv4)
            .ok_or_else(|| stun_error(format!("no IPv4 address for {}", self.server)))?;

        let mut txid = [0u8; 12];
        rand::thread_rng().fill_bytes(&mut txid);
        socket
            .send_to(&build_binding_request(&txid), target)
            .await
            .map_err(|e| stun_error(e.to_string()))?;

        let deadline = Instant::now() + self.timeout;
        let mut buf = [0u8; 1500];
        loop {
            let received = tokio::time::timeout_at(deadline, socket.recv_from(&mut buf))
                .await
                .map_err(|_| stun_error(format!("no answer from {} in {:?}", self.server, self.timeout)))?;
            let (len, from) = received.map_err(|e| stun_error(e.to_string()))?;

            if from != target {
                log::debug!("Ignoring datagram from {} during STUN query", from);
                continue;
            }
            if let Some(mapped) = parse_binding_response(&buf[..len], &txid) {
                log::info!("STUN: public address {} (via {})", mapped, self.server);
                return Ok(mapped);
            }
        }
    }
}

fn stun_error(reason: String) -> crate::MessengerError {
    NetworkError::Stun { reason }.into()
}

#[cfg(test)]
mod tests {
    use super::*;

    const TXID: TransactionId = [1, 2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12];

    fn response(attrs: &[(u16, Vec<u8>)]) -> Vec<u8> {
        let mut body = Vec::new();
        for (kind, value) in attrs {
            body.extend_from_slice(&kind.to_be_bytes());
            body.extend_from_slice(&(value.len() as u16).to_be_bytes());
            body.extend_from_slice(value);
            body.resize(body.len() + (4 - value.len() % 4) % 4, 0);
        }
        let mut msg = Vec::new();
        msg.extend_from_slice(&BINDING_SUCCESS.to_be_bytes());
        msg.extend_from_slice(&(body.len() as u16).to_be_bytes());
        msg.extend_from_slice(&STUN_MAGIC_COOKIE.to_be_bytes());
        msg.extend_from_slice(&TXID);
        msg.extend_from_slice(&body);
        msg
    }

    fn xor_v4(addr: SocketAddr) -> Vec<u8> {
        let SocketAddr::V4(v4) = addr else { unreachable!() };
        let cookie = STUN_MAGIC_COOKIE.to_be_bytes();
        let port = v4.port() ^ u16::from_be_bytes([cookie[0], cookie[1]]);
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&port.to_be_bytes());
        value.extend(v4.ip().octets().iter().zip(cookie).map(|(b, m)| b ^ m));
        value
    }

    #[test]
    fn test_request_layout() {
        let req = build_binding_request(&TXID);
        assert_eq!(&req[0..4], &[0x00, 0x01, 0x00, 0x00]);
        assert_eq!(&req[4..8], &[0x21, 0x12, 0xA4, 0x42]);
        assert_eq!(&req[8..], &TXID);
    }

    #[test]
    fn test_parse_xor_mapped_v4() {
        let public: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let resp = response(&[(ATTR_XOR_MAPPED_ADDRESS, xor_v4(public))]);
        assert_eq!(parse_binding_response(&resp, &TXID), Some(public));
    }

    #[test]
    fn test_mapped_address_fallback() {
        let mut value = vec![0, 0x01];
        value.extend_from_slice(&3478u16.to_be_bytes());
        value.extend_from_slice(&[198, 51, 100, 1]);
        // Unknown attribute with odd length exercises padding
        let resp = response(&[(0x8022, b"abc".to_vec()), (ATTR_MAPPED_ADDRESS, value)]);

        assert_eq!(
            parse_binding_response(&resp, &TXID),
            Some("198.51.100.1:3478".parse().unwrap())
        );
    }

    #[test]
    fn test_rejects_foreign_transactions() {
        let public: SocketAddr = "203.0.113.7:54321".parse().unwrap();
        let resp = response(&[(ATTR_XOR_MAPPED_ADDRESS, xor_v4(public))]);
        let other_txid = [9u8; 12];

        assert_eq!(parse_binding_response(&resp, &other_txid), None);
        assert_eq!(parse_binding_response(&resp[..10], &TXID), None);
    }

    #[tokio::test]
    async fn test_query_against_local_responder() {
        let server = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let server_addr = server.local_addr().unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client_addr = client.local_addr().unwrap();

        tokio::spawn(async move {
            let mut buf = [0u8; 64];
            let (len, from) = server.recv_from(&mut buf).await.unwrap();
            assert_eq!(len, HEADER_LEN);
            let mut resp = response(&[(ATTR_XOR_MAPPED_ADDRESS, xor_v4(from))]);
            resp[8..20].copy_from_slice(&buf[8..20]);
            server.send_to(&resp, from).await.unwrap();
        });

        let stun = StunClient::new(server_addr.to_string(), Duration::from_secs(2));
        assert_eq!(stun.query(&client).await.unwrap(), client_addr);
    }

    #[tokio::test]
    async fn test_query_times_out() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let stun = StunClient::new(
            silent.local_addr().unwrap().to_string(),
            Duration::from_millis(100),
        );
        let err = stun.query(&client).await.unwrap_err();
        assert!(err.is_recoverable());
    }
}
