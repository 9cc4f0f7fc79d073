//! The single UDP socket shared by every part of the overlay.
//!
//! Discovery beacons, handshakes, hole punch SYNs, STUN and application
//! commands all go through one [`Transport`]. Stopping it wakes every task
//! blocked in [`Transport::recv`].

use crate::transport::protocol::{decode_datagram, encode_datagram, Frame};
use crate::utils::{NetworkError, Result};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::net::UdpSocket;
use tokio::sync::watch;

/// UDP transport
pub struct Transport {
    socket: UdpSocket,
    local_addr: SocketAddr,
    stop_tx: watch::Sender<bool>,
    datagrams_sent: AtomicU64,
    datagrams_received: AtomicU64,
}

/// Transport counters
#[derive(Debug, Clone)]
pub struct TransportStats {
    /// Bound address
    pub local_addr: SocketAddr,
    /// Datagrams handed to the OS
    pub datagrams_sent: u64,
    /// Datagrams read from the socket
    pub datagrams_received: u64,
}

impl Transport {
    /// Bind the first free port in `base_port..base_port + port_range`.
    ///
    /// Used in local mode so several instances on one host each get a port
    /// that the others' beacons will reach.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::BindFailed` when every port in the range is taken
    pub async fn bind_in_range(base_port: u16, port_range: u16) -> Result<Self> {
        let last = u32::from(base_port) + u32::from(port_range);
        for port in u32::from(base_port)..last.min(u32::from(u16::MAX) + 1) {
            let Ok(port) = u16::try_from(port) else { break };
            match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).await {
                Ok(socket) => {
                    socket.set_broadcast(true)?;
                    return Self::from_socket(socket);
                }
                Err(e) => log::debug!("Port {} unavailable: {}", port, e),
            }
        }

        Err(NetworkError::BindFailed {
            reason: format!("no free port in {base_port}..{last}"),
        }
        .into())
    }

    /// Bind an ephemeral port (internet mode)
    pub async fn bind_ephemeral() -> Result<Self> {
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
            .await
            .map_err(|e| NetworkError::BindFailed {
                reason: e.to_string(),
            })?;
        Self::from_socket(socket)
    }

    fn from_socket(socket: UdpSocket) -> Result<Self> {
        let local_addr = socket.local_addr()?;
        let (stop_tx, _) = watch::channel(false);
        log::info!("UDP transport bound on {}", local_addr);

        Ok(Self {
            socket,
            local_addr,
            stop_tx,
            datagrams_sent: AtomicU64::new(0),
            datagrams_received: AtomicU64::new(0),
        })
    }

    /// Bound address
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Bound port
    pub fn port(&self) -> u16 {
        self.local_addr.port()
    }

    /// The raw socket, for exchanges that are not overlay frames (STUN)
    pub fn socket(&self) -> &UdpSocket {
        &self.socket
    }

    /// Send raw bytes
    pub async fn send(&self, target: SocketAddr, bytes: &[u8]) -> Result<()> {
        self.ensure_running()?;
        self.socket
            .send_to(bytes, target)
            .await
            .map_err(|e| NetworkError::Transport {
                reason: format!("send to {target}: {e}"),
            })?;
        self.datagrams_sent.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Compress and send a frame
    pub async fn send_frame(&self, target: SocketAddr, frame: &Frame) -> Result<()> {
        log::debug!("-> {} {} ({})", target, frame.command, frame.username);
        let datagram = encode_datagram(frame)?;
        self.send(target, &datagram).await
    }

    /// Wait for the next datagram.
    ///
    /// Returns `Ok(None)` once the transport is stopped.
    pub async fn recv(&self, buf: &mut [u8]) -> Result<Option<(usize, SocketAddr)>> {
        let mut stop_rx = self.stop_tx.subscribe();
        if *stop_rx.borrow() {
            return Ok(None);
        }

        tokio::select! {
            received = self.socket.recv_from(buf) => {
                let (len, from) = received.map_err(|e| NetworkError::Transport {
                    reason: e.to_string(),
                })?;
                self.datagrams_received.fetch_add(1, Ordering::Relaxed);
                Ok(Some((len, from)))
            }
            _ = async { let _ = stop_rx.wait_for(|stopped| *stopped).await; } => Ok(None),
        }
    }

    /// Decode a received datagram
    pub fn decode(datagram: &[u8]) -> Result<Frame> {
        decode_datagram(datagram)
    }

    /// One-way transition to stopped
    pub fn stop(&self) {
        if !self.stop_tx.send_replace(true) {
            log::info!("UDP transport on {} stopped", self.local_addr);
        }
    }

    /// Whether [`stop`](Self::stop) has been called
    pub fn is_stopped(&self) -> bool {
        *self.stop_tx.borrow()
    }

    /// A receiver that flips to `true` on stop, for tasks to select on
    pub fn stop_signal(&self) -> watch::Receiver<bool> {
        self.stop_tx.subscribe()
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_stopped() {
            Err(NetworkError::Stopped.into())
        } else {
            Ok(())
        }
    }

    /// Get transport statistics
    pub fn stats(&self) -> TransportStats {
        TransportStats {
            local_addr: self.local_addr,
            datagrams_sent: self.datagrams_sent.load(Ordering::Relaxed),
            datagrams_received: self.datagrams_received.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::protocol::{Command, PortAnnouncement};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_range_binding_skips_taken_ports() {
        let first = Transport::bind_in_range(42310, 3).await.unwrap();
        let second = Transport::bind_in_range(42310, 3).await.unwrap();

        assert_eq!(first.port(), 42310);
        assert_eq!(second.port(), 42311);
    }

    #[tokio::test]
    async fn test_exhausted_range_fails() {
        let _taken = Transport::bind_in_range(42320, 1).await.unwrap();
        assert!(Transport::bind_in_range(42320, 1).await.is_err());
    }

    #[tokio::test]
    async fn test_frame_exchange() {
        let a = Transport::bind_ephemeral().await.unwrap();
        let b = Transport::bind_ephemeral().await.unwrap();
        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, b.port()));

        let frame = Frame::new("alice", &Command::Discovery(PortAnnouncement { port: a.port() }))
            .unwrap();
        a.send_frame(target, &frame).await.unwrap();

        let mut buf = vec![0u8; 2048];
        let (len, from) = b.recv(&mut buf).await.unwrap().unwrap();
        assert_eq!(from.port(), a.port());
        assert_eq!(Transport::decode(&buf[..len]).unwrap(), frame);
        assert_eq!(a.stats().datagrams_sent, 1);
        assert_eq!(b.stats().datagrams_received, 1);
    }

    #[tokio::test]
    async fn test_stop_unblocks_receiver() {
        let transport = Arc::new(Transport::bind_ephemeral().await.unwrap());
        let listener = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64];
                transport.recv(&mut buf).await
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        transport.stop();

        let received = tokio::time::timeout(Duration::from_secs(2), listener)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert!(received.is_none());
        assert!(transport.is_stopped());

        let target = SocketAddr::from((Ipv4Addr::LOCALHOST, 9));
        assert!(transport.send(target, b"x").await.is_err());
    }
}
