//! LAN presence beacon.
//!
//! In local mode every node periodically broadcasts a `discovery` frame to
//! each port of the configured range, so instances that fell back to a
//! higher port on the same host or network still hear each other.

use crate::transport::{Command, Frame, PortAnnouncement, Transport};
use crate::utils::{NetworkConfig, Result};
use std::net::{IpAddr, Ipv4Addr, SocketAddr, UdpSocket as StdUdpSocket};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};

/// Periodic discovery broadcaster
#[derive(Debug, Clone)]
pub struct DiscoveryBeacon {
    username: String,
    listening_port: u16,
    targets: Vec<SocketAddr>,
    interval: Duration,
}

impl DiscoveryBeacon {
    /// Create a beacon for a node bound on `listening_port`
    ///
    /// # Arguments
    ///
    /// * `username` - Our username
    /// * `listening_port` - Port announced in the payload
    /// * `network` - Broadcast address and port range to cover
    /// * `interval` - Broadcast cadence
    pub fn new(
        username: impl Into<String>,
        listening_port: u16,
        network: &NetworkConfig,
        interval: Duration,
    ) -> Self {
        let last = u32::from(network.base_port) + u32::from(network.port_range);
        let targets = (u32::from(network.base_port)..last)
            .filter_map(|port| u16::try_from(port).ok())
            .filter(|port| *port != listening_port)
            .map(|port| SocketAddr::new(network.broadcast_address, port))
            .collect();

        Self {
            username: username.into(),
            listening_port,
            targets,
            interval,
        }
    }

    /// Addresses each round is sent to
    pub fn targets(&self) -> &[SocketAddr] {
        &self.targets
    }

    /// The discovery frame
    pub fn frame(&self) -> Result<Frame> {
        Frame::new(
            self.username.as_str(),
            &Command::Discovery(PortAnnouncement {
                port: self.listening_port,
            }),
        )
    }

    /// Send one round; returns how many targets were reached without error
    pub async fn announce(&self, transport: &Transport) -> Result<usize> {
        let frame = self.frame()?;
        let mut sent = 0;
        for target in &self.targets {
            match transport.send_frame(*target, &frame).await {
                Ok(()) => sent += 1,
                Err(e) => log::trace!("Beacon to {} failed: {}", target, e),
            }
        }
        Ok(sent)
    }

    /// Broadcast until the transport stops
    pub async fn run(self, transport: Arc<Transport>) {
        let mut stop = transport.stop_signal();
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        log::info!(
            "Discovery beacon for {} covering {} ports",
            self.username,
            self.targets.len()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(e) = self.announce(&transport).await {
                        log::warn!("Discovery broadcast failed: {}", e);
                    }
                }
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => break,
            }
        }

        log::debug!("Discovery beacon stopped");
    }
}

/// Best guess at this host's LAN address.
///
/// Connecting a UDP socket sends nothing; it only makes the OS pick the
/// outbound interface.
pub fn local_ip() -> IpAddr {
    StdUdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0))
        .and_then(|socket| {
            socket.connect((Ipv4Addr::new(10, 255, 255, 255), 1))?;
            socket.local_addr()
        })
        .map(|addr| addr.ip())
        .ok()
        .filter(|ip| !ip.is_unspecified())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}
