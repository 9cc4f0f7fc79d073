//! Username-keyed table of known peers and their addresses.
//!
//! Liveness is purely time based: every inbound packet from a peer refreshes
//! `last_seen`, and [`PeerTable::prune_at`] drops entries that stayed silent
//! for longer than the configured threshold.

use crate::utils::{NetworkError, Result};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::time::{Duration, Instant};

/// Addressing data learned from discovery, contact requests or the directory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PeerAddress {
    /// Address on the peer's own network
    pub local_ip: IpAddr,
    /// Address as seen from outside its NAT, if known
    pub public_addr: Option<SocketAddr>,
    /// Port the peer's transport is bound to
    pub listening_port: u16,
}

/// A known peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    /// Unique key
    pub username: String,
    /// Address on the peer's own network
    pub local_ip: IpAddr,
    /// Authoritative send target once known
    pub public_addr: Option<SocketAddr>,
    /// Port the peer's transport is bound to
    pub listening_port: u16,
    /// Last time anything arrived from this peer
    pub last_seen: Instant,
}

impl PeerRecord {
    /// `local_ip:listening_port`
    pub fn local_addr(&self) -> SocketAddr {
        SocketAddr::new(self.local_ip, self.listening_port)
    }

    /// Where to send: the public address if known, else the local one
    pub fn target(&self) -> SocketAddr {
        self.public_addr.unwrap_or_else(|| self.local_addr())
    }
}

/// Table of peers
#[derive(Debug)]
pub struct PeerTable {
    peers: HashMap<String, PeerRecord>,
    liveness_timeout: Duration,
}

impl PeerTable {
    /// Create an empty table
    pub fn new(liveness_timeout: Duration) -> Self {
        Self {
            peers: HashMap::new(),
            liveness_timeout,
        }
    }

    /// Create or overwrite a record.
    ///
    /// A known public address is kept when `address` carries none, since it
    /// stays the authoritative target once learned. Returns `true` when the
    /// username was not in the table before.
    pub fn upsert(&mut self, username: &str, address: PeerAddress) -> bool {
        let now = Instant::now();
        match self.peers.get_mut(username) {
            Some(record) => {
                record.local_ip = address.local_ip;
                record.listening_port = address.listening_port;
                if address.public_addr.is_some() {
                    record.public_addr = address.public_addr;
                }
                record.last_seen = now;
                false
            }
            None => {
                self.peers.insert(
                    username.to_string(),
                    PeerRecord {
                        username: username.to_string(),
                        local_ip: address.local_ip,
                        public_addr: address.public_addr,
                        listening_port: address.listening_port,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Record an inbound packet from a known peer.
    ///
    /// The public address becomes the packet's source IP with the advertised
    /// port if the command carried one, otherwise the source port. Returns
    /// `false` (and changes nothing) for unknown usernames.
    pub fn touch(&mut self, username: &str, observed: SocketAddr, advertised_port: Option<u16>) -> bool {
        let Some(record) = self.peers.get_mut(username) else {
            return false;
        };
        let port = advertised_port.unwrap_or_else(|| observed.port());
        record.public_addr = Some(SocketAddr::new(observed.ip(), port));
        record.last_seen = Instant::now();
        true
    }

    /// Look up a peer
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::PeerNotFound` if the username is unknown
    pub fn lookup(&self, username: &str) -> Result<PeerRecord> {
        self.peers.get(username).cloned().ok_or_else(|| {
            NetworkError::PeerNotFound {
                username: username.to_string(),
            }
            .into()
        })
    }

    /// Send target for a peer
    pub fn target(&self, username: &str) -> Result<SocketAddr> {
        self.lookup(username).map(|record| record.target())
    }

    /// Whether the username is known
    pub fn contains(&self, username: &str) -> bool {
        self.peers.contains_key(username)
    }

    /// Forget a peer
    pub fn remove(&mut self, username: &str) -> Option<PeerRecord> {
        self.peers.remove(username)
    }

    /// Remove every peer with `now - last_seen > liveness_timeout`
    pub fn prune_at(&mut self, now: Instant) -> Vec<String> {
        let timeout = self.liveness_timeout;
        let expired: Vec<String> = self
            .peers
            .values()
            .filter(|record| now.saturating_duration_since(record.last_seen) > timeout)
            .map(|record| record.username.clone())
            .collect();

        for username in &expired {
            self.peers.remove(username);
        }
        expired
    }

    /// [`prune_at`](Self::prune_at) with the current time
    pub fn prune(&mut self) -> Vec<String> {
        self.prune_at(Instant::now())
    }

    /// Known usernames, sorted
    pub fn usernames(&self) -> Vec<String> {
        let mut names: Vec<String> = self.peers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Snapshot of every record
    pub fn records(&self) -> Vec<PeerRecord> {
        self.peers.values().cloned().collect()
    }

    /// Number of known peers
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// Whether the table is empty
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn lan(last_octet: u8, port: u16) -> PeerAddress {
        PeerAddress {
            local_ip: IpAddr::V4(Ipv4Addr::new(192, 168, 1, last_octet)),
            public_addr: None,
            listening_port: port,
        }
    }

    #[test]
    fn test_upsert_and_lookup() {
        let mut table = PeerTable::new(Duration::from_secs(12));
        assert!(table.upsert("bob", lan(7, 12346)));
        assert!(!table.upsert("bob", lan(8, 12347)));

        let record = table.lookup("bob").unwrap();
        assert_eq!(record.target(), "192.168.1.8:12347".parse().unwrap());
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_lookup_missing_is_recoverable() {
        let table = PeerTable::new(Duration::from_secs(12));
        let err = table.lookup("nobody").unwrap_err();
        assert!(err.is_peer_not_found());
        assert!(err.is_recoverable());
    }

    #[test]
    fn test_public_addr_is_authoritative() {
        let mut table = PeerTable::new(Duration::from_secs(12));
        let public: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        table.upsert(
            "bob",
            PeerAddress {
                public_addr: Some(public),
                ..lan(7, 12346)
            },
        );
        // A later upsert without public data keeps it
        table.upsert("bob", lan(7, 12346));
        assert_eq!(table.target("bob").unwrap(), public);
    }

    #[test]
    fn test_touch_uses_observed_address() {
        let mut table = PeerTable::new(Duration::from_secs(12));
        let observed: SocketAddr = "198.51.100.9:61000".parse().unwrap();
        assert!(!table.touch("bob", observed, None));

        table.upsert("bob", lan(7, 12346));
        assert!(table.touch("bob", observed, None));
        assert_eq!(table.target("bob").unwrap(), observed);

        assert!(table.touch("bob", observed, Some(12346)));
        assert_eq!(
            table.target("bob").unwrap(),
            "198.51.100.9:12346".parse().unwrap()
        );
    }

    #[test]
    fn test_prune_threshold() {
        let mut table = PeerTable::new(Duration::from_secs(12));
        table.upsert("bob", lan(7, 12346));
        let seen = table.lookup("bob").unwrap().last_seen;

        // Exactly at the threshold the peer survives
        assert!(table.prune_at(seen + Duration::from_secs(12)).is_empty());
        assert_eq!(
            table.prune_at(seen + Duration::from_secs(13)),
            vec!["bob".to_string()]
        );
        assert!(table.is_empty());
    }

    #[test]
    fn test_recontact_resets_timer() {
        let mut table = PeerTable::new(Duration::from_millis(50));
        table.upsert("bob", lan(7, 12346));
        std::thread::sleep(Duration::from_millis(30));
        table.upsert("carol", lan(9, 12346));
        table.touch("bob", "192.168.1.7:12346".parse().unwrap(), None);
        std::thread::sleep(Duration::from_millis(30));

        assert!(table.prune().is_empty());
        assert_eq!(table.usernames(), vec!["bob", "carol"]);
    }
}
