//! Hole punching bookkeeping.
//!
//! The coordinator holds no sockets. The node's SYN task asks it whether
//! an attempt is still live before each SYN round, and the listener reports
//! every `hole_punch_ack` to it. Success is reported at most once per
//! [`HolePunchCoordinator::initiate`] call.
//!
//! ```text
//! initiate ─┬─ no public address ──────────────► Succeeded(local)
//!           └─ Punching ┬─ first ACK ──────────► Succeeded(observed)
//!                       └─ budget exhausted ───► Failed
//! ```

use crate::network::peers::PeerRecord;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

/// Where an attempt stands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchState {
    /// SYN rounds in flight
    Punching,
    /// An ACK arrived from this address
    Succeeded(SocketAddr),
    /// No ACK within the budget
    Failed,
}

/// What the caller should do after [`HolePunchCoordinator::initiate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PunchPlan {
    /// Same-LAN shortcut: report success at once
    Immediate(SocketAddr),
    /// Send SYN rounds for this attempt
    Rounds {
        /// Identifies the attempt the rounds belong to
        attempt_id: u64,
    },
}

#[derive(Debug)]
struct Attempt {
    id: u64,
    state: PunchState,
}

/// Tracks one hole punch attempt per peer
#[derive(Debug)]
pub struct HolePunchCoordinator {
    attempts: HashMap<String, Attempt>,
    next_id: u64,
    rounds: u32,
    interval: Duration,
}

impl HolePunchCoordinator {
    /// Create a coordinator sending `rounds` SYN rounds `interval` apart
    pub fn new(rounds: u32, interval: Duration) -> Self {
        Self {
            attempts: HashMap::new(),
            next_id: 1,
            rounds,
            interval,
        }
    }

    /// SYN rounds per attempt
    pub fn rounds(&self) -> u32 {
        self.rounds
    }

    /// Delay between rounds
    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Start a new attempt towards `peer`, superseding any previous one
    pub fn initiate(&mut self, peer: &PeerRecord) -> PunchPlan {
        let id = self.next_id;
        self.next_id += 1;

        if peer.public_addr.is_none() {
            let local = peer.local_addr();
            self.attempts.insert(
                peer.username.clone(),
                Attempt {
                    id,
                    state: PunchState::Succeeded(local),
                },
            );
            return PunchPlan::Immediate(local);
        }

        self.attempts.insert(
            peer.username.clone(),
            Attempt {
                id,
                state: PunchState::Punching,
            },
        );
        PunchPlan::Rounds { attempt_id: id }
    }

    /// Whether the SYN task for `attempt_id` should keep sending
    pub fn is_punching(&self, username: &str, attempt_id: u64) -> bool {
        self.attempts
            .get(username)
            .is_some_and(|a| a.id == attempt_id && a.state == PunchState::Punching)
    }

    /// Record an ACK. Returns the address to report, only for the first ACK
    /// of a live attempt.
    pub fn on_ack(&mut self, username: &str, from: SocketAddr) -> Option<SocketAddr> {
        let attempt = self.attempts.get_mut(username)?;
        if attempt.state != PunchState::Punching {
            return None;
        }
        attempt.state = PunchState::Succeeded(from);
        Some(from)
    }

    /// Mark a still-running attempt as failed. Returns `true` if it was.
    pub fn expire(&mut self, username: &str, attempt_id: u64) -> bool {
        match self.attempts.get_mut(username) {
            Some(attempt) if attempt.id == attempt_id && attempt.state == PunchState::Punching => {
                attempt.state = PunchState::Failed;
                true
            }
            _ => false,
        }
    }

    /// Current state for a peer
    pub fn state(&self, username: &str) -> Option<PunchState> {
        self.attempts.get(username).map(|a| a.state)
    }

    /// Drop all state for a peer
    pub fn forget(&mut self, username: &str) {
        self.attempts.remove(username);
    }
}

/// Candidate addresses for SYNs: public first, then local, without duplicates
pub fn candidates(peer: &PeerRecord) -> Vec<SocketAddr> {
    let local = peer.local_addr();
    match peer.public_addr {
        Some(public) if public != local => vec![public, local],
        _ => vec![local],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn peer(public: Option<&str>) -> PeerRecord {
        PeerRecord {
            username: "bob".to_string(),
            local_ip: "10.0.0.5".parse().unwrap(),
            public_addr: public.map(|p| p.parse().unwrap()),
            listening_port: 12346,
            last_seen: Instant::now(),
        }
    }

    #[test]
    fn test_same_lan_shortcut() {
        let mut coordinator = HolePunchCoordinator::new(5, Duration::from_millis(500));
        let plan = coordinator.initiate(&peer(None));

        let local: SocketAddr = "10.0.0.5:12346".parse().unwrap();
        assert_eq!(plan, PunchPlan::Immediate(local));
        assert_eq!(coordinator.state("bob"), Some(PunchState::Succeeded(local)));
        // Late ACKs do not report again
        assert_eq!(coordinator.on_ack("bob", local), None);
    }

    #[test]
    fn test_first_ack_wins_once() {
        let mut coordinator = HolePunchCoordinator::new(5, Duration::from_millis(500));
        let PunchPlan::Rounds { attempt_id } = coordinator.initiate(&peer(Some("203.0.113.1:40000")))
        else {
            panic!("expected SYN rounds");
        };
        assert!(coordinator.is_punching("bob", attempt_id));

        let observed: SocketAddr = "203.0.113.1:40123".parse().unwrap();
        assert_eq!(coordinator.on_ack("bob", observed), Some(observed));
        assert_eq!(coordinator.on_ack("bob", observed), None);
        assert_eq!(
            coordinator.on_ack("bob", "10.0.0.5:12346".parse().unwrap()),
            None
        );
        assert!(!coordinator.is_punching("bob", attempt_id));
        assert!(!coordinator.expire("bob", attempt_id));
    }

    #[test]
    fn test_reinitiate_reports_again() {
        let mut coordinator = HolePunchCoordinator::new(5, Duration::from_millis(500));
        let record = peer(Some("203.0.113.1:40000"));
        let observed: SocketAddr = "203.0.113.1:40000".parse().unwrap();

        coordinator.initiate(&record);
        assert!(coordinator.on_ack("bob", observed).is_some());
        coordinator.initiate(&record);
        assert!(coordinator.on_ack("bob", observed).is_some());
    }

    #[test]
    fn test_stale_rounds_cannot_expire_new_attempt() {
        let mut coordinator = HolePunchCoordinator::new(5, Duration::from_millis(500));
        let record = peer(Some("203.0.113.1:40000"));

        let PunchPlan::Rounds { attempt_id: first } = coordinator.initiate(&record) else {
            panic!("expected SYN rounds");
        };
        let PunchPlan::Rounds { attempt_id: second } = coordinator.initiate(&record) else {
            panic!("expected SYN rounds");
        };

        assert!(!coordinator.is_punching("bob", first));
        assert!(!coordinator.expire("bob", first));
        assert!(coordinator.expire("bob", second));
        assert_eq!(coordinator.state("bob"), Some(PunchState::Failed));
    }

    #[test]
    fn test_unsolicited_ack_is_ignored() {
        let mut coordinator = HolePunchCoordinator::new(5, Duration::from_millis(500));
        assert_eq!(
            coordinator.on_ack("mallory", "198.51.100.2:1".parse().unwrap()),
            None
        );
    }

    #[test]
    fn test_candidates() {
        assert_eq!(candidates(&peer(None)).len(), 1);
        assert_eq!(
            candidates(&peer(Some("203.0.113.1:40000"))),
            vec![
                "203.0.113.1:40000".parse().unwrap(),
                "10.0.0.5:12346".parse().unwrap()
            ]
        );
        assert_eq!(candidates(&peer(Some("10.0.0.5:12346"))).len(), 1);
    }
}
