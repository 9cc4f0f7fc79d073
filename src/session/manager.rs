//! Secure channel state: peer public keys, session keys and pending
//! session key deliveries.
//!
//! Exactly one side of a pair originates the session key: the one whose
//! username sorts greater. The other side only ever accepts.

use crate::crypto::{IdentityKeyPair, PeerPublicKey, SessionKey};
use crate::transport::SessionKeyOffer;
use crate::utils::{Result, SessionError};
use base64::{engine::general_purpose, Engine};
use std::collections::HashMap;
use uuid::Uuid;

/// Outcome of storing a peer's public key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyUpdate {
    /// First key for this peer
    New,
    /// Same key as before
    Unchanged,
    /// A different key; any session with the peer was dropped
    Replaced,
}

/// Outcome of receiving a session key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acceptance {
    /// A new channel is up
    Established,
    /// Retransmission of a key we already hold; only re-acknowledge
    Duplicate,
}

struct SessionState {
    key: SessionKey,
    secure: bool,
    handshake_id: String,
    established_at: Option<chrono::DateTime<chrono::Utc>>,
}

impl std::fmt::Debug for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionState")
            .field("key", &"[REDACTED]")
            .field("secure", &self.secure)
            .field("handshake_id", &self.handshake_id)
            .field("established_at", &self.established_at)
            .finish()
    }
}

#[derive(Debug, Clone)]
struct PendingHandshake {
    peer: String,
    offer: SessionKeyOffer,
    attempts: u32,
}

/// Per-peer secure channel bookkeeping
#[derive(Debug)]
pub struct SessionManager {
    local_username: String,
    identity: IdentityKeyPair,
    peer_keys: HashMap<String, PeerPublicKey>,
    sessions: HashMap<String, SessionState>,
    pending: HashMap<String, PendingHandshake>,
}

impl SessionManager {
    /// Create a manager for the local node
    pub fn new(local_username: impl Into<String>, identity: IdentityKeyPair) -> Self {
        Self {
            local_username: local_username.into(),
            identity,
            peer_keys: HashMap::new(),
            sessions: HashMap::new(),
            pending: HashMap::new(),
        }
    }

    /// The deterministic tie-break: `local` originates the session key
    /// towards `peer` iff it sorts greater
    pub fn should_initiate(local: &str, peer: &str) -> bool {
        local > peer
    }

    /// Our PEM public key
    pub fn public_key_pem(&self) -> &str {
        self.identity.public_key_pem()
    }

    /// Store a peer's public key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the PEM does not parse
    pub fn store_peer_key(&mut self, peer: &str, pem: &str) -> Result<KeyUpdate> {
        let key = PeerPublicKey::from_pem(pem)?;
        let update = match self.peer_keys.get(peer) {
            None => KeyUpdate::New,
            Some(known) if known.same_key(&key) => KeyUpdate::Unchanged,
            Some(_) => {
                log::info!("Public key of {} changed; dropping its session", peer);
                self.drop_session(peer);
                KeyUpdate::Replaced
            }
        };
        if update != KeyUpdate::Unchanged {
            self.peer_keys.insert(peer.to_string(), key);
        }
        Ok(update)
    }

    /// Whether we hold the peer's public key
    pub fn has_peer_key(&self, peer: &str) -> bool {
        self.peer_keys.contains_key(peer)
    }

    /// Generate and wrap a session key for `peer` if we are the initiator
    /// and nothing is established or in flight yet.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::MissingPublicKey` if we do not know the peer's key
    pub fn begin_handshake(&mut self, peer: &str) -> Result<Option<SessionKeyOffer>> {
        if !Self::should_initiate(&self.local_username, peer) {
            return Ok(None);
        }
        if self.sessions.contains_key(peer) || self.pending.values().any(|p| p.peer == peer) {
            return Ok(None);
        }
        let public_key = self
            .peer_keys
            .get(peer)
            .ok_or_else(|| SessionError::MissingPublicKey {
                username: peer.to_string(),
            })?;

        let key = SessionKey::generate();
        let wrapped = public_key.encrypt(key.as_bytes())?;
        let offer = SessionKeyOffer {
            key: general_purpose::STANDARD.encode(wrapped),
            handshake_id: Uuid::new_v4().to_string(),
        };

        self.sessions.insert(
            peer.to_string(),
            SessionState {
                key,
                secure: false,
                handshake_id: offer.handshake_id.clone(),
                established_at: None,
            },
        );
        self.pending.insert(
            offer.handshake_id.clone(),
            PendingHandshake {
                peer: peer.to_string(),
                offer: offer.clone(),
                attempts: 0,
            },
        );
        log::info!("Session key for {} prepared (handshake {})", peer, offer.handshake_id);
        Ok(Some(offer))
    }

    /// Next retransmission of a pending handshake, counting the attempt.
    /// `None` once acknowledged or abandoned.
    ///
    /// # Errors
    ///
    /// Returns `SessionError::HandshakeTimeout` once `max_attempts` sends
    /// went unacknowledged; the handshake is abandoned
    pub fn next_attempt(
        &mut self,
        handshake_id: &str,
        max_attempts: u32,
    ) -> Result<Option<(String, SessionKeyOffer, u32)>> {
        let Some(pending) = self.pending.get_mut(handshake_id) else {
            return Ok(None);
        };
        if pending.attempts >= max_attempts {
            let username = pending.peer.clone();
            self.abandon(handshake_id);
            return Err(SessionError::HandshakeTimeout {
                username,
                handshake_id: handshake_id.to_string(),
            }
            .into());
        }
        pending.attempts += 1;
        Ok(Some((pending.peer.clone(), pending.offer.clone(), pending.attempts)))
    }

    /// Whether a handshake is still waiting for its acknowledgment
    pub fn is_pending(&self, handshake_id: &str) -> bool {
        self.pending.contains_key(handshake_id)
    }

    /// Give up on a handshake; drops the unconfirmed key.
    /// Returns the peer it was for.
    pub fn abandon(&mut self, handshake_id: &str) -> Option<String> {
        let pending = self.pending.remove(handshake_id)?;
        if self
            .sessions
            .get(&pending.peer)
            .is_some_and(|s| !s.secure && s.handshake_id == handshake_id)
        {
            self.sessions.remove(&pending.peer);
        }
        log::warn!(
            "Handshake {} with {} abandoned after {} attempts",
            handshake_id,
            pending.peer,
            pending.attempts
        );
        Some(pending.peer)
    }

    /// Receive a session key from `sender`
    ///
    /// # Errors
    ///
    /// Returns `SessionError::UnexpectedInitiator` when `sender` is not the
    /// side that originates keys, and a crypto error if unwrapping fails
    pub fn accept_session_key(&mut self, sender: &str, offer: &SessionKeyOffer) -> Result<Acceptance> {
        if !Self::should_initiate(sender, &self.local_username) {
            return Err(SessionError::UnexpectedInitiator {
                username: sender.to_string(),
            }
            .into());
        }

        if self
            .sessions
            .get(sender)
            .is_some_and(|s| s.handshake_id == offer.handshake_id)
        {
            return Ok(Acceptance::Duplicate);
        }

        let wrapped = general_purpose::STANDARD.decode(&offer.key)?;
        let key = SessionKey::from_bytes(&self.identity.decrypt(&wrapped)?)?;

        self.sessions.insert(
            sender.to_string(),
            SessionState {
                key,
                secure: true,
                handshake_id: offer.handshake_id.clone(),
                established_at: Some(chrono::Utc::now()),
            },
        );
        log::info!("Secure channel with {} established (handshake {})", sender, offer.handshake_id);
        Ok(Acceptance::Established)
    }

    /// Handle an acknowledgment. Returns `true` the first time a pending
    /// handshake for `sender` is confirmed.
    pub fn acknowledge(&mut self, sender: &str, handshake_id: &str) -> bool {
        match self.pending.get(handshake_id) {
            Some(pending) if pending.peer == sender => {}
            _ => return false,
        }
        self.pending.remove(handshake_id);

        match self.sessions.get_mut(sender) {
            Some(session) if session.handshake_id == handshake_id => {
                session.secure = true;
                session.established_at = Some(chrono::Utc::now());
                log::info!("Secure channel with {} confirmed", sender);
                true
            }
            _ => false,
        }
    }

    /// Whether application traffic may be sent to `peer`
    pub fn is_secure(&self, peer: &str) -> bool {
        self.sessions.get(peer).is_some_and(|s| s.secure)
    }

    /// Peers with a confirmed channel, sorted
    pub fn secure_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self
            .sessions
            .iter()
            .filter(|(_, s)| s.secure)
            .map(|(peer, _)| peer.clone())
            .collect();
        peers.sort();
        peers
    }

    /// Encrypt for a peer with a confirmed channel
    ///
    /// # Errors
    ///
    /// Returns `SessionError::NoSecureChannel` if none exists
    pub fn encrypt_for(&self, peer: &str, plaintext: &[u8]) -> Result<Vec<u8>> {
        match self.sessions.get(peer) {
            Some(session) if session.secure => Ok(session.key.encrypt(plaintext)),
            _ => Err(SessionError::NoSecureChannel {
                username: peer.to_string(),
            }
            .into()),
        }
    }

    /// Decrypt traffic from a peer.
    ///
    /// An unconfirmed key is accepted: the receiver may start talking before
    /// our side has seen its acknowledgment.
    pub fn decrypt_from(&self, peer: &str, data: &[u8]) -> Result<Vec<u8>> {
        let session = self
            .sessions
            .get(peer)
            .ok_or_else(|| SessionError::NoSecureChannel {
                username: peer.to_string(),
            })?;
        session.key.decrypt(data)
    }

    /// Drop the session and any pending delivery for `peer`, keeping its
    /// public key so a new handshake can start at once. Returns whether
    /// there was anything to drop.
    pub fn reset_session(&mut self, peer: &str) -> bool {
        let had_session = self.sessions.contains_key(peer) || self.pending.values().any(|p| p.peer == peer);
        self.drop_session(peer);
        had_session
    }

    fn drop_session(&mut self, peer: &str) {
        self.sessions.remove(peer);
        self.pending.retain(|_, p| p.peer != peer);
    }

    /// Forget everything about a peer (peer lost)
    pub fn remove_peer(&mut self, peer: &str) {
        self.drop_session(peer);
        self.peer_keys.remove(peer);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::utils::MessengerError;

    const BITS: usize = 1024;

    fn manager(name: &str) -> SessionManager {
        SessionManager::new(name, IdentityKeyPair::generate(BITS).unwrap())
    }

    fn introduce(a: &mut SessionManager, b: &mut SessionManager) {
        let a_pem = a.public_key_pem().to_string();
        let b_pem = b.public_key_pem().to_string();
        a.store_peer_key(&b.local_username.clone(), &b_pem).unwrap();
        b.store_peer_key(&a.local_username.clone(), &a_pem).unwrap();
    }

    #[test]
    fn test_tie_break_is_antisymmetric() {
        for (x, y) in [("alice", "bob"), ("bob", "alice"), ("Zed", "abe"), ("a", "ab")] {
            assert_ne!(
                SessionManager::should_initiate(x, y),
                SessionManager::should_initiate(y, x)
            );
        }
    }

    #[test]
    fn test_full_handshake() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        introduce(&mut alice, &mut bob);

        // Both try; only bob produces an offer
        assert!(alice.begin_handshake("bob").unwrap().is_none());
        let offer = bob.begin_handshake("alice").unwrap().unwrap();
        assert!(bob.begin_handshake("alice").unwrap().is_none());
        assert!(!bob.is_secure("alice"));

        assert_eq!(
            alice.accept_session_key("bob", &offer).unwrap(),
            Acceptance::Established
        );
        assert_eq!(
            alice.accept_session_key("bob", &offer).unwrap(),
            Acceptance::Duplicate
        );

        assert!(bob.acknowledge("alice", &offer.handshake_id));
        assert!(!bob.acknowledge("alice", &offer.handshake_id));
        assert!(!bob.is_pending(&offer.handshake_id));

        let sealed = alice.encrypt_for("bob", b"hi").unwrap();
        assert_eq!(bob.decrypt_from("alice", &sealed).unwrap(), b"hi");
        assert_eq!(bob.secure_peers(), vec!["alice".to_string()]);
    }

    #[test]
    fn test_wrong_initiator_is_rejected() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        introduce(&mut alice, &mut bob);

        // Forge an offer from alice, who must never originate towards bob
        let key = SessionKey::generate();
        let wrapped = PeerPublicKey::from_pem(bob.public_key_pem())
            .unwrap()
            .encrypt(key.as_bytes())
            .unwrap();
        let offer = SessionKeyOffer {
            key: general_purpose::STANDARD.encode(wrapped),
            handshake_id: "h-forged".to_string(),
        };

        let err = bob.accept_session_key("alice", &offer).unwrap_err();
        assert!(err.is_security_violation());
        assert!(!bob.is_secure("alice"));
    }

    #[test]
    fn test_unconfirmed_key_decrypts_but_does_not_encrypt() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        introduce(&mut alice, &mut bob);

        let offer = bob.begin_handshake("alice").unwrap().unwrap();
        alice.accept_session_key("bob", &offer).unwrap();

        let early = alice.encrypt_for("bob", b"history please").unwrap();
        assert_eq!(bob.decrypt_from("alice", &early).unwrap(), b"history please");
        assert!(bob.encrypt_for("alice", b"too soon").is_err());
    }

    #[test]
    fn test_retries_and_abandon() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        introduce(&mut alice, &mut bob);

        let offer = bob.begin_handshake("alice").unwrap().unwrap();
        let id = offer.handshake_id.clone();
        for expected in 1..=3 {
            let (peer, resent, attempt) = bob.next_attempt(&id, 3).unwrap().unwrap();
            assert_eq!(peer, "alice");
            assert_eq!(resent, offer);
            assert_eq!(attempt, expected);
        }

        let err = bob.next_attempt(&id, 3).unwrap_err();
        assert!(matches!(
            err,
            MessengerError::Session(SessionError::HandshakeTimeout { ref username, .. }) if username == "alice"
        ));
        assert!(!bob.is_pending(&id));
        assert!(bob.next_attempt(&id, 3).unwrap().is_none());
        assert!(bob.decrypt_from("alice", &[0u8; 32]).is_err());

        // A fresh attempt is possible afterwards
        let again = bob.begin_handshake("alice").unwrap().unwrap();
        assert_eq!(bob.abandon(&again.handshake_id), Some("alice".to_string()));
        assert!(bob.abandon(&again.handshake_id).is_none());
    }

    #[test]
    fn test_changed_public_key_resets_session() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        introduce(&mut alice, &mut bob);
        let offer = bob.begin_handshake("alice").unwrap().unwrap();
        alice.accept_session_key("bob", &offer).unwrap();
        bob.acknowledge("alice", &offer.handshake_id);

        let pem = alice.public_key_pem().to_string();
        assert_eq!(bob.store_peer_key("alice", &pem).unwrap(), KeyUpdate::Unchanged);
        assert!(bob.is_secure("alice"));

        let restarted = manager("alice");
        assert_eq!(
            bob.store_peer_key("alice", restarted.public_key_pem()).unwrap(),
            KeyUpdate::Replaced
        );
        assert!(!bob.is_secure("alice"));
        assert!(bob.begin_handshake("alice").unwrap().is_some());
    }

    #[test]
    fn test_reset_allows_a_fresh_handshake() {
        let mut alice = manager("alice");
        let mut bob = manager("bob");
        introduce(&mut alice, &mut bob);
        let offer = bob.begin_handshake("alice").unwrap().unwrap();
        alice.accept_session_key("bob", &offer).unwrap();
        assert!(bob.acknowledge("alice", &offer.handshake_id));
        assert!(bob.begin_handshake("alice").unwrap().is_none());

        // Alice forgets bob; bob still believes the channel is up
        alice.remove_peer("bob");
        assert!(alice.decrypt_from("bob", &[0u8; 32]).is_err());
        let bob_pem = bob.public_key_pem().to_string();
        assert_eq!(alice.store_peer_key("bob", &bob_pem).unwrap(), KeyUpdate::New);
        assert!(bob.is_secure("alice"));

        assert!(bob.reset_session("alice"));
        assert!(!bob.reset_session("alice"));
        assert!(bob.has_peer_key("alice"));
        let fresh = bob.begin_handshake("alice").unwrap().unwrap();
        assert_ne!(fresh.handshake_id, offer.handshake_id);
        assert_eq!(
            alice.accept_session_key("bob", &fresh).unwrap(),
            Acceptance::Established
        );
        assert!(bob.acknowledge("alice", &fresh.handshake_id));

        let sealed = bob.encrypt_for("alice", b"still there?").unwrap();
        assert_eq!(alice.decrypt_from("bob", &sealed).unwrap(), b"still there?");
    }

    #[test]
    fn test_missing_public_key() {
        let mut bob = manager("bob");
        assert!(bob.begin_handshake("alice").is_err());
        bob.remove_peer("alice");
        assert!(!bob.has_peer_key("alice"));
    }
}
