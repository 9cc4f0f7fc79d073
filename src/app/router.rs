//! Inbound side: datagram decoding and command dispatch.
//!
//! Every failure here is narrowed to the one datagram that caused it. The
//! listener logs and moves on.

use super::{App, AppEvent, Effects};
use crate::network::PeerAddress;
use crate::session::{Acceptance, KeyUpdate, SessionManager};
use crate::transport::{
    Command, Frame, HistoryRequest, HistoryResponse, PortAnnouncement, PublicKeyOffer, SessionKeyAck,
    SessionKeyOffer, Transport, Verdict,
};
use crate::utils::{MessengerError, NetworkMode, ProtocolError, Result, SessionError};
use std::net::SocketAddr;
use tokio::time::sleep;

/// Chat id whose history is requested once a channel comes up
pub(crate) const GLOBAL_CHAT: &str = "global";

impl App {
    pub(super) async fn handle_datagram(&self, datagram: &[u8], from: SocketAddr) {
        let frame = match Transport::decode(datagram) {
            Ok(frame) => frame,
            Err(e) => {
                log::warn!("Dropping datagram from {}: {}", from, e);
                return;
            }
        };
        if frame.username == self.shared.username {
            return;
        }
        let command = match frame.command() {
            Ok(command) => command,
            Err(e) => {
                log::warn!("Dropping {} from {} ({}): {}", frame.command, frame.username, from, e);
                return;
            }
        };
        log::debug!("<- {} {} ({})", from, command.name(), frame.username);

        let handled = match command {
            Command::EncryptedMessage(sealed) => {
                let opened = self.shared.sessions.read().await.decrypt_from(&frame.username, &sealed);
                match opened {
                    Ok(plaintext) => self.open_sealed(&frame.username, &plaintext, from).await,
                    Err(MessengerError::Session(SessionError::NoSecureChannel { .. })) => {
                        self.request_rekey(&frame.username, from).await
                    }
                    Err(e) => Err(e),
                }
            }
            command => self.dispatch(&frame.username, command, from, false).await,
        };
        if let Err(e) = handled {
            if e.is_security_violation() {
                log::warn!("Security violation from {} ({}): {}", frame.username, from, e);
            } else {
                log::debug!("Command from {} not handled: {}", frame.username, e);
            }
        }
    }

    async fn dispatch(&self, sender: &str, command: Command, from: SocketAddr, encrypted: bool) -> Result<()> {
        if !encrypted && !command.is_control_plane() {
            return Err(ProtocolError::NotAllowed {
                command: command.name().to_string(),
                reason: "application commands must be encrypted".to_string(),
            }
            .into());
        }

        let advertised_port = match &command {
            Command::Discovery(p) | Command::ContactRequest(p) => Some(p.port),
            _ => None,
        };
        self.shared.peers.write().await.touch(sender, from, advertised_port);

        match command {
            Command::Discovery(announcement) => self.on_discovery(sender, announcement, from).await,
            Command::PublicKey(offer) => self.on_public_key(sender, offer, from).await,
            Command::SessionKey(offer) => self.on_session_key(sender, offer).await,
            Command::SessionKeyAck(ack) => {
                if self.shared.sessions.write().await.acknowledge(sender, &ack.handshake_id) {
                    self.emit(AppEvent::SecureChannelEstablished {
                        username: sender.to_string(),
                    });
                }
                Ok(())
            }
            Command::EncryptedMessage(_) => Err(ProtocolError::InvalidMessage {
                reason: "nested encrypted_message".to_string(),
            }
            .into()),
            Command::HolePunchSyn => {
                log::debug!("SYN from {} at {}, answering", sender, from);
                self.send_to_addr(sender, from, &Command::HolePunchAck).await
            }
            Command::HolePunchAck => {
                let first = self.shared.punches.lock().await.on_ack(sender, from);
                if let Some(address) = first {
                    let effects = self.punch_succeeded(sender, address).await;
                    self.execute(effects).await;
                }
                Ok(())
            }
            Command::ContactRequest(announcement) => {
                self.upsert_peer(sender, from, announcement.port).await;
                self.emit(AppEvent::IncomingContactRequest {
                    from: sender.to_string(),
                });
                Ok(())
            }
            Command::ContactResponse(Verdict { accepted }) => {
                self.emit(AppEvent::ContactRequestResponse {
                    from: sender.to_string(),
                    accepted,
                });
                if accepted && SessionManager::should_initiate(&self.shared.username, sender) {
                    self.send_public_key(sender, true).await?;
                }
                Ok(())
            }
            Command::Message(message) => {
                self.emit(AppEvent::MessageReceived {
                    from: sender.to_string(),
                    message,
                });
                Ok(())
            }
            Command::DeleteMessage(delete) => {
                self.emit(AppEvent::MessageDeleted {
                    from: sender.to_string(),
                    id: delete.id,
                });
                Ok(())
            }
            Command::EditMessage(edit) => {
                self.emit(AppEvent::MessageEdited {
                    from: sender.to_string(),
                    id: edit.id,
                    text: edit.text,
                });
                Ok(())
            }
            Command::RequestHistory(HistoryRequest { chat_id }) => {
                let history = self
                    .shared
                    .history
                    .read()
                    .await
                    .get(&chat_id)
                    .cloned()
                    .unwrap_or_default();
                self.send_when_secure(sender, Command::HistoryResponse(HistoryResponse { chat_id, history }))
                    .await
            }
            Command::HistoryResponse(response) => {
                self.emit(AppEvent::HistoryReceived {
                    chat_id: response.chat_id,
                    history: response.history,
                });
                Ok(())
            }
            Command::FileTransferRequest(offer) => {
                self.emit(AppEvent::IncomingFileRequest {
                    from: sender.to_string(),
                    filename: offer.filename,
                    filesize: offer.filesize,
                    port: offer.port,
                });
                Ok(())
            }
            Command::FileTransferResponse(Verdict { accepted }) => {
                self.emit(AppEvent::FileRequestResponse {
                    from: sender.to_string(),
                    accepted,
                });
                Ok(())
            }
            Command::WebrtcSignal(signal) => {
                self.emit(AppEvent::WebrtcSignal {
                    from: sender.to_string(),
                    signal,
                });
                Ok(())
            }
            Command::Unrecognized { name } => {
                log::debug!("Ignoring unknown command {} from {}", name, sender);
                Ok(())
            }
            group_or_call => {
                let effects = self.dispatch_stateful(sender, group_or_call).await?;
                self.execute(effects).await;
                Ok(())
            }
        }
    }

    /// Commands handled by the group and call state machines
    async fn dispatch_stateful(&self, sender: &str, command: Command) -> Result<Effects> {
        let effects = match command {
            Command::GroupInvite(invite) => self.shared.groups.write().await.on_invite(sender, invite),
            Command::GroupInviteResponse(response) => self
                .shared
                .groups
                .write()
                .await
                .on_invite_response(sender, response)?,
            Command::JoinGroup(request) => self.shared.groups.write().await.on_join_request(sender, request)?,
            Command::UserJoinedGroup(notice) => self.shared.groups.write().await.on_user_joined(sender, notice)?,
            Command::GroupMessage(message) => self.shared.groups.read().await.on_group_message(sender, message)?,
            Command::GroupKick(kick) => self.shared.groups.write().await.on_kick(sender, kick)?,
            Command::LeaveGroup(request) => self.shared.groups.write().await.on_leave(sender, request)?,
            Command::UserLeftGroup(notice) => self.shared.groups.write().await.on_user_left(sender, notice)?,
            Command::P2pCallRequest(offer) => self.shared.calls.lock().await.on_call_request(sender, offer),
            Command::P2pCallResponse(answer) => self.shared.calls.lock().await.on_call_response(sender, answer),
            Command::P2pHangUp => self.shared.calls.lock().await.on_hang_up(sender),
            Command::GroupCallRequest(offer) => {
                let group = self.shared.groups.read().await.group(&offer.group_id).cloned();
                self.shared
                    .calls
                    .lock()
                    .await
                    .on_group_call_request(sender, offer, group.as_ref())
            }
            Command::GroupCallResponse(answer) => {
                let group = self.shared.groups.read().await.group(&answer.group_id).cloned();
                self.shared
                    .calls
                    .lock()
                    .await
                    .on_group_call_response(sender, answer, group.as_ref())
            }
            Command::GroupCallHangUp(hang_up) => self
                .shared
                .calls
                .lock()
                .await
                .on_group_call_hang_up(sender, hang_up),
            other => {
                return Err(ProtocolError::NotAllowed {
                    command: other.name().to_string(),
                    reason: "not routed".to_string(),
                }
                .into())
            }
        };
        Ok(effects)
    }

    async fn on_discovery(&self, sender: &str, announcement: PortAnnouncement, from: SocketAddr) -> Result<()> {
        let is_new = self.upsert_peer(sender, from, announcement.port).await;
        if is_new {
            log::info!("Discovered {} at {}:{}", sender, from.ip(), announcement.port);
        }
        self.ensure_handshake(sender).await
    }

    /// Start or resume the secure channel with a peer we just heard from
    async fn ensure_handshake(&self, peer: &str) -> Result<()> {
        let (secure, has_key) = {
            let sessions = self.shared.sessions.read().await;
            (sessions.is_secure(peer), sessions.has_peer_key(peer))
        };
        if secure {
            return Ok(());
        }
        if has_key {
            self.begin_handshake(peer).await
        } else {
            self.send_public_key(peer, true).await
        }
    }

    async fn on_public_key(&self, sender: &str, offer: PublicKeyOffer, from: SocketAddr) -> Result<()> {
        if !self.shared.peers.read().await.contains(sender) {
            self.upsert_peer(sender, from, from.port()).await;
        }

        let update = self.shared.sessions.write().await.store_peer_key(sender, &offer.key)?;
        log::debug!("Public key from {}: {:?}", sender, update);
        if update == KeyUpdate::Replaced {
            self.shared.punches.lock().await.forget(sender);
        }
        if offer.request {
            // A peer asking for our key holds no session with us any more
            let reset = {
                let mut sessions = self.shared.sessions.write().await;
                sessions.is_secure(sender)
                    && SessionManager::should_initiate(&self.shared.username, sender)
                    && sessions.reset_session(sender)
            };
            if reset {
                log::info!("{} lost its session with us; re-keying", sender);
            }
            self.send_public_key(sender, false).await?;
        }
        self.begin_handshake(sender).await
    }

    /// Traffic we cannot decrypt means the sender holds a session we do not.
    /// Ask for its key so the initiator re-keys.
    async fn request_rekey(&self, sender: &str, from: SocketAddr) -> Result<()> {
        if !self.shared.peers.read().await.contains(sender) {
            self.upsert_peer(sender, from, from.port()).await;
        }
        log::info!("No session with {}; requesting a new key exchange", sender);
        self.send_public_key(sender, true).await
    }

    /// Originate a session key if we are the initiator and nothing is in
    /// flight, then hand delivery to a retry task
    async fn begin_handshake(&self, peer: &str) -> Result<()> {
        let offer = self.shared.sessions.write().await.begin_handshake(peer)?;
        if let Some(offer) = offer {
            tokio::spawn(self.clone().deliver_session_key(offer.handshake_id));
        }
        Ok(())
    }

    /// Send the wrapped key until acknowledged or out of attempts
    async fn deliver_session_key(self, handshake_id: String) {
        let max_attempts = self.shared.config.handshake.max_attempts;
        let retry_interval = self.shared.config.handshake.retry_interval();
        let mut stop = self.shared.transport.stop_signal();

        loop {
            let next = self
                .shared
                .sessions
                .write()
                .await
                .next_attempt(&handshake_id, max_attempts);
            let (peer, offer, attempt) = match next {
                Ok(Some(next)) => next,
                Ok(None) => return,
                Err(MessengerError::Session(SessionError::HandshakeTimeout { username, .. })) => {
                    self.emit(AppEvent::SecureChannelFailed { username });
                    return;
                }
                Err(e) => {
                    log::warn!("Handshake {} stopped: {}", handshake_id, e);
                    return;
                }
            };

            log::debug!("Session key to {} (attempt {}/{})", peer, attempt, max_attempts);
            if let Err(e) = self.send_command(&peer, &Command::SessionKey(offer)).await {
                log::debug!("Session key delivery to {} failed: {}", peer, e);
            }
            tokio::select! {
                () = sleep(retry_interval) => {}
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => return,
            }
        }
    }

    /// Send now if the channel is confirmed, otherwise once our handshake
    /// is acknowledged. A request may overtake the acknowledgment.
    async fn send_when_secure(&self, peer: &str, command: Command) -> Result<()> {
        if self.shared.sessions.read().await.is_secure(peer) {
            return self.send_command(peer, &command).await;
        }
        log::debug!("Holding {} for {} until the channel is confirmed", command.name(), peer);
        tokio::spawn(self.clone().deliver_when_secure(peer.to_string(), command));
        Ok(())
    }

    async fn deliver_when_secure(self, peer: String, command: Command) {
        let max_attempts = self.shared.config.handshake.max_attempts;
        let retry_interval = self.shared.config.handshake.retry_interval();
        let mut stop = self.shared.transport.stop_signal();

        for _ in 0..max_attempts {
            tokio::select! {
                () = sleep(retry_interval) => {}
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => return,
            }
            if self.shared.sessions.read().await.is_secure(&peer) {
                if let Err(e) = self.send_command(&peer, &command).await {
                    log::debug!("Held {} to {} failed: {}", command.name(), peer, e);
                }
                return;
            }
        }
        log::warn!("Dropping {} for {}: no secure channel", command.name(), peer);
    }

    async fn on_session_key(&self, sender: &str, offer: SessionKeyOffer) -> Result<()> {
        let accepted = self.shared.sessions.write().await.accept_session_key(sender, &offer);
        let ack = Command::SessionKeyAck(SessionKeyAck {
            handshake_id: offer.handshake_id.clone(),
        });
        match accepted {
            Ok(Acceptance::Established) => {
                self.emit(AppEvent::SecureChannelEstablished {
                    username: sender.to_string(),
                });
                self.send_command(sender, &ack).await?;
                self.send_command(
                    sender,
                    &Command::RequestHistory(HistoryRequest {
                        chat_id: GLOBAL_CHAT.to_string(),
                    }),
                )
                .await
            }
            Ok(Acceptance::Duplicate) => self.send_command(sender, &ack).await,
            Err(MessengerError::Session(SessionError::UnexpectedInitiator { .. })) => {
                log::warn!("Ignoring session key from {}: we originate keys for this pair", sender);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Dispatch the frame carried by a decrypted `encrypted_message`
    async fn open_sealed(&self, sender: &str, plaintext: &[u8], from: SocketAddr) -> Result<()> {
        let inner = Frame::from_bytes(plaintext)?;
        if inner.username != sender {
            return Err(ProtocolError::NotAllowed {
                command: inner.command,
                reason: format!("inner sender {} does not match {}", inner.username, sender),
            }
            .into());
        }
        let command = inner.command()?;
        self.dispatch(sender, command, from, true).await
    }

    /// Insert or refresh a peer from a packet carrying its listening port.
    /// Returns whether the peer is new; new peers are announced.
    async fn upsert_peer(&self, username: &str, from: SocketAddr, listening_port: u16) -> bool {
        let public_addr = match self.shared.config.network.mode {
            NetworkMode::Local => None,
            NetworkMode::Internet => Some(from),
        };
        let address = PeerAddress {
            local_ip: from.ip(),
            public_addr,
            listening_port,
        };
        let (is_new, target) = {
            let mut peers = self.shared.peers.write().await;
            let is_new = peers.upsert(username, address);
            (is_new, peers.target(username).unwrap_or(from))
        };
        if is_new {
            self.emit(AppEvent::PeerDiscovered {
                username: username.to_string(),
                address: target,
            });
        }
        is_new
    }

    pub(crate) async fn send_public_key(&self, peer: &str, request: bool) -> Result<()> {
        let key = self.shared.sessions.read().await.public_key_pem().to_string();
        self.send_command(peer, &Command::PublicKey(PublicKeyOffer { key, request }))
            .await
    }
}
