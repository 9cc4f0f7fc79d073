//! Outbound API used by collaborators (console, UI, audio).
//!
//! Failures that concern a single peer are both returned and published as
//! events, so a collaborator that only listens to events still learns about
//! them.

use super::{App, AppEvent, Effects};
use crate::network::{DirectoryRecord, PeerAddress};
use crate::transport::{Command, DeleteMessage, EditMessage, FileOffer, HistoryRequest, PortAnnouncement, Verdict};
use crate::utils::{NetworkError, Result};
use serde_json::Value;
use std::net::SocketAddr;

impl App {
    /// Send a private chat message over the secure channel
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::PeerNotFound` for unknown peers and
    /// `SessionError::NoSecureChannel` before the handshake completed
    pub async fn send_private_message(&self, to: &str, message: Value) -> Result<()> {
        self.send_command(to, &Command::Message(message)).await
    }

    /// Send a chat message to every peer with a secure channel.
    /// Returns how many peers it was sent to.
    pub async fn broadcast_message(&self, message: Value) -> usize {
        self.broadcast(&Command::Message(message)).await
    }

    /// Retract a message on every connected peer
    pub async fn delete_message(&self, id: &str) -> usize {
        self.broadcast(&Command::DeleteMessage(DeleteMessage { id: id.to_string() }))
            .await
    }

    /// Edit a message on every connected peer
    pub async fn edit_message(&self, id: &str, text: &str) -> usize {
        self.broadcast(&Command::EditMessage(EditMessage {
            id: id.to_string(),
            text: text.to_string(),
        }))
        .await
    }

    async fn broadcast(&self, command: &Command) -> usize {
        let peers = self.shared.sessions.read().await.secure_peers();
        let mut sent = 0;
        for peer in peers {
            match self.send_command(&peer, command).await {
                Ok(()) => sent += 1,
                Err(e) => log::warn!("Broadcast of {} to {} failed: {}", command.name(), peer, e),
            }
        }
        sent
    }

    /// Store a message in the local history served to `request_history`
    pub async fn append_history(&self, chat_id: &str, message: Value) {
        self.shared
            .history
            .write()
            .await
            .entry(chat_id.to_string())
            .or_default()
            .push(message);
    }

    /// Ask a peer for the history of a chat
    ///
    /// # Errors
    ///
    /// Fails like [`send_private_message`](Self::send_private_message)
    pub async fn request_history(&self, peer: &str, chat_id: &str) -> Result<()> {
        self.send_command(
            peer,
            &Command::RequestHistory(HistoryRequest {
                chat_id: chat_id.to_string(),
            }),
        )
        .await
    }

    /// Resolve a username through the rendezvous directory.
    ///
    /// Returns as soon as the lookup is submitted. The outcome arrives as
    /// `PeerDiscovered` (followed by the key exchange) or `PeerNotFound`.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::DhtFailure` when no directory is running
    pub async fn find_peer(&self, username: &str) -> Result<()> {
        let answer = match self.directory().and_then(|d| d.lookup(username)) {
            Ok(answer) => answer,
            Err(e) => {
                self.emit(AppEvent::PeerNotFound {
                    username: username.to_string(),
                });
                return Err(e);
            }
        };

        let app = self.clone();
        let username = username.to_string();
        let mut stop = self.shared.transport.stop_signal();
        tokio::spawn(async move {
            tokio::select! {
                found = answer => app.on_lookup(&username, found.ok().flatten()).await,
                _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {}
            }
        });
        Ok(())
    }

    async fn on_lookup(&self, username: &str, record: Option<DirectoryRecord>) {
        let Some(record) = record else {
            log::info!("{} not found in the directory", username);
            self.emit(AppEvent::PeerNotFound {
                username: username.to_string(),
            });
            return;
        };

        let address = PeerAddress {
            local_ip: record.local_ip,
            public_addr: record.public_socket_addr(),
            listening_port: record.local_port(),
        };
        self.add_peer(username, address).await;
        if let Err(e) = self.send_public_key(username, true).await {
            log::warn!("Key exchange with {} not started: {}", username, e);
        }
    }

    /// Add a peer whose address is known out of band
    pub async fn register_peer(&self, username: &str, local: SocketAddr, public: Option<SocketAddr>) {
        self.add_peer(
            username,
            PeerAddress {
                local_ip: local.ip(),
                public_addr: public,
                listening_port: local.port(),
            },
        )
        .await;
    }

    async fn add_peer(&self, username: &str, address: PeerAddress) {
        let target = {
            let mut peers = self.shared.peers.write().await;
            peers.upsert(username, address);
            peers.target(username)
        };
        if let Ok(address) = target {
            self.emit(AppEvent::PeerDiscovered {
                username: username.to_string(),
                address,
            });
        }
    }

    /// Start the key exchange with a known peer
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::PeerNotFound` for unknown peers
    pub async fn connect_to(&self, username: &str) -> Result<()> {
        self.send_public_key(username, true).await
    }

    /// Ask a known peer to become a contact
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::PeerNotFound` for unknown peers
    pub async fn send_contact_request(&self, username: &str) -> Result<()> {
        let port = self.port();
        self.send_command(username, &Command::ContactRequest(PortAnnouncement { port }))
            .await
    }

    /// Answer a contact request. Accepting also starts the key exchange.
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::PeerNotFound` for unknown peers
    pub async fn respond_contact_request(&self, username: &str, accept: bool) -> Result<()> {
        self.send_command(username, &Command::ContactResponse(Verdict { accepted: accept }))
            .await?;
        if accept {
            self.send_public_key(username, true).await?;
        }
        Ok(())
    }

    /// Start a hole punch towards a known peer
    ///
    /// # Errors
    ///
    /// Returns `NetworkError::PeerNotFound` for unknown peers
    pub async fn hole_punch(&self, username: &str) -> Result<()> {
        if !self.shared.peers.read().await.contains(username) {
            self.emit(AppEvent::PeerNotFound {
                username: username.to_string(),
            });
            return Err(NetworkError::PeerNotFound {
                username: username.to_string(),
            }
            .into());
        }
        let mut effects = Effects::none();
        effects.punch(username);
        self.execute(effects).await;
        Ok(())
    }

    /// Create a group we administer. Returns its id.
    pub async fn create_group(&self, name: &str) -> String {
        let (group_id, effects) = self.shared.groups.write().await.create(name);
        self.execute(effects).await;
        group_id
    }

    /// Create a group under a chosen id
    ///
    /// # Errors
    ///
    /// Returns `GroupError::AlreadyExists` if the id is taken
    pub async fn create_group_with_id(&self, group_id: &str, name: &str) -> Result<()> {
        let effects = self.shared.groups.write().await.create_with_id(group_id, name)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Invite a peer into one of our groups
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NotFound` or `GroupError::NotAdmin`
    pub async fn invite_to_group(&self, group_id: &str, username: &str) -> Result<()> {
        let effects = self.shared.groups.write().await.invite(group_id, username)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Accept or decline a group invitation
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NoPendingInvite` without an invitation
    pub async fn respond_group_invite(&self, group_id: &str, accept: bool) -> Result<()> {
        let effects = self.shared.groups.write().await.respond_invite(group_id, accept)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Ask the admin to join, using a received invitation
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NoPendingInvite` without an invitation
    pub async fn join_group(&self, group_id: &str) -> Result<()> {
        let effects = self.shared.groups.write().await.join(group_id)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Send a message to a group through its admin
    ///
    /// # Errors
    ///
    /// Returns `GroupError::NotFound` for unknown groups
    pub async fn send_group_message(&self, group_id: &str, message: Value) -> Result<()> {
        let effects = self.shared.groups.read().await.send_message(group_id, message)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Remove a member from one of our groups
    ///
    /// # Errors
    ///
    /// Fails when we are not the admin or `username` is not a member
    pub async fn kick_from_group(&self, group_id: &str, username: &str) -> Result<()> {
        let effects = self.shared.groups.write().await.kick(group_id, username)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Leave a group we do not administer
    ///
    /// # Errors
    ///
    /// Returns `GroupError::AdminCannotLeave` for our own groups
    pub async fn leave_group(&self, group_id: &str) -> Result<()> {
        let effects = self.shared.groups.write().await.leave(group_id)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Call a peer. The request is sent once a hole punch succeeds.
    ///
    /// # Errors
    ///
    /// Returns `CallError::Busy` during another call
    pub async fn start_call(&self, username: &str, sample_rate: u32) -> Result<()> {
        let effects = self.shared.calls.lock().await.start_call(username, sample_rate)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Answer the ringing call
    ///
    /// # Errors
    ///
    /// Returns `CallError::NotRinging` when nobody is calling
    pub async fn answer_call(&self, accept: bool) -> Result<()> {
        let effects = self.shared.calls.lock().await.answer(accept)?;
        self.execute(effects).await;
        Ok(())
    }

    /// End the current 1:1 call
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoActiveCall` when idle
    pub async fn hang_up(&self) -> Result<()> {
        let effects = self.shared.calls.lock().await.hang_up()?;
        self.execute(effects).await;
        Ok(())
    }

    /// Start a call with every member of a group we administer
    ///
    /// # Errors
    ///
    /// Fails for unknown groups, groups we do not administer and while busy
    pub async fn start_group_call(&self, group_id: &str, sample_rate: u32) -> Result<()> {
        let group = self.group(group_id).await.ok_or_else(|| crate::utils::GroupError::NotFound {
            group_id: group_id.to_string(),
        })?;
        let effects = self.shared.calls.lock().await.start_group_call(&group, sample_rate)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Answer a group call invitation
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoInvitation` without an invitation
    pub async fn answer_group_call(&self, group_id: &str, accept: bool) -> Result<()> {
        let effects = self.shared.calls.lock().await.answer_group_call(group_id, accept)?;
        self.execute(effects).await;
        Ok(())
    }

    /// Leave the group call; the admin leaving ends it
    ///
    /// # Errors
    ///
    /// Returns `CallError::NoActiveCall` outside a group call
    pub async fn leave_group_call(&self) -> Result<()> {
        let effects = self.shared.calls.lock().await.leave_group_call()?;
        self.execute(effects).await;
        Ok(())
    }

    /// Offer a file. The transfer itself happens outside the overlay on `port`.
    ///
    /// # Errors
    ///
    /// Fails like [`send_private_message`](Self::send_private_message)
    pub async fn request_file_transfer(&self, peer: &str, filename: &str, filesize: u64, port: u16) -> Result<()> {
        self.send_command(
            peer,
            &Command::FileTransferRequest(FileOffer {
                filename: filename.to_string(),
                filesize,
                port,
            }),
        )
        .await
    }

    /// Relay WebRTC negotiation data (SDP offer or answer, ICE candidate)
    /// to a peer. The overlay does not interpret it.
    ///
    /// # Errors
    ///
    /// Fails like [`send_private_message`](Self::send_private_message)
    pub async fn send_webrtc_signal(&self, peer: &str, signal: Value) -> Result<()> {
        self.send_command(peer, &Command::WebrtcSignal(signal)).await
    }

    /// Answer a file offer
    ///
    /// # Errors
    ///
    /// Fails like [`send_private_message`](Self::send_private_message)
    pub async fn respond_file_transfer(&self, peer: &str, accept: bool) -> Result<()> {
        self.send_command(peer, &Command::FileTransferResponse(Verdict { accepted: accept }))
            .await
    }
}
