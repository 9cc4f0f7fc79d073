//! Events surfaced to collaborators and the effect list the pure state
//! machines hand back to the node.

use crate::groups::GroupRecord;
use crate::transport::{CallResponse, Command};
use serde_json::Value;
use std::net::SocketAddr;

/// Application events
///
/// Every asynchronous outcome of the overlay ends up here, including
/// failures that only concern a single peer or operation.
#[derive(Debug, Clone, PartialEq)]
pub enum AppEvent {
    /// A peer appeared in the peer table
    PeerDiscovered {
        /// Peer username
        username: String,
        /// Address we will send to
        address: SocketAddr,
    },
    /// A peer stayed silent past the liveness timeout
    PeerLost {
        /// Peer username
        username: String,
    },
    /// A lookup or send could not resolve the peer
    PeerNotFound {
        /// Peer username
        username: String,
    },
    /// Both sides now share a session key
    SecureChannelEstablished {
        /// Peer username
        username: String,
    },
    /// The session key delivery ran out of retries
    SecureChannelFailed {
        /// Peer username
        username: String,
    },
    /// Private chat message
    MessageReceived {
        /// Sender username
        from: String,
        /// Message body as sent
        message: Value,
    },
    /// A peer retracted a message
    MessageDeleted {
        /// Sender username
        from: String,
        /// Message id
        id: String,
    },
    /// A peer edited a message
    MessageEdited {
        /// Sender username
        from: String,
        /// Message id
        id: String,
        /// Replacement text
        text: String,
    },
    /// Someone wants to be a contact
    IncomingContactRequest {
        /// Requesting username
        from: String,
    },
    /// Answer to our contact request
    ContactRequestResponse {
        /// Responding username
        from: String,
        /// Whether the request was accepted
        accepted: bool,
    },
    /// We created a group
    GroupCreated {
        /// The new group
        group: GroupRecord,
    },
    /// We became a member of a group
    GroupJoined {
        /// Group state as sent by the admin
        group: GroupRecord,
    },
    /// An admin invited us
    GroupInvite {
        /// Admin username
        from: String,
        /// Group id
        group_id: String,
        /// Display name
        group_name: String,
    },
    /// A peer answered our invite
    GroupInviteResponse {
        /// Invited username
        from: String,
        /// Group id
        group_id: String,
        /// Whether the invite was accepted
        accepted: bool,
    },
    /// Someone else joined a group we belong to
    UserJoinedGroup {
        /// Group id
        group_id: String,
        /// New member
        username: String,
    },
    /// Someone left a group we belong to
    UserLeftGroup {
        /// Group id
        group_id: String,
        /// Departed member
        username: String,
    },
    /// We left a group
    GroupLeft {
        /// Group id
        group_id: String,
    },
    /// Group chat message
    GroupMessageReceived {
        /// Group id
        group_id: String,
        /// Original author
        sender: String,
        /// Message body
        message: Value,
    },
    /// A member was kicked (possibly us)
    UserKicked {
        /// Group id
        group_id: String,
        /// Kicked member
        username: String,
    },
    /// A peer is calling us
    IncomingP2pCall {
        /// Caller
        from: String,
        /// Audio sample rate offered
        sample_rate: u32,
    },
    /// Answer to our call request
    P2pCallResponse {
        /// Callee
        from: String,
        /// Their answer
        response: CallResponse,
    },
    /// The other side hung up
    P2pHangUp {
        /// Peer username
        from: String,
    },
    /// Media may flow to this address
    CallConnected {
        /// Peer username
        peer: String,
        /// Punched address
        address: SocketAddr,
    },
    /// The call could not be set up
    CallFailed {
        /// Peer username
        peer: String,
        /// Human readable cause
        reason: String,
    },
    /// A group admin started a call
    IncomingGroupCall {
        /// Group id
        group_id: String,
        /// Admin username
        from: String,
        /// Audio sample rate offered
        sample_rate: u32,
    },
    /// A participant joined the group call
    GroupCallParticipantJoined {
        /// Group id
        group_id: String,
        /// Participant username
        participant: String,
    },
    /// A participant left the group call
    GroupCallParticipantLeft {
        /// Group id
        group_id: String,
        /// Participant username
        participant: String,
    },
    /// The group call is over for us
    GroupCallEnded {
        /// Group id
        group_id: String,
    },
    /// A SYN answer reached us
    HolePunchSuccessful {
        /// Peer username
        username: String,
        /// Address the ACK came from
        address: SocketAddr,
    },
    /// No SYN answer within the budget
    HolePunchFailed {
        /// Peer username
        username: String,
    },
    /// Stored messages from a peer
    HistoryReceived {
        /// Chat id
        chat_id: String,
        /// Messages, oldest first
        history: Vec<Value>,
    },
    /// A peer offers a file
    IncomingFileRequest {
        /// Sender
        from: String,
        /// File name
        filename: String,
        /// Size in bytes
        filesize: u64,
        /// Port the sender will serve from
        port: u16,
    },
    /// Answer to our file offer
    FileRequestResponse {
        /// Receiver
        from: String,
        /// Whether the offer was accepted
        accepted: bool,
    },
    /// WebRTC negotiation data for the media layer
    WebrtcSignal {
        /// Sender
        from: String,
        /// The payload as sent
        signal: Value,
    },
}

impl AppEvent {
    /// Stable event name for collaborators keyed by string
    pub fn name(&self) -> &'static str {
        match self {
            Self::PeerDiscovered { .. } => "peer_discovered",
            Self::PeerLost { .. } => "peer_lost",
            Self::PeerNotFound { .. } => "peer_not_found",
            Self::SecureChannelEstablished { .. } => "secure_channel_established",
            Self::SecureChannelFailed { .. } => "secure_channel_failed",
            Self::MessageReceived { .. } => "message_received",
            Self::MessageDeleted { .. } => "message_deleted",
            Self::MessageEdited { .. } => "message_edited",
            Self::IncomingContactRequest { .. } => "incoming_contact_request",
            Self::ContactRequestResponse { .. } => "contact_request_response",
            Self::GroupCreated { .. } => "group_created",
            Self::GroupJoined { .. } => "group_joined",
            Self::GroupInvite { .. } => "group_invite",
            Self::GroupInviteResponse { .. } => "group_invite_response",
            Self::UserJoinedGroup { .. } => "user_joined_group",
            Self::UserLeftGroup { .. } => "user_left_group",
            Self::GroupLeft { .. } => "group_left",
            Self::GroupMessageReceived { .. } => "group_message_received",
            Self::UserKicked { .. } => "user_kicked",
            Self::IncomingP2pCall { .. } => "incoming_p2p_call",
            Self::P2pCallResponse { .. } => "p2p_call_response",
            Self::P2pHangUp { .. } => "p2p_hang_up",
            Self::CallConnected { .. } => "call_connected",
            Self::CallFailed { .. } => "call_failed",
            Self::IncomingGroupCall { .. } => "incoming_group_call",
            Self::GroupCallParticipantJoined { .. } => "group_call_participant_joined",
            Self::GroupCallParticipantLeft { .. } => "group_call_participant_left",
            Self::GroupCallEnded { .. } => "group_call_ended",
            Self::HolePunchSuccessful { .. } => "hole_punch_successful",
            Self::HolePunchFailed { .. } => "hole_punch_failed",
            Self::HistoryReceived { .. } => "history_received",
            Self::IncomingFileRequest { .. } => "incoming_file_request",
            Self::FileRequestResponse { .. } => "file_request_response",
            Self::WebrtcSignal { .. } => "webrtc_signal",
        }
    }
}

/// What a state transition wants done
///
/// Group and call logic never touch the network. They return this list and
/// the node sends, emits and starts hole punches in order.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct Effects {
    /// Commands to send, by recipient username
    pub outbound: Vec<(String, Command)>,
    /// Events to publish
    pub events: Vec<AppEvent>,
    /// Peers to start a hole punch towards
    pub punch: Vec<String>,
}

impl Effects {
    /// No effects
    pub fn none() -> Self {
        Self::default()
    }

    /// Queue a command for `to`
    pub fn send(&mut self, to: impl Into<String>, command: Command) -> &mut Self {
        self.outbound.push((to.into(), command));
        self
    }

    /// Queue an event
    pub fn emit(&mut self, event: AppEvent) -> &mut Self {
        self.events.push(event);
        self
    }

    /// Queue a hole punch
    pub fn punch(&mut self, username: impl Into<String>) -> &mut Self {
        self.punch.push(username.into());
        self
    }

    /// Append another effect list
    pub fn extend(&mut self, other: Effects) {
        self.outbound.extend(other.outbound);
        self.events.extend(other.events);
        self.punch.extend(other.punch);
    }

    /// Whether nothing needs doing
    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty() && self.events.is_empty() && self.punch.is_empty()
    }

    /// Recipients of queued commands, in order
    pub fn recipients(&self) -> Vec<&str> {
        self.outbound.iter().map(|(to, _)| to.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_names() {
        let event = AppEvent::HolePunchSuccessful {
            username: "bob".to_string(),
            address: "127.0.0.1:1".parse().unwrap(),
        };
        assert_eq!(event.name(), "hole_punch_successful");
        assert_eq!(
            AppEvent::PeerNotFound {
                username: "x".to_string()
            }
            .name(),
            "peer_not_found"
        );
    }

    #[test]
    fn test_effects_accumulate_in_order() {
        let mut effects = Effects::none();
        assert!(effects.is_empty());

        effects
            .send("bob", Command::P2pHangUp)
            .send("carol", Command::HolePunchSyn)
            .punch("bob");

        let mut more = Effects::none();
        more.emit(AppEvent::PeerLost {
            username: "dave".to_string(),
        });
        effects.extend(more);

        assert_eq!(effects.recipients(), vec!["bob", "carol"]);
        assert_eq!(effects.punch, vec!["bob".to_string()]);
        assert_eq!(effects.events.len(), 1);
    }
}
