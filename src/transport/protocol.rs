//! Command envelope definitions and serialization.
//!
//! A datagram is a zlib-compressed bincode [`Frame`]: the command name, the
//! sender's username and the payload bytes. Payloads are the JSON form of
//! the command's payload struct, except `encrypted_message`, whose payload is
//! the raw `iv || ciphertext` of another (uncompressed) frame.
//!
//! Decoding goes through the command name. Names this build does not know
//! become [`Command::Unrecognized`] so newer peers do not break older ones.

use crate::groups::GroupRecord;
use crate::utils::{ProtocolError, Result};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::io::{Read, Write};

/// Upper bound on a decompressed frame
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// The unit of wire transmission
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Frame {
    /// Command name, e.g. `discovery`
    pub command: String,
    /// Sender username
    pub username: String,
    /// Command payload
    #[serde(with = "serde_bytes")]
    pub payload: Vec<u8>,
}

/// `discovery` and `contact_request` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortAnnouncement {
    /// Port the sender listens on
    pub port: u16,
}

/// `public_key` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PublicKeyOffer {
    /// PEM-encoded RSA public key
    pub key: String,
    /// Ask the receiver to answer with its own key
    pub request: bool,
}

/// `session_key` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyOffer {
    /// Base64 of the RSA-OAEP wrapped AES key
    pub key: String,
    /// Identifies this delivery attempt
    pub handshake_id: String,
}

/// `session_key_ack` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionKeyAck {
    /// Handshake being acknowledged
    pub handshake_id: String,
}

/// `delete_message` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeleteMessage {
    /// Message id
    pub id: String,
}

/// `edit_message` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EditMessage {
    /// Message id
    pub id: String,
    /// Replacement text
    pub text: String,
}

/// `contact_response` and `file_transfer_response` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Verdict {
    /// Whether the request was accepted
    pub accepted: bool,
}

/// Payload naming a single group
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupRef {
    /// Group id
    pub group_id: String,
}

/// `user_left_group` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupMemberRef {
    /// Group id
    pub group_id: String,
    /// Member concerned
    pub username: String,
}

/// `group_invite` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInvite {
    /// Group id
    pub group_id: String,
    /// Display name
    pub group_name: String,
}

/// `group_invite_response` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupInviteResponse {
    /// Group id
    pub group_id: String,
    /// Accept or decline
    pub accepted: bool,
}

/// `user_joined_group` payload.
///
/// Existing members get `username`; the newcomer gets `group_info`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserJoinedGroup {
    /// Group id
    pub group_id: String,
    /// The new member (existing-member form)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Full group state (newcomer form)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_info: Option<GroupRecord>,
}

/// `group_message` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupMessage {
    /// Group id
    pub group_id: String,
    /// Original author; the admin relays on their behalf
    pub sender: String,
    /// Application message body
    pub message_data: serde_json::Value,
}

/// `group_kick` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupKick {
    /// Group id
    pub group_id: String,
    /// Member being removed
    pub kicked_user: String,
    /// Admin issuing the kick
    pub admin: String,
}

/// Answer to a call offer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CallResponse {
    /// Callee picks up
    Accept,
    /// Callee declines
    Reject,
    /// Callee is already in a call
    Busy,
}

/// `p2p_call_request` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallOffer {
    /// Audio sample rate in Hz
    pub sample_rate: u32,
}

/// `p2p_call_response` payload
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAnswer {
    /// The answer
    pub response: CallResponse,
}

/// `group_call_request` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCallOffer {
    /// Group id
    pub group_id: String,
    /// Audio sample rate in Hz
    pub sample_rate: u32,
}

/// `group_call_response` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCallAnswer {
    /// Group id
    pub group_id: String,
    /// Participant the answer is about
    pub participant: String,
    /// The answer
    pub response: CallResponse,
}

/// `group_call_hang_up` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GroupCallHangUp {
    /// Group id
    pub group_id: String,
    /// Participant leaving
    pub participant: String,
}

/// `request_history` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRequest {
    /// Conversation id, `global` for the shared chat
    pub chat_id: String,
}

/// `history_response` payload
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryResponse {
    /// Conversation id
    pub chat_id: String,
    /// Stored messages, oldest first
    pub history: Vec<serde_json::Value>,
}

/// `file_transfer_request` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileOffer {
    /// File name
    pub filename: String,
    /// Size in bytes
    pub filesize: u64,
    /// Port the sender serves the file on
    pub port: u16,
}

#[derive(Serialize, Deserialize)]
struct Empty {}

/// Every command the overlay understands
#[derive(Debug, Clone, PartialEq)]
pub enum Command {
    /// LAN presence beacon
    Discovery(PortAnnouncement),
    /// RSA public key exchange
    PublicKey(PublicKeyOffer),
    /// Wrapped AES session key
    SessionKey(SessionKeyOffer),
    /// Session key receipt
    SessionKeyAck(SessionKeyAck),
    /// `iv || ciphertext` of an inner frame
    EncryptedMessage(Vec<u8>),
    /// Private chat message
    Message(serde_json::Value),
    /// Retract a message
    DeleteMessage(DeleteMessage),
    /// Replace a message's text
    EditMessage(EditMessage),
    /// Hole punch SYN
    HolePunchSyn,
    /// Hole punch SYN answer
    HolePunchAck,
    /// Ask to be added as a contact
    ContactRequest(PortAnnouncement),
    /// Answer to a contact request
    ContactResponse(Verdict),
    /// Ask the admin to join
    JoinGroup(GroupRef),
    /// Tell the admin we leave
    LeaveGroup(GroupRef),
    /// Admin fan-out after a departure
    UserLeftGroup(GroupMemberRef),
    /// Admin invites us
    GroupInvite(GroupInvite),
    /// Answer to an invite
    GroupInviteResponse(GroupInviteResponse),
    /// Admin fan-out after an admission
    UserJoinedGroup(UserJoinedGroup),
    /// Group chat, relayed by the admin
    GroupMessage(GroupMessage),
    /// Admin removes a member
    GroupKick(GroupKick),
    /// 1:1 call offer
    P2pCallRequest(CallOffer),
    /// 1:1 call answer
    P2pCallResponse(CallAnswer),
    /// 1:1 call end
    P2pHangUp,
    /// Group call invitation
    GroupCallRequest(GroupCallOffer),
    /// Group call answer or participant notice
    GroupCallResponse(GroupCallAnswer),
    /// Group call departure
    GroupCallHangUp(GroupCallHangUp),
    /// Ask for stored messages
    RequestHistory(HistoryRequest),
    /// Stored messages
    HistoryResponse(HistoryResponse),
    /// File transfer offer
    FileTransferRequest(FileOffer),
    /// File transfer answer
    FileTransferResponse(Verdict),
    /// Opaque WebRTC negotiation payload (offer, answer, ICE candidate)
    WebrtcSignal(serde_json::Value),
    /// A command name this build does not know
    Unrecognized {
        /// The name as received
        name: String,
    },
}

fn json<T: DeserializeOwned>(command: &str, payload: &[u8]) -> Result<T> {
    serde_json::from_slice(payload).map_err(|e| {
        ProtocolError::InvalidMessage {
            reason: format!("{command}: {e}"),
        }
        .into()
    })
}

impl Command {
    /// Wire name of the command
    pub fn name(&self) -> &str {
        match self {
            Self::Discovery(_) => "discovery",
            Self::PublicKey(_) => "public_key",
            Self::SessionKey(_) => "session_key",
            Self::SessionKeyAck(_) => "session_key_ack",
            Self::EncryptedMessage(_) => "encrypted_message",
            Self::Message(_) => "message",
            Self::DeleteMessage(_) => "delete_message",
            Self::EditMessage(_) => "edit_message",
            Self::HolePunchSyn => "hole_punch_syn",
            Self::HolePunchAck => "hole_punch_ack",
            Self::ContactRequest(_) => "contact_request",
            Self::ContactResponse(_) => "contact_response",
            Self::JoinGroup(_) => "join_group",
            Self::LeaveGroup(_) => "leave_group",
            Self::UserLeftGroup(_) => "user_left_group",
            Self::GroupInvite(_) => "group_invite",
            Self::GroupInviteResponse(_) => "group_invite_response",
            Self::UserJoinedGroup(_) => "user_joined_group",
            Self::GroupMessage(_) => "group_message",
            Self::GroupKick(_) => "group_kick",
            Self::P2pCallRequest(_) => "p2p_call_request",
            Self::P2pCallResponse(_) => "p2p_call_response",
            Self::P2pHangUp => "p2p_hang_up",
            Self::GroupCallRequest(_) => "group_call_request",
            Self::GroupCallResponse(_) => "group_call_response",
            Self::GroupCallHangUp(_) => "group_call_hang_up",
            Self::RequestHistory(_) => "request_history",
            Self::HistoryResponse(_) => "history_response",
            Self::FileTransferRequest(_) => "file_transfer_request",
            Self::FileTransferResponse(_) => "file_transfer_response",
            Self::WebrtcSignal(_) => "webrtc_signal",
            Self::Unrecognized { name } => name,
        }
    }

    /// Commands accepted without a secure channel.
    ///
    /// Everything else must arrive inside an `encrypted_message`.
    pub fn is_control_plane(&self) -> bool {
        matches!(
            self,
            Self::Discovery(_)
                | Self::PublicKey(_)
                | Self::SessionKey(_)
                | Self::SessionKeyAck(_)
                | Self::EncryptedMessage(_)
                | Self::HolePunchSyn
                | Self::HolePunchAck
                | Self::ContactRequest(_)
                | Self::ContactResponse(_)
        )
    }

    /// Serialize the payload
    pub fn encode_payload(&self) -> Result<Vec<u8>> {
        let bytes = match self {
            Self::Discovery(p) | Self::ContactRequest(p) => serde_json::to_vec(p)?,
            Self::PublicKey(p) => serde_json::to_vec(p)?,
            Self::SessionKey(p) => serde_json::to_vec(p)?,
            Self::SessionKeyAck(p) => serde_json::to_vec(p)?,
            Self::EncryptedMessage(sealed) => sealed.clone(),
            Self::Message(body) | Self::WebrtcSignal(body) => serde_json::to_vec(body)?,
            Self::DeleteMessage(p) => serde_json::to_vec(p)?,
            Self::EditMessage(p) => serde_json::to_vec(p)?,
            Self::ContactResponse(p) | Self::FileTransferResponse(p) => serde_json::to_vec(p)?,
            Self::JoinGroup(p) | Self::LeaveGroup(p) => serde_json::to_vec(p)?,
            Self::UserLeftGroup(p) => serde_json::to_vec(p)?,
            Self::GroupInvite(p) => serde_json::to_vec(p)?,
            Self::GroupInviteResponse(p) => serde_json::to_vec(p)?,
            Self::UserJoinedGroup(p) => serde_json::to_vec(p)?,
            Self::GroupMessage(p) => serde_json::to_vec(p)?,
            Self::GroupKick(p) => serde_json::to_vec(p)?,
            Self::P2pCallRequest(p) => serde_json::to_vec(p)?,
            Self::P2pCallResponse(p) => serde_json::to_vec(p)?,
            Self::GroupCallRequest(p) => serde_json::to_vec(p)?,
            Self::GroupCallResponse(p) => serde_json::to_vec(p)?,
            Self::GroupCallHangUp(p) => serde_json::to_vec(p)?,
            Self::RequestHistory(p) => serde_json::to_vec(p)?,
            Self::HistoryResponse(p) => serde_json::to_vec(p)?,
            Self::FileTransferRequest(p) => serde_json::to_vec(p)?,
            Self::HolePunchSyn | Self::HolePunchAck | Self::P2pHangUp => {
                serde_json::to_vec(&Empty {})?
            }
            Self::Unrecognized { name } => {
                return Err(ProtocolError::NotAllowed {
                    command: name.clone(),
                    reason: "unrecognized commands cannot be sent".to_string(),
                }
                .into())
            }
        };
        Ok(bytes)
    }

    /// Decode a payload by command name
    ///
    /// # Errors
    ///
    /// Returns `ProtocolError::InvalidMessage` when a known command carries
    /// a payload of the wrong shape
    pub fn decode(name: &str, payload: &[u8]) -> Result<Self> {
        let command = match name {
            "discovery" => Self::Discovery(json(name, payload)?),
            "public_key" => Self::PublicKey(json(name, payload)?),
            "session_key" => Self::SessionKey(json(name, payload)?),
            "session_key_ack" => Self::SessionKeyAck(json(name, payload)?),
            "encrypted_message" => Self::EncryptedMessage(payload.to_vec()),
            "message" => Self::Message(json(name, payload)?),
            "delete_message" => Self::DeleteMessage(json(name, payload)?),
            "edit_message" => Self::EditMessage(json(name, payload)?),
            "hole_punch_syn" => Self::HolePunchSyn,
            "hole_punch_ack" => Self::HolePunchAck,
            "contact_request" => Self::ContactRequest(json(name, payload)?),
            "contact_response" => Self::ContactResponse(json(name, payload)?),
            "join_group" => Self::JoinGroup(json(name, payload)?),
            "leave_group" => Self::LeaveGroup(json(name, payload)?),
            "user_left_group" => Self::UserLeftGroup(json(name, payload)?),
            "group_invite" => Self::GroupInvite(json(name, payload)?),
            "group_invite_response" => Self::GroupInviteResponse(json(name, payload)?),
            "user_joined_group" => Self::UserJoinedGroup(json(name, payload)?),
            "group_message" => Self::GroupMessage(json(name, payload)?),
            "group_kick" => Self::GroupKick(json(name, payload)?),
            "p2p_call_request" => Self::P2pCallRequest(json(name, payload)?),
            "p2p_call_response" => Self::P2pCallResponse(json(name, payload)?),
            "p2p_hang_up" => Self::P2pHangUp,
            "group_call_request" => Self::GroupCallRequest(json(name, payload)?),
            "group_call_response" => Self::GroupCallResponse(json(name, payload)?),
            "group_call_hang_up" => Self::GroupCallHangUp(json(name, payload)?),
            "request_history" => Self::RequestHistory(json(name, payload)?),
            "history_response" => Self::HistoryResponse(json(name, payload)?),
            "file_transfer_request" => Self::FileTransferRequest(json(name, payload)?),
            "file_transfer_response" => Self::FileTransferResponse(json(name, payload)?),
            "webrtc_signal" => Self::WebrtcSignal(json(name, payload)?),
            other => Self::Unrecognized {
                name: other.to_string(),
            },
        };
        Ok(command)
    }
}

impl Frame {
    /// Build a frame for `command` sent by `username`
    pub fn new(username: impl Into<String>, command: &Command) -> Result<Self> {
        Ok(Self {
            command: command.name().to_string(),
            username: username.into(),
            payload: command.encode_payload()?,
        })
    }

    /// Decode the typed command carried by this frame
    pub fn command(&self) -> Result<Command> {
        Command::decode(&self.command, &self.payload)
    }

    /// Serialize frame to bytes (uncompressed; used inside encryption)
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let serialized = bincode::serialize(self)?;

        if serialized.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: serialized.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        Ok(serialized)
    }

    /// Deserialize frame from bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() > MAX_FRAME_SIZE {
            return Err(ProtocolError::MessageTooLarge {
                size: bytes.len(),
                max: MAX_FRAME_SIZE,
            }
            .into());
        }

        let frame: Self = bincode::deserialize(bytes)?;

        if frame.username.is_empty() {
            return Err(ProtocolError::MissingField {
                field: "username".to_string(),
            }
            .into());
        }

        Ok(frame)
    }
}

/// Compress a frame into a datagram
pub fn encode_datagram(frame: &Frame) -> Result<Vec<u8>> {
    let raw = frame.to_bytes()?;
    let mut encoder = ZlibEncoder::new(Vec::with_capacity(raw.len() / 2), Compression::default());
    encoder.write_all(&raw)?;
    Ok(encoder.finish()?)
}

/// Decompress and parse a datagram
///
/// # Errors
///
/// Returns `ProtocolError::Decompression` for corrupt or oversized input and
/// `ProtocolError::InvalidMessage` if the frame does not parse
pub fn decode_datagram(datagram: &[u8]) -> Result<Frame> {
    let mut raw = Vec::new();
    ZlibDecoder::new(datagram)
        .take(MAX_FRAME_SIZE as u64 + 1)
        .read_to_end(&mut raw)
        .map_err(|e| ProtocolError::Decompression {
            reason: e.to_string(),
        })?;

    if raw.len() > MAX_FRAME_SIZE {
        return Err(ProtocolError::Decompression {
            reason: format!("inflated past {MAX_FRAME_SIZE} bytes"),
        }
        .into());
    }

    Frame::from_bytes(&raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_datagram_roundtrip() {
        let command = Command::Message(json!({"text": "hi", "id": "m1"}));
        let frame = Frame::new("alice", &command).unwrap();

        let datagram = encode_datagram(&frame).unwrap();
        let decoded = decode_datagram(&datagram).unwrap();

        assert_eq!(decoded.username, "alice");
        assert_eq!(decoded.command().unwrap(), command);
    }

    #[test]
    fn test_payload_is_json_map() {
        let frame = Frame::new(
            "bob",
            &Command::GroupKick(GroupKick {
                group_id: "g1".to_string(),
                kicked_user: "carol".to_string(),
                admin: "bob".to_string(),
            }),
        )
        .unwrap();

        let value: serde_json::Value = serde_json::from_slice(&frame.payload).unwrap();
        assert_eq!(value["kicked_user"], "carol");
        assert_eq!(frame.command, "group_kick");
    }

    #[test]
    fn test_unknown_command_is_unrecognized() {
        let frame = Frame {
            command: "teleport".to_string(),
            username: "alice".to_string(),
            payload: b"{}".to_vec(),
        };
        let command = frame.command().unwrap();
        assert_eq!(
            command,
            Command::Unrecognized {
                name: "teleport".to_string()
            }
        );
        assert_eq!(command.name(), "teleport");
        assert!(Command::encode_payload(&command).is_err());
    }

    #[test]
    fn test_webrtc_signal_passes_through_encrypted() {
        let signal = json!({"type": "offer", "sdp": "v=0\r\no=- 1 2 IN IP4 127.0.0.1"});
        let command = Command::WebrtcSignal(signal.clone());
        assert_eq!(command.name(), "webrtc_signal");
        assert!(!command.is_control_plane());

        let frame = Frame::new("alice", &command).unwrap();
        assert_eq!(serde_json::from_slice::<serde_json::Value>(&frame.payload).unwrap(), signal);
        assert_eq!(frame.command().unwrap(), Command::WebrtcSignal(signal));
    }

    #[test]
    fn test_missing_field_is_rejected() {
        let frame = Frame {
            command: "session_key".to_string(),
            username: "alice".to_string(),
            payload: br#"{"key":"abc"}"#.to_vec(),
        };
        assert!(frame.command().is_err());
    }

    #[test]
    fn test_corrupt_datagrams() {
        assert!(decode_datagram(b"").is_err());
        assert!(decode_datagram(b"definitely not zlib").is_err());

        let frame = Frame::new("alice", &Command::HolePunchSyn).unwrap();
        let mut datagram = encode_datagram(&frame).unwrap();
        datagram.truncate(datagram.len() / 2);
        assert!(decode_datagram(&datagram).is_err());
    }

    #[test]
    fn test_decompression_bomb_is_capped() {
        let huge = vec![0u8; MAX_FRAME_SIZE * 2];
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::best());
        encoder.write_all(&huge).unwrap();
        let bomb = encoder.finish().unwrap();

        let err = decode_datagram(&bomb).unwrap_err();
        assert!(matches!(
            err,
            crate::MessengerError::Protocol(ProtocolError::Decompression { .. })
        ));
    }

    #[test]
    fn test_control_plane_split() {
        assert!(Command::HolePunchSyn.is_control_plane());
        assert!(Command::EncryptedMessage(vec![1, 2, 3]).is_control_plane());
        assert!(!Command::Message(json!({})).is_control_plane());
        assert!(!Command::P2pHangUp.is_control_plane());
    }

    #[test]
    fn test_call_response_wire_names() {
        let answer = Command::P2pCallResponse(CallAnswer {
            response: CallResponse::Busy,
        });
        let payload = answer.encode_payload().unwrap();
        assert_eq!(payload, br#"{"response":"busy"}"#);
    }

    #[test]
    fn test_joined_group_forms() {
        let notice = UserJoinedGroup {
            group_id: "g1".to_string(),
            username: Some("bob".to_string()),
            group_info: None,
        };
        let payload = serde_json::to_value(&notice).unwrap();
        assert!(payload.get("group_info").is_none());
    }
}
