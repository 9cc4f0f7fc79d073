//! Error types and handling for the overlay messenger.
//!
//! Every failure in the overlay narrows to "this one peer or operation
//! failed". The variants here let callers tell a dropped datagram from an
//! unreachable peer or a handshake that never completed.

use thiserror::Error;

/// Result type alias for the messenger library
pub type Result<T> = std::result::Result<T, MessengerError>;

/// Comprehensive error type for all messenger operations
#[derive(Error, Debug, Clone)]
pub enum MessengerError {
    /// Cryptographic operation errors
    #[error("Cryptographic error: {0}")]
    Crypto(#[from] CryptoError),

    /// Network and transport layer errors
    #[error("Network error: {0}")]
    Network(#[from] NetworkError),

    /// Secure channel errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Configuration and I/O errors
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Protocol-level errors
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Group membership errors
    #[error("Group error: {0}")]
    Group(#[from] GroupError),

    /// Call signaling errors
    #[error("Call error: {0}")]
    Call(#[from] CallError),

    /// Generic I/O errors
    #[error("I/O error: {0}")]
    Io(String),

    /// JSON serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Base64 encoding/decoding errors
    #[error("Base64 error: {0}")]
    Base64(#[from] base64::DecodeError),

    /// Generic error for unexpected conditions
    #[error("Unexpected error: {0}")]
    Unexpected(String),
}

/// Cryptographic operation errors
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid key format or size
    #[error("Invalid key: {reason}")]
    InvalidKey { reason: String },

    /// Key generation failure
    #[error("Key generation failed: {reason}")]
    KeyGeneration { reason: String },

    /// Encryption operation failure
    #[error("Encryption failed: {reason}")]
    Encryption { reason: String },

    /// Decryption operation failure
    #[error("Decryption failed: {reason}")]
    Decryption { reason: String },
}

/// Network and transport layer errors
#[derive(Error, Debug, Clone)]
pub enum NetworkError {
    /// Socket could not be bound
    #[error("Bind failed: {reason}")]
    BindFailed { reason: String },

    /// Network transport error
    #[error("Transport error: {reason}")]
    Transport { reason: String },

    /// Peer not found in the peer table
    #[error("Peer not found: {username}")]
    PeerNotFound { username: String },

    /// STUN exchange failure
    #[error("STUN failed: {reason}")]
    Stun { reason: String },

    /// DHT operation failure
    #[error("DHT operation failed: {operation}: {reason}")]
    DhtFailure { operation: String, reason: String },

    /// The node has been stopped
    #[error("Node stopped")]
    Stopped,
}

/// Secure channel errors
#[derive(Error, Debug, Clone)]
pub enum SessionError {
    /// No public key known for the peer yet
    #[error("No public key for {username}")]
    MissingPublicKey { username: String },

    /// No session key established with the peer
    #[error("No secure channel with {username}")]
    NoSecureChannel { username: String },

    /// Session key delivery ran out of retries
    #[error("Handshake {handshake_id} with {username} timed out")]
    HandshakeTimeout {
        username: String,
        handshake_id: String,
    },

    /// A session key arrived from the side that must not initiate
    #[error("Unexpected session key initiator: {username}")]
    UnexpectedInitiator { username: String },
}

/// Configuration and setup errors
#[derive(Error, Debug, Clone)]
pub enum ConfigError {
    /// Missing required configuration
    #[error("Missing configuration: {field}")]
    MissingField { field: String },

    /// Invalid configuration value
    #[error("Invalid configuration value for {field}: {value}")]
    InvalidValue { field: String, value: String },

    /// Configuration file not found
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// Configuration parsing error
    #[error("Configuration parse error: {reason}")]
    ParseError { reason: String },

    /// TOML parsing error
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),
}

/// Protocol-level errors
#[derive(Error, Debug, Clone)]
pub enum ProtocolError {
    /// Invalid message format
    #[error("Invalid message format: {reason}")]
    InvalidMessage { reason: String },

    /// Datagram could not be decompressed
    #[error("Decompression failed: {reason}")]
    Decompression { reason: String },

    /// Message too large
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    /// Command not allowed in this context
    #[error("Command {command} not allowed: {reason}")]
    NotAllowed { command: String, reason: String },

    /// Missing required message field
    #[error("Missing required field: {field}")]
    MissingField { field: String },
}

/// Group membership errors
#[derive(Error, Debug, Clone)]
pub enum GroupError {
    /// Group unknown locally
    #[error("Group not found: {group_id}")]
    NotFound { group_id: String },

    /// Group id already in use locally
    #[error("Group already exists: {group_id}")]
    AlreadyExists { group_id: String },

    /// Operation reserved to the group admin
    #[error("Only the admin of {group_id} can do that")]
    NotAdmin { group_id: String },

    /// Admin tried to leave or kick itself
    #[error("The admin cannot leave group {group_id}")]
    AdminCannotLeave { group_id: String },

    /// No invitation recorded for the group
    #[error("No pending invite for group {group_id}")]
    NoPendingInvite { group_id: String },

    /// Target is not a member
    #[error("{username} is not a member of {group_id}")]
    NotMember { group_id: String, username: String },
}

/// Call signaling errors
#[derive(Error, Debug, Clone)]
pub enum CallError {
    /// A call is already in progress
    #[error("Already in a call")]
    Busy,

    /// Nothing to hang up
    #[error("No active call")]
    NoActiveCall,

    /// Answer requested while no call is ringing
    #[error("No incoming call to answer")]
    NotRinging,

    /// No group call invitation for the group
    #[error("No group call invitation for {group_id}")]
    NoInvitation { group_id: String },
}

impl MessengerError {
    /// Creates a new unexpected error with a custom message
    pub fn unexpected<S: Into<String>>(msg: S) -> Self {
        Self::Unexpected(msg.into())
    }

    /// Returns true if this error is recoverable
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::Network(
                NetworkError::PeerNotFound { .. } | NetworkError::Stun { .. } | NetworkError::DhtFailure { .. }
            ) | Self::Session(
                SessionError::HandshakeTimeout { .. } | SessionError::NoSecureChannel { .. }
            ) | Self::Protocol(_)
        )
    }

    /// Returns true if this error indicates a security violation
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::Crypto(CryptoError::Decryption { .. })
                | Self::Session(SessionError::UnexpectedInitiator { .. })
        )
    }

    /// Returns true if the error is a missing peer
    pub fn is_peer_not_found(&self) -> bool {
        matches!(self, Self::Network(NetworkError::PeerNotFound { .. }))
    }
}

impl From<std::io::Error> for MessengerError {
    fn from(err: std::io::Error) -> Self {
        Self::Io(err.to_string())
    }
}

impl From<serde_json::Error> for MessengerError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

impl From<bincode::Error> for MessengerError {
    fn from(err: bincode::Error) -> Self {
        Self::Protocol(ProtocolError::InvalidMessage {
            reason: err.to_string(),
        })
    }
}

impl From<rsa::Error> for MessengerError {
    fn from(err: rsa::Error) -> Self {
        Self::Crypto(CryptoError::Decryption {
            reason: err.to_string(),
        })
    }
}
