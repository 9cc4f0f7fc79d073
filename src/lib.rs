//! # Overlay Messenger
//!
//! A serverless peer-to-peer messenger over a single UDP socket.
//!
//! ## Features
//!
//! - **LAN Discovery**: Periodic broadcast beacons on a fixed port range
//! - **Internet Rendezvous**: STUN for the public address, a Kademlia DHT
//!   mapping usernames to addresses
//! - **NAT Traversal**: UDP hole punching with SYN/ACK exchanges
//! - **Secure Channels**: RSA-OAEP key transport and AES-256-CBC per peer
//! - **Groups and Calls**: Admin-relayed groups, 1:1 and group call signaling
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use overlay_messenger::{App, AppEvent, MessengerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let mut config = MessengerConfig::default();
//!     config.identity.username = "alice".to_string();
//!
//!     let (app, mut events) = App::start(config).await?;
//!     while let Some(event) = events.recv().await {
//!         if let AppEvent::SecureChannelEstablished { username } = event {
//!             app.send_private_message(&username, serde_json::json!({"text": "hi"})).await?;
//!         }
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - [`transport`]: UDP socket, wire frames and the command vocabulary
//! - [`network`]: Peer table, LAN beacon, STUN, DHT directory, hole punching
//! - [`crypto`]: RSA identities and the AES channel cipher
//! - [`session`]: Secure channel handshake per peer
//! - [`groups`]: Admin-relayed group membership
//! - [`calls`]: 1:1 and group call signaling
//! - [`app`]: The node tying it together, inbound routing and outbound API
//! - [`utils`]: Configuration and error handling

#![warn(missing_docs)]
#![deny(unsafe_code)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(clippy::cargo)]
#![allow(clippy::module_name_repetitions)]

pub mod app;
pub mod calls;
pub mod crypto;
pub mod groups;
pub mod network;
pub mod session;
pub mod transport;
pub mod utils;

// Re-export commonly used types for convenience
pub use app::{App, AppEvent, AppStats};
pub use calls::{CallManager, CallState};
pub use crypto::{IdentityKeyPair, PeerPublicKey};
pub use groups::{GroupDirectory, GroupRecord};
pub use network::{MemoryDirectory, PeerRecord};
pub use session::SessionManager;
pub use transport::{Command, Frame};
pub use utils::{MessengerConfig, MessengerError, Result};

/// Default configuration values
pub mod defaults {
    /// RSA modulus size for identities
    pub const RSA_KEY_BITS: usize = 2048;

    /// First port of the local-mode range
    pub const BASE_PORT: u16 = 12346;

    /// Number of ports in the local-mode range
    pub const PORT_RANGE: u16 = 50;

    /// Largest UDP payload accepted
    pub const MAX_DATAGRAM_SIZE: usize = 65507;

    /// Public STUN server
    pub const STUN_SERVER: &str = "stun.l.google.com:19302";
}
