//! Session management for the secure channel.
//!
//! This module tracks which peers share an AES session key, which key
//! deliveries are still waiting for an acknowledgment, and who is allowed to
//! originate a key.

pub mod manager;

pub use manager::*;
