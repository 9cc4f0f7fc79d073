//! Transport layer for overlay messaging.
//!
//! This module provides the wire protocol and the UDP socket every other
//! component sends through.

pub mod protocol;
pub mod udp;

pub use protocol::*;
pub use udp::{Transport, TransportStats};
