//! Network layer for peer discovery and connectivity.
//!
//! This module covers everything that decides *where* to send: the peer
//! table, the LAN beacon, STUN, the rendezvous directory and hole punching.

pub mod directory;
pub mod discovery;
pub mod hole_punch;
pub mod peers;
pub mod stun;

pub use directory::{DirectoryHandle, DirectoryRecord, MemoryDirectory};
pub use discovery::{local_ip, DiscoveryBeacon};
pub use hole_punch::{HolePunchCoordinator, PunchPlan, PunchState};
pub use peers::{PeerAddress, PeerRecord, PeerTable};
pub use stun::StunClient;
