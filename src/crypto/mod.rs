//! Cryptographic primitives and identity management.
//!
//! RSA identities carry session keys between peers; AES-256-CBC protects
//! everything sent after the secure channel exists.

pub mod cipher;
pub mod identity;

pub use cipher::*;
pub use identity::*;
