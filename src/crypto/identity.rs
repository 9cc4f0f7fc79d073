//! Identity management and RSA operations.
//!
//! Each node owns one RSA key pair for the lifetime of the process. The public
//! half travels as PEM (SubjectPublicKeyInfo) in `public_key` commands and is
//! used by the peer to wrap the AES session key with OAEP/SHA-256.

use crate::utils::{CryptoError, Result};
use rand::rngs::OsRng;
use rsa::pkcs8::{DecodePublicKey, EncodePublicKey, LineEnding};
use rsa::traits::PublicKeyParts;
use rsa::{Oaep, RsaPrivateKey, RsaPublicKey};
use sha2::{Digest, Sha256};
use std::fmt;

/// RSA key pair for session key transport
#[derive(Clone)]
pub struct IdentityKeyPair {
    private_key: RsaPrivateKey,
    public_key: PeerPublicKey,
}

impl IdentityKeyPair {
    /// Generate a new random key pair
    ///
    /// This is CPU heavy (hundreds of milliseconds for 2048 bits); async
    /// callers should run it on a blocking thread.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::KeyGeneration` if the RSA backend fails
    pub fn generate(bits: usize) -> Result<Self> {
        let private_key =
            RsaPrivateKey::new(&mut OsRng, bits).map_err(|e| CryptoError::KeyGeneration {
                reason: e.to_string(),
            })?;
        let public_key = PeerPublicKey::from_key(private_key.to_public_key())?;

        Ok(Self {
            private_key,
            public_key,
        })
    }

    /// Our public key, as sent to peers
    pub fn public_key(&self) -> &PeerPublicKey {
        &self.public_key
    }

    /// PEM encoding of our public key
    pub fn public_key_pem(&self) -> &str {
        self.public_key.pem()
    }

    /// Unwrap bytes that a peer encrypted to our public key
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` on padding or length errors
    pub fn decrypt(&self, ciphertext: &[u8]) -> Result<Vec<u8>> {
        self.private_key
            .decrypt(Oaep::new::<Sha256>(), ciphertext)
            .map_err(|e| {
                CryptoError::Decryption {
                    reason: e.to_string(),
                }
                .into()
            })
    }
}

impl fmt::Debug for IdentityKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentityKeyPair")
            .field("public_key", &self.public_key)
            .finish_non_exhaustive()
    }
}

/// A peer's RSA public key together with the PEM it arrived as
#[derive(Clone)]
pub struct PeerPublicKey {
    key: RsaPublicKey,
    pem: String,
}

impl PeerPublicKey {
    fn from_key(key: RsaPublicKey) -> Result<Self> {
        let pem = key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidKey {
                reason: e.to_string(),
            })?;
        Ok(Self { key, pem })
    }

    /// Parse a PEM-encoded SubjectPublicKeyInfo
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if the PEM is not an RSA public key
    pub fn from_pem(pem: &str) -> Result<Self> {
        let key = RsaPublicKey::from_public_key_pem(pem).map_err(|e| CryptoError::InvalidKey {
            reason: e.to_string(),
        })?;
        Ok(Self {
            key,
            pem: pem.to_string(),
        })
    }

    /// The PEM text
    pub fn pem(&self) -> &str {
        &self.pem
    }

    /// Modulus size in bits
    pub fn bits(&self) -> usize {
        self.key.size() * 8
    }

    /// Encrypt a short secret (a session key) with OAEP/SHA-256
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        self.key
            .encrypt(&mut OsRng, Oaep::new::<Sha256>(), plaintext)
            .map_err(|e| {
                CryptoError::Encryption {
                    reason: e.to_string(),
                }
                .into()
            })
    }

    /// First 8 bytes of SHA-256 over the PEM, hex encoded
    pub fn fingerprint(&self) -> String {
        let digest = Sha256::digest(self.pem.trim().as_bytes());
        hex::encode(&digest[..8])
    }

    /// Whether two keys are the same key, ignoring PEM whitespace
    pub fn same_key(&self, other: &Self) -> bool {
        self.key == other.key
    }
}

impl fmt::Debug for PeerPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PeerPublicKey({})", self.fingerprint())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TEST_BITS: usize = 1024;

    #[test]
    fn test_keypair_generation() {
        let keypair = IdentityKeyPair::generate(TEST_BITS).unwrap();
        assert_eq!(keypair.public_key().bits(), TEST_BITS);
        assert!(keypair.public_key_pem().starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_pem_roundtrip() {
        let keypair = IdentityKeyPair::generate(TEST_BITS).unwrap();
        let parsed = PeerPublicKey::from_pem(keypair.public_key_pem()).unwrap();

        assert!(parsed.same_key(keypair.public_key()));
        assert_eq!(parsed.fingerprint(), keypair.public_key().fingerprint());
    }

    #[test]
    fn test_wrap_and_unwrap_session_key() {
        let receiver = IdentityKeyPair::generate(TEST_BITS).unwrap();
        let secret = [7u8; 32];

        let wrapped = receiver.public_key().encrypt(&secret).unwrap();
        assert_ne!(wrapped.as_slice(), secret.as_slice());
        assert_eq!(receiver.decrypt(&wrapped).unwrap(), secret);
    }

    #[test]
    fn test_unwrap_with_wrong_key_fails() {
        let receiver = IdentityKeyPair::generate(TEST_BITS).unwrap();
        let stranger = IdentityKeyPair::generate(TEST_BITS).unwrap();

        let wrapped = receiver.public_key().encrypt(b"secret").unwrap();
        let err = stranger.decrypt(&wrapped).unwrap_err();
        assert!(err.is_security_violation());
    }

    #[test]
    fn test_invalid_pem() {
        assert!(PeerPublicKey::from_pem("not a key").is_err());
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let keypair = IdentityKeyPair::generate(TEST_BITS).unwrap();
        let parsed = PeerPublicKey::from_pem(keypair.public_key_pem()).unwrap();
        assert_eq!(parsed.fingerprint(), keypair.public_key().fingerprint());
        assert_eq!(parsed.fingerprint().len(), 16);
    }
}
