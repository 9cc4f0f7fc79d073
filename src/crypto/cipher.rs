//! AES-256-CBC session cipher.
//!
//! Wire layout of an encrypted payload: a random 16-byte IV followed by the
//! PKCS#7-padded ciphertext.

use crate::utils::{CryptoError, Result};
use aes::cipher::{block_padding::Pkcs7, BlockDecryptMut, BlockEncryptMut, KeyIvInit};
use rand::{rngs::OsRng, RngCore};

type Aes256CbcEnc = cbc::Encryptor<aes::Aes256>;
type Aes256CbcDec = cbc::Decryptor<aes::Aes256>;

/// Session key length in bytes
pub const SESSION_KEY_LEN: usize = 32;

/// CBC initialisation vector length
pub const IV_LEN: usize = 16;

/// Symmetric key shared by exactly one pair of peers
#[derive(Clone, PartialEq, Eq)]
pub struct SessionKey([u8; SESSION_KEY_LEN]);

impl SessionKey {
    /// Generate a random 256-bit key
    pub fn generate() -> Self {
        let mut key = [0u8; SESSION_KEY_LEN];
        OsRng.fill_bytes(&mut key);
        Self(key)
    }

    /// Rebuild a key received from a peer
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::InvalidKey` if `bytes` is not 32 bytes long
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        let key: [u8; SESSION_KEY_LEN] =
            bytes.try_into().map_err(|_| CryptoError::InvalidKey {
                reason: format!(
                    "session key must be {SESSION_KEY_LEN} bytes, got {}",
                    bytes.len()
                ),
            })?;
        Ok(Self(key))
    }

    /// Raw key bytes
    pub fn as_bytes(&self) -> &[u8; SESSION_KEY_LEN] {
        &self.0
    }

    /// Encrypt under a fresh random IV, returning `iv || ciphertext`
    pub fn encrypt(&self, plaintext: &[u8]) -> Vec<u8> {
        let mut iv = [0u8; IV_LEN];
        OsRng.fill_bytes(&mut iv);

        let ciphertext =
            Aes256CbcEnc::new(&self.0.into(), &iv.into()).encrypt_padded_vec_mut::<Pkcs7>(plaintext);

        let mut out = Vec::with_capacity(IV_LEN + ciphertext.len());
        out.extend_from_slice(&iv);
        out.extend_from_slice(&ciphertext);
        out
    }

    /// Decrypt `iv || ciphertext`
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::Decryption` for truncated input or bad padding
    pub fn decrypt(&self, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < IV_LEN * 2 || (data.len() - IV_LEN) % IV_LEN != 0 {
            return Err(CryptoError::Decryption {
                reason: format!("ciphertext length {} is not a whole block count", data.len()),
            }
            .into());
        }

        let (iv, ciphertext) = data.split_at(IV_LEN);
        let mut iv_block = [0u8; IV_LEN];
        iv_block.copy_from_slice(iv);

        Aes256CbcDec::new(&self.0.into(), &iv_block.into())
            .decrypt_padded_vec_mut::<Pkcs7>(ciphertext)
            .map_err(|_| {
                CryptoError::Decryption {
                    reason: "invalid padding".to_string(),
                }
                .into()
            })
    }
}

impl std::fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("SessionKey(..)")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip() {
        let key = SessionKey::generate();
        for message in [&b""[..], b"hi", &[0xAB; 16], &[1u8; 1000]] {
            let sealed = key.encrypt(message);
            assert_eq!(key.decrypt(&sealed).unwrap(), message);
        }
    }

    #[test]
    fn test_ciphertext_layout() {
        let key = SessionKey::generate();
        // 16 bytes of plaintext pad to two blocks
        let sealed = key.encrypt(&[0u8; 16]);
        assert_eq!(sealed.len(), IV_LEN + 32);
    }

    #[test]
    fn test_fresh_iv_per_message() {
        let key = SessionKey::generate();
        assert_ne!(key.encrypt(b"same"), key.encrypt(b"same"));
    }

    #[test]
    fn test_wrong_key_or_truncation_fails() {
        let key = SessionKey::generate();
        let other = SessionKey::generate();
        let sealed = key.encrypt(b"attack at dawn");

        // A wrong key almost always breaks the padding; if it happens to
        // unpad, the plaintext still differs.
        match other.decrypt(&sealed) {
            Ok(plain) => assert_ne!(plain, b"attack at dawn"),
            Err(err) => assert!(err.is_security_violation()),
        }
        assert!(key.decrypt(&sealed[..IV_LEN]).is_err());
        assert!(key.decrypt(&sealed[..sealed.len() - 1]).is_err());
    }

    #[test]
    fn test_from_bytes() {
        let key = SessionKey::generate();
        let restored = SessionKey::from_bytes(key.as_bytes()).unwrap();
        assert!(restored == key);
        assert!(SessionKey::from_bytes(&[0u8; 16]).is_err());
    }
}
