//! AES-128-GCM encryption for private keys at rest
//!
//! Private keys are only persisted in wrapped form. The wrapped format is
//! `nonce (12 bytes) ‖ ciphertext ‖ tag (16 bytes)`, keyed by the 16-byte
//! secret from the configuration. A failed unwrap at startup is fatal.

use aes_gcm::{
    aead::{Aead, KeyInit},
    Aes128Gcm, Nonce,
};
use rand::RngCore;

use crate::error::{ProtocolError, Result};

/// Length of the keystore secret
pub const SECRET_LEN: usize = 16;

/// Size of the AES-GCM nonce in bytes
const NONCE_LEN: usize = 12;

/// Size of the AES-GCM authentication tag in bytes
const TAG_LEN: usize = 16;

/// Wraps and unwraps private key material with a fixed cipher
#[derive(Clone)]
pub struct EncryptedKeystore {
    cipher: Aes128Gcm,
}

impl std::fmt::Debug for EncryptedKeystore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EncryptedKeystore").finish()
    }
}

impl EncryptedKeystore {
    /// Create a keystore from the 16-byte secret
    pub fn new(secret: &[u8; SECRET_LEN]) -> Self {
        let cipher = Aes128Gcm::new_from_slice(secret)
            .expect("AES-128 key is always 16 bytes here");
        Self { cipher }
    }

    /// Encrypt private key material for storage
    pub fn wrap(&self, plaintext: &[u8]) -> Result<Vec<u8>> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from_slice(&nonce_bytes);

        let ciphertext = self
            .cipher
            .encrypt(nonce, plaintext)
            .map_err(|e| ProtocolError::Keystore(format!("encryption failed: {}", e)))?;

        let mut wrapped = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        wrapped.extend_from_slice(&nonce_bytes);
        wrapped.extend_from_slice(&ciphertext);
        Ok(wrapped)
    }

    /// Decrypt private key material read from storage
    pub fn unwrap(&self, wrapped: &[u8]) -> Result<Vec<u8>> {
        if wrapped.len() < NONCE_LEN + TAG_LEN {
            return Err(ProtocolError::Keystore("wrapped key too short".into()));
        }

        let nonce = Nonce::from_slice(&wrapped[..NONCE_LEN]);
        self.cipher
            .decrypt(nonce, &wrapped[NONCE_LEN..])
            .map_err(|e| ProtocolError::Keystore(format!("decryption failed: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wrap_unwrap_roundtrip() {
        let ks = EncryptedKeystore::new(&[0x01; SECRET_LEN]);
        let key_material = [0x42u8; 121]; // a typical PKCS#8 P-256 document length

        let wrapped = ks.wrap(&key_material).unwrap();
        assert!(wrapped.len() > key_material.len());

        let unwrapped = ks.unwrap(&wrapped).unwrap();
        assert_eq!(unwrapped, key_material);
    }

    #[test]
    fn test_wrong_secret_fails() {
        let ks1 = EncryptedKeystore::new(&[0x01; SECRET_LEN]);
        let ks2 = EncryptedKeystore::new(&[0x02; SECRET_LEN]);

        let wrapped = ks1.wrap(b"private key material").unwrap();
        assert!(ks2.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_tampered_ciphertext_fails() {
        let ks = EncryptedKeystore::new(&[0x01; SECRET_LEN]);
        let mut wrapped = ks.wrap(b"private key material").unwrap();

        wrapped[NONCE_LEN + 3] ^= 0xff;
        assert!(ks.unwrap(&wrapped).is_err());
    }

    #[test]
    fn test_truncated_blob_rejected() {
        let ks = EncryptedKeystore::new(&[0x01; SECRET_LEN]);
        assert!(ks.unwrap(&[0u8; NONCE_LEN + TAG_LEN - 1]).is_err());
    }

    #[test]
    fn test_nonces_differ_per_wrap() {
        let ks = EncryptedKeystore::new(&[0x01; SECRET_LEN]);
        let a = ks.wrap(b"same input").unwrap();
        let b = ks.wrap(b"same input").unwrap();
        assert_ne!(a, b);
    }
}
