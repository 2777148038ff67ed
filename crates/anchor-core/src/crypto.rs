//! ECDSA P-256 primitives
//!
//! Key types:
//! - `KeyPair`: P-256 signing key, PKCS#8 DER in, raw 64-byte signatures out
//! - `PublicKey`: P-256 verifying key, SPKI PEM encoded
//!
//! Signatures are always the raw `r ‖ s` form, exactly 64 bytes, computed
//! over SHA-256 of the message. Anything else read back from storage is
//! treated as corruption by the callers.

use p256::ecdsa::{
    signature::{Signer, Verifier},
    Signature, SigningKey, VerifyingKey,
};
use p256::pkcs8::{DecodePrivateKey, DecodePublicKey, EncodePrivateKey, EncodePublicKey, LineEnding};
use rand::rngs::OsRng;

use crate::error::{ProtocolError, Result};

/// Length of a raw P-256 ECDSA signature (r ‖ s)
pub const SIGNATURE_LEN: usize = 64;

/// Length of a SHA-256 payload hash
pub const HASH_LEN: usize = 32;

/// P-256 key pair for signing envelopes
#[derive(Clone)]
pub struct KeyPair {
    signing_key: SigningKey,
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("signing_key", &"[redacted]")
            .finish()
    }
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    /// Parse a key pair from a PKCS#8 DER document
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// Encode the private key as a PKCS#8 DER document
    pub fn to_pkcs8_der(&self) -> Result<Vec<u8>> {
        let doc = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        Ok(doc.as_bytes().to_vec())
    }

    /// Get the public half
    pub fn public_key(&self) -> PublicKey {
        PublicKey {
            verifying_key: *self.signing_key.verifying_key(),
        }
    }

    /// Encode the public half as SPKI PEM
    pub fn public_key_pem(&self) -> Result<String> {
        self.public_key().to_pem()
    }

    /// Produce a raw 64-byte signature over SHA-256 of `message`
    pub fn sign(&self, message: &[u8]) -> [u8; SIGNATURE_LEN] {
        let signature: Signature = self.signing_key.sign(message);
        let mut raw = [0u8; SIGNATURE_LEN];
        raw.copy_from_slice(&signature.to_bytes());
        raw
    }
}

/// P-256 public key for verifying envelopes
#[derive(Clone)]
pub struct PublicKey {
    verifying_key: VerifyingKey,
}

impl std::fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PublicKey").finish()
    }
}

impl PublicKey {
    /// Parse a public key from SPKI PEM
    pub fn from_pem(pem: &str) -> Result<Self> {
        let verifying_key = VerifyingKey::from_public_key_pem(pem)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        Ok(Self { verifying_key })
    }

    /// Encode as SPKI PEM
    pub fn to_pem(&self) -> Result<String> {
        self.verifying_key
            .to_public_key_pem(LineEnding::LF)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))
    }

    /// Verify a raw 64-byte signature over SHA-256 of `message`
    pub fn verify(&self, message: &[u8], signature: &[u8]) -> Result<()> {
        if signature.len() != SIGNATURE_LEN {
            return Err(ProtocolError::InvalidSignatureLength {
                expected: SIGNATURE_LEN,
                got: signature.len(),
            });
        }
        let signature = Signature::from_slice(signature)
            .map_err(|e| ProtocolError::InvalidKey(e.to_string()))?;
        self.verifying_key
            .verify(message, &signature)
            .map_err(|_| ProtocolError::VerificationFailed)
    }
}
