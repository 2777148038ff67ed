//! Error types for the protocol core

use thiserror::Error;

/// Result type alias using ProtocolError
pub type Result<T> = std::result::Result<T, ProtocolError>;

/// Errors that can occur below the HTTP line
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Private or public key could not be parsed
    #[error("invalid key: {0}")]
    InvalidKey(String),

    /// A signature field had the wrong length
    #[error("invalid signature length: expected {expected}, got {got}")]
    InvalidSignatureLength { expected: usize, got: usize },

    /// Signature did not verify under the given public key
    #[error("signature verification failed")]
    VerificationFailed,

    /// Keystore wrap/unwrap failure
    #[error("keystore error: {0}")]
    Keystore(String),

    /// Envelope encoding/decoding error
    #[error("envelope serialization error: {0}")]
    Serialization(String),

    /// Unknown hint byte in a decoded envelope
    #[error("unknown hint byte: {0:#04x}")]
    UnknownHint(u8),

    /// Unknown version tag in a decoded envelope
    #[error("unknown envelope version: {0:#04x}")]
    UnknownVersion(u8),

    /// CSR construction failure
    #[error("CSR error: {0}")]
    Csr(String),

    /// Payload is not a 32-byte hash
    #[error("invalid payload length: expected {expected}, got {got}")]
    InvalidPayloadLength { expected: usize, got: usize },
}

impl From<rmp_serde::encode::Error> for ProtocolError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rmp_serde::decode::Error> for ProtocolError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        ProtocolError::Serialization(err.to_string())
    }
}

impl From<rcgen::Error> for ProtocolError {
    fn from(err: rcgen::Error) -> Self {
        ProtocolError::Csr(err.to_string())
    }
}
