//! Protocol core for the trust-anchor client
//!
//! This crate holds everything the signing service needs below the HTTP
//! line:
//! - P-256 ECDSA key pairs, raw 64-byte signatures and verification
//! - the AES-128-GCM keystore wrapping private keys at rest
//! - UPP envelopes (signed and chained) with their wire encoding
//! - PKCS#10 CSR derivation for public key registration
//!
//! The service crate composes these: the signer gets a key pair, the key
//! pair comes out of the keystore, the keystore gets the secret at
//! construction. No upward references.

pub mod crypto;
pub mod csr;
pub mod error;
pub mod keystore;
pub mod upp;

pub use crypto::{KeyPair, PublicKey, HASH_LEN, SIGNATURE_LEN};
pub use error::{ProtocolError, Result};
pub use keystore::EncryptedKeystore;
pub use upp::{ChainedUpp, Hint, SignedUpp, Upp};
