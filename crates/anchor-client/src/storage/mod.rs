//! Identity storage
//!
//! Persistent mapping of UUID to key material, auth token and chain tip.
//! Two backings honor the same capability trait: one JSON file per
//! identity under the config directory, or one row per identity in
//! PostgreSQL. Nothing else varies between them.
//!
//! The per-identity critical section is part of the contract: `lock`
//! hands out an [`IdentityLock`] that observed the row at acquisition and
//! couples commit with release. No two locks for the same UUID coexist,
//! so no two in-flight sign operations observe the same chain tip.

pub mod file;
pub mod postgres;

pub use file::FileStore;
pub use postgres::PostgresStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::fmt::Debug;
use uuid::Uuid;

use anchor_core::SIGNATURE_LEN;

/// Error type for storage operations
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("unknown identity: {0}")]
    NotFound(Uuid),

    #[error("identity already exists: {0}")]
    AlreadyExists(Uuid),

    #[error("corrupt identity record for {uid}: {reason}")]
    Corrupt { uid: Uuid, reason: String },

    #[error("database error: {0}")]
    Database(String),

    #[error("i/o error: {0}")]
    Io(String),
}

/// A device identity as persisted by the store
///
/// The private key is keystore-wrapped; the store never sees plaintext
/// key material. The signature is the chain tip: empty before the first
/// chained sign, exactly 64 bytes afterwards.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub uid: Uuid,
    pub private_key: Vec<u8>,
    pub public_key: String,
    pub signature: Vec<u8>,
    pub auth_token: String,
    pub created_at: DateTime<Utc>,
}

impl Identity {
    /// Validate the record invariants shared by both backings
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.auth_token.is_empty() {
            return Err(StoreError::Corrupt {
                uid: self.uid,
                reason: "empty auth token".into(),
            });
        }
        if self.private_key.is_empty() {
            return Err(StoreError::Corrupt {
                uid: self.uid,
                reason: "empty private key".into(),
            });
        }
        if self.public_key.is_empty() {
            return Err(StoreError::Corrupt {
                uid: self.uid,
                reason: "empty public key".into(),
            });
        }
        check_signature_len(self.uid, &self.signature)
    }
}

/// The chain tip must be empty (pre-genesis) or exactly one signature long
pub(crate) fn check_signature_len(uid: Uuid, signature: &[u8]) -> Result<(), StoreError> {
    if !signature.is_empty() && signature.len() != SIGNATURE_LEN {
        return Err(StoreError::Corrupt {
            uid,
            reason: format!(
                "invalid signature length: expected 0 or {}, got {}",
                SIGNATURE_LEN,
                signature.len()
            ),
        });
    }
    Ok(())
}

/// Storage backing for identities
///
/// Implementations must be thread-safe; the signer calls them from many
/// concurrent request handlers.
#[async_trait]
pub trait IdentityStore: Send + Sync + Debug {
    /// Fetch the full identity record
    async fn fetch_identity(&self, uid: Uuid) -> Result<Identity, StoreError>;

    /// Create a new identity; fails if the UUID is already present
    async fn store_identity(&self, identity: Identity) -> Result<(), StoreError>;

    /// Acquire the per-identity critical section
    async fn lock(&self, uid: Uuid) -> Result<Box<dyn IdentityLock>, StoreError>;

    /// Whether identities can be added after startup (database mode)
    fn supports_late_registration(&self) -> bool {
        false
    }

    async fn get_private_key(&self, uid: Uuid) -> Result<Vec<u8>, StoreError> {
        Ok(self.fetch_identity(uid).await?.private_key)
    }

    async fn get_public_key(&self, uid: Uuid) -> Result<String, StoreError> {
        Ok(self.fetch_identity(uid).await?.public_key)
    }

    async fn get_auth_token(&self, uid: Uuid) -> Result<String, StoreError> {
        Ok(self.fetch_identity(uid).await?.auth_token)
    }

    async fn get_signature(&self, uid: Uuid) -> Result<Vec<u8>, StoreError> {
        Ok(self.fetch_identity(uid).await?.signature)
    }
}

/// The per-identity critical section
///
/// The lock exposes the row as observed at acquisition. Consuming it via
/// [`commit`](IdentityLock::commit) persists a new chain tip and releases;
/// [`release`](IdentityLock::release) releases without persisting.
/// Dropping the lock behaves like `release` (a cancelled request must not
/// advance the chain).
#[async_trait]
pub trait IdentityLock: Send {
    /// The identity as observed when the lock was acquired
    fn identity(&self) -> &Identity;

    /// Persist `new_signature` as the chain tip, then release
    async fn commit(self: Box<Self>, new_signature: Vec<u8>) -> Result<(), StoreError>;

    /// Release without advancing the chain tip
    async fn release(self: Box<Self>) -> Result<(), StoreError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn identity(signature: Vec<u8>) -> Identity {
        Identity {
            uid: Uuid::new_v4(),
            private_key: vec![1, 2, 3],
            public_key: "-----BEGIN PUBLIC KEY-----".into(),
            signature,
            auth_token: "token".into(),
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_empty_signature_is_valid() {
        identity(vec![]).validate().unwrap();
    }

    #[test]
    fn test_full_signature_is_valid() {
        identity(vec![0u8; SIGNATURE_LEN]).validate().unwrap();
    }

    #[test]
    fn test_truncated_signature_is_corrupt() {
        let result = identity(vec![0u8; 40]).validate();
        assert!(matches!(result, Err(StoreError::Corrupt { .. })));
    }

    #[test]
    fn test_empty_auth_token_is_corrupt() {
        let mut id = identity(vec![]);
        id.auth_token.clear();
        assert!(matches!(id.validate(), Err(StoreError::Corrupt { .. })));
    }
}
