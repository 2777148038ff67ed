//! Signer core
//!
//! One operation: handle a signing request. Authenticate, enter the
//! per-identity critical section, build the envelope, sign, dispatch to
//! the attestation backend and only then commit the new chain tip. A
//! failed or timed-out dispatch releases the critical section without
//! advancing the tip, so the persisted chain stays a prefix of what the
//! backend accepted.
//!
//! Chained requests additionally pass a bounded concurrency budget (the
//! request buffer). When the budget is exhausted, new chained requests
//! wait on acquisition; a caller that disconnects while waiting simply
//! drops out of the queue.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use std::sync::Arc;
use subtle::ConstantTimeEq;
use thiserror::Error;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};
use uuid::Uuid;

use anchor_core::{
    upp::GENESIS_PREV_SIGNATURE, ChainedUpp, EncryptedKeystore, Hint, KeyPair, SignedUpp, Upp,
    HASH_LEN,
};

use crate::backend::{BackendClient, BackendResponse, DispatchOutcome};
use crate::storage::{IdentityStore, StoreError};

/// A SHA-256 payload hash
pub type Sha256Hash = [u8; HASH_LEN];

const REQUEST_ID_LEN: usize = 16;

/// Route-determined envelope variant
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureVariant {
    /// `POST /{uuid}`: advances the chain tip
    Chained,
    /// `POST /{uuid}/{operation}`: one-off, does not touch the chain
    Signed,
}

/// Operation parameter of the update route
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Anchor,
    Disable,
    Enable,
    Delete,
}

impl Operation {
    /// Parse the URL path segment
    pub fn from_path(segment: &str) -> Option<Self> {
        match segment {
            "anchor" => Some(Operation::Anchor),
            "disable" => Some(Operation::Disable),
            "enable" => Some(Operation::Enable),
            "delete" => Some(Operation::Delete),
            _ => None,
        }
    }

    fn hint(self) -> Hint {
        match self {
            Operation::Anchor => Hint::Binary,
            Operation::Disable => Hint::Disable,
            Operation::Enable => Hint::Enable,
            Operation::Delete => Hint::Delete,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Operation::Anchor => "anchor",
            Operation::Disable => "disable",
            Operation::Enable => "enable",
            Operation::Delete => "delete",
        };
        f.write_str(name)
    }
}

/// Signing failures, mapped onto HTTP statuses by the API layer
#[derive(Error, Debug)]
pub enum SignerError {
    #[error("invalid auth token")]
    InvalidAuthToken,

    #[error("unknown UUID: {0}")]
    UnknownIdentity(Uuid),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("attestation service unavailable: {0}")]
    BackendUnavailable(String),

    #[error("request to attestation service timed out")]
    BackendTimeout,
}

impl From<StoreError> for SignerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(uid) => SignerError::UnknownIdentity(uid),
            other => SignerError::Internal(other.to_string()),
        }
    }
}

/// Receipt returned to the HTTP caller
#[derive(Debug, Serialize)]
pub struct Receipt {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(with = "crate::b64")]
    pub hash: Vec<u8>,
    #[serde(with = "crate::b64")]
    pub upp: Vec<u8>,
    pub response: BackendResponse,
    #[serde(rename = "requestID")]
    pub request_id: String,
}

/// A finished signing request: the receipt plus the HTTP status to answer
/// with (the backend's status)
#[derive(Debug)]
pub struct SignOutcome {
    pub status: u16,
    pub receipt: Receipt,
}

/// Orchestrates authenticate, lock, sign, dispatch, commit
pub struct Signer {
    store: Arc<dyn IdentityStore>,
    keystore: EncryptedKeystore,
    backend: BackendClient,
    chain_budget: Arc<Semaphore>,
}

impl Signer {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        keystore: EncryptedKeystore,
        backend: BackendClient,
        request_buffer_size: usize,
    ) -> Self {
        Self {
            store,
            keystore,
            backend,
            chain_budget: Arc::new(Semaphore::new(request_buffer_size)),
        }
    }

    /// Handle one signing request
    pub async fn handle_sign_request(
        &self,
        uid: Uuid,
        auth_token: &str,
        hash: Sha256Hash,
        variant: SignatureVariant,
        operation: Operation,
    ) -> Result<SignOutcome, SignerError> {
        self.authenticate(uid, auth_token).await?;

        info!(
            uid = %uid,
            operation = %operation,
            variant = ?variant,
            hash = %STANDARD.encode(hash),
            "signing request"
        );

        match variant {
            SignatureVariant::Chained => self.sign_chained(uid, auth_token, hash).await,
            SignatureVariant::Signed => {
                self.sign_signed(uid, auth_token, hash, operation).await
            }
        }
    }

    /// Constant-time token check against the stored token
    async fn authenticate(&self, uid: Uuid, auth_token: &str) -> Result<(), SignerError> {
        let stored = self.store.get_auth_token(uid).await?;
        let matches: bool = stored
            .as_bytes()
            .ct_eq(auth_token.as_bytes())
            .into();
        if !matches {
            return Err(SignerError::InvalidAuthToken);
        }
        Ok(())
    }

    async fn sign_chained(
        &self,
        uid: Uuid,
        auth_token: &str,
        hash: Sha256Hash,
    ) -> Result<SignOutcome, SignerError> {
        let _permit = self
            .chain_budget
            .acquire()
            .await
            .map_err(|e| SignerError::Internal(e.to_string()))?;

        let lock = self.store.lock(uid).await?;
        let identity = lock.identity();

        let key = self.load_key(&identity.private_key)?;
        let prev_signature = if identity.signature.is_empty() {
            debug!(uid = %uid, "genesis link");
            GENESIS_PREV_SIGNATURE.to_vec()
        } else {
            identity.signature.clone()
        };

        let upp = ChainedUpp::sign(&key, uid, &prev_signature, &hash)
            .map_err(|e| SignerError::Internal(e.to_string()))?;
        let upp_bytes = upp
            .to_bytes()
            .map_err(|e| SignerError::Internal(e.to_string()))?;
        debug!(uid = %uid, upp = %hex_preview(&upp_bytes), "chained envelope");

        // the dispatch happens inside the critical section: the tip only
        // moves once the backend accepted this envelope
        match self.backend.send_upp(uid, auth_token, &upp_bytes).await {
            DispatchOutcome::Success(response) => {
                lock.commit(upp.signature.clone()).await?;
                Ok(build_outcome(hash, upp_bytes, response, None))
            }
            DispatchOutcome::Rejected(response) => {
                lock.release().await?;
                warn!(uid = %uid, status = response.status_code, "attestation service rejected envelope");
                Ok(build_outcome(
                    hash,
                    upp_bytes,
                    response,
                    Some("attestation service rejected the envelope".into()),
                ))
            }
            DispatchOutcome::Unavailable(reason) => {
                lock.release().await?;
                Err(SignerError::BackendUnavailable(reason))
            }
            DispatchOutcome::Timeout => {
                lock.release().await?;
                Err(SignerError::BackendTimeout)
            }
        }
    }

    async fn sign_signed(
        &self,
        uid: Uuid,
        auth_token: &str,
        hash: Sha256Hash,
        operation: Operation,
    ) -> Result<SignOutcome, SignerError> {
        let wrapped = self.store.get_private_key(uid).await?;
        let key = self.load_key(&wrapped)?;

        let upp = SignedUpp::sign(&key, uid, operation.hint(), &hash)
            .map_err(|e| SignerError::Internal(e.to_string()))?;
        let upp_bytes = upp
            .to_bytes()
            .map_err(|e| SignerError::Internal(e.to_string()))?;
        debug!(uid = %uid, upp = %hex_preview(&upp_bytes), "signed envelope");

        match self.backend.send_upp(uid, auth_token, &upp_bytes).await {
            DispatchOutcome::Success(response) => {
                Ok(build_outcome(hash, upp_bytes, response, None))
            }
            DispatchOutcome::Rejected(response) => {
                warn!(uid = %uid, status = response.status_code, "attestation service rejected envelope");
                Ok(build_outcome(
                    hash,
                    upp_bytes,
                    response,
                    Some("attestation service rejected the envelope".into()),
                ))
            }
            DispatchOutcome::Unavailable(reason) => Err(SignerError::BackendUnavailable(reason)),
            DispatchOutcome::Timeout => Err(SignerError::BackendTimeout),
        }
    }

    fn load_key(&self, wrapped: &[u8]) -> Result<KeyPair, SignerError> {
        let der = self
            .keystore
            .unwrap(wrapped)
            .map_err(|e| SignerError::Internal(e.to_string()))?;
        KeyPair::from_pkcs8_der(&der).map_err(|e| SignerError::Internal(e.to_string()))
    }
}

fn build_outcome(
    hash: Sha256Hash,
    upp: Vec<u8>,
    response: BackendResponse,
    error: Option<String>,
) -> SignOutcome {
    let request_id = extract_request_id(&response.content);
    if request_id != "n/a" {
        info!(request_id = %request_id, "backend assigned request id");
    }
    SignOutcome {
        status: response.status_code,
        receipt: Receipt {
            error,
            hash: hash.to_vec(),
            upp,
            response,
            request_id,
        },
    }
}

/// The backend response is itself an envelope; its payload starts with a
/// 16-byte request id
pub(crate) fn extract_request_id(content: &[u8]) -> String {
    let upp = match Upp::from_bytes(content) {
        Ok(upp) => upp,
        Err(e) => {
            warn!(error = %e, "decoding backend response envelope failed");
            return "n/a".into();
        }
    };

    let payload = upp.payload();
    if payload.len() < REQUEST_ID_LEN {
        warn!("backend response payload does not contain a request id");
        return "n/a".into();
    }

    match Uuid::from_slice(&payload[..REQUEST_ID_LEN]) {
        Ok(request_id) => request_id.to_string(),
        Err(_) => "n/a".into(),
    }
}

fn hex_preview(bytes: &[u8]) -> String {
    hex::encode(&bytes[..bytes.len().min(32)])
}
