//! Stateless envelope verification
//!
//! `POST /verify` takes a hash, asks the verification service which
//! envelope was recorded for it, and checks that envelope's signature
//! under the public key of the identity it names. No state is touched.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

use anchor_core::{PublicKey, Upp};

use crate::backend::{BackendClient, DispatchOutcome};
use crate::signer::Sha256Hash;
use crate::storage::{IdentityStore, StoreError};

/// Verification failures, mapped onto HTTP statuses by the API layer
#[derive(Error, Debug)]
pub enum VerifierError {
    #[error("no envelope recorded for this hash")]
    HashUnknown,

    #[error("unknown UUID: {0}")]
    UnknownIdentity(Uuid),

    #[error("envelope signature verification failed")]
    InvalidSignature,

    #[error("unreadable verification service response: {0}")]
    BadBackendResponse(String),

    #[error("verification service unavailable: {0}")]
    BackendUnavailable(String),

    #[error("request to verification service timed out")]
    BackendTimeout,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<StoreError> for VerifierError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(uid) => VerifierError::UnknownIdentity(uid),
            other => VerifierError::Internal(other.to_string()),
        }
    }
}

/// Body of a verification service reply
#[derive(Debug, Deserialize)]
struct LookupResponse {
    #[serde(with = "crate::b64")]
    upp: Vec<u8>,
}

/// Successful verification result returned to the caller
#[derive(Debug, Serialize)]
pub struct VerificationResponse {
    #[serde(with = "crate::b64")]
    pub upp: Vec<u8>,
    pub uuid: Uuid,
    #[serde(rename = "pubKey")]
    pub public_key: String,
}

/// Checks recorded envelopes against stored public keys
pub struct Verifier {
    store: Arc<dyn IdentityStore>,
    backend: BackendClient,
}

impl Verifier {
    pub fn new(store: Arc<dyn IdentityStore>, backend: BackendClient) -> Self {
        Self { store, backend }
    }

    /// Verify the envelope recorded for `hash`
    pub async fn verify(&self, hash: Sha256Hash) -> Result<VerificationResponse, VerifierError> {
        let response = match self.backend.lookup_upp(&hash).await {
            DispatchOutcome::Success(response) => response,
            DispatchOutcome::Rejected(response) => {
                debug!(status = response.status_code, "verification service lookup miss");
                return Err(VerifierError::HashUnknown);
            }
            DispatchOutcome::Unavailable(reason) => {
                return Err(VerifierError::BackendUnavailable(reason))
            }
            DispatchOutcome::Timeout => return Err(VerifierError::BackendTimeout),
        };

        let lookup: LookupResponse = serde_json::from_slice(&response.content)
            .map_err(|e| VerifierError::BadBackendResponse(e.to_string()))?;

        let upp = Upp::from_bytes(&lookup.upp)
            .map_err(|e| VerifierError::BadBackendResponse(e.to_string()))?;
        let uid = upp.uid();

        let public_key_pem = self.store.get_public_key(uid).await?;
        let public_key = PublicKey::from_pem(&public_key_pem)
            .map_err(|e| VerifierError::Internal(e.to_string()))?;

        if let Err(e) = upp.verify(&public_key) {
            warn!(uid = %uid, error = %e, "envelope signature verification failed");
            return Err(VerifierError::InvalidSignature);
        }

        debug!(uid = %uid, "envelope verified");
        Ok(VerificationResponse {
            upp: lookup.upp,
            uuid: uid,
            public_key: public_key_pem,
        })
    }
}
