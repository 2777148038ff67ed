//! Identity registrar
//!
//! On startup the registrar walks the configured `(uuid, auth token)`
//! pairs. Unknown identities get key material (injected or freshly
//! generated), their public key is announced to the key service with a
//! CSR, and the identity is persisted with an empty chain tip. Existing
//! identities are validated against the configuration; any mismatch is
//! fatal because signing with the wrong key would fork the chain.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};
use uuid::Uuid;

use anchor_core::{csr, EncryptedKeystore, KeyPair, ProtocolError};

use crate::backend::{BackendClient, BackendError};
use crate::storage::{Identity, IdentityStore, StoreError};

/// Registrar failures; all of them are fatal at startup
#[derive(Error, Debug)]
pub enum RegistrarError {
    #[error("static keys mode: no injected private key for {0}")]
    MissingInjectedKey(Uuid),

    #[error("invalid injected private key for {uid}: {reason}")]
    InvalidInjectedKey { uid: Uuid, reason: String },

    #[error("stored public key for {0} does not match the private key")]
    KeyMismatch(Uuid),

    #[error("stored auth token for {0} does not match the configuration")]
    TokenMismatch(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),
}

/// Creates and validates identities at startup and on late registration
pub struct IdentityRegistrar {
    store: Arc<dyn IdentityStore>,
    keystore: EncryptedKeystore,
    backend: BackendClient,
    csr_country: String,
    csr_organization: String,
    static_keys: bool,
}

impl IdentityRegistrar {
    pub fn new(
        store: Arc<dyn IdentityStore>,
        keystore: EncryptedKeystore,
        backend: BackendClient,
        csr_country: String,
        csr_organization: String,
        static_keys: bool,
    ) -> Self {
        Self {
            store,
            keystore,
            backend,
            csr_country,
            csr_organization,
            static_keys,
        }
    }

    /// Bring every configured identity into a registered, validated state
    pub async fn init_identities(
        &self,
        devices: &HashMap<Uuid, String>,
        injected_keys: &HashMap<Uuid, String>,
    ) -> Result<(), RegistrarError> {
        for (&uid, auth_token) in devices {
            match self.store.fetch_identity(uid).await {
                Ok(identity) => self.validate_identity(&identity, auth_token)?,
                Err(StoreError::NotFound(_)) => {
                    self.register_identity(uid, auth_token, injected_keys.get(&uid))
                        .await?
                }
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Create one identity: resolve key material, announce the public key,
    /// persist with an empty chain tip
    pub async fn register_identity(
        &self,
        uid: Uuid,
        auth_token: &str,
        injected_key: Option<&String>,
    ) -> Result<(), RegistrarError> {
        let key = match injected_key {
            Some(encoded) => {
                let der = STANDARD.decode(encoded.as_bytes()).map_err(|e| {
                    RegistrarError::InvalidInjectedKey {
                        uid,
                        reason: e.to_string(),
                    }
                })?;
                KeyPair::from_pkcs8_der(&der).map_err(|e| {
                    RegistrarError::InvalidInjectedKey {
                        uid,
                        reason: e.to_string(),
                    }
                })?
            }
            None if self.static_keys => return Err(RegistrarError::MissingInjectedKey(uid)),
            None => {
                debug!(uid = %uid, "generating new key pair");
                KeyPair::generate()
            }
        };

        let request = csr::build_csr(&key, &self.csr_country, &self.csr_organization, uid)?;
        self.backend.register_key(uid, &request).await?;
        info!(uid = %uid, "registered public key with key service");

        let identity = Identity {
            uid,
            private_key: self.keystore.wrap(&key.to_pkcs8_der()?)?,
            public_key: key.public_key_pem()?,
            signature: vec![],
            auth_token: auth_token.to_string(),
            created_at: Utc::now(),
        };
        self.store.store_identity(identity).await?;

        info!(uid = %uid, "stored new identity");
        Ok(())
    }

    /// Check a persisted identity against the configuration
    fn validate_identity(
        &self,
        identity: &Identity,
        auth_token: &str,
    ) -> Result<(), RegistrarError> {
        let der = self.keystore.unwrap(&identity.private_key)?;
        let key = KeyPair::from_pkcs8_der(&der)?;

        if key.public_key_pem()? != identity.public_key {
            return Err(RegistrarError::KeyMismatch(identity.uid));
        }
        if identity.auth_token != auth_token {
            return Err(RegistrarError::TokenMismatch(identity.uid));
        }

        debug!(uid = %identity.uid, "validated existing identity");
        Ok(())
    }
}
