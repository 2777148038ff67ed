//! HTTP client for the remote backend services
//!
//! Three targets: the key service (public key registration), the
//! attestation service ("niomon", envelope ingestion) and the verification
//! service (envelope lookup by hash). All calls are POSTs with a bounded
//! timeout and are classified into success / rejected / unavailable /
//! timeout. The client never retries; at-most-once delivery keeps the
//! signature chain unambiguous.

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::config::Config;

/// Deadline for a single attestation call
pub const ATTESTATION_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the key registration path
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("request to {service} timed out after {timeout:?}")]
    Timeout {
        service: &'static str,
        timeout: Duration,
    },

    #[error("{service} unavailable: {reason}")]
    Unavailable {
        service: &'static str,
        reason: String,
    },

    #[error("{service} rejected the request: ({status}) {body}")]
    Rejected {
        service: &'static str,
        status: u16,
        body: String,
    },
}

/// A backend reply as included in the signing receipt
#[derive(Debug, Clone, Serialize)]
pub struct BackendResponse {
    #[serde(rename = "statusCode")]
    pub status_code: u16,
    pub header: HashMap<String, Vec<String>>,
    #[serde(with = "crate::b64")]
    pub content: Vec<u8>,
}

impl BackendResponse {
    async fn from_reqwest(response: reqwest::Response) -> Self {
        let status_code = response.status().as_u16();
        let mut header: HashMap<String, Vec<String>> = HashMap::new();
        for (name, value) in response.headers() {
            header
                .entry(name.to_string())
                .or_default()
                .push(String::from_utf8_lossy(value.as_bytes()).into_owned());
        }
        let content = response.bytes().await.unwrap_or_default().to_vec();
        Self {
            status_code,
            header,
            content,
        }
    }
}

/// Classified outcome of a dispatch
#[derive(Debug)]
pub enum DispatchOutcome {
    /// 2xx; the envelope (or lookup) was accepted
    Success(BackendResponse),
    /// 4xx; the backend made a decision, proxied verbatim to the caller
    Rejected(BackendResponse),
    /// 5xx, connection refused or other transport failure
    Unavailable(String),
    /// deadline exceeded
    Timeout,
}

/// HTTPS client for the key, attestation and verification services
#[derive(Debug, Clone)]
pub struct BackendClient {
    http: reqwest::Client,
    key_service_url: String,
    niomon_url: String,
    verify_url: String,
}

impl BackendClient {
    pub fn new(config: &Config) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()
            .expect("default TLS backend is available");

        Self {
            http,
            key_service_url: config.key_service.clone(),
            niomon_url: config.niomon.clone(),
            verify_url: config.verify_service.clone(),
        }
    }

    /// Send an envelope to the attestation service
    pub async fn send_upp(&self, uid: Uuid, auth_token: &str, upp: &[u8]) -> DispatchOutcome {
        let result = self
            .http
            .post(&self.niomon_url)
            .timeout(ATTESTATION_TIMEOUT)
            .header("content-type", "application/octet-stream")
            .header("x-ubirch-hardware-id", uid.to_string())
            .header("x-ubirch-auth-type", "ubirch")
            .header("x-ubirch-credential", STANDARD.encode(auth_token))
            .body(upp.to_vec())
            .send()
            .await;

        Self::classify(result).await
    }

    /// Ask the verification service for the envelope recorded for a hash
    pub async fn lookup_upp(&self, hash: &[u8]) -> DispatchOutcome {
        let result = self
            .http
            .post(&self.verify_url)
            .timeout(ATTESTATION_TIMEOUT)
            .header("content-type", "text/plain")
            .body(STANDARD.encode(hash))
            .send()
            .await;

        Self::classify(result).await
    }

    async fn classify(result: Result<reqwest::Response, reqwest::Error>) -> DispatchOutcome {
        match result {
            Ok(response) => {
                let status = response.status();
                let response = BackendResponse::from_reqwest(response).await;
                debug!(status = status.as_u16(), "backend response");
                if status.is_success() {
                    DispatchOutcome::Success(response)
                } else if status.is_client_error() {
                    DispatchOutcome::Rejected(response)
                } else {
                    DispatchOutcome::Unavailable(format!("backend returned status {status}"))
                }
            }
            Err(e) if e.is_timeout() => DispatchOutcome::Timeout,
            Err(e) => DispatchOutcome::Unavailable(e.to_string()),
        }
    }

    /// Register a public key with the key service; 409 means the key is
    /// already registered and counts as success
    pub async fn register_key(&self, uid: Uuid, csr: &[u8]) -> Result<(), BackendError> {
        const SERVICE: &str = "key service";

        let result = self
            .http
            .post(&self.key_service_url)
            .timeout(ATTESTATION_TIMEOUT)
            .header("content-type", "application/octet-stream")
            .header("x-ubirch-hardware-id", uid.to_string())
            .body(csr.to_vec())
            .send()
            .await;

        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_timeout() => {
                return Err(BackendError::Timeout {
                    service: SERVICE,
                    timeout: ATTESTATION_TIMEOUT,
                })
            }
            Err(e) => {
                return Err(BackendError::Unavailable {
                    service: SERVICE,
                    reason: e.to_string(),
                })
            }
        };

        let status = response.status();
        if status.is_success() || status == reqwest::StatusCode::CONFLICT {
            return Ok(());
        }

        let body = response.text().await.unwrap_or_default();
        Err(BackendError::Rejected {
            service: SERVICE,
            status: status.as_u16(),
            body,
        })
    }
}
