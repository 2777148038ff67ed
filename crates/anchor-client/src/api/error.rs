//! API error types and responses
//!
//! Client errors are answered with a human-readable plain-text body.
//! Internal causes are logged, never returned.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;
use tracing::error;

use crate::signer::SignerError;
use crate::verifier::VerifierError;

/// API error type
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("invalid auth token")]
    Unauthorized,

    #[error("{0}")]
    NotFound(String),

    #[error("{0}")]
    Conflict(String),

    #[error("internal server error")]
    Internal(String),

    #[error("error sending request to backend: {0}")]
    BadGateway(String),

    #[error("backend request timed out")]
    GatewayTimeout,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Conflict(_) => StatusCode::CONFLICT,
            ApiError::Internal(cause) => {
                error!(cause = %cause, "internal error");
                StatusCode::INTERNAL_SERVER_ERROR
            }
            ApiError::BadGateway(_) => StatusCode::BAD_GATEWAY,
            ApiError::GatewayTimeout => StatusCode::GATEWAY_TIMEOUT,
        };

        (status, self.to_string()).into_response()
    }
}

impl From<SignerError> for ApiError {
    fn from(err: SignerError) -> Self {
        match err {
            SignerError::InvalidAuthToken => ApiError::Unauthorized,
            SignerError::UnknownIdentity(uid) => ApiError::NotFound(format!("unknown UUID: {uid}")),
            SignerError::Internal(cause) => ApiError::Internal(cause),
            SignerError::BackendUnavailable(reason) => ApiError::BadGateway(reason),
            SignerError::BackendTimeout => ApiError::GatewayTimeout,
        }
    }
}

impl From<VerifierError> for ApiError {
    fn from(err: VerifierError) -> Self {
        match err {
            VerifierError::HashUnknown => {
                ApiError::NotFound("no envelope recorded for this hash".into())
            }
            VerifierError::UnknownIdentity(uid) => {
                ApiError::NotFound(format!("unknown UUID: {uid}"))
            }
            VerifierError::InvalidSignature => {
                ApiError::BadRequest("envelope signature verification failed".into())
            }
            VerifierError::BadBackendResponse(reason) => ApiError::BadGateway(reason),
            VerifierError::BackendUnavailable(reason) => ApiError::BadGateway(reason),
            VerifierError::BackendTimeout => ApiError::GatewayTimeout,
            VerifierError::Internal(cause) => ApiError::Internal(cause),
        }
    }
}
