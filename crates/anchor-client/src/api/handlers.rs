//! Request handlers for the signing, verification and registration routes

use axum::{
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use super::error::ApiError;
use super::hash::extract_hash;
use super::AppState;
use crate::signer::{Operation, SignatureVariant};

fn parse_uuid(segment: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(segment)
        .map_err(|_| ApiError::NotFound(format!("unable to parse \"{segment}\" as UUID")))
}

fn parse_operation(segment: &str) -> Result<Operation, ApiError> {
    Operation::from_path(segment).ok_or_else(|| {
        ApiError::NotFound(format!(
            "invalid operation: expected (\"anchor\" | \"disable\" | \"enable\" | \"delete\"), got \"{segment}\""
        ))
    })
}

fn auth_token(headers: &HeaderMap) -> &str {
    headers
        .get("x-auth-token")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
}

async fn sign(
    state: &AppState,
    uuid_segment: &str,
    variant: SignatureVariant,
    operation: Operation,
    headers: &HeaderMap,
    body: &[u8],
    is_hash: bool,
) -> Result<Response, ApiError> {
    let uid = parse_uuid(uuid_segment)?;
    let token = auth_token(headers);
    let hash = extract_hash(headers, body, is_hash)?;

    let outcome = state
        .signer
        .handle_sign_request(uid, token, hash, variant, operation)
        .await?;

    let status = StatusCode::from_u16(outcome.status)
        .map_err(|e| ApiError::Internal(format!("invalid backend status: {e}")))?;
    Ok((status, Json(outcome.receipt)).into_response())
}

/// POST /{uuid} - chained anchor over the request body
pub async fn chained_data(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    sign(
        &state,
        &uuid,
        SignatureVariant::Chained,
        Operation::Anchor,
        &headers,
        &body,
        false,
    )
    .await
}

/// POST /{uuid}/hash - chained anchor over a supplied hash
pub async fn chained_hash(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<String>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    sign(
        &state,
        &uuid,
        SignatureVariant::Chained,
        Operation::Anchor,
        &headers,
        &body,
        true,
    )
    .await
}

/// POST /{uuid}/{operation} - signed update over the request body
///
/// The route determines the envelope variant and the operation determines
/// the hint, so `anchor` here still yields a signed (unchained) envelope.
pub async fn signed_data(
    State(state): State<Arc<AppState>>,
    Path((uuid, operation)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let operation = parse_operation(&operation)?;
    sign(
        &state,
        &uuid,
        SignatureVariant::Signed,
        operation,
        &headers,
        &body,
        false,
    )
    .await
}

/// POST /{uuid}/{operation}/hash - signed update over a supplied hash
pub async fn signed_hash(
    State(state): State<Arc<AppState>>,
    Path((uuid, operation)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let operation = parse_operation(&operation)?;
    sign(
        &state,
        &uuid,
        SignatureVariant::Signed,
        operation,
        &headers,
        &body,
        true,
    )
    .await
}

/// POST /verify - stateless verification of the request body's hash
pub async fn verify_data(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hash = extract_hash(&headers, &body, false)?;
    let verification = state.verifier.verify(hash).await?;
    Ok(Json(verification).into_response())
}

/// POST /verify/hash - stateless verification of a supplied hash
pub async fn verify_hash(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, ApiError> {
    let hash = extract_hash(&headers, &body, true)?;
    let verification = state.verifier.verify(hash).await?;
    Ok(Json(verification).into_response())
}

/// Body of a late registration request
#[derive(Debug, Deserialize)]
pub struct RegistrationRequest {
    pub uuid: Uuid,
    pub token: String,
}

/// PUT /register - register an identity after startup (database mode only)
pub async fn register(
    State(state): State<Arc<AppState>>,
    Json(request): Json<RegistrationRequest>,
) -> Result<Response, ApiError> {
    if !state.store.supports_late_registration() {
        return Err(ApiError::BadRequest(
            "late registration requires the database backing".into(),
        ));
    }
    if request.token.is_empty() {
        return Err(ApiError::BadRequest("empty auth token".into()));
    }

    state
        .registrar
        .register_identity(request.uuid, &request.token, None)
        .await
        .map_err(|e| match e {
            crate::registrar::RegistrarError::Store(crate::storage::StoreError::AlreadyExists(
                uid,
            )) => ApiError::Conflict(format!("identity already exists: {uid}")),
            other => ApiError::Internal(other.to_string()),
        })?;

    Ok((StatusCode::OK, "ok").into_response())
}
