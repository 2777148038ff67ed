//! Payload hash extraction
//!
//! Requests either carry original data to be hashed (route without the
//! `/hash` suffix) or the 32-byte hash itself (`/hash` routes). JSON
//! bodies are canonicalized before hashing: keys recursively sorted,
//! whitespace removed, so that any key order yields the same commitment.

use axum::http::HeaderMap;
use base64::{engine::general_purpose::STANDARD, Engine};
use sha2::{Digest, Sha256};

use anchor_core::HASH_LEN;

use super::error::ApiError;
use crate::signer::Sha256Hash;

const BIN_TYPE: &str = "application/octet-stream";
const JSON_TYPE: &str = "application/json";
const TEXT_TYPE: &str = "text/plain";

const HEX_ENCODING: &str = "hex";

fn content_type(headers: &HeaderMap) -> String {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase()
}

fn content_encoding(headers: &HeaderMap) -> String {
    headers
        .get("content-transfer-encoding")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_lowercase()
}

/// Produce the sorted compact rendering of a JSON document
pub fn sorted_compact_json(data: &[u8]) -> Result<Vec<u8>, String> {
    // serde_json object maps are ordered by key, so parsing and
    // re-serializing sorts recursively; `to_vec` emits no whitespace
    let value: serde_json::Value =
        serde_json::from_slice(data).map_err(|e| format!("unable to parse JSON request body: {e}"))?;
    let compact =
        serde_json::to_vec(&value).map_err(|e| format!("unable to serialize JSON object: {e}"))?;
    Ok(escape_line_separators(compact))
}

/// Escape U+2028 and U+2029 inside string values
///
/// Both are legal unescaped in JSON strings and serde_json leaves them as
/// raw UTF-8, but commitment hashes must agree byte for byte with client
/// stacks whose JSON encoders always emit `\u2028`/`\u2029` for them.
fn escape_line_separators(json: Vec<u8>) -> Vec<u8> {
    let mut out = Vec::with_capacity(json.len());
    let mut i = 0;
    while i < json.len() {
        match json.get(i..i + 3) {
            Some(&[0xe2, 0x80, 0xa8]) => {
                out.extend_from_slice(b"\\u2028");
                i += 3;
            }
            Some(&[0xe2, 0x80, 0xa9]) => {
                out.extend_from_slice(b"\\u2029");
                i += 3;
            }
            _ => {
                out.push(json[i]);
                i += 1;
            }
        }
    }
    out
}

/// Extract the 32-byte payload hash from a request
pub fn extract_hash(headers: &HeaderMap, body: &[u8], is_hash: bool) -> Result<Sha256Hash, ApiError> {
    if is_hash {
        hash_from_hash_request(headers, body)
    } else {
        hash_from_data_request(headers, body)
    }
}

fn hash_from_data_request(headers: &HeaderMap, body: &[u8]) -> Result<Sha256Hash, ApiError> {
    let data = match content_type(headers).as_str() {
        JSON_TYPE => sorted_compact_json(body).map_err(ApiError::BadRequest)?,
        BIN_TYPE => body.to_vec(),
        other => {
            return Err(ApiError::BadRequest(format!(
                "invalid content-type for original data: expected (\"{BIN_TYPE}\" | \"{JSON_TYPE}\"), got \"{other}\""
            )))
        }
    };

    Ok(Sha256::digest(&data).into())
}

fn hash_from_hash_request(headers: &HeaderMap, body: &[u8]) -> Result<Sha256Hash, ApiError> {
    let data = match content_type(headers).as_str() {
        TEXT_TYPE => {
            if content_encoding(headers) == HEX_ENCODING {
                hex::decode(body)
                    .map_err(|e| ApiError::BadRequest(format!("decoding hex encoded hash failed: {e}")))?
            } else {
                STANDARD.decode(body).map_err(|e| {
                    ApiError::BadRequest(format!("decoding base64 encoded hash failed: {e}"))
                })?
            }
        }
        BIN_TYPE => body.to_vec(),
        other => {
            return Err(ApiError::BadRequest(format!(
                "invalid content-type for hash: expected (\"{BIN_TYPE}\" | \"{TEXT_TYPE}\"), got \"{other}\""
            )))
        }
    };

    if data.len() != HASH_LEN {
        return Err(ApiError::BadRequest(format!(
            "invalid SHA256 hash size: expected {HASH_LEN} bytes, got {} bytes",
            data.len()
        )));
    }

    let mut hash = [0u8; HASH_LEN];
    hash.copy_from_slice(&data);
    Ok(hash)
}
