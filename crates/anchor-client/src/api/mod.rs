//! HTTP surface
//!
//! URL routing, header parsing and hash extraction. The route shape
//! decides the envelope variant: `POST /{uuid}` is the chained anchor,
//! `POST /{uuid}/{operation}` produces one-off signed envelopes. A
//! trailing `/hash` means the body carries the hash itself instead of the
//! data to be hashed.

pub mod error;
pub mod handlers;
pub mod hash;

use axum::{
    http::HeaderValue,
    routing::{get, post, put},
    Json, Router,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use tracing::warn;

use crate::config::Config;
use crate::registrar::IdentityRegistrar;
use crate::signer::Signer;
use crate::storage::IdentityStore;
use crate::verifier::Verifier;

/// Deadline for handling one inbound request
const REQUEST_DEADLINE: Duration = Duration::from_secs(30);

/// Application state shared across handlers
pub struct AppState {
    pub signer: Signer,
    pub verifier: Verifier,
    pub registrar: IdentityRegistrar,
    pub store: Arc<dyn IdentityStore>,
    pub device_count: usize,
}

/// Health check response
#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

/// Readiness check response
#[derive(Serialize)]
pub struct ReadyResponse {
    pub ready: bool,
    pub devices: usize,
}

/// GET /healthz
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".into(),
        version: env!("CARGO_PKG_VERSION").into(),
    })
}

/// GET /readyz
pub async fn ready(
    axum::extract::State(state): axum::extract::State<Arc<AppState>>,
) -> Json<ReadyResponse> {
    Json(ReadyResponse {
        ready: true,
        devices: state.device_count,
    })
}

fn cors_layer(config: &Config) -> CorsLayer {
    if config.cors_origins.is_empty() {
        return CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any);
    }

    let origins: Vec<HeaderValue> = config
        .cors_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unparsable CORS origin");
                None
            }
        })
        .collect();

    CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(Any)
        .allow_headers(Any)
}

/// Create the API router
pub fn create_router(state: Arc<AppState>, config: &Config) -> Router {
    let mut router = Router::new()
        // health endpoints
        .route("/healthz", get(health))
        .route("/readyz", get(ready))
        // verification
        .route("/verify", post(handlers::verify_data))
        .route("/verify/hash", post(handlers::verify_hash))
        // late registration
        .route("/register", put(handlers::register))
        // chained anchor
        .route("/{uuid}", post(handlers::chained_data))
        .route("/{uuid}/hash", post(handlers::chained_hash))
        // signed updates
        .route("/{uuid}/{operation}", post(handlers::signed_data))
        .route("/{uuid}/{operation}/hash", post(handlers::signed_hash))
        // middleware
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_DEADLINE));

    if config.cors {
        router = router.layer(cors_layer(config));
    }

    router.with_state(state)
}
