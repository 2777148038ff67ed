//! Trust-Anchor Client
//!
//! The client accepts data from authorized devices, signs a chained
//! commitment to that data with per-identity P-256 keys, forwards the
//! signed envelope to the attestation backend and returns a structured
//! receipt.
//!
//! ## API Endpoints
//!
//! - `POST /{uuid}` - chained anchor over the request body
//! - `POST /{uuid}/hash` - chained anchor over a supplied 32-byte hash
//! - `POST /{uuid}/{operation}` - signed update (`anchor`, `disable`,
//!   `enable`, `delete`); does not advance the chain
//! - `POST /{uuid}/{operation}/hash` - signed update over a supplied hash
//! - `POST /verify`, `POST /verify/hash` - stateless envelope verification
//! - `PUT /register` - late identity registration (database mode only)
//! - `GET /healthz`, `GET /readyz` - liveness / readiness
//!
//! ## Chain guarantees
//!
//! Within one identity, chained envelopes form a strict signature chain:
//! each envelope carries the signature of its predecessor, the first one
//! carries 64 zero bytes. A new chain tip is persisted only after the
//! attestation backend accepted the envelope, so the published chain never
//! runs ahead of the persisted one.

pub mod api;
pub mod backend;
pub mod config;
pub mod registrar;
pub mod signer;
pub mod storage;
pub mod verifier;

pub(crate) mod b64;

pub use api::{create_router, AppState};
pub use backend::BackendClient;
pub use config::Config;
pub use registrar::IdentityRegistrar;
pub use signer::Signer;
pub use storage::{FileStore, Identity, IdentityStore, PostgresStore, StoreError};
pub use verifier::Verifier;
