//! End-to-end signing scenarios
//!
//! These tests run the full router against a stub attestation backend:
//! - receipts carry a verifiable envelope and the backend request id
//! - chained envelopes link strictly, starting from the genesis link
//! - a failed dispatch never advances the chain tip
//! - concurrent chained requests for one identity serialize into a chain
//! - auth and routing errors surface with the right statuses

use std::collections::{HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use axum::{
    body::Bytes,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::post,
    Router,
};
use base64::{engine::general_purpose::STANDARD, Engine};
use uuid::Uuid;

use anchor_client::{
    api,
    backend::BackendClient,
    config::Config,
    registrar::IdentityRegistrar,
    signer::Signer,
    storage::{FileStore, IdentityStore},
    verifier::Verifier,
};
use anchor_core::{
    upp::{GENESIS_PREV_SIGNATURE, Hint, SignedUpp},
    EncryptedKeystore, PublicKey, Upp,
};

const DEVICE_UUID: &str = "d1b7eb09-d1d8-4c63-b6a5-1c861a6477fa";
const AUTH_TOKEN: &str = "ABC";
const REQUEST_ID: &str = "11111111-2222-3333-4444-555555555555";

// =============================================================================
// Stub backend
// =============================================================================

#[derive(Clone, Default)]
struct StubBackend {
    /// statuses to answer upcoming attestation calls with; empty means 200
    planned_statuses: Arc<Mutex<VecDeque<u16>>>,
    /// body served by the verification lookup endpoint
    lookup_body: Arc<Mutex<Option<Vec<u8>>>>,
}

/// The attestation reply is itself an envelope whose payload starts with
/// the 16-byte request id
fn response_upp() -> Vec<u8> {
    let request_id = Uuid::parse_str(REQUEST_ID).unwrap();
    let mut payload = request_id.as_bytes().to_vec();
    payload.extend_from_slice(b"stub");

    let upp = SignedUpp {
        uid: Uuid::new_v4(),
        hint: Hint::Binary,
        payload,
        signature: vec![0x99; 64],
    };
    upp.to_bytes().unwrap()
}

async fn stub_niomon(State(stub): State<StubBackend>, _body: Bytes) -> Response {
    let status = stub
        .planned_statuses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or(200);

    if status == 200 {
        (StatusCode::OK, response_upp()).into_response()
    } else {
        (StatusCode::from_u16(status).unwrap(), "stub backend error").into_response()
    }
}

async fn stub_key_service() -> StatusCode {
    StatusCode::OK
}

async fn stub_verify_lookup(State(stub): State<StubBackend>, _body: Bytes) -> Response {
    match stub.lookup_body.lock().unwrap().clone() {
        Some(body) => (StatusCode::OK, body).into_response(),
        None => (StatusCode::NOT_FOUND, "hash not found").into_response(),
    }
}

// =============================================================================
// Test application
// =============================================================================

struct TestApp {
    base: String,
    client: reqwest::Client,
    stub: StubBackend,
    store: Arc<dyn IdentityStore>,
    _dir: tempfile::TempDir,
}

async fn serve(router: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    format!("http://{addr}")
}

async fn spawn_app() -> TestApp {
    let stub = StubBackend::default();
    let stub_router = Router::new()
        .route("/", post(stub_niomon))
        .route("/pubkey", post(stub_key_service))
        .route("/upp", post(stub_verify_lookup))
        .with_state(stub.clone());
    let stub_base = serve(stub_router).await;

    let dir = tempfile::tempdir().unwrap();
    let device = Uuid::parse_str(DEVICE_UUID).unwrap();

    let mut config = Config::default();
    config.devices = [(device, AUTH_TOKEN.to_string())].into();
    config.secret_bytes = [0x42; 16];
    config.request_buffer_size = 30;
    config.key_service = format!("{stub_base}/pubkey");
    config.niomon = format!("{stub_base}/");
    config.verify_service = format!("{stub_base}/upp");

    let keystore = EncryptedKeystore::new(&config.secret_bytes);
    let store: Arc<dyn IdentityStore> = Arc::new(FileStore::new(dir.path()).unwrap());
    let backend = BackendClient::new(&config);

    let registrar = IdentityRegistrar::new(
        store.clone(),
        keystore.clone(),
        backend.clone(),
        "DE".into(),
        "ubirch GmbH".into(),
        false,
    );
    registrar
        .init_identities(&config.devices, &config.keys)
        .await
        .unwrap();

    let signer = Signer::new(
        store.clone(),
        keystore,
        backend.clone(),
        config.request_buffer_size,
    );
    let verifier = Verifier::new(store.clone(), backend);

    let state = Arc::new(api::AppState {
        signer,
        verifier,
        registrar,
        store: store.clone(),
        device_count: config.devices.len(),
    });
    let base = serve(api::create_router(state, &config)).await;

    TestApp {
        base,
        client: reqwest::Client::new(),
        stub,
        store,
        _dir: dir,
    }
}

#[derive(serde::Deserialize)]
struct ReceiptJson {
    #[serde(default)]
    error: Option<String>,
    hash: String,
    upp: String,
    response: BackendResponseJson,
    #[serde(rename = "requestID")]
    request_id: String,
}

#[derive(serde::Deserialize)]
struct BackendResponseJson {
    #[serde(rename = "statusCode")]
    status_code: u16,
}

impl ReceiptJson {
    fn upp_bytes(&self) -> Vec<u8> {
        STANDARD.decode(&self.upp).unwrap()
    }

    fn hash_bytes(&self) -> Vec<u8> {
        STANDARD.decode(&self.hash).unwrap()
    }
}

impl TestApp {
    async fn post(
        &self,
        path: &str,
        token: &str,
        content_type: &str,
        body: Vec<u8>,
    ) -> reqwest::Response {
        self.client
            .post(format!("{}{}", self.base, path))
            .header("X-Auth-Token", token)
            .header("Content-Type", content_type)
            .body(body)
            .send()
            .await
            .unwrap()
    }

    async fn anchor_chained(&self, data: &[u8]) -> ReceiptJson {
        let response = self
            .post(
                &format!("/{DEVICE_UUID}"),
                AUTH_TOKEN,
                "application/octet-stream",
                data.to_vec(),
            )
            .await;
        assert_eq!(response.status(), 200);
        response.json().await.unwrap()
    }

    async fn device_public_key(&self) -> PublicKey {
        let uid = Uuid::parse_str(DEVICE_UUID).unwrap();
        let pem = self.store.get_public_key(uid).await.unwrap();
        PublicKey::from_pem(&pem).unwrap()
    }

    fn plan_backend_status(&self, status: u16) {
        self.stub.planned_statuses.lock().unwrap().push_back(status);
    }
}

fn chained_prev_signature(upp_bytes: &[u8]) -> Vec<u8> {
    match Upp::from_bytes(upp_bytes).unwrap() {
        Upp::Chained(upp) => upp.prev_signature,
        Upp::Signed(_) => panic!("expected a chained envelope"),
    }
}

fn envelope_signature(upp_bytes: &[u8]) -> Vec<u8> {
    Upp::from_bytes(upp_bytes).unwrap().signature().to_vec()
}

// =============================================================================
// Scenarios
// =============================================================================

#[tokio::test]
async fn test_signed_anchor_returns_verifiable_receipt() {
    let app = spawn_app().await;

    let mut body = vec![0u8; 32];
    body[31] = 0x01;
    let response = app
        .post(
            &format!("/{DEVICE_UUID}/anchor"),
            AUTH_TOKEN,
            "application/octet-stream",
            body,
        )
        .await;
    assert_eq!(response.status(), 200);

    let receipt: ReceiptJson = response.json().await.unwrap();
    assert_eq!(receipt.response.status_code, 200);
    assert_eq!(receipt.request_id, REQUEST_ID);
    assert!(receipt.error.is_none());
    assert_eq!(receipt.hash_bytes().len(), 32);

    // the envelope ends with a 64-byte signature that verifies under the
    // registered public key
    let upp_bytes = receipt.upp_bytes();
    let decoded = Upp::from_bytes(&upp_bytes).unwrap();
    assert!(matches!(decoded, Upp::Signed(_)));
    assert_eq!(decoded.signature().len(), 64);
    assert_eq!(&upp_bytes[upp_bytes.len() - 64..], decoded.signature());

    decoded.verify(&app.device_public_key().await).unwrap();
}

#[tokio::test]
async fn test_chained_envelopes_link() {
    let app = spawn_app().await;

    let first = app.anchor_chained(b"first measurement").await;
    let second = app.anchor_chained(b"second measurement").await;

    let first_bytes = first.upp_bytes();
    let second_bytes = second.upp_bytes();

    // genesis link
    assert_eq!(
        chained_prev_signature(&first_bytes),
        GENESIS_PREV_SIGNATURE.to_vec()
    );

    // the second envelope carries the first one's signature, which is also
    // the trailing 64 bytes of the first envelope
    assert_eq!(
        chained_prev_signature(&second_bytes),
        envelope_signature(&first_bytes)
    );
    assert_eq!(
        chained_prev_signature(&second_bytes),
        first_bytes[first_bytes.len() - 64..].to_vec()
    );

    Upp::from_bytes(&second_bytes)
        .unwrap()
        .verify(&app.device_public_key().await)
        .unwrap();
}

#[tokio::test]
async fn test_failed_dispatch_does_not_advance_tip() {
    let app = spawn_app().await;

    app.plan_backend_status(502);
    let response = app
        .post(
            &format!("/{DEVICE_UUID}"),
            AUTH_TOKEN,
            "application/octet-stream",
            b"doomed".to_vec(),
        )
        .await;
    assert_eq!(response.status(), 502);

    // the next chained envelope is still the genesis link
    let receipt = app.anchor_chained(b"retry").await;
    assert_eq!(
        chained_prev_signature(&receipt.upp_bytes()),
        GENESIS_PREV_SIGNATURE.to_vec()
    );
}

#[tokio::test]
async fn test_backend_rejection_is_proxied_and_keeps_tip() {
    let app = spawn_app().await;

    app.plan_backend_status(409);
    let response = app
        .post(
            &format!("/{DEVICE_UUID}"),
            AUTH_TOKEN,
            "application/octet-stream",
            b"rejected".to_vec(),
        )
        .await;
    // 4xx from the backend is proxied verbatim, with a receipt
    assert_eq!(response.status(), 409);
    let receipt: ReceiptJson = response.json().await.unwrap();
    assert_eq!(receipt.response.status_code, 409);
    assert!(receipt.error.is_some());

    // the rejected envelope did not advance the chain
    let next = app.anchor_chained(b"after rejection").await;
    assert_eq!(
        chained_prev_signature(&next.upp_bytes()),
        GENESIS_PREV_SIGNATURE.to_vec()
    );
}

#[tokio::test]
async fn test_signed_update_does_not_touch_the_chain() {
    let app = spawn_app().await;

    let response = app
        .post(
            &format!("/{DEVICE_UUID}/disable"),
            AUTH_TOKEN,
            "application/octet-stream",
            b"disable this hash".to_vec(),
        )
        .await;
    assert_eq!(response.status(), 200);

    let chained = app.anchor_chained(b"still genesis").await;
    assert_eq!(
        chained_prev_signature(&chained.upp_bytes()),
        GENESIS_PREV_SIGNATURE.to_vec()
    );
}

#[tokio::test]
async fn test_invalid_auth_token() {
    let app = spawn_app().await;

    let response = app
        .post(
            &format!("/{DEVICE_UUID}"),
            "WRONG",
            "application/octet-stream",
            b"data".to_vec(),
        )
        .await;

    assert_eq!(response.status(), 401);
    assert_eq!(response.text().await.unwrap(), "invalid auth token");
}

#[tokio::test]
async fn test_unknown_uuid() {
    let app = spawn_app().await;

    let response = app
        .post(
            "/00000000-0000-0000-0000-000000000000",
            AUTH_TOKEN,
            "application/octet-stream",
            b"data".to_vec(),
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_unknown_operation() {
    let app = spawn_app().await;

    let response = app
        .post(
            &format!("/{DEVICE_UUID}/frobnicate"),
            AUTH_TOKEN,
            "application/octet-stream",
            b"data".to_vec(),
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_malformed_hash_rejected() {
    let app = spawn_app().await;

    let response = app
        .post(
            &format!("/{DEVICE_UUID}/hash"),
            AUTH_TOKEN,
            "application/octet-stream",
            vec![0u8; 31],
        )
        .await;

    assert_eq!(response.status(), 400);
}

#[tokio::test]
async fn test_json_key_order_does_not_change_the_payload() {
    let app = spawn_app().await;

    let first = app
        .post(
            &format!("/{DEVICE_UUID}"),
            AUTH_TOKEN,
            "application/json",
            br#"{"b": 2, "a": 1}"#.to_vec(),
        )
        .await;
    assert_eq!(first.status(), 200);
    let first: ReceiptJson = first.json().await.unwrap();

    let second = app
        .post(
            &format!("/{DEVICE_UUID}"),
            AUTH_TOKEN,
            "application/json",
            br#"{"a":1,"b":2}"#.to_vec(),
        )
        .await;
    assert_eq!(second.status(), 200);
    let second: ReceiptJson = second.json().await.unwrap();

    assert_eq!(first.hash, second.hash);
    assert_eq!(
        Upp::from_bytes(&first.upp_bytes()).unwrap().payload(),
        Upp::from_bytes(&second.upp_bytes()).unwrap().payload()
    );
}

#[tokio::test]
async fn test_concurrent_chained_requests_form_a_strict_chain() {
    let app = Arc::new(spawn_app().await);
    const N: usize = 10;

    let mut handles = Vec::new();
    for i in 0..N {
        let app = app.clone();
        handles.push(tokio::spawn(async move {
            let mut hash = [0u8; 32];
            hash[0] = i as u8;
            let response = app
                .post(
                    &format!("/{DEVICE_UUID}/hash"),
                    AUTH_TOKEN,
                    "application/octet-stream",
                    hash.to_vec(),
                )
                .await;
            assert_eq!(response.status(), 200);
            let receipt: ReceiptJson = response.json().await.unwrap();
            receipt.upp_bytes()
        }));
    }

    let mut signatures = HashSet::new();
    let mut prev_signatures = Vec::new();
    for handle in handles {
        let upp_bytes = handle.await.unwrap();
        signatures.insert(envelope_signature(&upp_bytes));
        prev_signatures.push(chained_prev_signature(&upp_bytes));
    }

    // no two envelopes observed the same predecessor
    let distinct: HashSet<_> = prev_signatures.iter().cloned().collect();
    assert_eq!(distinct.len(), N);

    // exactly one genesis link; every other predecessor is one of the
    // emitted signatures
    let genesis = GENESIS_PREV_SIGNATURE.to_vec();
    assert_eq!(
        prev_signatures.iter().filter(|p| **p == genesis).count(),
        1
    );
    for prev in prev_signatures.iter().filter(|p| **p != genesis) {
        assert!(signatures.contains(prev));
    }

    // the persisted tip is the one signature nothing chained onto
    let uid = Uuid::parse_str(DEVICE_UUID).unwrap();
    let tip = app.store.get_signature(uid).await.unwrap();
    assert!(signatures.contains(&tip));
    assert!(!distinct.contains(&tip));
}

#[tokio::test]
async fn test_verify_roundtrip() {
    let app = spawn_app().await;

    // anchor something, then teach the stub lookup service about it
    let receipt = app.anchor_chained(b"verify me").await;
    let lookup = serde_json::json!({ "upp": receipt.upp });
    *app.stub.lookup_body.lock().unwrap() = Some(serde_json::to_vec(&lookup).unwrap());

    let response = app
        .post(
            "/verify/hash",
            "",
            "application/octet-stream",
            receipt.hash_bytes(),
        )
        .await;
    assert_eq!(response.status(), 200);

    let verification: serde_json::Value = response.json().await.unwrap();
    assert_eq!(verification["uuid"], DEVICE_UUID);
    assert_eq!(verification["upp"], receipt.upp);
}

#[tokio::test]
async fn test_verify_unknown_hash() {
    let app = spawn_app().await;

    let response = app
        .post(
            "/verify/hash",
            "",
            "application/octet-stream",
            vec![0xeeu8; 32],
        )
        .await;

    assert_eq!(response.status(), 404);
}

#[tokio::test]
async fn test_late_registration_requires_database() {
    let app = spawn_app().await;

    let response = app
        .client
        .put(format!("{}/register", app.base))
        .json(&serde_json::json!({ "uuid": Uuid::new_v4(), "token": "XYZ" }))
        .send()
        .await
        .unwrap();

    // filesystem backing: late registration is rejected
    assert_eq!(response.status(), 400);
}
