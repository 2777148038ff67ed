//! Trust-anchor client binary
//!
//! Initialization order matters: decrypt-capable keystore first, then the
//! identity store, then the backend client, then the HTTP bind. The
//! registrar runs in between so the server never accepts requests for
//! unregistered identities.

use std::env;
use std::path::Path;
use std::sync::Arc;

use tracing::{info, Level};

use anchor_client::{
    api, backend::BackendClient, config::Config, registrar::IdentityRegistrar, signer::Signer,
    storage::{FileStore, IdentityStore, PostgresStore},
    verifier::Verifier,
};
use anchor_core::EncryptedKeystore;

fn init_logging(config: &Config) {
    let level = if config.debug {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let builder = tracing_subscriber::fmt()
        .with_max_level(level)
        .with_target(true);

    if config.log_text_format {
        builder.init();
    } else {
        builder.json().init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install SIGINT handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    info!("shutting down after receiving a termination signal");
}

#[tokio::main]
async fn main() {
    let config_dir = env::args().nth(1).unwrap_or_else(|| ".".into());
    let config = Config::load(Path::new(&config_dir)).expect("error loading configuration");

    init_logging(&config);
    info!(
        version = env!("CARGO_PKG_VERSION"),
        env = %config.env,
        devices = config.devices.len(),
        "starting trust-anchor client"
    );

    let keystore = EncryptedKeystore::new(&config.secret_bytes);

    let store: Arc<dyn IdentityStore> = if config.dsn.is_empty() {
        info!(dir = %config.config_dir.display(), "using filesystem identity store");
        Arc::new(FileStore::new(&config.config_dir).expect("unable to open identity store"))
    } else {
        info!("using database identity store");
        Arc::new(
            PostgresStore::new(&config.dsn)
                .await
                .expect("unable to open database"),
        )
    };

    let backend = BackendClient::new(&config);

    let registrar = IdentityRegistrar::new(
        store.clone(),
        keystore.clone(),
        backend.clone(),
        config.csr_country.clone(),
        config.csr_organization.clone(),
        config.static_keys,
    );
    registrar
        .init_identities(&config.devices, &config.keys)
        .await
        .expect("identity registration failed");

    let signer = Signer::new(
        store.clone(),
        keystore.clone(),
        backend.clone(),
        config.request_buffer_size,
    );
    let verifier = Verifier::new(store.clone(), backend);

    let state = Arc::new(api::AppState {
        signer,
        verifier,
        registrar,
        store,
        device_count: config.devices.len(),
    });
    let app = api::create_router(state, &config);

    let addr = config.listen_addr().expect("invalid listen address");

    if config.tls {
        info!(addr = %addr, "listening with TLS");
        let tls_config = axum_server::tls_rustls::RustlsConfig::from_pem_file(
            &config.tls_cert_file,
            &config.tls_key_file,
        )
        .await
        .expect("unable to load TLS certificate or key");

        let handle = axum_server::Handle::new();
        let shutdown_handle = handle.clone();
        tokio::spawn(async move {
            shutdown_signal().await;
            shutdown_handle.graceful_shutdown(None);
        });

        axum_server::bind_rustls(addr, tls_config)
            .handle(handle)
            .serve(app.into_make_service())
            .await
            .expect("server error");
    } else {
        info!(addr = %addr, "listening");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .expect("failed to bind listen address");

        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown_signal())
            .await
            .expect("server error");
    }
}
