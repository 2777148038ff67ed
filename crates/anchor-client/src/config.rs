//! Client configuration
//!
//! Configuration comes from `config.json` in the config directory or, when
//! `UBIRCH_SECRET` is set, from `UBIRCH_`-prefixed environment variables
//! (map-valued options are passed as JSON). Mixing both sources in one
//! startup is rejected rather than guessing precedence.
//!
//! The backend environment (`dev`, `demo`, `prod`) selects default URLs
//! for the key, attestation and verification services; explicit URLs win.

use std::collections::HashMap;
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;
use tracing::info;
use uuid::Uuid;

pub const DEV_STAGE: &str = "dev";
pub const DEMO_STAGE: &str = "demo";
pub const PROD_STAGE: &str = "prod";

const CONFIG_FILE: &str = "config.json";
const ENV_PREFIX: &str = "UBIRCH_";

/// Length the decoded keystore secret must have
pub const SECRET_LEN: usize = 16;

const DEFAULT_CSR_COUNTRY: &str = "DE";
const DEFAULT_CSR_ORGANIZATION: &str = "ubirch GmbH";
const DEFAULT_TCP_ADDR: &str = ":8080";
const DEFAULT_REQUEST_BUFFER_SIZE: usize = 30;

/// Configuration load/validation errors; all of them are fatal at startup
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("unable to read configuration file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse configuration: {0}")]
    Parse(String),

    #[error("both a config file and UBIRCH_ environment variables are present; remove one source")]
    MixedSources,

    #[error("there are no devices authorized to use this client; set at least one device UUID and auth token")]
    NoDevices,

    #[error("secret length must be {SECRET_LEN} bytes (is {0})")]
    BadSecretLength(usize),

    #[error("unable to decode base64 encoded secret: {0}")]
    BadSecret(#[from] base64::DecodeError),

    #[error("invalid backend environment: \"{0}\"")]
    InvalidEnv(String),

    #[error("invalid listen address \"{0}\": {1}")]
    BadListenAddr(String, String),

    #[error("TLS is enabled but {0} is not set")]
    MissingTlsFile(&'static str),
}

/// Recognized configuration options
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Maps device UUIDs to backend auth tokens; mandatory, non-empty
    pub devices: HashMap<Uuid, String>,
    /// Base64 encoded 16-byte secret for the encrypted keystore
    pub secret: String,
    /// Pre-injected private keys (base64 PKCS#8 DER) per UUID
    pub keys: HashMap<Uuid, String>,
    /// Only accept UUIDs with injected keys; disables key generation
    #[serde(rename = "staticKeys")]
    pub static_keys: bool,
    /// Backend environment: dev | demo | prod, defaults to prod
    pub env: String,
    /// SQL data source name; empty selects the filesystem backing
    #[serde(rename = "DSN")]
    pub dsn: String,
    /// CSR subject country
    #[serde(rename = "CSR_country")]
    pub csr_country: String,
    /// CSR subject organization
    #[serde(rename = "CSR_organization")]
    pub csr_organization: String,
    /// Listen address, Go style (":8080" binds all interfaces)
    #[serde(rename = "TCP_addr")]
    pub tcp_addr: String,
    #[serde(rename = "TLS")]
    pub tls: bool,
    #[serde(rename = "TLSCertFile")]
    pub tls_cert_file: String,
    #[serde(rename = "TLSKeyFile")]
    pub tls_key_file: String,
    #[serde(rename = "CORS")]
    pub cors: bool,
    #[serde(rename = "CORS_origins")]
    pub cors_origins: Vec<String>,
    /// Concurrency budget in front of the chain signer
    #[serde(rename = "RequestBufferSize")]
    pub request_buffer_size: usize,
    pub debug: bool,
    /// Human-readable text logs instead of JSON
    #[serde(rename = "logTextFormat")]
    pub log_text_format: bool,

    /// Key service URL; derived from `env` when empty
    #[serde(rename = "keyService")]
    pub key_service: String,
    /// Attestation service URL; derived from `env` when empty
    pub niomon: String,
    /// Verification service URL; derived from `env` when empty
    #[serde(rename = "verifyService")]
    pub verify_service: String,

    /// Decoded keystore secret
    #[serde(skip)]
    pub secret_bytes: [u8; SECRET_LEN],
    /// Directory the config was loaded from; identity files live here
    #[serde(skip)]
    pub config_dir: PathBuf,
}

impl Config {
    /// Load the configuration from `config.json` in `config_dir`, or from
    /// the environment when `UBIRCH_SECRET` is set
    pub fn load(config_dir: &Path) -> Result<Self, ConfigError> {
        let env_source = env::var(format!("{ENV_PREFIX}SECRET")).is_ok();
        let file_path = config_dir.join(CONFIG_FILE);

        if env_source && file_path.exists() {
            return Err(ConfigError::MixedSources);
        }

        let mut config = if env_source {
            info!("loading configuration from environment variables");
            Self::load_env()?
        } else {
            info!(path = %file_path.display(), "loading configuration from file");
            Self::load_file(&file_path)?
        };

        config.config_dir = config_dir.to_path_buf();
        config.finalize()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read(path)?;
        serde_json::from_slice(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn load_env() -> Result<Self, ConfigError> {
        fn var(name: &str) -> Option<String> {
            env::var(format!("{ENV_PREFIX}{name}")).ok()
        }
        fn json_var<T: serde::de::DeserializeOwned + Default>(
            name: &str,
        ) -> Result<T, ConfigError> {
            match var(name) {
                Some(raw) => serde_json::from_str(&raw)
                    .map_err(|e| ConfigError::Parse(format!("{ENV_PREFIX}{name}: {e}"))),
                None => Ok(T::default()),
            }
        }
        fn bool_var(name: &str) -> bool {
            var(name).map(|v| v == "true" || v == "1").unwrap_or(false)
        }

        Ok(Config {
            devices: json_var("DEVICES")?,
            secret: var("SECRET").unwrap_or_default(),
            keys: json_var("KEYS")?,
            static_keys: bool_var("STATICKEYS"),
            env: var("ENV").unwrap_or_default(),
            dsn: var("DSN").unwrap_or_default(),
            csr_country: var("CSR_COUNTRY").unwrap_or_default(),
            csr_organization: var("CSR_ORGANIZATION").unwrap_or_default(),
            tcp_addr: var("TCP_ADDR").unwrap_or_default(),
            tls: bool_var("TLS"),
            tls_cert_file: var("TLSCERTFILE").unwrap_or_default(),
            tls_key_file: var("TLSKEYFILE").unwrap_or_default(),
            cors: bool_var("CORS"),
            cors_origins: json_var("CORS_ORIGINS")?,
            request_buffer_size: var("REQUESTBUFFERSIZE")
                .and_then(|v| v.parse().ok())
                .unwrap_or(0),
            debug: bool_var("DEBUG"),
            log_text_format: bool_var("LOGTEXTFORMAT"),
            key_service: var("KEYSERVICE").unwrap_or_default(),
            niomon: var("NIOMON").unwrap_or_default(),
            verify_service: var("VERIFYSERVICE").unwrap_or_default(),
            secret_bytes: [0u8; SECRET_LEN],
            config_dir: PathBuf::new(),
        })
    }

    /// Decode the secret, validate mandatory options and fill defaults
    fn finalize(&mut self) -> Result<(), ConfigError> {
        use base64::{engine::general_purpose::STANDARD, Engine};

        if self.devices.is_empty() {
            return Err(ConfigError::NoDevices);
        }
        info!(count = self.devices.len(), "loaded devices from configuration");

        let secret = STANDARD.decode(self.secret.as_bytes())?;
        if secret.len() != SECRET_LEN {
            return Err(ConfigError::BadSecretLength(secret.len()));
        }
        self.secret_bytes.copy_from_slice(&secret);

        if self.env.is_empty() {
            self.env = PROD_STAGE.into();
        }
        if !matches!(self.env.as_str(), DEV_STAGE | DEMO_STAGE | PROD_STAGE) {
            return Err(ConfigError::InvalidEnv(self.env.clone()));
        }
        info!(env = %self.env, "using backend environment");

        if self.key_service.is_empty() {
            self.key_service = format!(
                "https://key.{}.ubirch.com/api/keyService/v1/pubkey",
                self.env
            );
        }
        if self.niomon.is_empty() {
            self.niomon = format!("https://niomon.{}.ubirch.com/", self.env);
        }
        if self.verify_service.is_empty() {
            self.verify_service = format!("https://verify.{}.ubirch.com/api/upp", self.env);
        }

        if self.csr_country.is_empty() {
            self.csr_country = DEFAULT_CSR_COUNTRY.into();
        }
        if self.csr_organization.is_empty() {
            self.csr_organization = DEFAULT_CSR_ORGANIZATION.into();
        }
        if self.tcp_addr.is_empty() {
            self.tcp_addr = DEFAULT_TCP_ADDR.into();
        }
        if self.request_buffer_size == 0 {
            self.request_buffer_size = DEFAULT_REQUEST_BUFFER_SIZE;
        }

        if self.tls {
            if self.tls_cert_file.is_empty() {
                return Err(ConfigError::MissingTlsFile("TLSCertFile"));
            }
            if self.tls_key_file.is_empty() {
                return Err(ConfigError::MissingTlsFile("TLSKeyFile"));
            }
        }

        Ok(())
    }

    /// Resolve the Go-style listen address (":8080" means all interfaces)
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr = if self.tcp_addr.starts_with(':') {
            format!("0.0.0.0{}", self.tcp_addr)
        } else {
            self.tcp_addr.clone()
        };
        addr.parse()
            .map_err(|e: std::net::AddrParseError| {
                ConfigError::BadListenAddr(self.tcp_addr.clone(), e.to_string())
            })
    }
}
