//! Runtime configuration, read once at startup.
//!
//! Sources are layered with the `config` crate: built-in defaults, then an
//! optional file named by `MODEL_CONFIG_FILE`, then `MODEL_*` environment
//! variables. The result is validated into an immutable [`RuntimeConfig`]
//! that every component receives by reference.
//!
//! Errors name the offending key but never echo a value, so a misplaced secret
//! cannot leak through a log line.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

pub const ENV_PREFIX: &str = "MODEL";
pub const KEY_STORAGE_LOCATION: &str = "MODEL_STORAGE_LOCATION";
pub const KEY_REGION: &str = "MODEL_REGION";
pub const KEY_ARTIFACT_NAME: &str = "MODEL_ARTIFACT_NAME";
pub const KEY_ARTIFACT_VERSION: &str = "MODEL_ARTIFACT_VERSION";
pub const KEY_CREDENTIAL_ID: &str = "MODEL_CREDENTIAL_ID";
pub const KEY_CREDENTIAL_SECRET: &str = "MODEL_CREDENTIAL_SECRET";
pub const KEY_ARTIFACT_SHA256: &str = "MODEL_ARTIFACT_SHA256";
pub const KEY_CACHE_DIR: &str = "MODEL_CACHE_DIR";
pub const KEY_FETCH_TIMEOUT_SECS: &str = "MODEL_FETCH_TIMEOUT_SECS";
pub const KEY_FETCH_ATTEMPTS: &str = "MODEL_FETCH_ATTEMPTS";
pub const KEY_FETCH_BACKOFF_MS: &str = "MODEL_FETCH_BACKOFF_MS";
pub const KEY_LISTEN_ADDR: &str = "MODEL_LISTEN_ADDR";
pub const KEY_INFERENCE_WORKERS: &str = "MODEL_INFERENCE_WORKERS";
pub const KEY_CONFIG_FILE: &str = "MODEL_CONFIG_FILE";

pub const DEFAULT_CACHE_DIR: &str = "/var/cache/model-artifacts";
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";
const DEFAULT_FETCH_TIMEOUT_SECS: u64 = 60;
const DEFAULT_FETCH_ATTEMPTS: u32 = 3;
const DEFAULT_FETCH_BACKOFF_MS: u64 = 200;
const MAX_FETCH_ATTEMPTS: u32 = 10;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required configuration key {0}")]
    Missing(&'static str),
    #[error("invalid value for configuration key {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
    #[error("configuration source could not be read: {0}")]
    Source(String),
}

impl From<config::ConfigError> for ConfigError {
    fn from(e: config::ConfigError) -> Self { ConfigError::Source(e.to_string()) }
}

/// A credential value that never prints itself.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self { Self(value.into()) }
    pub fn expose(&self) -> &str { &self.0 }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("Secret(***)") }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str("***") }
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub id: String,
    pub secret: Secret,
}

/// Where artifacts are fetched from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageLocation {
    /// `http://` or `https://` bucket endpoint; keys are appended as path segments.
    Http { base_url: String },
    /// `file://` URL or plain directory path, used for local mirrors.
    Filesystem { root: PathBuf },
}

impl StorageLocation {
    pub fn parse(raw: &str) -> Result<Self, ConfigError> {
        let raw = raw.trim();
        if raw.starts_with("http://") || raw.starts_with("https://") {
            return Ok(StorageLocation::Http { base_url: raw.trim_end_matches('/').to_string() });
        }
        if let Some(path) = raw.strip_prefix("file://") {
            if path.is_empty() { return Err(invalid(KEY_STORAGE_LOCATION, "file:// location has no path")); }
            return Ok(StorageLocation::Filesystem { root: PathBuf::from(path) });
        }
        if raw.contains("://") {
            return Err(invalid(KEY_STORAGE_LOCATION, "unsupported scheme, expected http(s):// or file://"));
        }
        Ok(StorageLocation::Filesystem { root: PathBuf::from(raw) })
    }
}

impl fmt::Display for StorageLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StorageLocation::Http { base_url } => f.write_str(base_url),
            StorageLocation::Filesystem { root } => write!(f, "file://{}", root.display()),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    pub storage: StorageLocation,
    pub region: String,
    pub artifact_name: String,
    pub artifact_version: String,
    pub credentials: Credentials,
    /// Expected lowercase hex SHA-256 of the predictor blob.
    pub artifact_sha256: Option<String>,
    pub cache_dir: PathBuf,
    pub fetch_timeout: Duration,
    pub fetch_attempts: u32,
    pub fetch_backoff: Duration,
    pub listen_addr: SocketAddr,
    pub inference_workers: usize,
}

// Everything is read as text so parse failures can be reported per key
// without the value.
#[derive(Debug, Default, Deserialize)]
struct RawConfig {
    storage_location: Option<String>,
    region: Option<String>,
    artifact_name: Option<String>,
    artifact_version: Option<String>,
    credential_id: Option<String>,
    credential_secret: Option<String>,
    artifact_sha256: Option<String>,
    cache_dir: Option<String>,
    fetch_timeout_secs: Option<String>,
    fetch_attempts: Option<String>,
    fetch_backoff_ms: Option<String>,
    listen_addr: Option<String>,
    inference_workers: Option<String>,
}

impl RuntimeConfig {
    /// Read and validate configuration from the process environment.
    pub fn load() -> Result<Self, ConfigError> { Self::load_from(std::env::vars().collect()) }

    /// Same as [`RuntimeConfig::load`] with an explicit variable map in place of the process environment.
    pub fn load_from(vars: HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut builder = config::Config::builder();
        if let Some(file) = vars.get(KEY_CONFIG_FILE).filter(|f| !f.trim().is_empty()) {
            builder = builder.add_source(config::File::with_name(file).required(false));
        }
        let env_vars: config::Map<String, String> = vars.into_iter().collect();
        builder = builder.add_source(config::Environment::with_prefix(ENV_PREFIX).source(Some(env_vars)));
        let raw: RawConfig = builder.build()?.try_deserialize()?;
        Self::validate(raw)
    }

    fn validate(raw: RawConfig) -> Result<Self, ConfigError> {
        let storage = StorageLocation::parse(&required(raw.storage_location, KEY_STORAGE_LOCATION)?)?;
        let region = required(raw.region, KEY_REGION)?;
        let artifact_name = path_component(required(raw.artifact_name, KEY_ARTIFACT_NAME)?, KEY_ARTIFACT_NAME)?;
        let artifact_version = path_component(required(raw.artifact_version, KEY_ARTIFACT_VERSION)?, KEY_ARTIFACT_VERSION)?;
        let credentials = Credentials {
            id: required(raw.credential_id, KEY_CREDENTIAL_ID)?,
            secret: Secret::new(required(raw.credential_secret, KEY_CREDENTIAL_SECRET)?),
        };

        let artifact_sha256 = match optional(raw.artifact_sha256) {
            None => None,
            Some(h) if h.len() == 64 && h.chars().all(|c| c.is_ascii_hexdigit()) => Some(h.to_ascii_lowercase()),
            Some(_) => return Err(invalid(KEY_ARTIFACT_SHA256, "expected 64 hex characters")),
        };

        let fetch_timeout_secs: u64 = parse_or(raw.fetch_timeout_secs, KEY_FETCH_TIMEOUT_SECS, DEFAULT_FETCH_TIMEOUT_SECS)?;
        if fetch_timeout_secs == 0 { return Err(invalid(KEY_FETCH_TIMEOUT_SECS, "must be greater than zero")); }
        let fetch_attempts: u32 = parse_or(raw.fetch_attempts, KEY_FETCH_ATTEMPTS, DEFAULT_FETCH_ATTEMPTS)?;
        if !(1..=MAX_FETCH_ATTEMPTS).contains(&fetch_attempts) {
            return Err(invalid(KEY_FETCH_ATTEMPTS, format!("must be between 1 and {MAX_FETCH_ATTEMPTS}")));
        }
        let fetch_backoff_ms: u64 = parse_or(raw.fetch_backoff_ms, KEY_FETCH_BACKOFF_MS, DEFAULT_FETCH_BACKOFF_MS)?;
        let listen_addr: SocketAddr = match optional(raw.listen_addr) {
            Some(v) => v.parse().map_err(|_| invalid(KEY_LISTEN_ADDR, "expected host:port socket address"))?,
            None => default_listen_addr(),
        };
        let default_workers = std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4);
        let inference_workers: usize = parse_or(raw.inference_workers, KEY_INFERENCE_WORKERS, default_workers)?;
        if inference_workers == 0 { return Err(invalid(KEY_INFERENCE_WORKERS, "must be greater than zero")); }

        Ok(Self {
            storage,
            region,
            artifact_name,
            artifact_version,
            credentials,
            artifact_sha256,
            cache_dir: optional(raw.cache_dir).map(PathBuf::from).unwrap_or_else(|| PathBuf::from(DEFAULT_CACHE_DIR)),
            fetch_timeout: Duration::from_secs(fetch_timeout_secs),
            fetch_attempts,
            fetch_backoff: Duration::from_millis(fetch_backoff_ms),
            listen_addr,
            inference_workers,
        })
    }
}

/// Bind address used when full configuration failed to load; probes must still come up.
pub fn fallback_listen_addr() -> SocketAddr {
    std::env::var(KEY_LISTEN_ADDR).ok().and_then(|v| v.parse().ok()).unwrap_or_else(default_listen_addr)
}

fn default_listen_addr() -> SocketAddr { SocketAddr::from(([0, 0, 0, 0], 8080)) }

fn invalid(key: &'static str, reason: impl Into<String>) -> ConfigError { ConfigError::Invalid { key, reason: reason.into() } }

fn optional(v: Option<String>) -> Option<String> {
    v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
}

fn required(v: Option<String>, key: &'static str) -> Result<String, ConfigError> {
    optional(v).ok_or(ConfigError::Missing(key))
}

fn parse_or<T: std::str::FromStr>(v: Option<String>, key: &'static str, default: T) -> Result<T, ConfigError> {
    match optional(v) {
        None => Ok(default),
        Some(s) => s.parse().map_err(|_| invalid(key, format!("expected {}", std::any::type_name::<T>()))),
    }
}

// Names and versions become cache directories, so they must not escape the cache root.
fn path_component(v: String, key: &'static str) -> Result<String, ConfigError> {
    let ok = v != "." && v != ".." && v.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
    if ok { Ok(v) } else { Err(invalid(key, "only ASCII letters, digits, '.', '_' and '-' are allowed")) }
}
