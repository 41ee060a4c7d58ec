//! Versioned model artifacts: where they live remotely, where they are cached,
//! and how fetching them can fail.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serving_core::RuntimeConfig;
use thiserror::Error;

mod resolver;
mod store;

pub use resolver::ArtifactResolver;
pub use store::{store_for, ByteStream, FsObjectStore, HttpObjectStore, ObjectStore, RemoteObject};

pub const MODEL_FILE: &str = "model.bin";
pub const SCHEMA_FILE: &str = "features.json";
pub const CHECKSUM_SUFFIX: &str = ".sha256";

/// One remotely stored file and its fixed slot in the local cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactDescriptor {
    pub name: String,
    pub version: String,
    /// Object key inside the storage namespace: `<name>/<version>/<file>`.
    pub remote_key: String,
    /// `<cache_dir>/<name>/<version>/<file>`.
    pub cache_path: PathBuf,
    /// Expected lowercase hex SHA-256, when known up front.
    pub checksum: Option<String>,
}

impl ArtifactDescriptor {
    pub fn new(name: &str, version: &str, file: &str, cache_dir: &Path, checksum: Option<String>) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
            remote_key: format!("{name}/{version}/{file}"),
            cache_path: cache_dir.join(name).join(version).join(file),
            checksum,
        }
    }

    /// Sidecar holding the checksum recorded at the last verified fetch.
    pub fn checksum_path(&self) -> PathBuf {
        let mut p = self.cache_path.clone().into_os_string();
        p.push(CHECKSUM_SUFFIX);
        PathBuf::from(p)
    }
}

/// The predictor blob and its companion feature schema for one deployment.
#[derive(Debug, Clone)]
pub struct ArtifactSet {
    pub model: ArtifactDescriptor,
    pub schema: ArtifactDescriptor,
}

impl ArtifactSet {
    pub fn from_config(cfg: &RuntimeConfig) -> Self {
        Self {
            model: ArtifactDescriptor::new(&cfg.artifact_name, &cfg.artifact_version, MODEL_FILE, &cfg.cache_dir, cfg.artifact_sha256.clone()),
            schema: ArtifactDescriptor::new(&cfg.artifact_name, &cfg.artifact_version, SCHEMA_FILE, &cfg.cache_dir, None),
        }
    }
}

/// Verified local copies handed to the model loader.
#[derive(Debug, Clone)]
pub struct ArtifactPaths {
    pub model: PathBuf,
    pub schema: PathBuf,
}

/// Why a single fetch attempt failed.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("object {key} not found")]
    NotFound { key: String },
    #[error("access denied to object {key}")]
    AccessDenied { key: String },
    #[error("storage rejected request for {key} with status {status}")]
    Rejected { key: String, status: u16 },
    #[error("transient storage failure: {0}")]
    Transient(String),
    #[error("fetch timed out after {0:?}")]
    Timeout(Duration),
    #[error("checksum mismatch: expected {expected}, got {actual}")]
    Integrity { expected: String, actual: String },
    #[error("local cache i/o error: {0}")]
    Io(#[from] std::io::Error),
}

impl StoreError {
    /// Network hiccups, timeouts and corrupted transfers are worth another
    /// attempt; answers the store gave deliberately are not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StoreError::Transient(_) | StoreError::Timeout(_) | StoreError::Integrity { .. })
    }

    pub fn label(&self) -> &'static str {
        match self {
            StoreError::NotFound { .. } => "not_found",
            StoreError::AccessDenied { .. } => "access_denied",
            StoreError::Rejected { .. } => "rejected",
            StoreError::Transient(_) => "transient",
            StoreError::Timeout(_) => "timeout",
            StoreError::Integrity { .. } => "integrity",
            StoreError::Io(_) => "io",
        }
    }
}

/// Terminal failure to obtain a verified local copy.
#[derive(Debug, Error)]
#[error("failed to fetch {key} after {attempts} attempt(s): {cause}")]
pub struct FetchError {
    pub key: String,
    pub attempts: u32,
    pub cause: StoreError,
}
