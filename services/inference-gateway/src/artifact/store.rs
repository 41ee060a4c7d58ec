//! Remote object storage: get-by-key against a bucket-like namespace.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use serving_core::{Credentials, RuntimeConfig, StorageLocation};
use tokio::io::AsyncReadExt;

use super::{StoreError, CHECKSUM_SUFFIX};

pub type ByteStream = BoxStream<'static, Result<Vec<u8>, StoreError>>;

/// Response header carrying the object's hex SHA-256, when the store provides one.
pub const CHECKSUM_HEADER: &str = "x-checksum-sha256";
pub const REGION_HEADER: &str = "x-storage-region";
const READ_CHUNK: usize = 64 * 1024;

pub struct RemoteObject {
    /// Integrity metadata supplied by the store (lowercase hex SHA-256).
    pub checksum: Option<String>,
    pub body: ByteStream,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<RemoteObject, StoreError>;
}

/// Pick a backend for the configured storage location.
pub fn store_for(cfg: &RuntimeConfig) -> Result<Arc<dyn ObjectStore>, StoreError> {
    Ok(match &cfg.storage {
        StorageLocation::Http { base_url } => Arc::new(HttpObjectStore::new(base_url, &cfg.region, cfg.credentials.clone())?),
        StorageLocation::Filesystem { root } => Arc::new(FsObjectStore::new(root.clone())),
    })
}

pub struct HttpObjectStore {
    client: reqwest::Client,
    base_url: String,
    region: String,
    credentials: Credentials,
}

impl HttpObjectStore {
    pub fn new(base_url: &str, region: &str, credentials: Credentials) -> Result<Self, StoreError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| StoreError::Transient(e.without_url().to_string()))?;
        Ok(Self { client, base_url: base_url.trim_end_matches('/').to_string(), region: region.to_string(), credentials })
    }
}

#[async_trait]
impl ObjectStore for HttpObjectStore {
    async fn get(&self, key: &str) -> Result<RemoteObject, StoreError> {
        let url = format!("{}/{}", self.base_url, key);
        let resp = self.client.get(&url)
            .header(REGION_HEADER, &self.region)
            .basic_auth(&self.credentials.id, Some(self.credentials.secret.expose()))
            .send()
            .await
            .map_err(|e| StoreError::Transient(e.without_url().to_string()))?;
        let status = resp.status().as_u16();
        match status {
            200..=299 => {}
            404 => return Err(StoreError::NotFound { key: key.to_string() }),
            401 | 403 => return Err(StoreError::AccessDenied { key: key.to_string() }),
            408 | 429 | 500..=599 => return Err(StoreError::Transient(format!("storage answered {status} for {key}"))),
            _ => return Err(StoreError::Rejected { key: key.to_string(), status }),
        }
        let checksum = resp.headers().get(CHECKSUM_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(|v| v.trim().to_ascii_lowercase())
            .filter(|v| !v.is_empty());
        let body = resp.bytes_stream()
            .map(|chunk| chunk.map(|b| b.to_vec()).map_err(|e| StoreError::Transient(e.without_url().to_string())))
            .boxed();
        Ok(RemoteObject { checksum, body })
    }
}

/// Directory laid out like the bucket. A `<key>.sha256` file next to an
/// object is served as its integrity metadata.
pub struct FsObjectStore { root: PathBuf }

impl FsObjectStore {
    pub fn new(root: PathBuf) -> Self { Self { root } }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn get(&self, key: &str) -> Result<RemoteObject, StoreError> {
        let path = self.root.join(key);
        let file = tokio::fs::File::open(&path).await.map_err(|e| match e.kind() {
            ErrorKind::NotFound => StoreError::NotFound { key: key.to_string() },
            ErrorKind::PermissionDenied => StoreError::AccessDenied { key: key.to_string() },
            _ => StoreError::Transient(e.to_string()),
        })?;
        let checksum = tokio::fs::read_to_string(self.root.join(format!("{key}{CHECKSUM_SUFFIX}"))).await.ok()
            .map(|s| s.trim().to_ascii_lowercase())
            .filter(|s| !s.is_empty());
        let body = stream::unfold(Some(file), |state| async move {
            let mut file = state?;
            let mut buf = vec![0u8; READ_CHUNK];
            match file.read(&mut buf).await {
                Ok(0) => None,
                Ok(n) => { buf.truncate(n); Some((Ok(buf), Some(file))) }
                Err(e) => Some((Err(StoreError::Transient(e.to_string())), None)),
            }
        }).boxed();
        Ok(RemoteObject { checksum, body })
    }
}
