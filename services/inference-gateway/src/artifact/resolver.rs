//! Guarantees a verified local copy of an artifact.
//!
//! A valid cache entry short-circuits with no remote call. Otherwise the
//! object is streamed into a temporary file in the destination directory,
//! hashed on the way, verified, synced and renamed into place. Dropping an
//! in-flight download (timeout, shutdown) drops the temporary file with it, so
//! the cache path only ever holds the previous file or a complete new one.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serving_core::{serving_metrics, RuntimeConfig};
use serving_resilience::{retry_async, RetryPolicy};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, instrument, warn};

use super::{store_for, ArtifactDescriptor, ArtifactPaths, ArtifactSet, FetchError, ObjectStore, StoreError};

pub struct ArtifactResolver {
    store: Arc<dyn ObjectStore>,
    policy: RetryPolicy,
    timeout: Duration,
}

impl ArtifactResolver {
    pub fn new(store: Arc<dyn ObjectStore>, policy: RetryPolicy, timeout: Duration) -> Self {
        Self { store, policy, timeout }
    }

    pub fn from_config(cfg: &RuntimeConfig) -> Result<Self, StoreError> {
        let policy = RetryPolicy { max_attempts: cfg.fetch_attempts, base_delay: cfg.fetch_backoff, ..RetryPolicy::default() };
        Ok(Self::new(store_for(cfg)?, policy, cfg.fetch_timeout))
    }

    /// Resolve both files of a deployment.
    pub async fn resolve_set(&self, set: &ArtifactSet) -> Result<ArtifactPaths, FetchError> {
        let (model, schema) = futures::try_join!(self.resolve(&set.model), self.resolve(&set.schema))?;
        Ok(ArtifactPaths { model, schema })
    }

    #[instrument(skip(self, descriptor), fields(key = %descriptor.remote_key))]
    pub async fn resolve(&self, descriptor: &ArtifactDescriptor) -> Result<PathBuf, FetchError> {
        let lookups = &serving_metrics().artifacts.cache_lookups_total;
        if cache_is_valid(descriptor).await {
            lookups.with_label_values(&["hit"]).inc();
            debug!(path = %descriptor.cache_path.display(), "artifact cache hit");
            return Ok(descriptor.cache_path.clone());
        }
        lookups.with_label_values(&["miss"]).inc();
        info!(path = %descriptor.cache_path.display(), "artifact cache miss, fetching");

        retry_async(&self.policy, move |attempt| self.fetch_once(descriptor, attempt), StoreError::is_retryable)
            .await
            .map_err(|gave_up| FetchError { key: descriptor.remote_key.clone(), attempts: gave_up.attempts, cause: gave_up.last })
    }

    async fn fetch_once(&self, descriptor: &ArtifactDescriptor, attempt: u32) -> Result<PathBuf, StoreError> {
        let result = match tokio::time::timeout(self.timeout, self.download(descriptor)).await {
            Ok(r) => r,
            Err(_) => Err(StoreError::Timeout(self.timeout)),
        };
        let outcome = match &result { Ok(_) => "ok", Err(e) => e.label() };
        serving_metrics().artifacts.fetch_attempts_total.with_label_values(&[outcome]).inc();
        if result.is_ok() { info!(attempt = attempt + 1, "artifact fetched and verified"); }
        result
    }

    async fn download(&self, descriptor: &ArtifactDescriptor) -> Result<PathBuf, StoreError> {
        let dir = descriptor.cache_path.parent().unwrap_or_else(|| Path::new("."));
        tokio::fs::create_dir_all(dir).await?;

        let object = self.store.get(&descriptor.remote_key).await?;
        let (tmp, std_file) = {
            let dir = dir.to_path_buf();
            tokio::task::spawn_blocking(move || -> io::Result<_> {
                let tmp = tempfile::Builder::new().prefix(".fetch-").suffix(".part").tempfile_in(&dir)?;
                let file = tmp.as_file().try_clone()?;
                Ok((tmp, file))
            }).await.map_err(join_error)??
        };
        let mut file = tokio::fs::File::from_std(std_file);
        let mut hasher = Sha256::new();
        let mut body = object.body;
        while let Some(chunk) = body.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let actual = hex::encode(hasher.finalize());
        for expected in [descriptor.checksum.as_deref(), object.checksum.as_deref()].into_iter().flatten() {
            if !expected.eq_ignore_ascii_case(&actual) {
                return Err(StoreError::Integrity { expected: expected.to_string(), actual });
            }
        }

        let known = descriptor.checksum.is_some() || object.checksum.is_some();
        let (cache_path, sidecar, dir) = (descriptor.cache_path.clone(), descriptor.checksum_path(), dir.to_path_buf());
        tokio::task::spawn_blocking(move || commit(tmp, &cache_path, &sidecar, known.then_some(actual), &dir))
            .await
            .map_err(join_error)??;
        Ok(descriptor.cache_path.clone())
    }
}

/// Sidecar first, then the artifact: a crash between the two renames leaves an
/// old file that no longer matches, which forces a refetch next time. With no
/// checksum known, a leftover sidecar from an earlier fetch is removed so it
/// cannot fail every later cache check.
fn commit(tmp: NamedTempFile, cache_path: &Path, sidecar: &Path, checksum: Option<String>, dir: &Path) -> io::Result<()> {
    match checksum {
        Some(sum) => write_atomically(sidecar, sum.as_bytes(), dir)?,
        None => match std::fs::remove_file(sidecar) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(e),
        },
    }
    tmp.persist(cache_path).map_err(|e| e.error)?;
    Ok(())
}

fn join_error(e: tokio::task::JoinError) -> StoreError {
    StoreError::Io(io::Error::new(io::ErrorKind::Other, e))
}

fn write_atomically(path: &Path, contents: &[u8], dir: &Path) -> io::Result<()> {
    use std::io::Write;
    let mut tmp = tempfile::Builder::new().prefix(".sum-").suffix(".part").tempfile_in(dir)?;
    tmp.write_all(contents)?;
    tmp.as_file().sync_all()?;
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}

/// Present, and matching whichever checksum is known: the configured one, or
/// the one recorded from storage metadata at the last fetch.
async fn cache_is_valid(descriptor: &ArtifactDescriptor) -> bool {
    match tokio::fs::metadata(&descriptor.cache_path).await {
        Ok(meta) if meta.is_file() => {}
        _ => return false,
    }
    let expected = match &descriptor.checksum {
        Some(c) => Some(c.clone()),
        None => tokio::fs::read_to_string(descriptor.checksum_path()).await.ok().map(|s| s.trim().to_ascii_lowercase()),
    };
    let Some(expected) = expected else { return true };
    let path = descriptor.cache_path.clone();
    match tokio::task::spawn_blocking(move || sha256_file(&path)).await {
        Ok(Ok(actual)) if actual.eq_ignore_ascii_case(&expected) => true,
        Ok(Ok(actual)) => { warn!(%expected, %actual, "cached artifact checksum mismatch"); false }
        Ok(Err(e)) => { warn!(error = %e, "cached artifact unreadable"); false }
        Err(e) => { warn!(error = %e, "checksum task failed"); false }
    }
}

fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}
