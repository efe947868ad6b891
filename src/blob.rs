//! Tier-2 blob stores for compressed cuboid objects

use crate::config::BlobConfig;
use crate::error::{BossError, Result};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Storage backend types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageBackend {
    Memory,
    FileSystem,
    /// Object service reached over HTTP
    Http,
}

impl StorageBackend {
    /// Parse storage backend from URL scheme
    pub fn from_url(url: &str) -> Result<Self> {
        if let Some(scheme_end) = url.find("://") {
            let scheme = &url[..scheme_end];
            match scheme {
                "memory" => Ok(StorageBackend::Memory),
                "file" => Ok(StorageBackend::FileSystem),
                "http" | "https" => Ok(StorageBackend::Http),
                _ => Err(BossError::validation(format!("Unknown scheme: {}", scheme))),
            }
        } else {
            Ok(StorageBackend::FileSystem)
        }
    }
}

/// Durable object storage keyed by blob object key
#[async_trait]
pub trait BlobStore: Send + Sync {
    /// Read an object; `None` if it does not exist
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    async fn put(&self, key: &str, data: Bytes) -> Result<()>;

    async fn exists(&self, key: &str) -> Result<bool>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Object keys starting with `prefix`, sorted
    async fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn backend(&self) -> StorageBackend;
}

/// In-memory blob store with optional failure injection
#[derive(Default)]
pub struct MemoryBlobStore {
    objects: RwLock<BTreeMap<String, Bytes>>,
    failures: AtomicU32,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` operations fail with a backend error
    pub fn fail_next(&self, n: u32) {
        self.failures.store(n, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_failure(&self) -> Result<()> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(BossError::backend("injected blob store failure"));
        }
        Ok(())
    }
}

#[async_trait]
impl BlobStore for MemoryBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.check_failure()?;
        Ok(self.objects.read().get(key).cloned())
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.check_failure()?;
        self.objects.write().insert(key.to_string(), data);
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.check_failure()?;
        Ok(self.objects.read().contains_key(key))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.check_failure()?;
        self.objects.write().remove(key);
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.check_failure()?;
        Ok(self
            .objects
            .read()
            .range(prefix.to_string()..)
            .take_while(|(k, _)| k.starts_with(prefix))
            .map(|(k, _)| k.clone())
            .collect())
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Memory
    }
}

/// File system blob store
///
/// Objects are partitioned by the hash prefix of their key: `<base>/<hash>/<rest>`.
pub struct FileSystemBlobStore {
    base_path: PathBuf,
}

impl FileSystemBlobStore {
    pub fn new(base_path: impl AsRef<Path>) -> Self {
        Self {
            base_path: base_path.as_ref().to_path_buf(),
        }
    }

    fn full_path(&self, key: &str) -> PathBuf {
        match key.split_once('&') {
            Some((partition, rest)) => self.base_path.join(partition).join(rest),
            None => self.base_path.join(key),
        }
    }
}

#[async_trait]
impl BlobStore for FileSystemBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.full_path(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(BossError::Io(e)),
        }
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        let full_path = self.full_path(key);
        if let Some(parent) = full_path.parent() {
            fs::create_dir_all(parent).await?;
        }
        // write then rename so readers never see a partial object
        let tmp = full_path.with_extension(format!("tmp-{}", uuid::Uuid::new_v4()));
        let mut file = fs::File::create(&tmp).await?;
        file.write_all(&data).await?;
        file.flush().await?;
        drop(file);
        fs::rename(&tmp, &full_path).await?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        Ok(fs::try_exists(self.full_path(key)).await?)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        match fs::remove_file(self.full_path(key)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(BossError::Io(e)),
        }
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        if !fs::try_exists(&self.base_path).await? {
            return Ok(keys);
        }
        let mut partitions = fs::read_dir(&self.base_path).await?;
        while let Some(partition) = partitions.next_entry().await? {
            if !partition.file_type().await?.is_dir() {
                continue;
            }
            let Some(partition_name) = partition.file_name().to_str().map(str::to_string) else {
                continue;
            };
            let mut objects = fs::read_dir(partition.path()).await?;
            while let Some(object) = objects.next_entry().await? {
                if let Some(name) = object.file_name().to_str() {
                    if name.contains(".tmp-") {
                        continue;
                    }
                    let key = format!("{}&{}", partition_name, name);
                    if key.starts_with(prefix) {
                        keys.push(key);
                    }
                }
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::FileSystem
    }
}

/// Object service over HTTP: `GET|PUT|DELETE <base>/<key>`, `GET <base>?prefix=` lists
#[cfg(feature = "http-client")]
pub struct HttpBlobStore {
    base_url: String,
    client: reqwest::Client,
}

#[cfg(feature = "http-client")]
impl HttpBlobStore {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn url(&self, key: &str) -> String {
        format!("{}/{}", self.base_url, key.replace('&', "%26"))
    }
}

#[cfg(feature = "http-client")]
fn http_error(e: reqwest::Error) -> BossError {
    if e.is_timeout() {
        BossError::Timeout(e.to_string())
    } else {
        BossError::backend(e.to_string())
    }
}

#[cfg(feature = "http-client")]
#[async_trait]
impl BlobStore for HttpBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let response = self.client.get(self.url(key)).send().await.map_err(http_error)?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let response = response.error_for_status().map_err(http_error)?;
        Ok(Some(response.bytes().await.map_err(http_error)?))
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.client
            .put(self.url(key))
            .body(data)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_error)?;
        Ok(())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        let response = self.client.head(self.url(key)).send().await.map_err(http_error)?;
        Ok(response.status().is_success())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        let response = self.client.delete(self.url(key)).send().await.map_err(http_error)?;
        if response.status() != reqwest::StatusCode::NOT_FOUND {
            response.error_for_status().map_err(http_error)?;
        }
        Ok(())
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys: Vec<String> = self
            .client
            .get(&self.base_url)
            .query(&[("prefix", prefix)])
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(http_error)?
            .json()
            .await
            .map_err(http_error)?;
        keys.sort();
        Ok(keys)
    }

    fn backend(&self) -> StorageBackend {
        StorageBackend::Http
    }
}

/// Wraps a blob store with per-attempt timeouts and exponential backoff on transient errors
pub struct RetryingBlobStore {
    inner: Arc<dyn BlobStore>,
    max_retries: u32,
    base_delay: Duration,
    max_delay: Duration,
    timeout: Duration,
}

impl RetryingBlobStore {
    pub fn new(inner: Arc<dyn BlobStore>, config: &BlobConfig) -> Self {
        Self {
            inner,
            max_retries: config.max_retries,
            base_delay: Duration::from_millis(config.retry_base_delay_ms),
            max_delay: Duration::from_millis(config.retry_max_delay_ms),
            timeout: Duration::from_millis(config.read_timeout_ms),
        }
    }

    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }

    async fn with_retry<T, F, Fut>(&self, what: &str, key: &str, op: F) -> Result<T>
    where
        F: Fn() -> Fut + Send + Sync,
        Fut: std::future::Future<Output = Result<T>> + Send,
        T: Send,
    {
        let mut attempt = 0;
        loop {
            let outcome = match tokio::time::timeout(self.timeout, op()).await {
                Ok(result) => result,
                Err(_) => Err(BossError::Timeout(format!("blob {} of {}", what, key))),
            };
            match outcome {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.max_retries => {
                    let delay = self.backoff(attempt);
                    debug!(key, attempt, error = %e, ?delay, "retrying blob {}", what);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) if e.is_transient() => {
                    warn!(key, attempts = attempt + 1, error = %e, "blob {} failed", what);
                    return Err(BossError::backend(format!(
                        "blob {} of {} failed after {} attempts: {}",
                        what,
                        key,
                        attempt + 1,
                        e
                    )));
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl BlobStore for RetryingBlobStore {
    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        self.with_retry("read", key, || self.inner.get(key)).await
    }

    async fn put(&self, key: &str, data: Bytes) -> Result<()> {
        self.with_retry("write", key, || self.inner.put(key, data.clone()))
            .await
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        self.with_retry("head", key, || self.inner.exists(key)).await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.with_retry("delete", key, || self.inner.delete(key)).await
    }

    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        self.with_retry("list", prefix, || self.inner.list(prefix)).await
    }

    fn backend(&self) -> StorageBackend {
        self.inner.backend()
    }
}

/// Parse URL and create the matching blob store
pub fn create_blob_store(url: &str) -> Result<Arc<dyn BlobStore>> {
    match StorageBackend::from_url(url)? {
        StorageBackend::Memory => Ok(Arc::new(MemoryBlobStore::new())),
        StorageBackend::FileSystem => {
            let path = url.strip_prefix("file://").unwrap_or(url);
            Ok(Arc::new(FileSystemBlobStore::new(path)))
        }
        #[cfg(feature = "http-client")]
        StorageBackend::Http => Ok(Arc::new(HttpBlobStore::new(url))),
        #[cfg(not(feature = "http-client"))]
        StorageBackend::Http => Err(BossError::validation(
            "HTTP blob stores require the http-client feature",
        )),
    }
}
