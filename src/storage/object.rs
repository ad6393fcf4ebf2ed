use std::collections::{HashMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Error)]
pub enum ObjectStoreError {
    #[error("bucket '{0}' does not exist")]
    NoSuchBucket(String),

    #[error("object '{key}' not found in bucket '{bucket}'")]
    NotFound { bucket: String, key: String },

    #[error("invalid object key '{0}'")]
    InvalidKey(String),

    #[error("object store I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result of a successful put
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PutObject {
    pub key: String,
    /// Hex SHA-256 of the stored bytes
    pub etag: String,
}

/// Hex SHA-256 digest, used both as content hash and object etag
pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Bucketed key/value blob storage
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist yet
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError>;

    /// Write (or overwrite) an object
    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<PutObject, ObjectStoreError>;

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError>;

    async fn exists(&self, bucket: &str, key: &str) -> Result<bool, ObjectStoreError> {
        match self.get(bucket, key).await {
            Ok(_) => Ok(true),
            Err(ObjectStoreError::NotFound { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

fn validate_segment(segment: &str) -> Result<(), ObjectStoreError> {
    let path = Path::new(segment);
    let clean = !segment.is_empty()
        && path
            .components()
            .all(|c| matches!(c, Component::Normal(_)));
    if clean {
        Ok(())
    } else {
        Err(ObjectStoreError::InvalidKey(segment.to_string()))
    }
}

/// Object store backed by a directory tree: `{root}/{bucket}/{key}`
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_segment(bucket)?;
        Ok(self.root.join(bucket))
    }

    fn object_path(&self, bucket: &str, key: &str) -> Result<PathBuf, ObjectStoreError> {
        validate_segment(key)?;
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Err(ObjectStoreError::NoSuchBucket(bucket.to_string()));
        }
        Ok(dir.join(key))
    }
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        let dir = self.bucket_dir(bucket)?;
        tokio::fs::create_dir_all(&dir).await?;
        Ok(())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        content_type: &str,
    ) -> Result<PutObject, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&path, bytes).await?;
        debug!(
            "Stored {}/{} ({} bytes, {})",
            bucket,
            key,
            bytes.len(),
            content_type
        );
        Ok(PutObject {
            key: key.to_string(),
            etag: sha256_hex(bytes),
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        let path = self.object_path(bucket, key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(bytes),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}

/// In-memory object store, mainly for tests and dry runs
#[derive(Default)]
pub struct MemoryObjectStore {
    buckets: Mutex<HashSet<String>>,
    objects: Mutex<HashMap<(String, String), Vec<u8>>>,
    puts: AtomicUsize,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful put calls so far
    pub fn put_count(&self) -> usize {
        self.puts.load(Ordering::SeqCst)
    }

    fn has_bucket(&self, bucket: &str) -> bool {
        self.buckets
            .lock()
            .map(|b| b.contains(bucket))
            .unwrap_or(false)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn ensure_bucket(&self, bucket: &str) -> Result<(), ObjectStoreError> {
        validate_segment(bucket)?;
        if let Ok(mut buckets) = self.buckets.lock() {
            buckets.insert(bucket.to_string());
        }
        Ok(())
    }

    async fn put(
        &self,
        bucket: &str,
        key: &str,
        bytes: &[u8],
        _content_type: &str,
    ) -> Result<PutObject, ObjectStoreError> {
        validate_segment(key)?;
        if !self.has_bucket(bucket) {
            return Err(ObjectStoreError::NoSuchBucket(bucket.to_string()));
        }
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert((bucket.to_string(), key.to_string()), bytes.to_vec());
        }
        self.puts.fetch_add(1, Ordering::SeqCst);
        Ok(PutObject {
            key: key.to_string(),
            etag: sha256_hex(bytes),
        })
    }

    async fn get(&self, bucket: &str, key: &str) -> Result<Vec<u8>, ObjectStoreError> {
        if !self.has_bucket(bucket) {
            return Err(ObjectStoreError::NoSuchBucket(bucket.to_string()));
        }
        self.objects
            .lock()
            .ok()
            .and_then(|objects| objects.get(&(bucket.to_string(), key.to_string())).cloned())
            .ok_or_else(|| ObjectStoreError::NotFound {
                bucket: bucket.to_string(),
                key: key.to_string(),
            })
    }
}
