//! Bucket-addressed artifact storage on top of `object_store`.

use async_trait::async_trait;
use bytes::Bytes;
use futures::TryStreamExt;
use hl_types::{config_error, ExternalServiceError, HlError, HlResult, Service};
use object_store::local::LocalFileSystem;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{ObjectStore, PutPayload};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Buckets of objects keyed by `/`-separated paths.
#[async_trait]
pub trait ArtifactStore: Send + Sync {
    /// URI scheme of the locations this store hands out.
    fn scheme(&self) -> &str;

    async fn bucket_exists(&self, bucket: &str) -> HlResult<bool>;

    /// Create `bucket`. Fails with `BucketAlreadyExists` if it is present.
    async fn create_bucket(&self, bucket: &str, region: &str) -> HlResult<()>;

    /// Handle on an existing bucket.
    async fn bucket(&self, bucket: &str) -> HlResult<Arc<dyn ObjectStore>>;

    /// Create `bucket` unless it exists. Losing a creation race counts as
    /// success.
    async fn ensure_bucket(&self, bucket: &str, region: &str) -> HlResult<()> {
        if self.bucket_exists(bucket).await? {
            return Ok(());
        }
        match self.create_bucket(bucket, region).await {
            Ok(()) => Ok(()),
            Err(HlError::ExternalService(ExternalServiceError::BucketAlreadyExists { .. })) => {
                debug!(bucket, "Bucket created concurrently");
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Upload `local` as `key`, overwriting any existing object.
    async fn upload_file(&self, local: &Path, bucket: &str, key: &str) -> HlResult<()> {
        let data = tokio::fs::read(local).await.map_err(|e| {
            ExternalServiceError::call(
                Service::Filesystem,
                "upload_file",
                format!("{}: {e}", local.display()),
            )
        })?;
        self.put_object(bucket, key, data).await
    }

    async fn put_object(&self, bucket: &str, key: &str, data: Vec<u8>) -> HlResult<()> {
        let store = self.bucket(bucket).await?;
        store
            .put(&ObjectPath::from(key), PutPayload::from(data))
            .await
            .map_err(storage_error("put_object"))?;
        debug!(bucket, key, "Stored object");
        Ok(())
    }

    async fn get_object(&self, bucket: &str, key: &str) -> HlResult<Bytes> {
        let store = self.bucket(bucket).await?;
        let result = store
            .get(&ObjectPath::from(key))
            .await
            .map_err(storage_error("get_object"))?;
        result.bytes().await.map_err(storage_error("get_object"))
    }

    /// Keys under `prefix`, sorted.
    async fn list_objects(&self, bucket: &str, prefix: &str) -> HlResult<Vec<String>> {
        let store = self.bucket(bucket).await?;
        let prefix = (!prefix.is_empty()).then(|| ObjectPath::from(prefix));
        let mut keys: Vec<String> = store
            .list(prefix.as_ref())
            .map_ok(|meta| meta.location.to_string())
            .try_collect()
            .await
            .map_err(storage_error("list_objects"))?;
        keys.sort();
        Ok(keys)
    }

    /// `<scheme>://<bucket>/<key>`
    fn location(&self, bucket: &str, key: &str) -> String {
        format!("{}://{bucket}/{key}", self.scheme())
    }
}

/// Buckets as sub-directories of a root directory.
#[derive(Debug, Clone)]
pub struct LocalBucketStore {
    root: PathBuf,
}

impl LocalBucketStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn bucket_dir(&self, bucket: &str) -> HlResult<PathBuf> {
        validate_bucket_name(bucket)?;
        Ok(self.root.join(bucket))
    }
}

#[async_trait]
impl ArtifactStore for LocalBucketStore {
    fn scheme(&self) -> &str {
        "file"
    }

    async fn bucket_exists(&self, bucket: &str) -> HlResult<bool> {
        Ok(self.bucket_dir(bucket)?.is_dir())
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> HlResult<()> {
        let dir = self.bucket_dir(bucket)?;
        if dir.is_dir() {
            return Err(ExternalServiceError::BucketAlreadyExists {
                bucket: bucket.to_string(),
            }
            .into());
        }
        tokio::fs::create_dir_all(&dir).await.map_err(|e| {
            ExternalServiceError::call(Service::ObjectStore, "create_bucket", e)
        })?;
        info!(bucket, region, path = %dir.display(), "Created bucket");
        Ok(())
    }

    async fn bucket(&self, bucket: &str) -> HlResult<Arc<dyn ObjectStore>> {
        let dir = self.bucket_dir(bucket)?;
        if !dir.is_dir() {
            return Err(ExternalServiceError::BucketNotFound {
                bucket: bucket.to_string(),
            }
            .into());
        }
        let store: Arc<dyn ObjectStore> = Arc::new(
            LocalFileSystem::new_with_prefix(&dir).map_err(storage_error("open_bucket"))?,
        );
        Ok(store)
    }
}

#[derive(Debug)]
struct MemoryBucket {
    region: String,
    store: Arc<InMemory>,
}

/// Process-local buckets, for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryBucketStore {
    buckets: Mutex<HashMap<String, MemoryBucket>>,
}

impl MemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn region(&self, bucket: &str) -> Option<String> {
        self.buckets.lock().get(bucket).map(|b| b.region.clone())
    }
}

#[async_trait]
impl ArtifactStore for MemoryBucketStore {
    fn scheme(&self) -> &str {
        "memory"
    }

    async fn bucket_exists(&self, bucket: &str) -> HlResult<bool> {
        Ok(self.buckets.lock().contains_key(bucket))
    }

    async fn create_bucket(&self, bucket: &str, region: &str) -> HlResult<()> {
        validate_bucket_name(bucket)?;
        let mut buckets = self.buckets.lock();
        if buckets.contains_key(bucket) {
            return Err(ExternalServiceError::BucketAlreadyExists {
                bucket: bucket.to_string(),
            }
            .into());
        }
        buckets.insert(
            bucket.to_string(),
            MemoryBucket {
                region: region.to_string(),
                store: Arc::new(InMemory::new()),
            },
        );
        Ok(())
    }

    async fn bucket(&self, bucket: &str) -> HlResult<Arc<dyn ObjectStore>> {
        let buckets = self.buckets.lock();
        let entry = buckets
            .get(bucket)
            .ok_or_else(|| ExternalServiceError::BucketNotFound {
                bucket: bucket.to_string(),
            })?;
        let store: Arc<dyn ObjectStore> = entry.store.clone();
        Ok(store)
    }
}

/// S3 naming rules: 3-63 chars of lowercase letters, digits, '.' and '-',
/// starting and ending with a letter or digit.
pub fn validate_bucket_name(bucket: &str) -> HlResult<()> {
    let valid_chars = bucket
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-');
    let valid_ends = bucket
        .chars()
        .next()
        .zip(bucket.chars().last())
        .is_some_and(|(a, b)| a.is_ascii_alphanumeric() && b.is_ascii_alphanumeric());
    if !(3..=63).contains(&bucket.len()) || !valid_chars || !valid_ends {
        return Err(config_error!("invalid bucket name '{bucket}'").into());
    }
    Ok(())
}

fn storage_error(operation: &'static str) -> impl Fn(object_store::Error) -> HlError {
    move |e| ExternalServiceError::call(Service::ObjectStore, operation, e).into()
}
