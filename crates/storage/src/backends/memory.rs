//! In-process storage for tests and dry runs.
//!
//! URLs handed out point at `base_url`; nothing serves them unless the
//! caller arranges it. Objects are placed directly with
//! [`MemoryStorage::put_object`] and read back with [`MemoryStorage::get_object`].

use crate::bucket::bucket_name;
use crate::error::{StorageError, StorageResult};
use crate::template::encode_key;
use crate::traits::{BUCKET_PREFIX, ObjectStream, Storage, StorageObject};
use async_trait::async_trait;
use ferry_core::hash::md5_hex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Clone, Debug)]
struct StoredObject {
    size: u64,
    etag: String,
    body: Option<Vec<u8>>,
}

#[derive(Debug, Default)]
struct Inner {
    buckets: BTreeSet<String>,
    objects: BTreeMap<(String, String), StoredObject>,
    deleted: Vec<(String, String)>,
}

/// Storage held entirely in memory. Clones share state.
#[derive(Clone, Debug)]
pub struct MemoryStorage {
    access_key_id: String,
    base_url: String,
    inner: Arc<Mutex<Inner>>,
    fail_deletes: Arc<AtomicBool>,
}

impl MemoryStorage {
    pub fn new(access_key_id: impl Into<String>) -> Self {
        Self {
            access_key_id: access_key_id.into(),
            base_url: "memory://".to_string(),
            inner: Arc::new(Mutex::new(Inner::default())),
            fail_deletes: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into().trim_end_matches('/').to_string();
        self
    }

    fn lock(&self) -> StorageResult<std::sync::MutexGuard<'_, Inner>> {
        self.inner
            .lock()
            .map_err(|_| StorageError::Io(std::io::Error::other("memory storage lock poisoned")))
    }

    /// Store an object body, recording its size and quoted MD5 ETag.
    pub fn put_object(&self, bucket: &str, key: &str, data: &[u8]) -> StorageResult<String> {
        let etag = format!("\"{}\"", md5_hex(data));
        self.store(bucket, key, data.len() as u64, etag.clone(), Some(data.to_vec()))?;
        Ok(etag)
    }

    /// Body of an object stored with [`MemoryStorage::put_object`].
    pub fn get_object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        self.lock().ok().and_then(|inner| {
            inner
                .objects
                .get(&(bucket.to_string(), key.to_string()))
                .and_then(|obj| obj.body.clone())
        })
    }

    /// Record an object without a body.
    pub fn insert_object(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        etag: impl Into<String>,
    ) -> StorageResult<()> {
        self.store(bucket, key, size, etag.into(), None)
    }

    fn store(
        &self,
        bucket: &str,
        key: &str,
        size: u64,
        etag: String,
        body: Option<Vec<u8>>,
    ) -> StorageResult<()> {
        let mut inner = self.lock()?;
        inner.buckets.insert(bucket.to_string());
        inner.objects.insert(
            (bucket.to_string(), key.to_string()),
            StoredObject { size, etag, body },
        );
        Ok(())
    }

    pub fn contains(&self, bucket: &str, key: &str) -> bool {
        self.lock()
            .map(|inner| {
                inner
                    .objects
                    .contains_key(&(bucket.to_string(), key.to_string()))
            })
            .unwrap_or(false)
    }

    pub fn object_count(&self) -> usize {
        self.lock().map(|inner| inner.objects.len()).unwrap_or(0)
    }

    /// Every `(bucket, key)` passed to `delete_file`, in call order.
    pub fn deleted(&self) -> Vec<(String, String)> {
        self.lock()
            .map(|inner| inner.deleted.clone())
            .unwrap_or_default()
    }

    /// Make subsequent deletes fail.
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    fn url(&self, bucket: &str, key: &str) -> String {
        format!("{}/{}/{}", self.base_url, bucket, encode_key(key))
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn require_bucket_name(&self, scope: &str) -> StorageResult<String> {
        let bucket = bucket_name(scope, &self.access_key_id);
        self.lock()?.buckets.insert(bucket.clone());
        Ok(bucket)
    }

    async fn get_upload_url(&self, bucket: &str, key: &str) -> StorageResult<String> {
        Ok(format!("{}?method=PUT", self.url(bucket, key)))
    }

    async fn get_download_url(&self, bucket: &str, key: &str) -> StorageResult<String> {
        Ok(self.url(bucket, key))
    }

    async fn delete_file(&self, bucket: &str, key: &str) -> StorageResult<()> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "injected delete failure for {bucket}/{key}"
            ))));
        }
        let mut inner = self.lock()?;
        inner.objects.remove(&(bucket.to_string(), key.to_string()));
        inner.deleted.push((bucket.to_string(), key.to_string()));
        Ok(())
    }

    fn list_objects(&self) -> ObjectStream {
        let snapshot: StorageResult<Vec<StorageObject>> = self.lock().map(|inner| {
            inner
                .objects
                .iter()
                .filter(|((bucket, _), _)| bucket.starts_with(BUCKET_PREFIX))
                .map(|((bucket, key), obj)| StorageObject {
                    bucket: bucket.clone(),
                    key: key.clone(),
                    size: obj.size,
                    etag: obj.etag.clone(),
                })
                .collect()
        });
        let items: Vec<StorageResult<StorageObject>> = match snapshot {
            Ok(objects) => objects.into_iter().map(Ok).collect(),
            Err(err) => vec![Err(err)],
        };
        Box::pin(futures::stream::iter(items))
    }

    fn identity(&self) -> String {
        format!("memory|{}", self.access_key_id)
    }

    fn backend_name(&self) -> &'static str {
        "memory"
    }
}
