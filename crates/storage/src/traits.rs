//! Storage trait definitions.

use crate::error::StorageResult;
use async_trait::async_trait;
use futures::Stream;
use std::pin::Pin;

/// Bucket names this system creates and scans all start with this prefix.
pub const BUCKET_PREFIX: &str = "ferry-";

/// An object found while scanning a provider's buckets.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageObject {
    pub bucket: String,
    pub key: String,
    pub size: u64,
    /// Entity tag as reported by the backend, quotes included.
    pub etag: String,
}

/// A boxed stream of listed objects.
///
/// The stream is lazy; pages are fetched as it is polled. It cannot be
/// resumed part way, only restarted from the beginning.
pub type ObjectStream = Pin<Box<dyn Stream<Item = StorageResult<StorageObject>> + Send>>;

/// Object storage capability used by the coordinator.
///
/// Implementations never move object bytes themselves: clients transfer
/// directly against the signed URLs handed out here.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Resolve the bucket for `scope`, creating it if it does not exist yet.
    ///
    /// The name is a deterministic function of the scope and this provider's
    /// access key, so repeated calls return the same bucket.
    async fn require_bucket_name(&self, scope: &str) -> StorageResult<String>;

    /// Signed URL accepting a single `PUT` of the object body.
    async fn get_upload_url(&self, bucket: &str, key: &str) -> StorageResult<String>;

    /// URL serving the object body, either signed or expanded from the
    /// provider's download template.
    async fn get_download_url(&self, bucket: &str, key: &str) -> StorageResult<String>;

    /// Delete an object. Deleting a missing object is not an error.
    async fn delete_file(&self, bucket: &str, key: &str) -> StorageResult<()>;

    /// Stream every object in every `ferry-` bucket owned by these credentials.
    fn list_objects(&self) -> ObjectStream;

    /// Endpoint plus access key. Providers sharing an identity see the same
    /// buckets.
    fn identity(&self) -> String;

    /// Get the backend name for logging and metrics.
    fn backend_name(&self) -> &'static str;
}
