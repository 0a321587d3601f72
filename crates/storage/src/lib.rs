//! Object storage capability for ferry.
//!
//! This crate provides:
//! - The [`Storage`] trait: bucket provisioning, signed URLs, deletion and listing
//! - Deterministic bucket naming per scope and access key
//! - Backends: S3-compatible, Backblaze B2 and in-memory

pub mod backends;
pub mod bucket;
pub mod error;
pub mod template;
pub mod traits;

pub use backends::{b2::B2Storage, memory::MemoryStorage, s3::S3Storage};
pub use bucket::bucket_name;
pub use error::{StorageError, StorageResult};
pub use traits::{BUCKET_PREFIX, ObjectStream, Storage, StorageObject};

use ferry_core::config::StorageSettings;
use ferry_core::{StorageBackendKind, StorageProvider};
use std::sync::Arc;

/// Create the storage handle for a provider.
pub fn from_provider(
    provider: &StorageProvider,
    settings: &StorageSettings,
) -> StorageResult<Arc<dyn Storage>> {
    match provider.kind {
        StorageBackendKind::S3 => Ok(Arc::new(S3Storage::new(provider, settings)?)),
        StorageBackendKind::B2 => Ok(Arc::new(B2Storage::new(provider, settings)?)),
    }
}
