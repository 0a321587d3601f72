//! File repository.

use crate::error::MetadataResult;
use crate::models::FileRow;
use async_trait::async_trait;
use uuid::Uuid;

/// Repository for file records.
#[async_trait]
pub trait FileRepo: Send + Sync {
    /// Record the whole-file SHA-256, creating the file if it is not yet known.
    ///
    /// Replacing a checksum with a different value clears `verified`, since
    /// the previous verification was against other content.
    async fn set_checksum_sha256(&self, n: &str, path: &str, checksum: &str)
    -> MetadataResult<()>;

    /// Get a file by scope name and path.
    async fn get_file(&self, n: &str, path: &str) -> MetadataResult<Option<FileRow>>;

    /// Get a file by its surrogate id.
    async fn get_file_by_id(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>>;

    /// Mark a file verified. Fails with `NotFound` if the file is unknown.
    async fn set_verified(&self, n: &str, path: &str) -> MetadataResult<()>;

    /// Files with a checksum that have not been verified yet.
    async fn get_files_to_verify(&self) -> MetadataResult<Vec<FileRow>>;
}
