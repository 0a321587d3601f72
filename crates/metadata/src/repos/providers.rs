//! Storage provider repository.

use crate::error::MetadataResult;
use crate::models::NewStorageProvider;
use async_trait::async_trait;
use ferry_core::StorageProvider;

/// Repository for configured storage accounts.
#[async_trait]
pub trait StorageProviderRepo: Send + Sync {
    /// Insert a provider, or replace the one with the same id.
    async fn add_storage_provider(&self, provider: &NewStorageProvider) -> MetadataResult<()>;

    /// All providers, ordered by id.
    async fn get_storage_providers(&self) -> MetadataResult<Vec<StorageProvider>>;

    async fn get_storage_provider(&self, id: &str) -> MetadataResult<Option<StorageProvider>>;
}
