//! Ledger and storage fixtures.

use ferry_core::hash::md5_hex;
use ferry_core::{Range, StorageProvider, UploadRequest, part_key};
use ferry_metadata::{
    MetadataStore, NewPart, NewStorageProvider, PartRepo, SqliteStore, StorageProviderRepo,
};
use ferry_server::StorageFactory;
use ferry_storage::{MemoryStorage, Storage, StorageError, StorageResult, bucket_name};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

#[allow(dead_code)]
pub const SCOPE: &str = "alice";
#[allow(dead_code)]
pub const PROVIDER_ID: &str = "p1";
#[allow(dead_code)]
pub const ACCESS_KEY_ID: &str = "AKID1";

/// Hands out pre-registered in-memory storages by provider id.
#[derive(Default)]
#[allow(dead_code)]
pub struct MemoryFactory {
    storages: Mutex<HashMap<String, MemoryStorage>>,
}

#[allow(dead_code)]
impl MemoryFactory {
    pub fn register(&self, provider_id: &str, storage: MemoryStorage) {
        self.storages
            .lock()
            .unwrap()
            .insert(provider_id.to_string(), storage);
    }
}

impl StorageFactory for MemoryFactory {
    fn storage(&self, provider: &StorageProvider) -> StorageResult<Arc<dyn Storage>> {
        self.storages
            .lock()
            .unwrap()
            .get(&provider.id)
            .cloned()
            .map(|s| Arc::new(s) as Arc<dyn Storage>)
            .ok_or_else(|| StorageError::Config(format!("no storage for {}", provider.id)))
    }
}

#[allow(dead_code)]
pub fn new_provider(id: &str, access_key_id: &str) -> NewStorageProvider {
    NewStorageProvider {
        id: id.to_string(),
        endpoint: "storage.test".to_string(),
        region: "us-east-1".to_string(),
        access_key_id: access_key_id.to_string(),
        secret_access_key: "secret".to_string(),
        bucket_location_constraint: None,
        download_url_template: None,
    }
}

/// A migrated SQLite store in a temporary directory, with provider `p1`.
#[allow(dead_code)]
pub async fn test_store() -> (Arc<dyn MetadataStore>, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let store = SqliteStore::connect_and_migrate(temp_dir.path().join("ledger.db"))
        .await
        .expect("Failed to create metadata store");
    store
        .add_storage_provider(&new_provider(PROVIDER_ID, ACCESS_KEY_ID))
        .await
        .expect("Failed to add provider");
    (Arc::new(store), temp_dir)
}

#[allow(dead_code)]
pub fn scope_bucket() -> String {
    bucket_name(SCOPE, ACCESS_KEY_ID)
}

#[allow(dead_code)]
pub fn upload_request(path: &str, data: &[u8], offset: u64, file_size: u64) -> UploadRequest {
    UploadRequest {
        path: path.to_string(),
        range: Range::from_offset(offset, data.len() as u64).unwrap(),
        checksum_md5: md5_hex(data),
        size: file_size,
    }
}

/// Announce `data` as the part at `offset` and put it into `storage` under
/// its part key. Returns the range.
#[allow(dead_code)]
pub async fn stored_part(
    metadata: &Arc<dyn MetadataStore>,
    storage: &MemoryStorage,
    path: &str,
    data: &[u8],
    offset: u64,
    file_size: u64,
) -> Range {
    let range = Range::from_offset(offset, data.len() as u64).unwrap();
    let part = NewPart {
        range,
        checksum_md5: md5_hex(data),
        size: file_size,
    };
    metadata.add_part(SCOPE, path, &part).await.unwrap();
    storage
        .put_object(&scope_bucket(), &part_key(path, &range), data)
        .unwrap();
    range
}
