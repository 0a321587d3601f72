//! Storage handles per provider.

use ferry_core::StorageProvider;
use ferry_core::config::StorageSettings;
use ferry_storage::{Storage, StorageResult};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Builds the storage handle for a provider row.
pub trait StorageFactory: Send + Sync {
    fn storage(&self, provider: &StorageProvider) -> StorageResult<Arc<dyn Storage>>;
}

/// Builds real backends with [`ferry_storage::from_provider`], reusing a
/// handle while the provider row is unchanged.
pub struct ProviderStorageFactory {
    settings: StorageSettings,
    cache: Mutex<HashMap<String, (StorageProvider, Arc<dyn Storage>)>>,
}

impl ProviderStorageFactory {
    pub fn new(settings: StorageSettings) -> Self {
        Self {
            settings,
            cache: Mutex::new(HashMap::new()),
        }
    }
}

impl StorageFactory for ProviderStorageFactory {
    fn storage(&self, provider: &StorageProvider) -> StorageResult<Arc<dyn Storage>> {
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((cached, storage)) = cache.get(&provider.id)
            && cached == provider
        {
            return Ok(storage.clone());
        }
        let storage = ferry_storage::from_provider(provider, &self.settings)?;
        cache.insert(provider.id.clone(), (provider.clone(), storage.clone()));
        Ok(storage)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::{ProviderCredentials, StorageBackendKind};

    fn provider(secret: &str) -> StorageProvider {
        StorageProvider {
            id: "p1".to_string(),
            endpoint: "localhost:9000".to_string(),
            region: "us-east-1".to_string(),
            credentials: ProviderCredentials {
                access_key_id: "AKID".to_string(),
                secret_access_key: secret.to_string(),
            },
            bucket_location_constraint: None,
            download_url_template: None,
            kind: StorageBackendKind::S3,
        }
    }

    #[test]
    fn test_handles_are_reused_until_provider_changes() {
        let factory = ProviderStorageFactory::new(StorageSettings::default());
        let a = factory.storage(&provider("one")).unwrap();
        let b = factory.storage(&provider("one")).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        let c = factory.storage(&provider("two")).unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }
}
