//! Server test utilities.

use super::fixtures::{ACCESS_KEY_ID, MemoryFactory, PROVIDER_ID, test_store};
use ferry_core::TokenClaims;
use ferry_core::config::ServerConfig;
use ferry_metadata::MetadataStore;
use ferry_server::ServerHandle;
use ferry_signer::{KeyPair, TokenSigner};
use ferry_storage::MemoryStorage;
use std::sync::Arc;
use tempfile::TempDir;

/// A running server on an ephemeral port with in-memory storage.
/// Note: #[allow(dead_code)] because each test file compiles common/ separately.
#[allow(dead_code)]
pub struct TestServer {
    pub handle: ServerHandle,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: MemoryStorage,
    pub signer: TokenSigner,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl TestServer {
    pub async fn new() -> Self {
        Self::with_config(ServerConfig::for_testing()).await
    }

    pub async fn with_config(config: ServerConfig) -> Self {
        let (metadata, temp_dir) = test_store().await;
        let storage = MemoryStorage::new(ACCESS_KEY_ID).with_base_url("http://storage.test");
        let factory = MemoryFactory::default();
        factory.register(PROVIDER_ID, storage.clone());

        let signer = TokenSigner::new(KeyPair::generate("test"));
        let handle = ServerHandle::start(
            config,
            metadata.clone(),
            signer.verifier(),
            Arc::new(factory),
        )
        .await
        .expect("Failed to start server");

        Self {
            handle,
            metadata,
            storage,
            signer,
            _temp_dir: temp_dir,
        }
    }

    pub fn upload_token(&self, name: &str, storage_provider_id: &str) -> String {
        self.signer
            .sign(&TokenClaims::upload(name, storage_provider_id))
            .unwrap()
    }

    pub fn download_token(&self) -> String {
        self.signer.sign(&TokenClaims::download()).unwrap()
    }

    pub fn session_url(&self) -> String {
        self.handle.session_url()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.shutdown();
    }
}
