//! Application state shared across handlers.

use crate::download::DownloadCoordinator;
use crate::factory::StorageFactory;
use ferry_core::config::ServerConfig;
use ferry_metadata::MetadataStore;
use ferry_signer::TokenVerifier;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<ServerConfig>,
    pub metadata: Arc<dyn MetadataStore>,
    /// Verifies session tokens on upgrade.
    pub verifier: Arc<TokenVerifier>,
    /// Storage handles per provider.
    pub storage: Arc<dyn StorageFactory>,
    /// Reconciliation loop and the download broadcast group.
    pub downloads: Arc<DownloadCoordinator>,
    /// Cancelled when the server stops; open sessions close on it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        config: ServerConfig,
        metadata: Arc<dyn MetadataStore>,
        verifier: TokenVerifier,
        storage: Arc<dyn StorageFactory>,
    ) -> Self {
        let downloads = Arc::new(DownloadCoordinator::new(
            metadata.clone(),
            storage.clone(),
            &config,
        ));
        Self {
            config: Arc::new(config),
            metadata,
            verifier: Arc::new(verifier),
            storage,
            downloads,
            shutdown: CancellationToken::new(),
        }
    }
}
