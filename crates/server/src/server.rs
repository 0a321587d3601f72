//! Server lifecycle: listener, router and the reconciliation loop.

use crate::download::DownloadCoordinator;
use crate::factory::StorageFactory;
use crate::metrics::register_metrics;
use crate::routes::create_router;
use crate::state::AppState;
use ferry_core::config::ServerConfig;
use ferry_metadata::MetadataStore;
use ferry_signer::TokenVerifier;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;

/// A running server. Dropping the handle does not stop it; call
/// [`ServerHandle::shutdown`].
pub struct ServerHandle {
    local_addr: SocketAddr,
    state: AppState,
    cancel: CancellationToken,
    tasks: TaskTracker,
}

impl ServerHandle {
    /// Bind the configured address and start serving.
    pub async fn start(
        config: ServerConfig,
        metadata: Arc<dyn MetadataStore>,
        verifier: TokenVerifier,
        storage: Arc<dyn StorageFactory>,
    ) -> std::io::Result<Self> {
        register_metrics();

        let listener = TcpListener::bind(config.bind_addr()).await?;
        let local_addr = listener.local_addr()?;
        let state = AppState::new(config, metadata, verifier, storage);
        let cancel = state.shutdown.clone();
        let tasks = TaskTracker::new();

        let router = create_router(state.clone());
        let shutdown = cancel.clone();
        tasks.spawn(async move {
            let result = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await })
                .await;
            if let Err(e) = result {
                tracing::error!(error = %e, "server failed");
            }
        });
        tasks.spawn(state.downloads.clone().run(cancel.clone()));
        tasks.close();

        tracing::info!(addr = %local_addr, "ferry server listening");
        Ok(Self {
            local_addr,
            state,
            cancel,
            tasks,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// WebSocket URL of the session endpoint.
    pub fn session_url(&self) -> String {
        format!("ws://{}/v1/session", self.local_addr)
    }

    pub fn state(&self) -> &AppState {
        &self.state
    }

    pub fn downloads(&self) -> &Arc<DownloadCoordinator> {
        &self.state.downloads
    }

    /// Token that stops the server when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the listener and the reconciliation loop to stop.
    pub async fn wait(&self) {
        self.tasks.wait().await;
    }
}
