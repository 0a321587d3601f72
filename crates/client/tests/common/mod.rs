//! Shared harness for client integration tests.
//!
//! Runs a real coordinating server next to a tiny object server that serves
//! the in-memory storage's presigned URLs over HTTP.

use axum::Router;
use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::put;
use ferry_core::config::ServerConfig;
use ferry_core::hash::md5_hex;
use ferry_core::{StorageProvider, TokenClaims};
use ferry_metadata::{MetadataStore, NewStorageProvider, SqliteStore, StorageProviderRepo};
use ferry_server::{ServerHandle, StorageFactory};
use ferry_signer::{KeyPair, TokenSigner};
use ferry_storage::{MemoryStorage, Storage, StorageResult};
use std::sync::Arc;
use tempfile::TempDir;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

#[allow(dead_code)]
pub const SCOPE: &str = "alice";
pub const PROVIDER_ID: &str = "p1";
pub const ACCESS_KEY_ID: &str = "AKID1";

/// Every provider maps to the same in-memory storage.
struct SharedStorage(MemoryStorage);

impl StorageFactory for SharedStorage {
    fn storage(&self, _provider: &StorageProvider) -> StorageResult<Arc<dyn Storage>> {
        Ok(Arc::new(self.0.clone()))
    }
}

async fn put_object(
    State(storage): State<MemoryStorage>,
    Path((bucket, key)): Path<(String, String)>,
    body: Bytes,
) -> Response {
    match storage.put_object(&bucket, &key, &body) {
        Ok(etag) => (StatusCode::OK, [(header::ETAG, etag)]).into_response(),
        Err(_) => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
    }
}

async fn get_object(
    State(storage): State<MemoryStorage>,
    Path((bucket, key)): Path<(String, String)>,
) -> Response {
    match storage.get_object(&bucket, &key) {
        Some(body) => {
            let etag = format!("\"{}\"", md5_hex(&body));
            (StatusCode::OK, [(header::ETAG, etag)], body).into_response()
        }
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[allow(dead_code)]
pub struct Harness {
    pub server: ServerHandle,
    pub metadata: Arc<dyn MetadataStore>,
    pub storage: MemoryStorage,
    pub signer: TokenSigner,
    objects: CancellationToken,
    _temp_dir: TempDir,
}

#[allow(dead_code)]
impl Harness {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("Failed to bind object server");
        let addr = listener.local_addr().unwrap();
        let storage = MemoryStorage::new(ACCESS_KEY_ID).with_base_url(format!("http://{addr}"));

        let objects = CancellationToken::new();
        let router = Router::new()
            .route("/{bucket}/{*key}", put(put_object).get(get_object))
            .with_state(storage.clone());
        let stop = objects.clone();
        tokio::spawn(async move {
            axum::serve(listener, router)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await
                .ok();
        });

        let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
        let store = SqliteStore::connect_and_migrate(temp_dir.path().join("ledger.db"))
            .await
            .expect("Failed to create metadata store");
        store
            .add_storage_provider(&NewStorageProvider {
                id: PROVIDER_ID.to_string(),
                endpoint: addr.to_string(),
                region: "us-east-1".to_string(),
                access_key_id: ACCESS_KEY_ID.to_string(),
                secret_access_key: "secret".to_string(),
                bucket_location_constraint: None,
                download_url_template: None,
            })
            .await
            .expect("Failed to add provider");
        let metadata: Arc<dyn MetadataStore> = Arc::new(store);

        let signer = TokenSigner::new(KeyPair::generate("test"));
        let server = ServerHandle::start(
            ServerConfig::for_testing(),
            metadata.clone(),
            signer.verifier(),
            Arc::new(SharedStorage(storage.clone())),
        )
        .await
        .expect("Failed to start server");

        Self {
            server,
            metadata,
            storage,
            signer,
            objects,
            _temp_dir: temp_dir,
        }
    }

    pub fn endpoint(&self) -> String {
        format!("http://{}", self.server.local_addr())
    }

    pub fn upload_token(&self) -> String {
        self.signer
            .sign(&TokenClaims::upload(SCOPE, PROVIDER_ID))
            .unwrap()
    }

    pub fn download_token(&self) -> String {
        self.signer.sign(&TokenClaims::download()).unwrap()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        self.server.shutdown();
        self.objects.cancel();
    }
}
