//! Coordinating server for ferry transfers.
//!
//! This crate provides:
//! - The duplex session endpoint (`GET /v1/session`) for upload and download
//!   clients
//! - Part admission and completion for upload sessions
//! - The reconciliation loop that hands stored parts to download clients and
//!   deletes what is no longer needed
//! - Health and Prometheus endpoints

pub mod auth;
pub mod download;
pub mod error;
pub mod factory;
pub mod handlers;
pub mod hub;
pub mod metrics;
pub mod routes;
pub mod server;
pub mod session;
pub mod state;
pub mod upload;

pub use download::{DownloadCoordinator, DownloadKey, ReconcileReport};
pub use error::{ApiError, ApiResult};
pub use factory::{ProviderStorageFactory, StorageFactory};
pub use routes::create_router;
pub use server::ServerHandle;
pub use session::{Connection, SessionError};
pub use state::AppState;
pub use upload::UploadCoordinator;
