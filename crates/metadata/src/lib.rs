//! Durable part ledger for ferry.
//!
//! This crate provides the data model the coordinators agree on:
//! - Files keyed by scope name and path, with write-once size and checksum
//! - Parts keyed by MD5 and byte range, completed at most once
//! - Storage provider accounts
//!
//! Every mutating operation runs in a single database transaction; the store
//! is the only arbiter of part admission.

pub mod error;
pub mod models;
pub mod postgres;
pub mod repos;
pub mod store;

pub use error::{MetadataError, MetadataResult};
pub use models::{FileRow, NewPart, NewStorageProvider, PartRow, StorageProviderRow};
pub use postgres::PostgresStore;
pub use repos::{FileRepo, PartRepo, StorageProviderRepo};
pub use store::{MetadataStore, SqliteStore};

use ferry_core::config::MetadataConfig;
use std::sync::Arc;

/// Connect to the store described by `config`. The schema is not created;
/// run [`MetadataStore::migrate`] for that.
pub async fn from_config(config: &MetadataConfig) -> MetadataResult<Arc<dyn MetadataStore>> {
    config.validate().map_err(MetadataError::Config)?;
    match config {
        MetadataConfig::Sqlite { path } => {
            tracing::info!(path = %path.display(), "opening sqlite ledger");
            let store = SqliteStore::connect(path).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
        MetadataConfig::Postgres {
            url,
            max_connections,
        } => {
            tracing::info!(max_connections, "connecting to postgres ledger");
            let store = PostgresStore::connect(url, *max_connections).await?;
            Ok(Arc::new(store) as Arc<dyn MetadataStore>)
        }
    }
}
