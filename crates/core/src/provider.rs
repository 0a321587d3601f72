//! Storage provider descriptors.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Which storage API dialect a provider speaks.
///
/// Resolved once from the endpoint when a provider is loaded; call sites
/// dispatch on this tag instead of inspecting endpoint strings.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackendKind {
    S3,
    B2,
}

impl StorageBackendKind {
    /// Classify an endpoint URL.
    pub fn from_endpoint(endpoint: &str) -> Self {
        let host = endpoint
            .split_once("://")
            .map_or(endpoint, |(_, rest)| rest)
            .split(['/', ':'])
            .next()
            .unwrap_or_default()
            .to_ascii_lowercase();
        if host == "backblazeb2.com" || host.ends_with(".backblazeb2.com") {
            Self::B2
        } else {
            Self::S3
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::S3 => "s3",
            Self::B2 => "b2",
        }
    }
}

impl fmt::Display for StorageBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Access credentials for a provider.
#[derive(Clone, PartialEq, Eq)]
pub struct ProviderCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl fmt::Debug for ProviderCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderCredentials")
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// A configured object storage account.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct StorageProvider {
    pub id: String,
    pub endpoint: String,
    pub region: String,
    pub credentials: ProviderCredentials,
    /// Location constraint passed when creating buckets.
    pub bucket_location_constraint: Option<String>,
    /// Template with `{bucket}` and `{key}` placeholders used instead of
    /// signed download URLs.
    pub download_url_template: Option<String>,
    pub kind: StorageBackendKind,
}

impl StorageProvider {
    /// Two providers with the same identity reach the same set of buckets.
    pub fn identity(&self) -> String {
        format!("{}|{}", self.endpoint, self.credentials.access_key_id)
    }
}
