//! Configuration types shared across crates.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Default minimum part size: 8 MiB.
pub const DEFAULT_MIN_PART_SIZE: u64 = 8 * 1024 * 1024;

/// Default upper bound on the number of parts per file.
pub const DEFAULT_MAX_PART_COUNT: u64 = 10_000;

/// Number of download jobs per `download:create` broadcast.
pub const DEFAULT_DOWNLOAD_BATCH_SIZE: usize = 1024;

/// Top-level configuration, assembled from defaults, an optional TOML file,
/// `FERRY_*` environment variables and command-line flags.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub metadata: MetadataConfig,
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
}

impl AppConfig {
    /// Validate every section.
    pub fn validate(&self) -> Result<(), String> {
        self.metadata.validate()?;
        self.server.validate()?;
        self.client.validate()
    }

    /// Configuration suitable for tests: in-memory SQLite and short timers.
    pub fn for_testing() -> Self {
        Self {
            metadata: MetadataConfig::Sqlite {
                path: PathBuf::from(":memory:"),
            },
            server: ServerConfig::for_testing(),
            client: ClientConfig::for_testing(),
        }
    }
}

/// Metadata store configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum MetadataConfig {
    /// SQLite database file. Use `:memory:` for a throwaway store.
    Sqlite { path: PathBuf },
    /// PostgreSQL connection URL.
    Postgres {
        url: String,
        #[serde(default = "default_max_connections")]
        max_connections: u32,
    },
}

fn default_max_connections() -> u32 {
    10
}

impl Default for MetadataConfig {
    fn default() -> Self {
        Self::Sqlite {
            path: PathBuf::from("./data/ferry.db"),
        }
    }
}

impl MetadataConfig {
    /// Build from the `--database-type` / `--connection-string` pair.
    pub fn from_connection(database_type: &str, connection_string: &str) -> Result<Self, String> {
        match database_type {
            "sqlite" => Ok(Self::Sqlite {
                path: PathBuf::from(
                    connection_string
                        .strip_prefix("sqlite://")
                        .or_else(|| connection_string.strip_prefix("sqlite:"))
                        .unwrap_or(connection_string),
                ),
            }),
            "postgres" | "postgresql" => Ok(Self::Postgres {
                url: connection_string.to_string(),
                max_connections: default_max_connections(),
            }),
            other => Err(format!(
                "unsupported database type '{other}' (expected sqlite or postgres)"
            )),
        }
    }

    pub fn validate(&self) -> Result<(), String> {
        match self {
            MetadataConfig::Sqlite { path } if path.as_os_str().is_empty() => {
                Err("sqlite path must not be empty".to_string())
            }
            MetadataConfig::Postgres { url, .. } if url.is_empty() => {
                Err("postgres url must not be empty".to_string())
            }
            MetadataConfig::Postgres {
                max_connections: 0,
                ..
            } => Err("postgres max_connections must be at least 1".to_string()),
            _ => Ok(()),
        }
    }
}

/// Signed URL lifetimes handed to storage backends.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_upload_url_ttl_secs")]
    pub upload_url_ttl_secs: u64,
    #[serde(default = "default_download_url_ttl_secs")]
    pub download_url_ttl_secs: u64,
}

fn default_upload_url_ttl_secs() -> u64 {
    3600
}

fn default_download_url_ttl_secs() -> u64 {
    6 * 3600
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            upload_url_ttl_secs: default_upload_url_ttl_secs(),
            download_url_ttl_secs: default_download_url_ttl_secs(),
        }
    }
}

impl StorageSettings {
    pub fn upload_url_ttl(&self) -> Duration {
        Duration::from_secs(self.upload_url_ttl_secs)
    }

    pub fn download_url_ttl(&self) -> Duration {
        Duration::from_secs(self.download_url_ttl_secs)
    }
}

/// Coordinating server configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Bind host; the port is configured separately.
    #[serde(default = "default_bind")]
    pub bind: String,
    #[serde(default = "default_port")]
    pub port: u16,
    /// Public key used to verify session tokens (`name:base64`).
    #[serde(default)]
    pub public_key_file: Option<PathBuf>,
    /// Fallback interval between reconciliation passes.
    #[serde(default = "default_reconcile_interval_secs")]
    pub reconcile_interval_secs: u64,
    #[serde(default = "default_download_batch_size")]
    pub download_batch_size: usize,
    /// How long a `download:create` broadcast waits for acknowledgements.
    #[serde(default = "default_ack_timeout_secs")]
    pub ack_timeout_secs: u64,
    #[serde(default)]
    pub storage: StorageSettings,
}

fn default_bind() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_reconcile_interval_secs() -> u64 {
    30
}

fn default_download_batch_size() -> usize {
    DEFAULT_DOWNLOAD_BATCH_SIZE
}

fn default_ack_timeout_secs() -> u64 {
    60
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
            public_key_file: None,
            reconcile_interval_secs: default_reconcile_interval_secs(),
            download_batch_size: default_download_batch_size(),
            ack_timeout_secs: default_ack_timeout_secs(),
            storage: StorageSettings::default(),
        }
    }
}

impl ServerConfig {
    pub fn for_testing() -> Self {
        Self {
            bind: "127.0.0.1".to_string(),
            port: 0,
            reconcile_interval_secs: 3600,
            ack_timeout_secs: 2,
            ..Self::default()
        }
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.bind, self.port)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.reconcile_interval_secs)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_secs(self.ack_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.download_batch_size == 0 {
            return Err("server.download_batch_size must be at least 1".to_string());
        }
        if self.reconcile_interval_secs == 0 {
            return Err("server.reconcile_interval_secs must be at least 1".to_string());
        }
        if self.ack_timeout_secs == 0 {
            return Err("server.ack_timeout_secs must be at least 1".to_string());
        }
        Ok(())
    }
}

/// Transfer client configuration.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Concurrent part transfers.
    #[serde(default = "default_num_threads")]
    pub num_threads: usize,
    /// Threads dedicated to checksum computation. Defaults to the number of
    /// available cores.
    #[serde(default)]
    pub checksum_threads: Option<usize>,
    #[serde(default = "default_min_part_size")]
    pub min_part_size: u64,
    #[serde(default = "default_max_part_count")]
    pub max_part_count: u64,
    /// Retries per part after the first attempt.
    #[serde(default = "default_max_retries")]
    pub max_retries: usize,
    /// Timeout for acknowledged session requests.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
    /// Parts announced per `upload:create` request.
    #[serde(default = "default_create_batch_size")]
    pub create_batch_size: usize,
}

fn default_num_threads() -> usize {
    4
}

fn default_min_part_size() -> u64 {
    DEFAULT_MIN_PART_SIZE
}

fn default_max_part_count() -> u64 {
    DEFAULT_MAX_PART_COUNT
}

fn default_max_retries() -> usize {
    10
}

fn default_request_timeout_secs() -> u64 {
    60
}

fn default_create_batch_size() -> usize {
    256
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            num_threads: default_num_threads(),
            checksum_threads: None,
            min_part_size: default_min_part_size(),
            max_part_count: default_max_part_count(),
            max_retries: default_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
            create_batch_size: default_create_batch_size(),
        }
    }
}

impl ClientConfig {
    pub fn for_testing() -> Self {
        Self {
            num_threads: 2,
            checksum_threads: Some(2),
            min_part_size: 4,
            max_retries: 1,
            request_timeout_secs: 5,
            ..Self::default()
        }
    }

    pub fn checksum_threads(&self) -> usize {
        self.checksum_threads.unwrap_or_else(|| {
            std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(1)
        })
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.num_threads == 0 {
            return Err("client.num_threads must be at least 1".to_string());
        }
        if self.checksum_threads == Some(0) {
            return Err("client.checksum_threads must be at least 1".to_string());
        }
        if self.min_part_size == 0 {
            return Err("client.min_part_size must be at least 1".to_string());
        }
        if self.max_part_count == 0 {
            return Err("client.max_part_count must be at least 1".to_string());
        }
        if self.create_batch_size == 0 {
            return Err("client.create_batch_size must be at least 1".to_string());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        AppConfig::default().validate().unwrap();
        AppConfig::for_testing().validate().unwrap();
    }

    #[test]
    fn test_metadata_config_from_connection() {
        match MetadataConfig::from_connection("sqlite", "sqlite://data/x.db").unwrap() {
            MetadataConfig::Sqlite { path } => assert_eq!(path, PathBuf::from("data/x.db")),
            other => panic!("unexpected config: {other:?}"),
        }
        match MetadataConfig::from_connection("postgres", "postgres://u:p@h/db").unwrap() {
            MetadataConfig::Postgres {
                url,
                max_connections,
            } => {
                assert_eq!(url, "postgres://u:p@h/db");
                assert_eq!(max_connections, 10);
            }
            other => panic!("unexpected config: {other:?}"),
        }
        assert!(MetadataConfig::from_connection("mysql", "x").is_err());
    }

    #[test]
    fn test_metadata_config_tagged_serde() {
        let config: MetadataConfig =
            serde_json::from_str(r#"{"type":"postgres","url":"postgres://h/db"}"#).unwrap();
        assert!(matches!(
            config,
            MetadataConfig::Postgres {
                max_connections: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_partial_server_config_uses_defaults() {
        let config: ServerConfig = serde_json::from_str(r#"{"port":9000}"#).unwrap();
        assert_eq!(config.port, 9000);
        assert_eq!(config.download_batch_size, DEFAULT_DOWNLOAD_BATCH_SIZE);
        assert_eq!(config.ack_timeout(), Duration::from_secs(60));
        assert_eq!(config.bind_addr(), "0.0.0.0:9000");
    }

    #[test]
    fn test_invalid_client_config() {
        let config = ClientConfig {
            num_threads: 0,
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
        let config = ClientConfig {
            checksum_threads: Some(0),
            ..ClientConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
