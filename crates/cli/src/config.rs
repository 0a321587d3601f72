//! Configuration loading for every subcommand.

use anyhow::{Context, Result};
use ferry_core::config::{AppConfig, MetadataConfig};
use figment::Figment;
use figment::providers::{Env, Format, Serialized, Toml};
use std::path::Path;

/// Defaults, then the TOML file, then `FERRY_*` variables
/// (`FERRY_SERVER__PORT=9000` sets `server.port`).
pub fn load(path: Option<&Path>) -> Result<AppConfig> {
    let mut figment = Figment::new().merge(Serialized::defaults(AppConfig::default()));
    if let Some(path) = path {
        anyhow::ensure!(path.exists(), "config file {} not found", path.display());
        tracing::debug!(path = %path.display(), "loading configuration file");
        figment = figment.merge(Toml::file(path));
    }
    figment
        .merge(Env::prefixed("FERRY_").split("__"))
        .extract()
        .context("failed to load configuration")
}

/// Replace the metadata section when both database flags are given.
pub fn apply_database(
    config: &mut AppConfig,
    database_type: Option<&str>,
    connection_string: Option<&str>,
) -> Result<()> {
    match (database_type, connection_string) {
        (Some(database_type), Some(connection_string)) => {
            config.metadata = MetadataConfig::from_connection(database_type, connection_string)
                .map_err(anyhow::Error::msg)?;
            Ok(())
        }
        (None, None) => Ok(()),
        _ => anyhow::bail!("--database-type and --connection-string must be given together"),
    }
}

pub fn validate(config: &AppConfig) -> Result<()> {
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid configuration")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_load_defaults() {
        let config = load(None).unwrap();
        assert_eq!(config.client.min_part_size, 8 * 1024 * 1024);
        assert_eq!(config.client.max_part_count, 10_000);
    }

    #[test]
    fn test_load_toml_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ferry.toml");
        std::fs::write(
            &path,
            r#"
[metadata]
type = "postgres"
url = "postgres://ferry@db/ferry"

[server]
port = 9000
download_batch_size = 64

[client]
num_threads = 16
"#,
        )
        .unwrap();

        let config = load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 9000);
        assert_eq!(config.server.download_batch_size, 64);
        assert_eq!(config.server.ack_timeout_secs, 60);
        assert_eq!(config.client.num_threads, 16);
        assert!(matches!(
            config.metadata,
            MetadataConfig::Postgres {
                max_connections: 10,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_config_file() {
        assert!(load(Some(Path::new("/nonexistent/ferry.toml"))).is_err());
    }

    #[test]
    fn test_apply_database() {
        let mut config = AppConfig::default();
        apply_database(&mut config, Some("sqlite"), Some("sqlite://state/ledger.db")).unwrap();
        match &config.metadata {
            MetadataConfig::Sqlite { path } => assert_eq!(path, &PathBuf::from("state/ledger.db")),
            other => panic!("unexpected metadata config: {other:?}"),
        }

        assert!(apply_database(&mut config, Some("sqlite"), None).is_err());
        assert!(apply_database(&mut config, Some("mysql"), Some("x")).is_err());
        apply_database(&mut config, None, None).unwrap();
    }
}
