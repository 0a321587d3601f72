//! Metadata store trait and the SQLite implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::FileRow;
use crate::repos::{FileRepo, PartRepo, StorageProviderRepo};
use async_trait::async_trait;
use ferry_core::is_fully_covered;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

/// Combined metadata store trait.
#[async_trait]
pub trait MetadataStore: FileRepo + PartRepo + StorageProviderRepo + Send + Sync {
    /// Create the schema. Only `synchronize` calls this; coordinators expect
    /// the tables to exist already.
    async fn migrate(&self) -> MetadataResult<()>;

    /// Check database connectivity and health.
    async fn health_check(&self) -> MetadataResult<()>;

    /// Whether the file has a size, a checksum, and completed parts covering
    /// every byte.
    async fn is_file_complete(&self, file: &FileRow) -> MetadataResult<bool> {
        let (Some(size), Some(_)) = (file.size(), file.checksum_sha256.as_ref()) else {
            return Ok(false);
        };
        let ranges = self.get_completed_ranges(file.file_id).await?;
        is_fully_covered(&ranges, size).map_err(|e| {
            MetadataError::Internal(format!("ledger ranges of {} are inconsistent: {e}", file.path))
        })
    }
}

/// SQLite-based metadata store.
pub struct SqliteStore {
    pool: Pool<Sqlite>,
}

impl SqliteStore {
    /// Open (or create) the database file. Does not create the schema.
    pub async fn connect(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let path = path.as_ref();
        let in_memory = path.as_os_str() == ":memory:";

        if !in_memory
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::from_str(&format!("sqlite:{}?mode=rwc", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            // One connection serializes every transaction, which is the
            // isolation the ledger relies on.
            .max_connections(1)
            .connect_with(opts)
            .await?;

        Ok(Self { pool })
    }

    /// Open and create the schema in one step. Intended for tests and
    /// `synchronize`.
    pub async fn connect_and_migrate(path: impl AsRef<Path>) -> MetadataResult<Self> {
        let store = Self::connect(path).await?;
        store.migrate().await?;
        Ok(store)
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Sqlite> {
        &self.pool
    }
}

#[async_trait]
impl MetadataStore for SqliteStore {
    async fn migrate(&self) -> MetadataResult<()> {
        sqlx::query(SCHEMA_SQL).execute(&self.pool).await?;
        tracing::info!("sqlite schema synchronized");
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

mod sqlite_impl {
    use super::*;
    use crate::models::*;
    use ferry_core::{Range, StorageProvider};
    use time::OffsetDateTime;
    use uuid::Uuid;

    #[async_trait]
    impl FileRepo for SqliteStore {
        async fn set_checksum_sha256(
            &self,
            n: &str,
            path: &str,
            checksum: &str,
        ) -> MetadataResult<()> {
            let now = OffsetDateTime::now_utc();
            let mut tx = self.pool.begin().await?;
            sqlx::query(
                r#"
                INSERT INTO files (file_id, n, path, size, checksum_sha256, verified, created_at, updated_at)
                VALUES (?, ?, ?, NULL, ?, 0, ?, ?)
                ON CONFLICT(n, path) DO UPDATE SET
                    verified = CASE WHEN files.checksum_sha256 IS excluded.checksum_sha256
                                    THEN files.verified ELSE 0 END,
                    checksum_sha256 = excluded.checksum_sha256,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(n)
            .bind(path)
            .bind(checksum)
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
            tx.commit().await?;
            Ok(())
        }

        async fn get_file(&self, n: &str, path: &str) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE n = ? AND path = ?")
                .bind(n)
                .bind(path)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn get_file_by_id(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>> {
            let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = ?")
                .bind(file_id)
                .fetch_optional(&self.pool)
                .await?;
            Ok(row)
        }

        async fn set_verified(&self, n: &str, path: &str) -> MetadataResult<()> {
            let mut tx = self.pool.begin().await?;
            let result =
                sqlx::query("UPDATE files SET verified = 1, updated_at = ? WHERE n = ? AND path = ?")
                    .bind(OffsetDateTime::now_utc())
                    .bind(n)
                    .bind(path)
                    .execute(&mut *tx)
                    .await?;
            if result.rows_affected() == 0 {
                return Err(MetadataError::NotFound(format!("file {n}:{path}")));
            }
            tx.commit().await?;
            Ok(())
        }

        async fn get_files_to_verify(&self) -> MetadataResult<Vec<FileRow>> {
            let rows = sqlx::query_as::<_, FileRow>(
                "SELECT * FROM files WHERE checksum_sha256 IS NOT NULL AND verified = 0 ORDER BY n, path",
            )
            .fetch_all(&self.pool)
            .await?;
            Ok(rows)
        }
    }

    #[async_trait]
    impl PartRepo for SqliteStore {
        async fn add_part(&self, n: &str, path: &str, part: &NewPart) -> MetadataResult<bool> {
            part.validate(path)?;
            let size = to_db_int(part.size)?;
            let start = to_db_int(part.range.start())?;
            let end = to_db_int(part.range.end())?;
            let now = OffsetDateTime::now_utc();

            let mut tx = self.pool.begin().await?;

            let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE n = ? AND path = ?")
                .bind(n)
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?;

            let file_id = match file {
                None => {
                    let file_id = Uuid::new_v4();
                    sqlx::query(
                        "INSERT INTO files (file_id, n, path, size, checksum_sha256, verified, created_at, updated_at) VALUES (?, ?, ?, ?, NULL, 0, ?, ?)",
                    )
                    .bind(file_id)
                    .bind(n)
                    .bind(path)
                    .bind(size)
                    .bind(now)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    file_id
                }
                Some(file) => {
                    match file.size {
                        None => {
                            sqlx::query(
                                "UPDATE files SET size = ?, updated_at = ? WHERE file_id = ?",
                            )
                            .bind(size)
                            .bind(now)
                            .bind(file.file_id)
                            .execute(&mut *tx)
                            .await?;
                        }
                        Some(stored) if stored != size => {
                            return Err(MetadataError::MismatchedSize {
                                path: path.to_string(),
                                stored: stored as u64,
                                announced: part.size,
                            });
                        }
                        Some(_) => {}
                    }
                    file.file_id
                }
            };

            let existing = sqlx::query_as::<_, PartRow>(
                "SELECT * FROM parts WHERE checksum_md5 = ? AND start_offset = ? AND end_offset = ?",
            )
            .bind(&part.checksum_md5)
            .bind(start)
            .bind(end)
            .fetch_optional(&mut *tx)
            .await?;

            let admitted = match existing {
                Some(existing) if existing.file_id != file_id => {
                    return Err(MetadataError::Constraint(format!(
                        "part {}@{} already belongs to another file",
                        part.checksum_md5, part.range
                    )));
                }
                Some(existing) => !existing.complete,
                None => {
                    let overlapping: Option<(i64, i64)> = sqlx::query_as(
                        r#"
                        SELECT start_offset, end_offset FROM parts
                        WHERE file_id = ? AND start_offset <= ? AND end_offset >= ?
                          AND NOT (start_offset = ? AND end_offset = ?)
                        LIMIT 1
                        "#,
                    )
                    .bind(file_id)
                    .bind(end)
                    .bind(start)
                    .bind(start)
                    .bind(end)
                    .fetch_optional(&mut *tx)
                    .await?;

                    if let Some((existing_start, existing_end)) = overlapping {
                        return Err(MetadataError::OverlappingRange {
                            path: path.to_string(),
                            range: part.range.to_string(),
                            existing: format!("{existing_start}-{existing_end}"),
                        });
                    }

                    sqlx::query(
                        "INSERT INTO parts (checksum_md5, start_offset, end_offset, file_id, complete, created_at, completed_at) VALUES (?, ?, ?, ?, 0, ?, NULL)",
                    )
                    .bind(&part.checksum_md5)
                    .bind(start)
                    .bind(end)
                    .bind(file_id)
                    .bind(now)
                    .execute(&mut *tx)
                    .await?;
                    true
                }
            };

            tx.commit().await?;
            Ok(admitted)
        }

        async fn get_part(
            &self,
            checksum_md5: &str,
            range: Range,
        ) -> MetadataResult<Option<PartRow>> {
            let row = sqlx::query_as::<_, PartRow>(
                "SELECT * FROM parts WHERE checksum_md5 = ? AND start_offset = ? AND end_offset = ?",
            )
            .bind(checksum_md5)
            .bind(to_db_int(range.start())?)
            .bind(to_db_int(range.end())?)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row)
        }

        async fn complete_part(
            &self,
            n: &str,
            path: &str,
            range: Range,
            checksum_md5: &str,
        ) -> MetadataResult<bool> {
            let start = to_db_int(range.start())?;
            let end = to_db_int(range.end())?;
            let not_found = || MetadataError::PartNotFound(format!("{n}:{path} {range} {checksum_md5}"));

            let mut tx = self.pool.begin().await?;

            let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE n = ? AND path = ?")
                .bind(n)
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(not_found)?;

            let part = sqlx::query_as::<_, PartRow>(
                "SELECT * FROM parts WHERE checksum_md5 = ? AND start_offset = ? AND end_offset = ? AND file_id = ?",
            )
            .bind(checksum_md5)
            .bind(start)
            .bind(end)
            .bind(file.file_id)
            .fetch_optional(&mut *tx)
            .await?
            .ok_or_else(not_found)?;

            if !part.complete {
                sqlx::query(
                    "UPDATE parts SET complete = 1, completed_at = ? WHERE checksum_md5 = ? AND start_offset = ? AND end_offset = ?",
                )
                .bind(OffsetDateTime::now_utc())
                .bind(checksum_md5)
                .bind(start)
                .bind(end)
                .execute(&mut *tx)
                .await?;
            }

            tx.commit().await?;
            Ok(file.verified)
        }

        async fn get_completed_ranges(&self, file_id: Uuid) -> MetadataResult<Vec<Range>> {
            let rows: Vec<(i64, i64)> = sqlx::query_as(
                "SELECT start_offset, end_offset FROM parts WHERE file_id = ? AND complete = 1 ORDER BY start_offset",
            )
            .bind(file_id)
            .fetch_all(&self.pool)
            .await?;
            rows.into_iter()
                .map(|(start, end)| range_from_columns(start, end))
                .collect()
        }
    }

    #[async_trait]
    impl StorageProviderRepo for SqliteStore {
        async fn add_storage_provider(&self, provider: &NewStorageProvider) -> MetadataResult<()> {
            sqlx::query(
                r#"
                INSERT INTO storage_providers
                    (id, endpoint, region, access_key_id, secret_access_key,
                     bucket_location_constraint, download_url_template, created_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?)
                ON CONFLICT(id) DO UPDATE SET
                    endpoint = excluded.endpoint,
                    region = excluded.region,
                    access_key_id = excluded.access_key_id,
                    secret_access_key = excluded.secret_access_key,
                    bucket_location_constraint = excluded.bucket_location_constraint,
                    download_url_template = excluded.download_url_template
                "#,
            )
            .bind(&provider.id)
            .bind(&provider.endpoint)
            .bind(&provider.region)
            .bind(&provider.access_key_id)
            .bind(&provider.secret_access_key)
            .bind(&provider.bucket_location_constraint)
            .bind(&provider.download_url_template)
            .bind(OffsetDateTime::now_utc())
            .execute(&self.pool)
            .await?;
            Ok(())
        }

        async fn get_storage_providers(&self) -> MetadataResult<Vec<StorageProvider>> {
            let rows =
                sqlx::query_as::<_, StorageProviderRow>("SELECT * FROM storage_providers ORDER BY id")
                    .fetch_all(&self.pool)
                    .await?;
            Ok(rows.into_iter().map(StorageProvider::from).collect())
        }

        async fn get_storage_provider(&self, id: &str) -> MetadataResult<Option<StorageProvider>> {
            let row = sqlx::query_as::<_, StorageProviderRow>(
                "SELECT * FROM storage_providers WHERE id = ?",
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
            Ok(row.map(StorageProvider::from))
        }
    }
}

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS files (
    file_id BLOB NOT NULL UNIQUE,
    n TEXT NOT NULL,
    path TEXT NOT NULL,
    size INTEGER,
    checksum_sha256 TEXT,
    verified INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (n, path)
);

CREATE INDEX IF NOT EXISTS idx_files_to_verify
    ON files(verified) WHERE checksum_sha256 IS NOT NULL;

CREATE TABLE IF NOT EXISTS parts (
    checksum_md5 TEXT NOT NULL,
    start_offset INTEGER NOT NULL,
    end_offset INTEGER NOT NULL,
    file_id BLOB NOT NULL REFERENCES files(file_id) ON DELETE CASCADE,
    complete INTEGER NOT NULL DEFAULT 0,
    created_at TEXT NOT NULL,
    completed_at TEXT,
    PRIMARY KEY (checksum_md5, start_offset, end_offset),
    CHECK (start_offset >= 0 AND end_offset >= start_offset)
);

CREATE INDEX IF NOT EXISTS idx_parts_file ON parts(file_id, start_offset);

CREATE TABLE IF NOT EXISTS storage_providers (
    id TEXT PRIMARY KEY,
    endpoint TEXT NOT NULL,
    region TEXT NOT NULL,
    access_key_id TEXT NOT NULL,
    secret_access_key TEXT NOT NULL,
    bucket_location_constraint TEXT,
    download_url_template TEXT,
    created_at TEXT NOT NULL
);
"#;
