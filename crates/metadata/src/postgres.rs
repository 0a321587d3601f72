//! PostgreSQL-based metadata store implementation.

use crate::error::{MetadataError, MetadataResult};
use crate::models::*;
use crate::repos::{FileRepo, PartRepo, StorageProviderRepo};
use crate::store::MetadataStore;
use async_trait::async_trait;
use ferry_core::{Range, StorageProvider};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::{Pool, Postgres, Transaction};
use std::future::Future;
use std::str::FromStr;
use time::OffsetDateTime;
use uuid::Uuid;

/// PostgreSQL schema (embedded).
const POSTGRES_SCHEMA: &str = include_str!("postgres_schema.sql");

/// Attempts per ledger transaction before a conflict is surfaced.
const MAX_TX_ATTEMPTS: u32 = 8;

fn postgres_schema_statements(schema: &str) -> Vec<&str> {
    schema
        .split(';')
        .filter_map(|statement| {
            let trimmed = statement.trim();
            if trimmed.is_empty() {
                return None;
            }
            let has_sql = trimmed.lines().any(|line| {
                let line = line.trim();
                !line.is_empty() && !line.starts_with("--")
            });
            has_sql.then_some(trimmed)
        })
        .collect()
}

/// Serialization failures (40001) and unique violations from a concurrent
/// insert of the same key (23505) succeed when the transaction is replayed.
fn is_retryable(err: &MetadataError) -> bool {
    match err {
        MetadataError::Database(sqlx::Error::Database(db_err)) => {
            matches!(db_err.code().as_deref(), Some("40001") | Some("23505"))
        }
        _ => false,
    }
}

async fn with_retry<T, F, Fut>(operation: &str, op: F) -> MetadataResult<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = MetadataResult<T>>,
{
    let mut attempt = 1;
    loop {
        match op().await {
            Err(err) if attempt < MAX_TX_ATTEMPTS && is_retryable(&err) => {
                tracing::debug!(operation, attempt, error = %err, "retrying conflicting transaction");
                attempt += 1;
            }
            result => return result,
        }
    }
}

/// PostgreSQL-based metadata store.
pub struct PostgresStore {
    pool: Pool<Postgres>,
}

impl PostgresStore {
    /// Connect using a `postgres://` URL. Does not create the schema.
    pub async fn connect(url: &str, max_connections: u32) -> MetadataResult<Self> {
        let opts = PgConnectOptions::from_str(url)?;
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect_with(opts)
            .await?;
        Ok(Self { pool })
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &Pool<Postgres> {
        &self.pool
    }

    async fn begin_serializable(&self) -> MetadataResult<Transaction<'_, Postgres>> {
        let mut tx = self.pool.begin().await?;
        sqlx::query("SET TRANSACTION ISOLATION LEVEL SERIALIZABLE")
            .execute(&mut *tx)
            .await?;
        Ok(tx)
    }

    async fn set_checksum_once(&self, n: &str, path: &str, checksum: &str) -> MetadataResult<()> {
        let now = OffsetDateTime::now_utc();
        let mut tx = self.begin_serializable().await?;
        sqlx::query(
            r#"
            INSERT INTO files (file_id, n, path, size, checksum_sha256, verified, created_at, updated_at)
            VALUES ($1, $2, $3, NULL, $4, FALSE, $5, $5)
            ON CONFLICT (n, path) DO UPDATE SET
                verified = CASE WHEN files.checksum_sha256 IS NOT DISTINCT FROM EXCLUDED.checksum_sha256
                                THEN files.verified ELSE FALSE END,
                checksum_sha256 = EXCLUDED.checksum_sha256,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(n)
        .bind(path)
        .bind(checksum)
        .bind(now)
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn add_part_once(&self, n: &str, path: &str, part: &NewPart) -> MetadataResult<bool> {
        let size = to_db_int(part.size)?;
        let start = to_db_int(part.range.start())?;
        let end = to_db_int(part.range.end())?;
        let now = OffsetDateTime::now_utc();

        let mut tx = self.begin_serializable().await?;

        let file = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE n = $1 AND path = $2")
            .bind(n)
            .bind(path)
            .fetch_optional(&mut *tx)
            .await?;

        let file_id = match file {
            None => {
                let file_id = Uuid::new_v4();
                sqlx::query(
                    "INSERT INTO files (file_id, n, path, size, checksum_sha256, verified, created_at, updated_at) VALUES ($1, $2, $3, $4, NULL, FALSE, $5, $5)",
                )
                .bind(file_id)
                .bind(n)
                .bind(path)
                .bind(size)
                .bind(now)
                .execute(&mut *tx)
                .await?;
                file_id
            }
            Some(file) => {
                match file.size {
                    None => {
                        sqlx::query("UPDATE files SET size = $1, updated_at = $2 WHERE file_id = $3")
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
            "SELECT * FROM parts WHERE checksum_md5 = $1 AND start_offset = $2 AND end_offset = $3",
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
                    WHERE file_id = $1 AND start_offset <= $2 AND end_offset >= $3
                      AND NOT (start_offset = $3 AND end_offset = $2)
                    LIMIT 1
                    "#,
                )
                .bind(file_id)
                .bind(end)
                .bind(start)
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
                    "INSERT INTO parts (checksum_md5, start_offset, end_offset, file_id, complete, created_at, completed_at) VALUES ($1, $2, $3, $4, FALSE, $5, NULL)",
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

    async fn complete_part_once(
        &self,
        n: &str,
        path: &str,
        range: Range,
        checksum_md5: &str,
    ) -> MetadataResult<bool> {
        let start = to_db_int(range.start())?;
        let end = to_db_int(range.end())?;
        let not_found = || MetadataError::PartNotFound(format!("{n}:{path} {range} {checksum_md5}"));

        let mut tx = self.begin_serializable().await?;

        let verified: bool =
            sqlx::query_scalar("SELECT verified FROM files WHERE n = $1 AND path = $2")
                .bind(n)
                .bind(path)
                .fetch_optional(&mut *tx)
                .await?
                .ok_or_else(not_found)?;

        let result = sqlx::query(
            r#"
            UPDATE parts SET
                complete = TRUE,
                completed_at = COALESCE(completed_at, $1)
            WHERE checksum_md5 = $2 AND start_offset = $3 AND end_offset = $4
              AND file_id = (SELECT file_id FROM files WHERE n = $5 AND path = $6)
            "#,
        )
        .bind(OffsetDateTime::now_utc())
        .bind(checksum_md5)
        .bind(start)
        .bind(end)
        .bind(n)
        .bind(path)
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            return Err(not_found());
        }

        tx.commit().await?;
        Ok(verified)
    }
}

#[async_trait]
impl MetadataStore for PostgresStore {
    async fn migrate(&self) -> MetadataResult<()> {
        // PostgreSQL doesn't allow multiple statements in a single prepared statement.
        for statement in postgres_schema_statements(POSTGRES_SCHEMA) {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        tracing::info!("postgres schema synchronized");
        Ok(())
    }

    async fn health_check(&self) -> MetadataResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl FileRepo for PostgresStore {
    async fn set_checksum_sha256(&self, n: &str, path: &str, checksum: &str) -> MetadataResult<()> {
        with_retry("set_checksum_sha256", || {
            self.set_checksum_once(n, path, checksum)
        })
        .await
    }

    async fn get_file(&self, n: &str, path: &str) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE n = $1 AND path = $2")
            .bind(n)
            .bind(path)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn get_file_by_id(&self, file_id: Uuid) -> MetadataResult<Option<FileRow>> {
        let row = sqlx::query_as::<_, FileRow>("SELECT * FROM files WHERE file_id = $1")
            .bind(file_id)
            .fetch_optional(&self.pool)
            .await?;
        Ok(row)
    }

    async fn set_verified(&self, n: &str, path: &str) -> MetadataResult<()> {
        let result =
            sqlx::query("UPDATE files SET verified = TRUE, updated_at = $1 WHERE n = $2 AND path = $3")
                .bind(OffsetDateTime::now_utc())
                .bind(n)
                .bind(path)
                .execute(&self.pool)
                .await?;
        if result.rows_affected() == 0 {
            return Err(MetadataError::NotFound(format!("file {n}:{path}")));
        }
        Ok(())
    }

    async fn get_files_to_verify(&self) -> MetadataResult<Vec<FileRow>> {
        let rows = sqlx::query_as::<_, FileRow>(
            "SELECT * FROM files WHERE checksum_sha256 IS NOT NULL AND verified = FALSE ORDER BY n, path",
        )
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }
}

#[async_trait]
impl PartRepo for PostgresStore {
    async fn add_part(&self, n: &str, path: &str, part: &NewPart) -> MetadataResult<bool> {
        part.validate(path)?;
        with_retry("add_part", || self.add_part_once(n, path, part)).await
    }

    async fn get_part(&self, checksum_md5: &str, range: Range) -> MetadataResult<Option<PartRow>> {
        let row = sqlx::query_as::<_, PartRow>(
            "SELECT * FROM parts WHERE checksum_md5 = $1 AND start_offset = $2 AND end_offset = $3",
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
        with_retry("complete_part", || {
            self.complete_part_once(n, path, range, checksum_md5)
        })
        .await
    }

    async fn get_completed_ranges(&self, file_id: Uuid) -> MetadataResult<Vec<Range>> {
        let rows: Vec<(i64, i64)> = sqlx::query_as(
            "SELECT start_offset, end_offset FROM parts WHERE file_id = $1 AND complete = TRUE ORDER BY start_offset",
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
impl StorageProviderRepo for PostgresStore {
    async fn add_storage_provider(&self, provider: &NewStorageProvider) -> MetadataResult<()> {
        sqlx::query(
            r#"
            INSERT INTO storage_providers
                (id, endpoint, region, access_key_id, secret_access_key,
                 bucket_location_constraint, download_url_template, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE SET
                endpoint = EXCLUDED.endpoint,
                region = EXCLUDED.region,
                access_key_id = EXCLUDED.access_key_id,
                secret_access_key = EXCLUDED.secret_access_key,
                bucket_location_constraint = EXCLUDED.bucket_location_constraint,
                download_url_template = EXCLUDED.download_url_template
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
        let row =
            sqlx::query_as::<_, StorageProviderRow>("SELECT * FROM storage_providers WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(StorageProvider::from))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_schema_statements_skip_comments() {
        let statements = postgres_schema_statements(POSTGRES_SCHEMA);
        assert_eq!(statements.len(), 5);
        assert!(statements[0].contains("CREATE TABLE IF NOT EXISTS files"));
        assert!(statements.iter().all(|s| !s.is_empty()));
    }

    #[test]
    fn test_non_database_errors_are_not_retried() {
        assert!(!is_retryable(&MetadataError::Internal("x".to_string())));
        assert!(!is_retryable(&MetadataError::Database(sqlx::Error::PoolTimedOut)));
    }
}
