//! Database models mapping to the ledger schema.

use crate::error::{MetadataError, MetadataResult};
use ferry_core::{ProviderCredentials, Range, StorageBackendKind, StorageProvider};
use sqlx::FromRow;
use time::OffsetDateTime;
use uuid::Uuid;

/// Convert an unsigned offset or size into the signed 64-bit column type.
pub fn to_db_int(value: u64) -> MetadataResult<i64> {
    i64::try_from(value)
        .map_err(|_| MetadataError::Constraint(format!("value {value} exceeds 64-bit column")))
}

// =============================================================================
// Files
// =============================================================================

/// A file tracked under a scope name.
#[derive(Debug, Clone, FromRow)]
pub struct FileRow {
    pub file_id: Uuid,
    pub n: String,
    pub path: String,
    pub size: Option<i64>,
    pub checksum_sha256: Option<String>,
    pub verified: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl FileRow {
    /// File size in bytes, once announced.
    pub fn size(&self) -> Option<u64> {
        self.size.and_then(|s| u64::try_from(s).ok())
    }
}

// =============================================================================
// Parts
// =============================================================================

/// A byte range of a file identified by its MD5.
#[derive(Debug, Clone, FromRow)]
pub struct PartRow {
    pub checksum_md5: String,
    pub start_offset: i64,
    pub end_offset: i64,
    pub file_id: Uuid,
    pub complete: bool,
    pub created_at: OffsetDateTime,
    pub completed_at: Option<OffsetDateTime>,
}

impl PartRow {
    pub fn range(&self) -> MetadataResult<Range> {
        range_from_columns(self.start_offset, self.end_offset)
    }
}

pub(crate) fn range_from_columns(start: i64, end: i64) -> MetadataResult<Range> {
    let start = u64::try_from(start)
        .map_err(|_| MetadataError::Internal(format!("negative start offset {start}")))?;
    let end = u64::try_from(end)
        .map_err(|_| MetadataError::Internal(format!("negative end offset {end}")))?;
    Range::new(start, end).map_err(|e| MetadataError::Internal(e.to_string()))
}

/// A part announcement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewPart {
    pub range: Range,
    pub checksum_md5: String,
    /// Size of the whole file.
    pub size: u64,
}

impl NewPart {
    /// Check the announcement against its own file size.
    pub(crate) fn validate(&self, path: &str) -> MetadataResult<()> {
        if self.range.end() >= self.size {
            return Err(MetadataError::RangeOutOfBounds {
                path: path.to_string(),
                range: self.range.to_string(),
                size: self.size,
            });
        }
        Ok(())
    }
}

// =============================================================================
// Storage providers
// =============================================================================

#[derive(Debug, Clone, FromRow)]
pub struct StorageProviderRow {
    pub id: String,
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_location_constraint: Option<String>,
    pub download_url_template: Option<String>,
    pub created_at: OffsetDateTime,
}

impl From<StorageProviderRow> for StorageProvider {
    fn from(row: StorageProviderRow) -> Self {
        let kind = StorageBackendKind::from_endpoint(&row.endpoint);
        StorageProvider {
            id: row.id,
            endpoint: row.endpoint,
            region: row.region,
            credentials: ProviderCredentials {
                access_key_id: row.access_key_id,
                secret_access_key: row.secret_access_key,
            },
            bucket_location_constraint: row.bucket_location_constraint,
            download_url_template: row.download_url_template,
            kind,
        }
    }
}

/// Operator input for `add-storage-provider`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewStorageProvider {
    pub id: String,
    pub endpoint: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_location_constraint: Option<String>,
    pub download_url_template: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_to_db_int_bounds() {
        assert_eq!(to_db_int(313_203_334_286).unwrap(), 313_203_334_286);
        assert!(to_db_int(u64::MAX).is_err());
    }

    #[test]
    fn test_provider_row_resolves_kind() {
        let row = StorageProviderRow {
            id: "b2".to_string(),
            endpoint: "https://s3.us-west-002.backblazeb2.com".to_string(),
            region: "us-west-002".to_string(),
            access_key_id: "key".to_string(),
            secret_access_key: "secret".to_string(),
            bucket_location_constraint: None,
            download_url_template: None,
            created_at: OffsetDateTime::now_utc(),
        };
        let provider = StorageProvider::from(row);
        assert_eq!(provider.kind, StorageBackendKind::B2);
        assert_eq!(provider.credentials.access_key_id, "key");
    }

    #[test]
    fn test_part_range_rejects_corrupt_columns() {
        assert!(range_from_columns(-1, 5).is_err());
        assert!(range_from_columns(10, 5).is_err());
        assert_eq!(range_from_columns(0, 9).unwrap(), Range::new(0, 9).unwrap());
    }

    #[test]
    fn test_new_part_must_fit_file() {
        let part = NewPart {
            range: Range::new(90, 100).unwrap(),
            checksum_md5: "x".to_string(),
            size: 100,
        };
        match part.validate("p") {
            Err(MetadataError::RangeOutOfBounds { path, range, size }) => {
                assert_eq!(path, "p");
                assert_eq!(range, "90-100");
                assert_eq!(size, 100);
            }
            other => panic!("unexpected result: {other:?}"),
        }
        let part = NewPart {
            range: Range::new(90, 99).unwrap(),
            ..part
        };
        assert!(part.validate("p").is_ok());
    }
}
