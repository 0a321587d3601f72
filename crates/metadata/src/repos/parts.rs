//! Part repository.

use crate::error::MetadataResult;
use crate::models::{NewPart, PartRow};
use async_trait::async_trait;
use ferry_core::Range;
use uuid::Uuid;

/// Repository for part admission and completion.
#[async_trait]
pub trait PartRepo: Send + Sync {
    /// Announce a part of `(n, path)`.
    ///
    /// Creates the file on first sight and records its size. Returns `true`
    /// when the caller should transfer the part (new, or known but still
    /// incomplete) and `false` when the part is already complete.
    ///
    /// Fails with `MismatchedSize` if the file already has a different size,
    /// and with `OverlappingRange` if the range shares bytes with a different
    /// range of the same file.
    async fn add_part(&self, n: &str, path: &str, part: &NewPart) -> MetadataResult<bool>;

    /// Point lookup by part identity.
    async fn get_part(&self, checksum_md5: &str, range: Range) -> MetadataResult<Option<PartRow>>;

    /// Mark a part complete and return the owning file's `verified` flag.
    ///
    /// Fails with `PartNotFound` if the part was never announced for this
    /// file. Completing an already complete part is a no-op.
    async fn complete_part(
        &self,
        n: &str,
        path: &str,
        range: Range,
        checksum_md5: &str,
    ) -> MetadataResult<bool>;

    /// Ranges of the file's completed parts, ordered by start.
    async fn get_completed_ranges(&self, file_id: Uuid) -> MetadataResult<Vec<Range>>;
}
