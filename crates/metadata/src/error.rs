//! Error types for metadata operations.

use thiserror::Error;

/// Metadata store operation errors.
#[derive(Debug, Error)]
pub enum MetadataError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Completion was reported for a part that was never announced.
    #[error("part not found: {0}")]
    PartNotFound(String),

    /// A part announced a file size different from the stored one.
    #[error("mismatched size for {path}: stored {stored}, announced {announced}")]
    MismatchedSize {
        path: String,
        stored: u64,
        announced: u64,
    },

    /// A part range ends at or past the size of its file.
    #[error("range {range} of {path} extends past file size {size}")]
    RangeOutOfBounds {
        path: String,
        range: String,
        size: u64,
    },

    #[error("range {range} overlaps stored range {existing} of {path}")]
    OverlappingRange {
        path: String,
        range: String,
        existing: String,
    },

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("constraint violation: {0}")]
    Constraint(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl MetadataError {
    /// Business-rule violations that callers report back to the peer rather
    /// than treating as faults.
    pub fn is_business(&self) -> bool {
        matches!(
            self,
            Self::NotFound(_)
                | Self::PartNotFound(_)
                | Self::MismatchedSize { .. }
                | Self::RangeOutOfBounds { .. }
                | Self::OverlappingRange { .. }
                | Self::Constraint(_)
        )
    }
}

impl From<std::io::Error> for MetadataError {
    fn from(err: std::io::Error) -> Self {
        MetadataError::Internal(format!("io error: {err}"))
    }
}

/// Result type for metadata operations.
pub type MetadataResult<T> = std::result::Result<T, MetadataError>;
