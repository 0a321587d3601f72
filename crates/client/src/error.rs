//! Error types for the transfer clients.

use std::time::Duration;
use thiserror::Error;

/// Transfer client errors.
///
/// Three groups matter to callers: transport errors are retried, integrity
/// errors end the part, and everything else is reported as is.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("unexpected response status {status}")]
    InvalidResponse { status: u16 },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("etag mismatch: body hashed to {computed}, storage reported {etag}")]
    EtagMismatch { computed: String, etag: String },

    #[error("checksum mismatch for {subject}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        subject: String,
        expected: String,
        actual: String,
    },

    #[error("size mismatch: expected {expected} bytes, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("unsafe local path: {0}")]
    UnsafePath(String),

    #[error("session error: {0}")]
    Session(String),

    #[error("no reply within {0:?}")]
    Timeout(Duration),

    #[error("rejected by server: {0}")]
    Rejected(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("checksum pool: {0}")]
    Pool(#[from] rayon::ThreadPoolBuildError),

    #[error(transparent)]
    Core(#[from] ferry_core::Error),
}

impl ClientError {
    /// Whether retrying the same transfer may succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            Self::InvalidResponse { status } => is_retryable_status(*status),
            Self::Transport(e) => !e.is_builder() && !e.is_decode(),
            Self::Timeout(_) => true,
            _ => false,
        }
    }

    pub fn is_integrity(&self) -> bool {
        matches!(
            self,
            Self::EtagMismatch { .. } | Self::ChecksumMismatch { .. } | Self::SizeMismatch { .. }
        )
    }
}

/// Statuses worth retrying: request timeout, rate limiting and every server
/// error, which includes the CDN origin errors 520-527 and 530.
pub fn is_retryable_status(status: u16) -> bool {
    matches!(status, 408 | 429 | 500..=599)
}

/// Result type alias for client operations.
pub type ClientResult<T> = std::result::Result<T, ClientError>;
