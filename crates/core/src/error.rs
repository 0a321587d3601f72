//! Error types for the core domain.

use thiserror::Error;

/// Core domain error type.
#[derive(Debug, Error)]
pub enum Error {
    #[error("parse error: {0}")]
    Parse(String),

    #[error("overlapping ranges: {first} and {second}")]
    Overlap { first: String, second: String },

    #[error("invalid hash: {0}")]
    InvalidHash(String),

    #[error("invalid token: {0}")]
    InvalidToken(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Result type alias for core operations.
pub type Result<T> = std::result::Result<T, Error>;
