//! Signer error types.

use thiserror::Error;

/// Key and token errors.
#[derive(Debug, Error)]
pub enum SignerError {
    #[error("key parsing error: {0}")]
    KeyParsing(String),

    #[error("malformed token: {0}")]
    MalformedToken(String),

    #[error("verification failed")]
    VerificationFailed,

    #[error("invalid claims: {0}")]
    InvalidClaims(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for signing operations.
pub type SignerResult<T> = std::result::Result<T, SignerError>;
