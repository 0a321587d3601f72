//! HTTP-level errors. Everything past the session upgrade is reported over
//! the socket as a `Reply`, so this only covers the upgrade and the small
//! set of plain routes.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use ferry_metadata::MetadataError;
use ferry_signer::SignerError;
use serde::Serialize;

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: &'static str,
    pub message: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("missing session token")]
    MissingToken,

    /// Signature or encoding of the token is bad.
    #[error("invalid session token: {0}")]
    Token(#[from] SignerError),

    /// Token verified but its claims do not describe a usable session.
    #[error("invalid session claims: {0}")]
    Claims(#[from] ferry_core::Error),

    #[error("unknown storage provider: {0}")]
    UnknownProvider(String),

    #[error("storage error: {0}")]
    Storage(#[from] ferry_storage::StorageError),

    #[error("metadata error: {0}")]
    Metadata(#[from] MetadataError),
}

impl ApiError {
    pub fn code(&self) -> &'static str {
        match self {
            Self::MissingToken | Self::Token(_) | Self::Claims(_) => "unauthorized",
            Self::UnknownProvider(_) => "unknown_storage_provider",
            Self::Storage(_) => "storage_error",
            Self::Metadata(e) if e.is_business() => "rejected",
            Self::Metadata(_) => "metadata_error",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingToken | Self::Token(_) | Self::Claims(_) => StatusCode::UNAUTHORIZED,
            Self::UnknownProvider(_) => StatusCode::FORBIDDEN,
            Self::Storage(_) => StatusCode::BAD_GATEWAY,
            Self::Metadata(e) if e.is_business() => StatusCode::CONFLICT,
            Self::Metadata(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Whether the client may retry the same request later.
    pub fn is_transient(&self) -> bool {
        self.status_code().is_server_error()
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        if status.is_server_error() {
            tracing::warn!(error = %self, "request failed");
        } else {
            tracing::debug!(error = %self, %status, "request refused");
        }
        let body = ErrorResponse {
            code: self.code(),
            message: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
