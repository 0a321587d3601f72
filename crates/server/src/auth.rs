//! Session token extraction and verification.

use crate::error::{ApiError, ApiResult};
use axum::http::HeaderMap;
use axum::http::header::AUTHORIZATION;
use ferry_core::SessionRole;
use ferry_signer::TokenVerifier;
use serde::Deserialize;

/// Query parameters accepted on the session upgrade.
#[derive(Debug, Default, Deserialize)]
pub struct SessionParams {
    /// Token for clients that cannot set headers on the upgrade request.
    pub token: Option<String>,
    /// Stable id a download client keeps across reconnects.
    pub session: Option<String>,
}

/// Extract bearer token from Authorization header.
/// Per RFC 6750, the "Bearer" scheme is case-insensitive.
fn extract_bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| {
            if v.len() >= 7 && v[..7].eq_ignore_ascii_case("bearer ") {
                Some(v[7..].trim())
            } else {
                None
            }
        })
}

/// Resolve the session role from the upgrade request. The header wins over
/// the query parameter.
pub fn authenticate(
    headers: &HeaderMap,
    params: &SessionParams,
    verifier: &TokenVerifier,
) -> ApiResult<SessionRole> {
    let token = extract_bearer_token(headers)
        .or(params.token.as_deref())
        .filter(|t| !t.is_empty())
        .ok_or(ApiError::MissingToken)?;

    let claims = verifier.verify(token)?;
    Ok(claims.role()?)
}
