//! HTTP handlers.

use crate::auth::{SessionParams, authenticate};
use crate::error::ApiResult;
use crate::session::{self, SessionHandler};
use crate::state::AppState;
use crate::upload::UploadCoordinator;
use axum::Json;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::HeaderMap;
use axum::response::Response;
use ferry_core::SessionRole;
use serde::Serialize;
use std::sync::Arc;
use uuid::Uuid;

/// Largest frame a peer may send. A full `upload:create` batch stays well
/// below this.
const MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

/// GET /v1/session
///
/// Authenticates the token and binds the role's handlers before upgrading,
/// so a bad token or an unknown provider is refused with a plain HTTP error.
pub async fn open_session(
    State(state): State<AppState>,
    Query(params): Query<SessionParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> ApiResult<Response> {
    let role = authenticate(&headers, &params, &state.verifier)?;

    let handler = match role {
        SessionRole::Upload {
            name,
            storage_provider_id,
        } => {
            let coordinator = UploadCoordinator::connect(
                &name,
                &storage_provider_id,
                state.metadata.clone(),
                state.storage.as_ref(),
                state.downloads.clone(),
            )
            .await?;
            SessionHandler::Upload(Arc::new(coordinator))
        }
        SessionRole::Download => SessionHandler::Download(state.downloads.clone()),
    };

    let session_id = params
        .session
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| Uuid::new_v4().to_string());

    let shutdown = state.shutdown.clone();
    Ok(ws
        .max_message_size(MAX_MESSAGE_SIZE)
        .on_upgrade(move |socket| session::run(socket, handler, session_id, shutdown)))
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub download_subscribers: usize,
}

/// GET /health
pub async fn health_check(State(state): State<AppState>) -> ApiResult<Json<HealthResponse>> {
    state.metadata.health_check().await?;
    Ok(Json(HealthResponse {
        status: "ok",
        download_subscribers: state.downloads.subscriber_count(),
    }))
}
