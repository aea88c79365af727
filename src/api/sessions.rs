// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Device session endpoints for the authenticated user.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};

use crate::{
    auth::{Auth, AuthError},
    models::SessionSummary,
    state::AppState,
};

/// Active sessions, newest first.
#[utoipa::path(
    get,
    path = "/v1/sessions",
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Active sessions", body = [SessionSummary]),
        (status = 401, description = "Unauthorized - invalid or missing token")
    )
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    Auth(user): Auth,
) -> Result<Json<Vec<SessionSummary>>, AuthError> {
    Ok(Json(state.gate.list_sessions(&user.user_id).await?))
}

#[utoipa::path(
    delete,
    path = "/v1/sessions/{session_id}",
    params(
        ("session_id" = String, Path, description = "Identifier of the session to revoke")
    ),
    tag = "Sessions",
    security(("bearer" = [])),
    responses(
        (status = 204, description = "Session revoked"),
        (status = 401, description = "Unauthorized - invalid or missing token"),
        (status = 404, description = "No active session with this id for the caller")
    )
)]
pub async fn revoke_session(
    Path(session_id): Path<String>,
    State(state): State<AppState>,
    Auth(user): Auth,
) -> Result<StatusCode, AuthError> {
    state.gate.revoke_session(&user.user_id, &session_id).await?;
    Ok(StatusCode::NO_CONTENT)
}
