// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! User endpoints.

use axum::{extract::State, Json};

use crate::{
    auth::{Auth, AuthError},
    models::{UpdateProfileRequest, UserProfile},
    state::AppState,
};

/// Get the current authenticated user's profile.
///
/// Served from the identity cache when warm.
#[utoipa::path(
    get,
    path = "/v1/users/me",
    tag = "Users",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "User profile", body = UserProfile),
        (status = 401, description = "Unauthorized - invalid or missing token"),
    )
)]
pub async fn get_current_user(Auth(user): Auth) -> Json<UserProfile> {
    Json(user.profile)
}

#[utoipa::path(
    patch,
    path = "/v1/users/me",
    tag = "Users",
    request_body = UpdateProfileRequest,
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Updated profile", body = UserProfile),
        (status = 401, description = "Unauthorized - invalid or missing token"),
        (status = 422, description = "Invalid display name, or no second factor enrolled"),
    )
)]
pub async fn update_current_user(
    State(state): State<AppState>,
    Auth(user): Auth,
    Json(request): Json<UpdateProfileRequest>,
) -> Result<Json<UserProfile>, AuthError> {
    let profile = state.gate.update_profile(&user.user_id, request).await?;
    Ok(Json(profile))
}
