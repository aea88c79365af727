// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Account and token endpoints.
//!
//! Access tokens travel in JSON bodies. Refresh tokens only ever travel in
//! the `refreshToken` cookie.

use axum::{
    extract::{Query, State},
    http::{header::SET_COOKIE, StatusCode},
    response::{IntoResponse, Redirect, Response},
    Json,
};
use serde::Deserialize;
use utoipa::IntoParams;

use crate::{
    auth::{
        cookie::{cleared_refresh_cookie, refresh_cookie},
        Auth, AuthError, ClientContext, IssuedTokens, LoginOutcome, RefreshCookie,
    },
    models::{
        ChallengeResponse, LoginRequest, LogoutAllResponse, LogoutResponse,
        SecondFactorLoginRequest, SignupRequest, TokenResponse, UserProfile,
    },
    state::AppState,
};

#[derive(Debug, Deserialize, IntoParams)]
pub struct VerifyEmailQuery {
    /// Token from the verification link.
    pub token: String,
}

#[derive(Debug, Deserialize, IntoParams)]
pub struct OAuthCallbackQuery {
    /// Authorization code issued by the provider.
    pub code: String,
    /// Opaque state handed out by `/v1/auth/google`.
    pub state: String,
}

/// Access token in the body, refresh token in the cookie.
fn token_response(state: &AppState, tokens: IssuedTokens) -> Result<Response, AuthError> {
    let cookie = refresh_cookie(&tokens.refresh, state.gate.settings().cookie_secure)?;
    let body = TokenResponse::bearer(tokens.access.token, tokens.access.expires_in);
    Ok(([(SET_COOKIE, cookie)], Json(body)).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/signup",
    request_body = SignupRequest,
    tag = "Auth",
    responses(
        (status = 201, description = "Account created, verification e-mail sent", body = UserProfile),
        (status = 409, description = "E-mail already registered"),
        (status = 422, description = "Invalid e-mail, password or display name")
    )
)]
pub async fn signup(
    State(state): State<AppState>,
    Json(request): Json<SignupRequest>,
) -> Result<(StatusCode, Json<UserProfile>), AuthError> {
    let profile = state.gate.signup(request).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

#[utoipa::path(
    get,
    path = "/v1/auth/verify-email",
    params(VerifyEmailQuery),
    tag = "Auth",
    responses(
        (status = 200, description = "Address verified", body = UserProfile),
        (status = 400, description = "Unknown token or already verified"),
        (status = 410, description = "Verification link expired, account removed")
    )
)]
pub async fn verify_email(
    State(state): State<AppState>,
    Query(query): Query<VerifyEmailQuery>,
) -> Result<Json<UserProfile>, AuthError> {
    let profile = state.gate.verify_email(&query.token).await?;
    Ok(Json(profile))
}

/// Password login.
///
/// Accounts with a second factor get `202 Accepted` and a challenge token to
/// redeem at `/v1/auth/login/second-factor`.
#[utoipa::path(
    post,
    path = "/v1/auth/login",
    request_body = LoginRequest,
    tag = "Auth",
    responses(
        (status = 200, description = "Logged in; refresh token set in cookie", body = TokenResponse),
        (status = 202, description = "Second factor required", body = ChallengeResponse),
        (status = 401, description = "Invalid credentials"),
        (status = 403, description = "Account locked, unverified or session quota reached")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    client: ClientContext,
    Json(request): Json<LoginRequest>,
) -> Result<Response, AuthError> {
    match state.gate.login(request, &client).await? {
        LoginOutcome::Authenticated(tokens) => token_response(&state, tokens),
        LoginOutcome::ChallengeRequired(challenge) => Ok((
            StatusCode::ACCEPTED,
            Json(ChallengeResponse {
                challenge_token: challenge.token,
                expires_in: challenge.expires_in,
            }),
        )
            .into_response()),
    }
}

#[utoipa::path(
    post,
    path = "/v1/auth/login/second-factor",
    request_body = SecondFactorLoginRequest,
    tag = "Auth",
    responses(
        (status = 200, description = "Logged in; refresh token set in cookie", body = TokenResponse),
        (status = 401, description = "Invalid challenge or code"),
        (status = 403, description = "Account locked or session quota reached")
    )
)]
pub async fn login_second_factor(
    State(state): State<AppState>,
    client: ClientContext,
    Json(request): Json<SecondFactorLoginRequest>,
) -> Result<Response, AuthError> {
    let tokens = state.gate.login_with_second_factor(request, &client).await?;
    token_response(&state, tokens)
}

/// Redirect the browser to Google's consent screen.
#[utoipa::path(
    get,
    path = "/v1/auth/google",
    tag = "Auth",
    responses(
        (status = 303, description = "Redirect to the provider"),
        (status = 404, description = "Google sign-in is not configured")
    )
)]
pub async fn google_login(State(state): State<AppState>) -> Result<Redirect, AuthError> {
    let url = state.gate.begin_federated_login().await?;
    Ok(Redirect::to(url.as_str()))
}

/// Provider callback: exchange the code, then log in like `/v1/auth/login`.
#[utoipa::path(
    get,
    path = "/v1/auth/google/callback",
    params(OAuthCallbackQuery),
    tag = "Auth",
    responses(
        (status = 200, description = "Logged in; refresh token set in cookie", body = TokenResponse),
        (status = 401, description = "Unknown state or rejected by the provider"),
        (status = 403, description = "Account locked or session quota reached"),
        (status = 404, description = "Google sign-in is not configured")
    )
)]
pub async fn google_callback(
    State(state): State<AppState>,
    client: ClientContext,
    Query(query): Query<OAuthCallbackQuery>,
) -> Result<Response, AuthError> {
    let tokens = state
        .gate
        .complete_federated_login(&query.code, &query.state, &client)
        .await?;
    token_response(&state, tokens)
}

/// Rotate the refresh token carried by the cookie.
#[utoipa::path(
    post,
    path = "/v1/auth/refresh",
    tag = "Auth",
    responses(
        (status = 200, description = "New token pair; refresh token set in cookie", body = TokenResponse),
        (status = 401, description = "Missing, invalid or superseded refresh token")
    )
)]
pub async fn refresh(
    State(state): State<AppState>,
    client: ClientContext,
    RefreshCookie(token): RefreshCookie,
) -> Result<Response, AuthError> {
    let tokens = state.gate.refresh(&token, &client).await?;
    token_response(&state, tokens)
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout",
    tag = "Auth",
    responses(
        (status = 200, description = "Session revoked; cookie cleared", body = LogoutResponse),
        (status = 401, description = "Missing or invalid refresh token")
    )
)]
pub async fn logout(
    State(state): State<AppState>,
    RefreshCookie(token): RefreshCookie,
) -> Result<Response, AuthError> {
    let revoked = state.gate.logout(&token).await?;
    let cookie = cleared_refresh_cookie(state.gate.settings().cookie_secure)?;
    Ok(([(SET_COOKIE, cookie)], Json(LogoutResponse { revoked })).into_response())
}

#[utoipa::path(
    post,
    path = "/v1/auth/logout-all",
    tag = "Auth",
    security(("bearer" = [])),
    responses(
        (status = 200, description = "Every session revoked; cookie cleared", body = LogoutAllResponse),
        (status = 401, description = "Unauthorized - invalid or missing token")
    )
)]
pub async fn logout_all(
    State(state): State<AppState>,
    Auth(user): Auth,
) -> Result<Response, AuthError> {
    let revoked_count = state.gate.logout_all(&user.user_id).await?;
    let cookie = cleared_refresh_cookie(state.gate.settings().cookie_secure)?;
    Ok(([(SET_COOKIE, cookie)], Json(LogoutAllResponse { revoked_count })).into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::test_support::{body_json, seed_user, send, test_state, PASSWORD};
    use crate::api::router;
    use axum::http::{header::COOKIE, Method};
    use serde_json::json;

    fn cookie_value(response: &Response) -> String {
        let header = response.headers().get(SET_COOKIE).unwrap().to_str().unwrap();
        header.split(';').next().unwrap().to_string()
    }

    #[tokio::test]
    async fn signup_returns_created_profile() {
        let (state, _dir) = test_state();
        let (status, Json(profile)) = signup(
            State(state),
            Json(SignupRequest {
                email: " New@Example.com ".to_string(),
                password: PASSWORD.to_string(),
                display_name: Some("Newcomer".to_string()),
            }),
        )
        .await
        .expect("signup succeeds");

        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(profile.email, "new@example.com");
        assert!(!profile.is_verified);
    }

    #[tokio::test]
    async fn verify_email_rejects_unknown_token() {
        let (state, _dir) = test_state();
        let err = verify_email(
            State(state),
            Query(VerifyEmailQuery {
                token: "nope".to_string(),
            }),
        )
        .await
        .unwrap_err();
        assert_eq!(err, AuthError::InvalidVerificationToken);
    }

    #[tokio::test]
    async fn login_refresh_logout_over_http() {
        let (state, _dir) = test_state();
        seed_user(&state, "a@x.com").await;
        let app = router(state);

        let response = send(
            &app,
            Method::POST,
            "/v1/auth/login",
            &[],
            Some(json!({ "email": "a@x.com", "password": PASSWORD })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let first_cookie = cookie_value(&response);
        assert!(first_cookie.starts_with("refreshToken="));
        let body = body_json(response).await;
        assert_eq!(body["token_type"], "Bearer");
        assert!(body["access_token"].as_str().is_some());

        let response = send(
            &app,
            Method::POST,
            "/v1/auth/refresh",
            &[(COOKIE.as_str(), first_cookie.as_str())],
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        let second_cookie = cookie_value(&response);
        assert_ne!(first_cookie, second_cookie);

        // The superseded cookie no longer refreshes
        let response = send(
            &app,
            Method::POST,
            "/v1/auth/refresh",
            &[(COOKIE.as_str(), first_cookie.as_str())],
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error_code"], "invalid_session");

        let response = send(
            &app,
            Method::POST,
            "/v1/auth/logout",
            &[(COOKIE.as_str(), second_cookie.as_str())],
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response
            .headers()
            .get(SET_COOKIE)
            .unwrap()
            .to_str()
            .unwrap()
            .contains("Max-Age=0"));
        assert_eq!(body_json(response).await["revoked"], true);
    }

    #[tokio::test]
    async fn refresh_without_cookie_is_unauthorized() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = send(&app, Method::POST, "/v1/auth/refresh", &[], None).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error_code"], "missing_credential");
    }

    #[tokio::test]
    async fn wrong_password_is_generic_unauthorized() {
        let (state, _dir) = test_state();
        seed_user(&state, "a@x.com").await;
        let app = router(state);

        for email in ["a@x.com", "ghost@x.com"] {
            let response = send(
                &app,
                Method::POST,
                "/v1/auth/login",
                &[],
                Some(json!({ "email": email, "password": "Wr0ng!pass" })),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(body_json(response).await["error_code"], "invalid_credentials");
        }
    }
    #[tokio::test]
    async fn repeated_failed_logins_block_the_address() {
        let (state, _dir) = test_state();
        seed_user(&state, "a@x.com").await;
        let app = router(state);
        let attacker = [("x-forwarded-for", "198.51.100.7")];

        for _ in 0..5 {
            let response = send(
                &app,
                Method::POST,
                "/v1/auth/login",
                &attacker,
                Some(json!({ "email": "ghost@x.com", "password": "Wr0ng!pass" })),
            )
            .await;
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        // Even the right password is refused until the window passes
        let response = send(
            &app,
            Method::POST,
            "/v1/auth/login",
            &attacker,
            Some(json!({ "email": "a@x.com", "password": PASSWORD })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
        assert_eq!(body_json(response).await["error_code"], "rate_limited");

        let response = send(
            &app,
            Method::POST,
            "/v1/auth/login/second-factor",
            &attacker,
            Some(json!({ "challenge_token": "x", "code": "000000" })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);

        // Other addresses are unaffected
        let response = send(
            &app,
            Method::POST,
            "/v1/auth/login",
            &[("x-forwarded-for", "198.51.100.8")],
            Some(json!({ "email": "a@x.com", "password": PASSWORD })),
        )
        .await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn successful_logins_are_not_throttled() {
        let (state, _dir) = test_state();
        seed_user(&state, "a@x.com").await;
        let app = router(state);

        for _ in 0..8 {
            let response = send(
                &app,
                Method::POST,
                "/v1/auth/login",
                &[("x-forwarded-for", "198.51.100.9")],
                Some(json!({ "email": "a@x.com", "password": PASSWORD })),
            )
            .await;
            assert_eq!(response.status(), StatusCode::OK);
        }
    }

    #[tokio::test]
    async fn google_sign_in_is_not_found_when_unconfigured() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = send(&app, Method::GET, "/v1/auth/google", &[], None).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);

        let response = send(
            &app,
            Method::GET,
            "/v1/auth/google/callback?code=abc&state=def",
            &[],
            None,
        )
        .await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
