// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use axum::{
    body::Body,
    extract::MatchedPath,
    http::Request,
    middleware,
    routing::{delete, get, post},
    Router,
};
use tower::ServiceBuilder;
use tower_http::{
    cors::CorsLayer,
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info_span, Span};
use utoipa::{
    openapi::security::{Http, HttpAuthScheme, SecurityScheme},
    Modify, OpenApi,
};
use utoipa_swagger_ui::SwaggerUi;

use crate::{
    models::{
        ChallengeResponse, LoginRequest, LogoutAllResponse, LogoutResponse,
        SecondFactorLoginRequest, SessionSummary, SignupRequest, TokenResponse,
        UpdateProfileRequest, UserProfile,
    },
    state::AppState,
};

pub mod auth;
pub mod health;
pub mod rate_limit;
pub mod sessions;
pub mod users;

pub fn router(state: AppState) -> Router {
    // Failed attempts on these routes count toward the per-IP limit
    let throttled = Router::new()
        .route("/auth/signup", post(auth::signup))
        .route("/auth/login", post(auth::login))
        .route("/auth/login/second-factor", post(auth::login_second_factor))
        .route_layer(middleware::from_fn_with_state(
            state.rate_limiter.clone(),
            rate_limit::limit_failed_attempts,
        ));

    let v1_routes = Router::new()
        .merge(throttled)
        .route("/auth/verify-email", get(auth::verify_email))
        .route("/auth/google", get(auth::google_login))
        .route("/auth/google/callback", get(auth::google_callback))
        .route("/auth/refresh", post(auth::refresh))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/logout-all", post(auth::logout_all))
        .route(
            "/users/me",
            get(users::get_current_user).patch(users::update_current_user),
        )
        .route("/sessions", get(sessions::list_sessions))
        .route("/sessions/{session_id}", delete(sessions::revoke_session));

    Router::new()
        .nest("/v1", v1_routes)
        .route("/health", get(health::health))
        .route("/health/live", get(health::liveness))
        .route("/health/ready", get(health::readiness))
        .with_state(state)
        .merge(SwaggerUi::new("/docs").url("/api-doc/openapi.json", ApiDoc::openapi()))
        .layer(
            ServiceBuilder::new()
                .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
                .layer(PropagateRequestIdLayer::x_request_id())
                .layer(TraceLayer::new_for_http().make_span_with(make_span))
                .layer(CorsLayer::permissive()),
        )
}

fn make_span(request: &Request<Body>) -> Span {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|val| val.to_str().ok())
        .unwrap_or("none");
    let matched_path = request
        .extensions()
        .get::<MatchedPath>()
        .map_or_else(|| request.uri().path(), MatchedPath::as_str);

    info_span!(
        "http.request",
        http.method = %request.method(),
        http.route = matched_path,
        request_id
    )
}

/// Registers the `bearer` scheme referenced by authenticated paths.
struct BearerAuth;

impl Modify for BearerAuth {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        let components = openapi.components.get_or_insert_with(Default::default);
        components.add_security_scheme(
            "bearer",
            SecurityScheme::Http(Http::new(HttpAuthScheme::Bearer)),
        );
    }
}

#[derive(OpenApi)]
#[openapi(
    paths(
        auth::signup,
        auth::verify_email,
        auth::login,
        auth::login_second_factor,
        auth::google_login,
        auth::google_callback,
        auth::refresh,
        auth::logout,
        auth::logout_all,
        users::get_current_user,
        users::update_current_user,
        sessions::list_sessions,
        sessions::revoke_session,
        health::health,
        health::liveness,
        health::readiness
    ),
    components(
        schemas(
            UserProfile,
            SessionSummary,
            SignupRequest,
            LoginRequest,
            SecondFactorLoginRequest,
            UpdateProfileRequest,
            TokenResponse,
            ChallengeResponse,
            LogoutResponse,
            LogoutAllResponse,
            health::ReadyResponse,
            health::HealthChecks,
            health::HealthResponse
        )
    ),
    modifiers(&BearerAuth),
    tags(
        (name = "Auth", description = "Signup, login, refresh and logout"),
        (name = "Users", description = "Profile of the authenticated user"),
        (name = "Sessions", description = "Device sessions of the authenticated user"),
        (name = "Health", description = "Liveness and readiness probes")
    )
)]
struct ApiDoc;


#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{Method, StatusCode};
    use super::test_support::{send, test_state};

    #[tokio::test]
    async fn router_builds_with_all_routes() {
        let (state, _dir) = test_state();
        let app = router(state);
        let _ = app.into_make_service();
    }

    #[tokio::test]
    async fn responses_carry_request_id() {
        let (state, _dir) = test_state();
        let app = router(state);

        let response = send(&app, Method::GET, "/health/live", &[], None).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers().contains_key("x-request-id"));
    }

    #[test]
    fn openapi_lists_auth_paths() {
        let doc = ApiDoc::openapi();
        assert!(doc.paths.paths.contains_key("/v1/auth/login"));
        assert!(doc.paths.paths.contains_key("/v1/sessions/{session_id}"));
        assert!(doc
            .components
            .as_ref()
            .is_some_and(|c| c.security_schemes.contains_key("bearer")));
    }
}
