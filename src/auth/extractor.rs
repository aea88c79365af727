// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Axum extractors for authentication.
//!
//! Use the `Auth` extractor in handlers to require a bearer access token:
//!
//! ```rust,ignore
//! async fn my_handler(Auth(user): Auth) -> impl IntoResponse {
//!     // user is AuthenticatedUser
//! }
//! ```

use std::convert::Infallible;
use std::net::SocketAddr;

use axum::{
    extract::{ConnectInfo, FromRequestParts},
    http::{
        header::{AUTHORIZATION, USER_AGENT},
        request::Parts,
        HeaderMap,
    },
};

use super::cookie::refresh_token_from_headers;
use super::sessions::ClientContext;
use super::{AuthError, AuthenticatedUser};
use crate::state::AppState;

const UNKNOWN: &str = "unknown";

/// Extractor for authenticated users.
///
/// Validates the `Authorization: Bearer <token>` header and resolves the
/// principal through the identity cache.
pub struct Auth(pub AuthenticatedUser);

impl FromRequestParts<AppState> for Auth {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)?;
        let user = state.gate.authenticate(token).await?;
        Ok(Auth(user))
    }
}

fn bearer_token(headers: &HeaderMap) -> Result<&str, AuthError> {
    let header = headers
        .get(AUTHORIZATION)
        .ok_or(AuthError::MissingCredential)?
        .to_str()
        .map_err(|_| AuthError::InvalidOrExpiredToken)?;

    header
        .strip_prefix("Bearer ")
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(AuthError::MissingCredential)
}

/// Extractor for the refresh token cookie.
pub struct RefreshCookie(pub String);

impl<S: Send + Sync> FromRequestParts<S> for RefreshCookie {
    type Rejection = AuthError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        refresh_token_from_headers(&parts.headers)
            .map(RefreshCookie)
            .ok_or(AuthError::MissingCredential)
    }
}

/// Client address and user agent of the request.
///
/// The address comes from `X-Forwarded-For` (first hop), then `X-Real-IP`,
/// then the socket peer.
impl<S: Send + Sync> FromRequestParts<S> for ClientContext {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let ip_address = forwarded_ip(&parts.headers)
            .or_else(|| {
                parts
                    .extensions
                    .get::<ConnectInfo<SocketAddr>>()
                    .map(|ConnectInfo(addr)| addr.ip().to_string())
            })
            .unwrap_or_else(|| UNKNOWN.to_string());

        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .unwrap_or(UNKNOWN)
            .to_string();

        Ok(ClientContext {
            ip_address,
            user_agent,
        })
    }
}

fn forwarded_ip(headers: &HeaderMap) -> Option<String> {
    let first_hop = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .and_then(|value| value.split(',').next())
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(str::to_string)
    };
    first_hop("x-forwarded-for").or_else(|| first_hop("x-real-ip"))
}
