// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Refresh token cookie.
//!
//! `refreshToken=<jwt>; HttpOnly; Max-Age=<secs>; Path=/; SameSite=Lax`, plus
//! `Secure` when configured.

use axum::http::{header::COOKIE, HeaderMap, HeaderValue};

use super::tokens::RefreshToken;
use super::AuthError;

pub const REFRESH_COOKIE_NAME: &str = "refreshToken";

fn build(value: &str, max_age: u64, secure: bool) -> Result<HeaderValue, AuthError> {
    let mut cookie =
        format!("{REFRESH_COOKIE_NAME}={value}; HttpOnly; Max-Age={max_age}; Path=/; SameSite=Lax");
    if secure {
        cookie.push_str("; Secure");
    }
    HeaderValue::from_str(&cookie)
        .map_err(|_| AuthError::Internal("refresh cookie is not a valid header value".into()))
}

/// `Set-Cookie` value carrying a refresh token.
pub fn refresh_cookie(refresh: &RefreshToken, secure: bool) -> Result<HeaderValue, AuthError> {
    build(&refresh.token, refresh.expires_in, secure)
}

/// `Set-Cookie` value that removes the refresh cookie.
pub fn cleared_refresh_cookie(secure: bool) -> Result<HeaderValue, AuthError> {
    build("", 0, secure)
}

/// Refresh token from the request's `Cookie` headers.
pub fn refresh_token_from_headers(headers: &HeaderMap) -> Option<String> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(name, value)| *name == REFRESH_COOKIE_NAME && !value.is_empty())
        .map(|(_, value)| value.to_string())
}
