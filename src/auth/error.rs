// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Authentication errors.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::storage::StorageError;

/// Authentication error type.
///
/// Every operation of the gate returns one of these. Variants that could help
/// an attacker enumerate accounts or tokens render a generic message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthError {
    /// Unknown e-mail or wrong password
    InvalidCredentials,
    /// Account is locked until the given instant
    AccountLocked { until: DateTime<Utc> },
    /// E-mail address not verified yet
    UnverifiedAccount,
    /// User already holds the maximum number of active sessions
    SessionQuotaExceeded { limit: usize },
    /// Bad signature, malformed or expired token
    InvalidOrExpiredToken,
    /// Refresh token does not match a live session row
    InvalidSession,
    /// Second-factor challenge missing or unusable
    ChallengeRequired,
    /// Second-factor code rejected
    InvalidCode,
    /// Token could not be signed (missing key)
    SigningError,
    /// No bearer token or refresh cookie present
    MissingCredential,
    /// Signup with an e-mail that already exists
    EmailTaken,
    /// Verification token unknown
    InvalidVerificationToken,
    /// Verification attempted on a verified account
    AlreadyVerified,
    /// Verification window passed; the account was removed
    VerificationExpired,
    /// Too many failed authentication requests from this address
    RateLimited,
    /// External provider rejected the sign-in or returned an unusable identity
    FederatedLoginFailed,
    /// Request input rejected
    Validation(String),
    /// Resource not found
    NotFound,
    /// Internal error (message is logged, never returned)
    Internal(String),
}

#[derive(Serialize)]
struct AuthErrorBody {
    error: String,
    error_code: String,
}

impl AuthError {
    /// Get the error code for this error.
    pub fn error_code(&self) -> &'static str {
        match self {
            AuthError::InvalidCredentials => "invalid_credentials",
            AuthError::AccountLocked { .. } => "account_locked",
            AuthError::UnverifiedAccount => "unverified_account",
            AuthError::SessionQuotaExceeded { .. } => "session_quota_exceeded",
            AuthError::InvalidOrExpiredToken => "invalid_or_expired_token",
            AuthError::InvalidSession => "invalid_session",
            AuthError::ChallengeRequired => "challenge_required",
            AuthError::InvalidCode => "invalid_code",
            AuthError::SigningError => "signing_error",
            AuthError::MissingCredential => "missing_credential",
            AuthError::EmailTaken => "email_taken",
            AuthError::InvalidVerificationToken => "invalid_verification_token",
            AuthError::AlreadyVerified => "already_verified",
            AuthError::VerificationExpired => "verification_expired",
            AuthError::RateLimited => "rate_limited",
            AuthError::FederatedLoginFailed => "federated_login_failed",
            AuthError::Validation(_) => "validation_error",
            AuthError::NotFound => "not_found",
            AuthError::Internal(_) => "internal_error",
        }
    }

    /// Get the HTTP status code for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AuthError::InvalidCredentials
            | AuthError::InvalidOrExpiredToken
            | AuthError::InvalidSession
            | AuthError::ChallengeRequired
            | AuthError::InvalidCode
            | AuthError::FederatedLoginFailed
            | AuthError::MissingCredential => StatusCode::UNAUTHORIZED,
            AuthError::AccountLocked { .. }
            | AuthError::UnverifiedAccount
            | AuthError::SessionQuotaExceeded { .. } => StatusCode::FORBIDDEN,
            AuthError::EmailTaken => StatusCode::CONFLICT,
            AuthError::InvalidVerificationToken | AuthError::AlreadyVerified => {
                StatusCode::BAD_REQUEST
            }
            AuthError::VerificationExpired => StatusCode::GONE,
            AuthError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            AuthError::Validation(_) => StatusCode::UNPROCESSABLE_ENTITY,
            AuthError::NotFound => StatusCode::NOT_FOUND,
            AuthError::SigningError | AuthError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl std::fmt::Display for AuthError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthError::InvalidCredentials => write!(f, "Invalid e-mail or password"),
            AuthError::AccountLocked { until } => {
                write!(f, "Account is locked until {}", until.to_rfc3339())
            }
            AuthError::UnverifiedAccount => write!(f, "E-mail address has not been verified"),
            AuthError::SessionQuotaExceeded { limit } => {
                write!(f, "Maximum of {limit} active sessions reached")
            }
            AuthError::InvalidOrExpiredToken => write!(f, "Token is invalid or expired"),
            AuthError::InvalidSession => write!(f, "Session is no longer valid"),
            AuthError::ChallengeRequired => write!(f, "A valid second-factor challenge is required"),
            AuthError::InvalidCode => write!(f, "Second-factor code is invalid"),
            AuthError::SigningError => write!(f, "Token could not be issued"),
            AuthError::MissingCredential => write!(f, "Authentication credential is required"),
            AuthError::EmailTaken => write!(f, "E-mail address is already registered"),
            AuthError::InvalidVerificationToken => write!(f, "Verification token is invalid"),
            AuthError::AlreadyVerified => write!(f, "E-mail address is already verified"),
            AuthError::VerificationExpired => {
                write!(f, "Verification link has expired; please sign up again")
            }
            AuthError::RateLimited => write!(f, "Too many attempts, try again later"),
            AuthError::FederatedLoginFailed => write!(f, "External sign-in failed"),
            AuthError::Validation(msg) => write!(f, "{msg}"),
            AuthError::NotFound => write!(f, "Resource not found"),
            AuthError::Internal(_) => write!(f, "Internal server error"),
        }
    }
}

impl std::error::Error for AuthError {}

impl From<StorageError> for AuthError {
    fn from(err: StorageError) -> Self {
        AuthError::Internal(err.to_string())
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        if let AuthError::Internal(msg) = &self {
            tracing::error!(error = %msg, "Internal authentication error");
        }

        let status = self.status_code();
        let body = Json(AuthErrorBody {
            error: self.to_string(),
            error_code: self.error_code().to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;

    async fn body_of(err: AuthError) -> (StatusCode, serde_json::Value) {
        let response = err.into_response();
        let status = response.status();
        let body_bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&body_bytes).unwrap())
    }

    #[tokio::test]
    async fn invalid_credentials_returns_401() {
        let (status, body) = body_of(AuthError::InvalidCredentials).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["error_code"], "invalid_credentials");
    }

    #[tokio::test]
    async fn quota_exceeded_returns_403_with_limit() {
        let (status, body) = body_of(AuthError::SessionQuotaExceeded { limit: 5 }).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(body["error"].as_str().unwrap().contains('5'));
    }

    #[tokio::test]
    async fn internal_error_hides_detail() {
        let (status, body) = body_of(AuthError::Internal("redb exploded".to_string())).await;
        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!body["error"].as_str().unwrap().contains("redb"));
    }

    #[test]
    fn status_codes_match_taxonomy() {
        assert_eq!(AuthError::EmailTaken.status_code(), StatusCode::CONFLICT);
        assert_eq!(AuthError::VerificationExpired.status_code(), StatusCode::GONE);
        assert_eq!(
            AuthError::RateLimited.status_code(),
            StatusCode::TOO_MANY_REQUESTS
        );
        assert_eq!(
            AuthError::Validation("bad".to_string()).status_code(),
            StatusCode::UNPROCESSABLE_ENTITY
        );
        assert_eq!(
            AuthError::AccountLocked { until: Utc::now() }.status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(
            AuthError::SigningError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn storage_errors_become_internal() {
        let err: AuthError = StorageError::NotFound("User x".to_string()).into();
        assert!(matches!(err, AuthError::Internal(_)));
    }
}
