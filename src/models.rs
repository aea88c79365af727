// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Data Models
//!
//! Persisted records and the request/response structures used by the REST
//! API. API types derive `ToSchema` for OpenAPI documentation.
//!
//! ## Model Categories
//!
//! - **Users**: identity records owned by the credential store
//! - **Sessions**: one row per authenticated device, keyed by its jti
//! - **Audit**: append-only login attempts and login history
//! - **API**: request bodies and responses

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::auth::lockout::LockoutState;

// =============================================================================
// User Models
// =============================================================================

/// Identity record as stored by the credential store.
///
/// Never serialized to API clients; see [`UserProfile`] for the public view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct User {
    pub id: String,
    /// Normalized e-mail address (unique).
    pub email: String,
    /// Argon2 PHC string. `None` for accounts created through a federated login.
    pub password_hash: Option<String>,
    pub display_name: String,
    pub is_verified: bool,
    /// HMAC of the outstanding verification token. The raw token only ever
    /// exists in the e-mail link.
    pub verification_token_hash: Option<String>,
    pub verification_expires_at: Option<DateTime<Utc>>,
    pub failed_login_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
    pub second_factor_enabled: bool,
    /// Enrolled second-factor secret (base32, as authenticator apps import it).
    pub second_factor_secret: Option<String>,
    /// Stable identifier at the external identity provider.
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl User {
    /// Current lockout counters.
    pub fn lockout_state(&self) -> LockoutState {
        LockoutState {
            failed_attempts: self.failed_login_attempts,
            locked_until: self.locked_until,
        }
    }

    /// Overwrite the lockout counters.
    pub fn apply_lockout(&mut self, state: LockoutState) {
        self.failed_login_attempts = state.failed_attempts;
        self.locked_until = state.locked_until;
    }
}

/// Public projection of a [`User`], also the identity cache payload.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct UserProfile {
    pub id: String,
    pub email: String,
    pub display_name: String,
    pub is_verified: bool,
    pub second_factor_enabled: bool,
    /// Whether the account is linked to an external identity provider.
    pub federated: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<&User> for UserProfile {
    fn from(user: &User) -> Self {
        Self {
            id: user.id.clone(),
            email: user.email.clone(),
            display_name: user.display_name.clone(),
            is_verified: user.is_verified,
            second_factor_enabled: user.second_factor_enabled,
            federated: user.external_id.is_some(),
            created_at: user.created_at,
            updated_at: user.updated_at,
        }
    }
}

// =============================================================================
// Session Models
// =============================================================================

/// One authenticated device binding.
///
/// `session_identifier` mirrors the `jti` claim of the refresh token most
/// recently issued for this device.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Session {
    pub id: String,
    pub user_id: String,
    pub session_identifier: String,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub is_revoked: bool,
    pub revoked_at: Option<DateTime<Utc>>,
}

impl Session {
    /// Not revoked and not past its expiry.
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        !self.is_revoked && self.expires_at > now
    }
}

/// Session as listed to its owner. The jti is deliberately omitted.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, PartialEq, Eq)]
pub struct SessionSummary {
    pub id: String,
    pub ip_address: String,
    pub user_agent: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<&Session> for SessionSummary {
    fn from(session: &Session) -> Self {
        Self {
            id: session.id.clone(),
            ip_address: session.ip_address.clone(),
            user_agent: session.user_agent.clone(),
            created_at: session.created_at,
            expires_at: session.expires_at,
        }
    }
}

// =============================================================================
// Audit Models
// =============================================================================

/// Append-only record of a credential check.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginAttempt {
    pub id: String,
    pub email: String,
    pub ip_address: String,
    pub success: bool,
    pub timestamp: DateTime<Utc>,
}

impl LoginAttempt {
    pub fn new(email: impl Into<String>, ip_address: impl Into<String>, success: bool) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            email: email.into(),
            ip_address: ip_address.into(),
            success,
            timestamp: Utc::now(),
        }
    }
}

/// Append-only record of a finalized login.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoginHistoryEntry {
    pub id: String,
    pub user_id: String,
    pub timestamp: DateTime<Utc>,
}

impl LoginHistoryEntry {
    pub fn new(user_id: impl Into<String>) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp: Utc::now(),
        }
    }
}

// =============================================================================
// API Request Models
// =============================================================================

/// Request body for account creation.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SignupRequest {
    pub email: String,
    pub password: String,
    /// Optional display name; one is generated when omitted.
    #[serde(default)]
    pub display_name: Option<String>,
}

/// Request body for password login.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

/// Request body for redeeming a second-factor challenge.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct SecondFactorLoginRequest {
    pub challenge_token: String,
    pub code: String,
}

/// Request body for profile updates.
#[derive(Debug, Clone, Default, Serialize, Deserialize, ToSchema)]
pub struct UpdateProfileRequest {
    #[serde(default)]
    pub display_name: Option<String>,
    /// Enabling requires an enrolled second-factor secret.
    #[serde(default)]
    pub second_factor_enabled: Option<bool>,
}

// =============================================================================
// API Response Models
// =============================================================================

/// Access token returned in the response body; the refresh token travels in
/// the `refreshToken` cookie.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct TokenResponse {
    pub access_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: u64,
}

impl TokenResponse {
    pub fn bearer(access_token: String, expires_in: u64) -> Self {
        Self {
            access_token,
            token_type: "Bearer".to_string(),
            expires_in,
        }
    }
}

/// Returned instead of tokens when the account has a second factor enabled.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ChallengeResponse {
    pub challenge_token: String,
    /// Challenge lifetime in seconds.
    pub expires_in: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogoutResponse {
    /// Whether a session matched the presented refresh token.
    pub revoked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct LogoutAllResponse {
    pub revoked_count: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn sample_user() -> User {
        let now = Utc::now();
        User {
            id: "user-1".to_string(),
            email: "a@x.com".to_string(),
            password_hash: Some("$argon2id$...".to_string()),
            display_name: "Alice".to_string(),
            is_verified: true,
            verification_token_hash: None,
            verification_expires_at: None,
            failed_login_attempts: 2,
            locked_until: None,
            second_factor_enabled: false,
            second_factor_secret: None,
            external_id: Some("google-123".to_string()),
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn profile_hides_secrets() {
        let user = sample_user();
        let profile = UserProfile::from(&user);
        let json = serde_json::to_value(&profile).unwrap();

        assert_eq!(json["email"], "a@x.com");
        assert_eq!(json["federated"], true);
        assert!(json.get("password_hash").is_none());
        assert!(json.get("second_factor_secret").is_none());
    }

    #[test]
    fn session_activity_respects_expiry_and_revocation() {
        let now = Utc::now();
        let mut session = Session {
            id: "s1".to_string(),
            user_id: "user-1".to_string(),
            session_identifier: "jti-1".to_string(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: "test".to_string(),
            created_at: now,
            expires_at: now + TimeDelta::minutes(5),
            is_revoked: false,
            revoked_at: None,
        };
        assert!(session.is_active(now));
        assert!(!session.is_active(now + TimeDelta::minutes(6)));

        session.is_revoked = true;
        assert!(!session.is_active(now));
    }

    #[test]
    fn lockout_state_round_trips_through_user() {
        let mut user = sample_user();
        let until = Utc::now();
        user.apply_lockout(LockoutState {
            failed_attempts: 0,
            locked_until: Some(until),
        });
        assert_eq!(user.lockout_state().locked_until, Some(until));
        assert_eq!(user.lockout_state().failed_attempts, 0);
    }
}
