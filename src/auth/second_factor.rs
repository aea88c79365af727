// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Second-factor challenge tokens and one-time code verification.
//!
//! A user with the second factor enabled receives a short-lived signed
//! challenge instead of a session. The challenge carries the candidate user
//! id; its redemption state lives in a [`ChallengeStore`].
//!
//! [`ChallengeStore`]: crate::storage::ChallengeStore
//! Code verification is a pluggable [`CodeVerifier`]; [`TotpVerifier`] checks
//! time-based codes against the secret enrolled on the user record.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use totp_rs::{Algorithm, Secret, TOTP};

use super::claims::ChallengeClaims;
use super::tokens::{sign, verify, HmacKey};
use super::AuthError;
use crate::config::AuthSettings;
use crate::models::User;

const CHALLENGE_PURPOSE: &str = "second_factor";
const MIN_SECRET_BYTES: usize = 16;

/// A signed challenge handed back instead of tokens.
#[derive(Debug, Clone)]
pub struct IssuedChallenge {
    pub token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// Claims of a verified challenge.
#[derive(Debug, Clone)]
pub struct VerifiedChallenge {
    pub user_id: String,
    pub challenge_id: String,
    pub expires_at: i64,
}

#[derive(Clone)]
pub struct ChallengeIssuer {
    key: Option<HmacKey>,
    ttl_secs: u64,
}

impl ChallengeIssuer {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            key: HmacKey::from_secret(&settings.challenge_secret),
            ttl_secs: settings.challenge_ttl_secs,
        }
    }

    pub fn issue(&self, user_id: &str) -> Result<IssuedChallenge, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = ChallengeClaims {
            sub: user_id.to_string(),
            purpose: CHALLENGE_PURPOSE.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat,
            exp: iat + self.ttl_secs as i64,
        };
        Ok(IssuedChallenge {
            token: sign(self.key.as_ref(), &claims)?,
            expires_in: self.ttl_secs,
        })
    }

    /// Any invalid, expired or foreign token maps to
    /// [`AuthError::ChallengeRequired`].
    pub fn verify(&self, token: &str) -> Result<VerifiedChallenge, AuthError> {
        let claims: ChallengeClaims =
            verify(self.key.as_ref(), token).map_err(|_| AuthError::ChallengeRequired)?;
        if claims.purpose != CHALLENGE_PURPOSE {
            return Err(AuthError::ChallengeRequired);
        }
        Ok(VerifiedChallenge {
            user_id: claims.sub,
            challenge_id: claims.jti,
            expires_at: claims.exp,
        })
    }
}

/// Verifies a one-time code against a user's enrolled second factor.
#[async_trait]
pub trait CodeVerifier: Send + Sync {
    async fn verify(&self, user: &User, code: &str) -> Result<bool, AuthError>;
}

/// RFC 6238 time-based codes as produced by authenticator apps (SHA1,
/// 6 digits, 30 second step).
///
/// Accepts the previous, current and next step to absorb clock drift. The
/// enrolled secret is stored base32 encoded, the format those apps import.
#[derive(Debug, Clone, Copy, Default)]
pub struct TotpVerifier;

impl TotpVerifier {
    pub const STEP_SECS: u64 = 30;
    pub const DIGITS: usize = 6;
    const SKEW: u8 = 1;

    /// Code for the step containing `at`.
    pub fn code_at(secret: &str, at: DateTime<Utc>) -> Result<String, AuthError> {
        Ok(totp_for(secret)?.generate(unix_secs(at)))
    }

    fn matches(secret: &str, code: &str, at: DateTime<Utc>) -> Result<bool, AuthError> {
        if code.len() != Self::DIGITS || !code.bytes().all(|b| b.is_ascii_digit()) {
            return Ok(false);
        }
        Ok(totp_for(secret)?.check(code, unix_secs(at)))
    }
}

#[async_trait]
impl CodeVerifier for TotpVerifier {
    async fn verify(&self, user: &User, code: &str) -> Result<bool, AuthError> {
        match user.second_factor_secret.as_deref() {
            Some(secret) => Self::matches(secret, code.trim(), Utc::now()),
            None => Ok(false),
        }
    }
}

/// Decode a base32 secret, rejecting ones shorter than 128 bits.
pub fn decode_secret(secret: &str) -> Result<Vec<u8>, AuthError> {
    let bytes = Secret::Encoded(secret.trim().to_ascii_uppercase())
        .to_bytes()
        .map_err(|_| AuthError::Validation("Second-factor secret must be base32".to_string()))?;
    if bytes.len() < MIN_SECRET_BYTES {
        return Err(AuthError::Validation(format!(
            "Second-factor secret must be at least {MIN_SECRET_BYTES} bytes"
        )));
    }
    Ok(bytes)
}

fn totp_for(secret: &str) -> Result<TOTP, AuthError> {
    let bytes = decode_secret(secret)
        .map_err(|_| AuthError::Internal("enrolled second-factor secret is unusable".into()))?;
    TOTP::new(
        Algorithm::SHA1,
        TotpVerifier::DIGITS,
        TotpVerifier::SKEW,
        TotpVerifier::STEP_SECS,
        bytes,
    )
    .map_err(|e| AuthError::Internal(format!("TOTP init error: {e}")))
}

fn unix_secs(at: DateTime<Utc>) -> u64 {
    u64::try_from(at.timestamp()).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    // base32 of the RFC 6238 SHA1 seed "12345678901234567890"
    const SECRET: &str = "GEZDGNBVGY3TQOJQGEZDGNBVGY3TQOJQ";

    fn user_with_secret(secret: Option<&str>) -> User {
        let now = Utc::now();
        User {
            id: "user-1".to_string(),
            email: "a@x.com".to_string(),
            password_hash: None,
            display_name: "Alice".to_string(),
            is_verified: true,
            verification_token_hash: None,
            verification_expires_at: None,
            failed_login_attempts: 0,
            locked_until: None,
            second_factor_enabled: secret.is_some(),
            second_factor_secret: secret.map(str::to_string),
            external_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn rfc6238_sha1_vectors() {
        // RFC 6238 appendix B, truncated to 6 digits
        for (at, expected) in [(59, "287082"), (1_111_111_109, "081804")] {
            let at = DateTime::from_timestamp(at, 0).unwrap();
            assert_eq!(TotpVerifier::code_at(SECRET, at).unwrap(), expected);
        }
    }

    #[test]
    fn short_or_non_base32_secrets_are_rejected() {
        assert!(matches!(decode_secret("GEZDGNBV"), Err(AuthError::Validation(_))));
        assert!(matches!(decode_secret("not base32!"), Err(AuthError::Validation(_))));
        assert_eq!(decode_secret(&SECRET.to_lowercase()).unwrap().len(), 20);
    }

    #[test]
    fn adjacent_steps_are_accepted() {
        let now = Utc::now();
        let previous = TotpVerifier::code_at(SECRET, now - TimeDelta::seconds(30)).unwrap();
        let next = TotpVerifier::code_at(SECRET, now + TimeDelta::seconds(30)).unwrap();

        assert!(TotpVerifier::matches(SECRET, &previous, now).unwrap());
        assert!(TotpVerifier::matches(SECRET, &next, now).unwrap());
    }

    #[test]
    fn malformed_codes_are_rejected() {
        let now = Utc::now();
        assert!(!TotpVerifier::matches(SECRET, "12345", now).unwrap());
        assert!(!TotpVerifier::matches(SECRET, "12a456", now).unwrap());
    }

    #[tokio::test]
    async fn user_without_secret_never_matches() {
        let user = user_with_secret(None);
        assert!(!TotpVerifier.verify(&user, "000000").await.unwrap());
    }

    #[tokio::test]
    async fn current_code_verifies() {
        let user = user_with_secret(Some(SECRET));
        let code = TotpVerifier::code_at(SECRET, Utc::now()).unwrap();
        assert!(TotpVerifier.verify(&user, &code).await.unwrap());
    }

    #[test]
    fn challenge_round_trip() {
        let issuer = ChallengeIssuer::new(&AuthSettings::for_testing());
        let challenge = issuer.issue("user-1").unwrap();
        assert_eq!(challenge.expires_in, 300);

        let verified = issuer.verify(&challenge.token).unwrap();
        assert_eq!(verified.user_id, "user-1");
    }

    #[test]
    fn access_token_is_not_a_challenge() {
        let settings = AuthSettings::for_testing();
        let access = crate::auth::tokens::TokenIssuer::new(&settings)
            .mint_access_token("user-1")
            .unwrap();
        let issuer = ChallengeIssuer::new(&settings);
        assert_eq!(
            issuer.verify(&access.token).unwrap_err(),
            AuthError::ChallengeRequired
        );
    }
}
