// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Access and refresh token issuance (HS256).
//!
//! Access tokens are stateless. Refresh tokens carry a fresh `jti` per
//! issuance, which the session store uses as the session identifier, so a
//! refresh token is only honored while its `jti` still matches a live row.
//!
//! Verification collapses bad signatures, malformed tokens and expiry into
//! [`AuthError::InvalidOrExpiredToken`].

use chrono::{DateTime, TimeDelta, Utc};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{de::DeserializeOwned, Serialize};

use super::claims::{AccessClaims, RefreshClaims};
use super::AuthError;
use crate::config::AuthSettings;

/// HMAC key pair derived from one shared secret.
#[derive(Clone)]
pub(crate) struct HmacKey {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl HmacKey {
    /// `None` for an empty secret.
    pub(crate) fn from_secret(secret: &str) -> Option<Self> {
        if secret.is_empty() {
            return None;
        }
        Some(Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        })
    }
}

pub(crate) fn sign<T: Serialize>(key: Option<&HmacKey>, claims: &T) -> Result<String, AuthError> {
    let key = key.ok_or(AuthError::SigningError)?;
    encode(&Header::new(Algorithm::HS256), claims, &key.encoding).map_err(|e| {
        tracing::error!(error = %e, "Failed to sign token");
        AuthError::SigningError
    })
}

pub(crate) fn verify<T: DeserializeOwned>(
    key: Option<&HmacKey>,
    token: &str,
) -> Result<T, AuthError> {
    let key = key.ok_or(AuthError::InvalidOrExpiredToken)?;

    let mut validation = Validation::new(Algorithm::HS256);
    // Issuer and verifier share one clock
    validation.leeway = 0;
    validation.validate_aud = false;
    validation.set_required_spec_claims(&["exp", "sub"]);

    decode::<T>(token, &key.decoding, &validation)
        .map(|data| data.claims)
        .map_err(|_| AuthError::InvalidOrExpiredToken)
}

/// A signed access token.
#[derive(Debug, Clone)]
pub struct AccessToken {
    pub token: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
}

/// A signed refresh token and the session identifier it carries.
#[derive(Debug, Clone)]
pub struct RefreshToken {
    pub token: String,
    /// The `jti` claim.
    pub session_identifier: String,
    /// Lifetime in seconds.
    pub expires_in: u64,
    pub expires_at: DateTime<Utc>,
}

/// Mints and verifies access and refresh tokens.
#[derive(Clone)]
pub struct TokenIssuer {
    access_key: Option<HmacKey>,
    refresh_key: Option<HmacKey>,
    access_ttl_secs: u64,
    refresh_ttl_secs: u64,
}

impl TokenIssuer {
    pub fn new(settings: &AuthSettings) -> Self {
        Self {
            access_key: HmacKey::from_secret(&settings.access_token_secret),
            refresh_key: HmacKey::from_secret(&settings.refresh_token_secret),
            access_ttl_secs: settings.access_ttl_secs,
            refresh_ttl_secs: settings.refresh_ttl_secs,
        }
    }

    pub fn access_ttl_secs(&self) -> u64 {
        self.access_ttl_secs
    }

    pub fn refresh_ttl_secs(&self) -> u64 {
        self.refresh_ttl_secs
    }

    pub fn mint_access_token(&self, user_id: &str) -> Result<AccessToken, AuthError> {
        let iat = Utc::now().timestamp();
        let claims = AccessClaims {
            sub: user_id.to_string(),
            iat,
            exp: iat + self.access_ttl_secs as i64,
        };
        Ok(AccessToken {
            token: sign(self.access_key.as_ref(), &claims)?,
            expires_in: self.access_ttl_secs,
        })
    }

    pub fn mint_refresh_token(&self, user_id: &str) -> Result<RefreshToken, AuthError> {
        let now = Utc::now();
        let iat = now.timestamp();
        let claims = RefreshClaims {
            sub: user_id.to_string(),
            jti: uuid::Uuid::new_v4().to_string(),
            iat,
            exp: iat + self.refresh_ttl_secs as i64,
        };
        let token = sign(self.refresh_key.as_ref(), &claims)?;
        Ok(RefreshToken {
            token,
            session_identifier: claims.jti,
            expires_in: self.refresh_ttl_secs,
            expires_at: now + TimeDelta::seconds(self.refresh_ttl_secs as i64),
        })
    }

    pub fn verify_access_token(&self, token: &str) -> Result<AccessClaims, AuthError> {
        verify(self.access_key.as_ref(), token)
    }

    pub fn verify_refresh_token(&self, token: &str) -> Result<RefreshClaims, AuthError> {
        verify(self.refresh_key.as_ref(), token)
    }
}
