// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! JWT claims and authenticated user representation.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

use crate::models::UserProfile;

/// Claims of a short-lived access token.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AccessClaims {
    /// Subject (user ID)
    pub sub: String,
    /// Issued at timestamp
    pub iat: i64,
    /// Expiration timestamp
    pub exp: i64,
}

/// Claims of a refresh token. `jti` binds the token to one session row.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RefreshClaims {
    pub sub: String,
    /// Session identifier, rotated on every use
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Claims of a second-factor challenge token.
///
/// `purpose` keeps a challenge from being accepted anywhere an access token
/// signed with the same key would be.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ChallengeClaims {
    pub sub: String,
    pub purpose: String,
    /// Marks the challenge consumed once redeemed
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
}

/// Authenticated principal resolved from a bearer access token.
///
/// This is the type handlers receive through the `Auth` extractor.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct AuthenticatedUser {
    /// Canonical user ID (`sub` claim)
    pub user_id: String,

    /// Cached public profile
    pub profile: UserProfile,

    /// Token expiration (Unix timestamp, not serialized)
    #[serde(skip)]
    pub expires_at: i64,
}
