// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Module
//!
//! Session and token lifecycle for the Relational Auth API.
//!
//! ## Auth Flow
//!
//! 1. Client posts e-mail and password to `/v1/auth/login`
//! 2. The [`AuthGate`] checks the lock, the password and the verified flag
//! 3. Accounts with a second factor receive a short-lived challenge token and
//!    finish at `/v1/auth/login/second-factor`
//! 4. On success the client receives:
//!    - a 15 minute access token in the body, sent back as
//!      `Authorization: Bearer <token>`
//!    - a 7 day refresh token in the `refreshToken` cookie, bound to one
//!      session row by its `jti`
//! 5. `/v1/auth/refresh` rotates the refresh token; the previous one stops
//!    working immediately
//!
//! Google sign-in goes through `/v1/auth/google` and its callback, which
//! exchanges the code server-side and then issues the same token pair.
//!
//! ## Security
//!
//! - Three independent HMAC keys: access, refresh and challenge tokens
//! - Passwords are hashed with Argon2id off the async runtime
//! - Unknown e-mails and wrong passwords produce the same error
//! - No clock skew tolerance on token expiry

pub mod claims;
pub mod cookie;
pub mod error;
pub mod extractor;
pub mod federated;
pub mod gate;
pub mod identity;
pub mod lockout;
pub mod oauth;
pub mod password;
pub mod second_factor;
pub mod sessions;
pub mod tokens;
pub mod validation;

pub use claims::AuthenticatedUser;
pub use error::AuthError;
pub use extractor::{Auth, RefreshCookie};
pub use federated::FederatedIdentity;
pub use gate::{AuthGate, GateDeps, IssuedTokens, LoginOutcome};
pub use oauth::{IdentityProvider, OAuthProvider};
pub use second_factor::{CodeVerifier, TotpVerifier};
pub use sessions::ClientContext;
