// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Runtime Configuration
//!
//! This module defines environment variable names, default values and the
//! typed [`AuthSettings`] built from them. Configuration is loaded from the
//! environment once at startup and then passed down explicitly.
//!
//! ## Environment Variables
//!
//! | Variable | Description | Default |
//! |----------|-------------|---------|
//! | `HOST` | Server bind address | `0.0.0.0` |
//! | `PORT` | Server bind port | `8080` |
//! | `DATA_DIR` | Directory holding the redb database | `./data` |
//! | `ACCESS_TOKEN_SECRET` | HMAC secret for access tokens | Required |
//! | `REFRESH_TOKEN_SECRET` | HMAC secret for refresh tokens | Required |
//! | `SECOND_FACTOR_SECRET` | HMAC secret for second-factor challenges | Required |
//! | `VERIFICATION_HMAC_KEY` | Key used to hash e-mail verification tokens | Required |
//! | `ACCESS_TOKEN_TTL_SECS` | Access token lifetime | `900` |
//! | `REFRESH_TOKEN_TTL_SECS` | Refresh token / session lifetime | `604800` |
//! | `CHALLENGE_TTL_SECS` | Second-factor challenge lifetime | `300` |
//! | `MAX_FAILED_LOGINS` | Failed checks before the account locks | `5` |
//! | `LOCKOUT_SECS` | Lock duration | `1800` |
//! | `MAX_ACTIVE_SESSIONS` | Active sessions allowed per user | `5` |
//! | `VERIFICATION_TTL_SECS` | E-mail verification window | `172800` |
//! | `VERIFICATION_LINK_BASE` | URL the verification token is appended to | `http://localhost:3000/verify-email` |
//! | `COOKIE_SECURE` | Add `Secure` to the refresh cookie | `false` |
//! | `IDENTITY_CACHE_CAPACITY` | Max cached identity profiles | `10000` |
//! | `MAX_SECOND_FACTOR_ATTEMPTS` | Wrong codes accepted per challenge | `5` |
//! | `AUTH_RATE_LIMIT_MAX` | Failed auth requests per IP before blocking | `5` |
//! | `AUTH_RATE_LIMIT_WINDOW_SECS` | Rate limit window and block duration | `900` |
//! | `GOOGLE_CLIENT_ID` | Google OAuth client id | Optional |
//! | `GOOGLE_CLIENT_SECRET` | Google OAuth client secret | Optional |
//! | `GOOGLE_REDIRECT_URL` | Public URL of `/v1/auth/google/callback` | Optional |
//! | `LOG_FORMAT` | Logging format (`json` or `pretty`) | `pretty` |
//! | `RUST_LOG` | Log level filter | `info,tower_http=debug` |
//!
//! Google sign-in is enabled only when all three `GOOGLE_*` variables are set.
//!
//! Missing secrets are not a startup error on their own: the token issuers
//! report `SigningError` when asked to sign without a key, and `main` refuses
//! to start when [`AuthSettings::missing_secrets`] is non-empty.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use chrono::TimeDelta;
use url::Url;

/// Environment variable name for the database directory.
pub const DATA_DIR_ENV: &str = "DATA_DIR";
/// Environment variable name for the bind host.
pub const HOST_ENV: &str = "HOST";
/// Environment variable name for the bind port.
pub const PORT_ENV: &str = "PORT";
/// Environment variable selecting `json` or `pretty` log output.
pub const LOG_FORMAT_ENV: &str = "LOG_FORMAT";

pub const ACCESS_TOKEN_SECRET_ENV: &str = "ACCESS_TOKEN_SECRET";
pub const REFRESH_TOKEN_SECRET_ENV: &str = "REFRESH_TOKEN_SECRET";
pub const SECOND_FACTOR_SECRET_ENV: &str = "SECOND_FACTOR_SECRET";
pub const VERIFICATION_HMAC_KEY_ENV: &str = "VERIFICATION_HMAC_KEY";
pub const ACCESS_TOKEN_TTL_ENV: &str = "ACCESS_TOKEN_TTL_SECS";
pub const REFRESH_TOKEN_TTL_ENV: &str = "REFRESH_TOKEN_TTL_SECS";
pub const CHALLENGE_TTL_ENV: &str = "CHALLENGE_TTL_SECS";
pub const MAX_FAILED_LOGINS_ENV: &str = "MAX_FAILED_LOGINS";
pub const LOCKOUT_SECS_ENV: &str = "LOCKOUT_SECS";
pub const MAX_ACTIVE_SESSIONS_ENV: &str = "MAX_ACTIVE_SESSIONS";
pub const VERIFICATION_TTL_ENV: &str = "VERIFICATION_TTL_SECS";
pub const VERIFICATION_LINK_BASE_ENV: &str = "VERIFICATION_LINK_BASE";
pub const COOKIE_SECURE_ENV: &str = "COOKIE_SECURE";
pub const IDENTITY_CACHE_CAPACITY_ENV: &str = "IDENTITY_CACHE_CAPACITY";
pub const MAX_SECOND_FACTOR_ATTEMPTS_ENV: &str = "MAX_SECOND_FACTOR_ATTEMPTS";
pub const AUTH_RATE_LIMIT_MAX_ENV: &str = "AUTH_RATE_LIMIT_MAX";
pub const AUTH_RATE_LIMIT_WINDOW_ENV: &str = "AUTH_RATE_LIMIT_WINDOW_SECS";
pub const GOOGLE_CLIENT_ID_ENV: &str = "GOOGLE_CLIENT_ID";
pub const GOOGLE_CLIENT_SECRET_ENV: &str = "GOOGLE_CLIENT_SECRET";
pub const GOOGLE_REDIRECT_URL_ENV: &str = "GOOGLE_REDIRECT_URL";

pub const GOOGLE_AUTH_URL: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const GOOGLE_TOKEN_URL: &str = "https://oauth2.googleapis.com/token";
pub const GOOGLE_USERINFO_URL: &str = "https://openidconnect.googleapis.com/v1/userinfo";

/// Default database directory when `DATA_DIR` is unset.
pub const DEFAULT_DATA_DIR: &str = "./data";
/// File name of the redb database inside the data directory.
pub const DATABASE_FILE: &str = "auth.redb";

const DEFAULT_ACCESS_TTL_SECS: u64 = 15 * 60;
const DEFAULT_REFRESH_TTL_SECS: u64 = 7 * 24 * 60 * 60;
const DEFAULT_CHALLENGE_TTL_SECS: u64 = 5 * 60;
const DEFAULT_MAX_FAILED_LOGINS: u32 = 5;
const DEFAULT_LOCKOUT_SECS: i64 = 30 * 60;
const DEFAULT_MAX_ACTIVE_SESSIONS: usize = 5;
const DEFAULT_VERIFICATION_TTL_SECS: i64 = 48 * 60 * 60;
const DEFAULT_VERIFICATION_LINK_BASE: &str = "http://localhost:3000/verify-email";
const DEFAULT_IDENTITY_CACHE_CAPACITY: usize = 10_000;
const DEFAULT_MAX_SECOND_FACTOR_ATTEMPTS: u32 = 5;
const DEFAULT_AUTH_RATE_LIMIT_MAX: u32 = 5;
const DEFAULT_AUTH_RATE_LIMIT_WINDOW_SECS: u64 = 15 * 60;

/// Configuration errors raised while reading the environment.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{name} has an invalid value: {value}")]
    InvalidValue { name: &'static str, value: String },

    #[error("{name} is not a valid URL: {source}")]
    InvalidUrl {
        name: &'static str,
        #[source]
        source: url::ParseError,
    },
}

/// Settings for the session and token lifecycle.
#[derive(Debug, Clone)]
pub struct AuthSettings {
    pub access_token_secret: String,
    pub refresh_token_secret: String,
    pub challenge_secret: String,
    pub verification_hmac_key: String,
    /// Access token lifetime in seconds. Also the identity cache TTL.
    pub access_ttl_secs: u64,
    /// Refresh token lifetime in seconds. Also the session lifetime.
    pub refresh_ttl_secs: u64,
    pub challenge_ttl_secs: u64,
    /// Consecutive failures before the account locks (`F_MAX`).
    pub max_failed_logins: u32,
    /// How long a lock lasts (`T_LOCK`).
    pub lockout_duration: TimeDelta,
    pub max_active_sessions: usize,
    pub verification_ttl: TimeDelta,
    pub verification_link_base: Url,
    pub cookie_secure: bool,
    pub identity_cache_capacity: usize,
    /// Wrong codes a single challenge absorbs before it is dead.
    pub max_second_factor_attempts: u32,
    /// Failed signup/login requests per IP before the IP is blocked.
    pub auth_rate_limit_max: u32,
    pub auth_rate_limit_window: Duration,
    pub google: Option<OAuthClientSettings>,
}

/// Endpoints and credentials of an OAuth 2.0 authorization-code client.
#[derive(Debug, Clone)]
pub struct OAuthClientSettings {
    pub client_id: String,
    pub client_secret: String,
    pub auth_url: Url,
    pub token_url: Url,
    pub userinfo_url: Url,
    pub redirect_url: Url,
}

impl OAuthClientSettings {
    /// Google settings from `GOOGLE_*`, or `None` unless all three are set.
    pub fn google_from_env() -> Result<Option<Self>, ConfigError> {
        let var = |name: &str| env::var(name).ok().filter(|value| !value.trim().is_empty());
        let (Some(client_id), Some(client_secret), Some(redirect)) = (
            var(GOOGLE_CLIENT_ID_ENV),
            var(GOOGLE_CLIENT_SECRET_ENV),
            var(GOOGLE_REDIRECT_URL_ENV),
        ) else {
            return Ok(None);
        };

        Ok(Some(Self {
            client_id,
            client_secret,
            auth_url: parse_url("GOOGLE_AUTH_URL", GOOGLE_AUTH_URL)?,
            token_url: parse_url("GOOGLE_TOKEN_URL", GOOGLE_TOKEN_URL)?,
            userinfo_url: parse_url("GOOGLE_USERINFO_URL", GOOGLE_USERINFO_URL)?,
            redirect_url: parse_url(GOOGLE_REDIRECT_URL_ENV, &redirect)?,
        }))
    }
}

impl AuthSettings {
    /// Read settings from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        let link_base = env::var(VERIFICATION_LINK_BASE_ENV)
            .unwrap_or_else(|_| DEFAULT_VERIFICATION_LINK_BASE.to_string());

        Ok(Self {
            access_token_secret: env::var(ACCESS_TOKEN_SECRET_ENV).unwrap_or_default(),
            refresh_token_secret: env::var(REFRESH_TOKEN_SECRET_ENV).unwrap_or_default(),
            challenge_secret: env::var(SECOND_FACTOR_SECRET_ENV).unwrap_or_default(),
            verification_hmac_key: env::var(VERIFICATION_HMAC_KEY_ENV).unwrap_or_default(),
            access_ttl_secs: parse_env(ACCESS_TOKEN_TTL_ENV, DEFAULT_ACCESS_TTL_SECS)?,
            refresh_ttl_secs: parse_env(REFRESH_TOKEN_TTL_ENV, DEFAULT_REFRESH_TTL_SECS)?,
            challenge_ttl_secs: parse_env(CHALLENGE_TTL_ENV, DEFAULT_CHALLENGE_TTL_SECS)?,
            max_failed_logins: parse_env(MAX_FAILED_LOGINS_ENV, DEFAULT_MAX_FAILED_LOGINS)?,
            lockout_duration: TimeDelta::seconds(parse_env(LOCKOUT_SECS_ENV, DEFAULT_LOCKOUT_SECS)?),
            max_active_sessions: parse_env(MAX_ACTIVE_SESSIONS_ENV, DEFAULT_MAX_ACTIVE_SESSIONS)?,
            verification_ttl: TimeDelta::seconds(parse_env(
                VERIFICATION_TTL_ENV,
                DEFAULT_VERIFICATION_TTL_SECS,
            )?),
            verification_link_base: parse_url(VERIFICATION_LINK_BASE_ENV, &link_base)?,
            cookie_secure: parse_env(COOKIE_SECURE_ENV, false)?,
            identity_cache_capacity: parse_env(
                IDENTITY_CACHE_CAPACITY_ENV,
                DEFAULT_IDENTITY_CACHE_CAPACITY,
            )?,
            max_second_factor_attempts: parse_env(
                MAX_SECOND_FACTOR_ATTEMPTS_ENV,
                DEFAULT_MAX_SECOND_FACTOR_ATTEMPTS,
            )?,
            auth_rate_limit_max: parse_env(AUTH_RATE_LIMIT_MAX_ENV, DEFAULT_AUTH_RATE_LIMIT_MAX)?,
            auth_rate_limit_window: Duration::from_secs(parse_env(
                AUTH_RATE_LIMIT_WINDOW_ENV,
                DEFAULT_AUTH_RATE_LIMIT_WINDOW_SECS,
            )?),
            google: OAuthClientSettings::google_from_env()?,
        })
    }

    /// Names of the secret variables that are empty.
    pub fn missing_secrets(&self) -> Vec<&'static str> {
        [
            (ACCESS_TOKEN_SECRET_ENV, &self.access_token_secret),
            (REFRESH_TOKEN_SECRET_ENV, &self.refresh_token_secret),
            (SECOND_FACTOR_SECRET_ENV, &self.challenge_secret),
            (VERIFICATION_HMAC_KEY_ENV, &self.verification_hmac_key),
        ]
        .into_iter()
        .filter(|(_, value)| value.is_empty())
        .map(|(name, _)| name)
        .collect()
    }

    /// Settings with fixed secrets and defaults, for tests and local tooling.
    pub fn for_testing() -> Self {
        Self {
            access_token_secret: "test-access-secret".to_string(),
            refresh_token_secret: "test-refresh-secret".to_string(),
            challenge_secret: "test-challenge-secret".to_string(),
            verification_hmac_key: "test-verification-key".to_string(),
            access_ttl_secs: DEFAULT_ACCESS_TTL_SECS,
            refresh_ttl_secs: DEFAULT_REFRESH_TTL_SECS,
            challenge_ttl_secs: DEFAULT_CHALLENGE_TTL_SECS,
            max_failed_logins: DEFAULT_MAX_FAILED_LOGINS,
            lockout_duration: TimeDelta::seconds(DEFAULT_LOCKOUT_SECS),
            max_active_sessions: DEFAULT_MAX_ACTIVE_SESSIONS,
            verification_ttl: TimeDelta::seconds(DEFAULT_VERIFICATION_TTL_SECS),
            verification_link_base: Url::parse(DEFAULT_VERIFICATION_LINK_BASE)
                .expect("default verification link is a valid URL"),
            cookie_secure: false,
            identity_cache_capacity: 128,
            max_second_factor_attempts: DEFAULT_MAX_SECOND_FACTOR_ATTEMPTS,
            auth_rate_limit_max: DEFAULT_AUTH_RATE_LIMIT_MAX,
            auth_rate_limit_window: Duration::from_secs(DEFAULT_AUTH_RATE_LIMIT_WINDOW_SECS),
            google: None,
        }
    }
}

/// Bind address from `HOST`/`PORT`.
pub fn bind_address() -> String {
    let host = env::var(HOST_ENV).unwrap_or_else(|_| "0.0.0.0".to_string());
    let port: u16 = env::var(PORT_ENV)
        .ok()
        .and_then(|p| p.parse().ok())
        .unwrap_or(8080);
    format!("{host}:{port}")
}

/// Path of the redb database file under `DATA_DIR`.
pub fn database_path() -> PathBuf {
    let dir = env::var(DATA_DIR_ENV).unwrap_or_else(|_| DEFAULT_DATA_DIR.to_string());
    PathBuf::from(dir).join(DATABASE_FILE)
}

fn parse_url(name: &'static str, raw: &str) -> Result<Url, ConfigError> {
    Url::parse(raw).map_err(|source| ConfigError::InvalidUrl { name, source })
}

fn parse_env<T: FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) if !raw.trim().is_empty() => {
            raw.trim()
                .parse()
                .map_err(|_| ConfigError::InvalidValue { name, value: raw })
        }
        _ => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn testing_settings_have_all_secrets() {
        let settings = AuthSettings::for_testing();
        assert!(settings.missing_secrets().is_empty());
        assert_eq!(settings.max_failed_logins, 5);
        assert_eq!(settings.challenge_ttl_secs, 300);
        assert_eq!(settings.max_second_factor_attempts, 5);
        assert!(settings.google.is_none());
    }

    #[test]
    fn missing_secrets_lists_empty_values() {
        let mut settings = AuthSettings::for_testing();
        settings.refresh_token_secret.clear();
        settings.challenge_secret.clear();
        assert_eq!(
            settings.missing_secrets(),
            vec![REFRESH_TOKEN_SECRET_ENV, SECOND_FACTOR_SECRET_ENV]
        );
    }

    #[test]
    fn parse_env_falls_back_to_default() {
        let value: u64 = parse_env("RELATIONAL_AUTH_UNSET_TEST_VARIABLE", 42).unwrap();
        assert_eq!(value, 42);
    }
}
