// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Authentication Gate
//!
//! Orchestrates every authentication flow over the injected collaborators.
//!
//! ## Password login
//!
//! ```text
//! START -> LOCK_CHECK -> CREDENTIAL_CHECK -> 2FA_PENDING    (challenge returned)
//!                                         -> SESSION_ISSUE -> TOKEN_ISSUE -> DONE
//! ```
//!
//! - a locked account is rejected before the password is compared and the
//!   rejection is not counted
//! - unknown e-mails and wrong passwords are indistinguishable to the caller,
//!   including in timing (a dummy hash is verified for unknown e-mails)
//! - the verified-address check runs only after the password matched, so it
//!   does not reveal which addresses are registered
//!
//! ## Second factor
//!
//! A challenge is claimed in the [`ChallengeStore`] before its code is
//! checked. A wrong code releases the claim and counts against the
//! challenge; a correct one finalizes the login and marks the challenge
//! redeemed. Concurrent submissions of one challenge cannot both finalize.
//!
//! ## Refresh
//!
//! Verify signature, sweep expired sessions, look the session up by `jti`,
//! reject revoked or expired rows, mint a new pair and swap the row's `jti`
//! with a compare-and-swap. A superseded refresh token therefore fails with
//! [`AuthError::InvalidSession`].
//!
//! ## Logout
//!
//! Revoke by `jti` (idempotent) and drop the subject's identity cache entry.

use std::sync::Arc;
use std::time::Duration;

use base64ct::{Base64UrlUnpadded, Encoding};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use tracing::{info, warn};
use url::Url;

use super::claims::AuthenticatedUser;
use super::federated::{self, FederatedIdentity};
use super::identity::IdentityCache;
use super::lockout::{LockoutPolicy, LockoutState};
use super::password::PasswordHasher;
use super::oauth::IdentityProvider;
use super::second_factor::{self, ChallengeIssuer, CodeVerifier, IssuedChallenge};
use super::sessions::{ClientContext, SessionManager};
use super::tokens::{AccessToken, RefreshToken, TokenIssuer};
use super::validation::{
    normalize_email, validate_display_name, validate_email, validate_password,
};
use super::AuthError;
use crate::config::AuthSettings;
use crate::mail::Mailer;
use crate::models::{
    LoginAttempt, LoginHistoryEntry, LoginRequest, SecondFactorLoginRequest, SessionSummary,
    SignupRequest, UpdateProfileRequest, User, UserProfile,
};
use crate::storage::{
    AuditStore, ChallengeClaim, ChallengeStore, CredentialStore, KeyValueCache, SessionStore,
    StorageError,
};

const VERIFICATION_TOKEN_BYTES: usize = 32;
const OAUTH_STATE_TTL: Duration = Duration::from_secs(10 * 60);

type HmacSha256 = Hmac<Sha256>;

/// Collaborators injected into the gate.
#[derive(Clone)]
pub struct GateDeps {
    pub credentials: Arc<dyn CredentialStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub audit: Arc<dyn AuditStore>,
    pub challenges: Arc<dyn ChallengeStore>,
    pub cache: Arc<dyn KeyValueCache>,
    pub mailer: Arc<dyn Mailer>,
    pub code_verifier: Arc<dyn CodeVerifier>,
    /// `None` disables external sign-in.
    pub identity_provider: Option<Arc<dyn IdentityProvider>>,
}

/// Token pair issued by a finalized login or a refresh.
#[derive(Debug, Clone)]
pub struct IssuedTokens {
    pub user_id: String,
    pub session_id: String,
    pub access: AccessToken,
    pub refresh: RefreshToken,
}

/// Successful result of a password login.
#[derive(Debug, Clone)]
pub enum LoginOutcome {
    Authenticated(IssuedTokens),
    ChallengeRequired(IssuedChallenge),
}

pub struct AuthGate {
    credentials: Arc<dyn CredentialStore>,
    audit: Arc<dyn AuditStore>,
    challenge_store: Arc<dyn ChallengeStore>,
    cache: Arc<dyn KeyValueCache>,
    mailer: Arc<dyn Mailer>,
    code_verifier: Arc<dyn CodeVerifier>,
    identity_provider: Option<Arc<dyn IdentityProvider>>,
    sessions: SessionManager,
    identity: IdentityCache,
    tokens: TokenIssuer,
    challenges: ChallengeIssuer,
    hasher: PasswordHasher,
    lockout: LockoutPolicy,
    settings: AuthSettings,
}

impl AuthGate {
    pub fn new(deps: GateDeps, settings: AuthSettings) -> Self {
        Self {
            sessions: SessionManager::new(deps.sessions, settings.max_active_sessions),
            identity: IdentityCache::new(
                deps.cache.clone(),
                Duration::from_secs(settings.access_ttl_secs),
            ),
            tokens: TokenIssuer::new(&settings),
            challenges: ChallengeIssuer::new(&settings),
            hasher: PasswordHasher::new(),
            lockout: LockoutPolicy::new(settings.max_failed_logins, settings.lockout_duration),
            credentials: deps.credentials,
            audit: deps.audit,
            challenge_store: deps.challenges,
            cache: deps.cache,
            mailer: deps.mailer,
            code_verifier: deps.code_verifier,
            identity_provider: deps.identity_provider,
            settings,
        }
    }

    pub fn settings(&self) -> &AuthSettings {
        &self.settings
    }

    // =========================================================================
    // Registration
    // =========================================================================

    /// Create an unverified account and mail its verification link.
    pub async fn signup(&self, request: SignupRequest) -> Result<UserProfile, AuthError> {
        let email = normalize_email(&request.email);
        validate_email(&email)?;
        validate_password(&request.password)?;
        let display_name = match request.display_name.as_deref() {
            Some(name) => validate_display_name(name)?,
            None => federated::generated_display_name()?,
        };

        if self.credentials.find_user_by_email(&email).await?.is_some() {
            return Err(AuthError::EmailTaken);
        }

        let password_hash = self.hasher.hash(&request.password).await?;
        let token = random_token()?;
        let now = Utc::now();

        let user = User {
            id: uuid::Uuid::new_v4().to_string(),
            email,
            password_hash: Some(password_hash),
            display_name,
            is_verified: false,
            verification_token_hash: Some(self.hash_verification_token(&token)?),
            verification_expires_at: Some(now + self.settings.verification_ttl),
            failed_login_attempts: 0,
            locked_until: None,
            second_factor_enabled: false,
            second_factor_secret: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        };

        match self.credentials.create_user(&user).await {
            Ok(()) => {}
            Err(StorageError::AlreadyExists(_)) => return Err(AuthError::EmailTaken),
            Err(e) => return Err(e.into()),
        }
        info!(user_id = %user.id, "Account created, awaiting verification");

        let link = self.verification_link(&token);
        let mailer = self.mailer.clone();
        let recipient = user.email.clone();
        tokio::spawn(async move {
            if let Err(e) = mailer.send_verification_email(&recipient, &link).await {
                warn!(error = %e, "Failed to send verification e-mail");
            }
        });

        Ok(UserProfile::from(&user))
    }

    /// Redeem a verification token.
    ///
    /// An expired token deletes the unverified account.
    pub async fn verify_email(&self, token: &str) -> Result<UserProfile, AuthError> {
        let token = token.trim();
        if token.is_empty() {
            return Err(AuthError::InvalidVerificationToken);
        }

        let token_hash = self.hash_verification_token(token)?;
        let mut user = self
            .credentials
            .find_user_by_verification_hash(&token_hash)
            .await?
            .ok_or(AuthError::InvalidVerificationToken)?;

        if user.is_verified {
            return Err(AuthError::AlreadyVerified);
        }

        let now = Utc::now();
        if user.verification_expires_at.is_some_and(|at| at < now) {
            self.credentials.delete_user(&user.id).await?;
            info!(user_id = %user.id, "Deleted account with expired verification link");
            return Err(AuthError::VerificationExpired);
        }

        user.is_verified = true;
        user.verification_token_hash = None;
        user.verification_expires_at = None;
        user.updated_at = now;
        self.credentials.update_user(&user).await?;
        self.identity.invalidate(&user.id).await;

        info!(user_id = %user.id, "E-mail address verified");
        Ok(UserProfile::from(&user))
    }

    /// Delete unverified accounts whose verification window closed.
    pub async fn purge_unverified(&self) -> Result<usize, AuthError> {
        Ok(self.credentials.purge_unverified(Utc::now()).await?)
    }

    /// Forget redemption state of challenges that can no longer be presented.
    pub async fn purge_expired_challenges(&self) -> Result<usize, AuthError> {
        Ok(self
            .challenge_store
            .purge_expired_challenges(Utc::now())
            .await?)
    }

    // =========================================================================
    // Login
    // =========================================================================

    pub async fn login(
        &self,
        request: LoginRequest,
        client: &ClientContext,
    ) -> Result<LoginOutcome, AuthError> {
        let email = normalize_email(&request.email);
        let now = Utc::now();

        let Some(mut user) = self.credentials.find_user_by_email(&email).await? else {
            self.hasher.verify_dummy(&request.password).await?;
            self.record_attempt(&email, client, false).await;
            return Err(AuthError::InvalidCredentials);
        };

        // LOCK_CHECK
        if let Err(until) = self.lockout.check(&user.lockout_state(), now) {
            info!(user_id = %user.id, "Login rejected, account locked");
            return Err(AuthError::AccountLocked { until });
        }

        // CREDENTIAL_CHECK
        let password_ok = match user.password_hash.as_deref() {
            Some(hash) => self.hasher.verify(&request.password, hash).await?,
            None => self.hasher.verify_dummy(&request.password).await?,
        };

        if !password_ok {
            let next = self.lockout.register_failure(user.lockout_state(), now);
            user.apply_lockout(next);
            user.updated_at = now;
            self.credentials.update_user(&user).await?;
            self.record_attempt(&email, client, false).await;

            if self.lockout.check(&next, now).is_err() {
                warn!(user_id = %user.id, "Account locked after repeated failed logins");
            }
            return Err(AuthError::InvalidCredentials);
        }

        if user.lockout_state() != LockoutState::default() {
            user.apply_lockout(self.lockout.register_success());
            user.updated_at = now;
            self.credentials.update_user(&user).await?;
        }
        self.record_attempt(&email, client, true).await;

        if !user.is_verified {
            return Err(AuthError::UnverifiedAccount);
        }

        if user.second_factor_enabled {
            let challenge = self.challenges.issue(&user.id)?;
            info!(user_id = %user.id, "Second-factor challenge issued");
            return Ok(LoginOutcome::ChallengeRequired(challenge));
        }

        let tokens = self.finalize(&user.id, client, now).await?;
        Ok(LoginOutcome::Authenticated(tokens))
    }

    /// Redeem a challenge with a one-time code.
    ///
    /// A wrong code leaves the challenge usable until it expires or has
    /// absorbed `max_second_factor_attempts` wrong codes; a redeemed
    /// challenge cannot be used again.
    pub async fn login_with_second_factor(
        &self,
        request: SecondFactorLoginRequest,
        client: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let challenge = self.challenges.verify(&request.challenge_token)?;

        let user = self
            .credentials
            .find_user_by_id(&challenge.user_id)
            .await?
            .filter(|user| user.second_factor_enabled)
            .ok_or(AuthError::ChallengeRequired)?;

        let now = Utc::now();
        if let Err(until) = self.lockout.check(&user.lockout_state(), now) {
            return Err(AuthError::AccountLocked { until });
        }

        let expires_at = DateTime::from_timestamp(challenge.expires_at, 0).unwrap_or(now);
        match self
            .challenge_store
            .claim_challenge(
                &challenge.challenge_id,
                expires_at,
                self.settings.max_second_factor_attempts,
            )
            .await?
        {
            ChallengeClaim::Claimed => {}
            ChallengeClaim::Exhausted => {
                info!(user_id = %user.id, "Challenge rejected after too many wrong codes");
                return Err(AuthError::ChallengeRequired);
            }
            ChallengeClaim::Busy | ChallengeClaim::Redeemed => {
                return Err(AuthError::ChallengeRequired);
            }
        }

        let verified = match self.code_verifier.verify(&user, &request.code).await {
            Ok(verified) => verified,
            Err(e) => {
                self.release_challenge(&challenge.challenge_id, false).await;
                return Err(e);
            }
        };
        if !verified {
            let failures = self.release_challenge(&challenge.challenge_id, true).await;
            info!(user_id = %user.id, failures, "Second-factor code rejected");
            return Err(AuthError::InvalidCode);
        }

        match self.finalize(&user.id, client, now).await {
            Ok(tokens) => {
                if let Err(e) = self
                    .challenge_store
                    .complete_challenge(&challenge.challenge_id)
                    .await
                {
                    // Still claimed, so it stays unusable until it expires
                    warn!(error = %e, "Failed to mark challenge as redeemed");
                }
                Ok(tokens)
            }
            Err(e) => {
                self.release_challenge(&challenge.challenge_id, false).await;
                Err(e)
            }
        }
    }

    /// Start an external sign-in. Returns the provider URL to redirect to.
    pub async fn begin_federated_login(&self) -> Result<Url, AuthError> {
        let provider = self.identity_provider()?;
        let request = provider.authorization_request();
        self.cache
            .set(
                &oauth_state_key(&request.state),
                request.pkce_verifier,
                OAUTH_STATE_TTL,
            )
            .await
            .map_err(|e| AuthError::Internal(format!("failed to store OAuth state: {e}")))?;
        Ok(request.url)
    }

    /// Finish an external sign-in from the provider callback.
    ///
    /// `state` must come from [`AuthGate::begin_federated_login`] and is
    /// single-use.
    pub async fn complete_federated_login(
        &self,
        code: &str,
        state: &str,
        client: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let provider = self.identity_provider()?;
        let key = oauth_state_key(state);
        let pkce_verifier = self
            .cache
            .get(&key)
            .await
            .map_err(|e| AuthError::Internal(format!("failed to read OAuth state: {e}")))?
            .ok_or_else(|| {
                info!("OAuth callback with unknown or expired state");
                AuthError::FederatedLoginFailed
            })?;
        if let Err(e) = self.cache.delete(&key).await {
            warn!(error = %e, "Failed to drop used OAuth state");
        }

        let identity = provider.exchange(code, &pkce_verifier).await?;
        self.login_federated(identity, client).await
    }

    /// Log in with an identity asserted by an external provider.
    pub async fn login_federated(
        &self,
        identity: FederatedIdentity,
        client: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let identity = FederatedIdentity {
            email: normalize_email(&identity.email),
            ..identity
        };
        validate_email(&identity.email)?;

        let now = Utc::now();
        let user = federated::resolve_user(self.credentials.as_ref(), &identity, now).await?;
        self.identity.invalidate(&user.id).await;

        self.finalize(&user.id, client, now).await
    }

    /// SESSION_ISSUE and TOKEN_ISSUE.
    async fn finalize(
        &self,
        user_id: &str,
        client: &ClientContext,
        now: DateTime<Utc>,
    ) -> Result<IssuedTokens, AuthError> {
        self.sessions.sweep(now).await?;

        let refresh = self.tokens.mint_refresh_token(user_id)?;
        let access = self.tokens.mint_access_token(user_id)?;
        let session = self
            .sessions
            .create_or_renew(user_id, client, &refresh, now)
            .await?;

        if let Err(e) = self
            .audit
            .append_login_history(&LoginHistoryEntry::new(user_id))
            .await
        {
            warn!(user_id = %user_id, error = %e, "Failed to record login history");
        }

        info!(user_id = %user_id, session_id = %session.id, "Login finalized");
        Ok(IssuedTokens {
            user_id: user_id.to_string(),
            session_id: session.id,
            access,
            refresh,
        })
    }

    // =========================================================================
    // Refresh & logout
    // =========================================================================

    pub async fn refresh(
        &self,
        refresh_token: &str,
        client: &ClientContext,
    ) -> Result<IssuedTokens, AuthError> {
        let claims = self.tokens.verify_refresh_token(refresh_token)?;
        let now = Utc::now();
        self.sessions.sweep(now).await?;

        let session = self
            .sessions
            .find_by_identifier(&claims.jti)
            .await?
            .ok_or(AuthError::InvalidSession)?;

        if session.user_id != claims.sub {
            warn!(session_id = %session.id, "Refresh token subject does not own the session");
            return Err(AuthError::InvalidOrExpiredToken);
        }
        if session.is_revoked {
            return Err(AuthError::InvalidSession);
        }
        if !session.is_active(now) {
            self.sessions.revoke_by_identifier(&claims.jti, now).await?;
            return Err(AuthError::InvalidSession);
        }
        if self.credentials.find_user_by_id(&claims.sub).await?.is_none() {
            return Err(AuthError::InvalidSession);
        }

        let refresh = self.tokens.mint_refresh_token(&claims.sub)?;
        let access = self.tokens.mint_access_token(&claims.sub)?;
        self.sessions.rotate(&session, &refresh, client).await?;

        info!(user_id = %claims.sub, session_id = %session.id, "Session refreshed");
        Ok(IssuedTokens {
            user_id: claims.sub,
            session_id: session.id,
            access,
            refresh,
        })
    }

    /// Revoke the session bound to `refresh_token`.
    ///
    /// Returns whether a session carried the token's identifier; repeating
    /// the call is harmless.
    pub async fn logout(&self, refresh_token: &str) -> Result<bool, AuthError> {
        let claims = self.tokens.verify_refresh_token(refresh_token)?;
        let revoked = self
            .sessions
            .revoke_by_identifier(&claims.jti, Utc::now())
            .await?;
        self.identity.invalidate(&claims.sub).await;

        info!(user_id = %claims.sub, revoked, "Logout");
        Ok(revoked)
    }

    /// Revoke every session of `user_id`. Returns how many were active.
    pub async fn logout_all(&self, user_id: &str) -> Result<usize, AuthError> {
        let revoked = self.sessions.revoke_all(user_id, Utc::now()).await?;
        self.identity.invalidate(user_id).await;

        info!(user_id = %user_id, revoked, "Logged out of all sessions");
        Ok(revoked)
    }

    // =========================================================================
    // Per-request authorization
    // =========================================================================

    /// Resolve the principal behind a bearer access token.
    pub async fn authenticate(&self, access_token: &str) -> Result<AuthenticatedUser, AuthError> {
        let claims = self.tokens.verify_access_token(access_token)?;
        let profile = self
            .identity
            .resolve(&claims.sub, self.credentials.as_ref())
            .await?
            .ok_or(AuthError::InvalidOrExpiredToken)?;

        Ok(AuthenticatedUser {
            user_id: claims.sub,
            profile,
            expires_at: claims.exp,
        })
    }

    // =========================================================================
    // Account & sessions of the authenticated user
    // =========================================================================

    pub async fn update_profile(
        &self,
        user_id: &str,
        request: UpdateProfileRequest,
    ) -> Result<UserProfile, AuthError> {
        let mut user = self
            .credentials
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;

        if let Some(name) = request.display_name.as_deref() {
            user.display_name = validate_display_name(name)?;
        }
        match request.second_factor_enabled {
            Some(true) if user.second_factor_secret.is_none() => {
                return Err(AuthError::Validation(
                    "No second factor is enrolled for this account".to_string(),
                ));
            }
            Some(true) => user.second_factor_enabled = true,
            Some(false) => {
                user.second_factor_enabled = false;
                user.second_factor_secret = None;
            }
            None => {}
        }

        user.updated_at = Utc::now();
        self.credentials.update_user(&user).await?;
        self.identity.invalidate(user_id).await;

        Ok(UserProfile::from(&user))
    }

    /// Store an externally generated base32 second-factor secret. The factor
    /// stays disabled until enabled through
    /// [`AuthGate::update_profile`].
    pub async fn enroll_second_factor(&self, user_id: &str, secret: &str) -> Result<(), AuthError> {
        second_factor::decode_secret(secret)?;

        let mut user = self
            .credentials
            .find_user_by_id(user_id)
            .await?
            .ok_or(AuthError::NotFound)?;
        user.second_factor_secret = Some(secret.trim().to_ascii_uppercase());
        user.updated_at = Utc::now();
        self.credentials.update_user(&user).await?;
        self.identity.invalidate(user_id).await;
        Ok(())
    }

    pub async fn list_sessions(&self, user_id: &str) -> Result<Vec<SessionSummary>, AuthError> {
        let sessions = self.sessions.list_active(user_id, Utc::now()).await?;
        Ok(sessions.iter().map(SessionSummary::from).collect())
    }

    /// Revoke one of the caller's own sessions.
    pub async fn revoke_session(&self, user_id: &str, session_id: &str) -> Result<(), AuthError> {
        if self
            .sessions
            .revoke_owned(user_id, session_id, Utc::now())
            .await?
        {
            Ok(())
        } else {
            Err(AuthError::NotFound)
        }
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    async fn record_attempt(&self, email: &str, client: &ClientContext, success: bool) {
        let attempt = LoginAttempt::new(email, client.ip_address.clone(), success);
        if let Err(e) = self.audit.append_login_attempt(&attempt).await {
            warn!(error = %e, success, "Failed to record login attempt");
        }
    }

    /// Returns the wrong-code count, or 0 when the store could not be updated.
    async fn release_challenge(&self, challenge_id: &str, failed: bool) -> u32 {
        match self
            .challenge_store
            .release_challenge(challenge_id, failed)
            .await
        {
            Ok(failures) => failures,
            Err(e) => {
                warn!(error = %e, "Failed to release second-factor challenge");
                0
            }
        }
    }

    fn identity_provider(&self) -> Result<&Arc<dyn IdentityProvider>, AuthError> {
        self.identity_provider.as_ref().ok_or(AuthError::NotFound)
    }

    fn hash_verification_token(&self, token: &str) -> Result<String, AuthError> {
        let mut mac = HmacSha256::new_from_slice(self.settings.verification_hmac_key.as_bytes())
            .map_err(|_| AuthError::Internal("invalid verification HMAC key".into()))?;
        mac.update(token.as_bytes());
        Ok(Base64UrlUnpadded::encode_string(&mac.finalize().into_bytes()))
    }

    fn verification_link(&self, token: &str) -> Url {
        let mut link = self.settings.verification_link_base.clone();
        link.query_pairs_mut().append_pair("token", token);
        link
    }
}

fn oauth_state_key(state: &str) -> String {
    format!("oauth_state:{state}")
}

fn random_token() -> Result<String, AuthError> {
    let mut bytes = [0u8; VERIFICATION_TOKEN_BYTES];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AuthError::Internal("failed to generate verification token".into()))?;
    Ok(Base64UrlUnpadded::encode_string(&bytes))
}
