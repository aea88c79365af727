// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Device session lifecycle on top of a [`SessionStore`].
//!
//! A session is renewed in place when the same user logs in again from the
//! same `(ip, user-agent)`; otherwise a new row is inserted, subject to the
//! active-session quota. Refresh rotates the row's identifier with a
//! compare-and-swap so a superseded refresh token can never be reused.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::debug;

use super::tokens::RefreshToken;
use super::AuthError;
use crate::models::Session;
use crate::storage::{SessionRotation, SessionStore};

const RENEW_ATTEMPTS: usize = 2;

/// Where a request came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientContext {
    pub ip_address: String,
    pub user_agent: String,
}

impl ClientContext {
    pub fn new(ip_address: impl Into<String>, user_agent: impl Into<String>) -> Self {
        Self {
            ip_address: ip_address.into(),
            user_agent: user_agent.into(),
        }
    }
}

#[derive(Clone)]
pub struct SessionManager {
    store: Arc<dyn SessionStore>,
    max_active: usize,
}

impl SessionManager {
    pub fn new(store: Arc<dyn SessionStore>, max_active: usize) -> Self {
        Self { store, max_active }
    }

    /// Bind `refresh` to a session of `user_id`, renewing the device's
    /// existing session when there is one.
    pub async fn create_or_renew(
        &self,
        user_id: &str,
        client: &ClientContext,
        refresh: &RefreshToken,
        now: DateTime<Utc>,
    ) -> Result<Session, AuthError> {
        // A concurrent login or refresh can move the row between lookup and
        // swap; look once more before falling back to a new row.
        for _ in 0..RENEW_ATTEMPTS {
            let Some(existing) = self
                .store
                .find_renewable(user_id, &client.ip_address, &client.user_agent, now)
                .await?
            else {
                break;
            };
            if self
                .store
                .rotate(
                    &existing.id,
                    &existing.session_identifier,
                    rotation_for(refresh, client),
                )
                .await?
            {
                debug!(user_id = %user_id, session_id = %existing.id, "Renewed session");
                return Ok(Session {
                    session_identifier: refresh.session_identifier.clone(),
                    expires_at: refresh.expires_at,
                    ..existing
                });
            }
        }

        let session = Session {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            session_identifier: refresh.session_identifier.clone(),
            ip_address: client.ip_address.clone(),
            user_agent: client.user_agent.clone(),
            created_at: now,
            expires_at: refresh.expires_at,
            is_revoked: false,
            revoked_at: None,
        };

        if !self
            .store
            .insert_within_quota(&session, self.max_active, now)
            .await?
        {
            return Err(AuthError::SessionQuotaExceeded {
                limit: self.max_active,
            });
        }

        debug!(user_id = %user_id, session_id = %session.id, "Created session");
        Ok(session)
    }

    /// Swap the identifier of `session` for the one in `refresh`.
    ///
    /// Fails with [`AuthError::InvalidSession`] when another refresh won.
    pub async fn rotate(
        &self,
        session: &Session,
        refresh: &RefreshToken,
        client: &ClientContext,
    ) -> Result<(), AuthError> {
        let rotated = self
            .store
            .rotate(
                &session.id,
                &session.session_identifier,
                rotation_for(refresh, client),
            )
            .await?;
        if rotated {
            Ok(())
        } else {
            Err(AuthError::InvalidSession)
        }
    }

    pub async fn find_by_identifier(
        &self,
        session_identifier: &str,
    ) -> Result<Option<Session>, AuthError> {
        Ok(self.store.find_by_identifier(session_identifier).await?)
    }

    /// Revoke every session past its expiry.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<usize, AuthError> {
        let swept = self.store.sweep_expired(now).await?;
        if swept > 0 {
            debug!(count = swept, "Swept expired sessions");
        }
        Ok(swept)
    }

    pub async fn revoke_by_identifier(
        &self,
        session_identifier: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        Ok(self
            .store
            .revoke_by_identifier(session_identifier, now)
            .await?)
    }

    pub async fn revoke_all(&self, user_id: &str, now: DateTime<Utc>) -> Result<usize, AuthError> {
        Ok(self.store.revoke_all_for_user(user_id, now).await?)
    }

    pub async fn list_active(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<Session>, AuthError> {
        Ok(self.store.list_active_for_user(user_id, now).await?)
    }

    pub async fn revoke_owned(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, AuthError> {
        Ok(self
            .store
            .revoke_by_id_for_user(user_id, session_id, now)
            .await?)
    }
}

fn rotation_for(refresh: &RefreshToken, client: &ClientContext) -> SessionRotation {
    SessionRotation {
        session_identifier: refresh.session_identifier.clone(),
        ip_address: client.ip_address.clone(),
        user_agent: client.user_agent.clone(),
        expires_at: refresh.expires_at,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::tokens::TokenIssuer;
    use crate::config::AuthSettings;
    use crate::storage::{AuthDatabase, StorageResult};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Lets a competing rotation win the first swap it sees.
    struct RacingStore {
        inner: AuthDatabase,
        raced: AtomicBool,
    }

    #[async_trait]
    impl SessionStore for RacingStore {
        async fn find_renewable(
            &self,
            user_id: &str,
            ip_address: &str,
            user_agent: &str,
            now: DateTime<Utc>,
        ) -> StorageResult<Option<Session>> {
            self.inner
                .find_renewable(user_id, ip_address, user_agent, now)
                .await
        }

        async fn find_by_identifier(&self, jti: &str) -> StorageResult<Option<Session>> {
            self.inner.find_by_identifier(jti).await
        }

        async fn count_active(&self, user_id: &str, now: DateTime<Utc>) -> StorageResult<usize> {
            self.inner.count_active(user_id, now).await
        }

        async fn insert_within_quota(
            &self,
            session: &Session,
            limit: usize,
            now: DateTime<Utc>,
        ) -> StorageResult<bool> {
            self.inner.insert_within_quota(session, limit, now).await
        }

        async fn rotate(
            &self,
            session_id: &str,
            expected_identifier: &str,
            rotation: SessionRotation,
        ) -> StorageResult<bool> {
            if !self.raced.swap(true, Ordering::SeqCst) {
                let competitor = SessionRotation {
                    session_identifier: "competing-refresh".to_string(),
                    ..rotation.clone()
                };
                self.inner
                    .rotate(session_id, expected_identifier, competitor)
                    .await?;
                return Ok(false);
            }
            self.inner
                .rotate(session_id, expected_identifier, rotation)
                .await
        }

        async fn sweep_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
            self.inner.sweep_expired(now).await
        }

        async fn revoke_by_identifier(&self, jti: &str, now: DateTime<Utc>) -> StorageResult<bool> {
            self.inner.revoke_by_identifier(jti, now).await
        }

        async fn revoke_all_for_user(
            &self,
            user_id: &str,
            now: DateTime<Utc>,
        ) -> StorageResult<usize> {
            self.inner.revoke_all_for_user(user_id, now).await
        }

        async fn list_active_for_user(
            &self,
            user_id: &str,
            now: DateTime<Utc>,
        ) -> StorageResult<Vec<Session>> {
            self.inner.list_active_for_user(user_id, now).await
        }

        async fn revoke_by_id_for_user(
            &self,
            user_id: &str,
            session_id: &str,
            now: DateTime<Utc>,
        ) -> StorageResult<bool> {
            self.inner.revoke_by_id_for_user(user_id, session_id, now).await
        }
    }

    fn setup(max_active: usize) -> (SessionManager, TokenIssuer, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = AuthDatabase::open(&dir.path().join("sessions.redb")).unwrap();
        let manager = SessionManager::new(Arc::new(db), max_active);
        (manager, TokenIssuer::new(&AuthSettings::for_testing()), dir)
    }

    #[tokio::test]
    async fn same_device_renews_in_place() {
        let (manager, issuer, _dir) = setup(5);
        let client = ClientContext::new("10.0.0.1", "firefox");
        let now = Utc::now();

        let first_token = issuer.mint_refresh_token("user-1").unwrap();
        let first = manager
            .create_or_renew("user-1", &client, &first_token, now)
            .await
            .unwrap();

        let second_token = issuer.mint_refresh_token("user-1").unwrap();
        let second = manager
            .create_or_renew("user-1", &client, &second_token, now)
            .await
            .unwrap();

        assert_eq!(first.id, second.id);
        assert_eq!(second.session_identifier, second_token.session_identifier);
        assert!(manager
            .find_by_identifier(&first_token.session_identifier)
            .await
            .unwrap()
            .is_none());
        assert_eq!(manager.list_active("user-1", now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn new_devices_are_capped() {
        let (manager, issuer, _dir) = setup(2);
        let now = Utc::now();

        for agent in ["a", "b"] {
            let token = issuer.mint_refresh_token("user-1").unwrap();
            manager
                .create_or_renew("user-1", &ClientContext::new("10.0.0.1", agent), &token, now)
                .await
                .unwrap();
        }

        let token = issuer.mint_refresh_token("user-1").unwrap();
        let err = manager
            .create_or_renew("user-1", &ClientContext::new("10.0.0.1", "c"), &token, now)
            .await
            .unwrap_err();
        assert_eq!(err, AuthError::SessionQuotaExceeded { limit: 2 });

        // A known device still renews at the cap
        let token = issuer.mint_refresh_token("user-1").unwrap();
        assert!(manager
            .create_or_renew("user-1", &ClientContext::new("10.0.0.1", "a"), &token, now)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn lost_renewal_swap_retries_instead_of_adding_a_row() {
        let dir = tempfile::tempdir().unwrap();
        let db = AuthDatabase::open(&dir.path().join("sessions.redb")).unwrap();
        let issuer = TokenIssuer::new(&AuthSettings::for_testing());
        let client = ClientContext::new("10.0.0.1", "firefox");
        let now = Utc::now();

        let first = SessionManager::new(Arc::new(db.clone()), 1)
            .create_or_renew("user-1", &client, &issuer.mint_refresh_token("user-1").unwrap(), now)
            .await
            .unwrap();

        // At the cap a duplicate insert would fail with the quota error
        let racing = SessionManager::new(
            Arc::new(RacingStore {
                inner: db.clone(),
                raced: AtomicBool::new(false),
            }),
            1,
        );
        let token = issuer.mint_refresh_token("user-1").unwrap();
        let renewed = racing
            .create_or_renew("user-1", &client, &token, now)
            .await
            .unwrap();

        assert_eq!(renewed.id, first.id);
        assert_eq!(renewed.session_identifier, token.session_identifier);
        assert_eq!(racing.list_active("user-1", now).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stale_rotation_is_rejected() {
        let (manager, issuer, _dir) = setup(5);
        let client = ClientContext::new("10.0.0.1", "firefox");
        let token = issuer.mint_refresh_token("user-1").unwrap();
        let session = manager
            .create_or_renew("user-1", &client, &token, Utc::now())
            .await
            .unwrap();

        let winner = issuer.mint_refresh_token("user-1").unwrap();
        manager.rotate(&session, &winner, &client).await.unwrap();

        let loser = issuer.mint_refresh_token("user-1").unwrap();
        assert_eq!(
            manager.rotate(&session, &loser, &client).await.unwrap_err(),
            AuthError::InvalidSession
        );
    }
}
