// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Storage Module
//!
//! Persistence seams of the authentication core. The core only talks to the
//! traits defined here; [`AuthDatabase`] implements the persistent ones on an
//! embedded redb file and [`LruKeyValueCache`] implements the cache.
//!
//! ## Collaborators
//!
//! - [`CredentialStore`] - user records, lockout and verification fields
//! - [`SessionStore`] - device sessions keyed by their jti
//! - [`AuditStore`] - append-only login attempts and login history
//! - [`ChallengeStore`] - redemption state of second-factor challenges
//! - [`KeyValueCache`] - generic serialized-blob cache with TTL
//!
//! All traits are object safe and injected as `Arc<dyn ...>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::models::{LoginAttempt, LoginHistoryEntry, Session, User};

pub mod cache;
pub mod database;

pub use cache::{CacheError, KeyValueCache, LruKeyValueCache};
pub use database::AuthDatabase;

/// Error type for persistent storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("redb error: {0}")]
    Redb(#[from] redb::Error),

    #[error("redb database error: {0}")]
    RedbDatabase(#[from] redb::DatabaseError),

    #[error("redb transaction error: {0}")]
    RedbTransaction(#[from] redb::TransactionError),

    #[error("redb table error: {0}")]
    RedbTable(#[from] redb::TableError),

    #[error("redb storage error: {0}")]
    RedbStorage(#[from] redb::StorageError),

    #[error("redb commit error: {0}")]
    RedbCommit(#[from] redb::CommitError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("already exists: {0}")]
    AlreadyExists(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("blocking task failed: {0}")]
    Task(String),
}

/// Result type for storage operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Persistent user records.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>>;

    async fn find_user_by_id(&self, user_id: &str) -> StorageResult<Option<User>>;

    async fn find_user_by_external_id(&self, external_id: &str) -> StorageResult<Option<User>>;

    /// Look up the user holding an outstanding verification token hash.
    async fn find_user_by_verification_hash(&self, token_hash: &str)
        -> StorageResult<Option<User>>;

    /// Insert a new user. Fails with [`StorageError::AlreadyExists`] when the
    /// e-mail or external id is already taken.
    async fn create_user(&self, user: &User) -> StorageResult<()>;

    /// Replace an existing user record, keeping lookup indexes in sync.
    async fn update_user(&self, user: &User) -> StorageResult<()>;

    /// Delete a user together with its sessions.
    async fn delete_user(&self, user_id: &str) -> StorageResult<()>;

    /// Delete unverified users whose verification window closed before `now`.
    async fn purge_unverified(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}

/// Persistent device sessions.
///
/// Operations on a single row are last-writer-wins; [`SessionStore::rotate`]
/// adds a compare-and-swap on the current identifier.
#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Most recent active session for the exact `(user, ip, user-agent)` tuple.
    async fn find_renewable(
        &self,
        user_id: &str,
        ip_address: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Session>>;

    async fn find_by_identifier(&self, session_identifier: &str)
        -> StorageResult<Option<Session>>;

    async fn count_active(&self, user_id: &str, now: DateTime<Utc>) -> StorageResult<usize>;

    /// Insert `session` unless the owner already has `limit` active sessions.
    ///
    /// Returns `false` without writing when the quota is reached. Whether the
    /// count and the insert are atomic is up to the backend.
    async fn insert_within_quota(
        &self,
        session: &Session,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Replace the identifier of `session_id` if it still equals
    /// `expected_identifier` and the row is not revoked.
    ///
    /// Returns `false` when the row moved on (a concurrent rotation won) or
    /// was revoked.
    async fn rotate(
        &self,
        session_id: &str,
        expected_identifier: &str,
        rotation: SessionRotation,
    ) -> StorageResult<bool>;

    /// Revoke every non-revoked session whose expiry is before `now`.
    async fn sweep_expired(&self, now: DateTime<Utc>) -> StorageResult<usize>;

    /// Revoke by jti. Returns `false` only when no row carries the identifier;
    /// revoking an already revoked row returns `true`.
    async fn revoke_by_identifier(
        &self,
        session_identifier: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;

    /// Revoke every non-revoked session of a user. Returns the number of
    /// sessions that were active at call time.
    async fn revoke_all_for_user(&self, user_id: &str, now: DateTime<Utc>)
        -> StorageResult<usize>;

    async fn list_active_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Session>>;

    /// Revoke a session by row id, only if `user_id` owns it.
    async fn revoke_by_id_for_user(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool>;
}

/// New values written by [`SessionStore::rotate`].
#[derive(Debug, Clone)]
pub struct SessionRotation {
    pub session_identifier: String,
    pub ip_address: String,
    pub user_agent: String,
    pub expires_at: DateTime<Utc>,
}

/// Append-only audit records. Callers treat failures as non-fatal.
#[async_trait]
pub trait AuditStore: Send + Sync {
    async fn append_login_attempt(&self, attempt: &LoginAttempt) -> StorageResult<()>;

    async fn append_login_history(&self, entry: &LoginHistoryEntry) -> StorageResult<()>;
}

/// Result of [`ChallengeStore::claim_challenge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeClaim {
    /// The caller holds the challenge until it completes or releases it.
    Claimed,
    /// Another request holds the challenge right now.
    Busy,
    /// The challenge already produced a session.
    Redeemed,
    /// Too many wrong codes were submitted against the challenge.
    Exhausted,
}

/// Server-side state of second-factor challenges.
///
/// Challenge tokens are stateless; this store makes redemption exclusive.
/// A claim is taken before the code is checked and is either completed or
/// released, so at most one request can finalize a given challenge.
#[async_trait]
pub trait ChallengeStore: Send + Sync {
    /// Atomically take the challenge unless it is held, redeemed or has
    /// absorbed `max_failures` wrong codes.
    async fn claim_challenge(
        &self,
        challenge_id: &str,
        expires_at: DateTime<Utc>,
        max_failures: u32,
    ) -> StorageResult<ChallengeClaim>;

    /// Drop a claim. `failed` counts a wrong code. Returns the number of wrong
    /// codes recorded so far.
    async fn release_challenge(&self, challenge_id: &str, failed: bool) -> StorageResult<u32>;

    /// Mark a claimed challenge as redeemed for good.
    async fn complete_challenge(&self, challenge_id: &str) -> StorageResult<()>;

    /// Forget challenges whose token expired before `now`.
    async fn purge_expired_challenges(&self, now: DateTime<Utc>) -> StorageResult<usize>;
}
