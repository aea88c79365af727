// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Embedded authentication database backed by redb (pure Rust, ACID).
//!
//! ## Table Layout
//!
//! - `users`: user_id → serialized User
//! - `users_by_email`: normalized e-mail → user_id
//! - `users_by_external_id`: provider id → user_id
//! - `users_by_verification`: verification token hash → user_id
//! - `sessions`: session_id → serialized Session
//! - `sessions_by_identifier`: jti → session_id
//! - `sessions_by_user`: composite key (user_id\0session_id) → session_id
//! - `login_attempts`: composite key (email\0timestamp\0id) → serialized LoginAttempt
//! - `login_history`: composite key (user_id\0timestamp\0id) → serialized LoginHistoryEntry
//! - `challenges`: challenge jti → serialized ChallengeRecord
//!
//! redb serializes write transactions, so every read-check-write done inside
//! one `begin_write` is atomic with respect to other writers. The async
//! trait implementations run each operation on the blocking thread pool.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use redb::{Database, ReadableDatabase, ReadableTable, TableDefinition};
use serde::{de::DeserializeOwned, Deserialize, Serialize};

use super::{
    AuditStore, ChallengeClaim, ChallengeStore, CredentialStore, SessionRotation, SessionStore,
    StorageError, StorageResult,
};
use crate::models::{LoginAttempt, LoginHistoryEntry, Session, User};

// =============================================================================
// Table Definitions
// =============================================================================

const USERS: TableDefinition<&str, &[u8]> = TableDefinition::new("users");
const USERS_BY_EMAIL: TableDefinition<&str, &str> = TableDefinition::new("users_by_email");
const USERS_BY_EXTERNAL_ID: TableDefinition<&str, &str> =
    TableDefinition::new("users_by_external_id");
const USERS_BY_VERIFICATION: TableDefinition<&str, &str> =
    TableDefinition::new("users_by_verification");

const SESSIONS: TableDefinition<&str, &[u8]> = TableDefinition::new("sessions");
const SESSIONS_BY_IDENTIFIER: TableDefinition<&str, &str> =
    TableDefinition::new("sessions_by_identifier");
/// Key format: `user_id \0 session_id`.
const SESSIONS_BY_USER: TableDefinition<&[u8], &str> = TableDefinition::new("sessions_by_user");

/// Key format: `email \0 timestamp_be \0 attempt_id` (oldest first).
const LOGIN_ATTEMPTS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("login_attempts");
/// Key format: `user_id \0 timestamp_be \0 entry_id` (oldest first).
const LOGIN_HISTORY: TableDefinition<&[u8], &[u8]> = TableDefinition::new("login_history");

const CHALLENGES: TableDefinition<&str, &[u8]> = TableDefinition::new("challenges");

/// Redemption state of one second-factor challenge.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChallengeRecord {
    expires_at: DateTime<Utc>,
    failed_attempts: u32,
    claimed: bool,
    redeemed: bool,
}

// =============================================================================
// Key Helpers
// =============================================================================

const KEY_SEPARATOR: u8 = 0;

/// Build a composite key `owner \0 id`.
fn make_owner_key(owner: &str, id: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(owner.len() + 1 + id.len());
    key.extend_from_slice(owner.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Build a composite key `owner \0 timestamp_be \0 id` that sorts by time.
fn make_event_key(owner: &str, timestamp: DateTime<Utc>, id: &str) -> Vec<u8> {
    // Flipping the sign bit keeps pre-epoch timestamps ordered before post-epoch ones.
    let sortable = (timestamp.timestamp_micros() as u64) ^ (1 << 63);
    let mut key = Vec::with_capacity(owner.len() + 1 + 8 + 1 + id.len());
    key.extend_from_slice(owner.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&sortable.to_be_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(id.as_bytes());
    key
}

/// Inclusive lower bound for a range scan over one owner.
fn make_prefix(owner: &str) -> Vec<u8> {
    let mut prefix = Vec::with_capacity(owner.len() + 1);
    prefix.extend_from_slice(owner.as_bytes());
    prefix.push(KEY_SEPARATOR);
    prefix
}

/// Exclusive upper bound for a range scan over one owner.
fn make_prefix_end(owner: &str) -> Vec<u8> {
    let mut end = Vec::with_capacity(owner.len() + 1);
    end.extend_from_slice(owner.as_bytes());
    end.push(KEY_SEPARATOR + 1);
    end
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StorageResult<T> {
    Ok(serde_json::from_slice(bytes)?)
}

fn load_user<T>(table: &T, user_id: &str) -> StorageResult<Option<User>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(user_id)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

fn load_session<T>(table: &T, session_id: &str) -> StorageResult<Option<Session>>
where
    T: ReadableTable<&'static str, &'static [u8]>,
{
    match table.get(session_id)? {
        Some(value) => Ok(Some(decode(value.value())?)),
        None => Ok(None),
    }
}

fn session_ids_for_user<T>(index: &T, user_id: &str) -> StorageResult<Vec<String>>
where
    T: ReadableTable<&'static [u8], &'static str>,
{
    let start = make_prefix(user_id);
    let end = make_prefix_end(user_id);
    let mut ids = Vec::new();
    for entry in index.range(start.as_slice()..end.as_slice())? {
        let (_, session_id) = entry?;
        ids.push(session_id.value().to_string());
    }
    Ok(ids)
}

fn read_events<T, E>(table: &T, owner: &str) -> StorageResult<Vec<E>>
where
    T: ReadableTable<&'static [u8], &'static [u8]>,
    E: DeserializeOwned,
{
    let start = make_prefix(owner);
    let end = make_prefix_end(owner);
    let mut events = Vec::new();
    for entry in table.range(start.as_slice()..end.as_slice())? {
        let (_, value) = entry?;
        events.push(decode(value.value())?);
    }
    Ok(events)
}

// =============================================================================
// AuthDatabase
// =============================================================================

/// Embedded ACID store for users, sessions and login audit rows.
#[derive(Clone)]
pub struct AuthDatabase {
    db: Arc<Database>,
}

impl AuthDatabase {
    /// Open (or create) the database at the given path.
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let db = Database::create(path)?;

        // Pre-create all tables so later read transactions don't fail
        let write_txn = db.begin_write()?;
        {
            let _ = write_txn.open_table(USERS)?;
            let _ = write_txn.open_table(USERS_BY_EMAIL)?;
            let _ = write_txn.open_table(USERS_BY_EXTERNAL_ID)?;
            let _ = write_txn.open_table(USERS_BY_VERIFICATION)?;
            let _ = write_txn.open_table(SESSIONS)?;
            let _ = write_txn.open_table(SESSIONS_BY_IDENTIFIER)?;
            let _ = write_txn.open_table(SESSIONS_BY_USER)?;
            let _ = write_txn.open_table(LOGIN_ATTEMPTS)?;
            let _ = write_txn.open_table(LOGIN_HISTORY)?;
            let _ = write_txn.open_table(CHALLENGES)?;
        }
        write_txn.commit()?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Verify the database answers a read transaction.
    pub fn health_check(&self) -> StorageResult<()> {
        let read_txn = self.db.begin_read()?;
        let _ = read_txn.open_table(USERS)?;
        Ok(())
    }

    /// Run a synchronous database operation on the blocking thread pool.
    async fn blocking<T, F>(&self, op: F) -> StorageResult<T>
    where
        F: FnOnce(&AuthDatabase) -> StorageResult<T> + Send + 'static,
        T: Send + 'static,
    {
        let this = self.clone();
        tokio::task::spawn_blocking(move || op(&this))
            .await
            .map_err(|e| StorageError::Task(e.to_string()))?
    }

    // =========================================================================
    // Users
    // =========================================================================

    pub fn get_user(&self, user_id: &str) -> StorageResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let users = read_txn.open_table(USERS)?;
        load_user(&users, user_id)
    }

    fn get_user_by_index(
        &self,
        index: TableDefinition<'static, &'static str, &'static str>,
        key: &str,
    ) -> StorageResult<Option<User>> {
        let read_txn = self.db.begin_read()?;
        let index_table = read_txn.open_table(index)?;
        let user_id = match index_table.get(key)? {
            Some(value) => value.value().to_string(),
            None => return Ok(None),
        };
        let users = read_txn.open_table(USERS)?;
        load_user(&users, &user_id)
    }

    pub fn get_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        self.get_user_by_index(USERS_BY_EMAIL, email)
    }

    pub fn get_user_by_external_id(&self, external_id: &str) -> StorageResult<Option<User>> {
        self.get_user_by_index(USERS_BY_EXTERNAL_ID, external_id)
    }

    pub fn get_user_by_verification_hash(&self, token_hash: &str) -> StorageResult<Option<User>> {
        self.get_user_by_index(USERS_BY_VERIFICATION, token_hash)
    }

    /// Insert a user and its lookup indexes.
    pub fn insert_user(&self, user: &User) -> StorageResult<()> {
        let json = serde_json::to_vec(user)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut users = write_txn.open_table(USERS)?;
            let mut by_email = write_txn.open_table(USERS_BY_EMAIL)?;
            let mut by_external = write_txn.open_table(USERS_BY_EXTERNAL_ID)?;
            let mut by_verification = write_txn.open_table(USERS_BY_VERIFICATION)?;

            if users.get(user.id.as_str())?.is_some() {
                return Err(StorageError::AlreadyExists(format!("User {}", user.id)));
            }
            if by_email.get(user.email.as_str())?.is_some() {
                return Err(StorageError::AlreadyExists(format!(
                    "User with e-mail {}",
                    user.email
                )));
            }
            if let Some(external_id) = user.external_id.as_deref() {
                if by_external.get(external_id)?.is_some() {
                    return Err(StorageError::AlreadyExists(format!(
                        "User with external id {external_id}"
                    )));
                }
                by_external.insert(external_id, user.id.as_str())?;
            }
            if let Some(token_hash) = user.verification_token_hash.as_deref() {
                by_verification.insert(token_hash, user.id.as_str())?;
            }

            by_email.insert(user.email.as_str(), user.id.as_str())?;
            users.insert(user.id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Replace a user record, moving any index entry whose key changed.
    pub fn replace_user(&self, user: &User) -> StorageResult<()> {
        let json = serde_json::to_vec(user)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut users = write_txn.open_table(USERS)?;
            let mut by_email = write_txn.open_table(USERS_BY_EMAIL)?;
            let mut by_external = write_txn.open_table(USERS_BY_EXTERNAL_ID)?;
            let mut by_verification = write_txn.open_table(USERS_BY_VERIFICATION)?;

            let previous = load_user(&users, &user.id)?
                .ok_or_else(|| StorageError::NotFound(format!("User {}", user.id)))?;

            if previous.email != user.email {
                if by_email.get(user.email.as_str())?.is_some() {
                    return Err(StorageError::AlreadyExists(format!(
                        "User with e-mail {}",
                        user.email
                    )));
                }
                by_email.remove(previous.email.as_str())?;
                by_email.insert(user.email.as_str(), user.id.as_str())?;
            }

            if previous.external_id != user.external_id {
                if let Some(external_id) = user.external_id.as_deref() {
                    let owner = by_external.get(external_id)?.map(|v| v.value().to_string());
                    if owner.is_some_and(|owner| owner != user.id) {
                        return Err(StorageError::AlreadyExists(format!(
                            "User with external id {external_id}"
                        )));
                    }
                    by_external.insert(external_id, user.id.as_str())?;
                }
                if let Some(old) = previous.external_id.as_deref() {
                    by_external.remove(old)?;
                }
            }

            if previous.verification_token_hash != user.verification_token_hash {
                if let Some(old) = previous.verification_token_hash.as_deref() {
                    by_verification.remove(old)?;
                }
                if let Some(token_hash) = user.verification_token_hash.as_deref() {
                    by_verification.insert(token_hash, user.id.as_str())?;
                }
            }

            users.insert(user.id.as_str(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Remove a user, its indexes and all of its sessions.
    pub fn remove_user(&self, user_id: &str) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut users = write_txn.open_table(USERS)?;
            let mut by_email = write_txn.open_table(USERS_BY_EMAIL)?;
            let mut by_external = write_txn.open_table(USERS_BY_EXTERNAL_ID)?;
            let mut by_verification = write_txn.open_table(USERS_BY_VERIFICATION)?;
            let mut sessions = write_txn.open_table(SESSIONS)?;
            let mut by_identifier = write_txn.open_table(SESSIONS_BY_IDENTIFIER)?;
            let mut by_user = write_txn.open_table(SESSIONS_BY_USER)?;

            let user = load_user(&users, user_id)?
                .ok_or_else(|| StorageError::NotFound(format!("User {user_id}")))?;

            by_email.remove(user.email.as_str())?;
            if let Some(external_id) = user.external_id.as_deref() {
                by_external.remove(external_id)?;
            }
            if let Some(token_hash) = user.verification_token_hash.as_deref() {
                by_verification.remove(token_hash)?;
            }

            for session_id in session_ids_for_user(&by_user, user_id)? {
                if let Some(session) = load_session(&sessions, &session_id)? {
                    by_identifier.remove(session.session_identifier.as_str())?;
                }
                sessions.remove(session_id.as_str())?;
                by_user.remove(make_owner_key(user_id, &session_id).as_slice())?;
            }

            users.remove(user_id)?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Delete unverified users whose verification window ended before `now`.
    pub fn remove_expired_unverified(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let expired: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let users = read_txn.open_table(USERS)?;
            let mut ids = Vec::new();
            for entry in users.iter()? {
                let (_, value) = entry?;
                let user: User = decode(value.value())?;
                let lapsed = user.verification_expires_at.is_some_and(|at| at < now);
                if !user.is_verified && lapsed {
                    ids.push(user.id);
                }
            }
            ids
        };

        let mut removed = 0;
        for user_id in expired {
            match self.remove_user(&user_id) {
                Ok(()) => removed += 1,
                // Deleted concurrently (e.g. by an expired verification attempt)
                Err(StorageError::NotFound(_)) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }

    // =========================================================================
    // Sessions
    // =========================================================================

    /// All sessions (any state) owned by a user.
    pub fn get_sessions_for_user(&self, user_id: &str) -> StorageResult<Vec<Session>> {
        let read_txn = self.db.begin_read()?;
        let by_user = read_txn.open_table(SESSIONS_BY_USER)?;
        let sessions = read_txn.open_table(SESSIONS)?;

        let mut result = Vec::new();
        for session_id in session_ids_for_user(&by_user, user_id)? {
            if let Some(session) = load_session(&sessions, &session_id)? {
                result.push(session);
            }
        }
        Ok(result)
    }

    pub fn get_session_by_identifier(
        &self,
        session_identifier: &str,
    ) -> StorageResult<Option<Session>> {
        let read_txn = self.db.begin_read()?;
        let by_identifier = read_txn.open_table(SESSIONS_BY_IDENTIFIER)?;
        let session_id = match by_identifier.get(session_identifier)? {
            Some(value) => value.value().to_string(),
            None => return Ok(None),
        };
        let sessions = read_txn.open_table(SESSIONS)?;
        load_session(&sessions, &session_id)
    }

    /// Count active sessions and insert in the same write transaction.
    pub fn insert_session_within_quota(
        &self,
        session: &Session,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let json = serde_json::to_vec(session)?;

        let write_txn = self.db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS)?;
            let mut by_identifier = write_txn.open_table(SESSIONS_BY_IDENTIFIER)?;
            let mut by_user = write_txn.open_table(SESSIONS_BY_USER)?;

            let mut active = 0;
            for session_id in session_ids_for_user(&by_user, &session.user_id)? {
                if let Some(existing) = load_session(&sessions, &session_id)? {
                    if existing.is_active(now) {
                        active += 1;
                    }
                }
            }
            if active >= limit {
                return Ok(false);
            }

            if by_identifier
                .get(session.session_identifier.as_str())?
                .is_some()
            {
                return Err(StorageError::AlreadyExists(format!(
                    "Session identifier for session {}",
                    session.id
                )));
            }

            sessions.insert(session.id.as_str(), json.as_slice())?;
            by_identifier.insert(session.session_identifier.as_str(), session.id.as_str())?;
            let key = make_owner_key(&session.user_id, &session.id);
            by_user.insert(key.as_slice(), session.id.as_str())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Compare-and-swap the identifier of a session.
    pub fn rotate_session(
        &self,
        session_id: &str,
        expected_identifier: &str,
        rotation: &SessionRotation,
    ) -> StorageResult<bool> {
        let write_txn = self.db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS)?;
            let mut by_identifier = write_txn.open_table(SESSIONS_BY_IDENTIFIER)?;

            let Some(mut session) = load_session(&sessions, session_id)? else {
                return Ok(false);
            };
            if session.is_revoked || session.session_identifier != expected_identifier {
                return Ok(false);
            }

            by_identifier.remove(expected_identifier)?;
            by_identifier.insert(rotation.session_identifier.as_str(), session_id)?;

            session.session_identifier = rotation.session_identifier.clone();
            session.ip_address = rotation.ip_address.clone();
            session.user_agent = rotation.user_agent.clone();
            session.expires_at = rotation.expires_at;

            let json = serde_json::to_vec(&session)?;
            sessions.insert(session_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(true)
    }

    /// Mark lapsed, non-revoked sessions as revoked.
    pub fn revoke_expired_sessions(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        // Scan under a read transaction so the common no-op case never takes the writer lock
        let candidates: Vec<String> = {
            let read_txn = self.db.begin_read()?;
            let sessions = read_txn.open_table(SESSIONS)?;
            let mut ids = Vec::new();
            for entry in sessions.iter()? {
                let (_, value) = entry?;
                let session: Session = decode(value.value())?;
                if !session.is_revoked && session.expires_at < now {
                    ids.push(session.id);
                }
            }
            ids
        };
        if candidates.is_empty() {
            return Ok(0);
        }

        let mut revoked = 0;
        let write_txn = self.db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS)?;
            for session_id in candidates {
                let Some(mut session) = load_session(&sessions, &session_id)? else {
                    continue;
                };
                // Re-check: a rotation may have extended it since the scan
                if session.is_revoked || session.expires_at >= now {
                    continue;
                }
                session.is_revoked = true;
                session.revoked_at = Some(now);
                let json = serde_json::to_vec(&session)?;
                sessions.insert(session_id.as_str(), json.as_slice())?;
                revoked += 1;
            }
        }
        write_txn.commit()?;
        Ok(revoked)
    }

    pub fn revoke_session_by_identifier(
        &self,
        session_identifier: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let write_txn = self.db.begin_write()?;
        {
            let by_identifier = write_txn.open_table(SESSIONS_BY_IDENTIFIER)?;
            let mut sessions = write_txn.open_table(SESSIONS)?;

            let session_id = match by_identifier.get(session_identifier)? {
                Some(value) => value.value().to_string(),
                None => return Ok(false),
            };
            let Some(mut session) = load_session(&sessions, &session_id)? else {
                return Ok(false);
            };
            if !session.is_revoked {
                session.is_revoked = true;
                session.revoked_at = Some(now);
                let json = serde_json::to_vec(&session)?;
                sessions.insert(session_id.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(true)
    }

    pub fn revoke_sessions_for_user(&self, user_id: &str, now: DateTime<Utc>) -> StorageResult<usize> {
        let mut active_revoked = 0;
        let write_txn = self.db.begin_write()?;
        {
            let by_user = write_txn.open_table(SESSIONS_BY_USER)?;
            let mut sessions = write_txn.open_table(SESSIONS)?;

            for session_id in session_ids_for_user(&by_user, user_id)? {
                let Some(mut session) = load_session(&sessions, &session_id)? else {
                    continue;
                };
                if session.is_revoked {
                    continue;
                }
                if session.is_active(now) {
                    active_revoked += 1;
                }
                session.is_revoked = true;
                session.revoked_at = Some(now);
                let json = serde_json::to_vec(&session)?;
                sessions.insert(session_id.as_str(), json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(active_revoked)
    }

    pub fn revoke_session_for_user(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let write_txn = self.db.begin_write()?;
        {
            let mut sessions = write_txn.open_table(SESSIONS)?;
            let Some(mut session) = load_session(&sessions, session_id)? else {
                return Ok(false);
            };
            if session.user_id != user_id {
                return Ok(false);
            }
            if !session.is_revoked {
                session.is_revoked = true;
                session.revoked_at = Some(now);
                let json = serde_json::to_vec(&session)?;
                sessions.insert(session_id, json.as_slice())?;
            }
        }
        write_txn.commit()?;
        Ok(true)
    }

    // =========================================================================
    // Login audit
    // =========================================================================

    pub fn insert_login_attempt(&self, attempt: &LoginAttempt) -> StorageResult<()> {
        let json = serde_json::to_vec(attempt)?;
        let key = make_event_key(&attempt.email, attempt.timestamp, &attempt.id);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOGIN_ATTEMPTS)?;
            table.insert(key.as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    pub fn insert_login_history(&self, entry: &LoginHistoryEntry) -> StorageResult<()> {
        let json = serde_json::to_vec(entry)?;
        let key = make_event_key(&entry.user_id, entry.timestamp, &entry.id);

        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(LOGIN_HISTORY)?;
            table.insert(key.as_slice(), json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    // =========================================================================
    // Second-factor challenges
    // =========================================================================

    /// Check and take a challenge in one write transaction.
    pub fn claim_challenge_record(
        &self,
        challenge_id: &str,
        expires_at: DateTime<Utc>,
        max_failures: u32,
    ) -> StorageResult<ChallengeClaim> {
        let write_txn = self.db.begin_write()?;
        let claim = {
            let mut table = write_txn.open_table(CHALLENGES)?;
            let existing: Option<ChallengeRecord> = match table.get(challenge_id)? {
                Some(value) => Some(decode(value.value())?),
                None => None,
            };

            let mut record = existing.unwrap_or(ChallengeRecord {
                expires_at,
                failed_attempts: 0,
                claimed: false,
                redeemed: false,
            });
            let claim = if record.redeemed {
                ChallengeClaim::Redeemed
            } else if record.claimed {
                ChallengeClaim::Busy
            } else if record.failed_attempts >= max_failures {
                ChallengeClaim::Exhausted
            } else {
                ChallengeClaim::Claimed
            };

            if claim == ChallengeClaim::Claimed {
                record.claimed = true;
                let json = serde_json::to_vec(&record)?;
                table.insert(challenge_id, json.as_slice())?;
            }
            claim
        };
        write_txn.commit()?;
        Ok(claim)
    }

    pub fn release_challenge_record(&self, challenge_id: &str, failed: bool) -> StorageResult<u32> {
        let write_txn = self.db.begin_write()?;
        let failures = {
            let mut table = write_txn.open_table(CHALLENGES)?;
            let mut record: ChallengeRecord = match table.get(challenge_id)? {
                Some(value) => decode(value.value())?,
                None => return Err(StorageError::NotFound(format!("Challenge {challenge_id}"))),
            };
            record.claimed = false;
            if failed {
                record.failed_attempts += 1;
            }
            let json = serde_json::to_vec(&record)?;
            table.insert(challenge_id, json.as_slice())?;
            record.failed_attempts
        };
        write_txn.commit()?;
        Ok(failures)
    }

    pub fn complete_challenge_record(&self, challenge_id: &str) -> StorageResult<()> {
        let write_txn = self.db.begin_write()?;
        {
            let mut table = write_txn.open_table(CHALLENGES)?;
            let mut record: ChallengeRecord = match table.get(challenge_id)? {
                Some(value) => decode(value.value())?,
                None => return Err(StorageError::NotFound(format!("Challenge {challenge_id}"))),
            };
            record.claimed = false;
            record.redeemed = true;
            let json = serde_json::to_vec(&record)?;
            table.insert(challenge_id, json.as_slice())?;
        }
        write_txn.commit()?;
        Ok(())
    }

    /// Drop challenge records whose token can no longer be presented.
    pub fn remove_expired_challenges(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        let write_txn = self.db.begin_write()?;
        let removed = {
            let mut table = write_txn.open_table(CHALLENGES)?;
            let mut expired = Vec::new();
            for entry in table.iter()? {
                let (key, value) = entry?;
                let record: ChallengeRecord = decode(value.value())?;
                if record.expires_at < now {
                    expired.push(key.value().to_string());
                }
            }
            for challenge_id in &expired {
                table.remove(challenge_id.as_str())?;
            }
            expired.len()
        };
        write_txn.commit()?;
        Ok(removed)
    }

    /// Login attempts for an e-mail address, oldest first.
    pub fn login_attempts_for(&self, email: &str) -> StorageResult<Vec<LoginAttempt>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LOGIN_ATTEMPTS)?;
        read_events(&table, email)
    }

    /// Finalized logins of a user, oldest first.
    pub fn login_history_for(&self, user_id: &str) -> StorageResult<Vec<LoginHistoryEntry>> {
        let read_txn = self.db.begin_read()?;
        let table = read_txn.open_table(LOGIN_HISTORY)?;
        read_events(&table, user_id)
    }
}

// =============================================================================
// Collaborator trait implementations
// =============================================================================

#[async_trait]
impl CredentialStore for AuthDatabase {
    async fn find_user_by_email(&self, email: &str) -> StorageResult<Option<User>> {
        let email = email.to_string();
        self.blocking(move |db| db.get_user_by_email(&email)).await
    }

    async fn find_user_by_id(&self, user_id: &str) -> StorageResult<Option<User>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.get_user(&user_id)).await
    }

    async fn find_user_by_external_id(&self, external_id: &str) -> StorageResult<Option<User>> {
        let external_id = external_id.to_string();
        self.blocking(move |db| db.get_user_by_external_id(&external_id))
            .await
    }

    async fn find_user_by_verification_hash(
        &self,
        token_hash: &str,
    ) -> StorageResult<Option<User>> {
        let token_hash = token_hash.to_string();
        self.blocking(move |db| db.get_user_by_verification_hash(&token_hash))
            .await
    }

    async fn create_user(&self, user: &User) -> StorageResult<()> {
        let user = user.clone();
        self.blocking(move |db| db.insert_user(&user)).await
    }

    async fn update_user(&self, user: &User) -> StorageResult<()> {
        let user = user.clone();
        self.blocking(move |db| db.replace_user(&user)).await
    }

    async fn delete_user(&self, user_id: &str) -> StorageResult<()> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.remove_user(&user_id)).await
    }

    async fn purge_unverified(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.blocking(move |db| db.remove_expired_unverified(now))
            .await
    }
}

#[async_trait]
impl SessionStore for AuthDatabase {
    async fn find_renewable(
        &self,
        user_id: &str,
        ip_address: &str,
        user_agent: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Option<Session>> {
        let (user_id, ip_address, user_agent) = (
            user_id.to_string(),
            ip_address.to_string(),
            user_agent.to_string(),
        );
        self.blocking(move |db| {
            Ok(db
                .get_sessions_for_user(&user_id)?
                .into_iter()
                .filter(|s| s.is_active(now))
                .filter(|s| s.ip_address == ip_address && s.user_agent == user_agent)
                .max_by_key(|s| s.created_at))
        })
        .await
    }

    async fn find_by_identifier(
        &self,
        session_identifier: &str,
    ) -> StorageResult<Option<Session>> {
        let session_identifier = session_identifier.to_string();
        self.blocking(move |db| db.get_session_by_identifier(&session_identifier))
            .await
    }

    async fn count_active(&self, user_id: &str, now: DateTime<Utc>) -> StorageResult<usize> {
        let user_id = user_id.to_string();
        self.blocking(move |db| {
            Ok(db
                .get_sessions_for_user(&user_id)?
                .iter()
                .filter(|s| s.is_active(now))
                .count())
        })
        .await
    }

    async fn insert_within_quota(
        &self,
        session: &Session,
        limit: usize,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let session = session.clone();
        self.blocking(move |db| db.insert_session_within_quota(&session, limit, now))
            .await
    }

    async fn rotate(
        &self,
        session_id: &str,
        expected_identifier: &str,
        rotation: SessionRotation,
    ) -> StorageResult<bool> {
        let (session_id, expected_identifier) =
            (session_id.to_string(), expected_identifier.to_string());
        self.blocking(move |db| db.rotate_session(&session_id, &expected_identifier, &rotation))
            .await
    }

    async fn sweep_expired(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.blocking(move |db| db.revoke_expired_sessions(now)).await
    }

    async fn revoke_by_identifier(
        &self,
        session_identifier: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let session_identifier = session_identifier.to_string();
        self.blocking(move |db| db.revoke_session_by_identifier(&session_identifier, now))
            .await
    }

    async fn revoke_all_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<usize> {
        let user_id = user_id.to_string();
        self.blocking(move |db| db.revoke_sessions_for_user(&user_id, now))
            .await
    }

    async fn list_active_for_user(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<Vec<Session>> {
        let user_id = user_id.to_string();
        self.blocking(move |db| {
            let mut sessions: Vec<Session> = db
                .get_sessions_for_user(&user_id)?
                .into_iter()
                .filter(|s| s.is_active(now))
                .collect();
            sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
            Ok(sessions)
        })
        .await
    }

    async fn revoke_by_id_for_user(
        &self,
        user_id: &str,
        session_id: &str,
        now: DateTime<Utc>,
    ) -> StorageResult<bool> {
        let (user_id, session_id) = (user_id.to_string(), session_id.to_string());
        self.blocking(move |db| db.revoke_session_for_user(&user_id, &session_id, now))
            .await
    }
}

#[async_trait]
impl AuditStore for AuthDatabase {
    async fn append_login_attempt(&self, attempt: &LoginAttempt) -> StorageResult<()> {
        let attempt = attempt.clone();
        self.blocking(move |db| db.insert_login_attempt(&attempt))
            .await
    }

    async fn append_login_history(&self, entry: &LoginHistoryEntry) -> StorageResult<()> {
        let entry = entry.clone();
        self.blocking(move |db| db.insert_login_history(&entry))
            .await
    }
}

#[async_trait]
impl ChallengeStore for AuthDatabase {
    async fn claim_challenge(
        &self,
        challenge_id: &str,
        expires_at: DateTime<Utc>,
        max_failures: u32,
    ) -> StorageResult<ChallengeClaim> {
        let challenge_id = challenge_id.to_string();
        self.blocking(move |db| db.claim_challenge_record(&challenge_id, expires_at, max_failures))
            .await
    }

    async fn release_challenge(&self, challenge_id: &str, failed: bool) -> StorageResult<u32> {
        let challenge_id = challenge_id.to_string();
        self.blocking(move |db| db.release_challenge_record(&challenge_id, failed))
            .await
    }

    async fn complete_challenge(&self, challenge_id: &str) -> StorageResult<()> {
        let challenge_id = challenge_id.to_string();
        self.blocking(move |db| db.complete_challenge_record(&challenge_id))
            .await
    }

    async fn purge_expired_challenges(&self, now: DateTime<Utc>) -> StorageResult<usize> {
        self.blocking(move |db| db.remove_expired_challenges(now))
            .await
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeDelta;

    fn temp_db() -> (AuthDatabase, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let db = AuthDatabase::open(&dir.path().join("test.redb")).unwrap();
        (db, dir)
    }

    fn sample_user(id: &str, email: &str) -> User {
        let now = Utc::now();
        User {
            id: id.to_string(),
            email: email.to_string(),
            password_hash: None,
            display_name: format!("user-{id}"),
            is_verified: true,
            verification_token_hash: None,
            verification_expires_at: None,
            failed_login_attempts: 0,
            locked_until: None,
            second_factor_enabled: false,
            second_factor_secret: None,
            external_id: None,
            created_at: now,
            updated_at: now,
        }
    }

    fn sample_session(id: &str, user_id: &str, jti: &str, expires_in: TimeDelta) -> Session {
        let now = Utc::now();
        Session {
            id: id.to_string(),
            user_id: user_id.to_string(),
            session_identifier: jti.to_string(),
            ip_address: "10.0.0.1".to_string(),
            user_agent: "agent".to_string(),
            created_at: now,
            expires_at: now + expires_in,
            is_revoked: false,
            revoked_at: None,
        }
    }

    #[test]
    fn insert_and_lookup_user_by_every_index() {
        let (db, _dir) = temp_db();
        let mut user = sample_user("u1", "a@x.com");
        user.external_id = Some("ext-1".to_string());
        user.verification_token_hash = Some("hash-1".to_string());
        db.insert_user(&user).unwrap();

        assert_eq!(db.get_user("u1").unwrap().unwrap(), user);
        assert_eq!(db.get_user_by_email("a@x.com").unwrap().unwrap().id, "u1");
        assert_eq!(db.get_user_by_external_id("ext-1").unwrap().unwrap().id, "u1");
        assert_eq!(
            db.get_user_by_verification_hash("hash-1").unwrap().unwrap().id,
            "u1"
        );
    }

    #[test]
    fn duplicate_email_rejected() {
        let (db, _dir) = temp_db();
        db.insert_user(&sample_user("u1", "a@x.com")).unwrap();
        let result = db.insert_user(&sample_user("u2", "a@x.com"));
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
        assert!(db.get_user("u2").unwrap().is_none());
    }

    #[test]
    fn replace_user_moves_indexes() {
        let (db, _dir) = temp_db();
        let mut user = sample_user("u1", "a@x.com");
        user.verification_token_hash = Some("hash-1".to_string());
        db.insert_user(&user).unwrap();

        user.verification_token_hash = None;
        user.external_id = Some("ext-9".to_string());
        db.replace_user(&user).unwrap();

        assert!(db.get_user_by_verification_hash("hash-1").unwrap().is_none());
        assert_eq!(db.get_user_by_external_id("ext-9").unwrap().unwrap().id, "u1");
    }

    #[test]
    fn remove_user_drops_sessions() {
        let (db, _dir) = temp_db();
        db.insert_user(&sample_user("u1", "a@x.com")).unwrap();
        let session = sample_session("s1", "u1", "jti-1", TimeDelta::hours(1));
        assert!(db
            .insert_session_within_quota(&session, 5, Utc::now())
            .unwrap());

        db.remove_user("u1").unwrap();

        assert!(db.get_user_by_email("a@x.com").unwrap().is_none());
        assert!(db.get_session_by_identifier("jti-1").unwrap().is_none());
        assert!(db.get_sessions_for_user("u1").unwrap().is_empty());
    }

    #[test]
    fn expired_unverified_users_are_purged() {
        let (db, _dir) = temp_db();
        let now = Utc::now();

        let mut stale = sample_user("stale", "stale@x.com");
        stale.is_verified = false;
        stale.verification_expires_at = Some(now - TimeDelta::hours(1));
        db.insert_user(&stale).unwrap();

        let mut pending = sample_user("pending", "pending@x.com");
        pending.is_verified = false;
        pending.verification_expires_at = Some(now + TimeDelta::hours(1));
        db.insert_user(&pending).unwrap();

        db.insert_user(&sample_user("verified", "ok@x.com")).unwrap();

        assert_eq!(db.remove_expired_unverified(now).unwrap(), 1);
        assert!(db.get_user("stale").unwrap().is_none());
        assert!(db.get_user("pending").unwrap().is_some());
        assert!(db.get_user("verified").unwrap().is_some());
    }

    #[test]
    fn quota_is_enforced_inside_the_write() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        for i in 0..2 {
            let session = sample_session(&format!("s{i}"), "u1", &format!("jti-{i}"), TimeDelta::hours(1));
            assert!(db.insert_session_within_quota(&session, 2, now).unwrap());
        }

        let third = sample_session("s2", "u1", "jti-2", TimeDelta::hours(1));
        assert!(!db.insert_session_within_quota(&third, 2, now).unwrap());
        assert!(db.get_session_by_identifier("jti-2").unwrap().is_none());

        // Other users are unaffected
        let other = sample_session("s9", "u2", "jti-9", TimeDelta::hours(1));
        assert!(db.insert_session_within_quota(&other, 2, now).unwrap());
    }

    #[test]
    fn expired_sessions_do_not_count_toward_quota() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        let stale = sample_session("s0", "u1", "jti-0", TimeDelta::seconds(-5));
        assert!(db.insert_session_within_quota(&stale, 1, now).unwrap());

        let fresh = sample_session("s1", "u1", "jti-1", TimeDelta::hours(1));
        assert!(db.insert_session_within_quota(&fresh, 1, now).unwrap());
    }

    #[test]
    fn rotate_replaces_identifier_once() {
        let (db, _dir) = temp_db();
        let session = sample_session("s1", "u1", "jti-old", TimeDelta::hours(1));
        db.insert_session_within_quota(&session, 5, Utc::now())
            .unwrap();

        let rotation = SessionRotation {
            session_identifier: "jti-new".to_string(),
            ip_address: "10.0.0.2".to_string(),
            user_agent: "agent-2".to_string(),
            expires_at: Utc::now() + TimeDelta::hours(2),
        };
        assert!(db.rotate_session("s1", "jti-old", &rotation).unwrap());

        assert!(db.get_session_by_identifier("jti-old").unwrap().is_none());
        let rotated = db.get_session_by_identifier("jti-new").unwrap().unwrap();
        assert_eq!(rotated.id, "s1");
        assert_eq!(rotated.ip_address, "10.0.0.2");

        // A second swap against the stale identifier loses
        let replay = SessionRotation {
            session_identifier: "jti-other".to_string(),
            ..rotation
        };
        assert!(!db.rotate_session("s1", "jti-old", &replay).unwrap());
        assert!(db.get_session_by_identifier("jti-other").unwrap().is_none());
    }

    #[test]
    fn sweep_revokes_only_lapsed_sessions() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        let lapsed = sample_session("s0", "u1", "jti-0", TimeDelta::seconds(-5));
        let live = sample_session("s1", "u1", "jti-1", TimeDelta::hours(1));
        db.insert_session_within_quota(&lapsed, 5, now).unwrap();
        db.insert_session_within_quota(&live, 5, now).unwrap();

        assert_eq!(db.revoke_expired_sessions(now).unwrap(), 1);
        assert_eq!(db.revoke_expired_sessions(now).unwrap(), 0);

        let swept = db.get_session_by_identifier("jti-0").unwrap().unwrap();
        assert!(swept.is_revoked);
        assert_eq!(swept.revoked_at, Some(now));
        assert!(!db.get_session_by_identifier("jti-1").unwrap().unwrap().is_revoked);
    }

    #[test]
    fn revoke_by_identifier_is_idempotent() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        let session = sample_session("s1", "u1", "jti-1", TimeDelta::hours(1));
        db.insert_session_within_quota(&session, 5, now).unwrap();

        assert!(db.revoke_session_by_identifier("jti-1", now).unwrap());
        assert!(db.revoke_session_by_identifier("jti-1", now).unwrap());
        assert!(!db.revoke_session_by_identifier("unknown", now).unwrap());
    }

    #[test]
    fn revoke_all_counts_active_sessions() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        for i in 0..3 {
            let session = sample_session(&format!("s{i}"), "u1", &format!("jti-{i}"), TimeDelta::hours(1));
            db.insert_session_within_quota(&session, 5, now).unwrap();
        }
        db.revoke_session_by_identifier("jti-0", now).unwrap();
        let other = sample_session("s9", "u2", "jti-9", TimeDelta::hours(1));
        db.insert_session_within_quota(&other, 5, now).unwrap();

        assert_eq!(db.revoke_sessions_for_user("u1", now).unwrap(), 2);
        assert!(db
            .get_sessions_for_user("u1")
            .unwrap()
            .iter()
            .all(|s| s.is_revoked));
        assert!(!db.get_session_by_identifier("jti-9").unwrap().unwrap().is_revoked);
    }

    #[test]
    fn revoke_by_id_checks_ownership() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        let session = sample_session("s1", "u1", "jti-1", TimeDelta::hours(1));
        db.insert_session_within_quota(&session, 5, now).unwrap();

        assert!(!db.revoke_session_for_user("intruder", "s1", now).unwrap());
        assert!(!db.get_session_by_identifier("jti-1").unwrap().unwrap().is_revoked);
        assert!(db.revoke_session_for_user("u1", "s1", now).unwrap());
        assert!(db.get_session_by_identifier("jti-1").unwrap().unwrap().is_revoked);
    }

    #[test]
    fn login_events_are_scoped_and_ordered() {
        let (db, _dir) = temp_db();
        let mut first = LoginAttempt::new("a@x.com", "10.0.0.1", false);
        first.timestamp = Utc::now() - TimeDelta::seconds(10);
        let second = LoginAttempt::new("a@x.com", "10.0.0.1", true);
        let other = LoginAttempt::new("ab@x.com", "10.0.0.1", false);

        db.insert_login_attempt(&second).unwrap();
        db.insert_login_attempt(&first).unwrap();
        db.insert_login_attempt(&other).unwrap();

        let attempts = db.login_attempts_for("a@x.com").unwrap();
        assert_eq!(attempts.len(), 2);
        assert!(!attempts[0].success);
        assert!(attempts[1].success);

        db.insert_login_history(&LoginHistoryEntry::new("u1")).unwrap();
        assert_eq!(db.login_history_for("u1").unwrap().len(), 1);
        assert!(db.login_history_for("u2").unwrap().is_empty());
    }

    #[test]
    fn challenge_claim_is_exclusive_until_released() {
        let (db, _dir) = temp_db();
        let expires_at = Utc::now() + TimeDelta::minutes(5);

        assert_eq!(
            db.claim_challenge_record("c1", expires_at, 3).unwrap(),
            ChallengeClaim::Claimed
        );
        assert_eq!(
            db.claim_challenge_record("c1", expires_at, 3).unwrap(),
            ChallengeClaim::Busy
        );

        assert_eq!(db.release_challenge_record("c1", true).unwrap(), 1);
        assert_eq!(
            db.claim_challenge_record("c1", expires_at, 3).unwrap(),
            ChallengeClaim::Claimed
        );

        db.complete_challenge_record("c1").unwrap();
        assert_eq!(
            db.claim_challenge_record("c1", expires_at, 3).unwrap(),
            ChallengeClaim::Redeemed
        );
    }

    #[test]
    fn challenge_is_exhausted_after_max_failures() {
        let (db, _dir) = temp_db();
        let expires_at = Utc::now() + TimeDelta::minutes(5);

        for expected in 1..=2 {
            db.claim_challenge_record("c1", expires_at, 2).unwrap();
            assert_eq!(db.release_challenge_record("c1", true).unwrap(), expected);
        }
        assert_eq!(
            db.claim_challenge_record("c1", expires_at, 2).unwrap(),
            ChallengeClaim::Exhausted
        );
    }

    #[test]
    fn expired_challenges_are_removed() {
        let (db, _dir) = temp_db();
        let now = Utc::now();
        db.claim_challenge_record("old", now - TimeDelta::seconds(1), 3)
            .unwrap();
        db.claim_challenge_record("live", now + TimeDelta::minutes(5), 3)
            .unwrap();

        assert_eq!(db.remove_expired_challenges(now).unwrap(), 1);
        assert_eq!(
            db.claim_challenge_record("live", now + TimeDelta::minutes(5), 3)
                .unwrap(),
            ChallengeClaim::Busy
        );
    }

    #[test]
    fn make_event_key_orders_by_time() {
        let earlier = Utc::now();
        let later = earlier + TimeDelta::milliseconds(1);
        assert!(make_event_key("a", earlier, "z") < make_event_key("a", later, "a"));
        assert!(make_prefix("a") <= make_event_key("a", earlier, "z"));
        assert!(make_event_key("a", later, "z") < make_prefix_end("a"));
    }

    #[tokio::test]
    async fn trait_methods_run_on_blocking_pool() {
        let (db, _dir) = temp_db();
        let user = sample_user("u1", "a@x.com");
        CredentialStore::create_user(&db, &user).await.unwrap();

        let found = db.find_user_by_email("a@x.com").await.unwrap();
        assert_eq!(found.map(|u| u.id), Some("u1".to_string()));

        let now = Utc::now();
        let session = sample_session("s1", "u1", "jti-1", TimeDelta::hours(1));
        assert!(db.insert_within_quota(&session, 1, now).await.unwrap());
        let renewable = db
            .find_renewable("u1", "10.0.0.1", "agent", now)
            .await
            .unwrap();
        assert_eq!(renewable.map(|s| s.id), Some("s1".to_string()));
        assert!(db
            .find_renewable("u1", "10.0.0.2", "agent", now)
            .await
            .unwrap()
            .is_none());
        assert_eq!(db.count_active("u1", now).await.unwrap(), 1);
    }
}
