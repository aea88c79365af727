// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Read-through identity cache.
//!
//! Keeps the per-request principal lookup off the credential store. Entries
//! are keyed `user:{id}`, hold the JSON [`UserProfile`] and live as long as an
//! access token. The cache is never authoritative: read failures fall back to
//! the store and write/delete failures are only logged.
//!
//! A miss only populates the cache if no invalidation happened between the
//! store read and the write. Every invalidation bumps an epoch under a write
//! lock; a populate compares the epoch it saw before reading the store and
//! writes under the read lock. A lookup racing an update can therefore return
//! the old profile once but never leaves it behind in the cache.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tracing::{debug, warn};

use super::AuthError;
use crate::models::UserProfile;
use crate::storage::{CredentialStore, KeyValueCache};

fn cache_key(user_id: &str) -> String {
    format!("user:{user_id}")
}

#[derive(Clone)]
pub struct IdentityCache {
    cache: Arc<dyn KeyValueCache>,
    ttl: Duration,
    epoch: Arc<RwLock<u64>>,
}

impl IdentityCache {
    pub fn new(cache: Arc<dyn KeyValueCache>, ttl: Duration) -> Self {
        Self {
            cache,
            ttl,
            epoch: Arc::new(RwLock::new(0)),
        }
    }

    /// Resolve a profile, populating the cache on a miss.
    ///
    /// `Ok(None)` when the user no longer exists.
    pub async fn resolve(
        &self,
        user_id: &str,
        store: &dyn CredentialStore,
    ) -> Result<Option<UserProfile>, AuthError> {
        let key = cache_key(user_id);

        match self.cache.get(&key).await {
            Ok(Some(payload)) => match serde_json::from_str::<UserProfile>(&payload) {
                Ok(profile) => return Ok(Some(profile)),
                Err(e) => warn!(user_id = %user_id, error = %e, "Discarding undecodable identity cache entry"),
            },
            Ok(None) => {}
            Err(e) => warn!(user_id = %user_id, error = %e, "Identity cache read failed, using store"),
        }

        let seen_epoch = *self.epoch.read().await;
        let Some(user) = store.find_user_by_id(user_id).await? else {
            return Ok(None);
        };
        let profile = UserProfile::from(&user);

        let payload = match serde_json::to_string(&profile) {
            Ok(payload) => payload,
            Err(e) => {
                warn!(user_id = %user_id, error = %e, "Failed to encode identity cache entry");
                return Ok(Some(profile));
            }
        };

        let epoch = self.epoch.read().await;
        if *epoch != seen_epoch {
            debug!(user_id = %user_id, "Skipping identity cache fill after concurrent invalidation");
        } else if let Err(e) = self.cache.set(&key, payload, self.ttl).await {
            warn!(user_id = %user_id, error = %e, "Identity cache write failed");
        }
        drop(epoch);

        Ok(Some(profile))
    }

    /// Drop the cached profile of a user and void in-flight fills.
    pub async fn invalidate(&self, user_id: &str) {
        let mut epoch = self.epoch.write().await;
        *epoch = epoch.wrapping_add(1);
        if let Err(e) = self.cache.delete(&cache_key(user_id)).await {
            warn!(user_id = %user_id, error = %e, "Identity cache invalidation failed");
        }
    }
}
