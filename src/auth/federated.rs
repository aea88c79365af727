// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Federated identity merge.
//!
//! Maps an identity asserted by an external provider onto a local user:
//!
//! 1. a user already linked to the external id wins
//! 2. otherwise a user with the same e-mail gets the external id attached
//! 3. otherwise a verified, password-less user is created
//!
//! The protocol exchange with the provider happens upstream; this module only
//! receives its result.

use chrono::{DateTime, Utc};
use ring::rand::{SecureRandom, SystemRandom};
use tracing::info;

use super::AuthError;
use crate::models::User;
use crate::storage::{CredentialStore, StorageError};

const GENERATED_NAME_PREFIX: &str = "user";
const GENERATED_NAME_SUFFIX_LEN: usize = 7;
const ALPHANUMERIC: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";

/// Identity asserted by an external provider.
#[derive(Debug, Clone)]
pub struct FederatedIdentity {
    /// Stable subject at the provider.
    pub external_id: String,
    /// Normalized e-mail reported by the provider.
    pub email: String,
}

/// Find or create the local user for `identity`.
pub async fn resolve_user(
    store: &dyn CredentialStore,
    identity: &FederatedIdentity,
    now: DateTime<Utc>,
) -> Result<User, AuthError> {
    if let Some(user) = store.find_user_by_external_id(&identity.external_id).await? {
        return Ok(user);
    }

    if let Some(mut user) = store.find_user_by_email(&identity.email).await? {
        user.external_id = Some(identity.external_id.clone());
        user.updated_at = now;
        store.update_user(&user).await?;
        info!(user_id = %user.id, "Linked external identity to existing account");
        return Ok(user);
    }

    let user = User {
        id: uuid::Uuid::new_v4().to_string(),
        email: identity.email.clone(),
        password_hash: None,
        display_name: generated_display_name()?,
        is_verified: true,
        verification_token_hash: None,
        verification_expires_at: None,
        failed_login_attempts: 0,
        locked_until: None,
        second_factor_enabled: false,
        second_factor_secret: None,
        external_id: Some(identity.external_id.clone()),
        created_at: now,
        updated_at: now,
    };

    match store.create_user(&user).await {
        Ok(()) => {
            info!(user_id = %user.id, "Created account from external identity");
            Ok(user)
        }
        // Lost a race against a concurrent first login with the same identity
        Err(StorageError::AlreadyExists(_)) => store
            .find_user_by_external_id(&identity.external_id)
            .await?
            .ok_or_else(|| AuthError::Internal("federated account vanished after conflict".into())),
        Err(e) => Err(e.into()),
    }
}

/// `user` followed by random alphanumerics.
pub fn generated_display_name() -> Result<String, AuthError> {
    let mut bytes = [0u8; GENERATED_NAME_SUFFIX_LEN];
    SystemRandom::new()
        .fill(&mut bytes)
        .map_err(|_| AuthError::Internal("failed to generate display name".into()))?;

    let mut name = String::with_capacity(GENERATED_NAME_PREFIX.len() + GENERATED_NAME_SUFFIX_LEN);
    name.push_str(GENERATED_NAME_PREFIX);
    for byte in bytes {
        let idx = usize::from(byte) % ALPHANUMERIC.len();
        name.push(char::from(ALPHANUMERIC[idx]));
    }
    Ok(name)
}
