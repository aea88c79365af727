// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Argon2id password hashing.
//!
//! Hashing and verification are CPU-bound and run on the blocking pool.

use std::sync::OnceLock;

use argon2::password_hash::SaltString;
use argon2::{Argon2, PasswordHash, PasswordHasher as _, PasswordVerifier as _};
use ring::rand::{SecureRandom, SystemRandom};

use super::AuthError;

const SALT_LEN: usize = 16;

/// Hash compared against when the account does not exist, so that unknown
/// e-mails cost the same as wrong passwords.
static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();

/// Argon2id hasher with default parameters.
#[derive(Clone, Default)]
pub struct PasswordHasher {
    argon2: Argon2<'static>,
}

impl PasswordHasher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hash a password into a PHC string.
    pub async fn hash(&self, password: &str) -> Result<String, AuthError> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || hash_with(&argon2, &password))
            .await
            .map_err(|e| AuthError::Internal(format!("password hashing task failed: {e}")))?
    }

    /// Verify a password against a stored PHC string. A malformed hash never
    /// matches.
    pub async fn verify(&self, password: &str, stored_hash: &str) -> Result<bool, AuthError> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        let stored_hash = stored_hash.to_string();
        tokio::task::spawn_blocking(move || verify_with(&argon2, &password, &stored_hash))
            .await
            .map_err(|e| AuthError::Internal(format!("password verification task failed: {e}")))
    }

    /// Spend one verification on a throwaway hash. Always returns `false`.
    pub async fn verify_dummy(&self, password: &str) -> Result<bool, AuthError> {
        let argon2 = self.argon2.clone();
        let password = password.to_string();
        tokio::task::spawn_blocking(move || {
            let dummy = DUMMY_HASH.get_or_init(|| hash_with(&argon2, "not-a-real-password").ok());
            if let Some(dummy) = dummy {
                let _ = verify_with(&argon2, &password, dummy);
            }
            false
        })
        .await
        .map_err(|e| AuthError::Internal(format!("password verification task failed: {e}")))
    }
}

fn hash_with(argon2: &Argon2<'_>, password: &str) -> Result<String, AuthError> {
    let mut salt_bytes = [0u8; SALT_LEN];
    SystemRandom::new()
        .fill(&mut salt_bytes)
        .map_err(|_| AuthError::Internal("failed to generate password salt".to_string()))?;
    let salt = SaltString::encode_b64(&salt_bytes)
        .map_err(|e| AuthError::Internal(format!("failed to encode password salt: {e}")))?;

    argon2
        .hash_password(password.as_bytes(), &salt)
        .map(|hash| hash.to_string())
        .map_err(|e| AuthError::Internal(format!("failed to hash password: {e}")))
}

fn verify_with(argon2: &Argon2<'_>, password: &str, stored_hash: &str) -> bool {
    match PasswordHash::new(stored_hash) {
        Ok(parsed) => argon2.verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_then_verify() {
        let hasher = PasswordHasher::new();
        let hash = hasher.hash("correct horse").await.unwrap();

        assert!(hash.starts_with("$argon2id$"));
        assert!(hasher.verify("correct horse", &hash).await.unwrap());
        assert!(!hasher.verify("wrong horse", &hash).await.unwrap());
    }

    #[tokio::test]
    async fn hashes_are_salted() {
        let hasher = PasswordHasher::new();
        let a = hasher.hash("same").await.unwrap();
        let b = hasher.hash("same").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn malformed_hash_never_matches() {
        let hasher = PasswordHasher::new();
        assert!(!hasher.verify("anything", "not-a-phc-string").await.unwrap());
    }

    #[tokio::test]
    async fn dummy_verification_is_false() {
        let hasher = PasswordHasher::new();
        assert!(!hasher.verify_dummy("not-a-real-password").await.unwrap());
    }
}
