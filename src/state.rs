// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

use std::sync::Arc;

use tracing::{error, info};

use crate::api::rate_limit::AuthRateLimiter;
use crate::auth::{AuthGate, GateDeps, IdentityProvider, OAuthProvider, TotpVerifier};
use crate::config::AuthSettings;
use crate::mail::{LogMailer, Mailer};
use crate::storage::{AuthDatabase, KeyValueCache, LruKeyValueCache};

#[derive(Clone)]
pub struct AppState {
    pub gate: Arc<AuthGate>,
    /// Kept for readiness checks; the gate reaches storage through its traits.
    pub database: AuthDatabase,
    pub rate_limiter: AuthRateLimiter,
}

impl AppState {
    pub fn new(gate: AuthGate, database: AuthDatabase) -> Self {
        let rate_limiter = AuthRateLimiter::new(
            gate.settings().auth_rate_limit_max,
            gate.settings().auth_rate_limit_window,
        );
        Self {
            gate: Arc::new(gate),
            database,
            rate_limiter,
        }
    }

    /// Wire the gate on top of `database` with the in-process cache and the
    /// given mailer.
    pub fn with_database(
        database: AuthDatabase,
        settings: AuthSettings,
        mailer: Arc<dyn Mailer>,
    ) -> Self {
        let cache: Arc<dyn KeyValueCache> =
            Arc::new(LruKeyValueCache::new(settings.identity_cache_capacity));
        let store = Arc::new(database.clone());
        let deps = GateDeps {
            credentials: store.clone(),
            sessions: store.clone(),
            audit: store.clone(),
            challenges: store,
            cache,
            mailer,
            code_verifier: Arc::new(TotpVerifier),
            identity_provider: google_provider(&settings),
        };
        Self::new(AuthGate::new(deps, settings), database)
    }

    /// Production wiring with the logging mailer.
    pub fn from_database(database: AuthDatabase, settings: AuthSettings) -> Self {
        Self::with_database(database, settings, Arc::new(LogMailer))
    }
}

fn google_provider(settings: &AuthSettings) -> Option<Arc<dyn IdentityProvider>> {
    let google = settings.google.as_ref()?;
    match OAuthProvider::new(google) {
        Ok(provider) => {
            info!("Google sign-in enabled");
            Some(Arc::new(provider))
        }
        Err(e) => {
            error!(error = ?e, "Google sign-in disabled, OAuth client could not be built");
            None
        }
    }
}
