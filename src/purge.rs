// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! # Unverified Account Purger
//!
//! Background task that deletes accounts whose e-mail verification window
//! closed without the link being used, so the address can be registered
//! again. The same sweep drops expired second-factor challenge records.
//!
//! ## Shutdown
//!
//! Uses `tokio_util::sync::CancellationToken`; `main` cancels it together
//! with the HTTP server.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::AuthGate;

/// Default interval between purge sweeps.
const DEFAULT_PURGE_INTERVAL: Duration = Duration::from_secs(10 * 60);

pub struct UnverifiedPurger {
    gate: Arc<AuthGate>,
    interval: Duration,
}

impl UnverifiedPurger {
    pub fn new(gate: Arc<AuthGate>) -> Self {
        Self {
            gate,
            interval: DEFAULT_PURGE_INTERVAL,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Run until the cancellation token is triggered.
    ///
    /// ```rust,ignore
    /// tokio::spawn(purger.run(shutdown.clone()));
    /// ```
    pub async fn run(self, shutdown: CancellationToken) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Unverified account purger starting"
        );

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            self.purge_step().await;

            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {},
                _ = shutdown.cancelled() => break,
            }
        }
        info!("Unverified account purger shutting down");
    }

    async fn purge_step(&self) {
        match self.gate.purge_unverified().await {
            Ok(0) => debug!("Purger: nothing to delete"),
            Ok(count) => info!(count, "Purger: deleted expired unverified accounts"),
            Err(e) => warn!(error = %e, "Purger: sweep failed"),
        }
        match self.gate.purge_expired_challenges().await {
            Ok(0) => {}
            Ok(count) => debug!(count, "Purger: dropped expired login challenges"),
            Err(e) => warn!(error = %e, "Purger: challenge sweep failed"),
        }
    }
}
