// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Per-IP throttling of failed authentication requests.
//!
//! Only failed responses (4xx/5xx) are counted. Once an address has failed
//! `max` times within the window it is blocked for a full window, whatever
//! it sends. Failures are counted with a keyed `governor` limiter that
//! replenishes one failure every `window / max`.

use std::num::{NonZeroU32, NonZeroUsize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use governor::{clock::DefaultClock, state::keyed::DefaultKeyedStateStore, Quota, RateLimiter};
use lru::LruCache;
use tracing::warn;

use crate::auth::{AuthError, ClientContext};

/// Distinct addresses tracked before stale limiter state is dropped.
const MAX_TRACKED_ADDRESSES: usize = 10_000;

type KeyedLimiter = RateLimiter<String, DefaultKeyedStateStore<String>, DefaultClock>;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allowed,
    Limited,
}

#[derive(Clone)]
pub struct AuthRateLimiter {
    failures: Arc<KeyedLimiter>,
    blocked: Arc<Mutex<LruCache<String, Instant>>>,
    window: Duration,
}

impl AuthRateLimiter {
    pub fn new(max: u32, window: Duration) -> Self {
        let max = NonZeroU32::new(max).unwrap_or(NonZeroU32::MIN);
        // The failure that finds the bucket empty is the max-th one
        let burst = NonZeroU32::new(max.get() - 1).unwrap_or(NonZeroU32::MIN);
        let quota = Quota::with_period(window / max.get())
            .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
            .allow_burst(burst);

        let capacity = NonZeroUsize::new(MAX_TRACKED_ADDRESSES).unwrap_or(NonZeroUsize::MIN);
        Self {
            failures: Arc::new(RateLimiter::keyed(quota)),
            blocked: Arc::new(Mutex::new(LruCache::new(capacity))),
            window,
        }
    }

    pub fn check(&self, ip: &str) -> RateLimitDecision {
        let Ok(mut blocked) = self.blocked.lock() else {
            return RateLimitDecision::Allowed;
        };
        match blocked.get(ip) {
            Some(until) if *until > Instant::now() => RateLimitDecision::Limited,
            Some(_) => {
                blocked.pop(ip);
                RateLimitDecision::Allowed
            }
            None => RateLimitDecision::Allowed,
        }
    }

    pub fn record_failure(&self, ip: &str) {
        if self.failures.check_key(&ip.to_string()).is_err() {
            warn!(ip = %ip, "Blocking address after repeated failed auth requests");
            if let Ok(mut blocked) = self.blocked.lock() {
                blocked.put(ip.to_string(), Instant::now() + self.window);
            }
        }
        if self.failures.len() > MAX_TRACKED_ADDRESSES {
            self.failures.retain_recent();
        }
    }
}

/// Middleware for the signup and login routes.
pub async fn limit_failed_attempts(
    State(limiter): State<AuthRateLimiter>,
    client: ClientContext,
    request: Request,
    next: Next,
) -> Response {
    if limiter.check(&client.ip_address) == RateLimitDecision::Limited {
        return AuthError::RateLimited.into_response();
    }

    let response = next.run(request).await;
    let status = response.status();
    if status.is_client_error() || status.is_server_error() {
        limiter.record_failure(&client.ip_address);
    }
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_is_blocked_after_max_failures() {
        let limiter = AuthRateLimiter::new(3, Duration::from_secs(900));

        for _ in 0..2 {
            limiter.record_failure("203.0.113.1");
            assert_eq!(limiter.check("203.0.113.1"), RateLimitDecision::Allowed);
        }
        limiter.record_failure("203.0.113.1");

        assert_eq!(limiter.check("203.0.113.1"), RateLimitDecision::Limited);
        assert_eq!(limiter.check("203.0.113.2"), RateLimitDecision::Allowed);
    }

    #[test]
    fn block_ends_with_the_window() {
        let limiter = AuthRateLimiter::new(1, Duration::from_millis(20));
        limiter.record_failure("203.0.113.1");
        limiter.record_failure("203.0.113.1");
        assert_eq!(limiter.check("203.0.113.1"), RateLimitDecision::Limited);

        std::thread::sleep(Duration::from_millis(40));
        assert_eq!(limiter.check("203.0.113.1"), RateLimitDecision::Allowed);
    }
}
