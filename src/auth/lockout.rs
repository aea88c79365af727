// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Account lockout policy.
//!
//! Pure state transitions over the two lockout fields of a user record:
//!
//! - a failed check increments the counter; reaching the threshold locks the
//!   account for a fixed duration and resets the counter
//! - a successful check clears both fields
//! - a locked account is rejected before the password is compared, and that
//!   rejection does not count as a failure

use chrono::{DateTime, TimeDelta, Utc};

/// Lockout counters stored on the user record.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LockoutState {
    pub failed_attempts: u32,
    pub locked_until: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Copy)]
pub struct LockoutPolicy {
    max_failures: u32,
    lock_duration: TimeDelta,
}

impl LockoutPolicy {
    pub fn new(max_failures: u32, lock_duration: TimeDelta) -> Self {
        Self {
            // A threshold of zero would lock on the first failure anyway
            max_failures: max_failures.max(1),
            lock_duration,
        }
    }

    /// `Err(until)` while the account is locked.
    pub fn check(&self, state: &LockoutState, now: DateTime<Utc>) -> Result<(), DateTime<Utc>> {
        match state.locked_until {
            Some(until) if until > now => Err(until),
            _ => Ok(()),
        }
    }

    pub fn register_failure(&self, state: LockoutState, now: DateTime<Utc>) -> LockoutState {
        let failed_attempts = state.failed_attempts.saturating_add(1);
        if failed_attempts >= self.max_failures {
            LockoutState {
                failed_attempts: 0,
                locked_until: Some(now + self.lock_duration),
            }
        } else {
            LockoutState {
                failed_attempts,
                locked_until: state.locked_until,
            }
        }
    }

    pub fn register_success(&self) -> LockoutState {
        LockoutState::default()
    }
}
