// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Outbound e-mail seam.
//!
//! Delivery itself lives outside this service. The gate hands verification
//! links to a [`Mailer`] on a spawned task and never waits for it.

use async_trait::async_trait;
use tracing::info;
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum MailError {
    #[error("mail delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Mailer: Send + Sync {
    async fn send_verification_email(&self, email: &str, link: &Url) -> Result<(), MailError>;
}

/// Mailer that only records the send in the log. The link carries a secret
/// token and is not logged.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogMailer;

#[async_trait]
impl Mailer for LogMailer {
    async fn send_verification_email(&self, email: &str, link: &Url) -> Result<(), MailError> {
        info!(
            email = %email,
            host = link.host_str().unwrap_or_default(),
            "Verification e-mail handed off"
        );
        Ok(())
    }
}
