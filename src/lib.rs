// SPDX-License-Identifier: AGPL-3.0-or-later
//
// Copyright (C) 2026 Relational Network

//! Relational Auth - Session & Token Lifecycle Service
//!
//! Credential checks with lockout, optional second-factor challenges,
//! short-lived access tokens, rotating refresh tokens bound to per-device
//! sessions, and a cached identity lookup for authenticated requests.
//!
//! ## Modules
//!
//! - `api` - HTTP API handlers (Axum)
//! - `auth` - Authentication gate, tokens, sessions and extractors
//! - `config` - Environment configuration
//! - `mail` - Verification e-mail hand-off
//! - `purge` - Background removal of expired unverified accounts
//! - `storage` - redb persistence and the in-process cache

pub mod api;
pub mod auth;
pub mod config;
pub mod mail;
pub mod models;
pub mod purge;
pub mod state;
pub mod storage;
