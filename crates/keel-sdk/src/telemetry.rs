// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Tracing subscriber initialization for processes serving an endpoint.
//!
//! # Usage
//!
//! ```rust,ignore
//! keel_sdk::telemetry::init_subscriber()?;
//! ```
//!
//! # Environment Variables
//!
//! - `RUST_LOG`: filter directives (default: "info")

use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;

use crate::error::{Result, SdkError};

/// Install the global tracing subscriber.
///
/// Sets up a fmt layer that writes to stderr and an `EnvFilter` that
/// respects `RUST_LOG`. Fails when a global subscriber is already set.
pub fn init_subscriber() -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt = tracing_subscriber::fmt::layer()
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .with_target(true);

    let subscriber = tracing_subscriber::Registry::default()
        .with(fmt)
        .with(filter);

    tracing::subscriber::set_global_default(subscriber)
        .map_err(|e| SdkError::Internal(format!("failed to set global subscriber: {e}")))
}
