// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Endpoint configuration.

use std::env;

use keel_protocol::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MESSAGE_SIZE_WARNING, DEFAULT_POOL_CAPACITY, FrameConfig,
};

use crate::error::{Result, SdkError};
use crate::exclusivity::SuspensionPolicy;

/// Configuration of an [`Endpoint`](crate::Endpoint).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EndpointConfig {
    /// Largest accepted frame payload in bytes (default: 32 MiB)
    pub max_message_size: usize,
    /// Payload size above which a warning is logged and pooled buffers are
    /// no longer retained (default: 10 MiB)
    pub message_size_warning: usize,
    /// Number of idle payload buffers kept for reuse (default: 64)
    pub buffer_pool_capacity: usize,
    /// Whether suspended exclusive invocations keep their key locked
    /// (default: hold)
    pub suspension_policy: SuspensionPolicy,
}

impl EndpointConfig {
    pub fn new() -> Self {
        Self {
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            message_size_warning: DEFAULT_MESSAGE_SIZE_WARNING,
            buffer_pool_capacity: DEFAULT_POOL_CAPACITY,
            suspension_policy: SuspensionPolicy::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// # Optional Environment Variables
    /// - `KEEL_MAX_MESSAGE_SIZE` - Largest frame payload in bytes (default: 33554432)
    /// - `KEEL_MESSAGE_SIZE_WARNING` - Warning threshold in bytes (default: 10485760)
    /// - `KEEL_BUFFER_POOL_CAPACITY` - Idle buffers kept for reuse (default: 64)
    /// - `KEEL_SUSPENSION_POLICY` - `hold` or `release` (default: hold)
    pub fn from_env() -> Result<Self> {
        let defaults = Self::new();

        let max_message_size = parse_var("KEEL_MAX_MESSAGE_SIZE", defaults.max_message_size)?;
        let message_size_warning =
            parse_var("KEEL_MESSAGE_SIZE_WARNING", defaults.message_size_warning)?;
        let buffer_pool_capacity =
            parse_var("KEEL_BUFFER_POOL_CAPACITY", defaults.buffer_pool_capacity)?;

        let suspension_policy = match env::var("KEEL_SUSPENSION_POLICY") {
            Err(_) => defaults.suspension_policy,
            Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
                "hold" => SuspensionPolicy::HoldLease,
                "release" => SuspensionPolicy::ReleaseOnSuspend,
                other => {
                    return Err(SdkError::Config(format!(
                        "invalid KEEL_SUSPENSION_POLICY: {other} (expected 'hold' or 'release')"
                    )));
                }
            },
        };

        if max_message_size == 0 {
            return Err(SdkError::Config(
                "KEEL_MAX_MESSAGE_SIZE must be greater than 0".to_string(),
            ));
        }

        Ok(Self {
            max_message_size,
            message_size_warning,
            buffer_pool_capacity,
            suspension_policy,
        })
    }

    pub fn with_max_message_size(mut self, bytes: usize) -> Self {
        self.max_message_size = bytes;
        self
    }

    pub fn with_message_size_warning(mut self, bytes: usize) -> Self {
        self.message_size_warning = bytes;
        self
    }

    pub fn with_buffer_pool_capacity(mut self, capacity: usize) -> Self {
        self.buffer_pool_capacity = capacity;
        self
    }

    pub fn with_suspension_policy(mut self, policy: SuspensionPolicy) -> Self {
        self.suspension_policy = policy;
        self
    }

    /// Frame limits applied to every connection.
    pub fn frame_config(&self) -> FrameConfig {
        FrameConfig {
            max_message_size: self.max_message_size,
            message_size_warning: self.message_size_warning,
        }
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_var(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| SdkError::Config(format!("invalid {name}: {e}"))),
    }
}
