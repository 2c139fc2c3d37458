// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! High-level types for the SDK.

use std::fmt;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;

use crate::error::TerminalError;

/// Position of an entry in an invocation journal. Index 0 is the input.
pub type EntryIndex = u32;

/// Kind of service a handler belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceType {
    /// Stateless service, invocations are independent
    Service,
    /// Keyed object with exclusive and shared handlers
    VirtualObject,
    /// Keyed workflow with one `run` handler per key
    Workflow,
}

impl ServiceType {
    pub fn is_keyed(self) -> bool {
        !matches!(self, ServiceType::Service)
    }
}

/// How a handler of a keyed service is admitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HandlerType {
    /// At most one exclusive invocation per key at any time
    Exclusive,
    /// Read-only, may overlap with other shared invocations
    Shared,
}

/// Opaque invocation identifier assigned by the orchestrator.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct InvocationId(Bytes);

impl InvocationId {
    pub fn new(id: impl Into<Bytes>) -> Self {
        Self(id.into())
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

impl fmt::Display for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "inv_{}", URL_SAFE_NO_PAD.encode(&self.0))
    }
}

impl fmt::Debug for InvocationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "InvocationId({})", self)
    }
}

/// Address of a handler to call or send to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationTarget {
    pub service: String,
    pub handler: String,
    pub key: Option<String>,
}

impl InvocationTarget {
    pub fn service(service: impl Into<String>, handler: impl Into<String>) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: None,
        }
    }

    pub fn object(
        service: impl Into<String>,
        key: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self {
            service: service.into(),
            handler: handler.into(),
            key: Some(key.into()),
        }
    }

    pub fn workflow(
        service: impl Into<String>,
        key: impl Into<String>,
        handler: impl Into<String>,
    ) -> Self {
        Self::object(service, key, handler)
    }
}

impl fmt::Display for InvocationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.key {
            Some(key) => write!(f, "{}/{}/{}", self.service, key, self.handler),
            None => write!(f, "{}/{}", self.service, self.handler),
        }
    }
}

/// Terminal outcome of an invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationOutcome {
    Success(Bytes),
    Failure(TerminalError),
}

// ============================================================================
// Retry Configuration
// ============================================================================

/// Retry strategy for side effects.
///
/// Determines how delay between retry attempts is calculated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RetryStrategy {
    /// Same delay before every retry
    Fixed,
    /// Exponential backoff: delay * 2^(attempt-1)
    ///
    /// First retry: delay * 1
    /// Second retry: delay * 2
    /// Third retry: delay * 4
    /// ...
    #[default]
    ExponentialBackoff,
}

/// Retry policy consulted when a side effect fails.
///
/// Retries happen locally and consume no journal entry. Failures marked
/// with [`TerminalError`] are never retried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one (minimum 1).
    pub max_attempts: u32,
    /// Base delay between attempts in milliseconds.
    pub delay_ms: u64,
    /// Strategy for calculating delays.
    pub strategy: RetryStrategy,
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, delay_ms: u64, strategy: RetryStrategy) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            delay_ms,
            strategy,
        }
    }

    /// A single attempt, failures surface immediately.
    pub fn none() -> Self {
        Self::new(1, 0, RetryStrategy::Fixed)
    }

    /// `attempts` tries in total with no delay between them.
    pub fn fixed_attempts(attempts: u32) -> Self {
        Self::new(attempts, 0, RetryStrategy::Fixed)
    }

    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Whether another attempt may follow `attempt` failed attempts.
    pub fn allows_retry(&self, attempt: u32) -> bool {
        attempt < self.max_attempts
    }

    /// Calculate delay for a given retry (1-indexed).
    ///
    /// Retry 1 is the one after the initial failure.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = match self.strategy {
            RetryStrategy::Fixed => 1,
            RetryStrategy::ExponentialBackoff => 2u64.saturating_pow(attempt.saturating_sub(1)),
        };
        Duration::from_millis(self.delay_ms.saturating_mul(multiplier))
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::none()
    }
}
