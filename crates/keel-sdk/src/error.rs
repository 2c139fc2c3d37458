// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! SDK-specific error types.

use keel_protocol::FrameError;
use keel_protocol::messages::Failure;
use thiserror::Error;

/// Wire code reported when replay diverges from the recorded journal.
pub const JOURNAL_MISMATCH_CODE: u16 = 570;
/// Wire code reported for protocol violations.
pub const PROTOCOL_VIOLATION_CODE: u16 = 571;
/// Wire code for everything else.
pub const INTERNAL_ERROR_CODE: u16 = 500;

/// Boxed error returned by side-effect closures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A failure that must not be retried.
///
/// Returned from a side effect it stops the retry loop; returned from a
/// handler it becomes the recorded outcome of the invocation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("terminal error {code}: {message}")]
pub struct TerminalError {
    pub code: u16,
    pub message: String,
}

impl TerminalError {
    pub fn new(message: impl Into<String>) -> Self {
        Self::with_code(INTERNAL_ERROR_CODE, message)
    }

    pub fn with_code(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }
}

impl From<Failure> for TerminalError {
    fn from(failure: Failure) -> Self {
        Self {
            code: u16::try_from(failure.code).unwrap_or(INTERNAL_ERROR_CODE),
            message: failure.message,
        }
    }
}

impl From<TerminalError> for Failure {
    fn from(err: TerminalError) -> Self {
        Failure {
            code: u32::from(err.code),
            message: err.message,
        }
    }
}

/// Errors that can occur in the SDK.
#[derive(Debug, Error)]
pub enum SdkError {
    /// Configuration error (missing or invalid environment variable)
    #[error("configuration error: {0}")]
    Config(String),

    /// Malformed frame or broken stream
    #[error("protocol error: {0}")]
    Protocol(#[from] FrameError),

    /// Peer sent something the protocol does not allow at this point
    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// Handler issued a different operation than the one recorded
    #[error("journal mismatch at entry {index}: expected {expected}, found {actual}")]
    JournalMismatch {
        index: u32,
        expected: String,
        actual: String,
    },

    /// An entry index was registered for completion twice
    #[error("entry {0} registered twice")]
    DuplicateRegistration(u32),

    /// Unretryable failure
    #[error(transparent)]
    Terminal(#[from] TerminalError),

    /// The invocation's connection was torn down
    #[error("invocation cancelled")]
    Cancelled,

    /// The invocation suspended and will resume in a later attempt
    #[error("invocation suspended")]
    Suspended,

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// No handler registered under this name
    #[error("unknown target: {service}/{handler}")]
    UnknownTarget { service: String, handler: String },

    /// Keyed target invoked without a key
    #[error("missing key for keyed service {0}")]
    MissingKey(String),

    /// Internal SDK error
    #[error("internal error: {0}")]
    Internal(String),
}

impl SdkError {
    /// Code reported to the orchestrator in an error message.
    pub fn error_code(&self) -> u16 {
        match self {
            SdkError::JournalMismatch { .. } => JOURNAL_MISMATCH_CODE,
            SdkError::Protocol(_)
            | SdkError::ProtocolViolation(_)
            | SdkError::DuplicateRegistration(_) => PROTOCOL_VIOLATION_CODE,
            SdkError::Terminal(err) => err.code,
            _ => INTERNAL_ERROR_CODE,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SdkError::Terminal(_))
    }
}

impl From<serde_json::Error> for SdkError {
    fn from(err: serde_json::Error) -> Self {
        SdkError::Serialization(err.to_string())
    }
}

impl From<prost::DecodeError> for SdkError {
    fn from(err: prost::DecodeError) -> Self {
        SdkError::Protocol(FrameError::Decode(err))
    }
}

/// Type alias for SDK results.
pub type Result<T> = std::result::Result<T, SdkError>;
