// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel Protocol - message framing for durable invocations
//!
//! This crate provides the wire protocol spoken between a handler process
//! and the orchestrator that owns the invocation journal. One duplex byte
//! stream carries one invocation.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                      keel-protocol                          │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Messages: control (start, completion, ack, ...) + entries  │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Serialization: Protobuf (prost)                            │
//! ├─────────────────────────────────────────────────────────────┤
//! │  Framing: 8 byte header + payload in pooled buffers         │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Message flow
//!
//! ```text
//! orchestrator                                  handler process
//!      │ ── Start{known_entries = n} ───────────────▶ │
//!      │ ── n recorded entries (replay prefix) ─────▶ │
//!      │ ◀─────────────────────── new journal entries │
//!      │ ── Completion / EntryAck ──────────────────▶ │
//!      │ ◀──────────────── Output + End | Suspension | Error
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use keel_protocol::{BufferPool, FrameConfig, FramedStream, ProtocolMessage};
//!
//! let mut framed = FramedStream::new(stream, BufferPool::default(), FrameConfig::default());
//! match framed.read_message().await? {
//!     ProtocolMessage::Start(start) => println!("{} entries to replay", start.known_entries),
//!     other => println!("unexpected {}", other.message_type()),
//! }
//! ```

pub mod frame;
pub mod header;
pub mod messages;
pub mod pool;

// Re-export main types
pub use frame::{
    DEFAULT_MAX_MESSAGE_SIZE, DEFAULT_MESSAGE_SIZE_WARNING, FrameConfig, FrameError,
    FramedStream, RawMessage, read_message, write_message,
};
pub use header::{
    HEADER_SIZE, MessageFlags, MessageHeader, MessageKind, MessageType, UnknownMessageType,
};
pub use messages::{EntryMessage, ProtocolMessage, RawEntry};
pub use pool::{
    BufferPool, DEFAULT_MAX_RETAINED_BYTES, DEFAULT_POOL_CAPACITY, PoolStats, PooledBuffer,
};
