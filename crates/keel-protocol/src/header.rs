// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Message header codec.
//!
//! Every message on the wire starts with an 8 byte big-endian header:
//!
//! ```text
//!  63            48 47            32 31                             0
//! ┌────────────────┬────────────────┬────────────────────────────────┐
//! │  message type  │     flags      │         payload length         │
//! └────────────────┴────────────────┴────────────────────────────────┘
//! ```

use std::fmt;
use std::ops::BitOr;

use thiserror::Error;

/// Header size in bytes.
pub const HEADER_SIZE: usize = 8;

const TYPE_SHIFT: u64 = 48;
const FLAGS_SHIFT: u64 = 32;
const FLAGS_MASK: u64 = 0xFFFF;
const LENGTH_MASK: u64 = 0xFFFF_FFFF;

/// Returned when a header carries a type code outside the message table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("unknown message type: {0:#06x}")]
pub struct UnknownMessageType(pub u16);

/// Coarse grouping of message types, derived from the upper bits of the code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Control messages exchanged outside the journal
    Core,
    /// Invocation input and output entries
    Io,
    /// State and durable promise entries
    State,
    /// Side effects, timers, calls and awakeables
    Syscall,
}

/// Message types of the invocation protocol.
///
/// The numbering is fixed by the orchestrator and must not be changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum MessageType {
    Start = 0x0000,
    Completion = 0x0001,
    Suspension = 0x0002,
    Error = 0x0003,
    EntryAck = 0x0004,
    End = 0x0005,
    InputEntry = 0x0400,
    OutputEntry = 0x0401,
    GetStateEntry = 0x0800,
    SetStateEntry = 0x0801,
    ClearStateEntry = 0x0802,
    ClearAllStateEntry = 0x0803,
    GetStateKeysEntry = 0x0804,
    GetPromiseEntry = 0x0808,
    PeekPromiseEntry = 0x0809,
    CompletePromiseEntry = 0x080A,
    SleepEntry = 0x0C00,
    CallEntry = 0x0C01,
    OneWayCallEntry = 0x0C02,
    AwakeableEntry = 0x0C03,
    CompleteAwakeableEntry = 0x0C04,
    RunEntry = 0x0C05,
}

impl MessageType {
    /// Wire code of this type.
    pub const fn code(self) -> u16 {
        self as u16
    }

    pub fn kind(self) -> MessageKind {
        match self.code() >> 10 {
            0 => MessageKind::Core,
            1 => MessageKind::Io,
            2 => MessageKind::State,
            _ => MessageKind::Syscall,
        }
    }

    /// Whether messages of this type are journal entries.
    pub fn is_entry(self) -> bool {
        self.kind() != MessageKind::Core
    }

    /// Whether an entry of this type receives its result through a completion.
    pub fn is_completable(self) -> bool {
        matches!(
            self,
            MessageType::GetStateEntry
                | MessageType::GetStateKeysEntry
                | MessageType::GetPromiseEntry
                | MessageType::PeekPromiseEntry
                | MessageType::CompletePromiseEntry
                | MessageType::SleepEntry
                | MessageType::CallEntry
                | MessageType::AwakeableEntry
        )
    }

    /// Flags this type gives a meaning to. Anything else is dropped on decode.
    fn defined_flags(self) -> MessageFlags {
        if self.is_completable() {
            MessageFlags::COMPLETED | MessageFlags::REQUIRES_ACK
        } else if self.is_entry() {
            MessageFlags::REQUIRES_ACK
        } else {
            MessageFlags::empty()
        }
    }
}

impl TryFrom<u16> for MessageType {
    type Error = UnknownMessageType;

    fn try_from(value: u16) -> Result<Self, UnknownMessageType> {
        Ok(match value {
            0x0000 => MessageType::Start,
            0x0001 => MessageType::Completion,
            0x0002 => MessageType::Suspension,
            0x0003 => MessageType::Error,
            0x0004 => MessageType::EntryAck,
            0x0005 => MessageType::End,
            0x0400 => MessageType::InputEntry,
            0x0401 => MessageType::OutputEntry,
            0x0800 => MessageType::GetStateEntry,
            0x0801 => MessageType::SetStateEntry,
            0x0802 => MessageType::ClearStateEntry,
            0x0803 => MessageType::ClearAllStateEntry,
            0x0804 => MessageType::GetStateKeysEntry,
            0x0808 => MessageType::GetPromiseEntry,
            0x0809 => MessageType::PeekPromiseEntry,
            0x080A => MessageType::CompletePromiseEntry,
            0x0C00 => MessageType::SleepEntry,
            0x0C01 => MessageType::CallEntry,
            0x0C02 => MessageType::OneWayCallEntry,
            0x0C03 => MessageType::AwakeableEntry,
            0x0C04 => MessageType::CompleteAwakeableEntry,
            0x0C05 => MessageType::RunEntry,
            other => return Err(UnknownMessageType(other)),
        })
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Header flag bitfield.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct MessageFlags(u16);

impl MessageFlags {
    /// The entry already carries its result.
    pub const COMPLETED: MessageFlags = MessageFlags(0x0001);
    /// The sender expects an `EntryAck` once the entry is durable.
    pub const REQUIRES_ACK: MessageFlags = MessageFlags(0x8000);

    pub const fn empty() -> Self {
        MessageFlags(0)
    }

    pub const fn from_bits(bits: u16) -> Self {
        MessageFlags(bits)
    }

    pub const fn bits(self) -> u16 {
        self.0
    }

    pub const fn contains(self, other: MessageFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersection(self, other: MessageFlags) -> Self {
        MessageFlags(self.0 & other.0)
    }
}

impl BitOr for MessageFlags {
    type Output = MessageFlags;

    fn bitor(self, rhs: MessageFlags) -> MessageFlags {
        MessageFlags(self.0 | rhs.0)
    }
}

/// A parsed message header. Immutable once constructed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    message_type: MessageType,
    flags: MessageFlags,
    length: u32,
}

impl MessageHeader {
    pub fn new(message_type: MessageType, length: u32) -> Self {
        Self::with_flags(message_type, MessageFlags::empty(), length)
    }

    /// Flags not defined for `message_type` are discarded.
    pub fn with_flags(message_type: MessageType, flags: MessageFlags, length: u32) -> Self {
        Self {
            message_type,
            flags: flags.intersection(message_type.defined_flags()),
            length,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn flags(&self) -> MessageFlags {
        self.flags
    }

    pub fn payload_len(&self) -> u32 {
        self.length
    }

    pub fn is_completed(&self) -> bool {
        self.flags.contains(MessageFlags::COMPLETED)
    }

    pub fn requires_ack(&self) -> bool {
        self.flags.contains(MessageFlags::REQUIRES_ACK)
    }

    /// Pack into the wire representation.
    pub fn encode(&self) -> u64 {
        (u64::from(self.message_type.code()) << TYPE_SHIFT)
            | (u64::from(self.flags.bits()) << FLAGS_SHIFT)
            | u64::from(self.length)
    }

    /// Unpack from the wire representation.
    pub fn decode(raw: u64) -> Result<Self, UnknownMessageType> {
        let message_type = MessageType::try_from((raw >> TYPE_SHIFT) as u16)?;
        let flags = MessageFlags::from_bits(((raw >> FLAGS_SHIFT) & FLAGS_MASK) as u16);
        Ok(Self::with_flags(
            message_type,
            flags,
            (raw & LENGTH_MASK) as u32,
        ))
    }
}
