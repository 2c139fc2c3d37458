// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Protobuf payloads of the invocation protocol.
//!
//! Control messages are decoded eagerly. Journal entries stay as
//! [`RawEntry`] (type, flags and undecoded payload) until the journal knows
//! which entry type the handler expects at that position.

use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

use crate::frame::{FrameError, RawMessage};
use crate::header::{HEADER_SIZE, MessageFlags, MessageHeader, MessageType};

// ============================================================================
// Shared payload parts
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct Empty {}

#[derive(Clone, PartialEq, Message)]
pub struct Failure {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
}

/// Result carried by a completed entry or a completion.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum EntryResult {
    #[prost(message, tag = "13")]
    Empty(Empty),
    #[prost(bytes = "bytes", tag = "14")]
    Value(Bytes),
    #[prost(message, tag = "15")]
    Failure(Failure),
}

#[derive(Clone, PartialEq, Message)]
pub struct StateKeys {
    #[prost(bytes = "bytes", repeated, tag = "1")]
    pub keys: Vec<Bytes>,
}

#[derive(Clone, PartialEq, prost::Oneof)]
pub enum StateKeysResult {
    #[prost(message, tag = "14")]
    Value(StateKeys),
    #[prost(message, tag = "15")]
    Failure(Failure),
}

/// How a promise is being completed.
#[derive(Clone, PartialEq, prost::Oneof)]
pub enum PromiseCompletion {
    #[prost(bytes = "bytes", tag = "2")]
    Value(Bytes),
    #[prost(message, tag = "3")]
    Failure(Failure),
}

// ============================================================================
// Control messages
// ============================================================================

#[derive(Clone, PartialEq, Message)]
pub struct StateEntry {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "2")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct StartMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub id: Bytes,
    #[prost(string, tag = "2")]
    pub debug_id: String,
    /// Number of journal entries that follow this message
    #[prost(uint32, tag = "3")]
    pub known_entries: u32,
    #[prost(message, repeated, tag = "4")]
    pub state_map: Vec<StateEntry>,
    /// When set, `state_map` may be missing keys that do exist
    #[prost(bool, tag = "5")]
    pub partial_state: bool,
    #[prost(string, tag = "6")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompletionMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SuspensionMessage {
    #[prost(uint32, repeated, tag = "1")]
    pub entry_indexes: Vec<u32>,
}

#[derive(Clone, PartialEq, Message)]
pub struct ErrorMessage {
    #[prost(uint32, tag = "1")]
    pub code: u32,
    #[prost(string, tag = "2")]
    pub message: String,
    #[prost(string, tag = "3")]
    pub description: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct EntryAckMessage {
    #[prost(uint32, tag = "1")]
    pub entry_index: u32,
}

#[derive(Clone, PartialEq, Message)]
pub struct EndMessage {}

// ============================================================================
// Journal entries
// ============================================================================

/// A protobuf message that is recorded as a journal entry.
pub trait EntryMessage: Message + Default {
    const TYPE: MessageType;
}

macro_rules! entry_messages {
    ($($name:ident => $ty:ident),* $(,)?) => {
        $(
            impl EntryMessage for $name {
                const TYPE: MessageType = MessageType::$ty;
            }
        )*
    };
}

#[derive(Clone, PartialEq, Message)]
pub struct InputEntryMessage {
    #[prost(bytes = "bytes", tag = "14")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct OutputEntryMessage {
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SetStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
    #[prost(bytes = "bytes", tag = "3")]
    pub value: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClearStateEntryMessage {
    #[prost(bytes = "bytes", tag = "1")]
    pub key: Bytes,
}

#[derive(Clone, PartialEq, Message)]
pub struct ClearAllStateEntryMessage {}

#[derive(Clone, PartialEq, Message)]
pub struct GetStateKeysEntryMessage {
    #[prost(oneof = "StateKeysResult", tags = "14, 15")]
    pub result: Option<StateKeysResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct GetPromiseEntryMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct PeekPromiseEntryMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompletePromiseEntryMessage {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(oneof = "PromiseCompletion", tags = "2, 3")]
    pub completion: Option<PromiseCompletion>,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct SleepEntryMessage {
    /// Wake up time in milliseconds since the unix epoch
    #[prost(uint64, tag = "1")]
    pub wake_up_time: u64,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CallEntryMessage {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub handler_name: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub parameter: Bytes,
    #[prost(string, tag = "5")]
    pub key: String,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct OneWayCallEntryMessage {
    #[prost(string, tag = "1")]
    pub service_name: String,
    #[prost(string, tag = "2")]
    pub handler_name: String,
    #[prost(bytes = "bytes", tag = "3")]
    pub parameter: Bytes,
    /// Milliseconds since the unix epoch, 0 for immediate delivery
    #[prost(uint64, tag = "4")]
    pub invoke_time: u64,
    #[prost(string, tag = "5")]
    pub key: String,
}

#[derive(Clone, PartialEq, Message)]
pub struct AwakeableEntryMessage {
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct CompleteAwakeableEntryMessage {
    #[prost(string, tag = "1")]
    pub id: String,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

#[derive(Clone, PartialEq, Message)]
pub struct RunEntryMessage {
    #[prost(string, tag = "12")]
    pub name: String,
    #[prost(oneof = "EntryResult", tags = "13, 14, 15")]
    pub result: Option<EntryResult>,
}

entry_messages! {
    InputEntryMessage => InputEntry,
    OutputEntryMessage => OutputEntry,
    GetStateEntryMessage => GetStateEntry,
    SetStateEntryMessage => SetStateEntry,
    ClearStateEntryMessage => ClearStateEntry,
    ClearAllStateEntryMessage => ClearAllStateEntry,
    GetStateKeysEntryMessage => GetStateKeysEntry,
    GetPromiseEntryMessage => GetPromiseEntry,
    PeekPromiseEntryMessage => PeekPromiseEntry,
    CompletePromiseEntryMessage => CompletePromiseEntry,
    SleepEntryMessage => SleepEntry,
    CallEntryMessage => CallEntry,
    OneWayCallEntryMessage => OneWayCallEntry,
    AwakeableEntryMessage => AwakeableEntry,
    CompleteAwakeableEntryMessage => CompleteAwakeableEntry,
    RunEntryMessage => RunEntry,
}

/// A journal entry whose payload has not been decoded yet.
///
/// Entries read from the wire keep their pooled buffer alive through the
/// payload [`Bytes`] until the entry (and anything sliced from it) is gone.
#[derive(Debug, Clone, PartialEq)]
pub struct RawEntry {
    header: MessageHeader,
    payload: Bytes,
}

impl RawEntry {
    pub fn new<M: EntryMessage>(flags: MessageFlags, message: &M) -> Self {
        let payload = Bytes::from(message.encode_to_vec());
        Self {
            header: MessageHeader::with_flags(M::TYPE, flags, payload.len() as u32),
            payload,
        }
    }

    pub fn message_type(&self) -> MessageType {
        self.header.message_type()
    }

    pub fn header(&self) -> MessageHeader {
        self.header
    }

    pub fn is_completed(&self) -> bool {
        self.header.is_completed()
    }

    pub fn requires_ack(&self) -> bool {
        self.header.requires_ack()
    }

    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Decode the payload. The caller is responsible for checking the type.
    pub fn decode<M: EntryMessage>(&self) -> Result<M, prost::DecodeError> {
        M::decode(self.payload.clone())
    }
}

// ============================================================================
// Protocol message
// ============================================================================

/// Any message of the invocation protocol.
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolMessage {
    Start(StartMessage),
    Completion(CompletionMessage),
    Suspension(SuspensionMessage),
    Error(ErrorMessage),
    EntryAck(EntryAckMessage),
    End(EndMessage),
    Entry(RawEntry),
}

impl ProtocolMessage {
    pub fn entry<M: EntryMessage>(flags: MessageFlags, message: &M) -> Self {
        ProtocolMessage::Entry(RawEntry::new(flags, message))
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            ProtocolMessage::Start(_) => MessageType::Start,
            ProtocolMessage::Completion(_) => MessageType::Completion,
            ProtocolMessage::Suspension(_) => MessageType::Suspension,
            ProtocolMessage::Error(_) => MessageType::Error,
            ProtocolMessage::EntryAck(_) => MessageType::EntryAck,
            ProtocolMessage::End(_) => MessageType::End,
            ProtocolMessage::Entry(entry) => entry.message_type(),
        }
    }

    /// After one of these nothing else is sent for the invocation.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ProtocolMessage::Suspension(_) | ProtocolMessage::Error(_) | ProtocolMessage::End(_)
        )
    }

    /// Decode a message read off the wire.
    ///
    /// Control payloads are parsed and their buffer goes back to the pool.
    /// Entry payloads are detached without copying.
    pub fn decode(mut raw: RawMessage) -> Result<Self, FrameError> {
        let header = raw.header();
        Ok(match header.message_type() {
            MessageType::Start => ProtocolMessage::Start(raw.decode()?),
            MessageType::Completion => ProtocolMessage::Completion(raw.decode()?),
            MessageType::Suspension => ProtocolMessage::Suspension(raw.decode()?),
            MessageType::Error => ProtocolMessage::Error(raw.decode()?),
            MessageType::EntryAck => ProtocolMessage::EntryAck(raw.decode()?),
            MessageType::End => ProtocolMessage::End(raw.decode()?),
            _ => {
                let payload = raw
                    .detach_payload()
                    .map(|buf| buf.into_bytes())
                    .unwrap_or_default();
                ProtocolMessage::Entry(RawEntry { header, payload })
            }
        })
    }

    /// Encode header and payload into their wire form.
    pub fn encode(&self) -> Bytes {
        match self {
            ProtocolMessage::Start(m) => encode_control(MessageType::Start, m),
            ProtocolMessage::Completion(m) => encode_control(MessageType::Completion, m),
            ProtocolMessage::Suspension(m) => encode_control(MessageType::Suspension, m),
            ProtocolMessage::Error(m) => encode_control(MessageType::Error, m),
            ProtocolMessage::EntryAck(m) => encode_control(MessageType::EntryAck, m),
            ProtocolMessage::End(m) => encode_control(MessageType::End, m),
            ProtocolMessage::Entry(entry) => encode_frame(entry.header, &entry.payload),
        }
    }
}

fn encode_control<M: Message>(message_type: MessageType, message: &M) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + message.encoded_len());
    buf.put_u64(MessageHeader::new(message_type, message.encoded_len() as u32).encode());
    // BytesMut grows on demand, encoding cannot run out of space
    let _ = message.encode(&mut buf);
    buf.freeze()
}

fn encode_frame(header: MessageHeader, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(HEADER_SIZE + payload.len());
    buf.put_u64(header.encode());
    buf.put_slice(payload);
    buf.freeze()
}

impl From<StartMessage> for ProtocolMessage {
    fn from(m: StartMessage) -> Self {
        ProtocolMessage::Start(m)
    }
}

impl From<CompletionMessage> for ProtocolMessage {
    fn from(m: CompletionMessage) -> Self {
        ProtocolMessage::Completion(m)
    }
}

impl From<EntryAckMessage> for ProtocolMessage {
    fn from(m: EntryAckMessage) -> Self {
        ProtocolMessage::EntryAck(m)
    }
}

impl From<RawEntry> for ProtocolMessage {
    fn from(entry: RawEntry) -> Self {
        ProtocolMessage::Entry(entry)
    }
}
