// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Common test infrastructure for keel-sdk end-to-end tests.
//!
//! Provides a scripted orchestrator that drives an [`Endpoint`] over an
//! in-memory duplex stream.

#![allow(dead_code)]

use std::time::Duration;

use bytes::Bytes;
use keel_sdk::protocol::messages::{
    CompletionMessage, EntryAckMessage, EntryResult, InputEntryMessage, StartMessage, StateEntry,
};
use keel_sdk::protocol::{
    BufferPool, EntryMessage, FrameConfig, FramedStream, MessageFlags, ProtocolMessage, RawEntry,
};
use keel_sdk::{Endpoint, InvocationEnd};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::DuplexStream;
use tokio::task::JoinHandle;

/// How long a test waits for a message before failing.
pub const RECV_TIMEOUT: Duration = Duration::from_secs(5);

/// Window in which a blocked invocation must stay silent.
pub const QUIET_PERIOD: Duration = Duration::from_millis(150);

pub fn json<T: Serialize>(value: &T) -> Bytes {
    Bytes::from(serde_json::to_vec(value).unwrap())
}

pub fn from_json<T: DeserializeOwned>(bytes: &[u8]) -> T {
    serde_json::from_slice(bytes).unwrap()
}

pub fn value_result<T: Serialize>(value: &T) -> EntryResult {
    EntryResult::Value(json(value))
}

/// Builds the `Start` message and replay prefix of one invocation.
pub struct InvocationBuilder {
    id: Bytes,
    key: String,
    input: Bytes,
    recorded: Vec<RawEntry>,
    state: Vec<StateEntry>,
    partial_state: bool,
}

impl InvocationBuilder {
    pub fn new(id: &str) -> Self {
        Self {
            id: Bytes::copy_from_slice(id.as_bytes()),
            key: String::new(),
            input: Bytes::from_static(b"null"),
            recorded: Vec::new(),
            state: Vec::new(),
            partial_state: false,
        }
    }

    pub fn key(mut self, key: &str) -> Self {
        self.key = key.to_string();
        self
    }

    pub fn input<T: Serialize>(mut self, value: &T) -> Self {
        self.input = json(value);
        self
    }

    /// Append a recorded entry after the input entry.
    pub fn recorded<M: EntryMessage>(mut self, flags: MessageFlags, message: &M) -> Self {
        self.recorded.push(RawEntry::new(flags, message));
        self
    }

    pub fn state<T: Serialize>(mut self, key: &str, value: &T) -> Self {
        self.state.push(StateEntry {
            key: Bytes::copy_from_slice(key.as_bytes()),
            value: json(value),
        });
        self
    }

    pub fn partial_state(mut self) -> Self {
        self.partial_state = true;
        self
    }

    /// Serve the invocation on `endpoint` and write its preamble.
    pub async fn start(
        self,
        endpoint: &Endpoint,
        service: &'static str,
        handler: &'static str,
    ) -> TestOrchestrator {
        let (sdk_side, orchestrator_side) = tokio::io::duplex(256 * 1024);
        let endpoint = endpoint.clone();
        let task = tokio::spawn(async move { endpoint.handle(service, handler, sdk_side).await });

        let mut stream =
            FramedStream::new(orchestrator_side, BufferPool::default(), FrameConfig::default());

        let mut entries = vec![RawEntry::new(
            MessageFlags::empty(),
            &InputEntryMessage { value: self.input },
        )];
        entries.extend(self.recorded);

        stream
            .write_message(&ProtocolMessage::Start(StartMessage {
                id: self.id,
                debug_id: "test".to_string(),
                known_entries: entries.len() as u32,
                state_map: self.state,
                partial_state: self.partial_state,
                key: self.key,
            }))
            .await
            .unwrap();
        for entry in entries {
            stream.write_message(&ProtocolMessage::Entry(entry)).await.unwrap();
        }

        TestOrchestrator { stream, task }
    }
}

/// The orchestrator side of one invocation.
pub struct TestOrchestrator {
    stream: FramedStream<DuplexStream>,
    task: JoinHandle<keel_sdk::Result<InvocationEnd>>,
}

impl TestOrchestrator {
    pub async fn recv(&mut self) -> ProtocolMessage {
        tokio::time::timeout(RECV_TIMEOUT, self.stream.read_message())
            .await
            .expect("timed out waiting for a message")
            .expect("failed to read message")
    }

    /// Receive the next message, which must be an entry of type `M`.
    pub async fn recv_entry<M: EntryMessage>(&mut self) -> (RawEntry, M) {
        match self.recv().await {
            ProtocolMessage::Entry(entry) => {
                assert_eq!(entry.message_type(), M::TYPE, "unexpected entry type");
                let message = entry.decode::<M>().unwrap();
                (entry, message)
            }
            other => panic!("Expected {} entry, got {:?}", M::TYPE, other),
        }
    }

    /// Assert that nothing arrives for a while.
    pub async fn expect_silence(&mut self) {
        if let Ok(message) = tokio::time::timeout(QUIET_PERIOD, self.stream.read_message()).await {
            panic!("Expected no message, got {:?}", message);
        }
    }

    pub async fn send(&mut self, message: ProtocolMessage) {
        self.stream.write_message(&message).await.unwrap();
    }

    pub async fn complete(&mut self, entry_index: u32, result: EntryResult) {
        self.send(ProtocolMessage::Completion(CompletionMessage {
            entry_index,
            result: Some(result),
        }))
        .await;
    }

    pub async fn ack(&mut self, entry_index: u32) {
        self.send(ProtocolMessage::EntryAck(EntryAckMessage { entry_index }))
            .await;
    }

    /// Close the orchestrator's sending side; the endpoint reads EOF.
    pub async fn close_input(&mut self) {
        self.stream.close().await.unwrap();
    }

    /// Wait for the endpoint to finish serving the invocation.
    pub async fn finish(self) -> InvocationEnd {
        tokio::time::timeout(RECV_TIMEOUT, self.task)
            .await
            .expect("timed out waiting for the invocation to end")
            .expect("endpoint task panicked")
            .expect("endpoint failed")
    }
}
