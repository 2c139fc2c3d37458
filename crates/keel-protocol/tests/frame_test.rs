// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Framing and buffer lifecycle tests for keel-protocol.

use bytes::Bytes;
use keel_protocol::messages::{
    CompletionMessage, EntryResult, GetStateEntryMessage, InputEntryMessage, RunEntryMessage,
    StartMessage, StateEntry,
};
use keel_protocol::{
    BufferPool, FrameConfig, FramedStream, MessageFlags, MessageType, ProtocolMessage, RawEntry,
    read_message, write_message,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::io::{AsyncWriteExt, duplex};

fn start(known_entries: u32) -> ProtocolMessage {
    ProtocolMessage::Start(StartMessage {
        id: Bytes::from_static(b"inv-1"),
        debug_id: "inv-1".to_string(),
        known_entries,
        state_map: vec![StateEntry {
            key: Bytes::from_static(b"count"),
            value: Bytes::from_static(b"5"),
        }],
        partial_state: false,
        key: "counter-a".to_string(),
    })
}

// ============================================================================
// Stream decoding
// ============================================================================

#[tokio::test]
async fn test_replay_prefix_read_in_order() {
    let (client, server) = duplex(4096);
    let mut orchestrator = FramedStream::new(client, BufferPool::default(), FrameConfig::default());
    let mut endpoint = FramedStream::new(server, BufferPool::new(8), FrameConfig::default());

    orchestrator.write_message(&start(2)).await.unwrap();
    orchestrator
        .write_message(&ProtocolMessage::entry(
            MessageFlags::empty(),
            &InputEntryMessage {
                value: Bytes::from_static(b"1"),
            },
        ))
        .await
        .unwrap();
    orchestrator
        .write_message(&ProtocolMessage::entry(
            MessageFlags::COMPLETED,
            &GetStateEntryMessage {
                key: Bytes::from_static(b"count"),
                result: Some(EntryResult::Value(Bytes::from_static(b"5"))),
            },
        ))
        .await
        .unwrap();
    orchestrator.close().await.unwrap();

    let ProtocolMessage::Start(start) = endpoint.read_message().await.unwrap() else {
        panic!("Expected start message");
    };
    assert_eq!(start.known_entries, 2);
    assert_eq!(start.key, "counter-a");

    let mut entries = Vec::new();
    for _ in 0..start.known_entries {
        match endpoint.read_message().await.unwrap() {
            ProtocolMessage::Entry(entry) => entries.push(entry),
            other => panic!("Expected entry, got {:?}", other),
        }
    }
    assert_eq!(entries[0].message_type(), MessageType::InputEntry);
    assert_eq!(entries[1].message_type(), MessageType::GetStateEntry);
    assert!(entries[1].is_completed());

    // Entry payloads still hold their pooled buffers
    assert_eq!(endpoint.pool().stats().outstanding(), 2);
    let get: GetStateEntryMessage = entries[1].decode().unwrap();
    drop(entries);
    assert_eq!(get.result, Some(EntryResult::Value(Bytes::from_static(b"5"))));
    // The decoded value may still slice the second buffer
    assert!(endpoint.pool().stats().outstanding() <= 1);
    drop(get);
    assert_eq!(endpoint.pool().stats().outstanding(), 0);
}

#[tokio::test]
async fn test_header_flags_survive_the_wire() {
    let (mut writer, mut reader) = duplex(1024);
    let pool = BufferPool::default();

    let run = RawEntry::new(
        MessageFlags::REQUIRES_ACK,
        &RunEntryMessage {
            name: "charge".to_string(),
            result: Some(EntryResult::Value(Bytes::from_static(b"\"X\""))),
        },
    );
    write_message(&mut writer, &ProtocolMessage::Entry(run.clone()))
        .await
        .unwrap();

    let raw = read_message(&mut reader, &pool, &FrameConfig::default())
        .await
        .unwrap();
    assert!(raw.header().requires_ack());
    let ProtocolMessage::Entry(decoded) = ProtocolMessage::decode(raw).unwrap() else {
        panic!("Expected entry");
    };
    assert_eq!(decoded, run);
}

#[tokio::test]
async fn test_corrupt_frame_after_valid_ones() {
    let (mut writer, mut reader) = duplex(1024);
    let pool = BufferPool::default();

    write_message(
        &mut writer,
        &ProtocolMessage::Completion(CompletionMessage {
            entry_index: 1,
            result: None,
        }),
    )
    .await
    .unwrap();
    writer.write_all(&[0xff; 8]).await.unwrap();

    let config = FrameConfig::default();
    assert!(read_message(&mut reader, &pool, &config).await.is_ok());
    assert!(read_message(&mut reader, &pool, &config).await.is_err());
}

// ============================================================================
// Buffer lifecycle
// ============================================================================

/// Every pooled buffer is released exactly once whichever way its owner
/// disposes of it.
#[tokio::test]
async fn test_buffer_lifecycle_under_random_disposal() {
    let mut rng = StdRng::seed_from_u64(0x6b65_656c);
    let pool = BufferPool::new(4);
    let config = FrameConfig::default();

    for round in 0..50 {
        let (mut writer, mut reader) = duplex(64 * 1024);
        let count = rng.gen_range(1..20);
        for i in 0..count {
            let len = rng.gen_range(1..512);
            let value = Bytes::from(vec![(i % 251) as u8; len]);
            write_message(
                &mut writer,
                &ProtocolMessage::entry(
                    MessageFlags::empty(),
                    &RunEntryMessage {
                        name: format!("step-{round}-{i}"),
                        result: Some(EntryResult::Value(value)),
                    },
                ),
            )
            .await
            .unwrap();
        }
        drop(writer);

        let mut held_messages = Vec::new();
        let mut held_bytes = Vec::new();
        for _ in 0..count {
            let mut raw = read_message(&mut reader, &pool, &config).await.unwrap();
            match rng.gen_range(0..4) {
                0 => drop(raw),
                1 => held_messages.push(raw),
                2 => {
                    let buf = raw.detach_payload().unwrap();
                    drop(raw);
                    drop(buf);
                }
                _ => {
                    let bytes = raw.detach_payload().unwrap().into_bytes();
                    let half = bytes.slice(..bytes.len() / 2);
                    held_bytes.push(bytes);
                    held_bytes.push(half);
                    held_messages.push(raw);
                }
            }
        }

        // Interleave the remaining releases
        while !held_messages.is_empty() || !held_bytes.is_empty() {
            if rng.gen_bool(0.5) && !held_messages.is_empty() {
                let idx = rng.gen_range(0..held_messages.len());
                held_messages.swap_remove(idx);
            } else if !held_bytes.is_empty() {
                let idx = rng.gen_range(0..held_bytes.len());
                held_bytes.swap_remove(idx);
            } else {
                held_messages.clear();
            }
        }

        let stats = pool.stats();
        assert_eq!(stats.rented, stats.returned, "round {round}: {stats:?}");
        assert!(pool.idle() <= 4);
    }

    assert!(pool.stats().allocated < pool.stats().rented);
}
