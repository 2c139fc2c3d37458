// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation journal and replay cursor.
//!
//! The orchestrator sends the recorded prefix of the journal right after
//! `Start`. Every operation the handler issues takes the next index; while
//! the index falls inside the recorded prefix the operation is answered from
//! the recorded entry, afterwards it runs live and its entry is appended.

use std::collections::VecDeque;

use keel_protocol::{MessageType, RawEntry};

use crate::error::{Result, SdkError};
use crate::types::EntryIndex;

/// What to do for the operation at the current index.
#[derive(Debug)]
pub enum Step {
    /// Answer from the recorded entry, do no work
    Replay(RawEntry),
    /// Execute and append a new entry
    Live,
}

#[derive(Debug)]
pub struct Journal {
    known_entries: u32,
    recorded: VecDeque<RawEntry>,
    next_index: EntryIndex,
}

impl Journal {
    /// Build a journal from the replay prefix sent after `Start`.
    pub fn new(recorded: Vec<RawEntry>) -> Self {
        Self {
            known_entries: recorded.len() as u32,
            recorded: recorded.into(),
            next_index: 0,
        }
    }

    pub fn known_entries(&self) -> u32 {
        self.known_entries
    }

    /// Index the next operation will receive.
    pub fn next_index(&self) -> EntryIndex {
        self.next_index
    }

    pub fn is_replaying(&self) -> bool {
        self.next_index < self.known_entries
    }

    /// Take the next index for an operation of type `expected`.
    ///
    /// Fails with [`SdkError::JournalMismatch`] when the recorded entry at
    /// this index has a different type.
    pub fn step(&mut self, expected: MessageType) -> Result<(EntryIndex, Step)> {
        if !self.is_replaying() {
            return Ok((self.append(), Step::Live));
        }
        let index = self.next_index;
        let entry = self.recorded.pop_front().ok_or_else(|| {
            SdkError::Internal(format!("recorded entry {index} missing from journal"))
        })?;
        if entry.message_type() != expected {
            return Err(SdkError::JournalMismatch {
                index,
                expected: expected.to_string(),
                actual: entry.message_type().to_string(),
            });
        }
        self.next_index += 1;
        Ok((index, Step::Replay(entry)))
    }

    fn append(&mut self) -> EntryIndex {
        let index = self.next_index;
        self.next_index += 1;
        index
    }
}

/// Fail with a mismatch unless the recorded and issued identities agree.
pub(crate) fn verify_identity(
    index: EntryIndex,
    entry_type: MessageType,
    expected: &str,
    recorded: &str,
) -> Result<()> {
    if expected == recorded {
        return Ok(());
    }
    Err(SdkError::JournalMismatch {
        index,
        expected: format!("{entry_type}({expected})"),
        actual: format!("{entry_type}({recorded})"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use keel_protocol::MessageFlags;
    use keel_protocol::messages::{InputEntryMessage, SetStateEntryMessage};

    fn recorded() -> Vec<RawEntry> {
        vec![
            RawEntry::new(
                MessageFlags::empty(),
                &InputEntryMessage {
                    value: Bytes::from_static(b"{}"),
                },
            ),
            RawEntry::new(
                MessageFlags::empty(),
                &SetStateEntryMessage {
                    key: Bytes::from_static(b"count"),
                    value: Bytes::from_static(b"1"),
                },
            ),
        ]
    }

    #[test]
    fn test_replay_then_live() {
        let mut journal = Journal::new(recorded());
        assert!(journal.is_replaying());

        let (index, step) = journal.step(MessageType::InputEntry).unwrap();
        assert_eq!(index, 0);
        assert!(matches!(step, Step::Replay(_)));

        let (index, step) = journal.step(MessageType::SetStateEntry).unwrap();
        assert_eq!(index, 1);
        assert!(matches!(step, Step::Replay(_)));
        assert!(!journal.is_replaying());

        let (index, step) = journal.step(MessageType::RunEntry).unwrap();
        assert_eq!(index, 2);
        assert!(matches!(step, Step::Live));
        // Live steps take consecutive indexes whatever the entry type
        let (index, step) = journal.step(MessageType::SleepEntry).unwrap();
        assert_eq!(index, 3);
        assert!(matches!(step, Step::Live));
        assert_eq!(journal.next_index(), 4);
    }

    #[test]
    fn test_type_mismatch() {
        let mut journal = Journal::new(recorded());
        journal.step(MessageType::InputEntry).unwrap();
        match journal.step(MessageType::GetStateEntry) {
            Err(SdkError::JournalMismatch {
                index,
                expected,
                actual,
            }) => {
                assert_eq!(index, 1);
                assert_eq!(expected, "GetStateEntry");
                assert_eq!(actual, "SetStateEntry");
            }
            other => panic!("Expected JournalMismatch, got {:?}", other),
        }
    }

    #[test]
    fn test_identity_mismatch() {
        assert!(verify_identity(1, MessageType::RunEntry, "charge", "charge").is_ok());
        let err = verify_identity(1, MessageType::RunEntry, "charge", "refund").unwrap_err();
        assert_eq!(err.error_code(), 570);
        assert!(err.to_string().contains("RunEntry(charge)"));
    }
}
