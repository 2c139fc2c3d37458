// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-invocation state machine.
//!
//! [`InvocationCore`] owns the journal, the local state cache and the
//! completion table of one invocation. Every context operation goes through
//! it: the operation takes the next journal index under the state lock and
//! either replays the recorded entry or emits a new one. A side effect keeps
//! its index from issue until its closure finishes; entries issued after it
//! are held back until it is written, so wire order always matches index
//! order even when handlers join several operations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::task::Poll;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use bytes::Bytes;
use keel_protocol::messages::{
    AwakeableEntryMessage, CallEntryMessage, ClearAllStateEntryMessage, ClearStateEntryMessage,
    CompleteAwakeableEntryMessage, CompletePromiseEntryMessage, Empty, EndMessage, EntryResult,
    ErrorMessage, GetPromiseEntryMessage, GetStateEntryMessage, GetStateKeysEntryMessage,
    InputEntryMessage, OneWayCallEntryMessage, OutputEntryMessage, PeekPromiseEntryMessage,
    PromiseCompletion, RunEntryMessage, SetStateEntryMessage, SleepEntryMessage, StateEntry,
    StateKeys, StateKeysResult, SuspensionMessage,
};
use keel_protocol::{EntryMessage, MessageFlags, MessageType, ProtocolMessage};
use parking_lot::{Mutex, MutexGuard};
use prost::Message;
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};

use crate::completion::{CompletionResult, CompletionTable, Waitable};
use crate::error::{BoxError, Result, SdkError, TerminalError};
use crate::journal::{Journal, Step, verify_identity};
use crate::types::{EntryIndex, InvocationId, InvocationTarget, RetryPolicy};

/// Prefix of awakeable ids handed to external systems.
const AWAKEABLE_ID_PREFIX: &str = "prom_1";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum CloseReason {
    Finished,
    Suspended,
    Cancelled,
}

impl CloseReason {
    fn error(self) -> SdkError {
        match self {
            CloseReason::Suspended => SdkError::Suspended,
            CloseReason::Finished | CloseReason::Cancelled => SdkError::Cancelled,
        }
    }
}

/// Marks the handler as blocked on one index while it exists.
struct Blocked<'a> {
    core: &'a InvocationCore,
    index: EntryIndex,
}

impl<'a> Blocked<'a> {
    fn new(core: &'a InvocationCore, index: EntryIndex) -> Self {
        core.state.lock().blocked.insert(index);
        core.progress.notify_one();
        Self { core, index }
    }
}

impl Drop for Blocked<'_> {
    fn drop(&mut self) {
        self.core.state.lock().blocked.remove(&self.index);
    }
}

/// Journal index reserved for a side effect whose closure is still running.
///
/// Dropped before its outcome was recorded (the handler stopped polling
/// the `run`), it records a failure so later entries are not held forever.
struct ReservedRun<'a> {
    core: &'a InvocationCore,
    index: EntryIndex,
    name: &'a str,
    recorded: bool,
}

impl ReservedRun<'_> {
    /// Queue the run's entry and register for its acknowledgement.
    fn record(&mut self, outcome: &std::result::Result<Bytes, TerminalError>) -> Result<Waitable> {
        self.recorded = true;
        let mut state = self.core.lock_open()?;
        debug!(entry_index = self.index, name = self.name, "Recording side effect result");
        let result = match outcome {
            Ok(value) => EntryResult::Value(value.clone()),
            Err(err) => EntryResult::Failure(err.clone().into()),
        };
        self.core.emit(
            &mut state,
            self.index,
            MessageFlags::REQUIRES_ACK,
            &RunEntryMessage {
                name: self.name.to_string(),
                result: Some(result),
            },
        )?;
        self.core.completions.register(self.index)
    }
}

impl Drop for ReservedRun<'_> {
    fn drop(&mut self) {
        if self.recorded {
            return;
        }
        warn!(entry_index = self.index, name = self.name, "Side effect abandoned before it finished");
        let abandoned = Err(TerminalError::new(format!(
            "side effect '{}' was abandoned before it finished",
            self.name
        )));
        // Closed invocations write nothing more
        let _ = self.record(&abandoned);
    }
}

/// Last known state of a keyed target.
///
/// `None` values are keys known to be absent. With partial state, keys
/// missing from the map are unknown and must be fetched.
#[derive(Debug)]
struct StateCache {
    values: HashMap<String, Option<Bytes>>,
    partial: bool,
}

impl StateCache {
    fn new(entries: &[StateEntry], partial: bool) -> Self {
        let values = entries
            .iter()
            .map(|entry| {
                (
                    String::from_utf8_lossy(&entry.key).into_owned(),
                    Some(entry.value.clone()),
                )
            })
            .collect();
        Self { values, partial }
    }

    /// `None` when the value is not known locally.
    fn get(&self, key: &str) -> Option<Option<Bytes>> {
        match self.values.get(key) {
            Some(value) => Some(value.clone()),
            None if self.partial => None,
            None => Some(None),
        }
    }

    fn set(&mut self, key: &str, value: Bytes) {
        self.values.insert(key.to_string(), Some(value));
    }

    fn clear(&mut self, key: &str) {
        self.values.insert(key.to_string(), None);
    }

    fn clear_all(&mut self) {
        self.values.clear();
        self.partial = false;
    }

    fn keys(&self) -> Option<Vec<String>> {
        if self.partial {
            return None;
        }
        let mut keys: Vec<String> = self
            .values
            .iter()
            .filter(|(_, value)| value.is_some())
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        Some(keys)
    }
}

struct CoreState {
    journal: Journal,
    cache: StateCache,
    closed: Option<CloseReason>,
    /// Next live index to hand to the writer
    unsent: EntryIndex,
    /// Live entries finished ahead of an earlier, still reserved index
    held: BTreeMap<EntryIndex, ProtocolMessage>,
    /// Indexes the handler is blocked on right now
    blocked: BTreeSet<EntryIndex>,
}

impl CoreState {
    /// Whether an index was handed out whose entry was not written yet.
    fn has_reserved(&self) -> bool {
        self.journal.next_index() > self.unsent
    }
}

/// The journal-backed engine behind every handler context.
pub struct InvocationCore {
    id: InvocationId,
    key: Option<String>,
    state: Mutex<CoreState>,
    completions: CompletionTable,
    outbound: mpsc::UnboundedSender<ProtocolMessage>,
    progress: Notify,
}

impl InvocationCore {
    pub(crate) fn new(
        id: InvocationId,
        key: Option<String>,
        journal: Journal,
        state_map: &[StateEntry],
        partial_state: bool,
        outbound: mpsc::UnboundedSender<ProtocolMessage>,
    ) -> Self {
        Self {
            id,
            key,
            state: Mutex::new(CoreState {
                unsent: journal.known_entries(),
                journal,
                cache: StateCache::new(state_map, partial_state),
                closed: None,
                held: BTreeMap::new(),
                blocked: BTreeSet::new(),
            }),
            completions: CompletionTable::new(),
            outbound,
            progress: Notify::new(),
        }
    }

    pub fn invocation_id(&self) -> &InvocationId {
        &self.id
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub fn is_replaying(&self) -> bool {
        self.state.lock().journal.is_replaying()
    }

    pub(crate) fn completions(&self) -> &CompletionTable {
        &self.completions
    }

    /// Resolves after the handler blocked on a completion or an entry was
    /// written since the previous call.
    pub(crate) async fn progress(&self) {
        self.progress.notified().await;
    }

    fn lock_open(&self) -> Result<MutexGuard<'_, CoreState>> {
        let state = self.state.lock();
        match state.closed {
            Some(reason) => Err(reason.error()),
            None => Ok(state),
        }
    }

    fn step(&self, state: &mut CoreState, expected: MessageType) -> Result<(EntryIndex, Step)> {
        let (index, step) = state.journal.step(expected)?;
        match step {
            Step::Replay(_) => debug!(entry_index = index, entry_type = %expected, "Replaying entry"),
            Step::Live => debug!(entry_index = index, entry_type = %expected, "Appending entry"),
        }
        Ok((index, step))
    }

    /// Queue the live entry at `index`. Entries reach the writer in index
    /// order; one that finished early waits for the indexes before it.
    fn emit<M: EntryMessage>(
        &self,
        state: &mut CoreState,
        index: EntryIndex,
        flags: MessageFlags,
        message: &M,
    ) -> Result<()> {
        let message = ProtocolMessage::entry(flags, message);
        if index != state.unsent {
            debug!(entry_index = index, unsent = state.unsent, "Holding entry");
            state.held.insert(index, message);
            return Ok(());
        }
        self.send_message(message)?;
        state.unsent += 1;
        while let Some(next) = state.held.remove(&state.unsent) {
            self.send_message(next)?;
            state.unsent += 1;
        }
        self.progress.notify_one();
        Ok(())
    }

    fn send_message(&self, message: ProtocolMessage) -> Result<()> {
        self.outbound
            .send(message)
            .map_err(|_| SdkError::Cancelled)
    }

    /// Recorded result of a replayed entry, or a registration for its
    /// completion when it was recorded before being completed.
    fn recorded(&self, index: EntryIndex, result: Option<EntryResult>) -> Result<Waitable> {
        match result {
            Some(result) => Ok(Waitable::ready(index, CompletionResult::from(Some(result)))),
            None => self.completions.register(index),
        }
    }

    /// Await a completion, reporting why the invocation closed if it did.
    pub(crate) async fn wait(&self, mut waitable: Waitable) -> Result<CompletionResult> {
        let result = match futures::poll!(&mut waitable) {
            Poll::Ready(result) => result,
            Poll::Pending => {
                let _blocked = Blocked::new(self, waitable.index());
                (&mut waitable).await
            }
        };
        match result {
            Err(SdkError::Cancelled) => {
                Err(self.state.lock().closed.map_or(SdkError::Cancelled, CloseReason::error))
            }
            other => other,
        }
    }

    // ========================================================================
    // Input / output
    // ========================================================================

    /// Consume the input entry at index 0.
    pub(crate) fn take_input(&self) -> Result<Bytes> {
        let mut state = self.lock_open()?;
        match self.step(&mut state, MessageType::InputEntry)? {
            (_, Step::Replay(entry)) => Ok(entry.decode::<InputEntryMessage>()?.value),
            (_, Step::Live) => Err(SdkError::ProtocolViolation(
                "journal does not start with an input entry".to_string(),
            )),
        }
    }

    /// Record the handler's final outcome and end the invocation.
    pub(crate) fn write_output(&self, outcome: std::result::Result<Bytes, TerminalError>) -> Result<()> {
        let mut state = self.lock_open()?;
        if let (index, Step::Live) = self.step(&mut state, MessageType::OutputEntry)? {
            let result = match outcome {
                Ok(value) => EntryResult::Value(value),
                Err(err) => EntryResult::Failure(err.into()),
            };
            self.emit(
                &mut state,
                index,
                MessageFlags::empty(),
                &OutputEntryMessage {
                    result: Some(result),
                },
            )?;
        }
        if state.has_reserved() {
            return Err(SdkError::Internal(
                "output recorded while earlier entries are unwritten".to_string(),
            ));
        }
        self.send_message(ProtocolMessage::End(EndMessage {}))?;
        state.closed = Some(CloseReason::Finished);
        self.completions.cancel_all();
        Ok(())
    }

    /// Report a retryable failure and close. Returns `false` when the
    /// invocation was already closed.
    pub(crate) fn abort(&self, err: &SdkError) -> bool {
        let mut state = self.state.lock();
        if state.closed.is_some() {
            return false;
        }
        state.closed = Some(CloseReason::Cancelled);
        // The writer may already be gone with a broken connection
        let _ = self.outbound.send(ProtocolMessage::Error(ErrorMessage {
            code: u32::from(err.error_code()),
            message: err.to_string(),
            description: String::new(),
        }));
        let cancelled = self.completions.cancel_all();
        debug!(cancelled, "Invocation aborted");
        true
    }

    /// Close without reporting anything, waking every waiter with
    /// [`SdkError::Cancelled`]. Returns the number of waiters woken.
    pub(crate) fn cancel(&self) -> usize {
        let mut state = self.state.lock();
        if state.closed.is_none() {
            state.closed = Some(CloseReason::Cancelled);
        }
        self.completions.cancel_all()
    }

    /// Suspend when the handler is blocked on completions that can no
    /// longer arrive. Returns the entries it is blocked on.
    ///
    /// Registered entries the handler does not await do not count, and
    /// nothing suspends while a side effect still owes its entry.
    pub(crate) fn try_suspend(&self) -> Option<Vec<EntryIndex>> {
        let mut state = self.state.lock();
        if state.closed.is_some() || state.has_reserved() {
            return None;
        }
        let pending: Vec<EntryIndex> = state
            .blocked
            .iter()
            .copied()
            .filter(|index| self.completions.is_pending(*index))
            .collect();
        if pending.is_empty() {
            return None;
        }
        state.closed = Some(CloseReason::Suspended);
        let _ = self
            .outbound
            .send(ProtocolMessage::Suspension(SuspensionMessage {
                entry_indexes: pending.clone(),
            }));
        self.completions.cancel_all();
        Some(pending)
    }

    // ========================================================================
    // State
    // ========================================================================

    pub async fn get_state(&self, key: &str) -> Result<Option<Bytes>> {
        let (waitable, fetched) = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::GetStateEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: GetStateEntryMessage = entry.decode()?;
                    verify_identity(
                        index,
                        MessageType::GetStateEntry,
                        key,
                        &String::from_utf8_lossy(&recorded.key),
                    )?;
                    (self.recorded(index, recorded.result)?, false)
                }
                Step::Live => match state.cache.get(key) {
                    Some(known) => {
                        let result = match &known {
                            Some(value) => EntryResult::Value(value.clone()),
                            None => EntryResult::Empty(Empty {}),
                        };
                        self.emit(
                            &mut state,
                            index,
                            MessageFlags::COMPLETED,
                            &GetStateEntryMessage {
                                key: Bytes::copy_from_slice(key.as_bytes()),
                                result: Some(result.clone()),
                            },
                        )?;
                        (Waitable::ready(index, CompletionResult::from(Some(result))), false)
                    }
                    None => {
                        self.emit(
                            &mut state,
                            index,
                            MessageFlags::empty(),
                            &GetStateEntryMessage {
                                key: Bytes::copy_from_slice(key.as_bytes()),
                                result: None,
                            },
                        )?;
                        (self.completions.register(index)?, true)
                    }
                },
            }
        };

        let value = match self.wait(waitable).await? {
            CompletionResult::Empty => None,
            CompletionResult::Value(value) => Some(value),
            CompletionResult::Failure(err) => return Err(err.into()),
        };
        if fetched {
            let mut state = self.state.lock();
            match &value {
                Some(value) => state.cache.set(key, value.clone()),
                None => state.cache.clear(key),
            }
        }
        Ok(value)
    }

    pub async fn state_keys(&self) -> Result<Vec<String>> {
        let waitable = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::GetStateKeysEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: GetStateKeysEntryMessage = entry.decode()?;
                    match recorded.result {
                        Some(StateKeysResult::Value(keys)) => return Ok(key_names(keys)),
                        Some(StateKeysResult::Failure(failure)) => {
                            return Err(TerminalError::from(failure).into());
                        }
                        None => self.completions.register(index)?,
                    }
                }
                Step::Live => match state.cache.keys() {
                    Some(keys) => {
                        let value = StateKeys {
                            keys: keys
                                .iter()
                                .map(|key| Bytes::copy_from_slice(key.as_bytes()))
                                .collect(),
                        };
                        self.emit(
                            &mut state,
                            index,
                            MessageFlags::COMPLETED,
                            &GetStateKeysEntryMessage {
                                result: Some(StateKeysResult::Value(value)),
                            },
                        )?;
                        return Ok(keys);
                    }
                    None => {
                        self.emit(
                            &mut state,
                            index,
                            MessageFlags::empty(),
                            &GetStateKeysEntryMessage { result: None },
                        )?;
                        self.completions.register(index)?
                    }
                },
            }
        };

        match self.wait(waitable).await? {
            CompletionResult::Empty => Ok(Vec::new()),
            CompletionResult::Value(encoded) => Ok(key_names(StateKeys::decode(encoded)?)),
            CompletionResult::Failure(err) => Err(err.into()),
        }
    }

    pub fn set_state(&self, key: &str, value: Bytes) -> Result<()> {
        let mut state = self.lock_open()?;
        let (index, step) = self.step(&mut state, MessageType::SetStateEntry)?;
        match step {
            Step::Replay(entry) => {
                let recorded: SetStateEntryMessage = entry.decode()?;
                verify_identity(
                    index,
                    MessageType::SetStateEntry,
                    key,
                    &String::from_utf8_lossy(&recorded.key),
                )?;
            }
            Step::Live => self.emit(
                &mut state,
                index,
                MessageFlags::empty(),
                &SetStateEntryMessage {
                    key: Bytes::copy_from_slice(key.as_bytes()),
                    value: value.clone(),
                },
            )?,
        }
        state.cache.set(key, value);
        Ok(())
    }

    pub fn clear_state(&self, key: &str) -> Result<()> {
        let mut state = self.lock_open()?;
        let (index, step) = self.step(&mut state, MessageType::ClearStateEntry)?;
        match step {
            Step::Replay(entry) => {
                let recorded: ClearStateEntryMessage = entry.decode()?;
                verify_identity(
                    index,
                    MessageType::ClearStateEntry,
                    key,
                    &String::from_utf8_lossy(&recorded.key),
                )?;
            }
            Step::Live => self.emit(
                &mut state,
                index,
                MessageFlags::empty(),
                &ClearStateEntryMessage {
                    key: Bytes::copy_from_slice(key.as_bytes()),
                },
            )?,
        }
        state.cache.clear(key);
        Ok(())
    }

    pub fn clear_all_state(&self) -> Result<()> {
        let mut state = self.lock_open()?;
        if let (index, Step::Live) = self.step(&mut state, MessageType::ClearAllStateEntry)? {
            self.emit(&mut state, index, MessageFlags::empty(), &ClearAllStateEntryMessage {})?;
        }
        state.cache.clear_all();
        Ok(())
    }

    // ========================================================================
    // Promises
    // ========================================================================

    pub async fn get_promise(&self, name: &str) -> Result<Bytes> {
        let waitable = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::GetPromiseEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: GetPromiseEntryMessage = entry.decode()?;
                    verify_identity(index, MessageType::GetPromiseEntry, name, &recorded.key)?;
                    self.recorded(index, recorded.result)?
                }
                Step::Live => {
                    self.emit(
                        &mut state,
                        index,
                        MessageFlags::empty(),
                        &GetPromiseEntryMessage {
                            key: name.to_string(),
                            result: None,
                        },
                    )?;
                    self.completions.register(index)?
                }
            }
        };
        value_or_failure(self.wait(waitable).await?)
    }

    pub async fn peek_promise(&self, name: &str) -> Result<Option<Bytes>> {
        let waitable = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::PeekPromiseEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: PeekPromiseEntryMessage = entry.decode()?;
                    verify_identity(index, MessageType::PeekPromiseEntry, name, &recorded.key)?;
                    self.recorded(index, recorded.result)?
                }
                Step::Live => {
                    self.emit(
                        &mut state,
                        index,
                        MessageFlags::empty(),
                        &PeekPromiseEntryMessage {
                            key: name.to_string(),
                            result: None,
                        },
                    )?;
                    self.completions.register(index)?
                }
            }
        };
        match self.wait(waitable).await? {
            CompletionResult::Empty => Ok(None),
            CompletionResult::Value(value) => Ok(Some(value)),
            CompletionResult::Failure(err) => Err(err.into()),
        }
    }

    /// Resolve or reject a promise. Completing an already completed promise
    /// is not an error; the first completion wins.
    pub async fn complete_promise(&self, name: &str, completion: PromiseCompletion) -> Result<()> {
        let waitable = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::CompletePromiseEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: CompletePromiseEntryMessage = entry.decode()?;
                    verify_identity(
                        index,
                        MessageType::CompletePromiseEntry,
                        name,
                        &recorded.key,
                    )?;
                    self.recorded(index, recorded.result)?
                }
                Step::Live => {
                    self.emit(
                        &mut state,
                        index,
                        MessageFlags::empty(),
                        &CompletePromiseEntryMessage {
                            key: name.to_string(),
                            completion: Some(completion),
                            result: None,
                        },
                    )?;
                    self.completions.register(index)?
                }
            }
        };
        if let CompletionResult::Failure(err) = self.wait(waitable).await? {
            debug!(promise = name, code = err.code, "Promise was already completed");
        }
        Ok(())
    }

    // ========================================================================
    // Timers, calls and awakeables
    // ========================================================================

    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        let waitable = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::SleepEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: SleepEntryMessage = entry.decode()?;
                    self.recorded(index, recorded.result)?
                }
                Step::Live => {
                    self.emit(
                        &mut state,
                        index,
                        MessageFlags::empty(),
                        &SleepEntryMessage {
                            wake_up_time: millis_from_now(duration),
                            result: None,
                        },
                    )?;
                    self.completions.register(index)?
                }
            }
        };
        match self.wait(waitable).await? {
            CompletionResult::Failure(err) => Err(err.into()),
            _ => Ok(()),
        }
    }

    pub async fn call(&self, target: &InvocationTarget, parameter: Bytes) -> Result<Bytes> {
        let waitable = {
            let mut state = self.lock_open()?;
            let (index, step) = self.step(&mut state, MessageType::CallEntry)?;
            match step {
                Step::Replay(entry) => {
                    let recorded: CallEntryMessage = entry.decode()?;
                    verify_identity(
                        index,
                        MessageType::CallEntry,
                        &format!("{}/{}", target.service, target.handler),
                        &format!("{}/{}", recorded.service_name, recorded.handler_name),
                    )?;
                    self.recorded(index, recorded.result)?
                }
                Step::Live => {
                    self.emit(
                        &mut state,
                        index,
                        MessageFlags::empty(),
                        &CallEntryMessage {
                            service_name: target.service.clone(),
                            handler_name: target.handler.clone(),
                            parameter,
                            key: target.key.clone().unwrap_or_default(),
                            result: None,
                        },
                    )?;
                    self.completions.register(index)?
                }
            }
        };
        value_or_failure(self.wait(waitable).await?)
    }

    pub fn send(
        &self,
        target: &InvocationTarget,
        parameter: Bytes,
        delay: Option<Duration>,
    ) -> Result<()> {
        let mut state = self.lock_open()?;
        let (index, step) = self.step(&mut state, MessageType::OneWayCallEntry)?;
        match step {
            Step::Replay(entry) => {
                let recorded: OneWayCallEntryMessage = entry.decode()?;
                verify_identity(
                    index,
                    MessageType::OneWayCallEntry,
                    &format!("{}/{}", target.service, target.handler),
                    &format!("{}/{}", recorded.service_name, recorded.handler_name),
                )?;
            }
            Step::Live => self.emit(
                &mut state,
                index,
                MessageFlags::empty(),
                &OneWayCallEntryMessage {
                    service_name: target.service.clone(),
                    handler_name: target.handler.clone(),
                    parameter,
                    invoke_time: delay.map(millis_from_now).unwrap_or(0),
                    key: target.key.clone().unwrap_or_default(),
                },
            )?,
        }
        Ok(())
    }

    /// Create an awakeable. Returns its public id and the registration the
    /// result will arrive on.
    pub fn awakeable(&self) -> Result<(String, Waitable)> {
        let mut state = self.lock_open()?;
        let (index, step) = self.step(&mut state, MessageType::AwakeableEntry)?;
        let waitable = match step {
            Step::Replay(entry) => {
                let recorded: AwakeableEntryMessage = entry.decode()?;
                self.recorded(index, recorded.result)?
            }
            Step::Live => {
                self.emit(
                    &mut state,
                    index,
                    MessageFlags::empty(),
                    &AwakeableEntryMessage { result: None },
                )?;
                self.completions.register(index)?
            }
        };
        Ok((self.awakeable_id(index), waitable))
    }

    pub fn complete_awakeable(&self, id: &str, result: EntryResult) -> Result<()> {
        let mut state = self.lock_open()?;
        let (index, step) = self.step(&mut state, MessageType::CompleteAwakeableEntry)?;
        match step {
            Step::Replay(entry) => {
                let recorded: CompleteAwakeableEntryMessage = entry.decode()?;
                verify_identity(index, MessageType::CompleteAwakeableEntry, id, &recorded.id)?;
            }
            Step::Live => self.emit(
                &mut state,
                index,
                MessageFlags::empty(),
                &CompleteAwakeableEntryMessage {
                    id: id.to_string(),
                    result: Some(result),
                },
            )?,
        }
        Ok(())
    }

    fn awakeable_id(&self, index: EntryIndex) -> String {
        let mut raw = self.id.as_bytes().to_vec();
        raw.extend_from_slice(&index.to_be_bytes());
        format!("{AWAKEABLE_ID_PREFIX}{}", URL_SAFE_NO_PAD.encode(raw))
    }

    // ========================================================================
    // Side effects
    // ========================================================================

    /// Run a side effect at most once per successful journal append.
    ///
    /// The index is taken when the call is issued, like every other
    /// operation. On replay the recorded result is returned and `action` is
    /// not called. Live, `action` is retried per `policy` without touching
    /// the journal; the final success or failure is written as one entry at
    /// the reserved index and the call returns once the orchestrator
    /// acknowledged it.
    pub async fn run<F, Fut>(&self, name: &str, policy: &RetryPolicy, mut action: F) -> Result<Bytes>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = std::result::Result<Bytes, BoxError>>,
    {
        let index = {
            let mut state = self.lock_open()?;
            match self.step(&mut state, MessageType::RunEntry)? {
                (index, Step::Replay(entry)) => {
                    let recorded: RunEntryMessage = entry.decode()?;
                    verify_identity(index, MessageType::RunEntry, name, &recorded.name)?;
                    return match CompletionResult::from(recorded.result) {
                        CompletionResult::Empty => Ok(Bytes::new()),
                        CompletionResult::Value(value) => Ok(value),
                        CompletionResult::Failure(err) => Err(err.into()),
                    };
                }
                (index, Step::Live) => index,
            }
        };

        let mut reserved = ReservedRun {
            core: self,
            index,
            name,
            recorded: false,
        };
        let outcome = execute_with_retry(name, policy, &mut action).await;
        let ack = reserved.record(&outcome)?;
        self.wait(ack).await?;
        outcome.map_err(SdkError::Terminal)
    }
}

async fn execute_with_retry<F, Fut>(
    name: &str,
    policy: &RetryPolicy,
    action: &mut F,
) -> std::result::Result<Bytes, TerminalError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<Bytes, BoxError>>,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let err = match action().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };
        let err = match err.downcast::<TerminalError>() {
            Ok(terminal) => return Err(*terminal),
            Err(err) => err,
        };
        if !policy.allows_retry(attempt) {
            warn!(name, attempts = attempt, error = %err, "Side effect failed, attempts exhausted");
            return Err(TerminalError::new(format!(
                "side effect '{name}' failed after {attempt} attempt(s): {err}"
            )));
        }
        let delay = policy.delay_for_attempt(attempt);
        warn!(
            name,
            attempt,
            error = %err,
            delay_ms = delay.as_millis() as u64,
            "Side effect failed, retrying"
        );
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
    }
}

fn value_or_failure(result: CompletionResult) -> Result<Bytes> {
    match result {
        CompletionResult::Empty => Ok(Bytes::new()),
        CompletionResult::Value(value) => Ok(value),
        CompletionResult::Failure(err) => Err(err.into()),
    }
}

fn key_names(keys: StateKeys) -> Vec<String> {
    keys.keys
        .iter()
        .map(|key| String::from_utf8_lossy(key).into_owned())
        .collect()
}

fn millis_from_now(delay: Duration) -> u64 {
    let now = chrono::Utc::now().timestamp_millis().max(0) as u64;
    now.saturating_add(delay.as_millis() as u64)
}
