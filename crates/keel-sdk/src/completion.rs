// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Completion correlation table.
//!
//! Matches outcomes arriving from the orchestrator with the handler code
//! waiting for them, whichever side shows up first:
//!
//! | slot      | `register`                  | `complete` / `fail`          |
//! |-----------|-----------------------------|------------------------------|
//! | absent    | insert `Waiting`            | insert `Early`               |
//! | `Waiting` | `DuplicateRegistration`     | resolve waiter, remove slot  |
//! | `Early`   | resolved waitable, remove   | ignored (already delivered)  |
//!
//! Each transition happens under the map's per-shard entry lock, so
//! unrelated indexes never contend on a table-wide lock.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::task::{Context, Poll};

use bytes::Bytes;
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use keel_protocol::messages::EntryResult;
use tokio::sync::{Notify, oneshot};
use tracing::{debug, warn};

use crate::error::{Result, SdkError, TerminalError};
use crate::types::EntryIndex;

/// Outcome delivered for one journal entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CompletionResult {
    /// Completed without a value (acks, sleeps, absent state)
    Empty,
    Value(Bytes),
    Failure(TerminalError),
}

impl From<Option<EntryResult>> for CompletionResult {
    fn from(result: Option<EntryResult>) -> Self {
        match result {
            None | Some(EntryResult::Empty(_)) => CompletionResult::Empty,
            Some(EntryResult::Value(value)) => CompletionResult::Value(value),
            Some(EntryResult::Failure(failure)) => CompletionResult::Failure(failure.into()),
        }
    }
}

enum Slot {
    Waiting(oneshot::Sender<CompletionResult>),
    Early(CompletionResult),
}

/// Per-invocation table of pending completions.
///
/// `register` and `cancel_all` are called by the handler side, `complete`
/// and `fail` by the message pump.
#[derive(Default)]
pub struct CompletionTable {
    slots: DashMap<EntryIndex, Slot>,
    /// Indexes ever registered, touched by the handler side only
    registered: DashSet<EntryIndex>,
    /// Indexes ever delivered, touched by the pump only
    delivered: DashSet<EntryIndex>,
    closed: AtomicBool,
    waiter_added: Notify,
}

impl CompletionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register interest in the outcome of `index`.
    ///
    /// Returns an already resolved waitable when the outcome arrived first,
    /// and an already cancelled one once the table is closed.
    pub fn register(&self, index: EntryIndex) -> Result<Waitable> {
        if self.closed.load(Ordering::SeqCst) {
            return Ok(Waitable::cancelled(index));
        }
        if !self.registered.insert(index) {
            return Err(SdkError::DuplicateRegistration(index));
        }

        let waitable = match self.slots.entry(index) {
            Entry::Occupied(occupied) => match occupied.remove() {
                Slot::Early(result) => return Ok(Waitable::ready(index, result)),
                // Unreachable while `registered` guards the index
                Slot::Waiting(_) => return Err(SdkError::DuplicateRegistration(index)),
            },
            Entry::Vacant(vacant) => {
                let (sender, receiver) = oneshot::channel();
                vacant.insert(Slot::Waiting(sender));
                Waitable::pending(index, receiver)
            }
        };

        // cancel_all may have drained the map between the check above and
        // the insert; the sender must not outlive a closed table
        if self.closed.load(Ordering::SeqCst) {
            self.slots.remove(&index);
        } else {
            self.waiter_added.notify_one();
        }
        Ok(waitable)
    }

    /// Deliver the outcome for `index`. Returns `false` when it was ignored
    /// because an outcome was already delivered or the table is closed.
    pub fn complete(&self, index: EntryIndex, result: CompletionResult) -> bool {
        if self.closed.load(Ordering::SeqCst) {
            debug!(entry_index = index, "Completion after close ignored");
            return false;
        }
        if !self.delivered.insert(index) {
            warn!(entry_index = index, "Duplicate completion ignored");
            return false;
        }

        match self.slots.entry(index) {
            Entry::Occupied(occupied) => {
                if let Slot::Waiting(sender) = occupied.remove() {
                    // The waiter may have been dropped, the outcome is still consumed
                    let _ = sender.send(result);
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(Slot::Early(result));
            }
        }
        true
    }

    /// Deliver a terminal failure for `index`.
    pub fn fail(&self, index: EntryIndex, code: u16, message: impl Into<String>) -> bool {
        self.complete(
            index,
            CompletionResult::Failure(TerminalError::with_code(code, message)),
        )
    }

    /// Close the table and cancel every registered waiter.
    ///
    /// Returns the number of waiters cancelled. Later registrations resolve
    /// as cancelled and later deliveries are ignored.
    pub fn cancel_all(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let mut cancelled = 0;
        // Dropping a sender wakes its waiter with a cancellation
        self.slots.retain(|_, slot| {
            if matches!(slot, Slot::Waiting(_)) {
                cancelled += 1;
            }
            false
        });
        self.waiter_added.notify_one();
        cancelled
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Indexes that have a registered waiter and no outcome yet, ascending.
    pub fn pending_indexes(&self) -> Vec<EntryIndex> {
        let mut pending: Vec<EntryIndex> = self
            .slots
            .iter()
            .filter(|slot| matches!(slot.value(), Slot::Waiting(_)))
            .map(|slot| *slot.key())
            .collect();
        pending.sort_unstable();
        pending
    }

    /// Whether `index` has a registered waiter and no outcome yet.
    pub fn is_pending(&self, index: EntryIndex) -> bool {
        self.slots
            .get(&index)
            .is_some_and(|slot| matches!(slot.value(), Slot::Waiting(_)))
    }

    /// Resolves after a waiter was registered (or the table closed) since
    /// the previous call.
    pub async fn waiter_added(&self) {
        self.waiter_added.notified().await;
    }
}

/// The handler side of one registered entry.
#[derive(Debug)]
pub struct Waitable {
    index: EntryIndex,
    receiver: oneshot::Receiver<CompletionResult>,
}

impl Waitable {
    fn pending(index: EntryIndex, receiver: oneshot::Receiver<CompletionResult>) -> Self {
        Self { index, receiver }
    }

    pub(crate) fn ready(index: EntryIndex, result: CompletionResult) -> Self {
        let (sender, receiver) = oneshot::channel();
        let _ = sender.send(result);
        Self { index, receiver }
    }

    fn cancelled(index: EntryIndex) -> Self {
        let (_, receiver) = oneshot::channel();
        Self { index, receiver }
    }

    pub fn index(&self) -> EntryIndex {
        self.index
    }
}

impl Future for Waitable {
    type Output = Result<CompletionResult>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.receiver)
            .poll(cx)
            .map(|result| result.map_err(|_| SdkError::Cancelled))
    }
}
