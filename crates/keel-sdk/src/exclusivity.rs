// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Per-key admission of keyed handlers.
//!
//! Each `(service, key)` pair owns a fair reader/writer lock: exclusive
//! handlers take the write side, shared handlers the read side. Waiters are
//! admitted in arrival order. Locks are created on first use and dropped
//! once no lease or waiter refers to them.
//!
//! A suspended exclusive invocation either keeps its lease parked under its
//! invocation id until it resumes ([`SuspensionPolicy::HoldLease`]) or gives
//! it up ([`SuspensionPolicy::ReleaseOnSuspend`]).

use std::sync::Arc;

use dashmap::DashMap;
use dashmap::mapref::entry::Entry;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};
use tracing::debug;

use crate::types::{HandlerType, InvocationId, InvocationOutcome};

/// What happens to an exclusive lease when its invocation suspends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SuspensionPolicy {
    /// Keep the key locked until the invocation resumes and finishes
    #[default]
    HoldLease,
    /// Unlock the key while the invocation is suspended
    ReleaseOnSuspend,
}

type ObjectKey = (String, String);

/// Admission decision for a workflow run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunAdmission {
    /// First run for this key, or the same invocation resuming
    Admitted,
    /// Another invocation owns the run
    AlreadyRunning,
    /// The run finished before; here is its outcome
    Completed(InvocationOutcome),
}

#[derive(Debug, Clone)]
enum RunState {
    Running(InvocationId),
    Completed(InvocationOutcome),
}

#[derive(Default)]
struct Inner {
    locks: DashMap<ObjectKey, Arc<RwLock<()>>>,
    parked: DashMap<InvocationId, Lease>,
    runs: DashMap<ObjectKey, RunState>,
}

#[derive(Clone, Default)]
pub struct ExclusivityController {
    inner: Arc<Inner>,
    policy: SuspensionPolicy,
}

enum LeaseGuard {
    Exclusive(#[allow(dead_code)] OwnedRwLockWriteGuard<()>),
    Shared(#[allow(dead_code)] OwnedRwLockReadGuard<()>),
}

/// Admission to run a handler for one key. Dropping it lets the next
/// waiter in.
pub struct Lease {
    key: ObjectKey,
    guard: Option<LeaseGuard>,
    inner: Arc<Inner>,
}

impl Lease {
    pub fn is_exclusive(&self) -> bool {
        matches!(self.guard, Some(LeaseGuard::Exclusive(_)))
    }
}

impl Drop for Lease {
    fn drop(&mut self) {
        drop(self.guard.take());
        // Only the map still holds the lock: nobody holds or waits for it
        self.inner
            .locks
            .remove_if(&self.key, |_, lock| Arc::strong_count(lock) == 1);
    }
}

impl ExclusivityController {
    pub fn new(policy: SuspensionPolicy) -> Self {
        Self {
            inner: Arc::default(),
            policy,
        }
    }

    pub fn policy(&self) -> SuspensionPolicy {
        self.policy
    }

    /// Wait until `invocation` may run a handler of type `access` for `key`.
    ///
    /// A lease parked by the same invocation is handed back without queueing.
    pub async fn acquire(
        &self,
        service: &str,
        key: &str,
        access: HandlerType,
        invocation: &InvocationId,
    ) -> Lease {
        if let Some((_, lease)) = self.inner.parked.remove(invocation) {
            debug!(%invocation, service, key, "Reclaimed parked lease");
            return lease;
        }

        let object_key = (service.to_string(), key.to_string());
        let lock = Arc::clone(self.inner.locks.entry(object_key.clone()).or_default().value());
        let guard = match access {
            HandlerType::Exclusive => LeaseGuard::Exclusive(lock.write_owned().await),
            HandlerType::Shared => LeaseGuard::Shared(lock.read_owned().await),
        };
        Lease {
            key: object_key,
            guard: Some(guard),
            inner: Arc::clone(&self.inner),
        }
    }

    /// Apply the suspension policy to the lease of a suspended invocation.
    pub fn suspend(&self, lease: Lease, invocation: InvocationId) {
        match self.policy {
            SuspensionPolicy::HoldLease if lease.is_exclusive() => {
                debug!(%invocation, "Parking lease of suspended invocation");
                self.inner.parked.insert(invocation, lease);
            }
            _ => drop(lease),
        }
    }

    /// Drop the parked lease of one invocation. Transports that learn an
    /// invocation was killed while suspended call this to free its key.
    pub fn release_parked(&self, invocation: &InvocationId) -> bool {
        self.inner.parked.remove(invocation).is_some()
    }

    /// Drop every parked lease. Returns how many were released.
    pub fn release_all_parked(&self) -> usize {
        let parked: Vec<InvocationId> = self
            .inner
            .parked
            .iter()
            .map(|entry| entry.key().clone())
            .collect();
        // Leases are dropped outside the map iteration
        let released = parked
            .iter()
            .filter(|invocation| self.release_parked(invocation))
            .count();
        if released > 0 {
            debug!(released, "Released parked leases");
        }
        released
    }

    /// Number of keys with a live lock.
    pub fn active_keys(&self) -> usize {
        self.inner.locks.len()
    }

    /// Admit `invocation` as the run of workflow `key`.
    pub fn begin_run(&self, workflow: &str, key: &str, invocation: &InvocationId) -> RunAdmission {
        match self
            .inner
            .runs
            .entry((workflow.to_string(), key.to_string()))
        {
            Entry::Vacant(vacant) => {
                vacant.insert(RunState::Running(invocation.clone()));
                RunAdmission::Admitted
            }
            Entry::Occupied(occupied) => match occupied.get() {
                RunState::Running(owner) if owner == invocation => RunAdmission::Admitted,
                RunState::Running(_) => RunAdmission::AlreadyRunning,
                RunState::Completed(outcome) => RunAdmission::Completed(outcome.clone()),
            },
        }
    }

    /// Record the terminal outcome of a workflow run.
    pub fn complete_run(&self, workflow: &str, key: &str, outcome: InvocationOutcome) {
        self.inner.runs.insert(
            (workflow.to_string(), key.to_string()),
            RunState::Completed(outcome),
        );
    }

    /// Give up the run slot held by `invocation` so another attempt may start.
    pub fn abandon_run(&self, workflow: &str, key: &str, invocation: &InvocationId) {
        self.inner.runs.remove_if(
            &(workflow.to_string(), key.to_string()),
            |_, state| matches!(state, RunState::Running(owner) if owner == invocation),
        );
    }
}
