// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Handler contexts.
//!
//! One context type per target kind, each exposing only the operations that
//! kind permits:
//!
//! | context                 | state        | promises                  |
//! |-------------------------|--------------|---------------------------|
//! | [`Context`]             | -            | -                         |
//! | [`SharedObjectContext`] | read         | -                         |
//! | [`ObjectContext`]       | read + write | -                         |
//! | [`SharedWorkflowContext`] | read       | peek, resolve, reject     |
//! | [`WorkflowContext`]     | read + write | await, peek, resolve, reject |
//!
//! Every context can run side effects, sleep, call and send to other
//! handlers, and create and complete awakeables. Values cross the journal
//! as JSON.

use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use keel_protocol::messages::{EntryResult, Failure, PromiseCompletion};
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::completion::{CompletionResult, Waitable};
use crate::error::{BoxError, Result, TerminalError};
use crate::invocation::InvocationCore;
use crate::types::{InvocationId, InvocationTarget, RetryPolicy};

/// Typed handle to one persisted field of a keyed target.
///
/// ```
/// use keel_sdk::StateKey;
///
/// const COUNT: StateKey<u64> = StateKey::new("count");
/// assert_eq!(COUNT.name(), "count");
/// ```
pub struct StateKey<T> {
    name: &'static str,
    _marker: PhantomData<fn() -> T>,
}

impl<T> StateKey<T> {
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _marker: PhantomData,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }
}

impl<T> Clone for StateKey<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for StateKey<T> {}

impl<T> fmt::Debug for StateKey<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("StateKey").field(&self.name).finish()
    }
}

/// A durable callback completed by an external system through its id.
pub struct Awakeable<T> {
    id: String,
    core: Arc<InvocationCore>,
    waitable: Waitable,
    _marker: PhantomData<fn() -> T>,
}

impl<T: DeserializeOwned> Awakeable<T> {
    /// Id to hand to whoever completes the awakeable.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Suspend until the awakeable is resolved or rejected.
    pub async fn result(self) -> Result<T> {
        match self.core.wait(self.waitable).await? {
            CompletionResult::Empty => from_json(&Bytes::new()),
            CompletionResult::Value(value) => from_json(&value),
            CompletionResult::Failure(err) => Err(err.into()),
        }
    }
}

impl<T> fmt::Debug for Awakeable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Awakeable").field("id", &self.id).finish()
    }
}

/// Built by the endpoint for each invocation.
pub(crate) trait FromCore: Send + 'static {
    fn from_core(core: Arc<InvocationCore>) -> Self;
}

fn to_json<T: Serialize>(value: &T) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(value)?))
}

/// Empty payloads decode as JSON `null`.
fn from_json<T: DeserializeOwned>(bytes: &Bytes) -> Result<T> {
    if bytes.is_empty() {
        return Ok(serde_json::from_slice(b"null")?);
    }
    Ok(serde_json::from_slice(bytes)?)
}

macro_rules! context_type {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone)]
        pub struct $name {
            core: Arc<InvocationCore>,
        }

        impl FromCore for $name {
            fn from_core(core: Arc<InvocationCore>) -> Self {
                Self { core }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.debug_struct(stringify!($name))
                    .field("invocation_id", self.core.invocation_id())
                    .finish()
            }
        }

        impl $name {
            pub fn invocation_id(&self) -> &InvocationId {
                self.core.invocation_id()
            }

            /// Whether the next operation will be answered from the journal.
            pub fn is_replaying(&self) -> bool {
                self.core.is_replaying()
            }

            /// Run a side effect once, without retries.
            pub async fn run<T, F, Fut>(&self, name: &str, action: F) -> Result<T>
            where
                T: Serialize + DeserializeOwned,
                F: FnMut() -> Fut + Send,
                Fut: Future<Output = std::result::Result<T, BoxError>> + Send,
            {
                self.run_with_retry(name, RetryPolicy::default(), action).await
            }

            /// Run a side effect, retrying transient failures per `policy`.
            ///
            /// On replay the recorded result is returned and `action` is not
            /// called. Return a [`TerminalError`] from `action` to stop
            /// retrying.
            pub async fn run_with_retry<T, F, Fut>(
                &self,
                name: &str,
                policy: RetryPolicy,
                mut action: F,
            ) -> Result<T>
            where
                T: Serialize + DeserializeOwned,
                F: FnMut() -> Fut + Send,
                Fut: Future<Output = std::result::Result<T, BoxError>> + Send,
            {
                let encoded = self
                    .core
                    .run(name, &policy, || {
                        let attempt = action();
                        async move {
                            let value = attempt.await?;
                            serde_json::to_vec(&value).map(Bytes::from).map_err(|e| {
                                Box::new(TerminalError::new(format!(
                                    "failed to serialize side effect result: {e}"
                                ))) as BoxError
                            })
                        }
                    })
                    .await?;
                from_json(&encoded)
            }

            /// Durable timer.
            pub async fn sleep(&self, duration: Duration) -> Result<()> {
                self.core.sleep(duration).await
            }

            /// Call another handler and wait for its response.
            pub async fn call<I, O>(&self, target: InvocationTarget, input: &I) -> Result<O>
            where
                I: Serialize,
                O: DeserializeOwned,
            {
                let parameter = to_json(input)?;
                let response = self.core.call(&target, parameter).await?;
                from_json(&response)
            }

            /// Invoke another handler without waiting for it.
            pub fn send<I: Serialize>(&self, target: InvocationTarget, input: &I) -> Result<()> {
                self.core.send(&target, to_json(input)?, None)
            }

            /// Invoke another handler once `delay` has passed.
            pub fn send_with_delay<I: Serialize>(
                &self,
                target: InvocationTarget,
                input: &I,
                delay: Duration,
            ) -> Result<()> {
                self.core.send(&target, to_json(input)?, Some(delay))
            }

            pub fn awakeable<T: DeserializeOwned>(&self) -> Result<Awakeable<T>> {
                let (id, waitable) = self.core.awakeable()?;
                Ok(Awakeable {
                    id,
                    core: Arc::clone(&self.core),
                    waitable,
                    _marker: PhantomData,
                })
            }

            pub fn resolve_awakeable<T: Serialize>(&self, id: &str, value: &T) -> Result<()> {
                self.core
                    .complete_awakeable(id, EntryResult::Value(to_json(value)?))
            }

            pub fn reject_awakeable(&self, id: &str, failure: TerminalError) -> Result<()> {
                self.core
                    .complete_awakeable(id, EntryResult::Failure(Failure::from(failure)))
            }
        }
    };
}

macro_rules! state_read {
    ($name:ident) => {
        impl $name {
            /// Key of the object or workflow this invocation runs on.
            pub fn key(&self) -> &str {
                self.core.key().unwrap_or_default()
            }

            pub async fn get<T: DeserializeOwned>(&self, key: &StateKey<T>) -> Result<Option<T>> {
                match self.core.get_state(key.name()).await? {
                    Some(value) => Ok(Some(from_json(&value)?)),
                    None => Ok(None),
                }
            }

            /// Like [`get`](Self::get), falling back to `T::default()`.
            pub async fn get_or_default<T>(&self, key: &StateKey<T>) -> Result<T>
            where
                T: DeserializeOwned + Default,
            {
                Ok(self.get(key).await?.unwrap_or_default())
            }

            /// Names of all stored keys, sorted.
            pub async fn state_keys(&self) -> Result<Vec<String>> {
                self.core.state_keys().await
            }
        }
    };
}

macro_rules! state_write {
    ($name:ident) => {
        impl $name {
            pub fn set<T: Serialize>(&self, key: &StateKey<T>, value: &T) -> Result<()> {
                self.core.set_state(key.name(), to_json(value)?)
            }

            pub fn clear<T>(&self, key: &StateKey<T>) -> Result<()> {
                self.core.clear_state(key.name())
            }

            pub fn clear_all(&self) -> Result<()> {
                self.core.clear_all_state()
            }
        }
    };
}

macro_rules! promise_signal {
    ($name:ident) => {
        impl $name {
            /// Current value of a promise, `None` while it is unresolved.
            pub async fn peek_promise<T: DeserializeOwned>(&self, name: &str) -> Result<Option<T>> {
                match self.core.peek_promise(name).await? {
                    Some(value) => Ok(Some(from_json(&value)?)),
                    None => Ok(None),
                }
            }

            /// Resolve a promise. Ignored if it was already completed.
            pub async fn resolve_promise<T: Serialize>(&self, name: &str, value: &T) -> Result<()> {
                self.core
                    .complete_promise(name, PromiseCompletion::Value(to_json(value)?))
                    .await
            }

            /// Reject a promise. Ignored if it was already completed.
            pub async fn reject_promise(&self, name: &str, failure: TerminalError) -> Result<()> {
                self.core
                    .complete_promise(name, PromiseCompletion::Failure(Failure::from(failure)))
                    .await
            }
        }
    };
}

context_type!(
    /// Context of a plain service handler.
    Context
);
context_type!(
    /// Context of a shared virtual object handler.
    SharedObjectContext
);
context_type!(
    /// Context of an exclusive virtual object handler.
    ObjectContext
);
context_type!(
    /// Context of a shared workflow handler.
    SharedWorkflowContext
);
context_type!(
    /// Context of a workflow's `run` handler.
    WorkflowContext
);

state_read!(SharedObjectContext);
state_read!(ObjectContext);
state_read!(SharedWorkflowContext);
state_read!(WorkflowContext);

state_write!(ObjectContext);
state_write!(WorkflowContext);

promise_signal!(SharedWorkflowContext);
promise_signal!(WorkflowContext);

impl WorkflowContext {
    /// Suspend until the named promise is resolved. A rejection surfaces as
    /// [`SdkError::Terminal`](crate::SdkError::Terminal).
    pub async fn promise<T: DeserializeOwned>(&self, name: &str) -> Result<T> {
        let value = self.core.get_promise(name).await?;
        from_json(&value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SdkError;

    #[test]
    fn test_empty_payload_decodes_as_null() {
        let value: Option<u32> = from_json(&Bytes::new()).unwrap();
        assert_eq!(value, None);
        let value: serde_json::Value = from_json(&Bytes::new()).unwrap();
        assert!(value.is_null());
    }

    #[test]
    fn test_json_roundtrip_of_state_value() {
        let encoded = to_json(&vec!["a", "b"]).unwrap();
        assert_eq!(encoded, Bytes::from_static(br#"["a","b"]"#));
        let decoded: Vec<String> = from_json(&encoded).unwrap();
        assert_eq!(decoded, vec!["a", "b"]);
    }

    #[test]
    fn test_malformed_json_is_serialization_error() {
        let err = from_json::<u32>(&Bytes::from_static(b"{")).unwrap_err();
        assert!(matches!(err, SdkError::Serialization(_)));
    }

    #[test]
    fn test_state_key_is_copy() {
        const COUNT: StateKey<u64> = StateKey::new("count");
        let copy = COUNT;
        assert_eq!(copy.name(), COUNT.name());
        assert_eq!(format!("{:?}", COUNT), "StateKey(\"count\")");
    }
}
