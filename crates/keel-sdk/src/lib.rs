// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Keel SDK - durable invocations for ordinary async handlers.
//!
//! Handler code calls context operations (state, side effects, timers,
//! calls, promises). Every operation is recorded as an entry in a journal
//! kept by a remote orchestrator. When an invocation is retried or resumed,
//! the recorded prefix is replayed: operations return their recorded
//! results and side effects are not executed again.
//!
//! # Features
//!
//! - **Replay**: deterministic journal replay with type and identity checks
//! - **Side effects**: `run` with local retries, journaled once
//! - **State**: typed keys for virtual objects and workflows, eager state
//! - **Exclusivity**: one exclusive handler per object key, FIFO admission
//! - **Workflows**: one `run` per key, durable promises for signaling
//! - **Suspension**: invocations waiting on the orchestrator suspend when
//!   the input stream closes
//!
//! # Quick Start
//!
//! ```ignore
//! use keel_sdk::{Endpoint, EndpointConfig, ObjectContext, ServiceRegistry, StateKey, VirtualObject};
//!
//! const COUNT: StateKey<u64> = StateKey::new("count");
//!
//! #[tokio::main]
//! async fn main() -> keel_sdk::Result<()> {
//!     keel_sdk::telemetry::init_subscriber()?;
//!
//!     let registry = ServiceRegistry::new().with_service(
//!         VirtualObject::new("Counter").exclusive("add", |ctx: ObjectContext, delta: u64| async move {
//!             let count = ctx.get_or_default(&COUNT).await? + delta;
//!             ctx.set(&COUNT, &count)?;
//!             ctx.run("notify", || async move {
//!                 // talk to the outside world
//!                 Ok::<(), keel_sdk::BoxError>(())
//!             })
//!             .await?;
//!             Ok(count)
//!         }),
//!     );
//!     let endpoint = Endpoint::new(registry, EndpointConfig::from_env()?);
//!
//!     // For every invocation stream accepted by the transport:
//!     // endpoint.handle("Counter", "add", stream).await?;
//!     Ok(())
//! }
//! ```
//!
//! # Errors
//!
//! Return [`TerminalError`] (or `SdkError::Terminal`) from a handler to
//! record a definitive failure. Any other error is reported to the
//! orchestrator, which retries the invocation.

pub mod completion;
pub mod config;
pub mod context;
pub mod endpoint;
pub mod error;
pub mod exclusivity;
mod invocation;
pub mod journal;
pub mod registry;
pub mod telemetry;
pub mod types;

pub use completion::{CompletionResult, CompletionTable, Waitable};
pub use config::EndpointConfig;
pub use context::{
    Awakeable, Context, ObjectContext, SharedObjectContext, SharedWorkflowContext, StateKey,
    WorkflowContext,
};
pub use endpoint::{Endpoint, InvocationEnd, WORKFLOW_ALREADY_RUNNING_CODE};
pub use error::{BoxError, Result, SdkError, TerminalError};
pub use exclusivity::{ExclusivityController, Lease, RunAdmission, SuspensionPolicy};
pub use registry::{
    Service, ServiceDefinition, ServiceRegistry, VirtualObject, WORKFLOW_RUN_HANDLER, Workflow,
};
pub use types::{
    EntryIndex, HandlerType, InvocationId, InvocationOutcome, InvocationTarget, RetryPolicy,
    RetryStrategy, ServiceType,
};

// Re-export the wire layer for transports and test orchestrators
pub use keel_protocol as protocol;
