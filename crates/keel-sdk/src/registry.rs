// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Service registry.
//!
//! Services are declared with the [`Service`], [`VirtualObject`] and
//! [`Workflow`] builders and collected in a [`ServiceRegistry`], which the
//! endpoint uses to route an invocation to its handler and to decide how the
//! invocation is admitted.
//!
//! # Example
//!
//! ```ignore
//! use keel_sdk::{ObjectContext, ServiceRegistry, StateKey, VirtualObject};
//!
//! const COUNT: StateKey<u64> = StateKey::new("count");
//!
//! let registry = ServiceRegistry::new().with_service(
//!     VirtualObject::new("Counter").exclusive("add", |ctx: ObjectContext, delta: u64| async move {
//!         let count = ctx.get_or_default(&COUNT).await? + delta;
//!         ctx.set(&COUNT, &count)?;
//!         Ok(count)
//!     }),
//! );
//! ```

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::marker::PhantomData;
use std::sync::Arc;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use crate::context::{
    Context, FromCore, ObjectContext, SharedObjectContext, SharedWorkflowContext, WorkflowContext,
};
use crate::error::{Result, SdkError, TerminalError};
use crate::invocation::InvocationCore;
use crate::types::{HandlerType, ServiceType};

/// Name of the handler a workflow runs once per key.
pub const WORKFLOW_RUN_HANDLER: &str = "run";

/// Status code reported when an invocation's input cannot be decoded.
const BAD_INPUT_CODE: u16 = 400;

pub(crate) type HandlerFuture = BoxFuture<'static, Result<Bytes>>;

/// A handler with its context, input and output types erased.
trait ErasedHandler: Send + Sync {
    fn invoke(&self, core: Arc<InvocationCore>, input: Bytes) -> HandlerFuture;
}

struct TypedHandler<C, I, O, F> {
    handler: F,
    _marker: PhantomData<fn(C, I) -> O>,
}

impl<C, I, O, F> TypedHandler<C, I, O, F> {
    fn new(handler: F) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

impl<C, I, O, F, Fut> ErasedHandler for TypedHandler<C, I, O, F>
where
    C: FromCore,
    I: DeserializeOwned + Send + 'static,
    O: Serialize + Send + 'static,
    F: Fn(C, I) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<O>> + Send + 'static,
{
    fn invoke(&self, core: Arc<InvocationCore>, input: Bytes) -> HandlerFuture {
        let input = if input.is_empty() {
            serde_json::from_slice::<I>(b"null")
        } else {
            serde_json::from_slice::<I>(&input)
        };
        let input = match input {
            Ok(input) => input,
            Err(e) => {
                let err = TerminalError::with_code(BAD_INPUT_CODE, format!("invalid input: {e}"));
                return async move { Err(err.into()) }.boxed();
            }
        };

        let running = (self.handler)(C::from_core(core), input);
        async move {
            let output = running.await?;
            Ok(Bytes::from(serde_json::to_vec(&output)?))
        }
        .boxed()
    }
}

struct HandlerDefinition {
    handler_type: HandlerType,
    handler: Arc<dyn ErasedHandler>,
}

/// A named service and its handlers.
pub struct ServiceDefinition {
    name: String,
    service_type: ServiceType,
    handlers: HashMap<String, HandlerDefinition>,
}

impl ServiceDefinition {
    fn new(name: impl Into<String>, service_type: ServiceType) -> Self {
        Self {
            name: name.into(),
            service_type,
            handlers: HashMap::new(),
        }
    }

    fn add<C, I, O, F, Fut>(&mut self, name: impl Into<String>, handler_type: HandlerType, handler: F)
    where
        C: FromCore,
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(C, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let name = name.into();
        let definition = HandlerDefinition {
            handler_type,
            handler: Arc::new(TypedHandler::<C, I, O, F>::new(handler)),
        };
        if self.handlers.insert(name.clone(), definition).is_some() {
            warn!(service = %self.name, handler = %name, "Handler registered twice, keeping the last one");
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn service_type(&self) -> ServiceType {
        self.service_type
    }

    /// Handler names and their admission kind, sorted by name.
    pub fn handlers(&self) -> Vec<(&str, HandlerType)> {
        let mut handlers: Vec<_> = self
            .handlers
            .iter()
            .map(|(name, definition)| (name.as_str(), definition.handler_type))
            .collect();
        handlers.sort_by_key(|(name, _)| *name);
        handlers
    }
}

impl fmt::Debug for ServiceDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceDefinition")
            .field("name", &self.name)
            .field("service_type", &self.service_type)
            .field("handlers", &self.handlers())
            .finish()
    }
}

// ============================================================================
// Builders
// ============================================================================

/// Stateless service; its handlers run concurrently without restriction.
pub struct Service(ServiceDefinition);

impl Service {
    pub fn new(name: impl Into<String>) -> Self {
        Self(ServiceDefinition::new(name, ServiceType::Service))
    }

    pub fn handler<I, O, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(Context, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.0.add(name, HandlerType::Shared, handler);
        self
    }
}

/// Keyed object with durable state.
pub struct VirtualObject(ServiceDefinition);

impl VirtualObject {
    pub fn new(name: impl Into<String>) -> Self {
        Self(ServiceDefinition::new(name, ServiceType::VirtualObject))
    }

    /// Handler that runs alone on its key and may mutate state.
    pub fn exclusive<I, O, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(ObjectContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.0.add(name, HandlerType::Exclusive, handler);
        self
    }

    /// Read-only handler that may overlap with other shared handlers.
    pub fn shared<I, O, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(SharedObjectContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.0.add(name, HandlerType::Shared, handler);
        self
    }
}

/// Keyed workflow: one `run` per key plus shared handlers that interact
/// with it through promises.
pub struct Workflow(ServiceDefinition);

impl Workflow {
    pub fn new(name: impl Into<String>) -> Self {
        Self(ServiceDefinition::new(name, ServiceType::Workflow))
    }

    pub fn run<I, O, F, Fut>(mut self, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(WorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.0
            .add(WORKFLOW_RUN_HANDLER, HandlerType::Exclusive, handler);
        self
    }

    pub fn shared<I, O, F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(SharedWorkflowContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        self.0.add(name, HandlerType::Shared, handler);
        self
    }
}

impl From<Service> for ServiceDefinition {
    fn from(service: Service) -> Self {
        service.0
    }
}

impl From<VirtualObject> for ServiceDefinition {
    fn from(object: VirtualObject) -> Self {
        object.0
    }
}

impl From<Workflow> for ServiceDefinition {
    fn from(workflow: Workflow) -> Self {
        workflow.0
    }
}

// ============================================================================
// Registry
// ============================================================================

/// A handler resolved for one invocation.
#[derive(Clone)]
pub(crate) struct ResolvedHandler {
    pub service_type: ServiceType,
    pub handler_type: HandlerType,
    handler: Arc<dyn ErasedHandler>,
}

impl ResolvedHandler {
    pub fn invoke(&self, core: Arc<InvocationCore>, input: Bytes) -> HandlerFuture {
        self.handler.invoke(core, input)
    }

    /// Whether this is the run-once handler of a workflow.
    pub fn is_workflow_run(&self) -> bool {
        self.service_type == ServiceType::Workflow && self.handler_type == HandlerType::Exclusive
    }
}

/// All services served by an endpoint.
#[derive(Debug, Default)]
pub struct ServiceRegistry {
    services: HashMap<String, ServiceDefinition>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_service(mut self, service: impl Into<ServiceDefinition>) -> Self {
        self.register(service);
        self
    }

    pub fn register(&mut self, service: impl Into<ServiceDefinition>) {
        let service = service.into();
        if self.services.contains_key(&service.name) {
            warn!(service = %service.name, "Service registered twice, keeping the last one");
        }
        self.services.insert(service.name.clone(), service);
    }

    pub fn service(&self, name: &str) -> Option<&ServiceDefinition> {
        self.services.get(name)
    }

    /// Registered services, sorted by name.
    pub fn services(&self) -> Vec<&ServiceDefinition> {
        let mut services: Vec<_> = self.services.values().collect();
        services.sort_by(|a, b| a.name.cmp(&b.name));
        services
    }

    pub(crate) fn resolve(&self, service: &str, handler: &str) -> Result<ResolvedHandler> {
        let definition = self
            .services
            .get(service)
            .and_then(|s| s.handlers.get(handler).map(|h| (s.service_type, h)))
            .ok_or_else(|| SdkError::UnknownTarget {
                service: service.to_string(),
                handler: handler.to_string(),
            })?;
        let (service_type, handler) = definition;
        Ok(ResolvedHandler {
            service_type,
            handler_type: handler.handler_type,
            handler: Arc::clone(&handler.handler),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::journal::Journal;
    use crate::types::InvocationId;
    use keel_protocol::MessageFlags;
    use keel_protocol::RawEntry;
    use keel_protocol::messages::InputEntryMessage;
    use tokio::sync::mpsc;

    fn registry() -> ServiceRegistry {
        ServiceRegistry::new()
            .with_service(
                Service::new("Greeter")
                    .handler("greet", |_ctx: Context, name: String| async move {
                        Ok(format!("Hello, {name}!"))
                    }),
            )
            .with_service(
                VirtualObject::new("Counter")
                    .exclusive("add", |_ctx: ObjectContext, delta: u64| async move { Ok(delta) })
                    .shared("get", |_ctx: SharedObjectContext, _: ()| async move { Ok(0u64) }),
            )
            .with_service(
                Workflow::new("Signup")
                    .run(|_ctx: WorkflowContext, _: ()| async move { Ok(()) })
                    .shared("confirm", |_ctx: SharedWorkflowContext, _: ()| async move { Ok(()) }),
            )
    }

    fn core() -> Arc<InvocationCore> {
        let (tx, _rx) = mpsc::unbounded_channel();
        let input = RawEntry::new(
            MessageFlags::empty(),
            &InputEntryMessage {
                value: Bytes::new(),
            },
        );
        Arc::new(InvocationCore::new(
            InvocationId::new(Bytes::from_static(b"id")),
            None,
            Journal::new(vec![input]),
            &[],
            false,
            tx,
        ))
    }

    #[test]
    fn test_listing() {
        let registry = registry();
        let names: Vec<_> = registry.services().iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["Counter", "Greeter", "Signup"]);

        let counter = registry.service("Counter").unwrap();
        assert_eq!(counter.service_type(), ServiceType::VirtualObject);
        assert_eq!(
            counter.handlers(),
            vec![("add", HandlerType::Exclusive), ("get", HandlerType::Shared)]
        );
    }

    #[test]
    fn test_resolve() {
        let registry = registry();
        let run = registry.resolve("Signup", "run").unwrap();
        assert!(run.is_workflow_run());
        let confirm = registry.resolve("Signup", "confirm").unwrap();
        assert!(!confirm.is_workflow_run());
        assert_eq!(
            registry.resolve("Greeter", "greet").unwrap().service_type,
            ServiceType::Service
        );

        match registry.resolve("Greeter", "wave") {
            Err(SdkError::UnknownTarget { service, handler }) => {
                assert_eq!(service, "Greeter");
                assert_eq!(handler, "wave");
            }
            Err(other) => panic!("Expected UnknownTarget, got {:?}", other),
            Ok(_) => panic!("Expected UnknownTarget"),
        }
    }

    #[tokio::test]
    async fn test_invoke_encodes_output() {
        let handler = registry().resolve("Greeter", "greet").unwrap();
        let output = handler
            .invoke(core(), Bytes::from_static(br#""Ada""#))
            .await
            .unwrap();
        assert_eq!(output, Bytes::from_static(br#""Hello, Ada!""#));
    }

    #[tokio::test]
    async fn test_invalid_input_is_terminal() {
        let handler = registry().resolve("Counter", "add").unwrap();
        match handler.invoke(core(), Bytes::from_static(b"\"x\"")).await {
            Err(SdkError::Terminal(err)) => assert_eq!(err.code, 400),
            other => panic!("Expected terminal error, got {:?}", other),
        }

        // Empty input decodes as null
        let handler = registry().resolve("Signup", "run").unwrap();
        assert_eq!(
            handler.invoke(core(), Bytes::new()).await.unwrap(),
            Bytes::from_static(b"null")
        );
    }
}
