// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Invocation driver.
//!
//! [`Endpoint::handle`] serves one invocation over one duplex byte stream.
//! The transport that produced the stream (HTTP/2, a socket, an in-memory
//! pipe) is the caller's business.
//!
//! Per invocation three tasks cooperate:
//!
//! ```text
//!  orchestrator ──frames──▶ reader ──▶ pump ──complete/fail──▶ CompletionTable
//!                                        │                          ▲
//!                                        │ join                     │ register
//!                                        ▼                          │
//!                                      handler ──context ops──▶ InvocationCore
//!                                                                   │
//!  orchestrator ◀──frames── writer ◀──────────── outbound queue ◀───┘
//! ```
//!
//! The pump decides how the invocation ends: the handler returns, the input
//! closes while the handler waits (suspension), the orchestrator breaks the
//! protocol, or the endpoint shuts down.

use std::sync::Arc;

use bytes::Bytes;
use keel_protocol::messages::{EntryResult, ErrorMessage, StartMessage};
use keel_protocol::{BufferPool, FrameError, FramedStream, MessageType, ProtocolMessage, RawEntry};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{Span, debug, info, instrument, warn};

use crate::completion::CompletionResult;
use crate::config::EndpointConfig;
use crate::error::{Result, SdkError, TerminalError};
use crate::exclusivity::{ExclusivityController, RunAdmission};
use crate::invocation::InvocationCore;
use crate::journal::Journal;
use crate::registry::ServiceRegistry;
use crate::types::{EntryIndex, InvocationId, InvocationOutcome, ServiceType};

/// Status code of the failure recorded when a workflow run is invoked while
/// another invocation is running it.
pub const WORKFLOW_ALREADY_RUNNING_CODE: u16 = 409;

/// Upper bound for preallocating the replay prefix.
const MAX_PREALLOCATED_ENTRIES: u32 = 1024;

type Inbound = std::result::Result<ProtocolMessage, FrameError>;

/// How an invocation attempt ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationEnd {
    /// Output recorded, `End` sent
    Completed(Bytes),
    /// Terminal failure recorded as the output, `End` sent
    Failed(TerminalError),
    /// `Suspension` sent; the orchestrator resumes the invocation once one
    /// of these entries completes
    Suspended(Vec<EntryIndex>),
    /// `Error` sent; the orchestrator retries the invocation
    Errored { code: u16, message: String },
    /// Torn down by endpoint shutdown, nothing reported
    Cancelled,
}

impl InvocationEnd {
    fn label(&self) -> &'static str {
        match self {
            InvocationEnd::Completed(_) => "completed",
            InvocationEnd::Failed(_) => "failed",
            InvocationEnd::Suspended(_) => "suspended",
            InvocationEnd::Errored { .. } => "errored",
            InvocationEnd::Cancelled => "cancelled",
        }
    }
}

struct EndpointInner {
    registry: ServiceRegistry,
    config: EndpointConfig,
    pool: BufferPool,
    exclusivity: ExclusivityController,
    shutdown: CancellationToken,
}

/// Serves invocations of the registered services.
///
/// Cheap to clone; clones share the buffer pool, the per-key locks and the
/// shutdown signal.
#[derive(Clone)]
pub struct Endpoint {
    inner: Arc<EndpointInner>,
}

impl Endpoint {
    pub fn new(registry: ServiceRegistry, config: EndpointConfig) -> Self {
        Self {
            inner: Arc::new(EndpointInner {
                pool: BufferPool::with_max_retained(
                    config.buffer_pool_capacity,
                    config.message_size_warning,
                ),
                exclusivity: ExclusivityController::new(config.suspension_policy),
                registry,
                config,
                shutdown: CancellationToken::new(),
            }),
        }
    }

    pub fn registry(&self) -> &ServiceRegistry {
        &self.inner.registry
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.inner.config
    }

    pub fn buffer_pool(&self) -> &BufferPool {
        &self.inner.pool
    }

    pub fn exclusivity(&self) -> &ExclusivityController {
        &self.inner.exclusivity
    }

    /// Tear down every invocation in progress. Suspended handler code
    /// observes [`SdkError::Cancelled`]; new invocations end immediately.
    /// Leases parked for suspended invocations are released.
    pub fn shutdown(&self) {
        info!("Endpoint shutting down");
        self.inner.shutdown.cancel();
        let released = self.inner.exclusivity.release_all_parked();
        if released > 0 {
            info!(released, "Released leases of suspended invocations");
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    /// Serve one invocation of `service`/`handler` over `stream`.
    ///
    /// Returns how the attempt ended. Fails without touching the stream
    /// when no such handler is registered.
    #[instrument(skip(self, stream), fields(invocation_id = tracing::field::Empty))]
    pub async fn handle<S>(&self, service: &str, handler: &str, stream: S) -> Result<InvocationEnd>
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let resolved = self.inner.registry.resolve(service, handler)?;
        let frame_config = self.inner.config.frame_config();
        let (read_half, write_half) = tokio::io::split(stream);
        let mut input = FramedStream::new(read_half, self.inner.pool.clone(), frame_config);

        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        let stop_writer = CancellationToken::new();
        let writer = tokio::spawn(write_loop(
            FramedStream::new(write_half, self.inner.pool.clone(), frame_config),
            outbound_rx,
            stop_writer.clone(),
        ));

        let preamble = tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => None,
            preamble = read_preamble(&mut input) => Some(preamble),
        };
        let (start, recorded) = match preamble {
            None => {
                stop_writer.cancel();
                close_writer(writer).await;
                return Ok(InvocationEnd::Cancelled);
            }
            Some(Err(err)) => {
                warn!(error = %err, "Invalid invocation preamble");
                let end = report(&outbound, &err);
                drop(outbound);
                close_writer(writer).await;
                return Ok(end);
            }
            Some(Ok(preamble)) => preamble,
        };

        let id = InvocationId::new(start.id.clone());
        Span::current().record("invocation_id", tracing::field::display(&id));
        debug!(
            known_entries = start.known_entries,
            debug_id = %start.debug_id,
            "Invocation started"
        );

        let key = resolved.service_type.is_keyed().then(|| start.key.clone());
        if matches!(&key, Some(key) if key.is_empty()) {
            let end = report(&outbound, &SdkError::MissingKey(service.to_string()));
            drop(outbound);
            close_writer(writer).await;
            return Ok(end);
        }

        let core = Arc::new(InvocationCore::new(
            id.clone(),
            key.clone(),
            Journal::new(recorded),
            &start.state_map,
            start.partial_state,
            outbound,
        ));

        let input_value = match core.take_input() {
            Ok(value) => value,
            Err(err) => {
                let end = abort(&core, err);
                close_writer(writer).await;
                return Ok(end);
            }
        };

        // Workflow runs execute at most once per key
        let workflow_key = key.as_deref().filter(|_| resolved.is_workflow_run());
        if let Some(workflow_key) = workflow_key {
            let end = match self.inner.exclusivity.begin_run(service, workflow_key, &id) {
                RunAdmission::Admitted => None,
                RunAdmission::AlreadyRunning => {
                    info!(workflow = service, key = workflow_key, "Workflow run already in progress");
                    Some(record_outcome(
                        &core,
                        Err(TerminalError::with_code(
                            WORKFLOW_ALREADY_RUNNING_CODE,
                            format!("workflow {service}/{workflow_key} is already running"),
                        )),
                    ))
                }
                RunAdmission::Completed(outcome) => {
                    info!(workflow = service, key = workflow_key, "Workflow run already completed");
                    Some(record_outcome(
                        &core,
                        match outcome {
                            InvocationOutcome::Success(value) => Ok(value),
                            InvocationOutcome::Failure(err) => Err(err),
                        },
                    ))
                }
            };
            if let Some(end) = end {
                close_writer(writer).await;
                return Ok(end);
            }
        }

        // Virtual objects are admitted per key; workflow shared handlers
        // must be able to signal a running workflow and take no lease
        let lease = match key.as_deref() {
            Some(object_key) if resolved.service_type == ServiceType::VirtualObject => {
                let acquired = tokio::select! {
                    biased;
                    _ = self.inner.shutdown.cancelled() => None,
                    lease = self.inner.exclusivity.acquire(
                        service,
                        object_key,
                        resolved.handler_type,
                        &id,
                    ) => Some(lease),
                };
                match acquired {
                    Some(lease) => Some(lease),
                    None => {
                        core.cancel();
                        stop_writer.cancel();
                        close_writer(writer).await;
                        return Ok(InvocationEnd::Cancelled);
                    }
                }
            }
            _ => None,
        };

        let (inbound_tx, mut inbound) = mpsc::unbounded_channel();
        let reader = tokio::spawn(read_loop(input, inbound_tx));
        let mut handler_task = tokio::spawn(resolved.invoke(Arc::clone(&core), input_value));

        let end = self
            .drive(&core, &mut handler_task, &mut inbound, &stop_writer)
            .await;

        reader.abort();
        close_writer(writer).await;

        if let Some(lease) = lease {
            match &end {
                // Nothing resumes on an endpoint that shut down
                InvocationEnd::Suspended(_) if !self.is_shut_down() => {
                    self.inner.exclusivity.suspend(lease, id.clone())
                }
                _ => drop(lease),
            }
        }
        if let Some(workflow_key) = workflow_key {
            match &end {
                InvocationEnd::Completed(value) => self.inner.exclusivity.complete_run(
                    service,
                    workflow_key,
                    InvocationOutcome::Success(value.clone()),
                ),
                InvocationEnd::Failed(err) => self.inner.exclusivity.complete_run(
                    service,
                    workflow_key,
                    InvocationOutcome::Failure(err.clone()),
                ),
                InvocationEnd::Suspended(_) => {}
                InvocationEnd::Errored { .. } | InvocationEnd::Cancelled => {
                    self.inner.exclusivity.abandon_run(service, workflow_key, &id)
                }
            }
        }

        info!(outcome = end.label(), "Invocation finished");
        Ok(end)
    }

    /// Route incoming messages until the handler task has finished.
    async fn drive(
        &self,
        core: &InvocationCore,
        handler_task: &mut JoinHandle<Result<Bytes>>,
        inbound: &mut mpsc::UnboundedReceiver<Inbound>,
        stop_writer: &CancellationToken,
    ) -> InvocationEnd {
        let mut input_open = true;
        let mut interrupted: Option<InvocationEnd> = None;

        loop {
            tokio::select! {
                biased;

                _ = self.inner.shutdown.cancelled(), if interrupted.is_none() => {
                    let cancelled = core.cancel();
                    debug!(cancelled, "Invocation torn down");
                    stop_writer.cancel();
                    interrupted = Some(InvocationEnd::Cancelled);
                }

                joined = &mut *handler_task => {
                    return match interrupted {
                        Some(end) => end,
                        None => conclude(core, joined),
                    };
                }

                message = inbound.recv(), if input_open => match message {
                    Some(Ok(message)) => {
                        if let Err(err) = route(core, message) {
                            warn!(error = %err, "Protocol violation");
                            input_open = false;
                            if interrupted.is_none() {
                                interrupted = Some(abort(core, err));
                            }
                        }
                    }
                    Some(Err(FrameError::ConnectionClosed)) | None => {
                        debug!("Input stream closed");
                        input_open = false;
                        if let Some(entries) = core.try_suspend() {
                            info!(?entries, "Invocation suspended");
                            interrupted = Some(InvocationEnd::Suspended(entries));
                        }
                    }
                    Some(Err(err)) => {
                        warn!(error = %err, "Failed to read from orchestrator");
                        input_open = false;
                        if interrupted.is_none() {
                            interrupted = Some(abort(core, SdkError::Protocol(err)));
                        }
                    }
                },

                _ = core.progress(), if !input_open && interrupted.is_none() => {
                    if let Some(entries) = core.try_suspend() {
                        info!(?entries, "Invocation suspended");
                        interrupted = Some(InvocationEnd::Suspended(entries));
                    }
                }
            }
        }
    }
}

/// Read `Start` and the replay prefix that follows it.
async fn read_preamble<R>(input: &mut FramedStream<R>) -> Result<(StartMessage, Vec<RawEntry>)>
where
    R: AsyncRead + Unpin,
{
    let start = match input.read_message().await? {
        ProtocolMessage::Start(start) => start,
        other => {
            return Err(FrameError::UnexpectedMessage {
                expected: "Start",
                actual: other.message_type(),
            }
            .into());
        }
    };

    let mut recorded =
        Vec::with_capacity(start.known_entries.min(MAX_PREALLOCATED_ENTRIES) as usize);
    for _ in 0..start.known_entries {
        match input.read_message().await? {
            ProtocolMessage::Entry(entry) => recorded.push(entry),
            other => {
                return Err(FrameError::UnexpectedMessage {
                    expected: "journal entry",
                    actual: other.message_type(),
                }
                .into());
            }
        }
    }

    match recorded.first() {
        Some(entry) if entry.message_type() == MessageType::InputEntry => Ok((start, recorded)),
        _ => Err(SdkError::ProtocolViolation(
            "journal must start with an input entry".to_string(),
        )),
    }
}

/// Deliver a message received after the preamble.
fn route(core: &InvocationCore, message: ProtocolMessage) -> Result<()> {
    match message {
        ProtocolMessage::Completion(completion) => {
            let index = completion.entry_index;
            let delivered = match completion.result {
                Some(EntryResult::Failure(failure)) => {
                    let err = TerminalError::from(failure);
                    core.completions().fail(index, err.code, err.message)
                }
                result => core
                    .completions()
                    .complete(index, CompletionResult::from(result)),
            };
            if !delivered {
                debug!(entry_index = index, "Completion not delivered");
            }
            Ok(())
        }
        ProtocolMessage::EntryAck(ack) => {
            core.completions()
                .complete(ack.entry_index, CompletionResult::Empty);
            Ok(())
        }
        other => Err(SdkError::ProtocolViolation(format!(
            "unexpected {} message",
            other.message_type()
        ))),
    }
}

/// Turn the handler's result into the invocation's end.
fn conclude(
    core: &InvocationCore,
    joined: std::result::Result<Result<Bytes>, JoinError>,
) -> InvocationEnd {
    match joined {
        Ok(Ok(output)) => record_outcome(core, Ok(output)),
        Ok(Err(SdkError::Terminal(err))) => record_outcome(core, Err(err)),
        Ok(Err(err)) => abort(core, err),
        Err(err) => abort(core, SdkError::Internal(format!("handler panicked: {err}"))),
    }
}

fn record_outcome(
    core: &InvocationCore,
    outcome: std::result::Result<Bytes, TerminalError>,
) -> InvocationEnd {
    match core.write_output(outcome.clone()) {
        Ok(()) => match outcome {
            Ok(value) => InvocationEnd::Completed(value),
            Err(err) => InvocationEnd::Failed(err),
        },
        Err(err) => abort(core, err),
    }
}

fn abort(core: &InvocationCore, err: SdkError) -> InvocationEnd {
    let code = err.error_code();
    warn!(error = %err, code, "Invocation failed");
    core.abort(&err);
    InvocationEnd::Errored {
        code,
        message: err.to_string(),
    }
}

/// Report an error before the invocation core exists.
fn report(outbound: &mpsc::UnboundedSender<ProtocolMessage>, err: &SdkError) -> InvocationEnd {
    let code = err.error_code();
    let _ = outbound.send(ProtocolMessage::Error(ErrorMessage {
        code: u32::from(code),
        message: err.to_string(),
        description: String::new(),
    }));
    InvocationEnd::Errored {
        code,
        message: err.to_string(),
    }
}

async fn read_loop<R>(mut input: FramedStream<R>, inbound: mpsc::UnboundedSender<Inbound>)
where
    R: AsyncRead + Unpin,
{
    loop {
        let message = input.read_message().await;
        let failed = message.is_err();
        if inbound.send(message).is_err() || failed {
            break;
        }
    }
}

/// Write queued messages in order until a terminal one was written.
async fn write_loop<W>(
    mut output: FramedStream<W>,
    mut outbound: mpsc::UnboundedReceiver<ProtocolMessage>,
    stop: CancellationToken,
) -> std::result::Result<(), FrameError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        let message = tokio::select! {
            biased;
            message = outbound.recv() => match message {
                Some(message) => message,
                None => break,
            },
            _ = stop.cancelled() => break,
        };
        output.write_message(&message).await?;
        if message.is_terminal() {
            break;
        }
    }
    output.close().await
}

async fn close_writer(writer: JoinHandle<std::result::Result<(), FrameError>>) {
    match writer.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => warn!(error = %err, "Failed to write to orchestrator"),
        Err(err) => warn!(error = %err, "Writer task failed"),
    }
}
