// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! End-to-end tests for per-key admission of objects and workflows.

mod common;

use std::time::Duration;

use bytes::Bytes;
use common::*;
use keel_sdk::protocol::ProtocolMessage;
use keel_sdk::protocol::messages::{
    CompletePromiseEntryMessage, EntryResult, GetPromiseEntryMessage, OutputEntryMessage,
    PeekPromiseEntryMessage, PromiseCompletion, SetStateEntryMessage, SleepEntryMessage,
};
use keel_sdk::protocol::MessageFlags;
use keel_sdk::{
    Endpoint, EndpointConfig, InvocationEnd, ObjectContext, ServiceRegistry, SharedObjectContext,
    SharedWorkflowContext, StateKey, SuspensionPolicy, VirtualObject, WORKFLOW_ALREADY_RUNNING_CODE,
    Workflow, WorkflowContext,
};

const STATUS: StateKey<String> = StateKey::new("status");

fn empty() -> EntryResult {
    EntryResult::Empty(Default::default())
}

/// Object whose handlers each wait on one timer.
fn object_endpoint(policy: SuspensionPolicy) -> Endpoint {
    let registry = ServiceRegistry::new().with_service(
        VirtualObject::new("Account")
            .exclusive("update", |ctx: ObjectContext, _: ()| async move {
                ctx.sleep(Duration::from_millis(10)).await?;
                Ok("updated")
            })
            .shared("inspect", |ctx: SharedObjectContext, _: ()| async move {
                ctx.sleep(Duration::from_millis(10)).await?;
                Ok("inspected")
            }),
    );
    Endpoint::new(
        registry,
        EndpointConfig::default().with_suspension_policy(policy),
    )
}

async fn expect_output(orchestrator: &mut TestOrchestrator) -> Option<EntryResult> {
    let (_, output) = orchestrator.recv_entry::<OutputEntryMessage>().await;
    assert!(matches!(orchestrator.recv().await, ProtocolMessage::End(_)));
    output.result
}

async fn suspend(orchestrator: &mut TestOrchestrator) {
    orchestrator.close_input().await;
    assert!(matches!(
        orchestrator.recv().await,
        ProtocolMessage::Suspension(_)
    ));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exclusive_handlers_run_one_at_a_time() {
    let endpoint = object_endpoint(SuspensionPolicy::HoldLease);

    let mut first = InvocationBuilder::new("inv-a")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    first.recv_entry::<SleepEntryMessage>().await;

    let mut second = InvocationBuilder::new("inv-b")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    second.expect_silence().await;

    // A different key is not affected
    let mut other = InvocationBuilder::new("inv-c")
        .key("acct-2")
        .start(&endpoint, "Account", "update")
        .await;
    other.recv_entry::<SleepEntryMessage>().await;

    first.complete(1, empty()).await;
    assert_eq!(expect_output(&mut first).await, Some(value_result(&"updated")));
    first.finish().await;

    second.recv_entry::<SleepEntryMessage>().await;
    second.complete(1, empty()).await;
    expect_output(&mut second).await;
    assert_eq!(
        second.finish().await,
        InvocationEnd::Completed(json(&"updated"))
    );

    other.complete(1, empty()).await;
    expect_output(&mut other).await;
    other.finish().await;
    assert_eq!(endpoint.exclusivity().active_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shared_handlers_overlap_but_wait_for_exclusive() {
    let endpoint = object_endpoint(SuspensionPolicy::HoldLease);

    let mut reader_a = InvocationBuilder::new("inv-r1")
        .key("acct-1")
        .start(&endpoint, "Account", "inspect")
        .await;
    let mut reader_b = InvocationBuilder::new("inv-r2")
        .key("acct-1")
        .start(&endpoint, "Account", "inspect")
        .await;
    reader_a.recv_entry::<SleepEntryMessage>().await;
    reader_b.recv_entry::<SleepEntryMessage>().await;

    let mut writer = InvocationBuilder::new("inv-w")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    writer.expect_silence().await;

    reader_a.complete(1, empty()).await;
    expect_output(&mut reader_a).await;
    reader_a.finish().await;
    writer.expect_silence().await;

    reader_b.complete(1, empty()).await;
    expect_output(&mut reader_b).await;
    reader_b.finish().await;

    writer.recv_entry::<SleepEntryMessage>().await;
    writer.complete(1, empty()).await;
    expect_output(&mut writer).await;
    writer.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_suspended_holder_keeps_key_until_resumed() {
    let endpoint = object_endpoint(SuspensionPolicy::HoldLease);

    let mut holder = InvocationBuilder::new("inv-a")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    holder.recv_entry::<SleepEntryMessage>().await;
    suspend(&mut holder).await;
    assert_eq!(holder.finish().await, InvocationEnd::Suspended(vec![1]));

    let mut waiting = InvocationBuilder::new("inv-b")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    waiting.expect_silence().await;

    // The resumed attempt reclaims the parked lease without queueing
    let mut resumed = InvocationBuilder::new("inv-a")
        .key("acct-1")
        .recorded(
            MessageFlags::COMPLETED,
            &SleepEntryMessage {
                wake_up_time: 1,
                result: Some(empty()),
            },
        )
        .start(&endpoint, "Account", "update")
        .await;
    assert_eq!(expect_output(&mut resumed).await, Some(value_result(&"updated")));
    resumed.finish().await;

    waiting.recv_entry::<SleepEntryMessage>().await;
    waiting.complete(1, empty()).await;
    expect_output(&mut waiting).await;
    waiting.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_releases_parked_leases() {
    let endpoint = object_endpoint(SuspensionPolicy::HoldLease);

    let mut holder = InvocationBuilder::new("inv-a")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    holder.recv_entry::<SleepEntryMessage>().await;
    suspend(&mut holder).await;
    holder.finish().await;
    assert_eq!(endpoint.exclusivity().active_keys(), 1);

    endpoint.shutdown();
    assert_eq!(endpoint.exclusivity().active_keys(), 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_release_on_suspend_admits_next_invocation() {
    let endpoint = object_endpoint(SuspensionPolicy::ReleaseOnSuspend);

    let mut holder = InvocationBuilder::new("inv-a")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    holder.recv_entry::<SleepEntryMessage>().await;
    suspend(&mut holder).await;
    holder.finish().await;

    let mut next = InvocationBuilder::new("inv-b")
        .key("acct-1")
        .start(&endpoint, "Account", "update")
        .await;
    next.recv_entry::<SleepEntryMessage>().await;
    next.complete(1, empty()).await;
    expect_output(&mut next).await;
    next.finish().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_missing_key_is_reported() {
    let endpoint = object_endpoint(SuspensionPolicy::HoldLease);

    let mut orchestrator = InvocationBuilder::new("inv-a")
        .start(&endpoint, "Account", "update")
        .await;
    match orchestrator.recv().await {
        ProtocolMessage::Error(error) => assert!(error.message.contains("Account")),
        other => panic!("Expected error, got {:?}", other),
    }
    assert!(matches!(
        orchestrator.finish().await,
        InvocationEnd::Errored { code: 500, .. }
    ));
}

fn signup_endpoint() -> Endpoint {
    let registry = ServiceRegistry::new().with_service(
        Workflow::new("Signup")
            .run(|ctx: WorkflowContext, email: String| async move {
                let code: String = ctx.promise("code").await?;
                ctx.set(&STATUS, &format!("verified {email}"))?;
                Ok(code)
            })
            .shared("verify", |ctx: SharedWorkflowContext, code: String| async move {
                let earlier: Option<String> = ctx.peek_promise("code").await?;
                ctx.resolve_promise("code", &code).await?;
                Ok(earlier.is_none())
            }),
    );
    Endpoint::new(registry, EndpointConfig::default())
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_workflow_signaled_through_promise() {
    let endpoint = signup_endpoint();

    let mut run = InvocationBuilder::new("wf-1")
        .key("alice")
        .input(&"alice@example.com")
        .start(&endpoint, "Signup", "run")
        .await;
    let (_, get) = run.recv_entry::<GetPromiseEntryMessage>().await;
    assert_eq!(get.key, "code");

    // The shared handler is not blocked by the running workflow
    let mut verify = InvocationBuilder::new("wf-s")
        .key("alice")
        .input(&"1234")
        .start(&endpoint, "Signup", "verify")
        .await;
    let (_, peek) = verify.recv_entry::<PeekPromiseEntryMessage>().await;
    assert_eq!(peek.key, "code");
    verify.complete(1, empty()).await;

    let (_, resolve) = verify.recv_entry::<CompletePromiseEntryMessage>().await;
    assert_eq!(resolve.key, "code");
    assert_eq!(
        resolve.completion,
        Some(PromiseCompletion::Value(json(&"1234")))
    );
    verify.complete(2, empty()).await;
    assert_eq!(expect_output(&mut verify).await, Some(value_result(&true)));
    verify.finish().await;

    run.complete(1, value_result(&"1234")).await;
    let (_, set) = run.recv_entry::<SetStateEntryMessage>().await;
    assert_eq!(set.key, Bytes::from_static(b"status"));
    assert_eq!(from_json::<String>(&set.value), "verified alice@example.com");
    assert_eq!(expect_output(&mut run).await, Some(value_result(&"1234")));
    assert_eq!(run.finish().await, InvocationEnd::Completed(json(&"1234")));

    // A later run for the same key gets the recorded outcome
    let mut again = InvocationBuilder::new("wf-2")
        .key("alice")
        .input(&"alice@example.com")
        .start(&endpoint, "Signup", "run")
        .await;
    assert_eq!(expect_output(&mut again).await, Some(value_result(&"1234")));
    assert_eq!(again.finish().await, InvocationEnd::Completed(json(&"1234")));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_second_workflow_run_rejected_while_first_suspended() {
    let endpoint = signup_endpoint();

    let mut first = InvocationBuilder::new("wf-3")
        .key("bob")
        .input(&"bob@example.com")
        .start(&endpoint, "Signup", "run")
        .await;
    first.recv_entry::<GetPromiseEntryMessage>().await;
    suspend(&mut first).await;
    first.finish().await;

    let mut second = InvocationBuilder::new("wf-4")
        .key("bob")
        .input(&"bob@example.com")
        .start(&endpoint, "Signup", "run")
        .await;
    match expect_output(&mut second).await {
        Some(EntryResult::Failure(failure)) => {
            assert_eq!(failure.code, u32::from(WORKFLOW_ALREADY_RUNNING_CODE));
        }
        other => panic!("Expected failure output, got {:?}", other),
    }
    match second.finish().await {
        InvocationEnd::Failed(err) => assert_eq!(err.code, WORKFLOW_ALREADY_RUNNING_CODE),
        other => panic!("Expected Failed, got {:?}", other),
    }

    // The owner itself may resume
    let mut resumed = InvocationBuilder::new("wf-3")
        .key("bob")
        .input(&"bob@example.com")
        .recorded(
            MessageFlags::COMPLETED,
            &GetPromiseEntryMessage {
                key: "code".to_string(),
                result: Some(value_result(&"9999")),
            },
        )
        .start(&endpoint, "Signup", "run")
        .await;
    resumed.recv_entry::<SetStateEntryMessage>().await;
    assert_eq!(expect_output(&mut resumed).await, Some(value_result(&"9999")));
    resumed.finish().await;
}
