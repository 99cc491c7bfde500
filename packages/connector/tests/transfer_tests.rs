//! Consumer transfer process flows against recording collaborators.

mod common;

use std::collections::HashSet;
use std::sync::Arc;

use common::{TestHarness, PROVIDER};
use connector_core::domains::transfer::{
    TransferCommand, TransferManager, TransferProcess, TransferRequest, TransferState,
};
use connector_core::kernel::{MessageBody, ProvisionResponse};
use statemachine::{InMemoryStateEntityStore, StateEntityStore, StatefulEntity};
use test_context::test_context;

fn request() -> TransferRequest {
    TransferRequest::new(PROVIDER, "agr-1", "asset-1")
}

async fn state_of(ctx: &TestHarness, transfer: &TransferProcess) -> TransferState {
    ctx.kernel
        .transfers
        .find(transfer.id())
        .await
        .unwrap()
        .transfer_state()
        .unwrap()
}

async fn requested_transfer(ctx: &TestHarness) -> TransferProcess {
    let transfer = ctx.kernel.transfers.initiate(request()).await.unwrap();
    ctx.step().await;
    assert_eq!(state_of(ctx, &transfer).await, TransferState::Requested);
    transfer
}

// =============================================================================
// Happy Path
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn test_transfer_runs_to_completed(ctx: &TestHarness) {
    let transfers = &ctx.kernel.transfers;
    let transfer = requested_transfer(ctx).await;

    assert_eq!(ctx.provisioner.calls(), 1);
    let requests = ctx.dispatcher.sent_of_kind("transfer_request");
    assert_eq!(requests.len(), 1);
    assert_eq!(
        requests[0].body,
        MessageBody::TransferRequest {
            contract_id: "agr-1".into(),
            asset_id: "asset-1".into(),
            resource_id: Some(format!("res-{}", transfer.base.id)),
        }
    );

    transfers
        .enqueue(TransferCommand::Started {
            transfer_id: transfer.id().to_string(),
            data_address: "https://provider.example/public".into(),
        })
        .unwrap();
    ctx.step().await;

    let started = transfers.find(transfer.id()).await.unwrap();
    assert_eq!(started.transfer_state(), Some(TransferState::Started));
    assert_eq!(
        started.data_address.as_deref(),
        Some("https://provider.example/public")
    );

    transfers
        .enqueue(TransferCommand::Complete {
            transfer_id: transfer.id().to_string(),
        })
        .unwrap();
    ctx.step().await;

    assert_eq!(state_of(ctx, &transfer).await, TransferState::Completed);
    assert_eq!(ctx.dispatcher.sent_of_kind("transfer_completion").len(), 1);
    assert!(ctx.publisher.was_published_to("transfer.completed"));
}

// =============================================================================
// Provisioning
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn test_async_provisioning_waits_for_callback(ctx: &TestHarness) {
    ctx.provisioner.push_response(ProvisionResponse::InProgress);
    let transfer = ctx.kernel.transfers.initiate(request()).await.unwrap();

    ctx.step().await;
    let pending = ctx.kernel.transfers.find(transfer.id()).await.unwrap();
    assert_eq!(pending.transfer_state(), Some(TransferState::Provisioning));
    assert!(pending.is_pending());

    // pending transfers are skipped by every processor
    ctx.step().await;
    assert_eq!(ctx.provisioner.calls(), 1);
    assert!(ctx.dispatcher.sent().is_empty());

    ctx.kernel
        .transfers
        .enqueue(TransferCommand::ProvisionCompleted {
            transfer_id: transfer.id().to_string(),
            resource_id: "bucket-42".into(),
        })
        .unwrap();
    ctx.step().await;

    let requested = ctx.kernel.transfers.find(transfer.id()).await.unwrap();
    assert_eq!(requested.transfer_state(), Some(TransferState::Requested));
    assert!(!requested.is_pending());
    assert_eq!(requested.resource_id.as_deref(), Some("bucket-42"));
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_provisioning_failures_exhaust_retries(ctx: &TestHarness) {
    for _ in 0..ctx.config.send_retry_limit {
        ctx.provisioner.push_failure("quota exceeded");
    }
    let transfer = ctx.kernel.transfers.initiate(request()).await.unwrap();

    ctx.step().await;

    let terminated = ctx.kernel.transfers.find(transfer.id()).await.unwrap();
    assert_eq!(terminated.transfer_state(), Some(TransferState::Terminated));
    assert_eq!(ctx.provisioner.calls(), ctx.config.send_retry_limit as usize);
    assert!(terminated
        .base
        .error_detail
        .as_deref()
        .unwrap()
        .contains("quota exceeded"));
    assert!(ctx.dispatcher.sent().is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_pending_guard_holds_transfer_until_resumed(ctx: &TestHarness) {
    let store: Arc<dyn StateEntityStore<TransferProcess>> = Arc::new(
        InMemoryStateEntityStore::<TransferProcess>::new("connector-guarded", ctx.clock.clone()),
    );
    let transfers = TransferManager::with_pending_guard(
        &ctx.config,
        store,
        &ctx.deps(),
        |t: &TransferProcess| t.asset_id.starts_with("restricted-"),
    )
    .unwrap();

    let held = transfers
        .initiate(TransferRequest::new(PROVIDER, "agr-1", "restricted-asset"))
        .await
        .unwrap();
    let free = transfers.initiate(request()).await.unwrap();

    for _ in 0..5 {
        transfers.run_round().await;
    }

    let held_now = transfers.find(held.id()).await.unwrap();
    assert_eq!(held_now.transfer_state(), Some(TransferState::Initial));
    assert!(held_now.is_pending());
    let free_now = transfers.find(free.id()).await.unwrap();
    assert_eq!(free_now.transfer_state(), Some(TransferState::Requested));

    transfers
        .enqueue(TransferCommand::Resume {
            transfer_id: held.id().to_string(),
        })
        .unwrap();
    for _ in 0..5 {
        transfers.run_round().await;
    }

    let resumed = transfers.find(held.id()).await.unwrap();
    assert_eq!(resumed.transfer_state(), Some(TransferState::Requested));
    assert!(!resumed.is_pending());
}

// =============================================================================
// Operator Overrides
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn test_force_complete_skips_messaging(ctx: &TestHarness) {
    let transfer = requested_transfer(ctx).await;

    ctx.kernel
        .transfers
        .enqueue(TransferCommand::ForceComplete {
            transfer_id: transfer.id().to_string(),
        })
        .unwrap();
    ctx.step().await;

    assert_eq!(state_of(ctx, &transfer).await, TransferState::Completed);
    assert!(ctx.dispatcher.sent_of_kind("transfer_completion").is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_force_fail_releases_pending_transfer(ctx: &TestHarness) {
    ctx.provisioner.push_response(ProvisionResponse::InProgress);
    let transfer = ctx.kernel.transfers.initiate(request()).await.unwrap();
    ctx.step().await;

    ctx.kernel
        .transfers
        .enqueue(TransferCommand::ForceFail {
            transfer_id: transfer.id().to_string(),
            reason: "provisioner lost the request".into(),
        })
        .unwrap();
    ctx.step().await;

    let failed = ctx.kernel.transfers.find(transfer.id()).await.unwrap();
    assert_eq!(failed.transfer_state(), Some(TransferState::Terminated));
    assert!(!failed.is_pending());
    assert_eq!(
        failed.base.error_detail.as_deref(),
        Some("provisioner lost the request")
    );
    assert!(ctx.dispatcher.sent_of_kind("termination").is_empty());
}

#[test_context(TestHarness)]
#[tokio::test]
async fn test_terminate_started_transfer(ctx: &TestHarness) {
    let transfer = requested_transfer(ctx).await;
    ctx.kernel
        .transfers
        .enqueue(TransferCommand::Started {
            transfer_id: transfer.id().to_string(),
            data_address: "https://provider.example/public".into(),
        })
        .unwrap();
    ctx.kernel
        .transfers
        .enqueue(TransferCommand::Terminate {
            transfer_id: transfer.id().to_string(),
            reason: "consumer cancelled".into(),
        })
        .unwrap();
    ctx.step().await;

    assert_eq!(state_of(ctx, &transfer).await, TransferState::Terminated);
    let terminations = ctx.dispatcher.sent_of_kind("termination");
    assert_eq!(terminations.len(), 1);
    assert_eq!(terminations[0].process_id, transfer.base.id);
}

// =============================================================================
// Multiple Instances
// =============================================================================

#[test_context(TestHarness)]
#[tokio::test]
async fn test_instances_sharing_a_store_request_each_transfer_once(ctx: &TestHarness) {
    const TRANSFERS: usize = 12;

    let shared = InMemoryStateEntityStore::<TransferProcess>::new("connector-a", ctx.clock.clone());
    let config_b = TestHarness::test_config(&[
        ("CONNECTOR_RUNTIME_ID", "connector-b"),
        ("STATE_MACHINE_BATCH_SIZE", "3"),
    ])
    .unwrap();
    let config_a = TestHarness::test_config(&[("STATE_MACHINE_BATCH_SIZE", "3")]).unwrap();

    let a = TransferManager::new(&config_a, Arc::new(shared.with_holder("connector-a")), &ctx.deps())
        .unwrap();
    let b = TransferManager::new(&config_b, Arc::new(shared.with_holder("connector-b")), &ctx.deps())
        .unwrap();

    let mut ids = HashSet::new();
    for _ in 0..TRANSFERS {
        ids.insert(a.initiate(request()).await.unwrap().base.id);
    }

    for _ in 0..20 {
        let (ra, rb) = tokio::join!(a.run_round(), b.run_round());
        if !ra.is_productive() && !rb.is_productive() {
            break;
        }
    }

    let requests = ctx.dispatcher.sent_of_kind("transfer_request");
    assert_eq!(requests.len(), TRANSFERS);
    let requested: HashSet<String> = requests.into_iter().map(|m| m.process_id).collect();
    assert_eq!(requested, ids);
    assert_eq!(ctx.provisioner.calls(), TRANSFERS);
}
